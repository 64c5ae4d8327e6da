//! Admission gate: a smooth limit on how fast attempts may start.
//!
//! Backed by a GCRA limiter whose bucket holds one second of permits. A fresh gate starts
//! empty, so permits come out `1 / rate` apart. Idle time refills the bucket, which lets callers
//! that went quiet catch up to the target rate instead of losing the permits they skipped.

use std::{fmt, num::NonZeroU32, time::Duration};

use governor::{DefaultDirectRateLimiter, Quota, RateLimiter};

use super::SettingsError;

/// Blocks callers so that no more than `rate` attempts per second are started.
pub struct AdmissionGate {
    limiter: DefaultDirectRateLimiter,
    rate: f64,
}

impl AdmissionGate {
    /// Creates a gate admitting `rate` permits per second. Fractional rates are allowed.
    pub fn new(rate: f64) -> Result<Self, SettingsError> {
        let invalid = || SettingsError::InvalidTargetTps { value: rate };
        if !rate.is_finite() || rate <= 0.0 {
            return Err(invalid());
        }
        let period = Duration::try_from_secs_f64(rate.recip()).map_err(|_| invalid())?;
        let burst = NonZeroU32::new(rate.ceil() as u32).unwrap_or(NonZeroU32::MIN);
        let quota = Quota::with_period(period)
            .ok_or_else(invalid)?
            .allow_burst(burst);

        let limiter = RateLimiter::direct(quota);
        // Spend all but one stored permit: the first caller goes through, the rest are spaced.
        if let Some(stored) = NonZeroU32::new(burst.get() - 1) {
            let _ = limiter.check_n(stored);
        }

        Ok(Self { limiter, rate })
    }

    /// Waits until a permit is available and consumes it.
    pub async fn acquire(&self) {
        self.limiter.until_ready().await;
    }

    /// Consumes a permit if one is available right now.
    pub fn try_acquire(&self) -> bool {
        self.limiter.check().is_ok()
    }
}

impl fmt::Debug for AdmissionGate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AdmissionGate")
            .field("rate", &self.rate)
            .finish_non_exhaustive()
    }
}
