//! Per-application event quotas.

use crate::error::GatewayError;
use governor::clock::{Clock, DefaultClock};
use governor::{DefaultDirectRateLimiter, Quota, RateLimiter};
use std::collections::HashMap;
use std::num::NonZeroU32;

/// One token bucket per application.
pub struct QuotaGuard {
    limiters: HashMap<String, DefaultDirectRateLimiter>,
    clock: DefaultClock,
}

impl QuotaGuard {
    /// Build buckets from `(app_id, events_per_minute)` pairs.
    ///
    /// A limit of zero means the application is not rate limited.
    pub fn new<'a>(limits: impl IntoIterator<Item = (&'a str, u32)>) -> Self {
        let limiters = limits
            .into_iter()
            .filter_map(|(app_id, per_minute)| {
                NonZeroU32::new(per_minute).map(|n| {
                    (
                        app_id.to_string(),
                        RateLimiter::direct(Quota::per_minute(n)),
                    )
                })
            })
            .collect();

        Self {
            limiters,
            clock: DefaultClock::default(),
        }
    }

    /// Take one token for `app_id`.
    pub fn check(&self, app_id: &str) -> Result<(), GatewayError> {
        let Some(limiter) = self.limiters.get(app_id) else {
            return Ok(());
        };

        limiter.check().map_err(|not_until| GatewayError::QuotaExceeded {
            retry_after: not_until.wait_time_from(self.clock.now()),
        })
    }
}
