//! Short-term memory of accepted event ids.

use std::collections::HashMap;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::Instant;

/// Result of [`IdempotencyLedger::reserve`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reservation {
    /// The id was free and now belongs to the caller.
    Reserved,
    /// The id is already claimed by the named app.
    Held(String),
}

struct Claim {
    app_id: String,
    at: Instant,
}

/// Remembers which app accepted which event id within the retention window.
pub struct IdempotencyLedger {
    seen: Mutex<HashMap<String, Claim>>,
    retention: Duration,
}

impl IdempotencyLedger {
    pub fn new(retention: Duration) -> Self {
        Self {
            seen: Mutex::new(HashMap::new()),
            retention,
        }
    }

    /// App that holds `event_id`, if the claim is still live.
    pub async fn owner(&self, event_id: &str) -> Option<String> {
        let seen = self.seen.lock().await;
        seen.get(event_id)
            .filter(|claim| claim.at.elapsed() < self.retention)
            .map(|claim| claim.app_id.clone())
    }

    /// Claim `event_id` for `app_id`.
    pub async fn reserve(&self, event_id: &str, app_id: &str) -> Reservation {
        let mut seen = self.seen.lock().await;
        if let Some(claim) = seen.get(event_id) {
            if claim.at.elapsed() < self.retention {
                return Reservation::Held(claim.app_id.clone());
            }
        }
        seen.insert(
            event_id.to_string(),
            Claim {
                app_id: app_id.to_string(),
                at: Instant::now(),
            },
        );
        Reservation::Reserved
    }

    /// Forget a claim so a retry of the same event is accepted.
    pub async fn release(&self, event_id: &str) {
        self.seen.lock().await.remove(event_id);
    }

    /// Drop expired claims. Returns how many were removed.
    pub async fn purge_expired(&self) -> usize {
        let mut seen = self.seen.lock().await;
        let before = seen.len();
        let retention = self.retention;
        seen.retain(|_, claim| claim.at.elapsed() < retention);
        before - seen.len()
    }
}
