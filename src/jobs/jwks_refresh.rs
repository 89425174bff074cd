use tokio::time::{interval, Duration, MissedTickBehavior};

use crate::services::jwks::SigningKeyCache;

/// Keep the signing key set warm: refresh at startup, then every `every`.
///
/// A failed refresh keeps the previous key set; it is retried on the next
/// tick or on demand by the first request that needs it.
pub fn start_jwks_refresh_job(keys: SigningKeyCache, every: Duration) {
    tokio::spawn(async move {
        let mut interval = interval(every);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            // First tick completes immediately, so this also runs on startup
            interval.tick().await;

            match keys.refresh().await {
                Ok(count) => tracing::info!("Signing keys refreshed ({} keys)", count),
                Err(e) => tracing::error!("Failed to refresh signing keys: {}", e),
            }
        }
    });
}
