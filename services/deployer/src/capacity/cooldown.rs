//! Persisted scale cooldown.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use maestro_id::{ClusterName, Version};
use maestro_reconcile::Clock;
use tracing::{debug, warn};

use crate::backend::{BackendResult, Lookup, ParameterStore};

/// How far in the past an unreadable record is assumed to be.
const EXPIRED_OFFSET_MINUTES: i64 = 2;

/// Parameter path of the cooldown record of one fleet version.
pub fn cooldown_key(cluster: &ClusterName, version: &Version) -> String {
    format!("/maestro/{cluster}/{version}/scaletime")
}

/// "Do not scale before" timestamps, one per `(cluster, version)`.
pub struct CooldownStore {
    parameters: Arc<dyn ParameterStore>,
    clock: Arc<dyn Clock>,
}

impl CooldownStore {
    pub fn new(parameters: Arc<dyn ParameterStore>, clock: Arc<dyn Clock>) -> Self {
        Self { parameters, clock }
    }

    /// The recorded timestamp. Missing, unparseable and unreadable records
    /// all read as two minutes ago so a broken record never blocks scaling.
    pub async fn read(&self, cluster: &ClusterName, version: &Version) -> DateTime<Utc> {
        let key = cooldown_key(cluster, version);
        let expired = self.clock.now() - chrono::Duration::minutes(EXPIRED_OFFSET_MINUTES);

        match self.parameters.get_parameter(&key).await {
            Ok(Lookup::Found(raw)) => match DateTime::parse_from_rfc3339(raw.trim()) {
                Ok(at) => at.with_timezone(&Utc),
                Err(e) => {
                    warn!(%key, %raw, error = %e, "unparseable cooldown record, treating as expired");
                    expired
                }
            },
            Ok(Lookup::Absent) => {
                debug!(%key, "no cooldown record");
                expired
            }
            Err(e) => {
                warn!(%key, error = %e, "failed to read cooldown record, treating as expired");
                expired
            }
        }
    }

    /// Returns true while the recorded timestamp is in the future.
    pub async fn is_active(&self, cluster: &ClusterName, version: &Version) -> bool {
        self.read(cluster, version).await > self.clock.now()
    }

    /// Record `now + cooldown`.
    pub async fn arm(
        &self,
        cluster: &ClusterName,
        version: &Version,
        cooldown: Duration,
    ) -> BackendResult<DateTime<Utc>> {
        let key = cooldown_key(cluster, version);
        let span = chrono::Duration::from_std(cooldown).unwrap_or(chrono::Duration::MAX);
        let until = self
            .clock
            .now()
            .checked_add_signed(span)
            .unwrap_or(DateTime::<Utc>::MAX_UTC);

        self.parameters.put_parameter(&key, &until.to_rfc3339()).await?;
        debug!(%key, %until, "cooldown armed");
        Ok(until)
    }
}

#[cfg(test)]
mod tests {
    use maestro_reconcile::ManualClock;

    use super::*;
    use crate::backend::{BackendError, MemoryBackend, Operation};

    fn ids() -> (ClusterName, Version) {
        ("kloudcover".parse().unwrap(), "v1".parse().unwrap())
    }

    fn setup() -> (Arc<MemoryBackend>, Arc<ManualClock>, CooldownStore) {
        let backend = Arc::new(MemoryBackend::new());
        let clock = Arc::new(ManualClock::starting_now());
        let store = CooldownStore::new(backend.clone(), clock.clone());
        (backend, clock, store)
    }

    #[test]
    fn test_cooldown_key() {
        let (cluster, version) = ids();
        assert_eq!(cooldown_key(&cluster, &version), "/maestro/kloudcover/v1/scaletime");
    }

    #[tokio::test]
    async fn test_missing_record_reads_as_expired() {
        let (_backend, clock, store) = setup();
        let (cluster, version) = ids();

        let at = store.read(&cluster, &version).await;
        assert_eq!(at, clock.now() - chrono::Duration::minutes(2));
        assert!(!store.is_active(&cluster, &version).await);
    }

    #[tokio::test]
    async fn test_garbage_record_reads_as_expired() {
        let (backend, _clock, store) = setup();
        let (cluster, version) = ids();
        backend
            .put_parameter(&cooldown_key(&cluster, &version), "yesterday-ish")
            .await
            .unwrap();

        assert!(!store.is_active(&cluster, &version).await);
    }

    #[tokio::test]
    async fn test_read_error_reads_as_expired() {
        let (backend, _clock, store) = setup();
        let (cluster, version) = ids();
        store
            .arm(&cluster, &version, Duration::from_secs(300))
            .await
            .unwrap();
        backend
            .fail_next(Operation::GetParameter, BackendError::transient("Throttling"))
            .await;

        assert!(!store.is_active(&cluster, &version).await);
        assert!(store.is_active(&cluster, &version).await);
    }

    #[tokio::test]
    async fn test_armed_cooldown_expires() {
        let (_backend, clock, store) = setup();
        let (cluster, version) = ids();

        store
            .arm(&cluster, &version, Duration::from_secs(300))
            .await
            .unwrap();
        assert!(store.is_active(&cluster, &version).await);

        clock.advance(Duration::from_secs(299));
        assert!(store.is_active(&cluster, &version).await);

        clock.advance(Duration::from_secs(1));
        assert!(!store.is_active(&cluster, &version).await);
    }
}
