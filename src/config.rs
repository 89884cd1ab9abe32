use std::time::Duration;

use serde::Deserialize;

/// Tunables of the janitor.
///
/// The defaults are production values; tests shrink the intervals they
/// care about. Anything a test or an operator ever needed to adjust is a
/// field here rather than a compile-time constant.
#[derive(Clone, Debug, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct JanitorConfig {
    /// How long a worker sleeps after its discover step found nothing.
    pub idle_backoff: Duration,
    /// Number of concurrent workers per job loop.
    pub workers_per_job: usize,

    /// Uploads untouched for this long are abandoned and reaped.
    pub upload_idle_cutoff: Duration,

    /// Grace period between marking and sweeping a blob mount.
    pub mount_sweep_grace: Duration,
    /// Grace period between marking and sweeping an unmounted blob.
    pub blob_sweep_grace: Duration,
    /// Grace period before an unknown storage object may be deleted. Much
    /// longer than the other two: there is no DB row protecting the
    /// object, only this timer.
    pub storage_sweep_grace: Duration,

    pub blob_mount_sweep_interval: Duration,
    pub blob_sweep_interval: Duration,
    pub storage_sweep_interval: Duration,
    pub gc_interval: Duration,
    pub manifest_sync_interval: Duration,
    pub federation_announcement_interval: Duration,
    pub account_enforcement_interval: Duration,

    pub blob_validation_interval: Duration,
    pub manifest_validation_interval: Duration,
    /// Retry interval after a failed validation.
    pub validation_retry_interval: Duration,

    pub vuln_check_interval: Duration,
    /// Recheck interval for manifests the scanner cannot handle.
    pub vuln_check_unsupported_interval: Duration,
    /// Retry interval after a scanner error.
    pub vuln_check_error_retry_interval: Duration,
    /// Blobs larger than this are not submitted for scanning; the
    /// manifest is reported as `Unsupported` instead.
    pub max_uncompressed_layer_bytes: u64,

    /// How often each peer's replication password is rotated. Two
    /// rotation periods bound the lifetime of any single password.
    pub peer_rotation_interval: Duration,

    /// How long a replica of an external registry trusts its last
    /// upstream check before asking again.
    pub inbound_cache_lifetime: Duration,

    /// Manifests pushed more recently than this are exempt from GC; the
    /// pusher may still be about to tag them.
    pub recent_upload_protection: Duration,

    /// Delay before a failed account deletion is attempted again.
    pub deletion_retry_interval: Duration,
    /// Delay before the deleter checks whether the blob sweeper has
    /// finished clearing a deleting account.
    pub deletion_blob_wait: Duration,
}

impl Default for JanitorConfig {
    fn default() -> Self {
        Self {
            idle_backoff: Duration::from_secs(5),
            workers_per_job: 1,

            upload_idle_cutoff: Duration::from_secs(24 * 3600),

            mount_sweep_grace: Duration::from_secs(30 * 60),
            blob_sweep_grace: Duration::from_secs(30 * 60),
            storage_sweep_grace: Duration::from_secs(4 * 3600),

            blob_mount_sweep_interval: Duration::from_secs(3600),
            blob_sweep_interval: Duration::from_secs(3600),
            storage_sweep_interval: Duration::from_secs(6 * 3600),
            gc_interval: Duration::from_secs(3600),
            manifest_sync_interval: Duration::from_secs(3600),
            federation_announcement_interval: Duration::from_secs(3600),
            account_enforcement_interval: Duration::from_secs(3600),

            blob_validation_interval: Duration::from_secs(7 * 24 * 3600),
            manifest_validation_interval: Duration::from_secs(24 * 3600),
            validation_retry_interval: Duration::from_secs(10 * 60),

            vuln_check_interval: Duration::from_secs(3600),
            vuln_check_unsupported_interval: Duration::from_secs(24 * 3600),
            vuln_check_error_retry_interval: Duration::from_secs(5 * 60),
            max_uncompressed_layer_bytes: 10 << 30,

            peer_rotation_interval: Duration::from_secs(10 * 60),

            inbound_cache_lifetime: Duration::from_secs(6 * 3600),

            recent_upload_protection: Duration::from_secs(5 * 60),

            deletion_retry_interval: Duration::from_secs(10 * 60),
            deletion_blob_wait: Duration::from_secs(60),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn config_overrides_merge_with_defaults() {
        let config: JanitorConfig = serde_json::from_str(
            r#"{"workers_per_job": 4, "idle_backoff": {"secs": 1, "nanos": 0}}"#,
        )
        .unwrap();
        assert_eq!(config.workers_per_job, 4);
        assert_eq!(config.idle_backoff, Duration::from_secs(1));
        // untouched fields keep their defaults
        assert_eq!(config.storage_sweep_grace, Duration::from_secs(4 * 3600));
    }
}
