use std::time::Duration;

use murmur_net::MonitorConfig;

/// Tunables for one [`Messenger`](crate::Messenger) instance.
#[derive(Debug, Clone)]
pub struct MessengerConfig {
    /// Route one-to-one messages through the reliable sync layer.
    pub datasync_enabled: bool,
    /// Send to the recipient's partitioned topic instead of the discovery
    /// topic when no shared secret exists (pre-discovery peers).
    pub send_v1_partitioned: bool,
    /// Delivery tracker attempts per envelope, including the first.
    pub max_attempts: u32,
    pub retry_interval: Duration,
    pub retry_backoff_base: Duration,
    pub retry_backoff_max: Duration,
    /// How often the sync layer looks for due messages.
    pub datasync_interval: Duration,
    pub dispatch_queue_capacity: usize,
    /// Minimum gap between two key bundle advertisements to one peer.
    pub bundle_advertise_interval: Duration,
    pub installation_id: String,
    pub device_name: String,
}

impl Default for MessengerConfig {
    fn default() -> Self {
        Self {
            datasync_enabled: false,
            send_v1_partitioned: false,
            max_attempts: 3,
            retry_interval: Duration::from_millis(500),
            retry_backoff_base: Duration::from_secs(1),
            retry_backoff_max: Duration::from_secs(30),
            datasync_interval: Duration::from_millis(300),
            dispatch_queue_capacity: 256,
            bundle_advertise_interval: Duration::from_secs(6 * 60 * 60),
            installation_id: uuid::Uuid::new_v4().to_string(),
            device_name: "murmur".to_string(),
        }
    }
}

impl MessengerConfig {
    pub fn monitor_config(&self) -> MonitorConfig {
        MonitorConfig {
            max_attempts: self.max_attempts,
            retry_interval: self.retry_interval,
            backoff_base: self.retry_backoff_base,
            backoff_max: self.retry_backoff_max,
        }
    }
}
