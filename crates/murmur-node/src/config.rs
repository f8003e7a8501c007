//! Node configuration loaded from environment variables.
//!
//! Every setting has a default, so a node starts with no configuration at all.

use std::path::PathBuf;
use std::time::Duration;

use libp2p::Multiaddr;

use murmur_core::MessengerConfig;
use murmur_shared::constants::DEFAULT_QUIC_PORT;

#[derive(Debug, Clone)]
pub struct NodeConfig {
    /// Directory holding the identity key file and the database.
    /// Env: `MURMUR_DATA_DIR`
    /// Default: the platform data directory for `murmur`, else `./murmur-data`.
    pub data_dir: PathBuf,

    /// Env: `MURMUR_LISTEN_PORT`
    /// Default: `4001`
    pub listen_port: u16,

    /// Comma-separated multiaddrs dialled at startup.
    /// Env: `MURMUR_BOOTSTRAP_PEERS`
    pub bootstrap_peers: Vec<Multiaddr>,

    /// Env: `MURMUR_DATASYNC` (true/false)
    /// Default: `false`
    pub datasync_enabled: bool,

    /// Env: `MURMUR_MAX_ATTEMPTS`
    /// Default: `3`
    pub max_attempts: u32,

    /// How often received envelopes are pulled through the pipeline.
    /// Env: `MURMUR_POLL_INTERVAL_MS`
    /// Default: `500`
    pub poll_interval: Duration,

    /// Public chats joined at startup.
    /// Env: `MURMUR_PUBLIC_CHATS` (comma separated)
    pub public_chats: Vec<String>,

    /// Env: `MURMUR_DEVICE_NAME`
    /// Default: `murmur`
    pub device_name: String,
}

impl Default for NodeConfig {
    fn default() -> Self {
        let data_dir = directories::ProjectDirs::from("org", "murmur", "murmur")
            .map(|dirs| dirs.data_dir().to_path_buf())
            .unwrap_or_else(|| PathBuf::from("./murmur-data"));
        Self {
            data_dir,
            listen_port: DEFAULT_QUIC_PORT,
            bootstrap_peers: Vec::new(),
            datasync_enabled: false,
            max_attempts: 3,
            poll_interval: Duration::from_millis(500),
            public_chats: Vec::new(),
            device_name: "murmur".to_string(),
        }
    }
}

impl NodeConfig {
    /// Load configuration from environment variables, falling back to defaults.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let mut config = Self::default();

        if let Some(dir) = lookup("MURMUR_DATA_DIR") {
            config.data_dir = PathBuf::from(dir);
        }

        if let Some(val) = lookup("MURMUR_LISTEN_PORT") {
            match val.parse::<u16>() {
                Ok(port) => config.listen_port = port,
                Err(_) => tracing::warn!(value = %val, "Invalid MURMUR_LISTEN_PORT, using default"),
            }
        }

        if let Some(val) = lookup("MURMUR_BOOTSTRAP_PEERS") {
            for addr in split_list(&val) {
                match addr.parse::<Multiaddr>() {
                    Ok(parsed) => config.bootstrap_peers.push(parsed),
                    Err(e) => tracing::warn!(value = %addr, error = %e, "Skipping invalid bootstrap peer"),
                }
            }
        }

        if let Some(val) = lookup("MURMUR_DATASYNC") {
            config.datasync_enabled = val != "false" && val != "0";
        }

        if let Some(val) = lookup("MURMUR_MAX_ATTEMPTS") {
            match val.parse::<u32>() {
                Ok(n) if n > 0 => config.max_attempts = n,
                _ => tracing::warn!(value = %val, "Invalid MURMUR_MAX_ATTEMPTS, using default"),
            }
        }

        if let Some(val) = lookup("MURMUR_POLL_INTERVAL_MS") {
            match val.parse::<u64>() {
                Ok(ms) if ms > 0 => config.poll_interval = Duration::from_millis(ms),
                _ => tracing::warn!(value = %val, "Invalid MURMUR_POLL_INTERVAL_MS, using default"),
            }
        }

        if let Some(val) = lookup("MURMUR_PUBLIC_CHATS") {
            config.public_chats = split_list(&val).map(str::to_string).collect();
        }

        if let Some(name) = lookup("MURMUR_DEVICE_NAME") {
            if !name.is_empty() {
                config.device_name = name;
            }
        }

        config
    }

    pub fn identity_path(&self) -> PathBuf {
        self.data_dir.join("identity.key")
    }

    pub fn database_path(&self) -> PathBuf {
        self.data_dir.join("murmur.db")
    }

    /// Messenger settings for this node. `installation_id` is the stable ID
    /// persisted next to the identity.
    pub fn messenger_config(&self, installation_id: String) -> MessengerConfig {
        MessengerConfig {
            datasync_enabled: self.datasync_enabled,
            max_attempts: self.max_attempts,
            installation_id,
            device_name: self.device_name.clone(),
            ..MessengerConfig::default()
        }
    }
}

fn split_list(val: &str) -> impl Iterator<Item = &str> {
    val.split(',').map(str::trim).filter(|s| !s.is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn load(vars: &[(&str, &str)]) -> NodeConfig {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        NodeConfig::from_lookup(|key| vars.get(key).cloned())
    }

    #[test]
    fn test_defaults() {
        let config = load(&[]);
        assert_eq!(config.listen_port, DEFAULT_QUIC_PORT);
        assert!(!config.datasync_enabled);
        assert!(config.public_chats.is_empty());
    }

    #[test]
    fn test_reads_values() {
        let config = load(&[
            ("MURMUR_DATA_DIR", "/tmp/node"),
            ("MURMUR_LISTEN_PORT", "5001"),
            ("MURMUR_DATASYNC", "true"),
            ("MURMUR_PUBLIC_CHATS", "status, news,,"),
            ("MURMUR_BOOTSTRAP_PEERS", "/ip4/127.0.0.1/udp/4001/quic-v1"),
        ]);
        assert_eq!(config.database_path(), PathBuf::from("/tmp/node/murmur.db"));
        assert_eq!(config.listen_port, 5001);
        assert!(config.datasync_enabled);
        assert_eq!(config.public_chats, vec!["status", "news"]);
        assert_eq!(config.bootstrap_peers.len(), 1);
    }

    #[test]
    fn test_invalid_values_keep_defaults() {
        let config = load(&[
            ("MURMUR_LISTEN_PORT", "not-a-port"),
            ("MURMUR_MAX_ATTEMPTS", "0"),
            ("MURMUR_BOOTSTRAP_PEERS", "garbage"),
        ]);
        assert_eq!(config.listen_port, DEFAULT_QUIC_PORT);
        assert_eq!(config.max_attempts, 3);
        assert!(config.bootstrap_peers.is_empty());
    }
}
