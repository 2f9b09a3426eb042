//! The configuration surface enumerated in SPEC_FULL.md §6, plus the
//! per-applier peer URI. This crate only defines the schema and its
//! defaults; layering defaults < file < environment and parsing the
//! CLI happens in the `relay` binary crate (§4.7).

use std::time::Duration;

use uuid::Uuid;

/// Hard cap on sequencer worker tasks if `sequencer_max_workers` isn't
/// overridden. Preserved from the source, which hard-codes it; whether
/// it's policy or an arbitrary limit isn't documented upstream (§9), so
/// here it's a configurable default rather than a constant.
pub const DEFAULT_MAX_WORKERS: usize = 768;

#[derive(Clone, Debug)]
pub struct PeerConfig {
    pub uri: String,
    pub login: Option<String>,
    pub password: Option<String>,
}

impl PeerConfig {
    pub fn new(uri: impl Into<String>) -> Self {
        PeerConfig {
            uri: uri.into(),
            login: None,
            password: None,
        }
    }

    pub fn with_credentials(mut self, login: impl Into<String>, password: impl Into<String>) -> Self {
        self.login = Some(login.into());
        self.password = Some(password.into());
        self
    }

    pub fn has_credentials(&self) -> bool {
        self.login.is_some()
    }
}

#[derive(Clone, Debug)]
pub struct Config {
    /// Local instance identity. Supplied by configuration at this layer;
    /// no external identity service is consulted (§6).
    pub instance_uuid: Uuid,
    /// `None` until the replica has completed its first join.
    pub replicaset_uuid: Option<Uuid>,

    pub replication_timeout: Duration,
    pub replication_reconnect_interval: Duration,
    pub replication_disconnect_timeout: Duration,
    pub replication_sync_lag: Duration,
    pub replication_skip_conflict: bool,
    pub sequencer_max_workers: usize,

    pub peers: Vec<PeerConfig>,

    pub log_level: String,

    /// Listen address for a locally hosted diagnostics endpoint, if this
    /// process also acts as a master to other followers. Out of scope for
    /// behavior (§6 Non-goals); declared so the config schema is total.
    pub listen_address: Option<String>,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            instance_uuid: Uuid::nil(),
            replicaset_uuid: None,
            replication_timeout: Duration::from_secs(1),
            replication_reconnect_interval: Duration::from_secs(1),
            replication_disconnect_timeout: Duration::from_secs(4),
            replication_sync_lag: Duration::from_millis(10),
            replication_skip_conflict: false,
            sequencer_max_workers: DEFAULT_MAX_WORKERS,
            peers: Vec::new(),
            log_level: "info".to_string(),
            listen_address: None,
        }
    }
}

#[test]
fn defaults_preserve_worker_cap() {
    let cfg = Config::default();
    assert_eq!(cfg.sequencer_max_workers, DEFAULT_MAX_WORKERS);
    assert!(!cfg.replication_skip_conflict);
    assert!(cfg.peers.is_empty());
}
