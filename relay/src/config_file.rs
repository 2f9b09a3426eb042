//! Layers the `relay-repl` configuration schema: compiled-in defaults,
//! then an optional TOML file, then environment variables (§4.7, §6).

use std::env;
use std::path::Path;
use std::time::Duration;

use serde::Deserialize;
use uuid::Uuid;

use relay_base::{err, Result};
use relay_repl::{Config, PeerConfig};

#[derive(Debug, Default, Deserialize)]
struct FilePeer {
    uri: String,
    login: Option<String>,
    password: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct FileConfig {
    instance_uuid: Option<Uuid>,
    replicaset_uuid: Option<Uuid>,
    replication_timeout_secs: Option<f64>,
    replication_reconnect_interval_secs: Option<f64>,
    replication_disconnect_timeout_secs: Option<f64>,
    replication_sync_lag_secs: Option<f64>,
    replication_skip_conflict: Option<bool>,
    sequencer_max_workers: Option<usize>,
    log_level: Option<String>,
    listen_address: Option<String>,
    peers: Option<Vec<FilePeer>>,
}

/// `defaults < file < environment`. `file_path` is optional: a process
/// with no config file runs on defaults plus whatever the environment
/// overrides.
pub fn load_config(file_path: Option<&Path>) -> Result<Config> {
    let mut config = Config::default();

    if let Some(path) = file_path {
        let text = std::fs::read_to_string(path)
            .map_err(|e| err(format!("reading config file {}: {e}", path.display())))?;
        let file: FileConfig = toml::from_str(&text)
            .map_err(|e| err(format!("parsing config file {}: {e}", path.display())))?;
        apply_file(&mut config, file);
    }

    apply_env(&mut config)?;
    Ok(config)
}

fn apply_file(config: &mut Config, file: FileConfig) {
    if let Some(v) = file.instance_uuid {
        config.instance_uuid = v;
    }
    if let Some(v) = file.replicaset_uuid {
        config.replicaset_uuid = Some(v);
    }
    if let Some(v) = file.replication_timeout_secs {
        config.replication_timeout = Duration::from_secs_f64(v);
    }
    if let Some(v) = file.replication_reconnect_interval_secs {
        config.replication_reconnect_interval = Duration::from_secs_f64(v);
    }
    if let Some(v) = file.replication_disconnect_timeout_secs {
        config.replication_disconnect_timeout = Duration::from_secs_f64(v);
    }
    if let Some(v) = file.replication_sync_lag_secs {
        config.replication_sync_lag = Duration::from_secs_f64(v);
    }
    if let Some(v) = file.replication_skip_conflict {
        config.replication_skip_conflict = v;
    }
    if let Some(v) = file.sequencer_max_workers {
        config.sequencer_max_workers = v;
    }
    if let Some(v) = file.log_level {
        config.log_level = v;
    }
    if let Some(v) = file.listen_address {
        config.listen_address = Some(v);
    }
    if let Some(peers) = file.peers {
        config.peers = peers
            .into_iter()
            .map(|p| match (p.login, p.password) {
                (Some(login), Some(password)) => PeerConfig::new(p.uri).with_credentials(login, password),
                _ => PeerConfig::new(p.uri),
            })
            .collect();
    }
}

fn apply_env(config: &mut Config) -> Result<()> {
    if let Ok(v) = env::var("RELAY_INSTANCE_UUID") {
        config.instance_uuid = Uuid::parse_str(&v).map_err(|e| err(format!("RELAY_INSTANCE_UUID: {e}")))?;
    }
    if let Ok(v) = env::var("RELAY_LOG_LEVEL") {
        config.log_level = v;
    }
    if let Ok(v) = env::var("RELAY_REPLICATION_SKIP_CONFLICT") {
        config.replication_skip_conflict = matches!(v.as_str(), "1" | "true" | "yes");
    }
    if let Ok(v) = env::var("RELAY_SEQUENCER_MAX_WORKERS") {
        config.sequencer_max_workers = v
            .parse()
            .map_err(|_| err("RELAY_SEQUENCER_MAX_WORKERS must be a positive integer"))?;
    }
    if let Ok(v) = env::var("RELAY_LISTEN_ADDRESS") {
        config.listen_address = Some(v);
    }
    if let Ok(v) = env::var("RELAY_PEERS") {
        // Comma-separated host:port list. Per-peer credentials are only
        // configurable via the file layer.
        config.peers = v.split(',').filter(|s| !s.is_empty()).map(PeerConfig::new).collect();
    }
    Ok(())
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn defaults_survive_with_no_file_and_no_env() {
        let config = load_config(None).unwrap();
        assert_eq!(config.sequencer_max_workers, relay_repl::DEFAULT_MAX_WORKERS);
        assert!(config.peers.is_empty());
    }

    #[test]
    fn file_layer_overrides_defaults() {
        let dir = std::env::temp_dir().join(format!("relay-config-test-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("relay.toml");
        std::fs::write(
            &path,
            r#"
            sequencer_max_workers = 4
            replication_skip_conflict = true

            [[peers]]
            uri = "10.0.0.1:7000"
            "#,
        )
        .unwrap();

        let config = load_config(Some(&path)).unwrap();
        assert_eq!(config.sequencer_max_workers, 4);
        assert!(config.replication_skip_conflict);
        assert_eq!(config.peers.len(), 1);
        assert_eq!(config.peers[0].uri, "10.0.0.1:7000");

        std::fs::remove_dir_all(&dir).ok();
    }
}
