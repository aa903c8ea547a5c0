//! Load config from file and environment.

use std::net::Ipv4Addr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use reel_core::chunk::DEFAULT_PARALLELISM;
use reel_core::DEFAULT_BEACON_PORT;
use serde::Deserialize;
use tracing::warn;

/// Node configuration. File: ~/.config/reelshare/config.toml or /etc/reelshare/config.toml.
/// Env overrides: REELSHARE_MEDIA_DIR, REELSHARE_BEACON_PORT, REELSHARE_SEEDER_PORT,
/// REELSHARE_RANGE_PORT, REELSHARE_PARALLELISM, REELSHARE_LOG.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    /// Base media directory: assembled titles, in-progress `.tmp` files and `{title}_chunks/`.
    #[serde(default = "default_media_dir")]
    pub media_dir: PathBuf,
    /// Beacon UDP port (default 8889).
    #[serde(default = "default_beacon_port")]
    pub beacon_port: u16,
    /// Announce interval (default 2000 ms).
    #[serde(default = "default_beacon_interval_ms")]
    pub beacon_interval_ms: u64,
    /// Forget peers silent for this long. Absent: never expire.
    #[serde(default)]
    pub beacon_peer_ttl_secs: Option<u64>,
    /// Multicast group joined for reception (and announced to), in addition to broadcast.
    #[serde(default)]
    pub multicast_group: Option<Ipv4Addr>,
    /// Chunk seeder TCP port (default 8890).
    #[serde(default = "default_seeder_port")]
    pub seeder_port: u16,
    /// Range file server TCP port (default 8888).
    #[serde(default = "default_range_port")]
    pub range_port: u16,
    /// Concurrent chunk downloads per batch (default 3).
    #[serde(default = "default_parallelism")]
    pub parallelism: usize,
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,
    #[serde(default = "default_read_timeout_ms")]
    pub read_timeout_ms: u64,
    /// mDNS service type advertised and browsed.
    #[serde(default = "default_service_type")]
    pub service_type: String,
    /// Default log filter when RUST_LOG is unset.
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

fn default_media_dir() -> PathBuf {
    match std::env::var_os("HOME") {
        Some(h) => PathBuf::from(h).join(".local/share/reelshare/media"),
        None => PathBuf::from("media"),
    }
}
fn default_beacon_port() -> u16 {
    DEFAULT_BEACON_PORT
}
fn default_beacon_interval_ms() -> u64 {
    2000
}
fn default_seeder_port() -> u16 {
    8890
}
fn default_range_port() -> u16 {
    8888
}
fn default_parallelism() -> usize {
    DEFAULT_PARALLELISM
}
fn default_connect_timeout_ms() -> u64 {
    5000
}
fn default_read_timeout_ms() -> u64 {
    10_000
}
fn default_service_type() -> String {
    crate::service_discovery::DEFAULT_SERVICE_TYPE.to_string()
}
fn default_log_level() -> String {
    "info".to_string()
}

impl Default for Config {
    fn default() -> Self {
        Self {
            media_dir: default_media_dir(),
            beacon_port: default_beacon_port(),
            beacon_interval_ms: default_beacon_interval_ms(),
            beacon_peer_ttl_secs: None,
            multicast_group: None,
            seeder_port: default_seeder_port(),
            range_port: default_range_port(),
            parallelism: default_parallelism(),
            connect_timeout_ms: default_connect_timeout_ms(),
            read_timeout_ms: default_read_timeout_ms(),
            service_type: default_service_type(),
            log_level: default_log_level(),
        }
    }
}

impl Config {
    pub fn beacon_interval(&self) -> Duration {
        Duration::from_millis(self.beacon_interval_ms.max(1))
    }

    pub fn peer_ttl(&self) -> Option<Duration> {
        self.beacon_peer_ttl_secs.map(Duration::from_secs)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn read_timeout(&self) -> Duration {
        Duration::from_millis(self.read_timeout_ms)
    }

    pub fn parallelism(&self) -> usize {
        self.parallelism.max(1)
    }
}

/// Load config: default, then config file (explicit path or the first search path present), then env vars.
pub fn load(explicit: Option<&Path>) -> Config {
    let mut c = match explicit {
        Some(p) => load_from(p),
        None => load_file(),
    }
    .unwrap_or_default();
    apply_env(&mut c, |k| std::env::var(k).ok());
    c
}

fn apply_env(c: &mut Config, var: impl Fn(&str) -> Option<String>) {
    if let Some(s) = var("REELSHARE_MEDIA_DIR") {
        if !s.is_empty() {
            c.media_dir = PathBuf::from(s);
        }
    }
    if let Some(p) = var("REELSHARE_BEACON_PORT").and_then(|s| s.parse().ok()) {
        c.beacon_port = p;
    }
    if let Some(p) = var("REELSHARE_SEEDER_PORT").and_then(|s| s.parse().ok()) {
        c.seeder_port = p;
    }
    if let Some(p) = var("REELSHARE_RANGE_PORT").and_then(|s| s.parse().ok()) {
        c.range_port = p;
    }
    if let Some(n) = var("REELSHARE_PARALLELISM").and_then(|s| s.parse().ok()) {
        c.parallelism = n;
    }
    if let Some(s) = var("REELSHARE_LOG") {
        c.log_level = s;
    }
}

fn config_paths() -> Vec<PathBuf> {
    let home = std::env::var_os("HOME").map(PathBuf::from);
    let mut out = Vec::new();
    if let Some(h) = home {
        out.push(h.join(".config/reelshare/config.toml"));
    }
    out.push(PathBuf::from("/etc/reelshare/config.toml"));
    out
}

fn load_file() -> Option<Config> {
    let p = config_paths().into_iter().find(|p| p.exists())?;
    load_from(&p)
}

fn load_from(p: &Path) -> Option<Config> {
    let s = match std::fs::read_to_string(p) {
        Ok(s) => s,
        Err(e) => {
            warn!(path = %p.display(), error = %e, "cannot read config file, using defaults");
            return None;
        }
    };
    match toml::from_str::<Config>(&s) {
        Ok(c) => Some(c),
        Err(e) => {
            warn!(path = %p.display(), error = %e, "invalid config file, using defaults");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn partial_file_keeps_defaults() {
        let c: Config = toml::from_str("seeder_port = 9000\nmulticast_group = \"239.255.60.60\"").unwrap();
        assert_eq!(c.seeder_port, 9000);
        assert_eq!(c.beacon_port, 8889);
        assert_eq!(c.range_port, 8888);
        assert_eq!(c.parallelism, 3);
        assert_eq!(c.multicast_group, Some(Ipv4Addr::new(239, 255, 60, 60)));
        assert_eq!(c.peer_ttl(), None);
    }

    #[test]
    fn unknown_fields_rejected() {
        assert!(toml::from_str::<Config>("proxy_port = 3128").is_err());
    }

    #[test]
    fn env_overrides_and_ignores_garbage() {
        let env: HashMap<&str, &str> = [
            ("REELSHARE_BEACON_PORT", "9999"),
            ("REELSHARE_RANGE_PORT", "not-a-port"),
            ("REELSHARE_PARALLELISM", "8"),
            ("REELSHARE_MEDIA_DIR", "/srv/media"),
        ]
        .into_iter()
        .collect();
        let mut c = Config::default();
        apply_env(&mut c, |k| env.get(k).map(|v| v.to_string()));
        assert_eq!(c.beacon_port, 9999);
        assert_eq!(c.range_port, 8888);
        assert_eq!(c.parallelism, 8);
        assert_eq!(c.media_dir, PathBuf::from("/srv/media"));
    }

    #[test]
    fn zero_parallelism_is_one() {
        let c = Config { parallelism: 0, ..Config::default() };
        assert_eq!(c.parallelism(), 1);
    }

    #[test]
    fn explicit_invalid_file_falls_back() {
        let dir = tempfile::tempdir().unwrap();
        let p = dir.path().join("config.toml");
        std::fs::write(&p, "beacon_port = \"nope\"").unwrap();
        assert!(load_from(&p).is_none());
        std::fs::write(&p, "beacon_port = 7000").unwrap();
        assert_eq!(load_from(&p).unwrap().beacon_port, 7000);
    }
}
