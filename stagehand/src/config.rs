//! Load config from file and environment.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Context;
use serde::Deserialize;
use stagehand_core::builder::{BuilderConfig, DEFAULT_COMPRESSION_LEVEL, DEFAULT_MAX_CONCURRENT_BUILDS};
use stagehand_core::chunk::DEFAULT_CHUNK_SIZE;
use stagehand_core::session::{SessionConfig, DEFAULT_MAX_RESUME_ATTEMPTS};

/// Daemon configuration. File: ~/.config/stagehand/config.toml or /etc/stagehand/config.toml.
/// Env overrides: STAGEHAND_STREAM_PORT, STAGEHAND_CONTROL_PORT, STAGEHAND_COOK_ROOT, STAGEHAND_CACHE_DIR.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    /// Address both listeners bind to (default 0.0.0.0).
    #[serde(default = "default_bind_addr")]
    pub bind_addr: String,
    /// Streaming transport TCP port (default 18821).
    #[serde(default = "default_stream_port")]
    pub stream_port: u16,
    /// HTTP control port (default 18820).
    #[serde(default = "default_control_port")]
    pub control_port: u16,
    /// Directory the cook pipeline writes into; staged paths are relative to it.
    #[serde(default = "default_cook_root")]
    pub cook_root: PathBuf,
    /// Where built archives are cached. Unset keeps archives in memory only.
    #[serde(default)]
    pub cache_dir: Option<PathBuf>,
    /// On-disk blob store. Unset keeps staged bytes in memory.
    #[serde(default)]
    pub blob_dir: Option<PathBuf>,
    #[serde(default = "default_chunk_size")]
    pub chunk_size: u64,
    #[serde(default = "default_idle_timeout_secs")]
    pub idle_timeout_secs: u64,
    #[serde(default = "default_ack_timeout_secs")]
    pub ack_timeout_secs: u64,
    #[serde(default = "default_max_resume_attempts")]
    pub max_resume_attempts: u32,
    #[serde(default = "default_max_concurrent_builds")]
    pub max_concurrent_builds: usize,
    /// How long an unreferenced archive survives without being requested.
    #[serde(default = "default_archive_grace_secs")]
    pub archive_grace_secs: u64,
    #[serde(default = "default_compression_level")]
    pub compression_level: i32,
}

fn default_bind_addr() -> String {
    "0.0.0.0".to_string()
}
fn default_stream_port() -> u16 {
    18821
}
fn default_control_port() -> u16 {
    18820
}
fn default_cook_root() -> PathBuf {
    PathBuf::from("Saved/Cooked")
}
fn default_chunk_size() -> u64 {
    DEFAULT_CHUNK_SIZE
}
fn default_idle_timeout_secs() -> u64 {
    60
}
fn default_ack_timeout_secs() -> u64 {
    10
}
fn default_max_resume_attempts() -> u32 {
    DEFAULT_MAX_RESUME_ATTEMPTS
}
fn default_max_concurrent_builds() -> usize {
    DEFAULT_MAX_CONCURRENT_BUILDS
}
fn default_archive_grace_secs() -> u64 {
    300
}
fn default_compression_level() -> i32 {
    DEFAULT_COMPRESSION_LEVEL
}

impl Default for Config {
    fn default() -> Self {
        Self {
            bind_addr: default_bind_addr(),
            stream_port: default_stream_port(),
            control_port: default_control_port(),
            cook_root: default_cook_root(),
            cache_dir: None,
            blob_dir: None,
            chunk_size: default_chunk_size(),
            idle_timeout_secs: default_idle_timeout_secs(),
            ack_timeout_secs: default_ack_timeout_secs(),
            max_resume_attempts: default_max_resume_attempts(),
            max_concurrent_builds: default_max_concurrent_builds(),
            archive_grace_secs: default_archive_grace_secs(),
            compression_level: default_compression_level(),
        }
    }
}

impl Config {
    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.idle_timeout_secs)
    }

    pub fn ack_timeout(&self) -> Duration {
        Duration::from_secs(self.ack_timeout_secs)
    }

    pub fn archive_grace(&self) -> Duration {
        Duration::from_secs(self.archive_grace_secs)
    }

    pub fn builder_config(&self) -> BuilderConfig {
        BuilderConfig {
            max_concurrent_builds: self.max_concurrent_builds,
            compression_level: self.compression_level,
            cache_dir: self.cache_dir.clone(),
        }
    }

    pub fn session_config(&self) -> SessionConfig {
        SessionConfig {
            chunk_size: self.chunk_size,
            max_resume_attempts: self.max_resume_attempts,
        }
    }

    /// Reject values the daemon cannot run with.
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.idle_timeout_secs == 0 {
            anyhow::bail!("idle_timeout_secs must be at least 1");
        }
        if self.ack_timeout_secs == 0 {
            anyhow::bail!("ack_timeout_secs must be at least 1");
        }
        Ok(())
    }

    /// Apply STAGEHAND_* overrides. Unparsable values are ignored.
    pub fn apply_env<F>(&mut self, var: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(p) = var("STAGEHAND_STREAM_PORT").and_then(|s| s.parse::<u16>().ok()) {
            self.stream_port = p;
        }
        if let Some(p) = var("STAGEHAND_CONTROL_PORT").and_then(|s| s.parse::<u16>().ok()) {
            self.control_port = p;
        }
        if let Some(s) = var("STAGEHAND_COOK_ROOT").filter(|s| !s.is_empty()) {
            self.cook_root = PathBuf::from(s);
        }
        if let Some(s) = var("STAGEHAND_CACHE_DIR").filter(|s| !s.is_empty()) {
            self.cache_dir = Some(PathBuf::from(s));
        }
    }
}

/// Load config: merge default, then config file (if present), then env vars.
/// An explicit `--config` path must exist and parse.
pub fn load(explicit: Option<&Path>) -> anyhow::Result<Config> {
    let mut c = match explicit {
        Some(path) => read_file(path)?,
        None => load_file().unwrap_or_default(),
    };
    c.apply_env(|k| std::env::var(k).ok());
    Ok(c)
}

fn read_file(path: &Path) -> anyhow::Result<Config> {
    let s = std::fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
    let c: Config = toml::from_str(&s).with_context(|| format!("parsing {}", path.display()))?;
    c.validate().with_context(|| format!("invalid {}", path.display()))?;
    Ok(c)
}

fn config_paths() -> Vec<PathBuf> {
    let home = std::env::var_os("HOME").map(PathBuf::from);
    let mut out = Vec::new();
    if let Some(h) = home {
        out.push(h.join(".config/stagehand/config.toml"));
    }
    out.push(PathBuf::from("/etc/stagehand/config.toml"));
    out
}

fn load_file() -> Option<Config> {
    for p in config_paths() {
        if p.exists() {
            match read_file(&p) {
                Ok(c) => return Some(c),
                Err(e) => tracing::warn!(path = %p.display(), error = %e, "ignoring config file"),
            }
            break;
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn defaults_match_documented_values() {
        let c = Config::default();
        assert_eq!(c.stream_port, 18821);
        assert_eq!(c.control_port, 18820);
        assert_eq!(c.chunk_size, 256 * 1024);
        assert_eq!(c.idle_timeout_secs, 60);
        assert_eq!(c.ack_timeout_secs, 10);
        assert_eq!(c.max_resume_attempts, 3);
        assert_eq!(c.max_concurrent_builds, 2);
        assert_eq!(c.archive_grace_secs, 300);
        assert_eq!(c.compression_level, 3);
        assert!(c.cache_dir.is_none());
    }

    #[test]
    fn file_fills_missing_keys_with_defaults() {
        let c: Config = toml::from_str("stream_port = 9000\ncache_dir = \"/tmp/paks\"\n").unwrap();
        assert_eq!(c.stream_port, 9000);
        assert_eq!(c.control_port, 18820);
        assert_eq!(c.cache_dir, Some(PathBuf::from("/tmp/paks")));
    }

    #[test]
    fn unknown_keys_are_rejected() {
        assert!(toml::from_str::<Config>("proxy_port = 3128\n").is_err());
    }

    #[test]
    fn env_overrides_file() {
        let env: HashMap<&str, &str> = [
            ("STAGEHAND_STREAM_PORT", "19000"),
            ("STAGEHAND_CONTROL_PORT", "not a port"),
            ("STAGEHAND_COOK_ROOT", "/cook"),
        ]
        .into_iter()
        .collect();
        let mut c = Config::default();
        c.apply_env(|k| env.get(k).map(|v| v.to_string()));
        assert_eq!(c.stream_port, 19000);
        assert_eq!(c.control_port, 18820);
        assert_eq!(c.cook_root, PathBuf::from("/cook"));
        assert!(c.cache_dir.is_none());
    }

    #[test]
    fn explicit_path_must_parse() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("stagehand.toml");
        assert!(load(Some(&path)).is_err());
        std::fs::write(&path, "control_port = 18900\nmax_resume_attempts = 5\n").unwrap();
        let c = read_file(&path).unwrap();
        assert_eq!(c.control_port, 18900);
        assert_eq!(c.max_resume_attempts, 5);
    }

    #[test]
    fn zero_timeouts_are_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("stagehand.toml");
        std::fs::write(&path, "idle_timeout_secs = 0\n").unwrap();
        assert!(load(Some(&path)).is_err());
        std::fs::write(&path, "ack_timeout_secs = 0\n").unwrap();
        assert!(load(Some(&path)).is_err());
        std::fs::write(&path, "ack_timeout_secs = 1\nidle_timeout_secs = 1\n").unwrap();
        assert!(load(Some(&path)).is_ok());
        assert!(Config::default().validate().is_ok());
    }
}
