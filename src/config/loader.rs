// src/config/loader.rs

//! # Configuration Loader
//!
//! Reads the agent's TOML file, deserializes it into `RawConfig`, and
//! converts durations and policy tables into a runtime `Config`.

use crate::agent_log;
use crate::config::model::{Config, ConfigError, RawConfig};
use log::Level;
use std::{fs, path::Path};

/// Load and parse the configuration from `path`.
/// Logs at DEBUG before reading and INFO on success.
pub fn load(path: &Path) -> Result<Config, ConfigError> {
    agent_log!(Level::Debug, "config", "Reading config from {:?}", path);
    let txt = fs::read_to_string(path)?;
    let cfg = parse(&txt)?;
    agent_log!(
        Level::Info,
        "config",
        "Loaded config from {:?}: {} policy(ies), endpoint={}",
        path,
        cfg.policies.len(),
        cfg.companion.endpoint
    );
    Ok(cfg)
}

/// Parse configuration text that is already in memory.
pub fn parse(txt: &str) -> Result<Config, ConfigError> {
    let raw: RawConfig = toml::from_str(txt)?;
    Config::try_from(raw)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use std::time::Duration;
    use tempfile::NamedTempFile;

    #[test]
    fn empty_file_uses_defaults() {
        let cfg = parse("").unwrap();
        assert_eq!(cfg.companion.endpoint, "http://127.0.0.1:7601");
        assert_eq!(cfg.companion.max_loop_events, 100);
        assert_eq!(cfg.actions.deadline, Duration::from_secs(30));
        assert_eq!(cfg.actions.tick_interval, Duration::from_millis(100));
        assert_eq!(cfg.logging.level, "INFO");
        assert!(cfg.policies.is_empty());
    }

    #[test]
    fn bad_duration_is_reported() {
        let err = parse("[actions]\ndeadline = \"soon\"\n").unwrap_err();
        assert!(matches!(err, ConfigError::InvalidDuration(ref s, _) if s == "soon"), "{err}");
    }

    #[test]
    fn zero_loop_events_rejected() {
        let err = parse("[companion]\nmax_loop_events = 0\n").unwrap_err();
        assert!(matches!(err, ConfigError::ZeroLoopEvents));
    }

    #[test]
    fn load_reads_from_disk() {
        let mut tmp = NamedTempFile::new().unwrap();
        writeln!(tmp, "[companion]\nendpoint = \"http://[::1]:9000\"\nmax_loop_events = 7").unwrap();
        let cfg = load(tmp.path()).unwrap();
        assert_eq!(cfg.companion.endpoint, "http://[::1]:9000");
        assert_eq!(cfg.companion.dispatcher_config().max_loop_events, 7);
    }

    #[test]
    fn missing_file_is_io_error() {
        let err = load(Path::new("/definitely/not/here.toml")).unwrap_err();
        assert!(matches!(err, ConfigError::Io(_)));
    }
}
