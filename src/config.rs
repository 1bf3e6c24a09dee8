//! Core configuration
//!
//! `coreconfig.yml` is a flat mapping of boolean switches plus two string
//! lists: `startup` (processes spawned on the first load) and `force_load`
//! (libraries handed to the library manager before any image runs). A
//! missing or broken file falls back to defaults, which are written back so
//! the user has something to edit.

use serde::{Deserialize, Serialize};
use std::path::Path;

pub const CONFIG_FILE: &str = "coreconfig.yml";

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CoreConfig {
    #[serde(default)]
    pub log_code: bool,
    #[serde(default)]
    pub log_passed: bool,
    #[serde(default)]
    pub log_write: bool,
    #[serde(default)]
    pub log_read: bool,
    #[serde(default)]
    pub log_exports: bool,
    #[serde(default)]
    pub log_svc_passed: bool,
    #[serde(default)]
    pub enable_breakpoint_script: bool,
    #[serde(default)]
    pub log_ipc: bool,

    #[serde(default)]
    pub startup: Vec<String>,
    #[serde(default)]
    pub force_load: Vec<String>,
}

impl CoreConfig {
    /// Look up a switch by its config-file name. Unknown names read false.
    pub fn get_bool(&self, name: &str) -> bool {
        match name {
            "log_code" => self.log_code,
            "log_passed" => self.log_passed,
            "log_write" => self.log_write,
            "log_read" => self.log_read,
            "log_exports" => self.log_exports,
            "log_svc_passed" => self.log_svc_passed,
            "enable_breakpoint_script" => self.enable_breakpoint_script,
            "log_ipc" => self.log_ipc,
            _ => false,
        }
    }

    /// Load from `path`, or fall back to defaults (and persist them) when
    /// the file is absent or malformed.
    pub fn load(path: &Path) -> CoreConfig {
        match std::fs::read_to_string(path) {
            Ok(text) => match serde_yaml::from_str(&text) {
                Ok(cfg) => cfg,
                Err(err) => {
                    log::warn!("core config incomplete ({}), using defaults", err);
                    let cfg = CoreConfig::default();
                    cfg.save(path);
                    cfg
                }
            },
            Err(_) => {
                let cfg = CoreConfig::default();
                cfg.save(path);
                cfg
            }
        }
    }

    /// Best-effort write; a read-only working directory is not fatal.
    pub fn save(&self, path: &Path) {
        if let Ok(text) = serde_yaml::to_string(self) {
            if let Err(err) = std::fs::write(path, text) {
                log::warn!("could not write {}: {}", path.display(), err);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_all_off() {
        let cfg = CoreConfig::default();
        for name in [
            "log_code",
            "log_passed",
            "log_write",
            "log_read",
            "log_exports",
            "log_svc_passed",
            "enable_breakpoint_script",
            "log_ipc",
        ] {
            assert!(!cfg.get_bool(name), "{} should default to false", name);
        }
        assert!(cfg.startup.is_empty());
        assert!(cfg.force_load.is_empty());
    }

    #[test]
    fn test_partial_yaml_fills_defaults() {
        let cfg: CoreConfig =
            serde_yaml::from_str("log_ipc: true\nstartup:\n  - shell.exe\n").unwrap();
        assert!(cfg.log_ipc);
        assert!(!cfg.log_code);
        assert_eq!(cfg.startup, vec!["shell.exe".to_string()]);
        assert!(cfg.force_load.is_empty());
    }

    #[test]
    fn test_roundtrip() {
        let mut cfg = CoreConfig::default();
        cfg.log_read = true;
        cfg.force_load = vec!["euser.dll".into()];

        let text = serde_yaml::to_string(&cfg).unwrap();
        let back: CoreConfig = serde_yaml::from_str(&text).unwrap();
        assert_eq!(back, cfg);
    }

    #[test]
    fn test_unknown_switch_reads_false() {
        assert!(!CoreConfig::default().get_bool("log_everything"));
    }
}
