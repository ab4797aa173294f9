//! Daemon configuration.
//!
//! Every field has a default, so a JSON config file only needs the keys it
//! changes.

use crate::tree::TreeOptions;
use serde::Deserialize;
use std::path::Path;

/// uid of root.
pub const ROOT_UID: u32 = 0;
/// uid of the shell user.
pub const SHELL_UID: u32 = 2000;

/// Tunables read at startup. Kernel cache timeouts are not among them; see
/// [`CACHE_TIMEOUT`](crate::filesystem::CACHE_TIMEOUT).
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct MediaFsConfig {
    /// Force FOPEN_DIRECT_IO on every open, not just redacted ones.
    pub direct_io: bool,
    /// Panic on protocol violations instead of logging them.
    pub strict_protocol_checks: bool,
    /// Keep a registry of live inodes and check every request against it.
    pub node_tracking: bool,
    /// Size of the blocking pool requests are dispatched to.
    pub worker_threads: usize,
    /// Callers that skip the access collaborator.
    pub bypass_uids: Vec<u32>,
    /// Largest write the kernel may send in one request.
    pub max_write: u32,
}

impl Default for MediaFsConfig {
    fn default() -> Self {
        Self {
            direct_io: false,
            strict_protocol_checks: cfg!(debug_assertions),
            node_tracking: cfg!(debug_assertions),
            worker_threads: 16,
            bypass_uids: vec![ROOT_UID, SHELL_UID],
            max_write: 1024 * 1024,
        }
    }
}

impl MediaFsConfig {
    /// Parses a JSON document; missing keys keep their defaults.
    pub fn from_json(json: &str) -> serde_json::Result<Self> {
        serde_json::from_str(json)
    }

    /// Reads and parses a config file.
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let text = std::fs::read_to_string(path)?;
        Ok(Self::from_json(&text)?)
    }

    /// Options for the node tree.
    pub fn tree_options(&self) -> TreeOptions {
        TreeOptions {
            strict: self.strict_protocol_checks,
            node_tracking: self.node_tracking,
        }
    }

    /// Whether `uid` skips the access collaborator.
    pub fn is_bypass(&self, uid: u32) -> bool {
        self.bypass_uids.contains(&uid)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = MediaFsConfig::default();
        assert!(config.is_bypass(ROOT_UID));
        assert!(config.is_bypass(SHELL_UID));
        assert!(!config.is_bypass(10_057));
        assert!(!config.direct_io);
    }

    #[test]
    fn test_partial_json_keeps_defaults() {
        let config = MediaFsConfig::from_json(r#"{"direct_io": true}"#).unwrap();
        assert!(config.direct_io);
        assert_eq!(config.worker_threads, 16);
        assert_eq!(config.bypass_uids, vec![ROOT_UID, SHELL_UID]);
    }

    #[test]
    fn test_timeout_keys_are_not_settable() {
        let config = MediaFsConfig::from_json(
            r#"{"attr_timeout_secs": 3600, "entry_timeout_secs": 3600, "max_write": 4096}"#,
        )
        .unwrap();
        assert_eq!(config.max_write, 4096);
        assert_eq!(
            crate::filesystem::CACHE_TIMEOUT,
            std::time::Duration::from_secs(10)
        );
    }

    #[test]
    fn test_empty_bypass_list() {
        let config = MediaFsConfig::from_json(r#"{"bypass_uids": []}"#).unwrap();
        assert!(!config.is_bypass(ROOT_UID));
    }

    #[test]
    fn test_tree_options_follow_config() {
        let config = MediaFsConfig::from_json(
            r#"{"strict_protocol_checks": false, "node_tracking": true}"#,
        )
        .unwrap();
        let options = config.tree_options();
        assert!(!options.strict);
        assert!(options.node_tracking);
    }

    #[test]
    fn test_load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("mediafs.json");
        std::fs::write(&path, r#"{"worker_threads": 4, "max_write": 131072}"#).unwrap();
        let config = MediaFsConfig::load(&path).unwrap();
        assert_eq!(config.worker_threads, 4);
        assert_eq!(config.max_write, 131_072);
    }

    #[test]
    fn test_bad_json_is_an_error() {
        assert!(MediaFsConfig::from_json("{\"worker_threads\": \"many\"}").is_err());
    }
}
