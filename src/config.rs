use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{bail, Context, Result};
use serde::Deserialize;

use crate::reconnect::RetryPolicy;

/// One entry of the label-to-folder mapping. Entries are matched in the
/// order they appear in the configuration file; that order is a contract.
#[derive(Debug, Clone, Deserialize)]
pub struct MappingEntry {
    /// Source label, compared after cleaning, exact and case-sensitive.
    pub label: String,
    /// Destination folder. Omitted means messages with this label are
    /// dropped entirely.
    #[serde(default)]
    pub folder: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct GlobalConfig {
    /// Destination for messages that carry no label at all.
    pub archive_folder: String,
    /// Prefix for destination folders derived from unmapped labels.
    pub folder_prefix: String,
    /// Source folder that aggregates every message; it is skipped during
    /// enumeration because its contents live in their label folders.
    pub root_folder: String,
    /// Labels translated into the \Flagged state on the destination.
    pub labels_as_flagged: Vec<String>,
    pub folder_mapping: Vec<MappingEntry>,
    pub checkpoint_file: PathBuf,
    pub statistics_file: PathBuf,
}

impl Default for GlobalConfig {
    fn default() -> Self {
        GlobalConfig {
            archive_folder: "Archive".to_string(),
            folder_prefix: "INBOX.".to_string(),
            root_folder: "[Gmail]/All Mail".to_string(),
            labels_as_flagged: ["Important", "[Gmail]/Important", "Starred", "[Gmail]/Starred"]
                .iter()
                .map(|s| s.to_string())
                .collect(),
            folder_mapping: Vec::new(),
            checkpoint_file: PathBuf::from("migration_checkpoint.json"),
            statistics_file: PathBuf::from("statistics.json"),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct TransportConfig {
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
    /// Retry budget for transient failures; 0 retries without bound.
    pub max_retries: u32,
}

impl Default for TransportConfig {
    fn default() -> Self {
        TransportConfig {
            base_delay_ms: 1000,
            max_delay_ms: 30_000,
            max_retries: 5,
        }
    }
}

impl TransportConfig {
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            base_delay: Duration::from_millis(self.base_delay_ms),
            max_delay: Duration::from_millis(self.max_delay_ms),
            max_retries: (self.max_retries > 0).then_some(self.max_retries),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AttachmentConfig {
    pub enabled: bool,
    /// File extensions eligible for extraction, e.g. ".pdf".
    pub extension_whitelist: Vec<String>,
    /// An attachment qualifies only when strictly larger than this.
    pub min_size: u64,
    /// Attachments at or above this size stay inline.
    pub max_size: u64,
    /// Local directory extracted attachments are written to.
    pub storage_path: PathBuf,
    /// Prefix of the reference link substituted into the message.
    pub storage_url: String,
}

impl Default for AttachmentConfig {
    fn default() -> Self {
        AttachmentConfig {
            enabled: false,
            extension_whitelist: [".pdf", ".zip", ".docx", ".xlsx"]
                .iter()
                .map(|s| s.to_string())
                .collect(),
            min_size: 0,
            max_size: 100 * 1024 * 1024,
            storage_path: PathBuf::new(),
            storage_url: String::new(),
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    pub global: GlobalConfig,
    pub transport: TransportConfig,
    pub attachments: AttachmentConfig,
}

impl Config {
    /// Loads and validates the configuration. Unknown keys are ignored,
    /// invalid combinations fail here rather than at first use.
    pub fn load(path: &Path) -> Result<Self> {
        let text = fs::read_to_string(path)
            .with_context(|| format!("cannot read configuration file {}", path.display()))?;
        let mut config: Config = toml::from_str(&text)
            .with_context(|| format!("cannot parse configuration file {}", path.display()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&mut self) -> Result<()> {
        let mut seen = HashSet::new();
        for entry in &self.global.folder_mapping {
            if !seen.insert(entry.label.as_str()) {
                bail!("duplicate folder_mapping entry for label {:?}", entry.label);
            }
        }
        for ext in &mut self.attachments.extension_whitelist {
            *ext = ext.to_ascii_lowercase();
            if !ext.starts_with('.') {
                ext.insert(0, '.');
            }
        }
        if self.attachments.enabled {
            if self.attachments.storage_path.as_os_str().is_empty() {
                bail!("attachment extraction is enabled but storage_path is not set");
            }
            if self.attachments.storage_url.is_empty() {
                bail!("attachment extraction is enabled but storage_url is not set");
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = Config::default();
        assert_eq!(config.global.archive_folder, "Archive");
        assert_eq!(config.global.folder_prefix, "INBOX.");
        assert_eq!(config.transport.max_retries, 5);
        assert!(!config.attachments.enabled);
    }

    #[test]
    fn test_parse_with_unknown_keys() {
        let text = r#"
            [global]
            archive_folder = "Archiv"
            future_option = true

            [[global.folder_mapping]]
            label = "Work"
            folder = "INBOX.Arbeit"

            [[global.folder_mapping]]
            label = "Spam"

            [attachments]
            enabled = true
            extension_whitelist = [".PDF", "zip"]
            min_size = 1024
            storage_path = "/mnt/store"
            storage_url = "file:///mnt/store/"
        "#;
        let mut config: Config = toml::from_str(text).unwrap();
        config.validate().unwrap();
        assert_eq!(config.global.archive_folder, "Archiv");
        assert_eq!(config.global.folder_mapping.len(), 2);
        assert_eq!(
            config.global.folder_mapping[0].folder.as_deref(),
            Some("INBOX.Arbeit")
        );
        assert_eq!(config.global.folder_mapping[1].folder, None);
        assert_eq!(config.attachments.extension_whitelist, [".pdf", ".zip"]);
    }

    #[test]
    fn test_duplicate_mapping_rejected() {
        let text = r#"
            [[global.folder_mapping]]
            label = "Work"
            folder = "A"

            [[global.folder_mapping]]
            label = "Work"
            folder = "B"
        "#;
        let mut config: Config = toml::from_str(text).unwrap();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_enabled_attachments_require_storage() {
        let mut config = Config::default();
        config.attachments.enabled = true;
        assert!(config.validate().is_err());
        config.attachments.storage_path = PathBuf::from("/tmp/store");
        assert!(config.validate().is_err());
        config.attachments.storage_url = "file:///tmp/store/".to_string();
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_unbounded_retries() {
        let config = TransportConfig {
            max_retries: 0,
            ..TransportConfig::default()
        };
        assert_eq!(config.retry_policy().max_retries, None);
    }
}
