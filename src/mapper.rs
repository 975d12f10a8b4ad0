use crate::config::{GlobalConfig, MappingEntry};

const INBOX: &str = "INBOX";
const INBOX_LABEL: &str = "[Gmail]/Inbox";
const PROVIDER_PREFIX: &str = "[Gmail]/";
const PROVIDER_CONTAINER: &str = "[Gmail]";

/// Strips the provider container prefix and any leading backslashes from a
/// source label.
fn clean_label(label: &str) -> &str {
    label
        .strip_prefix(PROVIDER_PREFIX)
        .unwrap_or(label)
        .trim_start_matches('\\')
}

fn depth(label: &str) -> usize {
    label.matches('/').count()
}

/// Maps a set of source labels to one destination folder.
pub struct FolderMapper {
    mapping: Vec<MappingEntry>,
    folder_prefix: String,
    archive_folder: String,
}

impl FolderMapper {
    pub fn new(config: &GlobalConfig) -> Self {
        FolderMapper {
            mapping: config.folder_mapping.clone(),
            folder_prefix: config.folder_prefix.clone(),
            archive_folder: config.archive_folder.clone(),
        }
    }

    /// Resolves a label set to a destination folder, `None` meaning the
    /// labels map to the drop sentinel. Total over its domain:
    ///
    /// 1. any inbox alias short-circuits to the canonical inbox,
    /// 2. the bare provider container label is ignored; a set carrying
    ///    nothing else is dropped (the container is not selectable and
    ///    holds no messages of its own),
    /// 3. first configured mapping entry (in configuration order) whose
    ///    label is present wins,
    /// 4. otherwise the deepest label, prefixed and with `/` translated to
    ///    the destination hierarchy separator,
    /// 5. an empty label set goes to the archive folder.
    pub fn resolve(&self, labels: &[String]) -> Option<String> {
        if labels
            .iter()
            .any(|l| l == INBOX_LABEL || clean_label(l).eq_ignore_ascii_case(INBOX))
        {
            return Some(INBOX.to_string());
        }

        let mut saw_container = false;
        let mut cleaned: Vec<&str> = Vec::new();
        for label in labels {
            if label == PROVIDER_CONTAINER {
                saw_container = true;
                continue;
            }
            let label = clean_label(label);
            if !label.is_empty() {
                cleaned.push(label);
            }
        }

        for entry in &self.mapping {
            if cleaned.iter().any(|l| *l == entry.label) {
                return entry.folder.clone();
            }
        }

        // The label with the most separators is the most specific one.
        // Ties go to the earliest label in input order.
        let mut deepest: Option<&str> = None;
        for label in &cleaned {
            if deepest.map_or(true, |d| depth(label) > depth(d)) {
                deepest = Some(label);
            }
        }
        if let Some(deepest) = deepest {
            return Some(format!("{}{}", self.folder_prefix, deepest).replace('/', "."));
        }

        if saw_container {
            return None;
        }
        Some(self.archive_folder.clone())
    }
}
