use std::collections::BTreeMap;
use std::fmt::Write as _;
use std::fs;
use std::io;
use std::path::Path;

use log::warn;
use serde::{Deserialize, Serialize};

/// Two-level counter aggregate: category name to (subkey to amount).
/// Grows monotonically during a run; flushed to a JSON document at the end.
#[derive(Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Statistics {
    categories: BTreeMap<String, BTreeMap<String, u64>>,
}

impl Statistics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, category: &str, key: &str, amount: u64) {
        *self
            .categories
            .entry(category.to_string())
            .or_default()
            .entry(key.to_string())
            .or_insert(0) += amount;
    }

    pub fn record(&mut self, category: &str, key: &str) {
        self.add(category, key, 1);
    }

    pub fn get(&self, category: &str, key: &str) -> u64 {
        self.categories
            .get(category)
            .and_then(|keys| keys.get(key))
            .copied()
            .unwrap_or(0)
    }

    /// Replaces the aggregate with a previously saved file so an
    /// interrupted run resumes its counts without double counting.
    /// Missing or unreadable files yield an empty aggregate.
    pub fn load(path: &Path) -> Self {
        let data = match fs::read(path) {
            Ok(data) => data,
            Err(_) => return Self::new(),
        };
        match serde_json::from_slice(&data) {
            Ok(stats) => stats,
            Err(err) => {
                warn!(
                    "statistics file {} is unreadable ({}), starting empty",
                    path.display(),
                    err
                );
                Self::new()
            }
        }
    }

    pub fn save(&self, path: &Path) -> io::Result<()> {
        fs::write(path, serde_json::to_vec_pretty(self)?)
    }

    /// Per category, keys sorted by decreasing count.
    pub fn format(&self) -> String {
        let mut out = String::new();
        for (category, keys) in &self.categories {
            let _ = writeln!(out, "Category: {}", category);
            let mut entries: Vec<_> = keys.iter().collect();
            entries.sort_by(|a, b| b.1.cmp(a.1).then_with(|| a.0.cmp(b.0)));
            for (key, count) in entries {
                let _ = writeln!(out, "   {}: {}", key, count);
            }
            out.push('\n');
        }
        out
    }
}
