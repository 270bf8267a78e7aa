//! Persisted operator -> kernel-implementation choices. Written after a
//! tuning pass, read at start-up by serving runs so production never pays
//! the benchmark cost again.

use anyhow::{Context, Result};
use log::info;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableEntry {
    pub kernel_impl: String,
    #[serde(default)]
    pub attrs: BTreeMap<String, String>,
}

#[derive(Debug, Default, Serialize, Deserialize)]
pub struct DispatchTable {
    entries: BTreeMap<String, TableEntry>,
}

impl DispatchTable {
    /// Load the table if the file exists. Absence is not an error, only a
    /// performance recommendation.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        if !path.exists() {
            info!(
                "Missing dispatch table file {}, all operators will use their default kernels. \
                 Recommend a tuning run for better performance.",
                path.display()
            );
            return Ok(Self::default());
        }
        let raw = fs::read_to_string(path)
            .with_context(|| format!("read dispatch table {}", path.display()))?;
        serde_json::from_str(&raw)
            .with_context(|| format!("parse dispatch table {}", path.display()))
    }

    /// Atomic replace: serialize next to the target, then rename over it.
    /// A reader never observes a partially written table.
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        if let Some(dir) = path.parent() {
            if !dir.as_os_str().is_empty() {
                fs::create_dir_all(dir)?;
            }
        }
        let tmp = path.with_extension("tmp");
        fs::write(&tmp, serde_json::to_string_pretty(&self)?)
            .with_context(|| format!("write dispatch table {}", tmp.display()))?;
        fs::rename(&tmp, path)
            .with_context(|| format!("replace dispatch table {}", path.display()))?;
        Ok(())
    }

    pub fn get(&self, key: &str) -> Option<&TableEntry> {
        self.entries.get(key)
    }

    /// Append-or-overwrite keyed by operator identity.
    pub fn insert(&mut self, key: String, entry: TableEntry) {
        self.entries.insert(key, entry);
    }

    pub fn entries(&self) -> impl Iterator<Item = (&String, &TableEntry)> {
        self.entries.iter()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    static SEQ: AtomicU32 = AtomicU32::new(0);

    fn temp_path() -> std::path::PathBuf {
        std::env::temp_dir().join(format!(
            "qnn_rs_table_{}_{}.json",
            std::process::id(),
            SEQ.fetch_add(1, Ordering::Relaxed)
        ))
    }

    #[test]
    fn test_missing_file_is_empty_table() {
        let table = DispatchTable::load(temp_path()).unwrap();
        assert!(table.is_empty());
    }

    #[test]
    fn test_save_load_roundtrip() {
        let path = temp_path();
        let mut table = DispatchTable::default();
        table.insert(
            "mha|2x8x4x16".to_string(),
            TableEntry {
                kernel_impl: "mha_dense_blocked".to_string(),
                attrs: [("QK_rescale".to_string(), "0.5".to_string())].into(),
            },
        );
        table.save(&path).unwrap();
        let loaded = DispatchTable::load(&path).unwrap();
        assert_eq!(loaded.len(), 1);
        assert_eq!(
            loaded.get("mha|2x8x4x16").unwrap().kernel_impl,
            "mha_dense_blocked"
        );
        std::fs::remove_file(&path).unwrap();
    }

    #[test]
    fn test_insert_overwrites_by_key() {
        let mut table = DispatchTable::default();
        let entry = |name: &str| TableEntry {
            kernel_impl: name.to_string(),
            attrs: BTreeMap::new(),
        };
        table.insert("op|1".to_string(), entry("a"));
        table.insert("op|1".to_string(), entry("b"));
        assert_eq!(table.len(), 1);
        assert_eq!(table.get("op|1").unwrap().kernel_impl, "b");
    }
}
