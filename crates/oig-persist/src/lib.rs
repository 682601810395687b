//! Mode & PRMS persistence (C9): crash-safe snapshots of the BOX's MODE and
//! its non-high-frequency `tbl_*` rows.
//!
//! Pure on-disk state, no network or bus awareness — the caller decides
//! when a snapshot is stale enough to re-publish. Loading fails safe: a
//! missing or unreadable file is just "no prior snapshot", never a hard
//! error. Writes are atomic write-then-rename: content lands fully on disk
//! under a temp name before it replaces the real file, so a crash mid-write
//! never leaves a half-written snapshot.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

/// `{ mode_value: int ∈ [0,5], device_id }`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModeSnapshot {
    pub mode_value: i64,
    pub device_id: String,
}

impl ModeSnapshot {
    pub fn is_valid_mode(value: i64) -> bool {
        (0..=5).contains(&value)
    }
}

/// table name -> item name -> raw (pre-coercion) value, for `tbl_*` tables
/// other than `tbl_actual`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PrmsSnapshot {
    pub tables: BTreeMap<String, BTreeMap<String, String>>,
}

impl PrmsSnapshot {
    pub fn is_eligible_table(table: &str) -> bool {
        table.starts_with("tbl_") && table != "tbl_actual"
    }

    /// Merges newly observed `(item, raw_value)` pairs into `table`'s row.
    pub fn merge(&mut self, table: &str, fields: impl IntoIterator<Item = (String, String)>) {
        let row = self.tables.entry(table.to_string()).or_default();
        for (item, value) in fields {
            row.insert(item, value);
        }
    }
}

/// Owns the two snapshot files under `data_dir`.
pub struct SnapshotStore {
    mode_path: PathBuf,
    prms_path: PathBuf,
}

impl SnapshotStore {
    pub fn new(data_dir: impl AsRef<Path>) -> Self {
        let data_dir = data_dir.as_ref();
        Self {
            mode_path: data_dir.join("mode_snapshot.json"),
            prms_path: data_dir.join("prms_snapshot.json"),
        }
    }

    pub fn load_mode(&self) -> Option<ModeSnapshot> {
        load_json(&self.mode_path)
    }

    pub fn load_prms(&self) -> Option<PrmsSnapshot> {
        load_json(&self.prms_path)
    }

    pub fn save_mode(&self, snapshot: &ModeSnapshot) -> Result<()> {
        atomic_write_json(&self.mode_path, snapshot)
    }

    pub fn save_prms(&self, snapshot: &PrmsSnapshot) -> Result<()> {
        atomic_write_json(&self.prms_path, snapshot)
    }
}

fn load_json<T: for<'de> Deserialize<'de>>(path: &Path) -> Option<T> {
    let bytes = std::fs::read(path).ok()?;
    match serde_json::from_slice(&bytes) {
        Ok(value) => Some(value),
        Err(e) => {
            tracing::warn!(path = %path.display(), error = %e, "ignoring corrupt snapshot file");
            None
        }
    }
}

fn atomic_write_json<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent).context("creating snapshot directory")?;
        }
    }
    let tmp_path = path.with_extension("tmp");
    let body = serde_json::to_vec_pretty(value).context("serializing snapshot")?;
    std::fs::write(&tmp_path, &body).context("writing snapshot temp file")?;
    std::fs::rename(&tmp_path, path).context("renaming snapshot temp file into place")?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn mode_round_trips_through_disk() {
        let dir = tempdir().unwrap();
        let store = SnapshotStore::new(dir.path());
        assert!(store.load_mode().is_none());

        let snap = ModeSnapshot { mode_value: 3, device_id: "123".into() };
        store.save_mode(&snap).unwrap();
        assert_eq!(store.load_mode(), Some(snap));
    }

    #[test]
    fn writing_same_mode_snapshot_twice_is_byte_identical() {
        let dir = tempdir().unwrap();
        let store = SnapshotStore::new(dir.path());
        let snap = ModeSnapshot { mode_value: 2, device_id: "abc".into() };
        store.save_mode(&snap).unwrap();
        let first = std::fs::read(dir.path().join("mode_snapshot.json")).unwrap();
        store.save_mode(&snap).unwrap();
        let second = std::fs::read(dir.path().join("mode_snapshot.json")).unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn mode_value_bounds_are_checked_by_caller_helper() {
        assert!(ModeSnapshot::is_valid_mode(0));
        assert!(ModeSnapshot::is_valid_mode(5));
        assert!(!ModeSnapshot::is_valid_mode(6));
        assert!(!ModeSnapshot::is_valid_mode(-1));
    }

    #[test]
    fn prms_merge_is_additive_per_table() {
        let mut snap = PrmsSnapshot::default();
        snap.merge("tbl_box_prms", [("SA".to_string(), "1".to_string())]);
        snap.merge("tbl_box_prms", [("MODE".to_string(), "3".to_string())]);
        let row = &snap.tables["tbl_box_prms"];
        assert_eq!(row.get("SA"), Some(&"1".to_string()));
        assert_eq!(row.get("MODE"), Some(&"3".to_string()));
    }

    #[test]
    fn tbl_actual_is_not_eligible_for_prms_persistence() {
        assert!(!PrmsSnapshot::is_eligible_table("tbl_actual"));
        assert!(PrmsSnapshot::is_eligible_table("tbl_box_prms"));
        assert!(!PrmsSnapshot::is_eligible_table("IsNewSet"));
    }

    #[test]
    fn corrupt_snapshot_file_is_treated_as_absent() {
        let dir = tempdir().unwrap();
        std::fs::write(dir.path().join("mode_snapshot.json"), b"not json").unwrap();
        let store = SnapshotStore::new(dir.path());
        assert!(store.load_mode().is_none());
    }

    #[test]
    fn prms_round_trips_through_disk() {
        let dir = tempdir().unwrap();
        let store = SnapshotStore::new(dir.path());
        let mut snap = PrmsSnapshot::default();
        snap.merge("tbl_box_prms", [("MODE".to_string(), "3".to_string())]);
        store.save_prms(&snap).unwrap();
        assert_eq!(store.load_prms(), Some(snap));
    }
}
