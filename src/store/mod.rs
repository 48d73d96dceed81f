// Per-site key-value store with crash-safe rewrite.
//
// This is pure data: no locking, no transaction awareness. A `Site` binds
// one of these to a `LockManager` (see `transaction::site`).
//
// Persistence follows the atomic-write idiom used elsewhere in this crate's
// lineage (temp file in the same directory, `sync_all`, then `rename` over
// the primary path): a crash mid-write leaves either the old primary file
// or a stray `.tmp` file behind, never a half-written primary.

use std::collections::{BTreeMap, HashMap};
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::common::{default_value, VariableId};
use crate::error::{DbError, Result};

#[derive(Debug, Serialize, Deserialize)]
struct StoreFile {
    values: BTreeMap<VariableId, i64>,
}

/// Per-site committed value store.
#[derive(Debug)]
pub struct DatabaseStore {
    primary_path: PathBuf,
    tmp_path: PathBuf,
    values: HashMap<VariableId, i64>,
}

impl DatabaseStore {
    /// Opens (and recovers, if needed) the store for `site_index` under
    /// `data_dir`, hosting exactly `hosted_variables`.
    ///
    /// Recovery order: primary file if present; else the `.tmp` side file,
    /// which is also persisted back to the primary path; else defaults
    /// (`10 * variable`) written out as the initial primary file.
    pub fn open(site_index: u32, hosted_variables: &[VariableId], data_dir: &Path) -> Result<Self> {
        fs::create_dir_all(data_dir)?;
        let primary_path = data_dir.join(format!("site_{}.dat", site_index));
        let tmp_path = data_dir.join(format!("site_{}.tmp", site_index));

        let values = if primary_path.exists() {
            Self::read_file(&primary_path)?
        } else if tmp_path.exists() {
            let values = Self::read_file(&tmp_path)?;
            // `write_file` renames `tmp_path` onto `primary_path` itself;
            // the side file is already gone once this call returns.
            Self::write_file(&primary_path, &tmp_path, &values)?;
            values
        } else {
            let defaults: HashMap<VariableId, i64> = hosted_variables
                .iter()
                .map(|&v| (v, default_value(v)))
                .collect();
            Self::write_file(&primary_path, &tmp_path, &defaults)?;
            defaults
        };

        Ok(Self {
            primary_path,
            tmp_path,
            values,
        })
    }

    fn read_file(path: &Path) -> Result<HashMap<VariableId, i64>> {
        let contents = fs::read_to_string(path)?;
        let file: StoreFile = serde_json::from_str(&contents)?;
        Ok(file.values.into_iter().collect())
    }

    /// Writes `values` to `primary_path` atomically via a temp file in the
    /// same directory, `sync_all`, then `rename` over the target.
    fn write_file(
        primary_path: &Path,
        tmp_path: &Path,
        values: &HashMap<VariableId, i64>,
    ) -> Result<()> {
        let file = StoreFile {
            values: values.iter().map(|(&k, &v)| (k, v)).collect(),
        };
        let serialized = serde_json::to_string(&file)?;

        let mut handle = fs::File::create(tmp_path)?;
        handle.write_all(serialized.as_bytes())?;
        handle.sync_all()?;
        drop(handle);

        fs::rename(tmp_path, primary_path)?;
        Ok(())
    }

    fn flush(&self) -> Result<()> {
        Self::write_file(&self.primary_path, &self.tmp_path, &self.values)
    }

    /// Reads the committed value of `variable`, or `None` if this store
    /// does not host it.
    pub fn read(&self, variable: VariableId) -> Option<i64> {
        self.values.get(&variable).copied()
    }

    /// Writes all of `writes` atomically: if any variable is unknown to
    /// this store, nothing is mutated and `DbError::UnknownVariable` is
    /// returned.
    pub fn batch_write(&mut self, writes: &[(VariableId, i64)]) -> Result<()> {
        for &(variable, _) in writes {
            if !self.values.contains_key(&variable) {
                return Err(DbError::UnknownVariable(variable));
            }
        }
        for &(variable, value) in writes {
            self.values.insert(variable, value);
        }
        self.flush()
    }

    /// Returns a deep-copied, immutable snapshot of this store's current
    /// committed values, for use as a multiversion clone.
    pub fn snapshot(&self) -> HashMap<VariableId, i64> {
        self.values.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn fresh_directory_initializes_defaults() {
        let dir = TempDir::new().unwrap();
        let store = DatabaseStore::open(1, &[2, 4, 11], dir.path()).unwrap();

        assert_eq!(store.read(2), Some(20));
        assert_eq!(store.read(4), Some(40));
        assert_eq!(store.read(11), Some(110));
        assert!(dir.path().join("site_1.dat").exists());
    }

    #[test]
    fn batch_write_rejects_unknown_variable_without_mutating() {
        let dir = TempDir::new().unwrap();
        let mut store = DatabaseStore::open(1, &[2, 4], dir.path()).unwrap();

        let result = store.batch_write(&[(2, 999), (6, 1)]);
        assert!(result.is_err());
        assert_eq!(store.read(2), Some(20));
    }

    #[test]
    fn recovers_committed_values_across_reopen() {
        let dir = TempDir::new().unwrap();
        {
            let mut store = DatabaseStore::open(1, &[2, 4], dir.path()).unwrap();
            store.batch_write(&[(2, 99)]).unwrap();
        }
        let store = DatabaseStore::open(1, &[2, 4], dir.path()).unwrap();
        assert_eq!(store.read(2), Some(99));
    }

    #[test]
    fn recovers_from_stray_tmp_file() {
        let dir = TempDir::new().unwrap();
        let store = DatabaseStore::open(1, &[2, 4], dir.path()).unwrap();
        drop(store);

        let primary = dir.path().join("site_1.dat");
        let tmp = dir.path().join("site_1.tmp");
        fs::rename(&primary, &tmp).unwrap();
        assert!(!primary.exists());

        let store = DatabaseStore::open(1, &[2, 4], dir.path()).unwrap();
        assert_eq!(store.read(2), Some(20));
        assert!(primary.exists());
        assert!(!tmp.exists());
    }

    #[test]
    fn snapshot_is_independent_of_later_writes() {
        let dir = TempDir::new().unwrap();
        let mut store = DatabaseStore::open(1, &[2], dir.path()).unwrap();
        let snap = store.snapshot();
        store.batch_write(&[(2, 42)]).unwrap();

        assert_eq!(snap.get(&2), Some(&20));
        assert_eq!(store.read(2), Some(42));
    }
}
