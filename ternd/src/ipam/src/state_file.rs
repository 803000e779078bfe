use std::collections::BTreeMap;
use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use super::error::Error;
use super::record::IpConfigRecord;

pub const STATE_FILE_VERSION: u64 = 1;

#[derive(Debug, Serialize, Deserialize)]
struct StateFile {
    version: u64,
    records: BTreeMap<String, IpConfigRecord>,
}

/// Guards the state file against concurrent writers from other processes.
/// The lock is scoped to a single load or save; it is never held across
/// network or host-system calls.
pub trait ProcessLock {
    fn acquire(&mut self) -> Result<(), Error>;
    fn release(&mut self) -> Result<(), Error>;
}

/// Pid-file lock next to the state file.
#[derive(Debug)]
pub struct FileLock {
    path: PathBuf,
    file: Option<File>,
    acquired: bool,
}

impl FileLock {
    pub fn new(path: &Path) -> Result<FileLock, Error> {
        if path.as_os_str().is_empty() {
            return Err(Error::EmptyLockPath);
        }
        if let Some(dir) = path.parent() {
            fs::create_dir_all(dir)?;
        }
        Ok(FileLock {
            path: path.to_path_buf(),
            file: None,
            acquired: false,
        })
    }
}

impl ProcessLock for FileLock {
    fn acquire(&mut self) -> Result<(), Error> {
        let mut file = File::create(&self.path)?;
        file.write_all(std::process::id().to_string().as_bytes())?;
        self.file = Some(file);
        self.acquired = true;
        Ok(())
    }

    // Releasing an already-released lock succeeds; only a release with no
    // acquire ever having happened is an error.
    fn release(&mut self) -> Result<(), Error> {
        if !self.acquired {
            return Err(Error::LockNotHeld);
        }
        drop(self.file.take());
        Ok(())
    }
}

/// Writes the full record snapshot to `path` under the lock.
pub fn save(
    path: &Path,
    records: impl IntoIterator<Item = IpConfigRecord>,
    lock: &mut dyn ProcessLock,
) -> Result<(), Error> {
    let state = StateFile {
        version: STATE_FILE_VERSION,
        records: records
            .into_iter()
            .map(|r| (r.id.clone(), r))
            .collect::<BTreeMap<String, IpConfigRecord>>(),
    };
    let raw = serde_json::to_vec_pretty(&state).map_err(Error::Serialization)?;

    lock.acquire()?;
    let result = write_atomically(path, &raw);
    lock.release()?;
    result
}

/// Reads the record snapshot back. A missing file is an empty store.
pub fn load(path: &Path, lock: &mut dyn ProcessLock) -> Result<Vec<IpConfigRecord>, Error> {
    lock.acquire()?;
    let raw = match fs::read(path) {
        Ok(raw) => raw,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            lock.release()?;
            return Ok(Vec::new());
        }
        Err(e) => {
            lock.release()?;
            return Err(Error::StdIo(e));
        }
    };
    lock.release()?;

    let state: StateFile = serde_json::from_slice(&raw).map_err(Error::Serialization)?;
    if state.version > STATE_FILE_VERSION {
        return Err(Error::UnsupportedStateVersion(state.version));
    }
    Ok(state.records.into_values().collect())
}

fn write_atomically(path: &Path, raw: &[u8]) -> Result<(), Error> {
    if let Some(dir) = path.parent() {
        fs::create_dir_all(dir)?;
    }
    let tmp = path.with_extension("tmp");
    fs::write(&tmp, raw)?;
    fs::rename(&tmp, path)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::{IpState, PodInfo};

    fn records() -> Vec<IpConfigRecord> {
        vec![
            IpConfigRecord {
                nc_id: "nc-1".to_string(),
                id: "aaa-1".to_string(),
                ip_address: "10.240.0.4".to_string(),
                state: IpState::Allocated,
                pod_info: Some(PodInfo::new("test-namespace", "test-pod")),
            },
            IpConfigRecord::pending("nc-1", "bbb-2", "10.240.0.5"),
        ]
    }

    #[test]
    fn works_save_and_load_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ip-state.json");
        let mut lock = FileLock::new(&dir.path().join("state.lock")).unwrap();

        save(&path, records(), &mut lock).unwrap();
        let loaded = load(&path, &mut lock).unwrap();
        assert_eq!(loaded, records());
    }

    #[test]
    fn works_load_missing_file_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        let mut lock = FileLock::new(&dir.path().join("state.lock")).unwrap();
        let loaded = load(&dir.path().join("missing.json"), &mut lock).unwrap();
        assert!(loaded.is_empty());
    }

    #[test]
    fn fails_load_unsupported_version() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state.json");
        fs::write(&path, r#"{"version": 99, "records": {}}"#).unwrap();
        let mut lock = FileLock::new(&dir.path().join("state.lock")).unwrap();
        let err = load(&path, &mut lock).unwrap_err();
        assert!(matches!(err, Error::UnsupportedStateVersion(99)));
    }

    #[test]
    fn fails_release_without_acquire() {
        let dir = tempfile::tempdir().unwrap();
        let mut lock = FileLock::new(&dir.path().join("state.lock")).unwrap();
        assert!(matches!(lock.release(), Err(Error::LockNotHeld)));
    }

    #[test]
    fn works_release_of_released_lock() {
        let dir = tempfile::tempdir().unwrap();
        let mut lock = FileLock::new(&dir.path().join("state.lock")).unwrap();
        lock.acquire().unwrap();
        lock.release().unwrap();
        // releasing again must not error for an already released lock
        lock.release().unwrap();
    }

    #[test]
    fn works_lock_reuse_across_save_cycles() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ip-state.json");
        let mut lock = FileLock::new(&dir.path().join("state.lock")).unwrap();

        save(&path, records(), &mut lock).unwrap();
        save(&path, records(), &mut lock).unwrap();
        let loaded = load(&path, &mut lock).unwrap();
        assert_eq!(loaded, records());
    }
}
