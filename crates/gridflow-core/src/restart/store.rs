//! File-backed checkpoint store: one JSON document per identifier.

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use parking_lot::Mutex;

use super::info::{FileRestartInfo, FileRestartInfoIdentifier};
use super::manager::RestartManager;
use crate::errors::{RestartFault, RestartResult};

const RECORD_EXTENSION: &str = "json";

pub struct FileRestartManager {
    dir: PathBuf,
    // Serializes read-modify-write cycles within this process.
    lock: Mutex<()>,
}

impl FileRestartManager {
    pub fn new(dir: impl Into<PathBuf>) -> RestartResult<Self> {
        let dir = dir.into();
        fs::create_dir_all(&dir)
            .map_err(|err| RestartFault::store(format!("creating restart dir {}", dir.display()), err))?;
        Ok(Self {
            dir,
            lock: Mutex::new(()),
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Every readable record in the store. Unparseable files are skipped.
    pub fn list(&self) -> RestartResult<Vec<FileRestartInfo>> {
        let _guard = self.lock.lock();
        let entries = fs::read_dir(&self.dir)
            .map_err(|err| RestartFault::store(format!("listing {}", self.dir.display()), err))?;

        let mut records = Vec::new();
        for entry in entries {
            let entry = entry.map_err(|err| RestartFault::store("reading restart dir entry", err))?;
            let path = entry.path();
            if path.extension().and_then(|ext| ext.to_str()) != Some(RECORD_EXTENSION) {
                continue;
            }
            match read_record(&path) {
                Ok(Some(info)) => records.push(info),
                Ok(None) => {}
                Err(err) => log::warn!("skipping unreadable restart record {}: {}", path.display(), err),
            }
        }
        records.sort_by(|a, b| a.irods_absolute_path.cmp(&b.irods_absolute_path));
        Ok(records)
    }

    /// Remove every record; returns how many were deleted.
    pub fn clear(&self) -> RestartResult<usize> {
        let records = self.list()?;
        for info in &records {
            self.delete_restart(&info.identifier())?;
        }
        Ok(records.len())
    }

    fn path_for(&self, id: &FileRestartInfoIdentifier) -> PathBuf {
        self.dir.join(format!("{}.{}", id.storage_key(), RECORD_EXTENSION))
    }

    fn write_record(&self, info: &FileRestartInfo) -> RestartResult<FileRestartInfoIdentifier> {
        let id = info.identifier();
        let path = self.path_for(&id);
        let tmp = path.with_extension("json.tmp");
        let body = serde_json::to_vec_pretty(info)?;

        let mut file = fs::File::create(&tmp)
            .map_err(|err| RestartFault::store(format!("creating {}", tmp.display()), err))?;
        file.write_all(&body)
            .and_then(|_| file.sync_all())
            .map_err(|err| RestartFault::store(format!("writing {}", tmp.display()), err))?;
        drop(file);
        fs::rename(&tmp, &path)
            .map_err(|err| RestartFault::store(format!("renaming into {}", path.display()), err))?;
        log::trace!("stored restart record {} at {}", id, path.display());
        Ok(id)
    }
}

fn read_record(path: &Path) -> RestartResult<Option<FileRestartInfo>> {
    let body = match fs::read(path) {
        Ok(body) => body,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(err) => return Err(RestartFault::store(format!("reading {}", path.display()), err)),
    };
    Ok(Some(serde_json::from_slice(&body)?))
}

impl RestartManager for FileRestartManager {
    fn retrieve_restart(&self, id: &FileRestartInfoIdentifier) -> RestartResult<Option<FileRestartInfo>> {
        let _guard = self.lock.lock();
        read_record(&self.path_for(id))
    }

    fn store_restart(&self, info: &FileRestartInfo) -> RestartResult<FileRestartInfoIdentifier> {
        let _guard = self.lock.lock();
        self.write_record(info)
    }

    fn delete_restart(&self, id: &FileRestartInfoIdentifier) -> RestartResult<()> {
        let _guard = self.lock.lock();
        let path = self.path_for(id);
        match fs::remove_file(&path) {
            Ok(()) => {
                log::debug!("removed restart record {}", id);
                Ok(())
            }
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(RestartFault::store(format!("removing {}", path.display()), err)),
        }
    }

    fn retrieve_or_insert(&self, info: FileRestartInfo) -> RestartResult<FileRestartInfo> {
        let _guard = self.lock.lock();
        if let Some(existing) = read_record(&self.path_for(&info.identifier()))? {
            return Ok(existing);
        }
        log::info!("no restart saved for {}, storing a new one", info.identifier());
        self.write_record(&info)?;
        Ok(info)
    }

    fn update_restart(
        &self,
        id: &FileRestartInfoIdentifier,
        update: &mut dyn FnMut(&mut FileRestartInfo) -> RestartResult<()>,
    ) -> RestartResult<FileRestartInfo> {
        let _guard = self.lock.lock();
        let mut info = read_record(&self.path_for(id))?.ok_or(RestartFault::NotFound)?;
        update(&mut info)?;
        self.write_record(&info)?;
        Ok(info)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::restart::info::RestartType;
    use tempfile::tempdir;

    #[test]
    fn records_survive_a_new_manager() {
        let dir = tempdir().unwrap();
        let id = FileRestartInfoIdentifier::new("rods#zone", "/zone/home/rods/a", RestartType::Get);
        {
            let manager = FileRestartManager::new(dir.path()).unwrap();
            manager.retrieve_or_create(&id, Path::new("/tmp/a"), 1000, 2).unwrap();
            manager.update_offset_for_segment(&id, 1, 500).unwrap();
            manager.update_length_for_segment(&id, 1, 128).unwrap();
        }

        let manager = FileRestartManager::new(dir.path()).unwrap();
        let info = manager.retrieve_restart(&id).unwrap().unwrap();
        assert_eq!(info.file_size, 1000);
        assert_eq!(info.segments[1].offset, 500);
        assert_eq!(info.segments[1].length, 128);
        assert_eq!(manager.list().unwrap().len(), 1);
    }

    #[test]
    fn delete_and_clear() {
        let dir = tempdir().unwrap();
        let manager = FileRestartManager::new(dir.path().join("nested")).unwrap();
        for name in ["/a", "/b", "/c"] {
            let id = FileRestartInfoIdentifier::new("u", name, RestartType::Put);
            manager.retrieve_or_create(&id, Path::new(name), 1, 1).unwrap();
        }
        let id = FileRestartInfoIdentifier::new("u", "/a", RestartType::Put);
        manager.delete_restart(&id).unwrap();
        assert!(manager.retrieve_restart(&id).unwrap().is_none());
        assert_eq!(manager.clear().unwrap(), 2);
        assert!(manager.list().unwrap().is_empty());
    }

    #[test]
    fn corrupt_record_is_skipped_by_list() {
        let dir = tempdir().unwrap();
        let manager = FileRestartManager::new(dir.path()).unwrap();
        std::fs::write(dir.path().join("garbage.json"), b"{not json").unwrap();
        assert!(manager.list().unwrap().is_empty());
    }
}
