use std::fmt;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use sha1::{Digest, Sha1};

/// Bytes moved between checkpoint writes while a range is in flight.
pub const RESTART_FILE_UPDATE_SIZE: u64 = 32 * 1024 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum RestartType {
    Put,
    Get,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum RestartStatus {
    #[default]
    On,
    Off,
}

/// Key for a checkpoint: who, which remote path, which direction.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct FileRestartInfoIdentifier {
    pub account_identifier: String,
    pub absolute_path: String,
    pub restart_type: RestartType,
}

impl FileRestartInfoIdentifier {
    pub fn new(
        account_identifier: impl Into<String>,
        absolute_path: impl Into<String>,
        restart_type: RestartType,
    ) -> Self {
        Self {
            account_identifier: account_identifier.into(),
            absolute_path: absolute_path.into(),
            restart_type,
        }
    }

    /// Stable, filesystem-safe name derived from the identifier.
    pub fn storage_key(&self) -> String {
        let mut hasher = Sha1::new();
        hasher.update(self.account_identifier.as_bytes());
        hasher.update([0u8]);
        hasher.update(self.absolute_path.as_bytes());
        hasher.update([0u8]);
        hasher.update(match self.restart_type {
            RestartType::Put => b"PUT".as_slice(),
            RestartType::Get => b"GET".as_slice(),
        });
        hasher
            .finalize()
            .iter()
            .map(|byte| format!("{byte:02x}"))
            .collect()
    }
}

impl fmt::Display for FileRestartInfoIdentifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{:?} {} ({})",
            self.restart_type, self.absolute_path, self.account_identifier
        )
    }
}

/// A confirmed `(offset, length)` range. Segments created up front carry the
/// worker thread number as their index.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileRestartDataSegment {
    pub thread_number: usize,
    pub offset: u64,
    pub length: u64,
}

impl FileRestartDataSegment {
    pub fn new(thread_number: usize) -> Self {
        Self {
            thread_number,
            offset: 0,
            length: 0,
        }
    }

    pub fn end(&self) -> u64 {
        self.offset + self.length
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileRestartInfo {
    pub account_identifier: String,
    pub irods_absolute_path: String,
    pub local_absolute_path: PathBuf,
    pub file_size: u64,
    pub restart_type: RestartType,
    #[serde(default)]
    pub status: RestartStatus,
    #[serde(default)]
    pub restart_attempts: u32,
    #[serde(default)]
    pub segments: Vec<FileRestartDataSegment>,
}

impl FileRestartInfo {
    /// New record with one empty segment per worker thread.
    pub fn new(
        identifier: &FileRestartInfoIdentifier,
        local_absolute_path: impl Into<PathBuf>,
        file_size: u64,
        number_of_threads: usize,
    ) -> Self {
        Self {
            account_identifier: identifier.account_identifier.clone(),
            irods_absolute_path: identifier.absolute_path.clone(),
            local_absolute_path: local_absolute_path.into(),
            file_size,
            restart_type: identifier.restart_type,
            status: RestartStatus::On,
            restart_attempts: 0,
            segments: (0..number_of_threads).map(FileRestartDataSegment::new).collect(),
        }
    }

    pub fn identifier(&self) -> FileRestartInfoIdentifier {
        FileRestartInfoIdentifier::new(
            self.account_identifier.clone(),
            self.irods_absolute_path.clone(),
            self.restart_type,
        )
    }

    /// Sum of confirmed lengths; overlapping records make this an upper bound.
    pub fn estimate_length_so_far(&self) -> u64 {
        self.segments.iter().map(|segment| segment.length).sum()
    }

    pub fn segments_by_offset(&self) -> Vec<FileRestartDataSegment> {
        let mut segments = self.segments.clone();
        segments.sort_by_key(|segment| (segment.offset, segment.length));
        segments
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::hash_map::DefaultHasher;
    use std::hash::{Hash, Hasher};

    fn hash_of(id: &FileRestartInfoIdentifier) -> u64 {
        let mut hasher = DefaultHasher::new();
        id.hash(&mut hasher);
        hasher.finish()
    }

    #[test]
    fn identifiers_compare_by_value() {
        let a = FileRestartInfoIdentifier::new("rods@zone", "/zone/home/rods/big.dat", RestartType::Put);
        let b = FileRestartInfoIdentifier::new(
            String::from("rods@zone"),
            String::from("/zone/home/rods/big.dat"),
            RestartType::Put,
        );
        assert_eq!(a, b);
        assert_eq!(hash_of(&a), hash_of(&b));
        assert_eq!(a.storage_key(), b.storage_key());

        let get = FileRestartInfoIdentifier::new("rods@zone", "/zone/home/rods/big.dat", RestartType::Get);
        assert_ne!(a, get);
        assert_ne!(a.storage_key(), get.storage_key());
    }

    #[test]
    fn storage_key_is_hex() {
        let id = FileRestartInfoIdentifier::new("a", "/x/../y", RestartType::Get);
        let key = id.storage_key();
        assert_eq!(key.len(), 40);
        assert!(key.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn new_info_has_segment_per_thread() {
        let id = FileRestartInfoIdentifier::new("a", "/p", RestartType::Put);
        let info = FileRestartInfo::new(&id, "/tmp/p", 100, 3);
        assert_eq!(info.segments.len(), 3);
        assert_eq!(info.segments[2].thread_number, 2);
        assert_eq!(info.identifier(), id);
        assert_eq!(info.estimate_length_so_far(), 0);
    }

    #[test]
    fn record_json_round_trip() {
        let id = FileRestartInfoIdentifier::new("a", "/p", RestartType::Get);
        let mut info = FileRestartInfo::new(&id, "/tmp/p", 100, 2);
        info.segments[1].offset = 50;
        info.segments[1].length = 20;
        let json = serde_json::to_string(&info).unwrap();
        assert!(json.contains("\"GET\""));
        let back: FileRestartInfo = serde_json::from_str(&json).unwrap();
        assert_eq!(back, info);
    }
}
