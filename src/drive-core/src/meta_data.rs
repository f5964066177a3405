use chunk_store::ChunkId;
use self_encrypt::DataMap;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::{SystemTime, UNIX_EPOCH};

pub(crate) fn unix_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

const BLOCK_SIZE: u64 = 512;

/// Stable identity of a directory. Matches the entry in its parent's
/// metadata; shares the chunk-id key space so it can key the version
/// chain directly.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DirectoryId(ChunkId);

impl DirectoryId {
    pub fn random() -> Self {
        Self(ChunkId::random())
    }

    pub fn as_str(&self) -> &str {
        self.0.as_str()
    }
}

impl fmt::Display for DirectoryId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Identity of the parent directory. Reconstructed by the resolver from
/// context and deliberately never serialized.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParentId(pub DirectoryId);

/// What a child entry points at: file content via its data map, or a
/// subdirectory via its identity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum FileTarget {
    File { data_map: DataMap },
    Directory { directory_id: DirectoryId },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetaData {
    pub name: String,
    pub created_at: u64,
    pub modified_at: u64,
    pub size: u64,
    pub blocks: u64,
    pub target: FileTarget,
}

impl MetaData {
    pub fn new_file(name: impl Into<String>) -> Self {
        let now = unix_millis();
        Self {
            name: name.into(),
            created_at: now,
            modified_at: now,
            size: 0,
            blocks: 0,
            target: FileTarget::File {
                data_map: DataMap::default(),
            },
        }
    }

    pub fn new_directory(name: impl Into<String>) -> Self {
        let now = unix_millis();
        Self {
            name: name.into(),
            created_at: now,
            modified_at: now,
            size: 0,
            blocks: 0,
            target: FileTarget::Directory {
                directory_id: DirectoryId::random(),
            },
        }
    }

    pub fn is_directory(&self) -> bool {
        matches!(self.target, FileTarget::Directory { .. })
    }

    pub fn directory_id(&self) -> Option<&DirectoryId> {
        match &self.target {
            FileTarget::Directory { directory_id } => Some(directory_id),
            FileTarget::File { .. } => None,
        }
    }

    pub fn data_map(&self) -> Option<&DataMap> {
        match &self.target {
            FileTarget::File { data_map } => Some(data_map),
            FileTarget::Directory { .. } => None,
        }
    }

    pub(crate) fn set_data_map(&mut self, new_map: DataMap) {
        if let FileTarget::File { data_map } = &mut self.target {
            *data_map = new_map;
        }
    }

    /// Grow the recorded size to at least `size` and touch the
    /// modification time.
    pub(crate) fn update_size(&mut self, size: u64) {
        self.size = self.size.max(size);
        self.blocks = self.size / BLOCK_SIZE;
        self.modified_at = unix_millis();
    }
}
