//! Persistence for the consensus-facing side of the node.
//!
//! A narrow byte-keyed [`Kv`] abstraction with two backends: a file-backed
//! store (one file per key, fsync on write, atomic tmp+rename) and an
//! in-memory store for tests. The typed compaction-chain schema lives in
//! [`consensus_db`].

pub mod consensus_db;

use parking_lot::RwLock;
use std::collections::HashMap;
use std::fs;
use std::io::{self, Write};
use std::path::PathBuf;
use tracing::warn;

pub trait Kv: Send + Sync {
    fn get(&self, key: &[u8]) -> Option<Vec<u8>>;
    fn put(&self, key: &[u8], value: &[u8]) -> io::Result<()>;
    fn has(&self, key: &[u8]) -> bool;
}

/// File-backed KV: each key becomes `<hex(key)>.bin` under the root
/// directory. Writes go through a tmp file, fsync, then rename.
pub struct FsKv {
    dir: PathBuf,
}

impl FsKv {
    pub fn open(root: impl Into<PathBuf>) -> io::Result<Self> {
        let dir = root.into();
        fs::create_dir_all(&dir)?;
        Ok(Self { dir })
    }

    fn path_for(&self, key: &[u8]) -> PathBuf {
        self.dir.join(format!("{}.bin", hex::encode(key)))
    }
}

impl Kv for FsKv {
    fn get(&self, key: &[u8]) -> Option<Vec<u8>> {
        match fs::read(self.path_for(key)) {
            Ok(bytes) => Some(bytes),
            Err(e) if e.kind() == io::ErrorKind::NotFound => None,
            Err(e) => {
                warn!(key = %hex::encode(key), "kv read failed: {e}");
                None
            }
        }
    }

    fn put(&self, key: &[u8], value: &[u8]) -> io::Result<()> {
        let path = self.path_for(key);
        let tmp = path.with_extension("tmp");
        {
            let mut f = fs::File::create(&tmp)?;
            f.write_all(value)?;
            f.sync_all()?;
        }
        fs::rename(&tmp, &path)
    }

    fn has(&self, key: &[u8]) -> bool {
        self.path_for(key).exists()
    }
}

/// In-memory KV for tests and ephemeral nodes.
#[derive(Default)]
pub struct MemKv {
    map: RwLock<HashMap<Vec<u8>, Vec<u8>>>,
}

impl MemKv {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Kv for MemKv {
    fn get(&self, key: &[u8]) -> Option<Vec<u8>> {
        self.map.read().get(key).cloned()
    }

    fn put(&self, key: &[u8], value: &[u8]) -> io::Result<()> {
        self.map.write().insert(key.to_vec(), value.to_vec());
        Ok(())
    }

    fn has(&self, key: &[u8]) -> bool {
        self.map.read().contains_key(key)
    }
}
