//! C1: content-addressed Blob Store.
//!
//! [`MemBlobStore`] is the reference backend every other crate's tests run
//! against. [`LocalFsBlobStore`] is the one on-disk backend this
//! implementation carries — the `blob_store_base_folder_path` store option
//! names it directly. Concrete object-bucket or wide-column backends are
//! out of scope; both ship here as proof the `BlobStore` contract is
//! implementable against more than one medium.

use dashmap::DashMap;
use sop_core::error::{classify_io_error, Result};
use sop_core::ids::PhysicalId;
use sop_core::traits::BlobStore;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::RwLock;

/// In-memory `BlobStore`, keyed by `(table, id)`.
#[derive(Debug, Default)]
pub struct MemBlobStore {
    blobs: DashMap<(String, PhysicalId), Vec<u8>>,
}

impl MemBlobStore {
    /// An empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of blobs currently held, across all tables.
    pub fn len(&self) -> usize {
        self.blobs.len()
    }

    /// True if no blobs are held.
    pub fn is_empty(&self) -> bool {
        self.blobs.is_empty()
    }
}

impl BlobStore for MemBlobStore {
    fn get(&self, table: &str, id: PhysicalId) -> Result<Option<Vec<u8>>> {
        Ok(self.blobs.get(&(table.to_string(), id)).map(|v| v.clone()))
    }

    fn put(&self, table: &str, id: PhysicalId, bytes: Vec<u8>) -> Result<()> {
        self.blobs.insert((table.to_string(), id), bytes);
        Ok(())
    }

    fn delete(&self, table: &str, id: PhysicalId) -> Result<()> {
        self.blobs.remove(&(table.to_string(), id));
        Ok(())
    }
}

/// Filesystem-backed `BlobStore`: one file per blob, under
/// `base_folder/table/<uuid>.blob`, written via write-to-temp-then-rename so
/// a crash mid-write never leaves a partial blob visible under its final
/// name.
#[derive(Debug)]
pub struct LocalFsBlobStore {
    base_folder: PathBuf,
    // Guards the mkdir-if-absent check on each table directory; the actual
    // file write is already atomic via rename, so this only protects the
    // directory-creation race.
    dir_lock: RwLock<()>,
}

impl LocalFsBlobStore {
    /// Open (creating if absent) a blob store rooted at `base_folder`.
    pub fn new(base_folder: impl Into<PathBuf>) -> Result<Self> {
        let base_folder = base_folder.into();
        fs::create_dir_all(&base_folder)?;
        Ok(LocalFsBlobStore {
            base_folder,
            dir_lock: RwLock::new(()),
        })
    }

    fn table_dir(&self, table: &str) -> PathBuf {
        self.base_folder.join(table)
    }

    fn blob_path(&self, table: &str, id: PhysicalId) -> PathBuf {
        self.table_dir(table).join(format!("{id}.blob"))
    }

    fn ensure_table_dir(&self, table: &str) -> io::Result<()> {
        let _guard = self.dir_lock.write().unwrap();
        fs::create_dir_all(self.table_dir(table))
    }
}

impl BlobStore for LocalFsBlobStore {
    fn get(&self, table: &str, id: PhysicalId) -> Result<Option<Vec<u8>>> {
        match fs::read(self.blob_path(table, id)) {
            Ok(bytes) => Ok(Some(bytes)),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(classify_io_error(e)),
        }
    }

    fn put(&self, table: &str, id: PhysicalId, bytes: Vec<u8>) -> Result<()> {
        self.ensure_table_dir(table)?;
        let final_path = self.blob_path(table, id);
        let tmp_path = final_path.with_extension("blob.tmp");
        fs::write(&tmp_path, &bytes)?;
        fs::rename(&tmp_path, &final_path)?;
        Ok(())
    }

    fn delete(&self, table: &str, id: PhysicalId) -> Result<()> {
        match fs::remove_file(self.blob_path(table, id)) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(classify_io_error(e)),
        }
    }
}

/// Convenience for callers that only ever need to know the directory a
/// store's blobs live under, without touching the filesystem.
pub fn table_dir_under(base_folder: &Path, table: &str) -> PathBuf {
    base_folder.join(table)
}
