//! Persistence contract for pooled entries

use crate::{PoolError, Result};
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

/// Storage backing a [`crate::ParameterPool`]
pub trait Persistence<T>: Send + Sync {
    /// Store an entry so it survives a restart
    fn save(&self, entry: &T) -> Result<()>;

    /// Remove the stored copy of an entry
    fn delete(&self, entry: &T) -> Result<()>;

    /// Load every stored entry, oldest first
    fn read_all(&self) -> Result<Vec<T>>;
}

/// An entry that can be stored as a single file
pub trait Persistable: Sized {
    /// Stable per-entry name. Names must sort in creation order.
    fn file_name(&self) -> String;

    /// Encode the entry
    fn to_bytes(&self) -> Result<Vec<u8>>;

    /// Decode an entry produced by [`Persistable::to_bytes`]
    fn from_bytes(bytes: &[u8]) -> Result<Self>;
}

const TEMP_SUFFIX: &str = ".tmp";

/// One file per entry in a single directory
#[derive(Debug, Clone)]
pub struct DirectoryPersistence {
    dir: PathBuf,
}

impl DirectoryPersistence {
    /// Open (and create if needed) the storage directory
    pub fn new(dir: impl Into<PathBuf>) -> Result<Self> {
        let dir = dir.into();
        fs::create_dir_all(&dir)?;
        Ok(Self { dir })
    }

    /// The storage directory
    pub fn dir(&self) -> &Path {
        &self.dir
    }
}

impl<T> Persistence<T> for DirectoryPersistence
where
    T: Persistable + Send + Sync,
{
    fn save(&self, entry: &T) -> Result<()> {
        let name = entry.file_name();
        let path = self.dir.join(&name);
        let temp_path = self.dir.join(format!("{name}{TEMP_SUFFIX}"));

        fs::write(&temp_path, entry.to_bytes()?)?;
        fs::rename(&temp_path, &path)?;

        debug!(file = %name, "Persisted pool entry");
        Ok(())
    }

    fn delete(&self, entry: &T) -> Result<()> {
        match fs::remove_file(self.dir.join(entry.file_name())) {
            Err(err) if err.kind() != ErrorKind::NotFound => Err(PoolError::Io(err)),
            _ => Ok(()),
        }
    }

    fn read_all(&self) -> Result<Vec<T>> {
        let mut names = Vec::new();
        for dir_entry in fs::read_dir(&self.dir)? {
            let dir_entry = dir_entry?;
            if !dir_entry.file_type()?.is_file() {
                continue;
            }
            let name = dir_entry.file_name().to_string_lossy().into_owned();
            if name.ends_with(TEMP_SUFFIX) {
                continue;
            }
            names.push(name);
        }
        names.sort();

        let mut entries = Vec::with_capacity(names.len());
        for name in names {
            let bytes = fs::read(self.dir.join(&name))?;
            match T::from_bytes(&bytes) {
                Ok(entry) => entries.push(entry),
                Err(err) => warn!(file = %name, %err, "Skipping unreadable pool entry"),
            }
        }

        Ok(entries)
    }
}

/// Persistence that keeps nothing; pools backed by it start empty
#[derive(Debug, Clone, Copy, Default)]
pub struct VolatilePersistence;

impl<T> Persistence<T> for VolatilePersistence {
    fn save(&self, _entry: &T) -> Result<()> {
        Ok(())
    }

    fn delete(&self, _entry: &T) -> Result<()> {
        Ok(())
    }

    fn read_all(&self) -> Result<Vec<T>> {
        Ok(Vec::new())
    }
}
