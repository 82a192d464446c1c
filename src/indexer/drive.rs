//! Document drive interface
//!
//! The coordinator never touches storage directly; it consumes this narrow
//! surface of the content-management layer. [`LocalDrive`] maps it onto a
//! plain directory for tests and single-node deployments.

use crate::error::{RagError, Result};
use std::io::Read;
use std::path::{Path, PathBuf};

pub trait Drive: Send + Sync {
    /// Drive-relative path (`cmspath`) for an absolute storage path.
    fn get_root_relative(&self, full_path: &Path) -> Result<String>;

    /// Absolute storage path for a drive-relative one.
    fn get_full_path(&self, cms_path: &str) -> Result<PathBuf>;

    /// Open a file for streaming reads.
    fn get_read_stream(&self, full_path: &Path) -> Result<Box<dyn Read + Send>>;

    /// Write a file under the drive root.
    fn write_file(&self, full_path: &Path, bytes: &[u8]) -> Result<()>;

    /// Size of a file in bytes, for the quota gate.
    fn file_size(&self, full_path: &Path) -> Result<u64>;
}

/// Drive over a local directory.
pub struct LocalDrive {
    root: PathBuf,
}

impl LocalDrive {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }
}

impl Drive for LocalDrive {
    fn get_root_relative(&self, full_path: &Path) -> Result<String> {
        let relative = full_path.strip_prefix(&self.root).map_err(|_| {
            RagError::Validation(format!(
                "{:?} is outside the drive root {:?}",
                full_path, self.root
            ))
        })?;
        Ok(format!("/{}", relative.to_string_lossy().replace('\\', "/")))
    }

    fn get_full_path(&self, cms_path: &str) -> Result<PathBuf> {
        Ok(self.root.join(cms_path.trim_start_matches('/')))
    }

    fn get_read_stream(&self, full_path: &Path) -> Result<Box<dyn Read + Send>> {
        let file = std::fs::File::open(full_path)?;
        Ok(Box::new(file))
    }

    fn write_file(&self, full_path: &Path, bytes: &[u8]) -> Result<()> {
        if let Some(parent) = full_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(full_path, bytes)?;
        Ok(())
    }

    fn file_size(&self, full_path: &Path) -> Result<u64> {
        Ok(std::fs::metadata(full_path)?.len())
    }
}
