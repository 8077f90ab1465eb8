//! Scoped filesystem access for backends without a file of their own.
//!
//! Content is materialized into a temporary file for the lifetime of the
//! provider. On close the file is compared against the stamp taken at
//! acquisition; if it changed, its bytes replace the container's content.

use std::fs::{self, File};
use std::io::{BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::time::SystemTime;

use tempfile::TempPath;
use tracing::{debug, warn};

use crate::container::{BlobContainer, FileProvider};
use crate::error::{Error, Result};

/// Modification time plus size, enough to notice an external rewrite.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FileStamp {
    pub modified: Option<SystemTime>,
    pub len: u64,
}

impl FileStamp {
    pub fn of(path: &Path) -> Result<Self> {
        let meta = fs::metadata(path).map_err(|e| Error::io("stat scoped file", e))?;
        Ok(Self {
            modified: meta.modified().ok(),
            len: meta.len(),
        })
    }
}

pub struct TempFileProvider<'a, T: BlobContainer + ?Sized> {
    container: &'a mut T,
    path: TempPath,
    stamp: FileStamp,
    released: bool,
}

impl<'a, T: BlobContainer + ?Sized> TempFileProvider<'a, T> {
    /// Materialize `container` into a file under the system temp directory.
    pub fn acquire(container: &'a mut T) -> Result<Self> {
        Self::acquire_in(container, &std::env::temp_dir())
    }

    pub fn acquire_in(container: &'a mut T, dir: &Path) -> Result<Self> {
        let file = tempfile::Builder::new()
            .prefix("blob")
            .suffix(".bdo")
            .tempfile_in(dir)
            .map_err(|e| Error::io("create scoped file", e))?;
        let (handle, path) = file.into_parts();
        let mut out = BufWriter::new(handle);
        container.write_to(&mut out)?;
        out.flush().map_err(|e| Error::io("flush scoped file", e))?;
        drop(out);

        let stamp = FileStamp::of(&path)?;
        debug!(kind = %container.kind(), path = %path.display(), len = stamp.len, "scoped file acquired");
        Ok(Self {
            container,
            path,
            stamp,
            released: false,
        })
    }

    fn release(&mut self) -> Result<()> {
        if self.released {
            return Ok(());
        }
        self.released = true;
        let now = FileStamp::of(&self.path)?;
        if now == self.stamp {
            return Ok(());
        }
        let file = File::open(&self.path).map_err(|e| Error::io("reopen scoped file", e))?;
        let copied = self
            .container
            .read_from(&mut BufReader::new(file), now.len)?;
        debug!(kind = %self.container.kind(), bytes = copied, "scoped file re-ingested");
        Ok(())
    }

    pub fn temp_path(&self) -> PathBuf {
        self.path.to_path_buf()
    }
}

impl<T: BlobContainer + ?Sized> FileProvider for TempFileProvider<'_, T> {
    fn path(&self) -> &Path {
        &self.path
    }

    fn close(mut self: Box<Self>) -> Result<()> {
        self.release()
    }
}

impl<T: BlobContainer + ?Sized> Drop for TempFileProvider<'_, T> {
    fn drop(&mut self) {
        if let Err(e) = self.release() {
            warn!(error = %e, path = %self.path.display(), "scoped file release failed");
        }
    }
}
