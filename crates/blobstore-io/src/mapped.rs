//! Memory-mapped views of a disk backend's file.

use std::fs::File;

use memmap2::MmapMut;

use blobstore_core::{Error, Result};

/// Map `file` read/write.
///
/// The file is a private temp file owned by one disk backend, and the
/// returned view borrows that backend mutably for its whole lifetime, so no
/// other access path can resize the file underneath the mapping.
pub(crate) fn map_file(file: &File) -> Result<MmapMut> {
    // SAFETY: see above; the caller holds exclusive access to the file.
    unsafe { MmapMut::map_mut(file) }.map_err(|e| Error::io("map backing file", e))
}
