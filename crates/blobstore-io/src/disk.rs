//! Disk Backend: one temp file per instance.
//!
//! Writes go straight to the file. A best-effort copy of the full content may
//! be kept in the shared [`DiskCache`]; it is invalidated on every write,
//! whenever raw file access is handed out, and when a scoped file comes back
//! modified. The file is deleted exactly once by the disk [`Reclaimer`]: when
//! the backend is dropped (by the reaper if one runs), or by the shutdown
//! sweep.

use std::fs::{self, File, OpenOptions};
use std::io::{self, BufReader, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use blake3::Hasher;
use once_cell::sync::Lazy;
use tracing::{debug, trace};

use blobstore_core::config::ADDRESSABLE_LIMIT;
use blobstore_core::container::copy_content;
use blobstore_core::prelude::*;
use blobstore_core::{ChannelHook, DiskConfig};
use blobstore_mem::monitor::{self, LiveStats};
use blobstore_mem::reclaim::{Reclaim, ReclaimHandle, Reclaimer};

use crate::cache::DiskCache;
use crate::mapped::map_file;

static RECLAIMER: Lazy<Reclaimer<DiskFile>> = Lazy::new(|| Reclaimer::new("disk"));

static NEXT_ID: AtomicU64 = AtomicU64::new(1);

/// Process-wide reclaimer for disk backends.
pub fn reclaimer() -> &'static Reclaimer<DiskFile> {
    &RECLAIMER
}

/// The reclaimable part of a disk backend: its file path.
#[derive(Debug)]
pub struct DiskFile {
    path: PathBuf,
    released: AtomicBool,
}

impl DiskFile {
    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn is_released(&self) -> bool {
        self.released.load(Ordering::Acquire)
    }
}

impl Reclaim for DiskFile {
    fn release(&self) -> Result<()> {
        if self.released.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        fs::remove_file(&self.path).map_err(|e| Error::io("delete backing file", e))
    }

    fn describe(&self) -> String {
        self.path.display().to_string()
    }
}

/// Pseudo-etag over size, mtime and path; changes when the file is rewritten.
pub fn file_etag(path: &Path) -> Result<String> {
    let meta = fs::metadata(path).map_err(|e| Error::io("stat backing file", e))?;
    let mut h = Hasher::new();
    h.update(&meta.len().to_le_bytes());
    if let Ok(m) = meta.modified() {
        if let Ok(d) = m.duration_since(std::time::SystemTime::UNIX_EPOCH) {
            h.update(&d.as_secs().to_le_bytes());
            h.update(&d.subsec_nanos().to_le_bytes());
        }
    }
    h.update(path.as_os_str().to_string_lossy().as_bytes());
    Ok(h.finalize().to_hex().to_string())
}

#[derive(Debug)]
struct FileState {
    file: File,
    length: u64,
}

impl FileState {
    fn read_at(&mut self, position: u64, dst: &mut [u8]) -> Result<usize> {
        if position >= self.length || dst.is_empty() {
            return Ok(0);
        }
        let want = (self.length - position).min(dst.len() as u64) as usize;
        self.file
            .seek(SeekFrom::Start(position))
            .map_err(|e| Error::io("seek backing file", e))?;
        let mut done = 0;
        while done < want {
            let n = self
                .file
                .read(&mut dst[done..want])
                .map_err(|e| Error::io("read backing file", e))?;
            if n == 0 {
                break;
            }
            done += n;
        }
        Ok(done)
    }

    fn write_at(&mut self, position: u64, src: &[u8]) -> Result<usize> {
        if src.is_empty() {
            return Ok(0);
        }
        let end = position
            .checked_add(src.len() as u64)
            .ok_or(Error::Alloc { bytes: u64::MAX })?;
        // Seeking past the end leaves a hole that reads back as zeros.
        self.file
            .seek(SeekFrom::Start(position))
            .map_err(|e| Error::io("seek backing file", e))?;
        self.file
            .write_all(src)
            .map_err(|e| Error::io("write backing file", e))?;
        self.length = self.length.max(end);
        Ok(src.len())
    }

    fn truncate(&mut self, size: u64) -> Result<()> {
        if size < self.length {
            self.file
                .set_len(size)
                .map_err(|e| Error::io("truncate backing file", e))?;
            self.length = size;
        }
        Ok(())
    }
}

fn open_rw(path: &Path, truncate: bool) -> Result<File> {
    OpenOptions::new()
        .read(true)
        .write(true)
        .create(true)
        .truncate(truncate)
        .open(path)
        .map_err(|e| Error::io("open backing file", e))
}

#[derive(Debug)]
pub struct DiskBuffer {
    id: u64,
    state: FileState,
    file: Arc<DiskFile>,
    dir: PathBuf,
    keep_cache: bool,
    cache: Arc<DiskCache>,
    reclaimer: Reclaimer<DiskFile>,
    stats: Arc<LiveStats>,
    _handle: ReclaimHandle,
}

impl DiskBuffer {
    /// New empty backend in the configured temp directory, tracked by the
    /// global disk reclaimer.
    pub fn create(config: &DiskConfig, cache: Arc<DiskCache>) -> Result<Self> {
        let dir = config.resolved_temp_dir()?;
        Self::create_in(&dir, config.keep_cache, cache, reclaimer())
    }

    pub fn create_in(
        dir: &Path,
        keep_cache: bool,
        cache: Arc<DiskCache>,
        reclaimer: &Reclaimer<DiskFile>,
    ) -> Result<Self> {
        fs::create_dir_all(dir).map_err(|e| Error::io("create temp directory", e))?;
        let temp = tempfile::Builder::new()
            .prefix("blob")
            .suffix(".bdo")
            .tempfile_in(dir)
            .map_err(|e| Error::io("create backing file", e))?;
        let (file, temp_path) = temp.into_parts();
        // Deletion belongs to the reclaimer from here on.
        let path = temp_path
            .keep()
            .map_err(|e| Error::io("detach backing file", e.error))?;

        let disk_file = Arc::new(DiskFile {
            path,
            released: AtomicBool::new(false),
        });
        let handle = reclaimer.register(Arc::clone(&disk_file));
        let id = NEXT_ID.fetch_add(1, Ordering::Relaxed);
        debug!(id, path = %disk_file.path.display(), "disk backend created");

        Ok(Self {
            id,
            state: FileState { file, length: 0 },
            file: disk_file,
            dir: dir.to_path_buf(),
            keep_cache,
            cache,
            reclaimer: reclaimer.clone(),
            stats: monitor::global().track(BackendKind::Disk),
            _handle: handle,
        })
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn path(&self) -> &Path {
        &self.file.path
    }

    /// Whether a cached snapshot is currently held for this backend.
    pub fn is_cached(&self) -> bool {
        self.cache.contains(self.id)
    }

    fn ensure_live(&self) -> Result<()> {
        if self.file.is_released() {
            Err(Error::Released)
        } else {
            Ok(())
        }
    }

    fn mutated(&self) {
        self.cache.invalidate(self.id);
        self.stats.set_length(self.state.length);
    }

    /// Pick up a file that was rewritten behind the handle's back.
    fn reopen(&mut self) -> Result<()> {
        let file = open_rw(&self.file.path, false)?;
        let length = file
            .metadata()
            .map_err(|e| Error::io("stat backing file", e))?
            .len();
        self.state = FileState { file, length };
        self.mutated();
        Ok(())
    }
}

impl BlobContainer for DiskBuffer {
    fn kind(&self) -> BackendKind {
        BackendKind::Disk
    }

    fn length(&self) -> u64 {
        self.state.length
    }

    fn data(&mut self) -> Result<BlobBytes<'_>> {
        self.ensure_live()?;
        if self.keep_cache {
            if let Some(hit) = self.cache.get(self.id) {
                return Ok(BlobBytes::Shared(hit));
            }
        }
        let size = self.state.length;
        let len = match usize::try_from(size) {
            Ok(len) if size <= ADDRESSABLE_LIMIT => len,
            _ => {
                return Err(Error::MaterializationTooLarge {
                    size,
                    max: ADDRESSABLE_LIMIT,
                })
            }
        };
        let mut buf = Vec::new();
        buf.try_reserve_exact(len)
            .map_err(|_| Error::Alloc { bytes: size })?;
        self.state
            .file
            .seek(SeekFrom::Start(0))
            .map_err(|e| Error::io("seek backing file", e))?;
        (&self.state.file)
            .take(size)
            .read_to_end(&mut buf)
            .map_err(|e| Error::io("read backing file", e))?;

        if self.keep_cache {
            let shared: Arc<[u8]> = Arc::from(buf);
            self.cache.insert(self.id, Arc::clone(&shared));
            Ok(BlobBytes::Shared(shared))
        } else {
            Ok(BlobBytes::Owned(buf))
        }
    }

    fn set_data(&mut self, data: Option<Vec<u8>>) -> Result<()> {
        self.ensure_live()?;
        self.state
            .file
            .set_len(0)
            .map_err(|e| Error::io("truncate backing file", e))?;
        self.state.length = 0;
        if let Some(bytes) = data {
            self.state.write_at(0, &bytes)?;
        }
        self.mutated();
        Ok(())
    }

    fn data_buffer(&mut self) -> Result<DataBuffer<'_>> {
        self.ensure_live()?;
        // The view writes straight into the file.
        self.cache.invalidate(self.id);
        if self.state.length == 0 {
            return Ok(DataBuffer::Detached(Vec::new()));
        }
        let map = map_file(&self.state.file)?;
        Ok(DataBuffer::View(Box::new(map)))
    }

    fn read_at(&mut self, position: u64, dst: &mut [u8]) -> Result<usize> {
        self.ensure_live()?;
        self.state.read_at(position, dst)
    }

    fn write_at(&mut self, position: u64, src: &[u8]) -> Result<usize> {
        self.ensure_live()?;
        let n = self.state.write_at(position, src)?;
        self.mutated();
        trace!(id = self.id, position, bytes = n, "disk write");
        Ok(n)
    }

    fn truncate(&mut self, size: u64) -> Result<()> {
        self.ensure_live()?;
        self.state.truncate(size)?;
        self.mutated();
        Ok(())
    }

    /// Deletes and recreates the backing file.
    fn reset(&mut self, _estimated_size: u64) -> Result<()> {
        self.ensure_live()?;
        match fs::remove_file(&self.file.path) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => return Err(Error::io("delete backing file", e)),
        }
        let file = open_rw(&self.file.path, true)?;
        self.state = FileState { file, length: 0 };
        self.mutated();
        Ok(())
    }

    fn channel(&mut self) -> Result<Box<dyn BlobChannel + '_>> {
        self.ensure_live()?;
        let hook = invalidation_hook(Arc::clone(&self.cache), self.id);
        let base = FileChannel {
            state: &mut self.state,
            file: &self.file,
            stats: &self.stats,
            position: 0,
            open: true,
        };
        Ok(Box::new(ChannelWrapper::new(base).with_write_hook(hook)))
    }

    fn reader(&self) -> Result<Box<dyn Read + Send + '_>> {
        self.ensure_live()?;
        let file = File::open(&self.file.path).map_err(|e| Error::io("open backing file", e))?;
        Ok(Box::new(BufReader::new(file).take(self.state.length)))
    }

    fn try_clone(&self) -> Result<Box<dyn BlobContainer>> {
        let mut clone = DiskBuffer::create_in(
            &self.dir,
            self.keep_cache,
            Arc::clone(&self.cache),
            &self.reclaimer,
        )?;
        copy_content(self, &mut clone)?;
        Ok(Box::new(clone))
    }

    fn file_provider(&mut self) -> Result<Box<dyn FileProvider + '_>> {
        Ok(Box::new(DiskFileProvider::acquire(self)?))
    }

    fn invalidate_cache(&mut self) {
        self.cache.invalidate(self.id);
    }
}

fn invalidation_hook<'a>(cache: Arc<DiskCache>, id: u64) -> ChannelHook<'a, FileChannel<'a>> {
    Box::new(
        move |_real: &mut FileChannel<'a>| -> Result<Option<FileChannel<'a>>> {
            cache.invalidate(id);
            Ok(None)
        },
    )
}

/// Raw channel over the backing file. Knows nothing about the cache; the
/// disk backend wraps it with an invalidation hook.
pub struct FileChannel<'a> {
    state: &'a mut FileState,
    file: &'a DiskFile,
    stats: &'a LiveStats,
    position: u64,
    open: bool,
}

impl FileChannel<'_> {
    fn ensure_usable(&self) -> Result<()> {
        if !self.open {
            return Err(Error::ChannelClosed);
        }
        if self.file.is_released() {
            return Err(Error::Released);
        }
        Ok(())
    }
}

impl BlobChannel for FileChannel<'_> {
    fn read(&mut self, dst: &mut [u8]) -> Result<usize> {
        self.ensure_usable()?;
        let n = self.state.read_at(self.position, dst)?;
        self.position += n as u64;
        Ok(n)
    }

    fn write(&mut self, src: &[u8]) -> Result<usize> {
        self.ensure_usable()?;
        let n = self.state.write_at(self.position, src)?;
        self.position += n as u64;
        self.stats.set_length(self.state.length);
        Ok(n)
    }

    fn position(&self) -> u64 {
        self.position
    }

    fn seek(&mut self, position: u64) -> Result<()> {
        self.ensure_usable()?;
        self.position = position;
        Ok(())
    }

    fn size(&self) -> Result<u64> {
        Ok(self.state.length)
    }

    fn truncate(&mut self, size: u64) -> Result<()> {
        self.ensure_usable()?;
        self.state.truncate(size)?;
        self.stats.set_length(self.state.length);
        self.position = self.position.min(size);
        Ok(())
    }

    fn is_open(&self) -> bool {
        self.open
    }

    fn close(&mut self) -> Result<()> {
        self.open = false;
        Ok(())
    }
}

/// Scoped access to the real backing file.
pub struct DiskFileProvider<'a> {
    disk: &'a mut DiskBuffer,
    etag: String,
    released: bool,
}

impl<'a> DiskFileProvider<'a> {
    fn acquire(disk: &'a mut DiskBuffer) -> Result<Self> {
        disk.ensure_live()?;
        disk.state
            .file
            .flush()
            .map_err(|e| Error::io("flush backing file", e))?;
        // External code may rewrite the file; a cached copy cannot be trusted.
        disk.cache.invalidate(disk.id);
        let etag = file_etag(&disk.file.path)?;
        Ok(Self {
            disk,
            etag,
            released: false,
        })
    }

    fn release(&mut self) -> Result<()> {
        if self.released {
            return Ok(());
        }
        self.released = true;
        let now = file_etag(&self.disk.file.path)?;
        if now != self.etag {
            self.disk.reopen()?;
            debug!(id = self.disk.id, length = self.disk.state.length, "backing file modified externally");
        }
        Ok(())
    }
}

impl FileProvider for DiskFileProvider<'_> {
    fn path(&self) -> &Path {
        &self.disk.file.path
    }

    fn close(mut self: Box<Self>) -> Result<()> {
        self.release()
    }
}

impl Drop for DiskFileProvider<'_> {
    fn drop(&mut self) {
        if let Err(e) = self.release() {
            tracing::warn!(id = self.disk.id, error = %e, "scoped disk file release failed");
        }
    }
}
