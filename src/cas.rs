//! # Directory-Backed Content-Addressable Store
//!
//! Persists opaque blobs keyed by cryptographic digest and named references
//! pointing at blob descriptors, in the on-disk OCI image layout.
//!
//! ## Storage Model
//!
//! A layout rooted at `R` looks like:
//!
//! ```text
//! R/
//! ├── oci-layout            {"imageLayoutVersion":"1.0.0"}
//! ├── blobs/
//! │   └── sha256/
//! │       ├── 9a98de6b...   (blob content)
//! │       └── e3b0c442...   (blob content)
//! ├── refs/
//! │   └── latest            (JSON descriptor)
//! └── .temp-XXXXXX/         (scratch dir of a live session)
//!     └── lock              (advisory lock held by the owner)
//! ```
//!
//! ## Atomicity
//!
//! Every mutation lands via temp-file-plus-rename. Bytes are first written
//! to a file inside the session's scratch directory, which lives on the same
//! filesystem as `blobs/` and `refs/`, then renamed over the destination.
//! Concurrent readers of the same layout never observe a partial blob or
//! reference.
//!
//! ## Read-Only Media
//!
//! [`Engine::open`] performs no writes, so a layout on read-only media opens
//! normally and serves reads. The first write attempt surfaces
//! [`Error::ReadOnly`]; the scratch directory is created lazily for exactly
//! this reason.
//!
//! ## Garbage Collection
//!
//! [`Engine::clean`] removes scratch directories abandoned by dead sessions.
//! Liveness is decided by an advisory lock on `.temp-*/lock`: a live engine
//! holds its lock exclusively, so `clean` skips any directory whose lock
//! cannot be acquired. This means `clean` can never race with a concurrent
//! blob write that has staged bytes but not yet renamed them.
//!
//! ## Concurrency
//!
//! Reads are lock-free and safe from any number of threads or processes.
//! Mutating operations on one engine instance serialize on an internal
//! mutex. Across instances, atomic rename gives last-writer-wins for
//! references and harmless duplicate-suppression for blobs.

use std::fs::{self, File, OpenOptions};
use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, MutexGuard};

use fs4::FileExt;
use serde::{Deserialize, Serialize};
use tempfile::{NamedTempFile, TempDir};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::constants::{
    BLOB_DIRECTORY, IMAGE_LAYOUT_VERSION, IO_CHUNK_SIZE, LAYOUT_FILE, REF_DIRECTORY,
    SCRATCH_LOCK_FILE, SCRATCH_PREFIX,
};
use crate::digest::{Digest, BLOB_ALGORITHM};
use crate::error::{Error, Result};
use crate::oci::Descriptor;

/// `errno` for a write to a read-only filesystem on Linux and macOS.
const EROFS: i32 = 30;

/// Contents of the `oci-layout` marker file.
#[derive(Debug, Serialize, Deserialize)]
struct LayoutMarker {
    #[serde(rename = "imageLayoutVersion")]
    image_layout_version: String,
}

/// A live session's scratch directory plus the advisory lock that marks it
/// as owned.
#[derive(Debug)]
struct Scratch {
    dir: TempDir,
    _lock: File,
}

impl Scratch {
    fn close(self) -> Result<()> {
        drop(self._lock);
        self.dir.close()?;
        Ok(())
    }
}

/// Handle to an on-disk OCI image layout.
///
/// Obtained from [`Engine::open`] after [`Engine::create`] has initialized
/// the directory. Cheap to share behind an `Arc`; the mutator and garbage
/// collector both hold one that way.
///
/// ## Thread Safety
///
/// Reads run concurrently without locking. Mutations (`put_*`, `delete_*`,
/// [`Engine::clean`]) serialize on an internal mutex that also owns the
/// lazily-created scratch directory.
#[derive(Debug)]
pub struct Engine {
    root: PathBuf,
    closed: AtomicBool,
    scratch: Mutex<Option<Scratch>>,
}

impl Engine {
    /// Initializes a fresh image layout at `root`.
    ///
    /// The directory is created if missing. An existing non-empty directory
    /// is refused with [`Error::LayoutExists`] rather than clobbered.
    pub fn create(root: impl AsRef<Path>) -> Result<()> {
        let root = root.as_ref();

        match fs::metadata(root) {
            Ok(meta) if !meta.is_dir() => {
                return Err(Error::LayoutExists {
                    path: root.to_path_buf(),
                })
            }
            Ok(_) => {
                if fs::read_dir(root)?.next().is_some() {
                    return Err(Error::LayoutExists {
                        path: root.to_path_buf(),
                    });
                }
            }
            Err(err) if err.kind() == io::ErrorKind::NotFound => {
                fs::create_dir_all(root)?;
            }
            Err(err) => return Err(err.into()),
        }

        fs::create_dir(root.join(BLOB_DIRECTORY))?;
        fs::create_dir(root.join(BLOB_DIRECTORY).join(BLOB_ALGORITHM.as_str()))?;
        fs::create_dir(root.join(REF_DIRECTORY))?;

        let marker = LayoutMarker {
            image_layout_version: IMAGE_LAYOUT_VERSION.to_string(),
        };
        fs::write(root.join(LAYOUT_FILE), serde_json::to_vec(&marker)?)?;

        info!("created image layout at {}", root.display());
        Ok(())
    }

    /// Opens an existing image layout, validating its structure.
    ///
    /// The marker file must parse and carry a recognized version, and
    /// `blobs/` and `refs/` must both exist as directories; anything else is
    /// [`Error::InvalidLayout`]. No writes occur, so read-only layouts open
    /// normally.
    pub fn open(root: impl AsRef<Path>) -> Result<Engine> {
        let root = root.as_ref().to_path_buf();

        let invalid = |reason: String| Error::InvalidLayout {
            path: root.clone(),
            reason,
        };

        let marker_bytes = fs::read(root.join(LAYOUT_FILE)).map_err(|err| {
            if err.kind() == io::ErrorKind::NotFound {
                invalid(format!("missing {LAYOUT_FILE} marker"))
            } else {
                err.into()
            }
        })?;
        let marker: LayoutMarker = serde_json::from_slice(&marker_bytes)
            .map_err(|err| invalid(format!("malformed {LAYOUT_FILE} marker: {err}")))?;
        if marker.image_layout_version != IMAGE_LAYOUT_VERSION {
            return Err(invalid(format!(
                "unsupported layout version '{}'",
                marker.image_layout_version
            )));
        }

        for subdir in [BLOB_DIRECTORY, REF_DIRECTORY] {
            match fs::metadata(root.join(subdir)) {
                Ok(meta) if meta.is_dir() => {}
                Ok(_) => return Err(invalid(format!("{subdir} is not a directory"))),
                Err(err) if err.kind() == io::ErrorKind::NotFound => {
                    return Err(invalid(format!("missing {subdir} directory")))
                }
                Err(err) => return Err(err.into()),
            }
        }

        debug!("opened image layout at {}", root.display());
        Ok(Engine {
            root,
            closed: AtomicBool::new(false),
            scratch: Mutex::new(None),
        })
    }

    /// Returns the layout root directory.
    pub fn root(&self) -> &Path {
        &self.root
    }

    // =========================================================================
    // Blobs
    // =========================================================================

    /// Streams `reader` into the store, returning the content digest and
    /// observed byte count.
    ///
    /// Bytes are hashed while being written to a scratch file, which is then
    /// renamed into place. Storing a blob that already exists is success;
    /// the staged copy is discarded. Cancellation between chunks abandons
    /// the scratch file.
    pub fn put_blob<R: Read>(
        &self,
        token: &CancellationToken,
        mut reader: R,
    ) -> Result<(Digest, i64)> {
        self.ensure_open()?;
        let mut guard = self.lock_scratch();
        let scratch_dir = self.scratch_path(&mut guard)?;

        let mut temp = NamedTempFile::new_in(&scratch_dir).map_err(|e| self.write_error(e))?;
        let mut digester = BLOB_ALGORITHM.digester();
        let mut size: i64 = 0;
        let mut chunk = vec![0u8; IO_CHUNK_SIZE];
        loop {
            if token.is_cancelled() {
                return Err(Error::Cancelled {
                    operation: "put_blob",
                });
            }
            let n = reader.read(&mut chunk)?;
            if n == 0 {
                break;
            }
            digester.update(&chunk[..n]);
            temp.write_all(&chunk[..n]).map_err(|e| self.write_error(e))?;
            size += n as i64;
        }
        temp.flush().map_err(|e| self.write_error(e))?;

        let digest = digester.finalize();
        let dest = self.blob_path(&digest);
        if dest.exists() {
            debug!("blob {digest} already present, discarding staged copy");
            return Ok((digest, size));
        }
        if let Some(parent) = dest.parent() {
            fs::create_dir_all(parent).map_err(|e| self.write_error(e))?;
        }
        temp.persist(&dest).map_err(|e| self.write_error(e.error))?;

        debug!("stored blob {digest} ({size} bytes)");
        Ok((digest, size))
    }

    /// Serializes `value` to canonical JSON and stores it as a blob.
    ///
    /// Canonical means `serde_json`'s compact encoding with fields in
    /// declared order, so the digest of a given value is stable.
    pub fn put_blob_json<T: Serialize>(
        &self,
        token: &CancellationToken,
        value: &T,
    ) -> Result<(Digest, i64)> {
        self.ensure_open()?;
        let bytes = serde_json::to_vec(value)?;
        self.put_blob(token, bytes.as_slice())
    }

    /// Opens a blob for streaming read.
    ///
    /// The returned reader hashes content as it is consumed and fails the
    /// final read with a digest-mismatch error if the stored bytes have been
    /// corrupted. Fails with [`Error::BlobNotFound`] if the blob is absent.
    pub fn get_blob(&self, token: &CancellationToken, digest: &Digest) -> Result<BlobReader> {
        self.ensure_open()?;
        let file = File::open(self.blob_path(digest)).map_err(|err| {
            if err.kind() == io::ErrorKind::NotFound {
                Error::BlobNotFound {
                    digest: digest.to_string(),
                }
            } else {
                err.into()
            }
        })?;
        Ok(BlobReader {
            file,
            expected: digest.clone(),
            digester: Some(digest.algorithm().digester()),
            token: token.clone(),
        })
    }

    /// Reads an entire blob into memory, verifying its digest.
    pub fn read_blob(&self, token: &CancellationToken, digest: &Digest) -> Result<Vec<u8>> {
        let mut reader = self.get_blob(token, digest)?;
        let mut bytes = Vec::new();
        match reader.read_to_end(&mut bytes) {
            Ok(_) => Ok(bytes),
            Err(err) => Err(unwrap_io(err)),
        }
    }

    /// Size in bytes of a stored blob, without opening it.
    pub fn blob_size(&self, token: &CancellationToken, digest: &Digest) -> Result<u64> {
        self.ensure_open()?;
        if token.is_cancelled() {
            return Err(Error::Cancelled {
                operation: "blob_size",
            });
        }
        let meta = fs::metadata(self.blob_path(digest)).map_err(|err| {
            if err.kind() == io::ErrorKind::NotFound {
                Error::BlobNotFound {
                    digest: digest.to_string(),
                }
            } else {
                Error::Io(err)
            }
        })?;
        Ok(meta.len())
    }

    /// Removes a blob. Removing an absent blob is success.
    pub fn delete_blob(&self, token: &CancellationToken, digest: &Digest) -> Result<()> {
        self.ensure_open()?;
        let _guard = self.lock_scratch();
        if token.is_cancelled() {
            return Err(Error::Cancelled {
                operation: "delete_blob",
            });
        }
        match fs::remove_file(self.blob_path(digest)) {
            Ok(()) => {
                debug!("deleted blob {digest}");
                Ok(())
            }
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(self.write_error(err)),
        }
    }

    /// Enumerates stored blob digests, sorted.
    ///
    /// Filenames that are not well-formed digests of the store algorithm are
    /// skipped silently so that future algorithms or stray files do not
    /// break enumeration.
    pub fn list_blobs(&self, token: &CancellationToken) -> Result<Vec<Digest>> {
        self.ensure_open()?;
        let algo_dir = self.root.join(BLOB_DIRECTORY).join(BLOB_ALGORITHM.as_str());
        let entries = match fs::read_dir(&algo_dir) {
            Ok(entries) => entries,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(err) => return Err(err.into()),
        };

        let mut digests = Vec::new();
        for entry in entries {
            if token.is_cancelled() {
                return Err(Error::Cancelled {
                    operation: "list_blobs",
                });
            }
            let entry = entry?;
            let Some(name) = entry.file_name().to_str().map(str::to_owned) else {
                continue;
            };
            if let Ok(digest) = Digest::new(BLOB_ALGORITHM, name) {
                digests.push(digest);
            }
        }
        digests.sort();
        Ok(digests)
    }

    // =========================================================================
    // References
    // =========================================================================

    /// Writes a named reference, atomically replacing any previous value.
    pub fn put_reference(
        &self,
        token: &CancellationToken,
        name: &str,
        descriptor: &Descriptor,
    ) -> Result<()> {
        self.ensure_open()?;
        validate_reference_name(name)?;
        if token.is_cancelled() {
            return Err(Error::Cancelled {
                operation: "put_reference",
            });
        }
        let bytes = serde_json::to_vec(descriptor)?;

        let mut guard = self.lock_scratch();
        let scratch_dir = self.scratch_path(&mut guard)?;
        let mut temp = NamedTempFile::new_in(&scratch_dir).map_err(|e| self.write_error(e))?;
        temp.write_all(&bytes).map_err(|e| self.write_error(e))?;
        temp.persist(self.reference_path(name))
            .map_err(|e| self.write_error(e.error))?;

        debug!("stored reference '{name}' -> {}", descriptor.digest);
        Ok(())
    }

    /// Reads a named reference. Fails with [`Error::ReferenceNotFound`] if
    /// absent.
    pub fn get_reference(&self, token: &CancellationToken, name: &str) -> Result<Descriptor> {
        self.ensure_open()?;
        validate_reference_name(name)?;
        if token.is_cancelled() {
            return Err(Error::Cancelled {
                operation: "get_reference",
            });
        }
        let bytes = fs::read(self.reference_path(name)).map_err(|err| {
            if err.kind() == io::ErrorKind::NotFound {
                Error::ReferenceNotFound {
                    name: name.to_string(),
                }
            } else {
                err.into()
            }
        })?;
        Ok(serde_json::from_slice(&bytes)?)
    }

    /// Removes a named reference. Removing an absent reference is success.
    pub fn delete_reference(&self, token: &CancellationToken, name: &str) -> Result<()> {
        self.ensure_open()?;
        validate_reference_name(name)?;
        let _guard = self.lock_scratch();
        if token.is_cancelled() {
            return Err(Error::Cancelled {
                operation: "delete_reference",
            });
        }
        match fs::remove_file(self.reference_path(name)) {
            Ok(()) => {
                debug!("deleted reference '{name}'");
                Ok(())
            }
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(self.write_error(err)),
        }
    }

    /// Enumerates reference names, sorted.
    pub fn list_references(&self, token: &CancellationToken) -> Result<Vec<String>> {
        self.ensure_open()?;
        let mut names = Vec::new();
        for entry in fs::read_dir(self.root.join(REF_DIRECTORY))? {
            if token.is_cancelled() {
                return Err(Error::Cancelled {
                    operation: "list_references",
                });
            }
            let entry = entry?;
            if let Some(name) = entry.file_name().to_str() {
                names.push(name.to_string());
            }
        }
        names.sort();
        Ok(names)
    }

    // =========================================================================
    // Maintenance
    // =========================================================================

    /// Removes scratch directories abandoned by sessions that no longer
    /// exist.
    ///
    /// A scratch directory is eligible when the advisory lock on its `lock`
    /// file can be acquired; a held lock means the owner is alive and the
    /// directory is skipped. This engine's own scratch directory is never
    /// touched.
    pub fn clean(&self, token: &CancellationToken) -> Result<()> {
        self.ensure_open()?;
        let guard = self.lock_scratch();
        let own = guard.as_ref().map(|s| s.dir.path().to_path_buf());

        for entry in fs::read_dir(&self.root)? {
            if token.is_cancelled() {
                return Err(Error::Cancelled { operation: "clean" });
            }
            let entry = entry?;
            let Some(name) = entry.file_name().to_str().map(str::to_owned) else {
                continue;
            };
            if !name.starts_with(SCRATCH_PREFIX) {
                continue;
            }
            let path = entry.path();
            if Some(&path) == own.as_ref() {
                continue;
            }
            if !entry.file_type()?.is_dir() {
                fs::remove_file(&path).map_err(|e| self.write_error(e))?;
                info!("removed stray scratch file {}", path.display());
                continue;
            }
            match self.try_lock_scratch_dir(&path)? {
                Some(_lock) => {
                    fs::remove_dir_all(&path).map_err(|e| self.write_error(e))?;
                    info!("removed abandoned scratch directory {}", path.display());
                }
                None => {
                    debug!("skipping live scratch directory {}", path.display());
                }
            }
        }
        Ok(())
    }

    /// Releases the scratch directory and marks the engine closed.
    ///
    /// Every subsequent operation fails with [`Error::Closed`].
    pub fn close(&self) -> Result<()> {
        let mut guard = self.lock_scratch();
        self.closed.store(true, Ordering::SeqCst);
        if let Some(scratch) = guard.take() {
            scratch.close()?;
        }
        Ok(())
    }

    // =========================================================================
    // Internal
    // =========================================================================

    fn ensure_open(&self) -> Result<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(Error::Closed);
        }
        Ok(())
    }

    fn lock_scratch(&self) -> MutexGuard<'_, Option<Scratch>> {
        match self.scratch.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Returns the scratch directory path, creating the directory (and
    /// taking its advisory lock) on first use.
    fn scratch_path(&self, guard: &mut Option<Scratch>) -> Result<PathBuf> {
        if let Some(scratch) = guard.as_ref() {
            return Ok(scratch.dir.path().to_path_buf());
        }

        let dir = tempfile::Builder::new()
            .prefix(SCRATCH_PREFIX)
            .tempdir_in(&self.root)
            .map_err(|e| self.write_error(e))?;
        let lock = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .open(dir.path().join(SCRATCH_LOCK_FILE))
            .map_err(|e| self.write_error(e))?;
        // The directory is freshly created, so the lock cannot be contended.
        lock.try_lock_exclusive()?;

        debug!("created scratch directory {}", dir.path().display());
        let path = dir.path().to_path_buf();
        *guard = Some(Scratch { dir, _lock: lock });
        Ok(path)
    }

    fn try_lock_scratch_dir(&self, path: &Path) -> Result<Option<File>> {
        let file = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .open(path.join(SCRATCH_LOCK_FILE))
            .map_err(|e| self.write_error(e))?;
        match file.try_lock_exclusive() {
            Ok(()) => Ok(Some(file)),
            Err(err) if err.kind() == io::ErrorKind::WouldBlock => Ok(None),
            Err(err) => Err(err.into()),
        }
    }

    fn blob_path(&self, digest: &Digest) -> PathBuf {
        self.root
            .join(BLOB_DIRECTORY)
            .join(digest.algorithm().as_str())
            .join(digest.hex())
    }

    fn reference_path(&self, name: &str) -> PathBuf {
        self.root.join(REF_DIRECTORY).join(name)
    }

    /// Maps a write failure, distinguishing read-only media.
    fn write_error(&self, err: io::Error) -> Error {
        if err.kind() == io::ErrorKind::PermissionDenied || err.raw_os_error() == Some(EROFS) {
            Error::ReadOnly {
                path: self.root.clone(),
            }
        } else {
            Error::Io(err)
        }
    }
}

/// Streaming blob reader with digest verification.
///
/// Hashes bytes as they are read; once the underlying file is exhausted the
/// computed digest is compared against the blob's key, and a mismatch is
/// reported as an [`std::io::Error`] wrapping [`Error::DigestMismatch`].
/// Cancellation of the ambient token fails the next read.
#[derive(Debug)]
pub struct BlobReader {
    file: File,
    expected: Digest,
    digester: Option<crate::digest::Digester>,
    token: CancellationToken,
}

impl Read for BlobReader {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if self.token.is_cancelled() {
            return Err(io::Error::other(Error::Cancelled {
                operation: "get_blob",
            }));
        }
        let n = self.file.read(buf)?;
        if n > 0 {
            if let Some(digester) = self.digester.as_mut() {
                digester.update(&buf[..n]);
            }
        } else if let Some(digester) = self.digester.take() {
            let actual = digester.finalize();
            if actual != self.expected {
                return Err(io::Error::new(
                    io::ErrorKind::InvalidData,
                    Error::DigestMismatch {
                        digest: self.expected.to_string(),
                        actual: actual.to_string(),
                    },
                ));
            }
        }
        Ok(n)
    }
}

/// Recovers a crate error smuggled through `std::io::Error` by
/// [`BlobReader`].
fn unwrap_io(err: io::Error) -> Error {
    match err.downcast::<Error>() {
        Ok(inner) => inner,
        Err(err) => Error::Io(err),
    }
}

/// Reference names must be usable as a single filename component.
fn validate_reference_name(name: &str) -> Result<()> {
    let reason = if name.is_empty() {
        Some("name is empty")
    } else if name == "." || name == ".." {
        Some("name is a relative path component")
    } else if name.contains('/') || name.contains('\\') {
        Some("name contains a path separator")
    } else if name.contains('\0') {
        Some("name contains a NUL byte")
    } else {
        None
    };
    match reason {
        Some(reason) => Err(Error::InvalidReferenceName {
            name: name.to_string(),
            reason: reason.to_string(),
        }),
        None => Ok(()),
    }
}
