//! The filesystem facade consumed by the operation handlers.

use crate::fcall::{Stat, StatFs};
use crate::sgio::{SgReader, SgWriter};
use crate::utils::Result;
use async_trait::async_trait;
use bytes::Buf;

/// A raw directory entry as produced by [`iterate_dir`](Filesystem::iterate_dir).
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Dirent {
    pub name: String,
    pub ino: u64,
    /// `d_type` of the underlying dirent; 0 when unknown.
    pub typ: u8,
}

/// Host-side filesystem operations backing the 9P server.
///
/// The handlers drive everything through this trait; [`crate::hostfs::HostFs`]
/// is the passthrough implementation over a host directory.
///
/// # Path handles
///
/// `Path` is a cheap handle naming an entry below the export root. A handle
/// may name an entry that does not exist (yet): resolution with
/// [`lookup_one`](Filesystem::lookup_one) is pure, and existence only
/// surfaces when an operation such as [`getattr`](Filesystem::getattr)
/// touches storage and reports `ENOENT`. This mirrors how create-style
/// operations first name their target and then materialize it.
///
/// # Error Handling
///
/// Every method reports failure as an errno-carrying [`crate::error::Error`],
/// which the dispatcher delivers to the client as `Rlerror`.
#[async_trait]
pub trait Filesystem: Send + Sync {
    /// Handle for an entry below the export root.
    type Path: Clone + PartialEq + Send + Sync;
    /// Handle for an open file or directory.
    type File: Send + Sync;

    /// Handle of the exported subtree root.
    fn root(&self) -> Self::Path;

    /// Handle of `path`'s parent. The root is its own parent; the caller
    /// is responsible for clamping at the export root where it matters.
    fn parent(&self, path: &Self::Path) -> Self::Path;

    /// Resolve one name under `parent`. Rejects empty names, `.`, `..`
    /// and embedded separators with `EINVAL`; never touches storage.
    fn lookup_one(&self, parent: &Self::Path, name: &str) -> Result<Self::Path>;

    /// Stat without following a final symlink.
    async fn getattr(&self, path: &Self::Path) -> Result<Stat>;

    async fn statfs(&self, path: &Self::Path) -> Result<StatFs>;

    /// Open an existing file or directory. `flags` are host open flags,
    /// already sanitized by the caller.
    async fn open(&self, path: &Self::Path, flags: u32) -> Result<Self::File>;

    /// Create and open a regular file. `flags` include `O_CREAT`.
    async fn create(
        &self,
        path: &Self::Path,
        flags: u32,
        mode: u32,
        gid: u32,
    ) -> Result<Self::File>;

    /// Release an open handle. Called exactly once per handle.
    async fn close(&self, file: Self::File) -> Result<()>;

    async fn read(&self, file: &Self::File, offset: u64, buf: &mut [u8]) -> Result<usize>;

    async fn write(&self, file: &Self::File, offset: u64, buf: &[u8]) -> Result<usize>;

    /// Read up to `count` bytes directly into the response segments.
    ///
    /// The default bounces through a heap buffer; implementations with
    /// access to positional vectored I/O should override it.
    async fn read_iov(
        &self,
        file: &Self::File,
        offset: u64,
        count: u32,
        dst: &mut SgWriter<'_>,
    ) -> Result<usize> {
        let mut buf = vec![0; (count as usize).min(dst.remaining())];
        let n = self.read(file, offset, &mut buf).await?;
        Ok(dst.copy_from(&buf[..n]))
    }

    /// Write the remaining request bytes to the file.
    async fn write_iov(
        &self,
        file: &Self::File,
        offset: u64,
        src: &mut SgReader<'_>,
    ) -> Result<usize> {
        let mut buf = vec![0; src.remaining()];
        src.copy_to(&mut buf);
        self.write(file, offset, &buf).await
    }

    /// List up to `limit` entries of the open directory, starting at the
    /// logical position `offset`. `.` and `..` are not reported; the
    /// caller synthesizes them.
    async fn iterate_dir(
        &self,
        dir: &Self::File,
        offset: u64,
        limit: usize,
    ) -> Result<Vec<Dirent>>;

    async fn truncate(&self, path: &Self::Path, size: u64) -> Result<()>;

    async fn mkdir(&self, path: &Self::Path, mode: u32, gid: u32) -> Result<()>;

    /// Create a symlink at `path` pointing to `target`.
    async fn symlink(&self, path: &Self::Path, target: &str, gid: u32) -> Result<()>;

    /// Hard-link `old` at `new`.
    async fn link(&self, old: &Self::Path, new: &Self::Path) -> Result<()>;

    async fn unlink(&self, path: &Self::Path) -> Result<()>;

    async fn rmdir(&self, path: &Self::Path) -> Result<()>;

    /// Create a device node, FIFO or socket according to `mode`.
    async fn mknod(
        &self,
        path: &Self::Path,
        mode: u32,
        major: u32,
        minor: u32,
        gid: u32,
    ) -> Result<()>;

    async fn rename(&self, old: &Self::Path, new: &Self::Path) -> Result<()>;

    async fn readlink(&self, path: &Self::Path) -> Result<String>;

    async fn fsync(&self, file: &Self::File, datasync: bool) -> Result<()>;
}
