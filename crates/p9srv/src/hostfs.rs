//! Passthrough backend exporting a host directory.

use crate::error::{Error, errno::*};
use crate::fcall::{Stat, StatFs};
use crate::sgio::{SgReader, SgWriter};
use crate::utils::Result;
use crate::vfs::{Dirent, Filesystem};
use async_trait::async_trait;
use bytes::Buf;
use nix::libc;
use std::io;
use std::os::fd::OwnedFd;
use std::path::{Path, PathBuf};
use tokio::fs;
use tokio_stream::{StreamExt, wrappers::ReadDirStream};

/// A host directory exported as a 9P tree.
///
/// Cloning shares nothing but the root path; each session owns its clone.
#[derive(Clone, Debug)]
pub struct HostFs {
    root: PathBuf,
}

impl HostFs {
    pub fn new(root: impl Into<PathBuf>) -> HostFs {
        HostFs { root: root.into() }
    }
}

/// An open host file or directory.
///
/// The path rides along because directory iteration works by path, not by
/// descriptor. The descriptor closes on drop.
#[derive(Debug)]
pub struct HostFile {
    fd: OwnedFd,
    path: PathBuf,
}

fn dirent_type(ft: &std::fs::FileType) -> u8 {
    use std::os::unix::fs::FileTypeExt;

    if ft.is_dir() {
        libc::DT_DIR
    } else if ft.is_symlink() {
        libc::DT_LNK
    } else if ft.is_block_device() {
        libc::DT_BLK
    } else if ft.is_char_device() {
        libc::DT_CHR
    } else if ft.is_fifo() {
        libc::DT_FIFO
    } else if ft.is_socket() {
        libc::DT_SOCK
    } else if ft.is_file() {
        libc::DT_REG
    } else {
        libc::DT_UNKNOWN
    }
}

#[async_trait]
impl Filesystem for HostFs {
    type Path = PathBuf;
    type File = HostFile;

    fn root(&self) -> PathBuf {
        self.root.clone()
    }

    fn parent(&self, path: &PathBuf) -> PathBuf {
        path.parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| path.clone())
    }

    fn lookup_one(&self, parent: &PathBuf, name: &str) -> Result<PathBuf> {
        if name.is_empty() || name == "." || name == ".." || name.contains(['/', '\0']) {
            return Err(Error::No(EINVAL));
        }
        Ok(parent.join(name))
    }

    async fn getattr(&self, path: &PathBuf) -> Result<Stat> {
        let attr = fs::symlink_metadata(path).await?;
        Ok(Stat::from(&attr))
    }

    async fn statfs(&self, path: &PathBuf) -> Result<StatFs> {
        let path = path.clone();
        let st = tokio::task::spawn_blocking(move || nix::sys::statvfs::statvfs(&path))
            .await
            .map_err(|e| Error::Io(io::Error::other(e)))??;
        Ok(StatFs::from(st))
    }

    async fn open(&self, path: &PathBuf, flags: u32) -> Result<HostFile> {
        let oflags = nix::fcntl::OFlag::from_bits_truncate(flags as i32);
        let fd = nix::fcntl::open(path, oflags, nix::sys::stat::Mode::empty())?;
        Ok(HostFile {
            fd,
            path: path.clone(),
        })
    }

    async fn create(&self, path: &PathBuf, flags: u32, mode: u32, _gid: u32) -> Result<HostFile> {
        let oflags = nix::fcntl::OFlag::from_bits_truncate(flags as i32);
        let omode = nix::sys::stat::Mode::from_bits_truncate(mode);
        let fd = nix::fcntl::open(path, oflags, omode)?;
        Ok(HostFile {
            fd,
            path: path.clone(),
        })
    }

    async fn close(&self, file: HostFile) -> Result<()> {
        drop(file);
        Ok(())
    }

    async fn read(&self, file: &HostFile, offset: u64, buf: &mut [u8]) -> Result<usize> {
        Ok(nix::sys::uio::pread(&file.fd, buf, offset as libc::off_t)?)
    }

    async fn write(&self, file: &HostFile, offset: u64, buf: &[u8]) -> Result<usize> {
        Ok(nix::sys::uio::pwrite(&file.fd, buf, offset as libc::off_t)?)
    }

    async fn read_iov(
        &self,
        file: &HostFile,
        offset: u64,
        count: u32,
        dst: &mut SgWriter<'_>,
    ) -> Result<usize> {
        let n = {
            let mut iov = dst.io_slices_mut(count as usize);
            if iov.is_empty() {
                return Ok(0);
            }
            nix::sys::uio::preadv(&file.fd, &mut iov, offset as libc::off_t)?
        };
        dst.advance(n);
        Ok(n)
    }

    async fn write_iov(
        &self,
        file: &HostFile,
        offset: u64,
        src: &mut SgReader<'_>,
    ) -> Result<usize> {
        let n = {
            let iov = src.io_slices(src.remaining());
            if iov.is_empty() {
                return Ok(0);
            }
            nix::sys::uio::pwritev(&file.fd, &iov, offset as libc::off_t)?
        };
        src.advance(n);
        Ok(n)
    }

    async fn iterate_dir(&self, dir: &HostFile, offset: u64, limit: usize) -> Result<Vec<Dirent>> {
        let mut entries = ReadDirStream::new(fs::read_dir(&dir.path).await?).skip(offset as usize);

        let mut out = Vec::new();
        while out.len() < limit {
            let Some(entry) = entries.next().await else {
                break;
            };
            let entry = entry?;
            let typ = entry
                .file_type()
                .await
                .map(|t| dirent_type(&t))
                .unwrap_or(libc::DT_UNKNOWN);
            out.push(Dirent {
                name: entry.file_name().to_string_lossy().into_owned(),
                ino: entry.ino(),
                typ,
            });
        }
        Ok(out)
    }

    async fn truncate(&self, path: &PathBuf, size: u64) -> Result<()> {
        fs::OpenOptions::new()
            .write(true)
            .create(false)
            .open(path)
            .await?
            .set_len(size)
            .await?;
        Ok(())
    }

    async fn mkdir(&self, path: &PathBuf, mode: u32, _gid: u32) -> Result<()> {
        let mut builder = fs::DirBuilder::new();
        builder.mode(mode);
        builder.create(path).await?;
        Ok(())
    }

    async fn symlink(&self, path: &PathBuf, target: &str, _gid: u32) -> Result<()> {
        fs::symlink(target, path).await?;
        Ok(())
    }

    async fn link(&self, old: &PathBuf, new: &PathBuf) -> Result<()> {
        fs::hard_link(old, new).await?;
        Ok(())
    }

    async fn unlink(&self, path: &PathBuf) -> Result<()> {
        fs::remove_file(path).await?;
        Ok(())
    }

    async fn rmdir(&self, path: &PathBuf) -> Result<()> {
        fs::remove_dir(path).await?;
        Ok(())
    }

    async fn mknod(&self, path: &PathBuf, mode: u32, major: u32, minor: u32, _gid: u32) -> Result<()> {
        use nix::sys::stat::{Mode, SFlag, makedev, mknod};

        let path = path.clone();
        let kind = SFlag::from_bits_truncate(mode & libc::S_IFMT);
        let perm = Mode::from_bits_truncate(mode & 0o7777);
        let dev = makedev(major as u64, minor as u64);
        tokio::task::spawn_blocking(move || mknod(&path, kind, perm, dev))
            .await
            .map_err(|e| Error::Io(io::Error::other(e)))??;
        Ok(())
    }

    async fn rename(&self, old: &PathBuf, new: &PathBuf) -> Result<()> {
        fs::rename(old, new).await?;
        Ok(())
    }

    async fn readlink(&self, path: &PathBuf) -> Result<String> {
        let target = fs::read_link(path).await?;
        Ok(target.to_string_lossy().into_owned())
    }

    async fn fsync(&self, file: &HostFile, datasync: bool) -> Result<()> {
        if datasync {
            nix::unistd::fdatasync(&file.fd)?;
        } else {
            nix::unistd::fsync(&file.fd)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lookup_one_rejects_escaping_names() {
        let fs = HostFs::new("/export");
        let root = fs.root();
        for bad in ["", ".", "..", "a/b", "a\0b"] {
            assert_eq!(fs.lookup_one(&root, bad).unwrap_err().errno(), EINVAL);
        }
        assert_eq!(
            fs.lookup_one(&root, "ok").unwrap(),
            PathBuf::from("/export/ok")
        );
    }

    #[test]
    fn parent_walks_one_level_up() {
        let fs = HostFs::new("/export");
        let child = PathBuf::from("/export/a/b");
        assert_eq!(fs.parent(&child), PathBuf::from("/export/a"));
        // A path with no parent maps to itself.
        let top = PathBuf::from("/");
        assert_eq!(fs.parent(&top), top);
    }

    #[test]
    fn dirent_types_map_to_dt_constants() {
        let md = std::fs::metadata("/").unwrap();
        assert_eq!(dirent_type(&md.file_type()), libc::DT_DIR);
    }
}
