//! 9P2000.L operation handlers and the request dispatcher.
//!
//! # Protocol
//! 9P2000.L
//!
//! One [`Server`] holds the state of one client session: the export root,
//! the fid table and the last-attached uid. The transport calls
//! [`do_request`] once per framed message with a scatter-gather view of
//! the request and response buffers; every request produces either a
//! success reply or exactly one `Rlerror`.

use crate::error::{Error, errno::*};
use crate::fcall::*;
use crate::fid::FidTable;
use crate::serialize::Pdu;
use crate::sgio::{SgReader, SgWriter};
use crate::utils::Result;
use crate::vfs::Filesystem;
use bytes::Buf;
use log::{debug, error};
use nix::libc;
use num_traits::FromPrimitive;

/// `Tread`/`Twrite` transfers above this many bytes bypass the PDU copy
/// and move data directly between the file and the transport segments.
const ZERO_COPY_MIN: u32 = 1024;

/// Length of the `Rread` preamble: header + count[4].
const RREAD_HDR_LEN: usize = HEADER_LEN + 4;

// Some clients set open flags that must never reach the host: the Linux
// v9fs client forwards O_DIRECT, which imposes alignment our buffers do
// not have, and O_CREAT belongs to the create path. O_NOFOLLOW keeps an
// open from chasing a symlink out of the export.
fn build_openflags(flags: u32) -> u32 {
    let cleared =
        flags & !((libc::O_NOCTTY | libc::O_ASYNC | libc::O_CREAT | libc::O_DIRECT) as u32);
    cleared | libc::O_NOFOLLOW as u32
}

/// State of one 9P session over an export.
pub struct Server<F: Filesystem> {
    fs: F,
    root: F::Path,
    uid: u32,
    fids: FidTable<F::Path, F::File>,
}

impl<F: Filesystem> Server<F> {
    pub fn new(fs: F) -> Server<F> {
        let root = fs.root();
        Server {
            fs,
            root,
            uid: 0,
            fids: FidTable::new(),
        }
    }

    async fn gen_qid(&self, path: &F::Path) -> Result<QId> {
        Ok(QId::from(&self.fs.getattr(path).await?))
    }

    /// Resolve `name` under `parent` and require that nothing is there.
    async fn lookup_new(&self, parent: &F::Path, name: &str) -> Result<F::Path> {
        let path = self.fs.lookup_one(parent, name)?;
        match self.fs.getattr(&path).await {
            Ok(_) => Err(Error::No(EEXIST)),
            Err(ref e) if e.errno() == ENOENT => Ok(path),
            Err(e) => Err(e),
        }
    }

    async fn op_version(&mut self, inp: &mut Pdu, out: &mut Pdu) -> Result<()> {
        let msize: u32 = inp.decode()?;
        let version: String = inp.decode()?;

        out.encode(&msize)?;
        if version == P92000L {
            out.encode(&version)
        } else {
            out.encode(&VERSION_UNKNOWN.to_owned())
        }
    }

    async fn op_attach(&mut self, inp: &mut Pdu, out: &mut Pdu) -> Result<()> {
        let fid_val: u32 = inp.decode()?;
        let _afid: u32 = inp.decode()?;
        let _uname: String = inp.decode()?;
        let _aname: String = inp.decode()?;
        let uid: u32 = inp.decode()?;

        self.uid = uid;

        let path = match self.fids.lookup(fid_val) {
            Ok(entry) => entry.path.clone(),
            Err(_) => {
                let root = self.root.clone();
                self.fids.insert(fid_val, uid, root)?.path.clone()
            }
        };

        let qid = self.gen_qid(&path).await?;
        out.encode(&qid)
    }

    async fn op_getattr(&mut self, inp: &mut Pdu, out: &mut Pdu) -> Result<()> {
        let fid_val: u32 = inp.decode()?;
        let _request_mask: u64 = inp.decode()?;

        let path = self.fids.lookup(fid_val)?.path.clone();
        let stat = self.fs.getattr(&path).await?;
        let qid = QId::from(&stat);

        out.encode(&GetAttrMask::BASIC.bits())?;
        out.encode(&qid)?;
        out.encode(&stat)?;
        // btime, gen and data_version are reserved in the reply.
        out.encode(&0u64)?;
        out.encode(&0u64)?;
        out.encode(&0u64)?;
        out.encode(&0u64)
    }

    async fn op_setattr(&mut self, inp: &mut Pdu, _out: &mut Pdu) -> Result<()> {
        let fid_val: u32 = inp.decode()?;
        let valid = SetAttrMask::from_bits_truncate(inp.decode()?);
        let attr: SetAttr = inp.decode()?;

        let path = self.fids.lookup(fid_val)?.path.clone();

        // Only truncation is honored; mode, ownership and time updates
        // are accepted silently.
        if valid.contains(SetAttrMask::SIZE) {
            self.fs.truncate(&path, attr.size).await?;
        }

        Ok(())
    }

    /// <http://man.cat-v.org/plan_9/5/walk>
    async fn op_walk(&mut self, inp: &mut Pdu, out: &mut Pdu) -> Result<()> {
        let fid_val: u32 = inp.decode()?;
        let newfid_val: u32 = inp.decode()?;
        let nwname: u16 = inp.decode()?;

        let mut new_path = self.fids.lookup(fid_val)?.path.clone();

        if newfid_val != fid_val && self.fids.contains(newfid_val) {
            return Err(Error::No(EEXIST));
        }

        let mut wqids: Vec<QId> = Vec::with_capacity(nwname as usize);

        if nwname > 0 {
            let mut err = Error::No(ENOENT);
            for _ in 0..nwname {
                let name: String = inp.decode()?;

                // Ascending past the export root is not allowed.
                if name == ".." {
                    break;
                }

                let next = match self.fs.lookup_one(&new_path, &name) {
                    Ok(p) => p,
                    Err(e) => {
                        err = e;
                        break;
                    }
                };
                let qid = match self.gen_qid(&next).await {
                    Ok(q) => q,
                    Err(e) => {
                        err = e;
                        break;
                    }
                };

                new_path = next;
                wqids.push(qid);
            }

            if wqids.is_empty() {
                return Err(err);
            }
        } else {
            // Walking no names is a walk to the current directory.
            wqids.push(self.gen_qid(&new_path).await?);
        }

        if fid_val == newfid_val {
            self.fids.lookup_mut(fid_val)?.path = new_path;
        } else {
            let uid = self.uid;
            self.fids.insert(newfid_val, uid, new_path)?;
        }

        out.encode(&wqids)
    }

    async fn op_clunk(&mut self, inp: &mut Pdu, _out: &mut Pdu) -> Result<()> {
        let fid_val: u32 = inp.decode()?;

        // A second clunk of the same fid is not an error.
        if let Some(entry) = self.fids.remove(fid_val) {
            if let Some(file) = entry.file {
                let _ = self.fs.close(file).await;
            }
        }

        Ok(())
    }

    async fn op_statfs(&mut self, inp: &mut Pdu, out: &mut Pdu) -> Result<()> {
        let fid_val: u32 = inp.decode()?;

        let path = self.fids.lookup(fid_val)?.path.clone();
        let statfs = self.fs.statfs(&path).await?;
        out.encode(&statfs)
    }

    async fn op_open(&mut self, inp: &mut Pdu, out: &mut Pdu) -> Result<()> {
        let fid_val: u32 = inp.decode()?;
        let flags: u32 = inp.decode()?;

        let entry = self.fids.lookup(fid_val)?;
        if entry.file.is_some() {
            return Err(Error::No(EBUSY));
        }
        let path = entry.path.clone();

        let qid = self.gen_qid(&path).await?;
        let file = self.fs.open(&path, build_openflags(flags)).await?;
        self.fids.lookup_mut(fid_val)?.file = Some(file);

        out.encode(&qid)?;
        out.encode(&0u32) // iounit
    }

    async fn op_create(&mut self, inp: &mut Pdu, out: &mut Pdu) -> Result<()> {
        let dfid_val: u32 = inp.decode()?;

        let dfid = self.fids.lookup(dfid_val)?;
        if dfid.file.is_some() {
            return Err(Error::No(EBUSY));
        }
        let parent = dfid.path.clone();

        let name: String = inp.decode()?;
        let flags: u32 = inp.decode()?;
        let mode: u32 = inp.decode()?;
        let gid: u32 = inp.decode()?;

        let new_path = self.lookup_new(&parent, &name).await?;
        let file = self
            .fs
            .create(
                &new_path,
                build_openflags(flags) | libc::O_CREAT as u32,
                mode,
                gid,
            )
            .await?;

        let qid = match self.gen_qid(&new_path).await {
            Ok(qid) => qid,
            Err(e) => {
                let _ = self.fs.close(file).await;
                return Err(e);
            }
        };

        // The directory fid becomes the fid of the created file.
        let dfid = self.fids.lookup_mut(dfid_val)?;
        dfid.path = new_path;
        dfid.file = Some(file);

        out.encode(&qid)?;
        out.encode(&0u32) // iounit
    }

    async fn op_mkdir(&mut self, inp: &mut Pdu, out: &mut Pdu) -> Result<()> {
        let dfid_val: u32 = inp.decode()?;
        let parent = self.fids.lookup(dfid_val)?.path.clone();

        let name: String = inp.decode()?;
        let mode: u32 = inp.decode()?;
        let gid: u32 = inp.decode()?;

        let new_path = self.lookup_new(&parent, &name).await?;
        self.fs.mkdir(&new_path, mode, gid).await?;
        let qid = self.gen_qid(&new_path).await?;

        // Same destructive reuse as create: the directory fid now names
        // the new directory.
        self.fids.lookup_mut(dfid_val)?.path = new_path;

        out.encode(&qid)?;
        out.encode(&0u32)
    }

    async fn op_symlink(&mut self, inp: &mut Pdu, out: &mut Pdu) -> Result<()> {
        let fid_val: u32 = inp.decode()?;
        let parent = self.fids.lookup(fid_val)?.path.clone();

        let name: String = inp.decode()?;
        let target: String = inp.decode()?;
        let gid: u32 = inp.decode()?;

        let link_path = self.lookup_new(&parent, &name).await?;
        self.fs.symlink(&link_path, &target, gid).await?;

        let qid = self.gen_qid(&link_path).await?;
        out.encode(&qid)
    }

    async fn op_link(&mut self, inp: &mut Pdu, _out: &mut Pdu) -> Result<()> {
        let dfid_val: u32 = inp.decode()?;
        let fid_val: u32 = inp.decode()?;

        let old = self.fids.lookup(fid_val)?.path.clone();
        let parent = self.fids.lookup(dfid_val)?.path.clone();

        let name: String = inp.decode()?;
        let new = self.lookup_new(&parent, &name).await?;
        self.fs.link(&old, &new).await
    }

    async fn op_readlink(&mut self, inp: &mut Pdu, out: &mut Pdu) -> Result<()> {
        let fid_val: u32 = inp.decode()?;

        let path = self.fids.lookup(fid_val)?.path.clone();
        let target = self.fs.readlink(&path).await?;
        out.encode(&target)
    }

    async fn op_mknod(&mut self, inp: &mut Pdu, out: &mut Pdu) -> Result<()> {
        let dfid_val: u32 = inp.decode()?;
        let parent = self.fids.lookup(dfid_val)?.path.clone();

        let name: String = inp.decode()?;
        let mode: u32 = inp.decode()?;
        let major: u32 = inp.decode()?;
        let minor: u32 = inp.decode()?;
        let gid: u32 = inp.decode()?;

        let new_path = self.lookup_new(&parent, &name).await?;
        self.fs.mknod(&new_path, mode, major, minor, gid).await?;

        let qid = self.gen_qid(&new_path).await?;
        out.encode(&qid)
    }

    async fn op_rename(&mut self, inp: &mut Pdu, _out: &mut Pdu) -> Result<()> {
        let fid_val: u32 = inp.decode()?;
        let old_path = self.fids.lookup(fid_val)?.path.clone();

        let newfid_val: u32 = inp.decode()?;
        let target: String = inp.decode()?;

        // Rename-target resolution relative to the fid: intermediate
        // components need not exist on the host yet.
        let mut new_path = old_path.clone();
        for name in target.split('/').filter(|s| !s.is_empty()) {
            new_path = self.fs.lookup_one(&new_path, name)?;
        }

        let uid = self.uid;
        self.fids.insert(newfid_val, uid, new_path.clone())?;

        self.fs.rename(&old_path, &new_path).await
    }

    async fn op_remove(&mut self, inp: &mut Pdu, _out: &mut Pdu) -> Result<()> {
        let fid_val: u32 = inp.decode()?;
        let path = self.fids.lookup(fid_val)?.path.clone();

        // A vanished path keeps the fid, everything else loses it.
        let stat = self.fs.getattr(&path).await?;

        let res = if stat.mode & libc::S_IFMT == libc::S_IFDIR {
            self.fs.rmdir(&path).await
        } else {
            self.fs.unlink(&path).await
        };

        if let Some(entry) = self.fids.remove(fid_val) {
            if let Some(file) = entry.file {
                let _ = self.fs.close(file).await;
            }
        }

        res
    }

    async fn op_fsync(&mut self, inp: &mut Pdu, _out: &mut Pdu) -> Result<()> {
        let fid_val: u32 = inp.decode()?;
        let datasync: u32 = inp.decode()?;

        let entry = self.fids.lookup(fid_val)?;
        let file = entry.file.as_ref().ok_or(Error::No(EBADFD))?;
        self.fs.fsync(file, datasync != 0).await
    }

    async fn op_read(&mut self, inp: &mut Pdu, out: &mut Pdu) -> Result<()> {
        let fid_val: u32 = inp.decode()?;
        let offset: u64 = inp.decode()?;
        let count: u32 = inp.decode()?;

        let entry = self.fids.lookup(fid_val)?;
        let file = entry.file.as_ref().ok_or(Error::No(EBADF))?;

        // The reply must fit the out buffer: header, count field, data.
        let start = (out.size + 4).min(out.capacity());
        let count = (count as usize).min(out.capacity() - start);
        let n = {
            let buf = &mut out.data_mut()[start..start + count];
            self.fs.read(file, offset, buf).await?
        };

        out.encode(&(n as u32))?;
        out.size += n;
        Ok(())
    }

    async fn op_write(&mut self, inp: &mut Pdu, out: &mut Pdu) -> Result<()> {
        let fid_val: u32 = inp.decode()?;
        let offset: u64 = inp.decode()?;
        let count: u32 = inp.decode()?;

        let entry = self.fids.lookup(fid_val)?;
        let file = entry.file.as_ref().ok_or(Error::No(EBADF))?;

        let data = inp.read_slice(count as usize)?;
        let n = self.fs.write(file, offset, data).await?;
        out.encode(&(n as u32))
    }

    /// Zero-copy read: file bytes land directly in the response
    /// segments, past the reserved reply preamble.
    async fn op_read_iov(
        &mut self,
        inp: &mut Pdu,
        out: &mut Pdu,
        resp: &mut SgWriter<'_>,
    ) -> Result<()> {
        let fid_val: u32 = inp.decode()?;
        let offset: u64 = inp.decode()?;
        let count: u32 = inp.decode()?;

        let entry = self.fids.lookup(fid_val)?;
        let file = entry.file.as_ref().ok_or(Error::No(EBADF))?;

        let n = self.fs.read_iov(file, offset, count, resp).await?;
        out.encode(&(n as u32))?;
        // The data bytes count toward the reply size even though they
        // never pass through this buffer.
        out.size += n;
        Ok(())
    }

    /// Zero-copy write: the payload is consumed straight from the
    /// request segments.
    async fn op_write_iov(
        &mut self,
        inp: &mut Pdu,
        out: &mut Pdu,
        req: &mut SgReader<'_>,
    ) -> Result<()> {
        let fid_val: u32 = inp.decode()?;
        let offset: u64 = inp.decode()?;
        let count: u32 = inp.decode()?;

        let entry = self.fids.lookup(fid_val)?;
        let file = entry.file.as_ref().ok_or(Error::No(EBADF))?;

        req.truncate(count as usize);
        let n = self.fs.write_iov(file, offset, req).await?;
        out.encode(&(n as u32))
    }

    async fn op_readdir(&mut self, inp: &mut Pdu, out: &mut Pdu) -> Result<()> {
        let dfid_val: u32 = inp.decode()?;
        let offset: u64 = inp.decode()?;
        let count: u32 = inp.decode()?;

        let entry = self.fids.lookup(dfid_val)?;
        if entry.file.is_none() {
            return Err(Error::No(EBADF));
        }
        let dir_path = entry.path.clone();

        let avail = out.capacity().saturating_sub(out.size + 4);
        let count = (count as u64).min(avail as u64) as u32;

        let mut dirents = DirEntryData::new();

        if offset == 0 {
            let qid = self.gen_qid(&dir_path).await?;
            let up = if dir_path == self.root {
                // ".." does not ascend past the export root.
                dir_path.clone()
            } else {
                self.fs.parent(&dir_path)
            };
            let dot = DirEntry {
                qid,
                offset: 0,
                typ: libc::DT_DIR,
                name: ".".to_owned(),
            };
            let dotdot = DirEntry {
                qid: self.gen_qid(&up).await?,
                offset: 1,
                typ: libc::DT_DIR,
                name: "..".to_owned(),
            };
            for ent in [dot, dotdot] {
                if dirents.size() + ent.size() > count {
                    break;
                }
                dirents.push(ent);
            }
        }

        // Real entries resume after the last offset the client saw;
        // offsets 0 and 1 belong to the dot entries.
        let skip = if offset == 0 { 0 } else { offset - 1 };

        // The smallest wire entry is 25 bytes, which bounds how many raw
        // entries one reply can possibly use.
        let limit = (count as usize / 25) + 1;

        let raw = {
            let entry = self.fids.lookup(dfid_val)?;
            let dir = entry.file.as_ref().ok_or(Error::No(EBADF))?;
            self.fs.iterate_dir(dir, skip, limit).await?
        };

        let mut index = skip;
        for r in raw {
            let path = self.fs.lookup_one(&dir_path, &r.name)?;
            let qid = self.gen_qid(&path).await?;
            let ent = DirEntry {
                qid,
                offset: 2 + index,
                typ: r.typ,
                name: r.name,
            };
            if dirents.size() + ent.size() > count {
                break;
            }
            dirents.push(ent);
            index += 1;
        }

        out.encode(&dirents)
    }

    async fn op_lock(&mut self, inp: &mut Pdu, out: &mut Pdu) -> Result<()> {
        let fid_val: u32 = inp.decode()?;
        let _flock: Flock = inp.decode()?;

        self.fids.lookup(fid_val)?;

        // Advisory locking is stubbed: every request succeeds.
        out.encode(&LockStatus::SUCCESS.bits())
    }

    async fn op_getlock(&mut self, inp: &mut Pdu, out: &mut Pdu) -> Result<()> {
        let fid_val: u32 = inp.decode()?;
        let mut glock: Getlock = inp.decode()?;

        self.fids.lookup(fid_val)?;

        // No lock ever conflicts.
        glock.typ = LockType::UNLOCK;
        out.encode(&glock)
    }

    async fn op_flush(&mut self, inp: &mut Pdu, out: &mut Pdu) -> Result<()> {
        let oldtag: u16 = inp.decode()?;

        // Nothing is cancelled; the tag named in the body is echoed back.
        out.encode(&oldtag)
    }

    async fn dispatch(&mut self, cmd: MsgType, inp: &mut Pdu, out: &mut Pdu) -> Result<()> {
        use MsgType::*;

        match cmd {
            TVersion => self.op_version(inp, out).await,
            TAttach => self.op_attach(inp, out).await,
            TGetAttr => self.op_getattr(inp, out).await,
            TSetAttr => self.op_setattr(inp, out).await,
            TWalk => self.op_walk(inp, out).await,
            TClunk => self.op_clunk(inp, out).await,
            TStatFs => self.op_statfs(inp, out).await,
            TlOpen => self.op_open(inp, out).await,
            TlCreate => self.op_create(inp, out).await,
            TMkDir => self.op_mkdir(inp, out).await,
            TSymlink => self.op_symlink(inp, out).await,
            TLink => self.op_link(inp, out).await,
            TReadLink => self.op_readlink(inp, out).await,
            TMkNod => self.op_mknod(inp, out).await,
            TRename => self.op_rename(inp, out).await,
            TRemove => self.op_remove(inp, out).await,
            TFSync => self.op_fsync(inp, out).await,
            TRead => self.op_read(inp, out).await,
            TWrite => self.op_write(inp, out).await,
            TReadDir => self.op_readdir(inp, out).await,
            TLock => self.op_lock(inp, out).await,
            TGetLock => self.op_getlock(inp, out).await,
            TFlush => self.op_flush(inp, out).await,
            // Tauth, the xattr and *at families, and anything that is
            // not a known T-message.
            _ => Err(Error::No(EOPNOTSUPP)),
        }
    }
}

/// Service one request delivered by the transport.
///
/// Returns the number of reply bytes placed in `resp` (for the zero-copy
/// read path this includes the bytes written by the facade).
pub async fn do_request<F: Filesystem>(
    server: &mut Server<F>,
    req: &mut SgReader<'_>,
    resp: &mut SgWriter<'_>,
) -> usize {
    let mut inp = Pdu::with_capacity(req.remaining());
    let mut out = Pdu::with_capacity(resp.remaining());

    // Speculatively grab the I/O header; for non-I/O requests the tail
    // is just the first twelve body bytes.
    inp.fill_from(req, IoHeader::SIZE);
    let hdr = IoHeader::parse(inp.data());

    inp.offset = HEADER_LEN;
    out.size = HEADER_LEN;
    inp.id = hdr.id;
    inp.tag = hdr.tag;
    out.id = hdr.id.wrapping_add(1);
    out.tag = hdr.tag;

    let cmd = MsgType::from_u8(hdr.id);
    debug!("← {:?} tag={} size={}", cmd, hdr.tag, hdr.size);

    let mut zero_copy_read = false;
    let res = match cmd {
        Some(MsgType::TRead) if hdr.count > ZERO_COPY_MIN => {
            zero_copy_read = true;
            resp.advance(RREAD_HDR_LEN);
            server.op_read_iov(&mut inp, &mut out, resp).await
        }
        Some(MsgType::TWrite) if hdr.count > ZERO_COPY_MIN => {
            server.op_write_iov(&mut inp, &mut out, req).await
        }
        Some(cmd) => {
            // Pull in the rest of the message body.
            if cmd == MsgType::TWrite {
                inp.fill_from(req, hdr.count as usize);
            } else if hdr.size as usize > IoHeader::SIZE {
                inp.fill_from(req, hdr.size as usize - IoHeader::SIZE);
            }
            server.dispatch(cmd, &mut inp, &mut out).await
        }
        None => Err(Error::No(EOPNOTSUPP)),
    };

    let (id, tag) = (out.id, out.tag);
    match res {
        Ok(()) => {
            // Back-patch the reply header around the encoded body.
            let size = out.size;
            out.size = 0;
            let _ = out.encode(&(size as u32));
            let _ = out.encode(&id);
            let _ = out.encode(&tag);
            out.size = size;
        }
        Err(e) => {
            error!("{:?} tag={}: {}", cmd, tag, e);
            out.size = 0;
            let _ = out.encode(&(RREAD_HDR_LEN as u32));
            let _ = out.encode(&(MsgType::RlError as u8));
            let _ = out.encode(&tag);
            let _ = out.encode(&(e.errno() as u32));
        }
    }

    if zero_copy_read {
        // Only the preamble lives in the out buffer; the data is already
        // in place after it.
        let preamble = RREAD_HDR_LEN.min(out.capacity()).min(out.size);
        resp.write_at(0, &out.data()[..preamble]);
        out.size
    } else {
        resp.copy_from(&out.data()[..out.size.min(out.capacity())])
    }
}
