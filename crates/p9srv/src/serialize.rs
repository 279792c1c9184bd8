//! Serialize/deserialize 9P message fields into/from bounded buffers.

use crate::sgio::SgReader;
use crate::utils::Result;
use crate::{fcall::*, io_err, res};
use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use std::io::{self, Read};
use std::mem;

fn read_exact<R: Read + ?Sized>(r: &mut R, size: usize) -> io::Result<Vec<u8>> {
    let mut buf = vec![0; size];
    r.read_exact(&mut buf[..]).and(Ok(buf))
}

/// Trait representing a type which can be serialized into binary
pub trait Encodable {
    /// Encode self to w and return the number of bytes encoded
    fn encode<W: WriteBytesExt>(&self, w: &mut W) -> io::Result<usize>;
}

impl Encodable for u8 {
    fn encode<W: WriteBytesExt>(&self, w: &mut W) -> io::Result<usize> {
        w.write_u8(*self).and(Ok(mem::size_of::<Self>()))
    }
}

impl Encodable for u16 {
    fn encode<W: WriteBytesExt>(&self, w: &mut W) -> io::Result<usize> {
        w.write_u16::<LittleEndian>(*self)
            .and(Ok(mem::size_of::<Self>()))
    }
}

impl Encodable for u32 {
    fn encode<W: WriteBytesExt>(&self, w: &mut W) -> io::Result<usize> {
        w.write_u32::<LittleEndian>(*self)
            .and(Ok(mem::size_of::<Self>()))
    }
}

impl Encodable for u64 {
    fn encode<W: WriteBytesExt>(&self, w: &mut W) -> io::Result<usize> {
        w.write_u64::<LittleEndian>(*self)
            .and(Ok(mem::size_of::<Self>()))
    }
}

impl Encodable for String {
    fn encode<W: WriteBytesExt>(&self, w: &mut W) -> io::Result<usize> {
        let mut bytes = (self.len() as u16).encode(w)?;
        bytes += w.write_all(self.as_bytes()).and(Ok(self.len()))?;
        Ok(bytes)
    }
}

impl Encodable for QId {
    fn encode<W: WriteBytesExt>(&self, w: &mut W) -> io::Result<usize> {
        let mut bytes = self.typ.bits().encode(w)?;
        bytes += self.version.encode(w)?;
        bytes += self.path.encode(w)?;
        Ok(bytes)
    }
}

impl Encodable for StatFs {
    fn encode<W: WriteBytesExt>(&self, w: &mut W) -> io::Result<usize> {
        let mut bytes = self.typ.encode(w)?;
        bytes += self.bsize.encode(w)?;
        bytes += self.blocks.encode(w)?;
        bytes += self.bfree.encode(w)?;
        bytes += self.bavail.encode(w)?;
        bytes += self.files.encode(w)?;
        bytes += self.ffree.encode(w)?;
        bytes += self.fsid.encode(w)?;
        bytes += self.namelen.encode(w)?;
        Ok(bytes)
    }
}

impl Encodable for Time {
    fn encode<W: WriteBytesExt>(&self, w: &mut W) -> io::Result<usize> {
        let mut bytes = self.sec.encode(w)?;
        bytes += self.nsec.encode(w)?;
        Ok(bytes)
    }
}

// The `ino` field travels in the qid, not here.
impl Encodable for Stat {
    fn encode<W: WriteBytesExt>(&self, w: &mut W) -> io::Result<usize> {
        let mut bytes = self.mode.encode(w)?;
        bytes += self.uid.encode(w)?;
        bytes += self.gid.encode(w)?;
        bytes += self.nlink.encode(w)?;
        bytes += self.rdev.encode(w)?;
        bytes += self.size.encode(w)?;
        bytes += self.blksize.encode(w)?;
        bytes += self.blocks.encode(w)?;
        bytes += self.atime.encode(w)?;
        bytes += self.mtime.encode(w)?;
        bytes += self.ctime.encode(w)?;
        Ok(bytes)
    }
}

impl Encodable for SetAttr {
    fn encode<W: WriteBytesExt>(&self, w: &mut W) -> io::Result<usize> {
        let mut bytes = self.mode.encode(w)?;
        bytes += self.uid.encode(w)?;
        bytes += self.gid.encode(w)?;
        bytes += self.size.encode(w)?;
        bytes += self.atime.encode(w)?;
        bytes += self.mtime.encode(w)?;
        Ok(bytes)
    }
}

impl Encodable for DirEntry {
    fn encode<W: WriteBytesExt>(&self, w: &mut W) -> io::Result<usize> {
        let mut bytes = self.qid.encode(w)?;
        bytes += self.offset.encode(w)?;
        bytes += self.typ.encode(w)?;
        bytes += self.name.encode(w)?;
        Ok(bytes)
    }
}

impl Encodable for DirEntryData {
    fn encode<W: WriteBytesExt>(&self, w: &mut W) -> io::Result<usize> {
        let mut bytes = self.size().encode(w)?;
        for entry in self.data() {
            bytes += entry.encode(w)?;
        }
        Ok(bytes)
    }
}

impl Encodable for Flock {
    fn encode<W: WriteBytesExt>(&self, w: &mut W) -> io::Result<usize> {
        let mut bytes = self.typ.bits().encode(w)?;
        bytes += self.flags.bits().encode(w)?;
        bytes += self.start.encode(w)?;
        bytes += self.length.encode(w)?;
        bytes += self.proc_id.encode(w)?;
        bytes += self.client_id.encode(w)?;
        Ok(bytes)
    }
}

impl Encodable for Getlock {
    fn encode<W: WriteBytesExt>(&self, w: &mut W) -> io::Result<usize> {
        let mut bytes = self.typ.bits().encode(w)?;
        bytes += self.start.encode(w)?;
        bytes += self.length.encode(w)?;
        bytes += self.proc_id.encode(w)?;
        bytes += self.client_id.encode(w)?;
        Ok(bytes)
    }
}

impl<T: Encodable> Encodable for Vec<T> {
    fn encode<W: WriteBytesExt>(&self, w: &mut W) -> io::Result<usize> {
        let mut bytes = (self.len() as u16).encode(w)?;
        for item in self {
            bytes += item.encode(w)?;
        }
        Ok(bytes)
    }
}

/// Trait representing a type which can be deserialized from binary
pub trait Decodable: Sized {
    fn decode<R: ReadBytesExt>(r: &mut R) -> io::Result<Self>;
}

impl Decodable for u8 {
    fn decode<R: ReadBytesExt>(r: &mut R) -> io::Result<Self> {
        r.read_u8()
    }
}

impl Decodable for u16 {
    fn decode<R: ReadBytesExt>(r: &mut R) -> io::Result<Self> {
        r.read_u16::<LittleEndian>()
    }
}

impl Decodable for u32 {
    fn decode<R: ReadBytesExt>(r: &mut R) -> io::Result<Self> {
        r.read_u32::<LittleEndian>()
    }
}

impl Decodable for u64 {
    fn decode<R: ReadBytesExt>(r: &mut R) -> io::Result<Self> {
        r.read_u64::<LittleEndian>()
    }
}

impl Decodable for String {
    fn decode<R: ReadBytesExt>(r: &mut R) -> io::Result<Self> {
        let len: u16 = Decodable::decode(r)?;
        String::from_utf8(read_exact(r, len as usize)?)
            .map_err(|_| io_err!(InvalidData, "invalid UTF-8 sequence"))
    }
}

impl Decodable for QId {
    fn decode<R: ReadBytesExt>(r: &mut R) -> io::Result<Self> {
        Ok(QId {
            typ: QIdType::from_bits_truncate(Decodable::decode(r)?),
            version: Decodable::decode(r)?,
            path: Decodable::decode(r)?,
        })
    }
}

impl Decodable for StatFs {
    fn decode<R: ReadBytesExt>(r: &mut R) -> io::Result<Self> {
        Ok(StatFs {
            typ: Decodable::decode(r)?,
            bsize: Decodable::decode(r)?,
            blocks: Decodable::decode(r)?,
            bfree: Decodable::decode(r)?,
            bavail: Decodable::decode(r)?,
            files: Decodable::decode(r)?,
            ffree: Decodable::decode(r)?,
            fsid: Decodable::decode(r)?,
            namelen: Decodable::decode(r)?,
        })
    }
}

impl Decodable for Time {
    fn decode<R: ReadBytesExt>(r: &mut R) -> io::Result<Self> {
        Ok(Time {
            sec: Decodable::decode(r)?,
            nsec: Decodable::decode(r)?,
        })
    }
}

impl Decodable for Stat {
    fn decode<R: ReadBytesExt>(r: &mut R) -> io::Result<Self> {
        Ok(Stat {
            ino: 0,
            mode: Decodable::decode(r)?,
            uid: Decodable::decode(r)?,
            gid: Decodable::decode(r)?,
            nlink: Decodable::decode(r)?,
            rdev: Decodable::decode(r)?,
            size: Decodable::decode(r)?,
            blksize: Decodable::decode(r)?,
            blocks: Decodable::decode(r)?,
            atime: Decodable::decode(r)?,
            mtime: Decodable::decode(r)?,
            ctime: Decodable::decode(r)?,
        })
    }
}

impl Decodable for SetAttr {
    fn decode<R: ReadBytesExt>(r: &mut R) -> io::Result<Self> {
        Ok(SetAttr {
            mode: Decodable::decode(r)?,
            uid: Decodable::decode(r)?,
            gid: Decodable::decode(r)?,
            size: Decodable::decode(r)?,
            atime: Decodable::decode(r)?,
            mtime: Decodable::decode(r)?,
        })
    }
}

impl Decodable for DirEntry {
    fn decode<R: ReadBytesExt>(r: &mut R) -> io::Result<Self> {
        Ok(DirEntry {
            qid: Decodable::decode(r)?,
            offset: Decodable::decode(r)?,
            typ: Decodable::decode(r)?,
            name: Decodable::decode(r)?,
        })
    }
}

impl Decodable for DirEntryData {
    fn decode<R: ReadBytesExt>(r: &mut R) -> io::Result<Self> {
        let count: u32 = Decodable::decode(r)?;
        let mut data = Vec::new();
        let mut parsed: u32 = 0;
        while parsed < count {
            let entry: DirEntry = Decodable::decode(r)?;
            parsed += entry.size();
            data.push(entry);
        }
        Ok(DirEntryData::with(data))
    }
}

impl Decodable for Flock {
    fn decode<R: ReadBytesExt>(r: &mut R) -> io::Result<Self> {
        Ok(Flock {
            typ: LockType::from_bits_truncate(Decodable::decode(r)?),
            flags: LockFlag::from_bits_truncate(Decodable::decode(r)?),
            start: Decodable::decode(r)?,
            length: Decodable::decode(r)?,
            proc_id: Decodable::decode(r)?,
            client_id: Decodable::decode(r)?,
        })
    }
}

impl Decodable for Getlock {
    fn decode<R: ReadBytesExt>(r: &mut R) -> io::Result<Self> {
        Ok(Getlock {
            typ: LockType::from_bits_truncate(Decodable::decode(r)?),
            start: Decodable::decode(r)?,
            length: Decodable::decode(r)?,
            proc_id: Decodable::decode(r)?,
            client_id: Decodable::decode(r)?,
        })
    }
}

impl<T: Decodable> Decodable for Vec<T> {
    fn decode<R: ReadBytesExt>(r: &mut R) -> io::Result<Self> {
        let len: u16 = Decodable::decode(r)?;
        let mut buf = Vec::new();
        for _ in 0..len {
            buf.push(Decodable::decode(r)?);
        }
        Ok(buf)
    }
}

/// One 9P message buffer: a bounded byte area with independent read and
/// write cursors, plus the header fields the dispatcher tracks.
///
/// All accesses are checked against the capacity. A read past the end of
/// the buffer fails (`EINVAL` on the wire); reads between the filled
/// length and the capacity observe zeroes.
#[derive(Clone, Debug)]
pub struct Pdu {
    sdata: Vec<u8>,
    /// Write cursor; for a finished reply this is the message length.
    pub size: usize,
    /// Read cursor.
    pub offset: usize,
    pub id: u8,
    pub tag: u16,
}

impl Pdu {
    pub fn with_capacity(capacity: usize) -> Pdu {
        Pdu {
            sdata: vec![0; capacity],
            size: 0,
            offset: 0,
            id: 0,
            tag: 0,
        }
    }

    pub fn capacity(&self) -> usize {
        self.sdata.len()
    }

    pub fn data(&self) -> &[u8] {
        &self.sdata
    }

    pub fn data_mut(&mut self) -> &mut [u8] {
        &mut self.sdata
    }

    /// Copy at most `count` bytes from the request iterator onto the
    /// write cursor, bounded by the remaining capacity. Returns the
    /// number of bytes taken.
    pub fn fill_from(&mut self, src: &mut SgReader<'_>, count: usize) -> usize {
        let start = self.size.min(self.capacity());
        let len = count.min(self.capacity() - start);
        let n = src.copy_to(&mut self.sdata[start..start + len]);
        self.size = start + n;
        n
    }

    /// Decode one value at the read cursor.
    pub fn decode<T: Decodable>(&mut self) -> Result<T> {
        let mut rest = &self.sdata[self.offset.min(self.capacity())..];
        let len = rest.len();
        let v = T::decode(&mut rest)?;
        self.offset += len - rest.len();
        Ok(v)
    }

    /// Encode one value at the write cursor. Overflowing the capacity
    /// fails without advancing the cursor.
    pub fn encode<T: Encodable>(&mut self, v: &T) -> Result<()> {
        let start = self.size.min(self.capacity());
        let mut rest = &mut self.sdata[start..];
        let n = v.encode(&mut rest)?;
        self.size = start + n;
        Ok(())
    }

    /// Borrow `len` raw bytes at the read cursor (the `Twrite` payload).
    pub fn read_slice(&mut self, len: usize) -> Result<&[u8]> {
        if self.offset + len > self.capacity() {
            return res!(io_err!(UnexpectedEof, "truncated payload"));
        }
        let s = &self.sdata[self.offset..self.offset + len];
        self.offset += len;
        Ok(s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn roundtrip<T: Encodable + Decodable + PartialEq + std::fmt::Debug>(v: &T) {
        let mut pdu = Pdu::with_capacity(512);
        pdu.encode(v).unwrap();
        let got: T = pdu.decode().unwrap();
        assert_eq!(&got, v);
        assert_eq!(pdu.offset, pdu.size);
    }

    #[test]
    fn integers_roundtrip() {
        roundtrip(&0xabu8);
        roundtrip(&0xdeadu16);
        roundtrip(&0xdeadbeefu32);
        roundtrip(&0xdeadbeefcafef00du64);
    }

    #[test]
    fn strings_roundtrip() {
        roundtrip(&"".to_owned());
        roundtrip(&"hello".to_owned());
        roundtrip(&"snowman ☃".to_owned());
    }

    #[test]
    fn qids_roundtrip() {
        roundtrip(&QId {
            typ: QIdType::DIR,
            version: 7,
            path: 0x1234_5678_9abc_def0,
        });
        roundtrip(&vec![
            QId::default(),
            QId {
                typ: QIdType::SYMLINK,
                version: 1,
                path: 2,
            },
        ]);
    }

    #[test]
    fn stats_roundtrip_without_ino() {
        let st = Stat {
            ino: 99,
            mode: 0o100644,
            uid: 1000,
            gid: 1000,
            nlink: 1,
            rdev: 0,
            size: 42,
            blksize: 4096,
            blocks: 1,
            atime: Time { sec: 1, nsec: 2 },
            mtime: Time { sec: 3, nsec: 4 },
            ctime: Time { sec: 5, nsec: 6 },
        };
        let mut pdu = Pdu::with_capacity(512);
        pdu.encode(&st).unwrap();
        let got: Stat = pdu.decode().unwrap();
        // The inode travels in the qid, not the stat encoding.
        assert_eq!(got, Stat { ino: 0, ..st });
    }

    #[test]
    fn statfs_roundtrip() {
        roundtrip(&StatFs {
            typ: 0,
            bsize: 4096,
            blocks: 100,
            bfree: 50,
            bavail: 40,
            files: 10,
            ffree: 5,
            fsid: 0xdead,
            namelen: 255,
        });
    }

    #[test]
    fn locks_roundtrip() {
        roundtrip(&Flock {
            typ: LockType::WRLOCK,
            flags: LockFlag::BLOCK,
            start: 0,
            length: 100,
            proc_id: 42,
            client_id: "mach".to_owned(),
        });
        roundtrip(&Getlock {
            typ: LockType::UNLOCK,
            start: 8,
            length: 16,
            proc_id: 7,
            client_id: "mach".to_owned(),
        });
    }

    #[test]
    fn dir_entries_roundtrip_with_exact_count() {
        let mut data = DirEntryData::new();
        data.push(DirEntry {
            qid: QId::default(),
            offset: 0,
            typ: 4,
            name: ".".to_owned(),
        });
        data.push(DirEntry {
            qid: QId::default(),
            offset: 1,
            typ: 8,
            name: "file".to_owned(),
        });

        let mut pdu = Pdu::with_capacity(512);
        pdu.encode(&data).unwrap();
        assert_eq!(pdu.size, 4 + data.size() as usize);
        let got: DirEntryData = pdu.decode().unwrap();
        assert_eq!(got, data);
    }

    #[test]
    fn setattr_roundtrip() {
        roundtrip(&SetAttr {
            mode: 0o644,
            uid: 1,
            gid: 2,
            size: 3,
            atime: Time { sec: 4, nsec: 5 },
            mtime: Time { sec: 6, nsec: 7 },
        });
    }

    #[test]
    fn decode_past_capacity_fails() {
        let mut pdu = Pdu::with_capacity(3);
        assert!(pdu.decode::<u32>().is_err());

        let mut pdu = Pdu::with_capacity(4);
        // A string length pointing past the end of the buffer.
        pdu.encode(&0xffffu16).unwrap();
        pdu.offset = 0;
        assert!(pdu.decode::<String>().is_err());
    }

    #[test]
    fn unfilled_area_reads_as_zeroes() {
        let mut pdu = Pdu::with_capacity(8);
        assert_eq!(pdu.decode::<u64>().unwrap(), 0);
    }

    #[test]
    fn encode_overflow_fails() {
        let mut pdu = Pdu::with_capacity(6);
        pdu.encode(&0u32).unwrap();
        assert!(pdu.encode(&0u32).is_err());
    }

    #[test]
    fn read_slice_consumes_payload() {
        let mut pdu = Pdu::with_capacity(8);
        pdu.encode(&0x04030201u32).unwrap();
        pdu.offset = 1;
        assert_eq!(pdu.read_slice(2).unwrap(), &[2, 3]);
        assert_eq!(pdu.offset, 3);
        assert!(pdu.read_slice(6).is_err());
    }
}
