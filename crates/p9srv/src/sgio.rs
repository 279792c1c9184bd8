//! Scatter-gather views over the transport's borrowed buffer segments.
//!
//! The transport hands `do_request` one [`SgReader`] over the request
//! buffers and one [`SgWriter`] over the response buffers. Both are plain
//! cursors over borrowed segments; nothing is allocated or copied until a
//! caller asks for it, which is what makes the large-I/O fast path
//! zero-copy.

use bytes::Buf;
use std::io::{IoSlice, IoSliceMut};

/// Read-only scatter-gather request buffer.
#[derive(Clone, Debug)]
pub struct SgReader<'a> {
    segs: Vec<&'a [u8]>,
    idx: usize,
    off: usize,
    remaining: usize,
}

impl<'a> SgReader<'a> {
    pub fn new(segs: Vec<&'a [u8]>) -> SgReader<'a> {
        let remaining = segs.iter().map(|s| s.len()).sum();
        SgReader {
            segs,
            idx: 0,
            off: 0,
            remaining,
        }
    }

    /// Bound the readable bytes to `count`, dropping the tail.
    pub fn truncate(&mut self, count: usize) {
        self.remaining = self.remaining.min(count);
    }

    /// Copy into `dst`; returns how many bytes were copied (short when
    /// the reader runs out first).
    pub fn copy_to(&mut self, dst: &mut [u8]) -> usize {
        let mut copied = 0;
        while copied < dst.len() && self.has_remaining() {
            let chunk = self.chunk();
            let n = chunk.len().min(dst.len() - copied);
            dst[copied..copied + n].copy_from_slice(&chunk[..n]);
            self.advance(n);
            copied += n;
        }
        copied
    }

    /// Borrow the remaining bytes, up to `max`, as io slices for
    /// `pwritev`. The cursor is not moved; call [`Buf::advance`] with the
    /// number of bytes actually written.
    pub fn io_slices(&self, max: usize) -> Vec<IoSlice<'_>> {
        let mut left = max.min(self.remaining);
        let mut off = self.off;
        let mut out = Vec::new();
        for seg in &self.segs[self.idx.min(self.segs.len())..] {
            if left == 0 {
                break;
            }
            let seg = &seg[off.min(seg.len())..];
            let take = left.min(seg.len());
            if take > 0 {
                out.push(IoSlice::new(&seg[..take]));
            }
            left -= take;
            off = 0;
        }
        out
    }
}

impl Buf for SgReader<'_> {
    fn remaining(&self) -> usize {
        self.remaining
    }

    fn chunk(&self) -> &[u8] {
        if self.remaining == 0 || self.idx >= self.segs.len() {
            return &[];
        }
        let seg = &self.segs[self.idx][self.off..];
        &seg[..seg.len().min(self.remaining)]
    }

    fn advance(&mut self, cnt: usize) {
        let mut cnt = cnt.min(self.remaining);
        self.remaining -= cnt;
        while cnt > 0 {
            let seg_left = self.segs[self.idx].len() - self.off;
            if cnt < seg_left {
                self.off += cnt;
                break;
            }
            cnt -= seg_left;
            self.idx += 1;
            self.off = 0;
        }
    }
}

/// Writable scatter-gather response buffer.
#[derive(Debug)]
pub struct SgWriter<'a> {
    segs: Vec<&'a mut [u8]>,
    idx: usize,
    off: usize,
    pos: usize,
    len: usize,
}

impl<'a> SgWriter<'a> {
    pub fn new(segs: Vec<&'a mut [u8]>) -> SgWriter<'a> {
        let len = segs.iter().map(|s| s.len()).sum();
        SgWriter {
            segs,
            idx: 0,
            off: 0,
            pos: 0,
            len,
        }
    }

    /// Total writable bytes.
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Bytes left after the cursor.
    pub fn remaining(&self) -> usize {
        self.len - self.pos
    }

    /// Cursor position from the start of the buffer.
    pub fn position(&self) -> usize {
        self.pos
    }

    /// Move the cursor forward without writing (reserve space).
    pub fn advance(&mut self, cnt: usize) {
        let mut cnt = cnt.min(self.remaining());
        self.pos += cnt;
        while cnt > 0 {
            let seg_left = self.segs[self.idx].len() - self.off;
            if cnt < seg_left {
                self.off += cnt;
                break;
            }
            cnt -= seg_left;
            self.idx += 1;
            self.off = 0;
        }
    }

    /// Copy from `src` at the cursor; returns how many bytes fit.
    pub fn copy_from(&mut self, src: &[u8]) -> usize {
        let mut copied = 0;
        while copied < src.len() && self.remaining() > 0 {
            let off = self.off;
            let seg = &mut self.segs[self.idx];
            let n = (seg.len() - off).min(src.len() - copied);
            seg[off..off + n].copy_from_slice(&src[copied..copied + n]);
            copied += n;
            self.advance(n);
        }
        copied
    }

    /// Copy `src` at an absolute position, leaving the cursor alone.
    /// Used to back-patch a reply preamble after zero-copied data.
    pub fn write_at(&mut self, mut pos: usize, src: &[u8]) -> usize {
        let mut copied = 0;
        for seg in self.segs.iter_mut() {
            if copied == src.len() {
                break;
            }
            if pos >= seg.len() {
                pos -= seg.len();
                continue;
            }
            let n = (seg.len() - pos).min(src.len() - copied);
            seg[pos..pos + n].copy_from_slice(&src[copied..copied + n]);
            copied += n;
            pos = 0;
        }
        copied
    }

    /// Borrow the space after the cursor, up to `max` bytes, as mutable
    /// io slices for `preadv`. The cursor is not moved; call
    /// [`SgWriter::advance`] with the number of bytes actually read.
    pub fn io_slices_mut(&mut self, max: usize) -> Vec<IoSliceMut<'_>> {
        let mut left = max.min(self.len - self.pos);
        let mut off = self.off;
        let mut out = Vec::new();
        let start = self.idx.min(self.segs.len());
        for seg in self.segs[start..].iter_mut() {
            if left == 0 {
                break;
            }
            let seg_off = off.min(seg.len());
            let tail: &mut [u8] = &mut seg[seg_off..];
            let take = left.min(tail.len());
            if take > 0 {
                let (head, _) = tail.split_at_mut(take);
                out.push(IoSliceMut::new(head));
            }
            left -= take;
            off = 0;
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reader_crosses_segment_boundaries() {
        let (a, b, c) = ([1u8, 2], [3u8, 4, 5], [6u8]);
        let mut r = SgReader::new(vec![&a, &b, &c]);
        assert_eq!(r.remaining(), 6);
        assert_eq!(r.chunk(), &[1, 2]);

        let mut dst = [0u8; 4];
        assert_eq!(r.copy_to(&mut dst), 4);
        assert_eq!(dst, [1, 2, 3, 4]);
        assert_eq!(r.remaining(), 2);

        let mut rest = [0u8; 8];
        assert_eq!(r.copy_to(&mut rest), 2);
        assert_eq!(&rest[..2], &[5, 6]);
        assert_eq!(r.remaining(), 0);
        assert_eq!(r.chunk(), &[] as &[u8]);
    }

    #[test]
    fn reader_truncate_bounds_the_tail() {
        let seg = [1u8, 2, 3, 4, 5];
        let mut r = SgReader::new(vec![&seg]);
        r.advance(1);
        r.truncate(2);
        assert_eq!(r.remaining(), 2);
        assert_eq!(r.chunk(), &[2, 3]);
    }

    #[test]
    fn reader_io_slices_respect_cursor_and_max() {
        let (a, b) = ([1u8, 2, 3], [4u8, 5, 6]);
        let mut r = SgReader::new(vec![&a, &b]);
        r.advance(2);
        let iov = r.io_slices(3);
        assert_eq!(iov.len(), 2);
        assert_eq!(&*iov[0], &[3]);
        assert_eq!(&*iov[1], &[4, 5]);
    }

    #[test]
    fn writer_copies_across_segments() {
        let (mut a, mut b) = ([0u8; 3], [0u8; 4]);
        let mut w = SgWriter::new(vec![&mut a, &mut b]);
        assert_eq!(w.len(), 7);
        assert_eq!(w.copy_from(&[1, 2, 3, 4, 5]), 5);
        assert_eq!(w.position(), 5);
        assert_eq!(w.remaining(), 2);
        drop(w);
        assert_eq!(a, [1, 2, 3]);
        assert_eq!(b, [4, 5, 0, 0]);
    }

    #[test]
    fn writer_saturates_at_the_end() {
        let mut a = [0u8; 2];
        let mut w = SgWriter::new(vec![&mut a]);
        assert_eq!(w.copy_from(&[1, 2, 3]), 2);
        assert_eq!(w.remaining(), 0);
        assert_eq!(w.copy_from(&[9]), 0);
    }

    #[test]
    fn writer_write_at_ignores_the_cursor() {
        let (mut a, mut b) = ([0u8; 2], [0u8; 4]);
        let mut w = SgWriter::new(vec![&mut a, &mut b]);
        w.advance(4);
        assert_eq!(w.write_at(1, &[7, 8, 9]), 3);
        assert_eq!(w.position(), 4);
        drop(w);
        assert_eq!(a, [0, 7]);
        assert_eq!(b, [8, 9, 0, 0]);
    }

    #[test]
    fn writer_io_slices_cover_the_tail() {
        let (mut a, mut b) = ([0u8; 3], [0u8; 3]);
        let mut w = SgWriter::new(vec![&mut a, &mut b]);
        w.advance(2);
        {
            let mut iov = w.io_slices_mut(3);
            assert_eq!(iov.len(), 2);
            iov[0].copy_from_slice(&[1]);
            iov[1].copy_from_slice(&[2, 3]);
        }
        w.advance(3);
        assert_eq!(w.remaining(), 1);
        drop(w);
        assert_eq!(a, [0, 0, 1]);
        assert_eq!(b, [2, 3, 0]);
    }
}
