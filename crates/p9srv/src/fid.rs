//! The per-session fid table.

use crate::error::{Error, errno::*};
use crate::utils::Result;
use std::collections::BTreeMap;
use std::collections::btree_map::Entry;

/// One client-chosen handle and the server object it names.
///
/// Entries are exclusively owned by the table. `path` is always valid
/// while the entry exists; walk, create and mkdir may re-point it.
#[derive(Debug)]
pub struct FidEntry<P, F> {
    fid: u32,
    pub uid: u32,
    pub path: P,
    /// Open handle, present between a successful open/create and the
    /// clunk (or remove) that releases it.
    pub file: Option<F>,
}

impl<P, F> FidEntry<P, F> {
    /// Raw client side fid.
    pub fn fid(&self) -> u32 {
        self.fid
    }
}

/// Ordered map of the session's live fids.
#[derive(Debug)]
pub struct FidTable<P, F> {
    map: BTreeMap<u32, FidEntry<P, F>>,
}

impl<P, F> FidTable<P, F> {
    pub fn new() -> FidTable<P, F> {
        FidTable {
            map: BTreeMap::new(),
        }
    }

    pub fn lookup(&self, fid: u32) -> Result<&FidEntry<P, F>> {
        self.map.get(&fid).ok_or(Error::No(ENOENT))
    }

    pub fn lookup_mut(&mut self, fid: u32) -> Result<&mut FidEntry<P, F>> {
        self.map.get_mut(&fid).ok_or(Error::No(ENOENT))
    }

    /// Insert a fresh entry with no open file.
    pub fn insert(&mut self, fid: u32, uid: u32, path: P) -> Result<&mut FidEntry<P, F>> {
        match self.map.entry(fid) {
            Entry::Occupied(_) => Err(Error::No(EEXIST)),
            Entry::Vacant(v) => Ok(v.insert(FidEntry {
                fid,
                uid,
                path,
                file: None,
            })),
        }
    }

    /// Detach an entry; the caller releases any open file.
    pub fn remove(&mut self, fid: u32) -> Option<FidEntry<P, F>> {
        self.map.remove(&fid)
    }

    pub fn contains(&self, fid: u32) -> bool {
        self.map.contains_key(&fid)
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }
}

impl<P, F> Default for FidTable<P, F> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn insert_then_lookup() {
        let mut t: FidTable<&str, ()> = FidTable::new();
        t.insert(1, 1000, "/").unwrap();
        let e = t.lookup(1).unwrap();
        assert_eq!(e.fid(), 1);
        assert_eq!(e.uid, 1000);
        assert_eq!(e.path, "/");
        assert!(e.file.is_none());
    }

    #[test]
    fn missing_fid_is_enoent() {
        let t: FidTable<&str, ()> = FidTable::new();
        assert_eq!(t.lookup(9).unwrap_err().errno(), ENOENT);
    }

    #[test]
    fn duplicate_insert_is_eexist() {
        let mut t: FidTable<&str, ()> = FidTable::new();
        t.insert(1, 0, "/").unwrap();
        assert_eq!(t.insert(1, 0, "/x").unwrap_err().errno(), EEXIST);
        // The original entry is untouched.
        assert_eq!(t.lookup(1).unwrap().path, "/");
    }

    #[test]
    fn remove_detaches_the_entry() {
        let mut t: FidTable<&str, ()> = FidTable::new();
        t.insert(1, 0, "/").unwrap();
        assert!(t.remove(1).is_some());
        assert!(t.remove(1).is_none());
        assert!(t.is_empty());
    }
}
