//! Source and destination connection-ID tables.
//!
//! Both tables are ordered sequences backed by a slab arena; external
//! references (the binding's lookup table, reset-token matching) hold the CID
//! value itself and never extend an entry's lifetime.

use constant_time_eq::constant_time_eq;
use slab::Slab;
use std::collections::VecDeque;

use crate::packet::ConnectionId;
use crate::RESET_TOKEN_SIZE;

/// A CID we offered to the peer.
#[derive(Debug)]
pub struct LocalCid {
    pub cid: ConnectionId,
    pub sequence: u64,
    /// Set when the first incoming packet targets this CID.
    pub used_by_peer: bool,
    pub retired: bool,
}

/// A CID the peer offered us.
#[derive(Debug)]
pub struct RemoteCid {
    pub cid: ConnectionId,
    pub sequence: u64,
    pub reset_token: Option<[u8; RESET_TOKEN_SIZE]>,
    pub retired: bool,
}

#[derive(Debug, Default)]
pub struct LocalCidTable {
    entries: Slab<LocalCid>,
    order: VecDeque<usize>,
}

impl LocalCidTable {
    pub fn new() -> Self {
        Default::default()
    }

    /// Initial CIDs go to the head so lookups favor them during handshake.
    pub fn push_front(&mut self, entry: LocalCid) {
        let key = self.entries.insert(entry);
        self.order.push_front(key);
    }

    pub fn push_back(&mut self, entry: LocalCid) {
        let key = self.entries.insert(entry);
        self.order.push_back(key);
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &LocalCid> {
        self.order.iter().map(move |&key| &self.entries[key])
    }

    pub fn get_mut(&mut self, cid: &ConnectionId) -> Option<&mut LocalCid> {
        let entries = &mut self.entries;
        let key = self
            .order
            .iter()
            .find(|&&key| entries[key].cid == *cid)
            .cloned()?;
        Some(&mut self.entries[key])
    }

    pub fn remove_by_sequence(&mut self, sequence: u64) -> Option<LocalCid> {
        let entries = &self.entries;
        let pos = self
            .order
            .iter()
            .position(|&key| entries[key].sequence == sequence)?;
        let key = self.order.remove(pos).unwrap();
        Some(self.entries.remove(key))
    }

    /// Discard every entry, yielding the CIDs for binding deregistration.
    pub fn drain(&mut self) -> Vec<ConnectionId> {
        let cids = self.iter().map(|e| e.cid).collect();
        self.entries.clear();
        self.order.clear();
        cids
    }
}

#[derive(Debug, Default)]
pub struct RemoteCidTable {
    entries: Slab<RemoteCid>,
    order: VecDeque<usize>,
    /// CIDs the peer has issued over the connection's lifetime.
    pub issued: u64,
}

impl RemoteCidTable {
    pub fn new() -> Self {
        Default::default()
    }

    /// The CID outgoing packets are addressed with.
    pub fn current(&self) -> Option<&RemoteCid> {
        self.order.front().map(move |&key| &self.entries[key])
    }

    pub fn current_mut(&mut self) -> Option<&mut RemoteCid> {
        let key = *self.order.front()?;
        Some(&mut self.entries[key])
    }

    pub fn push_back(&mut self, entry: RemoteCid) {
        self.issued += 1;
        let key = self.entries.insert(entry);
        self.order.push_back(key);
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &RemoteCid> {
        self.order.iter().map(move |&key| &self.entries[key])
    }

    /// Retire the current CID and promote the next issued one. Returns the
    /// sequence number to RETIRE_CONNECTION_ID, or None when the peer has
    /// given us nothing to rotate onto.
    pub fn retire_current(&mut self) -> Option<u64> {
        if self.order.len() < 2 {
            return None;
        }
        let key = self.order.pop_front().unwrap();
        let retired = self.entries.remove(key);
        Some(retired.sequence)
    }

    /// Replace the provisional CID the client invented with the one the
    /// server actually chose in its first response.
    pub fn replace_current(&mut self, cid: ConnectionId) {
        if let Some(entry) = self.current_mut() {
            entry.cid = cid;
        }
    }

    /// Constant-time comparison of a packet's trailing bytes against every
    /// stored reset token.
    pub fn matches_reset_token(&self, tail: &[u8; RESET_TOKEN_SIZE]) -> bool {
        self.iter().any(|entry| match entry.reset_token {
            Some(ref token) => constant_time_eq(token, tail),
            None => false,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cid(byte: u8) -> ConnectionId {
        ConnectionId::new(&[byte; 8])
    }

    #[test]
    fn local_ordering_and_removal() {
        let mut table = LocalCidTable::new();
        table.push_back(LocalCid {
            cid: cid(2),
            sequence: 1,
            used_by_peer: false,
            retired: false,
        });
        table.push_front(LocalCid {
            cid: cid(1),
            sequence: 0,
            used_by_peer: false,
            retired: false,
        });
        assert_eq!(
            table.iter().map(|e| e.sequence).collect::<Vec<_>>(),
            vec![0, 1]
        );
        table.get_mut(&cid(2)).unwrap().used_by_peer = true;
        let removed = table.remove_by_sequence(0).unwrap();
        assert_eq!(removed.cid, cid(1));
        assert_eq!(table.len(), 1);
        assert!(table.remove_by_sequence(0).is_none());
    }

    #[test]
    fn remote_rotation() {
        let mut table = RemoteCidTable::new();
        table.push_back(RemoteCid {
            cid: cid(1),
            sequence: 0,
            reset_token: None,
            retired: false,
        });
        // Nothing to rotate onto yet.
        assert_eq!(table.retire_current(), None);
        table.push_back(RemoteCid {
            cid: cid(2),
            sequence: 1,
            reset_token: Some([7; RESET_TOKEN_SIZE]),
            retired: false,
        });
        assert_eq!(table.retire_current(), Some(0));
        assert_eq!(table.current().unwrap().cid, cid(2));
        assert_eq!(table.issued, 2);
    }

    #[test]
    fn reset_token_matching() {
        let mut table = RemoteCidTable::new();
        table.push_back(RemoteCid {
            cid: cid(1),
            sequence: 0,
            reset_token: Some([0xee; RESET_TOKEN_SIZE]),
            retired: false,
        });
        assert!(table.matches_reset_token(&[0xee; RESET_TOKEN_SIZE]));
        assert!(!table.matches_reset_token(&[0xdd; RESET_TOKEN_SIZE]));
    }

    #[test]
    fn replace_provisional_cid() {
        let mut table = RemoteCidTable::new();
        table.push_back(RemoteCid {
            cid: cid(9),
            sequence: 0,
            reset_token: None,
            retired: false,
        });
        table.replace_current(cid(5));
        assert_eq!(table.current().unwrap().cid, cid(5));
    }
}
