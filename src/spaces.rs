//! Per-encryption-level packet space state.
//!
//! Each level carries its own packet-number sequence, ack tracker, deferred
//! datagrams awaiting keys, CRYPTO stream reassembly, and (for 1-RTT) key
//! phase bookkeeping.

use std::collections::{BTreeMap, VecDeque};

use bytes::Bytes;

use crate::crypto::Keys;
use crate::endpoint::Datagram;
use crate::packet::EncryptLevel;
use crate::range_set::RangeSet;

/// Bound on tracked ack ranges; everything fits one minimum-MTU ACK frame.
const MAX_ACK_RANGES: usize = 64;

/// In-order reassembly of the CRYPTO stream for the TLS engine.
#[derive(Debug, Default)]
pub struct CryptoAssembler {
    segments: BTreeMap<u64, Bytes>,
    offset: u64,
}

impl CryptoAssembler {
    pub fn insert(&mut self, offset: u64, data: Bytes) {
        if offset + data.len() as u64 <= self.offset || data.is_empty() {
            return;
        }
        self.segments.entry(offset).or_insert(data);
    }

    /// Pop the next contiguous run, if any.
    pub fn read(&mut self) -> Option<Bytes> {
        loop {
            let (&start, _) = self.segments.iter().next()?;
            if start > self.offset {
                return None;
            }
            let data = self.segments.remove(&start).unwrap();
            let end = start + data.len() as u64;
            if end <= self.offset {
                continue;
            }
            let skip = (self.offset - start) as usize;
            self.offset = end;
            return Some(data.slice(skip..));
        }
    }

    pub fn bytes_delivered(&self) -> u64 {
        self.offset
    }
}

/// State for one encryption level.
pub struct PacketSpace {
    pub level: EncryptLevel,

    //
    // Receive
    //
    /// One past the largest packet number successfully received.
    pub next_recv_pn: u64,
    /// Arrival time of the largest received packet, μs.
    pub largest_recv_time: u64,
    /// Every packet number seen, for duplicate suppression.
    recvd: RangeSet,
    /// Packet numbers owed an acknowledgement.
    pub pending_acks: RangeSet,
    /// An ack-eliciting packet arrived since the last ACK we sent.
    pub ack_eliciting_pending: bool,
    /// Skip the delayed-ACK timer for the next flush.
    pub ack_immediately: bool,
    /// Datagrams that arrived before this level's read key.
    pub deferred: VecDeque<Datagram>,

    //
    // Keys
    //
    pub keys: Option<Keys>,
    /// Read keys of the previous 1-RTT generation, kept for reordered
    /// packets from before the phase change.
    pub prev_read_keys: Option<Keys>,
    /// Current key phase bit (1-RTT only).
    pub key_phase: bool,
    /// First packet number of the current read phase.
    pub read_phase_start_pn: u64,
    /// We initiated an update and have not yet seen the peer follow.
    pub awaiting_key_phase_confirm: bool,

    //
    // Send
    //
    pub next_send_pn: u64,
    pub largest_acked: Option<u64>,
    /// Send times of ack-eliciting packets, for RTT sampling. Bounded.
    pub sent_time: BTreeMap<u64, u64>,
    /// Handshake bytes queued for CRYPTO frames at this level.
    pub crypto_send: VecDeque<Bytes>,
    pub crypto_send_offset: u64,
    pub crypto_recv: CryptoAssembler,
}

impl PacketSpace {
    pub fn new(level: EncryptLevel) -> Self {
        PacketSpace {
            level,
            next_recv_pn: 0,
            largest_recv_time: 0,
            recvd: RangeSet::new(),
            pending_acks: RangeSet::new(),
            ack_eliciting_pending: false,
            ack_immediately: false,
            deferred: VecDeque::new(),
            keys: None,
            prev_read_keys: None,
            key_phase: false,
            read_phase_start_pn: 0,
            awaiting_key_phase_confirm: false,
            next_send_pn: 0,
            largest_acked: None,
            sent_time: BTreeMap::new(),
            crypto_send: VecDeque::new(),
            crypto_send_offset: 0,
            crypto_recv: CryptoAssembler::default(),
        }
    }

    /// Record a fully validated packet number. Returns true on duplicate, in
    /// which case the tracker is unchanged.
    pub fn add_packet_number(&mut self, pn: u64) -> bool {
        if self.recvd.contains(pn) {
            return true;
        }
        self.recvd.insert_one(pn);
        self.pending_acks.insert_one(pn);
        while self.pending_acks.len() > MAX_ACK_RANGES {
            self.pending_acks.pop_min();
        }
        if pn >= self.next_recv_pn {
            self.next_recv_pn = pn + 1;
        }
        false
    }

    pub fn ack_frame_pending(&self) -> bool {
        !self.pending_acks.is_empty() && self.ack_eliciting_pending
    }

    /// Called once an ACK frame carrying `acked` has been emitted.
    pub fn on_ack_sent(&mut self, acked: &RangeSet) {
        self.pending_acks.subtract(acked);
        self.ack_eliciting_pending = false;
        self.ack_immediately = false;
    }

    pub fn take_send_pn(&mut self) -> u64 {
        let pn = self.next_send_pn;
        self.next_send_pn += 1;
        pn
    }

    pub fn on_ack_eliciting_sent(&mut self, pn: u64, now: u64) {
        self.sent_time.insert(pn, now);
        while self.sent_time.len() > 256 {
            let &first = self.sent_time.keys().next().unwrap();
            self.sent_time.remove(&first);
        }
    }

    pub fn pending_acks(&self) -> &RangeSet {
        &self.pending_acks
    }

    /// Drop all key material; packets at this level can no longer be read
    /// or written.
    pub fn discard_keys(&mut self) {
        self.keys = None;
        self.prev_read_keys = None;
        self.deferred.clear();
    }

    pub fn has_keys(&self) -> bool {
        self.keys.is_some()
    }

    /// Begin a new read/write key generation. The old read keys stay live
    /// for packets numbered before `start_pn`.
    pub fn advance_key_phase(&mut self, new_keys: Keys, start_pn: u64) {
        self.prev_read_keys = self.keys.take();
        self.keys = Some(new_keys);
        self.key_phase = !self.key_phase;
        self.read_phase_start_pn = start_pn;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn duplicate_detection() {
        let mut space = PacketSpace::new(EncryptLevel::OneRtt);
        assert!(!space.add_packet_number(3));
        assert!(space.add_packet_number(3));
        assert!(!space.add_packet_number(1));
        assert!(!space.add_packet_number(4));
        assert_eq!(space.next_recv_pn, 5);
    }

    #[test]
    fn next_recv_pn_monotonic() {
        let mut space = PacketSpace::new(EncryptLevel::Initial);
        for &pn in &[0u64, 5, 2, 9, 7] {
            space.add_packet_number(pn);
            assert!(space.next_recv_pn >= pn + 1);
        }
        assert_eq!(space.next_recv_pn, 10);
    }

    #[test]
    fn ack_bookkeeping() {
        let mut space = PacketSpace::new(EncryptLevel::OneRtt);
        space.add_packet_number(0);
        space.add_packet_number(1);
        space.ack_eliciting_pending = true;
        assert!(space.ack_frame_pending());
        let sent = space.pending_acks.clone();
        space.on_ack_sent(&sent);
        assert!(!space.ack_frame_pending());
        assert!(space.pending_acks.is_empty());
    }

    #[test]
    fn crypto_assembler_reorders() {
        let mut asm = CryptoAssembler::default();
        asm.insert(6, Bytes::from_static(b"world"));
        assert!(asm.read().is_none());
        asm.insert(0, Bytes::from_static(b"hello "));
        assert_eq!(asm.read().unwrap(), Bytes::from_static(b"hello "));
        assert_eq!(asm.read().unwrap(), Bytes::from_static(b"world"));
        assert!(asm.read().is_none());
        assert_eq!(asm.bytes_delivered(), 11);
    }

    #[test]
    fn crypto_assembler_ignores_replays() {
        let mut asm = CryptoAssembler::default();
        asm.insert(0, Bytes::from_static(b"abc"));
        assert_eq!(asm.read().unwrap(), Bytes::from_static(b"abc"));
        asm.insert(0, Bytes::from_static(b"abc"));
        assert!(asm.read().is_none());
        // Partial overlap delivers only the fresh suffix.
        asm.insert(1, Bytes::from_static(b"bcde"));
        assert_eq!(asm.read().unwrap(), Bytes::from_static(b"de"));
    }

    #[test]
    fn key_phase_advance() {
        use crate::crypto::Keys;
        let mut space = PacketSpace::new(EncryptLevel::OneRtt);
        space.keys = Some(Keys::from_secrets(&[1; 32], &[2; 32]));
        space.advance_key_phase(Keys::from_secrets(&[3; 32], &[4; 32]), 17);
        assert!(space.key_phase);
        assert_eq!(space.read_phase_start_pn, 17);
        assert!(space.prev_read_keys.is_some());
    }
}
