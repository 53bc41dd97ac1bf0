//! Fixed-capacity ring of recent RTP packets, kept for NACK retransmission.

use crate::packet::RtpPacket;

/// The ring stores packets at `seq % capacity`. [RtpRing::at] is a coarse
/// slot lookup; [RtpRing::fetch_exact] additionally requires the stored
/// packet's sequence to equal the argument.
pub struct RtpRing {
    slots: Vec<Option<RtpPacket>>,
    capacity: usize,
}

impl RtpRing {
    pub fn new(capacity: usize) -> Self {
        let mut slots = Vec::with_capacity(capacity);
        slots.resize_with(capacity, || None);
        Self { slots, capacity }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    fn index(&self, seq: u16) -> usize {
        seq as usize % self.capacity
    }

    /// Stores a packet, dropping whatever occupied the slot.
    pub fn set(&mut self, seq: u16, pkt: RtpPacket) {
        let idx = self.index(seq);
        self.slots[idx] = Some(pkt);
    }

    /// Returns the slot content regardless of whether it holds the requested
    /// sequence.
    pub fn at(&self, seq: u16) -> Option<&RtpPacket> {
        self.slots[self.index(seq)].as_ref()
    }

    /// Returns the packet only when its header sequence matches exactly.
    pub fn fetch_exact(&self, seq: u16) -> Option<&RtpPacket> {
        self.at(seq)
            .filter(|pkt| pkt.header.sequence_number == seq)
    }

    /// Removes and returns the exactly-matching packet; used by the
    /// `nack_no_copy` resend path which takes ownership instead of cloning.
    pub fn take_exact(&mut self, seq: u16) -> Option<RtpPacket> {
        let idx = self.index(seq);
        match &self.slots[idx] {
            Some(pkt) if pkt.header.sequence_number == seq => self.slots[idx].take(),
            _ => None,
        }
    }
}
