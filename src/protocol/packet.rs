use bytes::Bytes;
use uuid::Uuid;

/// Packet header size: 1 (id) + 16 (device) + 2 (job) + 8 (flags) + 4 (payload len) = 31 bytes
pub const HEADER_SIZE: usize = 31;

/// Message IDs reserved by the connection protocol; every other value is a job type
pub mod message {
    /// Keep-alive / empty reply
    pub const NOP: u8 = 0x00;
    /// First packet of a client handshake
    pub const HELLO: u8 = 0x01;
    /// Server acknowledgement of a Hello
    pub const COMPLETE: u8 = 0x02;
    /// The sending side is closing its session
    pub const SHUTDOWN: u8 = 0x03;
}

/// Packet flag bits and fragment bookkeeping
///
/// Layout: bits 0..16 flag bits, 16..32 fragment position, 32..48 fragment count.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct Flags(u64);

impl Flags {
    /// Single-use delivery; no session is created for this packet
    pub const ONESHOT: u16 = 1 << 0;
    /// The payload carries an embedded packet after the device record
    pub const DATA: u16 = 1 << 1;
    /// The packet is one fragment of a larger packet
    pub const FRAG: u16 = 1 << 2;

    pub fn from_bits(raw: u64) -> Self {
        Self(raw)
    }

    pub fn bits(self) -> u64 {
        self.0
    }

    pub fn has(self, flag: u16) -> bool {
        self.0 & flag as u64 != 0
    }

    pub fn set(&mut self, flag: u16) {
        self.0 |= flag as u64;
    }

    pub fn unset(&mut self, flag: u16) {
        self.0 &= !(flag as u64);
    }

    /// Mark as fragment `position` of `count`
    pub fn set_fragment(&mut self, position: u16, count: u16) {
        self.0 = (self.0 & 0xFFFF) | ((position as u64) << 16) | ((count as u64) << 32);
        self.set(Self::FRAG);
    }

    /// Drop the fragment marker and counters
    pub fn clear_fragment(&mut self) {
        self.0 &= 0xFFFF;
        self.unset(Self::FRAG);
    }

    pub fn fragment_position(self) -> u16 {
        (self.0 >> 16) as u16
    }

    pub fn fragment_count(self) -> u16 {
        (self.0 >> 32) as u16
    }
}

/// Packet is the unit exchanged between sessions
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Packet {
    pub id: u8,
    pub device: Uuid,
    pub job: u16,
    pub flags: Flags,
    pub payload: Bytes,
}

impl Packet {
    /// Create an empty packet with the given message ID
    pub fn new(id: u8) -> Self {
        Self {
            id,
            device: Uuid::nil(),
            job: 0,
            flags: Flags::default(),
            payload: Bytes::new(),
        }
    }

    /// Create a packet with a payload
    pub fn with_payload(id: u8, job: u16, payload: Bytes) -> Self {
        Self {
            job,
            payload,
            ..Self::new(id)
        }
    }

    /// A Nop packet announcing `device`
    pub fn nop(device: Uuid) -> Self {
        Self {
            device,
            ..Self::new(message::NOP)
        }
    }

    /// Set the device field
    pub fn from_device(mut self, device: Uuid) -> Self {
        self.device = device;
        self
    }

    /// Get the total encoded size (header + payload)
    pub fn total_size(&self) -> usize {
        HEADER_SIZE + self.payload.len()
    }

    pub fn is_nop(&self) -> bool {
        self.id == message::NOP && self.payload.is_empty()
    }

    pub fn is_oneshot(&self) -> bool {
        self.flags.has(Flags::ONESHOT)
    }

    pub fn is_fragment(&self) -> bool {
        self.flags.has(Flags::FRAG)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fragment_flags() {
        let mut flags = Flags::default();
        flags.set(Flags::DATA);
        flags.set_fragment(3, 7);
        assert!(flags.has(Flags::FRAG));
        assert!(flags.has(Flags::DATA));
        assert_eq!(flags.fragment_position(), 3);
        assert_eq!(flags.fragment_count(), 7);

        flags.clear_fragment();
        assert!(!flags.has(Flags::FRAG));
        assert!(flags.has(Flags::DATA));
        assert_eq!(flags.fragment_count(), 0);
    }

    #[test]
    fn test_packet_creation() {
        let packet = Packet::with_payload(0x40, 9, Bytes::from("hello"));
        assert_eq!(packet.id, 0x40);
        assert_eq!(packet.job, 9);
        assert_eq!(packet.total_size(), HEADER_SIZE + 5);
        assert!(!packet.is_nop());
        assert!(Packet::nop(Uuid::nil()).is_nop());
    }
}
