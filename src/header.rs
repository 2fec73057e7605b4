//! Header introspection: the thin shim this crate needs over an externally-parsed 802.11
//! MAC header. The header bytes themselves are supplied by the caller (the full frame
//! parser is out of scope here); this module only derives the handful of fields the CCMP
//! and TKIP engines fold into their AAD, nonce, and pseudo-header computations.

use bitfield::bitfield;

bitfield! {
    /// The 16-bit Frame Control field, little-endian on the wire (`fc[0]` is the low byte).
    pub struct FrameControl(u16);
    impl Debug;
    pub protocol_version, _: 1, 0;
    pub raw_type, _: 3, 2;
    pub raw_subtype, _: 7, 4;
    pub to_ds, _: 8;
    pub from_ds, _: 9;
    pub more_frag, _: 10;
    pub retry, _: 11;
    pub pwr_mgt, _: 12;
    pub more_data, _: 13;
    pub protected, set_protected: 14;
    pub order, _: 15;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameClass {
    Management,
    Control,
    Data,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DsStatus {
    NoDs,
    ToDs,
    FromDs,
    DsToDs,
}

/// A view over the first bytes of an 802.11 MAC header. Constructed from a byte slice that
/// must contain at least `header_length()` contiguous bytes — the caller's frame parser is
/// assumed to already guarantee this.
#[derive(Debug, Clone, Copy)]
pub struct FrameHeader<'a> {
    bytes: &'a [u8],
}

impl<'a> FrameHeader<'a> {
    pub fn parse(bytes: &'a [u8]) -> Self {
        assert!(bytes.len() >= 10, "frame too short to contain a frame-control/duration/addr1");
        FrameHeader { bytes }
    }

    fn fc(&self) -> FrameControl {
        FrameControl(u16::from(self.bytes[0]) | (u16::from(self.bytes[1]) << 8))
    }

    pub fn fc0(&self) -> u8 {
        self.bytes[0]
    }

    pub fn fc1(&self) -> u8 {
        self.bytes[1]
    }

    pub fn class(&self) -> FrameClass {
        match self.fc().raw_type() {
            0 => FrameClass::Management,
            1 => FrameClass::Control,
            _ => FrameClass::Data,
        }
    }

    pub fn subtype(&self) -> u8 {
        self.fc().raw_subtype() as u8
    }

    pub fn ds_status(&self) -> DsStatus {
        match (self.fc().to_ds(), self.fc().from_ds()) {
            (false, false) => DsStatus::NoDs,
            (true, false) => DsStatus::ToDs,
            (false, true) => DsStatus::FromDs,
            (true, true) => DsStatus::DsToDs,
        }
    }

    pub fn protected(&self) -> bool {
        self.fc().protected()
    }

    pub fn addr1(&self) -> [u8; 6] {
        self.read_addr(4)
    }

    pub fn addr2(&self) -> [u8; 6] {
        self.read_addr(10)
    }

    pub fn addr3(&self) -> [u8; 6] {
        self.read_addr(16)
    }

    pub fn has_addr4(&self) -> bool {
        self.ds_status() == DsStatus::DsToDs
    }

    pub fn addr4(&self) -> Option<[u8; 6]> {
        if self.has_addr4() {
            Some(self.read_addr(24))
        } else {
            None
        }
    }

    fn read_addr(&self, off: usize) -> [u8; 6] {
        let mut a = [0u8; 6];
        a.copy_from_slice(&self.bytes[off..off + 6]);
        a
    }

    /// Byte offset of the Sequence Control field. Always follows Addr3 directly, regardless
    /// of whether this frame also carries a fourth address (Addr4 follows Sequence Control,
    /// not the other way around).
    fn seq_ctrl_offset(&self) -> usize {
        22
    }

    pub fn seq_ctrl_low(&self) -> u8 {
        self.bytes[self.seq_ctrl_offset()]
    }

    /// QoS Control immediately follows Sequence Control, or Addr4 when present.
    fn qos_ctrl_offset(&self) -> usize {
        self.seq_ctrl_offset() + 2 + if self.has_addr4() { 6 } else { 0 }
    }

    pub fn has_qos(&self) -> bool {
        self.class() == FrameClass::Data && (self.subtype() & 0x08) != 0
    }

    pub fn qos_tid(&self) -> u8 {
        if self.has_qos() {
            self.bytes[self.qos_ctrl_offset()] & 0x0F
        } else {
            0
        }
    }

    /// HT Control is present when the Order bit is set on a QoS data or management frame
    /// transmitted by an HT/VHT station (802.11n §7.1.3.1.10).
    pub fn has_htc(&self) -> bool {
        self.fc().order() && (self.class() == FrameClass::Data || self.class() == FrameClass::Management)
    }

    /// Full header length, including QoS Control and HT Control when present.
    pub fn header_length(&self) -> usize {
        let mut len = self.qos_ctrl_offset();
        if self.has_qos() {
            len += 2;
        }
        if self.has_htc() {
            len += 4;
        }
        len
    }
}
