//! On-the-wire NVMe structures.
//!
//! Every multi-byte field is read and written through explicit
//! little-endian conversions rather than relying on the host's native
//! endianness, since the wire format is little-endian regardless of host.

/// Submission queue entry, 64 bytes on the wire.
#[derive(Debug, Clone, Copy)]
pub struct Sqe {
    pub cdw0: u32,
    pub nsid: u32,
    pub cdw2: u32,
    pub cdw3: u32,
    pub mptr: u64,
    pub prp1: u64,
    pub prp2: u64,
    pub cdw10: u32,
    pub cdw11: u32,
    pub cdw12: u32,
    pub cdw13: u32,
    pub cdw14: u32,
    pub cdw15: u32,
}

impl Sqe {
    pub const SIZE: usize = 64;

    pub fn new(opcode: u8) -> Self {
        Self {
            cdw0: opcode as u32,
            nsid: 0,
            cdw2: 0,
            cdw3: 0,
            mptr: 0,
            prp1: 0,
            prp2: 0,
            cdw10: 0,
            cdw11: 0,
            cdw12: 0,
            cdw13: 0,
            cdw14: 0,
            cdw15: 0,
        }
    }

    /// Overwrites the command identifier field (bits 16..32 of CDW0),
    /// leaving the opcode and the fused/PRP-or-SGL bits untouched.
    pub fn set_cid(&mut self, cid: u16) {
        self.cdw0 = (self.cdw0 & 0x0000_ffff) | ((cid as u32) << 16);
    }

    pub fn cid(&self) -> u16 {
        (self.cdw0 >> 16) as u16
    }

    pub fn opcode(&self) -> u8 {
        (self.cdw0 & 0xff) as u8
    }

    /// Serializes into a little-endian, packed 64-byte buffer.
    pub fn to_le_bytes(&self) -> [u8; Self::SIZE] {
        let mut buf = [0u8; Self::SIZE];
        buf[0..4].copy_from_slice(&self.cdw0.to_le_bytes());
        buf[4..8].copy_from_slice(&self.nsid.to_le_bytes());
        buf[8..12].copy_from_slice(&self.cdw2.to_le_bytes());
        buf[12..16].copy_from_slice(&self.cdw3.to_le_bytes());
        buf[16..24].copy_from_slice(&self.mptr.to_le_bytes());
        buf[24..32].copy_from_slice(&self.prp1.to_le_bytes());
        buf[32..40].copy_from_slice(&self.prp2.to_le_bytes());
        buf[40..44].copy_from_slice(&self.cdw10.to_le_bytes());
        buf[44..48].copy_from_slice(&self.cdw11.to_le_bytes());
        buf[48..52].copy_from_slice(&self.cdw12.to_le_bytes());
        buf[52..56].copy_from_slice(&self.cdw13.to_le_bytes());
        buf[56..60].copy_from_slice(&self.cdw14.to_le_bytes());
        buf[60..64].copy_from_slice(&self.cdw15.to_le_bytes());
        buf
    }

    pub fn from_le_bytes(buf: &[u8; Self::SIZE]) -> Self {
        let u32_at = |o: usize| u32::from_le_bytes(buf[o..o + 4].try_into().unwrap());
        let u64_at = |o: usize| u64::from_le_bytes(buf[o..o + 8].try_into().unwrap());
        Self {
            cdw0: u32_at(0),
            nsid: u32_at(4),
            cdw2: u32_at(8),
            cdw3: u32_at(12),
            mptr: u64_at(16),
            prp1: u64_at(24),
            prp2: u64_at(32),
            cdw10: u32_at(40),
            cdw11: u32_at(44),
            cdw12: u32_at(48),
            cdw13: u32_at(52),
            cdw14: u32_at(56),
            cdw15: u32_at(60),
        }
    }
}

/// Completion queue entry, 16 bytes on the wire.
#[derive(Debug, Clone, Copy, Default)]
pub struct Cqe {
    pub dw0: u32,
    pub dw1: u32,
    pub sq_head: u16,
    pub sq_id: u16,
    pub cid: u16,
    pub status: u16,
}

impl Cqe {
    pub const SIZE: usize = 16;

    pub fn from_le_bytes(buf: &[u8; Self::SIZE]) -> Self {
        Self {
            dw0: u32::from_le_bytes(buf[0..4].try_into().unwrap()),
            dw1: u32::from_le_bytes(buf[4..8].try_into().unwrap()),
            sq_head: u16::from_le_bytes(buf[8..10].try_into().unwrap()),
            sq_id: u16::from_le_bytes(buf[10..12].try_into().unwrap()),
            cid: u16::from_le_bytes(buf[12..14].try_into().unwrap()),
            status: u16::from_le_bytes(buf[14..16].try_into().unwrap()),
        }
    }

    pub fn to_le_bytes(self) -> [u8; Self::SIZE] {
        let mut buf = [0u8; Self::SIZE];
        buf[0..4].copy_from_slice(&self.dw0.to_le_bytes());
        buf[4..8].copy_from_slice(&self.dw1.to_le_bytes());
        buf[8..10].copy_from_slice(&self.sq_head.to_le_bytes());
        buf[10..12].copy_from_slice(&self.sq_id.to_le_bytes());
        buf[12..14].copy_from_slice(&self.cid.to_le_bytes());
        buf[14..16].copy_from_slice(&self.status.to_le_bytes());
        buf
    }

    /// The phase bit is the low bit of the status field.
    pub fn phase(&self) -> u8 {
        (self.status & 0x1) as u8
    }

    /// Status Code + Status Code Type, with the phase bit masked off.
    pub fn status_code(&self) -> u16 {
        self.status >> 1
    }
}

/// Admin command opcodes this core issues directly.
pub mod admin_opcode {
    pub const DELETE_IO_SQ: u8 = 0x00;
    pub const CREATE_IO_SQ: u8 = 0x01;
    pub const DELETE_IO_CQ: u8 = 0x04;
    pub const CREATE_IO_CQ: u8 = 0x05;
    pub const IDENTIFY: u8 = 0x06;
    pub const SET_FEATURES: u8 = 0x09;
    pub const GET_FEATURES: u8 = 0x0a;
    pub const ASYNC_EVENT_REQUEST: u8 = 0x0c;
}

/// `Set Features` / `Get Features` feature identifiers this core uses.
pub mod feature_id {
    pub const NUMBER_OF_QUEUES: u32 = 0x07;
}

/// The reserved high bit of the command identifier tags AER requests so
/// their completions can be distinguished from ordinary ones.
pub const CID_AER_BIT: u16 = 1 << 15;
