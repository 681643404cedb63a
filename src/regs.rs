//! NVMe register layout — offsets, decode/encode helpers and doorbell
//! arithmetic, accessed through the `Mmio` collaborator trait rather than
//! direct bare-metal reads.

use bitflags::bitflags;

/// Byte offset of `CAP` (64-bit) within the register BAR.
pub const REG_CAP: usize = 0x00;
/// Byte offset of `VS` (32-bit).
pub const REG_VS: usize = 0x08;
/// Byte offset of `CC` (32-bit).
pub const REG_CC: usize = 0x14;
/// Byte offset of `CSTS` (32-bit).
pub const REG_CSTS: usize = 0x1C;
/// Byte offset of `AQA` (32-bit).
pub const REG_AQA: usize = 0x24;
/// Byte offset of `ASQ` (64-bit).
pub const REG_ASQ: usize = 0x28;
/// Byte offset of `ACQ` (64-bit).
pub const REG_ACQ: usize = 0x30;

/// Length of the register window mapped at BAR offset 0.
pub const REGISTER_WINDOW_LEN: usize = 0x1000;
/// BAR offset at which the doorbell window starts.
pub const DOORBELL_WINDOW_OFFSET: usize = 0x1000;
/// Length of the doorbell window mapped alongside the register window.
pub const DOORBELL_WINDOW_LEN: usize = 0x1000;

/// Submission queue entry size in bytes.
pub const SQE_SIZE: usize = 64;
/// Completion queue entry size in bytes.
pub const CQE_SIZE: usize = 16;

/// `IOSQES`/`IOCQES` encode a size as its base-2 log; 64 = 2^6, 16 = 2^4.
pub const IOSQES: u32 = 6;
pub const IOCQES: u32 = 4;

bitflags! {
    /// Single-bit fields of `CSTS`. Multi-bit `SHST` is read separately.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct Csts: u32 {
        const RDY = 1 << 0;
        const CFS = 1 << 1;
        const NSSRO = 1 << 4;
        const PP = 1 << 5;
    }
}

bitflags! {
    /// Single-bit fields of `CC`. Multi-bit fields (CSS, MPS, AMS, SHN,
    /// IOSQES, IOCQES) are composed separately via [`CcBuilder`].
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct CcFlags: u32 {
        const EN = 1 << 0;
    }
}

/// The NVM command set selector value for `CC.CSS`.
pub const CSS_NVM: u32 = 0b000;
/// The "I/O command set(s), selected by CSI" selector for `CC.CSS`.
pub const CSS_CSI: u32 = 0b110;
/// The admin-command-set-only selector for `CC.CSS`.
pub const CSS_ADMIN_ONLY: u32 = 0b111;

/// Decoded `CAP` register.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Cap {
    raw: u64,
}

impl Cap {
    pub fn from_raw(raw: u64) -> Self {
        Self { raw }
    }

    /// Maximum Queue Entries Supported, zero-based -> convert to a count.
    pub fn mqes(&self) -> u32 {
        (self.raw & 0xffff) as u32 + 1
    }

    /// Timeout, in 500 ms units.
    pub fn to(&self) -> u8 {
        ((self.raw >> 24) & 0xff) as u8
    }

    /// Doorbell stride exponent.
    pub fn dstrd(&self) -> u32 {
        ((self.raw >> 32) & 0xf) as u32
    }

    /// Doorbell stride in bytes: `4 * 2^DSTRD`.
    pub fn doorbell_stride(&self) -> usize {
        4usize << self.dstrd()
    }

    /// Command Sets Supported, as the raw 8-bit field.
    pub fn css(&self) -> u8 {
        ((self.raw >> 37) & 0xff) as u8
    }

    pub fn supports_nvm_command_set(&self) -> bool {
        self.css() & 0b1 != 0
    }

    pub fn supports_csi(&self) -> bool {
        self.css() & (1 << 6) != 0
    }

    pub fn supports_admin_only(&self) -> bool {
        self.css() & (1 << 7) != 0
    }

    /// Memory Page Size Minimum, as `2^(12+MPSMIN)` bytes.
    pub fn mpsmin(&self) -> usize {
        1usize << (12 + ((self.raw >> 48) & 0xf))
    }

    /// Memory Page Size Maximum, as `2^(12+MPSMAX)` bytes.
    pub fn mpsmax(&self) -> usize {
        1usize << (12 + ((self.raw >> 52) & 0xf))
    }

    /// Ready-wait deadline: `500 * (TO + 1)` milliseconds.
    pub fn ready_timeout_ms(&self) -> u64 {
        500 * (self.to() as u64 + 1)
    }
}

/// Chooses the I/O command set the controller enables, preferring CSI, then
/// admin-only, then falling back to the plain NVM command set.
pub fn choose_css(cap: &Cap) -> u32 {
    if cap.supports_csi() {
        CSS_CSI
    } else if cap.supports_admin_only() {
        CSS_ADMIN_ONLY
    } else {
        CSS_NVM
    }
}

/// Builds the `CC` register value written on `enable()`.
pub fn build_cc(css: u32, mps_exponent: u32) -> u32 {
    let mut cc = 0u32;
    cc |= CcFlags::EN.bits();
    cc |= (css & 0x7) << 4;
    cc |= (mps_exponent & 0xf) << 7;
    // AMS = round-robin (0), SHN = none (0)
    cc |= (IOSQES & 0xf) << 16;
    cc |= (IOCQES & 0xf) << 20;
    cc
}

/// Builds the `AQA` register value.
pub fn build_aqa(qsize: u16) -> u32 {
    let n = (qsize - 1) as u32;
    n | (n << 16)
}

/// Byte offset, within the doorbell BAR window, of SQ `qid`'s tail doorbell.
pub fn sq_tail_doorbell_offset(qid: u16, stride: usize) -> usize {
    2 * qid as usize * stride
}

/// Byte offset, within the doorbell BAR window, of CQ `qid`'s head doorbell.
pub fn cq_head_doorbell_offset(qid: u16, stride: usize) -> usize {
    2 * qid as usize * stride + stride
}
