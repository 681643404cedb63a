//! NVMe core error handling.
//!
//! One flat enum with a hand-rolled `Display` rather than a derive macro —
//! the core has few enough variants that the manual impl stays short.

use core::fmt;

/// Errors surfaced by the NVMe core engine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NvmeError {
    /// A queue id exceeded the negotiated count, `qsize < 2`, the device
    /// class isn't NVMe, or the controller's minimum page size exceeds the
    /// host page size.
    InvalidArgument(&'static str),
    /// The target submission queue's request pool is exhausted.
    Busy,
    /// A ready-wait deadline expired.
    Timeout,
    /// An IOMMU map or page-allocator map failed.
    IoMappingFailed(&'static str),
    /// A CQE reported a non-zero NVMe status.
    DeviceFailure { status: u16 },
    /// A BAR mapping could not be established.
    MmioUnavailable(&'static str),
}

impl fmt::Display for NvmeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NvmeError::InvalidArgument(msg) => write!(f, "invalid argument: {msg}"),
            NvmeError::Busy => write!(f, "request pool exhausted"),
            NvmeError::Timeout => write!(f, "ready-wait deadline expired"),
            NvmeError::IoMappingFailed(msg) => write!(f, "DMA mapping failed: {msg}"),
            NvmeError::DeviceFailure { status } => {
                write!(f, "device reported non-zero status 0x{status:04x}")
            }
            NvmeError::MmioUnavailable(msg) => write!(f, "BAR mapping unavailable: {msg}"),
        }
    }
}

impl std::error::Error for NvmeError {}

pub type Result<T> = core::result::Result<T, NvmeError>;
