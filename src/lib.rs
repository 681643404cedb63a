//! Userspace NVMe controller lifecycle and queue-pair engine.
//!
//! This crate owns the register bring-up, admin/I/O queue-pair
//! construction, PRP encoding and command submission/completion round-trip
//! for a single NVMe controller. PCI discovery, page allocation, IOMMU
//! mapping and MMIO access are external collaborators described by the
//! traits in [`traits`]; namespace management, formatting and filesystem
//! concerns are out of scope.

pub mod config;
pub mod controller;
pub mod dma;
pub mod error;
pub mod prp;
pub mod queue;
pub mod regs;
pub mod traits;
pub mod wire;

pub use config::ControllerOptions;
pub use controller::{Controller, ControllerState};
pub use error::{NvmeError, Result};
pub use queue::{CompletionQueue, Opaque, RequestContext, RequestPool, SubmissionQueue};
pub use traits::{BarProt, IommuMapper, Iova, Mmio, PageAllocator, PciDevice, Platform};
pub use wire::{Cqe, Sqe};
