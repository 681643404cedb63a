//! Completion Queue.

use crate::dma::DmaBuffer;
use crate::error::{NvmeError, Result};
use crate::regs::{cq_head_doorbell_offset, CQE_SIZE};
use crate::traits::{IommuMapper, Mmio, PageAllocator};
use crate::wire::Cqe;

/// A ring of fixed-size completion entries, tracking head and phase.
pub struct CompletionQueue {
    id: u16,
    qsize: u16,
    dma: Option<DmaBuffer>,
    doorbell_offset: usize,
    /// Event token for a future event-driven wait; unused by the busy-poll
    /// path implemented here.
    pub efd: Option<i32>,
    head: u16,
    phase: u8,
}

impl Default for CompletionQueue {
    fn default() -> Self {
        Self {
            id: 0,
            qsize: 0,
            dma: None,
            doorbell_offset: 0,
            efd: None,
            head: 0,
            phase: 1,
        }
    }
}

impl CompletionQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn id(&self) -> u16 {
        self.id
    }

    pub fn qsize(&self) -> u16 {
        self.qsize
    }

    pub fn iova(&self) -> u64 {
        self.dma.map(|d| d.iova).unwrap_or(0)
    }

    pub fn is_configured(&self) -> bool {
        self.dma.is_some()
    }

    pub fn head(&self) -> u16 {
        self.head
    }

    pub fn phase(&self) -> u8 {
        self.phase
    }

    /// Allocates the CQE ring and binds the head doorbell. Rejects `qid`
    /// beyond the negotiated `ncqa` or `qsize < 2`.
    pub fn configure<P: PageAllocator + IommuMapper>(
        &mut self,
        platform: &mut P,
        qid: u16,
        qsize: u16,
        ncqa: u16,
        doorbell_stride: usize,
    ) -> Result<()> {
        if qid > ncqa {
            return Err(NvmeError::InvalidArgument("cq id exceeds negotiated ncqa"));
        }
        if qsize < 2 {
            return Err(NvmeError::InvalidArgument("cq qsize must be >= 2"));
        }
        let dma = DmaBuffer::create(platform, qsize as usize, CQE_SIZE)?;
        self.id = qid;
        self.qsize = qsize;
        self.dma = Some(dma);
        self.doorbell_offset = cq_head_doorbell_offset(qid, doorbell_stride);
        self.head = 0;
        self.phase = 1;
        Ok(())
    }

    /// Idempotent: a no-op if never configured or already discarded.
    pub fn discard<P: PageAllocator + IommuMapper>(&mut self, platform: &mut P) {
        if let Some(dma) = self.dma.take() {
            dma.destroy(platform);
        }
        *self = Self::default();
    }

    fn entry_bytes(&self, idx: u16) -> [u8; CQE_SIZE] {
        let dma = self.dma.as_ref().expect("cq not configured");
        let bytes = unsafe { dma.as_slice::<u8>() };
        let off = idx as usize * CQE_SIZE;
        bytes[off..off + CQE_SIZE].try_into().unwrap()
    }

    /// Returns the next CQE if its phase bit matches the queue's current
    /// expected phase, advancing `head` (and flipping `phase` on wrap).
    /// Returns `None` — "try again" — otherwise. Does not write the
    /// doorbell; callers batch that after draining everything available.
    pub fn poll_one(&mut self) -> Option<Cqe> {
        let raw = self.entry_bytes(self.head);
        let cqe = Cqe::from_le_bytes(&raw);
        if cqe.phase() != self.phase {
            return None;
        }
        self.head += 1;
        if self.head == self.qsize {
            self.head = 0;
            self.phase ^= 1;
        }
        Some(cqe)
    }

    /// Publishes the current head to the device.
    pub fn ring_doorbell<M: Mmio>(&self, mmio: &mut M, doorbells_base: *mut u8) {
        mmio.write32(doorbells_base, self.doorbell_offset, self.head as u32);
    }
}
