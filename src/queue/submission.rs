//! Submission Queue.

use crate::dma::DmaBuffer;
use crate::error::{NvmeError, Result};
use crate::queue::request::{RequestContext, RequestPool};
use crate::regs::{sq_tail_doorbell_offset, SQE_SIZE};
use crate::traits::{IommuMapper, Mmio, PageAllocator};
use crate::wire::Sqe;

/// A ring of fixed-size submission entries, paired with the [`RequestPool`]
/// that tracks its in-flight commands and their scratch pages.
pub struct SubmissionQueue {
    id: u16,
    qsize: u16,
    cq_id: u16,
    ring: Option<DmaBuffer>,
    scratch: Option<DmaBuffer>,
    pool: Option<RequestPool>,
    doorbell_offset: usize,
    tail: u16,
}

impl Default for SubmissionQueue {
    fn default() -> Self {
        Self {
            id: 0,
            qsize: 0,
            cq_id: 0,
            ring: None,
            scratch: None,
            pool: None,
            doorbell_offset: 0,
            tail: 0,
        }
    }
}

impl SubmissionQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn id(&self) -> u16 {
        self.id
    }

    pub fn qsize(&self) -> u16 {
        self.qsize
    }

    pub fn cq_id(&self) -> u16 {
        self.cq_id
    }

    pub fn is_configured(&self) -> bool {
        self.ring.is_some()
    }

    pub fn iova(&self) -> u64 {
        self.ring.map(|d| d.iova).unwrap_or(0)
    }

    /// Allocates the SQE ring, one scratch page per usable request context,
    /// and the backing [`RequestPool`]. `cq_id` is recorded but not
    /// validated here — the caller (the controller) is responsible for
    /// having already configured that CQ.
    pub fn configure<P: PageAllocator + IommuMapper>(
        &mut self,
        platform: &mut P,
        qid: u16,
        qsize: u16,
        cq_id: u16,
        nsqa: u16,
        doorbell_stride: usize,
        page_size: usize,
    ) -> Result<()> {
        if qid > nsqa {
            return Err(NvmeError::InvalidArgument("sq id exceeds negotiated nsqa"));
        }
        if qsize < 2 {
            return Err(NvmeError::InvalidArgument("sq qsize must be >= 2"));
        }
        let ring = DmaBuffer::create(platform, qsize as usize, SQE_SIZE)?;
        let scratch = match DmaBuffer::create(platform, qsize as usize, page_size) {
            Ok(s) => s,
            Err(err) => {
                ring.destroy(platform);
                return Err(err);
            }
        };
        let pool = RequestPool::new(qid, qsize, scratch.vaddr, scratch.iova, page_size);

        self.id = qid;
        self.qsize = qsize;
        self.cq_id = cq_id;
        self.ring = Some(ring);
        self.scratch = Some(scratch);
        self.pool = Some(pool);
        self.doorbell_offset = sq_tail_doorbell_offset(qid, doorbell_stride);
        self.tail = 0;
        Ok(())
    }

    /// Idempotent: a no-op if never configured or already discarded.
    pub fn discard<P: PageAllocator + IommuMapper>(&mut self, platform: &mut P) {
        if let Some(ring) = self.ring.take() {
            ring.destroy(platform);
        }
        if let Some(scratch) = self.scratch.take() {
            scratch.destroy(platform);
        }
        *self = Self::default();
    }

    pub fn acquire(&mut self) -> Result<u16> {
        self.pool
            .as_mut()
            .ok_or(NvmeError::InvalidArgument("sq not configured"))?
            .acquire()
    }

    pub fn release(&mut self, cid: u16) {
        if let Some(pool) = self.pool.as_mut() {
            pool.release(cid);
        }
    }

    pub fn request(&self, cid: u16) -> &RequestContext {
        self.pool.as_ref().expect("sq not configured").get(cid)
    }

    pub fn request_mut(&mut self, cid: u16) -> &mut RequestContext {
        self.pool.as_mut().expect("sq not configured").get_mut(cid)
    }

    pub fn free_count(&self) -> usize {
        self.pool.as_ref().map_or(0, |p| p.free_count())
    }

    pub fn capacity(&self) -> usize {
        self.pool.as_ref().map_or(0, |p| p.capacity())
    }

    /// Copies `sqe` into the ring slot at the current tail, advances the
    /// tail modulo `qsize`, and rings the doorbell with the new tail. The
    /// caller must have already stamped `sqe`'s CID with the acquired
    /// request context's index.
    ///
    /// Ordering relies on single-threaded program order: nothing observes
    /// the ring slot until the doorbell write below, so there is no
    /// concurrent reader to race against.
    pub fn exec<M: Mmio>(&mut self, mmio: &mut M, doorbells_base: *mut u8, sqe: &Sqe) {
        let slot = self.tail;
        {
            let ring = self.ring.as_mut().expect("sq not configured");
            let bytes = unsafe { ring.as_mut_slice::<u8>() };
            let off = slot as usize * SQE_SIZE;
            bytes[off..off + SQE_SIZE].copy_from_slice(&sqe.to_le_bytes());
        }
        self.tail = (self.tail + 1) % self.qsize;
        mmio.write32(doorbells_base, self.doorbell_offset, self.tail as u32);
    }
}
