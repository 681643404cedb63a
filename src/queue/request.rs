//! Request Context and Request Pool.

use crate::error::{NvmeError, Result};
use crate::wire::Cqe;

/// The per-request opaque payload. Used by admin requests to carry an AER
/// handler; unused request contexts carry `None`.
pub enum Opaque {
    None,
    AerHandler(Box<dyn FnMut(Cqe) + Send>),
    UserCookie(usize),
}

impl Default for Opaque {
    fn default() -> Self {
        Opaque::None
    }
}

/// One in-flight command's bookkeeping: its command identifier, its
/// dedicated scratch page, and a back-pointer to its owning SQ (carried as
/// an id rather than a pointer, since contexts outlive any borrow of the SQ
/// that owns them).
pub struct RequestContext {
    pub cid: u16,
    pub scratch_vaddr: *mut u8,
    pub scratch_iova: u64,
    pub sq_id: u16,
    pub opaque: Opaque,
    next_free: Option<u16>,
}

/// A fixed-size slab of `qsize - 1` [`RequestContext`]s linked into a LIFO
/// free list, with one slot permanently withheld to keep the SQ ring
/// distinguishable between empty and full.
pub struct RequestPool {
    contexts: Vec<RequestContext>,
    free_head: Option<u16>,
}

impl RequestPool {
    /// `scratch_base`/`scratch_iova` address the first of `qsize` contiguous
    /// `page_size`-byte scratch pages; context `i` owns the `i`-th page.
    pub fn new(
        sq_id: u16,
        qsize: u16,
        scratch_base: *mut u8,
        scratch_iova: u64,
        page_size: usize,
    ) -> Self {
        let usable = qsize - 1;
        let mut contexts = Vec::with_capacity(usable as usize);
        for i in 0..usable {
            let scratch_vaddr = unsafe { scratch_base.add(i as usize * page_size) };
            contexts.push(RequestContext {
                cid: i,
                scratch_vaddr,
                scratch_iova: scratch_iova + (i as usize * page_size) as u64,
                sq_id,
                opaque: Opaque::None,
                next_free: if i > 0 { Some(i - 1) } else { None },
            });
        }
        let free_head = if usable > 0 { Some(usable - 1) } else { None };
        Self {
            contexts,
            free_head,
        }
    }

    pub fn acquire(&mut self) -> Result<u16> {
        let idx = self.free_head.ok_or(NvmeError::Busy)?;
        self.free_head = self.contexts[idx as usize].next_free;
        Ok(idx)
    }

    pub fn release(&mut self, cid: u16) {
        self.contexts[cid as usize].opaque = Opaque::None;
        self.contexts[cid as usize].next_free = self.free_head;
        self.free_head = Some(cid);
    }

    pub fn get(&self, cid: u16) -> &RequestContext {
        &self.contexts[cid as usize]
    }

    pub fn get_mut(&mut self, cid: u16) -> &mut RequestContext {
        &mut self.contexts[cid as usize]
    }

    /// Total request context slots (`qsize - 1`).
    pub fn capacity(&self) -> usize {
        self.contexts.len()
    }

    /// Walks the free list; used by ring-accounting tests.
    pub fn free_count(&self) -> usize {
        let mut count = 0;
        let mut cur = self.free_head;
        while let Some(idx) = cur {
            count += 1;
            cur = self.contexts[idx as usize].next_free;
        }
        count
    }
}
