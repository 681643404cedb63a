//! Controller bring-up, lifecycle and command execution.

use std::time::{Duration, Instant};

use crate::config::{ControllerOptions, HOST_PAGE_SIZE, NVME_AQ_QSIZE};
use crate::error::{NvmeError, Result};
use crate::prp::build_prp;
use crate::queue::{CompletionQueue, Opaque, SubmissionQueue};
use crate::regs::{
    build_aqa, build_cc, choose_css, Cap, Csts, DOORBELL_WINDOW_LEN, DOORBELL_WINDOW_OFFSET,
    REGISTER_WINDOW_LEN, REG_ACQ, REG_AQA, REG_ASQ, REG_CAP, REG_CC, REG_CSTS,
};
use crate::traits::{BarProt, Platform};
use crate::wire::{admin_opcode, feature_id, Cqe, Sqe, CID_AER_BIT};

/// The controller lifecycle state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControllerState {
    Fresh,
    Opened,
    Reset,
    AdminConfigured,
    Enabled,
    Running,
    Administrative,
    Closed,
}

/// A userspace NVMe controller, generic over its collaborator bundle so
/// tests can substitute a mock without `dyn` indirection.
pub struct Controller<P: Platform> {
    state: ControllerState,
    platform: P,
    handle: Option<P::Handle>,
    regs_base: *mut u8,
    doorbells_base: *mut u8,
    cap: Cap,
    admin_only: bool,
    doorbell_stride: usize,
    mps_exponent: u32,
    opts: ControllerOptions,
    nsqa: u16,
    ncqa: u16,
    sqs: Vec<SubmissionQueue>,
    cqs: Vec<CompletionQueue>,
}

impl<P: Platform> Controller<P> {
    /// Opens `bdf` through the `PciDevice` collaborator, maps the register
    /// and doorbell BAR windows, and validates `CAP`. Any failure after the
    /// PCI handle is opened rolls back everything mapped so far.
    pub fn open(mut platform: P, bdf: &str, opts: ControllerOptions) -> Result<Self> {
        let handle = platform.open(bdf)?;

        let class = match platform.class_code(handle) {
            Ok(class) => class,
            Err(err) => {
                platform.close(handle);
                return Err(err);
            }
        };
        if (class >> 8) & 0xffff != 0x0108 {
            platform.close(handle);
            return Err(NvmeError::InvalidArgument("pci class code is not NVMe"));
        }
        let admin_only = (class & 0xff) as u8 == 0x03;

        let regs_base = match platform.map_bar(handle, 0, REGISTER_WINDOW_LEN, 0, BarProt::ReadWrite)
        {
            Ok(base) => base,
            Err(err) => {
                platform.close(handle);
                return Err(err);
            }
        };
        let doorbells_base = match platform.map_bar(
            handle,
            0,
            DOORBELL_WINDOW_LEN,
            DOORBELL_WINDOW_OFFSET,
            BarProt::ReadWrite,
        ) {
            Ok(base) => base,
            Err(err) => {
                let _ = platform.unmap_bar(handle, 0, regs_base, REGISTER_WINDOW_LEN, 0);
                platform.close(handle);
                return Err(err);
            }
        };

        let cap = Cap::from_raw(platform.read64(regs_base, REG_CAP));
        if cap.mpsmin() > HOST_PAGE_SIZE || HOST_PAGE_SIZE > cap.mpsmax() {
            let _ = platform.unmap_bar(
                handle,
                0,
                doorbells_base,
                DOORBELL_WINDOW_LEN,
                DOORBELL_WINDOW_OFFSET,
            );
            let _ = platform.unmap_bar(handle, 0, regs_base, REGISTER_WINDOW_LEN, 0);
            platform.close(handle);
            return Err(NvmeError::InvalidArgument(
                "controller minimum page size exceeds host page size",
            ));
        }
        // HOST_PAGE_SIZE is always a power of two, so this is exact.
        let mps_exponent = HOST_PAGE_SIZE.trailing_zeros() - 12;

        log::info!(
            "nvme: opened {bdf}: dstrd={} to={} admin_only={admin_only}",
            cap.dstrd(),
            cap.to()
        );

        Ok(Self {
            state: ControllerState::Opened,
            platform,
            handle: Some(handle),
            regs_base,
            doorbells_base,
            cap,
            admin_only,
            doorbell_stride: cap.doorbell_stride(),
            mps_exponent,
            opts,
            nsqa: 0,
            ncqa: 0,
            sqs: vec![SubmissionQueue::new()],
            cqs: vec![CompletionQueue::new()],
        })
    }

    pub fn state(&self) -> ControllerState {
        self.state
    }

    pub fn is_admin_only(&self) -> bool {
        self.admin_only
    }

    pub fn nsqa(&self) -> u16 {
        self.nsqa
    }

    pub fn ncqa(&self) -> u16 {
        self.ncqa
    }

    pub fn sq(&self, qid: u16) -> &SubmissionQueue {
        &self.sqs[qid as usize]
    }

    pub fn cq(&self, qid: u16) -> &CompletionQueue {
        &self.cqs[qid as usize]
    }

    /// Busy-waits until `CSTS.RDY == target`, deadline `500 * (CAP.TO + 1)`
    /// ms from the call.
    fn wait_rdy(&self, target: bool) -> Result<()> {
        let deadline = Instant::now() + Duration::from_millis(self.cap.ready_timeout_ms());
        loop {
            let csts = Csts::from_bits_truncate(self.platform.read32(self.regs_base, REG_CSTS));
            if csts.contains(Csts::RDY) == target {
                return Ok(());
            }
            if Instant::now() >= deadline {
                return Err(NvmeError::Timeout);
            }
            std::hint::spin_loop();
        }
    }

    /// Clears `CC.EN` and waits for `CSTS.RDY == 0`.
    pub fn reset(&mut self) -> Result<()> {
        let cc = self.platform.read32(self.regs_base, REG_CC);
        self.platform.write32(self.regs_base, REG_CC, cc & !1u32);
        self.wait_rdy(false)?;
        self.state = ControllerState::Reset;
        Ok(())
    }

    /// Configures CQ[0]/SQ[0] at `NVME_AQ_QSIZE` and programs AQA/ASQ/ACQ.
    pub fn configure_admin_queue(&mut self) -> Result<()> {
        self.cqs[0].configure(&mut self.platform, 0, NVME_AQ_QSIZE, 0, self.doorbell_stride)?;
        if let Err(err) = self.sqs[0].configure(
            &mut self.platform,
            0,
            NVME_AQ_QSIZE,
            0,
            0,
            self.doorbell_stride,
            HOST_PAGE_SIZE,
        ) {
            self.cqs[0].discard(&mut self.platform);
            return Err(err);
        }

        self.platform
            .write32(self.regs_base, REG_AQA, build_aqa(NVME_AQ_QSIZE));
        self.platform
            .write_hl64(self.regs_base, REG_ASQ, self.sqs[0].iova());
        self.platform
            .write_hl64(self.regs_base, REG_ACQ, self.cqs[0].iova());

        self.state = ControllerState::AdminConfigured;
        Ok(())
    }

    /// Writes `CC` (CSS chosen by priority, round-robin AMS, SHN=none,
    /// IOSQES=6, IOCQES=4, EN=1) and waits for `CSTS.RDY == 1`.
    pub fn enable(&mut self) -> Result<()> {
        let css = choose_css(&self.cap);
        let cc = build_cc(css, self.mps_exponent);
        self.platform.write32(self.regs_base, REG_CC, cc);
        self.wait_rdy(true)?;
        self.state = ControllerState::Enabled;
        Ok(())
    }

    /// On an administrative controller this transitions straight to
    /// `Administrative` without issuing any command. Otherwise issues `Set
    /// Features (Number of Queues)` with the options passed to
    /// [`Controller::open`], fails with `DeviceFailure` if the command's
    /// status is nonzero, and otherwise clamps `nsqa`/`ncqa` to
    /// `min(requested, reported)`, both held as zero-based maxima.
    pub fn negotiate_queue_counts(&mut self) -> Result<()> {
        if self.admin_only {
            self.nsqa = 0;
            self.ncqa = 0;
            self.state = ControllerState::Administrative;
            return Ok(());
        }

        let nsqr0 = self.opts.nsqr.saturating_sub(1);
        let ncqr0 = self.opts.ncqr.saturating_sub(1);

        let mut sqe = Sqe::new(admin_opcode::SET_FEATURES);
        sqe.cdw10 = feature_id::NUMBER_OF_QUEUES;
        sqe.cdw11 = ((ncqr0 as u32) << 16) | nsqr0 as u32;

        let mut cqe = Cqe::default();
        self.exec_sync(0, &mut sqe, None, Some(&mut cqe))?;
        if cqe.status_code() != 0 {
            return Err(NvmeError::DeviceFailure {
                status: cqe.status_code(),
            });
        }

        let reported_nsqa0 = (cqe.dw0 & 0xffff) as u16;
        let reported_ncqa0 = ((cqe.dw0 >> 16) & 0xffff) as u16;
        self.nsqa = nsqr0.min(reported_nsqa0);
        self.ncqa = ncqr0.min(reported_ncqa0);

        self.sqs.resize_with(self.nsqa as usize + 1, SubmissionQueue::new);
        self.cqs.resize_with(self.ncqa as usize + 1, CompletionQueue::new);

        self.state = ControllerState::Running;
        Ok(())
    }

    /// Configures CQ then SQ locally, issues `Create I/O CQ` then `Create
    /// I/O SQ` synchronously, and rolls back both local allocations if
    /// either admin command fails, regardless of which one failed.
    pub fn create_ioqpair(&mut self, qid: u16, qsize: u16, flags: u32) -> Result<()> {
        if self.admin_only {
            return Err(NvmeError::InvalidArgument(
                "administrative controllers do not support I/O queues",
            ));
        }
        if self.state != ControllerState::Running {
            return Err(NvmeError::InvalidArgument(
                "create_ioqpair requires a running controller",
            ));
        }
        if qid == 0 || qid as usize >= self.cqs.len() || qid as usize >= self.sqs.len() {
            return Err(NvmeError::InvalidArgument("queue id exceeds negotiated count"));
        }

        self.cqs[qid as usize].configure(&mut self.platform, qid, qsize, self.ncqa, self.doorbell_stride)?;
        if let Err(err) = self.sqs[qid as usize].configure(
            &mut self.platform,
            qid,
            qsize,
            qid,
            self.nsqa,
            self.doorbell_stride,
            HOST_PAGE_SIZE,
        ) {
            self.cqs[qid as usize].discard(&mut self.platform);
            return Err(err);
        }

        let mut create_cq = Sqe::new(admin_opcode::CREATE_IO_CQ);
        create_cq.prp1 = self.cqs[qid as usize].iova();
        create_cq.cdw10 = (((qsize - 1) as u32) << 16) | qid as u32;
        create_cq.cdw11 = 1; // physically contiguous, interrupts disabled

        let mut cq_cqe = Cqe::default();
        if let Err(err) = self.exec_sync(0, &mut create_cq, None, Some(&mut cq_cqe)) {
            self.sqs[qid as usize].discard(&mut self.platform);
            self.cqs[qid as usize].discard(&mut self.platform);
            return Err(err);
        }
        if cq_cqe.status_code() != 0 {
            self.sqs[qid as usize].discard(&mut self.platform);
            self.cqs[qid as usize].discard(&mut self.platform);
            return Err(NvmeError::DeviceFailure {
                status: cq_cqe.status_code(),
            });
        }

        let mut create_sq = Sqe::new(admin_opcode::CREATE_IO_SQ);
        create_sq.prp1 = self.sqs[qid as usize].iova();
        create_sq.cdw10 = (((qsize - 1) as u32) << 16) | qid as u32;
        create_sq.cdw11 = ((qid as u32) << 16) | (flags & 0xfffe) | 1;

        let mut sq_cqe = Cqe::default();
        if let Err(err) = self.exec_sync(0, &mut create_sq, None, Some(&mut sq_cqe)) {
            self.sqs[qid as usize].discard(&mut self.platform);
            self.cqs[qid as usize].discard(&mut self.platform);
            return Err(err);
        }
        if sq_cqe.status_code() != 0 {
            self.sqs[qid as usize].discard(&mut self.platform);
            self.cqs[qid as usize].discard(&mut self.platform);
            return Err(NvmeError::DeviceFailure {
                status: sq_cqe.status_code(),
            });
        }

        Ok(())
    }

    /// Acquires a Request Context on `sq_id`, optionally maps `buf`
    /// ephemerally and PRP-encodes it into `sqe`, execs, and polls the
    /// bound CQ until `sqe`'s own completion is observed — dispatching AER
    /// completions and logging spurious ones along the way. Device status is
    /// never turned into an error here (except by the AER exemption, which
    /// this path can't see); callers interpret `out_cqe`'s status
    /// themselves.
    pub fn exec_sync(
        &mut self,
        sq_id: u16,
        sqe: &mut Sqe,
        buf: Option<(*mut u8, usize)>,
        out_cqe: Option<&mut Cqe>,
    ) -> Result<()> {
        let cid = self.sqs[sq_id as usize].acquire()?;
        sqe.set_cid(cid);

        let mut ephemeral_mapped = false;
        if let Some((vaddr, len)) = buf {
            let iova = match self.platform.map_ephemeral(vaddr, len) {
                Ok(iova) => iova,
                Err(err) => {
                    self.sqs[sq_id as usize].release(cid);
                    return Err(err);
                }
            };
            ephemeral_mapped = true;

            let scratch_vaddr = self.sqs[sq_id as usize].request(cid).scratch_vaddr;
            let scratch_iova = self.sqs[sq_id as usize].request(cid).scratch_iova;
            let scratch = unsafe { std::slice::from_raw_parts_mut(scratch_vaddr, HOST_PAGE_SIZE) };
            if let Err(err) = build_prp(sqe, iova, len, HOST_PAGE_SIZE, Some((scratch, scratch_iova)))
            {
                let _ = self.platform.free_ephemeral(1);
                self.sqs[sq_id as usize].release(cid);
                return Err(err);
            }
        }

        self.sqs[sq_id as usize].exec(&mut self.platform, self.doorbells_base, sqe);

        let cq_idx = self.sqs[sq_id as usize].cq_id() as usize;
        let result = loop {
            let Some(cqe) = self.cqs[cq_idx].poll_one() else {
                std::hint::spin_loop();
                continue;
            };
            if sq_id == 0 && cqe.cid & CID_AER_BIT != 0 {
                self.handle_aen(cqe);
                continue;
            }
            if cqe.cid != cid {
                log::warn!("nvme: spurious cqe cid={} on sq {sq_id}", cqe.cid);
                continue;
            }
            break cqe;
        };
        self.cqs[cq_idx].ring_doorbell(&mut self.platform, self.doorbells_base);

        if let Some(out) = out_cqe {
            *out = result;
        }

        self.sqs[sq_id as usize].release(cid);
        if ephemeral_mapped {
            let _ = self.platform.free_ephemeral(1);
        }

        Ok(())
    }

    /// Acquires an admin Request Context, arms an `Asynchronous Event
    /// Request` tagged with the AER bit, stores `handler` as the context's
    /// opaque, and execs it.
    pub fn enable_aen(&mut self, handler: Box<dyn FnMut(Cqe) + Send>) -> Result<()> {
        let cid = self.sqs[0].acquire()?;
        self.sqs[0].request_mut(cid).opaque = Opaque::AerHandler(handler);

        let mut sqe = Sqe::new(admin_opcode::ASYNC_EVENT_REQUEST);
        sqe.set_cid(cid | CID_AER_BIT);
        self.sqs[0].exec(&mut self.platform, self.doorbells_base, &sqe);
        Ok(())
    }

    /// Clears the AER bit to recover the Request Context, invokes the
    /// stored handler (or logs a summary), and immediately re-arms a fresh
    /// AER request on the same context — AER requests are perpetual until
    /// reset.
    fn handle_aen(&mut self, cqe: Cqe) {
        let cid = cqe.cid & !CID_AER_BIT;
        match &mut self.sqs[0].request_mut(cid).opaque {
            Opaque::AerHandler(handler) => handler(cqe),
            _ => log::info!(
                "nvme: AEN type={} info={} lid={}",
                cqe.dw0 & 0x7,
                (cqe.dw0 >> 8) & 0xff,
                (cqe.dw0 >> 16) & 0xff
            ),
        }

        let mut sqe = Sqe::new(admin_opcode::ASYNC_EVENT_REQUEST);
        sqe.set_cid(cid | CID_AER_BIT);
        self.sqs[0].exec(&mut self.platform, self.doorbells_base, &sqe);
    }

    /// Idempotently discards every SQ then every CQ, unmaps both BAR
    /// windows, and drops the PCI handle.
    pub fn close(&mut self) {
        for sq in &mut self.sqs {
            sq.discard(&mut self.platform);
        }
        for cq in &mut self.cqs {
            cq.discard(&mut self.platform);
        }

        if !self.regs_base.is_null() {
            if let Some(handle) = self.handle {
                let _ = self
                    .platform
                    .unmap_bar(handle, 0, self.regs_base, REGISTER_WINDOW_LEN, 0);
            }
            self.regs_base = std::ptr::null_mut();
        }
        if !self.doorbells_base.is_null() {
            if let Some(handle) = self.handle {
                let _ = self.platform.unmap_bar(
                    handle,
                    0,
                    self.doorbells_base,
                    DOORBELL_WINDOW_LEN,
                    DOORBELL_WINDOW_OFFSET,
                );
            }
            self.doorbells_base = std::ptr::null_mut();
        }
        if let Some(handle) = self.handle.take() {
            self.platform.close(handle);
        }

        self.state = ControllerState::Closed;
    }
}
