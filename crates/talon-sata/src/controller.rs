//! Controller attach, the interrupt path, and the command state machine.
//!
//! Every retirement funnels through [`SataController::slot_complete`] and the
//! flavor's `intr` op, whether it came from an interrupt, a poll loop, or a
//! fired deadline; there is exactly one place a transfer becomes done.

use crate::bus::HostBus;
use crate::channel::{ChanFlags, SataChannel};
use crate::dma::DmaMapper;
use crate::error::{Result, SataError};
use crate::fis::{
    self, parse_d2h, tfd_err_st, tfd_status, SIG_ATA, SIG_ATAPI, SIG_PMP, WDCE_ICRC, WDCS_BSY,
    WDCS_DRQ, WDCS_DWF, WDCS_ERR,
};
use crate::prb::{Prb, PrbControl};
use crate::regs::*;
use crate::xfer::{
    AtaBio, AtaCommand, AtapiResult, AtapiXfer, BioError, BioResult, CmdResult, CmdResultFlags,
    KillReason, Payload, Xfer, XferFlags, XferOps, XferResult, XsError,
};

/// Spins spent per millisecond of a transfer's deadline when completing by
/// poll; the bound scales with the command's own timeout.
const POLL_ITERS_PER_MS: u32 = 10;
/// Bounded spins for soft-reset signature waits.
const POLL_TRIES: u32 = 10_000;
const READY_TRIES: u32 = 1_000;

/// What probing found behind a port.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DriveKind {
    None,
    Ata,
    Atapi,
    PortMultiplier,
}

/// Post-recovery hook: runs after a recoverable command error has drained
/// the queue and the port is live again, with the faulting drive and the
/// synthesized taskfile. Owners use it to read the error log and requeue
/// what the device never finished; `flags` carries the submission mode the
/// retry must use.
pub trait RecoveryResume: Send {
    fn resume(&mut self, port: usize, drive: usize, tfd: u32, flags: XferFlags);
}

/// Default hook for owners without queued-command retry logic.
pub struct NullRecovery;

impl RecoveryResume for NullRecovery {
    fn resume(&mut self, _port: usize, _drive: usize, _tfd: u32, _flags: XferFlags) {}
}

pub struct SataController {
    pub(crate) bus: Box<dyn HostBus>,
    pub(crate) dma: Box<dyn DmaMapper>,
    recovery: Box<dyn RecoveryResume>,
    channels: Vec<SataChannel>,
}

impl SataController {
    /// `prb_base` is the bus address of the request block arena; each port
    /// gets `MAX_SLOTS` consecutive blocks.
    pub fn new(
        bus: Box<dyn HostBus>,
        dma: Box<dyn DmaMapper>,
        recovery: Box<dyn RecoveryResume>,
        nports: usize,
        prb_base: u64,
    ) -> Self {
        let per_port = u64::from(MAX_SLOTS) * crate::prb::PRB_SIZE as u64;
        Self {
            bus,
            dma,
            recovery,
            channels: (0..nports)
                .map(|port| SataChannel::new(prb_base + port as u64 * per_port))
                .collect(),
        }
    }

    pub fn nports(&self) -> usize {
        self.channels.len()
    }

    /// Global reset, then brings every port up with interrupts enabled.
    pub fn attach(&mut self) -> Result<()> {
        self.bus.gr_write(GR_GC, GR_GC_GLBL_RESET);
        self.bus.gr_write(GR_GC, 0);
        for port in 0..self.nports() {
            self.reinit_port(port)?;
            self.enable_port_interrupt(port, true);
        }
        Ok(())
    }

    /// Reprograms the controller after the host slept; hardware state is
    /// assumed lost, so this is the attach sequence over again.
    pub fn resume(&mut self) -> Result<()> {
        self.attach()
    }

    /// Quiesces every port: interrupts off, anything in flight failed as
    /// device-gone.
    pub fn detach(&mut self) {
        for port in 0..self.nports() {
            self.enable_port_interrupt(port, false);
            self.kill_active(port, KillReason::Gone);
        }
    }

    /// Number of drives behind the port; more than one means a port
    /// multiplier and changes how reinitialization resumes the port.
    pub fn set_ndrives(&mut self, port: usize, ndrives: usize) {
        self.channels[port].ndrives = ndrives;
    }

    pub fn set_ncq(&mut self, port: usize, ncq: bool) {
        self.channels[port].flags.set(ChanFlags::NCQ, ncq);
    }

    pub fn is_recovering(&self, port: usize) -> bool {
        self.channels[port].is_recovering()
    }

    pub fn active_mask(&self, port: usize) -> u32 {
        self.channels[port].queue.active_mask()
    }

    pub fn timeout_armed(&self, port: usize) -> Option<u8> {
        self.channels[port].callout.armed_slot()
    }

    /// Retired transfers since the last harvest, completion order.
    pub fn take_completed(&mut self, port: usize) -> Vec<Xfer> {
        std::mem::take(&mut self.channels[port].completed)
    }

    /// The request block most recently serialized for a slot.
    pub fn slot_prb(&self, port: usize, slot: u8) -> &[u8; crate::prb::PRB_SIZE] {
        &self.channels[port].prb[slot as usize]
    }

    pub fn enable_port_interrupt(&mut self, port: usize, enable: bool) {
        let bits = PR_PIS_CMDCMPL | PR_PIS_CMDERRR;
        let gc = self.bus.gr_read(GR_GC);
        if enable {
            self.bus.pr_write(port, PRO_PIES, bits);
            self.bus.gr_write(GR_GC, gc | gr_gc_pxie(port));
        } else {
            self.bus.pr_write(port, PRO_PIEC, bits);
            self.bus.gr_write(GR_GC, gc & !gr_gc_pxie(port));
        }
    }

    // ---- command submission ----

    /// Queues a raw taskfile command. With `poll` the call runs the command
    /// to completion before returning.
    pub fn exec_command(&mut self, port: usize, drive: usize, cmd: AtaCommand, poll: bool) -> Result<()> {
        self.check_port(port)?;
        let mut flags = XferFlags::empty();
        if poll {
            flags |= XferFlags::POLL;
        }
        if cmd.bcount > 0 {
            flags |= XferFlags::DMA;
        }
        let xfer = Xfer {
            slot: 0,
            drive,
            flags,
            payload: Payload::Cmd(cmd),
            result: None,
            ops: &CMD_OPS,
        };
        self.submit(port, xfer, poll)
    }

    /// Queues a block transfer. `ncq` tags it for native queuing; the port
    /// must have been marked queue-capable.
    pub fn ata_bio(&mut self, port: usize, drive: usize, bio: AtaBio, ncq: bool, poll: bool) -> Result<()> {
        self.check_port(port)?;
        let mut flags = XferFlags::DMA;
        if ncq {
            debug_assert!(self.channels[port].flags.contains(ChanFlags::NCQ));
            flags |= XferFlags::NCQ;
        }
        if poll {
            flags |= XferFlags::POLL;
        }
        let xfer = Xfer {
            slot: 0,
            drive,
            flags,
            payload: Payload::Bio(bio),
            result: None,
            ops: &BIO_OPS,
        };
        self.submit(port, xfer, poll)
    }

    /// Queues a packet command.
    pub fn atapi_request(&mut self, port: usize, drive: usize, xfer: AtapiXfer, dma: bool, poll: bool) -> Result<()> {
        self.check_port(port)?;
        let mut flags = XferFlags::ATAPI;
        if dma && xfer.bcount > 0 {
            flags |= XferFlags::DMA;
        }
        if poll {
            flags |= XferFlags::POLL;
        }
        let xfer = Xfer {
            slot: 0,
            drive,
            flags,
            payload: Payload::Atapi(xfer),
            result: None,
            ops: &ATAPI_OPS,
        };
        self.submit(port, xfer, poll)
    }

    fn submit(&mut self, port: usize, xfer: Xfer, poll: bool) -> Result<()> {
        let ops = xfer.ops;
        match self.start_or_pend(port, xfer, poll) {
            Ok(Some(slot)) if poll => ops.poll(self, port, slot),
            Ok(_) => Ok(()),
            // A failed setup already retired the transfer through the
            // completion list; only a polled caller hears about it directly.
            Err(_) if !poll => Ok(()),
            Err(err) => Err(err),
        }
    }

    /// Starts the transfer if a slot is free and the channel is live;
    /// otherwise parks it. Polled submissions cannot park.
    fn start_or_pend(&mut self, port: usize, mut xfer: Xfer, poll: bool) -> Result<Option<u8>> {
        let ch = &mut self.channels[port];
        if ch.queue.is_frozen() || ch.is_recovering() {
            if poll {
                return Err(SataError::ChannelFrozen(port));
            }
            ch.queue.push_pending(xfer);
            return Ok(None);
        }
        let Some(slot) = ch.queue.alloc_slot(xfer.flags.contains(XferFlags::NCQ)) else {
            if poll {
                return Err(SataError::NoSlot(port));
            }
            ch.queue.push_pending(xfer);
            return Ok(None);
        };
        xfer.slot = slot;
        let ops = xfer.ops;
        if let Err(err) = ops.start(self, port, &mut xfer) {
            tracing::error!(port, slot, %err, "transfer setup failed");
            self.fail_start(port, xfer);
            return Err(err);
        }
        self.channels[port].queue.activate(slot, xfer);
        Ok(Some(slot))
    }

    /// Start failed before the slot went live: nothing to detach from
    /// hardware, but the transfer still retires with a setup-error result so
    /// the owner sees exactly one completion for it.
    fn fail_start(&mut self, port: usize, mut xfer: Xfer) {
        xfer.result = Some(match &xfer.payload {
            Payload::Cmd(_) => XferResult::Cmd(CmdResult {
                flags: CmdResultFlags::DONE | CmdResultFlags::ERROR | CmdResultFlags::DEVICE_FAULT,
                tfd: 0,
            }),
            Payload::Bio(bio) => XferResult::Bio(BioResult {
                error: BioError::Dma,
                residual: bio.bcount,
                tfd: 0,
            }),
            Payload::Atapi(pkt) => XferResult::Atapi(AtapiResult {
                error: XsError::DriverError,
                residual: pkt.bcount,
                tfd: 0,
            }),
        });
        self.channels[port].completed.push(xfer);
    }

    /// Starts parked transfers until the queue refuses one.
    fn start_pending(&mut self, port: usize) {
        loop {
            let ch = &mut self.channels[port];
            if ch.queue.is_frozen() || ch.is_recovering() {
                return;
            }
            let Some(xfer) = ch.queue.pop_pending() else {
                return;
            };
            match self.start_or_pend(port, xfer, false) {
                Ok(Some(_)) => continue,
                // Put back at the head; start_or_pend pushed to the tail.
                Ok(None) => {
                    let ch = &mut self.channels[port];
                    if let Some(back) = ch.queue.pop_pending_back() {
                        ch.queue.push_pending_front(back);
                    }
                    return;
                }
                // The transfer already retired as a setup error; keep going.
                Err(_) => continue,
            }
        }
    }

    // ---- interrupt path ----

    /// Global interrupt entry: services every port with its status bit up.
    pub fn intr(&mut self) {
        let gis = self.bus.gr_read(GR_GIS);
        for port in 0..self.nports() {
            if gis & gr_gis_pxis(port) != 0 {
                self.intr_port(port);
            }
        }
        if gis != 0 {
            self.bus.gr_write(GR_GIS, gis);
        }
    }

    /// Port interrupt: decode attention state, then retire every slot that
    /// has gone quiet, ascending slot order.
    pub fn intr_port(&mut self, port: usize) {
        let mut pss = self.bus.pr_read(port, PRO_PSS);
        let mut tfd = 0u32;

        if pss & PR_PSS_ATTENTION != 0 {
            let pis = self.bus.pr_read(port, PRO_PIS);
            if pis & PR_PIS_CMDERRR != 0 {
                let ec = self.bus.pr_read(port, PRO_PCE);
                if ec > PORT_CERR_RECOVERABLE_MAX {
                    tracing::error!(port, ec, "fatal port error, resetting device");
                    self.bus.pr_write(port, PRO_PIS, pis);
                    if let Err(err) = self.device_reset(port) {
                        tracing::error!(port, %err, "device reset failed");
                    }
                    return;
                }

                // The device aborted a command but the port is intact. Fail
                // what stopped with a transport-error taskfile; a single
                // untagged transfer gets the real one from the shadow FIS.
                tfd = tfd_err_st(WDCE_ICRC, WDCS_ERR);
                let mut drive = 0;
                if let Some(x) = self.channels[port].queue.single_active() {
                    drive = x.drive;
                    if ec == PORT_CERR_DEV && !x.flags.contains(XferFlags::NCQ) {
                        let fis = self.bus.read_slot_fis(port, x.slot);
                        tfd = parse_d2h(&fis);
                    }
                }
                tracing::warn!(port, ec, tfd, "recoverable command error");

                if self.channels[port].is_recovering() {
                    // Second fault while draining: everything still
                    // outstanding is failed in this pass.
                    self.channels[port].recovery_tfd = tfd;
                    pss = 0;
                } else {
                    let ch = &mut self.channels[port];
                    ch.flags.insert(ChanFlags::RECOVERING);
                    ch.recovery_tfd = tfd;
                    ch.recovery_drive = drive;
                    ch.queue.freeze();
                }
            }
            self.bus.pr_write(port, PRO_PIS, pis);
        }

        for slot in 0..MAX_SLOTS {
            if self.channels[port].queue.is_active(slot) && pss & pr_pxss(slot) == 0 {
                self.slot_complete(port, slot, tfd);
            }
        }

        if self.channels[port].is_recovering() && self.channels[port].queue.is_idle() {
            self.channel_recover(port);
        }
    }

    /// The single done funnel: detaches the transfer from its slot, releases
    /// the mapping, runs the flavor completion, and kicks the queue.
    fn slot_complete(&mut self, port: usize, slot: u8, tfd: u32) {
        let Some(mut xfer) = self.channels[port].queue.take(slot) else {
            return;
        };
        if self.channels[port].callout.armed_slot() == Some(slot) {
            self.channels[port].callout.disarm();
        }
        if xfer.flags.contains(XferFlags::DMA) && xfer.bcount() > 0 {
            self.dma.unload(port, slot);
        }
        let ops = xfer.ops;
        ops.intr(self, port, &mut xfer, tfd);
        self.channels[port].completed.push(xfer);
        self.start_pending(port);
    }

    /// Deadline expiry. The armed transfer completes through the normal
    /// funnel marked timed out, then the device is reset, which fails
    /// whatever else was in flight.
    pub fn fire_timeout(&mut self, port: usize) {
        let Some(slot) = self.channels[port].callout.armed_slot() else {
            return;
        };
        self.channels[port].callout.disarm();
        if let Some(xfer) = self.channels[port].queue.active_mut(slot) {
            xfer.flags.insert(XferFlags::TIMEOUT);
            self.slot_complete(port, slot, 0);
            if let Err(err) = self.device_reset(port) {
                tracing::error!(port, %err, "device reset after timeout failed");
            }
        }
    }

    pub(crate) fn poll_slot(&mut self, port: usize, slot: u8) -> Result<()> {
        let tries = self.channels[port]
            .queue
            .peek(slot)
            .map_or(POLL_TRIES, |x| {
                x.timeout_ms().saturating_mul(POLL_ITERS_PER_MS)
            });
        for _ in 0..tries {
            let pss = self.bus.pr_read(port, PRO_PSS);
            if pss & PR_PSS_ATTENTION != 0 {
                self.intr_port(port);
            } else if pss & pr_pxss(slot) == 0 {
                self.slot_complete(port, slot, 0);
            }
            if !self.channels[port].queue.is_active(slot) {
                return Ok(());
            }
        }
        if let Some(xfer) = self.channels[port].queue.active_mut(slot) {
            xfer.flags.insert(XferFlags::TIMEOUT);
            self.slot_complete(port, slot, 0);
            if let Err(err) = self.device_reset(port) {
                tracing::error!(port, %err, "device reset after poll timeout failed");
            }
        }
        Err(SataError::PollTimeout { port, slot })
    }

    // ---- recovery and reset ----

    /// Runs once the error drain has emptied the queue: picks the cheapest
    /// way back to a live port, lets the owner resume queued commands, and
    /// unfreezes.
    fn channel_recover(&mut self, port: usize) {
        let tfd = self.channels[port].recovery_tfd;
        let drive = self.channels[port].recovery_drive;
        if tfd_status(tfd) & (WDCS_BSY | WDCS_DRQ) != 0 {
            // Drive still wedged in the protocol; only a reset clears it.
            if let Err(err) = self.device_reset(port) {
                tracing::error!(port, %err, "device reset during recovery failed");
            }
        } else if let Err(err) = self.reinit_port(port) {
            tracing::error!(port, %err, "port reinit during recovery failed");
        }
        // Retries issued by the hook run polled; the queue is still frozen.
        self.recovery.resume(port, drive, tfd, XferFlags::POLL);
        let ch = &mut self.channels[port];
        ch.flags.remove(ChanFlags::RECOVERING);
        ch.queue.thaw();
        self.start_pending(port);
    }

    /// Resets the attached device, escalating to a full port reset when the
    /// port does not come back. Everything in flight is failed as reset.
    pub fn device_reset(&mut self, port: usize) -> Result<()> {
        self.check_port(port)?;
        self.bus.pr_write(port, PRO_PCS, PR_PC_DEVICE_RESET);
        let ready = self.wait_port_ready(port);
        if !ready {
            tracing::warn!(port, "port not ready after device reset, resetting port");
            self.reset_channel(port)?;
        }
        self.kill_active(port, KillReason::Reset);
        Ok(())
    }

    /// Full port reset through the PHY, then reinitialization.
    pub fn reset_channel(&mut self, port: usize) -> Result<()> {
        self.check_port(port)?;
        self.bus.pr_write(port, PRO_SCONTROL, SC_DET_RESET);
        self.bus.pr_write(port, PRO_SCONTROL, SC_DET_NONE);
        let det = self.bus.pr_read(port, PRO_SSTATUS) & SS_DET_MASK;
        if det != SS_DET_DEV {
            tracing::warn!(port, det, "no device after port reset");
        }
        self.reinit_port(port)?;
        let serr = self.bus.pr_read(port, PRO_SERROR);
        self.bus.pr_write(port, PRO_SERROR, serr);
        self.kill_active(port, KillReason::Reset);
        Ok(())
    }

    /// Brings the port logic back up without disturbing the device. Behind a
    /// port multiplier the port is resumed and its PMP state reread first.
    pub fn reinit_port(&mut self, port: usize) -> Result<()> {
        self.check_port(port)?;
        if self.channels[port].ndrives > 1 {
            self.bus.pr_write(port, PRO_PCS, PR_PC_RESUME);
            let _ = self.bus.pr_read(port, PRO_PMPSTS);
            let _ = self.bus.pr_read(port, PRO_PMPQACT);
        }
        self.bus.pr_write(port, PRO_PCS, PR_PC_PORT_INITIALIZE);
        if !self.wait_port_ready(port) {
            return Err(SataError::PortNotReady {
                port,
                what: "initialize",
            });
        }
        if self.channels[port].ndrives > 1 {
            self.bus.pr_write(port, PRO_PCS, PR_PC_PMP_ENABLE);
        }
        Ok(())
    }

    /// Issues a soft reset to `drive` and returns the device signature from
    /// the initial register frame. Requires an idle queue.
    pub fn reset_drive(&mut self, port: usize, drive: usize) -> Result<u32> {
        self.check_port(port)?;
        if drive >= self.channels[port].ndrives.max(1) {
            return Err(SataError::BadDrive(drive));
        }
        if !self.channels[port].queue.is_idle() {
            return Err(SataError::ChannelFrozen(port));
        }
        let slot = 0u8;
        let prb = Prb {
            control: PrbControl::SOFT_RESET | PrbControl::INTERRUPT_MASK,
            protocol: drive as u16,
            ..Prb::default()
        };
        prb.encode(&mut self.channels[port].prb[slot as usize]);
        self.activate_prb(port, slot);

        for _ in 0..POLL_TRIES {
            let pss = self.bus.pr_read(port, PRO_PSS);
            if pss & pr_pxss(slot) == 0 {
                let fis = self.bus.read_slot_fis(port, slot);
                return Ok(fis::signature(&fis));
            }
        }
        self.reset_channel(port)?;
        Err(SataError::PollTimeout { port, slot })
    }

    /// Detects what sits behind the port, soft-resetting to read the
    /// signature when the PHY reports an established device.
    pub fn probe_port(&mut self, port: usize) -> Result<DriveKind> {
        self.check_port(port)?;
        let det = self.bus.pr_read(port, PRO_SSTATUS) & SS_DET_MASK;
        if det != SS_DET_DEV {
            return Ok(DriveKind::None);
        }
        let sig = self.reset_drive(port, 0)?;
        Ok(match sig {
            SIG_ATAPI => DriveKind::Atapi,
            SIG_PMP => {
                self.bus.pr_write(port, PRO_PCS, PR_PC_PMP_ENABLE);
                DriveKind::PortMultiplier
            }
            SIG_ATA => DriveKind::Ata,
            other => {
                tracing::warn!(port, sig = other, "unrecognized signature, assuming disk");
                DriveKind::Ata
            }
        })
    }

    /// Fails every in-flight transfer. Requeued block transfers go back to
    /// the head of the pending queue.
    pub fn kill_active(&mut self, port: usize, reason: KillReason) {
        self.channels[port].callout.disarm();
        let drained = self.channels[port].queue.drain_active();
        for mut xfer in drained {
            if xfer.flags.contains(XferFlags::DMA) && xfer.bcount() > 0 {
                self.dma.unload(port, xfer.slot);
            }
            let ops = xfer.ops;
            ops.kill(self, port, &mut xfer, reason);
            if reason == KillReason::Requeue && !matches!(xfer.payload, Payload::Cmd(_)) {
                xfer.result = None;
                self.channels[port].queue.push_pending_front(xfer);
            } else {
                self.channels[port].completed.push(xfer);
            }
        }
        if reason == KillReason::Requeue {
            self.start_pending(port);
        }
    }

    // ---- helpers ----

    fn check_port(&self, port: usize) -> Result<()> {
        if port < self.channels.len() {
            Ok(())
        } else {
            Err(SataError::BadPort(port))
        }
    }

    fn wait_port_ready(&mut self, port: usize) -> bool {
        for _ in 0..READY_TRIES {
            if self.bus.pr_read(port, PRO_PS) & PR_PS_PORT_READY != 0 {
                return true;
            }
        }
        false
    }

    /// Hands the slot's request block address to the activation registers.
    fn activate_prb(&mut self, port: usize, slot: u8) {
        let addr = self.channels[port].prb_bus[slot as usize];
        self.bus.pr_write(port, pro_car(slot), addr as u32);
        self.bus.pr_write(port, pro_car(slot) + 4, (addr >> 32) as u32);
    }

    /// Common start tail: maps the payload, serializes the request block,
    /// activates the slot, and arms the deadline.
    fn activate_slot(
        &mut self,
        port: usize,
        xfer: &Xfer,
        fis: [u8; fis::FIS_LEN],
        mut control: PrbControl,
        cdb: Option<[u8; 16]>,
    ) -> Result<()> {
        let slot = xfer.slot;
        if xfer.flags.contains(XferFlags::POLL) {
            control |= PrbControl::INTERRUPT_MASK;
        }
        let sges = match (xfer.bcount(), xfer.dma_direction()) {
            (0, _) | (_, None) => Vec::new(),
            (len, Some(dir)) => self.dma.load(port, slot, len, dir)?,
        };
        let prb = Prb {
            control,
            protocol: 0,
            fis,
            atapi_cdb: cdb.unwrap_or_default(),
            sges,
        };
        prb.encode(&mut self.channels[port].prb[slot as usize]);
        self.activate_prb(port, slot);
        self.channels[port].callout.arm(slot, xfer.timeout_ms());
        Ok(())
    }
}

// ---- flavor operation tables ----

struct CmdOps;
struct BioOps;
struct AtapiOps;

static CMD_OPS: CmdOps = CmdOps;
static BIO_OPS: BioOps = BioOps;
static ATAPI_OPS: AtapiOps = AtapiOps;

impl XferOps for CmdOps {
    fn start(&self, ctlr: &mut SataController, port: usize, xfer: &mut Xfer) -> Result<()> {
        let Payload::Cmd(cmd) = &xfer.payload else {
            unreachable!()
        };
        let fis = fis::construct_cmd(cmd);
        ctlr.activate_slot(port, xfer, fis, PrbControl::empty(), None)
    }

    fn intr(&self, _ctlr: &mut SataController, _port: usize, xfer: &mut Xfer, tfd: u32) {
        let mut res = CmdResult {
            flags: CmdResultFlags::DONE,
            tfd,
        };
        let st = tfd_status(tfd);
        if xfer.flags.contains(XferFlags::TIMEOUT) {
            res.flags |= CmdResultFlags::TIMEOUT;
        } else if st & WDCS_DWF != 0 {
            res.flags |= CmdResultFlags::ERROR | CmdResultFlags::DEVICE_FAULT;
        } else if st & WDCS_ERR != 0 {
            res.flags |= CmdResultFlags::ERROR;
        }
        xfer.result = Some(XferResult::Cmd(res));
    }

    fn poll(&self, ctlr: &mut SataController, port: usize, slot: u8) -> Result<()> {
        ctlr.poll_slot(port, slot)
    }

    fn abort(&self, ctlr: &mut SataController, port: usize, xfer: &mut Xfer) {
        self.kill(ctlr, port, xfer, KillReason::Reset);
    }

    fn kill(&self, _ctlr: &mut SataController, _port: usize, xfer: &mut Xfer, reason: KillReason) {
        let flags = match reason {
            KillReason::Gone | KillReason::GoneInactive => {
                CmdResultFlags::DONE | CmdResultFlags::ERROR | CmdResultFlags::GONE
            }
            KillReason::Reset => CmdResultFlags::DONE | CmdResultFlags::RESET,
            KillReason::Requeue => panic!("attempt to requeue an untagged command"),
        };
        xfer.result = Some(XferResult::Cmd(CmdResult { flags, tfd: 0 }));
    }
}

impl XferOps for BioOps {
    fn start(&self, ctlr: &mut SataController, port: usize, xfer: &mut Xfer) -> Result<()> {
        let Payload::Bio(bio) = &xfer.payload else {
            unreachable!()
        };
        let ncq = xfer.flags.contains(XferFlags::NCQ);
        let fis = fis::construct_bio(bio, ncq, xfer.slot);
        ctlr.activate_slot(port, xfer, fis, PrbControl::empty(), None)
    }

    fn intr(&self, ctlr: &mut SataController, port: usize, xfer: &mut Xfer, tfd: u32) {
        let Payload::Bio(bio) = &xfer.payload else {
            unreachable!()
        };
        let bcount = bio.bcount;
        let mut res = BioResult {
            tfd,
            ..BioResult::default()
        };
        let st = tfd_status(tfd);
        if xfer.flags.contains(XferFlags::TIMEOUT) {
            res.error = BioError::Timeout;
            res.residual = bcount;
        } else if st & (WDCS_ERR | WDCS_DWF) != 0 {
            res.error = BioError::Error;
            res.residual = bcount;
        } else if xfer.flags.contains(XferFlags::NCQ) {
            // Queued completions report how much actually moved.
            let rtc = ctlr.bus.read_slot_rtc(port, xfer.slot) as usize;
            res.residual = bcount.saturating_sub(rtc);
        }
        xfer.result = Some(XferResult::Bio(res));
    }

    fn poll(&self, ctlr: &mut SataController, port: usize, slot: u8) -> Result<()> {
        ctlr.poll_slot(port, slot)
    }

    fn abort(&self, ctlr: &mut SataController, port: usize, xfer: &mut Xfer) {
        self.kill(ctlr, port, xfer, KillReason::Reset);
    }

    fn kill(&self, _ctlr: &mut SataController, _port: usize, xfer: &mut Xfer, reason: KillReason) {
        let Payload::Bio(bio) = &xfer.payload else {
            unreachable!()
        };
        let error = match reason {
            KillReason::Gone | KillReason::GoneInactive => BioError::NoDevice,
            KillReason::Reset => BioError::Reset,
            KillReason::Requeue => return,
        };
        xfer.result = Some(XferResult::Bio(BioResult {
            error,
            residual: bio.bcount,
            tfd: 0,
        }));
    }
}

impl XferOps for AtapiOps {
    fn start(&self, ctlr: &mut SataController, port: usize, xfer: &mut Xfer) -> Result<()> {
        let Payload::Atapi(pkt) = &xfer.payload else {
            unreachable!()
        };
        let dma = xfer.flags.contains(XferFlags::DMA);
        let fis = fis::construct_atapi(pkt, dma);
        let mut control = if pkt.write {
            PrbControl::PACKET_WRITE
        } else {
            PrbControl::PACKET_READ
        };
        if pkt.bcount == 0 {
            control = PrbControl::empty();
        }
        let mut cdb = [0u8; 16];
        cdb[..pkt.cdb_len].copy_from_slice(&pkt.cdb[..pkt.cdb_len]);
        ctlr.activate_slot(port, xfer, fis, control, Some(cdb))
    }

    fn intr(&self, _ctlr: &mut SataController, _port: usize, xfer: &mut Xfer, tfd: u32) {
        let Payload::Atapi(pkt) = &xfer.payload else {
            unreachable!()
        };
        let bcount = pkt.bcount;
        let mut res = AtapiResult {
            tfd,
            ..AtapiResult::default()
        };
        let st = tfd_status(tfd);
        if xfer.flags.contains(XferFlags::TIMEOUT) {
            res.error = XsError::Timeout;
            res.residual = bcount;
        } else if st & WDCS_ERR != 0 {
            res.error = XsError::ShortSense;
            res.residual = bcount;
        }
        xfer.result = Some(XferResult::Atapi(res));
    }

    fn poll(&self, ctlr: &mut SataController, port: usize, slot: u8) -> Result<()> {
        ctlr.poll_slot(port, slot)
    }

    fn abort(&self, ctlr: &mut SataController, port: usize, xfer: &mut Xfer) {
        self.kill(ctlr, port, xfer, KillReason::Reset);
    }

    fn kill(&self, _ctlr: &mut SataController, _port: usize, xfer: &mut Xfer, reason: KillReason) {
        let Payload::Atapi(pkt) = &xfer.payload else {
            unreachable!()
        };
        let error = match reason {
            KillReason::Gone | KillReason::GoneInactive => XsError::NoDevice,
            KillReason::Reset => XsError::Reset,
            KillReason::Requeue => return,
        };
        xfer.result = Some(XferResult::Atapi(AtapiResult {
            error,
            residual: pkt.bcount,
            tfd: 0,
        }));
    }
}

#[cfg(test)]
pub(crate) fn test_xfer(slot: u8, flags: XferFlags) -> Xfer {
    Xfer {
        slot,
        drive: 0,
        flags,
        payload: Payload::Bio(AtaBio {
            blkno: 0,
            nblks: 1,
            bcount: 512,
            write: false,
            lba48: true,
            timeout_ms: 1_000,
        }),
        result: None,
        ops: &BIO_OPS,
    }
}
