//! Scriptable controller model shared by the scenario suites.
//!
//! `SimHba` implements the register seams over shared state a test can poke:
//! completing or failing slots, controlling readiness, and planting received
//! FIS bytes, while recording every activation and reset the state machine
//! performs.

#![allow(dead_code)]

use std::collections::HashSet;
use std::sync::{Arc, Mutex, MutexGuard};

use talon_sata::{
    gr_gis_pxis, pro_car, DmaDirection, DmaError, DmaMapper, DmaSegment, HostBus,
    NullRecovery, RecoveryResume, SataController, XferFlags, GR_GC, GR_GIS, MAX_SLOTS, PRO_PCS, PRO_PIEC,
    PRO_PIES, PRO_PIS, PRO_PMPQACT, PRO_PMPSTS, PRO_PS, PRO_PSS, PRO_PCC, PRO_PCE, PRO_SCONTROL,
    PRO_SSTATUS, PRSO_FIS, PRSO_RTC, PRS_BASE, PRS_STRIDE, PR_PC_DEVICE_RESET,
    PR_PC_PMP_ENABLE, PR_PC_PORT_INITIALIZE, PR_PC_RESUME, PR_PIS_CMDERRR, PR_PS_PORT_READY,
    PR_PSS_ATTENTION, SC_DET_RESET, SS_DET_DEV,
};

pub const PRB_BASE: u64 = 0x40_0000;

#[derive(Clone)]
pub struct SimPort {
    pub pcs: u32,
    pub pis: u32,
    pub pies: u32,
    pub ps: u32,
    pub pss: u32,
    pub pce: u32,
    pub sstatus: u32,
    pub scontrol: u32,
    pub car: Vec<u64>,
    pub fis: Vec<[u8; 20]>,
    pub rtc: Vec<u32>,
    /// Slots in activation order.
    pub activations: Vec<u8>,
    /// Reset-style operations in issue order.
    pub resets: Vec<&'static str>,
    /// Scripted polled completion: clear this slot's busy bit after N reads
    /// of the slot status register.
    pub auto_complete: Option<(u8, u32)>,
}

impl SimPort {
    fn new() -> Self {
        Self {
            pcs: 0,
            pis: 0,
            pies: 0,
            ps: 0,
            pss: 0,
            pce: 0,
            sstatus: SS_DET_DEV,
            scontrol: 0,
            car: vec![0; usize::from(MAX_SLOTS)],
            fis: vec![[0; 20]; usize::from(MAX_SLOTS)],
            rtc: vec![0; usize::from(MAX_SLOTS)],
            activations: Vec::new(),
            resets: Vec::new(),
            auto_complete: None,
        }
    }
}

pub struct SimState {
    pub gc: u32,
    pub gis: u32,
    pub ports: Vec<SimPort>,
}

#[derive(Clone)]
pub struct SimHandle(Arc<Mutex<SimState>>);

impl SimHandle {
    pub fn new(nports: usize) -> Self {
        Self(Arc::new(Mutex::new(SimState {
            gc: 0,
            gis: 0,
            ports: (0..nports).map(|_| SimPort::new()).collect(),
        })))
    }

    pub fn lock(&self) -> MutexGuard<'_, SimState> {
        self.0.lock().unwrap()
    }

    /// Slot finished cleanly: busy bit drops, completion interrupt raises.
    pub fn complete_slot(&self, port: usize, slot: u8) {
        let mut st = self.lock();
        st.ports[port].pss &= !(1 << slot);
        st.gis |= gr_gis_pxis(port);
    }

    pub fn set_rtc(&self, port: usize, slot: u8, rtc: u32) {
        self.lock().ports[port].rtc[usize::from(slot)] = rtc;
    }

    /// Command error: the failing slot stops, attention and the error code
    /// come up.
    pub fn fail_slot(&self, port: usize, slot: u8, ec: u32) {
        let mut st = self.lock();
        let p = &mut st.ports[port];
        p.pss &= !(1 << slot);
        p.pss |= PR_PSS_ATTENTION;
        p.pis |= PR_PIS_CMDERRR;
        p.pce = ec;
        st.gis |= gr_gis_pxis(port);
    }

    pub fn set_slot_fis(&self, port: usize, slot: u8, fis: [u8; 20]) {
        self.lock().ports[port].fis[usize::from(slot)] = fis;
    }

    pub fn set_det(&self, port: usize, det: u32) {
        self.lock().ports[port].sstatus = det;
    }

    pub fn auto_complete(&self, port: usize, slot: u8, after_reads: u32) {
        self.lock().ports[port].auto_complete = Some((slot, after_reads));
    }

    pub fn activations(&self, port: usize) -> Vec<u8> {
        self.lock().ports[port].activations.clone()
    }

    pub fn resets(&self, port: usize) -> Vec<&'static str> {
        self.lock().ports[port].resets.clone()
    }

    pub fn busy_mask(&self, port: usize) -> u32 {
        self.lock().ports[port].pss
    }
}

pub struct SimHba(SimHandle);

impl HostBus for SimHba {
    fn gr_read(&self, reg: u64) -> u32 {
        let st = self.0.lock();
        match reg {
            GR_GC => st.gc,
            GR_GIS => st.gis,
            _ => 0,
        }
    }

    fn gr_write(&mut self, reg: u64, value: u32) {
        let mut st = self.0.lock();
        match reg {
            GR_GC => st.gc = value,
            // Interrupt status is write-one-to-clear.
            GR_GIS => st.gis &= !value,
            _ => {}
        }
    }

    fn pr_read(&self, port: usize, reg: u64) -> u32 {
        let mut st = self.0.lock();
        let p = &mut st.ports[port];
        match reg {
            PRO_PCS => p.pcs,
            PRO_PIS => p.pis,
            PRO_PS => p.ps,
            PRO_PSS => {
                if let Some((slot, reads)) = p.auto_complete {
                    if reads == 0 {
                        p.pss &= !(1 << slot);
                        p.auto_complete = None;
                    } else {
                        p.auto_complete = Some((slot, reads - 1));
                    }
                }
                p.pss
            }
            PRO_PCE => p.pce,
            PRO_SSTATUS => p.sstatus,
            PRO_SCONTROL => p.scontrol,
            PRO_PMPSTS | PRO_PMPQACT => 0,
            reg if reg >= PRS_BASE => {
                let slot = usize::try_from((reg - PRS_BASE) / PRS_STRIDE).unwrap();
                let off = (reg - PRS_BASE) % PRS_STRIDE;
                let fis_end = PRSO_FIS + 20;
                if (PRSO_FIS..fis_end).contains(&off) {
                    let i = usize::try_from(off - PRSO_FIS).unwrap();
                    u32::from_le_bytes(p.fis[slot][i..i + 4].try_into().unwrap())
                } else if off == PRSO_RTC {
                    p.rtc[slot]
                } else {
                    0
                }
            }
            _ => 0,
        }
    }

    fn pr_write(&mut self, port: usize, reg: u64, value: u32) {
        let mut st = self.0.lock();
        let p = &mut st.ports[port];
        match reg {
            PRO_PCS => {
                p.pcs |= value;
                if value & PR_PC_DEVICE_RESET != 0 {
                    p.resets.push("device-reset");
                    p.pss = 0;
                    p.pce = 0;
                    p.pis = 0;
                    p.ps |= PR_PS_PORT_READY;
                }
                if value & PR_PC_PORT_INITIALIZE != 0 {
                    p.resets.push("port-init");
                    p.pss = 0;
                    p.pce = 0;
                    p.ps |= PR_PS_PORT_READY;
                }
                if value & PR_PC_RESUME != 0 {
                    p.resets.push("resume");
                }
                if value & PR_PC_PMP_ENABLE != 0 {
                    p.resets.push("pmp-enable");
                }
            }
            PRO_PCC => p.pcs &= !value,
            PRO_PIS => {
                // Write-one-to-clear; acknowledging the command error also
                // drops attention and the latched code.
                if value & PR_PIS_CMDERRR != 0 {
                    p.pss &= !PR_PSS_ATTENTION;
                    p.pce = 0;
                }
                p.pis &= !value;
            }
            PRO_PIES => p.pies |= value,
            PRO_PIEC => p.pies &= !value,
            PRO_SCONTROL => {
                p.scontrol = value;
                if value & SC_DET_RESET != 0 {
                    p.resets.push("phy-reset");
                    p.pss = 0;
                    p.ps |= PR_PS_PORT_READY;
                }
            }
            reg if (pro_car(0)..pro_car(MAX_SLOTS)).contains(&reg) => {
                let idx = usize::try_from((reg - pro_car(0)) / 8).unwrap();
                let half = (reg - pro_car(0)) % 8;
                if half == 0 {
                    p.car[idx] = (p.car[idx] & !0xffff_ffff) | u64::from(value);
                } else {
                    p.car[idx] = (p.car[idx] & 0xffff_ffff) | u64::from(value) << 32;
                    p.pss |= 1 << idx;
                    p.activations.push(idx as u8);
                }
            }
            _ => {}
        }
    }
}

#[derive(Default)]
pub struct DmaState {
    pub loaded: HashSet<(usize, u8)>,
    pub loads: Vec<(usize, u8, usize, DmaDirection)>,
    pub unloads: Vec<(usize, u8)>,
    /// Scripted failures: this many upcoming loads return an error.
    pub fail_loads: u32,
}

#[derive(Clone, Default)]
pub struct DmaHandle(Arc<Mutex<DmaState>>);

impl DmaHandle {
    pub fn lock(&self) -> MutexGuard<'_, DmaState> {
        self.0.lock().unwrap()
    }

    pub fn fail_next_load(&self) {
        self.lock().fail_loads += 1;
    }
}

pub struct SimDma(DmaHandle);

impl DmaMapper for SimDma {
    fn load(
        &mut self,
        port: usize,
        slot: u8,
        len: usize,
        dir: DmaDirection,
    ) -> Result<Vec<DmaSegment>, DmaError> {
        let mut st = self.0.lock();
        if st.fail_loads > 0 {
            st.fail_loads -= 1;
            return Err(DmaError::MapFailed("out of map resources"));
        }
        assert!(
            st.loaded.insert((port, slot)),
            "slot ({port}, {slot}) reused with a live mapping"
        );
        st.loads.push((port, slot, len, dir));
        // Two segments when it splits evenly, to exercise the table.
        let addr = 0x10_0000 + u64::from(slot) * 0x1_0000;
        if len >= 1024 {
            let half = (len / 2) as u32;
            Ok(vec![
                DmaSegment { addr, len: half },
                DmaSegment {
                    addr: addr + u64::from(half),
                    len: len as u32 - half,
                },
            ])
        } else {
            Ok(vec![DmaSegment {
                addr,
                len: len as u32,
            }])
        }
    }

    fn unload(&mut self, port: usize, slot: u8) {
        let mut st = self.0.lock();
        st.loaded.remove(&(port, slot));
        st.unloads.push((port, slot));
    }
}

#[derive(Clone, Default)]
pub struct RecoveryLog(Arc<Mutex<Vec<(usize, usize, u32)>>>);

impl RecoveryLog {
    pub fn calls(&self) -> Vec<(usize, usize, u32)> {
        self.0.lock().unwrap().clone()
    }

    fn record(&self, port: usize, drive: usize, tfd: u32) {
        self.0.lock().unwrap().push((port, drive, tfd));
    }
}

pub struct LoggingRecovery(pub RecoveryLog);

impl RecoveryResume for LoggingRecovery {
    fn resume(&mut self, port: usize, drive: usize, tfd: u32, flags: XferFlags) {
        assert!(flags.contains(XferFlags::POLL));
        self.0.record(port, drive, tfd);
    }
}

/// Attached controller over fresh sim state.
pub fn setup(nports: usize) -> (SataController, SimHandle, DmaHandle, RecoveryLog) {
    let sim = SimHandle::new(nports);
    let dma = DmaHandle::default();
    let rec = RecoveryLog::default();
    let mut ctlr = SataController::new(
        Box::new(SimHba(sim.clone())),
        Box::new(SimDma(dma.clone())),
        Box::new(LoggingRecovery(rec.clone())),
        nports,
        PRB_BASE,
    );
    ctlr.attach().expect("attach");
    (ctlr, sim, dma, rec)
}

/// Attached controller that ignores recovery callbacks.
pub fn setup_plain(nports: usize) -> (SataController, SimHandle, DmaHandle) {
    let sim = SimHandle::new(nports);
    let dma = DmaHandle::default();
    let mut ctlr = SataController::new(
        Box::new(SimHba(sim.clone())),
        Box::new(SimDma(dma.clone())),
        Box::new(NullRecovery),
        nports,
        PRB_BASE,
    );
    ctlr.attach().expect("attach");
    (ctlr, sim, dma)
}
