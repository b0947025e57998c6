//! Register access seam between the state machine and a controller model.

use crate::regs::{prs_reg, PRSO_FIS, PRSO_RTC};

/// Register-level access to one host controller.
///
/// `gr_*` touch the global window, `pr_*` a port window. Implementations are
/// models (tests, emulated hardware); all accesses are 32-bit.
pub trait HostBus: Send {
    fn gr_read(&self, reg: u64) -> u32;
    fn gr_write(&mut self, reg: u64, value: u32);
    fn pr_read(&self, port: usize, reg: u64) -> u32;
    fn pr_write(&mut self, port: usize, reg: u64, value: u32);

    /// The last received FIS for `slot`, as stored dword-wise in the slot
    /// region.
    fn read_slot_fis(&self, port: usize, slot: u8) -> [u8; 20] {
        let mut fis = [0u8; 20];
        for (i, chunk) in fis.chunks_exact_mut(4).enumerate() {
            let dword = self.pr_read(port, prs_reg(slot, PRSO_FIS + i as u64 * 4));
            chunk.copy_from_slice(&dword.to_le_bytes());
        }
        fis
    }

    /// Received transfer count for `slot`, valid after a queued command
    /// completes.
    fn read_slot_rtc(&self, port: usize, slot: u8) -> u32 {
        self.pr_read(port, prs_reg(slot, PRSO_RTC))
    }
}
