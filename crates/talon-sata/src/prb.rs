//! Port Request Block: the per-slot command descriptor handed to hardware.
//!
//! A PRB is a fixed 1024-byte block: a little-endian control word, the
//! host-to-device FIS at 0x08, the packet CDB at 0x20, and a scatter/gather
//! table at 0x40. The SGE table has no length field; the last entry carries a
//! terminate flag instead.

use bitflags::bitflags;

use crate::dma::DmaSegment;
use crate::fis::FIS_LEN;

pub const PRB_SIZE: usize = 1024;
pub const PRB_OFF_CONTROL: usize = 0x00;
pub const PRB_OFF_PROTOCOL: usize = 0x02;
pub const PRB_OFF_FIS: usize = 0x08;
pub const PRB_OFF_ATAPI: usize = 0x20;
pub const PRB_OFF_SGE: usize = 0x40;
pub const SGE_SIZE: usize = 16;
/// Entries that fit between the table offset and the end of the block.
pub const PRB_MAX_SGE: usize = (PRB_SIZE - PRB_OFF_SGE) / SGE_SIZE;

/// Last entry of the scatter/gather table.
pub const SGE_FLAG_TRM: u32 = 1 << 31;

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct PrbControl: u16 {
        const PROTOCOL_OVERRIDE = 1 << 0;
        const RETRANSMIT = 1 << 1;
        const EXTERNAL_COMMAND = 1 << 2;
        const PACKET_READ = 1 << 3;
        const PACKET_WRITE = 1 << 4;
        /// Suppress the completion interrupt for this slot (polled commands).
        const INTERRUPT_MASK = 1 << 6;
        /// The FIS area carries a device control soft-reset sequence.
        const SOFT_RESET = 1 << 7;
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Prb {
    pub control: PrbControl,
    pub protocol: u16,
    pub fis: [u8; FIS_LEN],
    pub atapi_cdb: [u8; 16],
    pub sges: Vec<DmaSegment>,
}

impl Prb {
    /// Serializes into a slot's block. An empty segment list still emits one
    /// zeroed terminator entry so hardware sees a terminated table.
    ///
    /// # Panics
    ///
    /// Panics if the segment list exceeds [`PRB_MAX_SGE`]; the mapper is
    /// required to bound it.
    pub fn encode(&self, out: &mut [u8; PRB_SIZE]) {
        assert!(self.sges.len() <= PRB_MAX_SGE);
        out.fill(0);
        out[PRB_OFF_CONTROL..PRB_OFF_CONTROL + 2].copy_from_slice(&self.control.bits().to_le_bytes());
        out[PRB_OFF_PROTOCOL..PRB_OFF_PROTOCOL + 2].copy_from_slice(&self.protocol.to_le_bytes());
        out[PRB_OFF_FIS..PRB_OFF_FIS + FIS_LEN].copy_from_slice(&self.fis);
        out[PRB_OFF_ATAPI..PRB_OFF_ATAPI + 16].copy_from_slice(&self.atapi_cdb);

        if self.sges.is_empty() {
            let flags_at = PRB_OFF_SGE + 12;
            out[flags_at..flags_at + 4].copy_from_slice(&SGE_FLAG_TRM.to_le_bytes());
            return;
        }
        for (i, sge) in self.sges.iter().enumerate() {
            let base = PRB_OFF_SGE + i * SGE_SIZE;
            out[base..base + 8].copy_from_slice(&sge.addr.to_le_bytes());
            out[base + 8..base + 12].copy_from_slice(&sge.len.to_le_bytes());
            let flags = if i == self.sges.len() - 1 { SGE_FLAG_TRM } else { 0 };
            out[base + 12..base + 16].copy_from_slice(&flags.to_le_bytes());
        }
    }

    /// Parses a slot's block back, collecting segments up to and including
    /// the terminator. A terminator-only table decodes as no segments.
    pub fn decode(block: &[u8; PRB_SIZE]) -> Self {
        let control = PrbControl::from_bits_truncate(u16::from_le_bytes([
            block[PRB_OFF_CONTROL],
            block[PRB_OFF_CONTROL + 1],
        ]));
        let protocol = u16::from_le_bytes([block[PRB_OFF_PROTOCOL], block[PRB_OFF_PROTOCOL + 1]]);
        let mut fis = [0u8; FIS_LEN];
        fis.copy_from_slice(&block[PRB_OFF_FIS..PRB_OFF_FIS + FIS_LEN]);
        let mut atapi_cdb = [0u8; 16];
        atapi_cdb.copy_from_slice(&block[PRB_OFF_ATAPI..PRB_OFF_ATAPI + 16]);

        let mut sges = Vec::new();
        for i in 0..PRB_MAX_SGE {
            let base = PRB_OFF_SGE + i * SGE_SIZE;
            let addr = u64::from_le_bytes(block[base..base + 8].try_into().unwrap_or([0; 8]));
            let len =
                u32::from_le_bytes(block[base + 8..base + 12].try_into().unwrap_or([0; 4]));
            let flags =
                u32::from_le_bytes(block[base + 12..base + 16].try_into().unwrap_or([0; 4]));
            let last = flags & SGE_FLAG_TRM != 0;
            if !(last && addr == 0 && len == 0 && i == 0) {
                sges.push(DmaSegment { addr, len });
            }
            if last {
                break;
            }
        }
        Self {
            control,
            protocol,
            fis,
            atapi_cdb,
            sges,
        }
    }
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;

    use super::*;

    #[test]
    fn empty_table_emits_lone_terminator() {
        let prb = Prb::default();
        let mut block = [0xaa; PRB_SIZE];
        prb.encode(&mut block);
        let flags = u32::from_le_bytes(block[PRB_OFF_SGE + 12..PRB_OFF_SGE + 16].try_into().unwrap());
        assert_eq!(flags, SGE_FLAG_TRM);
        assert!(Prb::decode(&block).sges.is_empty());
    }

    #[test]
    fn terminate_flag_sits_on_last_entry_only() {
        let prb = Prb {
            sges: vec![
                DmaSegment { addr: 0x1000, len: 0x200 },
                DmaSegment { addr: 0x3000, len: 0x200 },
                DmaSegment { addr: 0x9000, len: 0x400 },
            ],
            ..Prb::default()
        };
        let mut block = [0u8; PRB_SIZE];
        prb.encode(&mut block);
        for i in 0..3 {
            let base = PRB_OFF_SGE + i * SGE_SIZE;
            let flags = u32::from_le_bytes(block[base + 12..base + 16].try_into().unwrap());
            assert_eq!(flags & SGE_FLAG_TRM != 0, i == 2, "entry {i}");
        }
    }

    #[test]
    fn fields_land_at_fixed_offsets() {
        let mut prb = Prb {
            control: PrbControl::SOFT_RESET | PrbControl::INTERRUPT_MASK,
            protocol: 0x0102,
            ..Prb::default()
        };
        prb.fis[0] = 0x27;
        prb.fis[19] = 0x5a;
        prb.atapi_cdb[0] = 0x28;
        let mut block = [0u8; PRB_SIZE];
        prb.encode(&mut block);
        assert_eq!(u16::from_le_bytes([block[0], block[1]]), 0x00c0);
        assert_eq!(u16::from_le_bytes([block[2], block[3]]), 0x0102);
        assert_eq!(block[PRB_OFF_FIS], 0x27);
        assert_eq!(block[PRB_OFF_FIS + 19], 0x5a);
        assert_eq!(block[PRB_OFF_ATAPI], 0x28);
    }

    fn sge_strategy() -> impl Strategy<Value = Vec<DmaSegment>> {
        proptest::collection::vec(
            (1u64..u64::MAX, 1u32..0x40_0000).prop_map(|(addr, len)| DmaSegment { addr, len }),
            0..PRB_MAX_SGE,
        )
    }

    proptest! {
        #[test]
        fn decode_inverts_encode(
            control in any::<u16>(),
            protocol in any::<u16>(),
            fis in any::<[u8; FIS_LEN]>(),
            cdb in any::<[u8; 16]>(),
            sges in sge_strategy(),
        ) {
            let prb = Prb {
                control: PrbControl::from_bits_truncate(control),
                protocol,
                fis,
                atapi_cdb: cdb,
                sges,
            };
            let mut block = [0u8; PRB_SIZE];
            prb.encode(&mut block);
            prop_assert_eq!(Prb::decode(&block), prb);
        }
    }
}
