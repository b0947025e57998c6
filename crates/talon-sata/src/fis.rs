//! Frame Information Structure encoding and taskfile helpers.
//!
//! Host-to-device register frames are built byte-exact into the request
//! block; device-to-host frames come back through the slot FIS area and are
//! folded into a packed taskfile word (error register in bits 15:8, status in
//! bits 7:0).

use crate::xfer::{AtaBio, AtaCommand, AtapiXfer};

pub const FIS_LEN: usize = 20;

pub const FIS_TYPE_REG_H2D: u8 = 0x27;
pub const FIS_TYPE_REG_D2H: u8 = 0x34;

/// Command bit in the H2D flags byte: this frame updates the command
/// register.
const FIS_H2D_CMD: u8 = 0x80;

// Status register bits.
pub const WDCS_BSY: u8 = 0x80;
pub const WDCS_DRDY: u8 = 0x40;
pub const WDCS_DWF: u8 = 0x20;
pub const WDCS_DSC: u8 = 0x10;
pub const WDCS_DRQ: u8 = 0x08;
pub const WDCS_CORR: u8 = 0x04;
pub const WDCS_ERR: u8 = 0x01;

// Error register bits.
pub const WDCE_ICRC: u8 = 0x80;
pub const WDCE_UNC: u8 = 0x40;
pub const WDCE_IDNF: u8 = 0x10;
pub const WDCE_ABRT: u8 = 0x04;

// Device register.
pub const WDSD_LBA: u8 = 0x40;

// Commands.
pub const WDCC_READDMA: u8 = 0xc8;
pub const WDCC_WRITEDMA: u8 = 0xca;
pub const WDCC_READDMA_EXT: u8 = 0x25;
pub const WDCC_WRITEDMA_EXT: u8 = 0x35;
pub const WDCC_READ_FPDMA_QUEUED: u8 = 0x60;
pub const WDCC_WRITE_FPDMA_QUEUED: u8 = 0x61;
pub const WDCC_IDENTIFY: u8 = 0xec;
pub const WDCC_FLUSHCACHE: u8 = 0xe7;
pub const ATAPI_PKT_CMD: u8 = 0xa0;
pub const ATAPI_IDENTIFY: u8 = 0xa1;

// Device signatures, from the initial D2H frame after reset.
pub const SIG_ATA: u32 = 0x0000_0101;
pub const SIG_ATAPI: u32 = 0xeb14_0101;
pub const SIG_PMP: u32 = 0x9669_0101;

/// Packs error and status registers into a taskfile word.
#[inline]
pub const fn tfd_err_st(error: u8, status: u8) -> u32 {
    (error as u32) << 8 | status as u32
}

#[inline]
pub const fn tfd_status(tfd: u32) -> u8 {
    tfd as u8
}

#[inline]
pub const fn tfd_error(tfd: u32) -> u8 {
    (tfd >> 8) as u8
}

/// H2D register frame for a raw taskfile command.
pub fn construct_cmd(cmd: &AtaCommand) -> [u8; FIS_LEN] {
    let mut fis = [0u8; FIS_LEN];
    fis[0] = FIS_TYPE_REG_H2D;
    fis[1] = FIS_H2D_CMD;
    fis[2] = cmd.command;
    fis[3] = cmd.features as u8;
    fis[4] = cmd.lba as u8;
    fis[5] = (cmd.lba >> 8) as u8;
    fis[6] = (cmd.lba >> 16) as u8;
    fis[7] = cmd.device;
    fis[8] = (cmd.lba >> 24) as u8;
    fis[9] = (cmd.lba >> 32) as u8;
    fis[10] = (cmd.lba >> 40) as u8;
    fis[11] = (cmd.features >> 8) as u8;
    fis[12] = cmd.count as u8;
    fis[13] = (cmd.count >> 8) as u8;
    fis
}

/// H2D register frame for a block transfer. Queued commands carry the sector
/// count in the features field and the tag in the count field.
pub fn construct_bio(bio: &AtaBio, ncq: bool, tag: u8) -> [u8; FIS_LEN] {
    let mut fis = [0u8; FIS_LEN];
    fis[0] = FIS_TYPE_REG_H2D;
    fis[1] = FIS_H2D_CMD;
    if ncq {
        fis[2] = if bio.write {
            WDCC_WRITE_FPDMA_QUEUED
        } else {
            WDCC_READ_FPDMA_QUEUED
        };
        fis[3] = bio.nblks as u8;
        fis[11] = (bio.nblks >> 8) as u8;
        fis[12] = tag << 3;
        fis[7] = WDSD_LBA;
        put_lba48(&mut fis, bio.blkno);
    } else if bio.lba48 {
        fis[2] = if bio.write {
            WDCC_WRITEDMA_EXT
        } else {
            WDCC_READDMA_EXT
        };
        fis[12] = bio.nblks as u8;
        fis[13] = (bio.nblks >> 8) as u8;
        fis[7] = WDSD_LBA;
        put_lba48(&mut fis, bio.blkno);
    } else {
        fis[2] = if bio.write { WDCC_WRITEDMA } else { WDCC_READDMA };
        fis[12] = bio.nblks as u8;
        fis[4] = bio.blkno as u8;
        fis[5] = (bio.blkno >> 8) as u8;
        fis[6] = (bio.blkno >> 16) as u8;
        fis[7] = WDSD_LBA | ((bio.blkno >> 24) as u8 & 0x0f);
    }
    fis
}

/// H2D register frame initiating a packet command.
pub fn construct_atapi(xfer: &AtapiXfer, dma: bool) -> [u8; FIS_LEN] {
    let mut fis = [0u8; FIS_LEN];
    fis[0] = FIS_TYPE_REG_H2D;
    fis[1] = FIS_H2D_CMD;
    fis[2] = ATAPI_PKT_CMD;
    // Feature bit 0 selects DMA for the data phase.
    fis[3] = u8::from(dma);
    // Byte count limit for PIO data-in, unused under DMA.
    fis[5] = xfer.bcount as u8;
    fis[6] = (xfer.bcount >> 8) as u8;
    fis
}

fn put_lba48(fis: &mut [u8; FIS_LEN], lba: u64) {
    fis[4] = lba as u8;
    fis[5] = (lba >> 8) as u8;
    fis[6] = (lba >> 16) as u8;
    fis[8] = (lba >> 24) as u8;
    fis[9] = (lba >> 32) as u8;
    fis[10] = (lba >> 40) as u8;
}

/// Folds a received D2H register frame into a packed taskfile.
pub fn parse_d2h(fis: &[u8; FIS_LEN]) -> u32 {
    tfd_err_st(fis[3], fis[2])
}

/// Device signature from the initial D2H frame: LBA bytes shifted over the
/// count byte.
pub fn signature(fis: &[u8; FIS_LEN]) -> u32 {
    let lba = u32::from_le_bytes([fis[4], fis[5], fis[6], fis[7]]) & 0x00ff_ffff;
    let count = u32::from_le_bytes([fis[12], fis[13], fis[14], fis[15]]) & 0xff;
    lba << 8 | count
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bio(blkno: u64, nblks: u32, write: bool, lba48: bool) -> AtaBio {
        AtaBio {
            blkno,
            nblks,
            bcount: nblks as usize * 512,
            write,
            lba48,
            timeout_ms: 1000,
        }
    }

    #[test]
    fn cmd_frame_places_taskfile_fields() {
        let cmd = AtaCommand {
            command: WDCC_IDENTIFY,
            features: 0x1234,
            count: 0xabcd,
            lba: 0x0000_7f00_0055_aa01,
            device: 0xe0,
            bcount: 512,
            dir: None,
            timeout_ms: 1000,
        };
        let fis = construct_cmd(&cmd);
        assert_eq!(fis[0], FIS_TYPE_REG_H2D);
        assert_eq!(fis[1] & 0x80, 0x80);
        assert_eq!(fis[2], WDCC_IDENTIFY);
        assert_eq!(fis[3], 0x34);
        assert_eq!(fis[11], 0x12);
        assert_eq!((fis[12], fis[13]), (0xcd, 0xab));
        assert_eq!((fis[4], fis[5], fis[6]), (0x01, 0xaa, 0x55));
        assert_eq!((fis[8], fis[9], fis[10]), (0x00, 0x00, 0x7f));
        assert_eq!(fis[7], 0xe0);
    }

    #[test]
    fn lba28_bio_packs_high_nibble_into_device() {
        let fis = construct_bio(&bio(0x0abc_def1, 8, false, false), false, 0);
        assert_eq!(fis[2], WDCC_READDMA);
        assert_eq!((fis[4], fis[5], fis[6]), (0xf1, 0xde, 0xbc));
        assert_eq!(fis[7], WDSD_LBA | 0x0a);
        assert_eq!(fis[12], 8);
    }

    #[test]
    fn lba48_bio_uses_extended_command_and_six_lba_bytes() {
        let fis = construct_bio(&bio(0x0123_4567_89ab, 0x300, true, true), false, 0);
        assert_eq!(fis[2], WDCC_WRITEDMA_EXT);
        assert_eq!((fis[4], fis[5], fis[6]), (0xab, 0x89, 0x67));
        assert_eq!((fis[8], fis[9], fis[10]), (0x45, 0x23, 0x01));
        assert_eq!((fis[12], fis[13]), (0x00, 0x03));
        assert_eq!(fis[7], WDSD_LBA);
    }

    #[test]
    fn ncq_bio_moves_count_to_features_and_tag_to_count() {
        let fis = construct_bio(&bio(0x1000, 0x180, false, true), true, 5);
        assert_eq!(fis[2], WDCC_READ_FPDMA_QUEUED);
        assert_eq!((fis[3], fis[11]), (0x80, 0x01));
        assert_eq!(fis[12], 5 << 3);
    }

    #[test]
    fn d2h_parse_packs_error_over_status() {
        let mut fis = [0u8; FIS_LEN];
        fis[0] = FIS_TYPE_REG_D2H;
        fis[2] = WDCS_DRDY | WDCS_ERR;
        fis[3] = WDCE_UNC;
        assert_eq!(parse_d2h(&fis), tfd_err_st(WDCE_UNC, WDCS_DRDY | WDCS_ERR));
        assert_eq!(tfd_status(parse_d2h(&fis)), WDCS_DRDY | WDCS_ERR);
        assert_eq!(tfd_error(parse_d2h(&fis)), WDCE_UNC);
    }

    #[test]
    fn signature_reads_lba_and_count_bytes() {
        let mut fis = [0u8; FIS_LEN];
        // ATAPI signature: lba bytes 0x14 0xeb, count 0x01.
        fis[4] = 0x01;
        fis[5] = 0x14;
        fis[6] = 0xeb;
        fis[12] = 0x01;
        assert_eq!(signature(&fis), SIG_ATAPI);
    }
}
