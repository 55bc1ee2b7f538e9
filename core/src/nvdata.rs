/*++

Licensed under the Apache-2.0 license.

File Name:

    nvdata.rs

Abstract:

    File contains the nvdata store: a 64-byte CRC-protected blob of boot
    intent flags kept in non-tamper-evident storage (CMOS in
    production). Reads before init return 0; writes mark the store dirty
    for the final commit.

--*/

use crate::context::{Context, ContextFlags, SdStatus};
use crate::crc8::crc8;

pub const NVDATA_SIZE: usize = 64;

/// High nibble of byte 0 identifies a formatted blob.
const HEADER_OFFSET: usize = 0;
const HEADER_SIGNATURE: u8 = 0xa0;
const HEADER_MASK: u8 = 0xf0;
const HEADER_VERSION: u8 = 0x02;

const BOOT_OFFSET: usize = 1;
const BOOT_DISPLAY_REQUEST: u8 = 0x01;
const BOOT_DIAG_REQUEST: u8 = 0x02;
const BOOT_DISABLE_DEV_REQUEST: u8 = 0x04;
const BOOT_TRY_RO_SYNC: u8 = 0x08;
const BOOT_BATTERY_CUTOFF: u8 = 0x10;
const BOOT_REQ_WIPEOUT: u8 = 0x20;

const DEV_OFFSET: usize = 2;
const DEV_BOOT_USB: u8 = 0x01;
const DEV_BOOT_LEGACY: u8 = 0x02;
const DEV_BOOT_SIGNED_ONLY: u8 = 0x04;
const DEV_DEFAULT_BOOT_MASK: u8 = 0x18;
const DEV_DEFAULT_BOOT_SHIFT: u8 = 3;

const TPM_OFFSET: usize = 3;
const TPM_CLEAR_OWNER_REQUEST: u8 = 0x01;
const TPM_CLEAR_OWNER_DONE: u8 = 0x02;

const RECOVERY_OFFSET: usize = 4;
const RECOVERY_SUBCODE_OFFSET: usize = 5;

const FW_OFFSET: usize = 6;
const FW_TRY_COUNT_MASK: u8 = 0x0f;
const FW_TRY_NEXT: u8 = 0x10;
const FW_TRIED: u8 = 0x20;
const FW_RESULT_MASK: u8 = 0xc0;
const FW_RESULT_SHIFT: u8 = 6;

const FW_PREV_OFFSET: usize = 7;
const FW_PREV_TRIED: u8 = 0x01;
const FW_PREV_RESULT_MASK: u8 = 0x06;
const FW_PREV_RESULT_SHIFT: u8 = 1;

const KERNEL_MAX_ROLLFORWARD_OFFSET: usize = 8;

const CRC_OFFSET: usize = NVDATA_SIZE - 1;

pub const MAX_TRY_COUNT: u32 = 15;

/// Typed nvdata fields.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NvField {
    DisplayRequest,
    DiagRequest,
    DisableDevRequest,
    TryRoSync,
    BatteryCutoffRequest,
    ReqWipeout,
    DevBootUsb,
    DevBootLegacy,
    DevBootSignedOnly,
    DevDefaultBoot,
    ClearTpmOwnerRequest,
    ClearTpmOwnerDone,
    RecoveryRequest,
    RecoverySubcode,
    TryCount,
    TryNext,
    FwTried,
    FwResult,
    FwPrevTried,
    FwPrevResult,
    KernelMaxRollforward,
}

fn blob_valid(nvdata: &[u8; NVDATA_SIZE]) -> bool {
    nvdata[HEADER_OFFSET] & HEADER_MASK == HEADER_SIGNATURE
        && crc8(&nvdata[..CRC_OFFSET]) == nvdata[CRC_OFFSET]
}

fn regenerate(nvdata: &mut [u8; NVDATA_SIZE]) {
    *nvdata = [0; NVDATA_SIZE];
    nvdata[HEADER_OFFSET] = HEADER_SIGNATURE | HEADER_VERSION;
    nvdata[CRC_OFFSET] = crc8(&nvdata[..CRC_OFFSET]);
}

/// Initialize the store. An unformatted or corrupt blob is reset to
/// defaults and marked dirty so the clean copy reaches the device.
pub fn nv_init(ctx: &mut Context) {
    if !blob_valid(&ctx.nvdata) {
        cprintln!("[nvdata] blob invalid, regenerating");
        regenerate(&mut ctx.nvdata);
        ctx.flags |= ContextFlags::NVDATA_CHANGED;
    }
    ctx.sd.status |= SdStatus::NV_INIT;
}

fn bit_field(field: NvField) -> Option<(usize, u8)> {
    let pair = match field {
        NvField::DisplayRequest => (BOOT_OFFSET, BOOT_DISPLAY_REQUEST),
        NvField::DiagRequest => (BOOT_OFFSET, BOOT_DIAG_REQUEST),
        NvField::DisableDevRequest => (BOOT_OFFSET, BOOT_DISABLE_DEV_REQUEST),
        NvField::TryRoSync => (BOOT_OFFSET, BOOT_TRY_RO_SYNC),
        NvField::BatteryCutoffRequest => (BOOT_OFFSET, BOOT_BATTERY_CUTOFF),
        NvField::ReqWipeout => (BOOT_OFFSET, BOOT_REQ_WIPEOUT),
        NvField::DevBootUsb => (DEV_OFFSET, DEV_BOOT_USB),
        NvField::DevBootLegacy => (DEV_OFFSET, DEV_BOOT_LEGACY),
        NvField::DevBootSignedOnly => (DEV_OFFSET, DEV_BOOT_SIGNED_ONLY),
        NvField::ClearTpmOwnerRequest => (TPM_OFFSET, TPM_CLEAR_OWNER_REQUEST),
        NvField::ClearTpmOwnerDone => (TPM_OFFSET, TPM_CLEAR_OWNER_DONE),
        NvField::TryNext => (FW_OFFSET, FW_TRY_NEXT),
        NvField::FwTried => (FW_OFFSET, FW_TRIED),
        NvField::FwPrevTried => (FW_PREV_OFFSET, FW_PREV_TRIED),
        _ => return None,
    };
    Some(pair)
}

/// Read a field. Before `nv_init` every field reads as 0 and nothing is
/// marked dirty.
pub fn nv_get(ctx: &Context, field: NvField) -> u32 {
    if !ctx.sd.status.contains(SdStatus::NV_INIT) {
        return 0;
    }

    if let Some((offset, mask)) = bit_field(field) {
        return (ctx.nvdata[offset] & mask != 0) as u32;
    }

    match field {
        NvField::DevDefaultBoot => {
            ((ctx.nvdata[DEV_OFFSET] & DEV_DEFAULT_BOOT_MASK) >> DEV_DEFAULT_BOOT_SHIFT) as u32
        }
        NvField::RecoveryRequest => ctx.nvdata[RECOVERY_OFFSET] as u32,
        NvField::RecoverySubcode => ctx.nvdata[RECOVERY_SUBCODE_OFFSET] as u32,
        NvField::TryCount => (ctx.nvdata[FW_OFFSET] & FW_TRY_COUNT_MASK) as u32,
        NvField::FwResult => {
            ((ctx.nvdata[FW_OFFSET] & FW_RESULT_MASK) >> FW_RESULT_SHIFT) as u32
        }
        NvField::FwPrevResult => {
            ((ctx.nvdata[FW_PREV_OFFSET] & FW_PREV_RESULT_MASK) >> FW_PREV_RESULT_SHIFT) as u32
        }
        NvField::KernelMaxRollforward => {
            let b = &ctx.nvdata[KERNEL_MAX_ROLLFORWARD_OFFSET..KERNEL_MAX_ROLLFORWARD_OFFSET + 4];
            u32::from_le_bytes([b[0], b[1], b[2], b[3]])
        }
        // Bit fields were handled above.
        _ => 0,
    }
}

/// Write a field, clamping it to its width, and mark the store dirty if
/// the stored bytes changed.
pub fn nv_set(ctx: &mut Context, field: NvField, value: u32) {
    if !ctx.sd.status.contains(SdStatus::NV_INIT) {
        cprintln!("[nvdata] set before init ignored");
        return;
    }

    if nv_get(ctx, field) == value {
        return;
    }

    if let Some((offset, mask)) = bit_field(field) {
        if value != 0 {
            ctx.nvdata[offset] |= mask;
        } else {
            ctx.nvdata[offset] &= !mask;
        }
    } else {
        match field {
            NvField::DevDefaultBoot => {
                ctx.nvdata[DEV_OFFSET] = (ctx.nvdata[DEV_OFFSET] & !DEV_DEFAULT_BOOT_MASK)
                    | (((value as u8) << DEV_DEFAULT_BOOT_SHIFT) & DEV_DEFAULT_BOOT_MASK);
            }
            NvField::RecoveryRequest => ctx.nvdata[RECOVERY_OFFSET] = value as u8,
            NvField::RecoverySubcode => ctx.nvdata[RECOVERY_SUBCODE_OFFSET] = value as u8,
            NvField::TryCount => {
                let clamped = value.min(MAX_TRY_COUNT) as u8;
                ctx.nvdata[FW_OFFSET] = (ctx.nvdata[FW_OFFSET] & !FW_TRY_COUNT_MASK) | clamped;
            }
            NvField::FwResult => {
                ctx.nvdata[FW_OFFSET] = (ctx.nvdata[FW_OFFSET] & !FW_RESULT_MASK)
                    | (((value as u8) << FW_RESULT_SHIFT) & FW_RESULT_MASK);
            }
            NvField::FwPrevResult => {
                ctx.nvdata[FW_PREV_OFFSET] = (ctx.nvdata[FW_PREV_OFFSET] & !FW_PREV_RESULT_MASK)
                    | (((value as u8) << FW_PREV_RESULT_SHIFT) & FW_PREV_RESULT_MASK);
            }
            NvField::KernelMaxRollforward => {
                ctx.nvdata[KERNEL_MAX_ROLLFORWARD_OFFSET..KERNEL_MAX_ROLLFORWARD_OFFSET + 4]
                    .copy_from_slice(&value.to_le_bytes());
            }
            // Bit fields were handled above.
            _ => {}
        }
    }

    ctx.nvdata[CRC_OFFSET] = crc8(&ctx.nvdata[..CRC_OFFSET]);
    ctx.flags |= ContextFlags::NVDATA_CHANGED;
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_ctx(buf: &mut [u8]) -> Context<'_> {
        Context::init(buf).unwrap()
    }

    #[test]
    fn test_init_regenerates_and_marks_dirty() {
        let mut buf = [0u8; 2048];
        let mut ctx = test_ctx(&mut buf);
        nv_init(&mut ctx);
        assert!(ctx.sd.status.contains(SdStatus::NV_INIT));
        assert!(ctx.flags.contains(ContextFlags::NVDATA_CHANGED));
        assert!(blob_valid(&ctx.nvdata));
    }

    #[test]
    fn test_init_keeps_valid_blob() {
        let mut buf = [0u8; 2048];
        let mut ctx = test_ctx(&mut buf);
        nv_init(&mut ctx);
        nv_set(&mut ctx, NvField::TryCount, 5);
        let blob = ctx.nvdata;

        let mut buf2 = [0u8; 2048];
        let mut ctx2 = test_ctx(&mut buf2);
        ctx2.nvdata = blob;
        nv_init(&mut ctx2);
        assert!(!ctx2.flags.contains(ContextFlags::NVDATA_CHANGED));
        assert_eq!(nv_get(&ctx2, NvField::TryCount), 5);
    }

    #[test]
    fn test_corrupt_crc_resets() {
        let mut buf = [0u8; 2048];
        let mut ctx = test_ctx(&mut buf);
        nv_init(&mut ctx);
        nv_set(&mut ctx, NvField::RecoveryRequest, 0x23);
        ctx.nvdata[CRC_OFFSET] ^= 0xff;
        ctx.sd.status -= SdStatus::NV_INIT;
        nv_init(&mut ctx);
        assert_eq!(nv_get(&ctx, NvField::RecoveryRequest), 0);
    }

    #[test]
    fn test_reads_before_init_return_zero() {
        let mut buf = [0u8; 2048];
        let mut ctx = test_ctx(&mut buf);
        ctx.nvdata[RECOVERY_OFFSET] = 7;
        assert_eq!(nv_get(&ctx, NvField::RecoveryRequest), 0);
        nv_set(&mut ctx, NvField::RecoveryRequest, 3);
        assert!(!ctx.flags.contains(ContextFlags::NVDATA_CHANGED));
    }

    #[test]
    fn test_field_roundtrip() {
        let mut buf = [0u8; 2048];
        let mut ctx = test_ctx(&mut buf);
        nv_init(&mut ctx);

        nv_set(&mut ctx, NvField::TryNext, 1);
        nv_set(&mut ctx, NvField::TryCount, 9);
        nv_set(&mut ctx, NvField::FwResult, 2);
        nv_set(&mut ctx, NvField::FwTried, 1);
        nv_set(&mut ctx, NvField::KernelMaxRollforward, 0x0003_0004);
        nv_set(&mut ctx, NvField::DevDefaultBoot, 2);

        assert_eq!(nv_get(&ctx, NvField::TryNext), 1);
        assert_eq!(nv_get(&ctx, NvField::TryCount), 9);
        assert_eq!(nv_get(&ctx, NvField::FwResult), 2);
        assert_eq!(nv_get(&ctx, NvField::FwTried), 1);
        assert_eq!(nv_get(&ctx, NvField::KernelMaxRollforward), 0x0003_0004);
        assert_eq!(nv_get(&ctx, NvField::DevDefaultBoot), 2);
        assert!(blob_valid(&ctx.nvdata));
    }

    #[test]
    fn test_try_count_clamped() {
        let mut buf = [0u8; 2048];
        let mut ctx = test_ctx(&mut buf);
        nv_init(&mut ctx);
        nv_set(&mut ctx, NvField::TryCount, 100);
        assert_eq!(nv_get(&ctx, NvField::TryCount), MAX_TRY_COUNT);
    }

    #[test]
    fn test_same_value_does_not_mark_dirty() {
        let mut buf = [0u8; 2048];
        let mut ctx = test_ctx(&mut buf);
        nv_init(&mut ctx);
        nv_set(&mut ctx, NvField::TryCount, 4);
        ctx.flags -= ContextFlags::NVDATA_CHANGED;
        nv_set(&mut ctx, NvField::TryCount, 4);
        assert!(!ctx.flags.contains(ContextFlags::NVDATA_CHANGED));
    }
}
