/*++

Licensed under the Apache-2.0 license.

File Name:

    secdata.rs

Abstract:

    File contains the three tamper-evident persistent stores (TPM-backed
    in production): secdata-firmware and secdata-kernel carry the
    monotonic composite versions for rollback protection, secdata-fwmp
    carries firmware management parameters and may be absent. Mutations
    mark the store dirty; commit writes only the dirty ones.

--*/

use core::mem::size_of;

use vaultboot_error::{VaultbootError, VaultbootResult};
use zerocopy::{AsBytes, FromBytes, FromZeroes};

use crate::context::{Context, ContextFlags, SdStatus};
use crate::crc8::crc8;

pub const SECDATA_FIRMWARE_SIZE: usize = 10;
pub const SECDATA_KERNEL_SIZE: usize = 13;
pub const SECDATA_FWMP_SIZE: usize = 40;

pub const SECDATA_FIRMWARE_STRUCT_VERSION: u8 = 0x10;
pub const SECDATA_KERNEL_STRUCT_VERSION: u8 = 0x10;
pub const SECDATA_FWMP_STRUCT_VERSION: u8 = 0x10;

/// "GRWL" — identifies a kernel space formatted by this code.
pub const SECDATA_KERNEL_UID: u32 = 0x4752574c;

pub const FWMP_HASH_SIZE: usize = 32;

bitflags::bitflags! {
    /// secdata-firmware flag byte.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct SecdataFirmwareFlags : u32 {
        /// The previous boot ran in developer mode.
        const LAST_BOOT_DEVELOPER = 0x01;

        /// Virtual developer-mode switch.
        const DEV_MODE = 0x02;
    }
}

bitflags::bitflags! {
    /// Firmware management parameter flags.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct FwmpFlags : u32 {
        const DEV_DISABLE_BOOT = 0x01;
        const DEV_DISABLE_RECOVERY_INSTALL = 0x02;
        const DEV_ENABLE_EXTERNAL = 0x08;
        const DEV_ENABLE_ALTFW = 0x10;
    }
}

#[repr(C)]
#[derive(AsBytes, FromBytes, FromZeroes, Default, Debug, Copy, Clone, Eq, PartialEq)]
struct SecdataFirmware {
    struct_version: u8,
    flags: u8,
    fw_versions: [u8; 4],
    reserved: [u8; 3],
    crc8: u8,
}

#[repr(C)]
#[derive(AsBytes, FromBytes, FromZeroes, Default, Debug, Copy, Clone, Eq, PartialEq)]
struct SecdataKernel {
    struct_version: u8,
    uid: [u8; 4],
    kernel_versions: [u8; 4],
    reserved: [u8; 3],
    crc8: u8,
}

#[repr(C)]
#[derive(AsBytes, FromBytes, FromZeroes, Default, Debug, Copy, Clone, Eq, PartialEq)]
struct SecdataFwmp {
    crc8: u8,
    struct_size: u8,
    struct_version: u8,
    reserved0: u8,
    flags: [u8; 4],
    dev_key_hash: [u8; FWMP_HASH_SIZE],
}

const _: () = assert!(size_of::<SecdataFirmware>() == SECDATA_FIRMWARE_SIZE);
const _: () = assert!(size_of::<SecdataKernel>() == SECDATA_KERNEL_SIZE);
const _: () = assert!(size_of::<SecdataFwmp>() == SECDATA_FWMP_SIZE);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SecdataFirmwareParam {
    Flags,
    Versions,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SecdataKernelParam {
    Versions,
}

fn fw_crc(blob: &[u8; SECDATA_FIRMWARE_SIZE]) -> u8 {
    crc8(&blob[..SECDATA_FIRMWARE_SIZE - 1])
}

fn kernel_crc(blob: &[u8; SECDATA_KERNEL_SIZE]) -> u8 {
    crc8(&blob[..SECDATA_KERNEL_SIZE - 1])
}

fn fwmp_crc(blob: &[u8; SECDATA_FWMP_SIZE]) -> u8 {
    // The CRC byte leads the struct and covers everything after it.
    crc8(&blob[1..])
}

/// Emit a freshly formatted secdata-firmware blob (recovery-mode
/// provisioning) and mark it dirty.
pub fn firmware_create(ctx: &mut Context) {
    let data = SecdataFirmware {
        struct_version: SECDATA_FIRMWARE_STRUCT_VERSION,
        ..Default::default()
    };
    ctx.secdata_firmware.copy_from_slice(data.as_bytes());
    ctx.secdata_firmware[SECDATA_FIRMWARE_SIZE - 1] = fw_crc(&ctx.secdata_firmware);
    ctx.flags |= ContextFlags::SECDATA_FIRMWARE_CHANGED;
    ctx.sd.status -= SdStatus::SECDATA_FIRMWARE_INIT;
}

/// Validate the secdata-firmware blob read from the device.
pub fn firmware_init(ctx: &mut Context) -> VaultbootResult<()> {
    let data = SecdataFirmware::read_from(&ctx.secdata_firmware[..])
        .ok_or(VaultbootError::SECDATA_FIRMWARE_CRC)?;
    if data.crc8 != fw_crc(&ctx.secdata_firmware) {
        return Err(VaultbootError::SECDATA_FIRMWARE_CRC);
    }
    if data.struct_version < SECDATA_FIRMWARE_STRUCT_VERSION {
        return Err(VaultbootError::SECDATA_FIRMWARE_VERSION);
    }
    ctx.sd.status |= SdStatus::SECDATA_FIRMWARE_INIT;
    Ok(())
}

/// Read a secdata-firmware field; 0 before a successful init.
pub fn firmware_get(ctx: &Context, param: SecdataFirmwareParam) -> u32 {
    if !ctx.sd.status.contains(SdStatus::SECDATA_FIRMWARE_INIT) {
        return 0;
    }
    match param {
        SecdataFirmwareParam::Flags => ctx.secdata_firmware[1] as u32,
        SecdataFirmwareParam::Versions => {
            let b = &ctx.secdata_firmware[2..6];
            u32::from_le_bytes([b[0], b[1], b[2], b[3]])
        }
    }
}

/// Write a secdata-firmware field and mark the store dirty.
pub fn firmware_set(
    ctx: &mut Context,
    param: SecdataFirmwareParam,
    value: u32,
) -> VaultbootResult<()> {
    if !ctx.sd.status.contains(SdStatus::SECDATA_FIRMWARE_INIT) {
        return Err(VaultbootError::SECDATA_FIRMWARE_UNINITIALIZED);
    }
    if firmware_get(ctx, param) == value {
        return Ok(());
    }
    match param {
        SecdataFirmwareParam::Flags => ctx.secdata_firmware[1] = value as u8,
        SecdataFirmwareParam::Versions => {
            ctx.secdata_firmware[2..6].copy_from_slice(&value.to_le_bytes())
        }
    }
    ctx.secdata_firmware[SECDATA_FIRMWARE_SIZE - 1] = fw_crc(&ctx.secdata_firmware);
    ctx.flags |= ContextFlags::SECDATA_FIRMWARE_CHANGED;
    Ok(())
}

/// Emit a freshly formatted secdata-kernel blob and mark it dirty.
pub fn kernel_create(ctx: &mut Context) {
    let data = SecdataKernel {
        struct_version: SECDATA_KERNEL_STRUCT_VERSION,
        uid: SECDATA_KERNEL_UID.to_le_bytes(),
        ..Default::default()
    };
    ctx.secdata_kernel.copy_from_slice(data.as_bytes());
    ctx.secdata_kernel[SECDATA_KERNEL_SIZE - 1] = kernel_crc(&ctx.secdata_kernel);
    ctx.flags |= ContextFlags::SECDATA_KERNEL_CHANGED;
    ctx.sd.status -= SdStatus::SECDATA_KERNEL_INIT;
}

/// Validate the secdata-kernel blob read from the device.
pub fn kernel_init(ctx: &mut Context) -> VaultbootResult<()> {
    let data = SecdataKernel::read_from(&ctx.secdata_kernel[..])
        .ok_or(VaultbootError::SECDATA_KERNEL_CRC)?;
    if data.crc8 != kernel_crc(&ctx.secdata_kernel) {
        return Err(VaultbootError::SECDATA_KERNEL_CRC);
    }
    if data.struct_version < SECDATA_KERNEL_STRUCT_VERSION {
        return Err(VaultbootError::SECDATA_KERNEL_VERSION);
    }
    if u32::from_le_bytes(data.uid) != SECDATA_KERNEL_UID {
        return Err(VaultbootError::SECDATA_KERNEL_UID);
    }
    ctx.sd.status |= SdStatus::SECDATA_KERNEL_INIT;
    Ok(())
}

/// Read a secdata-kernel field; 0 before a successful init.
pub fn kernel_get(ctx: &Context, param: SecdataKernelParam) -> u32 {
    if !ctx.sd.status.contains(SdStatus::SECDATA_KERNEL_INIT) {
        return 0;
    }
    match param {
        SecdataKernelParam::Versions => {
            let b = &ctx.secdata_kernel[5..9];
            u32::from_le_bytes([b[0], b[1], b[2], b[3]])
        }
    }
}

/// Write a secdata-kernel field and mark the store dirty.
pub fn kernel_set(ctx: &mut Context, param: SecdataKernelParam, value: u32) -> VaultbootResult<()> {
    if !ctx.sd.status.contains(SdStatus::SECDATA_KERNEL_INIT) {
        return Err(VaultbootError::SECDATA_KERNEL_UNINITIALIZED);
    }
    if kernel_get(ctx, param) == value {
        return Ok(());
    }
    match param {
        SecdataKernelParam::Versions => {
            ctx.secdata_kernel[5..9].copy_from_slice(&value.to_le_bytes())
        }
    }
    ctx.secdata_kernel[SECDATA_KERNEL_SIZE - 1] = kernel_crc(&ctx.secdata_kernel);
    ctx.flags |= ContextFlags::SECDATA_KERNEL_CHANGED;
    Ok(())
}

/// Validate the FWMP blob. With `NO_SECDATA_FWMP` the space is treated
/// as absent and init trivially succeeds with empty parameters.
pub fn fwmp_init(ctx: &mut Context) -> VaultbootResult<()> {
    if ctx.flags.contains(ContextFlags::NO_SECDATA_FWMP) {
        return Ok(());
    }
    let data =
        SecdataFwmp::read_from(&ctx.secdata_fwmp[..]).ok_or(VaultbootError::SECDATA_FWMP_CRC)?;
    if data.struct_size as usize != SECDATA_FWMP_SIZE {
        return Err(VaultbootError::SECDATA_FWMP_SIZE);
    }
    // Same major version nibble required; minor may grow.
    if data.struct_version & 0xf0 != SECDATA_FWMP_STRUCT_VERSION & 0xf0 {
        return Err(VaultbootError::SECDATA_FWMP_VERSION);
    }
    if data.crc8 != fwmp_crc(&ctx.secdata_fwmp) {
        return Err(VaultbootError::SECDATA_FWMP_CRC);
    }
    ctx.sd.status |= SdStatus::SECDATA_FWMP_INIT;
    Ok(())
}

/// FWMP policy flags; empty if the space is absent or uninitialized.
pub fn fwmp_flags(ctx: &Context) -> FwmpFlags {
    if !ctx.sd.status.contains(SdStatus::SECDATA_FWMP_INIT) {
        return FwmpFlags::empty();
    }
    let b = &ctx.secdata_fwmp[4..8];
    FwmpFlags::from_bits_truncate(u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
}

/// FWMP developer key hash; zeros if the space is absent.
pub fn fwmp_dev_key_hash(ctx: &Context) -> [u8; FWMP_HASH_SIZE] {
    let mut hash = [0u8; FWMP_HASH_SIZE];
    if ctx.sd.status.contains(SdStatus::SECDATA_FWMP_INIT) {
        hash.copy_from_slice(&ctx.secdata_fwmp[8..8 + FWMP_HASH_SIZE]);
    }
    hash
}

/// Host/test helper: format a valid FWMP blob in place.
pub fn fwmp_create(ctx: &mut Context, flags: FwmpFlags, dev_key_hash: &[u8; FWMP_HASH_SIZE]) {
    let data = SecdataFwmp {
        crc8: 0,
        struct_size: SECDATA_FWMP_SIZE as u8,
        struct_version: SECDATA_FWMP_STRUCT_VERSION,
        reserved0: 0,
        flags: flags.bits().to_le_bytes(),
        dev_key_hash: *dev_key_hash,
    };
    ctx.secdata_fwmp.copy_from_slice(data.as_bytes());
    ctx.secdata_fwmp[0] = fwmp_crc(&ctx.secdata_fwmp);
    ctx.flags |= ContextFlags::SECDATA_FWMP_CHANGED;
    ctx.sd.status -= SdStatus::SECDATA_FWMP_INIT;
}
