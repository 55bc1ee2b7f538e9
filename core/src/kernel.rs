/*++

Licensed under the Apache-2.0 license.

File Name:

    kernel.rs

Abstract:

    File contains the kernel verification state machine: phase 1 picks
    the key that certifies the kernel keyblock (recovery key or the
    firmware preamble's kernel subkey), the vblock loader verifies
    keyblock and preamble against secdata-kernel, the data verifier
    checks the kernel body, and phase 3 rolls the secure version
    forward.

--*/

use core::mem::size_of;

use vaultboot_error::{VaultbootError, VaultbootResult};
use vaultboot_image_types::{
    FwPreambleHeader, KernelPreambleHeader, KeyblockFlags, KeyblockHeader, MAX_KEY_VERSION,
    MAX_PREAMBLE_VERSION,
};
use zerocopy::FromBytes;

use crate::context::{Context, ContextFlags, SdFlags};
use crate::crypto::{digest_buffer, verify_digest, MAX_DIGEST_SIZE};
use crate::env::{BootEnv, Resource};
use crate::firmware::pinned_fw_preamble;
use crate::gbb::read_recovery_key;
use crate::key::unpack_key;
use crate::misc::{allow_recovery, api_fail, recovery_reason};
use crate::nvdata::{nv_get, NvField};
use crate::secdata::{self, SecdataKernelParam};
use crate::verify::{verify_kernel_preamble, verify_keyblock};

/// Kernel phase 1: init secdata-kernel and secdata-fwmp, then pick the
/// key used to verify the kernel keyblock.
///
/// In recovery mode that key is the GBB recovery key; otherwise it is
/// the kernel subkey the firmware preamble carried, already pinned in
/// the workbuf by firmware phase 3.
pub fn kernel_phase1(ctx: &mut Context, env: &mut dyn BootEnv) -> VaultbootResult<()> {
    // Secdata init errors are ignored in recovery mode; there is no
    // more recovery to fall back to.
    if let Err(e) = secdata::kernel_init(ctx) {
        if !ctx.flags.contains(ContextFlags::RECOVERY_MODE) {
            cprintln!("[kphase1] secdata-kernel init failed: {:#x}", u32::from(e));
            api_fail(ctx, recovery_reason::SECDATA_KERNEL_INIT, e.code8());
            return Err(e);
        }
    }
    if let Err(e) = secdata::fwmp_init(ctx) {
        if !ctx.flags.contains(ContextFlags::RECOVERY_MODE) {
            cprintln!("[kphase1] secdata-fwmp init failed: {:#x}", u32::from(e));
            api_fail(ctx, recovery_reason::SECDATA_FWMP_INIT, e.code8());
            return Err(e);
        }
    }

    ctx.sd.kernel_version_secdata = secdata::kernel_get(ctx, SecdataKernelParam::Versions);

    if ctx.flags.contains(ContextFlags::RECOVERY_MODE) {
        match read_recovery_key(ctx, env) {
            Ok((offset, size)) => {
                ctx.sd.kernel_key_offset = offset;
                ctx.sd.kernel_key_size = size;
                ctx.set_workbuf_used(offset as usize + size as usize)?;
            }
            Err(e) => {
                if allow_recovery(ctx, env) {
                    cprintln!("[kphase1] GBB recovery key unreadable: {:#x}", u32::from(e));
                    return Err(VaultbootError::KERNEL_RECOVERY_KEY);
                }
                // Headed for the broken screen anyway; the recovery key
                // will not be needed.
                return Ok(());
            }
        }
    } else {
        if ctx.sd.preamble_size == 0 {
            return Err(VaultbootError::KERNEL_PHASE1_PREAMBLE);
        }
        let header = pinned_fw_preamble(ctx)?;
        let total = header
            .kernel_subkey
            .packed_size()
            .ok_or(VaultbootError::UNPACK_KEY_BUFFER)?;
        // The subkey sits inside the pinned firmware preamble; its
        // bounds were validated when the preamble was verified.
        ctx.sd.kernel_key_offset =
            ctx.sd.preamble_offset + FwPreambleHeader::kernel_subkey_offset() as u32;
        ctx.sd.kernel_key_size = total as u32;
    }

    Ok(())
}

/// Verify the kernel keyblock and preamble.
pub fn load_kernel_vblock(ctx: &mut Context, env: &mut dyn BootEnv) -> VaultbootResult<()> {
    load_kernel_keyblock(ctx, env)?;
    load_kernel_preamble(ctx, env)?;
    Ok(())
}

/// Verify the kernel keyblock with the kernel key and pin the certified
/// data key, overwriting the keyblock's own bytes.
pub fn load_kernel_keyblock(ctx: &mut Context, env: &mut dyn BootEnv) -> VaultbootResult<()> {
    if ctx.sd.kernel_key_size == 0 {
        return Err(VaultbootError::KERNEL_DATA_KEY);
    }
    let mut wb = ctx.workbuf();

    let header_size = size_of::<KeyblockHeader>();
    let block_offset = wb
        .alloc(header_size)
        .ok_or(VaultbootError::KERNEL_KEYBLOCK_WORKBUF_HEADER)?;
    env.read_resource(
        Resource::KernelVblock,
        0,
        ctx.workbuf_slice_mut(block_offset, header_size)?,
    )?;
    let header = KeyblockHeader::read_from_prefix(ctx.workbuf_slice(block_offset, header_size)?)
        .ok_or(VaultbootError::KEYBLOCK_BUFFER)?;
    let block_size = header.keyblock_size as usize;

    let block_offset = wb
        .realloc(block_offset, header_size, block_size)
        .ok_or(VaultbootError::KERNEL_KEYBLOCK_WORKBUF)?;
    env.read_resource(
        Resource::KernelVblock,
        0,
        ctx.workbuf_slice_mut(block_offset, block_size)?,
    )?;

    let key_range = ctx.sd.kernel_key_offset as usize
        ..ctx.sd.kernel_key_offset as usize + ctx.sd.kernel_key_size as usize;
    let (key_bytes, block_bytes) =
        ctx.workbuf_split(key_range, block_offset..block_offset + block_size)?;
    let kernel_key = unpack_key(key_bytes)?;

    let header = verify_keyblock(block_bytes, &kernel_key)?;

    // The keyblock must be willing to boot in the current mode.
    let flags = header.flags();
    if ctx.flags.contains(ContextFlags::DEVELOPER_MODE) {
        if !flags.contains(KeyblockFlags::DEVELOPER_1) {
            return Err(VaultbootError::KERNEL_KEYBLOCK_DEV_FLAG);
        }
    } else if !flags.contains(KeyblockFlags::DEVELOPER_0) {
        return Err(VaultbootError::KERNEL_KEYBLOCK_DEV_FLAG);
    }
    if ctx.flags.contains(ContextFlags::RECOVERY_MODE) {
        if !flags.contains(KeyblockFlags::RECOVERY_1) {
            return Err(VaultbootError::KERNEL_KEYBLOCK_REC_FLAG);
        }
    } else if !flags.contains(KeyblockFlags::RECOVERY_0) {
        return Err(VaultbootError::KERNEL_KEYBLOCK_REC_FLAG);
    }

    let key_version = header.data_key.key_version;
    if !ctx.flags.contains(ContextFlags::RECOVERY_MODE) {
        if key_version > MAX_KEY_VERSION as u64 {
            return Err(VaultbootError::KERNEL_KEYBLOCK_VERSION_RANGE);
        }
        if (key_version as u32) < (ctx.sd.kernel_version_secdata >> 16) {
            return Err(VaultbootError::KERNEL_KEYBLOCK_VERSION_ROLLBACK);
        }
        // A keyblock certified by a real kernel key; roll-forward may
        // trust it after the body checks out.
        ctx.sd.flags |= SdFlags::KERNEL_SIGNED;
    }

    ctx.sd.kernel_version = (key_version as u32) << 16;
    ctx.sd.vblock_preamble_offset = header.keyblock_size as u32;

    // The kernel data key replaces the firmware data key as the active
    // one; park it over the keyblock's own header.
    let data_key_size = header
        .data_key
        .packed_size()
        .ok_or(VaultbootError::KEYBLOCK_DATA_KEY_OUTSIDE)? as usize;
    let data_key_src = block_offset + KeyblockHeader::data_key_offset();
    ctx.workbuf_copy_within(data_key_src..data_key_src + data_key_size, block_offset)?;

    ctx.sd.data_key_offset = block_offset as u32;
    ctx.sd.data_key_size = data_key_size as u32;
    ctx.set_workbuf_used(block_offset + data_key_size)?;

    Ok(())
}

/// Verify the kernel preamble with the kernel data key and pin it.
pub fn load_kernel_preamble(ctx: &mut Context, env: &mut dyn BootEnv) -> VaultbootResult<()> {
    if ctx.sd.data_key_size == 0 {
        return Err(VaultbootError::KERNEL_DATA_KEY);
    }
    let mut wb = ctx.workbuf();

    let header_size = size_of::<KernelPreambleHeader>();
    let pre_offset = wb
        .alloc(header_size)
        .ok_or(VaultbootError::KERNEL_PREAMBLE_WORKBUF_HEADER)?;
    env.read_resource(
        Resource::KernelVblock,
        ctx.sd.vblock_preamble_offset,
        ctx.workbuf_slice_mut(pre_offset, header_size)?,
    )?;
    let header =
        KernelPreambleHeader::read_from_prefix(ctx.workbuf_slice(pre_offset, header_size)?)
            .ok_or(VaultbootError::PREAMBLE_BUFFER)?;
    let pre_size = header.preamble_size as usize;

    let pre_offset = wb
        .realloc(pre_offset, header_size, pre_size)
        .ok_or(VaultbootError::KERNEL_PREAMBLE_WORKBUF)?;
    env.read_resource(
        Resource::KernelVblock,
        ctx.sd.vblock_preamble_offset,
        ctx.workbuf_slice_mut(pre_offset, pre_size)?,
    )?;

    let key_range = ctx.sd.data_key_offset as usize
        ..ctx.sd.data_key_offset as usize + ctx.sd.data_key_size as usize;
    let (key_bytes, pre_bytes) = ctx.workbuf_split(key_range, pre_offset..pre_offset + pre_size)?;
    let data_key = unpack_key(key_bytes)?;

    let header = verify_kernel_preamble(pre_bytes, &data_key)?;

    if header.kernel_version > MAX_PREAMBLE_VERSION as u64 {
        return Err(VaultbootError::KERNEL_PREAMBLE_VERSION_RANGE);
    }
    ctx.sd.kernel_version |= header.kernel_version as u32;
    if !ctx.flags.contains(ContextFlags::RECOVERY_MODE)
        && ctx.sd.kernel_version < ctx.sd.kernel_version_secdata
    {
        return Err(VaultbootError::KERNEL_PREAMBLE_VERSION_ROLLBACK);
    }

    ctx.sd.preamble_offset = pre_offset as u32;
    ctx.sd.preamble_size = pre_size as u32;
    ctx.set_workbuf_used(pre_offset + pre_size)?;

    Ok(())
}

/// Header of the pinned kernel preamble.
fn pinned_kernel_preamble(ctx: &Context) -> VaultbootResult<KernelPreambleHeader> {
    if ctx.sd.preamble_size == 0 {
        return Err(VaultbootError::KERNEL_DATA_PREAMBLE);
    }
    let bytes = ctx.workbuf_slice(ctx.sd.preamble_offset as usize, ctx.sd.preamble_size as usize)?;
    KernelPreambleHeader::read_from_prefix(bytes).ok_or(VaultbootError::KERNEL_DATA_PREAMBLE)
}

/// Offset (within the kernel vblock resource) and size of the kernel
/// body: it implicitly follows the preamble, and its size is whatever
/// was signed.
pub fn kernel_body_location(ctx: &Context) -> VaultbootResult<(u32, u32)> {
    let header = pinned_kernel_preamble(ctx)?;
    Ok((
        ctx.sd.vblock_preamble_offset + ctx.sd.preamble_size,
        header.body_signature.data_size as u32,
    ))
}

/// Verify the kernel body against the preamble's body signature.
///
/// The body is signed rather than hashed-and-covered-by-the-preamble-
/// signature, which costs one more RSA operation per kernel; the format
/// of images already in the field fixes this.
pub fn verify_kernel_data(ctx: &mut Context, buf: &[u8]) -> VaultbootResult<()> {
    let header = pinned_kernel_preamble(ctx)?;

    if buf.len() as u64 != header.body_signature.data_size {
        return Err(VaultbootError::KERNEL_DATA_SIZE);
    }
    if ctx.sd.data_key_size == 0 {
        return Err(VaultbootError::KERNEL_DATA_KEY);
    }

    let pre_offset = ctx.sd.preamble_offset as usize;
    let pre_size = ctx.sd.preamble_size as usize;
    let sig_range = header
        .body_signature
        .sig_range(KernelPreambleHeader::body_signature_offset(), pre_size)
        .ok_or(VaultbootError::SIG_OUTSIDE)?;

    let key_range = ctx.sd.data_key_offset as usize
        ..ctx.sd.data_key_offset as usize + ctx.sd.data_key_size as usize;
    let (key_bytes, pre_bytes) = ctx.workbuf_split(key_range, pre_offset..pre_offset + pre_size)?;
    let key = unpack_key(key_bytes)?;

    let mut digest = [0u8; MAX_DIGEST_SIZE];
    let digest_size = digest_buffer(key.hash_alg, buf, &mut digest)?;

    verify_digest(&key, &mut pre_bytes[sig_range], &digest[..digest_size])
}

/// Kernel phase 3: roll the secure kernel version forward when this
/// boot earned it.
pub fn kernel_phase3(ctx: &mut Context) -> VaultbootResult<()> {
    if ctx.sd.kernel_version > ctx.sd.kernel_version_secdata
        && ctx.sd.flags.contains(SdFlags::KERNEL_SIGNED)
        && !ctx.flags.contains(ContextFlags::RECOVERY_MODE)
        && ctx.flags.contains(ContextFlags::ALLOW_KERNEL_ROLL_FORWARD)
    {
        let mut target = ctx.sd.kernel_version;

        // An explicit nvdata limit caps how far we advance, but can
        // never drag the target below what secdata already holds.
        let max_rollforward = nv_get(ctx, NvField::KernelMaxRollforward);
        if max_rollforward != 0 {
            target = target.min(max_rollforward.max(ctx.sd.kernel_version_secdata));
        }

        if target > ctx.sd.kernel_version_secdata {
            cprintln!(
                "[kphase3] roll kernel version forward to {:#010x}",
                target
            );
            secdata::kernel_set(ctx, SecdataKernelParam::Versions, target)?;
            ctx.sd.kernel_version_secdata = target;
        }
    }

    Ok(())
}
