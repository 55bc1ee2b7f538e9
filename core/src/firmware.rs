/*++

Licensed under the Apache-2.0 license.

File Name:

    firmware.rs

Abstract:

    File contains the firmware verification state machine: phase 1
    (store init and recovery arbitration), phase 2 (slot selection),
    phase 3 (keyblock and preamble verification with rollback and
    roll-forward), and the streamed body hash API the host drives while
    loading the firmware body.

--*/

use core::mem::size_of;

use vaultboot_error::{VaultbootError, VaultbootResult};
use vaultboot_image_types::{
    FwPreambleHeader, GbbFlags, HashAlg, KeyblockHeader, MAX_KEY_VERSION, MAX_PREAMBLE_VERSION,
};
use zerocopy::FromBytes;

use crate::context::{Context, ContextFlags, FwResult};
use crate::crypto::{verify_digest, DigestContext, MAX_DIGEST_SIZE};
use crate::env::{BootEnv, Resource};
use crate::gbb::init_gbb;
use crate::key::{unpack_key, PublicKey};
use crate::misc::{
    api_fail, check_dev_switch, check_recovery, check_tpm_clear, recovery_reason, select_fw_slot,
};
use crate::nvdata::nv_init;
use crate::secdata::{self, SecdataFirmwareParam};
use crate::verify::{verify_fw_preamble, verify_keyblock};

/// SHA-1 of the packed developer root key that ships in the public
/// tree. Matching it means this image is developer-signed; logged only.
const DEV_KEY_DIGEST: [u8; 20] = [
    0xb1, 0x1d, 0x74, 0xed, 0xd2, 0x86, 0xc1, 0x44, 0xe1, 0x13, 0x5b, 0x49, 0xe7, 0xf0, 0xbc,
    0x20, 0xcf, 0x04, 0x1f, 0x10,
];

fn report_dev_firmware(root: &PublicKey) {
    if root.arrsize == 0 {
        return;
    }
    let Ok(mut dc) = DigestContext::new(HashAlg::Sha1) else {
        return;
    };
    dc.update(&root.arrsize.to_le_bytes());
    dc.update(&root.n0inv.to_le_bytes());
    dc.update(root.n);
    dc.update(root.rr);
    let mut digest = [0u8; 20];
    if dc.finalize(&mut digest).is_err() {
        return;
    }
    if digest == DEV_KEY_DIGEST {
        cprintln!("[fw] this is developer-signed firmware");
    }
}

/// Firmware phase 1: init nvdata and secdata-firmware, load the GBB,
/// and arbitrate recovery and developer mode.
///
/// Returns `PHASE1_RECOVERY` when this boot must take the recovery
/// path.
pub fn fw_phase1(ctx: &mut Context, env: &mut dyn BootEnv) -> VaultbootResult<()> {
    nv_init(ctx);

    match secdata::firmware_init(ctx) {
        Ok(()) => {
            ctx.sd.fw_version_secdata =
                secdata::firmware_get(ctx, SecdataFirmwareParam::Versions);
        }
        Err(e) => {
            cprintln!("[phase1] secdata-firmware init failed: {:#x}", u32::from(e));
            api_fail(ctx, recovery_reason::SECDATA_FIRMWARE_INIT, e.code8());
        }
    }

    if let Err(e) = init_gbb(ctx, env) {
        api_fail(ctx, recovery_reason::GBB_HEADER, e.code8());
        return Err(e);
    }

    check_recovery(ctx);

    if let Err(e) = check_dev_switch(ctx, env) {
        if !ctx.flags.contains(ContextFlags::RECOVERY_MODE) {
            api_fail(ctx, recovery_reason::DEV_SWITCH, e.code8());
            return Err(e);
        }
    }

    if ctx.flags.contains(ContextFlags::RECOVERY_MODE) {
        return Err(VaultbootError::PHASE1_RECOVERY);
    }

    Ok(())
}

/// Firmware phase 2: honor a pending TPM owner clear and choose the
/// slot to try.
pub fn fw_phase2(ctx: &mut Context, env: &mut dyn BootEnv) -> VaultbootResult<()> {
    check_tpm_clear(ctx, env)?;
    select_fw_slot(ctx);
    Ok(())
}

/// Firmware phase 3: verify the chosen slot's keyblock and preamble.
pub fn fw_phase3(ctx: &mut Context, env: &mut dyn BootEnv) -> VaultbootResult<()> {
    load_fw_keyblock(ctx, env)?;
    load_fw_preamble(ctx, env)?;
    Ok(())
}

/// Verify the slot's keyblock against the GBB root key and pin the
/// certified data key in the workbuf, reusing the root key's bytes.
pub fn load_fw_keyblock(ctx: &mut Context, env: &mut dyn BootEnv) -> VaultbootResult<()> {
    let gbb = ctx.gbb()?;
    let mut wb = ctx.workbuf();

    // Root key first; the data key will land in its place.
    let key_size = gbb.rootkey_size as usize;
    let key_offset = wb
        .alloc(key_size)
        .ok_or(VaultbootError::FW_KEYBLOCK_WORKBUF_ROOT_KEY)?;
    env.read_resource(
        Resource::Gbb,
        gbb.rootkey_offset,
        ctx.workbuf_slice_mut(key_offset, key_size)?,
    )?;

    // Keyblock header, to learn the full size.
    let header_size = size_of::<KeyblockHeader>();
    let block_offset = wb
        .alloc(header_size)
        .ok_or(VaultbootError::FW_KEYBLOCK_WORKBUF_HEADER)?;
    env.read_resource(
        Resource::FwVblock,
        0,
        ctx.workbuf_slice_mut(block_offset, header_size)?,
    )?;
    let header = KeyblockHeader::read_from_prefix(ctx.workbuf_slice(block_offset, header_size)?)
        .ok_or(VaultbootError::KEYBLOCK_BUFFER)?;
    let block_size = header.keyblock_size as usize;

    // Re-read the whole keyblock in one piece; re-reading the header is
    // a tiny cost for a much simpler layout.
    let block_offset = wb
        .realloc(block_offset, header_size, block_size)
        .ok_or(VaultbootError::FW_KEYBLOCK_WORKBUF)?;
    env.read_resource(
        Resource::FwVblock,
        0,
        ctx.workbuf_slice_mut(block_offset, block_size)?,
    )?;

    let (key_bytes, block_bytes) = ctx.workbuf_split(
        key_offset..key_offset + key_size,
        block_offset..block_offset + block_size,
    )?;
    let root_key = unpack_key(key_bytes)?;
    report_dev_firmware(&root_key);

    let result = verify_keyblock(block_bytes, &root_key);
    let header = match result {
        Ok(header) => header,
        Err(e) => {
            api_fail(ctx, recovery_reason::FW_KEYBLOCK, e.code8());
            return Err(e);
        }
    };

    // Key version is the upper half of the composite firmware version.
    let key_version = header.data_key.key_version;
    let mut rv = Ok(());
    if key_version > MAX_KEY_VERSION as u64 {
        rv = Err(VaultbootError::FW_KEYBLOCK_VERSION_RANGE);
    }
    if rv.is_ok() && (key_version as u32) < (ctx.sd.fw_version_secdata >> 16) {
        if gbb.gbb_flags().contains(GbbFlags::DISABLE_FW_ROLLBACK_CHECK) {
            cprintln!("[fw] ignoring key rollback due to GBB flag");
        } else {
            rv = Err(VaultbootError::FW_KEYBLOCK_VERSION_ROLLBACK);
        }
    }
    if let Err(e) = rv {
        api_fail(ctx, recovery_reason::FW_KEY_ROLLBACK, e.code8());
        return Err(e);
    }

    ctx.sd.fw_version = (key_version as u32) << 16;

    // The preamble follows the keyblock in the vblock.
    ctx.sd.vblock_preamble_offset = header.keyblock_size as u32;

    // Save the data key over the root key's bytes; the root key has
    // done its job. The keyblock region dies with the set-used below,
    // so the move must come first.
    let data_key_size = header
        .data_key
        .packed_size()
        .ok_or(VaultbootError::KEYBLOCK_DATA_KEY_OUTSIDE)? as usize;
    let data_key_src = block_offset + KeyblockHeader::data_key_offset();
    ctx.workbuf_copy_within(data_key_src..data_key_src + data_key_size, key_offset)?;

    ctx.sd.data_key_offset = key_offset as u32;
    ctx.sd.data_key_size = data_key_size as u32;
    ctx.set_workbuf_used(key_offset + data_key_size)?;

    Ok(())
}

/// Verify the slot's preamble with the data key, apply the rollback and
/// roll-forward rules, and pin the preamble in the workbuf.
pub fn load_fw_preamble(ctx: &mut Context, env: &mut dyn BootEnv) -> VaultbootResult<()> {
    if ctx.sd.data_key_size == 0 {
        return Err(VaultbootError::FW_PREAMBLE_DATA_KEY);
    }
    let gbb = ctx.gbb()?;
    let mut wb = ctx.workbuf();

    let header_size = size_of::<FwPreambleHeader>();
    let pre_offset = wb
        .alloc(header_size)
        .ok_or(VaultbootError::FW_PREAMBLE_WORKBUF_HEADER)?;
    env.read_resource(
        Resource::FwVblock,
        ctx.sd.vblock_preamble_offset,
        ctx.workbuf_slice_mut(pre_offset, header_size)?,
    )?;
    let header = FwPreambleHeader::read_from_prefix(ctx.workbuf_slice(pre_offset, header_size)?)
        .ok_or(VaultbootError::PREAMBLE_BUFFER)?;
    let pre_size = header.preamble_size as usize;

    let pre_offset = wb
        .realloc(pre_offset, header_size, pre_size)
        .ok_or(VaultbootError::FW_PREAMBLE_WORKBUF)?;
    env.read_resource(
        Resource::FwVblock,
        ctx.sd.vblock_preamble_offset,
        ctx.workbuf_slice_mut(pre_offset, pre_size)?,
    )?;

    let key_range = ctx.sd.data_key_offset as usize
        ..ctx.sd.data_key_offset as usize + ctx.sd.data_key_size as usize;
    let (key_bytes, pre_bytes) = ctx.workbuf_split(key_range, pre_offset..pre_offset + pre_size)?;
    let data_key = unpack_key(key_bytes)?;

    let result = verify_fw_preamble(pre_bytes, &data_key);
    let header = match result {
        Ok(header) => header,
        Err(e) => {
            api_fail(ctx, recovery_reason::FW_PREAMBLE, e.code8());
            return Err(e);
        }
    };

    // Body version is the lower half of the composite firmware version.
    let mut rv = Ok(());
    if header.firmware_version > MAX_PREAMBLE_VERSION as u64 {
        rv = Err(VaultbootError::FW_PREAMBLE_VERSION_RANGE);
    }
    ctx.sd.fw_version |= header.firmware_version as u32;
    if rv.is_ok() && ctx.sd.fw_version < ctx.sd.fw_version_secdata {
        if gbb.gbb_flags().contains(GbbFlags::DISABLE_FW_ROLLBACK_CHECK) {
            cprintln!("[fw] ignoring rollback due to GBB flag");
        } else {
            rv = Err(VaultbootError::FW_PREAMBLE_VERSION_ROLLBACK);
        }
    }
    if let Err(e) = rv {
        api_fail(ctx, recovery_reason::FW_ROLLBACK, e.code8());
        return Err(e);
    }

    // Roll the secure version forward only if the same slot booted all
    // the way to success last time. The body is not verified yet this
    // boot; the previous boot's status is the only functional evidence
    // there is.
    if ctx.sd.fw_version > ctx.sd.fw_version_secdata
        && ctx.sd.last_fw_slot == ctx.sd.fw_slot
        && ctx.sd.last_fw_result == FwResult::Success
    {
        secdata::firmware_set(ctx, SecdataFirmwareParam::Versions, ctx.sd.fw_version)?;
        ctx.sd.fw_version_secdata = ctx.sd.fw_version;
    }

    ctx.sd.preamble_offset = pre_offset as u32;
    ctx.sd.preamble_size = pre_size as u32;
    ctx.set_workbuf_used(pre_offset + pre_size)?;

    Ok(())
}

/// Header of the pinned firmware preamble.
pub(crate) fn pinned_fw_preamble(ctx: &Context) -> VaultbootResult<FwPreambleHeader> {
    if ctx.sd.preamble_size == 0 {
        return Err(VaultbootError::PREAMBLE_BUFFER);
    }
    let bytes = ctx.workbuf_slice(ctx.sd.preamble_offset as usize, ctx.sd.preamble_size as usize)?;
    FwPreambleHeader::read_from_prefix(bytes).ok_or(VaultbootError::PREAMBLE_BUFFER)
}

/// Size of the firmware body covered by the preamble's body signature,
/// or 0 if no preamble is loaded.
pub fn body_size(ctx: &Context) -> u32 {
    match pinned_fw_preamble(ctx) {
        Ok(header) => header.body_signature.data_size as u32,
        Err(_) => 0,
    }
}

/// Start the streamed firmware body hash. Returns the number of body
/// bytes the host must feed through `extend_hash`.
pub fn init_hash(ctx: &mut Context) -> VaultbootResult<u32> {
    if ctx.sd.preamble_size == 0 {
        return Err(VaultbootError::API_INIT_HASH_PREAMBLE);
    }
    if ctx.sd.data_key_size == 0 {
        return Err(VaultbootError::API_INIT_HASH_DATA_KEY);
    }
    let header = pinned_fw_preamble(ctx)?;

    let alg = {
        let key_bytes = ctx.workbuf_slice(
            ctx.sd.data_key_offset as usize,
            ctx.sd.data_key_size as usize,
        )?;
        unpack_key(key_bytes)?.hash_alg
    };

    ctx.body_hash = Some(DigestContext::new(alg)?);
    ctx.body_hash_remaining = header.body_signature.data_size as u32;
    Ok(ctx.body_hash_remaining)
}

/// Feed a chunk of the firmware body into the hash.
pub fn extend_hash(ctx: &mut Context, buf: &[u8]) -> VaultbootResult<()> {
    let remaining = ctx.body_hash_remaining;
    let Some(hash) = ctx.body_hash.as_mut() else {
        return Err(VaultbootError::API_EXTEND_HASH_DIGEST);
    };
    if buf.is_empty() || buf.len() as u64 > remaining as u64 {
        return Err(VaultbootError::API_EXTEND_HASH_SIZE);
    }
    hash.update(buf);
    ctx.body_hash_remaining = remaining - buf.len() as u32;
    Ok(())
}

/// Finish the body hash and verify it against the preamble's body
/// signature. The signature is destroyed by the check.
pub fn check_hash(ctx: &mut Context) -> VaultbootResult<()> {
    let Some(hash) = ctx.body_hash.take() else {
        return Err(VaultbootError::API_CHECK_HASH_DIGEST);
    };
    if ctx.body_hash_remaining != 0 {
        return Err(VaultbootError::API_CHECK_HASH_SIZE);
    }

    let mut digest = [0u8; MAX_DIGEST_SIZE];
    let digest_size = hash.finalize(&mut digest)?;

    let header = pinned_fw_preamble(ctx)?;
    let pre_offset = ctx.sd.preamble_offset as usize;
    let pre_size = ctx.sd.preamble_size as usize;
    let sig_range = header
        .body_signature
        .sig_range(FwPreambleHeader::body_signature_offset(), pre_size)
        .ok_or(VaultbootError::SIG_OUTSIDE)?;

    let key_range = ctx.sd.data_key_offset as usize
        ..ctx.sd.data_key_offset as usize + ctx.sd.data_key_size as usize;
    let (key_bytes, pre_bytes) = ctx.workbuf_split(key_range, pre_offset..pre_offset + pre_size)?;
    let key = unpack_key(key_bytes)?;

    verify_digest(&key, &mut pre_bytes[sig_range], &digest[..digest_size])
}
