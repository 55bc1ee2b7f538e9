/*++

Licensed under the Apache-2.0 license.

File Name:

    ec_sync.rs

Abstract:

    File contains the EC software-sync protocol: compare the EC's RO/RW
    image hashes with the ones this firmware expects, reflash what
    differs, jump the EC into RW and lock both regions. Runs at most
    once per boot.

--*/

use vaultboot_error::{VaultbootError, VaultbootResult};
use vaultboot_image_types::GbbFlags;

use crate::context::{Context, ContextFlags, SdStatus};
use crate::env::{BootEnv, FwSelect, EC_HASH_MAX};
use crate::misc::{need_reboot_for_display, recovery_reason};
use crate::nvdata::{nv_get, nv_set, NvField};

/// EC failures always demand recovery; there is no other slot to fall
/// back to.
fn request_recovery(ctx: &mut Context, reason: u8) {
    cprintln!("[ec] request recovery, reason {:#04x}", reason);
    nv_set(ctx, NvField::RecoveryRequest, reason as u32);
}

/// Compare the EC's current hash for `select` with the expected one.
fn image_needs_update(
    ctx: &mut Context,
    env: &mut dyn BootEnv,
    select: FwSelect,
) -> VaultbootResult<bool> {
    let mut ec_hash = [0u8; EC_HASH_MAX];
    let ec_len = match env.ec_hash_image(select, &mut ec_hash) {
        Ok(len) => len,
        Err(_) => {
            request_recovery(ctx, recovery_reason::EC_HASH_FAILED);
            return Err(VaultbootError::EC_REBOOT_TO_RO_REQUIRED);
        }
    };

    let mut want = [0u8; EC_HASH_MAX];
    let want_len = match env.ec_expected_image_hash(select, &mut want) {
        Ok(len) => len,
        Err(_) => {
            request_recovery(ctx, recovery_reason::EC_EXPECTED_HASH);
            return Err(VaultbootError::EC_REBOOT_TO_RO_REQUIRED);
        }
    };

    if ec_len == 0 || ec_len > EC_HASH_MAX || ec_len != want_len {
        request_recovery(ctx, recovery_reason::EC_HASH_SIZE);
        return Err(VaultbootError::EC_REBOOT_TO_RO_REQUIRED);
    }

    Ok(ec_hash[..ec_len] != want[..want_len])
}

/// Reflash one EC image and confirm the hash afterwards.
fn update_image(ctx: &mut Context, env: &mut dyn BootEnv, select: FwSelect) -> VaultbootResult<()> {
    match env.ec_update_image(select) {
        Ok(()) => {}
        Err(VaultbootError::EC_REBOOT_TO_RO_REQUIRED) => {
            // Flash is locked; a reboot into RO unlocks it. Not a
            // failure worth recovery.
            return Err(VaultbootError::EC_REBOOT_TO_RO_REQUIRED);
        }
        Err(_) => {
            request_recovery(ctx, recovery_reason::EC_UPDATE);
            return Err(VaultbootError::EC_REBOOT_TO_RO_REQUIRED);
        }
    }

    if image_needs_update(ctx, env, select)? {
        request_recovery(ctx, recovery_reason::EC_UPDATE);
        return Err(VaultbootError::EC_REBOOT_TO_RO_REQUIRED);
    }

    Ok(())
}

fn sync_ec(ctx: &mut Context, env: &mut dyn BootEnv) -> VaultbootResult<()> {
    let in_rw = match env.ec_running_rw() {
        Ok(in_rw) => in_rw,
        Err(_) => {
            request_recovery(ctx, recovery_reason::EC_UNKNOWN_IMAGE);
            return Err(VaultbootError::EC_REBOOT_TO_RO_REQUIRED);
        }
    };

    let rw_update = image_needs_update(ctx, env, FwSelect::ReadWrite)?;
    let ro_update = if nv_get(ctx, NvField::TryRoSync) != 0 {
        image_needs_update(ctx, env, FwSelect::ReadOnly)?
    } else {
        false
    };

    if rw_update || ro_update {
        if in_rw {
            // Cannot reflash the running image; drop to RO first.
            cprintln!("[ec] pending update, reboot to RO");
            return Err(VaultbootError::EC_REBOOT_TO_RO_REQUIRED);
        }

        if ctx.flags.contains(ContextFlags::EC_SLOW_UPDATE) {
            if need_reboot_for_display(ctx) {
                return Err(VaultbootError::REBOOT_REQUIRED);
            }
            env.display_wait_screen()?;
        }

        if ro_update {
            cprintln!("[ec] updating RO image");
            update_image(ctx, env, FwSelect::ReadOnly)?;
        }
        if rw_update {
            cprintln!("[ec] updating RW image");
            update_image(ctx, env, FwSelect::ReadWrite)?;
        }
    }

    if !in_rw {
        match env.ec_jump_to_rw() {
            Ok(()) => {}
            Err(VaultbootError::EC_REBOOT_TO_RO_REQUIRED) => {
                return Err(VaultbootError::EC_REBOOT_TO_RO_REQUIRED);
            }
            Err(_) => {
                request_recovery(ctx, recovery_reason::EC_JUMP_RW);
                return Err(VaultbootError::EC_REBOOT_TO_RO_REQUIRED);
            }
        }
    }

    for select in [FwSelect::ReadOnly, FwSelect::ReadWrite] {
        if let Err(e) = env.ec_protect(select) {
            request_recovery(ctx, recovery_reason::EC_PROTECT);
            return Err(e);
        }
    }

    if env.ec_disable_jump().is_err() {
        request_recovery(ctx, recovery_reason::EC_SOFTWARE_SYNC);
        return Err(VaultbootError::EC_REBOOT_TO_RO_REQUIRED);
    }

    Ok(())
}

/// Run EC software sync once per boot.
///
/// Skipped entirely in recovery mode. When sync is unsupported or
/// disabled by GBB flag, the EC is still told verification is done so
/// it can unlock its own late-boot behavior.
pub fn ec_sync(ctx: &mut Context, env: &mut dyn BootEnv) -> VaultbootResult<()> {
    if ctx.sd.status.contains(SdStatus::EC_SYNC_COMPLETE) {
        return Ok(());
    }
    if ctx.flags.contains(ContextFlags::RECOVERY_MODE) {
        return Ok(());
    }

    let disabled = !ctx.flags.contains(ContextFlags::EC_SYNC_SUPPORTED)
        || ctx
            .gbb()
            .map(|gbb| gbb.gbb_flags().contains(GbbFlags::DISABLE_EC_SOFTWARE_SYNC))
            .unwrap_or(false);

    if !disabled {
        sync_ec(ctx, env)?;
    }

    let done = env.ec_vboot_done();
    ctx.sd.status |= SdStatus::EC_SYNC_COMPLETE;
    done
}
