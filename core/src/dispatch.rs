/*++

Licensed under the Apache-2.0 license.

File Name:

    dispatch.rs

Abstract:

    File contains the boot-path dispatcher: EC/aux-firmware sync and
    battery cutoff ahead of path selection, exactly one boot path per
    boot, and the final commit of dirty persistent stores with its
    recovery fallback.

--*/

use vaultboot_error::{VaultbootError, VaultbootResult};

use crate::context::{Context, ContextFlags, FwResult};
use crate::ec_sync::ec_sync;
use crate::env::{BootEnv, DiskSet};
use crate::kernel::{kernel_phase1, kernel_phase3};
use crate::misc::{api_fail, recovery_reason};
use crate::nvdata::{nv_get, nv_set, NvField};

/// The boot path taken after the shared pre-boot steps. Selected in
/// exactly one place.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BootPath {
    Normal,
    Developer,
    Recovery,
    Diagnostic,
}

/// Pick this boot's path. Diagnostics are one-shot and outrank
/// developer mode.
pub fn select_boot_path(ctx: &Context) -> BootPath {
    if ctx.flags.contains(ContextFlags::RECOVERY_MODE) {
        BootPath::Recovery
    } else if nv_get(ctx, NvField::DiagRequest) != 0 {
        BootPath::Diagnostic
    } else if ctx.flags.contains(ContextFlags::DEVELOPER_MODE) {
        BootPath::Developer
    } else {
        BootPath::Normal
    }
}

/// Write every dirty store. nvdata goes first so that recovery reasons
/// always reach the device even when a secdata write fails; the first
/// error wins, with nvdata's outranking secdata's.
fn commit_stores(ctx: &mut Context, env: &mut dyn BootEnv) -> VaultbootResult<()> {
    let mut rv = Ok(());

    if ctx.flags.contains(ContextFlags::NVDATA_CHANGED) {
        match env.write_nvdata(&ctx.nvdata) {
            Ok(()) => ctx.flags -= ContextFlags::NVDATA_CHANGED,
            Err(_) => rv = Err(VaultbootError::NV_WRITE),
        }
    }

    if ctx.flags.contains(ContextFlags::SECDATA_FIRMWARE_CHANGED) {
        match env.write_secdata_firmware(&ctx.secdata_firmware) {
            Ok(()) => ctx.flags -= ContextFlags::SECDATA_FIRMWARE_CHANGED,
            Err(_) => {
                if rv.is_ok() {
                    rv = Err(VaultbootError::SECDATA_FIRMWARE_WRITE);
                }
            }
        }
    }

    if ctx.flags.contains(ContextFlags::SECDATA_KERNEL_CHANGED) {
        match env.write_secdata_kernel(&ctx.secdata_kernel) {
            Ok(()) => ctx.flags -= ContextFlags::SECDATA_KERNEL_CHANGED,
            Err(_) => {
                if rv.is_ok() {
                    rv = Err(VaultbootError::SECDATA_KERNEL_WRITE);
                }
            }
        }
    }

    if ctx.flags.contains(ContextFlags::SECDATA_FWMP_CHANGED) {
        match env.write_secdata_fwmp(&ctx.secdata_fwmp) {
            Ok(()) => ctx.flags -= ContextFlags::SECDATA_FWMP_CHANGED,
            Err(_) => {
                if rv.is_ok() {
                    rv = Err(VaultbootError::SECDATA_FWMP_WRITE);
                }
            }
        }
    }

    rv
}

/// Commit dirty persistent stores.
///
/// A secdata write failure outside recovery flags `RW_TPM_W_ERROR` and
/// commits once more so the reason lands in nvdata; inside recovery it
/// is ignored (requesting recovery again would loop). An nvdata write
/// failure leaves no way to even request recovery: fatal outside
/// recovery, ignored inside it.
pub fn commit_data(ctx: &mut Context, env: &mut dyn BootEnv) -> VaultbootResult<()> {
    let Err(e) = commit_stores(ctx, env) else {
        return Ok(());
    };
    let in_recovery = ctx.flags.contains(ContextFlags::RECOVERY_MODE);

    if e == VaultbootError::SECDATA_FIRMWARE_WRITE
        || e == VaultbootError::SECDATA_KERNEL_WRITE
        || e == VaultbootError::SECDATA_FWMP_WRITE
    {
        if in_recovery {
            cprintln!("[commit] secdata write failed in recovery, continuing");
            return Ok(());
        }
        api_fail(ctx, recovery_reason::RW_TPM_W_ERROR, e.code8());
        let _ = commit_stores(ctx, env);
        return Err(e);
    }

    if in_recovery {
        cprintln!("[commit] nvdata write failed in recovery, continuing");
        return Ok(());
    }
    Err(e)
}

/// Cut off the battery if requested. Runs after EC and aux firmware are
/// up to date so a device being prepared for shipment leaves with
/// current firmware.
fn handle_battery_cutoff(ctx: &mut Context, env: &mut dyn BootEnv) -> VaultbootResult<()> {
    if nv_get(ctx, NvField::BatteryCutoffRequest) != 0 {
        cprintln!("[dispatch] battery cutoff requested");
        nv_set(ctx, NvField::BatteryCutoffRequest, 0);

        // Power may drop the moment the EC acts; commit first.
        commit_data(ctx, env)?;
        env.ec_battery_cutoff()?;
        return Err(VaultbootError::SHUTDOWN_REQUESTED);
    }
    Ok(())
}

/// Clear one-shot display/diagnostic requests. Returns true if a reboot
/// is needed to undo the display init they caused.
fn reset_nv_requests(ctx: &mut Context) -> bool {
    let mut need_reboot = false;

    if nv_get(ctx, NvField::DisplayRequest) != 0 {
        cprintln!("[dispatch] clearing display request");
        nv_set(ctx, NvField::DisplayRequest, 0);
        need_reboot = true;
    }
    if nv_get(ctx, NvField::DiagRequest) != 0 {
        cprintln!("[dispatch] clearing diagnostic request");
        nv_set(ctx, NvField::DiagRequest, 0);
        need_reboot = true;
    }

    need_reboot
}

/// Ask the host to scan disks and boot a kernel, mapping fixed-disk
/// failures to recovery reasons (keeping the most specific one).
fn try_load_kernel(
    ctx: &mut Context,
    env: &mut dyn BootEnv,
    disks: DiskSet,
) -> VaultbootResult<()> {
    let result = env.try_load_kernel(ctx, disks);
    if let Err(e) = result {
        cprintln!("[dispatch] kernel load failed: {:#x}", u32::from(e));
        if disks == DiskSet::Fixed {
            let reason = if e == VaultbootError::LK_INVALID_KERNEL_FOUND {
                recovery_reason::RW_INVALID_OS
            } else if e == VaultbootError::LK_NO_KERNEL_FOUND {
                recovery_reason::RW_NO_KERNEL
            } else if e == VaultbootError::LK_NO_DISK_FOUND {
                recovery_reason::RW_NO_DISK
            } else {
                recovery_reason::LK_UNSPECIFIED
            };
            api_fail(ctx, reason, e.code8());
        }
        return Err(e);
    }
    Ok(())
}

fn normal_boot(ctx: &mut Context, env: &mut dyn BootEnv) -> VaultbootResult<()> {
    if reset_nv_requests(ctx) {
        cprintln!("[dispatch] reboot to reset one-shot requests");
        return Err(VaultbootError::REBOOT_REQUIRED);
    }

    // A slot still marked TRYING usually brought a new kernel key with
    // it; do not promote a kernel version we have not booted on a
    // firmware known to work.
    if nv_get(ctx, NvField::FwResult) != FwResult::Trying.index() {
        ctx.flags |= ContextFlags::ALLOW_KERNEL_ROLL_FORWARD;
    }

    try_load_kernel(ctx, env, DiskSet::Fixed)?;
    kernel_phase3(ctx)
}

fn recovery_boot(ctx: &mut Context, env: &mut dyn BootEnv) -> VaultbootResult<()> {
    // Clear the request now that we are here, so a reboot does not
    // stick in recovery mode.
    nv_set(ctx, NvField::RecoveryRequest, recovery_reason::NOT_REQUESTED as u32);
    nv_set(ctx, NvField::RecoverySubcode, 0);

    if ctx.sd.recovery_reason == recovery_reason::TRAIN_AND_REBOOT {
        cprintln!("[dispatch] reboot after memory retraining");
        return Err(VaultbootError::REBOOT_REQUIRED);
    }

    env.recovery_ui(ctx)
}

fn diagnostic_boot(ctx: &mut Context, env: &mut dyn BootEnv) -> VaultbootResult<()> {
    nv_set(ctx, NvField::DiagRequest, 0);

    // One-shot: the diagnostic path either boots its own payload or the
    // machine restarts.
    env.diagnostic_ui(ctx)?;
    Err(VaultbootError::REBOOT_REQUIRED)
}

fn developer_boot(ctx: &mut Context, env: &mut dyn BootEnv) -> VaultbootResult<()> {
    env.developer_ui(ctx)
}

fn boot(ctx: &mut Context, env: &mut dyn BootEnv) -> VaultbootResult<()> {
    kernel_phase1(ctx, env)?;

    // EC sync, aux firmware and battery cutoff come before the path
    // split; each may send the machine back around.
    if !ctx.flags.contains(ContextFlags::RECOVERY_MODE) {
        ec_sync(ctx, env)?;
        env.auxfw_sync(ctx)?;
        handle_battery_cutoff(ctx, env)?;
    }

    match select_boot_path(ctx) {
        BootPath::Recovery => recovery_boot(ctx, env),
        BootPath::Diagnostic => diagnostic_boot(ctx, env),
        BootPath::Developer => developer_boot(ctx, env),
        BootPath::Normal => normal_boot(ctx, env),
    }
}

/// Run the kernel-side boot sequence: select and take one boot path,
/// then commit. The boot path's error outranks a commit error.
pub fn select_and_boot(ctx: &mut Context, env: &mut dyn BootEnv) -> VaultbootResult<()> {
    let rv = boot(ctx, env);
    let commit_rv = commit_data(ctx, env);
    rv.and(commit_rv)
}
