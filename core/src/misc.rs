/*++

Licensed under the Apache-2.0 license.

File Name:

    misc.rs

Abstract:

    File contains boot-wide arbitration: the recovery-reason namespace,
    the slot-fallback failure policy, recovery and developer switch
    handling, the one-shot TPM owner clear, and firmware slot selection.

--*/

use vaultboot_error::VaultbootResult;
use vaultboot_image_types::GbbFlags;

use crate::context::{Context, ContextFlags, FwResult, SdFlags, SdStatus, Slot};
use crate::env::BootEnv;
use crate::nvdata::{nv_get, nv_init, nv_set, NvField};
use crate::secdata::{self, SecdataFirmwareFlags, SecdataFirmwareParam};

/// Recovery reasons: a single-byte namespace recorded in nvdata. The
/// earliest, most specific reason of a boot wins; later failures never
/// overwrite it.
pub mod recovery_reason {
    pub const NOT_REQUESTED: u8 = 0x00;
    pub const LEGACY: u8 = 0x01;

    /// Recovery requested by physical presence.
    pub const RO_MANUAL: u8 = 0x02;
    pub const RO_INVALID_RW: u8 = 0x03;
    pub const SECDATA_FIRMWARE_INIT: u8 = 0x04;
    pub const GBB_HEADER: u8 = 0x05;
    pub const TPM_CLEAR_OWNER: u8 = 0x06;
    pub const DEV_SWITCH: u8 = 0x07;

    pub const FW_KEYBLOCK: u8 = 0x13;
    pub const FW_KEY_ROLLBACK: u8 = 0x14;
    pub const FW_PREAMBLE: u8 = 0x16;
    pub const FW_ROLLBACK: u8 = 0x17;
    pub const FW_BODY: u8 = 0x1b;

    pub const RO_FIRMWARE: u8 = 0x20;

    pub const EC_SOFTWARE_SYNC: u8 = 0x22;
    pub const EC_UNKNOWN_IMAGE: u8 = 0x23;
    pub const EC_HASH_FAILED: u8 = 0x24;
    pub const EC_EXPECTED_HASH: u8 = 0x25;
    pub const EC_UPDATE: u8 = 0x26;
    pub const EC_JUMP_RW: u8 = 0x27;
    pub const EC_PROTECT: u8 = 0x28;
    pub const EC_HASH_SIZE: u8 = 0x29;
    pub const AUXFW_UPDATE: u8 = 0x2a;

    pub const SECDATA_KERNEL_INIT: u8 = 0x2b;
    pub const SECDATA_FWMP_INIT: u8 = 0x2c;

    /// Memory retraining request; recovery mode only long enough to
    /// reboot.
    pub const TRAIN_AND_REBOOT: u8 = 0x2d;
    pub const ALTFW_HASH_FAILED: u8 = 0x2e;

    pub const RW_INVALID_OS: u8 = 0x43;
    pub const RW_TPM_W_ERROR: u8 = 0x54;
    pub const RW_NO_DISK: u8 = 0x5a;
    pub const RW_NO_KERNEL: u8 = 0x5b;
    pub const LK_UNSPECIFIED: u8 = 0x5c;
}

/// Record a boot failure.
///
/// If a slot was already chosen, the failure burns the remaining tries
/// and points the next boot at the other slot; recovery is requested
/// only when the other slot already failed the previous boot (or no
/// slot was chosen yet). A recovery reason already present in nvdata is
/// never overwritten.
pub fn api_fail(ctx: &mut Context, reason: u8, subcode: u8) {
    // Make sure nvdata is usable before recording anything.
    if !ctx.sd.status.contains(SdStatus::NV_INIT) {
        nv_init(ctx);
    }

    if ctx.sd.status.contains(SdStatus::CHOSE_SLOT) {
        nv_set(ctx, NvField::FwResult, FwResult::Failure.index());
        nv_set(ctx, NvField::TryCount, 0);

        // Alternate between slots, which may help if one or both are
        // flaky.
        let other = ctx.sd.fw_slot.other();
        nv_set(ctx, NvField::TryNext, other.index());

        // If we did not try the other slot last boot, or we tried it
        // and it did not fail, let the reboot try it.
        if ctx.sd.last_fw_slot != other || ctx.sd.last_fw_result != FwResult::Failure {
            return;
        }
    }

    cprintln!("[fail] need recovery, reason {:#04x} subcode {:#04x}", reason, subcode);
    if nv_get(ctx, NvField::RecoveryRequest) == 0 {
        nv_set(ctx, NvField::RecoveryRequest, reason as u32);
        nv_set(ctx, NvField::RecoverySubcode, subcode as u32);
    }
}

/// Arbitrate the recovery reason for this boot from the previous boot's
/// request and the physical recovery signal.
pub fn check_recovery(ctx: &mut Context) {
    let reason = nv_get(ctx, NvField::RecoveryRequest) as u8;
    let subcode = nv_get(ctx, NvField::RecoverySubcode) as u8;
    cprintln!("[recovery] previous boot requested {:#04x}/{:#04x}", reason, subcode);

    if ctx.sd.recovery_reason == 0 {
        ctx.sd.recovery_reason = reason;
    }

    if ctx.flags.contains(ContextFlags::FORCE_RECOVERY_MODE) {
        if subcode != 0 && ctx.sd.recovery_reason == 0 {
            // Requested at the broken screen; promote the subcode.
            ctx.sd.recovery_reason = subcode;
        } else {
            ctx.sd.recovery_reason = recovery_reason::RO_MANUAL;
        }
        ctx.sd.flags |= SdFlags::MANUAL_RECOVERY;
    }

    if ctx.sd.recovery_reason != 0 {
        ctx.flags |= ContextFlags::RECOVERY_MODE;
        cprintln!(
            "[recovery] this boot needs recovery: {:#04x}",
            ctx.sd.recovery_reason
        );
    }
}

/// Arbitrate developer mode from the virtual switch, the GBB override
/// and pending disable requests; keep the secdata bookkeeping current.
/// A developer-mode transition clears the TPM owner.
pub fn check_dev_switch(ctx: &mut Context, env: &mut dyn BootEnv) -> VaultbootResult<()> {
    let gbb = ctx.gbb()?;
    let valid_secdata = ctx.sd.status.contains(SdStatus::SECDATA_FIRMWARE_INIT);

    let mut flags = SecdataFirmwareFlags::from_bits_truncate(secdata::firmware_get(
        ctx,
        SecdataFirmwareParam::Flags,
    ));
    let old_flags = flags;

    // One-shot disable request from nvdata.
    if valid_secdata && nv_get(ctx, NvField::DisableDevRequest) != 0 {
        flags -= SecdataFirmwareFlags::DEV_MODE;
        nv_set(ctx, NvField::DisableDevRequest, 0);
    }

    // Caller request; hardware and GBB overrides below take precedence.
    if ctx.flags.contains(ContextFlags::DISABLE_DEVELOPER_MODE) {
        flags -= SecdataFirmwareFlags::DEV_MODE;
    }

    let mut is_dev = flags.contains(SecdataFirmwareFlags::DEV_MODE);
    if gbb.gbb_flags().contains(GbbFlags::FORCE_DEV_SWITCH_ON) {
        is_dev = true;
    }

    if is_dev {
        ctx.sd.flags |= SdFlags::DEV_MODE_ENABLED;
        ctx.flags |= ContextFlags::DEVELOPER_MODE;
        flags |= SecdataFirmwareFlags::LAST_BOOT_DEVELOPER;
    } else {
        flags -= SecdataFirmwareFlags::LAST_BOOT_DEVELOPER;

        // Leave the dev-boot overrides disabled for the next time the
        // user enters developer mode.
        nv_set(ctx, NvField::DevBootUsb, 0);
        nv_set(ctx, NvField::DevBootLegacy, 0);
        nv_set(ctx, NvField::DevBootSignedOnly, 0);
        nv_set(ctx, NvField::DevDefaultBoot, 0);
    }

    if ctx.flags.contains(ContextFlags::FORCE_WIPEOUT_MODE) {
        nv_set(ctx, NvField::ReqWipeout, 1);
    }

    if flags != old_flags {
        // Dev mode just changed state; the TPM owner must go, even if
        // secdata is having trouble, since the owner and secdata are
        // independent.
        if let Err(e) = env.tpm_clear_owner() {
            if valid_secdata {
                api_fail(ctx, recovery_reason::TPM_CLEAR_OWNER, e.code8());
                return Err(e);
            }
        }
        if valid_secdata {
            secdata::firmware_set(ctx, SecdataFirmwareParam::Flags, flags.bits())?;
        }
    }

    Ok(())
}

/// Honor a one-shot TPM owner clear request from nvdata.
pub fn check_tpm_clear(ctx: &mut Context, env: &mut dyn BootEnv) -> VaultbootResult<()> {
    if nv_get(ctx, NvField::ClearTpmOwnerRequest) == 0 {
        return Ok(());
    }

    nv_set(ctx, NvField::ClearTpmOwnerRequest, 0);

    if let Err(e) = env.tpm_clear_owner() {
        // The code is truncated to 8 bits; nvdata has no room for more.
        api_fail(ctx, recovery_reason::TPM_CLEAR_OWNER, e.code8());
        return Err(e);
    }

    nv_set(ctx, NvField::ClearTpmOwnerDone, 1);
    Ok(())
}

/// Pick the firmware slot for this boot and account for the try.
pub fn select_fw_slot(ctx: &mut Context) {
    ctx.sd.last_fw_slot = Slot::from_index(nv_get(ctx, NvField::FwTried));
    ctx.sd.last_fw_result = FwResult::from_index(nv_get(ctx, NvField::FwResult));

    // Mirror the previous boot's outcome before overwriting it.
    nv_set(ctx, NvField::FwPrevTried, ctx.sd.last_fw_slot.index());
    nv_set(ctx, NvField::FwPrevResult, ctx.sd.last_fw_result.index());

    nv_set(ctx, NvField::FwResult, FwResult::Unknown.index());

    ctx.sd.fw_slot = Slot::from_index(nv_get(ctx, NvField::TryNext));

    let tries = nv_get(ctx, NvField::TryCount);
    if ctx.sd.last_fw_result == FwResult::Trying
        && ctx.sd.last_fw_slot == ctx.sd.fw_slot
        && tries == 0
    {
        // The last try was used up on the previous boot; fall back to
        // the other slot.
        ctx.sd.fw_slot = ctx.sd.fw_slot.other();
        nv_set(ctx, NvField::TryNext, ctx.sd.fw_slot.index());
    }

    if tries > 0 {
        nv_set(ctx, NvField::FwResult, FwResult::Trying.index());
        if !ctx.flags.contains(ContextFlags::NOFAIL_BOOT) {
            nv_set(ctx, NvField::TryCount, tries - 1);
        }
    }

    nv_set(ctx, NvField::FwTried, ctx.sd.fw_slot.index());

    if ctx.sd.fw_slot == Slot::B {
        ctx.flags |= ContextFlags::FW_SLOT_B;
    }

    ctx.sd.status |= SdStatus::CHOSE_SLOT;
}

/// Flip the virtual developer switch on; takes effect next boot.
pub fn enable_developer_mode(ctx: &mut Context) -> VaultbootResult<()> {
    cprintln!("[dev] enabling developer mode");
    let flags = SecdataFirmwareFlags::from_bits_truncate(secdata::firmware_get(
        ctx,
        SecdataFirmwareParam::Flags,
    )) | SecdataFirmwareFlags::DEV_MODE;
    secdata::firmware_set(ctx, SecdataFirmwareParam::Flags, flags.bits())
}

/// Whether manual recovery may be honored this boot.
pub fn allow_recovery(ctx: &Context, env: &mut dyn BootEnv) -> bool {
    if ctx
        .gbb()
        .map(|g| g.gbb_flags().contains(GbbFlags::FORCE_MANUAL_RECOVERY))
        .unwrap_or(false)
    {
        return true;
    }

    // An EC in RW implies recovery was not requested by hand.
    if !env.ec_trusted() {
        return false;
    }

    ctx.sd.flags.contains(SdFlags::MANUAL_RECOVERY)
}

/// If the display is not up yet, request it and report that a reboot is
/// needed first.
pub fn need_reboot_for_display(ctx: &mut Context) -> bool {
    if !ctx.sd.flags.contains(SdFlags::DISPLAY_AVAILABLE) {
        cprintln!("[display] need reboot to initialize display");
        nv_set(ctx, NvField::DisplayRequest, 1);
        return true;
    }
    false
}
