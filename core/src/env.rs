/*++

Licensed under the Apache-2.0 license.

File Name:

    env.rs

Abstract:

    File contains the boot environment trait. Everything the core needs
    from the outside world goes through one `BootEnv` value passed
    alongside the context: named-resource reads, persistent-store
    writes, the TPM owner clear, the EC interface, and the UI/disk legs
    that live outside the core. The natural side benefit is that mocks
    for unit tests are a small struct away.

--*/

use vaultboot_error::{VaultbootError, VaultbootResult};

use crate::context::Context;

/// Named resources the host can serve.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Resource {
    /// Factory-set read-only block holding the root and recovery keys.
    Gbb,
    /// Keyblock + preamble of the firmware slot under verification.
    FwVblock,
    /// Keyblock + preamble of the kernel under verification.
    KernelVblock,
}

/// Which EC image an EC operation targets.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FwSelect {
    ReadOnly,
    ReadWrite,
}

/// Which disks a kernel-load attempt scans.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DiskSet {
    Fixed,
    Removable,
}

/// Largest EC image hash the interface carries.
pub const EC_HASH_MAX: usize = 64;

/// Host collaborators of the boot core.
///
/// The default implementations describe a machine with nothing to do:
/// writes succeed, the EC is in sync, no disks are attached. Tests and
/// firmware override what their platform actually has.
pub trait BootEnv {
    /// Copy exactly `buf.len()` bytes of the resource starting at
    /// `offset`, or fail without touching `buf`'s claim to validity.
    fn read_resource(
        &mut self,
        index: Resource,
        offset: u32,
        buf: &mut [u8],
    ) -> VaultbootResult<()>;

    fn tpm_clear_owner(&mut self) -> VaultbootResult<()> {
        Ok(())
    }

    fn write_nvdata(&mut self, _data: &[u8]) -> VaultbootResult<()> {
        Ok(())
    }

    fn write_secdata_firmware(&mut self, _data: &[u8]) -> VaultbootResult<()> {
        Ok(())
    }

    fn write_secdata_kernel(&mut self, _data: &[u8]) -> VaultbootResult<()> {
        Ok(())
    }

    fn write_secdata_fwmp(&mut self, _data: &[u8]) -> VaultbootResult<()> {
        Ok(())
    }

    /// Whether the EC is in a state we trust for manual-recovery
    /// arbitration (normally: still running RO).
    fn ec_trusted(&mut self) -> bool {
        true
    }

    fn ec_running_rw(&mut self) -> VaultbootResult<bool> {
        Ok(false)
    }

    fn ec_jump_to_rw(&mut self) -> VaultbootResult<()> {
        Ok(())
    }

    fn ec_disable_jump(&mut self) -> VaultbootResult<()> {
        Ok(())
    }

    /// Hash of the image the EC currently holds; returns the hash
    /// length.
    fn ec_hash_image(
        &mut self,
        _select: FwSelect,
        hash: &mut [u8; EC_HASH_MAX],
    ) -> VaultbootResult<usize> {
        hash[..32].fill(0);
        Ok(32)
    }

    /// Hash the AP firmware expects for that EC image; returns the hash
    /// length.
    fn ec_expected_image_hash(
        &mut self,
        _select: FwSelect,
        hash: &mut [u8; EC_HASH_MAX],
    ) -> VaultbootResult<usize> {
        hash[..32].fill(0);
        Ok(32)
    }

    fn ec_update_image(&mut self, _select: FwSelect) -> VaultbootResult<()> {
        Ok(())
    }

    fn ec_protect(&mut self, _select: FwSelect) -> VaultbootResult<()> {
        Ok(())
    }

    fn ec_vboot_done(&mut self) -> VaultbootResult<()> {
        Ok(())
    }

    fn ec_battery_cutoff(&mut self) -> VaultbootResult<()> {
        Ok(())
    }

    /// Sync auxiliary firmware (peripherals with their own blobs).
    fn auxfw_sync(&mut self, _ctx: &mut Context) -> VaultbootResult<()> {
        Ok(())
    }

    /// Bring up the wait screen ahead of a slow EC reflash.
    fn display_wait_screen(&mut self) -> VaultbootResult<()> {
        Ok(())
    }

    /// Scan `disks` and boot the first valid kernel, driving the kernel
    /// verification callbacks along the way.
    fn try_load_kernel(&mut self, _ctx: &mut Context, _disks: DiskSet) -> VaultbootResult<()> {
        Err(VaultbootError::LK_NO_DISK_FOUND)
    }

    fn recovery_ui(&mut self, _ctx: &mut Context) -> VaultbootResult<()> {
        Ok(())
    }

    fn developer_ui(&mut self, _ctx: &mut Context) -> VaultbootResult<()> {
        Ok(())
    }

    fn diagnostic_ui(&mut self, _ctx: &mut Context) -> VaultbootResult<()> {
        Ok(())
    }
}
