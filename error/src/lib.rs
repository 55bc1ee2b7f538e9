/*++

Licensed under the Apache-2.0 license.

File Name:

    lib.rs

Abstract:

    File contains the flat error namespace used by the verified-boot core.

--*/
#![cfg_attr(not(feature = "std"), no_std)]

use core::convert::From;
use core::num::NonZeroU32;

/// Vaultboot Error Type
///
/// Every operation in the boot core returns one of these codes. The
/// namespace is flat so a code survives truncation to 8 bits when it is
/// recorded in nvdata as a recovery subcode.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct VaultbootError(pub NonZeroU32);

impl VaultbootError {
    const fn new_const(val: u32) -> Self {
        match NonZeroU32::new(val) {
            Some(val) => Self(val),
            None => panic!("VaultbootError cannot be 0"),
        }
    }

    /// Truncate the code to 8 bits for storage as a recovery subcode.
    pub const fn code8(self) -> u8 {
        (self.0.get() & 0xff) as u8
    }

    /// GBB Errors
    pub const GBB_MAGIC: VaultbootError = VaultbootError::new_const(0x00010001);
    pub const GBB_MAJOR_VERSION: VaultbootError = VaultbootError::new_const(0x00010002);
    pub const GBB_MINOR_VERSION: VaultbootError = VaultbootError::new_const(0x00010003);
    pub const GBB_HEADER_SIZE: VaultbootError = VaultbootError::new_const(0x00010004);
    pub const GBB_WORKBUF: VaultbootError = VaultbootError::new_const(0x00010005);
    pub const GBB_NOT_LOADED: VaultbootError = VaultbootError::new_const(0x00010006);
    pub const GBB_RECOVERY_KEY_WORKBUF: VaultbootError = VaultbootError::new_const(0x00010007);
    pub const GBB_RECOVERY_KEY_SIZE: VaultbootError = VaultbootError::new_const(0x00010008);

    /// Workbuf Errors
    pub const WORKBUF_TOO_SMALL: VaultbootError = VaultbootError::new_const(0x00020001);
    pub const WORKBUF_RANGE: VaultbootError = VaultbootError::new_const(0x00020002);
    pub const WORKBUF_SET_USED_RANGE: VaultbootError = VaultbootError::new_const(0x00020003);
    pub const WORKBUF_SET_USED_ORPHAN: VaultbootError = VaultbootError::new_const(0x00020004);

    /// Packed Key Errors
    pub const UNPACK_KEY_SIZE: VaultbootError = VaultbootError::new_const(0x00030001);
    pub const UNPACK_KEY_ALGORITHM: VaultbootError = VaultbootError::new_const(0x00030002);
    pub const UNPACK_KEY_ARRAY_SIZE: VaultbootError = VaultbootError::new_const(0x00030003);
    pub const UNPACK_KEY_BUFFER: VaultbootError = VaultbootError::new_const(0x00030004);

    /// Signature Verification Errors
    pub const SIG_OUTSIDE: VaultbootError = VaultbootError::new_const(0x00040001);
    pub const SIG_SIZE: VaultbootError = VaultbootError::new_const(0x00040002);
    pub const VERIFY_DATA_SIZE: VaultbootError = VaultbootError::new_const(0x00040003);
    pub const VERIFY_DIGEST_SIZE: VaultbootError = VaultbootError::new_const(0x00040004);
    pub const RSA_VERIFY_FAILED: VaultbootError = VaultbootError::new_const(0x00040005);
    pub const SHA_UNSUPPORTED: VaultbootError = VaultbootError::new_const(0x00040006);
    pub const KEYBLOCK_MAGIC: VaultbootError = VaultbootError::new_const(0x00040011);
    pub const KEYBLOCK_HEADER_VERSION: VaultbootError = VaultbootError::new_const(0x00040012);
    pub const KEYBLOCK_SIZE: VaultbootError = VaultbootError::new_const(0x00040013);
    pub const KEYBLOCK_SIGNED_TOO_LITTLE: VaultbootError = VaultbootError::new_const(0x00040014);
    pub const KEYBLOCK_DATA_KEY_OUTSIDE: VaultbootError = VaultbootError::new_const(0x00040015);
    pub const KEYBLOCK_BUFFER: VaultbootError = VaultbootError::new_const(0x00040016);
    pub const PREAMBLE_SIZE: VaultbootError = VaultbootError::new_const(0x00040021);
    pub const PREAMBLE_BUFFER: VaultbootError = VaultbootError::new_const(0x00040022);
    pub const PREAMBLE_SIGNED_TOO_LITTLE: VaultbootError = VaultbootError::new_const(0x00040023);
    pub const PREAMBLE_HEADER_VERSION: VaultbootError = VaultbootError::new_const(0x00040024);

    /// Nvdata Errors
    pub const NV_WRITE: VaultbootError = VaultbootError::new_const(0x00050001);

    /// Secdata Errors
    pub const SECDATA_FIRMWARE_CRC: VaultbootError = VaultbootError::new_const(0x00060001);
    pub const SECDATA_FIRMWARE_VERSION: VaultbootError = VaultbootError::new_const(0x00060002);
    pub const SECDATA_FIRMWARE_UNINITIALIZED: VaultbootError =
        VaultbootError::new_const(0x00060003);
    pub const SECDATA_FIRMWARE_WRITE: VaultbootError = VaultbootError::new_const(0x00060004);
    pub const SECDATA_KERNEL_CRC: VaultbootError = VaultbootError::new_const(0x00060011);
    pub const SECDATA_KERNEL_VERSION: VaultbootError = VaultbootError::new_const(0x00060012);
    pub const SECDATA_KERNEL_UID: VaultbootError = VaultbootError::new_const(0x00060013);
    pub const SECDATA_KERNEL_UNINITIALIZED: VaultbootError = VaultbootError::new_const(0x00060014);
    pub const SECDATA_KERNEL_WRITE: VaultbootError = VaultbootError::new_const(0x00060015);
    pub const SECDATA_FWMP_CRC: VaultbootError = VaultbootError::new_const(0x00060021);
    pub const SECDATA_FWMP_VERSION: VaultbootError = VaultbootError::new_const(0x00060022);
    pub const SECDATA_FWMP_SIZE: VaultbootError = VaultbootError::new_const(0x00060023);
    pub const SECDATA_FWMP_WRITE: VaultbootError = VaultbootError::new_const(0x00060024);

    /// Firmware Verification Errors
    pub const FW_KEYBLOCK_WORKBUF_ROOT_KEY: VaultbootError =
        VaultbootError::new_const(0x00070001);
    pub const FW_KEYBLOCK_WORKBUF_HEADER: VaultbootError = VaultbootError::new_const(0x00070002);
    pub const FW_KEYBLOCK_WORKBUF: VaultbootError = VaultbootError::new_const(0x00070003);
    pub const FW_KEYBLOCK_VERSION_RANGE: VaultbootError = VaultbootError::new_const(0x00070004);
    pub const FW_KEYBLOCK_VERSION_ROLLBACK: VaultbootError = VaultbootError::new_const(0x00070005);
    pub const FW_PREAMBLE_DATA_KEY: VaultbootError = VaultbootError::new_const(0x00070006);
    pub const FW_PREAMBLE_WORKBUF_HEADER: VaultbootError = VaultbootError::new_const(0x00070007);
    pub const FW_PREAMBLE_WORKBUF: VaultbootError = VaultbootError::new_const(0x00070008);
    pub const FW_PREAMBLE_VERSION_RANGE: VaultbootError = VaultbootError::new_const(0x00070009);
    pub const FW_PREAMBLE_VERSION_ROLLBACK: VaultbootError = VaultbootError::new_const(0x0007000A);
    pub const PHASE1_RECOVERY: VaultbootError = VaultbootError::new_const(0x0007000B);

    /// Kernel Verification Errors
    pub const KERNEL_PHASE1_PREAMBLE: VaultbootError = VaultbootError::new_const(0x00080001);
    pub const KERNEL_KEYBLOCK_WORKBUF_HEADER: VaultbootError =
        VaultbootError::new_const(0x00080002);
    pub const KERNEL_KEYBLOCK_WORKBUF: VaultbootError = VaultbootError::new_const(0x00080003);
    pub const KERNEL_KEYBLOCK_DEV_FLAG: VaultbootError = VaultbootError::new_const(0x00080004);
    pub const KERNEL_KEYBLOCK_REC_FLAG: VaultbootError = VaultbootError::new_const(0x00080005);
    pub const KERNEL_KEYBLOCK_VERSION_RANGE: VaultbootError =
        VaultbootError::new_const(0x00080006);
    pub const KERNEL_KEYBLOCK_VERSION_ROLLBACK: VaultbootError =
        VaultbootError::new_const(0x00080007);
    pub const KERNEL_PREAMBLE_WORKBUF_HEADER: VaultbootError =
        VaultbootError::new_const(0x00080008);
    pub const KERNEL_PREAMBLE_WORKBUF: VaultbootError = VaultbootError::new_const(0x00080009);
    pub const KERNEL_PREAMBLE_VERSION_RANGE: VaultbootError =
        VaultbootError::new_const(0x0008000A);
    pub const KERNEL_PREAMBLE_VERSION_ROLLBACK: VaultbootError =
        VaultbootError::new_const(0x0008000B);
    pub const KERNEL_DATA_KEY: VaultbootError = VaultbootError::new_const(0x0008000C);
    pub const KERNEL_DATA_SIZE: VaultbootError = VaultbootError::new_const(0x0008000D);
    pub const KERNEL_DATA_PREAMBLE: VaultbootError = VaultbootError::new_const(0x0008000E);
    pub const KERNEL_RECOVERY_KEY: VaultbootError = VaultbootError::new_const(0x0008000F);

    /// Host Action Requests
    ///
    /// Not failures of a verification step; they tell the caller which
    /// transition the machine needs before boot can continue.
    pub const EC_REBOOT_TO_RO_REQUIRED: VaultbootError = VaultbootError::new_const(0x00090001);
    pub const REBOOT_REQUIRED: VaultbootError = VaultbootError::new_const(0x00090002);
    pub const SHUTDOWN_REQUESTED: VaultbootError = VaultbootError::new_const(0x00090003);

    /// External Environment Errors
    pub const READ_RESOURCE_INDEX: VaultbootError = VaultbootError::new_const(0x000A0001);
    pub const READ_RESOURCE_SIZE: VaultbootError = VaultbootError::new_const(0x000A0002);
    pub const TPM_CLEAR_OWNER: VaultbootError = VaultbootError::new_const(0x000A0003);
    pub const MOCK: VaultbootError = VaultbootError::new_const(0x000A00AA);
    pub const UNKNOWN: VaultbootError = VaultbootError::new_const(0x000A00FF);

    /// Kernel Loading Errors (reported by the host's disk loop)
    pub const LK_NO_DISK_FOUND: VaultbootError = VaultbootError::new_const(0x000B0001);
    pub const LK_NO_KERNEL_FOUND: VaultbootError = VaultbootError::new_const(0x000B0002);
    pub const LK_INVALID_KERNEL_FOUND: VaultbootError = VaultbootError::new_const(0x000B0003);

    /// Body Hash API Errors
    pub const API_INIT_HASH_PREAMBLE: VaultbootError = VaultbootError::new_const(0x000C0001);
    pub const API_INIT_HASH_DATA_KEY: VaultbootError = VaultbootError::new_const(0x000C0002);
    pub const API_EXTEND_HASH_DIGEST: VaultbootError = VaultbootError::new_const(0x000C0003);
    pub const API_EXTEND_HASH_SIZE: VaultbootError = VaultbootError::new_const(0x000C0004);
    pub const API_CHECK_HASH_DIGEST: VaultbootError = VaultbootError::new_const(0x000C0005);
    pub const API_CHECK_HASH_SIZE: VaultbootError = VaultbootError::new_const(0x000C0006);
}

impl From<core::num::NonZeroU32> for VaultbootError {
    fn from(val: core::num::NonZeroU32) -> Self {
        VaultbootError(val)
    }
}

impl From<VaultbootError> for core::num::NonZeroU32 {
    fn from(val: VaultbootError) -> Self {
        val.0
    }
}

impl From<VaultbootError> for u32 {
    fn from(val: VaultbootError) -> Self {
        core::num::NonZeroU32::from(val).get()
    }
}

pub type VaultbootResult<T> = Result<T, VaultbootError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_code8_truncation() {
        assert_eq!(VaultbootError::FW_KEYBLOCK_VERSION_ROLLBACK.code8(), 0x05);
        assert_eq!(VaultbootError::UNKNOWN.code8(), 0xFF);
    }

    #[test]
    fn test_u32_roundtrip() {
        let e = VaultbootError::KEYBLOCK_MAGIC;
        assert_eq!(u32::from(e), 0x00040011);
    }
}
