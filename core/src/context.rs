/*++

Licensed under the Apache-2.0 license.

File Name:

    context.rs

Abstract:

    File contains the boot context and shared data. The context is the
    sole mutable root of the core: it owns the workbuf, the inline
    persistent blobs and the derived shared state, and is threaded
    through every operation. There is no process-wide state.

--*/

use core::mem::size_of;
use core::ops::Range;

use vaultboot_error::{VaultbootError, VaultbootResult};
use vaultboot_image_types::GbbHeader;
use zerocopy::FromBytes;

use crate::crypto::DigestContext;
use crate::nvdata::NVDATA_SIZE;
use crate::secdata::{SECDATA_FIRMWARE_SIZE, SECDATA_FWMP_SIZE, SECDATA_KERNEL_SIZE};
use crate::workbuf::{round_up, Workbuf, WORKBUF_MIN_SIZE};

bitflags::bitflags! {
    /// Boot-wide context flags. The low half is set by the host or the
    /// boot flow; the `*_CHANGED` bits are the persistent-store dirty
    /// marks consumed by commit.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct ContextFlags : u32 {
        const RECOVERY_MODE = 1 << 0;
        const DEVELOPER_MODE = 1 << 1;

        /// Recovery was requested by physical means (e.g. recovery
        /// button); arbitration may promote it to a manual recovery.
        const FORCE_RECOVERY_MODE = 1 << 2;

        /// Host requests a factory wipeout.
        const FORCE_WIPEOUT_MODE = 1 << 3;

        /// Caller asks to leave developer mode; GBB overrides win.
        const DISABLE_DEVELOPER_MODE = 1 << 4;

        const EC_SYNC_SUPPORTED = 1 << 5;

        /// EC reflash is slow enough to need a wait screen.
        const EC_SLOW_UPDATE = 1 << 6;

        const NVDATA_V2 = 1 << 7;

        /// FWMP space absent (or disabled via GBB).
        const NO_SECDATA_FWMP = 1 << 8;

        const ALLOW_KERNEL_ROLL_FORWARD = 1 << 9;

        /// Verifying slot B this boot.
        const FW_SLOT_B = 1 << 10;

        const VENDOR_DATA_SETTABLE = 1 << 11;

        /// Do not consume a try or mark the boot as trying.
        const NOFAIL_BOOT = 1 << 12;

        const NVDATA_CHANGED = 1 << 16;
        const SECDATA_FIRMWARE_CHANGED = 1 << 17;
        const SECDATA_KERNEL_CHANGED = 1 << 18;
        const SECDATA_FWMP_CHANGED = 1 << 19;
    }
}

bitflags::bitflags! {
    /// Progress marks in shared data: which initializations completed
    /// this boot.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct SdStatus : u32 {
        const NV_INIT = 1 << 0;
        const SECDATA_FIRMWARE_INIT = 1 << 1;
        const SECDATA_KERNEL_INIT = 1 << 2;
        const SECDATA_FWMP_INIT = 1 << 3;
        const GBB_INIT = 1 << 4;
        const CHOSE_SLOT = 1 << 5;
        const EC_SYNC_COMPLETE = 1 << 6;
    }
}

bitflags::bitflags! {
    /// Derived state bits in shared data.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct SdFlags : u32 {
        const DEV_MODE_ENABLED = 1 << 0;
        const MANUAL_RECOVERY = 1 << 1;
        const DISPLAY_AVAILABLE = 1 << 2;

        /// Kernel keyblock verified with a real key (not a recovery
        /// image); prerequisite for kernel roll-forward.
        const KERNEL_SIGNED = 1 << 3;
    }
}

/// One of the two redundant RW firmware copies.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[repr(u32)]
pub enum Slot {
    #[default]
    A = 0,
    B = 1,
}

impl Slot {
    pub fn other(self) -> Slot {
        match self {
            Slot::A => Slot::B,
            Slot::B => Slot::A,
        }
    }

    pub fn from_index(index: u32) -> Slot {
        if index & 1 != 0 {
            Slot::B
        } else {
            Slot::A
        }
    }

    pub fn index(self) -> u32 {
        self as u32
    }
}

/// Result of a firmware boot attempt, as recorded in nvdata.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[repr(u32)]
pub enum FwResult {
    #[default]
    Unknown = 0,
    Trying = 1,
    Success = 2,
    Failure = 3,
}

impl FwResult {
    pub fn from_index(index: u32) -> FwResult {
        match index & 3 {
            1 => FwResult::Trying,
            2 => FwResult::Success,
            3 => FwResult::Failure,
            _ => FwResult::Unknown,
        }
    }

    pub fn index(self) -> u32 {
        self as u32
    }
}

/// Derived boot-wide state. Offset/size pairs denote live, pinned
/// regions of the workbuf; each satisfies
/// `offset + size <= workbuf_used <= workbuf_size` whenever the size is
/// nonzero.
#[derive(Debug, Clone, Copy, Default)]
pub struct SharedData {
    pub status: SdStatus,
    pub flags: SdFlags,

    /// First recovery reason recorded this boot; write-once.
    pub recovery_reason: u8,

    /// Slot being verified this boot.
    pub fw_slot: Slot,

    /// Slot and result of the previous boot.
    pub last_fw_slot: Slot,
    pub last_fw_result: FwResult,

    /// Composite firmware version of the slot under verification
    /// (key version in the upper 16 bits, body version in the lower).
    pub fw_version: u32,

    /// Composite firmware version recorded in secdata.
    pub fw_version_secdata: u32,

    /// Composite kernel version and its secdata counterpart.
    pub kernel_version: u32,
    pub kernel_version_secdata: u32,

    /// Workbuf offset of the pinned GBB header (valid with
    /// `SdStatus::GBB_INIT`).
    pub gbb_offset: u32,

    /// Packed data key pinned in the workbuf (firmware data key after
    /// firmware phase 3, kernel data key after the kernel vblock).
    pub data_key_offset: u32,
    pub data_key_size: u32,

    /// Offset of the preamble within the vblock resource.
    pub vblock_preamble_offset: u32,

    /// Preamble pinned in the workbuf (firmware preamble after phase 3,
    /// kernel preamble after the kernel vblock).
    pub preamble_offset: u32,
    pub preamble_size: u32,

    /// Packed key used to verify the kernel keyblock.
    pub kernel_key_offset: u32,
    pub kernel_key_size: u32,
}

/// The boot context. Created once at entry, mutated by every component,
/// destroyed at hand-off after the final commit.
pub struct Context<'a> {
    pub flags: ContextFlags,
    pub sd: SharedData,

    /// Inline persistent blobs, read from the backing devices by the
    /// host before entry and written back by commit for the dirty ones.
    pub nvdata: [u8; NVDATA_SIZE],
    pub secdata_firmware: [u8; SECDATA_FIRMWARE_SIZE],
    pub secdata_kernel: [u8; SECDATA_KERNEL_SIZE],
    pub secdata_fwmp: [u8; SECDATA_FWMP_SIZE],

    workbuf: &'a mut [u8],
    workbuf_used: usize,

    /// Streaming digest of the firmware body, between `init_hash` and
    /// `check_hash`.
    pub(crate) body_hash: Option<DigestContext>,
    pub(crate) body_hash_remaining: u32,
}

impl<'a> Context<'a> {
    /// Set up a context over a caller-provided scratch buffer.
    pub fn init(workbuf: &'a mut [u8]) -> VaultbootResult<Context<'a>> {
        if workbuf.len() < WORKBUF_MIN_SIZE {
            return Err(VaultbootError::WORKBUF_TOO_SMALL);
        }
        Ok(Context {
            flags: ContextFlags::empty(),
            sd: SharedData::default(),
            nvdata: [0; NVDATA_SIZE],
            secdata_firmware: [0; SECDATA_FIRMWARE_SIZE],
            secdata_kernel: [0; SECDATA_KERNEL_SIZE],
            secdata_fwmp: [0; SECDATA_FWMP_SIZE],
            workbuf,
            workbuf_used: 0,
            body_hash: None,
            body_hash_remaining: 0,
        })
    }

    pub fn workbuf_size(&self) -> usize {
        self.workbuf.len()
    }

    pub fn workbuf_used(&self) -> usize {
        self.workbuf_used
    }

    /// Allocation cursor over the free tail of the workbuf.
    pub fn workbuf(&self) -> Workbuf {
        Workbuf::new(self.workbuf_used, self.workbuf.len())
    }

    /// Pin every allocation below `used` as permanent and reset the free
    /// pointer. Refuses to orphan a region shared data still points
    /// into.
    pub fn set_workbuf_used(&mut self, used: usize) -> VaultbootResult<()> {
        let used = round_up(used).ok_or(VaultbootError::WORKBUF_SET_USED_RANGE)?;
        if used > self.workbuf.len() {
            return Err(VaultbootError::WORKBUF_SET_USED_RANGE);
        }
        for (live, offset, size) in [
            (
                self.sd.status.contains(SdStatus::GBB_INIT),
                self.sd.gbb_offset,
                size_of::<GbbHeader>() as u32,
            ),
            (
                self.sd.data_key_size != 0,
                self.sd.data_key_offset,
                self.sd.data_key_size,
            ),
            (
                self.sd.preamble_size != 0,
                self.sd.preamble_offset,
                self.sd.preamble_size,
            ),
            (
                self.sd.kernel_key_size != 0,
                self.sd.kernel_key_offset,
                self.sd.kernel_key_size,
            ),
        ] {
            if live && (offset as usize) + (size as usize) > used {
                return Err(VaultbootError::WORKBUF_SET_USED_ORPHAN);
            }
        }
        self.workbuf_used = used;
        Ok(())
    }

    pub fn workbuf_slice(&self, offset: usize, len: usize) -> VaultbootResult<&[u8]> {
        self.workbuf
            .get(offset..offset.checked_add(len).ok_or(VaultbootError::WORKBUF_RANGE)?)
            .ok_or(VaultbootError::WORKBUF_RANGE)
    }

    pub fn workbuf_slice_mut(&mut self, offset: usize, len: usize) -> VaultbootResult<&mut [u8]> {
        self.workbuf
            .get_mut(offset..offset.checked_add(len).ok_or(VaultbootError::WORKBUF_RANGE)?)
            .ok_or(VaultbootError::WORKBUF_RANGE)
    }

    /// Split the workbuf into a shared view of `ro` and a mutable view
    /// of `rw`. The ranges must not overlap.
    pub fn workbuf_split(
        &mut self,
        ro: Range<usize>,
        rw: Range<usize>,
    ) -> VaultbootResult<(&[u8], &mut [u8])> {
        let len = self.workbuf.len();
        if ro.start > ro.end || rw.start > rw.end || ro.end > len || rw.end > len {
            return Err(VaultbootError::WORKBUF_RANGE);
        }
        if ro.end <= rw.start {
            let (left, right) = self.workbuf.split_at_mut(rw.start);
            Ok((&left[ro.start..ro.end], &mut right[..rw.end - rw.start]))
        } else if rw.end <= ro.start {
            let (left, right) = self.workbuf.split_at_mut(ro.start);
            Ok((&right[..ro.end - ro.start], &mut left[rw.start..rw.end]))
        } else {
            Err(VaultbootError::WORKBUF_RANGE)
        }
    }

    /// Move bytes within the workbuf. This is how a verified parent key
    /// is overwritten by the child key it certified; the source view is
    /// dead after the move.
    pub fn workbuf_copy_within(&mut self, src: Range<usize>, dst: usize) -> VaultbootResult<()> {
        let len = self.workbuf.len();
        let span = src.end.checked_sub(src.start).ok_or(VaultbootError::WORKBUF_RANGE)?;
        if src.end > len || dst.checked_add(span).ok_or(VaultbootError::WORKBUF_RANGE)? > len {
            return Err(VaultbootError::WORKBUF_RANGE);
        }
        self.workbuf.copy_within(src, dst);
        Ok(())
    }

    /// The pinned GBB header.
    pub fn gbb(&self) -> VaultbootResult<GbbHeader> {
        if !self.sd.status.contains(SdStatus::GBB_INIT) {
            return Err(VaultbootError::GBB_NOT_LOADED);
        }
        let bytes = self.workbuf_slice(self.sd.gbb_offset as usize, size_of::<GbbHeader>())?;
        GbbHeader::read_from_prefix(bytes).ok_or(VaultbootError::GBB_NOT_LOADED)
    }
}
