/*++

Licensed under the Apache-2.0 license.

File Name:

    lib.rs

Abstract:

    File contains the bit-exact on-disk structures for the verified-boot
    image formats: GBB header, packed key, signature, keyblock and the
    firmware/kernel preambles.

--*/
#![cfg_attr(not(feature = "std"), no_std)]

use core::mem::size_of;
use core::ops::Range;

use memoffset::offset_of;
use zerocopy::{AsBytes, FromBytes, FromZeroes};
use zeroize::Zeroize;

/// Number of bytes in the GBB signature field.
pub const GBB_SIGNATURE_SIZE: usize = 4;

/// The GBB magic is stored in the image as plain text, but the expected
/// value is kept xor-scrambled here so the magic string never appears
/// verbatim in the boot ROM.
pub const GBB_XOR_CHARS: [u8; GBB_SIGNATURE_SIZE] = *b"****";
pub const GBB_XOR_SIGNATURE: [u8; GBB_SIGNATURE_SIZE] = [0x0e, 0x6d, 0x68, 0x68];

pub const GBB_MAJOR_VER: u16 = 1;
pub const GBB_MINOR_VER: u16 = 2;

pub const KEYBLOCK_MAGIC: [u8; 8] = *b"CHROMEOS";
pub const KEYBLOCK_HEADER_VERSION_MAJOR: u32 = 2;
pub const KEYBLOCK_HEADER_VERSION_MINOR: u32 = 1;

pub const FW_PREAMBLE_HEADER_VERSION_MAJOR: u32 = 2;
pub const FW_PREAMBLE_HEADER_VERSION_MINOR: u32 = 1;
pub const KERNEL_PREAMBLE_HEADER_VERSION_MAJOR: u32 = 2;
pub const KERNEL_PREAMBLE_HEADER_VERSION_MINOR: u32 = 2;

/// Key and preamble versions occupy 16 bits each inside the 32-bit
/// composite version, so neither may exceed this.
pub const MAX_KEY_VERSION: u32 = 0xffff;
pub const MAX_PREAMBLE_VERSION: u32 = 0xffff;

/// Hash algorithm identifiers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HashAlg {
    Sha1,
    Sha256,
    Sha512,
}

impl HashAlg {
    /// Digest size in bytes.
    pub const fn digest_size(self) -> usize {
        match self {
            HashAlg::Sha1 => 20,
            HashAlg::Sha256 => 32,
            HashAlg::Sha512 => 64,
        }
    }
}

/// Combined signature + hash algorithm tag carried in a packed key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u64)]
pub enum CryptoAlg {
    Rsa1024Sha1 = 0,
    Rsa1024Sha256 = 1,
    Rsa1024Sha512 = 2,
    Rsa2048Sha1 = 3,
    Rsa2048Sha256 = 4,
    Rsa2048Sha512 = 5,
    Rsa4096Sha1 = 6,
    Rsa4096Sha256 = 7,
    Rsa4096Sha512 = 8,
    Rsa8192Sha1 = 9,
    Rsa8192Sha256 = 10,
    Rsa8192Sha512 = 11,
}

impl CryptoAlg {
    pub fn from_tag(tag: u64) -> Option<Self> {
        let alg = match tag {
            0 => CryptoAlg::Rsa1024Sha1,
            1 => CryptoAlg::Rsa1024Sha256,
            2 => CryptoAlg::Rsa1024Sha512,
            3 => CryptoAlg::Rsa2048Sha1,
            4 => CryptoAlg::Rsa2048Sha256,
            5 => CryptoAlg::Rsa2048Sha512,
            6 => CryptoAlg::Rsa4096Sha1,
            7 => CryptoAlg::Rsa4096Sha256,
            8 => CryptoAlg::Rsa4096Sha512,
            9 => CryptoAlg::Rsa8192Sha1,
            10 => CryptoAlg::Rsa8192Sha256,
            11 => CryptoAlg::Rsa8192Sha512,
            _ => return None,
        };
        Some(alg)
    }

    /// RSA modulus (and therefore signature) size in bytes.
    pub const fn sig_size(self) -> usize {
        match self {
            CryptoAlg::Rsa1024Sha1 | CryptoAlg::Rsa1024Sha256 | CryptoAlg::Rsa1024Sha512 => 128,
            CryptoAlg::Rsa2048Sha1 | CryptoAlg::Rsa2048Sha256 | CryptoAlg::Rsa2048Sha512 => 256,
            CryptoAlg::Rsa4096Sha1 | CryptoAlg::Rsa4096Sha256 | CryptoAlg::Rsa4096Sha512 => 512,
            CryptoAlg::Rsa8192Sha1 | CryptoAlg::Rsa8192Sha256 | CryptoAlg::Rsa8192Sha512 => 1024,
        }
    }

    pub const fn hash_alg(self) -> HashAlg {
        match self {
            CryptoAlg::Rsa1024Sha1
            | CryptoAlg::Rsa2048Sha1
            | CryptoAlg::Rsa4096Sha1
            | CryptoAlg::Rsa8192Sha1 => HashAlg::Sha1,
            CryptoAlg::Rsa1024Sha256
            | CryptoAlg::Rsa2048Sha256
            | CryptoAlg::Rsa4096Sha256
            | CryptoAlg::Rsa8192Sha256 => HashAlg::Sha256,
            CryptoAlg::Rsa1024Sha512
            | CryptoAlg::Rsa2048Sha512
            | CryptoAlg::Rsa4096Sha512
            | CryptoAlg::Rsa8192Sha512 => HashAlg::Sha512,
        }
    }
}

bitflags::bitflags! {
    /// GBB behavioral override flags.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct GbbFlags : u32 {
        /// Force developer mode on, as if the virtual switch were set.
        const FORCE_DEV_SWITCH_ON = 1 << 3;

        /// Allow USB boot in developer mode even if nvdata says no.
        const FORCE_DEV_BOOT_USB = 1 << 4;

        /// Skip firmware version rollback checks.
        const DISABLE_FW_ROLLBACK_CHECK = 1 << 5;

        /// Allow legacy boot in developer mode even if nvdata says no.
        const FORCE_DEV_BOOT_LEGACY = 1 << 7;

        /// Never run EC software sync.
        const DISABLE_EC_SOFTWARE_SYNC = 1 << 9;

        /// Pretend the FWMP space does not exist.
        const DISABLE_FWMP = 1 << 13;

        /// Always claim manual recovery is allowed.
        const FORCE_MANUAL_RECOVERY = 1 << 15;
    }
}

bitflags::bitflags! {
    /// Keyblock mode flags: which boot modes the keyblock is valid for.
    /// `_0` bits cover the mode being off, `_1` bits the mode being on.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct KeyblockFlags : u64 {
        const DEVELOPER_0 = 0x1;
        const DEVELOPER_1 = 0x2;
        const RECOVERY_0 = 0x4;
        const RECOVERY_1 = 0x8;
    }
}

/// Bounds-check a self-relative (offset, size) pair against a parent
/// buffer, where `self_offset` is the position of the referencing struct
/// within that buffer. Returns the absolute byte range on success.
fn range_in(offset: u64, size: u64, self_offset: usize, parent_len: usize) -> Option<Range<usize>> {
    let start = (self_offset as u64).checked_add(offset)?;
    let end = start.checked_add(size)?;
    if end > parent_len as u64 {
        return None;
    }
    Some(start as usize..end as usize)
}

/// GBB (factory binary block) header. All offsets are relative to the
/// start of the GBB region.
#[repr(C)]
#[derive(AsBytes, FromBytes, FromZeroes, Debug, Copy, Clone, Eq, PartialEq)]
pub struct GbbHeader {
    /// Plain-text magic, checked against the xor-scrambled constant.
    pub signature: [u8; GBB_SIGNATURE_SIZE],

    pub major_version: u16,
    pub minor_version: u16,

    /// Size of this header; may exceed `size_of::<GbbHeader>()` if the
    /// format has grown.
    pub header_size: u32,

    pub hwid_offset: u32,
    pub hwid_size: u32,

    pub bitmap0_offset: u32,
    pub bitmap0_size: u32,
    pub bitmap1_offset: u32,
    pub bitmap1_size: u32,

    pub rootkey_offset: u32,
    pub rootkey_size: u32,

    pub recovery_key_offset: u32,
    pub recovery_key_size: u32,

    pub flags: u32,

    pub reserved: [u8; 72],
}

impl Default for GbbHeader {
    fn default() -> Self {
        Self {
            signature: [0; GBB_SIGNATURE_SIZE],
            major_version: 0,
            minor_version: 0,
            header_size: 0,
            hwid_offset: 0,
            hwid_size: 0,
            bitmap0_offset: 0,
            bitmap0_size: 0,
            bitmap1_offset: 0,
            bitmap1_size: 0,
            rootkey_offset: 0,
            rootkey_size: 0,
            recovery_key_offset: 0,
            recovery_key_size: 0,
            flags: 0,
            reserved: [0; 72],
        }
    }
}

impl GbbHeader {
    /// Check the plain-text magic against the scrambled constant.
    pub fn signature_valid(&self) -> bool {
        for i in 0..GBB_SIGNATURE_SIZE {
            if self.signature[i] != (GBB_XOR_SIGNATURE[i] ^ GBB_XOR_CHARS[i]) {
                return false;
            }
        }
        true
    }

    /// Fill in the valid plain-text magic (host/test image generation).
    pub fn set_signature(&mut self) {
        for i in 0..GBB_SIGNATURE_SIZE {
            self.signature[i] = GBB_XOR_SIGNATURE[i] ^ GBB_XOR_CHARS[i];
        }
    }

    pub fn gbb_flags(&self) -> GbbFlags {
        GbbFlags::from_bits_truncate(self.flags)
    }
}

/// Packed public key: algorithm tag, key version and raw key material at
/// a self-relative offset.
#[repr(C)]
#[derive(AsBytes, FromBytes, FromZeroes, Default, Debug, Copy, Clone, Eq, PartialEq, Zeroize)]
pub struct PackedKey {
    /// Offset of the key material, relative to the start of this struct.
    pub key_offset: u64,

    /// Size of the key material in bytes.
    pub key_size: u64,

    /// Signature + hash algorithm tag (`CryptoAlg`).
    pub algorithm: u64,

    /// Key version, the upper half of a composite version.
    pub key_version: u64,
}

impl PackedKey {
    /// Total span of the packed key counted from the struct start,
    /// i.e. `key_offset + key_size`.
    pub fn packed_size(&self) -> Option<u64> {
        self.key_offset.checked_add(self.key_size)
    }

    /// Absolute range of the key material inside a parent buffer, given
    /// this struct's position within it.
    pub fn key_range(&self, self_offset: usize, parent_len: usize) -> Option<Range<usize>> {
        range_in(self.key_offset, self.key_size, self_offset, parent_len)
    }
}

/// Signature reference: raw signature bytes at a self-relative offset,
/// plus the number of bytes of data the signature covers.
#[repr(C)]
#[derive(AsBytes, FromBytes, FromZeroes, Default, Debug, Copy, Clone, Eq, PartialEq, Zeroize)]
pub struct ImageSignature {
    /// Offset of the signature bytes, relative to the start of this
    /// struct.
    pub sig_offset: u64,

    /// Size of the signature in bytes.
    pub sig_size: u64,

    /// Number of bytes of data signed, counted from the start of the
    /// parent structure.
    pub data_size: u64,
}

impl ImageSignature {
    /// Absolute range of the signature bytes inside a parent buffer,
    /// given this struct's position within it.
    pub fn sig_range(&self, self_offset: usize, parent_len: usize) -> Option<Range<usize>> {
        range_in(self.sig_offset, self.sig_size, self_offset, parent_len)
    }
}

/// Keyblock header: a signed envelope binding the embedded data key to
/// the parent key that made the signature. The full keyblock is this
/// header followed by the data-key material and the signature bytes.
#[repr(C)]
#[derive(AsBytes, FromBytes, FromZeroes, Default, Debug, Copy, Clone, Eq, PartialEq)]
pub struct KeyblockHeader {
    pub magic: [u8; 8],

    pub header_version_major: u32,
    pub header_version_minor: u32,

    /// Size of the entire keyblock, header included.
    pub keyblock_size: u64,

    /// Signature over `[0, keyblock_signature.data_size)` of the
    /// keyblock, made with the parent key.
    pub keyblock_signature: ImageSignature,

    /// The child key this keyblock certifies.
    pub data_key: PackedKey,

    pub keyblock_flags: u64,
}

impl KeyblockHeader {
    pub fn signature_offset() -> usize {
        offset_of!(KeyblockHeader, keyblock_signature)
    }

    pub fn data_key_offset() -> usize {
        offset_of!(KeyblockHeader, data_key)
    }

    pub fn flags(&self) -> KeyblockFlags {
        KeyblockFlags::from_bits_truncate(self.keyblock_flags)
    }
}

/// Firmware preamble header, signed with the keyblock's data key. The
/// full preamble is this header followed by the kernel-subkey material
/// and the signature blobs.
#[repr(C)]
#[derive(AsBytes, FromBytes, FromZeroes, Default, Debug, Copy, Clone, Eq, PartialEq)]
pub struct FwPreambleHeader {
    /// Size of the entire preamble, header included.
    pub preamble_size: u64,

    /// Signature over `[0, preamble_signature.data_size)` of the
    /// preamble, made with the data key.
    pub preamble_signature: ImageSignature,

    pub header_version_major: u32,
    pub header_version_minor: u32,

    /// Firmware body version, the lower half of the composite firmware
    /// version.
    pub firmware_version: u64,

    /// Key handed to the kernel verification stage.
    pub kernel_subkey: PackedKey,

    /// Signature over the firmware body.
    pub body_signature: ImageSignature,

    pub flags: u32,

    pub reserved: [u8; 4],
}

impl FwPreambleHeader {
    pub fn signature_offset() -> usize {
        offset_of!(FwPreambleHeader, preamble_signature)
    }

    pub fn kernel_subkey_offset() -> usize {
        offset_of!(FwPreambleHeader, kernel_subkey)
    }

    pub fn body_signature_offset() -> usize {
        offset_of!(FwPreambleHeader, body_signature)
    }
}

/// Kernel preamble header, signed with the kernel keyblock's data key.
#[repr(C)]
#[derive(AsBytes, FromBytes, FromZeroes, Default, Debug, Copy, Clone, Eq, PartialEq)]
pub struct KernelPreambleHeader {
    /// Size of the entire preamble, header included.
    pub preamble_size: u64,

    pub preamble_signature: ImageSignature,

    pub header_version_major: u32,
    pub header_version_minor: u32,

    /// Kernel body version, the lower half of the composite kernel
    /// version.
    pub kernel_version: u64,

    /// Address the kernel body wants to be loaded at.
    pub body_load_address: u64,

    /// Bootloader location within the kernel body.
    pub bootloader_address: u64,
    pub bootloader_size: u64,

    /// Signature over the kernel body.
    pub body_signature: ImageSignature,
}

impl KernelPreambleHeader {
    pub fn signature_offset() -> usize {
        offset_of!(KernelPreambleHeader, preamble_signature)
    }

    pub fn body_signature_offset() -> usize {
        offset_of!(KernelPreambleHeader, body_signature)
    }
}

const _: () = assert!(size_of::<GbbHeader>() == 128);
const _: () = assert!(size_of::<PackedKey>() == 32);
const _: () = assert!(size_of::<ImageSignature>() == 24);
const _: () = assert!(size_of::<KeyblockHeader>() == 88);
const _: () = assert!(size_of::<FwPreambleHeader>() == 112);
const _: () = assert!(size_of::<KernelPreambleHeader>() == 96);
