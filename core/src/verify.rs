/*++

Licensed under the Apache-2.0 license.

File Name:

    verify.rs

Abstract:

    File contains the signed-structure verifiers: generic signed-data
    verification plus the keyblock and preamble envelopes. Every offset
    in the wire structures is self-relative and bounds-checked before
    anything behind it is trusted.

--*/

use core::mem::size_of;

use vaultboot_error::{VaultbootError, VaultbootResult};
use vaultboot_image_types::{
    FwPreambleHeader, ImageSignature, KernelPreambleHeader, KeyblockHeader,
    FW_PREAMBLE_HEADER_VERSION_MAJOR, KERNEL_PREAMBLE_HEADER_VERSION_MAJOR,
    KEYBLOCK_HEADER_VERSION_MAJOR, KEYBLOCK_MAGIC,
};
use zerocopy::FromBytes;

use crate::crypto::{digest_buffer, verify_digest, MAX_DIGEST_SIZE};
use crate::key::PublicKey;

/// Verify a signature over the head of `data`.
///
/// `sig` must have been read from `data` at `sig_struct_offset` (its
/// offsets are relative to that position). The signed region is
/// `data[..sig.data_size]`; the signature bytes are located through the
/// struct and destroyed by the verification.
pub fn verify_data(
    data: &mut [u8],
    sig_struct_offset: usize,
    sig: &ImageSignature,
    key: &PublicKey,
) -> VaultbootResult<()> {
    if sig.sig_size as usize != key.sig_size() {
        return Err(VaultbootError::SIG_SIZE);
    }
    if sig.data_size > data.len() as u64 {
        return Err(VaultbootError::VERIFY_DATA_SIZE);
    }
    let sig_range = sig
        .sig_range(sig_struct_offset, data.len())
        .ok_or(VaultbootError::SIG_OUTSIDE)?;

    let mut digest = [0u8; MAX_DIGEST_SIZE];
    let digest_size = digest_buffer(key.hash_alg, &data[..sig.data_size as usize], &mut digest)?;

    verify_digest(key, &mut data[sig_range], &digest[..digest_size])
}

/// Verify a keyblock against the parent key and return its header.
///
/// Proves the parent's right to certify the embedded data key. On
/// success the data key (header fields and material span) is covered by
/// the checked signature.
pub fn verify_keyblock(block: &mut [u8], key: &PublicKey) -> VaultbootResult<KeyblockHeader> {
    let header =
        KeyblockHeader::read_from_prefix(&block[..]).ok_or(VaultbootError::KEYBLOCK_BUFFER)?;

    if header.magic != KEYBLOCK_MAGIC {
        return Err(VaultbootError::KEYBLOCK_MAGIC);
    }
    if header.header_version_major != KEYBLOCK_HEADER_VERSION_MAJOR {
        return Err(VaultbootError::KEYBLOCK_HEADER_VERSION);
    }
    if header.keyblock_size < size_of::<KeyblockHeader>() as u64
        || header.keyblock_size > block.len() as u64
    {
        return Err(VaultbootError::KEYBLOCK_SIZE);
    }
    let block = &mut block[..header.keyblock_size as usize];

    // The signature must cover at least the header, and with it the
    // data-key fields we are about to trust.
    let sig = header.keyblock_signature;
    if sig.data_size < size_of::<KeyblockHeader>() as u64 {
        return Err(VaultbootError::KEYBLOCK_SIGNED_TOO_LITTLE);
    }

    // The data-key material must lie inside the signed region.
    let packed_size = header
        .data_key
        .packed_size()
        .ok_or(VaultbootError::KEYBLOCK_DATA_KEY_OUTSIDE)?;
    let data_key_end = (KeyblockHeader::data_key_offset() as u64)
        .checked_add(packed_size)
        .ok_or(VaultbootError::KEYBLOCK_DATA_KEY_OUTSIDE)?;
    if data_key_end > sig.data_size {
        return Err(VaultbootError::KEYBLOCK_DATA_KEY_OUTSIDE);
    }

    verify_data(block, KeyblockHeader::signature_offset(), &sig, key)?;

    Ok(header)
}

/// Verify a firmware preamble against the data key and return its
/// header.
pub fn verify_fw_preamble(pre: &mut [u8], key: &PublicKey) -> VaultbootResult<FwPreambleHeader> {
    let header =
        FwPreambleHeader::read_from_prefix(&pre[..]).ok_or(VaultbootError::PREAMBLE_BUFFER)?;

    if header.header_version_major != FW_PREAMBLE_HEADER_VERSION_MAJOR {
        return Err(VaultbootError::PREAMBLE_HEADER_VERSION);
    }
    if header.preamble_size < size_of::<FwPreambleHeader>() as u64
        || header.preamble_size > pre.len() as u64
    {
        return Err(VaultbootError::PREAMBLE_SIZE);
    }
    let pre = &mut pre[..header.preamble_size as usize];

    let sig = header.preamble_signature;
    if sig.data_size < size_of::<FwPreambleHeader>() as u64 {
        return Err(VaultbootError::PREAMBLE_SIGNED_TOO_LITTLE);
    }

    // The kernel subkey material and the body signature bytes must live
    // inside the preamble.
    header
        .kernel_subkey
        .key_range(FwPreambleHeader::kernel_subkey_offset(), pre.len())
        .ok_or(VaultbootError::UNPACK_KEY_BUFFER)?;
    header
        .body_signature
        .sig_range(FwPreambleHeader::body_signature_offset(), pre.len())
        .ok_or(VaultbootError::SIG_OUTSIDE)?;

    verify_data(pre, FwPreambleHeader::signature_offset(), &sig, key)?;

    Ok(header)
}

/// Verify a kernel preamble against the kernel data key and return its
/// header.
pub fn verify_kernel_preamble(
    pre: &mut [u8],
    key: &PublicKey,
) -> VaultbootResult<KernelPreambleHeader> {
    let header =
        KernelPreambleHeader::read_from_prefix(&pre[..]).ok_or(VaultbootError::PREAMBLE_BUFFER)?;

    if header.header_version_major != KERNEL_PREAMBLE_HEADER_VERSION_MAJOR {
        return Err(VaultbootError::PREAMBLE_HEADER_VERSION);
    }
    if header.preamble_size < size_of::<KernelPreambleHeader>() as u64
        || header.preamble_size > pre.len() as u64
    {
        return Err(VaultbootError::PREAMBLE_SIZE);
    }
    let pre = &mut pre[..header.preamble_size as usize];

    let sig = header.preamble_signature;
    if sig.data_size < size_of::<KernelPreambleHeader>() as u64 {
        return Err(VaultbootError::PREAMBLE_SIGNED_TOO_LITTLE);
    }

    header
        .body_signature
        .sig_range(KernelPreambleHeader::body_signature_offset(), pre.len())
        .ok_or(VaultbootError::SIG_OUTSIDE)?;

    verify_data(pre, KernelPreambleHeader::signature_offset(), &sig, key)?;

    Ok(header)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::key::unpack_key;
    use crate::testutil::{build_fw_preamble, build_keyblock, TestSigner};
    use vaultboot_image_types::{CryptoAlg, KeyblockFlags};
    use zerocopy::AsBytes;

    fn patch_keyblock_header(block: &mut [u8], f: impl FnOnce(&mut KeyblockHeader)) {
        let mut header = KeyblockHeader::read_from_prefix(&block[..]).unwrap();
        f(&mut header);
        block[..size_of::<KeyblockHeader>()].copy_from_slice(header.as_bytes());
    }

    #[test]
    fn test_keyblock_good() {
        let root = TestSigner::generate(CryptoAlg::Rsa2048Sha256);
        let data = TestSigner::generate(CryptoAlg::Rsa2048Sha256);
        let mut block = build_keyblock(&root, &data.pack_key(2), KeyblockFlags::empty());

        let packed_root = root.pack_key(1);
        let root_key = unpack_key(&packed_root).unwrap();
        let header = verify_keyblock(&mut block, &root_key).unwrap();
        assert_eq!(header.data_key.key_version, 2);
    }

    #[test]
    fn test_keyblock_bad_magic() {
        let root = TestSigner::generate(CryptoAlg::Rsa2048Sha256);
        let data = TestSigner::generate(CryptoAlg::Rsa2048Sha256);
        let mut block = build_keyblock(&root, &data.pack_key(2), KeyblockFlags::empty());
        block[0] ^= 0xff;

        let packed_root = root.pack_key(1);
        let root_key = unpack_key(&packed_root).unwrap();
        assert_eq!(
            verify_keyblock(&mut block, &root_key).err(),
            Some(VaultbootError::KEYBLOCK_MAGIC)
        );
    }

    #[test]
    fn test_keyblock_bad_header_version() {
        let root = TestSigner::generate(CryptoAlg::Rsa2048Sha256);
        let data = TestSigner::generate(CryptoAlg::Rsa2048Sha256);
        let mut block = build_keyblock(&root, &data.pack_key(2), KeyblockFlags::empty());
        patch_keyblock_header(&mut block, |h| h.header_version_major = 3);

        let packed_root = root.pack_key(1);
        let root_key = unpack_key(&packed_root).unwrap();
        assert_eq!(
            verify_keyblock(&mut block, &root_key).err(),
            Some(VaultbootError::KEYBLOCK_HEADER_VERSION)
        );
    }

    #[test]
    fn test_keyblock_size_beyond_buffer() {
        let root = TestSigner::generate(CryptoAlg::Rsa2048Sha256);
        let data = TestSigner::generate(CryptoAlg::Rsa2048Sha256);
        let mut block = build_keyblock(&root, &data.pack_key(2), KeyblockFlags::empty());
        let oversize = block.len() as u64 + 1;
        patch_keyblock_header(&mut block, |h| h.keyblock_size = oversize);

        let packed_root = root.pack_key(1);
        let root_key = unpack_key(&packed_root).unwrap();
        assert_eq!(
            verify_keyblock(&mut block, &root_key).err(),
            Some(VaultbootError::KEYBLOCK_SIZE)
        );
    }

    #[test]
    fn test_keyblock_tampered_data_key() {
        let root = TestSigner::generate(CryptoAlg::Rsa2048Sha256);
        let data = TestSigner::generate(CryptoAlg::Rsa2048Sha256);
        let mut block = build_keyblock(&root, &data.pack_key(2), KeyblockFlags::empty());
        // Bump the certified key version; the signature no longer
        // matches.
        patch_keyblock_header(&mut block, |h| h.data_key.key_version = 99);

        let packed_root = root.pack_key(1);
        let root_key = unpack_key(&packed_root).unwrap();
        assert_eq!(
            verify_keyblock(&mut block, &root_key).err(),
            Some(VaultbootError::RSA_VERIFY_FAILED)
        );
    }

    #[test]
    fn test_keyblock_wrong_parent_key() {
        let root = TestSigner::generate(CryptoAlg::Rsa2048Sha256);
        let other = TestSigner::generate(CryptoAlg::Rsa2048Sha256);
        let data = TestSigner::generate(CryptoAlg::Rsa2048Sha256);
        let mut block = build_keyblock(&root, &data.pack_key(2), KeyblockFlags::empty());

        let packed_other = other.pack_key(1);
        let other_key = unpack_key(&packed_other).unwrap();
        assert_eq!(
            verify_keyblock(&mut block, &other_key).err(),
            Some(VaultbootError::RSA_VERIFY_FAILED)
        );
    }

    #[test]
    fn test_fw_preamble_good_and_tampered() {
        let data = TestSigner::generate(CryptoAlg::Rsa2048Sha256);
        let subkey = TestSigner::generate(CryptoAlg::Rsa2048Sha256);
        let body_sig = data.sign(b"firmware body");
        let mut pre = build_fw_preamble(&data, 7, &subkey.pack_key(3), &body_sig, b"firmware body");

        let packed_data = data.pack_key(2);
        let data_key = unpack_key(&packed_data).unwrap();
        let header = verify_fw_preamble(&mut pre.clone(), &data_key).unwrap();
        assert_eq!(header.firmware_version, 7);
        assert_eq!(header.kernel_subkey.key_version, 3);

        // Any bit flip inside the signed region must fail.
        pre[40] ^= 0x01;
        assert_eq!(
            verify_fw_preamble(&mut pre, &data_key).err(),
            Some(VaultbootError::RSA_VERIFY_FAILED)
        );
    }

    #[test]
    fn test_fw_preamble_size_checks() {
        let data = TestSigner::generate(CryptoAlg::Rsa2048Sha256);
        let subkey = TestSigner::generate(CryptoAlg::Rsa2048Sha256);
        let body_sig = data.sign(b"body");
        let pre = build_fw_preamble(&data, 1, &subkey.pack_key(1), &body_sig, b"body");

        let packed_data = data.pack_key(2);
        let data_key = unpack_key(&packed_data).unwrap();

        let mut short = pre.clone();
        short.truncate(size_of::<FwPreambleHeader>() - 1);
        assert_eq!(
            verify_fw_preamble(&mut short, &data_key).err(),
            Some(VaultbootError::PREAMBLE_BUFFER)
        );

        let mut truncated = pre.clone();
        truncated.truncate(pre.len() - 8);
        assert_eq!(
            verify_fw_preamble(&mut truncated, &data_key).err(),
            Some(VaultbootError::PREAMBLE_SIZE)
        );
    }
}
