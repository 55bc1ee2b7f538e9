/*++

Licensed under the Apache-2.0 license.

File Name:

    key.rs

Abstract:

    File contains the unpacked public key view and the packed-key
    decoder. A packed key is only trusted after its algorithm tag and
    self-relative bounds have been validated here.

--*/

use vaultboot_error::{VaultbootError, VaultbootResult};
use vaultboot_image_types::{CryptoAlg, HashAlg, PackedKey};
use zerocopy::FromBytes;

/// An RSA public key unpacked from its wire format. The key material is
/// borrowed from the buffer (usually a pinned workbuf region); nothing
/// is copied.
#[derive(Debug, Clone, Copy)]
pub struct PublicKey<'a> {
    pub algorithm: CryptoAlg,
    pub hash_alg: HashAlg,
    pub key_version: u32,

    /// Modulus length in 32-bit words.
    pub arrsize: u32,

    /// Montgomery -1/n[0] mod 2^32, precomputed by the signing tools.
    pub n0inv: u32,

    /// Modulus, little-endian bytes.
    pub n: &'a [u8],

    /// Montgomery R^2 mod n, little-endian bytes.
    pub rr: &'a [u8],
}

impl PublicKey<'_> {
    pub fn sig_size(&self) -> usize {
        self.algorithm.sig_size()
    }
}

/// Decode and validate a packed key.
///
/// The wire layout is the `PackedKey` header followed (at `key_offset`
/// from the header start) by the key material:
/// `arrsize:u32, n0inv:u32, n[arrsize*4], rr[arrsize*4]`.
pub fn unpack_key(buf: &[u8]) -> VaultbootResult<PublicKey<'_>> {
    let packed = PackedKey::read_from_prefix(buf).ok_or(VaultbootError::UNPACK_KEY_SIZE)?;

    let alg = CryptoAlg::from_tag(packed.algorithm).ok_or(VaultbootError::UNPACK_KEY_ALGORITHM)?;

    let range = packed
        .key_range(0, buf.len())
        .ok_or(VaultbootError::UNPACK_KEY_BUFFER)?;
    let material = &buf[range];

    if material.len() < 8 {
        return Err(VaultbootError::UNPACK_KEY_SIZE);
    }
    let arrsize = u32::from_le_bytes([material[0], material[1], material[2], material[3]]);
    let n0inv = u32::from_le_bytes([material[4], material[5], material[6], material[7]]);

    if arrsize as usize != alg.sig_size() / 4 {
        return Err(VaultbootError::UNPACK_KEY_ARRAY_SIZE);
    }
    let nbytes = arrsize as usize * 4;
    if material.len() != 8 + 2 * nbytes {
        return Err(VaultbootError::UNPACK_KEY_SIZE);
    }

    Ok(PublicKey {
        algorithm: alg,
        hash_alg: alg.hash_alg(),
        key_version: packed.key_version.min(u32::MAX as u64) as u32,
        arrsize,
        n0inv,
        n: &material[8..8 + nbytes],
        rr: &material[8 + nbytes..],
    })
}
