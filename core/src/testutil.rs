/*++

Licensed under the Apache-2.0 license.

File Name:

    testutil.rs

Abstract:

    File contains test-only image generation: RSA key generation,
    packed-key encoding with the Montgomery metadata, and keyblock /
    preamble / GBB assembly in the exact wire format the verifiers
    parse.

--*/

use core::mem::size_of;

use rand::rngs::OsRng;
use rsa::traits::PublicKeyParts;
use rsa::RsaPrivateKey;
use vaultboot_image_types::{
    CryptoAlg, FwPreambleHeader, GbbHeader, ImageSignature, KernelPreambleHeader, KeyblockFlags,
    KeyblockHeader, PackedKey, FW_PREAMBLE_HEADER_VERSION_MAJOR,
    FW_PREAMBLE_HEADER_VERSION_MINOR, KERNEL_PREAMBLE_HEADER_VERSION_MAJOR,
    KERNEL_PREAMBLE_HEADER_VERSION_MINOR, KEYBLOCK_HEADER_VERSION_MAJOR,
    KEYBLOCK_HEADER_VERSION_MINOR, KEYBLOCK_MAGIC,
};
use zerocopy::{AsBytes, FromBytes};

use crate::crypto::{digest_buffer, pkcs1v15_scheme, MAX_DIGEST_SIZE};

/// A signing key plus the algorithm tag its packed form advertises.
pub struct TestSigner {
    priv_key: RsaPrivateKey,
    pub alg: CryptoAlg,
}

impl TestSigner {
    pub fn generate(alg: CryptoAlg) -> TestSigner {
        let bits = alg.sig_size() * 8;
        let priv_key = RsaPrivateKey::new(&mut OsRng, bits).unwrap();
        TestSigner { priv_key, alg }
    }

    pub fn sig_size(&self) -> usize {
        self.alg.sig_size()
    }

    /// Encode the public half in the packed wire format:
    /// `PackedKey` header, then `arrsize, n0inv, n[], rr[]`.
    pub fn pack_key(&self, key_version: u64) -> Vec<u8> {
        let nbytes = self.alg.sig_size();
        let arrsize = (nbytes / 4) as u32;

        let n = self.priv_key.to_public_key().n().clone();
        let mut n_le = n.to_bytes_le();
        n_le.resize(nbytes, 0);

        // rr = R^2 mod n with R = 2^(8 * nbytes).
        let rr = rsa::BigUint::from(2u8).modpow(&rsa::BigUint::from((2 * 8 * nbytes) as u64), &n);
        let mut rr_le = rr.to_bytes_le();
        rr_le.resize(nbytes, 0);

        // n0inv = -1 / n[0] mod 2^32, by Newton iteration.
        let n0 = u32::from_le_bytes([n_le[0], n_le[1], n_le[2], n_le[3]]);
        let mut x: u32 = 1;
        for _ in 0..5 {
            x = x.wrapping_mul(2u32.wrapping_sub(n0.wrapping_mul(x)));
        }
        let n0inv = x.wrapping_neg();

        let header = PackedKey {
            key_offset: size_of::<PackedKey>() as u64,
            key_size: (8 + 2 * nbytes) as u64,
            algorithm: self.alg as u64,
            key_version,
        };

        let mut out = Vec::new();
        out.extend_from_slice(header.as_bytes());
        out.extend_from_slice(&arrsize.to_le_bytes());
        out.extend_from_slice(&n0inv.to_le_bytes());
        out.extend_from_slice(&n_le);
        out.extend_from_slice(&rr_le);
        out
    }

    /// PKCS#1 v1.5 signature over `data`.
    pub fn sign(&self, data: &[u8]) -> Vec<u8> {
        let mut digest = [0u8; MAX_DIGEST_SIZE];
        let n = digest_buffer(self.alg.hash_alg(), data, &mut digest).unwrap();
        self.priv_key
            .sign(pkcs1v15_scheme(self.alg.hash_alg()), &digest[..n])
            .unwrap()
    }
}

/// Header copy and material bytes of a packed key.
fn packed_material(packed: &[u8]) -> (PackedKey, &[u8]) {
    let header = PackedKey::read_from_prefix(packed).unwrap();
    (header, &packed[size_of::<PackedKey>()..])
}

/// Assemble and sign a keyblock:
/// `[header][data-key material][signature]`.
pub fn build_keyblock(root: &TestSigner, data_key_packed: &[u8], flags: KeyblockFlags) -> Vec<u8> {
    let (dk_header, dk_material) = packed_material(data_key_packed);

    let header_size = size_of::<KeyblockHeader>();
    let data_size = header_size + dk_material.len();
    let sig_size = root.sig_size();

    let header = KeyblockHeader {
        magic: KEYBLOCK_MAGIC,
        header_version_major: KEYBLOCK_HEADER_VERSION_MAJOR,
        header_version_minor: KEYBLOCK_HEADER_VERSION_MINOR,
        keyblock_size: (data_size + sig_size) as u64,
        keyblock_signature: ImageSignature {
            sig_offset: (data_size - KeyblockHeader::signature_offset()) as u64,
            sig_size: sig_size as u64,
            data_size: data_size as u64,
        },
        data_key: PackedKey {
            key_offset: (header_size - KeyblockHeader::data_key_offset()) as u64,
            key_size: dk_header.key_size,
            algorithm: dk_header.algorithm,
            key_version: dk_header.key_version,
        },
        keyblock_flags: flags.bits(),
    };

    let mut out = Vec::new();
    out.extend_from_slice(header.as_bytes());
    out.extend_from_slice(dk_material);
    let sig = root.sign(&out[..data_size]);
    out.extend_from_slice(&sig);
    out
}

/// Assemble and sign a firmware preamble:
/// `[header][kernel-subkey material][body signature][preamble signature]`.
pub fn build_fw_preamble(
    data_key: &TestSigner,
    firmware_version: u64,
    kernel_subkey_packed: &[u8],
    body_sig: &[u8],
    body: &[u8],
) -> Vec<u8> {
    let (sk_header, sk_material) = packed_material(kernel_subkey_packed);

    let header_size = size_of::<FwPreambleHeader>();
    let body_sig_offset = header_size + sk_material.len();
    let data_size = body_sig_offset + body_sig.len();
    let sig_size = data_key.sig_size();

    let header = FwPreambleHeader {
        preamble_size: (data_size + sig_size) as u64,
        preamble_signature: ImageSignature {
            sig_offset: (data_size - FwPreambleHeader::signature_offset()) as u64,
            sig_size: sig_size as u64,
            data_size: data_size as u64,
        },
        header_version_major: FW_PREAMBLE_HEADER_VERSION_MAJOR,
        header_version_minor: FW_PREAMBLE_HEADER_VERSION_MINOR,
        firmware_version,
        kernel_subkey: PackedKey {
            key_offset: (header_size - FwPreambleHeader::kernel_subkey_offset()) as u64,
            key_size: sk_header.key_size,
            algorithm: sk_header.algorithm,
            key_version: sk_header.key_version,
        },
        body_signature: ImageSignature {
            sig_offset: (body_sig_offset - FwPreambleHeader::body_signature_offset()) as u64,
            sig_size: body_sig.len() as u64,
            data_size: body.len() as u64,
        },
        flags: 0,
        reserved: [0; 4],
    };

    let mut out = Vec::new();
    out.extend_from_slice(header.as_bytes());
    out.extend_from_slice(sk_material);
    out.extend_from_slice(body_sig);
    let sig = data_key.sign(&out[..data_size]);
    out.extend_from_slice(&sig);
    out
}

/// Assemble and sign a kernel preamble:
/// `[header][body signature][preamble signature]`.
pub fn build_kernel_preamble(
    data_key: &TestSigner,
    kernel_version: u64,
    body_load_address: u64,
    body_sig: &[u8],
    body: &[u8],
) -> Vec<u8> {
    let header_size = size_of::<KernelPreambleHeader>();
    let data_size = header_size + body_sig.len();
    let sig_size = data_key.sig_size();

    let header = KernelPreambleHeader {
        preamble_size: (data_size + sig_size) as u64,
        preamble_signature: ImageSignature {
            sig_offset: (data_size - KernelPreambleHeader::signature_offset()) as u64,
            sig_size: sig_size as u64,
            data_size: data_size as u64,
        },
        header_version_major: KERNEL_PREAMBLE_HEADER_VERSION_MAJOR,
        header_version_minor: KERNEL_PREAMBLE_HEADER_VERSION_MINOR,
        kernel_version,
        body_load_address,
        bootloader_address: body_load_address + 0x1000,
        bootloader_size: 0x1000,
        body_signature: ImageSignature {
            sig_offset: (header_size - KernelPreambleHeader::body_signature_offset()) as u64,
            sig_size: body_sig.len() as u64,
            data_size: body.len() as u64,
        },
    };

    let mut out = Vec::new();
    out.extend_from_slice(header.as_bytes());
    out.extend_from_slice(body_sig);
    let sig = data_key.sign(&out[..data_size]);
    out.extend_from_slice(&sig);
    out
}

/// Assemble a GBB region: header, then the packed root and recovery
/// keys.
pub fn build_gbb(root_packed: &[u8], recovery_packed: &[u8], flags: u32) -> Vec<u8> {
    let header_size = size_of::<GbbHeader>();
    let mut header = GbbHeader {
        major_version: vaultboot_image_types::GBB_MAJOR_VER,
        minor_version: vaultboot_image_types::GBB_MINOR_VER,
        header_size: header_size as u32,
        rootkey_offset: header_size as u32,
        rootkey_size: root_packed.len() as u32,
        recovery_key_offset: (header_size + root_packed.len()) as u32,
        recovery_key_size: recovery_packed.len() as u32,
        flags,
        ..Default::default()
    };
    header.set_signature();

    let mut out = Vec::new();
    out.extend_from_slice(header.as_bytes());
    out.extend_from_slice(root_packed);
    out.extend_from_slice(recovery_packed);
    out
}
