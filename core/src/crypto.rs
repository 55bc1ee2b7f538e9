/*++

Licensed under the Apache-2.0 license.

File Name:

    crypto.rs

Abstract:

    File contains the digest engine and the RSA digest verifier. Hash
    primitives come from the RustCrypto crates; each algorithm can be
    compiled out via a cargo feature. The verifier destroys the
    signature bytes it is handed: every signature is checked at most
    once per boot.

--*/

use rsa::{BigUint, Pkcs1v15Sign, RsaPublicKey};
use sha2::Digest;
use vaultboot_error::{VaultbootError, VaultbootResult};
use vaultboot_image_types::HashAlg;
use zeroize::Zeroize;

use crate::key::PublicKey;

/// Largest digest any supported algorithm produces (SHA-512).
pub const MAX_DIGEST_SIZE: usize = 64;

/// Largest supported RSA signature / modulus (RSA-8192).
pub const MAX_SIG_SIZE: usize = 1024;

/// PKCS#1 v1.5 DigestInfo prefixes (RFC 8017).
const SHA1_DIGEST_INFO: [u8; 15] = [
    0x30, 0x21, 0x30, 0x09, 0x06, 0x05, 0x2b, 0x0e, 0x03, 0x02, 0x1a, 0x05, 0x00, 0x04, 0x14,
];
const SHA256_DIGEST_INFO: [u8; 19] = [
    0x30, 0x31, 0x30, 0x0d, 0x06, 0x09, 0x60, 0x86, 0x48, 0x01, 0x65, 0x03, 0x04, 0x02, 0x01,
    0x05, 0x00, 0x04, 0x20,
];
const SHA512_DIGEST_INFO: [u8; 19] = [
    0x30, 0x51, 0x30, 0x0d, 0x06, 0x09, 0x60, 0x86, 0x48, 0x01, 0x65, 0x03, 0x04, 0x02, 0x03,
    0x05, 0x00, 0x04, 0x40,
];

/// A hash in flight. Supports the init / extend / finalize interface
/// used for both in-place structure digests and the streamed firmware
/// body.
pub enum DigestContext {
    #[cfg(feature = "sha1")]
    Sha1(sha1::Sha1),
    #[cfg(feature = "sha256")]
    Sha256(sha2::Sha256),
    #[cfg(feature = "sha512")]
    Sha512(sha2::Sha512),
}

impl DigestContext {
    pub fn new(alg: HashAlg) -> VaultbootResult<DigestContext> {
        match alg {
            #[cfg(feature = "sha1")]
            HashAlg::Sha1 => Ok(DigestContext::Sha1(sha1::Sha1::new())),
            #[cfg(feature = "sha256")]
            HashAlg::Sha256 => Ok(DigestContext::Sha256(sha2::Sha256::new())),
            #[cfg(feature = "sha512")]
            HashAlg::Sha512 => Ok(DigestContext::Sha512(sha2::Sha512::new())),
            #[allow(unreachable_patterns)]
            _ => Err(VaultbootError::SHA_UNSUPPORTED),
        }
    }

    pub fn alg(&self) -> HashAlg {
        match self {
            #[cfg(feature = "sha1")]
            DigestContext::Sha1(_) => HashAlg::Sha1,
            #[cfg(feature = "sha256")]
            DigestContext::Sha256(_) => HashAlg::Sha256,
            #[cfg(feature = "sha512")]
            DigestContext::Sha512(_) => HashAlg::Sha512,
        }
    }

    pub fn update(&mut self, data: &[u8]) {
        match self {
            #[cfg(feature = "sha1")]
            DigestContext::Sha1(d) => d.update(data),
            #[cfg(feature = "sha256")]
            DigestContext::Sha256(d) => d.update(data),
            #[cfg(feature = "sha512")]
            DigestContext::Sha512(d) => d.update(data),
        }
    }

    /// Write the digest into `out` and return its size.
    pub fn finalize(self, out: &mut [u8]) -> VaultbootResult<usize> {
        let size = self.alg().digest_size();
        if out.len() < size {
            return Err(VaultbootError::VERIFY_DIGEST_SIZE);
        }
        match self {
            #[cfg(feature = "sha1")]
            DigestContext::Sha1(d) => out[..size].copy_from_slice(&d.finalize()),
            #[cfg(feature = "sha256")]
            DigestContext::Sha256(d) => out[..size].copy_from_slice(&d.finalize()),
            #[cfg(feature = "sha512")]
            DigestContext::Sha512(d) => out[..size].copy_from_slice(&d.finalize()),
        }
        Ok(size)
    }
}

/// One-shot digest of a buffer.
pub fn digest_buffer(alg: HashAlg, data: &[u8], out: &mut [u8]) -> VaultbootResult<usize> {
    let mut dc = DigestContext::new(alg)?;
    dc.update(data);
    dc.finalize(out)
}

/// PKCS#1 v1.5 scheme for an algorithm, with the DigestInfo prefix
/// spelled out so verification never depends on which hash features are
/// compiled in.
pub(crate) fn pkcs1v15_scheme(alg: HashAlg) -> Pkcs1v15Sign {
    let (prefix, hash_len): (&[u8], usize) = match alg {
        HashAlg::Sha1 => (&SHA1_DIGEST_INFO, 20),
        HashAlg::Sha256 => (&SHA256_DIGEST_INFO, 32),
        HashAlg::Sha512 => (&SHA512_DIGEST_INFO, 64),
    };
    Pkcs1v15Sign {
        hash_len: Some(hash_len),
        prefix: prefix.into(),
    }
}

/// Verify `digest` against an RSA signature.
///
/// The signature bytes are clobbered before the math runs: a signature
/// is consumed by its one verification, pass or fail.
pub fn verify_digest(key: &PublicKey, sig: &mut [u8], digest: &[u8]) -> VaultbootResult<()> {
    if sig.len() != key.sig_size() {
        return Err(VaultbootError::SIG_SIZE);
    }
    if digest.len() != key.hash_alg.digest_size() {
        return Err(VaultbootError::VERIFY_DIGEST_SIZE);
    }

    let mut sig_copy = [0u8; MAX_SIG_SIZE];
    let sig_len = sig.len();
    sig_copy[..sig_len].copy_from_slice(sig);
    sig.zeroize();

    let n = BigUint::from_bytes_le(key.n);
    let e = BigUint::from(65537u32);
    let rsa_key = RsaPublicKey::new_with_max_size(n, e, MAX_SIG_SIZE)
        .map_err(|_| VaultbootError::RSA_VERIFY_FAILED)?;

    rsa_key
        .verify(pkcs1v15_scheme(key.hash_alg), digest, &sig_copy[..sig_len])
        .map_err(|_| VaultbootError::RSA_VERIFY_FAILED)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::key::unpack_key;
    use crate::testutil::TestSigner;
    use vaultboot_image_types::CryptoAlg;

    #[test]
    fn test_sha256_vector() {
        let mut out = [0u8; MAX_DIGEST_SIZE];
        let n = digest_buffer(HashAlg::Sha256, b"abc", &mut out).unwrap();
        assert_eq!(n, 32);
        assert_eq!(
            out[..4],
            [0xba, 0x78, 0x16, 0xbf],
            "sha256(abc) leading bytes"
        );
    }

    #[test]
    fn test_sha1_vector() {
        let mut out = [0u8; MAX_DIGEST_SIZE];
        let n = digest_buffer(HashAlg::Sha1, b"abc", &mut out).unwrap();
        assert_eq!(n, 20);
        assert_eq!(out[..4], [0xa9, 0x99, 0x3e, 0x36]);
    }

    #[test]
    fn test_extend_matches_oneshot() {
        let mut one = [0u8; MAX_DIGEST_SIZE];
        digest_buffer(HashAlg::Sha512, b"hello world", &mut one).unwrap();

        let mut dc = DigestContext::new(HashAlg::Sha512).unwrap();
        dc.update(b"hello ");
        dc.update(b"world");
        let mut two = [0u8; MAX_DIGEST_SIZE];
        let n = dc.finalize(&mut two).unwrap();
        assert_eq!(n, 64);
        assert_eq!(one, two);
    }

    #[test]
    fn test_finalize_short_buffer() {
        let dc = DigestContext::new(HashAlg::Sha256).unwrap();
        let mut out = [0u8; 16];
        assert_eq!(
            dc.finalize(&mut out).err(),
            Some(VaultbootError::VERIFY_DIGEST_SIZE)
        );
    }

    #[test]
    fn test_verify_digest_roundtrip_and_destroy() {
        let signer = TestSigner::generate(CryptoAlg::Rsa2048Sha256);
        let packed = signer.pack_key(1);
        let key = unpack_key(&packed).unwrap();

        let mut digest = [0u8; 32];
        digest_buffer(HashAlg::Sha256, b"payload", &mut digest).unwrap();
        let mut sig = signer.sign(b"payload");
        let sig_before = sig.clone();

        verify_digest(&key, &mut sig, &digest).unwrap();
        assert_ne!(sig, sig_before, "signature must be destroyed on use");
        assert!(sig.iter().all(|&b| b == 0));
    }

    #[test]
    fn test_verify_digest_rejects_bad_digest() {
        let signer = TestSigner::generate(CryptoAlg::Rsa2048Sha256);
        let packed = signer.pack_key(1);
        let key = unpack_key(&packed).unwrap();

        let mut digest = [0u8; 32];
        digest_buffer(HashAlg::Sha256, b"payload", &mut digest).unwrap();
        digest[0] ^= 1;
        let mut sig = signer.sign(b"payload");
        assert_eq!(
            verify_digest(&key, &mut sig, &digest).err(),
            Some(VaultbootError::RSA_VERIFY_FAILED)
        );
        // Destroyed even though verification failed.
        assert!(sig.iter().all(|&b| b == 0));
    }

    #[test]
    fn test_verify_digest_sig_size_mismatch() {
        let signer = TestSigner::generate(CryptoAlg::Rsa2048Sha256);
        let packed = signer.pack_key(1);
        let key = unpack_key(&packed).unwrap();
        let digest = [0u8; 32];
        let mut sig = [0u8; 128];
        assert_eq!(
            verify_digest(&key, &mut sig, &digest).err(),
            Some(VaultbootError::SIG_SIZE)
        );
    }
}
