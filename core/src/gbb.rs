/*++

Licensed under the Apache-2.0 license.

File Name:

    gbb.rs

Abstract:

    File contains the GBB loader: header validation against the
    scrambled magic and version window, pinning the header in the
    workbuf, and extraction of the packed recovery key.

--*/

use core::mem::size_of;

use vaultboot_error::{VaultbootError, VaultbootResult};
use vaultboot_image_types::{
    GbbFlags, GbbHeader, PackedKey, GBB_MAJOR_VER, GBB_MINOR_VER,
};
use zerocopy::FromBytes;

use crate::context::{Context, ContextFlags, SdStatus};
use crate::env::{BootEnv, Resource};
use crate::key::unpack_key;

/// Validate a GBB header.
pub fn validate_gbb_header(gbb: &GbbHeader) -> VaultbootResult<()> {
    if !gbb.signature_valid() {
        return Err(VaultbootError::GBB_MAGIC);
    }
    if gbb.major_version != GBB_MAJOR_VER {
        return Err(VaultbootError::GBB_MAJOR_VERSION);
    }
    // Not backwards-compatible with older minor versions.
    if gbb.minor_version < GBB_MINOR_VER {
        return Err(VaultbootError::GBB_MINOR_VERSION);
    }
    // The header may have grown, but never shrunk.
    if (gbb.header_size as usize) < size_of::<GbbHeader>() {
        return Err(VaultbootError::GBB_HEADER_SIZE);
    }
    Ok(())
}

/// Read the GBB header into the workbuf, validate it, and pin it for
/// the rest of the boot. Context flags that mirror GBB flags are set
/// here.
pub fn init_gbb(ctx: &mut Context, env: &mut dyn BootEnv) -> VaultbootResult<()> {
    let mut wb = ctx.workbuf();
    let offset = wb
        .alloc(size_of::<GbbHeader>())
        .ok_or(VaultbootError::GBB_WORKBUF)?;

    env.read_resource(
        Resource::Gbb,
        0,
        ctx.workbuf_slice_mut(offset, size_of::<GbbHeader>())?,
    )?;

    let gbb = GbbHeader::read_from_prefix(ctx.workbuf_slice(offset, size_of::<GbbHeader>())?)
        .ok_or(VaultbootError::GBB_WORKBUF)?;
    validate_gbb_header(&gbb)?;

    ctx.sd.gbb_offset = offset as u32;
    ctx.sd.status |= SdStatus::GBB_INIT;
    ctx.set_workbuf_used(wb.cursor())?;

    if gbb.gbb_flags().contains(GbbFlags::DISABLE_FWMP) {
        ctx.flags |= ContextFlags::NO_SECDATA_FWMP;
    }

    Ok(())
}

/// Read the GBB recovery key into the workbuf and validate it. Returns
/// the workbuf offset and total size of the packed key. The caller pins
/// it.
pub fn read_recovery_key(ctx: &mut Context, env: &mut dyn BootEnv) -> VaultbootResult<(u32, u32)> {
    let gbb = ctx.gbb()?;

    let mut wb = ctx.workbuf();
    let header_size = size_of::<PackedKey>();
    let offset = wb
        .alloc(header_size)
        .ok_or(VaultbootError::GBB_RECOVERY_KEY_WORKBUF)?;
    env.read_resource(
        Resource::Gbb,
        gbb.recovery_key_offset,
        ctx.workbuf_slice_mut(offset, header_size)?,
    )?;

    let packed = PackedKey::read_from_prefix(ctx.workbuf_slice(offset, header_size)?)
        .ok_or(VaultbootError::GBB_RECOVERY_KEY_SIZE)?;
    let total = packed
        .packed_size()
        .ok_or(VaultbootError::GBB_RECOVERY_KEY_SIZE)?;
    if total < header_size as u64 || total > gbb.recovery_key_size as u64 {
        return Err(VaultbootError::GBB_RECOVERY_KEY_SIZE);
    }
    let total = total as usize;

    // Now that the real size is known, fetch the whole packed key.
    let offset = wb
        .realloc(offset, header_size, total)
        .ok_or(VaultbootError::GBB_RECOVERY_KEY_WORKBUF)?;
    env.read_resource(
        Resource::Gbb,
        gbb.recovery_key_offset,
        ctx.workbuf_slice_mut(offset, total)?,
    )?;

    unpack_key(ctx.workbuf_slice(offset, total)?)?;

    Ok((offset as u32, total as u32))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::{build_gbb, TestSigner};
    use vaultboot_image_types::CryptoAlg;
    use zerocopy::AsBytes;

    struct GbbEnv {
        gbb: Vec<u8>,
    }

    impl BootEnv for GbbEnv {
        fn read_resource(
            &mut self,
            index: Resource,
            offset: u32,
            buf: &mut [u8],
        ) -> VaultbootResult<()> {
            if index != Resource::Gbb {
                return Err(VaultbootError::READ_RESOURCE_INDEX);
            }
            let offset = offset as usize;
            let end = offset + buf.len();
            if end > self.gbb.len() {
                return Err(VaultbootError::READ_RESOURCE_SIZE);
            }
            buf.copy_from_slice(&self.gbb[offset..end]);
            Ok(())
        }
    }

    fn env_with_keys() -> GbbEnv {
        let root = TestSigner::generate(CryptoAlg::Rsa2048Sha256);
        let recovery = TestSigner::generate(CryptoAlg::Rsa2048Sha256);
        GbbEnv {
            gbb: build_gbb(&root.pack_key(1), &recovery.pack_key(1), 0),
        }
    }

    #[test]
    fn test_init_gbb_pins_header() {
        let mut env = env_with_keys();
        let mut buf = [0u8; 4096];
        let mut ctx = Context::init(&mut buf).unwrap();

        init_gbb(&mut ctx, &mut env).unwrap();
        assert!(ctx.sd.status.contains(SdStatus::GBB_INIT));
        assert!(ctx.workbuf_used() >= size_of::<GbbHeader>());

        let gbb = ctx.gbb().unwrap();
        assert_eq!(gbb.major_version, GBB_MAJOR_VER);
    }

    #[test]
    fn test_init_gbb_bad_magic() {
        let mut env = env_with_keys();
        env.gbb[0] ^= 0xff;
        let mut buf = [0u8; 4096];
        let mut ctx = Context::init(&mut buf).unwrap();
        assert_eq!(
            init_gbb(&mut ctx, &mut env).err(),
            Some(VaultbootError::GBB_MAGIC)
        );
    }

    #[test]
    fn test_init_gbb_version_window() {
        let mut env = env_with_keys();
        let mut header = GbbHeader::read_from_prefix(&env.gbb[..]).unwrap();
        header.minor_version = GBB_MINOR_VER - 1;
        env.gbb[..size_of::<GbbHeader>()].copy_from_slice(header.as_bytes());
        let mut buf = [0u8; 4096];
        let mut ctx = Context::init(&mut buf).unwrap();
        assert_eq!(
            init_gbb(&mut ctx, &mut env).err(),
            Some(VaultbootError::GBB_MINOR_VERSION)
        );
    }

    #[test]
    fn test_init_gbb_header_size() {
        let mut env = env_with_keys();
        let mut header = GbbHeader::read_from_prefix(&env.gbb[..]).unwrap();
        header.header_size = 16;
        env.gbb[..size_of::<GbbHeader>()].copy_from_slice(header.as_bytes());
        let mut buf = [0u8; 4096];
        let mut ctx = Context::init(&mut buf).unwrap();
        assert_eq!(
            init_gbb(&mut ctx, &mut env).err(),
            Some(VaultbootError::GBB_HEADER_SIZE)
        );
    }

    #[test]
    fn test_disable_fwmp_flag_propagates() {
        let root = TestSigner::generate(CryptoAlg::Rsa2048Sha256);
        let recovery = TestSigner::generate(CryptoAlg::Rsa2048Sha256);
        let mut env = GbbEnv {
            gbb: build_gbb(
                &root.pack_key(1),
                &recovery.pack_key(1),
                GbbFlags::DISABLE_FWMP.bits(),
            ),
        };
        let mut buf = [0u8; 4096];
        let mut ctx = Context::init(&mut buf).unwrap();
        init_gbb(&mut ctx, &mut env).unwrap();
        assert!(ctx.flags.contains(ContextFlags::NO_SECDATA_FWMP));
    }

    #[test]
    fn test_read_recovery_key() {
        let mut env = env_with_keys();
        let mut buf = [0u8; 8192];
        let mut ctx = Context::init(&mut buf).unwrap();
        init_gbb(&mut ctx, &mut env).unwrap();

        let (offset, size) = read_recovery_key(&mut ctx, &mut env).unwrap();
        let key_bytes = ctx.workbuf_slice(offset as usize, size as usize).unwrap();
        let key = unpack_key(key_bytes).unwrap();
        assert_eq!(key.algorithm, CryptoAlg::Rsa2048Sha256);
    }

    #[test]
    fn test_read_recovery_key_oversize_claim() {
        let mut env = env_with_keys();
        // Claim the key extends past the field the GBB reserves for it.
        let gbb_hdr = GbbHeader::read_from_prefix(&env.gbb[..]).unwrap();
        let rec_off = gbb_hdr.recovery_key_offset as usize;
        let mut packed = PackedKey::read_from_prefix(&env.gbb[rec_off..]).unwrap();
        packed.key_size = gbb_hdr.recovery_key_size as u64 + 1;
        env.gbb[rec_off..rec_off + size_of::<PackedKey>()].copy_from_slice(packed.as_bytes());

        let mut buf = [0u8; 8192];
        let mut ctx = Context::init(&mut buf).unwrap();
        init_gbb(&mut ctx, &mut env).unwrap();
        assert_eq!(
            read_recovery_key(&mut ctx, &mut env).err(),
            Some(VaultbootError::GBB_RECOVERY_KEY_SIZE)
        );
    }
}
