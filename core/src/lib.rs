/*++

Licensed under the Apache-2.0 license.

File Name:

    lib.rs

Abstract:

    Verified-boot runtime core. Drives the chain of trust from immutable
    read-only code to a verified operating-system kernel: image
    verification against a device-rooted key, monotonic rollback
    protection over tamper-evident storage, redundant-slot selection with
    bounded retries, EC software sync, and boot-path dispatch. All
    scratch state lives in a single caller-provided workbuf; the core
    performs no dynamic allocation.

--*/
#![cfg_attr(not(feature = "std"), no_std)]

#[macro_use]
pub mod printer;

pub mod context;
pub mod crc8;
pub mod crypto;
pub mod dispatch;
pub mod ec_sync;
pub mod env;
pub mod firmware;
pub mod gbb;
pub mod kernel;
pub mod key;
pub mod misc;
pub mod nvdata;
pub mod secdata;
pub mod verify;
pub mod workbuf;

#[cfg(test)]
pub(crate) mod testutil;

pub use context::{Context, ContextFlags, FwResult, SdFlags, SdStatus, SharedData, Slot};
pub use env::{BootEnv, DiskSet, FwSelect, Resource};
pub use misc::recovery_reason;
pub use vaultboot_error::{VaultbootError, VaultbootResult};
pub use vaultboot_image_types as image_types;
