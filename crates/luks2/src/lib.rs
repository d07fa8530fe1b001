// SPDX-FileCopyrightText: Copyright © 2025 Serpent OS Developers
//
// SPDX-License-Identifier: MPL-2.0

//! Read-only LUKS2 support
//!
//! This crate reads the binary header and JSON metadata of a LUKS2 (Linux Unified Key Setup 2)
//! encrypted block device, enumerates its keyslots and tokens, and recovers the volume master key
//! from a passphrase.
//!
//! Nothing is ever written back to the device: there is no support for formatting, adding keys or
//! re-encryption, and LUKS1 headers are rejected.
//!
//! ```no_run
//! let mut device = luks2::open("/dev/sda2")?;
//! println!("UUID={}", device.uuid());
//! for slot in device.slots() {
//!     println!("keyslot {slot}");
//! }
//! let key = device.decrypt_keyslot(0, b"hunter2")?;
//! assert_eq!(key.len(), 64);
//! # Ok::<(), luks2::Error>(())
//! ```

use std::{fs::File, io, path::Path};

use thiserror::Error;

pub mod af;
pub mod cipher;
pub mod device;
pub mod hash;
pub mod header;
pub mod kdf;
pub mod keyslot;
pub mod metadata;
pub mod token;

#[cfg(test)]
mod fixture;

pub use cipher::{CipherProvider, XtsPlain64};
pub use device::{Device, Volume};
pub use hash::HashAlgorithm;
pub use header::Header;
pub use keyslot::MasterKey;
pub use metadata::Metadata;
pub use token::{Token, TokenData, TokenType};

/// Errors that can occur while reading or unlocking a LUKS2 device
#[derive(Debug, Error)]
pub enum Error {
    /// Neither the primary nor the secondary header copy is valid
    #[error("no valid LUKS2 header found")]
    HeaderCorrupt,

    /// The JSON metadata area could not be decoded
    #[error("corrupt metadata: {0}")]
    MetadataCorrupt(#[from] serde_json::Error),

    /// The metadata decoded but breaks a structural rule
    #[error("inconsistent metadata: {0}")]
    MetadataInconsistent(String),

    /// The key derivation function rejected its parameters
    #[error("invalid kdf parameters: {0}")]
    InvalidKdfParams(String),

    /// No keyslot exists with the requested index
    #[error("keyslot {0} not found")]
    SlotNotFound(u32),

    /// The keyslot cannot be unlocked with a passphrase
    #[error("keyslot {slot} has unsupported type {kind:?}")]
    UnsupportedSlotType { slot: u32, kind: String },

    /// The passphrase did not produce a key matching the stored digest
    #[error("wrong password")]
    WrongPassword,

    /// A hash algorithm named in the header or metadata is not available
    #[error("unsupported hash: {0}")]
    UnsupportedHash(String),

    /// The cipher provider cannot handle the requested algorithm or key size
    #[error("unsupported cipher: {0}")]
    UnsupportedCipher(String),

    /// The volume declares a mandatory requirement this crate does not implement
    #[error("unmet mandatory requirement: {0}")]
    UnmetRequirement(String),

    /// An I/O error occurred
    #[error("io: {0}")]
    IO(#[from] io::Error),
}

/// Open the LUKS2 device or image at `path`
///
/// The file is opened read-only and kept open for later keyslot area reads.
pub fn open<P: AsRef<Path>>(path: P) -> Result<Device<File>, Error> {
    let path = path.as_ref();
    let file = File::open(path)?;
    Device::open(path, file)
}
