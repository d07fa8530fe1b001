// SPDX-FileCopyrightText: Copyright © 2025 Serpent OS Developers
//
// SPDX-License-Identifier: MPL-2.0

//! Passphrase key derivation
//!
//! Backends are looked up by the keyslot's `kdf.type` in a fixed table. A backend validates the
//! parameters it needs and never retries: whatever the primitive rejects is reported as
//! [`Error::InvalidKdfParams`].

use argon2::{Algorithm, Argon2, Params, Version};
use log::debug;
use zeroize::Zeroizing;

use crate::{hash::HashAlgorithm, metadata::Kdf, Error};

/// Signature shared by every backend: password, parameters, output length
type DeriveFn = fn(&[u8], &Kdf, usize) -> Result<Zeroizing<Vec<u8>>, Error>;

/// Registered backends, keyed by LUKS2 kdf type name
const BACKENDS: &[(&str, DeriveFn)] = &[
    ("pbkdf2", derive_pbkdf2),
    ("argon2i", derive_argon2i),
    ("argon2id", derive_argon2id),
];

/// Stretch `password` into `key_len` bytes as described by `kdf`
pub fn derive(password: &[u8], kdf: &Kdf, key_len: usize) -> Result<Zeroizing<Vec<u8>>, Error> {
    let (name, backend) = BACKENDS
        .iter()
        .find(|(name, _)| *name == kdf.kdf_type)
        .ok_or_else(|| {
            Error::InvalidKdfParams(format!(
                "unknown kdf type {:?}, expected one of {}",
                kdf.kdf_type,
                supported().collect::<Vec<_>>().join(", ")
            ))
        })?;
    debug!("deriving {key_len} byte key with {name}");
    backend(password, kdf, key_len)
}

/// Names of the supported kdf types
pub fn supported() -> impl Iterator<Item = &'static str> {
    BACKENDS.iter().map(|(name, _)| *name)
}

fn require(value: Option<u32>, kdf: &Kdf, field: &str) -> Result<u32, Error> {
    value.ok_or_else(|| Error::InvalidKdfParams(format!("{} kdf is missing {field}", kdf.kdf_type)))
}

fn derive_pbkdf2(password: &[u8], kdf: &Kdf, key_len: usize) -> Result<Zeroizing<Vec<u8>>, Error> {
    let hash = kdf
        .hash
        .as_deref()
        .ok_or_else(|| Error::InvalidKdfParams("pbkdf2 kdf is missing hash".into()))?;
    let hash = HashAlgorithm::from_name(hash)?;
    let iterations = require(kdf.iterations, kdf, "iterations")?;
    if iterations == 0 {
        return Err(Error::InvalidKdfParams("pbkdf2 iterations must be non-zero".into()));
    }

    let mut out = Zeroizing::new(vec![0u8; key_len]);
    hash.pbkdf2(password, &kdf.salt, iterations, &mut out)?;
    Ok(out)
}

fn derive_argon2(
    algorithm: Algorithm,
    password: &[u8],
    kdf: &Kdf,
    key_len: usize,
) -> Result<Zeroizing<Vec<u8>>, Error> {
    let time = require(kdf.time, kdf, "time")?;
    let memory = require(kdf.memory, kdf, "memory")?;
    let cpus = require(kdf.cpus, kdf, "cpus")?;

    let params = Params::new(memory, time, cpus, Some(key_len))
        .map_err(|e| Error::InvalidKdfParams(format!("{}: {e}", kdf.kdf_type)))?;
    let argon = Argon2::new(algorithm, Version::V0x13, params);

    let mut out = Zeroizing::new(vec![0u8; key_len]);
    argon
        .hash_password_into(password, &kdf.salt, &mut out)
        .map_err(|e| Error::InvalidKdfParams(format!("{}: {e}", kdf.kdf_type)))?;
    Ok(out)
}

fn derive_argon2i(password: &[u8], kdf: &Kdf, key_len: usize) -> Result<Zeroizing<Vec<u8>>, Error> {
    derive_argon2(Algorithm::Argon2i, password, kdf, key_len)
}

fn derive_argon2id(password: &[u8], kdf: &Kdf, key_len: usize) -> Result<Zeroizing<Vec<u8>>, Error> {
    derive_argon2(Algorithm::Argon2id, password, kdf, key_len)
}
