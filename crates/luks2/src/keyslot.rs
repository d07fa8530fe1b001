// SPDX-FileCopyrightText: Copyright © 2025 Serpent OS Developers
//
// SPDX-License-Identifier: MPL-2.0

//! Keyslot unlocking
//!
//! A passphrase keyslot is opened in five steps:
//!
//! 1. stretch the passphrase with the slot's KDF into an area key
//! 2. read the encrypted AF material from the slot's binary area
//! 3. decrypt it with the area cipher
//! 4. AF-merge the stripes into a candidate volume key
//! 5. check the candidate against the digest bound to the slot
//!
//! Only step 5 can tell a right passphrase from a wrong one.

use std::{
    fmt,
    io::{Read, Seek, SeekFrom},
};

use log::debug;
use subtle::ConstantTimeEq;
use zeroize::{Zeroize, ZeroizeOnDrop, Zeroizing};

use crate::{
    af,
    cipher::CipherProvider,
    hash::HashAlgorithm,
    kdf,
    metadata::{Digest, Keyslot, Metadata},
    Error,
};

/// Digest type used by every LUKS2 writer
const DIGEST_TYPE_PBKDF2: &str = "pbkdf2";

/// A verified volume master key
///
/// The bytes are wiped when the key is dropped and never printed by `Debug`.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct MasterKey(Vec<u8>);

impl MasterKey {
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Debug for MasterKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "MasterKey([REDACTED; {}])", self.0.len())
    }
}

impl PartialEq for MasterKey {
    fn eq(&self, other: &Self) -> bool {
        self.0.ct_eq(&other.0).into()
    }
}

impl Eq for MasterKey {}

impl AsRef<[u8]> for MasterKey {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

/// Check `candidate` against `digest`
fn verify(candidate: &[u8], digest: &Digest) -> Result<bool, Error> {
    if digest.digest_type != DIGEST_TYPE_PBKDF2 {
        return Err(Error::MetadataInconsistent(format!(
            "unsupported digest type {:?}",
            digest.digest_type
        )));
    }
    if digest.iterations == 0 || digest.digest.is_empty() {
        return Err(Error::MetadataInconsistent("digest has no iterations or no bytes".into()));
    }
    let hash = HashAlgorithm::from_name(&digest.hash)?;
    let mut computed = Zeroizing::new(vec![0u8; digest.digest.len()]);
    hash.pbkdf2(candidate, &digest.salt, digest.iterations, &mut computed)?;
    Ok(computed.ct_eq(&digest.digest).into())
}

/// Read the encrypted AF material of `keyslot`, whole sectors only
fn read_area<R: Read + Seek>(source: &mut R, keyslot: &Keyslot, len: u64) -> Result<Zeroizing<Vec<u8>>, Error> {
    let len = usize::try_from(len)
        .map_err(|_| Error::MetadataInconsistent(format!("keyslot area of {len} bytes is too large")))?;
    let mut area = Zeroizing::new(vec![0u8; len]);
    source.seek(SeekFrom::Start(keyslot.area.offset))?;
    source.read_exact(&mut area)?;
    Ok(area)
}

/// Recover and verify the volume key held in keyslot `slot`
pub(crate) fn unlock<R: Read + Seek>(
    source: &mut R,
    metadata: &Metadata,
    slot: u32,
    password: &[u8],
    provider: &dyn CipherProvider,
) -> Result<MasterKey, Error> {
    let keyslot = metadata.keyslots.get(&slot).ok_or(Error::SlotNotFound(slot))?;
    if !keyslot.is_unlockable() {
        return Err(Error::UnsupportedSlotType {
            slot,
            kind: keyslot.slot_type.clone(),
        });
    }

    // Presence of these is checked when the metadata is loaded
    let missing = || Error::MetadataInconsistent(format!("keyslot {slot} is incomplete"));
    let kdf_params = keyslot.kdf.as_ref().ok_or_else(missing)?;
    let af_params = keyslot.af.as_ref().ok_or_else(missing)?;
    let cipher = keyslot.area.encryption.as_deref().ok_or_else(missing)?;
    let area_key_size = keyslot.area.key_size.ok_or_else(missing)?;

    let (digest_id, digest) = metadata
        .digest_for_keyslot(slot)
        .ok_or_else(|| Error::MetadataInconsistent(format!("no digest covers keyslot {slot}")))?;
    let af_hash = HashAlgorithm::from_name(&af_params.hash)?;

    debug!("keyslot {slot}: deriving area key ({})", kdf_params.kdf_type);
    let area_key = kdf::derive(password, kdf_params, area_key_size as usize)?;

    let key_size = keyslot.key_size as usize;
    let stripes = af_params.stripes as usize;
    let mut material = read_area(source, keyslot, af_params.sector_rounded_len(keyslot.key_size))?;

    debug!("keyslot {slot}: decrypting {} bytes with {cipher}", material.len());
    provider.decrypt(cipher, &area_key, 0, &mut material)?;

    let striped_len = stripes * key_size;
    let candidate = af::merge(&material[..striped_len], stripes, key_size, af_hash)?;

    debug!("keyslot {slot}: verifying against digest {digest_id}");
    if !verify(&candidate, digest)? {
        return Err(Error::WrongPassword);
    }

    debug!("keyslot {slot}: unlocked");
    Ok(MasterKey(candidate.to_vec()))
}
