// SPDX-FileCopyrightText: Copyright © 2025 Serpent OS Developers
//
// SPDX-License-Identifier: MPL-2.0

//! Keyslot area decryption
//!
//! The unlock engine hands the encrypted keyslot area to a [`CipherProvider`]. [`XtsPlain64`]
//! covers `aes-xts-plain64`, which is what cryptsetup uses for keyslot areas unless told
//! otherwise; callers needing other ciphers can supply their own provider.

use aes::{cipher::KeyInit, Aes128, Aes256};
use xts_mode::{get_tweak_default, Xts128};

use crate::Error;

/// Sector size for keyslot area IVs
pub const SECTOR_SIZE: usize = 512;

/// Block cipher primitive used to decrypt keyslot material
pub trait CipherProvider {
    /// Decrypt `data` in place
    ///
    /// `cipher` is the dm-crypt style algorithm name (`aes-xts-plain64`), `key` the raw key and
    /// `sector` the IV of the first 512-byte sector in `data`. `data` is a whole number of sectors.
    fn decrypt(&self, cipher: &str, key: &[u8], sector: u64, data: &mut [u8]) -> Result<(), Error>;
}

/// AES in XTS mode with a 64-bit little-endian sector number as tweak
#[derive(Debug, Default, Clone, Copy)]
pub struct XtsPlain64;

impl XtsPlain64 {
    /// Whether `cipher` names a mode this provider implements
    pub fn supports(cipher: &str) -> bool {
        matches!(cipher, "aes-xts-plain64" | "aes-xts-plain")
    }
}

/// XTS keyed for AES-128 or AES-256, chosen by the combined key length
enum Xts {
    Aes128(Xts128<Aes128>),
    Aes256(Xts128<Aes256>),
}

impl Xts {
    fn new(key: &[u8]) -> Result<Self, Error> {
        let (k1, k2) = key.split_at(key.len() / 2);
        let bad_key = |_| Error::UnsupportedCipher(format!("xts with {} byte key", key.len()));
        match key.len() {
            32 => Ok(Self::Aes128(Xts128::<Aes128>::new(
                Aes128::new_from_slice(k1).map_err(bad_key)?,
                Aes128::new_from_slice(k2).map_err(bad_key)?,
            ))),
            64 => Ok(Self::Aes256(Xts128::<Aes256>::new(
                Aes256::new_from_slice(k1).map_err(bad_key)?,
                Aes256::new_from_slice(k2).map_err(bad_key)?,
            ))),
            n => Err(Error::UnsupportedCipher(format!("xts with {n} byte key"))),
        }
    }

    fn decrypt_area(&self, data: &mut [u8], sector: u64) {
        match self {
            Self::Aes128(xts) => xts.decrypt_area(data, SECTOR_SIZE, u128::from(sector), get_tweak_default),
            Self::Aes256(xts) => xts.decrypt_area(data, SECTOR_SIZE, u128::from(sector), get_tweak_default),
        }
    }

    #[cfg(test)]
    fn encrypt_area(&self, data: &mut [u8], sector: u64) {
        match self {
            Self::Aes128(xts) => xts.encrypt_area(data, SECTOR_SIZE, u128::from(sector), get_tweak_default),
            Self::Aes256(xts) => xts.encrypt_area(data, SECTOR_SIZE, u128::from(sector), get_tweak_default),
        }
    }
}

impl CipherProvider for XtsPlain64 {
    fn decrypt(&self, cipher: &str, key: &[u8], sector: u64, data: &mut [u8]) -> Result<(), Error> {
        if !Self::supports(cipher) {
            return Err(Error::UnsupportedCipher(cipher.to_owned()));
        }
        if data.len() % SECTOR_SIZE != 0 {
            return Err(Error::UnsupportedCipher(format!(
                "{cipher}: {} bytes is not a whole number of sectors",
                data.len()
            )));
        }
        Xts::new(key)?.decrypt_area(data, sector);
        Ok(())
    }
}

/// Inverse of [`XtsPlain64::decrypt`], only needed to build test images
#[cfg(test)]
pub(crate) fn xts_encrypt(key: &[u8], sector: u64, data: &mut [u8]) {
    Xts::new(key).expect("valid xts key").encrypt_area(data, sector);
}
