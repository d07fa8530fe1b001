// SPDX-FileCopyrightText: Copyright © 2025 Serpent OS Developers
//
// SPDX-License-Identifier: MPL-2.0

//! Typed model of the LUKS2 JSON metadata area
//!
//! cryptsetup writes most integers as JSON strings (offsets, sizes, object ids) but some as JSON
//! numbers, and older or third-party writers are not consistent about which is which. Every
//! integer field here accepts either encoding. Fields this model does not know are ignored.

use std::{collections::BTreeMap, fmt, str::FromStr};

use serde::{de, Deserialize, Deserializer};
use serde_json::value::RawValue;
use serde_with::{base64::Base64, serde_as, DisplayFromStr, PickFirst};

use crate::Error;

/// Keyslot type that can be unlocked with a passphrase
pub const KEYSLOT_TYPE_LUKS2: &str = "luks2";

/// Sector size used for keyslot area encryption
pub const KEYSLOT_SECTOR_SIZE: u64 = 512;

/// Alignment required of the keyslots area
const KEYSLOTS_ALIGNMENT: u64 = 4096;

/// Decoded LUKS2 metadata
#[derive(Debug, Deserialize)]
pub struct Metadata {
    /// Keyslots by numeric id
    pub keyslots: BTreeMap<u32, Keyslot>,

    /// Tokens by numeric id, kept as the exact JSON text found on disk
    #[serde(default)]
    pub tokens: BTreeMap<u32, Box<RawValue>>,

    /// Data segments by numeric id
    pub segments: BTreeMap<u32, Segment>,

    /// Key digests by numeric id
    pub digests: BTreeMap<u32, Digest>,

    /// Persistent device configuration
    pub config: Config,
}

/// Persistent configuration stored alongside the keyslots
#[serde_as]
#[derive(Debug, Deserialize)]
pub struct Config {
    /// Size of the JSON metadata area in bytes, must match the binary header
    #[serde_as(as = "PickFirst<(_, DisplayFromStr)>")]
    pub json_size: u64,

    /// Size of the binary keyslots area in bytes
    #[serde_as(as = "PickFirst<(_, DisplayFromStr)>")]
    pub keyslots_size: u64,

    /// Persistent activation flags such as `allow-discards`
    #[serde(default)]
    pub flags: Vec<String>,

    /// Features a reader must implement before activating the device
    #[serde(default)]
    pub requirements: Requirements,
}

/// Feature requirements of the device
#[derive(Debug, Default, Deserialize)]
pub struct Requirements {
    /// Requirements that prevent activation when unknown
    #[serde(default)]
    pub mandatory: Vec<String>,
}

/// Keyslot priority
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Deserialize)]
#[serde(try_from = "u8")]
pub enum Priority {
    /// Only used when explicitly requested
    Ignore,
    #[default]
    Normal,
    /// Tried before normal keyslots
    High,
}

impl FromStr for Priority {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let value = s.parse::<u8>().map_err(|e| format!("invalid keyslot priority {s:?}: {e}"))?;
        Self::try_from(value)
    }
}

impl TryFrom<u8> for Priority {
    type Error = String;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(Self::Ignore),
            1 => Ok(Self::Normal),
            2 => Ok(Self::High),
            p => Err(format!("invalid keyslot priority {p}")),
        }
    }
}

/// A keyslot protecting one copy of a volume key
#[serde_as]
#[derive(Debug, Deserialize)]
pub struct Keyslot {
    /// Keyslot type, only `luks2` slots are passphrase-unlockable
    #[serde(rename = "type")]
    pub slot_type: String,

    /// Size of the protected key in bytes
    #[serde_as(as = "PickFirst<(_, DisplayFromStr)>")]
    pub key_size: u32,

    /// Location and encryption of the binary keyslot material
    pub area: Area,

    /// Passphrase stretching parameters
    #[serde(default)]
    pub kdf: Option<Kdf>,

    /// Anti-forensic splitter parameters
    #[serde(default)]
    pub af: Option<Af>,

    #[serde_as(as = "Option<PickFirst<(_, DisplayFromStr)>>")]
    #[serde(default)]
    pub priority: Option<Priority>,
}

impl Keyslot {
    /// Whether this engine can unlock the slot with a passphrase
    pub fn is_unlockable(&self) -> bool {
        self.slot_type == KEYSLOT_TYPE_LUKS2
    }

    pub fn priority(&self) -> Priority {
        self.priority.unwrap_or_default()
    }
}

/// Binary area holding the encrypted, AF-split key material
#[serde_as]
#[derive(Debug, Deserialize)]
pub struct Area {
    /// Area type, `raw` for passphrase keyslots
    #[serde(rename = "type")]
    pub area_type: String,

    /// Offset from the device start in bytes
    #[serde_as(as = "PickFirst<(_, DisplayFromStr)>")]
    pub offset: u64,

    /// Area size in bytes
    #[serde_as(as = "PickFirst<(_, DisplayFromStr)>")]
    pub size: u64,

    /// Area cipher in dm-crypt notation, e.g. `aes-xts-plain64`
    #[serde(default)]
    pub encryption: Option<String>,

    /// Area cipher key size in bytes
    #[serde_as(as = "Option<PickFirst<(_, DisplayFromStr)>>")]
    #[serde(default)]
    pub key_size: Option<u32>,
}

/// Key derivation parameters
///
/// Which of the optional fields are meaningful depends on `kdf_type`; the backend for that type
/// checks the ones it needs.
#[serde_as]
#[derive(Debug, Deserialize)]
pub struct Kdf {
    /// Type of KDF (`pbkdf2`, `argon2i` or `argon2id`)
    #[serde(rename = "type")]
    pub kdf_type: String,

    #[serde_as(as = "Base64")]
    pub salt: Vec<u8>,

    /// PBKDF2 hash
    #[serde(default)]
    pub hash: Option<String>,

    /// PBKDF2 iteration count
    #[serde_as(as = "Option<PickFirst<(_, DisplayFromStr)>>")]
    #[serde(default)]
    pub iterations: Option<u32>,

    /// Argon2 time cost
    #[serde_as(as = "Option<PickFirst<(_, DisplayFromStr)>>")]
    #[serde(default)]
    pub time: Option<u32>,

    /// Argon2 memory cost in KiB
    #[serde_as(as = "Option<PickFirst<(_, DisplayFromStr)>>")]
    #[serde(default)]
    pub memory: Option<u32>,

    /// Argon2 lanes
    #[serde_as(as = "Option<PickFirst<(_, DisplayFromStr)>>")]
    #[serde(default)]
    pub cpus: Option<u32>,
}

/// Anti-forensic splitter parameters
#[serde_as]
#[derive(Debug, Deserialize)]
pub struct Af {
    #[serde(rename = "type")]
    pub af_type: String,

    /// Number of stripes, 4000 for everything cryptsetup writes
    #[serde_as(as = "PickFirst<(_, DisplayFromStr)>")]
    pub stripes: u32,

    /// Diffusion hash
    pub hash: String,
}

impl Af {
    /// Bytes of AF material for a key of `key_size` bytes, rounded up to whole sectors
    pub fn sector_rounded_len(&self, key_size: u32) -> u64 {
        let len = u64::from(self.stripes) * u64::from(key_size);
        len.div_ceil(KEYSLOT_SECTOR_SIZE) * KEYSLOT_SECTOR_SIZE
    }
}

/// Size of a data segment
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SegmentSize {
    /// Extends to the end of the device
    Dynamic,
    /// Fixed size in bytes
    Fixed(u64),
}

impl<'de> Deserialize<'de> for SegmentSize {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        struct SizeVisitor;

        impl de::Visitor<'_> for SizeVisitor {
            type Value = SegmentSize;

            fn expecting(&self, f: &mut fmt::Formatter) -> fmt::Result {
                f.write_str("\"dynamic\" or a byte count")
            }

            fn visit_u64<E: de::Error>(self, v: u64) -> Result<Self::Value, E> {
                Ok(SegmentSize::Fixed(v))
            }

            fn visit_str<E: de::Error>(self, v: &str) -> Result<Self::Value, E> {
                match v {
                    "dynamic" => Ok(SegmentSize::Dynamic),
                    s => s.parse().map(SegmentSize::Fixed).map_err(E::custom),
                }
            }
        }

        deserializer.deserialize_any(SizeVisitor)
    }
}

/// An encrypted region of user data
#[serde_as]
#[derive(Debug, Deserialize)]
pub struct Segment {
    /// Segment type, `crypt` for dm-crypt data
    #[serde(rename = "type")]
    pub segment_type: String,

    /// Offset from the device start in bytes
    #[serde_as(as = "PickFirst<(_, DisplayFromStr)>")]
    pub offset: u64,

    pub size: SegmentSize,

    /// Starting IV offset
    #[serde_as(as = "Option<PickFirst<(_, DisplayFromStr)>>")]
    #[serde(default)]
    pub iv_tweak: Option<u64>,

    /// Data cipher in dm-crypt notation
    #[serde(default)]
    pub encryption: Option<String>,

    /// Encryption sector size in bytes
    #[serde_as(as = "Option<PickFirst<(_, DisplayFromStr)>>")]
    #[serde(default)]
    pub sector_size: Option<u32>,

    /// Integrity protection parameters, kept opaque
    #[serde(default)]
    pub integrity: Option<serde_json::Value>,

    #[serde(default)]
    pub flags: Vec<String>,
}

/// A digest authenticating the key recovered from one or more keyslots
#[serde_as]
#[derive(Debug, Deserialize)]
pub struct Digest {
    /// Digest type, `pbkdf2`
    #[serde(rename = "type")]
    pub digest_type: String,

    /// Keyslots whose key this digest verifies
    #[serde_as(as = "Vec<PickFirst<(_, DisplayFromStr)>>")]
    pub keyslots: Vec<u32>,

    /// Segments encrypted with that key
    #[serde_as(as = "Vec<PickFirst<(_, DisplayFromStr)>>")]
    #[serde(default)]
    pub segments: Vec<u32>,

    /// PBKDF2 hash
    pub hash: String,

    /// PBKDF2 iteration count
    #[serde_as(as = "PickFirst<(_, DisplayFromStr)>")]
    pub iterations: u32,

    #[serde_as(as = "Base64")]
    pub salt: Vec<u8>,

    #[serde_as(as = "Base64")]
    pub digest: Vec<u8>,
}

impl Metadata {
    /// Decode and validate the JSON area of a header
    ///
    /// `json_area_len` is the size of the area as declared by the binary header. Trailing NUL
    /// padding in `bytes` is ignored.
    pub fn from_slice(bytes: &[u8], json_area_len: u64) -> Result<Self, Error> {
        let end = bytes.iter().rposition(|&b| b != 0).map_or(0, |i| i + 1);
        let metadata: Self = serde_json::from_slice(&bytes[..end])?;
        metadata.validate(json_area_len)?;
        Ok(metadata)
    }

    /// Check the referential and structural rules cryptsetup enforces on load
    fn validate(&self, json_area_len: u64) -> Result<(), Error> {
        if self.config.json_size != json_area_len {
            return Err(Error::MetadataInconsistent(format!(
                "config json_size {} does not match header area of {json_area_len} bytes",
                self.config.json_size
            )));
        }
        if self.config.keyslots_size % KEYSLOTS_ALIGNMENT != 0 {
            return Err(Error::MetadataInconsistent(format!(
                "keyslots_size {} is not aligned to {KEYSLOTS_ALIGNMENT}",
                self.config.keyslots_size
            )));
        }

        for (id, digest) in &self.digests {
            if let Some(slot) = digest.keyslots.iter().find(|s| !self.keyslots.contains_key(*s)) {
                return Err(Error::MetadataInconsistent(format!(
                    "digest {id} references missing keyslot {slot}"
                )));
            }
            if let Some(segment) = digest.segments.iter().find(|s| !self.segments.contains_key(*s)) {
                return Err(Error::MetadataInconsistent(format!(
                    "digest {id} references missing segment {segment}"
                )));
            }
        }

        for (id, keyslot) in self.keyslots.iter().filter(|(_, k)| k.is_unlockable()) {
            let (Some(af), Some(_)) = (&keyslot.af, &keyslot.kdf) else {
                return Err(Error::MetadataInconsistent(format!("keyslot {id} lacks kdf or af parameters")));
            };
            if keyslot.area.encryption.is_none() || keyslot.area.key_size.is_none() {
                return Err(Error::MetadataInconsistent(format!("keyslot {id} area lacks a cipher")));
            }
            if af.stripes == 0 {
                return Err(Error::MetadataInconsistent(format!("keyslot {id} has zero AF stripes")));
            }
            let needed = af.sector_rounded_len(keyslot.key_size);
            if keyslot.area.size < needed {
                return Err(Error::MetadataInconsistent(format!(
                    "keyslot {id} area of {} bytes cannot hold {needed} bytes of key material",
                    keyslot.area.size
                )));
            }
        }

        Ok(())
    }

    /// The digest authenticating the given keyslot
    pub fn digest_for_keyslot(&self, slot: u32) -> Option<(u32, &Digest)> {
        self.digests
            .iter()
            .find(|(_, d)| d.keyslots.contains(&slot))
            .map(|(id, d)| (*id, d))
    }
}
