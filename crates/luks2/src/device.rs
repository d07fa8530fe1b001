// SPDX-FileCopyrightText: Copyright © 2025 Serpent OS Developers
//
// SPDX-License-Identifier: MPL-2.0

//! An opened LUKS2 device
//!
//! [`Device`] ties a validated header and its metadata to the byte source they came from. The
//! metadata never changes after [`Device::open`]; the source is only read again to fetch keyslot
//! areas while unlocking, which is why the unlock methods need `&mut self`.

use std::{
    cmp::Reverse,
    collections::BTreeMap,
    io::{Read, Seek, SeekFrom},
    path::{Path, PathBuf},
};

use log::{debug, warn};
use zeroize::Zeroizing;

use crate::{
    cipher::{CipherProvider, XtsPlain64},
    header::{self, Header},
    keyslot::{self, MasterKey},
    metadata::{Digest, Keyslot, Metadata, Priority, Segment, SegmentSize},
    token::Token,
    Error,
};

/// Segment type holding dm-crypt data
const SEGMENT_TYPE_CRYPT: &str = "crypt";

/// dm-crypt sector size
const DM_SECTOR: u64 = 512;

/// An opened, read-only LUKS2 device
pub struct Device<R> {
    path: PathBuf,
    source: R,
    header: Header,
    metadata: Metadata,
}

impl<R: Read + Seek> Device<R> {
    /// Parse the header and metadata of `source`, which lives at `path`
    pub fn open<P: AsRef<Path>>(path: P, mut source: R) -> Result<Self, Error> {
        let header = header::read_header(&mut source)?;
        let metadata = Metadata::from_slice(&header.json, header.json_area_len())?;
        debug!(
            "opened {}: {} keyslots, {} tokens, {} segments",
            path.as_ref().display(),
            metadata.keyslots.len(),
            metadata.tokens.len(),
            metadata.segments.len()
        );
        Ok(Self {
            path: path.as_ref().to_owned(),
            source,
            header,
            metadata,
        })
    }

    /// Recover the volume key from keyslot `slot` using the default cipher provider
    pub fn decrypt_keyslot(&mut self, slot: u32, password: &[u8]) -> Result<MasterKey, Error> {
        self.decrypt_keyslot_with(slot, password, &XtsPlain64)
    }

    /// Recover the volume key from keyslot `slot`, decrypting the area with `provider`
    pub fn decrypt_keyslot_with(
        &mut self,
        slot: u32,
        password: &[u8],
        provider: &dyn CipherProvider,
    ) -> Result<MasterKey, Error> {
        keyslot::unlock(&mut self.source, &self.metadata, slot, password, provider)
    }

    /// Try every passphrase keyslot until one accepts `password`
    ///
    /// High priority slots go first, slots marked ignore are skipped.
    pub fn unlock_any(&mut self, password: &[u8]) -> Result<(u32, MasterKey), Error> {
        let mut candidates = self
            .metadata
            .keyslots
            .iter()
            .filter(|(_, k)| k.is_unlockable() && k.priority() != Priority::Ignore)
            .map(|(id, k)| (Reverse(k.priority()), *id))
            .collect::<Vec<_>>();
        candidates.sort();

        for (_, slot) in candidates {
            match self.decrypt_keyslot(slot, password) {
                Ok(key) => return Ok((slot, key)),
                Err(Error::WrongPassword) => debug!("keyslot {slot} rejected the passphrase"),
                Err(e) => return Err(e),
            }
        }
        Err(Error::WrongPassword)
    }

    /// Unlock keyslot `slot` and describe the data segment its key opens
    pub fn unlock(&mut self, slot: u32, password: &[u8]) -> Result<Volume, Error> {
        if let Some(requirement) = self.metadata.config.requirements.mandatory.first() {
            return Err(Error::UnmetRequirement(requirement.clone()));
        }

        let key = self.decrypt_keyslot(slot, password)?;

        let (segment_id, segment) = self
            .metadata
            .digest_for_keyslot(slot)
            .into_iter()
            .flat_map(|(_, digest)| digest.segments.iter())
            .find_map(|id| {
                self.metadata
                    .segments
                    .get(id)
                    .filter(|s| s.segment_type == SEGMENT_TYPE_CRYPT)
                    .map(|s| (*id, s))
            })
            .ok_or_else(|| Error::MetadataInconsistent(format!("keyslot {slot} opens no crypt segment")))?;

        let cipher = segment
            .encryption
            .clone()
            .ok_or_else(|| Error::MetadataInconsistent(format!("segment {segment_id} has no cipher")))?;
        if segment.integrity.is_some() {
            warn!("segment {segment_id} uses integrity protection, which the table line omits");
        }

        let size = match segment.size {
            SegmentSize::Fixed(size) => size,
            SegmentSize::Dynamic => {
                let end = self.source.seek(SeekFrom::End(0))?;
                end.checked_sub(segment.offset).ok_or_else(|| {
                    Error::MetadataInconsistent(format!("segment {segment_id} starts past the end of the device"))
                })?
            }
        };

        Ok(Volume {
            key,
            device: self.path.clone(),
            cipher,
            offset: segment.offset,
            size,
            iv_tweak: segment.iv_tweak.unwrap_or(0),
            sector_size: segment.sector_size.unwrap_or(DM_SECTOR as u32),
            flags: self.metadata.config.flags.clone(),
        })
    }
}

impl<R> Device<R> {
    /// Canonical UUID from the binary header
    pub fn uuid(&self) -> &str {
        &self.header.uuid
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// LUKS version, always 2
    pub fn version(&self) -> u16 {
        2
    }

    pub fn label(&self) -> &str {
        &self.header.label
    }

    pub fn subsystem(&self) -> &str {
        &self.header.subsystem
    }

    /// The header copy in use
    pub fn header(&self) -> &Header {
        &self.header
    }

    pub fn metadata(&self) -> &Metadata {
        &self.metadata
    }

    /// Persistent activation flags
    pub fn flags(&self) -> &[String] {
        &self.metadata.config.flags
    }

    /// Ids of every keyslot, whatever its type, in ascending order
    pub fn slots(&self) -> Vec<u32> {
        self.metadata.keyslots.keys().copied().collect()
    }

    pub fn keyslot(&self, slot: u32) -> Option<&Keyslot> {
        self.metadata.keyslots.get(&slot)
    }

    pub fn segments(&self) -> &BTreeMap<u32, Segment> {
        &self.metadata.segments
    }

    pub fn digests(&self) -> &BTreeMap<u32, Digest> {
        &self.metadata.digests
    }

    /// All tokens in ascending id order
    ///
    /// A token that cannot be decoded is still returned, as [`crate::TokenData::Raw`].
    pub fn tokens(&self) -> Vec<Token> {
        self.metadata
            .tokens
            .iter()
            .map(|(id, raw)| Token::from_raw(*id, raw))
            .collect()
    }
}

/// Everything needed to map an unlocked data segment with dm-crypt
#[derive(Debug)]
pub struct Volume {
    /// Verified volume key
    pub key: MasterKey,
    /// Backing device path
    pub device: PathBuf,
    /// Data cipher in dm-crypt notation
    pub cipher: String,
    /// Data offset in bytes
    pub offset: u64,
    /// Data size in bytes
    pub size: u64,
    /// IV offset in sectors
    pub iv_tweak: u64,
    /// Encryption sector size in bytes
    pub sector_size: u32,
    /// Persistent flags (`allow-discards`, ...)
    pub flags: Vec<String>,
}

impl Volume {
    /// Optional dm-crypt arguments implied by the flags and sector size
    fn optional_args(&self) -> Vec<String> {
        let mut args = self
            .flags
            .iter()
            .filter_map(|flag| match flag.as_str() {
                "allow-discards" => Some("allow_discards"),
                "same-cpu-crypt" => Some("same_cpu_crypt"),
                "submit-from-crypt-cpus" => Some("submit_from_crypt_cpus"),
                "no-read-workqueue" => Some("no_read_workqueue"),
                "no-write-workqueue" => Some("no_write_workqueue"),
                _ => None,
            })
            .map(str::to_owned)
            .collect::<Vec<_>>();
        if u64::from(self.sector_size) != DM_SECTOR {
            args.push(format!("sector_size:{}", self.sector_size));
        }
        args
    }

    /// A `dmsetup` table line mapping this volume
    ///
    /// The line contains the key in hex and is wiped when dropped.
    pub fn dm_table(&self) -> Zeroizing<String> {
        let mut table = Zeroizing::new(String::new());
        let hex_key = Zeroizing::new(hex::encode(self.key.as_bytes()));
        table.push_str(&format!("0 {} crypt {} ", self.size / DM_SECTOR, self.cipher));
        table.push_str(&hex_key);
        table.push_str(&format!(
            " {} {} {}",
            self.iv_tweak,
            self.device.display(),
            self.offset / DM_SECTOR
        ));
        let args = self.optional_args();
        if !args.is_empty() {
            table.push_str(&format!(" {} {}", args.len(), args.join(" ")));
        }
        table
    }
}
