// SPDX-FileCopyrightText: Copyright © 2025 Serpent OS Developers
//
// SPDX-License-Identifier: MPL-2.0

//! Test images
//!
//! [`Synthetic`] assembles LUKS2 images in memory from this crate's own primitives and is used by
//! the regular test suite. [`Cryptsetup`] produces the same kind of image with the real tool and
//! backs the ignored cross-check tests.

use std::{
    collections::BTreeMap,
    fs,
    io::{self, Write},
    process::{Command, Stdio},
};

use base64::{engine::general_purpose::STANDARD, Engine};
use serde::Serialize;
use serde_json::{json, value::RawValue, Value};
use tempfile::NamedTempFile;
use zerocopy::{
    byteorder::{U16, U64},
    FromBytes,
};

use crate::{
    af,
    cipher::xts_encrypt,
    hash::HashAlgorithm,
    header::{Magic, RawHeader, BINARY_HEADER_SIZE},
    kdf,
    metadata::{Kdf, KEYSLOT_SECTOR_SIZE},
    Error,
};

pub(crate) const SYNTHETIC_UUID: &str = "5b1e0a2c-8b7d-4a2e-9c31-7f3b2a1d0e44";

const HDR_SIZE: u64 = 0x4000;
const KEYSLOTS_START: u64 = 2 * HDR_SIZE;
const AREA_ALIGNMENT: u64 = 4096;
const DATA_SIZE: u64 = 4096;
const PBKDF2_ITERATIONS: u32 = 1000;

/// Parameters of a freshly formatted image
#[derive(Debug, Clone)]
pub(crate) struct FormatOptions {
    /// Volume key size in bytes
    pub key_size: u32,
    pub kdf_type: &'static str,
    /// Used for PBKDF2, AF diffusion and the digest
    pub hash: &'static str,
    pub stripes: u32,
    pub label: &'static str,
    pub sector_size: u32,
}

impl Default for FormatOptions {
    fn default() -> Self {
        Self {
            key_size: 64,
            kdf_type: "argon2id",
            hash: "sha256",
            stripes: 4000,
            label: "",
            sector_size: 512,
        }
    }
}

/// Something that can produce LUKS2 test images
pub(crate) trait Fixture: Sized {
    /// Format a new image with `password` in keyslot 0
    fn format(password: &str, options: &FormatOptions) -> Result<Self, Error>;

    /// Add `new_password` in the next free keyslot and return its id
    fn add_key(&mut self, password: &str, new_password: &str) -> Result<u32, Error>;

    /// Store `json` as token `id`
    fn import_token(&mut self, id: u32, json: &str) -> Result<(), Error>;

    /// The complete image
    fn image(&self) -> Result<Vec<u8>, Error>;

    /// The UUID the image was formatted with
    fn uuid(&self) -> Result<String, Error>;
}

/// Deterministic byte stream standing in for a RNG
struct Filler(u64);

impl Filler {
    fn fill(&mut self, buf: &mut [u8]) {
        for chunk in buf.chunks_mut(32) {
            let block = HashAlgorithm::Sha256.digest(&[b"luks2-fixture", &self.0.to_le_bytes()]);
            chunk.copy_from_slice(&block[..chunk.len()]);
            self.0 += 1;
        }
    }

    fn bytes(&mut self, len: usize) -> Vec<u8> {
        let mut buf = vec![0u8; len];
        self.fill(&mut buf);
        buf
    }
}

/// JSON document with tokens spliced in verbatim
#[derive(Serialize)]
struct Document<'a> {
    keyslots: &'a BTreeMap<String, Value>,
    tokens: &'a BTreeMap<String, Box<RawValue>>,
    segments: Value,
    digests: Value,
    config: Value,
}

/// An image built entirely in memory
pub(crate) struct Synthetic {
    options: FormatOptions,
    master_key: Vec<u8>,
    filler: Filler,
    keyslots: BTreeMap<String, Value>,
    areas: Vec<(u64, Vec<u8>)>,
    next_area: u64,
    tokens: BTreeMap<String, Box<RawValue>>,
    digest_salt: Vec<u8>,
    digest: Vec<u8>,
    flags: Vec<String>,
    requirements: Vec<String>,
    secondary_seqid: Option<u64>,
}

impl Synthetic {
    pub fn master_key(&self) -> &[u8] {
        &self.master_key
    }

    /// Make the secondary header claim a newer sequence id
    pub fn with_secondary_seqid(mut self, seqid: u64) -> Self {
        self.secondary_seqid = Some(seqid);
        self
    }

    /// Insert a keyslot verbatim, e.g. one of a type that cannot be unlocked
    pub fn add_raw_keyslot(&mut self, id: u32, json: &str) {
        let value = serde_json::from_str(json).expect("valid keyslot json");
        self.keyslots.insert(id.to_string(), value);
    }

    pub fn set_priority(&mut self, slot: u32, priority: u8) {
        let keyslot = self.keyslots.get_mut(&slot.to_string()).expect("keyslot exists");
        keyslot["priority"] = json!(priority);
    }

    pub fn add_flag(&mut self, flag: &str) {
        self.flags.push(flag.to_owned());
    }

    pub fn add_requirement(&mut self, requirement: &str) {
        self.requirements.push(requirement.to_owned());
    }

    fn kdf(&mut self) -> Kdf {
        let salt = self.filler.bytes(32);
        match self.options.kdf_type {
            "pbkdf2" => Kdf {
                kdf_type: "pbkdf2".into(),
                salt,
                hash: Some(self.options.hash.into()),
                iterations: Some(PBKDF2_ITERATIONS),
                time: None,
                memory: None,
                cpus: None,
            },
            other => Kdf {
                kdf_type: other.into(),
                salt,
                hash: None,
                iterations: None,
                time: Some(1),
                memory: Some(64),
                cpus: Some(1),
            },
        }
    }

    fn kdf_json(kdf: &Kdf) -> Value {
        let mut value = json!({
            "type": kdf.kdf_type,
            "salt": STANDARD.encode(&kdf.salt),
        });
        if let Some(hash) = &kdf.hash {
            value["hash"] = json!(hash);
        }
        let params = [
            ("iterations", kdf.iterations),
            ("time", kdf.time),
            ("memory", kdf.memory),
            ("cpus", kdf.cpus),
        ];
        for (field, param) in params {
            if let Some(param) = param {
                value[field] = json!(param);
            }
        }
        value
    }

    /// Protect the master key with `password` in keyslot `id`
    fn add_slot(&mut self, id: u32, password: &str) -> Result<(), Error> {
        let hash = HashAlgorithm::from_name(self.options.hash)?;
        let key_size = self.options.key_size;
        let stripes = self.options.stripes;

        let kdf = self.kdf();
        let area_key = kdf::derive(password.as_bytes(), &kdf, key_size as usize)?;

        let filler = &mut self.filler;
        let mut material = af::split(&self.master_key, stripes as usize, hash, |b| filler.fill(b));
        let rounded = (u64::from(stripes) * u64::from(key_size)).div_ceil(KEYSLOT_SECTOR_SIZE) * KEYSLOT_SECTOR_SIZE;
        material.resize(rounded as usize, 0);
        xts_encrypt(&area_key, 0, &mut material);

        let offset = self.next_area;
        let size = rounded.div_ceil(AREA_ALIGNMENT) * AREA_ALIGNMENT;
        self.next_area += size;

        let keyslot = json!({
            "type": "luks2",
            "key_size": key_size,
            "af": {"type": "luks1", "stripes": stripes, "hash": self.options.hash},
            "area": {
                "type": "raw",
                "offset": offset.to_string(),
                "size": size.to_string(),
                "encryption": "aes-xts-plain64",
                "key_size": key_size,
            },
            "kdf": Self::kdf_json(&kdf),
        });
        self.keyslots.insert(id.to_string(), keyslot);
        self.areas.push((offset, material));
        Ok(())
    }

    fn next_slot(&self) -> u32 {
        (0..)
            .find(|id: &u32| !self.keyslots.contains_key(&id.to_string()))
            .unwrap_or_default()
    }

    fn json(&self, segment_offset: u64, keyslots_size: u64) -> Result<Vec<u8>, Error> {
        let unlockable = self
            .keyslots
            .iter()
            .filter(|(_, k)| k["type"] == "luks2")
            .map(|(id, _)| id.clone())
            .collect::<Vec<_>>();
        let mut config = json!({
            "json_size": (HDR_SIZE - BINARY_HEADER_SIZE as u64).to_string(),
            "keyslots_size": keyslots_size.to_string(),
            "flags": self.flags,
        });
        if !self.requirements.is_empty() {
            config["requirements"] = json!({"mandatory": self.requirements});
        }
        let document = Document {
            keyslots: &self.keyslots,
            tokens: &self.tokens,
            segments: json!({
                "0": {
                    "type": "crypt",
                    "offset": segment_offset.to_string(),
                    "size": "dynamic",
                    "iv_tweak": "0",
                    "encryption": "aes-xts-plain64",
                    "sector_size": self.options.sector_size,
                }
            }),
            digests: json!({
                "0": {
                    "type": "pbkdf2",
                    "keyslots": unlockable,
                    "segments": ["0"],
                    "hash": self.options.hash,
                    "iterations": PBKDF2_ITERATIONS,
                    "salt": STANDARD.encode(&self.digest_salt),
                    "digest": STANDARD.encode(&self.digest),
                }
            }),
            config,
        };
        Ok(serde_json::to_vec(&document)?)
    }

    /// One header copy: binary block followed by the padded JSON area
    fn header_copy(&self, magic: [u8; 6], offset: u64, seqid: u64, json: &[u8]) -> Result<Vec<u8>, Error> {
        let mut block = vec![0u8; BINARY_HEADER_SIZE];
        let raw = RawHeader::mut_from_bytes(&mut block).map_err(|_| Error::HeaderCorrupt)?;
        raw.magic = magic;
        raw.version = U16::new(2);
        raw.hdr_size = U64::new(HDR_SIZE);
        raw.seqid = U64::new(seqid);
        raw.label[..self.options.label.len()].copy_from_slice(self.options.label.as_bytes());
        raw.checksum_alg[..6].copy_from_slice(b"sha256");
        raw.salt = [offset as u8; 64];
        raw.uuid[..SYNTHETIC_UUID.len()].copy_from_slice(SYNTHETIC_UUID.as_bytes());
        raw.hdr_offset = U64::new(offset);

        let mut area = json.to_vec();
        area.resize((HDR_SIZE as usize) - BINARY_HEADER_SIZE, 0);
        let csum = HashAlgorithm::Sha256.digest(&[&block, &area]);
        let raw = RawHeader::mut_from_bytes(&mut block).map_err(|_| Error::HeaderCorrupt)?;
        raw.csum[..csum.len()].copy_from_slice(&csum);

        block.extend_from_slice(&area);
        Ok(block)
    }
}

impl Fixture for Synthetic {
    fn format(password: &str, options: &FormatOptions) -> Result<Self, Error> {
        let hash = HashAlgorithm::from_name(options.hash)?;
        let mut filler = Filler(0);
        let master_key = filler.bytes(options.key_size as usize);
        let digest_salt = filler.bytes(32);
        let mut digest = vec![0u8; hash.output_size()];
        hash.pbkdf2(&master_key, &digest_salt, PBKDF2_ITERATIONS, &mut digest)?;

        let mut fixture = Self {
            options: options.clone(),
            master_key,
            filler,
            keyslots: BTreeMap::new(),
            areas: Vec::new(),
            next_area: KEYSLOTS_START,
            tokens: BTreeMap::new(),
            digest_salt,
            digest,
            flags: Vec::new(),
            requirements: Vec::new(),
            secondary_seqid: None,
        };
        fixture.add_slot(0, password)?;
        Ok(fixture)
    }

    fn add_key(&mut self, _password: &str, new_password: &str) -> Result<u32, Error> {
        let id = self.next_slot();
        self.add_slot(id, new_password)?;
        Ok(id)
    }

    fn import_token(&mut self, id: u32, json: &str) -> Result<(), Error> {
        let raw = RawValue::from_string(json.to_owned())?;
        self.tokens.insert(id.to_string(), raw);
        Ok(())
    }

    fn image(&self) -> Result<Vec<u8>, Error> {
        let keyslots_size = self.next_area - KEYSLOTS_START;
        let segment_offset = self.next_area;
        let json = self.json(segment_offset, keyslots_size)?;
        if json.len() > HDR_SIZE as usize - BINARY_HEADER_SIZE {
            return Err(Error::MetadataInconsistent("fixture metadata does not fit".into()));
        }

        let mut image = vec![0u8; (segment_offset + DATA_SIZE) as usize];
        let primary = self.header_copy(Magic::LUKS2, 0, 1, &json)?;
        let secondary = self.header_copy(Magic::SKUL2, HDR_SIZE, self.secondary_seqid.unwrap_or(1), &json)?;
        image[..primary.len()].copy_from_slice(&primary);
        image[HDR_SIZE as usize..HDR_SIZE as usize + secondary.len()].copy_from_slice(&secondary);
        for (offset, area) in &self.areas {
            let offset = *offset as usize;
            image[offset..offset + area.len()].copy_from_slice(area);
        }
        Ok(image)
    }

    fn uuid(&self) -> Result<String, Error> {
        Ok(SYNTHETIC_UUID.to_owned())
    }
}

/// An image formatted by the `cryptsetup` binary in a temporary file
pub(crate) struct Cryptsetup {
    file: NamedTempFile,
    next_slot: u32,
}

/// Size of the backing file, enough for the default 16 MiB metadata and keyslots
const CRYPTSETUP_IMAGE_SIZE: u64 = 24 * 1024 * 1024;

impl Cryptsetup {
    fn key_file(password: &str) -> Result<NamedTempFile, Error> {
        let mut file = NamedTempFile::new()?;
        file.write_all(password.as_bytes())?;
        file.flush()?;
        Ok(file)
    }

    fn run(&self, args: &[&str], stdin: Option<&str>) -> Result<String, Error> {
        let mut child = Command::new("cryptsetup")
            .args(args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()?;
        if let (Some(input), Some(mut pipe)) = (stdin, child.stdin.take()) {
            pipe.write_all(input.as_bytes())?;
        }
        let output = child.wait_with_output()?;
        if !output.status.success() {
            return Err(Error::IO(io::Error::other(format!(
                "cryptsetup {}: {}",
                args.first().unwrap_or(&""),
                String::from_utf8_lossy(&output.stderr).trim()
            ))));
        }
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }

    fn path(&self) -> Result<&str, Error> {
        self.file
            .path()
            .to_str()
            .ok_or_else(|| Error::IO(io::Error::other("temporary path is not UTF-8")))
    }
}

impl Fixture for Cryptsetup {
    fn format(password: &str, options: &FormatOptions) -> Result<Self, Error> {
        let file = NamedTempFile::new()?;
        file.as_file().set_len(CRYPTSETUP_IMAGE_SIZE)?;
        let fixture = Self { file, next_slot: 1 };

        let key_file = Self::key_file(password)?;
        let key_file = key_file.path().to_string_lossy().into_owned();
        let key_bits = (options.key_size * 8).to_string();
        let sector_size = options.sector_size.to_string();
        let mut args = vec![
            "luksFormat",
            "--type",
            "luks2",
            "--iter-time",
            "5",
            "-q",
            "--cipher",
            "aes-xts-plain64",
            "--key-size",
            key_bits.as_str(),
            "--hash",
            options.hash,
            "--pbkdf",
            options.kdf_type,
            "--sector-size",
            sector_size.as_str(),
            "--key-file",
            key_file.as_str(),
        ];
        if !options.label.is_empty() {
            args.extend(["--label", options.label]);
        }
        let path = fixture.path()?.to_owned();
        args.push(&path);
        fixture.run(&args, None)?;
        Ok(fixture)
    }

    fn add_key(&mut self, password: &str, new_password: &str) -> Result<u32, Error> {
        let old = Self::key_file(password)?;
        let new = Self::key_file(new_password)?;
        let slot = self.next_slot.to_string();
        let old = old.path().to_string_lossy().into_owned();
        let new = new.path().to_string_lossy().into_owned();
        let path = self.path()?.to_owned();
        let args = [
            "luksAddKey",
            "--iter-time",
            "5",
            "-q",
            "--key-slot",
            slot.as_str(),
            "--key-file",
            old.as_str(),
            path.as_str(),
            new.as_str(),
        ];
        self.run(&args, None)?;
        self.next_slot += 1;
        Ok(self.next_slot - 1)
    }

    fn import_token(&mut self, id: u32, json: &str) -> Result<(), Error> {
        let id = id.to_string();
        let path = self.path()?.to_owned();
        self.run(&["token", "import", "--token-id", id.as_str(), path.as_str()], Some(json))?;
        Ok(())
    }

    fn image(&self) -> Result<Vec<u8>, Error> {
        Ok(fs::read(self.file.path())?)
    }

    fn uuid(&self) -> Result<String, Error> {
        let path = self.path()?.to_owned();
        Ok(self.run(&["luksUUID", path.as_str()], None)?.trim().to_owned())
    }
}

#[cfg(test)]
mod tests {
    use std::io::Cursor;

    use super::*;
    use crate::{header::read_header, metadata::Metadata};
    use test_log::test;

    #[test]
    fn test_synthetic_is_well_formed() {
        let mut fixture = Synthetic::format("foobar", &FormatOptions::default()).unwrap();
        fixture.add_key("foobar", "barfoo").unwrap();
        let image = fixture.image().unwrap();

        let header = read_header(&mut Cursor::new(&image)).unwrap();
        let metadata = Metadata::from_slice(&header.json, header.json_area_len()).unwrap();
        assert_eq!(metadata.keyslots.len(), 2);
        assert_eq!(metadata.digests[&0].keyslots, vec![0, 1]);
        assert_eq!(metadata.keyslots[&1].area.offset, metadata.keyslots[&0].area.offset + 258048);
        assert_eq!(metadata.segments[&0].offset, KEYSLOTS_START + 2 * 258048);
        assert_eq!(image.len() as u64, metadata.segments[&0].offset + DATA_SIZE);
    }

    #[test]
    fn test_synthetic_is_deterministic() {
        let a = Synthetic::format("foobar", &FormatOptions::default()).unwrap();
        let b = Synthetic::format("foobar", &FormatOptions::default()).unwrap();
        assert_eq!(a.image().unwrap(), b.image().unwrap());
    }
}
