// SPDX-FileCopyrightText: Copyright © 2025 Serpent OS Developers
//
// SPDX-License-Identifier: MPL-2.0

//! # LUKS2 binary header
//!
//! A LUKS2 device starts with two copies of the same header, each a 4096 byte binary block
//! followed by the JSON metadata area:
//!
//! - primary copy at offset 0, magic `LUKS\xba\xbe`
//! - secondary copy at offset `hdr_size`, magic `SKUL\xba\xbe`
//!
//! Each copy carries a checksum over its binary block (with the checksum field zeroed) and its
//! JSON area. A copy is only trusted if magic, version, offset and checksum all check out; when
//! both copies are valid the one with the higher sequence id wins.

use std::{
    io::{self, Read, Seek, SeekFrom},
    mem::offset_of,
};

use log::{debug, trace, warn};
use uuid::Uuid;
use zerocopy::{
    byteorder::{BigEndian, U16, U64},
    FromBytes, Immutable, IntoBytes, KnownLayout, Unaligned,
};

use crate::{hash::HashAlgorithm, Error};

/// Length of the magic number field in bytes
pub const MAGIC_LEN: usize = 6;
/// Length of the label field in bytes
pub const LABEL_LEN: usize = 48;
/// Length of the checksum algorithm field in bytes
pub const CHECKSUM_ALG_LEN: usize = 32;
/// Length of the salt field in bytes
pub const SALT_LEN: usize = 64;
/// Length of the UUID field in bytes
pub const UUID_LEN: usize = 40;
/// Length of the checksum field in bytes
pub const CHECKSUM_LEN: usize = 64;
/// Size of the binary part of each header copy
pub const BINARY_HEADER_SIZE: usize = 4096;

/// Offset of the checksum field within the binary header
const CHECKSUM_OFFSET: usize = offset_of!(RawHeader, csum);

/// Smallest header size (binary block plus JSON area) cryptsetup writes
const MIN_HEADER_SIZE: u64 = 0x4000;
/// Largest header size cryptsetup writes
const MAX_HEADER_SIZE: u64 = 0x40_0000;

/// On-disk LUKS2 binary header
#[derive(FromBytes, IntoBytes, Immutable, KnownLayout, Unaligned, Debug)]
#[repr(C, packed)]
pub struct RawHeader {
    /// Magic number identifying LUKS2 format
    pub magic: [u8; MAGIC_LEN],
    /// LUKS format version
    pub version: U16<BigEndian>,
    /// Size of the header copy (binary block and JSON area) in bytes
    pub hdr_size: U64<BigEndian>,
    /// Header sequence ID, increased on every update
    pub seqid: U64<BigEndian>,
    /// Volume label
    pub label: [u8; LABEL_LEN],
    /// Checksum algorithm identifier
    pub checksum_alg: [u8; CHECKSUM_ALG_LEN],
    /// Salt, unique for every header copy
    pub salt: [u8; SALT_LEN],
    /// Volume UUID
    pub uuid: [u8; UUID_LEN],
    /// Subsystem label
    pub subsystem: [u8; LABEL_LEN],
    /// Offset of this copy from the device start
    pub hdr_offset: U64<BigEndian>,
    /// Padding bytes
    pub padding: [u8; 184],
    /// Header checksum
    pub csum: [u8; CHECKSUM_LEN],
    /// Additional padding to 4096 bytes
    pub padding4096: [u8; 7 * 512],
}

/// Magic number constants for LUKS2 format identification
pub struct Magic;

impl Magic {
    /// Primary header magic
    pub const LUKS2: [u8; MAGIC_LEN] = [b'L', b'U', b'K', b'S', 0xba, 0xbe];
    /// Secondary header magic
    pub const SKUL2: [u8; MAGIC_LEN] = [b'S', b'K', b'U', b'L', 0xba, 0xbe];
}

/// Which of the two header copies a [`Header`] was read from
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Location {
    Primary,
    Secondary,
}

impl Location {
    fn magic(&self) -> [u8; MAGIC_LEN] {
        match self {
            Location::Primary => Magic::LUKS2,
            Location::Secondary => Magic::SKUL2,
        }
    }
}

/// A validated header copy and its JSON area
#[derive(Debug)]
pub struct Header {
    /// Copy this header was read from
    pub copy: Location,
    /// Size of the header copy in bytes
    pub hdr_size: u64,
    /// Sequence id
    pub seqid: u64,
    /// Volume label, often empty
    pub label: String,
    /// Owner subsystem, often empty
    pub subsystem: String,
    /// Canonical 36 character UUID
    pub uuid: String,
    /// Checksum algorithm
    pub checksum: HashAlgorithm,
    /// Raw JSON area including its NUL padding
    pub json: Vec<u8>,
}

impl Header {
    /// Length of the JSON area in bytes
    pub fn json_area_len(&self) -> u64 {
        self.hdr_size - BINARY_HEADER_SIZE as u64
    }
}

/// Decode a NUL padded string field
fn cstr(field: &[u8]) -> Result<String, Error> {
    let end = field.iter().position(|&b| b == 0).unwrap_or(field.len());
    std::str::from_utf8(&field[..end])
        .map(str::to_owned)
        .map_err(|_| Error::HeaderCorrupt)
}

impl RawHeader {
    pub fn version(&self) -> u16 {
        self.version.get()
    }

    pub fn hdr_size(&self) -> u64 {
        self.hdr_size.get()
    }

    /// Whether `hdr_size` is one cryptsetup could have written
    fn has_valid_size(&self) -> bool {
        let size = self.hdr_size();
        size.is_power_of_two() && (MIN_HEADER_SIZE..=MAX_HEADER_SIZE).contains(&size)
    }
}

/// Why a header copy was not used
#[derive(Debug, thiserror::Error)]
enum Rejection {
    #[error("short read")]
    Truncated,
    #[error("bad magic")]
    Magic,
    #[error("unsupported version {0}")]
    Version(u16),
    #[error("invalid header size {0:#x}")]
    Size(u64),
    #[error("header claims offset {0:#x}")]
    Offset(u64),
    #[error("checksum mismatch")]
    Checksum,
    #[error("bad field: {0}")]
    Field(Error),
}

/// Read and validate one header copy at `offset`
///
/// I/O errors other than a short read are returned as the outer error; everything that makes the
/// copy unusable is an inner [`Rejection`].
fn read_copy<R: Read + Seek>(
    reader: &mut R,
    offset: u64,
    copy: Location,
) -> Result<Result<Header, Rejection>, Error> {
    let mut block = vec![0u8; BINARY_HEADER_SIZE];
    reader.seek(SeekFrom::Start(offset))?;
    match reader.read_exact(&mut block) {
        Ok(()) => {}
        Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => return Ok(Err(Rejection::Truncated)),
        Err(e) => return Err(e.into()),
    }
    let Ok(raw) = RawHeader::read_from_bytes(&block) else {
        return Ok(Err(Rejection::Truncated));
    };

    if raw.magic != copy.magic() {
        return Ok(Err(Rejection::Magic));
    }
    if raw.version() != 2 {
        return Ok(Err(Rejection::Version(raw.version())));
    }
    if !raw.has_valid_size() {
        return Ok(Err(Rejection::Size(raw.hdr_size())));
    }
    if raw.hdr_offset.get() != offset {
        return Ok(Err(Rejection::Offset(raw.hdr_offset.get())));
    }
    trace!("valid magic field in {copy:?} header at {offset:#x}");

    let checksum = match cstr(&raw.checksum_alg).and_then(|name| HashAlgorithm::from_name(&name)) {
        Ok(checksum) => checksum,
        Err(e) => return Ok(Err(Rejection::Field(e))),
    };

    let mut json = vec![0u8; (raw.hdr_size() - BINARY_HEADER_SIZE as u64) as usize];
    match reader.read_exact(&mut json) {
        Ok(()) => {}
        Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => return Ok(Err(Rejection::Truncated)),
        Err(e) => return Err(e.into()),
    }

    block[CHECKSUM_OFFSET..CHECKSUM_OFFSET + CHECKSUM_LEN].fill(0);
    let computed = checksum.digest(&[&block, &json]);
    if computed[..] != raw.csum[..computed.len()] {
        return Ok(Err(Rejection::Checksum));
    }

    let fields = (|| {
        let uuid = cstr(&raw.uuid)?;
        Uuid::try_parse(&uuid).map_err(|_| Error::HeaderCorrupt)?;
        Ok::<_, Error>((uuid, cstr(&raw.label)?, cstr(&raw.subsystem)?))
    })();
    let (uuid, label, subsystem) = match fields {
        Ok(fields) => fields,
        Err(e) => return Ok(Err(Rejection::Field(e))),
    };

    Ok(Ok(Header {
        copy,
        hdr_size: raw.hdr_size(),
        seqid: raw.seqid.get(),
        label,
        subsystem,
        uuid,
        checksum,
        json,
    }))
}

/// Pick the header copy to trust
///
/// Both valid: the higher sequence id wins, the primary on a tie.
pub fn select(primary: Option<Header>, secondary: Option<Header>) -> Option<Header> {
    match (primary, secondary) {
        (Some(p), Some(s)) if s.seqid > p.seqid => Some(s),
        (Some(p), _) => Some(p),
        (None, s) => s,
    }
}

/// Read both header copies from `reader` and return the one to use
pub fn read_header<R: Read + Seek>(reader: &mut R) -> Result<Header, Error> {
    let primary = match read_copy(reader, 0, Location::Primary)? {
        Ok(header) => Some(header),
        Err(reason) => {
            debug!("primary header rejected: {reason}");
            None
        }
    };

    // The secondary copy sits right after the primary. The size field of a rejected primary is not
    // trusted, so every size cryptsetup can write is tried instead.
    let offsets: Vec<u64> = match &primary {
        Some(p) => vec![p.hdr_size],
        None => std::iter::successors(Some(MIN_HEADER_SIZE), |s| Some(s * 2))
            .take_while(|s| *s <= MAX_HEADER_SIZE)
            .collect(),
    };

    let mut secondary = None;
    for offset in offsets {
        match read_copy(reader, offset, Location::Secondary)? {
            Ok(header) => {
                secondary = Some(header);
                break;
            }
            Err(reason) => debug!("secondary header at {offset:#x} rejected: {reason}"),
        }
    }

    if let (Some(p), Some(s)) = (&primary, &secondary) {
        if p.seqid != s.seqid {
            warn!("header copies disagree: primary seqid {}, secondary seqid {}", p.seqid, s.seqid);
        }
    }

    let header = select(primary, secondary).ok_or(Error::HeaderCorrupt)?;
    debug!(
        "using {:?} header: UUID={} seqid={} [volume label: \"{}\"]",
        header.copy, header.uuid, header.seqid, header.label
    );
    Ok(header)
}
