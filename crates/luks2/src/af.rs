// SPDX-FileCopyrightText: Copyright © 2025 Serpent OS Developers
//
// SPDX-License-Identifier: MPL-2.0

//! Anti-forensic information splitting
//!
//! A keyslot stores its key expanded into `stripes` blocks of `key_size` bytes. All but the
//! last block are random; each is folded into an accumulator that is then diffused through the
//! AF hash, and the last block is the key XOR the final accumulator. Losing any single stripe
//! makes the key unrecoverable.
//!
//! The diffusion runs the hash over the accumulator in digest-sized chunks, each chunk prefixed
//! with its big-endian 32-bit index; a short trailing chunk keeps only as many output bytes as it
//! has input bytes. This has to match cryptsetup bit for bit.

use zeroize::Zeroizing;

use crate::{hash::HashAlgorithm, Error};

/// Diffuse `buf` in place
fn diffuse(hash: HashAlgorithm, buf: &mut [u8]) {
    let digest_size = hash.output_size();
    for (index, chunk) in buf.chunks_mut(digest_size).enumerate() {
        let digest = hash.digest(&[&(index as u32).to_be_bytes(), chunk]);
        let len = chunk.len();
        chunk.copy_from_slice(&digest[..len]);
    }
}

fn xor_into(acc: &mut [u8], block: &[u8]) {
    for (a, b) in acc.iter_mut().zip(block) {
        *a ^= b;
    }
}

/// Recover a key of `key_size` bytes from its `stripes` AF blocks
///
/// `striped` must hold exactly `stripes * key_size` bytes. A wrong input never fails here; it
/// merges into a wrong key that is only caught by digest verification.
pub fn merge(
    striped: &[u8],
    stripes: usize,
    key_size: usize,
    hash: HashAlgorithm,
) -> Result<Zeroizing<Vec<u8>>, Error> {
    if stripes == 0 || key_size == 0 {
        return Err(Error::MetadataInconsistent(format!(
            "cannot merge {stripes} stripes of {key_size} bytes"
        )));
    }
    let expected = stripes
        .checked_mul(key_size)
        .ok_or_else(|| Error::MetadataInconsistent("AF material size overflows".into()))?;
    if striped.len() != expected {
        return Err(Error::MetadataInconsistent(format!(
            "AF material is {} bytes, expected {expected}",
            striped.len()
        )));
    }

    let mut acc = Zeroizing::new(vec![0u8; key_size]);
    let (blocks, last) = striped.split_at(expected - key_size);
    for block in blocks.chunks_exact(key_size) {
        xor_into(&mut acc, block);
        diffuse(hash, &mut acc);
    }
    xor_into(&mut acc, last);

    Ok(acc)
}

/// Expand `key` into `stripes` AF blocks, drawing the random blocks from `fill`
#[cfg(test)]
pub(crate) fn split(key: &[u8], stripes: usize, hash: HashAlgorithm, mut fill: impl FnMut(&mut [u8])) -> Vec<u8> {
    assert!(stripes > 0);
    let key_size = key.len();
    let mut out = vec![0u8; stripes * key_size];
    let mut acc = vec![0u8; key_size];
    let (blocks, last) = out.split_at_mut((stripes - 1) * key_size);
    for block in blocks.chunks_exact_mut(key_size) {
        fill(block);
        xor_into(&mut acc, block);
        diffuse(hash, &mut acc);
    }
    last.copy_from_slice(key);
    xor_into(last, &acc);
    out
}
