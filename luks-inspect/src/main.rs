// SPDX-FileCopyrightText: Copyright © 2025 Serpent OS Developers
//
// SPDX-License-Identifier: MPL-2.0

use log::{info, warn};
use std::{env, io, process::ExitCode};

use luks2::{Device, Error, TokenData};

/// Print the header, keyslots and tokens of an opened device
fn describe<R>(device: &Device<R>) {
    println!("Device:    {}", device.path().display());
    println!("Version:   {}", device.version());
    println!("UUID:      {}", device.uuid());
    println!("Label:     {}", device.label());
    println!("Flags:     {}", device.flags().join(", "));

    println!("Keyslots:");
    for slot in device.slots() {
        let Some(keyslot) = device.keyslot(slot) else {
            continue;
        };
        let kdf = keyslot.kdf.as_ref().map_or("-", |kdf| kdf.kdf_type.as_str());
        println!(
            "  {slot}: {} key_size={} kdf={kdf} priority={:?}",
            keyslot.slot_type,
            keyslot.key_size,
            keyslot.priority()
        );
    }

    println!("Segments:");
    for (id, segment) in device.segments() {
        println!(
            "  {id}: {} offset={} size={:?} cipher={}",
            segment.segment_type,
            segment.offset,
            segment.size,
            segment.encryption.as_deref().unwrap_or("-")
        );
    }

    println!("Tokens:");
    for token in device.tokens() {
        let kind = match &token.data {
            TokenData::Clevis(_) => "clevis".to_owned(),
            TokenData::Keyring(keyring) => format!("luks2-keyring ({})", keyring.key_description),
            TokenData::Raw { type_name } => format!("{type_name} (raw)"),
        };
        println!("  {}: {kind} keyslots={:?}", token.id, token.slots);
    }
}

/// Read a single line passphrase from stdin, without its line ending
fn read_passphrase() -> io::Result<String> {
    let mut line = String::new();
    io::stdin().read_line(&mut line)?;
    Ok(line.trim_end_matches(['\r', '\n']).to_owned())
}

fn run(path: &str, slot: Option<u32>) -> Result<(), Box<dyn std::error::Error>> {
    info!("Opening {path}");
    let mut device = luks2::open(path)?;
    describe(&device);

    let Some(slot) = slot else {
        return Ok(());
    };

    let passphrase = read_passphrase()?;
    match device.unlock(slot, passphrase.as_bytes()) {
        Ok(volume) => {
            info!("Keyslot {slot} unlocked");
            println!(
                "Volume:    {} offset={} size={} sector_size={}",
                volume.cipher, volume.offset, volume.size, volume.sector_size
            );
        }
        Err(Error::UnmetRequirement(requirement)) => {
            warn!("Cannot map volume ({requirement}), verifying passphrase only");
            device.decrypt_keyslot(slot, passphrase.as_bytes())?;
            info!("Keyslot {slot} unlocked");
        }
        Err(e) => return Err(e.into()),
    }
    Ok(())
}

fn main() -> ExitCode {
    pretty_env_logger::formatted_timed_builder()
        .filter_level(log::LevelFilter::Debug)
        .parse_default_env()
        .init();

    let args = env::args().skip(1).collect::<Vec<_>>();
    let (path, slot) = match args.as_slice() {
        [path] => (path, None),
        [path, slot] => match slot.parse() {
            Ok(slot) => (path, Some(slot)),
            Err(_) => {
                eprintln!("invalid keyslot: {slot}");
                return ExitCode::FAILURE;
            }
        },
        _ => {
            eprintln!("usage: luks-inspect <device> [keyslot]");
            return ExitCode::FAILURE;
        }
    };

    match run(path, slot) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("luks-inspect: {e}");
            ExitCode::FAILURE
        }
    }
}
