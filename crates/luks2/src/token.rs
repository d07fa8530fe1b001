// SPDX-FileCopyrightText: Copyright © 2025 Serpent OS Developers
//
// SPDX-License-Identifier: MPL-2.0

//! LUKS2 tokens
//!
//! Tokens carry data for external unlock helpers. Only a few types are understood here; anything
//! else, and any known token whose type-specific fields fail to decode, is kept as
//! [`TokenData::Raw`]. The JSON text of every token is kept exactly as it appears on disk.

use log::debug;
use serde::Deserialize;
use serde_json::value::RawValue;
use serde_with::{serde_as, DisplayFromStr, PickFirst};

/// Known token types
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TokenType {
    /// Clevis pin binding (`clevis`)
    Clevis,
    /// Kernel keyring passphrase reference (`luks2-keyring`)
    Keyring,
    /// Anything else
    Unknown,
}

impl TokenType {
    pub fn from_name(name: &str) -> Self {
        match name {
            "clevis" => Self::Clevis,
            "luks2-keyring" => Self::Keyring,
            _ => Self::Unknown,
        }
    }
}

/// JWE envelope of a Clevis token, fields kept as encoded strings
#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize)]
pub struct Jwe {
    #[serde(default)]
    pub ciphertext: String,
    #[serde(default)]
    pub encrypted_key: String,
    #[serde(default)]
    pub iv: String,
    #[serde(default)]
    pub protected: String,
    #[serde(default)]
    pub tag: String,
}

#[derive(Clone, Debug, PartialEq, Eq, Deserialize)]
pub struct ClevisToken {
    pub jwe: Jwe,
}

#[derive(Clone, Debug, PartialEq, Eq, Deserialize)]
pub struct KeyringToken {
    pub key_description: String,
}

/// Type-specific token content
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum TokenData {
    Clevis(ClevisToken),
    Keyring(KeyringToken),
    /// Not decoded, see [`Token::payload`]
    Raw { type_name: String },
}

/// The `type` field every token carries
#[derive(Deserialize)]
struct TypeField {
    #[serde(rename = "type")]
    token_type: String,
}

/// The `keyslots` field every token carries
#[serde_as]
#[derive(Deserialize)]
struct KeyslotsField {
    #[serde_as(as = "Vec<PickFirst<(_, DisplayFromStr)>>")]
    #[serde(default)]
    keyslots: Vec<u32>,
}

/// A token from the metadata `tokens` object
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Token {
    /// Token id
    pub id: u32,
    /// Keyslots the token is bound to
    pub slots: Vec<u32>,
    pub data: TokenData,
    /// The token JSON, byte for byte
    pub payload: Vec<u8>,
}

impl Token {
    pub fn token_type(&self) -> TokenType {
        match &self.data {
            TokenData::Clevis(_) => TokenType::Clevis,
            TokenData::Keyring(_) => TokenType::Keyring,
            TokenData::Raw { .. } => TokenType::Unknown,
        }
    }

    /// Decode token `id`, degrading to [`TokenData::Raw`] instead of failing
    pub fn from_raw(id: u32, raw: &RawValue) -> Self {
        let text = raw.get();
        let type_name = serde_json::from_str::<TypeField>(text)
            .map(|field| field.token_type)
            .unwrap_or_else(|e| {
                debug!("token {id}: cannot decode type: {e}");
                String::new()
            });
        let slots = serde_json::from_str::<KeyslotsField>(text)
            .map(|field| field.keyslots)
            .unwrap_or_else(|e| {
                debug!("token {id}: cannot decode keyslots: {e}");
                Vec::new()
            });

        let decoded = match TokenType::from_name(&type_name) {
            TokenType::Clevis => serde_json::from_str(text).map(TokenData::Clevis),
            TokenType::Keyring => serde_json::from_str(text).map(TokenData::Keyring),
            TokenType::Unknown => Ok(TokenData::Raw {
                type_name: type_name.clone(),
            }),
        };
        let data = decoded.unwrap_or_else(|e| {
            debug!("token {id}: keeping {type_name} token raw: {e}");
            TokenData::Raw { type_name }
        });

        Self {
            id,
            slots,
            data,
            payload: text.as_bytes().to_vec(),
        }
    }
}
