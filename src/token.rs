//! EC_v1 payment token: header metadata, encrypted payload, detached
//! signature, and the JSON wire layout.
//!
//! A token starts out with only cleartext data, gains `encrypted_data` and
//! the header's ephemeral key through [`crypto::encrypt`](crate::crypto::encrypt),
//! and gains its `signature` through [`crypto::sign`](crate::crypto::sign).
//! Wire emission requires the encryption step to have happened.

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::configs::Config;
use crate::error::{Error, Result};
use crate::helper::{self, Recipient};
use crate::token_data::TokenData;

/// Protocol version tag carried by every token.
pub const TOKEN_VERSION: &str = "EC_v1";

/// Number of random bytes in a sampled transaction id.
const TRANSACTION_ID_SIZE: usize = 5;

/// A payment token in any stage of assembly.
#[derive(Debug, Clone, Default)]
pub struct Token {
    /// Cleartext payload; serialized to JSON bytes before encryption.
    pub unencrypted_data: Option<TokenData>,
    /// Ciphertext concatenated with the 16-byte authentication tag.
    pub encrypted_data: Option<Vec<u8>>,
    pub header: TokenHeader,
    /// Base64-encoded detached multi-signer signature, absent until signing.
    pub signature: Option<String>,
}

impl Token {
    pub fn new(unencrypted_data: TokenData, header: TokenHeader) -> Self {
        Self {
            unencrypted_data: Some(unencrypted_data),
            encrypted_data: None,
            header,
            signature: None,
        }
    }

    /// Populate missing sample fields: cleartext payload and header
    /// transaction id.
    pub fn sample(config: &Config) -> Result<Self> {
        let mut header = TokenHeader::default();
        header.sample(config);
        Ok(Self {
            unencrypted_data: Some(TokenData::sample(config)?),
            encrypted_data: None,
            header,
            signature: None,
        })
    }

    /// Recompute the header's public-key hash: the SHA-256 hex digest of the
    /// recipient certificate's DER encoding, binding the token to one
    /// merchant.
    pub fn update_pubkey_hash(&mut self, recipient: &Recipient<'_>) -> Result<()> {
        let certificate = helper::recipient_certificate(recipient)?;
        let digest = Sha256::digest(certificate.to_der()?);
        self.header.pubkey_hash = Some(hex::encode(digest));
        Ok(())
    }

    /// Emit the wire-format object. Fails unless the token has been
    /// encrypted.
    pub fn to_wire(&self) -> Result<TokenWire> {
        let encrypted = self.encrypted_data.as_ref().ok_or_else(|| {
            Error::ProtocolState("token has no encrypted_data".to_string())
        })?;

        Ok(TokenWire {
            data: BASE64.encode(encrypted),
            header: self.header.to_wire()?,
            signature: self.signature.clone(),
            version: TOKEN_VERSION.to_string(),
        })
    }

    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string(&self.to_wire()?)?)
    }
}

/// Token header metadata.
#[derive(Debug, Clone, Default)]
pub struct TokenHeader {
    /// One-shot EC point produced for this token (uncompressed SEC1 bytes).
    pub ephemeral_pubkey: Option<Vec<u8>>,
    /// SHA-256 hex digest of the recipient certificate's DER encoding.
    pub pubkey_hash: Option<String>,
    /// Random bytes; hex-encoded on the wire.
    pub transaction_id: Option<Vec<u8>>,
    /// Application-specific hash; included in the signed message and on the
    /// wire only when present.
    pub data_hash: Option<String>,
}

impl TokenHeader {
    /// Fill in a random transaction id if one is not already set.
    pub fn sample(&mut self, config: &Config) {
        if self.transaction_id.is_none() {
            self.transaction_id = Some(config.random_bytes(TRANSACTION_ID_SIZE));
        }
    }

    /// Emit the wire-format header. The public-key hash must already be
    /// computed; deriving it lazily from a recipient is the caller's job.
    pub fn to_wire(&self) -> Result<TokenHeaderWire> {
        let ephemeral = self.ephemeral_pubkey.as_ref().ok_or_else(|| {
            Error::ProtocolState("token header has no ephemeral_pubkey".to_string())
        })?;
        let pubkey_hash = self.pubkey_hash.clone().ok_or_else(|| {
            Error::ProtocolState("token header has no pubkey_hash".to_string())
        })?;
        let transaction_id = self.transaction_id.as_ref().ok_or_else(|| {
            Error::ProtocolState("token header has no transaction_id".to_string())
        })?;

        // The raw point is re-encoded as a standalone DER public key.
        let spki = helper::ec_point_to_public_key(ephemeral)?.public_key_to_der()?;

        Ok(TokenHeaderWire {
            ephemeral_public_key: BASE64.encode(spki),
            public_key_hash: pubkey_hash,
            transaction_id: hex::encode(transaction_id),
            application_data: self.data_hash.clone(),
        })
    }
}

/// JSON wire layout of a token.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TokenWire {
    pub data: String,
    pub header: TokenHeaderWire,
    pub signature: Option<String>,
    pub version: String,
}

/// JSON wire layout of a token header.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TokenHeaderWire {
    pub ephemeral_public_key: String,
    pub public_key_hash: String,
    pub transaction_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub application_data: Option<String>,
}
