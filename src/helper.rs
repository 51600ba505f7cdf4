//! Low-level key/certificate helpers.
//!
//! Byte-level conversions, the closed recipient union used by the token
//! crypto operations, and the AEAD primitive shared by encryption and the
//! counterpart decryption path. No state lives here.

use openssl::bn::BigNumContext;
use openssl::ec::{EcGroup, EcKey, EcPoint};
use openssl::pkey::{PKey, Public};
use openssl::symm::{decrypt_aead, encrypt_aead, Cipher};
use openssl::x509::X509;

use crate::client::MerchantClient;
use crate::error::{Error, Result};
use crate::verifier;
use crate::EC_CURVE;

/// AES-GCM IV length used by the EC_v1 scheme. The IV is all zeroes; this is
/// only sound because every symmetric key is derived from a fresh ephemeral
/// key and never reused. Keep key-freshness and the zero IV coupled; do not
/// reuse this helper anywhere a key could repeat.
pub const AEAD_IV_SIZE: usize = 16;
/// AES-GCM authentication tag length.
pub const AEAD_TAG_SIZE: usize = 16;
/// Merchant identifiers are always 32 bytes.
pub const MERCHANT_ID_SIZE: usize = 32;

/// Recipient of an encrypted token.
///
/// The token crypto operations accept a merchant client, a bare certificate,
/// or a raw uncompressed P-256 point; anything else is a caller error, so
/// the union is closed.
#[derive(Debug, Clone, Copy)]
pub enum Recipient<'a> {
    Client(&'a MerchantClient),
    Certificate(&'a X509),
    /// Uncompressed SEC1 point bytes (0x04 || x || y).
    Point(&'a [u8]),
}

/// Convert a raw uncompressed EC point into a standalone public-key object.
///
/// The result carries the full SubjectPublicKeyInfo structure, so it can be
/// DER-encoded for the signed-message layout and the wire header.
pub fn ec_point_to_public_key(point_bytes: &[u8]) -> Result<PKey<Public>> {
    let group = EcGroup::from_curve_name(EC_CURVE)?;
    let mut ctx = BigNumContext::new()?;
    let point = EcPoint::from_bytes(&group, point_bytes, &mut ctx)?;
    let key = EcKey::from_public_key(&group, &point)?;
    Ok(PKey::from_ec_key(key)?)
}

/// Extract the recipient's public key for ECDH.
pub fn recipient_public_key(recipient: &Recipient<'_>) -> Result<PKey<Public>> {
    match recipient {
        Recipient::Client(client) => Ok(client.require_certificate()?.public_key()?),
        Recipient::Certificate(cert) => Ok(cert.public_key()?),
        Recipient::Point(bytes) => ec_point_to_public_key(bytes),
    }
}

/// Extract the recipient's certificate, for operations that bind the token
/// to one merchant (public-key hash, merchant identifier).
pub fn recipient_certificate<'a>(recipient: &Recipient<'a>) -> Result<&'a X509> {
    match recipient {
        Recipient::Client(client) => client.require_certificate(),
        Recipient::Certificate(cert) => Ok(cert),
        Recipient::Point(_) => Err(Error::InvalidArgument(
            "recipient certificate required".to_string(),
        )),
    }
}

/// Resolve a recipient to its 32-byte merchant identifier.
pub fn merchant_id(recipient: &Recipient<'_>) -> Result<[u8; MERCHANT_ID_SIZE]> {
    verifier::merchant_id(recipient_certificate(recipient)?)
}

/// Parse a merchant identifier supplied directly as text: either 64 hex
/// characters or the raw 32-byte string. The format is auto-detected;
/// anything else is a caller error.
pub fn merchant_id_from_str(s: &str) -> Result<[u8; MERCHANT_ID_SIZE]> {
    if s.len() == 2 * MERCHANT_ID_SIZE && s.bytes().all(|b| b.is_ascii_hexdigit()) {
        let bytes = hex::decode(s)
            .map_err(|e| Error::InvalidArgument(format!("invalid merchant id hex: {e}")))?;
        let mut id = [0u8; MERCHANT_ID_SIZE];
        id.copy_from_slice(&bytes);
        return Ok(id);
    }

    if s.len() == MERCHANT_ID_SIZE {
        let mut id = [0u8; MERCHANT_ID_SIZE];
        id.copy_from_slice(s.as_bytes());
        return Ok(id);
    }

    Err(Error::InvalidArgument(
        "merchant id must be 64 hex characters or 32 raw bytes".to_string(),
    ))
}

/// AES-256-GCM encryption as the EC_v1 scheme does it: 16-byte all-zero IV,
/// empty associated data, ciphertext concatenated with the 16-byte tag.
///
/// See [`AEAD_IV_SIZE`] for why the constant IV is reproduced rather than
/// fixed.
pub fn aead_encrypt(data: &[u8], key: &[u8]) -> Result<Vec<u8>> {
    let iv = [0u8; AEAD_IV_SIZE];
    let mut tag = [0u8; AEAD_TAG_SIZE];
    let mut out = encrypt_aead(Cipher::aes_256_gcm(), key, Some(&iv), &[], data, &mut tag)?;
    out.extend_from_slice(&tag);
    Ok(out)
}

/// Inverse of [`aead_encrypt`]: split off the trailing tag and decrypt.
/// Fails authentication on any single-byte corruption.
pub fn aead_decrypt(data: &[u8], key: &[u8]) -> Result<Vec<u8>> {
    if data.len() < AEAD_TAG_SIZE {
        return Err(Error::InvalidArgument(
            "encrypted data shorter than the authentication tag".to_string(),
        ));
    }
    let (ciphertext, tag) = data.split_at(data.len() - AEAD_TAG_SIZE);
    let iv = [0u8; AEAD_IV_SIZE];
    Ok(decrypt_aead(
        Cipher::aes_256_gcm(),
        key,
        Some(&iv),
        &[],
        ciphertext,
        tag,
    )?)
}
