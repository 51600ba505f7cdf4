//! Token cryptography: ECDH shared secrets, ephemeral keys, payload
//! encryption, and the detached multi-signer countersignature.
//!
//! # Flow
//! ```text
//! generate_ephemeral(recipient)          -> (shared secret, ephemeral point)
//! encrypt(token, recipient, ...)         -> token.encrypted_data + header
//! sign(token, leaf cert, leaf key, chain) -> token.signature
//! ```
//!
//! The symmetric key is derived from the shared secret and the recipient's
//! merchant identifier by the counterpart KDF; the ephemeral private key is
//! discarded as soon as the secret is derived, so compromise of stored
//! material never recovers past tokens.

use openssl::derive::Deriver;
use openssl::ec::{EcGroup, EcKey, PointConversionForm};
use openssl::pkey::{HasPrivate, HasPublic, PKey, PKeyRef};
use openssl::x509::{X509Ref, X509};
use tracing::debug;

use crate::error::{Error, Result};
use crate::helper::{self, Recipient};
use crate::signature::TokenSignature;
use crate::token::Token;
use crate::verifier;
use crate::EC_CURVE;

/// Standard ECDH scalar multiplication on the fixed curve.
pub fn derive_shared_secret<T, U>(
    private_key: &PKeyRef<T>,
    peer_public_key: &PKeyRef<U>,
) -> Result<Vec<u8>>
where
    T: HasPrivate,
    U: HasPublic,
{
    let mut deriver = Deriver::new(private_key)?;
    deriver.set_peer(peer_public_key)?;
    Ok(deriver.derive_to_vec()?)
}

/// Generate a one-shot key pair, compute the shared secret against the
/// recipient, and return the secret with the ephemeral public point. The
/// ephemeral private key is dropped here — forward secrecy.
pub fn generate_ephemeral(recipient: &Recipient<'_>) -> Result<(Vec<u8>, Vec<u8>)> {
    let peer = helper::recipient_public_key(recipient)?;

    let group = EcGroup::from_curve_name(EC_CURVE)?;
    let ephemeral = EcKey::generate(&group)?;
    let mut ctx = openssl::bn::BigNumContext::new()?;
    let point_bytes =
        ephemeral
            .public_key()
            .to_bytes(&group, PointConversionForm::UNCOMPRESSED, &mut ctx)?;

    let ephemeral_key = PKey::from_ec_key(ephemeral)?;
    let shared_secret = derive_shared_secret(&ephemeral_key, &peer)?;

    Ok((shared_secret, point_bytes))
}

/// Encrypt the token's cleartext payload for `recipient`.
///
/// If neither `shared_secret` nor `ephemeral_pubkey` is supplied, a fresh
/// pair is generated against the recipient. A supplied pair is used as-is —
/// no check is performed that the two values come from the same ephemeral
/// key; that consistency is a documented trust assumption, not a guarantee.
/// Supplying only one of the two is a caller error: they must travel
/// together.
///
/// On success the token's `encrypted_data`, `header.ephemeral_pubkey`, and
/// `header.pubkey_hash` are set.
pub fn encrypt(
    token: &mut Token,
    recipient: &Recipient<'_>,
    shared_secret: Option<Vec<u8>>,
    ephemeral_pubkey: Option<Vec<u8>>,
) -> Result<()> {
    let (shared_secret, ephemeral_pubkey) = match (shared_secret, ephemeral_pubkey) {
        (Some(secret), Some(pubkey)) => (secret, pubkey),
        (None, None) => generate_ephemeral(recipient)?,
        _ => {
            return Err(Error::InvalidArgument(
                "'shared_secret' and 'ephemeral_pubkey' must be supplied together".to_string(),
            ))
        }
    };

    let merchant_id = helper::merchant_id(recipient)?;
    let symmetric_key = verifier::symmetric_key(&shared_secret, &merchant_id);

    let data = token.unencrypted_data.as_ref().ok_or_else(|| {
        Error::ProtocolState("token has no unencrypted_data".to_string())
    })?;
    let plaintext = data.to_json()?;

    token.encrypted_data = Some(helper::aead_encrypt(plaintext.as_bytes(), &symmetric_key)?);
    token.header.ephemeral_pubkey = Some(ephemeral_pubkey);
    token.update_pubkey_hash(recipient)?;

    debug!("encrypted token payload");
    Ok(())
}

/// The exact byte layout countersigned by every signer: DER encoding of a
/// standalone public key reconstructed from the ephemeral point, then the
/// encrypted payload, then the raw transaction-id bytes, then the raw
/// application-data-hash bytes. Absent optional fields are skipped, never
/// replaced by a placeholder — independent verifiers reproduce this layout
/// byte for byte.
pub fn signed_message(token: &Token) -> Result<Vec<u8>> {
    let ephemeral = token.header.ephemeral_pubkey.as_ref().ok_or_else(|| {
        Error::ProtocolState("token has no ephemeral_pubkey".to_string())
    })?;
    let encrypted = token.encrypted_data.as_ref().ok_or_else(|| {
        Error::ProtocolState("token has no encrypted_data".to_string())
    })?;

    let mut message = helper::ec_point_to_public_key(ephemeral)?.public_key_to_der()?;
    message.extend_from_slice(encrypted);
    if let Some(transaction_id) = &token.header.transaction_id {
        message.extend_from_slice(transaction_id);
    }
    if let Some(data_hash) = &token.header.data_hash {
        message.extend_from_slice(data_hash.as_bytes());
    }
    Ok(message)
}

/// Produce the detached countersignature over [`signed_message`] with the
/// leaf key, attaching `chain` (intermediate then CA) for verification.
///
/// Requires the token to be encrypted first. If the token already carries a
/// signature, the new signer is added to the existing structure — tokens
/// support multiple simultaneous signers over the same message.
pub fn sign(
    token: &mut Token,
    certificate: &X509Ref,
    key: &PKeyRef<openssl::pkey::Private>,
    chain: &[X509],
) -> Result<()> {
    let message = signed_message(token)?;

    let mut signature = match &token.signature {
        Some(existing) => TokenSignature::decode(existing)?,
        None => TokenSignature::new(),
    };
    signature.add_signer(certificate, key, chain, &message)?;
    token.signature = Some(signature.encode()?);

    debug!(signers = signature.signers.len(), "signed token");
    Ok(())
}
