//! Counterpart decrypt/verify contract.
//!
//! The harness models the companion verifying library a payment network's
//! merchants would run: symmetric-key derivation from the ECDH shared
//! secret, merchant-identifier extraction from the issued certificate, and
//! the full decrypt-and-verify inverse of the encrypt-then-sign flow. The
//! core crypto engine only calls [`symmetric_key`] and [`merchant_id`];
//! [`decrypt`] exists so round trips can be exercised end to end.

use std::time::{SystemTime, UNIX_EPOCH};

use openssl::asn1::Asn1Time;
use openssl::pkey::{PKey, Private};
use openssl::x509::X509;
use sha2::{Digest, Sha256};
use tracing::debug;

use crate::crypto;
use crate::error::{Error, Result};
use crate::helper::{self, MERCHANT_ID_SIZE};
use crate::signature::TokenSignature;
use crate::token::Token;
use crate::token_data::TokenData;

/// OID of the merchant-identifier certificate extension.
const MERCHANT_ID_OID: &str = "1.2.840.113635.100.6.32";
/// OID of the leaf protocol-identifying extension.
const LEAF_OID: &str = "1.2.840.113635.100.6.29";
/// OID of the intermediate protocol-identifying extension.
const INTERMEDIATE_OID: &str = "1.2.840.113635.100.6.2.14";

/// Derive the 32-byte AES key from the ECDH shared secret and the merchant
/// identifier: the NIST SP 800-56A single-step KDF with SHA-256, counter 1,
/// AlgorithmID `0x0D || "id-aes256-GCM"`, PartyU `"Apple"`, PartyV the
/// merchant identifier.
pub fn symmetric_key(shared_secret: &[u8], merchant_id: &[u8; MERCHANT_ID_SIZE]) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update([0u8, 0, 0, 1]); // counter
    hasher.update(shared_secret);
    hasher.update([0x0D]); // AlgorithmID length prefix
    hasher.update(b"id-aes256-GCM");
    hasher.update(b"Apple");
    hasher.update(merchant_id);
    hasher.finalize().into()
}

/// Extract the 32-byte merchant identifier from the certificate's
/// merchant-identifier extension (64 ASCII hex characters).
pub fn merchant_id(certificate: &X509) -> Result<[u8; MERCHANT_ID_SIZE]> {
    let der = certificate.to_der()?;
    let value = extension_value(&der, MERCHANT_ID_OID)?.ok_or_else(|| {
        Error::InvalidArgument("certificate has no merchant identifier extension".to_string())
    })?;

    let hex_str = std::str::from_utf8(value).map_err(|_| {
        Error::InvalidArgument("merchant identifier extension is not ASCII hex".to_string())
    })?;
    helper::merchant_id_from_str(hex_str)
}

/// Whether the certificate carries the protocol extension with `oid`.
fn has_extension(certificate: &X509, oid: &str) -> Result<bool> {
    Ok(extension_value(&certificate.to_der()?, oid)?.is_some())
}

/// Decrypt and verify a token for a merchant.
///
/// Verifies the detached signature (every signer's chain must end in a
/// certificate identical to the trusted CA, the signing certificate must
/// carry the leaf protocol extension and its issuer the intermediate one),
/// checks the merchant certificate's validity window against `now`, then
/// inverts the ECDH/KDF/AEAD pipeline and parses the cleartext payload.
pub fn decrypt(
    token: &Token,
    key: &PKey<Private>,
    certificate: &X509,
    ca_certificate_pem: &str,
    now: SystemTime,
) -> Result<TokenData> {
    let trusted_ca = X509::from_pem(ca_certificate_pem.as_bytes())?;
    verify_signature(token, &trusted_ca)?;
    check_validity(certificate, now)?;

    let ephemeral = token.header.ephemeral_pubkey.as_ref().ok_or_else(|| {
        Error::ProtocolState("token has no ephemeral_pubkey".to_string())
    })?;
    let encrypted = token.encrypted_data.as_ref().ok_or_else(|| {
        Error::ProtocolState("token has no encrypted_data".to_string())
    })?;

    let ephemeral_key = helper::ec_point_to_public_key(ephemeral)?;
    let shared_secret = crypto::derive_shared_secret(key, &ephemeral_key)?;
    let aes_key = symmetric_key(&shared_secret, &merchant_id(certificate)?);

    let plaintext = helper::aead_decrypt(encrypted, &aes_key)?;
    debug!("decrypted token payload");
    TokenData::from_json(&plaintext)
}

/// Verify the token's detached signature against the trusted CA.
pub fn verify_signature(token: &Token, trusted_ca: &X509) -> Result<()> {
    let encoded = token.signature.as_ref().ok_or_else(|| {
        Error::ProtocolState("token has no signature".to_string())
    })?;
    let signature = TokenSignature::decode(encoded)?;

    let message = crypto::signed_message(token)?;
    signature.verify(&message)?;

    let trusted_der = trusted_ca.to_der()?;
    for signer in &signature.signers {
        let certificates = signer.certificates()?;
        let signing_cert = certificates.first().ok_or_else(|| {
            Error::InvalidArgument("signer carries an empty certificate chain".to_string())
        })?;

        if !has_extension(signing_cert, LEAF_OID)? {
            return Err(Error::InvalidArgument(
                "signing certificate lacks the leaf protocol extension".to_string(),
            ));
        }
        if let Some(intermediate) = certificates.get(1) {
            if !has_extension(intermediate, INTERMEDIATE_OID)? {
                return Err(Error::InvalidArgument(
                    "issuer certificate lacks the intermediate protocol extension".to_string(),
                ));
            }
        }

        let root = certificates.last().ok_or_else(|| {
            Error::InvalidArgument("signer carries an empty certificate chain".to_string())
        })?;
        if root.to_der()? != trusted_der {
            return Err(Error::InvalidArgument(
                "signer chain does not end at the trusted ca".to_string(),
            ));
        }
    }

    Ok(())
}

/// The certificate must cover `now`.
fn check_validity(certificate: &X509, now: SystemTime) -> Result<()> {
    let ts = now
        .duration_since(UNIX_EPOCH)
        .map_err(|_| Error::InvalidArgument("time before unix epoch".to_string()))?
        .as_secs() as i64;
    let now_asn1 = Asn1Time::from_unix(ts)?;

    if certificate.not_before() > now_asn1 || certificate.not_after() < now_asn1 {
        return Err(Error::InvalidArgument(
            "certificate is not valid at the given time".to_string(),
        ));
    }
    Ok(())
}

/// Locate an extension's value inside a certificate's DER encoding.
///
/// Scans for the DER encoding of `oid` and reads the OCTET STRING that
/// follows it (skipping an optional criticality BOOLEAN). Sufficient for the
/// certificates this harness issues, where the protocol OIDs appear only as
/// extension identifiers.
fn extension_value<'a>(der: &'a [u8], oid: &str) -> Result<Option<&'a [u8]>> {
    let needle = encode_oid(oid)?;

    let mut search_from = 0;
    while let Some(offset) = find(&der[search_from..], &needle) {
        let mut pos = search_from + offset + needle.len();

        // Optional BOOLEAN critical flag.
        if der.get(pos) == Some(&0x01) && der.get(pos + 1) == Some(&0x01) {
            pos += 3;
        }

        // extnValue OCTET STRING.
        if der.get(pos) == Some(&0x04) {
            if let Some((length, header)) = read_der_length(&der[pos + 1..]) {
                let start = pos + 1 + header;
                let end = start + length;
                if end <= der.len() {
                    return Ok(Some(&der[start..end]));
                }
            }
        }

        search_from += offset + 1;
    }
    Ok(None)
}

/// DER-encode a dotted OID including its tag and length.
fn encode_oid(oid: &str) -> Result<Vec<u8>> {
    let arcs: Vec<u64> = oid
        .split('.')
        .map(|part| {
            part.parse()
                .map_err(|_| Error::InvalidArgument(format!("invalid oid: {oid}")))
        })
        .collect::<Result<_>>()?;
    if arcs.len() < 2 || arcs[0] > 2 || (arcs[0] < 2 && arcs[1] > 39) {
        return Err(Error::InvalidArgument(format!("invalid oid: {oid}")));
    }

    let mut body = vec![];
    encode_base128(&mut body, arcs[0] * 40 + arcs[1]);
    for &arc in &arcs[2..] {
        encode_base128(&mut body, arc);
    }

    let mut out = vec![0x06, body.len() as u8];
    out.extend_from_slice(&body);
    Ok(out)
}

fn encode_base128(out: &mut Vec<u8>, mut value: u64) {
    let mut stack = [0u8; 10];
    let mut idx = 0;
    loop {
        stack[idx] = (value & 0x7F) as u8;
        value >>= 7;
        idx += 1;
        if value == 0 {
            break;
        }
    }
    while idx > 1 {
        idx -= 1;
        out.push(stack[idx] | 0x80);
    }
    out.push(stack[0]);
}

fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack.windows(needle.len()).position(|window| window == needle)
}

/// Parse a DER length; returns (length, header byte count).
fn read_der_length(bytes: &[u8]) -> Option<(usize, usize)> {
    let first = *bytes.first()?;
    if first < 0x80 {
        return Some((first as usize, 1));
    }
    let count = (first & 0x7F) as usize;
    if count == 0 || count > 4 || bytes.len() < 1 + count {
        return None;
    }
    let mut length = 0usize;
    for &b in &bytes[1..=count] {
        length = (length << 8) | b as usize;
    }
    Some((length, 1 + count))
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    use crate::authority::CertificateAuthority;
    use crate::configs::Config;
    use crate::helper::Recipient;

    #[test]
    fn test_oid_encoding() {
        // 1.2.840.113635.100.6.32 is the merchant-identifier arc.
        assert_eq!(
            encode_oid("1.2.840.113635.100.6.32").unwrap(),
            vec![0x06, 0x09, 0x2A, 0x86, 0x48, 0x86, 0xF7, 0x63, 0x64, 0x06, 0x20]
        );
        assert_eq!(encode_oid("2.5.29.35").unwrap(), vec![0x06, 0x03, 0x55, 0x1D, 0x23]);
        assert!(encode_oid("not.an.oid").is_err());
    }

    #[test]
    fn test_symmetric_key_is_deterministic() {
        let secret = [0x11u8; 32];
        let id = [0x22u8; 32];
        let key1 = symmetric_key(&secret, &id);
        let key2 = symmetric_key(&secret, &id);
        assert_eq!(key1, key2);
        assert_ne!(key1, symmetric_key(&[0x12u8; 32], &id));
        assert_ne!(key1, symmetric_key(&secret, &[0x23u8; 32]));
    }

    #[test]
    fn test_merchant_id_extraction() {
        let config = Config::default().with_random(StdRng::seed_from_u64(20));
        let authority = CertificateAuthority::generate(&config).unwrap();
        let client = authority.generate_client(&config.validity).unwrap();

        let id = merchant_id(client.certificate.as_ref().unwrap()).unwrap();
        assert_eq!(id.len(), 32);

        // A certificate without the extension is rejected.
        let ca_cert = &authority.ca.as_ref().unwrap().certificate;
        assert!(matches!(merchant_id(ca_cert), Err(Error::InvalidArgument(_))));
    }

    #[test]
    fn test_protocol_extensions_present() {
        let authority = CertificateAuthority::generate(&Config::default()).unwrap();
        let leaf = &authority.leaf.as_ref().unwrap().certificate;
        let intermediate = &authority.intermediate.as_ref().unwrap().certificate;

        assert!(has_extension(leaf, LEAF_OID).unwrap());
        assert!(!has_extension(leaf, INTERMEDIATE_OID).unwrap());
        assert!(has_extension(intermediate, INTERMEDIATE_OID).unwrap());
    }

    #[test]
    fn test_full_round_trip() {
        let config = Config::default().with_random(StdRng::seed_from_u64(21));
        let authority = CertificateAuthority::generate(&config).unwrap();
        let client = authority.generate_client(&config.validity).unwrap();

        let mut token = Token::sample(&config).unwrap();
        let original = token.unencrypted_data.clone().unwrap();

        crypto::encrypt(&mut token, &Recipient::Client(&client), None, None).unwrap();
        authority.sign_token(&mut token).unwrap();

        let decrypted = client.decrypt(&token, SystemTime::now()).unwrap();
        assert_eq!(decrypted, original);
    }

    #[test]
    fn test_round_trip_rejects_ciphertext_corruption() {
        let config = Config::default().with_random(StdRng::seed_from_u64(22));
        let authority = CertificateAuthority::generate(&config).unwrap();
        let client = authority.generate_client(&config.validity).unwrap();

        let mut token = Token::sample(&config).unwrap();
        crypto::encrypt(&mut token, &Recipient::Client(&client), None, None).unwrap();
        authority.sign_token(&mut token).unwrap();

        // Corrupt the payload after signing: both the signature check and
        // (with a re-signed token) AEAD authentication must reject it.
        if let Some(data) = token.encrypted_data.as_mut() {
            data[0] ^= 0x01;
        }
        assert!(client.decrypt(&token, SystemTime::now()).is_err());
    }

    #[test]
    fn test_decrypt_rejects_untrusted_ca() {
        let config = Config::default().with_random(StdRng::seed_from_u64(23));
        let authority = CertificateAuthority::generate(&config).unwrap();
        let other = CertificateAuthority::generate(&config).unwrap();
        let mut client = authority.generate_client(&config.validity).unwrap();

        let mut token = Token::sample(&config).unwrap();
        crypto::encrypt(&mut token, &Recipient::Client(&client), None, None).unwrap();
        authority.sign_token(&mut token).unwrap();

        // Swap in a different trust anchor.
        let other_ca_pem = other.ca.as_ref().unwrap().certificate.to_pem().unwrap();
        client.ca_certificate_pem = Some(String::from_utf8(other_ca_pem).unwrap());
        assert!(client.decrypt(&token, SystemTime::now()).is_err());
    }

    #[test]
    fn test_decrypt_rejects_expired_window() {
        let config = Config::default().with_random(StdRng::seed_from_u64(24));
        let authority = CertificateAuthority::generate(&config).unwrap();
        let client = authority.generate_client(&config.validity).unwrap();

        let mut token = Token::sample(&config).unwrap();
        crypto::encrypt(&mut token, &Recipient::Client(&client), None, None).unwrap();
        authority.sign_token(&mut token).unwrap();

        // Far beyond not_after.
        let future = SystemTime::now() + std::time::Duration::from_secs(10 * 365 * 86_400);
        assert!(client.decrypt(&token, future).is_err());
    }
}
