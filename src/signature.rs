//! Detached multi-signer signature over a token's signed-message bytes.
//!
//! The structure carries one message-digest algorithm and an ordered list of
//! signers, each with its own certificate chain and ECDSA signature over the
//! same message. Adding a signer never re-hashes or disturbs existing
//! entries, so tokens can accumulate signatures from independent leaf/key
//! pairs. One canonical encode/decode pair (JSON, then base64) moves the
//! structure on and off the wire.

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use openssl::hash::MessageDigest;
use openssl::pkey::{PKey, PKeyRef, Private};
use openssl::sign::{Signer, Verifier};
use openssl::x509::{X509Ref, X509};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{Error, Result};

const DIGEST_ALGORITHM: &str = "sha256";

/// One signer's contribution: its verification chain and its signature.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SignerInfo {
    /// Certificate chain as base64 DER, signing certificate first.
    pub chain: Vec<String>,
    /// Base64 DER-encoded ECDSA signature over the message.
    pub signature: String,
}

impl SignerInfo {
    /// Decode the signer's certificate chain, signing certificate first.
    pub fn certificates(&self) -> Result<Vec<X509>> {
        self.chain
            .iter()
            .map(|encoded| {
                let der = BASE64
                    .decode(encoded)
                    .map_err(|e| Error::InvalidArgument(format!("invalid certificate base64: {e}")))?;
                Ok(X509::from_der(&der)?)
            })
            .collect()
    }
}

/// Detached signature structure accumulating one or more signers.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TokenSignature {
    pub digest_algorithm: String,
    pub signers: Vec<SignerInfo>,
}

impl Default for TokenSignature {
    fn default() -> Self {
        Self::new()
    }
}

impl TokenSignature {
    pub fn new() -> Self {
        Self {
            digest_algorithm: DIGEST_ALGORITHM.to_string(),
            signers: Vec::new(),
        }
    }

    /// Append a signer: ECDSA-SHA256 over `message` with `key`, carrying
    /// `certificate` plus `chain` (intermediate then CA) for verification.
    /// Existing signers are untouched.
    pub fn add_signer(
        &mut self,
        certificate: &X509Ref,
        key: &PKeyRef<Private>,
        chain: &[X509],
        message: &[u8],
    ) -> Result<()> {
        let mut signer = Signer::new(MessageDigest::sha256(), key)?;
        let signature = signer.sign_oneshot_to_vec(message)?;

        let mut encoded_chain = vec![BASE64.encode(certificate.to_der()?)];
        for cert in chain {
            encoded_chain.push(BASE64.encode(cert.to_der()?));
        }

        self.signers.push(SignerInfo {
            chain: encoded_chain,
            signature: BASE64.encode(signature),
        });
        debug!(signers = self.signers.len(), "added token signer");
        Ok(())
    }

    /// Verify every signer against `message`: the signing certificate's key
    /// must verify the signature, and each chain link must verify against
    /// its successor.
    pub fn verify(&self, message: &[u8]) -> Result<()> {
        if self.digest_algorithm != DIGEST_ALGORITHM {
            return Err(Error::InvalidArgument(format!(
                "unsupported digest algorithm: {}",
                self.digest_algorithm
            )));
        }
        if self.signers.is_empty() {
            return Err(Error::InvalidArgument("signature has no signers".to_string()));
        }

        for signer in &self.signers {
            let certificates = signer.certificates()?;
            let signing_cert = certificates.first().ok_or_else(|| {
                Error::InvalidArgument("signer carries an empty certificate chain".to_string())
            })?;

            let signature = BASE64
                .decode(&signer.signature)
                .map_err(|e| Error::InvalidArgument(format!("invalid signature base64: {e}")))?;

            let public_key: PKey<_> = signing_cert.public_key()?;
            let mut verifier = Verifier::new(MessageDigest::sha256(), &public_key)?;
            if !verifier.verify_oneshot(&signature, message)? {
                return Err(Error::InvalidArgument(
                    "signer signature does not verify over the message".to_string(),
                ));
            }

            for pair in certificates.windows(2) {
                let issuer_key = pair[1].public_key()?;
                match pair[0].verify(&issuer_key) {
                    Ok(true) => {}
                    _ => {
                        return Err(Error::InvalidArgument(
                            "signer certificate chain does not verify".to_string(),
                        ))
                    }
                }
            }
        }

        Ok(())
    }

    /// Canonical wire encoding: JSON, then base64.
    pub fn encode(&self) -> Result<String> {
        Ok(BASE64.encode(serde_json::to_vec(self)?))
    }

    /// Inverse of [`encode`](Self::encode).
    pub fn decode(encoded: &str) -> Result<Self> {
        let json = BASE64
            .decode(encoded)
            .map_err(|e| Error::InvalidArgument(format!("invalid signature base64: {e}")))?;
        Ok(serde_json::from_slice(&json)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use openssl::ec::{EcGroup, EcKey};
    use openssl::pkey::PKey;

    use crate::authority::CertificateAuthority;
    use crate::configs::Config;

    fn leaf_material() -> (PKey<Private>, X509, Vec<X509>) {
        let authority = CertificateAuthority::generate(&Config::default()).unwrap();
        let leaf = authority.leaf.clone().unwrap();
        (leaf.key, leaf.certificate, authority.chain_certificates().unwrap())
    }

    #[test]
    fn test_encode_decode_round_trip() {
        let (key, cert, chain) = leaf_material();
        let mut signature = TokenSignature::new();
        signature.add_signer(&cert, &key, &chain, b"message").unwrap();

        let decoded = TokenSignature::decode(&signature.encode().unwrap()).unwrap();
        assert_eq!(decoded.digest_algorithm, "sha256");
        assert_eq!(decoded.signers.len(), 1);
        assert_eq!(decoded.signers[0].chain.len(), 3);
        decoded.verify(b"message").unwrap();
    }

    #[test]
    fn test_verify_rejects_wrong_message() {
        let (key, cert, chain) = leaf_material();
        let mut signature = TokenSignature::new();
        signature.add_signer(&cert, &key, &chain, b"message").unwrap();

        assert!(signature.verify(b"other message").is_err());
    }

    #[test]
    fn test_verify_rejects_empty() {
        assert!(TokenSignature::new().verify(b"message").is_err());
    }

    #[test]
    fn test_signers_are_order_preserving() {
        let (key_a, cert_a, chain_a) = leaf_material();
        let (key_b, cert_b, chain_b) = leaf_material();

        let mut signature = TokenSignature::new();
        signature.add_signer(&cert_a, &key_a, &chain_a, b"msg").unwrap();
        signature.add_signer(&cert_b, &key_b, &chain_b, b"msg").unwrap();

        assert_eq!(signature.signers.len(), 2);
        assert_eq!(signature.signers[0].chain[0], BASE64.encode(cert_a.to_der().unwrap()));
        assert_eq!(signature.signers[1].chain[0], BASE64.encode(cert_b.to_der().unwrap()));
        signature.verify(b"msg").unwrap();
    }

    #[test]
    fn test_verify_rejects_foreign_signing_key() {
        // Signature produced by a key that does not match the certificate's
        // embedded public key must not verify.
        let (_, cert, chain) = leaf_material();
        let group = EcGroup::from_curve_name(crate::EC_CURVE).unwrap();
        let foreign_key = PKey::from_ec_key(EcKey::generate(&group).unwrap()).unwrap();

        let mut signature = TokenSignature::new();
        signature.add_signer(&cert, &foreign_key, &chain, b"msg").unwrap();
        assert!(signature.verify(b"msg").is_err());
    }
}
