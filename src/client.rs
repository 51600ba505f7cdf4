//! Merchant client identity.
//!
//! A thin holder for the merchant's private key, its CSR, the certificate
//! the authority issues for it, and a copy of the CA certificate PEM so a
//! downstream verifier can check the chain. Lifecycle: created empty, key
//! generated, CSR generated, certificate attached after the CA signs it.

use std::time::SystemTime;

use openssl::ec::{EcGroup, EcKey};
use openssl::hash::MessageDigest;
use openssl::pkey::{PKey, Private};
use openssl::x509::{X509Req, X509ReqBuilder, X509};
use tracing::debug;

use crate::configs::SubjectName;
use crate::error::{Error, Result};
use crate::token::Token;
use crate::token_data::TokenData;
use crate::verifier;
use crate::EC_CURVE;

const CSR_VERSION: i32 = 0;

/// A merchant's identity within the harness.
#[derive(Debug, Clone, Default)]
pub struct MerchantClient {
    pub key: Option<PKey<Private>>,
    pub certificate: Option<X509>,
    pub ca_certificate_pem: Option<String>,
}

impl MerchantClient {
    pub fn new() -> Self {
        Self::default()
    }

    /// Generate a fresh P-256 key for this client.
    pub fn generate_key(&mut self) -> Result<&PKey<Private>> {
        let group = EcGroup::from_curve_name(EC_CURVE)?;
        let key = PKey::from_ec_key(EcKey::generate(&group)?)?;
        debug!("generated merchant client key");
        Ok(&*self.key.insert(key))
    }

    /// Generate a CSR over the client's key, self-signed with SHA-256.
    pub fn generate_csr(&self, subject: &SubjectName) -> Result<X509Req> {
        let key = self.require_key()?;

        let mut builder = X509ReqBuilder::new()?;
        builder.set_version(CSR_VERSION)?;
        let subject_name = subject.to_x509_name()?;
        builder.set_subject_name(&subject_name)?;
        builder.set_pubkey(key)?;
        builder.sign(key, MessageDigest::sha256())?;
        Ok(builder.build())
    }

    /// The 32-byte merchant identifier bound into the issued certificate.
    pub fn merchant_id(&self) -> Result<[u8; 32]> {
        verifier::merchant_id(self.require_certificate()?)
    }

    /// Decrypt and verify a token addressed to this client. Delegates to
    /// the counterpart verifying library; the client-side inverse of the
    /// encrypt-then-sign flow.
    pub fn decrypt(&self, token: &Token, now: SystemTime) -> Result<TokenData> {
        let ca_pem = self.ca_certificate_pem.as_deref().ok_or_else(|| {
            Error::ProtocolState("client has no ca certificate pem".to_string())
        })?;
        verifier::decrypt(
            token,
            self.require_key()?,
            self.require_certificate()?,
            ca_pem,
            now,
        )
    }

    pub(crate) fn require_key(&self) -> Result<&PKey<Private>> {
        self.key
            .as_ref()
            .ok_or_else(|| Error::ProtocolState("client has no key".to_string()))
    }

    pub(crate) fn require_certificate(&self) -> Result<&X509> {
        self.certificate
            .as_ref()
            .ok_or_else(|| Error::ProtocolState("client has no certificate".to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::configs::Config;

    #[test]
    fn test_csr_subject_and_self_signature() {
        let config = Config::default();
        let mut client = MerchantClient::new();
        client.generate_key().unwrap();

        let csr = client.generate_csr(&config.subjects.csr).unwrap();
        let has_cn = csr
            .subject_name()
            .entries()
            .any(|e| e.data().as_slice() == b"merchant.example.com");
        assert!(has_cn);

        let key = csr.public_key().unwrap();
        assert!(csr.verify(&key).unwrap());
    }

    #[test]
    fn test_operations_require_prior_steps() {
        let config = Config::default();
        let client = MerchantClient::new();

        assert!(matches!(
            client.generate_csr(&config.subjects.csr),
            Err(Error::ProtocolState(_))
        ));
        assert!(matches!(client.merchant_id(), Err(Error::ProtocolState(_))));
    }
}
