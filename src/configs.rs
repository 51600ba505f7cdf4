//! Configuration surface for the harness.
//!
//! Everything that parameterizes certificate issuance lives here: the
//! protocol-identifying extension OIDs, the distinguished names for each
//! chain tier, the validity window, the flag controlling whether the
//! intermediate certificate is actually signed (a negative-test fixture),
//! and the process-wide random source.
//!
//! The random source is explicitly injectable so tests can substitute a
//! deterministic generator; it is threaded through every operation that
//! draws bytes (merchant identifiers, transaction ids, sample payloads)
//! rather than hidden behind a global.

use std::sync::{Arc, Mutex, PoisonError};
use std::time::{SystemTime, UNIX_EPOCH};

use openssl::asn1::Asn1Time;
use openssl::x509::{X509Name, X509NameBuilder};
use rand::rngs::StdRng;
use rand::{RngCore, SeedableRng};
use serde::Deserialize;

use crate::error::Result;

const SECONDS_PER_DAY: i64 = 86_400;

/// A single shared random source. Cloning a [`Config`] shares the instance.
pub type SharedRandom = Arc<Mutex<dyn RngCore + Send>>;

/// Harness configuration.
///
/// `Default` mirrors the fixture values the harness ships with; individual
/// fields can be overridden before handing the config to
/// [`CertificateAuthority`](crate::CertificateAuthority).
#[derive(Clone, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub oids: OidConfig,
    #[serde(default)]
    pub subjects: SubjectConfig,
    #[serde(default)]
    pub validity: ValidityWindow,
    /// When false, the intermediate certificate is built but never signed.
    /// Callers must treat the unsigned intermediate as a distinct
    /// negative-test state, not an error.
    #[serde(default = "default_sign_intermediate")]
    pub sign_intermediate: bool,
    #[serde(skip, default = "default_random")]
    pub random: SharedRandom,
}

impl Config {
    /// Draw `n` bytes from the injected random source.
    pub fn random_bytes(&self, n: usize) -> Vec<u8> {
        let mut rng = self.random.lock().unwrap_or_else(PoisonError::into_inner);
        let mut buf = vec![0u8; n];
        rng.fill_bytes(&mut buf);
        buf
    }

    /// Replace the random source, e.g. with a seeded generator in tests.
    pub fn with_random<R: RngCore + Send + 'static>(mut self, rng: R) -> Self {
        self.random = Arc::new(Mutex::new(rng));
        self
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            oids: OidConfig::default(),
            subjects: SubjectConfig::default(),
            validity: ValidityWindow::default(),
            sign_intermediate: default_sign_intermediate(),
            random: default_random(),
        }
    }
}

impl std::fmt::Debug for Config {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Config")
            .field("oids", &self.oids)
            .field("subjects", &self.subjects)
            .field("validity", &self.validity)
            .field("sign_intermediate", &self.sign_intermediate)
            .field("random", &"<random source>")
            .finish()
    }
}

fn default_sign_intermediate() -> bool {
    true
}

fn default_random() -> SharedRandom {
    Arc::new(Mutex::new(StdRng::from_entropy()))
}

/// Object identifiers for the protocol-specific X.509 extensions.
#[derive(Debug, Clone, Deserialize)]
pub struct OidConfig {
    pub intermediate_certificate: String,
    pub leaf_certificate: String,
    pub merchant_identifier_field: String,
}

impl Default for OidConfig {
    fn default() -> Self {
        Self {
            intermediate_certificate: "1.2.840.113635.100.6.2.14".to_string(),
            leaf_certificate: "1.2.840.113635.100.6.29".to_string(),
            merchant_identifier_field: "1.2.840.113635.100.6.32".to_string(),
        }
    }
}

/// Distinguished names for each certificate in the chain plus the CSR and
/// the client certificate issued from it.
#[derive(Debug, Clone, Deserialize)]
pub struct SubjectConfig {
    pub ca: SubjectName,
    pub intermediate: SubjectName,
    pub leaf: SubjectName,
    pub csr: SubjectName,
    pub client: SubjectName,
}

impl Default for SubjectConfig {
    fn default() -> Self {
        Self {
            ca: SubjectName(vec![
                ("C".into(), "US".into()),
                ("O".into(), "Paychain Inc.".into()),
                ("OU".into(), "Paychain Certification Authority".into()),
                ("CN".into(), "Paychain Root CA - G3".into()),
            ]),
            intermediate: SubjectName(vec![
                ("C".into(), "US".into()),
                ("O".into(), "Paychain Inc.".into()),
                ("OU".into(), "Paychain Certification Authority".into()),
                ("CN".into(), "Paychain Application Integration CA - G3".into()),
            ]),
            leaf: SubjectName(vec![
                ("C".into(), "US".into()),
                ("O".into(), "Paychain Inc.".into()),
                ("OU".into(), "pOS Systems".into()),
                ("CN".into(), "ecc-token-sign-PROD".into()),
            ]),
            csr: SubjectName(vec![("CN".into(), "merchant.example.com".into())]),
            client: SubjectName(vec![
                ("UID".into(), "merchant.example.com.paychain-merchant".into()),
                (
                    "CN".into(),
                    "Merchant ID: merchant.example.com.paychain-merchant".into(),
                ),
                ("OU".into(), "1W2X3Y4Z5A".into()),
                ("O".into(), "Paychain Merchant Inc.".into()),
                ("C".into(), "US".into()),
            ]),
        }
    }
}

/// An X.509 distinguished name as ordered (field, value) entries.
///
/// Field names are the OpenSSL short names ("C", "O", "OU", "CN", "UID").
#[derive(Debug, Clone, Deserialize)]
pub struct SubjectName(pub Vec<(String, String)>);

impl SubjectName {
    pub fn to_x509_name(&self) -> Result<X509Name> {
        let mut builder = X509NameBuilder::new()?;
        for (field, value) in &self.0 {
            builder.append_entry_by_text(field, value)?;
        }
        Ok(builder.build())
    }
}

/// Certificate validity interval, expressed relative to issuance time.
#[derive(Debug, Clone, Copy, Deserialize)]
pub struct ValidityWindow {
    pub not_before_days_ago: u32,
    pub not_after_days_ahead: u32,
}

impl Default for ValidityWindow {
    fn default() -> Self {
        // Roughly last year through two years ahead.
        Self {
            not_before_days_ago: 365,
            not_after_days_ahead: 730,
        }
    }
}

impl ValidityWindow {
    pub fn not_before(&self) -> Result<Asn1Time> {
        let ts = unix_now() - i64::from(self.not_before_days_ago) * SECONDS_PER_DAY;
        Ok(Asn1Time::from_unix(ts)?)
    }

    pub fn not_after(&self) -> Result<Asn1Time> {
        let ts = unix_now() + i64::from(self.not_after_days_ahead) * SECONDS_PER_DAY;
        Ok(Asn1Time::from_unix(ts)?)
    }
}

fn unix_now() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    #[test]
    fn test_default_oids() {
        let config = Config::default();
        assert_eq!(config.oids.intermediate_certificate, "1.2.840.113635.100.6.2.14");
        assert_eq!(config.oids.leaf_certificate, "1.2.840.113635.100.6.29");
        assert_eq!(config.oids.merchant_identifier_field, "1.2.840.113635.100.6.32");
        assert!(config.sign_intermediate);
    }

    #[test]
    fn test_seeded_random_is_reproducible() {
        let a = Config::default().with_random(StdRng::seed_from_u64(7));
        let b = Config::default().with_random(StdRng::seed_from_u64(7));
        assert_eq!(a.random_bytes(32), b.random_bytes(32));
    }

    #[test]
    fn test_clone_shares_random_instance() {
        let config = Config::default().with_random(StdRng::seed_from_u64(7));
        let clone = config.clone();
        // Drawing from the clone advances the shared stream.
        let first = clone.random_bytes(16);
        let second = config.random_bytes(16);
        assert_ne!(first, second);
    }

    #[test]
    fn test_subject_name_builds() {
        let subject = Config::default().subjects.ca.to_x509_name().unwrap();
        let has_cn = subject
            .entries()
            .any(|e| e.data().as_slice() == b"Paychain Root CA - G3");
        assert!(has_cn);
    }
}
