//! The private three-tier certificate authority.
//!
//! # Chain layout
//! ```text
//! CA (self-signed, CA:TRUE, keyCertSign+cRLSign, SKI, AKI)
//!   └── Intermediate (CA:TRUE, keyCertSign+cRLSign, SKI, protocol OID)
//!       └── Leaf (digitalSignature only, SKI, protocol OID)
//! ```
//!
//! All keys are EC P-256 and all signatures SHA-256. The intermediate and
//! leaf each carry one protocol-identifying extension with an empty value;
//! client certificates issued from a CSR carry a merchant-identifier
//! extension holding 32 fresh random bytes rendered as hex. The intermediate
//! signature can be omitted via [`Config::sign_intermediate`] to produce the
//! unsigned-intermediate negative-test fixture.

use openssl::asn1::{Asn1Object, Asn1OctetString};
use openssl::bn::{BigNum, BigNumContext, MsbOption};
use openssl::ec::{EcGroup, EcKey, PointConversionForm};
use openssl::hash::{hash, MessageDigest};
use openssl::pkey::{PKey, Private};
use openssl::x509::extension::{
    AuthorityKeyIdentifier, BasicConstraints, KeyUsage, SubjectKeyIdentifier,
};
use openssl::x509::{X509Builder, X509Extension, X509Name, X509ReqRef, X509};
use tracing::{debug, info};

use crate::client::MerchantClient;
use crate::configs::{Config, ValidityWindow};
use crate::crypto;
use crate::error::{Error, Result, Tier};
use crate::helper::MERCHANT_ID_SIZE;
use crate::token::Token;
use crate::EC_CURVE;

// X509 version 3 is represented by 2.
const X509_VERSION_3: i32 = 2;
const SERIAL_BITS: i32 = 128;
const AKI_OID: &str = "2.5.29.35";

/// One tier's private key and certificate.
#[derive(Debug, Clone)]
pub struct TierMaterial {
    pub key: PKey<Private>,
    pub certificate: X509,
}

/// Owns the CA, intermediate, and leaf key/certificate tuples.
///
/// Tiers are populated by [`CertificateAuthority::generate`] or attached
/// individually; operations that need a missing tier fail with a
/// protocol-state error.
#[derive(Debug, Clone)]
pub struct CertificateAuthority {
    pub ca: Option<TierMaterial>,
    pub intermediate: Option<TierMaterial>,
    pub leaf: Option<TierMaterial>,
    pub config: Config,
}

impl CertificateAuthority {
    /// An authority with no tiers populated.
    pub fn new(config: Config) -> Self {
        Self {
            ca: None,
            intermediate: None,
            leaf: None,
            config,
        }
    }

    /// Generate the full CA → intermediate → leaf chain.
    pub fn generate(config: &Config) -> Result<Self> {
        let (ca_key, ca_cert) = Self::generate_ca(config)?;
        let (int_key, int_cert) = Self::generate_intermediate(&ca_key, &ca_cert, config)?;
        let (leaf_key, leaf_cert) = Self::generate_leaf(&int_key, &int_cert, config)?;

        info!("generated full certificate chain");
        Ok(Self {
            ca: Some(TierMaterial {
                key: ca_key,
                certificate: ca_cert,
            }),
            intermediate: Some(TierMaterial {
                key: int_key,
                certificate: int_cert,
            }),
            leaf: Some(TierMaterial {
                key: leaf_key,
                certificate: leaf_cert,
            }),
            config: config.clone(),
        })
    }

    /// Generate the self-signed root.
    pub fn generate_ca(config: &Config) -> Result<(PKey<Private>, X509)> {
        let key = generate_ec_key()?;
        let subject = config.subjects.ca.to_x509_name()?;

        let mut builder = certificate_builder(&subject, &subject, &key, &config.validity)?;

        let mut bc = BasicConstraints::new();
        bc.critical().ca();
        builder.append_extension(bc.build()?)?;

        let mut ku = KeyUsage::new();
        ku.critical().key_cert_sign().crl_sign();
        builder.append_extension(ku.build()?)?;

        let ski = SubjectKeyIdentifier::new().build(&builder.x509v3_context(None, None))?;
        builder.append_extension(ski)?;

        // The X509v3 context cannot reference the certificate being built,
        // so the self-referential authority key identifier is hand-encoded
        // (RFC 5280 method 1: SHA-1 of the subject public key bits).
        builder.append_extension(self_signed_authority_key_identifier(&key)?)?;

        builder.sign(&key, MessageDigest::sha256())?;
        debug!("generated self-signed ca certificate");
        Ok((key, builder.build()))
    }

    /// Generate the intermediate, issued by the CA.
    ///
    /// CA:TRUE and keyCertSign are required so this tier can itself sign
    /// leaf certificates. The certificate is left unsigned when
    /// `config.sign_intermediate` is false.
    pub fn generate_intermediate(
        ca_key: &PKey<Private>,
        ca_certificate: &X509,
        config: &Config,
    ) -> Result<(PKey<Private>, X509)> {
        let key = generate_ec_key()?;
        let subject = config.subjects.intermediate.to_x509_name()?;

        let mut builder = certificate_builder(
            &subject,
            ca_certificate.subject_name(),
            &key,
            &config.validity,
        )?;

        let mut bc = BasicConstraints::new();
        bc.critical().ca();
        builder.append_extension(bc.build()?)?;

        let mut ku = KeyUsage::new();
        ku.critical().key_cert_sign().crl_sign();
        builder.append_extension(ku.build()?)?;

        let ski = SubjectKeyIdentifier::new()
            .build(&builder.x509v3_context(Some(&**ca_certificate), None))?;
        builder.append_extension(ski)?;

        let aki = AuthorityKeyIdentifier::new()
            .keyid(true)
            .build(&builder.x509v3_context(Some(&**ca_certificate), None))?;
        builder.append_extension(aki)?;

        builder.append_extension(protocol_extension(&config.oids.intermediate_certificate)?)?;

        if config.sign_intermediate {
            builder.sign(ca_key, MessageDigest::sha256())?;
            debug!("generated intermediate certificate");
        } else {
            debug!("generated unsigned intermediate certificate fixture");
        }
        Ok((key, builder.build()))
    }

    /// Generate the leaf, issued by the intermediate. Digital-signature
    /// usage only; this is the certificate that countersigns tokens.
    pub fn generate_leaf(
        intermediate_key: &PKey<Private>,
        intermediate_certificate: &X509,
        config: &Config,
    ) -> Result<(PKey<Private>, X509)> {
        let key = generate_ec_key()?;
        let subject = config.subjects.leaf.to_x509_name()?;

        let mut builder = certificate_builder(
            &subject,
            intermediate_certificate.subject_name(),
            &key,
            &config.validity,
        )?;

        let mut ku = KeyUsage::new();
        ku.critical().digital_signature();
        builder.append_extension(ku.build()?)?;

        let ski = SubjectKeyIdentifier::new()
            .build(&builder.x509v3_context(Some(&**intermediate_certificate), None))?;
        builder.append_extension(ski)?;

        builder.append_extension(protocol_extension(&config.oids.leaf_certificate)?)?;

        builder.sign(intermediate_key, MessageDigest::sha256())?;
        debug!("generated leaf certificate");
        Ok((key, builder.build()))
    }

    /// Issue a client certificate for an externally supplied CSR.
    ///
    /// The CSR's public key is carried over; its subject is accepted but not
    /// trusted — the issued subject comes from configuration, mirroring
    /// real-world CA behavior of overriding subject on issuance. The
    /// certificate is stamped with a merchant-identifier extension holding
    /// 32 fresh random bytes rendered as hex, and signed by the
    /// intermediate key.
    pub fn sign_csr(&self, csr: &X509ReqRef, validity: &ValidityWindow) -> Result<X509> {
        let intermediate = self.require_tier(Tier::Intermediate)?;

        let subject = self.config.subjects.client.to_x509_name()?;
        let csr_key = csr.public_key()?;

        let mut builder = X509Builder::new()?;
        builder.set_version(X509_VERSION_3)?;
        let serial = random_serial()?;
        builder.set_serial_number(&serial)?;
        builder.set_subject_name(&subject)?;
        builder.set_issuer_name(intermediate.certificate.subject_name())?;
        let not_before = validity.not_before()?;
        builder.set_not_before(&not_before)?;
        let not_after = validity.not_after()?;
        builder.set_not_after(&not_after)?;
        builder.set_pubkey(&csr_key)?;

        let merchant_id_hex = hex::encode(self.config.random_bytes(MERCHANT_ID_SIZE));
        builder.append_extension(merchant_id_extension(
            &self.config.oids.merchant_identifier_field,
            &merchant_id_hex,
        )?)?;

        builder.sign(&intermediate.key, MessageDigest::sha256())?;
        debug!(merchant_id = %merchant_id_hex, "signed merchant csr");
        Ok(builder.build())
    }

    /// Generate a fresh merchant client: key, CSR, certificate issued via
    /// [`sign_csr`](Self::sign_csr), and a copy of the CA certificate PEM
    /// for downstream chain verification.
    pub fn generate_client(&self, validity: &ValidityWindow) -> Result<MerchantClient> {
        let ca = self.require_tier(Tier::Ca)?;

        let mut client = MerchantClient::new();
        client.generate_key()?;
        let csr = client.generate_csr(&self.config.subjects.csr)?;
        client.certificate = Some(self.sign_csr(&csr, validity)?);
        client.ca_certificate_pem = Some(String::from_utf8_lossy(&ca.certificate.to_pem()?).into_owned());

        info!("onboarded merchant client");
        Ok(client)
    }

    /// Countersign a token with the leaf key, attaching the intermediate and
    /// CA certificates as the verification chain.
    pub fn sign_token(&self, token: &mut Token) -> Result<()> {
        let leaf = self.require_tier(Tier::Leaf)?;
        let chain = self.chain_certificates()?;
        crypto::sign(token, &leaf.certificate, &leaf.key, &chain)
    }

    /// The verification chain attached to token signatures: intermediate
    /// then CA.
    pub fn chain_certificates(&self) -> Result<Vec<X509>> {
        let intermediate = self.require_tier(Tier::Intermediate)?;
        let ca = self.require_tier(Tier::Ca)?;
        Ok(vec![
            intermediate.certificate.clone(),
            ca.certificate.clone(),
        ])
    }

    /// Validate every tier: each private key must match its certificate,
    /// and each certificate must verify against its issuer (the CA against
    /// itself). The first failing check per tier is surfaced; the per-tier
    /// methods can be called independently to localize failures.
    pub fn validate(&self) -> Result<()> {
        self.validate_ca()?;
        self.validate_intermediate()?;
        self.validate_leaf()?;
        debug!("certificate chain validated");
        Ok(())
    }

    /// CA key matches the CA certificate, and the certificate is
    /// self-signed.
    pub fn validate_ca(&self) -> Result<()> {
        let ca = self.require_tier(Tier::Ca)?;
        check_private_key(&ca.certificate, &ca.key, Tier::Ca)?;
        check_issued_by(&ca.certificate, &ca.key, Tier::Ca)
    }

    /// Intermediate key matches its certificate, and the certificate
    /// verifies against the CA.
    pub fn validate_intermediate(&self) -> Result<()> {
        let intermediate = self.require_tier(Tier::Intermediate)?;
        let ca = self.require_tier(Tier::Ca)?;
        check_private_key(&intermediate.certificate, &intermediate.key, Tier::Intermediate)?;
        check_issued_by(&intermediate.certificate, &ca.key, Tier::Intermediate)
    }

    /// Leaf key matches its certificate, and the certificate verifies
    /// against the intermediate.
    pub fn validate_leaf(&self) -> Result<()> {
        let leaf = self.require_tier(Tier::Leaf)?;
        let intermediate = self.require_tier(Tier::Intermediate)?;
        check_private_key(&leaf.certificate, &leaf.key, Tier::Leaf)?;
        check_issued_by(&leaf.certificate, &intermediate.key, Tier::Leaf)
    }

    fn require_tier(&self, tier: Tier) -> Result<&TierMaterial> {
        let material = match tier {
            Tier::Ca => &self.ca,
            Tier::Intermediate => &self.intermediate,
            Tier::Leaf => &self.leaf,
        };
        material
            .as_ref()
            .ok_or_else(|| Error::ProtocolState(format!("no {tier} key/certificate set")))
    }
}

/// The public key embedded in `certificate` must correspond to `key`.
fn check_private_key(certificate: &X509, key: &PKey<Private>, tier: Tier) -> Result<()> {
    let embedded = certificate.public_key()?;
    if embedded.public_eq(key) {
        Ok(())
    } else {
        Err(Error::KeyMismatch(tier))
    }
}

/// `certificate`'s signature must verify against the issuer's key. An
/// unsigned certificate fails here too.
fn check_issued_by(certificate: &X509, issuer_key: &PKey<Private>, tier: Tier) -> Result<()> {
    match certificate.verify(issuer_key) {
        Ok(true) => Ok(()),
        _ => Err(Error::ChainVerification(tier)),
    }
}

fn generate_ec_key() -> Result<PKey<Private>> {
    let group = EcGroup::from_curve_name(EC_CURVE)?;
    Ok(PKey::from_ec_key(EcKey::generate(&group)?)?)
}

/// Common builder setup: version, random serial, names, validity, public key.
fn certificate_builder(
    subject: &X509Name,
    issuer: &openssl::x509::X509NameRef,
    key: &PKey<Private>,
    validity: &ValidityWindow,
) -> Result<X509Builder> {
    let mut builder = X509Builder::new()?;
    builder.set_version(X509_VERSION_3)?;
    let serial = random_serial()?;
    builder.set_serial_number(&serial)?;
    builder.set_subject_name(subject)?;
    builder.set_issuer_name(issuer)?;
    let not_before = validity.not_before()?;
    builder.set_not_before(&not_before)?;
    let not_after = validity.not_after()?;
    builder.set_not_after(&not_after)?;
    builder.set_pubkey(key)?;
    Ok(builder)
}

fn random_serial() -> Result<openssl::asn1::Asn1Integer> {
    let mut serial = BigNum::new()?;
    serial.rand(SERIAL_BITS, MsbOption::MAYBE_ZERO, false)?;
    Ok(serial.to_asn1_integer()?)
}

/// Protocol-identifying extension: configured OID, empty value.
fn protocol_extension(oid: &str) -> Result<X509Extension> {
    let object = Asn1Object::from_str(oid)?;
    let value = Asn1OctetString::new_from_bytes(b"")?;
    Ok(X509Extension::new_from_der(&object, false, &value)?)
}

/// Merchant-identifier extension: configured OID, value is the 64-character
/// hex rendering of the 32 random identifier bytes.
fn merchant_id_extension(oid: &str, merchant_id_hex: &str) -> Result<X509Extension> {
    let object = Asn1Object::from_str(oid)?;
    let value = Asn1OctetString::new_from_bytes(merchant_id_hex.as_bytes())?;
    Ok(X509Extension::new_from_der(&object, false, &value)?)
}

/// AKI for the self-signed root: `SEQUENCE { [0] SHA-1(subject public key) }`.
fn self_signed_authority_key_identifier(key: &PKey<Private>) -> Result<X509Extension> {
    let ec = key.ec_key()?;
    let mut ctx = BigNumContext::new()?;
    let point_bytes = ec.public_key().to_bytes(
        ec.group(),
        PointConversionForm::UNCOMPRESSED,
        &mut ctx,
    )?;
    let keyid = hash(MessageDigest::sha1(), &point_bytes)?;

    let mut der = Vec::with_capacity(keyid.len() + 4);
    der.push(0x30); // SEQUENCE
    der.push((keyid.len() + 2) as u8);
    der.push(0x80); // [0] IMPLICIT keyIdentifier
    der.push(keyid.len() as u8);
    der.extend_from_slice(&keyid);

    let object = Asn1Object::from_str(AKI_OID)?;
    let value = Asn1OctetString::new_from_bytes(&der)?;
    Ok(X509Extension::new_from_der(&object, false, &value)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    use crate::verifier;

    #[test]
    fn test_fresh_chain_validates() {
        let authority = CertificateAuthority::generate(&Config::default()).unwrap();
        authority.validate().unwrap();
    }

    #[test]
    fn test_key_swap_is_a_key_mismatch() {
        let mut authority = CertificateAuthority::generate(&Config::default()).unwrap();
        authority.leaf.as_mut().unwrap().key = generate_ec_key().unwrap();

        assert!(matches!(authority.validate(), Err(Error::KeyMismatch(Tier::Leaf))));
        // The other tiers are unaffected.
        authority.validate_ca().unwrap();
        authority.validate_intermediate().unwrap();
    }

    #[test]
    fn test_tampered_intermediate_fails_locally() {
        let mut authority = CertificateAuthority::generate(&Config::default()).unwrap();

        // Flip one byte of the intermediate's signature (the tail of the DER
        // encoding) and re-parse.
        let mut der = authority
            .intermediate
            .as_ref()
            .unwrap()
            .certificate
            .to_der()
            .unwrap();
        let last = der.len() - 1;
        der[last] ^= 0x01;
        authority.intermediate.as_mut().unwrap().certificate = X509::from_der(&der).unwrap();

        assert!(matches!(
            authority.validate(),
            Err(Error::ChainVerification(Tier::Intermediate))
        ));
        authority.validate_ca().unwrap();
        authority.validate_leaf().unwrap();
    }

    #[test]
    fn test_unsigned_intermediate_fixture() {
        let mut config = Config::default();
        config.sign_intermediate = false;

        let authority = CertificateAuthority::generate(&config).unwrap();
        authority.validate_ca().unwrap();
        assert!(matches!(
            authority.validate_intermediate(),
            Err(Error::ChainVerification(Tier::Intermediate))
        ));
    }

    #[test]
    fn test_sign_csr_requires_intermediate() {
        let config = Config::default();
        let authority = CertificateAuthority::new(config.clone());

        let mut client = MerchantClient::new();
        client.generate_key().unwrap();
        let csr = client.generate_csr(&config.subjects.csr).unwrap();

        assert!(matches!(
            authority.sign_csr(&csr, &config.validity),
            Err(Error::ProtocolState(_))
        ));
    }

    #[test]
    fn test_client_scenario_with_seeded_random() {
        let config = Config::default().with_random(StdRng::seed_from_u64(0xC0FFEE));
        let authority = CertificateAuthority::generate(&config).unwrap();
        let client = authority.generate_client(&config.validity).unwrap();

        let certificate = client.certificate.as_ref().unwrap();
        let intermediate = &authority.intermediate.as_ref().unwrap().certificate;

        // Issuer subject equals the intermediate's subject.
        let issuer = certificate
            .issuer_name()
            .entries()
            .map(|e| e.data().as_slice().to_vec())
            .collect::<Vec<_>>();
        let subject = intermediate
            .subject_name()
            .entries()
            .map(|e| e.data().as_slice().to_vec())
            .collect::<Vec<_>>();
        assert_eq!(issuer, subject);

        // The merchant-identifier extension is present and exactly 64 hex
        // characters; a reseeded config reproduces it.
        let id = verifier::merchant_id(certificate).unwrap();
        assert_eq!(id.len(), 32);

        let config2 = Config::default().with_random(StdRng::seed_from_u64(0xC0FFEE));
        let authority2 = CertificateAuthority::generate(&config2).unwrap();
        let client2 = authority2.generate_client(&config2.validity).unwrap();
        let id2 = verifier::merchant_id(client2.certificate.as_ref().unwrap()).unwrap();
        assert_eq!(id, id2);
    }

    #[test]
    fn test_client_certificate_carries_csr_public_key() {
        let config = Config::default();
        let authority = CertificateAuthority::generate(&config).unwrap();
        let client = authority.generate_client(&config.validity).unwrap();

        let cert_key = client.certificate.as_ref().unwrap().public_key().unwrap();
        assert!(cert_key.public_eq(client.key.as_ref().unwrap()));
    }
}
