//! Paychain — EC_v1 payment-token test/interop harness
//!
//! Paychain plays both sides of an Apple-Pay-style payment-token protocol so
//! an independent decrypting/verifying implementation can be exercised end
//! to end without a real payment network. It issues a private three-tier
//! certificate authority, onboards merchant clients through a CSR/signing
//! flow, and mints payment tokens that are encrypted with ephemeral-ECDH
//! derived keys and countersigned with a detached multi-signer signature.
//!
//! # Chain layout
//!
//! ```text
//! CA (self-signed)
//!   └── Intermediate (signed by CA, protocol OID extension)
//!       └── Leaf (signed by Intermediate, protocol OID extension)
//!
//! Merchant client (CSR signed by Intermediate, merchant-identifier extension)
//! ```
//!
//! # Quick start
//!
//! ```no_run
//! use std::time::SystemTime;
//! use paychain::{CertificateAuthority, Config, Recipient, Token};
//!
//! fn main() -> paychain::Result<()> {
//!     let config = Config::default();
//!
//!     // Issue the chain and onboard a merchant.
//!     let authority = CertificateAuthority::generate(&config)?;
//!     authority.validate()?;
//!     let merchant = authority.generate_client(&config.validity)?;
//!
//!     // Mint, encrypt, and countersign a token.
//!     let mut token = Token::sample(&config)?;
//!     paychain::crypto::encrypt(&mut token, &Recipient::Client(&merchant), None, None)?;
//!     authority.sign_token(&mut token)?;
//!     println!("{}", token.to_json()?);
//!
//!     // The merchant-side inverse.
//!     let data = merchant.decrypt(&token, SystemTime::now())?;
//!     println!("PAN: {}", data.application_primary_account_number);
//!     Ok(())
//! }
//! ```
//!
//! # Module Overview
//!
//! ## [`authority`]
//!
//! The three-tier certificate authority: chain generation with the required
//! X.509 extensions, CSR signing, merchant onboarding, and full chain/key
//! validation.
//!
//! ## [`crypto`]
//!
//! The token crypto engine: ECDH shared secrets, one-shot ephemeral keys,
//! AES-256-GCM payload encryption, and the detached multi-signer
//! countersignature over the protocol's exact byte layout.
//!
//! ## [`client`]
//!
//! Merchant identity: key, CSR, issued certificate, and the client-side
//! decrypt entry point.
//!
//! ## [`token`] / [`token_data`]
//!
//! The wire data model: token, header, and the cleartext payment payload
//! with sample generation.
//!
//! ## [`verifier`]
//!
//! The counterpart decrypt/verify contract: symmetric-key derivation,
//! merchant-identifier extraction, and token decryption.
//!
//! # Concurrency
//!
//! All operations are synchronous and CPU-bound. Entities are plain mutable
//! value holders with no internal synchronization; share an authority or
//! client across threads only behind your own serialization. The injected
//! random source is the one piece of shared state and is safe to share.

use openssl::nid::Nid;

pub mod authority;
pub mod client;
pub mod configs;
pub mod crypto;
pub mod error;
pub mod helper;
pub mod signature;
pub mod token;
pub mod token_data;
pub mod verifier;

/// The one elliptic curve used throughout the protocol (NIST P-256).
pub const EC_CURVE: Nid = Nid::X9_62_PRIME256V1;

pub use authority::{CertificateAuthority, TierMaterial};
pub use client::MerchantClient;
pub use configs::{Config, OidConfig, SubjectConfig, SubjectName, ValidityWindow};
pub use error::{Error, Result, Tier};
pub use helper::Recipient;
pub use signature::{SignerInfo, TokenSignature};
pub use token::{Token, TokenHeader, TOKEN_VERSION};
pub use token_data::{PaymentData, TokenData};
