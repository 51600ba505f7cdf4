//! Cleartext payment payload: the object that gets serialized and encrypted
//! into a token.
//!
//! The field names on the wire follow the EC_v1 payment-token JSON layout
//! (`applicationPrimaryAccountNumber`, `paymentData`, ...). [`TokenData::sample`]
//! fills every field with plausible random values drawn from the injected
//! random source so the harness can mint tokens without a real payment
//! network.

use chrono::{Datelike, NaiveDate, Utc};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use rand::seq::SliceRandom;
use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::configs::Config;
use crate::error::{Error, Result};

/// ISO 4217 numeric currency codes.
const CURRENCIES: &[&str] = &[
    "008", "012", "032", "036", "044", "048", "050", "051", "052", "060", "064", "068", "072",
    "084", "090", "096", "104", "108", "116", "124", "132", "136", "144", "152", "156", "170",
    "174", "188", "191", "192", "203", "208", "214", "222", "230", "232", "238", "242", "262",
    "270", "292", "320", "324", "328", "332", "340", "344", "348", "352", "356", "360", "364",
    "368", "376", "388", "392", "398", "400", "404", "408", "410", "414", "417", "418", "422",
    "426", "430", "434", "446", "454", "458", "462", "480", "484", "496", "498", "504", "512",
    "516", "524", "532", "533", "548", "554", "558", "566", "578", "586", "590", "598", "600",
    "604", "608", "634", "643", "646", "654", "682", "690", "694", "702", "704", "706", "710",
    "728", "748", "752", "756", "760", "764", "776", "780", "784", "788", "800", "807", "818",
    "826", "834", "840", "858", "860", "882", "886", "901", "929", "930", "931", "932", "933",
    "934", "936", "937", "938", "940", "941", "943", "944", "946", "947", "948", "949", "950",
    "951", "952", "953", "955", "956", "957", "958", "959", "960", "961", "962", "963", "964",
    "965", "967", "968", "969", "970", "971", "972", "973", "975", "976", "977", "978", "979",
    "980", "981", "984", "985", "986", "990", "994", "997", "999",
];

/// PAN lengths weighted towards 16 digits, as real card ranges are.
const PAN_LENGTHS: &[usize] = &[12, 16, 16, 16, 16, 16, 16, 16, 16, 16, 16, 19, 19, 19];
const PAN_PREFIXES: &[u32] = &[2, 4, 5, 6];
const ECI_INDICATORS: &[&str] = &["05", "06", "07"];

/// Cleartext payment fields, serialized to JSON before encryption.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TokenData {
    pub application_primary_account_number: String,
    /// Card expiry as YYMMDD, always the last day of the month.
    pub application_expiration_date: String,
    pub currency_code: String,
    pub transaction_amount: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cardholder_name: Option<String>,
    pub device_manufacturer_identifier: String,
    pub payment_data_type: String,
    pub payment_data: PaymentData,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PaymentData {
    pub online_payment_cryptogram: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub eci_indicator: Option<String>,
}

impl TokenData {
    /// Generate a sample payload with every field populated.
    pub fn sample(config: &Config) -> Result<Self> {
        Self::sample_with(config, None)
    }

    /// Generate a sample payload constrained to be expired (`Some(true)`),
    /// unexpired (`Some(false)`), or unconstrained (`None`).
    pub fn sample_with(config: &Config, expired: Option<bool>) -> Result<Self> {
        let mut guard = config
            .random
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        let rng = &mut *guard;

        let pan_length = *PAN_LENGTHS
            .choose(rng)
            .ok_or_else(|| Error::InvalidArgument("empty PAN length table".to_string()))?;
        let prefix = *PAN_PREFIXES
            .choose(rng)
            .ok_or_else(|| Error::InvalidArgument("empty PAN prefix table".to_string()))?;
        let mut pan = prefix.to_string();
        for _ in 1..pan_length {
            pan.push(char::from(b'0' + rng.gen_range(0..10u8)));
        }

        let expiry = sample_expiry(rng, expired)?;

        let currency = *CURRENCIES
            .choose(rng)
            .ok_or_else(|| Error::InvalidArgument("empty currency table".to_string()))?;
        let amount = rng.gen_range(100..=99_999u64);

        let mut dm_id = [0u8; 5];
        rng.fill_bytes(&mut dm_id);
        let mut cryptogram = [0u8; 20];
        rng.fill_bytes(&mut cryptogram);
        let eci = *ECI_INDICATORS
            .choose(rng)
            .ok_or_else(|| Error::InvalidArgument("empty ECI table".to_string()))?;

        Ok(Self {
            application_primary_account_number: pan,
            application_expiration_date: expiry,
            currency_code: currency.to_string(),
            transaction_amount: amount,
            cardholder_name: None,
            device_manufacturer_identifier: hex::encode(dm_id),
            payment_data_type: "3DSecure".to_string(),
            payment_data: PaymentData {
                online_payment_cryptogram: BASE64.encode(cryptogram),
                eci_indicator: Some(eci.to_string()),
            },
        })
    }

    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn from_json(json: &[u8]) -> Result<Self> {
        Ok(serde_json::from_slice(json)?)
    }
}

/// Pick an expiry date (YYMMDD, last day of month) relative to the current
/// month. `Some(true)` forces a past month, `Some(false)` a current-or-future
/// month; `None` allows either.
fn sample_expiry<R: Rng + ?Sized>(rng: &mut R, expired: Option<bool>) -> Result<String> {
    let today = Utc::now().date_naive();

    // Offset in months from the current month.
    let offset = match expired {
        None => rng.gen_range(-60..=72i32),
        Some(true) => rng.gen_range(-60..=-1i32),
        Some(false) => rng.gen_range(0..=72i32),
    };

    let total = today.year() * 12 + today.month0() as i32 + offset;
    let year = total.div_euclid(12);
    let month = total.rem_euclid(12) as u32 + 1;

    let first_of_next = if month == 12 {
        NaiveDate::from_ymd_opt(year + 1, 1, 1)
    } else {
        NaiveDate::from_ymd_opt(year, month + 1, 1)
    }
    .ok_or_else(|| Error::InvalidArgument("expiry date out of range".to_string()))?;
    let last_of_month = first_of_next.pred_opt().ok_or_else(|| {
        Error::InvalidArgument("expiry date out of range".to_string())
    })?;

    Ok(last_of_month.format("%y%m%d").to_string())
}
