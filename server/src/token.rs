//! Check-in token encoding.
//!
//! Two token shapes are issued:
//!
//! - **Participant tokens** are self-contained: base64url (no padding) over a
//!   JSON payload `{appointmentId, participantId, issuedAt, nonce}`. Decoding
//!   needs no store round trip. Unsigned tokens are trusted only as far as the
//!   redemption-time cross-check of `participantId` against the stored record.
//!   When a signing key is configured the token becomes `<payload>.<signature>`
//!   with an Ed25519 signature over the encoded payload.
//! - **Appointment tokens** are `{appointmentId}_{epochMs}_{random}` and are
//!   validated by comparison with the value stored on the appointment.
//!
//! Decoding never fails loudly: malformed input yields `None`, because an
//! invalid token is an expected outcome at a scanner.
//!
//! # Example
//!
//! ```rust
//! use chrono::Utc;
//! use rollcall_server::token::{TokenCodec, TokenPayload};
//!
//! let codec = TokenCodec::unsigned();
//! let payload = TokenPayload::new("appt-1", "part-7", Utc::now());
//! let token = codec.encode(&payload);
//!
//! assert_eq!(codec.decode(&token), Some(payload));
//! assert_eq!(codec.decode("garbage"), None);
//! ```

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use chrono::{DateTime, TimeZone, Utc};
use ed25519_dalek::{Signature, Signer, SigningKey, SIGNATURE_LENGTH};
use rand::distr::Alphanumeric;
use rand::Rng;
use serde::{Deserialize, Serialize};
use serde_json::json;
use subtle::ConstantTimeEq;

/// Tokens longer than this are rejected before any decoding work.
const MAX_TOKEN_LENGTH: usize = 1024;

/// Random bytes in a participant token nonce.
const NONCE_BYTES: usize = 12;

/// Length of the random suffix of an appointment token.
const APPOINTMENT_SUFFIX_LENGTH: usize = 9;

/// Separator between payload and signature in a signed token.
const SIGNATURE_SEPARATOR: char = '.';

/// What a participant token claims.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TokenPayload {
    pub appointment_id: String,
    pub participant_id: String,

    /// Issuance instant in epoch milliseconds.
    #[serde(rename = "issuedAt")]
    pub issued_at_ms: i64,

    pub nonce: String,
}

impl TokenPayload {
    /// Creates a payload with a fresh random nonce.
    #[must_use]
    pub fn new(
        appointment_id: impl Into<String>,
        participant_id: impl Into<String>,
        issued_at: DateTime<Utc>,
    ) -> Self {
        let mut nonce = [0u8; NONCE_BYTES];
        rand::rng().fill(&mut nonce);
        Self {
            appointment_id: appointment_id.into(),
            participant_id: participant_id.into(),
            issued_at_ms: issued_at.timestamp_millis(),
            nonce: URL_SAFE_NO_PAD.encode(nonce),
        }
    }

    /// Issuance instant, or `None` if the millisecond value is out of range.
    #[must_use]
    pub fn issued_at(&self) -> Option<DateTime<Utc>> {
        Utc.timestamp_millis_opt(self.issued_at_ms).single()
    }

    fn is_well_formed(&self) -> bool {
        !self.appointment_id.is_empty()
            && !self.participant_id.is_empty()
            && !self.nonce.is_empty()
            && self.issued_at_ms > 0
            && self.issued_at().is_some()
    }
}

/// Encodes and decodes participant tokens, optionally signing them.
#[derive(Clone)]
pub struct TokenCodec {
    signing_key: Option<SigningKey>,
}

impl std::fmt::Debug for TokenCodec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TokenCodec")
            .field("signed", &self.is_signed())
            .finish()
    }
}

impl Default for TokenCodec {
    fn default() -> Self {
        Self::unsigned()
    }
}

impl TokenCodec {
    /// A codec producing unsigned tokens.
    #[must_use]
    pub fn unsigned() -> Self {
        Self { signing_key: None }
    }

    /// A codec that signs tokens with the Ed25519 key derived from `seed` and
    /// rejects tokens whose signature does not verify.
    #[must_use]
    pub fn signed(seed: &[u8; 32]) -> Self {
        Self {
            signing_key: Some(SigningKey::from_bytes(seed)),
        }
    }

    /// Builds the codec the configuration asks for.
    #[must_use]
    pub fn from_seed(seed: Option<&[u8; 32]>) -> Self {
        seed.map_or_else(Self::unsigned, Self::signed)
    }

    #[must_use]
    pub fn is_signed(&self) -> bool {
        self.signing_key.is_some()
    }

    /// Encodes `payload` into an opaque token.
    #[must_use]
    pub fn encode(&self, payload: &TokenPayload) -> String {
        let body = json!({
            "appointmentId": payload.appointment_id,
            "participantId": payload.participant_id,
            "issuedAt": payload.issued_at_ms,
            "nonce": payload.nonce,
        })
        .to_string();
        let encoded = URL_SAFE_NO_PAD.encode(body.as_bytes());

        match &self.signing_key {
            Some(key) => {
                let signature = key.sign(encoded.as_bytes());
                format!(
                    "{encoded}{SIGNATURE_SEPARATOR}{}",
                    URL_SAFE_NO_PAD.encode(signature.to_bytes())
                )
            }
            None => encoded,
        }
    }

    /// Decodes a token, returning `None` for anything malformed, unsigned
    /// when a signature is required, or carrying a bad signature.
    #[must_use]
    pub fn decode(&self, token: &str) -> Option<TokenPayload> {
        let token = token.trim();
        if token.is_empty() || token.len() > MAX_TOKEN_LENGTH {
            return None;
        }

        let encoded = match &self.signing_key {
            Some(key) => {
                let (encoded, signature) = token.split_once(SIGNATURE_SEPARATOR)?;
                let signature_bytes = URL_SAFE_NO_PAD.decode(signature).ok()?;
                let signature_array: [u8; SIGNATURE_LENGTH] = signature_bytes.try_into().ok()?;
                let signature = Signature::from_bytes(&signature_array);
                key.verifying_key()
                    .verify_strict(encoded.as_bytes(), &signature)
                    .ok()?;
                encoded
            }
            None => token,
        };

        let body = URL_SAFE_NO_PAD.decode(encoded).ok()?;
        let payload: TokenPayload = serde_json::from_slice(&body).ok()?;
        payload.is_well_formed().then_some(payload)
    }
}

/// Mints an appointment-level token: `{appointmentId}_{epochMs}_{random}`.
#[must_use]
pub fn mint_appointment_token(appointment_id: &str, now: DateTime<Utc>) -> String {
    let suffix: String = rand::rng()
        .sample_iter(&Alphanumeric)
        .take(APPOINTMENT_SUFFIX_LENGTH)
        .map(char::from)
        .collect();
    format!("{appointment_id}_{}_{suffix}", now.timestamp_millis())
}

/// Extracts the appointment id from an appointment-level token.
///
/// The id is everything before the last two `_`-separated fields, so ids that
/// themselves contain underscores survive.
#[must_use]
pub fn appointment_id_from_token(token: &str) -> Option<&str> {
    let token = token.trim();
    if token.len() > MAX_TOKEN_LENGTH {
        return None;
    }

    let mut parts = token.rsplitn(3, '_');
    let suffix = parts.next()?;
    let millis = parts.next()?;
    let appointment_id = parts.next()?;

    if appointment_id.is_empty() || suffix.is_empty() || millis.parse::<i64>().is_err() {
        return None;
    }

    Some(appointment_id)
}

/// Compares a presented token with the stored one in constant time.
#[must_use]
pub fn tokens_match(presented: &str, stored: &str) -> bool {
    presented.trim().as_bytes().ct_eq(stored.as_bytes()).into()
}
