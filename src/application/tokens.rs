//! Short-lived sealed tokens that carry a bearer credential across the
//! unauthenticated download redirect.
//!
//! Wire format: `hex(nonce || AES-256-GCM(json{token, encoded_at_ns}))`.

use std::sync::Arc;
use std::time::Duration;

use aes_gcm::{
    Aes256Gcm, Nonce,
    aead::{Aead, KeyInit},
};
use rand::{RngCore, rngs::OsRng};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use time::OffsetDateTime;

use crate::domain::credentials::BearerToken;

/// Required length of the proxy secret in bytes.
pub const SECRET_LEN: usize = 32;

const AES_GCM_NONCE_LEN: usize = 12;

#[derive(Debug, Error)]
pub enum TokenError {
    #[error("failed to encode token: {0}")]
    Encoding(String),
    #[error("malformed token: {0}")]
    Malformed(String),
    #[error("invalid token")]
    Invalid,
    #[error("token expired: valid until {valid_until}")]
    Expired { valid_until: OffsetDateTime },
}

/// Authenticated-encryption primitive with a fixed nonce size.
pub trait TokenCipher: Send + Sync {
    fn nonce_size(&self) -> usize;
    fn seal(&self, nonce: &[u8], plaintext: &[u8]) -> Result<Vec<u8>, TokenError>;
    fn open(&self, nonce: &[u8], ciphertext: &[u8]) -> Result<Vec<u8>, TokenError>;
}

pub struct AesGcmCipher {
    inner: Aes256Gcm,
}

impl AesGcmCipher {
    pub fn new(secret: &[u8]) -> Result<Self, TokenError> {
        if secret.len() != SECRET_LEN {
            return Err(TokenError::Encoding(format!(
                "proxy secret must be {SECRET_LEN} bytes, got {}",
                secret.len()
            )));
        }
        let inner = Aes256Gcm::new_from_slice(secret)
            .map_err(|err| TokenError::Encoding(err.to_string()))?;
        Ok(Self { inner })
    }
}

impl TokenCipher for AesGcmCipher {
    fn nonce_size(&self) -> usize {
        AES_GCM_NONCE_LEN
    }

    fn seal(&self, nonce: &[u8], plaintext: &[u8]) -> Result<Vec<u8>, TokenError> {
        if nonce.len() != AES_GCM_NONCE_LEN {
            return Err(TokenError::Encoding("nonce has the wrong length".into()));
        }
        self.inner
            .encrypt(Nonce::from_slice(nonce), plaintext)
            .map_err(|err| TokenError::Encoding(err.to_string()))
    }

    fn open(&self, nonce: &[u8], ciphertext: &[u8]) -> Result<Vec<u8>, TokenError> {
        if nonce.len() != AES_GCM_NONCE_LEN {
            return Err(TokenError::Invalid);
        }
        self.inner
            .decrypt(Nonce::from_slice(nonce), ciphertext)
            .map_err(|_| TokenError::Invalid)
    }
}

pub type Clock = Arc<dyn Fn() -> OffsetDateTime + Send + Sync>;

#[derive(Debug, Serialize, Deserialize)]
struct SealedPayload {
    token: String,
    encoded_at_ns: i64,
}

/// Seals and opens download tokens.
#[derive(Clone)]
pub struct TokenCodec {
    cipher: Arc<dyn TokenCipher>,
    expiration: Duration,
    clock: Clock,
}

impl TokenCodec {
    pub fn new(cipher: Arc<dyn TokenCipher>, expiration: Duration) -> Self {
        Self {
            cipher,
            expiration,
            clock: Arc::new(OffsetDateTime::now_utc),
        }
    }

    pub fn from_secret(secret: &[u8], expiration: Duration) -> Result<Self, TokenError> {
        Ok(Self::new(Arc::new(AesGcmCipher::new(secret)?), expiration))
    }

    pub fn with_clock(mut self, clock: Clock) -> Self {
        self.clock = clock;
        self
    }

    pub fn encode(&self, credential: &BearerToken) -> Result<String, TokenError> {
        let encoded_at_ns = i64::try_from((self.clock)().unix_timestamp_nanos())
            .map_err(|_| TokenError::Encoding("timestamp out of range".into()))?;
        let payload = serde_json::to_vec(&SealedPayload {
            token: credential.expose().to_string(),
            encoded_at_ns,
        })
        .map_err(|err| TokenError::Encoding(format!("serializing token: {err}")))?;

        let mut nonce = vec![0u8; self.cipher.nonce_size()];
        OsRng
            .try_fill_bytes(&mut nonce)
            .map_err(|err| TokenError::Encoding(format!("generating nonce: {err}")))?;

        let sealed = self.cipher.seal(&nonce, &payload)?;
        let mut output = nonce;
        output.extend_from_slice(&sealed);
        Ok(hex::encode(output))
    }

    pub fn decode(&self, encoded: &str) -> Result<BearerToken, TokenError> {
        let raw = hex::decode(encoded)
            .map_err(|err| TokenError::Malformed(format!("decoding token string: {err}")))?;
        if hex::encode(&raw) != encoded {
            return Err(TokenError::Malformed("token must be lowercase hex".into()));
        }

        let nonce_size = self.cipher.nonce_size();
        if raw.len() < nonce_size {
            return Err(TokenError::Malformed("token is too short".into()));
        }

        let (nonce, ciphertext) = raw.split_at(nonce_size);
        let plaintext = self.cipher.open(nonce, ciphertext)?;

        let payload: SealedPayload = serde_json::from_slice(&plaintext)
            .map_err(|err| TokenError::Malformed(format!("decoding token payload: {err}")))?;
        let encoded_at = OffsetDateTime::from_unix_timestamp_nanos(i128::from(payload.encoded_at_ns))
            .map_err(|err| TokenError::Malformed(err.to_string()))?;

        let valid_until = encoded_at + self.expiration;
        if (self.clock)() >= valid_until {
            return Err(TokenError::Expired { valid_until });
        }

        BearerToken::new(payload.token)
            .ok_or_else(|| TokenError::Malformed("token carries an empty credential".into()))
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use time::macros::datetime;

    use super::*;

    const SECRET: [u8; SECRET_LEN] = [7u8; SECRET_LEN];

    struct ManualClock {
        now: Mutex<OffsetDateTime>,
    }

    impl ManualClock {
        fn new(now: OffsetDateTime) -> Arc<Self> {
            Arc::new(Self {
                now: Mutex::new(now),
            })
        }

        fn set(&self, now: OffsetDateTime) {
            *self.now.lock().expect("clock lock") = now;
        }

        fn clock(self: &Arc<Self>) -> Clock {
            let this = Arc::clone(self);
            Arc::new(move || *this.now.lock().expect("clock lock"))
        }
    }

    fn codec(clock: &Arc<ManualClock>) -> TokenCodec {
        TokenCodec::from_secret(&SECRET, Duration::from_secs(60))
            .expect("valid secret")
            .with_clock(clock.clock())
    }

    fn credential() -> BearerToken {
        BearerToken::new("ghp_example").expect("credential")
    }

    #[test]
    fn round_trip_within_window() {
        let t0 = datetime!(2024-05-01 12:00:00 UTC);
        let clock = ManualClock::new(t0);
        let codec = codec(&clock);

        let token = codec.encode(&credential()).expect("encode");

        for offset in [0, 1, 30, 59] {
            clock.set(t0 + Duration::from_secs(offset));
            assert_eq!(codec.decode(&token).expect("decode"), credential());
        }
        clock.set(t0 + Duration::from_millis(59_999));
        assert_eq!(codec.decode(&token).expect("decode"), credential());
    }

    #[test]
    fn expires_at_window_boundary() {
        let t0 = datetime!(2024-05-01 12:00:00 UTC);
        let clock = ManualClock::new(t0);
        let codec = codec(&clock);
        let token = codec.encode(&credential()).expect("encode");

        for offset in [60, 61, 3600] {
            clock.set(t0 + Duration::from_secs(offset));
            let err = codec.decode(&token).expect_err("expired");
            assert!(matches!(err, TokenError::Expired { .. }), "got {err:?}");
        }
    }

    #[test]
    fn every_single_bit_flip_is_rejected_as_invalid() {
        let clock = ManualClock::new(datetime!(2024-05-01 12:00:00 UTC));
        let codec = codec(&clock);
        let token = codec.encode(&credential()).expect("encode");
        let raw = hex::decode(&token).expect("hex");

        for byte in 0..raw.len() {
            for bit in 0..8 {
                let mut corrupted = raw.clone();
                corrupted[byte] ^= 1 << bit;
                let err = codec
                    .decode(&hex::encode(&corrupted))
                    .expect_err("corruption must be detected");
                assert!(matches!(err, TokenError::Invalid), "byte {byte} bit {bit}: {err:?}");
            }
        }
    }

    #[test]
    fn no_single_bit_flip_of_the_token_string_is_accepted() {
        let clock = ManualClock::new(datetime!(2024-05-01 12:00:00 UTC));
        let codec = codec(&clock);
        let token = codec.encode(&credential()).expect("encode");

        let mut accepted = Vec::new();
        for index in 0..token.len() {
            for bit in 0..8 {
                let mut bytes = token.clone().into_bytes();
                bytes[index] ^= 1 << bit;
                let Ok(corrupted) = String::from_utf8(bytes) else {
                    continue;
                };
                if codec.decode(&corrupted).is_ok() {
                    accepted.push((index, bit));
                }
            }
        }
        assert!(accepted.is_empty(), "accepted flips: {accepted:?}");
    }

    #[test]
    fn uppercase_hex_is_malformed() {
        let clock = ManualClock::new(datetime!(2024-05-01 12:00:00 UTC));
        let codec = codec(&clock);
        let token = codec.encode(&credential()).expect("encode");

        let err = codec
            .decode(&token.to_ascii_uppercase())
            .expect_err("uppercase");
        assert!(matches!(err, TokenError::Malformed(_)), "got {err:?}");
    }

    #[test]
    fn nonces_are_fresh_per_encode() {
        let clock = ManualClock::new(datetime!(2024-05-01 12:00:00 UTC));
        let codec = codec(&clock);
        let a = codec.encode(&credential()).expect("encode");
        let b = codec.encode(&credential()).expect("encode");
        assert_ne!(a, b);
        assert_ne!(a[..AES_GCM_NONCE_LEN * 2], b[..AES_GCM_NONCE_LEN * 2]);
    }

    #[test]
    fn rejects_non_hex_and_short_tokens() {
        let clock = ManualClock::new(datetime!(2024-05-01 12:00:00 UTC));
        let codec = codec(&clock);

        assert!(matches!(
            codec.decode("not-hex"),
            Err(TokenError::Malformed(_))
        ));
        assert!(matches!(codec.decode("abcd"), Err(TokenError::Malformed(_))));
        assert!(matches!(codec.decode(""), Err(TokenError::Malformed(_))));
    }

    #[test]
    fn rejects_tokens_sealed_with_a_foreign_key() {
        let clock = ManualClock::new(datetime!(2024-05-01 12:00:00 UTC));
        let token = codec(&clock).encode(&credential()).expect("encode");

        let foreign = TokenCodec::from_secret(&[9u8; SECRET_LEN], Duration::from_secs(60))
            .expect("valid secret")
            .with_clock(clock.clock());
        assert!(matches!(foreign.decode(&token), Err(TokenError::Invalid)));
    }

    #[test]
    fn rejects_wrong_secret_length() {
        assert!(AesGcmCipher::new(&[1u8; 16]).is_err());
        assert!(TokenCodec::from_secret(&[], Duration::from_secs(1)).is_err());
    }
}
