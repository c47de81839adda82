//! Web Push delivery (VAPID + RFC 8291 `aes128gcm` content encryption),
//! grounded on `original_source/wodbooker/push_notifications.py`'s
//! `send_push_notification`. No web-push crate exists in the corpus, so the
//! VAPID JWT and message encryption are built directly from `p256`, `hkdf`,
//! `aes-gcm`, `sha2` and `base64` the way `db/crypto.rs` builds its AES-GCM
//! primitives.

use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::{Aes128Gcm, Key, Nonce};
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine as _;
use hkdf::Hkdf;
use p256::ecdh::EphemeralSecret;
use p256::ecdsa::signature::Signer;
use p256::ecdsa::{Signature, SigningKey};
use p256::elliptic_curve::sec1::ToEncodedPoint;
use p256::elliptic_curve::rand_core::OsRng;
use p256::PublicKey;
use serde::Serialize;
use serde_json::json;
use sha2::Sha256;

use crate::config::AppConfig;
use crate::db::models::PushSubscription;

const TTL_SECONDS: &str = "86400";

#[derive(Debug, thiserror::Error)]
pub enum PushError {
    #[error("VAPID keys not configured")]
    NotConfigured,
    #[error("invalid VAPID key material: {0}")]
    InvalidKey(String),
    #[error("invalid subscription key material: {0}")]
    InvalidSubscription(String),
    #[error("push service returned {0}")]
    ServiceError(reqwest::StatusCode),
    #[error("subscription is gone and should be deleted")]
    Gone,
    #[error("network error: {0}")]
    Network(#[from] reqwest::Error),
}

#[derive(Serialize)]
struct NotificationPayload<'a> {
    title: &'a str,
    body: &'a str,
    #[serde(flatten)]
    data: serde_json::Value,
}

/// Sends one encrypted push message to `subscription`. Returns `Err(Gone)`
/// when the push service reports the subscription is dead (404/410) so the
/// caller can delete it, matching the original's cleanup-on-WebPushException
/// behavior.
pub async fn send(
    http: &reqwest::Client,
    config: &AppConfig,
    subscription: &PushSubscription,
    title: &str,
    body: &str,
    data: serde_json::Value,
) -> Result<(), PushError> {
    let (public_key, private_key) = match (&config.vapid_public_key, &config.vapid_private_key) {
        (Some(p), Some(s)) => (p, s),
        _ => return Err(PushError::NotConfigured),
    };
    let claim_email = config
        .vapid_claim_email
        .clone()
        .unwrap_or_else(|| "mailto:admin@example.com".to_string());

    let payload = serde_json::to_vec(&NotificationPayload { title, body, data })
        .expect("payload always serializable");

    let encrypted = encrypt_payload(&payload, &subscription.p256dh, &subscription.auth)?;
    let jwt = build_vapid_jwt(&subscription.endpoint, &claim_email, private_key)?;

    let response = http
        .post(&subscription.endpoint)
        .header("content-encoding", "aes128gcm")
        .header("content-type", "application/octet-stream")
        .header("ttl", TTL_SECONDS)
        .header("authorization", format!("vapid t={jwt}, k={public_key}"))
        .body(encrypted)
        .send()
        .await?;

    match response.status() {
        s if s.is_success() => Ok(()),
        s if s == reqwest::StatusCode::NOT_FOUND || s == reqwest::StatusCode::GONE => {
            Err(PushError::Gone)
        }
        s => Err(PushError::ServiceError(s)),
    }
}

fn build_vapid_jwt(endpoint: &str, claim_email: &str, private_key_b64: &str) -> Result<String, PushError> {
    let aud = reqwest::Url::parse(endpoint)
        .map_err(|e| PushError::InvalidKey(e.to_string()))?
        .origin()
        .ascii_serialization();

    let header = URL_SAFE_NO_PAD.encode(br#"{"typ":"JWT","alg":"ES256"}"#);
    let exp = (chrono::Utc::now() + chrono::Duration::hours(12)).timestamp();
    let claims = json!({ "aud": aud, "exp": exp, "sub": claim_email });
    let claims_b64 = URL_SAFE_NO_PAD.encode(claims.to_string());

    let signing_input = format!("{header}.{claims_b64}");

    let key_bytes = decode_vapid_key(private_key_b64)?;
    let signing_key =
        SigningKey::from_slice(&key_bytes).map_err(|e| PushError::InvalidKey(e.to_string()))?;
    let signature: Signature = signing_key.sign(signing_input.as_bytes());
    let sig_b64 = URL_SAFE_NO_PAD.encode(signature.to_bytes());

    Ok(format!("{signing_input}.{sig_b64}"))
}

fn decode_vapid_key(raw: &str) -> Result<Vec<u8>, PushError> {
    URL_SAFE_NO_PAD
        .decode(raw.trim_end_matches('='))
        .map_err(|e| PushError::InvalidKey(e.to_string()))
}

/// Encrypts `plaintext` per RFC 8291 for delivery to a subscriber whose
/// ECDH public key and auth secret are `p256dh_b64`/`auth_b64` (both
/// base64url, as the browser's Push API returns them).
fn encrypt_payload(plaintext: &[u8], p256dh_b64: &str, auth_b64: &str) -> Result<Vec<u8>, PushError> {
    let ua_public_bytes = decode_vapid_key(p256dh_b64)
        .map_err(|_| PushError::InvalidSubscription("bad p256dh".into()))?;
    let auth_secret = decode_vapid_key(auth_b64)
        .map_err(|_| PushError::InvalidSubscription("bad auth secret".into()))?;

    let ua_public = PublicKey::from_sec1_bytes(&ua_public_bytes)
        .map_err(|e| PushError::InvalidSubscription(e.to_string()))?;

    let as_secret = EphemeralSecret::random(&mut OsRng);
    let as_public = as_secret.public_key();
    let as_public_bytes = as_public.to_encoded_point(false).as_bytes().to_vec();

    let shared_secret = as_secret.diffie_hellman(&ua_public);

    let mut key_info = Vec::new();
    key_info.extend_from_slice(b"WebPush: info\0");
    key_info.extend_from_slice(&ua_public_bytes);
    key_info.extend_from_slice(&as_public_bytes);

    let ikm_kdf = Hkdf::<Sha256>::new(Some(&auth_secret), shared_secret.raw_secret_bytes());
    let mut ikm = [0u8; 32];
    ikm_kdf
        .expand(&key_info, &mut ikm)
        .map_err(|_| PushError::InvalidSubscription("HKDF expand failed".into()))?;

    let salt: [u8; 16] = rand::random();
    let prk = Hkdf::<Sha256>::new(Some(&salt), &ikm);

    let mut cek = [0u8; 16];
    prk.expand(b"Content-Encoding: aes128gcm\0", &mut cek)
        .expect("16-byte expand cannot fail");
    let mut nonce_bytes = [0u8; 12];
    prk.expand(b"Content-Encoding: nonce\0", &mut nonce_bytes)
        .expect("12-byte expand cannot fail");

    let mut padded = plaintext.to_vec();
    padded.push(0x02); // delimiter octet, no additional padding

    let cipher = Aes128Gcm::new(Key::<Aes128Gcm>::from_slice(&cek));
    let nonce = Nonce::from_slice(&nonce_bytes);
    let ciphertext = cipher
        .encrypt(nonce, padded.as_slice())
        .map_err(|_| PushError::InvalidSubscription("encryption failed".into()))?;

    let record_size = (ciphertext.len() as u32) + (salt.len() as u32) + 4 + 1 + (as_public_bytes.len() as u32);
    let mut body = Vec::with_capacity(16 + 4 + 1 + as_public_bytes.len() + ciphertext.len());
    body.extend_from_slice(&salt);
    body.extend_from_slice(&record_size.to_be_bytes());
    body.push(as_public_bytes.len() as u8);
    body.extend_from_slice(&as_public_bytes);
    body.extend_from_slice(&ciphertext);

    Ok(body)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decode_vapid_key_tolerates_missing_padding() {
        let encoded = URL_SAFE_NO_PAD.encode([1u8, 2, 3, 4]);
        assert_eq!(decode_vapid_key(&encoded).unwrap(), vec![1, 2, 3, 4]);
    }

    #[test]
    fn encrypt_payload_roundtrips_through_matching_ecdh_keys() {
        let recipient_secret = EphemeralSecret::random(&mut OsRng);
        let recipient_public = recipient_secret.public_key();
        let p256dh = URL_SAFE_NO_PAD.encode(recipient_public.to_encoded_point(false).as_bytes());
        let auth: [u8; 16] = rand::random();
        let auth_b64 = URL_SAFE_NO_PAD.encode(auth);

        let body = encrypt_payload(b"hello", &p256dh, &auth_b64).unwrap();
        // salt(16) + record_size(4) + idlen(1) + keyid(65) + ciphertext
        assert!(body.len() > 16 + 4 + 1 + 65);
    }
}
