//! Challenge-response authentication against a server's REST surface.
//!
//! The client proves possession of an Ed25519 key: POST `/auth/challenge`
//! returns `{nonce, timestamp, server_origin}`, the client signs their
//! concatenation, and POST `/auth/verify` trades the signature for a bearer
//! token. A 401/403 anywhere means the stored token (if any) is dead and the
//! server must be disconnected.

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use ed25519_dalek::{Signer, SigningKey};
use rand::RngCore;
use rand::rngs::OsRng;
use serde::{Deserialize, Serialize};
use tracing::info;

use chorus_protocol::gateway::User;

#[derive(Debug, thiserror::Error)]
pub enum AuthError {
    #[error("http: {0}")]
    Http(#[from] reqwest::Error),
    #[error("credentials rejected by server")]
    Rejected,
}

/// The client's long-lived signing identity.
pub struct Identity {
    signing_key: SigningKey,
}

impl Identity {
    pub fn generate() -> Self {
        let mut seed = [0u8; 32];
        OsRng.fill_bytes(&mut seed);
        Self::from_seed(seed)
    }

    pub fn from_seed(seed: [u8; 32]) -> Self {
        Self { signing_key: SigningKey::from_bytes(&seed) }
    }

    pub fn public_key_b64(&self) -> String {
        BASE64.encode(self.signing_key.verifying_key().as_bytes())
    }

    pub fn sign_challenge(&self, challenge: &Challenge) -> String {
        let signature = self.signing_key.sign(&challenge_payload(challenge));
        BASE64.encode(signature.to_bytes())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Challenge {
    pub nonce: String,
    pub timestamp: u64,
    pub server_origin: String,
}

/// The signed byte string: `nonce || timestamp || server_origin`.
pub fn challenge_payload(challenge: &Challenge) -> Vec<u8> {
    format!(
        "{}{}{}",
        challenge.nonce, challenge.timestamp, challenge.server_origin
    )
    .into_bytes()
}

#[derive(Debug, Serialize)]
struct VerifyRequest<'a> {
    public_key: String,
    nonce: &'a str,
    timestamp: u64,
    signature: String,
    username: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    display_name: Option<&'a str>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct VerifyResponse {
    pub token: String,
    pub user: User,
}

pub struct AuthClient {
    http: reqwest::Client,
    base_url: String,
}

impl AuthClient {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            http: reqwest::Client::new(),
            base_url: base_url.into(),
        }
    }

    /// Run the full challenge-response flow and return a bearer token.
    pub async fn authenticate(
        &self,
        identity: &Identity,
        username: &str,
        display_name: Option<&str>,
    ) -> Result<VerifyResponse, AuthError> {
        let response = self
            .http
            .post(format!("{}/auth/challenge", self.base_url))
            .json(&serde_json::json!({}))
            .send()
            .await?;
        if response.status() == reqwest::StatusCode::UNAUTHORIZED
            || response.status() == reqwest::StatusCode::FORBIDDEN
        {
            return Err(AuthError::Rejected);
        }
        let challenge: Challenge = response.error_for_status()?.json().await?;

        let request = VerifyRequest {
            public_key: identity.public_key_b64(),
            nonce: &challenge.nonce,
            timestamp: challenge.timestamp,
            signature: identity.sign_challenge(&challenge),
            username,
            display_name,
        };
        let response = self
            .http
            .post(format!("{}/auth/verify", self.base_url))
            .json(&request)
            .send()
            .await?;
        if response.status() == reqwest::StatusCode::UNAUTHORIZED
            || response.status() == reqwest::StatusCode::FORBIDDEN
        {
            return Err(AuthError::Rejected);
        }
        let verified: VerifyResponse = response.error_for_status()?.json().await?;
        info!(user = %verified.user.id, "Authenticated");
        Ok(verified)
    }
}
