//! Bearer-token user verification

use async_trait::async_trait;
use jsonwebtoken::{decode, Algorithm, DecodingKey, Validation};
use serde::Deserialize;
use serde_json::Value;

use super::event::AuditUser;
use super::storage::UserVerifier;

#[derive(Debug, Deserialize)]
struct UserClaims {
    #[serde(default)]
    id: Option<Value>,
}

/// Checks HS256 tokens whose `id` claim must equal the entry's user id
///
/// Expiry is enforced only when the token carries `exp`.
pub struct JwtUserVerifier {
    decoding_key: DecodingKey,
    validation: Validation,
}

impl JwtUserVerifier {
    /// Verifier for tokens signed with `secret`
    pub fn new(secret: &str) -> Self {
        let mut validation = Validation::new(Algorithm::HS256);
        validation.required_spec_claims.clear();
        Self {
            decoding_key: DecodingKey::from_secret(secret.as_bytes()),
            validation,
        }
    }
}

impl std::fmt::Debug for JwtUserVerifier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JwtUserVerifier").finish_non_exhaustive()
    }
}

#[async_trait]
impl UserVerifier for JwtUserVerifier {
    async fn verify(&self, token: &str, user_id: &str, _user: &AuditUser) -> bool {
        match decode::<UserClaims>(token, &self.decoding_key, &self.validation) {
            Ok(data) => match data.claims.id {
                Some(Value::String(id)) => id == user_id,
                Some(Value::Number(id)) => id.to_string() == user_id,
                _ => false,
            },
            Err(e) => {
                tracing::debug!(error = %e, "audit user token rejected");
                false
            }
        }
    }
}
