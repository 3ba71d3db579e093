//! Par de credenciais (access + refresh token) e sua validade.
//!
//! A validade em [`Credential::expires_at`] é apenas indicativa: o backend
//! responde 401 quando o token realmente expira e essa é a resposta que manda.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use crate::api::types::TokenResponse;

// Validade assumida quando o backend não informa `expires_in`.
const DEFAULT_ACCESS_TTL_SECS: i64 = 15 * 60;

/// Credential pair held by a [`TokenStore`](super::TokenStore).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Credential {
    pub access_token: String,
    pub refresh_token: String,
    pub expires_at: DateTime<Utc>,
}

impl Credential {
    pub fn new(access_token: String, refresh_token: String, expires_at: DateTime<Utc>) -> Self {
        Self {
            access_token,
            refresh_token,
            expires_at,
        }
    }

    /// Builds a credential from a login or refresh response.
    ///
    /// Refresh responses may omit the refresh token, in which case the
    /// `previous_refresh` one is carried over.
    pub fn from_token_response(resp: TokenResponse, previous_refresh: Option<&str>) -> Option<Self> {
        let refresh_token = resp
            .refresh_token
            .or_else(|| previous_refresh.map(str::to_string))?;
        let ttl = resp.expires_in.unwrap_or(DEFAULT_ACCESS_TTL_SECS);
        Some(Self {
            access_token: resp.access_token,
            refresh_token,
            expires_at: Utc::now() + Duration::seconds(ttl),
        })
    }

    /// Advisory check; a 401 is still the authoritative signal.
    pub fn is_expired(&self) -> bool {
        Utc::now() >= self.expires_at
    }
}
