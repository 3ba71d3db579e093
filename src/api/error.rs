//! Tipos de erro do cliente autenticado.
//!
//! [`ClientError`] separa falhas de autenticação, erros HTTP do backend e
//! falhas de rede, para que cada camada decida se vale retentar.

use thiserror::Error;

/// Errors surfaced by [`AuthenticatedClient`](super::AuthenticatedClient).
#[derive(Debug, Error)]
pub enum ClientError {
    /// Sem credencial ou o refresh foi recusado. O token store já foi limpo.
    #[error("session expired, please log in again")]
    AuthExpired,

    /// 4xx diferente de 401 (requisição malformada, campo faltando...).
    #[error("request rejected (status {status}): {message}")]
    Validation { status: u16, message: String },

    /// 409/412: a versão enviada em `If-Match` não é mais a atual.
    #[error("conflicting update (status {status}): {message}")]
    Conflict { status: u16, message: String },

    /// 5xx ou corpo que não é o JSON esperado.
    #[error("backend error (status {status}): {message}")]
    Backend { status: u16, message: String },

    /// Nenhuma resposta recebida (DNS, conexão recusada, timeout).
    #[error("network error: {0}")]
    Network(#[from] reqwest::Error),

    /// A requisição foi abortada pelo chamador.
    #[error("request cancelled")]
    Cancelled,

    #[error("credential storage error: {0}")]
    Storage(#[from] std::io::Error),

    #[error("invalid request body: {0}")]
    Encode(#[from] serde_json::Error),
}

impl ClientError {
    /// Maps a non-success, non-401 status to the matching variant.
    pub fn from_status(status: u16, message: Option<String>) -> Self {
        let message = message.unwrap_or_else(|| format!("unexpected error (status {status})"));
        match status {
            409 | 412 => ClientError::Conflict { status, message },
            400..=499 => ClientError::Validation { status, message },
            _ => ClientError::Backend { status, message },
        }
    }

    /// Whether an idempotent read may be retried after this error.
    pub fn is_retryable(&self) -> bool {
        matches!(self, ClientError::Network(_) | ClientError::Backend { .. })
    }

    /// HTTP status, when the failure came with a response.
    pub fn status(&self) -> Option<u16> {
        match self {
            ClientError::AuthExpired => Some(401),
            ClientError::Validation { status, .. }
            | ClientError::Conflict { status, .. }
            | ClientError::Backend { status, .. } => Some(*status),
            _ => None,
        }
    }
}
