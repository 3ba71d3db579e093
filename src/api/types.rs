//! Tipos de dados trocados com o backend de CPR.
//!
//! Todas as structs derivam `Serialize`/`Deserialize` no formato JSON que o
//! backend usa (snake_case, alguns campos em português como `documento_url`).

use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Corpo do `POST /login`.
#[derive(Debug, Clone, Serialize)]
pub struct LoginRequest {
    pub username: String,
    pub password: String,
}

/// Corpo do `POST /auth/refresh`.
#[derive(Debug, Clone, Serialize)]
pub struct RefreshRequest {
    pub refresh_token: String,
}

/// Resposta de login e de refresh.
///
/// O refresh pode devolver só um novo access token; nesse caso o refresh
/// token anterior continua valendo.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TokenResponse {
    pub access_token: String,
    #[serde(default)]
    pub refresh_token: Option<String>,
    #[serde(default)]
    pub token_type: Option<String>,
    /// Validade do access token em segundos.
    #[serde(default)]
    pub expires_in: Option<i64>,
}

/// Envelope de erro `{ "detail": ... }`.
///
/// `detail` costuma ser uma string, mas erros de validação chegam como lista
/// de objetos `{ "msg": ... }`.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ErrorBody {
    #[serde(default)]
    pub detail: Option<Value>,
}

impl ErrorBody {
    /// Extracts a display-safe message from a raw error body, if any.
    pub fn message_from(raw: &str) -> Option<String> {
        let body: ErrorBody = serde_json::from_str(raw).ok()?;
        match body.detail? {
            Value::String(s) if !s.trim().is_empty() => Some(s),
            Value::Array(items) => {
                let msgs: Vec<String> = items
                    .iter()
                    .filter_map(|item| match item {
                        Value::String(s) => Some(s.clone()),
                        other => other.get("msg").and_then(Value::as_str).map(str::to_string),
                    })
                    .collect();
                (!msgs.is_empty()).then(|| msgs.join("; "))
            }
            _ => None,
        }
    }
}

/// The two workflows the backend runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum WorkflowKind {
    #[serde(rename = "analise_cpr")]
    Analyse,
    #[serde(rename = "criar_cpr")]
    Create,
}

impl WorkflowKind {
    /// Path segment used under `/workflow/{kind}/...`.
    pub fn path_segment(self) -> &'static str {
        match self {
            WorkflowKind::Analyse => "analise",
            WorkflowKind::Create => "criar",
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            WorkflowKind::Analyse => "analise_cpr",
            WorkflowKind::Create => "criar_cpr",
        }
    }
}

impl fmt::Display for WorkflowKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Corpo do `POST /workflow/{kind}/start`.
#[derive(Debug, Clone, Default, Serialize)]
pub struct StartRequest {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
}

/// Corpo do `POST /workflow/{kind}/continue`.
#[derive(Debug, Clone, Serialize)]
pub struct ContinueRequest {
    pub session_id: String,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub step_data: Option<Value>,
}

/// Dados de negócio devolvidos pelo workflow. Opacos para este cliente.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkflowPayload {
    pub extracted_data: Option<Value>,
    pub compliance_result: Option<Value>,
    pub risk_result: Option<Value>,
    #[serde(alias = "documento_url")]
    pub document_url: Option<String>,
    pub document_data: Option<Value>,
}

impl WorkflowPayload {
    pub fn is_empty(&self) -> bool {
        *self == WorkflowPayload::default()
    }
}

/// Resposta de start, continue e status.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct WorkflowResponse {
    #[serde(default)]
    pub text: String,
    #[serde(default)]
    pub session_id: String,
    #[serde(default)]
    pub workflow_type: Option<String>,
    #[serde(default)]
    pub is_waiting_input: bool,
    #[serde(default)]
    pub current_step: Option<String>,
    /// Só aparece no status do workflow de criação.
    #[serde(default)]
    pub documento_gerado: Option<bool>,
    /// Erro irrecuperável reportado pelo próprio workflow.
    #[serde(default)]
    pub error: Option<String>,
    #[serde(flatten)]
    pub payload: WorkflowPayload,
}

impl WorkflowResponse {
    /// True once the server reports a finished document.
    pub fn document_ready(&self) -> bool {
        self.documento_gerado == Some(true)
    }

    pub fn server_error(&self) -> Option<&str> {
        self.error.as_deref().filter(|e| !e.trim().is_empty())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn error_message_from_string_detail() {
        let msg = ErrorBody::message_from(r#"{"detail": "session_id é obrigatório"}"#);
        assert_eq!(msg.as_deref(), Some("session_id é obrigatório"));
    }

    #[test]
    fn error_message_from_validation_list() {
        let raw = r#"{"detail": [{"loc": ["body", "message"], "msg": "field required"}, {"msg": "bad id"}]}"#;
        assert_eq!(
            ErrorBody::message_from(raw).as_deref(),
            Some("field required; bad id")
        );
    }

    #[test]
    fn error_message_missing_or_garbage() {
        assert!(ErrorBody::message_from("{}").is_none());
        assert!(ErrorBody::message_from(r#"{"detail": ""}"#).is_none());
        assert!(ErrorBody::message_from("<html>502</html>").is_none());
    }

    #[test]
    fn start_request_omits_missing_session() {
        let body = serde_json::to_value(StartRequest::default()).unwrap();
        assert_eq!(body, json!({}));
        let body = serde_json::to_value(StartRequest {
            session_id: Some("abc".into()),
        })
        .unwrap();
        assert_eq!(body, json!({"session_id": "abc"}));
    }

    #[test]
    fn workflow_response_from_status_payload() {
        let resp: WorkflowResponse = serde_json::from_value(json!({
            "session_id": "abc123",
            "is_waiting_input": false,
            "current_step": "documento_pronto",
            "documento_gerado": true,
            "documento_url": "https://files.example/abc123.pdf",
            "extracted_data": {"emitente": "Fazenda Boa Vista"}
        }))
        .unwrap();
        assert!(resp.document_ready());
        assert_eq!(
            resp.payload.document_url.as_deref(),
            Some("https://files.example/abc123.pdf")
        );
        assert_eq!(resp.payload.extracted_data.unwrap()["emitente"], "Fazenda Boa Vista");
        assert!(resp.text.is_empty());
    }

    #[test]
    fn workflow_kind_wire_names() {
        assert_eq!(serde_json::to_value(WorkflowKind::Analyse).unwrap(), json!("analise_cpr"));
        assert_eq!(WorkflowKind::Create.path_segment(), "criar");
        assert_eq!(WorkflowKind::Create.to_string(), "criar_cpr");
    }
}
