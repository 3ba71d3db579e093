//! Rascunhos de CPR persistidos no servidor.
//!
//! O [`DraftRepository`] cria, lê, atualiza parcialmente e submete rascunhos.
//! A submissão é terminal: depois dela qualquer `patch` falha localmente,
//! sem ida à rede. O servidor continua sendo a fonte da verdade: toda
//! resposta substitui a cópia local, nada é mesclado do lado do cliente.

use std::collections::HashMap;
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use reqwest::Method;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::{debug, info};

use crate::api::{ApiResponse, AuthenticatedClient, ClientError, RequestOptions};
use crate::error::CprError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DraftStatus {
    #[default]
    Draft,
    Submitted,
}

/// Server representation of a draft.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Draft {
    #[serde(alias = "id")]
    pub draft_id: String,
    #[serde(default)]
    pub fields: Map<String, Value>,
    #[serde(default)]
    pub status: DraftStatus,
    /// Concurrency token, from the body or the `ETag` header.
    #[serde(default)]
    pub version: Option<String>,
    #[serde(default)]
    pub updated_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubmitResult {
    #[serde(default, alias = "id")]
    pub draft_id: String,
    #[serde(default = "submitted")]
    pub status: DraftStatus,
    #[serde(default, alias = "documento_url")]
    pub document_url: Option<String>,
    #[serde(default)]
    pub message: Option<String>,
}

fn submitted() -> DraftStatus {
    DraftStatus::Submitted
}

#[derive(Debug, Serialize)]
struct FieldsBody<'a> {
    fields: &'a Map<String, Value>,
}

#[derive(Debug, Clone)]
struct Known {
    status: DraftStatus,
    version: Option<String>,
}

/// CRUD over `/drafts`, on top of [`AuthenticatedClient`].
pub struct DraftRepository {
    client: AuthenticatedClient,
    known: Mutex<HashMap<String, Known>>,
}

impl DraftRepository {
    pub fn new(client: AuthenticatedClient) -> Self {
        Self {
            client,
            known: Mutex::new(HashMap::new()),
        }
    }

    pub async fn create(&self, initial: Option<Map<String, Value>>) -> Result<Draft, CprError> {
        let fields = initial.unwrap_or_default();
        let body = serde_json::to_value(FieldsBody { fields: &fields }).map_err(ClientError::from)?;
        let resp = self
            .client
            .request(Method::POST, "/drafts", Some(body), &RequestOptions::default())
            .await?;
        let draft = self.remember(resp)?;
        info!(draft_id = %draft.draft_id, "draft created");
        Ok(draft)
    }

    pub async fn get(&self, draft_id: &str) -> Result<Draft, CprError> {
        let resp = self
            .client
            .request(
                Method::GET,
                &format!("/drafts/{draft_id}"),
                None,
                &RequestOptions::default(),
            )
            .await?;
        self.remember(resp)
    }

    /// Partially updates a draft and returns the server's merged version.
    ///
    /// When a version is known it is sent as `If-Match`; a stale version
    /// comes back as [`ClientError::Conflict`].
    pub async fn patch(&self, draft_id: &str, partial: Map<String, Value>) -> Result<Draft, CprError> {
        let known = self.ensure_editable(draft_id)?;
        let body = serde_json::to_value(FieldsBody { fields: &partial }).map_err(ClientError::from)?;
        let opts = RequestOptions {
            if_match: known.and_then(|k| k.version),
            ..RequestOptions::default()
        };
        debug!(draft_id, fields = partial.len(), versioned = opts.if_match.is_some(), "patching draft");
        let resp = self
            .client
            .request(Method::PATCH, &format!("/drafts/{draft_id}"), Some(body), &opts)
            .await?;
        self.remember(resp)
    }

    /// Terminal transition. Later patches fail without a network call.
    pub async fn submit(
        &self,
        draft_id: &str,
        final_fields: Map<String, Value>,
    ) -> Result<SubmitResult, CprError> {
        self.ensure_editable(draft_id)?;
        let body = serde_json::to_value(FieldsBody { fields: &final_fields }).map_err(ClientError::from)?;
        let resp = self
            .client
            .request(
                Method::POST,
                &format!("/drafts/{draft_id}/submit"),
                Some(body),
                &RequestOptions::default(),
            )
            .await?;
        // Accepted by the server: terminal from here on, whatever the body says.
        self.mark_submitted(draft_id);
        let mut result: SubmitResult = if resp.body.trim().is_empty() {
            SubmitResult {
                draft_id: String::new(),
                status: DraftStatus::Submitted,
                document_url: None,
                message: None,
            }
        } else {
            resp.json()?
        };
        if result.draft_id.is_empty() {
            result.draft_id = draft_id.to_string();
        }
        info!(draft_id, "draft submitted");
        Ok(result)
    }

    /// Last status the server reported for `draft_id`, if seen.
    pub fn known_status(&self, draft_id: &str) -> Option<DraftStatus> {
        self.known_map().get(draft_id).map(|k| k.status)
    }

    fn ensure_editable(&self, draft_id: &str) -> Result<Option<Known>, CprError> {
        let known = self.known_map().get(draft_id).cloned();
        if known.as_ref().is_some_and(|k| k.status == DraftStatus::Submitted) {
            return Err(CprError::DraftSubmitted(draft_id.to_string()));
        }
        Ok(known)
    }

    /// Decodes a draft response and records its status and version.
    ///
    /// `Submitted` is sticky: a response that was in flight before the
    /// submit never brings the draft back to `Draft`.
    fn remember(&self, resp: ApiResponse) -> Result<Draft, CprError> {
        let mut draft: Draft = resp.json()?;
        if draft.version.is_none() {
            draft.version = resp.header("etag").map(str::to_string);
        }
        let mut known = self.known_map();
        match known.get_mut(&draft.draft_id) {
            Some(entry) if entry.status == DraftStatus::Submitted => {
                debug!(draft_id = %draft.draft_id, "ignoring stale draft status after submit");
            }
            Some(entry) => {
                entry.status = draft.status;
                entry.version = draft.version.clone();
            }
            None => {
                known.insert(
                    draft.draft_id.clone(),
                    Known {
                        status: draft.status,
                        version: draft.version.clone(),
                    },
                );
            }
        }
        Ok(draft)
    }

    fn mark_submitted(&self, draft_id: &str) {
        self.known_map().insert(
            draft_id.to_string(),
            Known {
                status: DraftStatus::Submitted,
                version: None,
            },
        );
    }

    fn known_map(&self) -> std::sync::MutexGuard<'_, HashMap<String, Known>> {
        self.known
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::ClientConfig;
    use crate::auth::{Credential, MemoryTokenStore, TokenStore};
    use chrono::Duration as ChronoDuration;
    use serde_json::json;
    use std::sync::Arc;
    use wiremock::matchers::{body_json, header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn repo_for(server: &MockServer) -> DraftRepository {
        let store: Arc<dyn TokenStore> = Arc::new(MemoryTokenStore::with_credential(Credential::new(
            "token".into(),
            "refresh".into(),
            Utc::now() + ChronoDuration::minutes(10),
        )));
        DraftRepository::new(
            AuthenticatedClient::new(ClientConfig::with_base_url(server.uri()), store).unwrap(),
        )
    }

    fn fields(value: Value) -> Map<String, Value> {
        match value {
            Value::Object(map) => map,
            _ => panic!("expected object"),
        }
    }

    #[tokio::test]
    async fn create_then_patch_uses_server_representation() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/drafts"))
            .and(body_json(json!({"fields": {"emitente": "Fazenda Boa Vista"}})))
            .respond_with(ResponseTemplate::new(201).set_body_json(json!({
                "id": "d1",
                "fields": {"emitente": "Fazenda Boa Vista"},
                "status": "draft"
            })))
            .mount(&server)
            .await;
        Mock::given(method("PATCH"))
            .and(path("/drafts/d1"))
            .and(body_json(json!({"fields": {"produto": "soja"}})))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "draft_id": "d1",
                "fields": {"emitente": "Fazenda Boa Vista", "produto": "soja", "safra": "2025/26"},
                "status": "draft"
            })))
            .expect(1)
            .mount(&server)
            .await;

        let repo = repo_for(&server);
        let draft = repo
            .create(Some(fields(json!({"emitente": "Fazenda Boa Vista"}))))
            .await
            .unwrap();
        assert_eq!(draft.draft_id, "d1");
        assert_eq!(draft.status, DraftStatus::Draft);

        let patched = repo.patch("d1", fields(json!({"produto": "soja"}))).await.unwrap();
        // Server-side additions come through untouched.
        assert_eq!(patched.fields["safra"], "2025/26");
        assert_eq!(patched.fields.len(), 3);
    }

    #[tokio::test]
    async fn patch_after_submit_fails_without_network() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/drafts/d1/submit"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "draft_id": "d1",
                "status": "submitted",
                "documento_url": "https://files.example/d1.pdf"
            })))
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("PATCH"))
            .and(path("/drafts/d1"))
            .respond_with(ResponseTemplate::new(200))
            .expect(0)
            .mount(&server)
            .await;

        let repo = repo_for(&server);
        let result = repo.submit("d1", Map::new()).await.unwrap();
        assert_eq!(result.status, DraftStatus::Submitted);
        assert_eq!(result.document_url.as_deref(), Some("https://files.example/d1.pdf"));

        let err = repo.patch("d1", fields(json!({"produto": "milho"}))).await.unwrap_err();
        assert!(matches!(err, CprError::DraftSubmitted(ref id) if id == "d1"));
        let err = repo.submit("d1", Map::new()).await.unwrap_err();
        assert!(matches!(err, CprError::DraftSubmitted(_)));
        assert_eq!(repo.known_status("d1"), Some(DraftStatus::Submitted));
    }

    #[tokio::test]
    async fn submitted_status_from_get_blocks_patch() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/drafts/d9"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "id": "d9",
                "fields": {},
                "status": "submitted"
            })))
            .mount(&server)
            .await;

        let repo = repo_for(&server);
        repo.get("d9").await.unwrap();
        assert!(matches!(
            repo.patch("d9", Map::new()).await,
            Err(CprError::DraftSubmitted(_))
        ));
    }

    #[tokio::test]
    async fn known_version_is_sent_as_if_match() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/drafts/d2"))
            .respond_with(
                ResponseTemplate::new(200)
                    .insert_header("ETag", "\"v7\"")
                    .set_body_json(json!({"id": "d2", "fields": {}, "status": "draft"})),
            )
            .mount(&server)
            .await;
        Mock::given(method("PATCH"))
            .and(path("/drafts/d2"))
            .and(header("if-match", "\"v7\""))
            .respond_with(
                ResponseTemplate::new(412).set_body_json(json!({"detail": "rascunho alterado em outra aba"})),
            )
            .expect(1)
            .mount(&server)
            .await;

        let repo = repo_for(&server);
        let draft = repo.get("d2").await.unwrap();
        assert_eq!(draft.version.as_deref(), Some("\"v7\""));

        let err = repo.patch("d2", fields(json!({"valor": 10}))).await.unwrap_err();
        match err {
            CprError::Client(ClientError::Conflict { status, message }) => {
                assert_eq!(status, 412);
                assert_eq!(message, "rascunho alterado em outra aba");
            }
            other => panic!("expected conflict, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn unversioned_patch_sends_no_if_match() {
        let server = MockServer::start().await;
        Mock::given(method("PATCH"))
            .and(path("/drafts/d3"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "id": "d3", "fields": {"a": 1}, "status": "draft"
            })))
            .mount(&server)
            .await;

        let repo = repo_for(&server);
        repo.patch("d3", fields(json!({"a": 1}))).await.unwrap();
        let received = server.received_requests().await.unwrap();
        assert!(received[0].headers.get("if-match").is_none());
    }

    #[tokio::test]
    async fn late_patch_response_does_not_reopen_submitted_draft() {
        let server = MockServer::start().await;
        Mock::given(method("PATCH"))
            .and(path("/drafts/d4"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(json!({"id": "d4", "fields": {"a": 1}, "status": "draft"}))
                    .set_delay(std::time::Duration::from_millis(300)),
            )
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/drafts/d4/submit"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "draft_id": "d4",
                "status": "submitted"
            })))
            .expect(1)
            .mount(&server)
            .await;

        let repo = Arc::new(repo_for(&server));
        let in_flight = {
            let repo = repo.clone();
            tokio::spawn(async move { repo.patch("d4", fields(json!({"a": 1}))).await })
        };
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        repo.submit("d4", Map::new()).await.unwrap();

        // The patch was sent before the submit, so its response still arrives.
        let late = in_flight.await.unwrap().unwrap();
        assert_eq!(late.status, DraftStatus::Draft);
        assert_eq!(repo.known_status("d4"), Some(DraftStatus::Submitted));
        assert!(matches!(
            repo.patch("d4", fields(json!({"a": 2}))).await,
            Err(CprError::DraftSubmitted(_))
        ));
    }

    #[tokio::test]
    async fn accepted_submit_without_draft_id_is_terminal() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/drafts/d5/submit"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"status": "submitted"})))
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/drafts/d6/submit"))
            .respond_with(ResponseTemplate::new(204))
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("PATCH"))
            .respond_with(ResponseTemplate::new(409))
            .expect(0)
            .mount(&server)
            .await;

        let repo = repo_for(&server);
        let result = repo.submit("d5", Map::new()).await.unwrap();
        assert_eq!(result.draft_id, "d5");
        assert_eq!(result.status, DraftStatus::Submitted);
        assert!(matches!(
            repo.patch("d5", Map::new()).await,
            Err(CprError::DraftSubmitted(_))
        ));

        let result = repo.submit("d6", Map::new()).await.unwrap();
        assert_eq!(result.draft_id, "d6");
        assert_eq!(repo.known_status("d6"), Some(DraftStatus::Submitted));
    }
}
