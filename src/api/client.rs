use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures::FutureExt;
use futures::future::{BoxFuture, Shared};
use reqwest::header::{HeaderMap, IF_MATCH};
use reqwest::{Client, Method};
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::error::ClientError;
use super::types::{ErrorBody, LoginRequest, RefreshRequest, TokenResponse};
use crate::auth::{Credential, TokenStore};

const DEFAULT_BASE_URL: &str = "http://localhost:8000";

/// Resolves to the rotated credential, or `None` when the refresh failed.
type RefreshFuture = Shared<BoxFuture<'static, Option<Credential>>>;

/// Connection settings for [`AuthenticatedClient`].
#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub base_url: String,
    pub login_path: String,
    pub refresh_path: String,
    pub connect_timeout: Duration,
    /// Upper bound for every call, refresh included.
    pub request_timeout: Duration,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            base_url: DEFAULT_BASE_URL.to_string(),
            login_path: "/login".to_string(),
            refresh_path: "/auth/refresh".to_string(),
            connect_timeout: Duration::from_secs(10),
            request_timeout: Duration::from_secs(30),
        }
    }
}

impl ClientConfig {
    pub fn with_base_url(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            ..Self::default()
        }
    }
}

/// Per-call knobs.
#[derive(Debug, Clone, Default)]
pub struct RequestOptions {
    /// Overrides the client-wide timeout for this call.
    pub timeout: Option<Duration>,
    /// Aborts the call (and any retry) when cancelled.
    pub cancel: Option<CancellationToken>,
    /// Sent as `If-Match` for optimistic concurrency.
    pub if_match: Option<String>,
}

impl RequestOptions {
    pub fn with_cancel(cancel: CancellationToken) -> Self {
        Self {
            cancel: Some(cancel),
            ..Self::default()
        }
    }
}

/// A successful (2xx) response with its body read into memory.
#[derive(Debug, Clone)]
pub struct ApiResponse {
    pub status: u16,
    pub headers: HeaderMap,
    pub body: String,
}

impl ApiResponse {
    /// Decodes the body; malformed JSON is a backend fault.
    pub fn json<T: DeserializeOwned>(&self) -> Result<T, ClientError> {
        serde_json::from_str(&self.body).map_err(|e| ClientError::Backend {
            status: self.status,
            message: format!("malformed response from backend: {e}"),
        })
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).and_then(|v| v.to_str().ok())
    }
}

/// HTTP client that attaches the stored bearer token and transparently
/// survives access-token expiry.
///
/// On a 401 the client refreshes the credential pair and retries the
/// original request once. Concurrent 401s share a single refresh: the
/// in-flight refresh is a [`Shared`] future every faulting caller awaits.
/// Cloning is cheap and clones share the same refresh slot and token store.
#[derive(Clone)]
pub struct AuthenticatedClient {
    inner: Arc<Inner>,
}

struct Inner {
    http: Client,
    config: ClientConfig,
    store: Arc<dyn TokenStore>,
    refresh_slot: Mutex<Option<RefreshFuture>>,
}

impl AuthenticatedClient {
    pub fn new(config: ClientConfig, store: Arc<dyn TokenStore>) -> Result<Self, ClientError> {
        let http = Client::builder()
            .connect_timeout(config.connect_timeout)
            .timeout(config.request_timeout)
            .build()?;
        Ok(Self {
            inner: Arc::new(Inner {
                http,
                config,
                store,
                refresh_slot: Mutex::new(None),
            }),
        })
    }

    pub fn base_url(&self) -> &str {
        &self.inner.config.base_url
    }

    pub fn store(&self) -> &Arc<dyn TokenStore> {
        &self.inner.store
    }

    pub fn is_authenticated(&self) -> bool {
        self.inner.store.get().is_some()
    }

    /// Exchanges username/password for a credential pair and stores it.
    pub async fn login(&self, username: &str, password: &str) -> Result<Credential, ClientError> {
        let body = serde_json::to_value(LoginRequest {
            username: username.to_string(),
            password: password.to_string(),
        })?;
        let path = self.inner.config.login_path.clone();
        let resp = self
            .inner
            .send(Method::POST, &path, Some(&body), None, &RequestOptions::default())
            .await?;
        let resp = check_status(resp)?;
        let tokens: TokenResponse = resp.json()?;
        let credential = Credential::from_token_response(tokens, None).ok_or_else(|| {
            ClientError::Backend {
                status: resp.status,
                message: "login response carried no refresh token".to_string(),
            }
        })?;
        self.inner.store.set(credential.clone())?;
        info!(user = username, "logged in");
        Ok(credential)
    }

    /// Drops all credential material.
    pub fn logout(&self) -> Result<(), ClientError> {
        self.inner.store.clear()?;
        info!("logged out");
        Ok(())
    }

    /// Issues a request with the current credential attached.
    ///
    /// Only a 401 triggers the refresh-and-retry-once sequence; every other
    /// failure is returned to the caller untouched.
    pub async fn request(
        &self,
        method: Method,
        path: &str,
        body: Option<Value>,
        opts: &RequestOptions,
    ) -> Result<ApiResponse, ClientError> {
        let sent_with = self.inner.store.get();
        let token = sent_with.as_ref().map(|c| c.access_token.as_str());
        let resp = self
            .inner
            .send(method.clone(), path, body.as_ref(), token, opts)
            .await?;
        if resp.status != 401 {
            return check_status(resp);
        }

        // Without a credential there is nothing to refresh with.
        let Some(stale) = sent_with else {
            debug!(%method, path, "401 without credential");
            return Err(ClientError::AuthExpired);
        };

        let fresh = self.refreshed_credential(&stale, opts.cancel.as_ref()).await?;
        let retry = self
            .inner
            .send(method.clone(), path, body.as_ref(), Some(&fresh.access_token), opts)
            .await?;
        if retry.status == 401 {
            warn!(%method, path, "request rejected again after refresh");
            self.expire();
            return Err(ClientError::AuthExpired);
        }
        check_status(retry)
    }

    pub async fn get_json<T: DeserializeOwned>(
        &self,
        path: &str,
        opts: &RequestOptions,
    ) -> Result<T, ClientError> {
        self.request(Method::GET, path, None, opts).await?.json()
    }

    pub async fn send_json<B: Serialize, T: DeserializeOwned>(
        &self,
        method: Method,
        path: &str,
        body: &B,
        opts: &RequestOptions,
    ) -> Result<T, ClientError> {
        let body = serde_json::to_value(body)?;
        self.request(method, path, Some(body), opts).await?.json()
    }

    /// Returns a usable credential after `stale` was rejected, joining the
    /// in-flight refresh or starting one.
    ///
    /// A cancelled caller stops waiting at once; the refresh keeps running
    /// for everyone else.
    async fn refreshed_credential(
        &self,
        stale: &Credential,
        cancel: Option<&CancellationToken>,
    ) -> Result<Credential, ClientError> {
        let pending = {
            let mut slot = self
                .inner
                .refresh_slot
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            match slot.as_ref() {
                Some(pending) => pending.clone(),
                None => {
                    // A refresh that already finished left its result in the
                    // store before releasing the slot.
                    match self.inner.store.get() {
                        None => return Err(ClientError::AuthExpired),
                        Some(current) if current.access_token != stale.access_token => {
                            debug!("token already rotated by another request");
                            return Ok(current);
                        }
                        Some(current) => {
                            let pending = Inner::start_refresh(self.inner.clone(), current);
                            *slot = Some(pending.clone());
                            pending
                        }
                    }
                }
            }
        };
        let fresh = match cancel {
            Some(cancel) => {
                tokio::select! {
                    biased;
                    _ = cancel.cancelled() => return Err(ClientError::Cancelled),
                    fresh = pending => fresh,
                }
            }
            None => pending.await,
        };
        fresh.ok_or(ClientError::AuthExpired)
    }

    fn expire(&self) {
        if let Err(e) = self.inner.store.clear() {
            warn!(error = %e, "failed to clear token store");
        }
    }
}

impl Inner {
    fn url(&self, path: &str) -> String {
        format!("{}{}", self.config.base_url.trim_end_matches('/'), path)
    }

    /// One HTTP round trip, no auth handling.
    async fn send(
        &self,
        method: Method,
        path: &str,
        body: Option<&Value>,
        bearer: Option<&str>,
        opts: &RequestOptions,
    ) -> Result<ApiResponse, ClientError> {
        let mut req = self.http.request(method.clone(), self.url(path));
        if let Some(token) = bearer {
            req = req.bearer_auth(token);
        }
        if let Some(body) = body {
            req = req.json(body);
        }
        if let Some(timeout) = opts.timeout {
            req = req.timeout(timeout);
        }
        if let Some(version) = &opts.if_match {
            req = req.header(IF_MATCH, version.as_str());
        }

        let call = async {
            let resp = req.send().await?;
            let status = resp.status().as_u16();
            let headers = resp.headers().clone();
            let body = resp.text().await?;
            Ok::<_, ClientError>(ApiResponse {
                status,
                headers,
                body,
            })
        };

        let resp = match &opts.cancel {
            Some(cancel) => {
                tokio::select! {
                    biased;
                    _ = cancel.cancelled() => return Err(ClientError::Cancelled),
                    resp = call => resp,
                }
            }
            None => call.await,
        };
        match &resp {
            Ok(r) => debug!(%method, path, status = r.status, "response"),
            Err(e) => debug!(%method, path, error = %e, "request failed"),
        }
        resp
    }

    /// Builds the shared refresh future and returns a handle to it.
    ///
    /// The future writes the store before it frees the slot, so a caller
    /// that finds the slot empty always sees the outcome in the store. The
    /// refresh runs on its own task so it finishes even if every waiter
    /// gives up.
    fn start_refresh(inner: Arc<Inner>, current: Credential) -> RefreshFuture {
        info!("access token rejected, refreshing");
        let task = tokio::spawn(async move {
            let outcome = inner.refresh_once(&current).await;
            let result = match outcome {
                Ok(fresh) => match inner.store.set(fresh.clone()) {
                    Ok(()) => {
                        info!("credential refreshed");
                        Some(fresh)
                    }
                    Err(e) => {
                        warn!(error = %e, "could not persist refreshed credential");
                        None
                    }
                },
                Err(e) => {
                    warn!(error = %e, "refresh failed, clearing credential");
                    None
                }
            };
            if result.is_none()
                && let Err(e) = inner.store.clear()
            {
                warn!(error = %e, "failed to clear token store");
            }
            *inner
                .refresh_slot
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner()) = None;
            result
        });
        async move { task.await.ok().flatten() }.boxed().shared()
    }

    /// Calls the refresh endpoint. Its own 401 never triggers another refresh.
    async fn refresh_once(&self, current: &Credential) -> Result<Credential, ClientError> {
        let body = serde_json::to_value(RefreshRequest {
            refresh_token: current.refresh_token.clone(),
        })?;
        let resp = self
            .send(
                Method::POST,
                &self.config.refresh_path,
                Some(&body),
                None,
                &RequestOptions::default(),
            )
            .await?;
        if resp.status == 401 {
            return Err(ClientError::AuthExpired);
        }
        let resp = check_status(resp)?;
        let tokens: TokenResponse = resp.json()?;
        Credential::from_token_response(tokens, Some(&current.refresh_token))
            .ok_or(ClientError::AuthExpired)
    }
}

/// Turns a non-2xx response into the matching typed error.
fn check_status(resp: ApiResponse) -> Result<ApiResponse, ClientError> {
    if (200..300).contains(&resp.status) {
        return Ok(resp);
    }
    Err(ClientError::from_status(
        resp.status,
        ErrorBody::message_from(&resp.body),
    ))
}
