use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use reqwest::{Client, Response, StatusCode};
use tracing::debug;
use url::Url;

use super::{
    Credentials, LoginRequest, LoginResponse, MetadataResponse, RemoteServer, SessionToken,
};
use crate::dataset::DatasetId;
use crate::error::RemoteError;
use crate::plane::PlaneKey;

/// Header carrying the session token on authenticated requests.
pub const SESSION_TOKEN_HEADER: &str = "X-Session-Token";

/// HTTP implementation of [`RemoteServer`].
///
/// Talks to the JSON API under `{base}/api/v0`:
///
/// - `POST login` with `{"username", "password"}`, returning `{"token"}`
/// - `GET images/{id}` returning a [`MetadataResponse`]
/// - `GET images/{id}/planes/{level}/{t}/{c}/{z}` with an optional
///   `tile=y,x,height,width` query, returning raw pixel bytes
/// - `POST logout`
///
/// The client pools connections internally, so one instance is shared by
/// every session call.
#[derive(Clone)]
pub struct HttpRemote {
    client: Client,
    base: Url,
    identifier: String,
}

impl HttpRemote {
    /// Create a client for the server at `base_url`.
    ///
    /// `request_timeout` bounds every HTTP request end to end.
    pub fn new(base_url: &str, request_timeout: Duration) -> Result<Self, RemoteError> {
        let base = Url::parse(base_url)
            .map_err(|e| RemoteError::Malformed(format!("invalid server URL {base_url}: {e}")))?;

        if !matches!(base.scheme(), "http" | "https") || base.cannot_be_a_base() {
            return Err(RemoteError::Malformed(format!(
                "server URL must be http(s): {base_url}"
            )));
        }

        let client = Client::builder()
            .timeout(request_timeout)
            .build()
            .map_err(|e| RemoteError::Transient(format!("failed to build HTTP client: {e}")))?;

        let identifier = base.as_str().trim_end_matches('/').to_string();

        Ok(Self {
            client,
            base,
            identifier,
        })
    }

    /// Build `{base}/api/v0/{segments...}`.
    fn endpoint(&self, segments: &[&str]) -> Result<Url, RemoteError> {
        let mut url = self.base.clone();
        url.path_segments_mut()
            .map_err(|_| RemoteError::Malformed(format!("invalid server URL {}", self.base)))?
            .pop_if_empty()
            .extend(["api", "v0"])
            .extend(segments);
        Ok(url)
    }
}

#[async_trait]
impl RemoteServer for HttpRemote {
    async fn authenticate(&self, credentials: &Credentials) -> Result<SessionToken, RemoteError> {
        let url = self.endpoint(&["login"])?;
        let body = LoginRequest {
            username: credentials.username.clone(),
            password: credentials.password.clone(),
        };

        let response = self
            .client
            .post(url)
            .json(&body)
            .send()
            .await
            .map_err(classify_transport)?;

        let response = check_status(response, CallKind::Login).await?;
        let login: LoginResponse = response.json().await.map_err(classify_body)?;

        if login.token.is_empty() {
            return Err(RemoteError::Malformed("login returned an empty token".to_string()));
        }

        Ok(SessionToken::new(login.token))
    }

    async fn fetch_metadata(
        &self,
        token: &SessionToken,
        dataset: DatasetId,
    ) -> Result<MetadataResponse, RemoteError> {
        let url = self.endpoint(&["images", &dataset.get().to_string()])?;

        let response = self
            .client
            .get(url)
            .header(SESSION_TOKEN_HEADER, token.as_str())
            .send()
            .await
            .map_err(classify_transport)?;

        let response = check_status(response, CallKind::Authenticated).await?;
        response.json().await.map_err(classify_body)
    }

    async fn fetch_plane(
        &self,
        token: &SessionToken,
        key: &PlaneKey,
    ) -> Result<Bytes, RemoteError> {
        let url = self.endpoint(&[
            "images",
            &key.dataset.get().to_string(),
            "planes",
            &key.level.to_string(),
            &key.t.to_string(),
            &key.c.to_string(),
            &key.z.to_string(),
        ])?;

        let mut request = self
            .client
            .get(url)
            .header(SESSION_TOKEN_HEADER, token.as_str());

        if let Some(tile) = key.tile {
            let value = format!("{},{},{},{}", tile.y, tile.x, tile.height, tile.width);
            request = request.query(&[("tile", value)]);
        }

        let response = request.send().await.map_err(classify_transport)?;
        let response = check_status(response, CallKind::Authenticated).await?;
        let data = response.bytes().await.map_err(classify_body)?;

        debug!("Fetched {} bytes for {}", data.len(), key);
        Ok(data)
    }

    async fn logout(&self, token: &SessionToken) -> Result<(), RemoteError> {
        let url = self.endpoint(&["logout"])?;

        let response = self
            .client
            .post(url)
            .header(SESSION_TOKEN_HEADER, token.as_str())
            .send()
            .await
            .map_err(classify_transport)?;

        check_status(response, CallKind::Authenticated).await?;
        Ok(())
    }

    fn identifier(&self) -> &str {
        &self.identifier
    }
}

// =============================================================================
// Error Classification
// =============================================================================

/// Whether a request is the login call or runs under an existing token.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum CallKind {
    Login,
    Authenticated,
}

async fn check_status(response: Response, kind: CallKind) -> Result<Response, RemoteError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }

    let url = response.url().path().to_string();
    let body = response.text().await.unwrap_or_default();
    let detail = if body.is_empty() {
        url
    } else {
        format!("{url}: {}", body.trim())
    };

    Err(classify_status(status, kind, detail))
}

/// Map a non-success HTTP status to the remote error taxonomy.
pub(crate) fn classify_status(status: StatusCode, kind: CallKind, detail: String) -> RemoteError {
    match (status, kind) {
        (StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN, CallKind::Login) => {
            RemoteError::Unauthorized(detail)
        }
        (StatusCode::UNAUTHORIZED, CallKind::Authenticated) => RemoteError::Expired,
        (StatusCode::FORBIDDEN, _) => RemoteError::Forbidden(detail),
        (StatusCode::NOT_FOUND, _) => RemoteError::NotFound(detail),
        (StatusCode::REQUEST_TIMEOUT | StatusCode::TOO_MANY_REQUESTS, _) => {
            RemoteError::Transient(format!("{status}: {detail}"))
        }
        (s, _) if s.is_server_error() => RemoteError::Transient(format!("{status}: {detail}")),
        _ => RemoteError::Malformed(format!("unexpected status {status}: {detail}")),
    }
}

fn classify_transport(err: reqwest::Error) -> RemoteError {
    if err.is_builder() {
        RemoteError::Malformed(err.to_string())
    } else {
        RemoteError::Transient(err.to_string())
    }
}

fn classify_body(err: reqwest::Error) -> RemoteError {
    if err.is_decode() {
        RemoteError::Malformed(err.to_string())
    } else {
        RemoteError::Transient(err.to_string())
    }
}
