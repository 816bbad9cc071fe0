//! Soracom REST API backend.
//!
//! Uplink records come from Harvest Data (`GET /sims/{id}/data`); downlink
//! datagrams go through `POST /sims/{id}/downlink/udp`. Every call after
//! `POST /auth` carries the API key and token returned by it.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::{RequestBuilder, Response, StatusCode};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use imok_core::codec::{DownlinkRequest, harvest_entry};
use imok_core::relay::{Accepted, RelayApi, RelayError, RelayErrorKind, RelayPage, RelayRecord};
use imok_core::types::DOWNLINK_UDP_PORT;

/// Global coverage API endpoint.
pub const SORACOM_API_BASE: &str = "https://g.api.soracom.io/v1";

/// Bound on each HTTP request.
pub const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Response header carrying the Harvest continuation key.
const NEXT_KEY_HEADER: &str = "x-soracom-next-key";

// ---------------------------------------------------------------------------
// Wire types
// ---------------------------------------------------------------------------

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct AuthKeyRequest<'a> {
    auth_key_id: &'a str,
    auth_key: &'a str,
}

#[derive(Serialize)]
struct PasswordRequest<'a> {
    email: &'a str,
    password: &'a str,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct AuthResponse {
    api_key: String,
    token: String,
    #[serde(default)]
    operator_id: Option<String>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct SimResponse {
    #[serde(default)]
    sim_id: String,
    #[serde(default)]
    session_status: Option<SessionStatus>,
}

#[derive(Deserialize)]
struct SessionStatus {
    #[serde(default)]
    imsi: Option<String>,
    #[serde(default)]
    online: bool,
}

#[derive(Deserialize)]
struct ErrorBody {
    message: String,
}

/// One SIM on the operator account.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SimSummary {
    pub sim_id: String,
    pub imsi: Option<String>,
    /// Whether the SIM currently has a data session.
    pub online: bool,
}

impl From<SimResponse> for SimSummary {
    fn from(sim: SimResponse) -> Self {
        let (imsi, online) = match sim.session_status {
            Some(s) => (s.imsi, s.online),
            None => (None, false),
        };
        SimSummary {
            sim_id: sim.sim_id,
            imsi,
            online,
        }
    }
}

#[derive(Debug, Clone)]
struct ApiSession {
    api_key: String,
    token: String,
}

// ---------------------------------------------------------------------------
// Error mapping
// ---------------------------------------------------------------------------

fn request_error(err: reqwest::Error) -> RelayError {
    let kind = if err.is_decode() {
        RelayErrorKind::Protocol
    } else {
        RelayErrorKind::Network
    };
    RelayError::new(kind, err.to_string())
}

async fn status_error(response: Response) -> RelayError {
    let status = response.status().as_u16();
    let body = response.text().await.unwrap_or_default();
    let detail = serde_json::from_str::<ErrorBody>(&body)
        .map(|b| b.message)
        .unwrap_or(body);
    RelayError::from_status(status, detail)
}

// ---------------------------------------------------------------------------
// Client
// ---------------------------------------------------------------------------

/// Soracom API client bound to one SIM.
///
/// Authenticate and select a SIM before handing the client to a
/// [`RelayClient`](crate::RelayClient).
#[derive(Debug, Clone)]
pub struct SoracomRelay {
    http: reqwest::Client,
    base_url: String,
    session: Option<ApiSession>,
    sim_id: Option<String>,
    downlink_port: u16,
}

impl SoracomRelay {
    /// A client for the public API endpoint.
    pub fn new() -> Result<Self, RelayError> {
        Self::with_base_url(SORACOM_API_BASE)
    }

    /// A client for another endpoint (regional API or a test server).
    pub fn with_base_url(base_url: &str) -> Result<Self, RelayError> {
        let http = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .map_err(request_error)?;
        Ok(SoracomRelay {
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
            session: None,
            sim_id: None,
            downlink_port: DOWNLINK_UDP_PORT,
        })
    }

    /// Destination port for downlink datagrams (default 55555).
    pub fn downlink_port(mut self, port: u16) -> Self {
        self.downlink_port = port;
        self
    }

    /// Bind uplink and downlink calls to `sim_id`.
    pub fn select_sim(&mut self, sim_id: &str) {
        self.sim_id = Some(sim_id.to_string());
    }

    pub fn sim_id(&self) -> Option<&str> {
        self.sim_id.as_deref()
    }

    pub fn is_authenticated(&self) -> bool {
        self.session.is_some()
    }

    fn url(&self, path: &str) -> String {
        format!("{}{path}", self.base_url)
    }

    fn authorized(&self, request: RequestBuilder) -> Result<RequestBuilder, RelayError> {
        let session = self
            .session
            .as_ref()
            .ok_or_else(|| RelayError::new(RelayErrorKind::Auth, "not authenticated"))?;
        Ok(request
            .header("X-Soracom-API-Key", &session.api_key)
            .header("X-Soracom-Token", &session.token))
    }

    fn selected_sim(&self) -> Result<&str, RelayError> {
        self.sim_id
            .as_deref()
            .ok_or_else(|| RelayError::new(RelayErrorKind::Rejected(400), "no SIM selected"))
    }

    /// Obtain an API key and token.
    ///
    /// `id` and `secret` are tried first as an auth key pair, then as
    /// operator email and password.
    pub async fn authenticate(&mut self, id: &str, secret: &str) -> Result<(), RelayError> {
        let url = self.url("/auth");
        let response = self
            .http
            .post(&url)
            .json(&AuthKeyRequest {
                auth_key_id: id,
                auth_key: secret,
            })
            .send()
            .await
            .map_err(request_error)?;

        let response = if response.status().is_success() {
            response
        } else {
            debug!(status = %response.status(), "auth key rejected, trying email/password");
            self.http
                .post(&url)
                .json(&PasswordRequest {
                    email: id,
                    password: secret,
                })
                .send()
                .await
                .map_err(request_error)?
        };

        if !response.status().is_success() {
            return Err(status_error(response).await);
        }
        let auth: AuthResponse = response.json().await.map_err(request_error)?;
        info!(operator = auth.operator_id.as_deref().unwrap_or("?"), "authenticated with Soracom");
        self.session = Some(ApiSession {
            api_key: auth.api_key,
            token: auth.token,
        });
        Ok(())
    }

    /// SIMs on the operator account.
    pub async fn list_sims(&self) -> Result<Vec<SimSummary>, RelayError> {
        let response = self
            .authorized(self.http.get(self.url("/sims")))?
            .send()
            .await
            .map_err(request_error)?;
        if !response.status().is_success() {
            return Err(status_error(response).await);
        }
        let sims: Vec<SimResponse> = response.json().await.map_err(request_error)?;
        debug!(count = sims.len(), "listed SIMs");
        Ok(sims.into_iter().map(SimSummary::from).collect())
    }

    /// Whether `sim_id` currently has a data session.
    pub async fn sim_online(&self, sim_id: &str) -> Result<bool, RelayError> {
        let response = self
            .authorized(self.http.get(self.url(&format!("/sims/{sim_id}"))))?
            .send()
            .await
            .map_err(request_error)?;
        if !response.status().is_success() {
            return Err(status_error(response).await);
        }
        let sim: SimResponse = response.json().await.map_err(request_error)?;
        Ok(SimSummary::from(sim).online)
    }
}

#[async_trait]
impl RelayApi for SoracomRelay {
    async fn fetch_page(
        &self,
        from_ms: i64,
        next_key: Option<&str>,
        limit: usize,
    ) -> Result<RelayPage, RelayError> {
        let sim_id = self.selected_sim()?;
        let mut query = vec![
            ("sort", "asc".to_string()),
            ("limit", limit.to_string()),
            ("from", from_ms.to_string()),
        ];
        if let Some(key) = next_key {
            query.push(("last_evaluated_key", key.to_string()));
        }

        let response = self
            .authorized(
                self.http
                    .get(self.url(&format!("/sims/{sim_id}/data")))
                    .query(&query),
            )?
            .send()
            .await
            .map_err(request_error)?;
        if !response.status().is_success() {
            return Err(status_error(response).await);
        }

        let next_key = response
            .headers()
            .get(NEXT_KEY_HEADER)
            .and_then(|v| v.to_str().ok())
            .filter(|v| !v.is_empty())
            .map(str::to_string);
        let entries: Vec<serde_json::Value> = response.json().await.map_err(request_error)?;

        let mut records = Vec::with_capacity(entries.len());
        for entry in &entries {
            match harvest_entry(entry) {
                Ok((time_ms, payload)) => records.push(RelayRecord::new(time_ms, payload)),
                Err(e) => warn!(error = %e, "skipping unreadable Harvest entry"),
            }
        }
        Ok(RelayPage { records, next_key })
    }

    async fn submit(&self, payload: &[u8]) -> Result<Accepted, RelayError> {
        let sim_id = self.selected_sim()?;
        let body = DownlinkRequest::new(self.downlink_port, payload);
        let response = self
            .authorized(
                self.http
                    .post(self.url(&format!("/sims/{sim_id}/downlink/udp")))
                    .json(&body),
            )?
            .send()
            .await
            .map_err(request_error)?;

        match response.status() {
            StatusCode::NO_CONTENT => Ok(Accepted { len: payload.len() }),
            status if status.is_success() => Err(RelayError::new(
                RelayErrorKind::Protocol,
                format!("unexpected status {status} for downlink"),
            )),
            _ => Err(status_error(response).await),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use imok_test_harness::MockHttpServer;

    const AUTH_OK: &str = r#"{"apiKey":"api-key-1","token":"tok-1","operatorId":"OP0001"}"#;

    async fn authed(server: &MockHttpServer) -> SoracomRelay {
        server.expect("POST", "/v1/auth", 200, AUTH_OK);
        let mut relay = SoracomRelay::with_base_url(&format!("{}/v1", server.base_url())).unwrap();
        relay.authenticate("keyId-x", "secret-x").await.unwrap();
        relay
    }

    #[tokio::test]
    async fn authenticate_with_auth_key() {
        let server = MockHttpServer::start().await.unwrap();
        let relay = authed(&server).await;
        assert!(relay.is_authenticated());

        let body = server.requests()[0].json().unwrap();
        assert_eq!(body["authKeyId"], "keyId-x");
        assert_eq!(body["authKey"], "secret-x");
    }

    #[tokio::test]
    async fn authenticate_falls_back_to_password() {
        let server = MockHttpServer::start().await.unwrap();
        server.expect("POST", "/v1/auth", 401, r#"{"message":"bad key"}"#);
        server.expect("POST", "/v1/auth", 200, AUTH_OK);

        let mut relay = SoracomRelay::with_base_url(&format!("{}/v1", server.base_url())).unwrap();
        relay.authenticate("ops@example.com", "pw").await.unwrap();

        let second = server.requests()[1].json().unwrap();
        assert_eq!(second["email"], "ops@example.com");
        assert_eq!(second["password"], "pw");
    }

    #[tokio::test]
    async fn authenticate_failure_is_auth_error() {
        let server = MockHttpServer::start().await.unwrap();
        server.expect("POST", "/v1/auth", 401, r#"{"message":"bad key"}"#);
        server.expect("POST", "/v1/auth", 401, r#"{"message":"bad password"}"#);

        let mut relay = SoracomRelay::with_base_url(&format!("{}/v1", server.base_url())).unwrap();
        let err = relay.authenticate("a", "b").await.unwrap_err();
        assert_eq!(err.kind(), RelayErrorKind::Auth);
        assert_eq!(err.message(), "bad password");
        assert!(!relay.is_authenticated());
    }

    #[tokio::test]
    async fn unauthenticated_calls_rejected_locally() {
        let mut relay = SoracomRelay::with_base_url("http://127.0.0.1:9").unwrap();
        relay.select_sim("8942");
        let err = relay.fetch_page(0, None, 10).await.unwrap_err();
        assert_eq!(err.kind(), RelayErrorKind::Auth);
    }

    #[tokio::test]
    async fn list_sims_and_status() {
        let server = MockHttpServer::start().await.unwrap();
        let relay = authed(&server).await;
        server.expect(
            "GET",
            "/v1/sims",
            200,
            r#"[{"simId":"8942001","sessionStatus":{"imsi":"295050","online":true}},{"simId":"8942002","sessionStatus":null}]"#,
        );
        server.expect(
            "GET",
            "/v1/sims/8942002",
            200,
            r#"{"simId":"8942002","sessionStatus":{"online":false}}"#,
        );

        let sims = relay.list_sims().await.unwrap();
        assert_eq!(sims.len(), 2);
        assert_eq!(sims[0].imsi.as_deref(), Some("295050"));
        assert!(sims[0].online);
        assert!(!sims[1].online);
        assert!(!relay.sim_online("8942002").await.unwrap());

        let list = &server.requests()[1];
        assert_eq!(list.header("X-Soracom-API-Key"), Some("api-key-1"));
        assert_eq!(list.header("X-Soracom-Token"), Some("tok-1"));
    }

    #[tokio::test]
    async fn harvest_page_with_continuation() {
        let server = MockHttpServer::start().await.unwrap();
        let mut relay = authed(&server).await;
        relay.select_sim("8942001");
        server.expect_with_headers(
            "GET",
            "/v1/sims/8942001/data",
            200,
            r#"[{"time":1000,"content":{"payload":"SSdtIE9L"}},{"time":1001,"content":"{\"payload\":\"aGk=\"}"},{"content":{}}]"#,
            &[("x-soracom-next-key", "1001")],
        );

        let page = relay.fetch_page(900, Some("999"), 50).await.unwrap();
        assert_eq!(page.records.len(), 2);
        assert_eq!(page.records[0].payload, b"I'm OK");
        assert_eq!(page.records[1].payload, b"hi");
        assert_eq!(page.next_key.as_deref(), Some("1001"));

        let req = &server.requests()[1];
        assert_eq!(req.query_param("sort"), Some("asc"));
        assert_eq!(req.query_param("limit"), Some("50"));
        assert_eq!(req.query_param("from"), Some("900"));
        assert_eq!(req.query_param("last_evaluated_key"), Some("999"));
    }

    #[tokio::test]
    async fn harvest_server_error_is_transient() {
        let server = MockHttpServer::start().await.unwrap();
        let mut relay = authed(&server).await;
        relay.select_sim("8942001");
        server.expect("GET", "/v1/sims/8942001/data", 503, "{}");

        let err = relay.fetch_page(0, None, 100).await.unwrap_err();
        assert_eq!(err.kind(), RelayErrorKind::Unavailable);
        assert!(err.is_transient());
    }

    #[tokio::test]
    async fn downlink_submission() {
        let server = MockHttpServer::start().await.unwrap();
        let mut relay = authed(&server).await;
        relay.select_sim("8942001");
        server.expect("POST", "/v1/sims/8942001/downlink/udp", 204, "");

        let accepted = relay.submit(b"hi").await.unwrap();
        assert_eq!(accepted.len, 2);

        let body = server.requests()[1].json().unwrap();
        assert_eq!(body["port"], 55555);
        assert_eq!(body["payloadType"], "base64");
        assert_eq!(body["payload"], "aGk=");
    }

    #[tokio::test]
    async fn downlink_rejection_carries_status() {
        let server = MockHttpServer::start().await.unwrap();
        let mut relay = authed(&server).await;
        relay.select_sim("8942001");
        server.expect(
            "POST",
            "/v1/sims/8942001/downlink/udp",
            400,
            r#"{"message":"session not found"}"#,
        );

        let err = relay.submit(b"hi").await.unwrap_err();
        assert_eq!(err.kind(), RelayErrorKind::Rejected(400));
        assert_eq!(err.message(), "session not found");
    }
}
