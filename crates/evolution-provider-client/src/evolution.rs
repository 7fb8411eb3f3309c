//! Evolution API implementation of [`ProviderClient`].

use crate::client::ProviderClient;
use crate::error::{ProviderError, ProviderResult};
use crate::types::{CallbackRegistration, CallbackStatus, PairingCode, SessionCreated};
use async_trait::async_trait;
use reqwest::{Method, StatusCode};
use serde_json::{json, Value};
use std::time::Duration;
use tracing::{debug, info, warn};
use url::Url;

/// Integration type requested for new sessions.
const INTEGRATION: &str = "WHATSAPP-BAILEYS";

/// Provider HTTP client for the Evolution API.
#[derive(Clone)]
pub struct EvolutionClient {
    http_client: reqwest::Client,
    base_url: Url,
    api_key: String,
}

impl EvolutionClient {
    /// Create a new client.
    ///
    /// # Arguments
    /// * `base_url` - Provider API base URL (e.g., `https://evolution.example.com`)
    /// * `api_key` - Credential sent as `apikey` and as a bearer token
    /// * `timeout` - Per-request timeout
    pub fn new(
        base_url: &str,
        api_key: impl Into<String>,
        timeout: Duration,
    ) -> ProviderResult<Self> {
        let base_url = Url::parse(base_url)
            .map_err(|e| ProviderError::Config(format!("invalid provider URL {base_url}: {e}")))?;
        if base_url.cannot_be_a_base() {
            return Err(ProviderError::Config(format!(
                "provider URL cannot be a base: {base_url}"
            )));
        }

        let http_client = reqwest::Client::builder().timeout(timeout).build()?;

        Ok(Self {
            http_client,
            base_url,
            api_key: api_key.into(),
        })
    }

    /// Build an endpoint URL from path segments, percent-encoding each one.
    fn endpoint(&self, segments: &[&str]) -> ProviderResult<Url> {
        let mut url = self.base_url.clone();
        url.path_segments_mut()
            .map_err(|_| ProviderError::Config("provider URL cannot be a base".to_string()))?
            .pop_if_empty()
            .extend(segments);
        Ok(url)
    }

    async fn request(&self, method: Method, url: Url, body: Option<&Value>) -> ProviderResult<Value> {
        debug!(method = %method, url = %url, "Provider request");

        let mut builder = self
            .http_client
            .request(method, url.clone())
            .header("apikey", &self.api_key)
            .header("Authorization", format!("Bearer {}", self.api_key));
        if let Some(body) = body {
            builder = builder.json(body);
        }

        let response = builder.send().await?;
        let status = response.status();

        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            let message = extract_error_message(&text, status);
            warn!(status = status.as_u16(), url = %url, message = %message, "Provider request failed");
            return Err(error_for_status(status, message));
        }

        // A body cut off mid-read is a transport failure, not an empty answer.
        let text = response.text().await?;
        debug!(status = status.as_u16(), url = %url, "Provider response");

        if text.trim().is_empty() {
            return Ok(Value::Null);
        }
        Ok(serde_json::from_str(&text)?)
    }

    async fn create_session(
        &self,
        channel_id: &str,
        callback_hint: Option<&str>,
        event_types: &[String],
    ) -> ProviderResult<()> {
        let mut body = json!({
            "instanceName": channel_id,
            "integration": INTEGRATION,
            "qrcode": true,
        });
        if let Some(url) = callback_hint {
            body["webhook"] = json!({
                "url": url,
                "events": event_types,
                "byEvents": false,
                "base64": false,
            });
        }

        let url = self.endpoint(&["instance", "create"])?;
        self.request(Method::POST, url, Some(&body)).await?;
        Ok(())
    }

    async fn delete_session(&self, channel_id: &str) -> ProviderResult<()> {
        let url = self.endpoint(&["instance", "delete", channel_id])?;
        self.request(Method::DELETE, url, None).await?;
        Ok(())
    }
}

#[async_trait]
impl ProviderClient for EvolutionClient {
    async fn create_or_recover_session(
        &self,
        channel_id: &str,
        callback_hint: Option<&str>,
        event_types: &[String],
    ) -> ProviderResult<SessionCreated> {
        info!(channel_id, "Creating provider session");

        let err = match self.create_session(channel_id, callback_hint, event_types).await {
            Ok(()) => return Ok(SessionCreated::default()),
            Err(err) if is_conflict(&err) => err,
            Err(err) => return Err(err),
        };

        warn!(channel_id, error = %err, "Session may already exist, attempting recovery");

        match self.fetch_session_state(channel_id).await {
            Ok(state) => {
                info!(channel_id, state = %state, "Recovered existing provider session");
                return Ok(SessionCreated {
                    recreated: false,
                    recovered: true,
                });
            }
            Err(e) if e.is_unauthorized() => return Err(e),
            Err(e) => {
                warn!(channel_id, error = %e, "Existing session unreadable, recreating");
            }
        }

        if let Err(e) = self.delete_session(channel_id).await {
            if e.is_unauthorized() {
                return Err(e);
            }
            warn!(channel_id, error = %e, "Delete before recreate failed");
        }

        self.create_session(channel_id, callback_hint, event_types)
            .await?;
        info!(channel_id, "Provider session recreated");

        Ok(SessionCreated {
            recreated: true,
            recovered: false,
        })
    }

    async fn fetch_pairing_code(&self, channel_id: &str) -> ProviderResult<Option<PairingCode>> {
        let url = self.endpoint(&["instance", "connect", channel_id])?;
        let body = self.request(Method::GET, url, None).await?;
        let code = extract_pairing_code(&body);

        if code.is_none() {
            debug!(channel_id, "Provider returned no pairing code");
        }
        Ok(code)
    }

    async fn fetch_session_state(&self, channel_id: &str) -> ProviderResult<String> {
        let url = self.endpoint(&["instance", "connectionState", channel_id])?;
        let body = self.request(Method::GET, url, None).await?;
        extract_state(&body)
    }

    async fn register_callback(
        &self,
        channel_id: &str,
        callback_url: &str,
        event_types: &[String],
    ) -> ProviderResult<CallbackRegistration> {
        let body = json!({
            "webhook": {
                "enabled": true,
                "url": callback_url,
                "events": event_types,
                "byEvents": false,
                "base64": false,
            }
        });

        let url = self.endpoint(&["webhook", "set", channel_id])?;
        match self.request(Method::POST, url, Some(&body)).await {
            Ok(_) => Ok(CallbackRegistration::Registered),
            Err(ProviderError::Rejected { message, .. }) => {
                Ok(CallbackRegistration::Rejected(message))
            }
            Err(e) => Err(e),
        }
    }

    async fn fetch_callback(&self, channel_id: &str) -> ProviderResult<Option<CallbackStatus>> {
        let url = self.endpoint(&["webhook", "find", channel_id])?;
        let body = self.request(Method::GET, url, None).await?;
        parse_callback_status(&body)
    }

    async fn logout_session(&self, channel_id: &str) -> ProviderResult<()> {
        let url = self.endpoint(&["instance", "logout", channel_id])?;
        self.request(Method::DELETE, url, None).await?;
        info!(channel_id, "Provider session logged out");
        Ok(())
    }

    async fn health_check(&self) -> ProviderResult<()> {
        let url = self.endpoint(&["instance", "fetchInstances"])?;
        self.request(Method::GET, url, None).await?;
        Ok(())
    }
}

impl std::fmt::Debug for EvolutionClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EvolutionClient")
            .field("base_url", &self.base_url.as_str())
            .finish_non_exhaustive()
    }
}

/// Map a non-success status onto the error taxonomy.
fn error_for_status(status: StatusCode, message: String) -> ProviderError {
    let code = status.as_u16();
    match code {
        401 => ProviderError::Unauthorized {
            status: code,
            message,
        },
        // The provider answers 403 for duplicate session names too.
        403 if message.to_ascii_lowercase().contains("already in use") => {
            ProviderError::Rejected {
                status: code,
                message,
            }
        }
        403 => ProviderError::Unauthorized {
            status: code,
            message,
        },
        429 => ProviderError::Unavailable {
            status: code,
            message,
        },
        _ if status.is_server_error() => ProviderError::Unavailable {
            status: code,
            message,
        },
        _ => ProviderError::Rejected {
            status: code,
            message,
        },
    }
}

/// A create failure that means the session name is already taken.
fn is_conflict(err: &ProviderError) -> bool {
    match err {
        ProviderError::Rejected { status, .. } => *status == 403 || *status == 409,
        ProviderError::Unavailable { status, .. } => *status == 500,
        _ => false,
    }
}

/// Pull a human-readable message out of an error body.
fn extract_error_message(body: &str, status: StatusCode) -> String {
    if let Ok(value) = serde_json::from_str::<Value>(body) {
        let candidates = [
            value.pointer("/response/message"),
            value.get("message"),
            value.get("error"),
            value.get("detail"),
            value.get("msg"),
        ];
        for candidate in candidates.into_iter().flatten() {
            match candidate {
                Value::Null => continue,
                Value::String(s) if s.is_empty() => continue,
                Value::String(s) => return s.clone(),
                Value::Array(items) if !items.is_empty() => {
                    return items
                        .iter()
                        .map(|item| match item {
                            Value::String(s) => s.clone(),
                            other => other.to_string(),
                        })
                        .collect::<Vec<_>>()
                        .join("; ");
                }
                Value::Array(_) => continue,
                other => return other.to_string(),
            }
        }
    }

    let trimmed = body.trim();
    if !trimmed.is_empty() && trimmed.len() <= 200 {
        return trimmed.to_string();
    }

    match status.canonical_reason() {
        Some(reason) => format!("HTTP {} {}", status.as_u16(), reason),
        None => format!("HTTP {}", status.as_u16()),
    }
}

fn non_empty_str(value: Option<&Value>) -> Option<String> {
    value
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
}

/// Extract the pairing code from a `/instance/connect` body.
fn extract_pairing_code(body: &Value) -> Option<PairingCode> {
    let code = non_empty_str(body.pointer("/qrcode/code"))
        .or_else(|| non_empty_str(body.get("code")))
        .or_else(|| non_empty_str(body.get("qr")));
    let image = non_empty_str(body.pointer("/qrcode/base64"))
        .or_else(|| non_empty_str(body.get("base64")));

    match (code, image) {
        (Some(code), image) => Some(PairingCode { code, image }),
        (None, Some(image)) => Some(PairingCode {
            code: image.clone(),
            image: Some(image),
        }),
        (None, None) => None,
    }
}

/// Extract the status token from a `/instance/connectionState` body.
fn extract_state(body: &Value) -> ProviderResult<String> {
    non_empty_str(body.pointer("/instance/state"))
        .or_else(|| non_empty_str(body.get("state")))
        .ok_or_else(|| {
            ProviderError::Protocol(format!("connection state missing from response: {body}"))
        })
}

/// Parse a `/webhook/find` body. Null or URL-less bodies mean no callback.
fn parse_callback_status(body: &Value) -> ProviderResult<Option<CallbackStatus>> {
    let webhook = match body.get("webhook") {
        Some(inner) if inner.is_object() => inner,
        _ => body,
    };

    match webhook {
        Value::Null => Ok(None),
        Value::Object(map) => {
            let Some(url) = non_empty_str(map.get("url")) else {
                return Ok(None);
            };
            let enabled = map.get("enabled").and_then(Value::as_bool).unwrap_or(false);
            let events = map
                .get("events")
                .and_then(Value::as_array)
                .map(|items| {
                    items
                        .iter()
                        .filter_map(Value::as_str)
                        .map(str::to_string)
                        .collect()
                })
                .unwrap_or_default();
            Ok(Some(CallbackStatus {
                url,
                enabled,
                events,
            }))
        }
        other => Err(ProviderError::Protocol(format!(
            "unexpected callback body: {other}"
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn client() -> EvolutionClient {
        EvolutionClient::new(
            "https://evolution.example.com/api/",
            "key",
            Duration::from_secs(5),
        )
        .unwrap()
    }

    #[test]
    fn new_rejects_invalid_url() {
        let result = EvolutionClient::new("not a url", "key", Duration::from_secs(5));
        assert!(matches!(result, Err(ProviderError::Config(_))));
    }

    #[test]
    fn endpoint_appends_encoded_segments() {
        let client = client();
        let url = client
            .endpoint(&["instance", "connectionState", "sales-bot"])
            .unwrap();
        assert_eq!(
            url.as_str(),
            "https://evolution.example.com/api/instance/connectionState/sales-bot"
        );

        let url = client.endpoint(&["instance", "connect", "a b/c"]).unwrap();
        assert_eq!(
            url.as_str(),
            "https://evolution.example.com/api/instance/connect/a%20b%2Fc"
        );
    }

    #[test]
    fn status_classification() {
        assert!(error_for_status(StatusCode::UNAUTHORIZED, "x".into()).is_unauthorized());
        assert!(error_for_status(StatusCode::FORBIDDEN, "forbidden".into()).is_unauthorized());
        assert!(matches!(
            error_for_status(
                StatusCode::FORBIDDEN,
                "This name \"sales-bot\" is already in use.".into()
            ),
            ProviderError::Rejected { status: 403, .. }
        ));
        assert!(error_for_status(StatusCode::TOO_MANY_REQUESTS, "slow".into()).is_transient());
        assert!(error_for_status(StatusCode::BAD_GATEWAY, "gw".into()).is_transient());
        assert!(matches!(
            error_for_status(StatusCode::NOT_FOUND, "nope".into()),
            ProviderError::Rejected { status: 404, .. }
        ));
    }

    #[test]
    fn conflict_detection() {
        assert!(is_conflict(&ProviderError::Rejected {
            status: 409,
            message: String::new()
        }));
        assert!(is_conflict(&ProviderError::Unavailable {
            status: 500,
            message: String::new()
        }));
        assert!(!is_conflict(&ProviderError::Unavailable {
            status: 503,
            message: String::new()
        }));
        assert!(!is_conflict(&ProviderError::Unauthorized {
            status: 401,
            message: String::new()
        }));
    }

    #[test]
    fn error_message_from_nested_response() {
        let body = r#"{"status":403,"error":"Forbidden","response":{"message":["This name is already in use."]}}"#;
        assert_eq!(
            extract_error_message(body, StatusCode::FORBIDDEN),
            "This name is already in use."
        );
    }

    #[test]
    fn error_message_fallbacks() {
        assert_eq!(
            extract_error_message(r#"{"detail":"bad token"}"#, StatusCode::UNAUTHORIZED),
            "bad token"
        );
        assert_eq!(
            extract_error_message("", StatusCode::SERVICE_UNAVAILABLE),
            "HTTP 503 Service Unavailable"
        );
        assert_eq!(
            extract_error_message("upstream died", StatusCode::BAD_GATEWAY),
            "upstream died"
        );
    }

    #[test]
    fn pairing_code_variants() {
        let nested = json!({"qrcode": {"code": "2@abc", "base64": "data:image/png;base64,AAA"}});
        assert_eq!(
            extract_pairing_code(&nested),
            Some(PairingCode {
                code: "2@abc".to_string(),
                image: Some("data:image/png;base64,AAA".to_string()),
            })
        );

        let flat = json!({"pairingCode": null, "code": "2@xyz", "base64": "img", "count": 1});
        let code = extract_pairing_code(&flat).unwrap();
        assert_eq!(code.code, "2@xyz");
        assert_eq!(code.image.as_deref(), Some("img"));

        let qr_only = json!({"qr": "raw-qr"});
        assert_eq!(extract_pairing_code(&qr_only).unwrap().code, "raw-qr");

        let image_only = json!({"base64": "img-only"});
        let code = extract_pairing_code(&image_only).unwrap();
        assert_eq!(code.code, "img-only");
        assert_eq!(code.image.as_deref(), Some("img-only"));
    }

    #[test]
    fn pairing_code_absent() {
        assert_eq!(extract_pairing_code(&json!({"count": 0})), None);
        assert_eq!(extract_pairing_code(&json!({"code": ""})), None);
        assert_eq!(extract_pairing_code(&Value::Null), None);
    }

    #[test]
    fn state_extraction() {
        let nested = json!({"instance": {"instanceName": "sales-bot", "state": "open"}});
        assert_eq!(extract_state(&nested).unwrap(), "open");

        let flat = json!({"state": "connecting"});
        assert_eq!(extract_state(&flat).unwrap(), "connecting");

        assert!(matches!(
            extract_state(&json!({"instance": {}})),
            Err(ProviderError::Protocol(_))
        ));
    }

    #[test]
    fn callback_status_parsing() {
        let body = json!({
            "enabled": true,
            "url": "https://hooks.example.com/api/wpp/webhook/sales-bot",
            "events": ["CONNECTION_UPDATE", "MESSAGES_UPSERT"]
        });
        let status = parse_callback_status(&body).unwrap().unwrap();
        assert!(status.enabled);
        assert_eq!(status.events.len(), 2);

        let wrapped = json!({"webhook": {"enabled": false, "url": "https://x"}});
        let status = parse_callback_status(&wrapped).unwrap().unwrap();
        assert!(!status.enabled);
        assert!(status.events.is_empty());

        assert_eq!(parse_callback_status(&Value::Null).unwrap(), None);
        assert_eq!(parse_callback_status(&json!({"enabled": true})).unwrap(), None);
        assert!(parse_callback_status(&json!("weird")).is_err());
    }

    /// Serve every connection with `response`, then hang up.
    async fn stub_server(response: &'static str) -> String {
        use tokio::io::{AsyncReadExt, AsyncWriteExt};

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            while let Ok((mut socket, _)) = listener.accept().await {
                let mut request = Vec::new();
                let mut buf = [0u8; 1024];
                while !request.windows(4).any(|w| w == b"\r\n\r\n") {
                    match socket.read(&mut buf).await {
                        Ok(0) | Err(_) => break,
                        Ok(n) => request.extend_from_slice(&buf[..n]),
                    }
                }
                let _ = socket.write_all(response.as_bytes()).await;
                let _ = socket.shutdown().await;
            }
        });
        format!("http://{addr}")
    }

    const TRUNCATED_OK: &str = "HTTP/1.1 200 OK\r\n\
        Content-Type: application/json\r\n\
        Content-Length: 200\r\n\
        \r\n\
        {\"qrcode\":";

    #[tokio::test]
    async fn truncated_success_body_is_a_transient_http_error() {
        let base_url = stub_server(TRUNCATED_OK).await;
        let client = EvolutionClient::new(&base_url, "key", Duration::from_secs(5)).unwrap();

        let err = client.fetch_pairing_code("sales-bot").await.unwrap_err();
        assert!(matches!(err, ProviderError::Http(_)), "got {err:?}");
        assert!(err.is_transient());

        let err = client.fetch_session_state("sales-bot").await.unwrap_err();
        assert!(matches!(err, ProviderError::Http(_)), "got {err:?}");
        assert!(err.is_transient());
    }

    #[tokio::test]
    async fn empty_success_body_means_no_pairing_code() {
        let base_url = stub_server(
            "HTTP/1.1 200 OK\r\nContent-Length: 0\r\nConnection: close\r\n\r\n",
        )
        .await;
        let client = EvolutionClient::new(&base_url, "key", Duration::from_secs(5)).unwrap();

        assert_eq!(client.fetch_pairing_code("sales-bot").await.unwrap(), None);
    }
}
