// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! SDK dispatch over HTTP.
//!
//! The engine POSTs execution requests to the function's registered URL and
//! interprets the response: 200 means the function finished, 206 carries
//! opcodes, and anything else is a step error (retriable unless the SDK says
//! otherwise). Requests are signed with an HMAC so SDKs can reject forged
//! dispatches.

use hmac::{Hmac, Mac};
use serde_json::Value;
use sha2::Sha256;
use std::time::Duration;

use crate::error::{EngineError, Result};
use crate::ids;

use super::opcode::OpCode;

/// Signature header on outgoing dispatches.
pub const SIGNATURE_HEADER: &str = "x-strand-signature";
/// SDK wire-format version response header.
pub const REQUEST_VERSION_HEADER: &str = "x-strand-req-version";
/// Response header suppressing retries for a failed step.
pub const NO_RETRY_HEADER: &str = "x-strand-no-retry";
/// Response header requesting a specific retry delay, in seconds.
pub const RETRY_AFTER_HEADER: &str = "retry-after";

/// Default dispatch timeout when the function sets none.
pub const DEFAULT_DISPATCH_TIMEOUT: Duration = Duration::from_secs(2 * 60);

/// What an SDK response means.
#[derive(Debug, Clone, PartialEq)]
pub enum SdkReply {
    /// The function finished; `output` is its return value.
    Complete {
        /// Function return value.
        output: Value,
    },
    /// The function made progress and reported opcodes.
    Steps(Vec<OpCode>),
    /// The dispatch failed.
    Error {
        /// Serialized error body.
        error: Value,
        /// Whether a retry may help.
        retriable: bool,
        /// SDK-requested retry delay.
        retry_after: Option<Duration>,
    },
}

/// A parsed SDK response.
#[derive(Debug, Clone, PartialEq)]
pub struct DriverResponse {
    /// The reply payload.
    pub reply: SdkReply,
    /// Wire-format version the SDK reported, `-1` when absent.
    pub request_version: i32,
}

/// Dispatches execution requests to SDKs.
#[async_trait::async_trait]
pub trait Driver: Send + Sync {
    /// POST an execution request and parse the response.
    async fn dispatch(
        &self,
        url: &str,
        body: &Value,
        timeout: Option<Duration>,
    ) -> Result<DriverResponse>;

    /// Perform an inference call on a function's behalf (`AIGateway`).
    async fn infer(&self, url: &str, headers: &Value, body: &Value) -> Result<Value>;
}

/// Compute the dispatch signature: `t=<unix-seconds>,s=<hex hmac>` over
/// `"{t}.{body}"`.
pub fn sign(key: &[u8], unix_secs: u64, body: &[u8]) -> String {
    let mut mac = Hmac::<Sha256>::new_from_slice(key).expect("hmac accepts any key length");
    mac.update(unix_secs.to_string().as_bytes());
    mac.update(b".");
    mac.update(body);
    let digest = mac.finalize().into_bytes();
    format!("t={unix_secs},s={}", hex::encode(digest))
}

/// Verify a signature produced by [`sign`], within a freshness window.
pub fn verify(key: &[u8], header: &str, body: &[u8], now_secs: u64, max_age_secs: u64) -> bool {
    let mut ts = None;
    let mut sig = None;
    for part in header.split(',') {
        if let Some(v) = part.strip_prefix("t=") {
            ts = v.parse::<u64>().ok();
        } else if let Some(v) = part.strip_prefix("s=") {
            sig = Some(v);
        }
    }
    let (Some(ts), Some(sig)) = (ts, sig) else { return false };
    if now_secs.saturating_sub(ts) > max_age_secs {
        return false;
    }
    let expected = sign(key, ts, body);
    let expected_sig = expected.rsplit("s=").next().unwrap_or("");
    // Constant-time compare.
    expected_sig.len() == sig.len()
        && expected_sig
            .bytes()
            .zip(sig.bytes())
            .fold(0u8, |acc, (a, b)| acc | (a ^ b))
            == 0
}

/// HTTP driver over reqwest.
pub struct HttpDriver {
    client: reqwest::Client,
    signing_key: Option<Vec<u8>>,
}

impl HttpDriver {
    /// A driver signing with `signing_key` when non-empty.
    pub fn new(signing_key: Option<Vec<u8>>) -> Self {
        Self { client: reqwest::Client::new(), signing_key }
    }
}

#[async_trait::async_trait]
impl Driver for HttpDriver {
    async fn dispatch(
        &self,
        url: &str,
        body: &Value,
        timeout: Option<Duration>,
    ) -> Result<DriverResponse> {
        let bytes = serde_json::to_vec(body)?;
        let mut req = self
            .client
            .post(url)
            .header("content-type", "application/json")
            .timeout(timeout.unwrap_or(DEFAULT_DISPATCH_TIMEOUT));
        if let Some(key) = &self.signing_key {
            req = req.header(SIGNATURE_HEADER, sign(key, ids::now_ms() / 1000, &bytes));
        }

        let resp = req.body(bytes).send().await.map_err(|e| {
            // Network failures are retried like 5xx step errors.
            tracing::warn!(url, error = %e, "sdk dispatch failed");
            EngineError::Dispatch { url: url.to_string(), message: e.to_string() }
        });
        let resp = match resp {
            Ok(r) => r,
            Err(EngineError::Dispatch { url, message }) => {
                return Ok(DriverResponse {
                    reply: SdkReply::Error {
                        error: serde_json::json!({"message": message, "url": url}),
                        retriable: true,
                        retry_after: None,
                    },
                    request_version: -1,
                });
            }
            Err(e) => return Err(e),
        };

        let status = resp.status();
        let request_version = resp
            .headers()
            .get(REQUEST_VERSION_HEADER)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.parse().ok())
            .unwrap_or(-1);
        let no_retry = resp
            .headers()
            .get(NO_RETRY_HEADER)
            .and_then(|v| v.to_str().ok())
            .map(|v| v == "true")
            .unwrap_or(false);
        let retry_after = resp
            .headers()
            .get(RETRY_AFTER_HEADER)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.parse::<u64>().ok())
            .map(Duration::from_secs);

        let text = resp.text().await.unwrap_or_default();
        let parsed: Value = serde_json::from_str(&text).unwrap_or(Value::String(text));

        let reply = if status.as_u16() == 206 {
            let opcodes: Vec<OpCode> = serde_json::from_value(parsed.clone()).map_err(|e| {
                EngineError::Dispatch {
                    url: url.to_string(),
                    message: format!("invalid opcode response: {e}"),
                }
            })?;
            SdkReply::Steps(opcodes)
        } else if status.is_success() {
            SdkReply::Complete { output: parsed }
        } else {
            SdkReply::Error { error: parsed, retriable: !no_retry, retry_after }
        };

        Ok(DriverResponse { reply, request_version })
    }

    async fn infer(&self, url: &str, headers: &Value, body: &Value) -> Result<Value> {
        let mut req = self.client.post(url).header("content-type", "application/json");
        if let Some(map) = headers.as_object() {
            for (name, value) in map {
                if let Some(v) = value.as_str() {
                    req = req.header(name.as_str(), v);
                }
            }
        }
        let resp = req.json(body).send().await.map_err(|e| EngineError::Dispatch {
            url: url.to_string(),
            message: e.to_string(),
        })?;
        let status = resp.status();
        let parsed: Value = resp.json().await.map_err(|e| EngineError::Dispatch {
            url: url.to_string(),
            message: e.to_string(),
        })?;
        if !status.is_success() {
            return Err(EngineError::Dispatch {
                url: url.to_string(),
                message: format!("inference returned {status}: {parsed}"),
            });
        }
        Ok(parsed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use wiremock::matchers::{header_exists, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[test]
    fn test_sign_verify_round_trip() {
        let key = b"secret-key";
        let body = br#"{"ctx":{}}"#;
        let header = sign(key, 1_700_000_000, body);
        assert!(header.starts_with("t=1700000000,s="));
        assert!(verify(key, &header, body, 1_700_000_010, 300));
        // Tampered body fails.
        assert!(!verify(key, &header, br#"{"ctx":{"x":1}}"#, 1_700_000_010, 300));
        // Stale timestamp fails.
        assert!(!verify(key, &header, body, 1_700_100_000, 300));
    }

    #[tokio::test]
    async fn test_dispatch_complete() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api/strand"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(json!({"ok": true}))
                    .insert_header(REQUEST_VERSION_HEADER, "1"),
            )
            .mount(&server)
            .await;

        let driver = HttpDriver::new(None);
        let resp = driver
            .dispatch(&format!("{}/api/strand", server.uri()), &json!({}), None)
            .await
            .unwrap();
        assert_eq!(resp.request_version, 1);
        assert_eq!(resp.reply, SdkReply::Complete { output: json!({"ok": true}) });
    }

    #[tokio::test]
    async fn test_dispatch_partial_opcodes() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(206).set_body_json(json!([
                {"op": "StepRun", "id": "s1", "data": {"n": 1}}
            ])))
            .mount(&server)
            .await;

        let driver = HttpDriver::new(None);
        let resp = driver.dispatch(&server.uri(), &json!({}), None).await.unwrap();
        match resp.reply {
            SdkReply::Steps(ops) => {
                assert_eq!(ops.len(), 1);
                assert_eq!(ops[0].id, "s1");
            }
            other => panic!("expected steps, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_dispatch_error_honors_no_retry() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(
                ResponseTemplate::new(500)
                    .set_body_json(json!({"message": "boom"}))
                    .insert_header(NO_RETRY_HEADER, "true"),
            )
            .mount(&server)
            .await;

        let driver = HttpDriver::new(None);
        let resp = driver.dispatch(&server.uri(), &json!({}), None).await.unwrap();
        match resp.reply {
            SdkReply::Error { retriable, .. } => assert!(!retriable),
            other => panic!("expected error, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_dispatch_unreachable_is_retriable() {
        let driver = HttpDriver::new(None);
        let resp = driver
            .dispatch("http://127.0.0.1:9/api", &json!({}), Some(Duration::from_millis(250)))
            .await
            .unwrap();
        match resp.reply {
            SdkReply::Error { retriable, .. } => assert!(retriable),
            other => panic!("expected error, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_dispatch_signs_when_keyed() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(header_exists(SIGNATURE_HEADER))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!(null)))
            .expect(1)
            .mount(&server)
            .await;

        let driver = HttpDriver::new(Some(b"key".to_vec()));
        driver.dispatch(&server.uri(), &json!({}), None).await.unwrap();
    }
}
