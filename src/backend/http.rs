//! HTTP implementation of the backend contract.

use crate::auth::AuthMethod;
use crate::backend::{
    AUTH_REQUIRED_CODE, AudioClip, BackendClient, BackendError, Identity, QueryReply,
    SUBSCRIPTION_EXPIRED_CODE, WidgetBackendConfig,
};
use crate::config::BackendConfig;
use async_trait::async_trait;
use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use serde::Deserialize;
use std::time::Duration;
use tracing::debug;

/// Backend client over HTTP with JSON bodies.
#[derive(Clone)]
pub struct HttpBackend {
    base_url: String,
    client: reqwest::Client,
}

impl HttpBackend {
    /// Build a client from the backend configuration.
    ///
    /// # Errors
    ///
    /// Returns an error if the underlying HTTP client cannot be constructed.
    pub fn new(config: &BackendConfig) -> Result<Self, BackendError> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.request_timeout_secs))
            .build()
            .map_err(|e| BackendError::Network(format!("failed to build HTTP client: {e}")))?;
        Ok(Self {
            base_url: config.api_url.trim_end_matches('/').to_owned(),
            client,
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{path}", self.base_url)
    }

    async fn post_json(
        &self,
        path: &str,
        body: &serde_json::Value,
    ) -> Result<reqwest::Response, BackendError> {
        let response = self
            .client
            .post(self.url(path))
            .json(body)
            .send()
            .await
            .map_err(map_transport_error)?;
        ensure_success(response).await
    }
}

/// Error body shape the backend attaches to non-2xx responses.
#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
struct ErrorBody {
    error_code: Option<String>,
    message: Option<String>,
}

fn map_transport_error(err: reqwest::Error) -> BackendError {
    if err.is_timeout() {
        BackendError::Timeout
    } else {
        BackendError::Network(err.to_string())
    }
}

/// Classify a non-2xx response into the typed taxonomy.
///
/// A 403 is split three ways: the auth-required marker, the subscription
/// marker, or neither (bare 403, left for the caller's policy).
fn classify_status(status: u16, body: &str) -> BackendError {
    let parsed: ErrorBody = serde_json::from_str(body).unwrap_or_default();
    match status {
        403 => {
            let code = parsed.error_code.as_deref().unwrap_or_default();
            if code == AUTH_REQUIRED_CODE {
                BackendError::AuthRequired {
                    message: parsed.message,
                }
            } else if code == SUBSCRIPTION_EXPIRED_CODE
                || parsed
                    .message
                    .as_deref()
                    .is_some_and(|m| m.to_ascii_lowercase().contains("subscription"))
            {
                BackendError::SubscriptionExpired {
                    message: parsed
                        .message
                        .unwrap_or_else(|| "subscription expired".to_owned()),
                }
            } else {
                BackendError::Forbidden {
                    message: parsed.message,
                }
            }
        }
        408 => BackendError::Timeout,
        413 => BackendError::PayloadTooLarge,
        429 => BackendError::RateLimited,
        _ => BackendError::Server {
            status,
            message: parsed
                .message
                .unwrap_or_else(|| body.chars().take(200).collect()),
        },
    }
}

async fn ensure_success(response: reqwest::Response) -> Result<reqwest::Response, BackendError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response.text().await.unwrap_or_default();
    debug!("backend returned {status}: {body}");
    Err(classify_status(status.as_u16(), &body))
}

fn decode_base64_audio(data: &str, content_type: &str) -> Result<AudioClip, BackendError> {
    let bytes = BASE64
        .decode(data.trim())
        .map_err(|e| BackendError::Decode(format!("invalid base64 audio: {e}")))?;
    Ok(AudioClip {
        bytes: bytes.into(),
        content_type: content_type.to_owned(),
    })
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ConfigWire {
    auth_method: Option<String>,
    require_auth_text: Option<String>,
    #[serde(default)]
    require_auth_from_start: bool,
    #[serde(default)]
    require_auth: bool,
}

#[derive(Debug, Deserialize)]
struct ValidateWire {
    valid: bool,
}

#[derive(Debug, Deserialize)]
struct VerifyWire {
    success: bool,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct QueryWire {
    answer: String,
    audio: Option<String>,
    audio_content_type: Option<String>,
    #[serde(default)]
    requires_auth_next: bool,
    auth_method: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct TranscribeWire {
    text: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SynthesizeWire {
    audio_base64: String,
    content_type: Option<String>,
}

async fn read_json<T: for<'de> Deserialize<'de>>(
    response: reqwest::Response,
) -> Result<T, BackendError> {
    response
        .json::<T>()
        .await
        .map_err(|e| BackendError::Decode(e.to_string()))
}

#[async_trait]
impl BackendClient for HttpBackend {
    async fn get_config(&self, chatbot_id: &str) -> Result<WidgetBackendConfig, BackendError> {
        let response = self
            .client
            .get(self.url(&format!("/api/widget/{chatbot_id}/config")))
            .send()
            .await
            .map_err(map_transport_error)?;
        let wire: ConfigWire = read_json(ensure_success(response).await?).await?;
        Ok(WidgetBackendConfig {
            auth_method: wire.auth_method.as_deref().and_then(AuthMethod::parse),
            require_auth_text: wire.require_auth_text,
            require_auth_from_start: wire.require_auth_from_start,
            require_auth: wire.require_auth,
        })
    }

    async fn validate_session(
        &self,
        method: AuthMethod,
        identifier: &str,
        chatbot_id: &str,
    ) -> Result<bool, BackendError> {
        let body = serde_json::json!({
            "method": method.as_str(),
            "identifier": identifier,
            "chatbotId": chatbot_id,
        });
        let response = self.post_json("/api/otp/validate-session", &body).await?;
        let wire: ValidateWire = read_json(response).await?;
        Ok(wire.valid)
    }

    async fn send_otp(
        &self,
        method: AuthMethod,
        identifier: &str,
        chatbot_id: &str,
    ) -> Result<(), BackendError> {
        let body = serde_json::json!({
            "method": method.as_str(),
            "identifier": identifier,
            "chatbotId": chatbot_id,
        });
        self.post_json("/api/otp/send", &body).await?;
        Ok(())
    }

    async fn verify_otp(
        &self,
        method: AuthMethod,
        identifier: &str,
        code: &str,
        chatbot_id: &str,
    ) -> Result<bool, BackendError> {
        let body = serde_json::json!({
            "method": method.as_str(),
            "identifier": identifier,
            "code": code,
            "chatbotId": chatbot_id,
        });
        let response = self.post_json("/api/otp/verify", &body).await?;
        let wire: VerifyWire = read_json(response).await?;
        Ok(wire.success)
    }

    async fn query(
        &self,
        chatbot_id: &str,
        text: &str,
        session_id: &str,
        identity: Option<&Identity>,
    ) -> Result<QueryReply, BackendError> {
        let mut body = serde_json::json!({
            "chatbotId": chatbot_id,
            "query": text,
            "sessionId": session_id,
        });
        if let (Some(identity), Some(map)) = (identity, body.as_object_mut()) {
            map.insert(
                identity.method.as_str().to_owned(),
                serde_json::Value::String(identity.identifier.clone()),
            );
        }
        let response = self.post_json("/api/chat/query", &body).await?;
        let wire: QueryWire = read_json(response).await?;

        let audio = match wire.audio {
            Some(data) => Some(decode_base64_audio(
                &data,
                wire.audio_content_type.as_deref().unwrap_or("audio/mpeg"),
            )?),
            None => None,
        };

        Ok(QueryReply {
            answer: wire.answer,
            audio,
            requires_auth_next: wire.requires_auth_next,
            auth_method: wire.auth_method.as_deref().and_then(AuthMethod::parse),
        })
    }

    async fn transcribe(&self, payload: &[u8], format_hint: &str) -> Result<String, BackendError> {
        let body = serde_json::json!({
            "audioBase64": BASE64.encode(payload),
            "format": format_hint,
        });
        let response = self.post_json("/api/stt/transcribe", &body).await?;
        let wire: TranscribeWire = read_json(response).await?;
        Ok(wire.text)
    }

    async fn synthesize(&self, text: &str) -> Result<AudioClip, BackendError> {
        let body = serde_json::json!({ "text": text });
        let response = self.post_json("/api/tts/synthesize", &body).await?;
        let wire: SynthesizeWire = read_json(response).await?;
        decode_base64_audio(
            &wire.audio_base64,
            wire.content_type.as_deref().unwrap_or("audio/mpeg"),
        )
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used, clippy::expect_used)]

    use super::*;

    #[test]
    fn classify_403_with_auth_marker() {
        let err = classify_status(403, r#"{"errorCode":"AUTH_REQUIRED","message":"verify"}"#);
        assert!(matches!(err, BackendError::AuthRequired { .. }));
    }

    #[test]
    fn classify_403_with_subscription_code() {
        let err = classify_status(
            403,
            r#"{"errorCode":"SUBSCRIPTION_EXPIRED","message":"plan lapsed"}"#,
        );
        assert!(matches!(err, BackendError::SubscriptionExpired { .. }));
    }

    #[test]
    fn classify_403_with_subscription_message_only() {
        let err = classify_status(403, r#"{"message":"Your subscription has expired"}"#);
        assert!(matches!(err, BackendError::SubscriptionExpired { .. }));
    }

    #[test]
    fn classify_bare_403_is_forbidden() {
        let err = classify_status(403, "");
        assert!(matches!(err, BackendError::Forbidden { .. }));
    }

    #[test]
    fn classify_other_statuses() {
        assert!(matches!(
            classify_status(429, ""),
            BackendError::RateLimited
        ));
        assert!(matches!(
            classify_status(413, ""),
            BackendError::PayloadTooLarge
        ));
        assert!(matches!(classify_status(408, ""), BackendError::Timeout));
        assert!(matches!(
            classify_status(500, "oops"),
            BackendError::Server { status: 500, .. }
        ));
    }

    #[test]
    fn base64_audio_decodes() {
        let clip = decode_base64_audio("AAEC", "audio/wav").unwrap();
        assert_eq!(clip.bytes.as_ref(), &[0u8, 1, 2]);
        assert_eq!(clip.content_type, "audio/wav");
    }

    #[test]
    fn base64_audio_rejects_garbage() {
        assert!(decode_base64_audio("not base64!!!", "audio/wav").is_err());
    }
}
