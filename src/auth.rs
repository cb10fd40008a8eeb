//! Authentication for Twitch API access.
//!
//! Implements the Device Code Flow. Credentials live in the shared cookie
//! jar: `auth-token` carries the access token, `unique_id` carries the stable
//! device identifier. The session identifier is fresh for every process.

use std::sync::{Arc, RwLock};
use std::time::Duration;

use reqwest::header::HeaderMap;
use serde::Deserialize;
use url::Url;
use uuid::Uuid;

use crate::constants::{CLIENT_ANDROID_APP, DEVICE_CODE_URL, TOKEN_URL, VALIDATE_URL};
use crate::cookies::SharedJar;
use crate::error::{AgentError, Result};
use crate::events::{Event, EventBus};
use crate::http::SharedHttp;

// =============================================================================
// Auth state
// =============================================================================

/// Current credentials and identifiers, shared with the HTTP client.
#[derive(Debug, Clone)]
pub struct AuthState {
    pub access_token: Option<String>,
    pub user_id: Option<u64>,
    pub login: Option<String>,
    /// Stable across restarts; sourced from the platform cookie when present.
    pub device_id: String,
    /// Fresh random identifier per process.
    pub session_id: String,
}

pub type SharedAuth = Arc<RwLock<AuthState>>;

impl AuthState {
    pub fn new(device_id: String) -> SharedAuth {
        Arc::new(RwLock::new(Self {
            access_token: None,
            user_id: None,
            login: None,
            device_id,
            session_id: new_session_id(),
        }))
    }

    pub fn logged_in(&self) -> bool {
        self.access_token.is_some() && self.user_id.is_some()
    }

    #[cfg(test)]
    pub fn shared_for_tests(token: &str, user_id: u64, device_id: &str) -> SharedAuth {
        Arc::new(RwLock::new(Self {
            access_token: Some(token.to_string()),
            user_id: Some(user_id),
            login: Some("testuser".to_string()),
            device_id: device_id.to_string(),
            session_id: new_session_id(),
        }))
    }
}

/// Random 16-hex-character session id, regenerated every process start.
fn new_session_id() -> String {
    Uuid::new_v4().simple().to_string()[..16].to_string()
}

/// Random 32-hex-character device id, used until the platform hands us one.
pub fn generate_device_id() -> String {
    Uuid::new_v4().simple().to_string()
}

// =============================================================================
// Wire shapes
// =============================================================================

#[derive(Debug, Deserialize)]
struct DeviceCodeResponse {
    device_code: String,
    user_code: String,
    verification_uri: String,
    expires_in: u64,
    interval: u64,
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
}

#[derive(Debug, Deserialize)]
struct ValidateResponse {
    user_id: String,
    login: String,
}

// =============================================================================
// Authenticator
// =============================================================================

pub struct Authenticator {
    http: SharedHttp,
    auth: SharedAuth,
    jar: SharedJar,
    bus: EventBus,
}

impl Authenticator {
    pub fn new(http: SharedHttp, auth: SharedAuth, jar: SharedJar, bus: EventBus) -> Self {
        Self {
            http,
            auth,
            jar,
            bus,
        }
    }

    fn platform_url() -> Url {
        Url::parse(CLIENT_ANDROID_APP.client_url).expect("static URL parses")
    }

    /// Recover the device id and, if the jar holds a token, validate it with
    /// a lightweight authenticated query. Returns whether a login is needed.
    pub async fn restore_session(&self) -> Result<bool> {
        let url = Self::platform_url();

        let device_id = match self.jar.get(&url, "unique_id").await {
            Some(id) => id,
            None => {
                // Visiting the platform page sets the unique_id cookie; keep
                // a generated one if the platform declines.
                let _ = self.http.get(CLIENT_ANDROID_APP.client_url, HeaderMap::new()).await;
                match self.jar.get(&url, "unique_id").await {
                    Some(id) => id,
                    None => {
                        let generated = generate_device_id();
                        self.jar.set(&url, "unique_id", &generated).await?;
                        generated
                    }
                }
            }
        };
        self.auth.write().expect("auth lock poisoned").device_id = device_id;

        let Some(token) = self.jar.get(&url, "auth-token").await else {
            return Ok(false);
        };
        self.auth.write().expect("auth lock poisoned").access_token = Some(token);

        match self.validate_token().await {
            Ok(validated) => {
                let mut auth = self.auth.write().expect("auth lock poisoned");
                auth.user_id = Some(validated.user_id.parse().map_err(|_| {
                    AgentError::Login(format!("platform returned bad user id {}", validated.user_id))
                })?);
                auth.login = Some(validated.login);
                Ok(true)
            }
            Err(AgentError::RequestInvalid { status: 401, .. }) => {
                tracing::info!("stored access token is no longer valid");
                self.auth.write().expect("auth lock poisoned").access_token = None;
                Ok(false)
            }
            Err(e) => Err(e),
        }
    }

    /// Run the full device-code flow: publish the user code on the bus, poll
    /// the token endpoint until the user confirms, then validate.
    pub async fn device_code_login(&self) -> Result<()> {
        let device = self.request_device_code().await?;

        self.bus.emit(Event::LoginRequired);
        self.bus.emit(Event::OauthCodeRequired {
            url: device.verification_uri.clone(),
            code: device.user_code.clone(),
        });
        self.bus.emit(Event::AttentionRequired { sound: true });
        self.bus.console(format!(
            "Go to {} and enter code {}",
            device.verification_uri, device.user_code
        ));

        let token = self
            .poll_for_token(&device.device_code, device.interval, device.expires_in)
            .await?;

        let url = Self::platform_url();
        self.jar.set(&url, "auth-token", &token).await?;
        self.auth.write().expect("auth lock poisoned").access_token = Some(token);

        let validated = self.validate_token().await?;
        {
            let mut auth = self.auth.write().expect("auth lock poisoned");
            auth.user_id = Some(validated.user_id.parse().map_err(|_| {
                AgentError::Login(format!("platform returned bad user id {}", validated.user_id))
            })?);
            auth.login = Some(validated.login.clone());
        }
        self.jar.save().await?;
        self.bus.emit(Event::LoginStatus {
            line: format!("Logged in as {}", validated.login),
        });
        Ok(())
    }

    async fn request_device_code(&self) -> Result<DeviceCodeResponse> {
        let device_id = self.auth.read().expect("auth lock poisoned").device_id.clone();
        let mut headers = HeaderMap::new();
        headers.insert("Accept", "application/json".parse().expect("static header"));
        if let Ok(value) = device_id.parse() {
            headers.insert("X-Device-Id", value);
        }
        let response = self
            .http
            .post_form(
                DEVICE_CODE_URL,
                vec![
                    ("client_id", CLIENT_ANDROID_APP.client_id.to_string()),
                    ("scopes", String::new()),
                ],
                headers,
            )
            .await
            .map_err(|e| match e {
                AgentError::RequestInvalid { status, body } if looks_like_captcha(&body) => {
                    tracing::warn!("platform challenge during login (HTTP {status})");
                    AgentError::CaptchaRequired
                }
                other => other,
            })?;
        response
            .json()
            .await
            .map_err(|e| AgentError::Login(format!("bad device code response: {e}")))
    }

    /// Poll the token endpoint every `interval` seconds until the user has
    /// entered the code, the code expires, or the platform challenges us.
    async fn poll_for_token(&self, device_code: &str, interval: u64, expires_in: u64) -> Result<String> {
        let poll_interval = Duration::from_secs(interval.max(1));
        let max_attempts = expires_in / interval.max(1);

        for attempt in 0..max_attempts {
            tokio::time::sleep(poll_interval).await;

            let result = self
                .http
                .post_form(
                    TOKEN_URL,
                    vec![
                        ("client_id", CLIENT_ANDROID_APP.client_id.to_string()),
                        ("device_code", device_code.to_string()),
                        (
                            "grant_type",
                            "urn:ietf:params:oauth:grant-type:device_code".to_string(),
                        ),
                    ],
                    HeaderMap::new(),
                )
                .await;

            match result {
                Ok(response) => {
                    let token: TokenResponse = response
                        .json()
                        .await
                        .map_err(|e| AgentError::Login(format!("bad token response: {e}")))?;
                    return Ok(token.access_token);
                }
                // 400 means the user has not confirmed yet; keep polling.
                Err(AgentError::RequestInvalid { status: 400, .. }) => {
                    tracing::debug!(
                        "waiting for user authorization (attempt {}/{max_attempts})",
                        attempt + 1
                    );
                }
                Err(AgentError::RequestInvalid { body, .. }) if looks_like_captcha(&body) => {
                    return Err(AgentError::CaptchaRequired);
                }
                Err(e) => return Err(e),
            }
        }
        Err(AgentError::Login(
            "device code expired before the user authorized it".into(),
        ))
    }

    /// Lightweight authenticated query used to validate tokens on startup.
    async fn validate_token(&self) -> Result<ValidateResponse> {
        let token = self
            .auth
            .read()
            .expect("auth lock poisoned")
            .access_token
            .clone()
            .ok_or_else(|| AgentError::Login("no access token to validate".into()))?;
        let mut headers = HeaderMap::new();
        if let Ok(value) = format!("OAuth {token}").parse() {
            headers.insert(reqwest::header::AUTHORIZATION, value);
        }
        let response = self.http.get(VALIDATE_URL, headers).await?;
        response
            .json()
            .await
            .map_err(|e| AgentError::Login(format!("bad validate response: {e}")))
    }
}

fn looks_like_captcha(body: &str) -> bool {
    let lowered = body.to_ascii_lowercase();
    lowered.contains("captcha") || lowered.contains("integrity")
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_device_id_generation() {
        let id1 = generate_device_id();
        let id2 = generate_device_id();

        assert_eq!(id1.len(), 32);
        assert!(id1.chars().all(|c| c.is_ascii_hexdigit()));
        assert_ne!(id1, id2);
    }

    #[test]
    fn test_session_id_is_fresh_per_call() {
        let a = new_session_id();
        let b = new_session_id();
        assert_eq!(a.len(), 16);
        assert_ne!(a, b);
    }

    #[test]
    fn test_auth_state_logged_in() {
        let shared = AuthState::new(generate_device_id());
        assert!(!shared.read().unwrap().logged_in());

        {
            let mut auth = shared.write().unwrap();
            auth.access_token = Some("tok".into());
            auth.user_id = Some(42);
        }
        assert!(shared.read().unwrap().logged_in());
    }

    #[test]
    fn test_captcha_detection() {
        assert!(looks_like_captcha(r#"{"error":"CaptchaRequired"}"#));
        assert!(looks_like_captcha("integrity check failed"));
        assert!(!looks_like_captcha(
            r#"{"message":"authorization_pending"}"#
        ));
    }

    #[test]
    fn test_device_code_wire_parsing() {
        let json = r#"{
            "device_code": "devcode",
            "user_code": "ABCD1234",
            "verification_uri": "https://www.twitch.tv/activate",
            "expires_in": 1800,
            "interval": 5
        }"#;
        let parsed: DeviceCodeResponse = serde_json::from_str(json).unwrap();
        assert_eq!(parsed.user_code, "ABCD1234");
        assert_eq!(parsed.interval, 5);
        assert_eq!(parsed.expires_in / parsed.interval, 360);
        assert!(!parsed.device_code.is_empty());
    }
}
