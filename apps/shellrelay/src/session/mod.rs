pub mod tty;

use crate::protocol::{ClientEntry, LoginRequest, LoginResponse};
use async_trait::async_trait;
use reqwest::StatusCode;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info, warn};
use url::Url;

pub const DEFAULT_UNREACHABLE_PREFIX: &str = "unable to connect to";

#[derive(Clone, Debug)]
pub struct SessionConfig {
    base_url: Url,
    unreachable_prefix: String,
}

impl SessionConfig {
    pub fn new(server_base_url: impl AsRef<str>) -> Result<Self, SessionError> {
        let mut base = server_base_url.as_ref().trim().to_string();
        if base.is_empty() {
            return Err(SessionError::InvalidConfig(
                "relay server url cannot be empty".into(),
            ));
        }
        if !base.contains("://") {
            let inferred_scheme = infer_scheme(&base);
            base = format!("{inferred_scheme}{base}");
        }
        // Relative endpoints are joined onto the base, so it must end in '/'.
        if !base.ends_with('/') {
            base.push('/');
        }
        let parsed = Url::parse(&base)
            .map_err(|err| SessionError::InvalidConfig(format!("invalid relay server url: {err}")))?;
        Ok(Self {
            base_url: parsed,
            unreachable_prefix: DEFAULT_UNREACHABLE_PREFIX.to_string(),
        })
    }

    pub fn base_url(&self) -> &Url {
        &self.base_url
    }

    pub fn with_unreachable_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.unreachable_prefix = prefix.into().trim().to_ascii_lowercase();
        self
    }

    pub fn unreachable_prefix(&self) -> &str {
        &self.unreachable_prefix
    }

    fn endpoint(&self, path: &str) -> Result<Url, SessionError> {
        self.base_url
            .join(path)
            .map_err(|err| SessionError::InvalidConfig(format!("invalid {path} endpoint: {err}")))
    }
}

fn infer_scheme(base: &str) -> &'static str {
    let host_part = base
        .split('/')
        .next()
        .unwrap_or(base)
        .trim_start_matches('[')
        .split(']')
        .next()
        .unwrap_or(base);
    let host = host_part.to_ascii_lowercase();
    let private_172 = host
        .strip_prefix("172.")
        .and_then(|rest| rest.split('.').next())
        .and_then(|octet| octet.parse::<u8>().ok())
        .is_some_and(|octet| (16..32).contains(&octet));
    if host.starts_with("localhost")
        || host.starts_with("0.0.0.0")
        || host.starts_with("127.")
        || host.starts_with("::1")
        || host.starts_with("10.")
        || host.starts_with("192.168.")
        || private_172
    {
        "http://"
    } else {
        "https://"
    }
}

/// Identity of one live shell on the relay, as handed out by a successful
/// login. Passed by value to everything that needs to address the session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionDescriptor {
    id: String,
    encoding: Option<String>,
}

impl SessionDescriptor {
    pub fn new(id: impl Into<String>, encoding: Option<String>) -> Self {
        Self {
            id: id.into(),
            encoding: encoding
                .map(|value| value.trim().to_string())
                .filter(|value| !value.is_empty()),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn encoding(&self) -> Option<&str> {
        self.encoding.as_deref()
    }
}

impl fmt::Display for SessionDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "session={} encoding={}",
            self.id,
            self.encoding.as_deref().unwrap_or("<default>")
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HandshakeResult {
    Success(SessionDescriptor),
    Failure { reason: String },
}

impl HandshakeResult {
    fn from_response(response: LoginResponse) -> Self {
        let LoginResponse {
            id,
            status,
            encoding,
        } = response;
        match id.map(|id| id.trim().to_string()).filter(|id| !id.is_empty()) {
            Some(id) => HandshakeResult::Success(SessionDescriptor::new(id, encoding)),
            None => HandshakeResult::Failure {
                reason: status
                    .filter(|status| !status.trim().is_empty())
                    .unwrap_or_else(|| "login failed without a reason".to_string()),
            },
        }
    }

    fn from_status(status: StatusCode) -> Self {
        HandshakeResult::Failure {
            reason: format!(
                "{}: {}",
                status.as_u16(),
                status.canonical_reason().unwrap_or("Unknown Status")
            ),
        }
    }

    /// Whether the failure reason says the remote endpoint could not be
    /// reached, meaning the caller's client list is stale.
    pub fn is_unreachable(&self, prefix: &str) -> bool {
        match self {
            HandshakeResult::Success(_) => false,
            HandshakeResult::Failure { reason } => reason
                .trim_start()
                .to_ascii_lowercase()
                .starts_with(&prefix.to_ascii_lowercase()),
        }
    }
}

/// Login form as submitted by the user. A `hostname` turns the login into a
/// direct SSH login; without it the relay connects to a registered client on
/// `port`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoginForm {
    pub hostname: Option<String>,
    pub port: u16,
    pub username: String,
    pub password: String,
}

impl LoginForm {
    pub fn validate(&self) -> Result<(), SessionError> {
        if let Some(hostname) = self.hostname.as_deref() {
            if hostname.trim().is_empty() {
                return Err(SessionError::MissingField("hostname"));
            }
        }
        if self.port == 0 {
            return Err(SessionError::MissingField("port"));
        }
        if self.username.trim().is_empty() {
            return Err(SessionError::MissingField("username"));
        }
        if self.password.is_empty() {
            return Err(SessionError::MissingField("password"));
        }
        Ok(())
    }

    pub fn title(&self) -> String {
        format!("{}@port:{}", self.username.trim(), self.port)
    }

    fn to_request(&self) -> LoginRequest {
        LoginRequest {
            hostname: self.hostname.as_ref().map(|h| h.trim().to_string()),
            port: self.port,
            username: self.username.trim().to_string(),
            password: self.password.clone(),
        }
    }
}

/// The user-facing side of a session: message area, client list and window
/// title.
pub trait SessionObserver: Send + Sync {
    fn show_message(&self, message: &str);

    fn refresh_clients(&self);

    fn set_title(&self, _title: &str) {}
}

#[derive(Clone)]
pub struct SessionManager {
    config: Arc<SessionConfig>,
    backend: Arc<dyn SessionBackend>,
}

impl SessionManager {
    pub fn new(config: SessionConfig) -> Result<Self, SessionError> {
        let backend = Arc::new(ReqwestSessionBackend::new()?);
        Ok(Self {
            config: Arc::new(config),
            backend,
        })
    }

    #[cfg(test)]
    fn with_backend(config: SessionConfig, backend: Arc<dyn SessionBackend>) -> Self {
        Self {
            config: Arc::new(config),
            backend,
        }
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    pub async fn login(&self, form: &LoginForm) -> Result<HandshakeResult, SessionError> {
        form.validate()?;
        let endpoint = self.config.endpoint("")?;
        let request = form.to_request();
        debug!(
            target: "shellrelay::session",
            endpoint = %endpoint,
            hostname = ?request.hostname,
            port = request.port,
            username = %request.username,
            "submitting login"
        );
        match self.backend.login(&endpoint, &request).await {
            Ok(response) => Ok(HandshakeResult::from_response(response)),
            Err(SessionError::HttpStatus(status)) => Ok(HandshakeResult::from_status(status)),
            Err(err) => Err(err),
        }
    }

    /// Logs in and reports a failed handshake to the observer: the reason is
    /// always shown, and an unreachable endpoint additionally triggers one
    /// client-list refresh.
    pub async fn handshake(
        &self,
        form: &LoginForm,
        observer: &dyn SessionObserver,
    ) -> Result<HandshakeResult, SessionError> {
        let result = self.login(form).await?;
        match &result {
            HandshakeResult::Success(descriptor) => {
                info!(
                    target: "shellrelay::session",
                    session_id = %descriptor.id(),
                    encoding = ?descriptor.encoding(),
                    "login accepted"
                );
            }
            HandshakeResult::Failure { reason } => {
                warn!(target: "shellrelay::session", reason = %reason, "login rejected");
                if result.is_unreachable(self.config.unreachable_prefix()) {
                    observer.refresh_clients();
                }
                observer.show_message(reason);
            }
        }
        Ok(result)
    }

    pub async fn clients(&self) -> Result<Vec<ClientEntry>, SessionError> {
        let endpoint = self.config.endpoint("clients")?;
        self.backend.list_clients(&endpoint).await
    }

    /// Asks the relay to drop clients whose ports no longer answer and
    /// returns the survivors.
    pub async fn clean(&self) -> Result<Vec<ClientEntry>, SessionError> {
        let endpoint = self.config.endpoint("clean")?;
        self.backend.list_clients(&endpoint).await
    }
}

#[derive(Error, Debug)]
pub enum SessionError {
    #[error("invalid session configuration: {0}")]
    InvalidConfig(String),
    #[error("network error: {0}")]
    Network(#[from] reqwest::Error),
    #[error("unexpected http status {0}")]
    HttpStatus(StatusCode),
    #[error("invalid response: {0}")]
    InvalidResponse(String),
    #[error("{0} is required")]
    MissingField(&'static str),
}

#[async_trait]
trait SessionBackend: Send + Sync {
    async fn login(
        &self,
        endpoint: &Url,
        request: &LoginRequest,
    ) -> Result<LoginResponse, SessionError>;

    async fn list_clients(&self, endpoint: &Url) -> Result<Vec<ClientEntry>, SessionError>;
}

struct ReqwestSessionBackend {
    client: reqwest::Client,
}

impl ReqwestSessionBackend {
    fn new() -> Result<Self, SessionError> {
        // Login blocks on the relay's own SSH connect, so the overall timeout
        // is generous compared to the connect timeout.
        let client = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(3))
            .timeout(Duration::from_secs(30))
            .no_proxy()
            .build()?;
        Ok(Self { client })
    }
}

#[async_trait]
impl SessionBackend for ReqwestSessionBackend {
    async fn login(
        &self,
        endpoint: &Url,
        request: &LoginRequest,
    ) -> Result<LoginResponse, SessionError> {
        let response = self.client.post(endpoint.clone()).json(request).send().await?;
        if !response.status().is_success() {
            return Err(SessionError::HttpStatus(response.status()));
        }
        let payload = response.json::<LoginResponse>().await?;
        Ok(payload)
    }

    async fn list_clients(&self, endpoint: &Url) -> Result<Vec<ClientEntry>, SessionError> {
        let response = self.client.get(endpoint.clone()).send().await?;
        if !response.status().is_success() {
            return Err(SessionError::HttpStatus(response.status()));
        }
        // The relay writes the list as a JSON string body without a JSON
        // content type, so parse the text ourselves.
        let body = response.text().await?;
        serde_json::from_str(&body)
            .map_err(|err| SessionError::InvalidResponse(format!("client list: {err}")))
    }
}
