//! JSON shapes exchanged with the relay server.
//!
//! The terminal socket carries client messages as JSON text frames and server
//! output as raw binary frames; everything else in here travels over plain
//! HTTP.

use serde::{Deserialize, Deserializer, Serialize};

/// Messages the client writes to the terminal socket.
///
/// Serialized externally tagged, so `Data` becomes `{"data": "..."}` and
/// `Resize` becomes `{"resize": [cols, rows]}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ClientMessage {
    Data(String),
    Resize([u16; 2]),
}

impl ClientMessage {
    pub fn data(text: impl Into<String>) -> Self {
        ClientMessage::Data(text.into())
    }

    pub fn resize(cols: u16, rows: u16) -> Self {
        ClientMessage::Resize([cols, rows])
    }

    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}

/// Body of the login request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LoginRequest {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub hostname: Option<String>,
    pub port: u16,
    pub username: String,
    pub password: String,
}

/// Body of the login reply. `id` is only present when a shell was opened.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct LoginResponse {
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub status: Option<String>,
    #[serde(default)]
    pub encoding: Option<String>,
}

/// One row of the client list returned by `/clients` and `/clean`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClientEntry {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub ip: String,
    #[serde(default)]
    pub publicip: String,
    #[serde(deserialize_with = "port_from_number_or_string")]
    pub port: String,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum RawPort {
    Number(u64),
    Text(String),
}

fn port_from_number_or_string<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(match RawPort::deserialize(deserializer)? {
        RawPort::Number(port) => port.to_string(),
        RawPort::Text(port) => port.trim().to_string(),
    })
}
