//! Konfiguration für Anrufe
//!
//! Wird explizit an `CallService`, `CallEngine`, `SignalingSync` und
//! `WebRtcTransport` übergeben. Es gibt keinen globalen Zustand.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;
use webrtc::ice_transport::ice_server::RTCIceServer;

/// Umgebungsvariable für ICE-Server (kommagetrennte URLs)
pub const ICE_SERVERS_ENV: &str = "CALL_ICE_SERVERS";

/// Dateiname der Konfiguration im Config-Verzeichnis
const CONFIG_FILE: &str = "call.json";

// ============================================================================
// ERROR TYPES
// ============================================================================

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid config file: {0}")]
    Parse(#[from] serde_json::Error),
}

// ============================================================================
// ICE SERVERS
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IceServerConfig {
    pub urls: Vec<String>,
    #[serde(default)]
    pub username: String,
    #[serde(default)]
    pub credential: String,
}

impl IceServerConfig {
    pub fn stun(url: impl Into<String>) -> Self {
        Self {
            urls: vec![url.into()],
            username: String::new(),
            credential: String::new(),
        }
    }
}

impl From<&IceServerConfig> for RTCIceServer {
    fn from(server: &IceServerConfig) -> Self {
        RTCIceServer {
            urls: server.urls.clone(),
            username: server.username.clone(),
            credential: server.credential.clone(),
            ..Default::default()
        }
    }
}

/// Standard STUN Server
pub fn default_ice_servers() -> Vec<IceServerConfig> {
    vec![
        IceServerConfig::stun("stun:stun.l.google.com:19302"),
        IceServerConfig::stun("stun:global.stun.twilio.com:3478"),
    ]
}

// ============================================================================
// RETRY POLICY
// ============================================================================

/// Wiederholungen für Schreibvorgänge in den Record-Store
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Gesamtzahl der Versuche inklusive des ersten
    pub max_attempts: u32,
    #[serde(with = "millis")]
    pub initial_backoff: Duration,
    #[serde(with = "millis")]
    pub max_backoff: Duration,
}

impl RetryPolicy {
    /// Wartezeit vor Versuch `attempt` (1-basiert, Versuch 1 wartet nicht)
    pub fn backoff_for(&self, attempt: u32) -> Duration {
        if attempt <= 1 {
            return Duration::ZERO;
        }
        let factor = 1u32.checked_shl(attempt - 2).unwrap_or(u32::MAX);
        self.initial_backoff
            .checked_mul(factor)
            .unwrap_or(self.max_backoff)
            .min(self.max_backoff)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            initial_backoff: Duration::from_millis(200),
            max_backoff: Duration::from_secs(3),
        }
    }
}

mod millis {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}

// ============================================================================
// MEDIA
// ============================================================================

/// Welche lokalen Medien angefordert werden
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct MediaConstraints {
    pub audio: bool,
    pub video: bool,
}

impl Default for MediaConstraints {
    fn default() -> Self {
        Self {
            audio: true,
            video: true,
        }
    }
}

// ============================================================================
// CALL CONFIG
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CallConfig {
    pub ice_servers: Vec<IceServerConfig>,
    pub retry: RetryPolicy,
    pub media: MediaConstraints,
    /// Kapazität der Event-Kanäle (Status, Transport)
    pub event_capacity: usize,
}

impl Default for CallConfig {
    fn default() -> Self {
        Self {
            ice_servers: default_ice_servers(),
            retry: RetryPolicy::default(),
            media: MediaConstraints::default(),
            event_capacity: 100,
        }
    }
}

impl CallConfig {
    /// Lädt `call.json` aus dem Config-Verzeichnis (falls vorhanden)
    /// und wendet danach `CALL_ICE_SERVERS` an
    pub fn load() -> Result<Self, ConfigError> {
        let mut config = match Self::config_path() {
            Some(path) if path.exists() => {
                tracing::info!("Loading call config from {:?}", path);
                Self::from_json(&std::fs::read_to_string(path)?)?
            }
            _ => Self::default(),
        };

        if let Ok(value) = std::env::var(ICE_SERVERS_ENV) {
            config.apply_ice_override(&value);
        }

        Ok(config)
    }

    pub fn from_json(json: &str) -> Result<Self, ConfigError> {
        Ok(serde_json::from_str(json)?)
    }

    /// Ersetzt die ICE-Server durch eine kommagetrennte URL-Liste
    pub fn apply_ice_override(&mut self, value: &str) {
        let servers: Vec<_> = value
            .split(',')
            .map(str::trim)
            .filter(|url| !url.is_empty())
            .map(IceServerConfig::stun)
            .collect();
        if !servers.is_empty() {
            self.ice_servers = servers;
        }
    }

    /// Fügt einen TURN-Server mit Credentials hinzu
    pub fn with_turn_server(mut self, url: String, username: String, credential: String) -> Self {
        self.ice_servers.push(IceServerConfig {
            urls: vec![url],
            username,
            credential,
        });
        self
    }

    pub fn rtc_ice_servers(&self) -> Vec<RTCIceServer> {
        self.ice_servers.iter().map(RTCIceServer::from).collect()
    }

    fn config_path() -> Option<PathBuf> {
        let proj_dirs = directories::ProjectDirs::from("com", "consult", "consult-call")?;
        Some(proj_dirs.config_dir().join(CONFIG_FILE))
    }
}

// ============================================================================
// TESTS
// ============================================================================
