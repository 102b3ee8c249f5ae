use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Deserializer};

const PLEX_TIMEOUT: Duration = Duration::from_secs(5);

// Plex reports Player.local as a bool, a number, or a "0"/"1" string
// depending on server version.
fn flexible_bool<'de, D: Deserializer<'de>>(de: D) -> Result<bool, D::Error> {
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Raw {
        Bool(bool),
        Num(i64),
        Str(String),
    }
    Ok(match Raw::deserialize(de)? {
        Raw::Bool(b) => b,
        Raw::Num(n) => n != 0,
        Raw::Str(s) => matches!(s.as_str(), "1" | "true" | "True"),
    })
}

#[derive(Deserialize, Debug, Clone, Default)]
struct PlayerInfo {
    #[serde(default)]
    state: String,
    #[serde(default, deserialize_with = "flexible_bool")]
    local: bool,
}

#[derive(Deserialize, Debug)]
struct SessionMetadata {
    #[serde(rename = "Player", default)]
    player: Option<PlayerInfo>,
}

#[derive(Deserialize, Debug, Default)]
struct MediaContainer {
    #[serde(rename = "Metadata", default)]
    metadata: Vec<SessionMetadata>,
}

#[derive(Deserialize, Debug)]
struct SessionsResponse {
    #[serde(rename = "MediaContainer", default)]
    container: MediaContainer,
}

/// One active session on the media server.
#[derive(Debug, Clone)]
pub struct StreamSession {
    pub state: String,
    pub local: bool,
}

impl StreamSession {
    pub fn is_active(&self) -> bool {
        matches!(self.state.as_str(), "playing" | "buffering")
    }
}

impl std::fmt::Display for StreamSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "stream state={} local={}", self.state, self.local)
    }
}

/// Minimal media-server client: enough to count active streams.
pub struct PlexClient {
    agent: ureq::Agent,
    url: String,
    token: String,
}

impl PlexClient {
    pub fn new(url: &str, token: &str) -> Self {
        let agent = ureq::AgentBuilder::new().timeout(PLEX_TIMEOUT).build();
        Self { agent, url: url.trim_end_matches('/').to_string(), token: token.to_string() }
    }

    /// Check that URL and token are accepted before the monitor commits
    /// to its poll loop.
    pub fn validate(&self) -> bool {
        match self.fetch_sessions() {
            Ok(_) => true,
            Err(e) => {
                tracing::debug!("media server validation failed: {}", e);
                false
            }
        }
    }

    pub fn get_streams(&self) -> Result<Vec<StreamSession>> {
        let resp = self.fetch_sessions()?;
        Ok(resp
            .container
            .metadata
            .into_iter()
            .filter_map(|m| m.player)
            .map(|p| StreamSession { state: p.state, local: p.local })
            .collect())
    }

    fn fetch_sessions(&self) -> Result<SessionsResponse> {
        let resp = self
            .agent
            .get(&format!("{}/status/sessions", self.url))
            .set("X-Plex-Token", &self.token)
            .set("Accept", "application/json")
            .call()
            .with_context(|| format!("sessions call to {} failed", self.url))?;
        Ok(resp.into_json::<SessionsResponse>()?)
    }
}
