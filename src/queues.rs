use std::time::Duration;

use crate::config::QueueServiceConfig;

const QUEUE_TIMEOUT: Duration = Duration::from_secs(5);

/// Nzbget JSON-RPC client, used only to pause and resume the download
/// queue around an upload.
pub struct NzbgetClient {
    agent: ureq::Agent,
    url: String,
}

impl NzbgetClient {
    pub fn new(cfg: &QueueServiceConfig) -> Self {
        let agent = ureq::AgentBuilder::new().timeout(QUEUE_TIMEOUT).build();
        Self { agent, url: cfg.url.trim_end_matches('/').to_string() }
    }

    fn call(&self, method: &str) -> bool {
        let resp = self
            .agent
            .post(&format!("{}/jsonrpc", self.url))
            .send_json(serde_json::json!({ "method": method }));
        match resp {
            Ok(r) => r
                .into_json::<serde_json::Value>()
                .ok()
                .and_then(|v| v.get("result").and_then(|r| r.as_bool()))
                .unwrap_or(false),
            Err(e) => {
                tracing::warn!("nzbget {} call failed: {}", method, e);
                false
            }
        }
    }

    pub fn pause_queue(&self) -> bool {
        self.call("pausedownload")
    }

    pub fn resume_queue(&self) -> bool {
        self.call("resumedownload")
    }
}

/// Sabnzbd API client, same pause/resume contract as nzbget.
pub struct SabnzbdClient {
    agent: ureq::Agent,
    url: String,
    apikey: String,
}

impl SabnzbdClient {
    pub fn new(cfg: &QueueServiceConfig) -> Self {
        let agent = ureq::AgentBuilder::new().timeout(QUEUE_TIMEOUT).build();
        Self {
            agent,
            url: cfg.url.trim_end_matches('/').to_string(),
            apikey: cfg.apikey.clone(),
        }
    }

    fn call(&self, mode: &str) -> bool {
        let resp = self
            .agent
            .get(&format!("{}/api", self.url))
            .query("mode", mode)
            .query("apikey", &self.apikey)
            .query("output", "json")
            .call();
        match resp {
            Ok(r) => r
                .into_json::<serde_json::Value>()
                .ok()
                .and_then(|v| v.get("status").and_then(|s| s.as_bool()))
                .unwrap_or(false),
            Err(e) => {
                tracing::warn!("sabnzbd {} call failed: {}", mode, e);
                false
            }
        }
    }

    pub fn pause_queue(&self) -> bool {
        self.call("pause")
    }

    pub fn resume_queue(&self) -> bool {
        self.call("resume")
    }
}
