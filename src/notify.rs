use std::collections::BTreeMap;
use std::time::Duration;

use crate::config::NotificationConfig;

/// A notification agent. Delivery failures are logged and swallowed; a
/// broken webhook never affects an upload.
pub trait Notifier: Send + Sync {
    fn name(&self) -> &str;
    fn send(&self, message: &str);
}

/// Google Chat incoming-webhook agent.
pub struct GoogleChat {
    webhook_url: String,
    agent: ureq::Agent,
}

impl GoogleChat {
    pub fn new(webhook_url: &str) -> Self {
        let agent = ureq::AgentBuilder::new().timeout(Duration::from_secs(5)).build();
        Self { webhook_url: webhook_url.to_string(), agent }
    }
}

impl Notifier for GoogleChat {
    fn name(&self) -> &str {
        "googlechat"
    }

    fn send(&self, message: &str) {
        let resp = self.agent.post(&self.webhook_url).send_json(serde_json::json!({
            "text": message,
        }));
        if let Err(e) = resp {
            tracing::warn!("googlechat notification failed: {}", e);
        }
    }
}

/// Broadcast set over every configured agent. With no agents configured,
/// messages still land in the log at info level.
#[derive(Default)]
pub struct NotifierSet {
    agents: Vec<Box<dyn Notifier>>,
}

impl NotifierSet {
    pub fn with_agents(agents: Vec<Box<dyn Notifier>>) -> Self {
        Self { agents }
    }

    pub fn from_config(configs: &BTreeMap<String, NotificationConfig>) -> Self {
        let mut agents: Vec<Box<dyn Notifier>> = Vec::new();
        for (name, cfg) in configs {
            match cfg.service.to_lowercase().as_str() {
                "googlechat" => {
                    if cfg.webhook_url.is_empty() {
                        tracing::warn!("notification agent '{}' has no webhook_url, skipping", name);
                    } else {
                        agents.push(Box::new(GoogleChat::new(&cfg.webhook_url)));
                    }
                }
                other => {
                    tracing::warn!("unsupported notification service '{}' for '{}'", other, name);
                }
            }
        }
        Self { agents }
    }

    pub fn send(&self, message: &str) {
        tracing::info!("notify: {}", message);
        for agent in &self.agents {
            agent.send(message);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unsupported_services_are_skipped() {
        let mut configs = BTreeMap::new();
        configs.insert(
            "chat".to_string(),
            NotificationConfig { service: "googlechat".into(), webhook_url: "http://x/hook".into() },
        );
        configs.insert(
            "pager".to_string(),
            NotificationConfig { service: "pagerduty".into(), webhook_url: String::new() },
        );
        let set = NotifierSet::from_config(&configs);
        assert_eq!(set.agents.len(), 1);
        assert_eq!(set.agents[0].name(), "googlechat");
    }
}
