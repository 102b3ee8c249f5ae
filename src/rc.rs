use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::Deserialize;

const RC_TIMEOUT: Duration = Duration::from_secs(5);

/// One in-flight transfer as reported by the tool's `core/stats`.
#[derive(Deserialize, Debug, Clone, Default)]
pub struct TransferringFile {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub size: u64,
    #[serde(default, rename = "speedAvg")]
    pub speed_avg: f64,
    #[serde(default)]
    pub eta: Option<f64>,
    #[serde(default, rename = "srcFs")]
    pub src_fs: String,
    #[serde(default, rename = "dstFs")]
    pub dst_fs: String,
}

#[derive(Deserialize, Debug, Clone, Default)]
pub struct CoreStats {
    #[serde(default)]
    pub transferring: Vec<TransferringFile>,
    #[serde(default)]
    pub bytes: u64,
    #[serde(default, rename = "totalBytes")]
    pub total_bytes: u64,
}

impl CoreStats {
    /// Find a file in the transferring list by its relative path. A miss
    /// is normal: the file may have completed between polls.
    pub fn find_file(&self, rel_path: &str) -> Option<&TransferringFile> {
        self.transferring.iter().find(|t| t.name == rel_path)
    }
}

#[derive(Deserialize, Debug, Default)]
struct BwLimitResponse {
    #[serde(default)]
    rate: String,
}

/// Blocking client for the transfer tool's remote-control endpoint.
pub struct RcClient {
    agent: ureq::Agent,
    base: String,
}

impl RcClient {
    pub fn new(base: &str) -> Self {
        let agent = ureq::AgentBuilder::new().timeout(RC_TIMEOUT).build();
        Self { agent, base: base.trim_end_matches('/').to_string() }
    }

    pub fn url(&self) -> &str {
        &self.base
    }

    pub fn validate(&self) -> bool {
        self.stats().is_ok()
    }

    pub fn stats(&self) -> Result<CoreStats> {
        let resp = self
            .agent
            .post(&format!("{}/core/stats", self.base))
            .send_json(serde_json::json!({}))
            .with_context(|| format!("core/stats call to {} failed", self.base))?;
        Ok(resp.into_json::<CoreStats>()?)
    }

    /// Bound the tool's bandwidth; `"off"` removes the limit.
    pub fn set_bwlimit(&self, rate: &str) -> Result<()> {
        self.agent
            .post(&format!("{}/core/bwlimit", self.base))
            .send_json(serde_json::json!({ "rate": rate }))
            .with_context(|| format!("core/bwlimit call to {} failed", self.base))?;
        Ok(())
    }

    pub fn current_bwlimit(&self) -> Result<String> {
        let resp = self
            .agent
            .post(&format!("{}/core/bwlimit", self.base))
            .send_json(serde_json::json!({}))
            .with_context(|| format!("core/bwlimit call to {} failed", self.base))?;
        Ok(resp.into_json::<BwLimitResponse>()?.rate)
    }

    /// Whether the server still carries the limit we set. The monitor
    /// re-issues a throttle when an external restart dropped it.
    pub fn throttle_active(&self, speed: &str) -> bool {
        matches!(self.current_bwlimit(), Ok(rate) if rate == speed)
    }
}

/// Latest stats snapshot shared between the poller thread and the
/// completion parser.
pub type StatsCell = Arc<Mutex<Option<CoreStats>>>;

pub fn new_stats_cell() -> StatsCell {
    Arc::new(Mutex::new(None))
}

pub fn read_stats(cell: &StatsCell) -> Option<CoreStats> {
    cell.lock().expect("stats cell poisoned").clone()
}

// Poll faster while something small is about to finish so per-file sizes
// are still in the transferring list when the completion line arrives.
fn next_poll_interval(stats: &CoreStats) -> u64 {
    if stats.transferring.is_empty() {
        return 10;
    }
    let min_eta =
        stats.transferring.iter().filter_map(|t| t.eta).fold(f64::MAX, f64::min);
    if min_eta < 15.0 {
        2
    } else if min_eta < 60.0 {
        5
    } else if min_eta < 180.0 {
        8
    } else {
        10
    }
}

/// Background thread polling `core/stats` into a shared snapshot cell.
pub struct StatsPoller {
    running: Arc<AtomicBool>,
    handle: Option<std::thread::JoinHandle<()>>,
}

impl StatsPoller {
    pub fn start(rc_url: &str, cell: StatsCell) -> Self {
        let running = Arc::new(AtomicBool::new(true));
        let run_flag = running.clone();
        let client = RcClient::new(rc_url);
        tracing::info!("started RC stats polling at {}", client.url());
        let handle = std::thread::spawn(move || {
            let mut interval = 5u64;
            while run_flag.load(Ordering::SeqCst) {
                match client.stats() {
                    Ok(stats) => {
                        interval = next_poll_interval(&stats);
                        *cell.lock().expect("stats cell poisoned") = Some(stats);
                    }
                    Err(e) => {
                        tracing::debug!("RC stats poll error: {}", e);
                        interval = 10;
                    }
                }
                // sleep in short steps so stop() is honored promptly
                for _ in 0..interval * 10 {
                    if !run_flag.load(Ordering::SeqCst) {
                        break;
                    }
                    std::thread::sleep(Duration::from_millis(100));
                }
            }
            tracing::info!("stopped RC stats polling");
        });
        Self { running, handle: Some(handle) }
    }

    pub fn stop(mut self) {
        self.running.store(false, Ordering::SeqCst);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for StatsPoller {
    fn drop(&mut self) {
        self.running.store(false, Ordering::SeqCst);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn stats_with_etas(etas: &[Option<f64>]) -> CoreStats {
        CoreStats {
            transferring: etas
                .iter()
                .map(|eta| TransferringFile { eta: *eta, ..Default::default() })
                .collect(),
            ..Default::default()
        }
    }

    #[test]
    fn poll_interval_tracks_minimum_eta() {
        assert_eq!(next_poll_interval(&CoreStats::default()), 10);
        assert_eq!(next_poll_interval(&stats_with_etas(&[Some(10.0), Some(500.0)])), 2);
        assert_eq!(next_poll_interval(&stats_with_etas(&[Some(30.0)])), 5);
        assert_eq!(next_poll_interval(&stats_with_etas(&[Some(120.0)])), 8);
        assert_eq!(next_poll_interval(&stats_with_etas(&[Some(600.0)])), 10);
        assert_eq!(next_poll_interval(&stats_with_etas(&[None])), 10);
    }

    #[test]
    fn find_file_matches_by_relative_path() {
        let stats = CoreStats {
            transferring: vec![TransferringFile {
                name: "tv/show/ep1.mkv".into(),
                size: 1234,
                ..Default::default()
            }],
            ..Default::default()
        };
        assert_eq!(stats.find_file("tv/show/ep1.mkv").map(|t| t.size), Some(1234));
        assert!(stats.find_file("tv/show/ep2.mkv").is_none());
    }
}
