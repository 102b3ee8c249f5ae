use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use crate::config::PlexConfig;
use crate::notify::NotifierSet;
use crate::plex::{PlexClient, StreamSession};
use crate::rc::RcClient;

/// Streams that count toward the throttle threshold.
pub fn count_active(streams: &[StreamSession], ignore_local: bool) -> usize {
    streams.iter().filter(|s| s.is_active() && (!ignore_local || !s.local)).count()
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ThrottleCmd {
    Throttle(String),
    Unthrottle,
    Keep,
}

/// Current view of the limit we believe is applied.
#[derive(Debug, Clone, Default)]
pub struct ThrottleState {
    pub throttled: bool,
    pub speed: Option<String>,
}

/// Pure transition rules between stream counts and bandwidth commands.
/// The speed ladder maps one active stream to the first (fastest
/// throttled) entry and clamps at the last.
pub struct ThrottleDecider {
    pub threshold: usize,
    pub speeds: Vec<String>,
}

impl ThrottleDecider {
    pub fn new(threshold: usize, speeds: Vec<String>) -> Self {
        Self { threshold, speeds }
    }

    pub fn decide(
        &self,
        state: &ThrottleState,
        active: usize,
        server_throttle_active: bool,
    ) -> ThrottleCmd {
        let target = crate::util::nearest_less_element(&self.speeds, active);

        if active >= self.threshold && (!state.throttled || !server_throttle_active) {
            if let Some(target) = target {
                return ThrottleCmd::Throttle(target.to_string());
            }
            return ThrottleCmd::Keep;
        }
        if state.throttled {
            if active < self.threshold {
                return ThrottleCmd::Unthrottle;
            }
            if let Some(target) = target
                && state.speed.as_deref() != Some(target)
            {
                return ThrottleCmd::Throttle(target.to_string());
            }
        }
        ThrottleCmd::Keep
    }
}

fn interruptible_sleep(secs: u64, run: &AtomicBool) {
    for _ in 0..secs {
        if !run.load(Ordering::SeqCst) {
            return;
        }
        std::thread::sleep(Duration::from_secs(1));
    }
}

/// Stream monitor body. Runs for the lifetime of an upload: validates the
/// media server and the RC endpoint, then polls and throttles until the
/// `run` flag is cleared at lock release. Any validation failure disables
/// the monitor without touching the upload.
pub fn run_monitor(cfg: &PlexConfig, rc_url: &str, run: Arc<AtomicBool>, notify: Arc<NotifierSet>) {
    let plex = PlexClient::new(&cfg.url, &cfg.token);
    if !plex.validate() {
        tracing::error!("aborting stream monitor: media server URL/token validation failed");
        return;
    }

    // give the transfer tool a moment to bring its RC server up
    tracing::info!("media server validated, waiting 15s before checking the RC endpoint");
    interruptible_sleep(15, &run);
    if !run.load(Ordering::SeqCst) {
        return;
    }

    let rc = RcClient::new(rc_url);
    if !rc.validate() {
        tracing::error!(
            "aborting stream monitor: {}",
            crate::UploadError::RemoteControlUnavailable(rc_url.to_string())
        );
        return;
    }
    tracing::info!("RC endpoint validated, stream monitoring begins");

    let decider = ThrottleDecider::new(cfg.max_streams_before_throttle, cfg.rclone.throttle_speeds.clone());
    let mut state = ThrottleState::default();

    while run.load(Ordering::SeqCst) {
        match plex.get_streams() {
            Err(e) => {
                tracing::error!(
                    "failed to check media server streams: {}, retrying in {}s",
                    e,
                    cfg.poll_interval
                );
            }
            Ok(streams) => {
                let active = count_active(&streams, cfg.ignore_local_streams);
                let server_active = state
                    .speed
                    .as_deref()
                    .map(|speed| rc.throttle_active(speed))
                    .unwrap_or(false);
                match decider.decide(&state, active, server_active) {
                    ThrottleCmd::Throttle(speed) => {
                        tracing::info!(
                            "{} active stream(s), throttling upload to {}",
                            active,
                            speed
                        );
                        for stream in &streams {
                            tracing::debug!("{}", stream);
                        }
                        match rc.set_bwlimit(&speed) {
                            Ok(()) => {
                                if cfg.notifications {
                                    notify.send(&format!(
                                        "Throttled current upload to {} because of {} playing stream(s)",
                                        speed, active
                                    ));
                                }
                                state = ThrottleState { throttled: true, speed: Some(speed) };
                            }
                            Err(e) => tracing::warn!("throttle request failed: {}", e),
                        }
                    }
                    ThrottleCmd::Unthrottle => {
                        tracing::info!(
                            "fewer than {} active stream(s), removing throttle",
                            decider.threshold
                        );
                        match rc.set_bwlimit("off") {
                            Ok(()) => {
                                if cfg.notifications {
                                    notify.send(
                                        "Un-throttled current upload, stream count dropped below the threshold",
                                    );
                                }
                                state = ThrottleState::default();
                            }
                            Err(e) => tracing::warn!("un-throttle request failed: {}", e),
                        }
                    }
                    ThrottleCmd::Keep => {
                        if state.throttled {
                            tracing::debug!(
                                "{} active stream(s), keeping throttle at {:?}",
                                active,
                                state.speed
                            );
                        }
                    }
                }
            }
        }
        interruptible_sleep(cfg.poll_interval, &run);
    }

    // never leave a limit behind once the upload is over
    if state.throttled && rc.set_bwlimit("off").is_err() {
        tracing::warn!("could not clear bandwidth limit at monitor shutdown");
    }
    tracing::info!("finished monitoring media server streams");
}

#[cfg(test)]
mod tests {
    use super::*;

    fn decider() -> ThrottleDecider {
        ThrottleDecider::new(1, vec!["10M".into(), "5M".into(), "1M".into()])
    }

    fn apply(state: &mut ThrottleState, cmd: &ThrottleCmd) {
        match cmd {
            ThrottleCmd::Throttle(speed) => {
                *state = ThrottleState { throttled: true, speed: Some(speed.clone()) };
            }
            ThrottleCmd::Unthrottle => *state = ThrottleState::default(),
            ThrottleCmd::Keep => {}
        }
    }

    #[test]
    fn stream_sequence_walks_the_speed_ladder() {
        let decider = decider();
        let mut state = ThrottleState::default();
        let mut issued = Vec::new();
        for active in [0usize, 1, 2, 3, 1, 0] {
            let cmd = decider.decide(&state, active, state.throttled);
            if cmd != ThrottleCmd::Keep {
                issued.push(cmd.clone());
            }
            apply(&mut state, &cmd);
        }
        assert_eq!(
            issued,
            vec![
                ThrottleCmd::Throttle("10M".into()),
                ThrottleCmd::Throttle("5M".into()),
                ThrottleCmd::Throttle("1M".into()),
                ThrottleCmd::Throttle("10M".into()),
                ThrottleCmd::Unthrottle,
            ]
        );
    }

    #[test]
    fn reissues_when_server_lost_the_limit() {
        let decider = decider();
        let state = ThrottleState { throttled: true, speed: Some("5M".into()) };
        // same stream count, but the server no longer reports our limit
        let cmd = decider.decide(&state, 2, false);
        assert_eq!(cmd, ThrottleCmd::Throttle("5M".into()));
        // server still carries it -> nothing to do
        assert_eq!(decider.decide(&state, 2, true), ThrottleCmd::Keep);
    }

    #[test]
    fn local_streams_respect_ignore_flag() {
        let streams = vec![
            StreamSession { state: "playing".into(), local: true },
            StreamSession { state: "playing".into(), local: false },
            StreamSession { state: "paused".into(), local: false },
        ];
        assert_eq!(count_active(&streams, true), 1);
        assert_eq!(count_active(&streams, false), 2);
    }

    #[test]
    fn below_threshold_without_throttle_is_a_noop() {
        let decider = ThrottleDecider::new(3, vec!["10M".into()]);
        let state = ThrottleState::default();
        assert_eq!(decider.decide(&state, 2, false), ThrottleCmd::Keep);
    }
}
