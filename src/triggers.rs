use std::collections::BTreeMap;

use crate::config::TriggerConfig;

/// One configured abort trigger over the tool's output.
#[derive(Debug, Clone)]
pub struct TriggerDef {
    pub phrase: String,
    pub threshold: u32,
    pub window_secs: u64,
    pub sleep_hours: u32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TriggerHit {
    pub phrase: String,
    pub sleep_hours: u32,
}

#[derive(Debug, Default, Clone)]
struct Track {
    count: u32,
    expires: Option<i64>,
}

/// Sliding-window counter over trigger phrases. Each output line is
/// scanned against every definition in order; the first definition to
/// reach its threshold wins and scanning of that line stops.
pub struct TriggerTracker {
    defs: Vec<TriggerDef>,
    tracks: Vec<Track>,
}

impl TriggerTracker {
    pub fn new(defs: Vec<TriggerDef>) -> Self {
        let tracks = vec![Track::default(); defs.len()];
        Self { defs, tracks }
    }

    pub fn from_config(sleeps: &BTreeMap<String, TriggerConfig>) -> Self {
        let defs = sleeps
            .iter()
            .map(|(phrase, cfg)| TriggerDef {
                phrase: phrase.clone(),
                threshold: cfg.count,
                window_secs: cfg.timeout,
                sleep_hours: cfg.sleep,
            })
            .collect();
        Self::new(defs)
    }

    /// Feed one output line through the tracker.
    ///
    /// The first occurrence of a phrase only arms its window; the
    /// threshold is checked on subsequent occurrences, so a threshold of
    /// one still needs a second sighting inside the window.
    pub fn observe(&mut self, line: &str, now: i64) -> Option<TriggerHit> {
        let lowered = line.to_lowercase();
        for (def, track) in self.defs.iter().zip(self.tracks.iter_mut()) {
            if let Some(expires) = track.expires
                && now >= expires
            {
                tracing::warn!(
                    "trigger window for '{}' expired, resetting occurrence count",
                    def.phrase
                );
                track.count = 0;
                track.expires = None;
            }

            if !lowered.contains(&def.phrase.to_lowercase()) {
                continue;
            }

            if track.count == 0 {
                track.count = 1;
                track.expires = Some(now + def.window_secs as i64);
                tracing::warn!(
                    "first occurrence of trigger '{}', window closes at {}",
                    def.phrase,
                    crate::util::format_ts(now + def.window_secs as i64)
                );
            } else {
                track.count += 1;
                tracing::warn!(
                    "trigger '{}' seen {}/{} times within {}s",
                    def.phrase,
                    track.count,
                    def.threshold,
                    def.window_secs
                );
                if track.count >= def.threshold {
                    tracing::warn!(
                        "trigger '{}' reached its limit of {} occurrences, aborting upload",
                        def.phrase,
                        def.threshold
                    );
                    return Some(TriggerHit {
                        phrase: def.phrase.clone(),
                        sleep_hours: def.sleep_hours,
                    });
                }
            }
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tracker(phrase: &str, threshold: u32, window: u64, sleep: u32) -> TriggerTracker {
        TriggerTracker::new(vec![TriggerDef {
            phrase: phrase.to_string(),
            threshold,
            window_secs: window,
            sleep_hours: sleep,
        }])
    }

    #[test]
    fn fires_after_threshold_inside_window() {
        let mut t = tracker("userRateLimitExceeded", 3, 60, 25);
        assert_eq!(t.observe("ERROR: userRateLimitExceeded", 0), None);
        assert_eq!(t.observe("ERROR: userRateLimitExceeded", 10), None);
        let hit = t.observe("ERROR: userRateLimitExceeded", 20).expect("third hit fires");
        assert_eq!(hit, TriggerHit { phrase: "userRateLimitExceeded".into(), sleep_hours: 25 });
    }

    #[test]
    fn expired_window_resets_instead_of_firing() {
        let mut t = tracker("rateLimitExceeded", 3, 60, 25);
        assert_eq!(t.observe("rateLimitExceeded", 0), None);
        assert_eq!(t.observe("rateLimitExceeded", 10), None);
        // window closed at t=60; this occurrence re-arms rather than fires
        assert_eq!(t.observe("rateLimitExceeded", 60), None);
        assert_eq!(t.observe("rateLimitExceeded", 61), None);
        assert!(t.observe("rateLimitExceeded", 62).is_some());
    }

    #[test]
    fn matching_is_case_insensitive_across_whole_phrase() {
        let mut t = tracker("UserRateLimitExceeded", 2, 60, 25);
        assert_eq!(t.observe("info: USERRATELIMITEXCEEDED", 0), None);
        assert!(t.observe("info: userratelimitexceeded", 1).is_some());
    }

    #[test]
    fn threshold_of_one_still_needs_a_second_sighting() {
        let mut t = tracker("Failed to copy", 1, 60, 2);
        assert_eq!(t.observe("Failed to copy: file.mkv", 0), None);
        assert!(t.observe("Failed to copy: other.mkv", 1).is_some());
    }

    #[test]
    fn first_trigger_to_fire_wins_on_a_shared_line() {
        let mut t = TriggerTracker::new(vec![
            TriggerDef { phrase: "alpha".into(), threshold: 2, window_secs: 60, sleep_hours: 1 },
            TriggerDef { phrase: "beta".into(), threshold: 2, window_secs: 60, sleep_hours: 9 },
        ]);
        assert_eq!(t.observe("alpha beta", 0), None);
        let hit = t.observe("alpha beta", 1).expect("both armed, first wins");
        assert_eq!(hit.phrase, "alpha");
        assert_eq!(hit.sleep_hours, 1);
    }

    #[test]
    fn non_matching_lines_leave_state_alone() {
        let mut t = tracker("quotaExceeded", 2, 60, 25);
        assert_eq!(t.observe("quotaExceeded", 0), None);
        assert_eq!(t.observe("all good here", 1), None);
        assert!(t.observe("quotaExceeded", 2).is_some());
    }
}
