use std::path::Path;

use chrono::NaiveTime;

pub const GIB: u64 = 1024 * 1024 * 1024;

/// Seconds since the Unix epoch. All ledger timestamps use this clock.
pub fn unix_now() -> i64 {
    chrono::Utc::now().timestamp()
}

/// Convert a byte count into a human readable string using IEC units (KiB/MiB/GiB).
pub fn human_bytes(bytes: u64) -> String {
    const KB: f64 = 1024.0;
    const MB: f64 = KB * 1024.0;
    const GB: f64 = MB * 1024.0;
    let b = bytes as f64;
    if b >= GB {
        format!("{:.2} GiB", b / GB)
    } else if b >= MB {
        format!("{:.2} MiB", b / MB)
    } else if b >= KB {
        format!("{:.2} KiB", b / KB)
    } else {
        format!("{} B", bytes)
    }
}

/// Render a duration in seconds as a compact "2h 5m" style string.
pub fn human_duration(seconds: i64) -> String {
    let seconds = seconds.max(0);
    if seconds < 60 {
        format!("{}s", seconds)
    } else if seconds < 3600 {
        format!("{}m {}s", seconds / 60, seconds % 60)
    } else {
        format!("{}h {}m", seconds / 3600, (seconds % 3600) / 60)
    }
}

/// Render an epoch timestamp for log/notification output in local time.
pub fn format_ts(ts: i64) -> String {
    match chrono::DateTime::from_timestamp(ts, 0) {
        Some(dt) => dt.with_timezone(&chrono::Local).format("%Y-%m-%d %H:%M:%S").to_string(),
        None => ts.to_string(),
    }
}

// Sort key for credential files: first run of digits in the file name,
// ascending; names without digits sort last. Ties break lexicographically.
fn digit_key(path: &Path) -> (u64, String) {
    let name = path.file_name().map(|s| s.to_string_lossy().to_string()).unwrap_or_default();
    let mut digits = String::new();
    for c in name.chars() {
        if c.is_ascii_digit() {
            digits.push(c);
        } else if !digits.is_empty() {
            break;
        }
    }
    let num = digits.parse::<u64>().unwrap_or(u64::MAX);
    (num, path.to_string_lossy().to_string())
}

/// Sort paths by the digits embedded in their file names, ascending.
pub fn sorted_by_digit_asc(mut paths: Vec<std::path::PathBuf>) -> Vec<std::path::PathBuf> {
    paths.sort_by_key(|p| digit_key(p));
    paths
}

/// Pick the element whose index matches `num` counting from one, clamped to
/// the last element. `num` must be >= 1; used to map an active stream count
/// onto the configured throttle speed ladder.
pub fn nearest_less_element<'a>(data: &'a [String], num: usize) -> Option<&'a str> {
    if data.is_empty() || num == 0 {
        return None;
    }
    let idx = std::cmp::min(num, data.len()) - 1;
    data.get(idx).map(|s| s.as_str())
}

/// Whether `now` falls inside the `[from, until]` window. Windows may cross
/// midnight (e.g. 23:00 -> 06:00).
pub fn is_time_between(from: NaiveTime, until: NaiveTime, now: NaiveTime) -> bool {
    if from <= until { from <= now && now <= until } else { now >= from || now <= until }
}

/// Match a `size_excludes`-style pattern against a path fragment. `*`
/// covers any run of characters (including none), `?` exactly one; there
/// are no character classes. Runs in linear time with a single
/// backtracking anchor at the most recent `*`.
pub fn wildcard_match(pat: &str, text: &str) -> bool {
    let pattern: Vec<char> = pat.chars().collect();
    let hay: Vec<char> = text.chars().collect();
    let mut pi = 0;
    let mut hi = 0;
    // position to resume from when a literal mismatch forces the last
    // '*' to swallow one more character
    let mut anchor: Option<(usize, usize)> = None;

    while hi < hay.len() {
        match pattern.get(pi) {
            Some('*') => {
                anchor = Some((pi, hi));
                pi += 1;
            }
            Some(&c) if c == '?' || c == hay[hi] => {
                pi += 1;
                hi += 1;
            }
            _ => match anchor {
                Some((star, matched)) => {
                    pi = star + 1;
                    hi = matched + 1;
                    anchor = Some((star, matched + 1));
                }
                None => return false,
            },
        }
    }
    // only trailing stars may remain once the text is consumed
    pattern[pi..].iter().all(|&c| c == '*')
}

/// Whether a path names an rclone remote (`remote:path`) rather than a
/// local filesystem path. A Windows drive prefix ("C:\" or "C:/") is
/// local despite its colon.
pub fn is_remote_path(s: &str) -> bool {
    let head: Vec<char> = s.chars().take(3).collect();
    if let &[drive, ':', sep] = head.as_slice()
        && drive.is_ascii_alphabetic()
        && matches!(sep, '\\' | '/')
    {
        return false;
    }
    match (s.find(':'), s.find('/')) {
        (Some(colon), Some(slash)) => colon < slash,
        (Some(_), None) => true,
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    #[test]
    fn digit_sort_orders_by_embedded_number() {
        let paths = vec![
            PathBuf::from("/sa/sa-10.json"),
            PathBuf::from("/sa/sa-2.json"),
            PathBuf::from("/sa/sa-1.json"),
        ];
        let sorted = sorted_by_digit_asc(paths);
        let names: Vec<_> =
            sorted.iter().map(|p| p.file_name().unwrap().to_string_lossy().to_string()).collect();
        assert_eq!(names, vec!["sa-1.json", "sa-2.json", "sa-10.json"]);
    }

    #[test]
    fn digit_sort_breaks_ties_lexicographically() {
        let paths = vec![PathBuf::from("/sa/b1.json"), PathBuf::from("/sa/a1.json")];
        let sorted = sorted_by_digit_asc(paths);
        assert_eq!(sorted[0], PathBuf::from("/sa/a1.json"));
    }

    #[test]
    fn nearest_less_element_clamps_to_last() {
        let speeds = vec!["10M".to_string(), "5M".to_string(), "1M".to_string()];
        assert_eq!(nearest_less_element(&speeds, 1), Some("10M"));
        assert_eq!(nearest_less_element(&speeds, 2), Some("5M"));
        assert_eq!(nearest_less_element(&speeds, 3), Some("1M"));
        assert_eq!(nearest_less_element(&speeds, 9), Some("1M"));
        assert_eq!(nearest_less_element(&speeds, 0), None);
    }

    #[test]
    fn time_window_crossing_midnight() {
        let from = NaiveTime::from_hms_opt(23, 0, 0).unwrap();
        let until = NaiveTime::from_hms_opt(6, 0, 0).unwrap();
        assert!(is_time_between(from, until, NaiveTime::from_hms_opt(23, 30, 0).unwrap()));
        assert!(is_time_between(from, until, NaiveTime::from_hms_opt(2, 0, 0).unwrap()));
        assert!(!is_time_between(from, until, NaiveTime::from_hms_opt(12, 0, 0).unwrap()));
    }

    #[test]
    fn remote_path_detection() {
        assert!(is_remote_path("gdrive:/Media"));
        assert!(is_remote_path("gdrive:Media"));
        assert!(!is_remote_path("/mnt/local/Media"));
        assert!(!is_remote_path("C:\\Media"));
    }

    #[test]
    fn wildcard_matches_segments() {
        assert!(wildcard_match("*.partial~", "movie.mkv.partial~"));
        assert!(wildcard_match("downloads*", "downloads/incomplete"));
        assert!(!wildcard_match("*.nfo", "movie.mkv"));
    }

    #[test]
    fn wildcard_backtracks_and_handles_edge_patterns() {
        // the first '*' must give characters back for the tail to match
        assert!(wildcard_match("*session*.bak", "old-session-7.bak"));
        assert!(wildcard_match("ep??.mkv", "ep01.mkv"));
        assert!(!wildcard_match("ep??.mkv", "ep1.mkv"));
        assert!(wildcard_match("*", "anything"));
        assert!(wildcard_match("", ""));
        assert!(!wildcard_match("", "x"));
        assert!(wildcard_match("a*", "a"));
    }

    #[test]
    fn human_bytes_units() {
        assert_eq!(human_bytes(512), "512 B");
        assert_eq!(human_bytes(12 * GIB), "12.00 GiB");
    }
}
