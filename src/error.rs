/// Repository-wide structured errors for the upload pipeline.
///
/// These model the outcomes the orchestrator has to make decisions on;
/// incidental IO failures stay as `anyhow` context chains.
#[derive(Debug, Clone)]
pub enum UploadError {
    /// The transfer tool could not be spawned at all (binary, reason).
    ToolSpawnFailed(String, String),
    /// The transfer tool exited with an unexpected code.
    ToolFailed(Option<i32>),
    /// A configured trigger phrase reached its occurrence threshold.
    TriggerAbort { phrase: String, sleep_hours: u32 },
    /// Every identity for the uploader is banned or out of quota.
    NoUsableIdentities { next_unban: Option<i64> },
    /// The transferred-set cache was written under a different uploader
    /// configuration and cannot be used for excludes.
    ConfigFingerprintMismatch(String),
    /// A ledger file could not be read or written (path, reason).
    LedgerIo(String, String),
    /// File-list generation for chunked mode exceeded its timeout.
    ListGenerationTimeout(u64),
    /// The transfer tool's remote-control endpoint did not respond.
    RemoteControlUnavailable(String),
    /// An uploader references a remote that is not configured.
    MissingRemote(String),
    /// Shutdown was requested while waiting on an advisory lock.
    LockInterrupted(String),
}

impl std::fmt::Display for UploadError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        use UploadError::*;
        match self {
            ToolSpawnFailed(bin, e) => write!(f, "failed to spawn transfer tool '{}': {}", bin, e),
            ToolFailed(code) => match code {
                Some(c) => write!(f, "transfer tool exited with code {}", c),
                None => write!(f, "transfer tool was killed by a signal"),
            },
            TriggerAbort { phrase, sleep_hours } => {
                write!(f, "trigger '{}' reached its limit, sleeping {} hour(s)", phrase, sleep_hours)
            }
            NoUsableIdentities { next_unban } => match next_unban {
                Some(ts) => write!(
                    f,
                    "no service accounts available, next unban at {}",
                    crate::util::format_ts(*ts)
                ),
                None => write!(f, "no service accounts available"),
            },
            ConfigFingerprintMismatch(name) => {
                write!(f, "transferred-files cache for '{}' was built under a different config", name)
            }
            LedgerIo(path, e) => write!(f, "ledger io error on {}: {}", path, e),
            ListGenerationTimeout(secs) => {
                write!(f, "file list generation timed out after {}s", secs)
            }
            RemoteControlUnavailable(url) => {
                write!(f, "transfer tool remote control at {} is unreachable", url)
            }
            MissingRemote(name) => write!(f, "no remote configured under the name '{}'", name),
            LockInterrupted(name) => write!(f, "shutdown requested while waiting on {} lock", name),
        }
    }
}

impl std::error::Error for UploadError {}

impl UploadError {
    /// Whether this error ends the whole uploader run. Ancillary paths
    /// (cache, chunker, remote control) degrade the run instead.
    pub fn is_fatal_for_run(&self) -> bool {
        use UploadError::*;
        match self {
            ToolSpawnFailed(_, _) | ToolFailed(_) | MissingRemote(_) | LockInterrupted(_) => true,
            TriggerAbort { .. } | NoUsableIdentities { .. } => false,
            ConfigFingerprintMismatch(_)
            | LedgerIo(_, _)
            | ListGenerationTimeout(_)
            | RemoteControlUnavailable(_) => false,
        }
    }

    /// Whether this error puts a timed ban on the identity that hit it.
    /// Plain tool failures deliberately do not ban anything.
    pub fn bans_identity(&self) -> bool {
        matches!(self, UploadError::TriggerAbort { .. })
    }
}
