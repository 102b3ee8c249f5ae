use serde::{Deserialize, Serialize};

use crate::ledger::Ledgers;
use crate::util::GIB;

/// Daily upload allowance per service account.
pub const DAILY_QUOTA: u64 = 750 * GIB;
pub const QUOTA_RESET_HOURS: i64 = 24;

/// Usage entry for one (uploader, identity) pair. `reset_time` is always
/// `first_upload + 24h`; the entry is purged once that passes.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct QuotaEntry {
    pub bytes: u64,
    pub reset_time: i64,
    pub first_upload: i64,
}

/// Remaining quota for an identity. An expired entry is purged and the
/// identity is back to full capacity.
pub fn remaining(ledgers: &Ledgers, uploader: &str, identity: &str, now: i64) -> u64 {
    let expired = ledgers.read_quota(|q| {
        q.get(uploader).and_then(|m| m.get(identity)).map(|e| now >= e.reset_time)
    });
    match expired {
        None => DAILY_QUOTA,
        Some(true) => {
            tracing::info!("quota period expired for {}, back to full capacity", identity);
            ledgers.with_quota(|q| {
                if let Some(m) = q.get_mut(uploader) {
                    m.remove(identity);
                    if m.is_empty() {
                        q.remove(uploader);
                    }
                }
            });
            DAILY_QUOTA
        }
        Some(false) => ledgers.read_quota(|q| {
            q.get(uploader)
                .and_then(|m| m.get(identity))
                .map(|e| DAILY_QUOTA.saturating_sub(e.bytes))
                .unwrap_or(DAILY_QUOTA)
        }),
    }
}

/// Charge uploaded bytes against an identity. The first charge of a period
/// stamps `reset_time = now + 24h`; accumulated bytes saturate at the
/// daily quota. Persisted on every call.
pub fn charge(ledgers: &Ledgers, uploader: &str, identity: &str, delta: u64, now: i64) {
    ledgers.with_quota(|q| {
        let entry = q
            .entry(uploader.to_string())
            .or_default()
            .entry(identity.to_string())
            .or_insert_with(|| QuotaEntry {
                bytes: 0,
                reset_time: now + QUOTA_RESET_HOURS * 3600,
                first_upload: now,
            });
        entry.bytes = std::cmp::min(entry.bytes.saturating_add(delta), DAILY_QUOTA);
        tracing::debug!(
            "quota for {}: {} / {}",
            identity,
            crate::util::human_bytes(entry.bytes),
            crate::util::human_bytes(DAILY_QUOTA)
        );
    });
}

/// Purge every expired quota entry. For each purged entry, an identity ban
/// that is exactly the entry's reset time was a quota ban and is lifted;
/// any other expiry belongs to a trigger and stays.
pub fn sweep(ledgers: &Ledgers, now: i64) {
    let purged: Vec<(String, String, i64)> = ledgers.with_quota(|q| {
        let mut purged = Vec::new();
        q.retain(|uploader, identities| {
            identities.retain(|identity, entry| {
                if now >= entry.reset_time {
                    tracing::info!("quota reset for {}", identity);
                    purged.push((uploader.clone(), identity.clone(), entry.reset_time));
                    false
                } else {
                    true
                }
            });
            !identities.is_empty()
        });
        purged
    });

    if purged.is_empty() {
        return;
    }
    ledgers.with_cache(|c| {
        for (uploader, identity, reset_time) in &purged {
            if let Some(bans) = c.sa_bans.get_mut(uploader)
                && bans.get(identity) == Some(&Some(*reset_time))
            {
                bans.insert(identity.clone(), None);
                tracing::info!("lifted quota ban for {}", identity);
            }
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::util::GIB;

    fn ledgers() -> (tempfile::TempDir, Ledgers) {
        let dir = tempfile::tempdir().expect("tempdir");
        let ledgers = Ledgers::open(dir.path());
        (dir, ledgers)
    }

    #[test]
    fn unknown_identity_has_full_quota() {
        let (_dir, ledgers) = ledgers();
        assert_eq!(remaining(&ledgers, "gdrive", "/sa/sa-1.json", 1000), DAILY_QUOTA);
    }

    #[test]
    fn charge_accumulates_and_saturates() {
        let (_dir, ledgers) = ledgers();
        charge(&ledgers, "gdrive", "/sa/sa-1.json", 12 * GIB, 1000);
        assert_eq!(remaining(&ledgers, "gdrive", "/sa/sa-1.json", 1001), DAILY_QUOTA - 12 * GIB);

        charge(&ledgers, "gdrive", "/sa/sa-1.json", DAILY_QUOTA, 1002);
        assert_eq!(remaining(&ledgers, "gdrive", "/sa/sa-1.json", 1003), 0);
        ledgers.read_quota(|q| {
            assert_eq!(q["gdrive"]["/sa/sa-1.json"].bytes, DAILY_QUOTA);
        });
    }

    #[test]
    fn entry_purged_once_reset_time_passes() {
        let (_dir, ledgers) = ledgers();
        charge(&ledgers, "gdrive", "/sa/sa-1.json", 100 * GIB, 1000);
        let reset = 1000 + QUOTA_RESET_HOURS * 3600;
        assert_eq!(remaining(&ledgers, "gdrive", "/sa/sa-1.json", reset - 1), DAILY_QUOTA - 100 * GIB);
        assert_eq!(remaining(&ledgers, "gdrive", "/sa/sa-1.json", reset), DAILY_QUOTA);
        ledgers.read_quota(|q| assert!(q.is_empty()));
    }

    #[test]
    fn sweep_lifts_only_quota_bans() {
        let (_dir, ledgers) = ledgers();
        charge(&ledgers, "gdrive", "/sa/sa-1.json", GIB, 1000);
        charge(&ledgers, "gdrive", "/sa/sa-2.json", GIB, 1000);
        let reset = 1000 + QUOTA_RESET_HOURS * 3600;
        ledgers.with_cache(|c| {
            let bans = c.sa_bans.entry("gdrive".into()).or_default();
            // sa-1 was banned for its quota reset, sa-2 by a trigger
            bans.insert("/sa/sa-1.json".into(), Some(reset));
            bans.insert("/sa/sa-2.json".into(), Some(reset + 999));
        });

        sweep(&ledgers, reset);
        ledgers.read_cache(|c| {
            assert_eq!(c.sa_bans["gdrive"]["/sa/sa-1.json"], None);
            assert_eq!(c.sa_bans["gdrive"]["/sa/sa-2.json"], Some(reset + 999));
        });
        ledgers.read_quota(|q| assert!(q.is_empty()));
    }

    #[test]
    fn sweep_is_idempotent() {
        let (_dir, ledgers) = ledgers();
        charge(&ledgers, "gdrive", "/sa/sa-1.json", GIB, 1000);
        let reset = 1000 + QUOTA_RESET_HOURS * 3600;
        sweep(&ledgers, reset);
        let first = ledgers.snapshot();
        sweep(&ledgers, reset);
        let second = ledgers.snapshot();
        assert_eq!(format!("{:?}", first), format!("{:?}", second));
    }
}
