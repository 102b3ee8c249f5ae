use std::path::Path;

use anyhow::Result;

use crate::ledger::Ledgers;
use crate::quota;
use crate::util::GIB;

/// Identities with this much quota or less are not worth starting a stage
/// with; they are parked until their quota resets.
const MIN_USABLE_QUOTA: u64 = GIB;

/// Discover credential files for an uploader: every `*.json` under the
/// configured directory, ordered by the digits embedded in the file name.
pub fn discover_identities(dir: &Path) -> Result<Vec<String>> {
    let mut found = Vec::new();
    for entry in std::fs::read_dir(dir)? {
        let entry = entry?;
        let path = entry.path();
        if path.is_file() && path.extension().is_some_and(|e| e == "json") {
            found.push(path);
        }
    }
    Ok(crate::util::sorted_by_digit_asc(found)
        .into_iter()
        .map(|p| p.to_string_lossy().to_string())
        .collect())
}

/// Bring the ban ledger in line with what is on disk: drop identities that
/// moved away or vanished, register new ones unbanned, and lift the
/// uploader's own ban when fresh identities appeared.
pub fn reconcile(ledgers: &Ledgers, uploader: &str, dir: &Path) -> Result<Vec<String>> {
    let discovered = discover_identities(dir)?;
    let dir_prefix = dir.to_string_lossy().to_string();
    let mut added = 0usize;

    ledgers.with_cache(|c| {
        let bans = c.sa_bans.entry(uploader.to_string()).or_default();
        bans.retain(|identity, _| {
            let keep = identity.starts_with(&dir_prefix) && Path::new(identity).exists();
            if !keep {
                tracing::debug!("dropping stale service account '{}' for {}", identity, uploader);
            }
            keep
        });
        for identity in &discovered {
            if !bans.contains_key(identity) {
                tracing::debug!("registered new service account '{}' for {}", identity, uploader);
                bans.insert(identity.clone(), None);
                added += 1;
            }
        }
        if added > 0 && c.uploader_bans.remove(uploader).is_some() {
            tracing::info!("new service accounts for {}, lifting uploader suspension", uploader);
        }
    });
    Ok(discovered)
}

/// Lift identity bans whose expiry has passed.
pub fn clear_expired_identity_bans(ledgers: &Ledgers, uploader: &str, now: i64) {
    ledgers.with_cache(|c| {
        if let Some(bans) = c.sa_bans.get_mut(uploader) {
            for (identity, ban) in bans.iter_mut() {
                if let Some(expiry) = *ban
                    && now > expiry
                {
                    tracing::debug!("ban expired for service account '{}'", identity);
                    *ban = None;
                }
            }
        }
    });
}

/// Identities ready for a stage run, in digit order: quota ledger swept,
/// expired bans lifted, banned identities skipped, and identities at or
/// below the minimum quota parked until their reset time.
pub fn usable_identities(ledgers: &Ledgers, uploader: &str, now: i64) -> Vec<String> {
    quota::sweep(ledgers, now);
    clear_expired_identity_bans(ledgers, uploader, now);

    let unbanned: Vec<String> = ledgers.read_cache(|c| {
        c.sa_bans
            .get(uploader)
            .map(|bans| {
                bans.iter().filter(|(_, ban)| ban.is_none()).map(|(id, _)| id.clone()).collect()
            })
            .unwrap_or_default()
    });

    let mut usable = Vec::new();
    for identity in unbanned {
        let left = quota::remaining(ledgers, uploader, &identity, now);
        if left <= MIN_USABLE_QUOTA {
            tracing::warn!(
                "service account '{}' has only {} left, parking until quota reset",
                identity,
                crate::util::human_bytes(left)
            );
            let reset = ledgers.read_quota(|q| {
                q.get(uploader).and_then(|m| m.get(&identity)).map(|e| e.reset_time)
            });
            if let Some(reset) = reset {
                ban_identity(ledgers, uploader, &identity, reset);
            }
            continue;
        }
        usable.push(identity);
    }
    let paths = usable.into_iter().map(std::path::PathBuf::from).collect();
    crate::util::sorted_by_digit_asc(paths).into_iter().map(|p| p.to_string_lossy().to_string()).collect()
}

pub fn ban_identity(ledgers: &Ledgers, uploader: &str, identity: &str, until: i64) {
    ledgers.with_cache(|c| {
        c.sa_bans.entry(uploader.to_string()).or_default().insert(identity.to_string(), Some(until));
    });
}

pub fn clear_identity_ban(ledgers: &Ledgers, uploader: &str, identity: &str) {
    ledgers.with_cache(|c| {
        if let Some(bans) = c.sa_bans.get_mut(uploader) {
            bans.insert(identity.to_string(), None);
        }
    });
}

/// Earliest moment any banned identity of this uploader becomes usable.
pub fn min_ban_expiry(ledgers: &Ledgers, uploader: &str) -> Option<i64> {
    ledgers.read_cache(|c| {
        c.sa_bans.get(uploader).and_then(|bans| bans.values().filter_map(|b| *b).min())
    })
}

/// Suspend the uploader until its first identity comes back. Returns the
/// chosen expiry, if any ban exists to derive one from.
pub fn suspend_uploader(ledgers: &Ledgers, uploader: &str) -> Option<i64> {
    let expiry = min_ban_expiry(ledgers, uploader)?;
    ledgers.set_uploader_ban(uploader, expiry);
    Some(expiry)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::quota::QUOTA_RESET_HOURS;

    fn ledgers() -> (tempfile::TempDir, Ledgers) {
        let dir = tempfile::tempdir().expect("tempdir");
        let ledgers = Ledgers::open(dir.path());
        (dir, ledgers)
    }

    fn touch(dir: &Path, name: &str) -> String {
        let path = dir.join(name);
        std::fs::write(&path, "{}").expect("write credential");
        path.to_string_lossy().to_string()
    }

    #[test]
    fn reconcile_registers_discovered_accounts_in_digit_order() {
        let (_state, ledgers) = ledgers();
        let sa_dir = tempfile::tempdir().expect("tempdir");
        touch(sa_dir.path(), "sa-10.json");
        touch(sa_dir.path(), "sa-2.json");
        touch(sa_dir.path(), "notes.txt");

        let discovered = reconcile(&ledgers, "gdrive", sa_dir.path()).expect("reconcile");
        assert_eq!(discovered.len(), 2);
        assert!(discovered[0].ends_with("sa-2.json"));
        assert!(discovered[1].ends_with("sa-10.json"));
    }

    #[test]
    fn reconcile_drops_vanished_accounts_and_lifts_uploader_ban() {
        let (_state, ledgers) = ledgers();
        let sa_dir = tempfile::tempdir().expect("tempdir");
        ledgers.with_cache(|c| {
            c.sa_bans
                .entry("gdrive".into())
                .or_default()
                .insert("/gone/sa-1.json".into(), Some(999));
        });
        ledgers.set_uploader_ban("gdrive", 999);
        touch(sa_dir.path(), "sa-1.json");

        reconcile(&ledgers, "gdrive", sa_dir.path()).expect("reconcile");
        ledgers.read_cache(|c| {
            let bans = &c.sa_bans["gdrive"];
            assert_eq!(bans.len(), 1);
            assert!(!bans.contains_key("/gone/sa-1.json"));
        });
        assert_eq!(ledgers.uploader_ban("gdrive"), None);
    }

    #[test]
    fn usable_skips_banned_until_expiry_passes() {
        let (_state, ledgers) = ledgers();
        ledgers.with_cache(|c| {
            let bans = c.sa_bans.entry("gdrive".into()).or_default();
            bans.insert("/sa/sa-1.json".into(), Some(1000));
            bans.insert("/sa/sa-2.json".into(), None);
        });
        assert_eq!(usable_identities(&ledgers, "gdrive", 500), vec!["/sa/sa-2.json".to_string()]);
        // ban expired -> both usable, digit order
        assert_eq!(
            usable_identities(&ledgers, "gdrive", 1001),
            vec!["/sa/sa-1.json".to_string(), "/sa/sa-2.json".to_string()]
        );
    }

    #[test]
    fn exactly_one_gib_remaining_disqualifies() {
        let (_state, ledgers) = ledgers();
        ledgers.with_cache(|c| {
            c.sa_bans.entry("gdrive".into()).or_default().insert("/sa/sa-1.json".into(), None);
        });
        crate::quota::charge(&ledgers, "gdrive", "/sa/sa-1.json", crate::quota::DAILY_QUOTA - GIB, 1000);

        let usable = usable_identities(&ledgers, "gdrive", 1001);
        assert!(usable.is_empty());
        // parked until the quota reset, not forever
        let reset = 1000 + QUOTA_RESET_HOURS * 3600;
        assert_eq!(min_ban_expiry(&ledgers, "gdrive"), Some(reset));
    }

    #[test]
    fn suspend_uploader_uses_lowest_identity_expiry() {
        let (_state, ledgers) = ledgers();
        ledgers.with_cache(|c| {
            let bans = c.sa_bans.entry("gdrive".into()).or_default();
            bans.insert("/sa/sa-1.json".into(), Some(2000));
            bans.insert("/sa/sa-2.json".into(), Some(1500));
        });
        assert_eq!(suspend_uploader(&ledgers, "gdrive"), Some(1500));
        assert_eq!(ledgers.uploader_ban("gdrive"), Some(1500));
    }
}
