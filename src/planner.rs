use crate::util::GIB;

/// Strategy tag for a stage, used in logs and notifications.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Strategy {
    AggressiveFreshSa,
    ModerateMidSa,
    CautiousLowQuota,
    ConservativeCleanup,
}

impl Strategy {
    pub fn as_str(&self) -> &'static str {
        match self {
            Strategy::AggressiveFreshSa => "aggressive_fresh_sa",
            Strategy::ModerateMidSa => "moderate_mid_sa",
            Strategy::CautiousLowQuota => "cautious_low_quota",
            Strategy::ConservativeCleanup => "conservative_cleanup",
        }
    }
}

/// Transfer-tool parameters for one stage. Byte values are floored to
/// whole GiB so they render cleanly as tool flags.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StagePlan {
    pub max_transfer: u64,
    pub max_size: u64,
    pub transfers: u32,
    pub order_by: Option<&'static str>,
    pub max_backlog: Option<u32>,
    pub strategy: Strategy,
}

fn frac(bytes: u64, percent: u64) -> u64 {
    let raw = (bytes as u128 * percent as u128 / 100) as u64;
    raw / GIB * GIB
}

/// Compute stage parameters from the remaining quota of the current
/// identity. Fresh accounts chase large files first with deep ordering;
/// as quota shrinks the plan narrows the size window and drops ordering
/// so the tool starts moving bytes immediately.
pub fn plan_stage(remaining: u64, daily_quota: u64) -> StagePlan {
    let percent = if daily_quota == 0 { 0 } else { (remaining as u128 * 100 / daily_quota as u128) as u64 };

    if percent >= 80 {
        StagePlan {
            max_transfer: frac(remaining, 50),
            max_size: frac(remaining, 80),
            transfers: 8,
            order_by: Some("size,desc"),
            max_backlog: Some(2000),
            strategy: Strategy::AggressiveFreshSa,
        }
    } else if percent >= 50 {
        StagePlan {
            max_transfer: frac(remaining, 60),
            max_size: frac(remaining, 50),
            transfers: 4,
            order_by: Some("size,desc"),
            max_backlog: Some(1000),
            strategy: Strategy::ModerateMidSa,
        }
    } else if percent >= 25 {
        StagePlan {
            max_transfer: frac(remaining, 70),
            max_size: frac(remaining, 30),
            transfers: 6,
            order_by: None,
            max_backlog: None,
            strategy: Strategy::CautiousLowQuota,
        }
    } else {
        StagePlan {
            max_transfer: frac(remaining, 80),
            max_size: frac(remaining, 20),
            transfers: 8,
            order_by: None,
            max_backlog: None,
            strategy: Strategy::ConservativeCleanup,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::quota::DAILY_QUOTA;

    #[test]
    fn fresh_account_plan() {
        let plan = plan_stage(750 * GIB, DAILY_QUOTA);
        assert_eq!(plan.max_transfer, 375 * GIB);
        assert_eq!(plan.max_size, 600 * GIB);
        assert_eq!(plan.transfers, 8);
        assert_eq!(plan.order_by, Some("size,desc"));
        assert_eq!(plan.max_backlog, Some(2000));
        assert_eq!(plan.strategy, Strategy::AggressiveFreshSa);
    }

    #[test]
    fn band_boundaries() {
        assert_eq!(plan_stage(600 * GIB, DAILY_QUOTA).strategy, Strategy::AggressiveFreshSa);
        assert_eq!(plan_stage(600 * GIB - 1, DAILY_QUOTA).strategy, Strategy::ModerateMidSa);
        assert_eq!(plan_stage(375 * GIB, DAILY_QUOTA).strategy, Strategy::ModerateMidSa);
        assert_eq!(plan_stage(375 * GIB - 1, DAILY_QUOTA).strategy, Strategy::CautiousLowQuota);
        // 187.5 GiB is the exact 25% edge
        assert_eq!(plan_stage(1875 * GIB / 10, DAILY_QUOTA).strategy, Strategy::CautiousLowQuota);
        assert_eq!(
            plan_stage(1875 * GIB / 10 - 1, DAILY_QUOTA).strategy,
            Strategy::ConservativeCleanup
        );
    }

    #[test]
    fn low_bands_drop_ordering_flags() {
        for remaining in [240 * GIB, 72 * GIB] {
            let plan = plan_stage(remaining, DAILY_QUOTA);
            assert!(plan.order_by.is_none(), "{:?}", plan.strategy);
            assert!(plan.max_backlog.is_none(), "{:?}", plan.strategy);
        }
    }

    #[test]
    fn mid_band_plan_values() {
        let plan = plan_stage(600 * GIB - GIB, DAILY_QUOTA);
        assert_eq!(plan.strategy, Strategy::ModerateMidSa);
        assert_eq!(plan.transfers, 4);
        assert_eq!(plan.max_backlog, Some(1000));
        // 59.9% of the daily quota: fractions apply to raw bytes, flags floor to GiB
        assert_eq!(plan.max_transfer, frac(599 * GIB, 60));
    }

    #[test]
    fn values_are_gib_aligned() {
        let plan = plan_stage(123_456_789_012, DAILY_QUOTA);
        assert_eq!(plan.max_transfer % GIB, 0);
        assert_eq!(plan.max_size % GIB, 0);
    }
}
