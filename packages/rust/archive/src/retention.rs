//! Retention compaction of a [`DatedArchive`].
//!
//! Dates fall into three bands relative to today:
//! - recent: `d + keep_last_days >= today`, always kept
//! - old: `d + keep_last_days * 7 <= today`, always deleted
//! - middle: everything else, thinned to weekly snapshots
//!
//! Middle dates are walked in ascending order. The earliest seeds the
//! weekly chain and each later date is kept only when it is at least seven
//! days after the last kept one. At most `keep_weeklies` weekly dates
//! survive; surplus is dropped from the oldest end.

use chrono::{Duration, NaiveDate};
use gtfs_etl_shared::Result;
use serde::Serialize;
use tracing::{info, instrument};

use crate::DatedArchive;

/// How much history to keep.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetentionPolicy {
    pub keep_last_days: u32,
    pub keep_weeklies: u32,
}

/// Per-category decision for every archived date.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RetentionPlan {
    pub keep_recent: Vec<NaiveDate>,
    pub keep_weekly: Vec<NaiveDate>,
    pub delete_old: Vec<NaiveDate>,
    pub delete_thinned: Vec<NaiveDate>,
}

impl RetentionPlan {
    /// Decide the fate of each date in `dates` as of `today`.
    pub fn new(dates: &[NaiveDate], today: NaiveDate, policy: RetentionPolicy) -> Self {
        let recent_days = Duration::days(i64::from(policy.keep_last_days));
        let old_days = Duration::days(i64::from(policy.keep_last_days) * 7);

        let mut plan = Self::default();
        let mut middle = Vec::new();
        for &date in dates {
            if date + recent_days >= today {
                plan.keep_recent.push(date);
            } else if date + old_days <= today {
                plan.delete_old.push(date);
            } else {
                middle.push(date);
            }
        }

        middle.sort();
        let mut last_weekly: Option<NaiveDate> = None;
        for date in middle {
            match last_weekly {
                Some(last) if last + Duration::days(7) > date => plan.delete_thinned.push(date),
                _ => {
                    plan.keep_weekly.push(date);
                    last_weekly = Some(date);
                }
            }
        }

        let limit = policy.keep_weeklies as usize;
        if plan.keep_weekly.len() > limit {
            let surplus = plan.keep_weekly.len() - limit;
            plan.delete_thinned.extend(plan.keep_weekly.drain(..surplus));
            plan.delete_thinned.sort();
        }
        plan
    }

    /// Dates to delete, in ascending order.
    pub fn to_delete(&self) -> Vec<NaiveDate> {
        let mut dates: Vec<_> = self
            .delete_old
            .iter()
            .chain(&self.delete_thinned)
            .copied()
            .collect();
        dates.sort();
        dates
    }

    pub fn stats(&self) -> CompactionStats {
        CompactionStats {
            kept_recent: self.keep_recent.len(),
            kept_weekly: self.keep_weekly.len(),
            deleted_old: self.delete_old.len(),
            deleted_thinned: self.delete_thinned.len(),
        }
    }
}

/// Counts per retention category.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CompactionStats {
    pub kept_recent: usize,
    pub kept_weekly: usize,
    pub deleted_old: usize,
    pub deleted_thinned: usize,
}

impl CompactionStats {
    pub fn deleted(&self) -> usize {
        self.deleted_old + self.deleted_thinned
    }
}

/// Apply the retention policy to `archive`. Deletion is recursive and
/// irreversible; every deleted date is logged.
#[instrument(skip_all, fields(root = %archive.root().display(), %today))]
pub fn compact(archive: &DatedArchive, policy: RetentionPolicy, today: NaiveDate) -> Result<CompactionStats> {
    let dates = archive.dates()?;
    let plan = RetentionPlan::new(&dates, today, policy);

    for date in plan.to_delete() {
        info!(%date, "deleting dated directory");
        archive.remove_date(date)?;
    }

    let stats = plan.stats();
    info!(
        kept_recent = stats.kept_recent,
        kept_weekly = stats.kept_weekly,
        deleted_old = stats.deleted_old,
        deleted_thinned = stats.deleted_thinned,
        "retention compaction complete"
    );
    Ok(stats)
}

#[cfg(test)]
mod tests {
    use crate::test_support::temp_root;

    use super::*;

    const POLICY: RetentionPolicy = RetentionPolicy {
        keep_last_days: 5,
        keep_weeklies: 4,
    };

    fn today() -> NaiveDate {
        NaiveDate::from_ymd_opt(2024, 6, 30).unwrap()
    }

    fn history(days: i64) -> Vec<NaiveDate> {
        (0..days).map(|n| today() - Duration::days(n)).collect()
    }

    #[test]
    fn long_history_is_bounded() {
        let dates = history(400);
        let plan = RetentionPlan::new(&dates, today(), POLICY);

        // The most recent dates are always kept.
        for n in 0..5 {
            assert!(plan.keep_recent.contains(&(today() - Duration::days(n))));
        }

        // Weekly snapshots are bounded and spaced a week apart.
        assert!(plan.keep_weekly.len() <= 4);
        for pair in plan.keep_weekly.windows(2) {
            assert!(pair[1] - pair[0] >= Duration::days(7));
        }

        // Nothing 35 days or older survives.
        let cutoff = today() - Duration::days(35);
        for kept in plan.keep_recent.iter().chain(&plan.keep_weekly) {
            assert!(*kept > cutoff);
        }
        assert!(plan.delete_old.iter().all(|d| *d <= cutoff));

        let stats = plan.stats();
        assert_eq!(stats.kept_recent + stats.kept_weekly + stats.deleted(), 400);
    }

    #[test]
    fn earliest_middle_date_seeds_weekly_chain() {
        // Middle band is (today-35, today-5): 12 days apart, then 3 days later.
        let dates = vec![
            today() - Duration::days(30),
            today() - Duration::days(27),
            today() - Duration::days(18),
            today() - Duration::days(15),
        ];
        let plan = RetentionPlan::new(&dates, today(), POLICY);
        assert_eq!(
            plan.keep_weekly,
            vec![today() - Duration::days(30), today() - Duration::days(18)]
        );
        assert_eq!(
            plan.delete_thinned,
            vec![today() - Duration::days(27), today() - Duration::days(15)]
        );
        assert!(plan.delete_old.is_empty());
    }

    #[test]
    fn band_boundaries() {
        let plan = RetentionPlan::new(
            &[
                today() - Duration::days(5),
                today() - Duration::days(6),
                today() - Duration::days(34),
                today() - Duration::days(35),
            ],
            today(),
            POLICY,
        );
        assert_eq!(plan.keep_recent, vec![today() - Duration::days(5)]);
        assert_eq!(plan.delete_old, vec![today() - Duration::days(35)]);
        assert_eq!(
            plan.keep_weekly,
            vec![today() - Duration::days(34), today() - Duration::days(6)]
        );
    }

    #[test]
    fn compact_deletes_from_disk() {
        let root = temp_root("compact");
        let archive = DatedArchive::new(&root);
        for date in history(60) {
            let dir = archive.ensure_date_dir(date).unwrap();
            std::fs::write(dir.join("Tariff.zip"), b"zip").unwrap();
        }

        let stats = compact(&archive, POLICY, today()).unwrap();
        let remaining = archive.dates().unwrap();
        assert_eq!(remaining.len(), stats.kept_recent + stats.kept_weekly);
        assert_eq!(stats.deleted(), 60 - remaining.len());
        assert!(remaining.contains(&today()));
        assert!(!remaining.contains(&(today() - Duration::days(40))));

        // Running again is a no-op.
        let again = compact(&archive, POLICY, today()).unwrap();
        assert_eq!(again.deleted(), 0);
    }
}
