//! Retention policies (§4.3, §8): Simple (keep newest N) and
//! Grandfather-Father-Son (daily/weekly/monthly/yearly bucketing).
//!
//! Both policies operate purely on bundle names and their parsed
//! timestamps — no filesystem access — so they can be planned and tested
//! without a real storage backend.

use crate::config::{GfsCounts, RetentionPolicyKind};
use chrono::{Datelike, NaiveDateTime};
use std::collections::HashSet;

#[derive(Debug, Clone)]
pub struct RetainedBundle {
    pub name: String,
    pub timestamp: Option<NaiveDateTime>,
}

#[derive(Debug, Default)]
pub struct RetentionPlan {
    pub keep: Vec<String>,
    pub remove: Vec<String>,
}

/// Parses `backup-<host>-<yyyymmdd>-<HHMMSS>` into a timestamp. Hosts may
/// contain hyphens; only the trailing date/time pair is significant.
pub fn parse_bundle_timestamp(name: &str) -> Option<NaiveDateTime> {
    let parts: Vec<&str> = name.rsplitn(3, '-').collect();
    if parts.len() < 3 {
        return None;
    }
    let time_part = parts[0];
    let date_part = parts[1];
    if date_part.len() != 8 || time_part.len() != 6 {
        return None;
    }
    let combined = format!("{date_part}{time_part}");
    NaiveDateTime::parse_from_str(&combined, "%Y%m%d%H%M%S").ok()
}

fn sorted_desc(names: &[String]) -> Vec<RetainedBundle> {
    let mut bundles: Vec<RetainedBundle> = names
        .iter()
        .map(|n| RetainedBundle {
            name: n.clone(),
            timestamp: parse_bundle_timestamp(n),
        })
        .collect();

    // Newest first; ties broken by lexicographically greater filename (§4.3,
    // §8) so that two backups sharing a second-resolution timestamp still
    // resolve deterministically.
    bundles.sort_by(|a, b| match (a.timestamp, b.timestamp) {
        (Some(ta), Some(tb)) => tb.cmp(&ta).then_with(|| b.name.cmp(&a.name)),
        (Some(_), None) => std::cmp::Ordering::Less,
        (None, Some(_)) => std::cmp::Ordering::Greater,
        (None, None) => b.name.cmp(&a.name),
    });
    bundles
}

/// Plans a Simple retention: keep the `keep` newest by timestamp (ties by
/// lexicographically greatest name), delete the rest.
pub fn plan_simple(names: &[String], keep: usize) -> RetentionPlan {
    let bundles = sorted_desc(names);
    let mut plan = RetentionPlan::default();
    for (idx, b) in bundles.into_iter().enumerate() {
        if idx < keep {
            plan.keep.push(b.name);
        } else {
            plan.remove.push(b.name);
        }
    }
    plan
}

fn bucket_key(ts: &NaiveDateTime, granularity: Granularity) -> String {
    match granularity {
        Granularity::Weekly => {
            let iso = ts.iso_week();
            format!("{}-W{:02}", iso.year(), iso.week())
        }
        Granularity::Monthly => format!("{}-{:02}", ts.format("%Y"), ts.format("%m")),
        Granularity::Yearly => ts.format("%Y").to_string(),
    }
}

#[derive(Clone, Copy)]
enum Granularity {
    Weekly,
    Monthly,
    Yearly,
}

/// Applies one GFS tier to `remaining`: items whose bucket is among the
/// first `count` distinct buckets encountered (in newest-first order) are
/// kept (one representative per bucket, the newest); all other items in an
/// already-selected bucket are consumed (scheduled for removal); items in
/// buckets beyond the `count` limit are left untouched for the next tier.
/// `count == -1` means unlimited: every distinct bucket is kept and the
/// tier consumes the entire remaining list.
fn apply_tier(
    remaining: Vec<RetainedBundle>,
    count: i64,
    granularity: Granularity,
    keep: &mut Vec<String>,
    remove: &mut Vec<String>,
) -> Vec<RetainedBundle> {
    let mut seen_buckets: HashSet<String> = HashSet::new();
    let mut leftover = Vec::new();

    for bundle in remaining {
        let Some(ts) = bundle.timestamp else {
            // Unparseable names cannot be bucketed; treat as already-oldest
            // and pass through untouched rather than risk deleting by guess.
            leftover.push(bundle);
            continue;
        };
        let bucket = bucket_key(&ts, granularity);

        if seen_buckets.contains(&bucket) {
            remove.push(bundle.name);
        } else if count == -1 || (seen_buckets.len() as i64) < count {
            seen_buckets.insert(bucket);
            keep.push(bundle.name);
        } else {
            leftover.push(bundle);
        }
    }

    leftover
}

/// Plans a GFS retention per §4.3/§8: newest `d` daily, then newest `w`
/// distinct ISO-week buckets beyond the daily window, then `m` distinct
/// YYYY-MM buckets, then `y` distinct YYYY buckets. `-1` means unbounded for
/// that tier.
pub fn plan_gfs(names: &[String], counts: GfsCounts) -> RetentionPlan {
    let bundles = sorted_desc(names);
    let mut keep = Vec::new();
    let mut remove = Vec::new();

    let remaining = if counts.daily == -1 {
        for b in &bundles {
            keep.push(b.name.clone());
        }
        Vec::new()
    } else {
        let daily_count = counts.daily.max(0) as usize;
        let (daily, rest): (Vec<_>, Vec<_>) = {
            let mut iter = bundles.into_iter();
            let daily: Vec<_> = (&mut iter).take(daily_count).collect();
            let rest: Vec<_> = iter.collect();
            (daily, rest)
        };
        for b in daily {
            keep.push(b.name);
        }
        rest
    };

    let remaining = apply_tier(remaining, counts.weekly, Granularity::Weekly, &mut keep, &mut remove);
    let remaining = apply_tier(remaining, counts.monthly, Granularity::Monthly, &mut keep, &mut remove);
    let remaining = apply_tier(remaining, counts.yearly, Granularity::Yearly, &mut keep, &mut remove);

    for b in remaining {
        remove.push(b.name);
    }

    RetentionPlan { keep, remove }
}

/// Dispatches to the configured policy.
pub fn plan(names: &[String], policy: RetentionPolicyKind, simple_keep: usize, gfs: GfsCounts) -> RetentionPlan {
    match policy {
        RetentionPolicyKind::Simple => plan_simple(names, simple_keep),
        RetentionPolicyKind::Gfs => plan_gfs(names, gfs),
    }
}

/// Convenience wrapper used by `StorageTarget::apply_retention`'s default
/// impl and by tests that only need the plan, not a live target.
pub fn apply_retention(names: &[String], policy: RetentionPolicyKind, simple_keep: usize, gfs: GfsCounts) -> RetentionPlan {
    plan(names, policy, simple_keep, gfs)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn name(day: &str, time: &str) -> String {
        format!("backup-testhost-{day}-{time}")
    }

    #[test]
    fn simple_keeps_newest_n_with_filename_tiebreak() {
        let names = vec![
            name("20240101", "120000"),
            name("20240102", "120000"),
            name("20240103", "120000"),
        ];
        let plan = plan_simple(&names, 2);
        assert_eq!(plan.keep.len(), 2);
        assert!(plan.keep.contains(&name("20240103", "120000")));
        assert!(plan.keep.contains(&name("20240102", "120000")));
        assert_eq!(plan.remove, vec![name("20240101", "120000")]);
    }

    #[test]
    fn simple_tie_break_is_lexicographic_descending() {
        let names = vec![
            format!("backup-aaa-20240101-120000"),
            format!("backup-zzz-20240101-120000"),
        ];
        let plan = plan_simple(&names, 1);
        assert_eq!(plan.keep, vec!["backup-zzz-20240101-120000".to_string()]);
    }

    #[test]
    fn gfs_retains_one_representative_per_bucket_beyond_daily_window() {
        // 10 consecutive daily backups; daily window keeps the newest 3,
        // the remaining 7 span at least two ISO weeks.
        let mut names = Vec::new();
        for day in 1..=10 {
            names.push(name(&format!("202401{:02}", day), "080000"));
        }
        let counts = GfsCounts {
            daily: 3,
            weekly: 2,
            monthly: 0,
            yearly: 0,
        };
        let result = plan_gfs(&names, counts);
        assert_eq!(result.keep.len(), 3 + 2);
        assert!(result.keep.contains(&name("20240110", "080000")));
    }

    #[test]
    fn gfs_unbounded_tier_keeps_every_distinct_bucket() {
        let names = vec![
            name("20230101", "080000"),
            name("20220101", "080000"),
            name("20210101", "080000"),
        ];
        let counts = GfsCounts {
            daily: 0,
            weekly: 0,
            monthly: 0,
            yearly: -1,
        };
        let result = plan_gfs(&names, counts);
        assert_eq!(result.keep.len(), 3);
        assert!(result.remove.is_empty());
    }

    #[test]
    fn gfs_never_double_counts_a_bundle() {
        let mut names = Vec::new();
        for day in 1..=30 {
            names.push(name(&format!("2024{:02}{:02}", (day / 28) + 1, (day % 28) + 1), "080000"));
        }
        let counts = GfsCounts {
            daily: 7,
            weekly: 4,
            monthly: 6,
            yearly: 2,
        };
        let result = plan_gfs(&names, counts);
        let mut all: Vec<&String> = result.keep.iter().chain(result.remove.iter()).collect();
        let total_before_dedup = all.len();
        all.sort();
        all.dedup();
        assert_eq!(all.len(), total_before_dedup);
        assert_eq!(total_before_dedup, names.len());
    }
}
