use std::cmp::Ordering;
use std::fmt;

use chrono::{Duration, NaiveDateTime};
use serde::Serialize;

use crate::model::{OrgStatus, Platform, TimestampId, TrackedOrg};

/// How recently an org was scanned.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Staleness {
    Current,
    Stale,
    Never,
    Archived,
}

impl Staleness {
    pub fn as_str(&self) -> &'static str {
        match self {
            Staleness::Current => "current",
            Staleness::Stale => "stale",
            Staleness::Never => "never",
            Staleness::Archived => "archived",
        }
    }

    /// Dashboard position: work that needs attention first, archived last.
    fn rank(&self) -> u8 {
        match self {
            Staleness::Stale => 0,
            Staleness::Never => 1,
            Staleness::Current => 2,
            Staleness::Archived => 3,
        }
    }
}

impl fmt::Display for Staleness {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

pub fn staleness(org: &TrackedOrg, stale_days: u32, now: NaiveDateTime) -> Staleness {
    if org.status == OrgStatus::Archived {
        return Staleness::Archived;
    }
    match org.last_scan {
        None => Staleness::Never,
        Some(last) if last.age(now) > Duration::days(i64::from(stale_days)) => Staleness::Stale,
        Some(_) => Staleness::Current,
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DashboardRow {
    pub org: String,
    pub platform: Platform,
    pub last_scan: Option<TimestampId>,
    pub scan_count: u64,
    pub status: OrgStatus,
    pub staleness: Staleness,
    /// Whole days since the last scan.
    pub age_days: Option<i64>,
}

pub fn dashboard(orgs: &[TrackedOrg], stale_days: u32, now: NaiveDateTime) -> Vec<DashboardRow> {
    let mut rows: Vec<DashboardRow> = orgs
        .iter()
        .map(|org| DashboardRow {
            org: org.name.clone(),
            platform: org.platform,
            last_scan: org.last_scan,
            scan_count: org.scan_count,
            status: org.status,
            staleness: staleness(org, stale_days, now),
            age_days: org.last_scan.map(|ts| ts.age(now).num_days()),
        })
        .collect();
    rows.sort_by(|a, b| match a.staleness.rank().cmp(&b.staleness.rank()) {
        Ordering::Equal => a.org.cmp(&b.org),
        other => other,
    });
    rows
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;

    fn at(y: i32, m: u32, d: u32) -> NaiveDateTime {
        NaiveDate::from_ymd_opt(y, m, d).unwrap().and_hms_opt(0, 0, 0).unwrap()
    }

    fn org(name: &str) -> TrackedOrg {
        TrackedOrg::new(name, Platform::Hackerone, None, NaiveDate::from_ymd_opt(2025, 1, 1).unwrap())
    }

    fn scanned(name: &str, ts: &str) -> TrackedOrg {
        let mut org = org(name);
        org.last_scan = Some(ts.parse().unwrap());
        org.scan_count = 1;
        org
    }

    #[test]
    fn test_fresh_org_is_never() {
        assert_eq!(staleness(&org("acme"), 7, at(2025, 1, 2)), Staleness::Never);
    }

    #[test]
    fn test_stale_threshold() {
        let acme = scanned("acme", "2025-01-01-0900");
        assert_eq!(staleness(&acme, 7, at(2025, 1, 10)), Staleness::Stale);
        assert_eq!(staleness(&acme, 7, at(2025, 1, 3)), Staleness::Current);

        // exactly seven days is not yet stale
        let edge = at(2025, 1, 8).date().and_hms_opt(9, 0, 0).unwrap();
        assert_eq!(staleness(&acme, 7, edge), Staleness::Current);
        assert_eq!(staleness(&acme, 7, edge + Duration::minutes(1)), Staleness::Stale);
    }

    #[test]
    fn test_largest_threshold_is_never_stale() {
        let acme = scanned("acme", "2025-01-01-0900");
        assert_eq!(staleness(&acme, u32::MAX, at(2025, 1, 10)), Staleness::Current);
        assert_eq!(staleness(&acme, 0, at(2025, 1, 1).date().and_hms_opt(9, 1, 0).unwrap()), Staleness::Stale);
    }

    #[test]
    fn test_archived_wins_over_age() {
        let mut acme = scanned("acme", "2024-01-01-0900");
        acme.apply_status(OrgStatus::Archived, NaiveDate::from_ymd_opt(2025, 1, 1).unwrap());
        assert_eq!(staleness(&acme, 7, at(2025, 1, 10)), Staleness::Archived);
    }

    #[test]
    fn test_dashboard_ordering() {
        let mut old = scanned("zeta", "2024-06-01-0900");
        old.apply_status(OrgStatus::Archived, NaiveDate::from_ymd_opt(2025, 1, 1).unwrap());
        let orgs = vec![
            old,
            scanned("beta", "2025-01-09-0900"),
            org("gamma"),
            scanned("delta", "2024-12-01-0900"),
            scanned("alpha", "2024-12-02-0900"),
            org("epsilon"),
        ];
        let rows = dashboard(&orgs, 7, at(2025, 1, 10));
        let names: Vec<&str> = rows.iter().map(|r| r.org.as_str()).collect();
        assert_eq!(names, ["alpha", "delta", "epsilon", "gamma", "beta", "zeta"]);
        assert_eq!(rows[4].age_days, Some(0));
        assert_eq!(rows[2].age_days, None);
    }
}
