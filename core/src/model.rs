use std::fmt;
use std::str::FromStr;
use std::sync::OnceLock;

use chrono::{Duration, Local, NaiveDate, NaiveDateTime, Timelike};
use regex::Regex;
use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::error::{CatalogError, Op, Result};

/// Bug-bounty platform hosting an org's program.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Platform {
    Hackerone,
    Bugcrowd,
    Yeswehack,
    Intigriti,
}

impl Platform {
    pub const ALL: [Platform; 4] = [
        Platform::Hackerone,
        Platform::Bugcrowd,
        Platform::Yeswehack,
        Platform::Intigriti,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Platform::Hackerone => "hackerone",
            Platform::Bugcrowd => "bugcrowd",
            Platform::Yeswehack => "yeswehack",
            Platform::Intigriti => "intigriti",
        }
    }
}

impl fmt::Display for Platform {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Platform {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        let lower = s.trim().to_ascii_lowercase();
        Platform::ALL
            .into_iter()
            .find(|p| p.as_str() == lower)
            .ok_or_else(|| {
                format!(
                    "unknown platform '{}' (expected hackerone, bugcrowd, yeswehack or intigriti)",
                    s
                )
            })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OrgStatus {
    Active,
    Archived,
}

impl OrgStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            OrgStatus::Active => "active",
            OrgStatus::Archived => "archived",
        }
    }
}

impl fmt::Display for OrgStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for OrgStatus {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "active" => Ok(OrgStatus::Active),
            "archived" => Ok(OrgStatus::Archived),
            other => Err(format!("unknown status '{}' (expected active or archived)", other)),
        }
    }
}

const TIMESTAMP_FORMAT: &str = "%Y-%m-%d-%H%M";

/// Snapshot identifier with minute granularity, rendered as `YYYY-MM-DD-HHMM`.
///
/// Ordering is chronological, which matches the lexicographic order of the
/// rendered form.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct TimestampId(NaiveDateTime);

impl TimestampId {
    /// Truncates seconds and sub-seconds.
    pub fn from_datetime(at: NaiveDateTime) -> Self {
        let truncated = at
            .with_second(0)
            .and_then(|t| t.with_nanosecond(0))
            .unwrap_or(at);
        Self(truncated)
    }

    pub fn now(clock: &dyn Clock) -> Self {
        Self::from_datetime(clock.now())
    }

    pub fn datetime(&self) -> NaiveDateTime {
        self.0
    }

    pub fn date(&self) -> NaiveDate {
        self.0.date()
    }

    /// Time elapsed from this id until `now`; negative if `now` is earlier.
    pub fn age(&self, now: NaiveDateTime) -> Duration {
        now - self.0
    }
}

impl fmt::Display for TimestampId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.format(TIMESTAMP_FORMAT))
    }
}

impl FromStr for TimestampId {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        // chrono accepts unpadded fields; the id must stay sortable as text
        let shape_ok = s.len() == 15
            && s.char_indices().all(|(i, c)| match i {
                4 | 7 | 10 => c == '-',
                _ => c.is_ascii_digit(),
            });
        if !shape_ok {
            return Err(format!("invalid timestamp id '{}' (expected YYYY-MM-DD-HHMM)", s));
        }
        NaiveDateTime::parse_from_str(s, TIMESTAMP_FORMAT)
            .map(Self)
            .map_err(|e| format!("invalid timestamp id '{}': {}", s, e))
    }
}

impl Serialize for TimestampId {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for TimestampId {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        raw.parse().map_err(serde::de::Error::custom)
    }
}

/// Source of the current wall-clock time.
pub trait Clock: Send + Sync {
    fn now(&self) -> NaiveDateTime;

    fn today(&self) -> NaiveDate {
        self.now().date()
    }
}

pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> NaiveDateTime {
        Local::now().naive_local()
    }
}

/// Clock pinned to a fixed instant.
pub struct FixedClock(pub NaiveDateTime);

impl FixedClock {
    /// Midnight of the given day. Returns `None` for an impossible date.
    pub fn at_date(year: i32, month: u32, day: u32) -> Option<Self> {
        NaiveDate::from_ymd_opt(year, month, day)
            .and_then(|d| d.and_hms_opt(0, 0, 0))
            .map(Self)
    }
}

impl Clock for FixedClock {
    fn now(&self) -> NaiveDateTime {
        self.0
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TrackedOrg {
    pub name: String,
    pub platform: Platform,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub program_url: Option<String>,
    pub added_date: NaiveDate,
    #[serde(default)]
    pub last_scan: Option<TimestampId>,
    #[serde(default)]
    pub scan_count: u64,
    pub status: OrgStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub archived_date: Option<NaiveDate>,
}

impl TrackedOrg {
    pub fn new(name: &str, platform: Platform, program_url: Option<String>, today: NaiveDate) -> Self {
        Self {
            name: name.to_string(),
            platform,
            program_url,
            added_date: today,
            last_scan: None,
            scan_count: 0,
            status: OrgStatus::Active,
            archived_date: None,
        }
    }

    pub fn is_archived(&self) -> bool {
        self.status == OrgStatus::Archived
    }

    /// Applies a status change, keeping `archived_date` coupled to it.
    /// Returns `false` when the org already had that status.
    pub fn apply_status(&mut self, status: OrgStatus, today: NaiveDate) -> bool {
        if self.status == status {
            return false;
        }
        self.status = status;
        self.archived_date = match status {
            OrgStatus::Archived => Some(today),
            OrgStatus::Active => None,
        };
        true
    }
}

/// On-disk shape of `index.json`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct IndexDocument {
    #[serde(default)]
    pub tracked_orgs: Vec<TrackedOrg>,
}

impl IndexDocument {
    pub fn get(&self, name: &str) -> Option<&TrackedOrg> {
        self.tracked_orgs.iter().find(|o| o.name == name)
    }

    pub fn get_mut(&mut self, name: &str) -> Option<&mut TrackedOrg> {
        self.tracked_orgs.iter_mut().find(|o| o.name == name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.get(name).is_some()
    }

    /// Checks the invariants serde cannot express. Returns a description
    /// of the first violation.
    pub fn check_invariants(&self) -> std::result::Result<(), String> {
        let mut seen = std::collections::HashSet::new();
        for org in &self.tracked_orgs {
            if !seen.insert(org.name.as_str()) {
                return Err(format!("duplicate entry for org '{}'", org.name));
            }
            if !is_valid_name(&org.name) {
                return Err(format!("invalid org name '{}'", org.name));
            }
            if org.is_archived() != org.archived_date.is_some() {
                return Err(format!(
                    "org '{}' has status {} but archived_date {}",
                    org.name,
                    org.status,
                    org.archived_date
                        .map(|d| d.to_string())
                        .unwrap_or_else(|| "null".to_string())
                ));
            }
            if org.last_scan.is_some() != (org.scan_count > 0) {
                return Err(format!(
                    "org '{}' has scan_count {} inconsistent with last_scan",
                    org.name, org.scan_count
                ));
            }
        }
        Ok(())
    }
}

fn name_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"^[A-Za-z0-9_-]+$").expect("static pattern"))
}

pub fn is_valid_name(name: &str) -> bool {
    name_pattern().is_match(name)
}

/// Rejects org names outside `[A-Za-z0-9_-]+`. Names end up as directory
/// names, so this also rules out path traversal.
pub fn validate_name(action: &'static str, name: &str) -> Result<()> {
    if is_valid_name(name) {
        Ok(())
    } else {
        Err(CatalogError::InvalidName {
            action,
            org: name.to_string(),
        })
    }
}

/// Accepts absolute http(s) URLs only.
pub fn validate_program_url(op: Op<'_>, raw: &str) -> Result<String> {
    let parsed = url::Url::parse(raw)
        .map_err(|e| CatalogError::invalid(op, format!("invalid program url '{}': {}", raw, e)))?;
    match parsed.scheme() {
        "http" | "https" if parsed.host_str().is_some() => Ok(parsed.to_string()),
        _ => Err(CatalogError::invalid(
            op,
            format!("program url '{}' must be an http(s) URL", raw),
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ts(s: &str) -> TimestampId {
        s.parse().unwrap()
    }

    #[test]
    fn test_timestamp_round_trip_format() {
        let id = ts("2025-01-01-0900");
        assert_eq!(id.to_string(), "2025-01-01-0900");
        assert_eq!(serde_json::to_string(&id).unwrap(), "\"2025-01-01-0900\"");
    }

    #[test]
    fn test_timestamp_rejects_bad_shapes() {
        for bad in ["2025-1-01-0900", "2025-01-01 0900", "2025-13-01-0900", "2025-01-01-2561", ""] {
            assert!(bad.parse::<TimestampId>().is_err(), "accepted {}", bad);
        }
    }

    #[test]
    fn test_timestamp_order_matches_text_order() {
        let mut ids = vec![
            ts("2025-02-01-0000"),
            ts("2024-12-31-2359"),
            ts("2025-01-10-0905"),
            ts("2025-01-10-0859"),
        ];
        let mut texts: Vec<String> = ids.iter().map(|i| i.to_string()).collect();
        ids.sort();
        texts.sort();
        let sorted: Vec<String> = ids.iter().map(|i| i.to_string()).collect();
        assert_eq!(sorted, texts);
    }

    #[test]
    fn test_from_datetime_truncates_seconds() {
        let at = NaiveDate::from_ymd_opt(2025, 3, 4)
            .unwrap()
            .and_hms_opt(10, 11, 59)
            .unwrap();
        assert_eq!(TimestampId::from_datetime(at).to_string(), "2025-03-04-1011");
    }

    #[test]
    fn test_name_validation() {
        assert!(is_valid_name("acme"));
        assert!(is_valid_name("Acme_Corp-2"));
        assert!(!is_valid_name(""));
        assert!(!is_valid_name("../etc"));
        assert!(!is_valid_name("acme corp"));
        assert!(!is_valid_name("acme.com"));
    }

    #[test]
    fn test_platform_parse() {
        assert_eq!("HackerOne".parse::<Platform>().unwrap(), Platform::Hackerone);
        assert!("hackerzero".parse::<Platform>().is_err());
    }

    #[test]
    fn test_apply_status_couples_archived_date() {
        let today = NaiveDate::from_ymd_opt(2025, 1, 5).unwrap();
        let later = NaiveDate::from_ymd_opt(2025, 1, 9).unwrap();
        let mut org = TrackedOrg::new("acme", Platform::Hackerone, None, today);

        assert!(org.apply_status(OrgStatus::Archived, today));
        assert_eq!(org.archived_date, Some(today));
        assert!(!org.apply_status(OrgStatus::Archived, later));
        assert_eq!(org.archived_date, Some(today));
        assert!(org.apply_status(OrgStatus::Active, later));
        assert_eq!(org.archived_date, None);
    }

    #[test]
    fn test_index_serialization_shape() {
        let today = NaiveDate::from_ymd_opt(2025, 1, 5).unwrap();
        let doc = IndexDocument {
            tracked_orgs: vec![TrackedOrg::new("acme", Platform::Bugcrowd, None, today)],
        };
        let value = serde_json::to_value(&doc).unwrap();
        let org = &value["tracked_orgs"][0];
        assert_eq!(org["platform"], "bugcrowd");
        assert_eq!(org["status"], "active");
        assert_eq!(org["added_date"], "2025-01-05");
        assert!(org["last_scan"].is_null());
        assert!(org.get("archived_date").is_none());
    }

    #[test]
    fn test_invariant_check_flags_duplicates_and_coupling() {
        let today = NaiveDate::from_ymd_opt(2025, 1, 5).unwrap();
        let org = TrackedOrg::new("acme", Platform::Bugcrowd, None, today);
        let dup = IndexDocument {
            tracked_orgs: vec![org.clone(), org.clone()],
        };
        assert!(dup.check_invariants().unwrap_err().contains("duplicate"));

        let mut broken = org;
        broken.status = OrgStatus::Archived;
        let doc = IndexDocument {
            tracked_orgs: vec![broken],
        };
        assert!(doc.check_invariants().unwrap_err().contains("archived_date"));
    }

    #[test]
    fn test_program_url_validation() {
        let op = Op::new("track", "acme");
        assert!(validate_program_url(op, "https://hackerone.com/acme").is_ok());
        assert!(validate_program_url(op, "ftp://example.com").is_err());
        assert!(validate_program_url(op, "not a url").is_err());
    }
}
