//! Partition identity as laid out in object storage and as tracked by the
//! reconciliation worklist.
//!
//! Partition files are addressed as `<prefix>/date=<YYYY-MM-DD>/<org_name>`.

use std::fmt;

use chrono::{DateTime, NaiveDate, Utc};
use object_store::path::Path;

use crate::error::PartitionParseError;

/// Date format of the `date=` path segment and of rendered source URIs.
pub const PARTITION_DATE_FORMAT: &str = "%Y-%m-%d";

const DATE_SEGMENT: &str = "date=";

/// A partition file present in object storage, snapshotted once per cycle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Partition {
    pub date: NaiveDate,
    pub org_name: String,
    pub size_bytes: u64,
    pub last_modified: DateTime<Utc>,
}

/// `(date, org_name)` parsed from an object key.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PartitionKey {
    pub date: NaiveDate,
    pub org_name: String,
}

impl PartitionKey {
    /// Parse `<prefix>/date=<YYYY-MM-DD>/<org_name>`.
    ///
    /// Everything after the date segment is the organization name, so names
    /// containing `/` survive intact.
    pub fn parse(prefix: &Path, location: &Path) -> Result<Self, PartitionParseError> {
        let mut parts = location
            .prefix_match(prefix)
            .ok_or(PartitionParseError::OutsidePrefix)?
            .map(|part| part.as_ref().to_string());

        let date_part = parts
            .next()
            .ok_or(PartitionParseError::MissingDateSegment)?;
        let raw_date = date_part
            .strip_prefix(DATE_SEGMENT)
            .ok_or(PartitionParseError::MissingDateSegment)?;
        let date = NaiveDate::parse_from_str(raw_date, PARTITION_DATE_FORMAT)
            .map_err(|_| PartitionParseError::InvalidDate(raw_date.to_string()))?;

        let org_name = parts.collect::<Vec<_>>().join("/");
        if org_name.is_empty() {
            return Err(PartitionParseError::MissingOrgName);
        }

        Ok(Self { date, org_name })
    }
}

/// Why a partition was put on the worklist. Informational only.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DecisionReason {
    /// The organization has no rows in the warehouse at all
    NeverLoaded,
    /// The organization is loaded, but not under this date
    MissingForDate,
    /// The organization's most recent warehouse date differs from this one
    CanonicalDateMoved,
    /// Same date, but the file is newer than the last load by more than the threshold
    Stale,
    /// Whole-date reload
    DateRefresh,
}

impl fmt::Display for DecisionReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let reason = match self {
            DecisionReason::NeverLoaded => "never loaded",
            DecisionReason::MissingForDate => "missing for date",
            DecisionReason::CanonicalDateMoved => "canonical date moved",
            DecisionReason::Stale => "stale",
            DecisionReason::DateRefresh => "date refresh",
        };
        f.write_str(reason)
    }
}

/// One unit of work: reload `date`, optionally restricted to one organization.
#[derive(Debug, Clone)]
pub struct ReconciliationDecision {
    pub date: NaiveDate,
    /// `None` when the whole date is reloaded
    pub org_name: Option<String>,
    pub reason: DecisionReason,
}

impl ReconciliationDecision {
    pub fn for_org(date: NaiveDate, org_name: impl Into<String>, reason: DecisionReason) -> Self {
        Self {
            date,
            org_name: Some(org_name.into()),
            reason,
        }
    }

    pub fn for_date(date: NaiveDate) -> Self {
        Self {
            date,
            org_name: None,
            reason: DecisionReason::DateRefresh,
        }
    }

    /// Source URI of the partition files, following the `date=` layout.
    pub fn source_uri(&self, source_root: &str) -> String {
        let root = source_root.trim_end_matches('/');
        let date = self.date.format(PARTITION_DATE_FORMAT);
        match &self.org_name {
            Some(org) => format!("{root}/{DATE_SEGMENT}{date}/{org}"),
            None => format!("{root}/{DATE_SEGMENT}{date}"),
        }
    }
}

// Identity is (date, org_name); the reason is not part of it.
impl PartialEq for ReconciliationDecision {
    fn eq(&self, other: &Self) -> bool {
        self.date == other.date && self.org_name == other.org_name
    }
}

impl Eq for ReconciliationDecision {}

impl std::hash::Hash for ReconciliationDecision {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.date.hash(state);
        self.org_name.hash(state);
    }
}

impl fmt::Display for ReconciliationDecision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.org_name {
            Some(org) => write!(f, "{org} - {}", self.date.format(PARTITION_DATE_FORMAT)),
            None => write!(f, "{}", self.date.format(PARTITION_DATE_FORMAT)),
        }
    }
}
