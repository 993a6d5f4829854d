use std::cell::RefCell;
use std::collections::{BTreeMap, BTreeSet};
use std::fmt::{Display, Formatter};

use serde::{Deserialize, Serialize};
use time::macros::format_description;
use time::{Date, Month, OffsetDateTime};
use ulid::Ulid;

#[derive(Debug, Clone, thiserror::Error, Eq, PartialEq)]
pub enum LedgerError {
    #[error("validation error: {0}")]
    Validation(String),
    #[error("store error: {0}")]
    Store(String),
}

/// Element identifier assigned by the upstream model.
///
/// Stored exactly as read: no trimming, no case folding. The only rule is
/// that the token is non-empty.
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(try_from = "String", into = "String")]
pub struct Guid(String);

impl Guid {
    /// Wrap a raw identifier token.
    ///
    /// # Errors
    /// Returns [`LedgerError::Validation`] when the token is empty.
    pub fn parse(raw: impl Into<String>) -> Result<Self, LedgerError> {
        let raw = raw.into();
        if raw.is_empty() {
            return Err(LedgerError::Validation("identifier MUST be non-empty".to_string()));
        }
        Ok(Self(raw))
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl TryFrom<String> for Guid {
    type Error = LedgerError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(value)
    }
}

impl From<Guid> for String {
    fn from(value: Guid) -> Self {
        value.0
    }
}

impl Display for Guid {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Compact `YYMMDD` date token used for `added_on` / `removed_on`.
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(try_from = "String", into = "String")]
pub struct DateToken(String);

impl DateToken {
    /// Parse a six digit `YYMMDD` token, rejecting impossible calendar dates.
    ///
    /// # Errors
    /// Returns [`LedgerError::Validation`] when the token is malformed.
    pub fn parse(raw: &str) -> Result<Self, LedgerError> {
        let invalid = || LedgerError::Validation(format!("date token MUST be YYMMDD: {raw:?}"));
        if raw.len() != 6 || !raw.bytes().all(|byte| byte.is_ascii_digit()) {
            return Err(invalid());
        }

        let year: i32 = raw[0..2].parse().map_err(|_| invalid())?;
        let month: u8 = raw[2..4].parse().map_err(|_| invalid())?;
        let day: u8 = raw[4..6].parse().map_err(|_| invalid())?;
        let month = Month::try_from(month).map_err(|_| invalid())?;
        Date::from_calendar_date(2000 + year, month, day).map_err(|_| invalid())?;

        Ok(Self(raw.to_string()))
    }

    #[must_use]
    pub fn from_date(date: Date) -> Self {
        Self(format!(
            "{:02}{:02}{:02}",
            date.year().rem_euclid(100),
            u8::from(date.month()),
            date.day()
        ))
    }

    /// Processing-time fallback when the model carries no usable timestamp.
    #[must_use]
    pub fn today() -> Self {
        Self::from_date(OffsetDateTime::now_utc().date())
    }

    /// Derive a token from an authored timestamp such as `2024-01-15T10:22:33`.
    ///
    /// Only the leading `YYYY-MM-DD` is considered; anything unparseable
    /// yields `None` so the caller can fall back to [`DateToken::today`].
    #[must_use]
    pub fn from_timestamp(raw: &str) -> Option<Self> {
        let prefix = raw.trim().get(0..10)?;
        Date::parse(prefix, format_description!("[year]-[month]-[day]")).ok().map(Self::from_date)
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl TryFrom<String> for DateToken {
    type Error = LedgerError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

impl From<DateToken> for String {
    fn from(value: DateToken) -> Self {
        value.0
    }
}

impl Display for DateToken {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(rename_all = "snake_case")]
pub enum EntryStatus {
    Active,
    Deleted,
}

impl EntryStatus {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Active => "active",
            Self::Deleted => "deleted",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "active" => Some(Self::Active),
            "deleted" => Some(Self::Deleted),
            _ => None,
        }
    }
}

/// Approval role. Both flags are symmetric as far as the ledger is concerned.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    Architect,
    Structural,
}

impl Role {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Architect => "architect",
            Self::Structural => "structural",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "architect" => Some(Self::Architect),
            "structural" | "structure" => Some(Self::Structural),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct LedgerRow {
    pub identifier: Guid,
    pub source_name: String,
    pub container: Option<String>,
    pub status: EntryStatus,
    pub architect_approval: bool,
    pub structural_approval: bool,
    pub added_on: Option<DateToken>,
    pub removed_on: Option<DateToken>,
}

impl LedgerRow {
    /// A fresh row as created on first observation of an identifier.
    #[must_use]
    pub fn first_seen(
        identifier: Guid,
        source_name: &str,
        container: Option<String>,
        added_on: DateToken,
    ) -> Self {
        Self {
            identifier,
            source_name: source_name.to_string(),
            container,
            status: EntryStatus::Active,
            architect_approval: false,
            structural_approval: false,
            added_on: Some(added_on),
            removed_on: None,
        }
    }

    #[must_use]
    pub fn approval(&self, role: Role) -> bool {
        match role {
            Role::Architect => self.architect_approval,
            Role::Structural => self.structural_approval,
        }
    }

    pub fn set_approval(&mut self, role: Role, value: bool) {
        match role {
            Role::Architect => self.architect_approval = value,
            Role::Structural => self.structural_approval = value,
        }
    }
}

/// One `(identifier, container)` pair produced by extraction.
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct ExtractedElement {
    pub identifier: Guid,
    pub container: Option<String>,
}

/// What reconciliation does with a deleted row whose identifier reappears.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, Eq, PartialEq)]
#[serde(rename_all = "kebab-case")]
pub enum ReactivationPolicy {
    /// Once removed, stays removed.
    #[default]
    Never,
    /// Deleted rows of the same source name become active again.
    ReactivateOwned,
}

impl ReactivationPolicy {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Never => "never",
            Self::ReactivateOwned => "reactivate-owned",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "never" => Some(Self::Never),
            "reactivate-owned" => Some(Self::ReactivateOwned),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct ReconcileRequest {
    pub source_name: String,
    pub observation_date: Option<DateToken>,
    pub elements: Vec<ExtractedElement>,
}

/// The mutations one reconciliation run intends to apply.
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct ReconcilePlan {
    pub observed_on: DateToken,
    pub inserts: Vec<LedgerRow>,
    pub deletions: Vec<Guid>,
    pub reactivations: Vec<Guid>,
    pub unchanged: usize,
    pub foreign: Vec<Guid>,
}

impl ReconcilePlan {
    #[must_use]
    pub fn is_noop(&self) -> bool {
        self.inserts.is_empty() && self.deletions.is_empty() && self.reactivations.is_empty()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ReconcileReport {
    pub run_id: String,
    pub source_name: String,
    pub observed_on: DateToken,
    #[serde(with = "time::serde::rfc3339")]
    pub ran_at: OffsetDateTime,
    pub policy: ReactivationPolicy,
    pub inserted: Vec<Guid>,
    pub marked_deleted: Vec<Guid>,
    pub reactivated: Vec<Guid>,
    pub unchanged: usize,
    pub foreign: Vec<Guid>,
    pub ignored_duplicates: usize,
}

/// Persisted summary of one reconciliation run.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ReconcileRunSummary {
    pub run_id: String,
    pub source_name: String,
    pub observed_on: DateToken,
    #[serde(with = "time::serde::rfc3339")]
    pub ran_at: OffsetDateTime,
    pub inserted: usize,
    pub marked_deleted: usize,
    pub reactivated: usize,
    pub unchanged: usize,
    pub foreign: usize,
    pub ignored_duplicates: usize,
}

impl From<&ReconcileReport> for ReconcileRunSummary {
    fn from(report: &ReconcileReport) -> Self {
        Self {
            run_id: report.run_id.clone(),
            source_name: report.source_name.clone(),
            observed_on: report.observed_on.clone(),
            ran_at: report.ran_at,
            inserted: report.inserted.len(),
            marked_deleted: report.marked_deleted.len(),
            reactivated: report.reactivated.len(),
            unchanged: report.unchanged,
            foreign: report.foreign.len(),
            ignored_duplicates: report.ignored_duplicates,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, Eq, PartialEq)]
pub struct LedgerFilter {
    pub source_name: Option<String>,
    pub status: Option<EntryStatus>,
    pub container: Option<String>,
    pub identifier_contains: Option<String>,
}

impl LedgerFilter {
    #[must_use]
    pub fn matches(&self, row: &LedgerRow) -> bool {
        if let Some(source_name) = &self.source_name {
            if &row.source_name != source_name {
                return false;
            }
        }
        if let Some(status) = self.status {
            if row.status != status {
                return false;
            }
        }
        if let Some(container) = &self.container {
            if row.container.as_ref() != Some(container) {
                return false;
            }
        }
        if let Some(needle) = &self.identifier_contains {
            if !row.identifier.as_str().contains(needle.as_str()) {
                return false;
            }
        }
        true
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, Eq, PartialEq)]
pub struct LedgerStats {
    pub total: usize,
    pub active: usize,
    pub deleted: usize,
    pub architect_approved: usize,
    pub structural_approved: usize,
    pub by_source: BTreeMap<String, usize>,
}

impl LedgerStats {
    #[must_use]
    pub fn from_rows<'a>(rows: impl IntoIterator<Item = &'a LedgerRow>) -> Self {
        let mut stats = Self::default();
        for row in rows {
            stats.total += 1;
            match row.status {
                EntryStatus::Active => stats.active += 1,
                EntryStatus::Deleted => stats.deleted += 1,
            }
            if row.architect_approval {
                stats.architect_approved += 1;
            }
            if row.structural_approval {
                stats.structural_approved += 1;
            }
            *stats.by_source.entry(row.source_name.clone()).or_default() += 1;
        }
        stats
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct ApprovalImportSummary {
    pub role: Role,
    pub value: bool,
    pub requested: usize,
    pub updated: usize,
    pub unknown: Vec<Guid>,
}

/// Ledger primitives available inside one atomic unit of work.
pub trait LedgerTransaction {
    /// Rows currently associated with `source_name`, in any status.
    ///
    /// # Errors
    /// Returns [`LedgerError::Store`] when the read fails.
    fn rows_for_source(&self, source_name: &str) -> Result<Vec<LedgerRow>, LedgerError>;

    /// The subset of `candidates` already present anywhere in the ledger.
    ///
    /// # Errors
    /// Returns [`LedgerError::Store`] when the read fails.
    fn existing_identifiers(&self, candidates: &[Guid]) -> Result<BTreeSet<Guid>, LedgerError>;

    /// Insert rows, silently skipping identifiers that already exist.
    /// Returns the identifiers that were actually inserted.
    ///
    /// # Errors
    /// Returns [`LedgerError::Store`] when the write fails.
    fn insert_new_rows(&self, rows: &[LedgerRow]) -> Result<Vec<Guid>, LedgerError>;

    /// Transition rows to deleted, stamping `removed_on`.
    ///
    /// # Errors
    /// Returns [`LedgerError::Store`] when the write fails.
    fn mark_deleted(&self, identifiers: &[Guid], removed_on: &DateToken)
        -> Result<usize, LedgerError>;

    /// Transition rows back to active and clear `removed_on`.
    ///
    /// # Errors
    /// Returns [`LedgerError::Store`] when the write fails.
    fn reactivate(&self, identifiers: &[Guid]) -> Result<usize, LedgerError>;

    /// Persist a run summary alongside the mutations.
    ///
    /// # Errors
    /// Returns [`LedgerError::Store`] when the write fails.
    fn record_run(&self, _report: &ReconcileReport) -> Result<(), LedgerError> {
        Ok(())
    }
}

pub trait LedgerStore {
    /// Run `work` as one atomic unit: committed when it returns `Ok`, rolled
    /// back otherwise.
    ///
    /// # Errors
    /// Returns the error produced by `work`, or [`LedgerError::Store`] when the
    /// transaction cannot be opened or committed.
    fn with_transaction<T, F>(&mut self, work: F) -> Result<T, LedgerError>
    where
        F: FnOnce(&dyn LedgerTransaction) -> Result<T, LedgerError>;
}

/// Compute the mutations that bring the prior extension of one source name in
/// line with a new extraction.
///
/// `prior` holds the rows currently associated with the source name;
/// `known_elsewhere` holds incoming identifiers that already exist under some
/// other source name.
#[must_use]
pub fn plan_reconciliation(
    source_name: &str,
    prior: &[LedgerRow],
    known_elsewhere: &BTreeSet<Guid>,
    elements: &[ExtractedElement],
    policy: ReactivationPolicy,
    observed_on: DateToken,
) -> ReconcilePlan {
    let existing: BTreeMap<&Guid, EntryStatus> =
        prior.iter().map(|row| (&row.identifier, row.status)).collect();

    let mut incoming: BTreeSet<&Guid> = BTreeSet::new();
    let mut inserts = Vec::new();
    let mut reactivations = Vec::new();
    let mut foreign = Vec::new();
    let mut unchanged = 0_usize;

    for element in elements {
        if !incoming.insert(&element.identifier) {
            continue;
        }

        match existing.get(&element.identifier) {
            Some(EntryStatus::Deleted) if policy == ReactivationPolicy::ReactivateOwned => {
                reactivations.push(element.identifier.clone());
            }
            Some(_) => unchanged += 1,
            None if known_elsewhere.contains(&element.identifier) => {
                foreign.push(element.identifier.clone());
            }
            None => inserts.push(LedgerRow::first_seen(
                element.identifier.clone(),
                source_name,
                element.container.clone(),
                observed_on.clone(),
            )),
        }
    }

    let deletions = prior
        .iter()
        .filter(|row| row.status == EntryStatus::Active && !incoming.contains(&row.identifier))
        .map(|row| row.identifier.clone())
        .collect::<BTreeSet<_>>()
        .into_iter()
        .collect();

    inserts.sort_by(|lhs, rhs| lhs.identifier.cmp(&rhs.identifier));
    reactivations.sort();
    foreign.sort();

    ReconcilePlan { observed_on, inserts, deletions, reactivations, unchanged, foreign }
}

/// Synchronise the ledger with one extraction of `request.source_name`.
///
/// Reading the prior extension, computing the diff, and writing the result
/// all happen inside a single [`LedgerStore::with_transaction`] call.
///
/// # Errors
/// Returns [`LedgerError::Validation`] for an empty source name (before the
/// store is touched) and propagates store failures, in which case nothing is
/// committed.
pub fn reconcile<S>(
    store: &mut S,
    request: &ReconcileRequest,
    policy: ReactivationPolicy,
) -> Result<ReconcileReport, LedgerError>
where
    S: LedgerStore + ?Sized,
{
    if request.source_name.trim().is_empty() {
        return Err(LedgerError::Validation("source_name MUST be non-empty".to_string()));
    }

    let observed_on = request.observation_date.clone().unwrap_or_else(DateToken::today);

    store.with_transaction(|tx| {
        let prior = tx.rows_for_source(&request.source_name)?;
        let owned: BTreeSet<&Guid> = prior.iter().map(|row| &row.identifier).collect();
        let candidates = request
            .elements
            .iter()
            .map(|element| &element.identifier)
            .filter(|identifier| !owned.contains(identifier))
            .collect::<BTreeSet<_>>()
            .into_iter()
            .cloned()
            .collect::<Vec<_>>();
        let known_elsewhere = tx.existing_identifiers(&candidates)?;

        let plan = plan_reconciliation(
            &request.source_name,
            &prior,
            &known_elsewhere,
            &request.elements,
            policy,
            observed_on,
        );

        tx.mark_deleted(&plan.deletions, &plan.observed_on)?;
        tx.reactivate(&plan.reactivations)?;
        let inserted = tx.insert_new_rows(&plan.inserts)?;

        let report = ReconcileReport {
            run_id: Ulid::new().to_string(),
            source_name: request.source_name.clone(),
            observed_on: plan.observed_on,
            ran_at: OffsetDateTime::now_utc(),
            policy,
            ignored_duplicates: plan.inserts.len() - inserted.len(),
            inserted,
            marked_deleted: plan.deletions,
            reactivated: plan.reactivations,
            unchanged: plan.unchanged,
            foreign: plan.foreign,
        };
        tx.record_run(&report)?;
        Ok(report)
    })
}

/// Parse a free-form identifier list as pasted by reviewers.
///
/// Tokens are separated by whitespace, commas, or semicolons; `#` starts a
/// comment; duplicates collapse onto their first occurrence.
#[must_use]
pub fn parse_identifier_list(text: &str) -> Vec<Guid> {
    let mut seen = BTreeSet::new();
    let mut identifiers = Vec::new();

    for line in text.lines() {
        let content = line.split('#').next().unwrap_or_default();
        for token in content.split(|ch: char| ch.is_whitespace() || ch == ',' || ch == ';') {
            let token = token.trim_matches(|ch: char| ch == '"' || ch == '\'');
            let Ok(identifier) = Guid::parse(token) else {
                continue;
            };
            if seen.insert(identifier.clone()) {
                identifiers.push(identifier);
            }
        }
    }

    identifiers
}

/// Ledger held entirely in memory, with copy-on-write transactions.
#[derive(Debug, Clone, Default)]
pub struct MemoryLedger {
    rows: BTreeMap<Guid, LedgerRow>,
    runs: Vec<ReconcileRunSummary>,
}

impl MemoryLedger {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn get(&self, identifier: &Guid) -> Option<&LedgerRow> {
        self.rows.get(identifier)
    }

    pub fn rows(&self) -> impl Iterator<Item = &LedgerRow> {
        self.rows.values()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.rows.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    #[must_use]
    pub fn runs(&self) -> &[ReconcileRunSummary] {
        &self.runs
    }

    /// Edit-surface approval toggle. Returns whether the identifier exists.
    pub fn set_approval(&mut self, identifier: &Guid, role: Role, value: bool) -> bool {
        match self.rows.get_mut(identifier) {
            Some(row) => {
                row.set_approval(role, value);
                true
            }
            None => false,
        }
    }
}

struct MemoryTransaction {
    rows: RefCell<BTreeMap<Guid, LedgerRow>>,
    runs: RefCell<Vec<ReconcileRunSummary>>,
}

impl LedgerTransaction for MemoryTransaction {
    fn rows_for_source(&self, source_name: &str) -> Result<Vec<LedgerRow>, LedgerError> {
        Ok(self
            .rows
            .borrow()
            .values()
            .filter(|row| row.source_name == source_name)
            .cloned()
            .collect())
    }

    fn existing_identifiers(&self, candidates: &[Guid]) -> Result<BTreeSet<Guid>, LedgerError> {
        let rows = self.rows.borrow();
        Ok(candidates.iter().filter(|candidate| rows.contains_key(*candidate)).cloned().collect())
    }

    fn insert_new_rows(&self, rows: &[LedgerRow]) -> Result<Vec<Guid>, LedgerError> {
        let mut table = self.rows.borrow_mut();
        let mut inserted = Vec::new();
        for row in rows {
            if table.contains_key(&row.identifier) {
                continue;
            }
            table.insert(row.identifier.clone(), row.clone());
            inserted.push(row.identifier.clone());
        }
        Ok(inserted)
    }

    fn mark_deleted(
        &self,
        identifiers: &[Guid],
        removed_on: &DateToken,
    ) -> Result<usize, LedgerError> {
        let mut table = self.rows.borrow_mut();
        let mut changed = 0;
        for identifier in identifiers {
            if let Some(row) = table.get_mut(identifier) {
                if row.status == EntryStatus::Active {
                    row.status = EntryStatus::Deleted;
                    row.removed_on = Some(removed_on.clone());
                    changed += 1;
                }
            }
        }
        Ok(changed)
    }

    fn reactivate(&self, identifiers: &[Guid]) -> Result<usize, LedgerError> {
        let mut table = self.rows.borrow_mut();
        let mut changed = 0;
        for identifier in identifiers {
            if let Some(row) = table.get_mut(identifier) {
                if row.status == EntryStatus::Deleted {
                    row.status = EntryStatus::Active;
                    row.removed_on = None;
                    changed += 1;
                }
            }
        }
        Ok(changed)
    }

    fn record_run(&self, report: &ReconcileReport) -> Result<(), LedgerError> {
        self.runs.borrow_mut().push(ReconcileRunSummary::from(report));
        Ok(())
    }
}

impl LedgerStore for MemoryLedger {
    fn with_transaction<T, F>(&mut self, work: F) -> Result<T, LedgerError>
    where
        F: FnOnce(&dyn LedgerTransaction) -> Result<T, LedgerError>,
    {
        let tx = MemoryTransaction {
            rows: RefCell::new(self.rows.clone()),
            runs: RefCell::new(self.runs.clone()),
        };
        let value = work(&tx)?;
        self.rows = tx.rows.into_inner();
        self.runs = tx.runs.into_inner();
        Ok(value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn guid(raw: &str) -> Guid {
        match Guid::parse(raw) {
            Ok(value) => value,
            Err(err) => panic!("fixture guid should parse: {err}"),
        }
    }

    fn date(raw: &str) -> DateToken {
        match DateToken::parse(raw) {
            Ok(value) => value,
            Err(err) => panic!("fixture date should parse: {err}"),
        }
    }

    fn element(identifier: &str, container: Option<&str>) -> ExtractedElement {
        ExtractedElement { identifier: guid(identifier), container: container.map(str::to_string) }
    }

    fn request(source_name: &str, on: &str, elements: Vec<ExtractedElement>) -> ReconcileRequest {
        ReconcileRequest {
            source_name: source_name.to_string(),
            observation_date: Some(date(on)),
            elements,
        }
    }

    fn run(
        ledger: &mut MemoryLedger,
        source_name: &str,
        on: &str,
        elements: Vec<ExtractedElement>,
    ) -> ReconcileReport {
        match reconcile(ledger, &request(source_name, on, elements), ReactivationPolicy::Never) {
            Ok(report) => report,
            Err(err) => panic!("reconcile should succeed: {err}"),
        }
    }

    fn row<'a>(ledger: &'a MemoryLedger, identifier: &str) -> &'a LedgerRow {
        ledger
            .get(&guid(identifier))
            .unwrap_or_else(|| panic!("ledger should contain {identifier}"))
    }

    #[test]
    fn date_token_parses_and_rejects_impossible_dates() {
        assert_eq!(date("240115").as_str(), "240115");
        assert!(DateToken::parse("241301").is_err());
        assert!(DateToken::parse("240230").is_err());
        assert!(DateToken::parse("24011").is_err());
        assert!(DateToken::parse("24-115").is_err());
    }

    #[test]
    fn date_token_from_header_timestamp_truncates_to_yymmdd() {
        assert_eq!(DateToken::from_timestamp("2024-01-15T10:22:33"), Some(date("240115")));
        assert_eq!(DateToken::from_timestamp("1999-12-31"), Some(date("991231")));
        assert_eq!(DateToken::from_timestamp("not a timestamp"), None);
        assert_eq!(DateToken::from_timestamp(""), None);
    }

    #[test]
    fn guid_rejects_empty_and_keeps_case() {
        assert!(Guid::parse("").is_err());
        assert_ne!(guid("2O2Fr$t4X7Zf8NOew3FLOH"), guid("2o2fr$t4x7zf8noew3floh"));
    }

    #[test]
    fn scenario_a_first_upload_creates_active_rows() {
        let mut ledger = MemoryLedger::new();
        let report = run(
            &mut ledger,
            "a.ifc",
            "240101",
            vec![element("G1", Some("L1")), element("G2", Some("L1"))],
        );

        assert_eq!(report.inserted, vec![guid("G1"), guid("G2")]);
        assert_eq!(ledger.len(), 2);
        for identifier in ["G1", "G2"] {
            let row = row(&ledger, identifier);
            assert_eq!(row.status, EntryStatus::Active);
            assert_eq!(row.added_on, Some(date("240101")));
            assert_eq!(row.container.as_deref(), Some("L1"));
            assert!(!row.architect_approval && !row.structural_approval);
            assert_eq!(row.removed_on, None);
        }
    }

    #[test]
    fn scenario_b_missing_identifier_is_marked_deleted() {
        let mut ledger = MemoryLedger::new();
        run(
            &mut ledger,
            "a.ifc",
            "240101",
            vec![element("G1", Some("L1")), element("G2", Some("L1"))],
        );
        let report = run(&mut ledger, "a.ifc", "240201", vec![element("G1", Some("L1"))]);

        assert_eq!(report.marked_deleted, vec![guid("G2")]);
        assert_eq!(row(&ledger, "G1").status, EntryStatus::Active);
        assert_eq!(row(&ledger, "G1").added_on, Some(date("240101")));
        assert_eq!(row(&ledger, "G2").status, EntryStatus::Deleted);
        assert_eq!(row(&ledger, "G2").removed_on, Some(date("240201")));
    }

    #[test]
    fn scenario_c_reappearing_identifier_stays_deleted_by_default() {
        let mut ledger = MemoryLedger::new();
        run(
            &mut ledger,
            "a.ifc",
            "240101",
            vec![element("G1", Some("L1")), element("G2", Some("L1"))],
        );
        run(&mut ledger, "a.ifc", "240201", vec![element("G1", Some("L1"))]);
        let report = run(
            &mut ledger,
            "a.ifc",
            "240301",
            vec![element("G1", Some("L1")), element("G2", Some("L1"))],
        );

        assert!(report.inserted.is_empty());
        assert!(report.reactivated.is_empty());
        assert_eq!(report.unchanged, 2);
        assert_eq!(row(&ledger, "G2").status, EntryStatus::Deleted);
        assert_eq!(row(&ledger, "G2").removed_on, Some(date("240201")));
    }

    #[test]
    fn reactivate_owned_policy_revives_deleted_rows_of_same_source() {
        let mut ledger = MemoryLedger::new();
        run(&mut ledger, "a.ifc", "240101", vec![element("G1", None), element("G2", None)]);
        run(&mut ledger, "a.ifc", "240201", vec![element("G1", None)]);
        ledger.set_approval(&guid("G2"), Role::Architect, true);

        let report = match reconcile(
            &mut ledger,
            &request("a.ifc", "240301", vec![element("G1", None), element("G2", None)]),
            ReactivationPolicy::ReactivateOwned,
        ) {
            Ok(report) => report,
            Err(err) => panic!("reconcile should succeed: {err}"),
        };

        assert_eq!(report.reactivated, vec![guid("G2")]);
        let revived = row(&ledger, "G2");
        assert_eq!(revived.status, EntryStatus::Active);
        assert_eq!(revived.removed_on, None);
        assert!(revived.architect_approval);
        assert_eq!(revived.added_on, Some(date("240101")));
    }

    #[test]
    fn scenario_d_absent_container_is_not_an_error() {
        let mut ledger = MemoryLedger::new();
        run(&mut ledger, "a.ifc", "240101", vec![element("G3", None)]);
        assert_eq!(row(&ledger, "G3").container, None);
        assert_eq!(row(&ledger, "G3").status, EntryStatus::Active);
    }

    #[test]
    fn scenario_e_shared_identifier_is_not_duplicated_across_sources() {
        let mut ledger = MemoryLedger::new();
        run(&mut ledger, "a.ifc", "240101", vec![element("G4", Some("L1"))]);
        let report = run(&mut ledger, "b.ifc", "240102", vec![element("G4", Some("L2"))]);

        assert_eq!(ledger.len(), 1);
        assert_eq!(report.foreign, vec![guid("G4")]);
        assert!(report.inserted.is_empty());
        let shared = row(&ledger, "G4");
        assert_eq!(shared.source_name, "a.ifc");
        assert_eq!(shared.container.as_deref(), Some("L1"));

        // b.ifc never owned G4, so dropping it there changes nothing.
        run(&mut ledger, "b.ifc", "240103", vec![]);
        assert_eq!(row(&ledger, "G4").status, EntryStatus::Active);

        run(&mut ledger, "a.ifc", "240104", vec![]);
        assert_eq!(row(&ledger, "G4").status, EntryStatus::Deleted);
    }

    #[test]
    fn empty_extraction_marks_every_active_row_of_the_source_deleted() {
        let mut ledger = MemoryLedger::new();
        run(&mut ledger, "a.ifc", "240101", vec![element("G1", None), element("G2", None)]);
        run(&mut ledger, "other.ifc", "240101", vec![element("G9", None)]);
        let report = run(&mut ledger, "a.ifc", "240105", vec![]);

        assert_eq!(report.marked_deleted, vec![guid("G1"), guid("G2")]);
        assert_eq!(row(&ledger, "G9").status, EntryStatus::Active);
    }

    #[test]
    fn duplicate_identifiers_within_one_extraction_insert_once() {
        let mut ledger = MemoryLedger::new();
        let report = run(
            &mut ledger,
            "a.ifc",
            "240101",
            vec![element("G1", Some("L1")), element("G1", Some("L2"))],
        );
        assert_eq!(report.inserted, vec![guid("G1")]);
        assert_eq!(row(&ledger, "G1").container.as_deref(), Some("L1"));
    }

    #[test]
    fn empty_source_name_fails_without_touching_the_ledger() {
        let mut ledger = MemoryLedger::new();
        let result = reconcile(
            &mut ledger,
            &request("   ", "240101", vec![element("G1", None)]),
            ReactivationPolicy::Never,
        );
        assert!(matches!(result, Err(LedgerError::Validation(_))));
        assert!(ledger.is_empty());
        assert!(ledger.runs().is_empty());
    }

    #[test]
    fn missing_observation_date_falls_back_to_today() {
        let mut ledger = MemoryLedger::new();
        let report = match reconcile(
            &mut ledger,
            &ReconcileRequest {
                source_name: "a.ifc".to_string(),
                observation_date: None,
                elements: vec![element("G1", None)],
            },
            ReactivationPolicy::Never,
        ) {
            Ok(report) => report,
            Err(err) => panic!("reconcile should succeed: {err}"),
        };
        assert_eq!(report.observed_on.as_str().len(), 6);
        assert_eq!(row(&ledger, "G1").added_on, Some(report.observed_on));
    }

    struct FailingStore {
        inner: MemoryLedger,
    }

    struct FailOnDelete<'a> {
        inner: &'a dyn LedgerTransaction,
    }

    impl LedgerTransaction for FailOnDelete<'_> {
        fn rows_for_source(&self, source_name: &str) -> Result<Vec<LedgerRow>, LedgerError> {
            self.inner.rows_for_source(source_name)
        }

        fn existing_identifiers(
            &self,
            candidates: &[Guid],
        ) -> Result<BTreeSet<Guid>, LedgerError> {
            self.inner.existing_identifiers(candidates)
        }

        fn insert_new_rows(&self, rows: &[LedgerRow]) -> Result<Vec<Guid>, LedgerError> {
            self.inner.insert_new_rows(rows)
        }

        fn mark_deleted(&self, _: &[Guid], _: &DateToken) -> Result<usize, LedgerError> {
            Err(LedgerError::Store("disk went away".to_string()))
        }

        fn reactivate(&self, identifiers: &[Guid]) -> Result<usize, LedgerError> {
            self.inner.reactivate(identifiers)
        }
    }

    impl LedgerStore for FailingStore {
        fn with_transaction<T, F>(&mut self, work: F) -> Result<T, LedgerError>
        where
            F: FnOnce(&dyn LedgerTransaction) -> Result<T, LedgerError>,
        {
            self.inner.with_transaction(|tx| work(&FailOnDelete { inner: tx }))
        }
    }

    #[test]
    fn store_failure_leaves_no_partial_state() {
        let mut store = FailingStore { inner: MemoryLedger::new() };
        let result = reconcile(
            &mut store,
            &request("a.ifc", "240101", vec![element("G1", None)]),
            ReactivationPolicy::Never,
        );
        assert!(matches!(result, Err(LedgerError::Store(_))));
        assert!(store.inner.is_empty());
        assert!(store.inner.runs().is_empty());
    }

    #[test]
    fn plan_is_independent_of_element_order() {
        let prior = vec![
            LedgerRow::first_seen(guid("G1"), "a.ifc", None, date("240101")),
            LedgerRow::first_seen(guid("G2"), "a.ifc", None, date("240101")),
        ];
        let forward = vec![element("G3", None), element("G1", None), element("G4", None)];
        let mut backward = forward.clone();
        backward.reverse();

        let known = BTreeSet::new();
        let lhs = plan_reconciliation(
            "a.ifc",
            &prior,
            &known,
            &forward,
            ReactivationPolicy::Never,
            date("240202"),
        );
        let rhs = plan_reconciliation(
            "a.ifc",
            &prior,
            &known,
            &backward,
            ReactivationPolicy::Never,
            date("240202"),
        );
        assert_eq!(lhs, rhs);
        assert_eq!(lhs.deletions, vec![guid("G2")]);
        assert!(!lhs.is_noop());
    }

    #[test]
    fn identifier_list_parsing_handles_separators_comments_and_duplicates() {
        let parsed = parse_identifier_list(
            "# approved by structure\n\
             3vB2YO$MX4xv5uCqZZG05x, 1hOSvn6df7F8_7GcBWlR72\n\n\
             '0K7w7JOT5AoxVnSxDAsOuD'; 3vB2YO$MX4xv5uCqZZG05x\n",
        );
        assert_eq!(
            parsed,
            vec![
                guid("3vB2YO$MX4xv5uCqZZG05x"),
                guid("1hOSvn6df7F8_7GcBWlR72"),
                guid("0K7w7JOT5AoxVnSxDAsOuD"),
            ]
        );
    }

    #[test]
    fn ledger_filter_and_stats_follow_row_fields() {
        let mut approved =
            LedgerRow::first_seen(guid("G1"), "a.ifc", Some("L1".to_string()), date("240101"));
        approved.architect_approval = true;
        let mut removed = LedgerRow::first_seen(guid("G2"), "b.ifc", None, date("240101"));
        removed.status = EntryStatus::Deleted;
        let rows = vec![approved, removed];

        let filter = LedgerFilter { container: Some("L1".to_string()), ..LedgerFilter::default() };
        assert_eq!(rows.iter().filter(|row| filter.matches(row)).count(), 1);

        let stats = LedgerStats::from_rows(&rows);
        assert_eq!(stats.total, 2);
        assert_eq!(stats.active, 1);
        assert_eq!(stats.deleted, 1);
        assert_eq!(stats.architect_approved, 1);
        assert_eq!(stats.by_source.get("b.ifc"), Some(&1));
    }

    #[test]
    fn ledger_row_json_uses_plain_strings_for_tokens() {
        let row = LedgerRow::first_seen(guid("G1"), "a.ifc", None, date("240101"));
        let json = match serde_json::to_value(&row) {
            Ok(value) => value,
            Err(err) => panic!("row should serialize: {err}"),
        };
        assert_eq!(json["identifier"], "G1");
        assert_eq!(json["added_on"], "240101");
        assert_eq!(json["status"], "active");

        let bad = serde_json::json!({
            "identifier": "G1", "source_name": "a.ifc", "container": null, "status": "active",
            "architect_approval": false, "structural_approval": false,
            "added_on": "2024-01-01", "removed_on": null
        });
        assert!(serde_json::from_value::<LedgerRow>(bad).is_err());
    }

    #[derive(Debug, Clone)]
    enum Step {
        Upload { source: usize, ids: Vec<u8>, day: u8 },
        Approve { id: u8, role: bool },
    }

    fn step_strategy() -> impl Strategy<Value = Step> {
        prop_oneof![
            (0_usize..3, proptest::collection::vec(0_u8..12, 0..8), 1_u8..28)
                .prop_map(|(source, ids, day)| Step::Upload { source, ids, day }),
            (0_u8..12, any::<bool>()).prop_map(|(id, role)| Step::Approve { id, role }),
        ]
    }

    fn upload(ledger: &mut MemoryLedger, source: usize, ids: &[u8], day: u8) -> ReconcileReport {
        let elements = ids.iter().map(|id| element(&format!("G{id}"), Some("L1"))).collect();
        run(ledger, &format!("file-{source}.ifc"), &format!("2401{day:02}"), elements)
    }

    proptest! {
        #[test]
        fn approvals_survive_any_sequence_of_reconciliations(
            steps in proptest::collection::vec(step_strategy(), 1..20)
        ) {
            let mut ledger = MemoryLedger::new();
            let mut approved: BTreeSet<(Guid, Role)> = BTreeSet::new();
            for step in steps {
                match step {
                    Step::Upload { source, ids, day } => {
                        upload(&mut ledger, source, &ids, day);
                    }
                    Step::Approve { id, role } => {
                        let role = if role { Role::Architect } else { Role::Structural };
                        let identifier = guid(&format!("G{id}"));
                        if ledger.set_approval(&identifier, role, true) {
                            approved.insert((identifier, role));
                        }
                    }
                }
                for (identifier, role) in &approved {
                    prop_assert!(ledger.get(identifier).is_some_and(|row| row.approval(*role)));
                }
            }
        }

        #[test]
        fn second_identical_run_is_a_noop(
            first in proptest::collection::vec(0_u8..12, 0..10),
            second in proptest::collection::vec(0_u8..12, 0..10),
        ) {
            let mut ledger = MemoryLedger::new();
            upload(&mut ledger, 0, &first, 1);
            upload(&mut ledger, 0, &second, 2);
            let snapshot: Vec<LedgerRow> = ledger.rows().cloned().collect();

            let report = upload(&mut ledger, 0, &second, 3);
            prop_assert!(report.inserted.is_empty());
            prop_assert!(report.marked_deleted.is_empty());
            let after: Vec<LedgerRow> = ledger.rows().cloned().collect();
            prop_assert_eq!(snapshot, after);
        }

        #[test]
        fn deletion_and_insertion_are_complete(
            uploads in proptest::collection::vec(
                (0_usize..3, proptest::collection::vec(0_u8..12, 0..8)),
                1..8,
            ),
        ) {
            let mut ledger = MemoryLedger::new();
            for (round, (source, ids)) in uploads.into_iter().enumerate() {
                let before = ledger.clone();
                let day = u8::try_from(round % 27 + 1).unwrap_or(1);
                upload(&mut ledger, source, &ids, day);
                let source_name = format!("file-{source}.ifc");
                let incoming: BTreeSet<Guid> =
                    ids.iter().map(|id| guid(&format!("G{id}"))).collect();

                for row in before.rows() {
                    let now = ledger.get(&row.identifier);
                    prop_assert!(now.is_some());
                    let Some(now) = now else { continue };
                    if row.source_name == source_name
                        && row.status == EntryStatus::Active
                        && !incoming.contains(&row.identifier)
                    {
                        prop_assert_eq!(now.status, EntryStatus::Deleted);
                        prop_assert!(now.removed_on.is_some());
                    } else {
                        prop_assert_eq!(now, row);
                    }
                }

                for identifier in &incoming {
                    if before.get(identifier).is_none() {
                        let created = ledger.get(identifier);
                        prop_assert!(created.is_some_and(|row| row.status == EntryStatus::Active
                            && !row.architect_approval
                            && !row.structural_approval
                            && row.source_name == source_name));
                    }
                }

                let unique: BTreeSet<&Guid> = ledger.rows().map(|row| &row.identifier).collect();
                prop_assert_eq!(unique.len(), ledger.len());
            }
        }
    }
}
