use std::path::{Path, PathBuf};

use anyhow::{anyhow, Context, Result};
use ifc_ledger_core::{
    reconcile, ApprovalImportSummary, DateToken, EntryStatus, ExtractedElement, Guid,
    LedgerFilter, LedgerRow, LedgerStats, ReactivationPolicy, ReconcileReport, ReconcileRequest,
    ReconcileRunSummary, Role,
};
use ifc_ledger_model::{
    extract, write_back_approvals, ElementRecord, ExtractOptions, IfcModel, ModelInfo,
    WriteBackReport,
};
use ifc_ledger_store_sqlite::{IntegrityReport, SchemaStatus, SqliteStore};
use serde::{Deserialize, Serialize};

pub mod approvals;
pub mod config;

pub use approvals::{read_identifier_file, IdentifierListError};
pub use config::{ConfigError, LedgerConfig};

pub const API_CONTRACT_VERSION: &str = "api.v1";

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct MigrateResult {
    pub dry_run: bool,
    pub current_version: i64,
    pub target_version: i64,
    pub would_apply_versions: Vec<i64>,
    pub inferred_from_legacy: bool,
    pub after_version: Option<i64>,
    pub up_to_date: Option<bool>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct IngestRequest {
    pub file: PathBuf,
    /// Defaults to the file name of `file`.
    #[serde(default)]
    pub source_name: Option<String>,
    #[serde(default)]
    pub element_type: Option<String>,
    /// Overrides the model header time stamp.
    #[serde(default)]
    pub observation_date: Option<DateToken>,
    #[serde(default)]
    pub reactivation: Option<ReactivationPolicy>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct IngestResult {
    pub file: PathBuf,
    pub element_type: String,
    pub extracted: usize,
    pub without_container: usize,
    pub report: ReconcileReport,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SetApprovalRequest {
    pub identifier: Guid,
    pub role: Role,
    pub value: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ApproveIdentifiersRequest {
    pub role: Role,
    pub identifiers: Vec<Guid>,
    #[serde(default = "default_approval_value")]
    pub value: bool,
}

fn default_approval_value() -> bool {
    true
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SetStatusRequest {
    pub identifier: Guid,
    pub status: EntryStatus,
    #[serde(default)]
    pub date: Option<DateToken>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct EditResult {
    pub identifier: Guid,
    pub row: LedgerRow,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct CsvExportResult {
    pub out: PathBuf,
    pub rows: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct WriteBackRequest {
    pub file: PathBuf,
    pub out: PathBuf,
    #[serde(default)]
    pub source_name: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct WriteBackResult {
    pub file: PathBuf,
    pub out: PathBuf,
    pub rows_considered: usize,
    pub report: WriteBackReport,
}

/// Ledger operations over one database path. Each call opens its own store
/// connection and migrates before writing.
#[derive(Debug, Clone)]
pub struct LedgerApi {
    db_path: PathBuf,
    config: LedgerConfig,
}

impl LedgerApi {
    #[must_use]
    pub fn new(db_path: PathBuf) -> Self {
        Self::with_config(db_path, LedgerConfig::default())
    }

    #[must_use]
    pub fn with_config(db_path: PathBuf, config: LedgerConfig) -> Self {
        Self { db_path, config }
    }

    #[must_use]
    pub fn db_path(&self) -> &Path {
        &self.db_path
    }

    #[must_use]
    pub fn config(&self) -> &LedgerConfig {
        &self.config
    }

    fn open_store(&self) -> Result<SqliteStore> {
        SqliteStore::open(&self.db_path)
    }

    fn open_migrated(&self) -> Result<SqliteStore> {
        let mut store = self.open_store()?;
        store.migrate()?;
        Ok(store)
    }

    /// Store for read paths. Never runs DDL; a pending migration is an error.
    fn open_current(&self) -> Result<SqliteStore> {
        let store = self.open_store()?;
        let status = store.schema_status()?;
        if !status.pending_versions.is_empty() {
            return Err(anyhow!(
                "ledger schema is at version {} but {} is required; run `db migrate` first",
                status.current_version,
                status.target_version
            ));
        }
        Ok(store)
    }

    /// Inspect schema status without mutating data.
    ///
    /// # Errors
    /// Returns an error when the `SQLite` database cannot be opened or queried.
    pub fn schema_status(&self) -> Result<SchemaStatus> {
        let store = self.open_store()?;
        store.schema_status()
    }

    /// Apply pending migrations, or return planned versions for dry-run mode.
    ///
    /// # Errors
    /// Returns an error when migration planning or execution fails.
    pub fn migrate(&self, dry_run: bool) -> Result<MigrateResult> {
        let mut store = self.open_store()?;
        let before = store.schema_status()?;
        if dry_run {
            return Ok(MigrateResult {
                dry_run: true,
                current_version: before.current_version,
                target_version: before.target_version,
                would_apply_versions: before.pending_versions,
                inferred_from_legacy: before.inferred_from_legacy,
                after_version: None,
                up_to_date: None,
            });
        }

        let planned_versions = before.pending_versions;
        store.migrate()?;
        let after = store.schema_status()?;
        Ok(MigrateResult {
            dry_run: false,
            current_version: before.current_version,
            target_version: before.target_version,
            would_apply_versions: planned_versions,
            inferred_from_legacy: before.inferred_from_legacy,
            after_version: Some(after.current_version),
            up_to_date: Some(after.pending_versions.is_empty()),
        })
    }

    /// # Errors
    /// Returns an error when the backup cannot be written.
    pub fn backup(&self, out: &Path) -> Result<()> {
        self.open_store()?.backup_database(out)
    }

    /// # Errors
    /// Returns an error when the backup is missing or cannot be restored.
    pub fn restore(&self, input: &Path) -> Result<()> {
        self.open_store()?.restore_database(input)
    }

    /// # Errors
    /// Returns an error when an integrity query fails.
    pub fn integrity_check(&self) -> Result<IntegrityReport> {
        self.open_store()?.integrity_check()
    }

    /// Read a model, extract its tracked elements, and reconcile them into
    /// the ledger under one source name.
    ///
    /// # Errors
    /// Returns an error when the element type override is blank, the model
    /// cannot be read, the source name is empty, or the ledger transaction
    /// fails.
    pub fn ingest(&self, request: &IngestRequest) -> Result<IngestResult> {
        let options = self.extract_options(request.element_type.as_deref())?;
        let model = IfcModel::open(&request.file)
            .with_context(|| format!("failed to read model {}", request.file.display()))?;

        let records = extract(&model, &options);
        let without_container = records.iter().filter(|record| record.container.is_none()).count();
        let extracted = records.len();

        let source_name = match &request.source_name {
            Some(name) => name.clone(),
            None => default_source_name(&request.file)?,
        };
        let observation_date =
            request.observation_date.clone().or_else(|| model.observation_date());
        let policy = request.reactivation.unwrap_or(self.config.reactivation);
        if extracted == 0 {
            tracing::warn!(
                source_name = %source_name,
                element_type = %options.element_type,
                "no matching elements; active rows of this source will be marked deleted"
            );
        }

        let mut store = self.open_migrated()?;
        let report = reconcile(
            &mut store,
            &ReconcileRequest {
                source_name,
                observation_date,
                elements: records.into_iter().map(ExtractedElement::from).collect(),
            },
            policy,
        )?;

        Ok(IngestResult {
            file: request.file.clone(),
            element_type: options.element_type,
            extracted,
            without_container,
            report,
        })
    }

    /// # Errors
    /// Returns an error when the schema is not migrated or the ledger cannot
    /// be read.
    pub fn list_rows(&self, filter: &LedgerFilter) -> Result<Vec<LedgerRow>> {
        self.open_current()?.list_rows(filter)
    }

    /// # Errors
    /// Returns an error when the ledger cannot be read.
    pub fn stats(&self) -> Result<LedgerStats> {
        self.open_current()?.ledger_stats()
    }

    /// # Errors
    /// Returns an error when the run log cannot be read.
    pub fn list_runs(&self, source_name: Option<&str>) -> Result<Vec<ReconcileRunSummary>> {
        self.open_current()?.list_runs(source_name)
    }

    /// # Errors
    /// Returns an error when the identifier is unknown or the update fails.
    pub fn set_approval(&self, request: &SetApprovalRequest) -> Result<EditResult> {
        let mut store = self.open_migrated()?;
        if !store.set_approval(&request.identifier, request.role, request.value)? {
            return Err(anyhow!("ledger row not found: {}", request.identifier));
        }
        edit_result(&store, &request.identifier)
    }

    /// # Errors
    /// Returns an error when the identifier is unknown or the update fails.
    pub fn set_status(&self, request: &SetStatusRequest) -> Result<EditResult> {
        let mut store = self.open_migrated()?;
        if !store.set_status(&request.identifier, request.status, request.date.clone())? {
            return Err(anyhow!("ledger row not found: {}", request.identifier));
        }
        edit_result(&store, &request.identifier)
    }

    /// # Errors
    /// Returns an error when the list is empty or the transaction fails.
    pub fn approve_identifiers(
        &self,
        request: &ApproveIdentifiersRequest,
    ) -> Result<ApprovalImportSummary> {
        if request.identifiers.is_empty() {
            return Err(anyhow!("identifier list is empty"));
        }
        self.open_migrated()?.approve_identifiers(request.role, &request.identifiers, request.value)
    }

    /// Apply an approval list read from a text, CSV, or spreadsheet file.
    ///
    /// # Errors
    /// Returns an error when the file cannot be read or yields no identifiers.
    pub fn approve_from_file(
        &self,
        role: Role,
        path: &Path,
        value: bool,
    ) -> Result<ApprovalImportSummary> {
        let identifiers = read_identifier_file(path)?;
        if identifiers.is_empty() {
            return Err(anyhow!("no identifiers found in {}", path.display()));
        }
        self.approve_identifiers(&ApproveIdentifiersRequest { role, identifiers, value })
    }

    /// # Errors
    /// Returns an error when the CSV cannot be written.
    pub fn export_csv(&self, out: &Path, filter: &LedgerFilter) -> Result<CsvExportResult> {
        let rows = self.open_current()?.export_csv(out, filter)?;
        Ok(CsvExportResult { out: out.to_path_buf(), rows })
    }

    /// # Errors
    /// Returns an error when the model cannot be read.
    pub fn model_info(&self, file: &Path) -> Result<ModelInfo> {
        Ok(IfcModel::open(file)?.info())
    }

    /// Extraction without touching the ledger.
    ///
    /// # Errors
    /// Returns an error when the model cannot be read.
    pub fn model_extract(
        &self,
        file: &Path,
        element_type: Option<&str>,
    ) -> Result<Vec<ElementRecord>> {
        let options = self.extract_options(element_type)?;
        let model = IfcModel::open(file)?;
        Ok(extract(&model, &options))
    }

    /// Configured extraction options with an optional per-request type.
    fn extract_options(&self, element_type: Option<&str>) -> Result<ExtractOptions> {
        let mut options = self.config.extract_options();
        if let Some(element_type) = element_type {
            if element_type.trim().is_empty() {
                return Err(anyhow!("element_type cannot be empty"));
            }
            options.element_type = element_type.to_string();
        }
        Ok(options)
    }

    /// Write ledger approvals into a copy of the model.
    ///
    /// # Errors
    /// Returns an error when the model cannot be read, `out` equals the
    /// input path, or the output cannot be written.
    pub fn write_back(&self, request: &WriteBackRequest) -> Result<WriteBackResult> {
        if request.out == request.file {
            return Err(anyhow!("write-back output must differ from the input model"));
        }
        let model = IfcModel::open(&request.file)?;
        let filter =
            LedgerFilter { source_name: request.source_name.clone(), ..LedgerFilter::default() };
        let rows = self.open_current()?.list_rows(&filter)?;

        let written = write_back_approvals(&model, &rows, &self.config.write_back_options())?;
        if let Some(parent) = request.out.parent().filter(|parent| !parent.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("failed to create {}", parent.display()))?;
        }
        std::fs::write(&request.out, written.content)
            .with_context(|| format!("failed to write model {}", request.out.display()))?;

        Ok(WriteBackResult {
            file: request.file.clone(),
            out: request.out.clone(),
            rows_considered: rows.len(),
            report: written.report,
        })
    }
}

fn edit_result(store: &SqliteStore, identifier: &Guid) -> Result<EditResult> {
    let row = store
        .get_row(identifier)?
        .ok_or_else(|| anyhow!("ledger row not found: {identifier}"))?;
    Ok(EditResult { identifier: identifier.clone(), row })
}

fn default_source_name(file: &Path) -> Result<String> {
    file.file_name()
        .and_then(|name| name.to_str())
        .map(str::to_string)
        .ok_or_else(|| anyhow!("cannot derive a source name from {}", file.display()))
}
