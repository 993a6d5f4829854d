use std::collections::BTreeSet;
use std::fs::{self, File};
use std::io::{BufWriter, Write};
use std::path::Path;

use anyhow::{anyhow, Context, Result};
use ifc_ledger_core::{
    ApprovalImportSummary, DateToken, EntryStatus, Guid, LedgerError, LedgerFilter, LedgerRow,
    LedgerStats, LedgerStore, LedgerTransaction, ReconcileReport, ReconcileRunSummary, Role,
};
use rusqlite::{
    params, params_from_iter, Connection, DatabaseName, OptionalExtension, TransactionBehavior,
};
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

const LATEST_SCHEMA_VERSION: i64 = 3;

/// Upper bound on bound parameters per `IN (...)` lookup.
const IN_CHUNK: usize = 500;

const CREATE_SCHEMA_MIGRATIONS_SQL: &str = r"
CREATE TABLE IF NOT EXISTS schema_migrations (
  version INTEGER PRIMARY KEY,
  applied_at TEXT NOT NULL
);
";

/// Shape written by the first generation of the tool: no uniqueness.
const MIGRATION_001_SQL: &str = r"
CREATE TABLE IF NOT EXISTS ifc_objects (
  guid TEXT,
  filename TEXT,
  BuildingStorey TEXT,
  added_timestamp TEXT,
  status TEXT DEFAULT 'active',
  approval_architect BOOLEAN DEFAULT FALSE,
  approval_structure BOOLEAN DEFAULT FALSE,
  deletion_date TEXT
);
";

/// Columns a first-generation table may be missing. `guid` and `filename`
/// are mandatory.
const LEGACY_OPTIONAL_COLUMNS: [(&str, &str); 6] = [
    ("BuildingStorey", "TEXT"),
    ("added_timestamp", "TEXT"),
    ("status", "TEXT DEFAULT 'active'"),
    ("approval_architect", "BOOLEAN DEFAULT FALSE"),
    ("approval_structure", "BOOLEAN DEFAULT FALSE"),
    ("deletion_date", "TEXT"),
];

const MIGRATION_002_CREATE_V2_TABLE_SQL: &str = r"
CREATE TABLE ifc_objects_v2 (
  IfcGuid TEXT NOT NULL UNIQUE,
  Filename TEXT NOT NULL,
  BuildingStorey TEXT,
  Status TEXT NOT NULL DEFAULT 'active' CHECK (Status IN ('active', 'deleted')),
  ArchitectApproval BOOLEAN NOT NULL DEFAULT FALSE,
  StructuralApproval BOOLEAN NOT NULL DEFAULT FALSE,
  added_date TEXT,
  deleted_date TEXT
);
";

// First row per guid wins; legacy timestamps are reduced to YYMMDD.
const MIGRATION_002_COPY_SQL: &str = r"
INSERT OR IGNORE INTO ifc_objects_v2(
  IfcGuid, Filename, BuildingStorey, Status,
  ArchitectApproval, StructuralApproval, added_date, deleted_date
)
SELECT
  guid,
  COALESCE(filename, ''),
  BuildingStorey,
  normalized_status,
  CASE WHEN LOWER(CAST(COALESCE(approval_architect, 0) AS TEXT)) IN ('1', 'true', 'yes')
    THEN 1 ELSE 0 END,
  CASE WHEN LOWER(CAST(COALESCE(approval_structure, 0) AS TEXT)) IN ('1', 'true', 'yes')
    THEN 1 ELSE 0 END,
  CASE
    WHEN added_timestamp GLOB '[0-9][0-9][0-9][0-9][0-9][0-9]' THEN added_timestamp
    WHEN added_timestamp GLOB '[0-9][0-9][0-9][0-9]-[0-9][0-9]-[0-9][0-9]*'
      THEN substr(added_timestamp, 3, 2) || substr(added_timestamp, 6, 2)
        || substr(added_timestamp, 9, 2)
    ELSE NULL
  END,
  CASE
    WHEN normalized_status = 'active' THEN NULL
    WHEN deletion_date GLOB '[0-9][0-9][0-9][0-9][0-9][0-9]' THEN deletion_date
    WHEN deletion_date GLOB '[0-9][0-9][0-9][0-9]-[0-9][0-9]-[0-9][0-9]*'
      THEN substr(deletion_date, 3, 2) || substr(deletion_date, 6, 2) || substr(deletion_date, 9, 2)
    ELSE NULL
  END
FROM (
  SELECT
    *,
    CASE
      WHEN LOWER(TRIM(COALESCE(status, 'active'))) IN ('deleted', 'removed', 'inactive')
        THEN 'deleted'
      ELSE 'active'
    END AS normalized_status
  FROM ({source})
  WHERE guid IS NOT NULL AND guid <> ''
)
ORDER BY legacy_rowid ASC;
";

/// First-generation column names, fed into the v2 copy.
const MIGRATION_002_LEGACY_SOURCE_SQL: &str = "SELECT rowid AS legacy_rowid, guid, filename, \
    BuildingStorey, status, approval_architect, approval_structure, added_timestamp, \
    deletion_date FROM ifc_objects";

/// Unique-shape table written by the standalone guid-unique script. Values
/// were copied there verbatim, so they go through the same normalisation.
const MIGRATION_002_UNIQUE_SOURCE_SQL: &str = "SELECT rowid AS legacy_rowid, IfcGuid AS guid, \
    Filename AS filename, BuildingStorey, Status AS status, \
    ArchitectApproval AS approval_architect, StructuralApproval AS approval_structure, \
    added_date AS added_timestamp, deleted_date AS deletion_date FROM ifc_objects";

const MIGRATION_002_REPLACE_TABLE_SQL: &str = r"
DROP TABLE ifc_objects;
ALTER TABLE ifc_objects_v2 RENAME TO ifc_objects;
CREATE INDEX IF NOT EXISTS idx_ifc_objects_filename ON ifc_objects(Filename);
";

const MIGRATION_003_SQL: &str = r"
CREATE TABLE IF NOT EXISTS reconcile_runs (
  run_id TEXT PRIMARY KEY,
  source_name TEXT NOT NULL,
  observed_on TEXT NOT NULL,
  ran_at TEXT NOT NULL,
  inserted INTEGER NOT NULL CHECK (inserted >= 0),
  marked_deleted INTEGER NOT NULL CHECK (marked_deleted >= 0),
  reactivated INTEGER NOT NULL CHECK (reactivated >= 0),
  unchanged INTEGER NOT NULL CHECK (unchanged >= 0),
  foreign_count INTEGER NOT NULL CHECK (foreign_count >= 0),
  ignored_duplicates INTEGER NOT NULL CHECK (ignored_duplicates >= 0)
);
CREATE INDEX IF NOT EXISTS idx_reconcile_runs_source ON reconcile_runs(source_name, ran_at);
";

const ROW_COLUMNS: &str = "IfcGuid, Filename, BuildingStorey, Status, ArchitectApproval, \
                           StructuralApproval, added_date, deleted_date";

const RUN_COLUMNS: &str = "run_id, source_name, observed_on, ran_at, inserted, marked_deleted, \
                           reactivated, unchanged, foreign_count, ignored_duplicates";

const CSV_HEADER: [&str; 8] = [
    "IfcGuid",
    "Filename",
    "BuildingStorey",
    "Status",
    "ArchitectApproval",
    "StructuralApproval",
    "added_date",
    "deleted_date",
];

pub struct SqliteStore {
    conn: Connection,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SchemaStatus {
    pub current_version: i64,
    pub target_version: i64,
    pub pending_versions: Vec<i64>,
    pub inferred_from_legacy: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct IntegrityReport {
    pub quick_check_ok: bool,
    pub quick_check_message: String,
    pub duplicate_identifiers: Vec<String>,
    pub active_rows_with_deleted_date: usize,
    pub schema_status: SchemaStatus,
}

impl SqliteStore {
    /// Open a SQLite-backed ledger and configure required runtime pragmas.
    ///
    /// # Errors
    /// Returns an error when the database cannot be opened or pragmas cannot be applied.
    pub fn open(path: &Path) -> Result<Self> {
        let conn = Connection::open(path)
            .with_context(|| format!("failed to open sqlite database at {}", path.display()))?;

        conn.execute_batch(
            "PRAGMA journal_mode = WAL;
             PRAGMA foreign_keys = ON;
             PRAGMA busy_timeout = 5000;",
        )
        .context("failed to configure sqlite pragmas")?;

        Ok(Self { conn })
    }

    /// Report current and target schema versions plus pending migrations.
    /// Read-only: nothing is created on a fresh database.
    ///
    /// # Errors
    /// Returns an error when schema metadata cannot be read.
    pub fn schema_status(&self) -> Result<SchemaStatus> {
        let (current_version, inferred_from_legacy) = detect_effective_schema_version(&self.conn)?;
        let pending_versions = if current_version < LATEST_SCHEMA_VERSION {
            ((current_version + 1)..=LATEST_SCHEMA_VERSION).collect::<Vec<_>>()
        } else {
            Vec::new()
        };

        Ok(SchemaStatus {
            current_version,
            target_version: LATEST_SCHEMA_VERSION,
            pending_versions,
            inferred_from_legacy,
        })
    }

    /// Apply all forward migrations up to the latest supported schema version.
    ///
    /// # Errors
    /// Returns an error when migration bootstrapping or any migration step fails.
    pub fn migrate(&mut self) -> Result<()> {
        self.conn
            .execute_batch(CREATE_SCHEMA_MIGRATIONS_SQL)
            .context("failed to apply schema_migrations table")?;

        let mut version = current_schema_version(&self.conn)?;

        if version == 0 {
            version = self.bootstrap_schema_version()?;
        }

        if version < 2 {
            self.apply_migration_2()?;
            version = current_schema_version(&self.conn)?;
        }

        if version < 3 {
            apply_migration_3(&self.conn)?;
            version = current_schema_version(&self.conn)?;
        }

        if version != LATEST_SCHEMA_VERSION {
            return Err(anyhow!(
                "unsupported schema version {version}; expected {LATEST_SCHEMA_VERSION}"
            ));
        }

        Ok(())
    }

    fn bootstrap_schema_version(&self) -> Result<i64> {
        if !table_exists(&self.conn, "ifc_objects")? {
            apply_migration_1(&self.conn)?;
            return Ok(1);
        }

        if table_has_column(&self.conn, "ifc_objects", "IfcGuid")? {
            // Unique shape produced by the standalone migration script, without
            // migration records. Its values still need the v2 rebuild.
            record_schema_version(&self.conn, 1)?;
            return Ok(1);
        }

        if table_has_column(&self.conn, "ifc_objects", "guid")? {
            if !table_has_column(&self.conn, "ifc_objects", "filename")? {
                return Err(anyhow!(
                    "database schema is invalid: legacy ifc_objects has no filename column"
                ));
            }
            for (column, definition) in LEGACY_OPTIONAL_COLUMNS {
                if !table_has_column(&self.conn, "ifc_objects", column)? {
                    tracing::info!(column, "adding missing legacy column");
                    self.conn
                        .execute_batch(&format!(
                            "ALTER TABLE ifc_objects ADD COLUMN {column} {definition};"
                        ))
                        .with_context(|| format!("failed to add legacy column {column}"))?;
                }
            }
            record_schema_version(&self.conn, 1)?;
            return Ok(1);
        }

        Err(anyhow!("database schema is invalid: ifc_objects has neither guid nor IfcGuid"))
    }

    fn apply_migration_2(&mut self) -> Result<()> {
        let source = if table_has_column(&self.conn, "ifc_objects", "IfcGuid")? {
            MIGRATION_002_UNIQUE_SOURCE_SQL
        } else if table_has_column(&self.conn, "ifc_objects", "guid")? {
            MIGRATION_002_LEGACY_SOURCE_SQL
        } else {
            return Err(anyhow!(
                "cannot apply migration v2: ifc_objects has neither guid nor IfcGuid"
            ));
        };

        let tx = self.conn.transaction().context("failed to start migration v2 transaction")?;

        let legacy_rows: i64 = tx
            .query_row("SELECT COUNT(*) FROM ifc_objects", [], |row| row.get(0))
            .context("failed to count legacy rows")?;
        tx.execute_batch(MIGRATION_002_CREATE_V2_TABLE_SQL)
            .context("failed to create v2 staging table")?;
        let copied = tx
            .execute(&MIGRATION_002_COPY_SQL.replace("{source}", source), [])
            .context("failed to copy legacy ifc_objects rows into v2")?;
        let cleared_dates = clear_invalid_dates(&tx)?;
        tx.execute_batch(MIGRATION_002_REPLACE_TABLE_SQL)
            .context("failed to replace legacy table with v2 table")?;

        let now = now_rfc3339()?;
        tx.execute(
            "INSERT OR IGNORE INTO schema_migrations(version, applied_at) VALUES (?1, ?2)",
            params![2_i64, now],
        )
        .context("failed to record migration version 2")?;

        tx.commit().context("failed to commit migration v2")?;
        tracing::info!(legacy_rows, copied, cleared_dates, "applied migration v2");
        Ok(())
    }

    /// Rows matching `filter`, ordered by identifier.
    ///
    /// # Errors
    /// Returns an error when the query fails or a stored row does not decode.
    pub fn list_rows(&self, filter: &LedgerFilter) -> Result<Vec<LedgerRow>> {
        let mut clauses = Vec::new();
        let mut values: Vec<String> = Vec::new();
        if let Some(source_name) = &filter.source_name {
            values.push(source_name.clone());
            clauses.push(format!("Filename = ?{}", values.len()));
        }
        if let Some(status) = filter.status {
            values.push(status.as_str().to_string());
            clauses.push(format!("Status = ?{}", values.len()));
        }
        if let Some(container) = &filter.container {
            values.push(container.clone());
            clauses.push(format!("BuildingStorey = ?{}", values.len()));
        }
        if let Some(needle) = &filter.identifier_contains {
            values.push(needle.clone());
            clauses.push(format!("instr(IfcGuid, ?{}) > 0", values.len()));
        }

        let mut sql = format!("SELECT {ROW_COLUMNS} FROM ifc_objects");
        if !clauses.is_empty() {
            sql.push_str(" WHERE ");
            sql.push_str(&clauses.join(" AND "));
        }
        sql.push_str(" ORDER BY IfcGuid ASC");

        query_rows(&self.conn, &sql, params_from_iter(values.iter()))
    }

    /// # Errors
    /// Returns an error when the query fails or the stored row does not decode.
    pub fn get_row(&self, identifier: &Guid) -> Result<Option<LedgerRow>> {
        let raw = self
            .conn
            .query_row(
                &format!("SELECT {ROW_COLUMNS} FROM ifc_objects WHERE IfcGuid = ?1"),
                params![identifier.as_str()],
                RawLedgerRow::from_row,
            )
            .optional()
            .with_context(|| format!("failed to load ledger row {identifier}"))?;
        raw.map(RawLedgerRow::into_ledger_row).transpose()
    }

    /// # Errors
    /// Returns an error when the ledger cannot be read.
    pub fn ledger_stats(&self) -> Result<LedgerStats> {
        Ok(LedgerStats::from_rows(&self.list_rows(&LedgerFilter::default())?))
    }

    /// Set one approval flag. Returns whether the identifier exists.
    ///
    /// # Errors
    /// Returns an error when the update fails.
    pub fn set_approval(&mut self, identifier: &Guid, role: Role, value: bool) -> Result<bool> {
        let changed = update_approval(&self.conn, identifier, role, value)?;
        tracing::info!(%identifier, role = role.as_str(), value, found = changed, "approval set");
        Ok(changed)
    }

    /// Manual status edit. `Deleted` stamps `removed_on` (given date, else
    /// today); `Active` clears it. Returns whether the identifier exists.
    ///
    /// # Errors
    /// Returns an error when the update fails.
    pub fn set_status(
        &mut self,
        identifier: &Guid,
        status: EntryStatus,
        removed_on: Option<DateToken>,
    ) -> Result<bool> {
        let updated = match status {
            EntryStatus::Deleted => {
                let removed_on = removed_on.unwrap_or_else(DateToken::today);
                self.conn.execute(
                    "UPDATE ifc_objects SET Status = 'deleted', deleted_date = ?2
                     WHERE IfcGuid = ?1",
                    params![identifier.as_str(), removed_on.as_str()],
                )
            }
            EntryStatus::Active => self.conn.execute(
                "UPDATE ifc_objects SET Status = 'active', deleted_date = NULL WHERE IfcGuid = ?1",
                params![identifier.as_str()],
            ),
        }
        .with_context(|| format!("failed to set status of {identifier}"))?;

        tracing::info!(%identifier, status = status.as_str(), found = updated > 0, "status set");
        Ok(updated > 0)
    }

    /// Set one approval flag on many identifiers in a single transaction.
    ///
    /// # Errors
    /// Returns an error when any update fails; nothing is applied in that case.
    pub fn approve_identifiers(
        &mut self,
        role: Role,
        identifiers: &[Guid],
        value: bool,
    ) -> Result<ApprovalImportSummary> {
        let tx = self.conn.transaction().context("failed to start approval transaction")?;
        let mut seen = BTreeSet::new();
        let mut summary =
            ApprovalImportSummary { role, value, requested: 0, updated: 0, unknown: Vec::new() };

        for identifier in identifiers {
            if !seen.insert(identifier) {
                continue;
            }
            summary.requested += 1;
            if update_approval(&tx, identifier, role, value)? {
                summary.updated += 1;
            } else {
                summary.unknown.push(identifier.clone());
            }
        }

        tx.commit().context("failed to commit approval transaction")?;
        tracing::info!(
            role = role.as_str(),
            requested = summary.requested,
            updated = summary.updated,
            unknown = summary.unknown.len(),
            "approval list applied"
        );
        Ok(summary)
    }

    /// Recorded reconciliation runs, oldest first.
    ///
    /// # Errors
    /// Returns an error when the query fails or a stored run does not decode.
    pub fn list_runs(&self, source_name: Option<&str>) -> Result<Vec<ReconcileRunSummary>> {
        let mut stmt = self
            .conn
            .prepare(&format!(
                "SELECT {RUN_COLUMNS} FROM reconcile_runs
                 WHERE ?1 IS NULL OR source_name = ?1
                 ORDER BY ran_at ASC, run_id ASC"
            ))
            .context("failed to prepare reconcile run query")?;
        let rows = stmt.query_map(params![source_name], RawRunRow::from_row)?;

        let mut runs = Vec::new();
        for row in rows {
            runs.push(row.context("failed to read reconcile run row")?.into_summary()?);
        }
        Ok(runs)
    }

    /// Write rows matching `filter` as CSV with a header line. Returns the
    /// number of data rows written.
    ///
    /// # Errors
    /// Returns an error when the ledger cannot be read or the file cannot be written.
    pub fn export_csv(&self, out_file: &Path, filter: &LedgerFilter) -> Result<usize> {
        let rows = self.list_rows(filter)?;
        if let Some(parent) = out_file.parent().filter(|parent| !parent.as_os_str().is_empty()) {
            fs::create_dir_all(parent).with_context(|| {
                format!("failed to create parent directory for {}", out_file.display())
            })?;
        }
        let file = File::create(out_file)
            .with_context(|| format!("failed to create CSV file {}", out_file.display()))?;
        let mut writer = BufWriter::new(file);

        writeln!(writer, "{}", CSV_HEADER.join(","))
            .with_context(|| format!("failed to write CSV file {}", out_file.display()))?;
        for row in &rows {
            let fields = [
                csv_escape(row.identifier.as_str()),
                csv_escape(&row.source_name),
                csv_escape(row.container.as_deref().unwrap_or("")),
                row.status.as_str().to_string(),
                row.architect_approval.to_string(),
                row.structural_approval.to_string(),
                row.added_on.as_ref().map(ToString::to_string).unwrap_or_default(),
                row.removed_on.as_ref().map(ToString::to_string).unwrap_or_default(),
            ];
            writeln!(writer, "{}", fields.join(","))
                .with_context(|| format!("failed to write CSV file {}", out_file.display()))?;
        }
        writer.flush().with_context(|| format!("failed to flush CSV file {}", out_file.display()))?;

        Ok(rows.len())
    }

    /// Create a `SQLite` backup file of the current main database.
    ///
    /// # Errors
    /// Returns an error when backup directories cannot be created or backup fails.
    pub fn backup_database(&self, out_file: &Path) -> Result<()> {
        if let Some(parent) = out_file.parent() {
            fs::create_dir_all(parent).with_context(|| {
                format!("failed to create parent directory for backup file {}", out_file.display())
            })?;
        }

        self.conn
            .backup(DatabaseName::Main, out_file, None)
            .with_context(|| format!("failed to create sqlite backup at {}", out_file.display()))
    }

    /// Restore this database from a `SQLite` backup file, then migrate to latest.
    ///
    /// # Errors
    /// Returns an error when the backup file is missing, restore fails, or migrations fail.
    pub fn restore_database(&mut self, in_file: &Path) -> Result<()> {
        if !in_file.exists() {
            return Err(anyhow!("backup file does not exist: {}", in_file.display()));
        }

        self.conn
            .restore(DatabaseName::Main, in_file, None::<fn(rusqlite::backup::Progress)>)
            .with_context(|| {
                format!("failed to restore sqlite backup from {}", in_file.display())
            })?;

        self.migrate()?;
        Ok(())
    }

    /// Run quick-check, duplicate-identifier, and schema status health checks.
    ///
    /// # Errors
    /// Returns an error when any integrity query fails.
    pub fn integrity_check(&self) -> Result<IntegrityReport> {
        let quick_check_message: String = self
            .conn
            .query_row("PRAGMA quick_check", [], |row| row.get::<_, String>(0))
            .context("failed to run PRAGMA quick_check")?;

        let schema_status = self.schema_status()?;

        let identifier_column = if table_has_column(&self.conn, "ifc_objects", "IfcGuid")? {
            Some(("IfcGuid", "Status", "deleted_date"))
        } else if table_has_column(&self.conn, "ifc_objects", "guid")? {
            Some(("guid", "status", "deletion_date"))
        } else {
            None
        };

        let mut duplicate_identifiers = Vec::new();
        let mut active_rows_with_deleted_date = 0;
        if let Some((identifier, status, deleted)) = identifier_column {
            let mut stmt = self
                .conn
                .prepare(&format!(
                    "SELECT {identifier} FROM ifc_objects
                     WHERE {identifier} IS NOT NULL
                     GROUP BY {identifier} HAVING COUNT(*) > 1
                     ORDER BY {identifier} ASC"
                ))
                .context("failed to prepare duplicate identifier query")?;
            let rows = stmt.query_map([], |row| row.get::<_, String>(0))?;
            for row in rows {
                duplicate_identifiers.push(row?);
            }

            let count: i64 = self
                .conn
                .query_row(
                    &format!(
                        "SELECT COUNT(*) FROM ifc_objects
                         WHERE LOWER(COALESCE({status}, 'active')) = 'active'
                           AND {deleted} IS NOT NULL"
                    ),
                    [],
                    |row| row.get(0),
                )
                .context("failed to run deleted-date query")?;
            active_rows_with_deleted_date = usize::try_from(count).unwrap_or_default();
        }

        Ok(IntegrityReport {
            quick_check_ok: quick_check_message == "ok",
            quick_check_message,
            duplicate_identifiers,
            active_rows_with_deleted_date,
            schema_status,
        })
    }
}

impl LedgerStore for SqliteStore {
    fn with_transaction<T, F>(&mut self, work: F) -> Result<T, LedgerError>
    where
        F: FnOnce(&dyn LedgerTransaction) -> Result<T, LedgerError>,
    {
        let tx = self
            .conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .context("failed to start ledger transaction")
            .map_err(store_error)?;

        // Dropping `tx` without commit rolls back.
        let value = work(&SqliteTransaction { conn: &tx })?;

        tx.commit().context("failed to commit ledger transaction").map_err(store_error)?;
        Ok(value)
    }
}

struct SqliteTransaction<'a> {
    conn: &'a Connection,
}

impl LedgerTransaction for SqliteTransaction<'_> {
    fn rows_for_source(&self, source_name: &str) -> Result<Vec<LedgerRow>, LedgerError> {
        query_rows(
            self.conn,
            &format!(
                "SELECT {ROW_COLUMNS} FROM ifc_objects WHERE Filename = ?1 ORDER BY IfcGuid ASC"
            ),
            params![source_name],
        )
        .map_err(store_error)
    }

    fn existing_identifiers(&self, candidates: &[Guid]) -> Result<BTreeSet<Guid>, LedgerError> {
        let mut existing = BTreeSet::new();
        for chunk in candidates.chunks(IN_CHUNK) {
            let placeholders =
                (1..=chunk.len()).map(|index| format!("?{index}")).collect::<Vec<_>>();
            let sql = format!(
                "SELECT IfcGuid FROM ifc_objects WHERE IfcGuid IN ({})",
                placeholders.join(", ")
            );
            let found = (|| -> Result<Vec<String>> {
                let mut stmt =
                    self.conn.prepare(&sql).context("failed to prepare identifier lookup")?;
                let rows = stmt.query_map(
                    params_from_iter(chunk.iter().map(Guid::as_str)),
                    |row| row.get::<_, String>(0),
                )?;
                rows.collect::<rusqlite::Result<Vec<_>>>()
                    .context("failed to read identifier lookup")
            })()
            .map_err(store_error)?;

            for raw in found {
                existing.insert(Guid::parse(raw)?);
            }
        }
        Ok(existing)
    }

    fn insert_new_rows(&self, rows: &[LedgerRow]) -> Result<Vec<Guid>, LedgerError> {
        let mut inserted = Vec::new();
        for row in rows {
            if insert_row(self.conn, row).map_err(store_error)? {
                inserted.push(row.identifier.clone());
            }
        }
        Ok(inserted)
    }

    fn mark_deleted(
        &self,
        identifiers: &[Guid],
        removed_on: &DateToken,
    ) -> Result<usize, LedgerError> {
        let mut changed = 0;
        for identifier in identifiers {
            changed += self
                .conn
                .execute(
                    "UPDATE ifc_objects SET Status = 'deleted', deleted_date = ?2
                     WHERE IfcGuid = ?1 AND Status = 'active'",
                    params![identifier.as_str(), removed_on.as_str()],
                )
                .with_context(|| format!("failed to mark {identifier} deleted"))
                .map_err(store_error)?;
        }
        Ok(changed)
    }

    fn reactivate(&self, identifiers: &[Guid]) -> Result<usize, LedgerError> {
        let mut changed = 0;
        for identifier in identifiers {
            changed += self
                .conn
                .execute(
                    "UPDATE ifc_objects SET Status = 'active', deleted_date = NULL
                     WHERE IfcGuid = ?1 AND Status = 'deleted'",
                    params![identifier.as_str()],
                )
                .with_context(|| format!("failed to reactivate {identifier}"))
                .map_err(store_error)?;
        }
        Ok(changed)
    }

    fn record_run(&self, report: &ReconcileReport) -> Result<(), LedgerError> {
        insert_run(self.conn, &ReconcileRunSummary::from(report)).map_err(store_error)?;
        tracing::info!(
            run_id = %report.run_id,
            source_name = %report.source_name,
            inserted = report.inserted.len(),
            marked_deleted = report.marked_deleted.len(),
            reactivated = report.reactivated.len(),
            foreign = report.foreign.len(),
            "reconcile run recorded"
        );
        Ok(())
    }
}

struct RawLedgerRow {
    identifier: String,
    source_name: String,
    container: Option<String>,
    status: String,
    architect_approval: bool,
    structural_approval: bool,
    added_on: Option<String>,
    removed_on: Option<String>,
}

impl RawLedgerRow {
    fn from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            identifier: row.get(0)?,
            source_name: row.get(1)?,
            container: row.get(2)?,
            status: row.get(3)?,
            architect_approval: row.get(4)?,
            structural_approval: row.get(5)?,
            added_on: row.get(6)?,
            removed_on: row.get(7)?,
        })
    }

    fn into_ledger_row(self) -> Result<LedgerRow> {
        let status = EntryStatus::parse(&self.status).ok_or_else(|| {
            anyhow!("unknown status {:?} for identifier {}", self.status, self.identifier)
        })?;
        Ok(LedgerRow {
            identifier: Guid::parse(self.identifier).map_err(|err| anyhow!("{err}"))?,
            source_name: self.source_name,
            container: self.container,
            status,
            architect_approval: self.architect_approval,
            structural_approval: self.structural_approval,
            added_on: parse_date_token(self.added_on.as_deref())?,
            removed_on: parse_date_token(self.removed_on.as_deref())?,
        })
    }
}

struct RawRunRow {
    run_id: String,
    source_name: String,
    observed_on: String,
    ran_at: String,
    counts: [i64; 6],
}

impl RawRunRow {
    fn from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            run_id: row.get(0)?,
            source_name: row.get(1)?,
            observed_on: row.get(2)?,
            ran_at: row.get(3)?,
            counts: [row.get(4)?, row.get(5)?, row.get(6)?, row.get(7)?, row.get(8)?, row.get(9)?],
        })
    }

    fn into_summary(self) -> Result<ReconcileRunSummary> {
        let mut counts = [0_usize; 6];
        for (slot, raw) in counts.iter_mut().zip(self.counts) {
            *slot = usize::try_from(raw)
                .with_context(|| format!("negative count in run {}", self.run_id))?;
        }
        let [inserted, marked_deleted, reactivated, unchanged, foreign, ignored_duplicates] =
            counts;

        Ok(ReconcileRunSummary {
            observed_on: DateToken::parse(&self.observed_on).map_err(|err| anyhow!("{err}"))?,
            ran_at: parse_rfc3339(&self.ran_at)?,
            inserted,
            marked_deleted,
            reactivated,
            unchanged,
            foreign,
            ignored_duplicates,
            run_id: self.run_id,
            source_name: self.source_name,
        })
    }
}

fn query_rows<P: rusqlite::Params>(
    conn: &Connection,
    sql: &str,
    params: P,
) -> Result<Vec<LedgerRow>> {
    let mut stmt = conn.prepare(sql).context("failed to prepare ledger row query")?;
    let rows = stmt.query_map(params, RawLedgerRow::from_row)?;

    let mut decoded = Vec::new();
    for row in rows {
        decoded.push(row.context("failed to read ledger row")?.into_ledger_row()?);
    }
    Ok(decoded)
}

/// `INSERT OR IGNORE`; returns whether the row was written.
fn insert_row(conn: &Connection, row: &LedgerRow) -> Result<bool> {
    let written = conn
        .execute(
            &format!(
                "INSERT OR IGNORE INTO ifc_objects({ROW_COLUMNS})
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)"
            ),
            params![
                row.identifier.as_str(),
                row.source_name,
                row.container,
                row.status.as_str(),
                row.architect_approval,
                row.structural_approval,
                row.added_on.as_ref().map(DateToken::as_str),
                row.removed_on.as_ref().map(DateToken::as_str),
            ],
        )
        .with_context(|| format!("failed to insert ledger row {}", row.identifier))?;
    Ok(written > 0)
}

fn insert_run(conn: &Connection, run: &ReconcileRunSummary) -> Result<bool> {
    let counts = [
        run.inserted,
        run.marked_deleted,
        run.reactivated,
        run.unchanged,
        run.foreign,
        run.ignored_duplicates,
    ]
    .map(|count| i64::try_from(count).unwrap_or(i64::MAX));
    let written = conn
        .execute(
            &format!(
                "INSERT OR IGNORE INTO reconcile_runs({RUN_COLUMNS})
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)"
            ),
            params![
                run.run_id,
                run.source_name,
                run.observed_on.as_str(),
                rfc3339(run.ran_at)?,
                counts[0],
                counts[1],
                counts[2],
                counts[3],
                counts[4],
                counts[5],
            ],
        )
        .with_context(|| format!("failed to insert reconcile run {}", run.run_id))?;
    Ok(written > 0)
}

fn update_approval(conn: &Connection, identifier: &Guid, role: Role, value: bool) -> Result<bool> {
    let column = match role {
        Role::Architect => "ArchitectApproval",
        Role::Structural => "StructuralApproval",
    };
    let updated = conn
        .execute(
            &format!("UPDATE ifc_objects SET {column} = ?2 WHERE IfcGuid = ?1"),
            params![identifier.as_str(), value],
        )
        .with_context(|| format!("failed to set {column} for {identifier}"))?;
    Ok(updated > 0)
}

fn store_error(err: anyhow::Error) -> LedgerError {
    LedgerError::Store(format!("{err:#}"))
}

fn parse_date_token(raw: Option<&str>) -> Result<Option<DateToken>> {
    raw.filter(|value| !value.is_empty())
        .map(|value| DateToken::parse(value).map_err(|err| anyhow!("{err}")))
        .transpose()
}

fn csv_escape(value: &str) -> String {
    if value.contains([',', '"', '\n', '\r']) {
        format!("\"{}\"", value.replace('"', "\"\""))
    } else {
        value.to_string()
    }
}

fn apply_migration_1(conn: &Connection) -> Result<()> {
    conn.execute_batch(MIGRATION_001_SQL).context("failed to apply migration v1")?;
    record_schema_version(conn, 1)
}

fn apply_migration_3(conn: &Connection) -> Result<()> {
    conn.execute_batch(MIGRATION_003_SQL).context("failed to apply migration v3")?;
    record_schema_version(conn, 3)?;
    tracing::info!("applied migration v3");
    Ok(())
}

fn table_exists(conn: &Connection, table_name: &str) -> Result<bool> {
    let exists = conn
        .query_row(
            "SELECT EXISTS(SELECT 1 FROM sqlite_master WHERE type = 'table' AND name = ?1)",
            params![table_name],
            |row| row.get::<_, i64>(0),
        )
        .with_context(|| format!("failed to check if table exists: {table_name}"))?;
    Ok(exists == 1)
}

fn table_has_column(conn: &Connection, table: &str, column: &str) -> Result<bool> {
    if !table_exists(conn, table)? {
        return Ok(false);
    }

    let mut stmt = conn
        .prepare(&format!("PRAGMA table_info({table})"))
        .with_context(|| format!("failed to inspect table_info for {table}"))?;
    let mut rows = stmt.query([])?;

    while let Some(row) = rows.next()? {
        let name: String = row.get(1)?;
        if name == column {
            return Ok(true);
        }
    }

    Ok(false)
}

fn current_schema_version(conn: &Connection) -> Result<i64> {
    if !table_exists(conn, "schema_migrations")? {
        return Ok(0);
    }
    let version = conn
        .query_row("SELECT COALESCE(MAX(version), 0) FROM schema_migrations", [], |row| {
            row.get::<_, i64>(0)
        })
        .context("failed to read current schema version")?;
    Ok(version)
}

fn detect_effective_schema_version(conn: &Connection) -> Result<(i64, bool)> {
    let recorded = current_schema_version(conn)?;
    if recorded > 0 {
        return Ok((recorded, false));
    }

    if !table_exists(conn, "ifc_objects")? {
        return Ok((0, false));
    }

    if table_has_column(conn, "ifc_objects", "IfcGuid")?
        || table_has_column(conn, "ifc_objects", "guid")?
    {
        return Ok((1, true));
    }

    Err(anyhow!("database schema is invalid: ifc_objects has neither guid nor IfcGuid"))
}

/// Null out staged dates that look like `YYMMDD` but are not calendar dates.
fn clear_invalid_dates(conn: &Connection) -> Result<usize> {
    let mut invalid = Vec::new();
    {
        let mut stmt = conn
            .prepare("SELECT rowid, added_date, deleted_date FROM ifc_objects_v2")
            .context("failed to prepare staged date scan")?;
        let rows = stmt
            .query_map([], |row| {
                Ok((
                    row.get::<_, i64>(0)?,
                    row.get::<_, Option<String>>(1)?,
                    row.get::<_, Option<String>>(2)?,
                ))
            })
            .context("failed to scan staged dates")?;
        let is_bad = |value: Option<&str>| value.is_some_and(|raw| DateToken::parse(raw).is_err());
        for row in rows {
            let (rowid, added, deleted) = row.context("failed to decode staged dates")?;
            let (bad_added, bad_deleted) = (is_bad(added.as_deref()), is_bad(deleted.as_deref()));
            if bad_added || bad_deleted {
                invalid.push((rowid, bad_added, bad_deleted));
            }
        }
    }

    for (rowid, added, deleted) in &invalid {
        conn.execute(
            "UPDATE ifc_objects_v2
             SET added_date = CASE WHEN ?2 THEN NULL ELSE added_date END,
                 deleted_date = CASE WHEN ?3 THEN NULL ELSE deleted_date END
             WHERE rowid = ?1",
            params![rowid, added, deleted],
        )
        .context("failed to clear invalid staged date")?;
    }
    Ok(invalid.len())
}

fn record_schema_version(conn: &Connection, version: i64) -> Result<()> {
    let now = now_rfc3339()?;
    conn.execute(
        "INSERT OR IGNORE INTO schema_migrations(version, applied_at) VALUES (?1, ?2)",
        params![version, now],
    )
    .with_context(|| format!("failed to record migration version {version}"))?;
    Ok(())
}

fn now_rfc3339() -> Result<String> {
    rfc3339(OffsetDateTime::now_utc())
}

fn rfc3339(value: OffsetDateTime) -> Result<String> {
    value
        .format(&time::format_description::well_known::Rfc3339)
        .context("failed to format RFC3339 timestamp")
}

fn parse_rfc3339(value: &str) -> Result<OffsetDateTime> {
    OffsetDateTime::parse(value, &time::format_description::well_known::Rfc3339)
        .with_context(|| format!("invalid RFC3339 timestamp: {value}"))
}
