use std::path::PathBuf;

use anyhow::{anyhow, Context, Result};
use clap::{Args, Parser, Subcommand, ValueEnum};
use ifc_ledger_api::{
    ApproveIdentifiersRequest, IngestRequest, LedgerApi, LedgerConfig, SetStatusRequest,
    WriteBackRequest,
};
use ifc_ledger_core::{DateToken, EntryStatus, Guid, LedgerFilter, ReactivationPolicy, Role};
use serde_json::Value;
use tracing_subscriber::EnvFilter;

const CLI_CONTRACT_VERSION: &str = "cli.v1";

#[derive(Debug, Parser)]
#[command(name = "ifcl")]
#[command(about = "IFC element ledger CLI")]
struct Cli {
    /// Ledger database; falls back to the config file, then `ifc_database.db`.
    #[arg(long, env = "IFCL_DB", global = true)]
    db: Option<PathBuf>,

    /// YAML config file.
    #[arg(long, env = "IFCL_CONFIG", global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    Db {
        #[command(subcommand)]
        command: Box<DbCommand>,
    },
    /// Extract a model and reconcile it into the ledger.
    Ingest(IngestArgs),
    Ledger {
        #[command(subcommand)]
        command: Box<LedgerCommand>,
    },
    Model {
        #[command(subcommand)]
        command: Box<ModelCommand>,
    },
}

#[derive(Debug, Subcommand)]
enum DbCommand {
    SchemaVersion,
    Migrate(DbMigrateArgs),
    Backup(DbBackupArgs),
    Restore(DbRestoreArgs),
    IntegrityCheck,
}

#[derive(Debug, Args)]
struct DbMigrateArgs {
    #[arg(long, default_value_t = false)]
    dry_run: bool,
}

#[derive(Debug, Args)]
struct DbBackupArgs {
    #[arg(long)]
    out: PathBuf,
}

#[derive(Debug, Args)]
struct DbRestoreArgs {
    #[arg(long = "in")]
    input: PathBuf,
}

#[derive(Debug, Args)]
struct IngestArgs {
    #[arg(long)]
    file: PathBuf,
    /// Defaults to the model's file name.
    #[arg(long)]
    source_name: Option<String>,
    #[arg(long)]
    element_type: Option<String>,
    /// YYMMDD; defaults to the header time stamp, then today.
    #[arg(long)]
    observation_date: Option<String>,
    #[arg(long, value_enum)]
    reactivation: Option<ReactivationArg>,
}

#[derive(Debug, Subcommand)]
enum LedgerCommand {
    List(FilterArgs),
    Stats,
    Runs(RunsArgs),
    Approve(ApproveArgs),
    SetStatus(SetStatusArgs),
    ExportCsv(ExportCsvArgs),
}

#[derive(Debug, Args)]
struct FilterArgs {
    #[arg(long)]
    source_name: Option<String>,
    #[arg(long, value_enum)]
    status: Option<StatusArg>,
    #[arg(long)]
    container: Option<String>,
    /// Substring of the identifier (case-sensitive).
    #[arg(long)]
    contains: Option<String>,
}

#[derive(Debug, Args)]
struct RunsArgs {
    #[arg(long)]
    source_name: Option<String>,
}

#[derive(Debug, Args)]
struct ApproveArgs {
    #[arg(long, value_enum)]
    role: RoleArg,
    #[arg(long = "guid", required_unless_present = "from_file", conflicts_with = "from_file")]
    guids: Vec<String>,
    /// Text, CSV, or spreadsheet list of identifiers.
    #[arg(long)]
    from_file: Option<PathBuf>,
    /// Clear the flag instead of setting it.
    #[arg(long, default_value_t = false)]
    revoke: bool,
}

#[derive(Debug, Args)]
struct SetStatusArgs {
    #[arg(long)]
    guid: String,
    #[arg(long, value_enum)]
    status: StatusArg,
    #[arg(long)]
    date: Option<String>,
}

#[derive(Debug, Args)]
struct ExportCsvArgs {
    #[arg(long)]
    out: PathBuf,
    #[command(flatten)]
    filter: FilterArgs,
}

#[derive(Debug, Subcommand)]
enum ModelCommand {
    Info(ModelFileArgs),
    Extract(ModelExtractArgs),
    WriteBack(ModelWriteBackArgs),
}

#[derive(Debug, Args)]
struct ModelFileArgs {
    #[arg(long)]
    file: PathBuf,
}

#[derive(Debug, Args)]
struct ModelExtractArgs {
    #[arg(long)]
    file: PathBuf,
    #[arg(long)]
    element_type: Option<String>,
}

#[derive(Debug, Args)]
struct ModelWriteBackArgs {
    #[arg(long)]
    file: PathBuf,
    #[arg(long)]
    out: PathBuf,
    /// Only rows first seen under this source name.
    #[arg(long)]
    source_name: Option<String>,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum RoleArg {
    Architect,
    Structural,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum StatusArg {
    Active,
    Deleted,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum ReactivationArg {
    Never,
    ReactivateOwned,
}

impl From<RoleArg> for Role {
    fn from(value: RoleArg) -> Self {
        match value {
            RoleArg::Architect => Role::Architect,
            RoleArg::Structural => Role::Structural,
        }
    }
}

impl From<StatusArg> for EntryStatus {
    fn from(value: StatusArg) -> Self {
        match value {
            StatusArg::Active => EntryStatus::Active,
            StatusArg::Deleted => EntryStatus::Deleted,
        }
    }
}

impl From<ReactivationArg> for ReactivationPolicy {
    fn from(value: ReactivationArg) -> Self {
        match value {
            ReactivationArg::Never => ReactivationPolicy::Never,
            ReactivationArg::ReactivateOwned => ReactivationPolicy::ReactivateOwned,
        }
    }
}

impl From<FilterArgs> for LedgerFilter {
    fn from(args: FilterArgs) -> Self {
        LedgerFilter {
            source_name: args.source_name,
            status: args.status.map(EntryStatus::from),
            container: args.container,
            identifier_contains: args.contains,
        }
    }
}

fn with_contract_version(value: Value) -> Value {
    match value {
        Value::Object(mut object) => {
            object.insert(
                "contract_version".to_string(),
                Value::String(CLI_CONTRACT_VERSION.to_string()),
            );
            Value::Object(object)
        }
        other => serde_json::json!({
            "contract_version": CLI_CONTRACT_VERSION,
            "payload": other
        }),
    }
}

fn emit_json(value: Value) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(&with_contract_version(value))?);
    Ok(())
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    // stdout carries the JSON contract; logs go to stderr.
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .try_init();
}

fn main() -> Result<()> {
    init_tracing();
    let cli = Cli::parse();
    let api = open_api(&cli)?;
    match cli.command {
        Command::Db { command } => run_db(*command, &api),
        Command::Ingest(args) => run_ingest(args, &api),
        Command::Ledger { command } => run_ledger(*command, &api),
        Command::Model { command } => run_model(*command, &api),
    }
}

fn open_api(cli: &Cli) -> Result<LedgerApi> {
    let config = match &cli.config {
        Some(path) => LedgerConfig::from_path(path)
            .with_context(|| format!("failed to load config {}", path.display()))?,
        None => LedgerConfig::default(),
    };
    let db = cli.db.clone().unwrap_or_else(|| config.database.clone());
    tracing::debug!(db = %db.display(), "ledger database selected");
    Ok(LedgerApi::with_config(db, config))
}

fn parse_date(raw: &str) -> Result<DateToken> {
    DateToken::parse(raw).map_err(|err| anyhow!("{err}"))
}

fn parse_guid(raw: &str) -> Result<Guid> {
    Guid::parse(raw).map_err(|err| anyhow!("{err}"))
}

fn run_db(command: DbCommand, api: &LedgerApi) -> Result<()> {
    match command {
        DbCommand::SchemaVersion => {
            let status = api.schema_status()?;
            emit_json(serde_json::json!({
                "current_version": status.current_version,
                "target_version": status.target_version,
                "pending_versions": status.pending_versions,
                "up_to_date": status.pending_versions.is_empty(),
                "inferred_from_legacy": status.inferred_from_legacy
            }))
        }
        DbCommand::Migrate(args) => {
            let result = api.migrate(args.dry_run)?;
            emit_json(serde_json::to_value(&result).context("failed to serialize migrate result")?)
        }
        DbCommand::Backup(args) => {
            api.migrate(false)?;
            api.backup(&args.out)?;
            emit_json(serde_json::json!({
                "backup_path": args.out,
                "status": "ok"
            }))
        }
        DbCommand::Restore(args) => {
            api.restore(&args.input)?;
            let status = api.schema_status()?;
            emit_json(serde_json::json!({
                "restored_from": args.input,
                "current_version": status.current_version,
                "target_version": status.target_version,
                "pending_versions": status.pending_versions
            }))
        }
        DbCommand::IntegrityCheck => {
            let report = api.integrity_check()?;
            emit_json(
                serde_json::to_value(&report).context("failed to serialize integrity report")?,
            )
        }
    }
}

fn run_ingest(args: IngestArgs, api: &LedgerApi) -> Result<()> {
    let request = IngestRequest {
        file: args.file,
        source_name: args.source_name,
        element_type: args.element_type,
        observation_date: args.observation_date.as_deref().map(parse_date).transpose()?,
        reactivation: args.reactivation.map(ReactivationPolicy::from),
    };
    let result = api.ingest(&request)?;
    emit_json(serde_json::to_value(&result).context("failed to serialize ingest result")?)
}

fn run_ledger(command: LedgerCommand, api: &LedgerApi) -> Result<()> {
    match command {
        LedgerCommand::List(args) => {
            let rows = api.list_rows(&LedgerFilter::from(args))?;
            emit_json(serde_json::json!({
                "count": rows.len(),
                "rows": rows
            }))
        }
        LedgerCommand::Stats => {
            let stats = api.stats()?;
            emit_json(serde_json::to_value(&stats).context("failed to serialize ledger stats")?)
        }
        LedgerCommand::Runs(args) => {
            let runs = api.list_runs(args.source_name.as_deref())?;
            emit_json(serde_json::json!({
                "count": runs.len(),
                "runs": runs
            }))
        }
        LedgerCommand::Approve(args) => {
            let role = Role::from(args.role);
            let value = !args.revoke;
            let summary = match args.from_file {
                Some(path) => api.approve_from_file(role, &path, value)?,
                None => {
                    let identifiers =
                        args.guids.iter().map(|raw| parse_guid(raw)).collect::<Result<Vec<_>>>()?;
                    api.approve_identifiers(&ApproveIdentifiersRequest {
                        role,
                        identifiers,
                        value,
                    })?
                }
            };
            emit_json(
                serde_json::to_value(&summary).context("failed to serialize approval summary")?,
            )
        }
        LedgerCommand::SetStatus(args) => {
            let result = api.set_status(&SetStatusRequest {
                identifier: parse_guid(&args.guid)?,
                status: EntryStatus::from(args.status),
                date: args.date.as_deref().map(parse_date).transpose()?,
            })?;
            emit_json(serde_json::to_value(&result).context("failed to serialize edit result")?)
        }
        LedgerCommand::ExportCsv(args) => {
            let result = api.export_csv(&args.out, &LedgerFilter::from(args.filter))?;
            emit_json(serde_json::to_value(&result).context("failed to serialize export result")?)
        }
    }
}

fn run_model(command: ModelCommand, api: &LedgerApi) -> Result<()> {
    match command {
        ModelCommand::Info(args) => {
            let info = api.model_info(&args.file)?;
            emit_json(serde_json::json!({
                "file": args.file,
                "info": info
            }))
        }
        ModelCommand::Extract(args) => {
            let elements = api.model_extract(&args.file, args.element_type.as_deref())?;
            let element_type =
                args.element_type.unwrap_or_else(|| api.config().element_type.clone());
            emit_json(serde_json::json!({
                "file": args.file,
                "element_type": element_type,
                "count": elements.len(),
                "elements": elements
            }))
        }
        ModelCommand::WriteBack(args) => {
            let result = api.write_back(&WriteBackRequest {
                file: args.file,
                out: args.out,
                source_name: args.source_name,
            })?;
            emit_json(
                serde_json::to_value(&result).context("failed to serialize write-back result")?,
            )
        }
    }
}
