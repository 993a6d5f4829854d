//! Identifier lists handed in by reviewers: plain text, CSV, or the first
//! column of a spreadsheet.

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};

use calamine::{open_workbook_auto, Data, Reader};
use ifc_ledger_core::{parse_identifier_list, Guid};
use thiserror::Error;

const SPREADSHEET_EXTENSIONS: [&str; 5] = ["xlsx", "xlsm", "xlsb", "xls", "ods"];

#[derive(Debug, Error)]
pub enum IdentifierListError {
    #[error("failed to read identifier list {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("spreadsheet error: {0}")]
    Calamine(#[from] calamine::Error),
    #[error("spreadsheet {0} has no sheets")]
    NoSheets(PathBuf),
}

/// Read identifiers from `path`, choosing the reader by file extension.
///
/// # Errors
/// Returns [`IdentifierListError`] when the file cannot be opened or parsed.
pub fn read_identifier_file(path: &Path) -> Result<Vec<Guid>, IdentifierListError> {
    let extension = path
        .extension()
        .and_then(|ext| ext.to_str())
        .map(str::to_ascii_lowercase)
        .unwrap_or_default();

    let identifiers = if SPREADSHEET_EXTENSIONS.contains(&extension.as_str()) {
        read_spreadsheet_column(path)?
    } else {
        let content = std::fs::read_to_string(path)
            .map_err(|source| IdentifierListError::Io { path: path.to_path_buf(), source })?;
        if extension == "csv" {
            first_csv_column(&content)
        } else {
            parse_identifier_list(&content)
        }
    };

    tracing::debug!(path = %path.display(), count = identifiers.len(), "identifier list read");
    Ok(identifiers)
}

/// First column of the first sheet; no header row.
fn read_spreadsheet_column(path: &Path) -> Result<Vec<Guid>, IdentifierListError> {
    let mut workbook = open_workbook_auto(path)?;
    let Some(sheet_name) = workbook.sheet_names().first().cloned() else {
        return Err(IdentifierListError::NoSheets(path.to_path_buf()));
    };
    let range = workbook.worksheet_range(&sheet_name)?;

    Ok(collect_unique(range.rows().filter_map(|row| row.first()).map(cell_to_string)))
}

fn first_csv_column(content: &str) -> Vec<Guid> {
    collect_unique(content.lines().map(|line| {
        let field = line.split(',').next().unwrap_or_default().trim();
        field.trim_matches('"').to_string()
    }))
}

fn collect_unique(tokens: impl Iterator<Item = String>) -> Vec<Guid> {
    let mut seen = BTreeSet::new();
    tokens
        .filter_map(|token| Guid::parse(token.trim()).ok())
        .filter(|identifier| seen.insert(identifier.clone()))
        .collect()
}

fn cell_to_string(cell: &Data) -> String {
    match cell {
        Data::String(s) | Data::DateTimeIso(s) | Data::DurationIso(s) => s.clone(),
        Data::Float(f) => {
            if f.fract() == 0.0 {
                format!("{f:.0}")
            } else {
                f.to_string()
            }
        }
        Data::Int(i) => i.to_string(),
        Data::Empty | Data::Bool(_) | Data::Error(_) | Data::DateTime(_) => String::new(),
    }
}
