//! Reader for IFC models in the ISO 10303-21 clear-text encoding, plus the
//! element extraction and approval write-back built on top of it.

use std::path::PathBuf;

use thiserror::Error;

pub mod extract;
pub mod guid;
pub mod model;
pub mod step;
pub mod writeback;

pub use extract::{extract, ElementRecord, ExtractOptions, RelationIndex};
pub use guid::{compress_guid, expand_guid, new_ifc_guid};
pub use model::{IfcModel, ModelInfo};
pub use step::{EntityInstance, StepHeader, Value};
pub use writeback::{write_back_approvals, WriteBack, WriteBackOptions, WriteBackReport};

#[derive(Debug, Error)]
pub enum ModelError {
    #[error("failed to read {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("syntax error on line {line}: {message}")]
    Syntax { line: usize, message: String },
    #[error("validation error: {0}")]
    Validation(String),
}
