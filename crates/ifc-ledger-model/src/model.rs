use std::collections::BTreeMap;
use std::path::Path;

use ifc_ledger_core::DateToken;
use serde::Serialize;

use crate::step::{parse_step, EntityInstance, StepHeader};
use crate::ModelError;

/// Parsed model: header, instances keyed by instance number, and the source
/// text they were read from.
#[derive(Debug, Clone)]
pub struct IfcModel {
    text: String,
    header: StepHeader,
    entities: BTreeMap<u64, EntityInstance>,
    data_end: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ModelInfo {
    pub file_name: Option<String>,
    pub time_stamp: Option<String>,
    pub schema: Vec<String>,
    pub entity_count: usize,
    pub complex_count: usize,
    pub rooted_count: usize,
    pub counts_by_type: BTreeMap<String, usize>,
}

impl IfcModel {
    /// Read and parse a model file.
    ///
    /// Files that are not valid UTF-8 are read as ISO 8859-1.
    ///
    /// # Errors
    /// Returns [`ModelError::Io`] when the file cannot be read and
    /// [`ModelError::Syntax`] when it does not parse.
    pub fn open(path: &Path) -> Result<Self, ModelError> {
        let bytes = std::fs::read(path)
            .map_err(|source| ModelError::Io { path: path.to_path_buf(), source })?;
        let text = match String::from_utf8(bytes) {
            Ok(text) => text,
            Err(err) => {
                tracing::warn!(path = %path.display(), "model is not UTF-8, reading as latin-1");
                err.into_bytes().into_iter().map(char::from).collect()
            }
        };
        Self::parse(text)
    }

    /// # Errors
    /// Returns [`ModelError::Syntax`] when the text does not parse.
    pub fn parse(text: impl Into<String>) -> Result<Self, ModelError> {
        let text = text.into();
        let file = parse_step(&text)?;

        let mut entities = BTreeMap::new();
        for entity in file.entities {
            let id = entity.id;
            if entities.insert(id, entity).is_some() {
                return Err(ModelError::Validation(format!("duplicate instance #{id}")));
            }
        }

        tracing::debug!(entities = entities.len(), "parsed model");
        Ok(Self { text, header: file.header, entities, data_end: file.data_end })
    }

    #[must_use]
    pub fn text(&self) -> &str {
        &self.text
    }

    #[must_use]
    pub fn header(&self) -> &StepHeader {
        &self.header
    }

    #[must_use]
    pub fn entity(&self, id: u64) -> Option<&EntityInstance> {
        self.entities.get(&id)
    }

    pub fn entities(&self) -> impl Iterator<Item = &EntityInstance> {
        self.entities.values()
    }

    pub fn entities_of_type<'a>(
        &'a self,
        type_name: &'a str,
    ) -> impl Iterator<Item = &'a EntityInstance> + 'a {
        self.entities.values().filter(move |entity| entity.is(type_name))
    }

    /// `GlobalId` (first attribute) of a rooted instance.
    #[must_use]
    pub fn global_id(&self, id: u64) -> Option<&str> {
        self.entity(id).filter(|entity| !entity.complex)?.attribute(0)?.as_str()
    }

    /// `Name` (third attribute) of a rooted instance.
    #[must_use]
    pub fn name(&self, id: u64) -> Option<&str> {
        self.entity(id).filter(|entity| !entity.complex)?.attribute(2)?.as_str()
    }

    /// Authored date from the header, when it carries a readable timestamp.
    #[must_use]
    pub fn observation_date(&self) -> Option<DateToken> {
        self.header.time_stamp.as_deref().and_then(DateToken::from_timestamp)
    }

    #[must_use]
    pub fn max_id(&self) -> u64 {
        self.entities.keys().next_back().copied().unwrap_or_default()
    }

    pub(crate) fn data_end(&self) -> usize {
        self.data_end
    }

    #[must_use]
    pub fn info(&self) -> ModelInfo {
        let mut counts_by_type = BTreeMap::new();
        let mut complex_count = 0;
        let mut rooted_count = 0;
        for entity in self.entities.values() {
            if entity.complex {
                complex_count += 1;
                continue;
            }
            *counts_by_type.entry(entity.type_name.clone()).or_insert(0) += 1;
            if entity.attribute(0).and_then(|value| value.as_str()).is_some_and(|id| id.len() == 22)
            {
                rooted_count += 1;
            }
        }

        ModelInfo {
            file_name: self.header.file_name.clone(),
            time_stamp: self.header.time_stamp.clone(),
            schema: self.header.schema.clone(),
            entity_count: self.entities.len(),
            complex_count,
            rooted_count,
            counts_by_type,
        }
    }
}
