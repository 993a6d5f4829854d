//! Approval write-back: ledger approvals become boolean properties on the
//! matching model elements. Only touched instances are re-serialised; every
//! other byte of the source text is kept.

use std::collections::HashMap;

use ifc_ledger_core::{Guid, LedgerRow, Role};
use serde::{Deserialize, Serialize};

use crate::guid::new_ifc_guid;
use crate::model::IfcModel;
use crate::step::{render_entity, EntityInstance, Value};
use crate::ModelError;

const PROPERTIES: [(Role, &str); 2] =
    [(Role::Architect, "ArchitectApproval"), (Role::Structural, "StructuralApproval")];

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct WriteBackOptions {
    pub property_set: String,
}

impl Default for WriteBackOptions {
    fn default() -> Self {
        Self { property_set: "Pset_IfcLedger".to_string() }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct WriteBackReport {
    pub matched: usize,
    pub unchanged: usize,
    pub updated_properties: usize,
    pub added_properties: usize,
    pub created_property_sets: usize,
    /// Ledger identifiers with no element in the model.
    pub missing: Vec<Guid>,
    /// Elements whose property set is shared with other elements and was
    /// therefore left alone.
    pub shared: Vec<Guid>,
}

#[derive(Debug, Clone)]
pub struct WriteBack {
    pub content: String,
    pub report: WriteBackReport,
}

#[derive(Default)]
struct Edits {
    replacements: HashMap<u64, String>,
    appended: Vec<String>,
    next_id: u64,
}

impl Edits {
    fn append(&mut self, type_name: &str, attributes: &[Value]) -> u64 {
        let id = self.next_id;
        self.next_id += 1;
        self.appended.push(render_entity(id, type_name, attributes));
        id
    }

    fn append_property(&mut self, name: &str, value: bool) -> u64 {
        self.append(
            "IFCPROPERTYSINGLEVALUE",
            &[Value::String(name.to_string()), Value::Null, Value::boolean(value), Value::Null],
        )
    }

    fn apply(self, model: &IfcModel) -> String {
        let text = model.text();
        let mut spans = self
            .replacements
            .iter()
            .filter_map(|(id, replacement)| Some((model.entity(*id)?.span.clone(), replacement)))
            .collect::<Vec<_>>();
        spans.sort_by_key(|(span, _)| span.start);

        let mut out = String::with_capacity(text.len() + self.appended.len() * 96);
        let mut cursor = 0;
        for (span, replacement) in spans {
            out.push_str(&text[cursor..span.start]);
            out.push_str(replacement);
            cursor = span.end;
        }

        let data_end = model.data_end();
        out.push_str(&text[cursor..data_end]);
        for line in &self.appended {
            out.push_str(line);
            out.push('\n');
        }
        out.push_str(&text[data_end..]);
        out
    }
}

fn padded(entity: &EntityInstance, len: usize) -> Vec<Value> {
    let mut attributes = entity.attributes.clone();
    if attributes.len() < len {
        attributes.resize(len, Value::Null);
    }
    attributes
}

/// Stamp approval flags from `rows` onto the model's elements.
///
/// # Errors
/// Returns [`ModelError::Validation`] when the property set name is empty.
pub fn write_back_approvals(
    model: &IfcModel,
    rows: &[LedgerRow],
    options: &WriteBackOptions,
) -> Result<WriteBack, ModelError> {
    if options.property_set.trim().is_empty() {
        return Err(ModelError::Validation("property set name MUST be non-empty".to_string()));
    }

    let by_guid: HashMap<&str, u64> = model
        .entities()
        .filter(|entity| !entity.complex)
        .filter_map(|entity| Some((entity.attribute(0)?.as_str()?, entity.id)))
        .collect();

    let mut sets_of: HashMap<u64, u64> = HashMap::new();
    let mut owners: HashMap<u64, usize> = HashMap::new();
    for rel in model.entities_of_type("IFCRELDEFINESBYPROPERTIES") {
        let Some(set) = rel.attribute(5).and_then(Value::as_ref_id) else {
            continue;
        };
        let is_ledger_set = model.entity(set).is_some_and(|entity| {
            entity.is("IFCPROPERTYSET")
                && entity.attribute(2).and_then(Value::as_str)
                    == Some(options.property_set.as_str())
        });
        if !is_ledger_set {
            continue;
        }
        for object in rel.attribute(4).map(Value::ref_ids).unwrap_or_default() {
            sets_of.entry(object).or_insert(set);
            *owners.entry(set).or_insert(0) += 1;
        }
    }

    let mut edits = Edits { next_id: model.max_id() + 1, ..Edits::default() };
    let mut report = WriteBackReport::default();

    for row in rows {
        let Some(&element) = by_guid.get(row.identifier.as_str()) else {
            report.missing.push(row.identifier.clone());
            continue;
        };
        report.matched += 1;

        match sets_of.get(&element) {
            Some(set) if owners.get(set).copied().unwrap_or_default() > 1 => {
                report.shared.push(row.identifier.clone());
            }
            Some(set) => update_property_set(model, *set, row, &mut edits, &mut report),
            None => create_property_set(model, element, row, options, &mut edits, &mut report),
        }
    }

    report.missing.sort();
    report.shared.sort();
    tracing::info!(
        matched = report.matched,
        missing = report.missing.len(),
        created = report.created_property_sets,
        "approval write-back prepared"
    );

    Ok(WriteBack { content: edits.apply(model), report })
}

fn update_property_set(
    model: &IfcModel,
    set: u64,
    row: &LedgerRow,
    edits: &mut Edits,
    report: &mut WriteBackReport,
) {
    let Some(set_entity) = model.entity(set) else {
        return;
    };
    let property_ids = set_entity.attribute(4).map(Value::ref_ids).unwrap_or_default();
    let mut added = Vec::new();
    let mut changed = false;

    for (role, name) in PROPERTIES {
        let wanted = row.approval(role);
        let existing = property_ids.iter().filter_map(|id| model.entity(*id)).find(|property| {
            property.is("IFCPROPERTYSINGLEVALUE")
                && property.attribute(0).and_then(Value::as_str) == Some(name)
        });

        match existing {
            Some(property) if property.attribute(2).and_then(Value::as_bool) == Some(wanted) => {}
            Some(property) => {
                let mut attributes = padded(property, 4);
                attributes[2] = Value::boolean(wanted);
                edits.replacements.insert(property.id, property.render_with(&attributes));
                report.updated_properties += 1;
                changed = true;
            }
            None => {
                added.push(Value::Ref(edits.append_property(name, wanted)));
                report.added_properties += 1;
                changed = true;
            }
        }
    }

    if !added.is_empty() {
        let mut attributes = padded(set_entity, 5);
        let mut members = attributes[4].as_list().map(<[Value]>::to_vec).unwrap_or_default();
        members.extend(added);
        attributes[4] = Value::List(members);
        edits.replacements.insert(set, set_entity.render_with(&attributes));
    }
    if !changed {
        report.unchanged += 1;
    }
}

fn create_property_set(
    model: &IfcModel,
    element: u64,
    row: &LedgerRow,
    options: &WriteBackOptions,
    edits: &mut Edits,
    report: &mut WriteBackReport,
) {
    let owner_history = model
        .entity(element)
        .and_then(|entity| entity.attribute(1))
        .cloned()
        .unwrap_or(Value::Null);

    let properties = PROPERTIES
        .iter()
        .map(|(role, name)| Value::Ref(edits.append_property(name, row.approval(*role))))
        .collect::<Vec<_>>();
    let set = edits.append(
        "IFCPROPERTYSET",
        &[
            Value::String(new_ifc_guid()),
            owner_history.clone(),
            Value::String(options.property_set.clone()),
            Value::Null,
            Value::List(properties),
        ],
    );
    edits.append(
        "IFCRELDEFINESBYPROPERTIES",
        &[
            Value::String(new_ifc_guid()),
            owner_history,
            Value::Null,
            Value::Null,
            Value::List(vec![Value::Ref(element)]),
            Value::Ref(set),
        ],
    );

    report.created_property_sets += 1;
    report.added_properties += PROPERTIES.len();
}
