use std::collections::{BTreeSet, HashMap};

use ifc_ledger_core::{ExtractedElement, Guid};
use serde::{Deserialize, Serialize};

use crate::model::IfcModel;

const REL_CONTAINED: &str = "IFCRELCONTAINEDINSPATIALSTRUCTURE";
const REL_DECOMPOSITION: [&str; 2] = ["IFCRELAGGREGATES", "IFCRELNESTS"];

/// Concrete subtypes that carry no extra meaning for tracking and are folded
/// into their supertype when `include_subtypes` is set.
const SUBTYPES: &[(&str, &[&str])] = &[
    ("IFCWALL", &["IFCWALLSTANDARDCASE", "IFCWALLELEMENTEDCASE"]),
    ("IFCSLAB", &["IFCSLABSTANDARDCASE", "IFCSLABELEMENTEDCASE"]),
    ("IFCBEAM", &["IFCBEAMSTANDARDCASE"]),
    ("IFCCOLUMN", &["IFCCOLUMNSTANDARDCASE"]),
    ("IFCDOOR", &["IFCDOORSTANDARDCASE"]),
    ("IFCWINDOW", &["IFCWINDOWSTANDARDCASE"]),
    ("IFCMEMBER", &["IFCMEMBERSTANDARDCASE"]),
    ("IFCPLATE", &["IFCPLATESTANDARDCASE"]),
    ("IFCOPENINGELEMENT", &["IFCOPENINGSTANDARDCASE"]),
];

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ExtractOptions {
    pub element_type: String,
    pub include_subtypes: bool,
    pub container_type: String,
    pub max_depth: usize,
}

impl Default for ExtractOptions {
    fn default() -> Self {
        Self {
            element_type: "IfcBuildingElementProxy".to_string(),
            include_subtypes: true,
            container_type: "IfcBuildingStorey".to_string(),
            max_depth: 64,
        }
    }
}

impl ExtractOptions {
    #[must_use]
    pub fn for_type(element_type: &str) -> Self {
        Self { element_type: element_type.to_string(), ..Self::default() }
    }

    #[must_use]
    pub fn matches_type(&self, type_name: &str) -> bool {
        if type_name.eq_ignore_ascii_case(&self.element_type) {
            return true;
        }
        if !self.include_subtypes {
            return false;
        }
        let wanted = self.element_type.to_ascii_uppercase();
        SUBTYPES.iter().any(|(base, subtypes)| {
            *base == wanted
                && subtypes.iter().any(|subtype| subtype.eq_ignore_ascii_case(type_name))
        })
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ElementRecord {
    pub step_id: u64,
    pub entity_type: String,
    pub identifier: Guid,
    pub container: Option<String>,
}

impl From<ElementRecord> for ExtractedElement {
    fn from(record: ElementRecord) -> Self {
        Self { identifier: record.identifier, container: record.container }
    }
}

/// Spatial containment and decomposition edges, child to parent.
#[derive(Debug, Clone, Default)]
pub struct RelationIndex {
    contained_in: HashMap<u64, u64>,
    decomposes: HashMap<u64, u64>,
}

impl RelationIndex {
    #[must_use]
    pub fn build(model: &IfcModel) -> Self {
        let mut index = Self::default();
        for entity in model.entities() {
            if entity.is(REL_CONTAINED) {
                let structure = entity.attribute(5).and_then(|value| value.as_ref_id());
                let elements = entity.attribute(4).map(|value| value.ref_ids()).unwrap_or_default();
                if let Some(structure) = structure {
                    for element in elements {
                        index.contained_in.entry(element).or_insert(structure);
                    }
                }
            } else if REL_DECOMPOSITION.iter().any(|name| entity.is(name)) {
                let parent = entity.attribute(4).and_then(|value| value.as_ref_id());
                let children = entity.attribute(5).map(|value| value.ref_ids()).unwrap_or_default();
                if let Some(parent) = parent {
                    for child in children {
                        index.decomposes.entry(child).or_insert(parent);
                    }
                }
            }
        }
        index
    }

    #[must_use]
    pub fn contained_in(&self, id: u64) -> Option<u64> {
        self.contained_in.get(&id).copied()
    }

    #[must_use]
    pub fn decomposes(&self, id: u64) -> Option<u64> {
        self.decomposes.get(&id).copied()
    }

    /// Name of the nearest container-type ancestor of `element`.
    ///
    /// Containment is tried before decomposition membership. From either
    /// starting point the walk prefers the decomposition parent and falls back
    /// to spatial containment at each step.
    #[must_use]
    pub fn container_of(
        &self,
        model: &IfcModel,
        element: u64,
        options: &ExtractOptions,
    ) -> Option<String> {
        [self.contained_in(element), self.decomposes(element)]
            .into_iter()
            .flatten()
            .find_map(|start| self.walk_up(model, start, options))
    }

    fn walk_up(&self, model: &IfcModel, start: u64, options: &ExtractOptions) -> Option<String> {
        let mut visited = BTreeSet::new();
        let mut node = start;
        for _ in 0..options.max_depth {
            if !visited.insert(node) {
                return None;
            }
            let entity = model.entity(node)?;
            if entity.is(&options.container_type) {
                return model.name(node).map(str::to_string);
            }
            node = self.decomposes(node).or_else(|| self.contained_in(node))?;
        }
        None
    }
}

/// Every instance of the requested type that carries a `GlobalId`, in
/// instance-number order.
#[must_use]
pub fn extract(model: &IfcModel, options: &ExtractOptions) -> Vec<ElementRecord> {
    let relations = RelationIndex::build(model);
    let mut records = Vec::new();

    for entity in model.entities() {
        if entity.complex || !options.matches_type(&entity.type_name) {
            continue;
        }
        let identifier = match model.global_id(entity.id).map(Guid::parse) {
            Some(Ok(identifier)) => identifier,
            _ => {
                tracing::warn!(
                    step_id = entity.id,
                    entity_type = %entity.type_name,
                    "element without GlobalId skipped"
                );
                continue;
            }
        };

        let container = relations.container_of(model, entity.id, options);
        if container.is_none() {
            tracing::debug!(step_id = entity.id, identifier = %identifier, "no container resolved");
        }
        records.push(ElementRecord {
            step_id: entity.id,
            entity_type: entity.type_name.clone(),
            identifier,
            container,
        });
    }

    tracing::info!(
        element_type = %options.element_type,
        matched = records.len(),
        "extracted elements"
    );
    records
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ModelError;

    fn model(data: &str) -> Result<IfcModel, ModelError> {
        IfcModel::parse(format!(
            "ISO-10303-21;\nHEADER;\nFILE_DESCRIPTION((''),'2;1');\n\
             FILE_NAME('t.ifc','2024-01-15T00:00:00',(''),(''),'','','');\n\
             FILE_SCHEMA(('IFC4'));\nENDSEC;\nDATA;\n{data}ENDSEC;\nEND-ISO-10303-21;\n"
        ))
    }

    fn containers(records: &[ElementRecord]) -> Vec<(String, Option<String>)> {
        records
            .iter()
            .map(|record| (record.identifier.to_string(), record.container.clone()))
            .collect()
    }

    const BUILDING: &str = "#1=IFCOWNERHISTORY($,$,$,.ADDED.,$,$,$,0);
#10=IFCBUILDING('building00000000000001',#1,'B',$,$,$,$,$,.ELEMENT.,$,$,$);
#11=IFCBUILDINGSTOREY('storey0000000000000001',#1,'Level 1',$,$,$,$,$,.ELEMENT.,0.);
#12=IFCBUILDINGSTOREY('storey0000000000000002',#1,'Level 2',$,$,$,$,$,.ELEMENT.,3.);
#13=IFCRELAGGREGATES('relagg0000000000000001',#1,$,$,#10,(#11,#12));
#14=IFCSPACE('space00000000000000001',#1,'Room',$,$,$,$,$,.ELEMENT.,.INTERNAL.,$);
#15=IFCRELAGGREGATES('relagg0000000000000002',#1,$,$,#12,(#14));
";

    #[test]
    fn direct_containment_resolves_the_storey_name() -> Result<(), ModelError> {
        let model = model(&format!(
            "{BUILDING}#20=IFCBUILDINGELEMENTPROXY('proxy00000000000000001',#1,'P',$,$,$,$,$,$);
#21=IFCRELCONTAINEDINSPATIALSTRUCTURE('relcon0000000000000001',#1,$,$,(#20),#11);
"
        ))?;
        let records = extract(&model, &ExtractOptions::default());
        assert_eq!(
            containers(&records),
            vec![("proxy00000000000000001".to_string(), Some("Level 1".to_string()))]
        );
        assert_eq!(records[0].entity_type, "IFCBUILDINGELEMENTPROXY");
        Ok(())
    }

    #[test]
    fn containment_in_a_space_walks_up_to_the_storey() -> Result<(), ModelError> {
        let model = model(&format!(
            "{BUILDING}#20=IFCBUILDINGELEMENTPROXY('proxy00000000000000001',#1,'P',$,$,$,$,$,$);
#21=IFCRELCONTAINEDINSPATIALSTRUCTURE('relcon0000000000000001',#1,$,$,(#20),#14);
"
        ))?;
        let records = extract(&model, &ExtractOptions::default());
        assert_eq!(records[0].container.as_deref(), Some("Level 2"));
        Ok(())
    }

    #[test]
    fn decomposition_membership_is_the_fallback() -> Result<(), ModelError> {
        let model = model(&format!(
            "{BUILDING}#20=IFCELEMENTASSEMBLY('assembly00000000000001',#1,'A',$,$,$,$,$,$,$);
#21=IFCRELCONTAINEDINSPATIALSTRUCTURE('relcon0000000000000001',#1,$,$,(#20),#11);
#22=IFCBUILDINGELEMENTPROXY('proxy00000000000000001',#1,'P',$,$,$,$,$,$);
#23=IFCRELAGGREGATES('relagg0000000000000003',#1,$,$,#20,(#22));
#24=IFCBUILDINGELEMENTPROXY('proxy00000000000000002',#1,'Q',$,$,$,$,$,$);
#25=IFCRELNESTS('relnst0000000000000001',#1,$,$,#22,(#24));
"
        ))?;
        let records = extract(&model, &ExtractOptions::default());
        assert_eq!(
            containers(&records),
            vec![
                ("proxy00000000000000001".to_string(), Some("Level 1".to_string())),
                ("proxy00000000000000002".to_string(), Some("Level 1".to_string())),
            ]
        );
        Ok(())
    }

    #[test]
    fn unresolvable_and_cyclic_chains_yield_none() -> Result<(), ModelError> {
        let model = model(
            "#1=IFCOWNERHISTORY($,$,$,.ADDED.,$,$,$,0);
#20=IFCBUILDINGELEMENTPROXY('proxy00000000000000001',#1,'P',$,$,$,$,$,$);
#21=IFCELEMENTASSEMBLY('assembly00000000000001',#1,'A',$,$,$,$,$,$,$);
#22=IFCELEMENTASSEMBLY('assembly00000000000002',#1,'B',$,$,$,$,$,$,$);
#23=IFCRELAGGREGATES('relagg0000000000000001',#1,$,$,#21,(#20,#22));
#24=IFCRELAGGREGATES('relagg0000000000000002',#1,$,$,#22,(#21));
#30=IFCBUILDINGELEMENTPROXY('proxy00000000000000002',#1,'Q',$,$,$,$,$,$);
",
        )?;
        let records = extract(&model, &ExtractOptions::default());
        assert_eq!(
            containers(&records),
            vec![
                ("proxy00000000000000001".to_string(), None),
                ("proxy00000000000000002".to_string(), None),
            ]
        );
        Ok(())
    }

    #[test]
    fn depth_cap_stops_long_chains() -> Result<(), ModelError> {
        let model = model(&format!(
            "{BUILDING}#20=IFCBUILDINGELEMENTPROXY('proxy00000000000000001',#1,'P',$,$,$,$,$,$);
#21=IFCRELCONTAINEDINSPATIALSTRUCTURE('relcon0000000000000001',#1,$,$,(#20),#14);
"
        ))?;
        let shallow = ExtractOptions { max_depth: 1, ..ExtractOptions::default() };
        assert_eq!(extract(&model, &shallow)[0].container, None);
        let enough = ExtractOptions { max_depth: 2, ..ExtractOptions::default() };
        assert_eq!(extract(&model, &enough)[0].container.as_deref(), Some("Level 2"));
        Ok(())
    }

    #[test]
    fn type_matching_is_case_insensitive_and_folds_standard_cases() -> Result<(), ModelError> {
        let model = model(
            "#1=IFCOWNERHISTORY($,$,$,.ADDED.,$,$,$,0);
#2=IFCWALL('wall000000000000000001',#1,'W',$,$,$,$,$,$);
#3=IFCWALLSTANDARDCASE('wall000000000000000002',#1,'W',$,$,$,$,$,$);
#4=IFCWALL($,#1,'no id',$,$,$,$,$,$);
",
        )?;
        assert_eq!(extract(&model, &ExtractOptions::for_type("ifcwall")).len(), 2);
        let strict =
            ExtractOptions { include_subtypes: false, ..ExtractOptions::for_type("IfcWall") };
        assert_eq!(extract(&model, &strict).len(), 1);
        assert!(extract(&model, &ExtractOptions::for_type("IfcDoor")).is_empty());
        Ok(())
    }

    #[test]
    fn records_convert_into_reconcile_input() -> Result<(), ModelError> {
        let model = model(
            "#1=IFCBUILDINGELEMENTPROXY('proxy00000000000000001',$,'P',$,$,$,$,$,$);\n",
        )?;
        let elements: Vec<ExtractedElement> =
            extract(&model, &ExtractOptions::default()).into_iter().map(Into::into).collect();
        assert_eq!(elements.len(), 1);
        assert_eq!(elements[0].identifier.as_str(), "proxy00000000000000001");
        assert_eq!(elements[0].container, None);
        Ok(())
    }
}
