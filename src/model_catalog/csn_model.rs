use std::sync::Arc;

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};

use super::errors::ModelError;
use crate::cqn::ast::{Literal, Xpr};

/// Annotation marking a scalar element as the synthesized mirror of a
/// managed association's foreign key. Wildcard expansion skips mirrors,
/// the association itself supplies the flat columns.
pub const FOREIGN_KEY_MARKER: &str = "@odata.foreignKey4";

/// Annotation prefix controlling search relevance of an element.
pub const SEARCH_ANNOTATION_PREFIX: &str = "@cds.search.";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum DefKind {
    #[default]
    Entity,
    Type,
}

/// A named definition: an entity or a structured type.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Definition {
    /// Qualified name; filled from the containing map key when the model
    /// is sealed.
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub kind: DefKind,
    #[serde(default)]
    pub elements: IndexMap<String, Arc<ElementDef>>,
    /// Definitions flagged here exist in the model but have no persisted
    /// table; expands targeting them are marked and omitted.
    #[serde(default)]
    pub persistence_skip: bool,
    /// Name of the localized variant used when a query runs `localized`.
    #[serde(default)]
    pub localized_view: Option<String>,
    #[serde(default)]
    pub annotations: IndexMap<String, Literal>,
}

impl Definition {
    pub fn new(name: impl Into<String>) -> Self {
        Definition {
            name: name.into(),
            kind: DefKind::Entity,
            elements: IndexMap::new(),
            persistence_skip: false,
            localized_view: None,
            annotations: IndexMap::new(),
        }
    }

    /// The short name after the last namespace segment.
    pub fn short_name(&self) -> &str {
        short_name_of(&self.name)
    }

    /// Key elements in declaration order.
    pub fn keys(&self) -> impl Iterator<Item = &Arc<ElementDef>> {
        self.elements.values().filter(|e| e.key)
    }

    pub fn element(&self, name: &str) -> Option<&Arc<ElementDef>> {
        self.elements.get(name)
    }
}

pub fn short_name_of(qualified: &str) -> &str {
    qualified.rsplit('.').next().unwrap_or(qualified)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Cardinality {
    One,
    Many,
}

/// A managed foreign key: a path into the target's keys, optionally
/// renamed for the generated flat column.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ForeignKey {
    #[serde(rename = "ref")]
    pub path: Vec<String>,
    #[serde(rename = "as", default)]
    pub alias: Option<String>,
}

impl ForeignKey {
    pub fn new<S: Into<String>>(path: Vec<S>) -> Self {
        ForeignKey {
            path: path.into_iter().map(Into::into).collect(),
            alias: None,
        }
    }

    /// The segment the key contributes to a flat column name.
    pub fn flat_tail(&self) -> String {
        match &self.alias {
            Some(a) => a.clone(),
            None => self.path.join("_"),
        }
    }
}

/// Association metadata of an element. Managed when `keys` is non-empty
/// and no on-condition is recorded; unmanaged when `on` is present.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AssocInfo {
    pub target: String,
    #[serde(default)]
    pub cardinality: Option<Cardinality>,
    #[serde(default)]
    pub keys: Vec<ForeignKey>,
    #[serde(default)]
    pub on: Option<Xpr>,
    /// Composition flavor of an association.
    #[serde(default)]
    pub composition: bool,
}

/// An element of a definition: scalar, structured, or an association.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ElementDef {
    #[serde(default)]
    pub name: String,
    #[serde(rename = "type", default)]
    pub type_name: Option<String>,
    /// Children of a structured element.
    #[serde(default)]
    pub elements: IndexMap<String, Arc<ElementDef>>,
    #[serde(default)]
    pub key: bool,
    #[serde(rename = "virtual", default)]
    pub virtual_: bool,
    #[serde(default)]
    pub association: Option<AssocInfo>,
    #[serde(default)]
    pub annotations: IndexMap<String, Literal>,
    /// Set on synthetic pseudo-namespace definitions only.
    #[serde(default)]
    pub pseudo: bool,
}

impl ElementDef {
    pub fn scalar(name: impl Into<String>, type_name: impl Into<String>) -> Self {
        ElementDef {
            name: name.into(),
            type_name: Some(type_name.into()),
            elements: IndexMap::new(),
            key: false,
            virtual_: false,
            association: None,
            annotations: IndexMap::new(),
            pseudo: false,
        }
    }

    pub fn is_association(&self) -> bool {
        self.association.is_some()
    }

    pub fn is_composition(&self) -> bool {
        self.association.as_ref().is_some_and(|a| a.composition)
    }

    pub fn is_structured(&self) -> bool {
        self.association.is_none() && !self.elements.is_empty()
    }

    pub fn is_scalar(&self) -> bool {
        self.association.is_none() && self.elements.is_empty()
    }

    /// Managed associations pair generated foreign-key columns with the
    /// target's keys; unmanaged ones carry an explicit on-condition.
    pub fn is_managed(&self) -> bool {
        self.association
            .as_ref()
            .is_some_and(|a| a.on.is_none() && !a.keys.is_empty())
    }

    pub fn is_to_one(&self) -> bool {
        self.association
            .as_ref()
            .is_some_and(|a| !matches!(a.cardinality, Some(Cardinality::Many)))
    }

    pub fn is_foreign_key_mirror(&self) -> bool {
        self.annotations.contains_key(FOREIGN_KEY_MARKER)
    }

    pub fn is_string_typed(&self) -> bool {
        self.type_name
            .as_deref()
            .is_some_and(|t| t.ends_with("String"))
    }
}

/// The model accessor: a read-only mapping from qualified name to
/// definition.
#[derive(Debug, Clone, Default)]
pub struct CsnModel {
    definitions: IndexMap<String, Arc<Definition>>,
}

impl CsnModel {
    /// Seal a set of raw definitions into a model: definition and element
    /// names are filled in from their map keys.
    pub fn new(definitions: IndexMap<String, Definition>) -> Self {
        let definitions = definitions
            .into_iter()
            .map(|(name, mut def)| {
                def.name = name.clone();
                seal_elements(&mut def.elements);
                (name, Arc::new(def))
            })
            .collect();
        CsnModel { definitions }
    }

    /// Build a model from its JSON form, e.g. a `serde_json::json!` value
    /// mapping qualified names to definitions.
    pub fn from_value(value: serde_json::Value) -> Result<Self, ModelError> {
        let raw: IndexMap<String, Definition> =
            serde_json::from_value(value).map_err(|e| ModelError::InvalidModel(e.to_string()))?;
        Ok(CsnModel::new(raw))
    }

    pub fn lookup(&self, name: &str) -> Result<&Arc<Definition>, ModelError> {
        self.definitions
            .get(name)
            .ok_or_else(|| ModelError::UnknownDefinition(name.to_string()))
    }

    pub fn get(&self, name: &str) -> Option<&Arc<Definition>> {
        self.definitions.get(name)
    }

    /// Resolve an association's target entity, applying the localized
    /// indirection when requested.
    pub fn target_of(
        &self,
        assoc: &ElementDef,
        localized: bool,
    ) -> Result<Arc<Definition>, ModelError> {
        let info = assoc
            .association
            .as_ref()
            .ok_or_else(|| ModelError::UnknownTarget(assoc.name.clone(), String::new()))?;
        let def = self
            .definitions
            .get(&info.target)
            .ok_or_else(|| ModelError::UnknownTarget(assoc.name.clone(), info.target.clone()))?;
        Ok(self.localized_view_for(def, localized).clone())
    }

    /// The localized variant of a definition when the query runs
    /// localized and the definition permits it; the definition itself
    /// otherwise.
    pub fn localized_view_for<'a>(
        &'a self,
        def: &'a Arc<Definition>,
        localized: bool,
    ) -> &'a Arc<Definition> {
        if !localized {
            return def;
        }
        def.localized_view
            .as_ref()
            .and_then(|name| self.definitions.get(name))
            .unwrap_or(def)
    }

    pub fn definitions(&self) -> impl Iterator<Item = (&String, &Arc<Definition>)> {
        self.definitions.iter()
    }
}

fn seal_elements(elements: &mut IndexMap<String, Arc<ElementDef>>) {
    for (name, elem) in elements.iter_mut() {
        if let Some(e) = Arc::get_mut(elem) {
            if e.name.is_empty() {
                e.name = name.clone();
            }
            seal_elements(&mut e.elements);
        }
    }
}
