//! Per-resource configuration of a property set.
//!
//! A [`PropertySetConfig`] is built once when a resource is registered and
//! shared (usually behind an `Arc`) by the codec, the persister and the owner
//! composer. Nothing mutates it after [`PropertySetConfigBuilder::build`].
use crate::errors::PropsError;
use crate::storage::{KeyKind, ParentId};
use sea_orm::{
    ColumnTrait, EntityTrait, IdenStatic, Identity, Iterable, PrimaryKeyToColumn, RelationTrait,
};
use std::collections::{BTreeMap, BTreeSet};

pub const NAME_COLUMN: &str = "name";
pub const VALUE_COLUMN: &str = "value";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PropertySetConfig {
    table: String,
    id_column: String,
    parent_field: String,
    parent_column: String,
    parent_key: KeyKind,
    read_only_props: BTreeSet<String>,
    json_props: BTreeSet<String>,
}

impl PropertySetConfig {
    /// Start a configuration for a property table addressed by name. The
    /// parent field has to be set explicitly.
    pub fn builder(table: impl Into<String>) -> PropertySetConfigBuilder {
        PropertySetConfigBuilder {
            table: table.into(),
            id_column: "id".to_string(),
            parent_field: None,
            parent_column: None,
            parent_key: None,
            column_kinds: BTreeMap::new(),
            detected: ParentDetection::NotScanned,
            read_only_props: BTreeSet::new(),
            json_props: BTreeSet::new(),
        }
    }

    /// Start a configuration from a sea-orm entity. The table, primary key
    /// and parent link are read from the entity definition once, here.
    pub fn for_entity<E: EntityTrait>() -> PropertySetConfigBuilder {
        let mut builder = Self::builder(E::default().table_name());
        if let Some(pk) = E::PrimaryKey::iter().next() {
            builder.id_column = pk.into_column().as_str().to_string();
        }
        builder.column_kinds = E::Column::iter()
            .map(|column| {
                let kind = KeyKind::of(column.def().get_column_type());
                (column.as_str().to_string(), kind)
            })
            .collect();
        builder.detected = ParentDetection::scan::<E>();
        builder
    }

    pub fn table(&self) -> &str {
        &self.table
    }

    pub fn id_column(&self) -> &str {
        &self.id_column
    }

    /// Name of the field linking a row to its parent, e.g. `user`.
    pub fn parent_field(&self) -> &str {
        &self.parent_field
    }

    /// Storage column holding the parent identifier, e.g. `user_id`.
    pub fn parent_column(&self) -> &str {
        &self.parent_column
    }

    pub fn parent_key(&self) -> KeyKind {
        self.parent_key
    }

    /// Routed path parameter carrying the parent identifier.
    pub fn path_param(&self) -> String {
        format!("{}_id", self.parent_field)
    }

    /// Parent identifier from a routed path segment, typed by the parent key.
    pub fn parse_parent_id(&self, segment: &str) -> Option<ParentId> {
        self.parent_key.parse(segment)
    }

    pub fn is_read_only(&self, name: &str) -> bool {
        self.read_only_props.contains(name)
    }

    pub fn is_json(&self, name: &str) -> bool {
        self.json_props.contains(name)
    }

    pub fn read_only_props(&self) -> impl Iterator<Item = &str> {
        self.read_only_props.iter().map(String::as_str)
    }

    pub fn json_props(&self) -> impl Iterator<Item = &str> {
        self.json_props.iter().map(String::as_str)
    }
}

#[derive(Debug, Clone)]
enum ParentDetection {
    NotScanned,
    Found(String),
    Missing,
    Ambiguous(Vec<String>),
}

impl ParentDetection {
    /// Collect the `from` columns of every `belongs_to` relation.
    fn scan<E: EntityTrait>() -> Self {
        let mut columns: Vec<String> = E::Relation::iter()
            .map(|rel| rel.def())
            .filter(|def| !def.is_owner)
            .filter_map(|def| match def.from_col {
                Identity::Unary(col) => Some(col.to_string()),
                _ => None,
            })
            .collect();
        columns.dedup();

        match columns.len() {
            0 => ParentDetection::Missing,
            1 => ParentDetection::Found(columns.remove(0)),
            _ => ParentDetection::Ambiguous(columns),
        }
    }
}


#[derive(Debug, Clone)]
pub struct PropertySetConfigBuilder {
    table: String,
    id_column: String,
    parent_field: Option<String>,
    parent_column: Option<String>,
    parent_key: Option<KeyKind>,
    column_kinds: BTreeMap<String, KeyKind>,
    detected: ParentDetection,
    read_only_props: BTreeSet<String>,
    json_props: BTreeSet<String>,
}

impl PropertySetConfigBuilder {
    pub fn id_column(mut self, column: impl Into<String>) -> Self {
        self.id_column = column.into();
        self
    }

    /// Name the parent link explicitly; its column defaults to `<field>_id`.
    pub fn parent_field(mut self, field: impl Into<String>) -> Self {
        self.parent_field = Some(field.into());
        self
    }

    pub fn parent_column(mut self, column: impl Into<String>) -> Self {
        self.parent_column = Some(column.into());
        self
    }

    /// Storage type of the parent key. Read from the entity when scanned,
    /// integer otherwise.
    pub fn parent_key(mut self, kind: KeyKind) -> Self {
        self.parent_key = Some(kind);
        self
    }

    pub fn read_only_props<I, S>(mut self, names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.read_only_props.extend(names.into_iter().map(Into::into));
        self
    }

    pub fn json_props<I, S>(mut self, names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.json_props.extend(names.into_iter().map(Into::into));
        self
    }

    pub fn build(self) -> Result<PropertySetConfig, PropsError> {
        let (parent_field, parent_column) = match (self.parent_field, self.detected) {
            (Some(field), _) => {
                let column = self
                    .parent_column
                    .unwrap_or_else(|| format!("{field}_id"));
                (field, column)
            }
            (None, ParentDetection::Found(column)) => {
                let field = column
                    .strip_suffix("_id")
                    .unwrap_or(&column)
                    .to_string();
                (field, self.parent_column.unwrap_or(column))
            }
            (None, ParentDetection::Ambiguous(columns)) => {
                return Err(PropsError::Configuration(format!(
                    "{} has several relations to parent models ({}); set parent_field explicitly",
                    self.table,
                    columns.join(", ")
                )));
            }
            (None, ParentDetection::Missing | ParentDetection::NotScanned) => {
                return Err(PropsError::Configuration(format!(
                    "{} misses relation to parent model",
                    self.table
                )));
            }
        };

        let parent_key = self
            .parent_key
            .or_else(|| self.column_kinds.get(&parent_column).copied())
            .unwrap_or_default();

        Ok(PropertySetConfig {
            table: self.table,
            id_column: self.id_column,
            parent_field,
            parent_column,
            parent_key,
            read_only_props: self.read_only_props,
            json_props: self.json_props,
        })
    }
}
