//! Joint persistence of a parent entity and its embedded property sets.
use crate::codec::{PendingProperty, PropertyCodec};
use crate::config::PropertySetConfig;
use crate::errors::{PropsError, ValidationErrors, EXPECTED_DICTIONARY};
use crate::persister::PropertyPersister;
use crate::storage::{self, KeyKind, ParentId, PropertyRow};
use sea_orm::{ColumnTrait, EntityTrait, IdenStatic, Iterable, PrimaryKeyToColumn};
use serde_json::{Map, Value};
use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;

#[derive(Debug, Clone)]
pub enum FieldKind {
    Scalar,
    PropertySet(Arc<PropertySetConfig>),
}

#[derive(Debug, Clone)]
pub struct FieldDescriptor {
    pub name: String,
    pub kind: FieldKind,
}

/// Field layout of an owner resource, built once at registration.
#[derive(Debug, Clone)]
pub struct OwnerSchema {
    table: String,
    primary_key: String,
    key_kind: KeyKind,
    fields: Vec<FieldDescriptor>,
}

impl OwnerSchema {
    pub fn builder(table: impl Into<String>) -> OwnerSchemaBuilder {
        OwnerSchemaBuilder {
            table: table.into(),
            primary_key: "id".to_string(),
            key_kind: KeyKind::Integer,
            fields: Vec::new(),
        }
    }

    /// Seed a schema from a sea-orm entity: every non-key column becomes a
    /// scalar field.
    pub fn for_entity<E: EntityTrait>() -> OwnerSchemaBuilder {
        let key_columns: Vec<String> = E::PrimaryKey::iter()
            .map(|pk| pk.into_column().as_str().to_string())
            .collect();

        let mut builder = Self::builder(E::default().table_name());
        if let Some(pk) = E::PrimaryKey::iter().next() {
            let column = pk.into_column();
            builder.primary_key = column.as_str().to_string();
            builder.key_kind = KeyKind::of(column.def().get_column_type());
        }
        for column in E::Column::iter() {
            let name = column.as_str();
            if !key_columns.iter().any(|pk| pk == name) {
                builder = builder.scalar(name);
            }
        }
        builder
    }

    pub fn table(&self) -> &str {
        &self.table
    }

    pub fn primary_key(&self) -> &str {
        &self.primary_key
    }

    pub fn key_kind(&self) -> KeyKind {
        self.key_kind
    }

    /// Identifier of an instance from a routed path segment.
    pub fn parse_id(&self, segment: &str) -> Option<ParentId> {
        self.key_kind.parse(segment)
    }

    pub fn fields(&self) -> &[FieldDescriptor] {
        &self.fields
    }

    pub fn field(&self, name: &str) -> Option<&FieldDescriptor> {
        self.fields.iter().find(|f| f.name == name)
    }

    pub fn property_sets(&self) -> impl Iterator<Item = (&str, &Arc<PropertySetConfig>)> {
        self.fields.iter().filter_map(|f| match &f.kind {
            FieldKind::PropertySet(config) => Some((f.name.as_str(), config)),
            FieldKind::Scalar => None,
        })
    }

    /// Path parameter naming an instance of this owner. Shared with the
    /// standalone endpoints of its property sets.
    pub fn path_param(&self) -> String {
        self.property_sets()
            .next()
            .map(|(_, config)| config.path_param())
            .unwrap_or_else(|| self.primary_key.clone())
    }
}

#[derive(Debug, Clone)]
pub struct OwnerSchemaBuilder {
    table: String,
    primary_key: String,
    key_kind: KeyKind,
    fields: Vec<FieldDescriptor>,
}

impl OwnerSchemaBuilder {
    pub fn primary_key(mut self, column: impl Into<String>) -> Self {
        self.primary_key = column.into();
        self
    }

    pub fn key_kind(mut self, kind: KeyKind) -> Self {
        self.key_kind = kind;
        self
    }

    pub fn scalar(mut self, name: impl Into<String>) -> Self {
        self.fields.push(FieldDescriptor {
            name: name.into(),
            kind: FieldKind::Scalar,
        });
        self
    }

    pub fn property_set(
        mut self,
        name: impl Into<String>,
        config: impl Into<Arc<PropertySetConfig>>,
    ) -> Self {
        self.fields.push(FieldDescriptor {
            name: name.into(),
            kind: FieldKind::PropertySet(config.into()),
        });
        self
    }

    pub fn build(self) -> Result<OwnerSchema, PropsError> {
        let mut seen = HashSet::new();
        for field in &self.fields {
            if field.name == self.primary_key || !seen.insert(field.name.as_str()) {
                return Err(PropsError::Configuration(format!(
                    "{} declares field `{}` more than once",
                    self.table, field.name
                )));
            }
        }

        let params: HashSet<String> = self
            .fields
            .iter()
            .filter_map(|f| match &f.kind {
                FieldKind::PropertySet(config) => Some(config.path_param()),
                FieldKind::Scalar => None,
            })
            .collect();
        if params.len() > 1 {
            return Err(PropsError::Configuration(format!(
                "property sets of {} link to their parent through different fields",
                self.table
            )));
        }

        Ok(OwnerSchema {
            table: self.table,
            primary_key: self.primary_key,
            key_kind: self.key_kind,
            fields: self.fields,
        })
    }
}

/// A persisted parent. `properties` holds only the property sets loaded or
/// written by the call that produced it.
#[derive(Debug, Clone, PartialEq)]
pub struct ParentRow {
    pub id: ParentId,
    pub fields: Map<String, Value>,
    pub properties: BTreeMap<String, Vec<PropertyRow>>,
}

struct Partitioned<'s> {
    scalars: Map<String, Value>,
    property_sets: Vec<(&'s str, &'s PropertySetConfig, Vec<PendingProperty>)>,
}

#[derive(Debug, Clone, Copy)]
pub struct OwnerComposer<'a> {
    schema: &'a OwnerSchema,
}

impl<'a> OwnerComposer<'a> {
    pub fn new(schema: &'a OwnerSchema) -> Self {
        Self { schema }
    }

    /// Split input into scalar columns and validated property sets. Every
    /// property set is validated before anything is written.
    fn partition(&self, input: &Value) -> Result<Partitioned<'a>, PropsError> {
        let Some(input) = input.as_object() else {
            return Err(ValidationErrors::non_field(EXPECTED_DICTIONARY).into());
        };

        let mut partitioned = Partitioned {
            scalars: Map::new(),
            property_sets: Vec::new(),
        };
        let mut errors = ValidationErrors::new();

        for (name, value) in input {
            let Some(field) = self.schema.field(name) else {
                tracing::debug!(table = self.schema.table(), %name, "Ignoring unknown field");
                continue;
            };

            match &field.kind {
                FieldKind::Scalar => {
                    partitioned.scalars.insert(name.clone(), value.clone());
                }
                FieldKind::PropertySet(_) if value.is_null() => {}
                FieldKind::PropertySet(config) => {
                    match PropertyCodec::new(config).prepare(value) {
                        Ok(pending) => partitioned.property_sets.push((
                            field.name.as_str(),
                            config.as_ref(),
                            pending,
                        )),
                        Err(PropsError::Validation(e)) => errors.merge(e.nest_under(name)),
                        Err(other) => return Err(other),
                    }
                }
            }
        }

        errors.into_result()?;
        Ok(partitioned)
    }

    async fn save_property_sets<C: sea_orm::ConnectionTrait>(
        db: &C,
        property_sets: Vec<(&str, &PropertySetConfig, Vec<PendingProperty>)>,
        parent_id: &ParentId,
    ) -> Result<BTreeMap<String, Vec<PropertyRow>>, PropsError> {
        let mut saved = BTreeMap::new();
        for (name, config, pending) in property_sets {
            let rows = PropertyPersister::new(config)
                .save_pending(db, pending, parent_id)
                .await?;
            saved.insert(name.to_string(), rows);
        }
        Ok(saved)
    }

    /// Insert the parent from its scalar fields, then save each embedded
    /// property set under the new identifier.
    pub async fn create<C: sea_orm::ConnectionTrait>(
        &self,
        db: &C,
        input: &Value,
    ) -> Result<ParentRow, PropsError> {
        let Partitioned {
            scalars,
            property_sets,
        } = self.partition(input)?;

        let id = storage::create_parent(
            db,
            self.schema.table(),
            self.schema.primary_key(),
            &scalars,
        )
        .await?;
        tracing::info!(table = self.schema.table(), %id, "Created parent");

        let properties = Self::save_property_sets(db, property_sets, &id).await?;

        let mut fields = Map::new();
        fields.insert(self.schema.primary_key().to_string(), id_value(&id));
        fields.extend(scalars);

        Ok(ParentRow {
            id,
            fields,
            properties,
        })
    }

    /// Write scalar fields onto `existing` and merge each property set by
    /// name. Stored properties missing from the input are kept.
    pub async fn update<C: sea_orm::ConnectionTrait>(
        &self,
        db: &C,
        existing: &ParentRow,
        input: &Value,
    ) -> Result<ParentRow, PropsError> {
        let Partitioned {
            scalars,
            property_sets,
        } = self.partition(input)?;

        storage::update_parent(
            db,
            self.schema.table(),
            self.schema.primary_key(),
            &existing.id,
            &scalars,
        )
        .await?;
        tracing::info!(table = self.schema.table(), id = %existing.id, "Updated parent");

        let properties = Self::save_property_sets(db, property_sets, &existing.id).await?;

        let mut fields = existing.fields.clone();
        fields.extend(scalars);

        Ok(ParentRow {
            id: existing.id.clone(),
            fields,
            properties,
        })
    }

    /// Read a parent together with every property set.
    pub async fn load<C: sea_orm::ConnectionTrait>(
        &self,
        db: &C,
        id: &ParentId,
    ) -> Result<ParentRow, PropsError> {
        let fields = storage::find_parent(db, self.schema.table(), self.schema.primary_key(), id)
            .await?
            .ok_or_else(|| PropsError::NotFound(format!("{} {}", self.schema.table(), id)))?;

        let mut properties = BTreeMap::new();
        for (name, config) in self.schema.property_sets() {
            let rows = PropertyPersister::new(config).load(db, id).await?;
            properties.insert(name.to_string(), rows);
        }

        Ok(ParentRow {
            id: id.clone(),
            fields,
            properties,
        })
    }

    /// Wire form of a parent: its columns plus one mapping per property set,
    /// `null` for sets that were not loaded.
    pub fn represent(&self, parent: &ParentRow) -> Result<Value, PropsError> {
        let mut out = parent.fields.clone();
        for (name, config) in self.schema.property_sets() {
            let rows = parent.properties.get(name).map(Vec::as_slice);
            out.insert(
                name.to_string(),
                PropertyCodec::new(config).encode_field(rows)?,
            );
        }
        Ok(Value::Object(out))
    }
}

fn id_value(id: &ParentId) -> Value {
    match id {
        ParentId::Int(id) => Value::from(*id),
        ParentId::Text(id) => Value::String(id.clone()),
    }
}
