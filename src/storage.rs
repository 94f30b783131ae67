use crate::codec::CanonicalProperty;
use crate::config::{PropertySetConfig, NAME_COLUMN, VALUE_COLUMN};
use crate::errors::PropsError;
use crate::settings::Database as DbCfg;
use sea_orm::sea_query::{
    Alias, Asterisk, Expr, InsertStatement, Order, Query, SelectStatement, SimpleExpr,
};
use sea_orm::{
    ColumnType, ConnectionTrait, Database, DatabaseConnection, DbErr, FromQueryResult, JsonValue,
    QueryResult,
};
use serde::{Deserialize, Serialize};
use serde_json::Map;
use std::fmt;

/// Opaque identifier of a parent entity.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ParentId {
    Int(i64),
    Text(String),
}

/// Storage type of a parent key. Decides how a routed path segment becomes
/// a [`ParentId`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum KeyKind {
    #[default]
    Integer,
    Text,
}

impl KeyKind {
    pub fn of(column_type: &ColumnType) -> Self {
        match column_type {
            ColumnType::TinyInteger
            | ColumnType::SmallInteger
            | ColumnType::Integer
            | ColumnType::BigInteger
            | ColumnType::TinyUnsigned
            | ColumnType::SmallUnsigned
            | ColumnType::Unsigned
            | ColumnType::BigUnsigned => KeyKind::Integer,
            _ => KeyKind::Text,
        }
    }

    /// `None` when an integer key is given a segment that is not one.
    pub fn parse(self, segment: &str) -> Option<ParentId> {
        match self {
            KeyKind::Integer => segment.parse::<i64>().ok().map(ParentId::Int),
            KeyKind::Text => Some(ParentId::Text(segment.to_string())),
        }
    }
}

impl ParentId {
    fn from_row(row: &QueryResult, column: &str) -> Result<Self, DbErr> {
        if let Ok(id) = row.try_get::<i64>("", column) {
            return Ok(ParentId::Int(id));
        }
        if let Ok(id) = row.try_get::<i32>("", column) {
            return Ok(ParentId::Int(id.into()));
        }
        row.try_get::<String>("", column).map(ParentId::Text)
    }
}

impl fmt::Display for ParentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ParentId::Int(id) => write!(f, "{id}"),
            ParentId::Text(id) => f.write_str(id),
        }
    }
}

impl From<i64> for ParentId {
    fn from(value: i64) -> Self {
        ParentId::Int(value)
    }
}

impl From<i32> for ParentId {
    fn from(value: i32) -> Self {
        ParentId::Int(value.into())
    }
}

impl From<&str> for ParentId {
    fn from(value: &str) -> Self {
        ParentId::Text(value.to_string())
    }
}

impl From<String> for ParentId {
    fn from(value: String) -> Self {
        ParentId::Text(value)
    }
}

impl From<&ParentId> for sea_orm::Value {
    fn from(value: &ParentId) -> Self {
        match value {
            ParentId::Int(id) => (*id).into(),
            ParentId::Text(id) => id.clone().into(),
        }
    }
}

/// One `(parent_id, name, value)` row. `id` is `None` for a row that was
/// never written.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PropertyRow {
    pub id: Option<i64>,
    pub parent_id: ParentId,
    pub name: String,
    pub value: String,
}

impl PropertyRow {
    pub fn is_persisted(&self) -> bool {
        self.id.is_some()
    }
}

#[derive(Debug)]
struct StoredProperty {
    id: i64,
    name: String,
    value: String,
}

impl FromQueryResult for StoredProperty {
    fn from_query_result(res: &QueryResult, pre: &str) -> Result<Self, DbErr> {
        // int4 keys on Postgres do not decode as i64
        let id = res
            .try_get::<i64>(pre, "id")
            .or_else(|_| res.try_get::<i32>(pre, "id").map(i64::from))?;
        Ok(Self {
            id,
            name: res.try_get(pre, NAME_COLUMN)?,
            value: res.try_get(pre, VALUE_COLUMN)?,
        })
    }
}

impl StoredProperty {
    fn into_row(self, parent_id: &ParentId) -> PropertyRow {
        PropertyRow {
            id: Some(self.id),
            parent_id: parent_id.clone(),
            name: self.name,
            value: self.value,
        }
    }
}

pub async fn init(cfg: &DbCfg) -> Result<DatabaseConnection, PropsError> {
    let db = Database::connect(&cfg.url).await?;
    Ok(db)
}

fn col(name: &str) -> Alias {
    Alias::new(name)
}

fn select_properties(config: &PropertySetConfig, parent_id: &ParentId) -> SelectStatement {
    Query::select()
        .expr_as(Expr::col(col(config.id_column())), col("id"))
        .column(col(NAME_COLUMN))
        .column(col(VALUE_COLUMN))
        .from(col(config.table()))
        .and_where(Expr::col(col(config.parent_column())).eq(sea_orm::Value::from(parent_id)))
        .to_owned()
}

/// Look up the row of `parent_id` named `name`, if any.
pub async fn find_property<C: ConnectionTrait>(
    db: &C,
    config: &PropertySetConfig,
    parent_id: &ParentId,
    name: &str,
) -> Result<Option<PropertyRow>, PropsError> {
    let query = select_properties(config, parent_id)
        .and_where(Expr::col(col(NAME_COLUMN)).eq(name))
        .to_owned();
    let stmt = db.get_database_backend().build(&query);

    let found = StoredProperty::find_by_statement(stmt).one(db).await?;
    Ok(found.map(|stored| stored.into_row(parent_id)))
}

/// All rows of `parent_id`, in insertion order.
pub async fn list_properties<C: ConnectionTrait>(
    db: &C,
    config: &PropertySetConfig,
    parent_id: &ParentId,
) -> Result<Vec<PropertyRow>, PropsError> {
    let query = select_properties(config, parent_id)
        .order_by(col(config.id_column()), Order::Asc)
        .to_owned();
    let stmt = db.get_database_backend().build(&query);

    let rows = StoredProperty::find_by_statement(stmt).all(db).await?;
    Ok(rows
        .into_iter()
        .map(|stored| stored.into_row(parent_id))
        .collect())
}

pub async fn insert_property<C: ConnectionTrait>(
    db: &C,
    config: &PropertySetConfig,
    property: &CanonicalProperty,
) -> Result<PropertyRow, PropsError> {
    let mut insert = Query::insert();
    insert
        .into_table(col(config.table()))
        .columns([
            col(config.parent_column()),
            col(NAME_COLUMN),
            col(VALUE_COLUMN),
        ])
        .values([
            sea_orm::Value::from(&property.parent_id).into(),
            property.name.clone().into(),
            property.value.clone().into(),
        ])
        .map_err(|e| DbErr::Custom(e.to_string()))?;

    let id = insert_returning_id(db, &mut insert, config.id_column()).await?;
    let id = match id {
        ParentId::Int(id) => id,
        ParentId::Text(other) => {
            return Err(PropsError::Db(DbErr::Type(format!(
                "property id `{other}` is not an integer"
            ))))
        }
    };

    Ok(PropertyRow {
        id: Some(id),
        parent_id: property.parent_id.clone(),
        name: property.name.clone(),
        value: property.value.clone(),
    })
}

/// Replace the stored value of `row`, writing that single column.
pub async fn update_property_value<C: ConnectionTrait>(
    db: &C,
    config: &PropertySetConfig,
    row: &mut PropertyRow,
    value: String,
) -> Result<(), PropsError> {
    let id = row.id.ok_or(DbErr::RecordNotUpdated)?;
    let update = Query::update()
        .table(col(config.table()))
        .value(col(VALUE_COLUMN), value.clone())
        .and_where(Expr::col(col(config.id_column())).eq(id))
        .to_owned();
    db.execute(db.get_database_backend().build(&update)).await?;

    row.value = value;
    Ok(())
}

fn scalar_value(value: &JsonValue) -> SimpleExpr {
    let value: sea_orm::Value = match value {
        JsonValue::Null => sea_orm::Value::String(None),
        JsonValue::Bool(b) => (*b).into(),
        JsonValue::Number(n) => match n.as_i64() {
            Some(i) => i.into(),
            None => n.as_f64().into(),
        },
        JsonValue::String(s) => s.clone().into(),
        other => other.to_string().into(),
    };
    value.into()
}

async fn insert_returning_id<C: ConnectionTrait>(
    db: &C,
    insert: &mut InsertStatement,
    id_column: &str,
) -> Result<ParentId, PropsError> {
    let backend = db.get_database_backend();
    insert.returning_col(col(id_column));
    let row = db
        .query_one(backend.build(&*insert))
        .await?
        .ok_or(DbErr::RecordNotInserted)?;
    Ok(ParentId::from_row(&row, id_column)?)
}

/// Insert a parent row from its scalar fields and return its identifier.
pub async fn create_parent<C: ConnectionTrait>(
    db: &C,
    table: &str,
    primary_key: &str,
    fields: &Map<String, JsonValue>,
) -> Result<ParentId, PropsError> {
    let mut insert = Query::insert();
    insert.into_table(col(table));
    if fields.is_empty() {
        insert.or_default_values();
    } else {
        insert
            .columns(fields.keys().map(|k| col(k)))
            .values(fields.values().map(scalar_value))
            .map_err(|e| DbErr::Custom(e.to_string()))?;
    }

    insert_returning_id(db, &mut insert, primary_key).await
}

pub async fn update_parent<C: ConnectionTrait>(
    db: &C,
    table: &str,
    primary_key: &str,
    id: &ParentId,
    fields: &Map<String, JsonValue>,
) -> Result<(), PropsError> {
    if fields.is_empty() {
        return Ok(());
    }

    let update = Query::update()
        .table(col(table))
        .values(fields.iter().map(|(k, v)| (col(k), scalar_value(v))))
        .and_where(Expr::col(col(primary_key)).eq(sea_orm::Value::from(id)))
        .to_owned();
    let result = db.execute(db.get_database_backend().build(&update)).await?;
    if result.rows_affected() == 0 {
        return Err(PropsError::NotFound(format!("{table} {id}")));
    }
    Ok(())
}

/// Fetch a parent row as a column → value map.
pub async fn find_parent<C: ConnectionTrait>(
    db: &C,
    table: &str,
    primary_key: &str,
    id: &ParentId,
) -> Result<Option<Map<String, JsonValue>>, PropsError> {
    let query = Query::select()
        .column(Asterisk)
        .from(col(table))
        .and_where(Expr::col(col(primary_key)).eq(sea_orm::Value::from(id)))
        .to_owned();
    let stmt = db.get_database_backend().build(&query);

    match JsonValue::find_by_statement(stmt).one(db).await? {
        Some(JsonValue::Object(fields)) => Ok(Some(fields)),
        Some(_) | None => Ok(None),
    }
}
