//! Upsert-by-name persistence of property sets.
//!
//! Rows are matched on `(parent, name)`: a match has its value replaced, a
//! new name is inserted, and names missing from the input are left alone.
//! Each row is written on its own; pass a `DatabaseTransaction` as the
//! connection when a whole set has to land atomically.
//!
//! The lookup and the insert are two statements, so two writers creating the
//! same name for the same parent at once can both insert. Only a unique index
//! on `(parent, name)` in the schema prevents the duplicate.
use crate::codec::{CanonicalProperty, PendingProperty, PropertyCodec};
use crate::config::PropertySetConfig;
use crate::errors::PropsError;
use crate::storage::{self, ParentId, PropertyRow};
use sea_orm::ConnectionTrait;
use serde_json::{json, Map, Value};
use std::collections::HashMap;

/// Where the parent identifier of a write comes from.
///
/// An explicit id wins over the routed `<parent_field>_id` path parameter;
/// nested writes use the former, standalone endpoints the latter.
#[derive(Debug, Clone, Default)]
pub struct ParentContext {
    parent_id: Option<ParentId>,
    path_params: HashMap<String, String>,
}

impl ParentContext {
    pub fn from_path(path_params: HashMap<String, String>) -> Self {
        Self {
            parent_id: None,
            path_params,
        }
    }

    pub fn with_parent_id(mut self, parent_id: impl Into<ParentId>) -> Self {
        self.parent_id = Some(parent_id.into());
        self
    }

    pub fn resolve(&self, config: &PropertySetConfig) -> Result<ParentId, PropsError> {
        if let Some(id) = &self.parent_id {
            return Ok(id.clone());
        }

        let param = config.path_param();
        match self.path_params.get(&param) {
            Some(raw) => config.parse_parent_id(raw).ok_or_else(|| {
                PropsError::NotFound(format!("parent `{raw}` of {}", config.table()))
            }),
            None => Err(PropsError::Configuration(format!(
                "no parent identifier for {}: expected a `{}` path parameter or an explicit parent_id",
                config.table(),
                param
            ))),
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct PropertyPersister<'a> {
    config: &'a PropertySetConfig,
}

impl<'a> PropertyPersister<'a> {
    pub fn new(config: &'a PropertySetConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &'a PropertySetConfig {
        self.config
    }

    pub fn codec(&self) -> PropertyCodec<'a> {
        PropertyCodec::new(self.config)
    }

    /// Upsert one canonical row and return the stored row. An existing row
    /// keeps its id.
    pub async fn save<C: ConnectionTrait>(
        &self,
        db: &C,
        property: CanonicalProperty,
    ) -> Result<PropertyRow, PropsError> {
        // Normally filtered by the codec already.
        if self.config.is_read_only(&property.name) {
            tracing::debug!(
                table = self.config.table(),
                name = %property.name,
                "Not saving read-only property"
            );
            return Ok(PropertyRow {
                id: None,
                parent_id: property.parent_id,
                name: property.name,
                value: property.value,
            });
        }

        let existing =
            storage::find_property(db, self.config, &property.parent_id, &property.name).await?;

        match existing {
            Some(mut row) => {
                storage::update_property_value(db, self.config, &mut row, property.value).await?;
                tracing::debug!(
                    table = self.config.table(),
                    parent = %row.parent_id,
                    name = %row.name,
                    "Updated property"
                );
                Ok(row)
            }
            None => {
                let row = storage::insert_property(db, self.config, &property).await?;
                tracing::debug!(
                    table = self.config.table(),
                    parent = %row.parent_id,
                    name = %row.name,
                    "Inserted property"
                );
                Ok(row)
            }
        }
    }

    /// Decode `input` and save every entry for `parent_id`, in input order.
    pub async fn save_many<C: ConnectionTrait>(
        &self,
        db: &C,
        input: &Value,
        parent_id: &ParentId,
    ) -> Result<Vec<PropertyRow>, PropsError> {
        let pending = self.codec().prepare(input)?;
        self.save_pending(db, pending, parent_id).await
    }

    /// Save entries that were validated before the parent id was known.
    pub async fn save_pending<C: ConnectionTrait>(
        &self,
        db: &C,
        pending: Vec<PendingProperty>,
        parent_id: &ParentId,
    ) -> Result<Vec<PropertyRow>, PropsError> {
        let mut saved = Vec::with_capacity(pending.len());
        for property in pending {
            saved.push(self.save(db, property.attach(parent_id)).await?);
        }
        Ok(saved)
    }

    pub async fn save_in_context<C: ConnectionTrait>(
        &self,
        db: &C,
        input: &Value,
        context: &ParentContext,
    ) -> Result<Vec<PropertyRow>, PropsError> {
        let parent_id = context.resolve(self.config)?;
        self.save_many(db, input, &parent_id).await
    }

    pub async fn load<C: ConnectionTrait>(
        &self,
        db: &C,
        parent_id: &ParentId,
    ) -> Result<Vec<PropertyRow>, PropsError> {
        storage::list_properties(db, self.config, parent_id).await
    }

    /// The full `{name: value}` mapping of a parent.
    pub async fn representation<C: ConnectionTrait>(
        &self,
        db: &C,
        parent_id: &ParentId,
    ) -> Result<Map<String, Value>, PropsError> {
        let rows = self.load(db, parent_id).await?;
        self.codec().encode(&rows)
    }

    /// `{"value": v}` for a single property.
    pub async fn get_one<C: ConnectionTrait>(
        &self,
        db: &C,
        parent_id: &ParentId,
        name: &str,
    ) -> Result<Value, PropsError> {
        let row = storage::find_property(db, self.config, parent_id, name)
            .await?
            .ok_or_else(|| {
                PropsError::NotFound(format!("property `{name}` of {parent_id}"))
            })?;
        let value = self.codec().decode_value(&row.name, &row.value)?;
        Ok(json!({ "value": value }))
    }

    /// Upsert a single property and return `{"value": v}`. A read-only name
    /// is not written; its current value is returned instead.
    pub async fn save_one<C: ConnectionTrait>(
        &self,
        db: &C,
        parent_id: &ParentId,
        name: &str,
        value: Value,
    ) -> Result<Value, PropsError> {
        let mut input = Map::new();
        input.insert(name.to_string(), value);
        let saved = self.save_many(db, &Value::Object(input), parent_id).await?;

        match saved.first() {
            Some(row) => {
                let value = self.codec().decode_value(&row.name, &row.value)?;
                Ok(json!({ "value": value }))
            }
            None => self.get_one(db, parent_id, name).await,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entities::UserPreference;
    use crate::storage::KeyKind;
    use crate::test_db::TestDb;
    use sea_orm::{DatabaseConnection, TransactionTrait};

    fn prefs_config() -> PropertySetConfig {
        PropertySetConfig::for_entity::<UserPreference>()
            .read_only_props(["token"])
            .json_props(["cfg"])
            .build()
            .expect("Failed to build config")
    }

    async fn seed_user(db: &DatabaseConnection, username: &str) -> ParentId {
        let fields = json!({ "username": username });
        storage::create_parent(db, "users", "id", fields.as_object().unwrap())
            .await
            .expect("Failed to create user")
    }

    fn canonical(parent_id: &ParentId, name: &str, value: &str) -> CanonicalProperty {
        CanonicalProperty {
            parent_id: parent_id.clone(),
            name: name.to_string(),
            value: value.to_string(),
        }
    }

    #[tokio::test]
    async fn test_save_twice_keeps_one_row() {
        let test_db = TestDb::new().await;
        let db = test_db.connection();
        let config = prefs_config();
        let persister = PropertyPersister::new(&config);
        let user = seed_user(db, "alice").await;

        let first = persister
            .save(db, canonical(&user, "theme", "dark"))
            .await
            .expect("Failed to save");
        let second = persister
            .save(db, canonical(&user, "theme", "light"))
            .await
            .expect("Failed to save");

        assert_eq!(first.id, second.id);
        let rows = persister.load(db, &user).await.expect("Failed to load");
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].value, "light");
    }

    #[tokio::test]
    async fn test_save_many_does_not_delete() {
        let test_db = TestDb::new().await;
        let db = test_db.connection();
        let config = prefs_config();
        let persister = PropertyPersister::new(&config);
        let user = seed_user(db, "alice").await;

        persister
            .save_many(db, &json!({"a": "1", "b": "2"}), &user)
            .await
            .expect("Failed to save");
        let saved = persister
            .save_many(db, &json!({"a": "9"}), &user)
            .await
            .expect("Failed to save");

        assert_eq!(saved.len(), 1);
        let mapping = persister
            .representation(db, &user)
            .await
            .expect("Failed to load");
        assert_eq!(Value::Object(mapping), json!({"a": "9", "b": "2"}));
    }

    #[tokio::test]
    async fn test_save_many_skips_read_only() {
        let test_db = TestDb::new().await;
        let db = test_db.connection();
        let config = prefs_config();
        let persister = PropertyPersister::new(&config);
        let user = seed_user(db, "alice").await;

        let saved = persister
            .save_many(db, &json!({"token": "x", "name1": "y"}), &user)
            .await
            .expect("Failed to save");

        assert_eq!(saved.len(), 1);
        assert_eq!(saved[0].name, "name1");
        let mapping = persister
            .representation(db, &user)
            .await
            .expect("Failed to load");
        assert_eq!(Value::Object(mapping), json!({"name1": "y"}));
    }

    #[tokio::test]
    async fn test_save_read_only_row_is_returned_untouched() {
        let test_db = TestDb::new().await;
        let db = test_db.connection();
        let config = prefs_config();
        let persister = PropertyPersister::new(&config);
        let user = seed_user(db, "alice").await;

        let row = persister
            .save(db, canonical(&user, "token", "x"))
            .await
            .expect("Failed to save");

        assert!(!row.is_persisted());
        assert_eq!(row.value, "x");
        assert!(persister.load(db, &user).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_json_property_round_trip() {
        let test_db = TestDb::new().await;
        let db = test_db.connection();
        let config = prefs_config();
        let persister = PropertyPersister::new(&config);
        let user = seed_user(db, "alice").await;

        let saved = persister
            .save_many(db, &json!({"cfg": [1, 2, 3]}), &user)
            .await
            .expect("Failed to save");
        assert_eq!(saved[0].value, "[1, 2, 3]");

        let mapping = persister
            .representation(db, &user)
            .await
            .expect("Failed to load");
        assert_eq!(Value::Object(mapping), json!({"cfg": [1, 2, 3]}));
    }

    #[tokio::test]
    async fn test_non_mapping_persists_nothing() {
        let test_db = TestDb::new().await;
        let db = test_db.connection();
        let config = prefs_config();
        let persister = PropertyPersister::new(&config);
        let user = seed_user(db, "alice").await;

        let err = persister
            .save_many(db, &json!(["a", "b"]), &user)
            .await
            .unwrap_err();
        assert_eq!(
            err.to_string(),
            "Validation error: non_field_errors: Expected a dictionary."
        );

        let err = persister
            .save_many(db, &json!({"ok": "1", "bad": [1]}), &user)
            .await
            .unwrap_err();
        assert!(matches!(err, PropsError::Validation(_)));
        assert!(persister.load(db, &user).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_round_trip_through_representation() {
        let test_db = TestDb::new().await;
        let db = test_db.connection();
        let config = prefs_config();
        let persister = PropertyPersister::new(&config);
        let user = seed_user(db, "alice").await;

        let before = persister
            .save_many(db, &json!({"k1": "v1", "cfg": {"a": [1, "x"]}}), &user)
            .await
            .expect("Failed to save");
        let mapping = persister.representation(db, &user).await.unwrap();
        let after = persister
            .save_many(db, &Value::Object(mapping), &user)
            .await
            .expect("Failed to save");

        let pairs = |rows: &[PropertyRow]| {
            rows.iter()
                .map(|r| (r.id, r.name.clone(), r.value.clone()))
                .collect::<Vec<_>>()
        };
        assert_eq!(pairs(&before), pairs(&after));
        assert_eq!(persister.load(db, &user).await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_parents_are_isolated() {
        let test_db = TestDb::new().await;
        let db = test_db.connection();
        let config = prefs_config();
        let persister = PropertyPersister::new(&config);
        let alice = seed_user(db, "alice").await;
        let bob = seed_user(db, "bob").await;

        persister
            .save_many(db, &json!({"theme": "dark"}), &alice)
            .await
            .unwrap();
        persister
            .save_many(db, &json!({"theme": "light"}), &bob)
            .await
            .unwrap();

        assert_eq!(
            Value::Object(persister.representation(db, &alice).await.unwrap()),
            json!({"theme": "dark"})
        );
    }

    #[tokio::test]
    async fn test_save_many_inside_rolled_back_transaction() {
        let test_db = TestDb::new().await;
        let db = test_db.connection();
        let config = prefs_config();
        let persister = PropertyPersister::new(&config);
        let user = seed_user(db, "alice").await;

        let txn = db.begin().await.expect("Failed to begin");
        persister
            .save_many(&txn, &json!({"a": "1"}), &user)
            .await
            .expect("Failed to save");
        txn.rollback().await.expect("Failed to roll back");

        assert!(persister.load(db, &user).await.unwrap().is_empty());
    }

    #[test]
    fn test_context_resolution() {
        let config = prefs_config();

        let from_path =
            ParentContext::from_path(HashMap::from([("user_id".to_string(), "4".to_string())]));
        assert_eq!(from_path.resolve(&config).unwrap(), ParentId::Int(4));

        let explicit = from_path.with_parent_id(ParentId::Int(9));
        assert_eq!(explicit.resolve(&config).unwrap(), ParentId::Int(9));

        let wrong =
            ParentContext::from_path(HashMap::from([("id".to_string(), "4".to_string())]));
        assert!(matches!(
            wrong.resolve(&config),
            Err(PropsError::Configuration(_))
        ));

        let not_a_key =
            ParentContext::from_path(HashMap::from([("user_id".to_string(), "abc".to_string())]));
        assert!(matches!(
            not_a_key.resolve(&config),
            Err(PropsError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_text_parent_key_from_path() {
        let test_db = TestDb::new().await;
        let db = test_db.connection();
        for sql in [
            "CREATE TABLE accounts (code TEXT PRIMARY KEY)",
            "CREATE TABLE account_props (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                account_id TEXT NOT NULL REFERENCES accounts (code),
                name TEXT NOT NULL,
                value TEXT NOT NULL
            )",
            "INSERT INTO accounts (code) VALUES ('007'), ('7')",
        ] {
            db.execute_unprepared(sql).await.expect("Failed to set up accounts");
        }

        let config = PropertySetConfig::builder("account_props")
            .parent_field("account")
            .parent_key(KeyKind::Text)
            .build()
            .expect("Failed to build config");
        let persister = PropertyPersister::new(&config);
        let bond = ParentId::Text("007".to_string());
        persister
            .save_many(db, &json!({"theme": "dark"}), &bond)
            .await
            .expect("Failed to save");

        let context =
            ParentContext::from_path(HashMap::from([("account_id".to_string(), "007".to_string())]));
        let resolved = context.resolve(&config).expect("Failed to resolve");
        assert_eq!(resolved, bond);
        assert_eq!(
            Value::Object(persister.representation(db, &resolved).await.unwrap()),
            json!({"theme": "dark"})
        );

        persister
            .save_in_context(db, &json!({"theme": "light"}), &context)
            .await
            .expect("Failed to save");

        let rows = persister.load(db, &bond).await.unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].value, "light");
        let seven = ParentId::Text("7".to_string());
        assert!(persister.load(db, &seven).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_save_many_failure_keeps_earlier_rows() {
        let test_db = TestDb::new().await;
        let db = test_db.connection();
        let config = prefs_config();
        let persister = PropertyPersister::new(&config);
        let user = seed_user(db, "alice").await;

        db.execute_unprepared(
            "CREATE TRIGGER reject_boom BEFORE INSERT ON user_preferences
             WHEN NEW.name = 'boom'
             BEGIN SELECT RAISE(ABORT, 'boom rejected'); END",
        )
        .await
        .expect("Failed to create trigger");

        let err = persister
            .save_many(db, &json!({"a": "1", "boom": "2", "c": "3"}), &user)
            .await
            .unwrap_err();
        assert!(matches!(err, PropsError::Db(_)));

        let mapping = persister.representation(db, &user).await.unwrap();
        assert_eq!(Value::Object(mapping), json!({"a": "1"}));
    }

    #[tokio::test]
    async fn test_save_in_context_uses_path_param() {
        let test_db = TestDb::new().await;
        let db = test_db.connection();
        let config = prefs_config();
        let persister = PropertyPersister::new(&config);
        let user = seed_user(db, "alice").await;

        let context =
            ParentContext::from_path(HashMap::from([("user_id".to_string(), user.to_string())]));
        let saved = persister
            .save_in_context(db, &json!({"k1": "v1"}), &context)
            .await
            .expect("Failed to save");
        assert_eq!(saved[0].parent_id, user);
    }

    #[tokio::test]
    async fn test_single_property_access() {
        let test_db = TestDb::new().await;
        let db = test_db.connection();
        let config = prefs_config();
        let persister = PropertyPersister::new(&config);
        let user = seed_user(db, "alice").await;

        let missing = persister.get_one(db, &user, "theme").await.unwrap_err();
        assert!(matches!(missing, PropsError::NotFound(_)));

        let saved = persister
            .save_one(db, &user, "cfg", json!({"cols": 2}))
            .await
            .expect("Failed to save");
        assert_eq!(saved, json!({"value": {"cols": 2}}));
        assert_eq!(
            persister.get_one(db, &user, "cfg").await.unwrap(),
            json!({"value": {"cols": 2}})
        );

        let read_only = persister
            .save_one(db, &user, "token", json!("x"))
            .await
            .unwrap_err();
        assert!(matches!(read_only, PropsError::NotFound(_)));
    }
}
