use madprops::entities::{User, UserPreference};
use madprops::{storage, OwnerSchema, ParentId, PropertySetConfig};
use sea_orm::{Database, DatabaseConnection};
use sea_orm_migration::MigratorTrait;
use serde_json::{json, Value};
use std::sync::Arc;
use tempfile::NamedTempFile;

/// Test database with automatic cleanup
pub struct TestDb {
    connection: DatabaseConnection,
    _temp_file: NamedTempFile,
}

impl TestDb {
    /// Create a new test database with migrations applied
    pub async fn new() -> Self {
        // Create temporary SQLite database file
        let temp_file = NamedTempFile::new().expect("Failed to create temp file");
        let db_path = temp_file.path().to_str().expect("Invalid temp file path");
        let db_url = format!("sqlite://{}?mode=rwc", db_path);

        // Connect to database
        let connection = Database::connect(&db_url)
            .await
            .expect("Failed to connect to test database");

        // Run migrations
        migration::Migrator::up(&connection, None)
            .await
            .expect("Failed to run migrations");

        Self {
            connection,
            _temp_file: temp_file,
        }
    }

    /// Get database connection
    pub fn connection(&self) -> &DatabaseConnection {
        &self.connection
    }
}

/// Users with a `preferences` property set. `layout` is stored as JSON and
/// `token` can not be written.
pub fn users_schema() -> Arc<OwnerSchema> {
    let preferences = PropertySetConfig::for_entity::<UserPreference>()
        .read_only_props(["token"])
        .json_props(["layout"])
        .build()
        .expect("Failed to build preferences config");

    let schema = OwnerSchema::for_entity::<User>()
        .property_set("preferences", preferences)
        .build()
        .expect("Failed to build users schema");
    Arc::new(schema)
}

/// Insert a bare user row
pub async fn seed_user(db: &DatabaseConnection, username: &str) -> ParentId {
    let Value::Object(fields) = json!({ "username": username }) else {
        unreachable!()
    };
    storage::create_parent(db, "users", "id", &fields)
        .await
        .expect("Failed to create test user")
}
