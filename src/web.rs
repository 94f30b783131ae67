//! HTTP surface for owner resources and their property sets.
//!
//! For an owner table `T` whose property sets link back through `P`:
//!
//! - `POST /T`, `GET|PUT /T/{P}`: the owner with its embedded property sets
//! - `GET|PUT /T/{P}/<field>`: one property set as a `{name: value}` mapping
//! - `GET|PUT /T/{P}/<field>/{name}`: one property as `{"value": v}`
use crate::config::PropertySetConfig;
use crate::errors::PropsError;
use crate::owner::{OwnerComposer, OwnerSchema};
use crate::persister::{ParentContext, PropertyPersister};
use crate::storage::ParentId;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::routing::{get, post};
use axum::{Json, Router};
use miette::IntoDiagnostic;
use sea_orm::{DatabaseConnection, TransactionTrait};
use serde::Deserialize;
use serde_json::Value;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;

#[derive(Clone)]
pub struct AppState {
    pub db: DatabaseConnection,
}

type Params = Path<HashMap<String, String>>;

#[derive(Debug, Deserialize)]
struct PropertyValue {
    value: Value,
}

pub fn router(db: DatabaseConnection, schemas: Vec<Arc<OwnerSchema>>) -> Router {
    let mut router = Router::new();
    for schema in schemas {
        router = router.merge(owner_routes(schema));
    }
    router.with_state(AppState { db })
}

pub async fn serve(
    addr: &str,
    db: DatabaseConnection,
    schemas: Vec<Arc<OwnerSchema>>,
) -> miette::Result<()> {
    let addr: SocketAddr = addr
        .parse()
        .map_err(|e| miette::miette!("bad listen addr: {e}"))?;
    let app = router(db, schemas);

    let listener = tokio::net::TcpListener::bind(addr).await.into_diagnostic()?;
    tracing::info!(%addr, "Property API listening");
    axum::serve(listener, app).await.into_diagnostic()?;
    Ok(())
}

fn owner_routes(schema: Arc<OwnerSchema>) -> Router<AppState> {
    let table = schema.table().to_string();
    let param = schema.path_param();
    let item = format!("/{table}/{{{param}}}");

    let create = {
        let schema = schema.clone();
        move |state: State<AppState>, Json(body): Json<Value>| {
            create_owner(state, schema.clone(), body)
        }
    };
    let show = {
        let schema = schema.clone();
        move |state: State<AppState>, params: Params| get_owner(state, schema.clone(), params)
    };
    let update = {
        let schema = schema.clone();
        move |state: State<AppState>, params: Params, Json(body): Json<Value>| {
            update_owner(state, schema.clone(), params, body)
        }
    };

    let mut router = Router::new()
        .route(&format!("/{table}"), post(create))
        .route(&item, get(show).put(update));

    for (field, config) in schema.property_sets() {
        router = router
            .route(&format!("{item}/{field}"), property_set_routes(config.clone()))
            .route(
                &format!("{item}/{field}/{{name}}"),
                single_property_routes(config.clone()),
            );
        tracing::debug!(%table, %field, "Registered property set routes");
    }
    router
}

fn property_set_routes(config: Arc<PropertySetConfig>) -> axum::routing::MethodRouter<AppState> {
    let list = {
        let config = config.clone();
        move |state: State<AppState>, params: Params| list_properties(state, config.clone(), params)
    };
    let replace = move |state: State<AppState>, params: Params, Json(body): Json<Value>| {
        save_properties(state, config.clone(), params, body)
    };
    get(list).put(replace)
}

fn single_property_routes(
    config: Arc<PropertySetConfig>,
) -> axum::routing::MethodRouter<AppState> {
    let show = {
        let config = config.clone();
        move |state: State<AppState>, params: Params| get_property(state, config.clone(), params)
    };
    let replace = move |state: State<AppState>, params: Params, Json(body): Json<PropertyValue>| {
        set_property(state, config.clone(), params, body)
    };
    get(show).put(replace)
}

fn owner_id(schema: &OwnerSchema, params: &HashMap<String, String>) -> Result<ParentId, PropsError> {
    let param = schema.path_param();
    let raw = params
        .get(&param)
        .ok_or_else(|| PropsError::Configuration(format!("missing `{param}` path parameter")))?;
    schema
        .parse_id(raw)
        .ok_or_else(|| PropsError::NotFound(format!("{} {raw}", schema.table())))
}

async fn create_owner(
    State(state): State<AppState>,
    schema: Arc<OwnerSchema>,
    body: Value,
) -> Result<(StatusCode, Json<Value>), PropsError> {
    let composer = OwnerComposer::new(&schema);

    let txn = state.db.begin().await?;
    let created = composer.create(&txn, &body).await?;
    let parent = composer.load(&txn, &created.id).await?;
    txn.commit().await?;

    Ok((StatusCode::CREATED, Json(composer.represent(&parent)?)))
}

async fn get_owner(
    State(state): State<AppState>,
    schema: Arc<OwnerSchema>,
    Path(params): Params,
) -> Result<Json<Value>, PropsError> {
    let composer = OwnerComposer::new(&schema);
    let id = owner_id(&schema, &params)?;
    let parent = composer.load(&state.db, &id).await?;
    Ok(Json(composer.represent(&parent)?))
}

async fn update_owner(
    State(state): State<AppState>,
    schema: Arc<OwnerSchema>,
    Path(params): Params,
    body: Value,
) -> Result<Json<Value>, PropsError> {
    let composer = OwnerComposer::new(&schema);
    let id = owner_id(&schema, &params)?;

    let txn = state.db.begin().await?;
    let existing = composer.load(&txn, &id).await?;
    composer.update(&txn, &existing, &body).await?;
    let parent = composer.load(&txn, &id).await?;
    txn.commit().await?;

    Ok(Json(composer.represent(&parent)?))
}

async fn list_properties(
    State(state): State<AppState>,
    config: Arc<PropertySetConfig>,
    Path(params): Params,
) -> Result<Json<Value>, PropsError> {
    let persister = PropertyPersister::new(&config);
    let parent_id = ParentContext::from_path(params).resolve(&config)?;
    let mapping = persister.representation(&state.db, &parent_id).await?;
    Ok(Json(Value::Object(mapping)))
}

/// Merge the body into the stored set and echo the entries written.
async fn save_properties(
    State(state): State<AppState>,
    config: Arc<PropertySetConfig>,
    Path(params): Params,
    body: Value,
) -> Result<Json<Value>, PropsError> {
    let persister = PropertyPersister::new(&config);
    let context = ParentContext::from_path(params);
    let saved = persister
        .save_in_context(&state.db, &body, &context)
        .await?;
    Ok(Json(Value::Object(persister.codec().encode(&saved)?)))
}

async fn get_property(
    State(state): State<AppState>,
    config: Arc<PropertySetConfig>,
    Path(params): Params,
) -> Result<Json<Value>, PropsError> {
    let persister = PropertyPersister::new(&config);
    let parent_id = ParentContext::from_path(params.clone()).resolve(&config)?;
    let name = params.get("name").cloned().unwrap_or_default();
    Ok(Json(persister.get_one(&state.db, &parent_id, &name).await?))
}

async fn set_property(
    State(state): State<AppState>,
    config: Arc<PropertySetConfig>,
    Path(params): Params,
    body: PropertyValue,
) -> Result<Json<Value>, PropsError> {
    let persister = PropertyPersister::new(&config);
    let parent_id = ParentContext::from_path(params.clone()).resolve(&config)?;
    let name = params.get("name").cloned().unwrap_or_default();
    let saved = persister
        .save_one(&state.db, &parent_id, &name, body.value)
        .await?;
    Ok(Json(saved))
}
