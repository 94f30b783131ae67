use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use miette::Diagnostic;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::collections::BTreeMap;
use std::fmt;
use thiserror::Error;

/// Key used for errors that do not belong to a single field.
pub const NON_FIELD_ERRORS: &str = "non_field_errors";

/// Message reported when a property set is not a key-value mapping.
pub const EXPECTED_DICTIONARY: &str = "Expected a dictionary.";

#[derive(Debug, Error, Diagnostic)]
pub enum PropsError {
    #[error("Configuration error: {0}")]
    #[diagnostic(
        code(madprops::config),
        help("Configure the parent field explicitly when the property table has no single foreign key")
    )]
    Configuration(String),

    #[error("Validation error: {0}")]
    #[diagnostic(code(madprops::validation))]
    Validation(ValidationErrors),

    #[error("Database error: {0}")]
    #[diagnostic(code(madprops::db))]
    Db(#[from] sea_orm::DbErr),

    #[error("Serialization error: {0}")]
    #[diagnostic(code(madprops::serde))]
    Serde(#[from] serde_json::Error),

    #[error("Settings error: {0}")]
    #[diagnostic(code(madprops::settings))]
    Settings(#[from] config::ConfigError),

    #[error("{0} not found")]
    #[diagnostic(code(madprops::not_found))]
    NotFound(String),
}

impl From<ValidationErrors> for PropsError {
    fn from(value: ValidationErrors) -> Self {
        PropsError::Validation(value)
    }
}

impl IntoResponse for PropsError {
    fn into_response(self) -> Response {
        match self {
            PropsError::Validation(errors) => {
                (StatusCode::BAD_REQUEST, Json(errors)).into_response()
            }
            PropsError::NotFound(_) => (
                StatusCode::NOT_FOUND,
                Json(json!({ "error": self.to_string() })),
            )
                .into_response(),
            _ => {
                tracing::error!(error = %self, "Request failed");
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    Json(json!({ "error": self.to_string() })),
                )
                    .into_response()
            }
        }
    }
}

/// Structured validation payload, `{field: [message, ...]}`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ValidationErrors(BTreeMap<String, Vec<String>>);

impl ValidationErrors {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn non_field(message: impl Into<String>) -> Self {
        let mut errors = Self::new();
        errors.add(NON_FIELD_ERRORS, message);
        errors
    }

    pub fn add(&mut self, field: impl Into<String>, message: impl Into<String>) {
        self.0.entry(field.into()).or_default().push(message.into());
    }

    /// Re-key every message under `field`, used when a property set is
    /// embedded in an owner.
    pub fn nest_under(self, field: &str) -> Self {
        let mut nested = Self::new();
        for (key, messages) in self.0 {
            for message in messages {
                if key == NON_FIELD_ERRORS {
                    nested.add(field, message);
                } else {
                    nested.add(field, format!("{key}: {message}"));
                }
            }
        }
        nested
    }

    pub fn merge(&mut self, other: ValidationErrors) {
        for (key, messages) in other.0 {
            self.0.entry(key).or_default().extend(messages);
        }
    }

    pub fn get(&self, field: &str) -> Option<&[String]> {
        self.0.get(field).map(Vec::as_slice)
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// `Ok(())` when nothing was collected.
    pub fn into_result(self) -> Result<(), PropsError> {
        if self.is_empty() {
            Ok(())
        } else {
            Err(PropsError::Validation(self))
        }
    }
}

impl fmt::Display for ValidationErrors {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut first = true;
        for (field, messages) in &self.0 {
            if !first {
                f.write_str("; ")?;
            }
            first = false;
            write!(f, "{}: {}", field, messages.join(" "))?;
        }
        Ok(())
    }
}
