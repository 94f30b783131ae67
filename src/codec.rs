//! Conversion between stored property rows and the `{name: value}` mapping
//! used on the wire.
use crate::config::{PropertySetConfig, NAME_COLUMN, VALUE_COLUMN};
use crate::errors::{PropsError, ValidationErrors, EXPECTED_DICTIONARY};
use crate::storage::{ParentId, PropertyRow};
use serde::Serialize;
use serde_json::ser::Formatter;
use serde_json::{Map, Value};
use std::io;

/// A validated inbound entry that does not know its parent yet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingProperty {
    pub name: String,
    pub value: String,
}

impl PendingProperty {
    pub fn attach(self, parent_id: &ParentId) -> CanonicalProperty {
        CanonicalProperty {
            parent_id: parent_id.clone(),
            name: self.name,
            value: self.value,
        }
    }
}

/// The single-row shape handed to the persister.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CanonicalProperty {
    pub parent_id: ParentId,
    pub name: String,
    pub value: String,
}

impl CanonicalProperty {
    /// `{name, value, <parent_field>: parent_id}`
    pub fn to_fields(&self, config: &PropertySetConfig) -> Map<String, Value> {
        let mut fields = Map::new();
        fields.insert(NAME_COLUMN.to_string(), Value::String(self.name.clone()));
        fields.insert(VALUE_COLUMN.to_string(), Value::String(self.value.clone()));
        let parent = match &self.parent_id {
            ParentId::Int(id) => Value::from(*id),
            ParentId::Text(id) => Value::String(id.clone()),
        };
        fields.insert(config.parent_field().to_string(), parent);
        fields
    }
}

#[derive(Debug, Clone, Copy)]
pub struct PropertyCodec<'a> {
    config: &'a PropertySetConfig,
}

impl<'a> PropertyCodec<'a> {
    pub fn new(config: &'a PropertySetConfig) -> Self {
        Self { config }
    }

    /// Rows to `{name: value}`. A later row wins over an earlier one with
    /// the same name.
    pub fn encode(&self, rows: &[PropertyRow]) -> Result<Map<String, Value>, PropsError> {
        let mut mapping = Map::new();
        for row in rows {
            mapping.insert(row.name.clone(), self.decode_value(&row.name, &row.value)?);
        }
        Ok(mapping)
    }

    /// Like [`encode`](Self::encode) for an optional relation: absent rows
    /// encode to `null`, an empty set to `{}`.
    pub fn encode_field(&self, rows: Option<&[PropertyRow]>) -> Result<Value, PropsError> {
        match rows {
            Some(rows) => Ok(Value::Object(self.encode(rows)?)),
            None => Ok(Value::Null),
        }
    }

    /// Wire value of a stored string.
    pub fn decode_value(&self, name: &str, stored: &str) -> Result<Value, PropsError> {
        if self.config.is_json(name) {
            Ok(serde_json::from_str(stored)?)
        } else {
            Ok(Value::String(stored.to_string()))
        }
    }

    /// Validate an inbound mapping and compute the stored value of every
    /// writable entry. Read-only names are dropped without error. Nothing is
    /// returned unless every entry is valid.
    pub fn prepare(&self, input: &Value) -> Result<Vec<PendingProperty>, PropsError> {
        let Some(mapping) = input.as_object() else {
            return Err(ValidationErrors::non_field(EXPECTED_DICTIONARY).into());
        };

        let mut errors = ValidationErrors::new();
        let mut pending = Vec::with_capacity(mapping.len());
        for (name, raw) in mapping {
            if self.config.is_read_only(name) {
                tracing::debug!(table = self.config.table(), %name, "Dropping read-only property");
                continue;
            }
            if name.trim().is_empty() {
                errors.add(NAME_COLUMN, "This field may not be blank.");
                continue;
            }

            match self.stored_value(name, raw) {
                Ok(value) => pending.push(PendingProperty {
                    name: name.clone(),
                    value,
                }),
                Err(message) => errors.add(name.clone(), message),
            }
        }

        errors.into_result()?;
        Ok(pending)
    }

    /// [`prepare`](Self::prepare) and attach `parent_id` to every entry.
    pub fn decode(
        &self,
        input: &Value,
        parent_id: &ParentId,
    ) -> Result<Vec<CanonicalProperty>, PropsError> {
        Ok(self
            .prepare(input)?
            .into_iter()
            .map(|pending| pending.attach(parent_id))
            .collect())
    }

    fn stored_value(&self, name: &str, raw: &Value) -> Result<String, &'static str> {
        if self.config.is_json(name) {
            return Ok(to_json_string(raw));
        }

        match raw {
            Value::String(s) => Ok(s.clone()),
            Value::Number(n) => Ok(n.to_string()),
            Value::Null => Err("This field may not be null."),
            Value::Bool(_) | Value::Array(_) | Value::Object(_) => Err("Not a valid string."),
        }
    }
}

/// Serialize with `", "` and `": "` separators, the layout already present
/// in stored JSON properties.
pub fn to_json_string(value: &Value) -> String {
    let mut buf = Vec::new();
    let mut ser = serde_json::Serializer::with_formatter(&mut buf, SpacedFormatter);
    // A `Value` written into a `Vec` can not fail and is always UTF-8
    match value.serialize(&mut ser) {
        Ok(()) => String::from_utf8(buf).unwrap_or_default(),
        Err(_) => String::new(),
    }
}

struct SpacedFormatter;

impl Formatter for SpacedFormatter {
    fn begin_array_value<W>(&mut self, writer: &mut W, first: bool) -> io::Result<()>
    where
        W: ?Sized + io::Write,
    {
        if first {
            Ok(())
        } else {
            writer.write_all(b", ")
        }
    }

    fn begin_object_key<W>(&mut self, writer: &mut W, first: bool) -> io::Result<()>
    where
        W: ?Sized + io::Write,
    {
        if first {
            Ok(())
        } else {
            writer.write_all(b", ")
        }
    }

    fn begin_object_value<W>(&mut self, writer: &mut W) -> io::Result<()>
    where
        W: ?Sized + io::Write,
    {
        writer.write_all(b": ")
    }
}
