//! Madprops - key-value property tables exposed as mappings
//!
//! A property table stores one `(parent, name, value)` row per entry. This
//! library reads and writes such tables as plain `{name: value}` objects,
//! either on their own or embedded in the representation of the parent.

pub mod codec;
pub mod config;
pub mod entities;
pub mod errors;
pub mod owner;
pub mod persister;
pub mod settings;
pub mod storage;
pub mod web;

#[cfg(test)]
mod test_db;

pub use codec::PropertyCodec;
pub use config::PropertySetConfig;
pub use errors::{PropsError, ValidationErrors};
pub use owner::{OwnerComposer, OwnerSchema};
pub use persister::{ParentContext, PropertyPersister};
pub use storage::ParentId;
