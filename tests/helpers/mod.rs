pub mod db;

pub use db::{seed_user, users_schema, TestDb};
