//! On-disk store behind the appevent cache.
//!
//! [`CacheStore`] knows where the SQLite file lives under a storage
//! directory, how to open it as an `r2d2` pool with WAL enabled and the schema
//! brought up to date, and how to delete it when it is found damaged. Schema
//! steps are embedded SQL files tracked through SQLite's `user_version`.

mod error;
mod migrations;
mod pool;
mod store;

pub use error::{is_corruption, DbError};
pub use migrations::{run_migrations, schema_version, SCHEMA_VERSION};
pub use pool::{DbConnection, DbPool, DbRuntimeSettings};
pub use store::{CacheStore, DB_DIR_NAME, DB_FILE_NAME};
