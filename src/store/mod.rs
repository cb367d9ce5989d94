//! Durable task registry — model, trait, migrations, and the libSQL backend.

pub mod libsql_backend;
pub mod migrations;
pub mod model;
pub mod traits;

pub use libsql_backend::LibSqlTaskStore;
pub use model::{Task, TaskFilter, TaskOrigin, TaskPatch, TaskStatus};
pub use traits::TaskStore;
