//! Worker event protocol — typed records and the stream parser.

pub mod model;
pub mod parser;

pub use model::{ItemKind, ItemPayload, WorkerEvent, WorkerEventKind};
pub use parser::EventStreamParser;
