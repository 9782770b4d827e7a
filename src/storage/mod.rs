//! Storage engine for Meridian
//!
//! Handles SQLite database operations, WAL mode, schema management and the
//! `ChunkStore` facade that keeps records and the link graph in step.

mod connection;
mod migrations;
pub mod queries;
mod store;

pub use connection::Storage;
pub use migrations::SCHEMA_VERSION;
pub use store::ChunkStore;
