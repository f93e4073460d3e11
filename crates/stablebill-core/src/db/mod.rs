//! Database schema management

pub mod migrate;

pub use migrate::Migrator;
