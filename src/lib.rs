pub mod config;
pub mod database;
pub mod ingest;
pub mod schema;
pub mod sources;
