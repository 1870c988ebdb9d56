pub mod config;
pub mod db;
pub mod export;
pub mod ingest;
pub mod media;
pub mod model;
pub mod shutdown;
