pub mod api;
pub mod backends;
pub mod cli;
pub mod config;
pub mod context;
pub mod embed;
pub mod hub;
pub mod ingest;
pub mod publish;
pub mod registry;
pub mod store;

pub use context::Context;
pub use hub::{Hub, Viewer};
pub use ingest::Ingestor;
pub use registry::Registry;
pub use store::{Snapshot, Store, TopicKey};
