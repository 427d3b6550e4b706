pub mod emulator;
pub mod memory;

use std::sync::Arc;

use queue_api::{QueueClient, QueueError};
use serde::Deserialize;

pub use emulator::EmulatorFactory;
pub use memory::MemoryBroker;

/// Which queue implementation the viewer talks to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum Backend {
    /// Pub/Sub REST protocol, e.g. the local emulator.
    #[default]
    Emulator,
    /// In-process broker; nothing leaves the process.
    Memory,
}

/// Builds a queue client bound to a project.
pub trait ClientFactory: Send + Sync {
    fn connect(&self, project: &str) -> Result<Arc<dyn QueueClient>, QueueError>;
}

/// Factory for the configured backend.
pub fn factory(backend: Backend, endpoint: &str) -> Box<dyn ClientFactory> {
    match backend {
        Backend::Emulator => Box::new(EmulatorFactory::new(endpoint)),
        Backend::Memory => Box::new(MemoryBroker::new()),
    }
}
