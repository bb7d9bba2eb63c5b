pub mod orchestrator;

pub use orchestrator::{BatchOutcome, BatchStats, Orchestrator};
