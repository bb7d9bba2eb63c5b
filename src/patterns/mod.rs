pub mod normalizer;
pub mod store;

pub use normalizer::{compute_hash, normalize, PatternHash};
pub use store::{
    InMemoryBackend, MemoryBackend, MemoryStats, PatternMemoryEntry, PatternStore, Source,
};
