pub mod memory;

pub use memory::{
    DEFAULT_INDEX, Faults, MemoryConnection, MemoryConnector, MemoryStore, MemoryStoreStats,
};
