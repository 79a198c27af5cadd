//! Object store abstraction.
//!
//! - `ObjectStore`: the engine's only window onto persisted state
//! - `MemoryStore`: in-process implementation for tests and local runs

pub mod memory;
pub mod traits;

pub use memory::MemoryStore;
pub use traits::ObjectStore;
