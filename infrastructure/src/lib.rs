// Module declarations
pub mod persistence;
pub mod search;

// Re-export all implementations
pub use persistence::InMemoryPrimaryStore;
pub use search::InMemoryIndexStore;
