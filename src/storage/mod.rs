// Storage backends for the ledger, project table and checkpoints
pub mod memory;
pub mod postgres;

pub use memory::MemoryStore;
pub use postgres::PgStore;
