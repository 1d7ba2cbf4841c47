pub mod connect;
pub mod memory;
pub mod pg;
pub mod traits;

pub use connect::{connect_with_retry, retry_delay};
pub use memory::{CommittedBatch, MemoryStore};
pub use pg::PgStore;
pub use traits::{
    ActionStore, AggregateStore, ContextSource, CycleLock, CycleStore, RawEventSink, WindowReader,
};

/// Schema migrations, embedded at compile time.
pub static MIGRATOR: sqlx::migrate::Migrator = sqlx::migrate!("../../migrations");
