pub mod pipeline;
pub mod router;
pub mod source;
pub mod stats;
pub mod writer;

pub use pipeline::run_ingest;
pub use router::{EventRouter, Malformed, MalformedReason};
pub use source::{ChannelSource, LineSource, MessageSource};
pub use stats::{FlushTrigger, IngestStats};
pub use writer::{FlushReport, MicroBatchWriter};
