pub mod aggregator;
pub mod dedup;
pub mod detector;
pub mod dispatcher;
pub mod generator;
pub mod supervisor;
pub mod testing;
pub mod types;

pub use aggregator::{aggregate, WindowedAggregator};
pub use dedup::{Admission, DedupGate};
pub use detector::ChangeDetector;
pub use dispatcher::ActionDispatcher;
pub use generator::{build_prompt, ClaudeGenerator, GenerationRequest, TextGenerator};
pub use supervisor::Supervisor;
pub use types::{CycleStats, DispatchOutcome, DispatchStats};
