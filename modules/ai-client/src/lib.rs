//! Text-generation client.
//!
//! One call shape: system prompt + user prompt in, text out. Callers own
//! timeouts and retries.

pub mod claude;

pub use claude::Claude;
