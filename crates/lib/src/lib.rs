//! Cadence core library: webhook normalization, per-sender debouncing, turn orchestration
//! against the assistant engine, and the messaging gateway client.

pub mod buffer;
pub mod channels;
pub mod config;
pub mod gateway;
pub mod ingest;
pub mod init;
pub mod llm;
pub mod orchestrator;
pub mod store;

#[cfg(test)]
mod test_support;
