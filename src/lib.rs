//! Deposit Rate Assistant
//!
//! A conversational agent that quotes deposit rates to corporate clients:
//! - Extracts deposit amount and duration from free-form chat
//! - Answers balance questions through tools
//! - Suspends for a human confirmation before any rate is shown
//! - Resolves the rate interval from a range-keyed table
//! - Persists every session so it survives suspension and restarts
//!
//! FLOW:
//! MESSAGE → EXTRACT → (CHAT ↔ TOOLS | CONFIRM → suspend) → RESUME → RESOLVE RATE → FINALIZE

pub mod api;
pub mod config;
pub mod error;
pub mod llm;
pub mod models;
pub mod rates;
pub mod state;
pub mod tools;
pub mod workflow;

pub use error::Result;

// Re-export common types
pub use models::*;
pub use workflow::{Orchestrator, Stage, TurnOutcome};
