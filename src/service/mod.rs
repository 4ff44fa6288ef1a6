//! HTTP handlers for genfacts.

pub mod facts;

pub use facts::{effective_subject, handle_facts, prompt_for, FactsQuery};
