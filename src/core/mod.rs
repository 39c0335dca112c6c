//! Core domain models for campaign pipelines
//!
//! This module defines the fundamental data structures that represent
//! pipelines, steps, their configuration and their outcomes.

pub mod config;
pub mod pipeline;
pub mod step;
pub mod context;
pub mod state;

pub use pipeline::*;
pub use step::*;
pub use context::*;
pub use state::*;
