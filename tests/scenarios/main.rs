//! End-to-end scenarios for campaign-pipeline
//!
//! Each module drives the public API the way the CLI does: campaigns
//! through the orchestrator, deferred actions through a job store and the
//! scheduler runtime.


mod campaign_config;
mod cancellation;
mod misfire;
mod publishing;
mod restart;
mod retry_behavior;
mod timeline;
