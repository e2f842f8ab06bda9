// SPDX-License-Identifier: MIT OR Apache-2.0
//! The pipeline executor (C7) and the governance provider interface (C8).
//!
//! This crate wires together the handler registry, capability token store,
//! and durable receipt store into the five-stage state machine described in
//! the external interface contract, and defines the trait an external
//! CIF/CDI policy layer must implement to gate each stage.

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod error;
mod executor;
mod governance;
mod telemetry;

pub use error::PipelineError;
pub use executor::{PipelineConfig, PipelineExecutor, PipelineRequest, PipelineResponse, StopOutcome};
pub use governance::{
    ActionOutcome, CapsuleStatusReport, EgressOutcome, GovernanceProvider, IngressOutcome, NoOpGovernanceProvider,
    OutputOutcome,
};
pub use telemetry::{MetricsSnapshot, PipelineMetrics};
