//! Integration tests for the relational write path

#[path = "integration/helpers.rs"]
mod helpers;

#[path = "integration/coordinator_pipeline.rs"]
mod coordinator_pipeline;

#[path = "integration/metric_extraction.rs"]
mod metric_extraction;

#[path = "integration/failure_scenarios.rs"]
mod failure_scenarios;
