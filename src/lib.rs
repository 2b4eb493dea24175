#![allow(clippy::result_large_err)]

pub mod app;
pub mod app_state;
pub mod config;
pub mod connectors;
pub mod domain;
pub mod error;
pub mod logging;
pub mod metrics;
pub mod poll;
pub mod protocol;
pub mod registry;
pub mod report;
pub mod scheduler;
pub mod sink;
pub mod telemetry;

pub mod transport;
