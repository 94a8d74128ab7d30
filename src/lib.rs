//! charforge: job orchestration and credit-safe generation pipelines for an
//! AI character platform.
//!
//! The API server enqueues work and exposes job status; the worker consumes
//! the queues, runs the curation, batch and multi-stage generation pipelines,
//! and fires recurring schedules.

pub mod app_state;
pub mod config;
pub mod db;
pub mod models;
pub mod routes;
pub mod services;
