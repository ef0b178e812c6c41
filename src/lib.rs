//! Samples registry pull and star counters for configured targets and
//! derives per-hour rates between consecutive observations.

pub mod config;
pub mod db;
pub mod hub;
pub mod model;
pub mod scheduler;
