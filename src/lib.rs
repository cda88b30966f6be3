//! patchlab library crate
//!
//! Validates ranked candidate patches for benchmark bugs: applies them to a
//! checked-out project, runs the tests, and searches per-hunk assignments for
//! multi-hunk bugs. The binary is a thin CLI over these modules.

pub mod apply;
pub mod checkpoint;
pub mod config;
pub mod dataset;
pub mod dispatch;
pub mod engine;
pub mod lab;
pub mod model;
pub mod reflow;
pub mod report;
pub mod runner;
pub mod util;
