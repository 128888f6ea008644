//! Plate solving and catalog matching for an astronomical image library

pub mod common;
pub mod config;
pub mod log_setup;
pub mod matcher;
pub mod math;
pub mod orchestrator;
pub mod progress;
pub mod solve;
pub mod solver;
pub mod state;

#[cfg(test)]
mod tests;
