//! Pipeline governance kernel
//!
//! Operator tooling around the governed pipeline: logging setup and a seeded
//! simulator that drives demo stages through every containment path.

#![warn(unreachable_pub)]

pub mod logging;
pub mod simulator;

pub use simulator::{
    run_simulator, DemoLibrary, DemoSearch, Scenario, SimulatorConfig, SimulatorReport,
    SimulatorStats, TaskRecord,
};
