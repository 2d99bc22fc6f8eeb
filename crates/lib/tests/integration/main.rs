//! End-to-end reconciliation tests against the public API.

mod common;

mod execution_tests;
mod scenario_tests;
mod state_tests;
