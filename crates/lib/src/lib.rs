//! converge-lib: configuration-state reconciliation core
//!
//! This crate turns a declared desired state into provider calls:
//! - `Manifest`: the ordered resource declarations for one run
//! - `DependencyGraph`: references between declarations, checked for cycles
//! - `StateStore`: the last-applied attributes of every tracked resource
//! - `ResourceChange`: what the differ decided for each resource
//! - `Plan`: the ordered steps that move state to the declarations
//! - `Reconciler`: lock, plan and execute against one store

pub mod consts;
pub mod diff;
pub mod execute;
pub mod graph;
pub mod manifest;
pub mod plan;
pub mod platform;
pub mod reconcile;
pub mod resource;
pub mod schema;
pub mod settings;
pub mod state;
pub mod util;
