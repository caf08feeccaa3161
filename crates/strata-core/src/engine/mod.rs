//! The decomposition engine.
//!
//! This module provides:
//! - **value_set** / **variable**: domain snapshots and the variables minted over them
//! - **component**: per-element components and their expansion state
//! - **problem** / **collection**: problems and the arena that owns every component
//! - **range** / **factory**: range and factor services
//! - **strategy**: the refinement driver

pub mod collection;
pub mod component;
pub mod errors;
pub mod factor;
pub mod factory;
pub mod problem;
pub mod range;
pub mod strategy;
pub mod value_set;
pub mod variable;
