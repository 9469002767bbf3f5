//! Core types for Cadence
pub mod process;
pub mod sample;
