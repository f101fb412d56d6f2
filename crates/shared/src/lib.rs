//! Pawket Shared Types and Utilities
//!
//! This crate contains types and utilities shared across the Pawket
//! payment and subscription engine.

pub mod db;
pub mod types;

pub use db::*;
pub use types::*;
