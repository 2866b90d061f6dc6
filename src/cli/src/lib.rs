//! Stratum CLI - layered image builder.

pub mod commands;
pub mod output;
