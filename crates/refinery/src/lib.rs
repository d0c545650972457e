//! Refinery - merge queue processor for agent-produced branches
//!
//! The binary is a thin layer over `refinery-core`: `cli` parses arguments,
//! `commands` does the work and prints the result.

#![cfg_attr(not(test), deny(clippy::unwrap_used))]
#![cfg_attr(not(test), deny(clippy::expect_used))]
#![cfg_attr(not(test), deny(clippy::panic))]
#![warn(clippy::pedantic)]
#![forbid(unsafe_code)]

pub mod cli;
pub mod commands;
