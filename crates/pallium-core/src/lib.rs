//! # pallium-core
//!
//! Shared types for the pallium turn orchestration core.
//!
//! This crate is the dependency root of the workspace and holds everything
//! that more than one layer needs to agree on:
//!
//! - [`ids`]: branded ID newtypes (turn, tool call)
//! - [`messages`]: chat messages and tool calls as providers see them
//! - [`events`]: the `turn.v1` event protocol streamed to consumers
//! - [`state`]: the per-turn state record threaded through stages
//! - [`world`]: the durable world model plus key-level diffing
//! - [`json`]: tolerant extraction of JSON from noisy model output
//! - [`errors`]: shared error kinds for tool results
//!
//! Nothing in here performs I/O.

#![deny(unsafe_code)]

pub mod errors;
pub mod events;
pub mod ids;
pub mod json;
pub mod messages;
pub mod state;
pub mod world;
