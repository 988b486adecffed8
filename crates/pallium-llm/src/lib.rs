//! # pallium-llm
//!
//! Streaming chat abstraction for the turn orchestration core.
//!
//! Every model backend implements [`provider::ChatProvider`], exposing one
//! operation: a chat request in, an ordered stream of
//! [`provider::StreamItem`]s out (text deltas, thinking deltas, tool calls,
//! a finish marker). The tool loop in `pallium-runtime` is the only consumer.
//!
//! [`ndjson::NdjsonProvider`] is the concrete transport for a local
//! NDJSON-over-HTTP model server. [`testing::MockProvider`] is a scripted
//! provider for tests.

#![deny(unsafe_code)]

pub mod ndjson;
pub mod provider;
pub mod retry;
pub mod testing;
