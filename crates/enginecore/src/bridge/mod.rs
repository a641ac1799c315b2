//! IPC bridge for client-worker communication.
//!
//! This module provides the wire protocol, codecs and socket transport used
//! between an engine core client (parent) and its worker (process or thread).
//!
//! # Architecture
//!
//! - **protocol**: Message types (EngineCoreInput, OutputBatch, UtilityCall/Output)
//! - **codec**: Length-delimited framing for async and blocking streams
//! - **transport**: Per-client endpoint pair, bind/accept/connect

pub mod codec;
pub mod protocol;
pub mod transport;
