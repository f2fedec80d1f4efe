//! IPC bridge shared by the controller, its workers and operator clients.
//!
//! This module provides the wire protocol, codec and socket transport for the
//! control channel.
//!
//! # Architecture
//!
//! - **protocol**: Message types (Command, CommandKind, replies)
//! - **codec**: Newline-delimited JSON framing for AsyncRead/AsyncWrite
//! - **transport**: Unix-socket / loopback-TCP endpoints and connect retry

pub mod codec;
pub mod protocol;
pub mod transport;
