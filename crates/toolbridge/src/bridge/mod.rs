//! Wire layer for the bridge.
//!
//! # Architecture
//!
//! - **frame**: `Content-Length` framing for the caller-facing RPC stream
//! - **lines**: newline-delimited codecs for the worker pipes
//! - **protocol**: RPC request/response types and the worker sub-protocol

pub mod frame;
pub mod lines;
pub mod protocol;
