//! # camstream-server
//!
//! Hosts the camstream engine behind a WebSocket push transport.
//!
//! Clients send JSON control messages as text frames. The server
//! answers with JSON events as text frames and streams encoded video
//! as binary frames: a single-frame message for small frames, or an
//! envelope followed by chunks for large ones.

pub mod config;
pub mod service;
