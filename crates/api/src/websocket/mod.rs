//! WebSocket transport for the coordination core
//!
//! Each socket becomes one registered connection. Inbound text frames are
//! decoded into client commands and dispatched; everything the core emits
//! for the connection is serialised back as JSON text frames by a
//! dedicated send task.

pub mod handler;

pub use handler::ws_handler;
