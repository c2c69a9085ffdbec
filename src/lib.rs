//! wl-core: wire codec, transport, object table, dispatch, and registry
//! protocol shared by both sides of a Wayland connection.
//!
//! This crate stops at the core: it carries any interface's messages once
//! given that interface's static descriptor, but ships descriptors only
//! for the three well-known objects every connection has (`wl_display`,
//! `wl_registry`, `wl_callback`). Surface, shell, and input protocols are
//! expected to plug in their own descriptors and [`dispatch::RequestHandler`]/
//! [`dispatch::EventHandler`] implementations.

pub mod dispatch;
pub mod error;
pub mod interface;
pub mod object;
pub mod registry;
pub mod transport;
pub mod wire;

pub use dispatch::{Connection, EventHandler, RequestHandler};
pub use error::{Error, Result};
pub use object::{ObjectId, ObjectTable, Side};
pub use transport::{BufferedSocket, Socket};
