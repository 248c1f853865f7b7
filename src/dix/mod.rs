//! Device-independent core: ids, clients, drawables and extensions

pub mod arena;
pub mod client;
pub mod error;
pub mod extension;
pub mod resource;
pub mod window;

pub use arena::{Arena, Handle};
pub use client::ClientId;
pub use error::{DixError, DixResult, ErrorCode};
pub use extension::Response;
pub use resource::{Access, ResourceType};
