//! Synchronized storage primitives for the transport layer.
mod ring;

pub use self::ring::{Disconnected, Ring};
