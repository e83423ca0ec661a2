//! Transport boundary.
//!
//! The engine hands fully serialized messages to the transport and never
//! deals with socket-level framing itself.

use std::net::SocketAddr;
use std::sync::Arc;

use crate::error::Result;

/// Outbound send interface provided by the transport layer.
pub trait Transport: Send + Sync {
    fn send(&self, destination: SocketAddr, message: &[u8]) -> Result<()>;
}

impl<T: Transport + ?Sized> Transport for Arc<T> {
    fn send(&self, destination: SocketAddr, message: &[u8]) -> Result<()> {
        (**self).send(destination, message)
    }
}
