//! Broadcast channel abstraction used by protocol states

use crate::Result;
use async_trait::async_trait;
use std::any::Any;
use std::sync::Arc;

pub mod local;

pub use local::{LocalBroadcastChannel, LocalNetwork};

/// Decoded message payload; states downcast it to the concrete type
pub type Payload = Arc<dyn Any + Send + Sync>;

/// Decoder registered for one message type
pub type Unmarshaler = Arc<dyn Fn(&[u8]) -> Result<Payload> + Send + Sync>;

/// A message that knows its wire type tag and encoding
pub trait TaggedMarshaler: Send + Sync {
    fn message_type(&self) -> &'static str;
    fn marshal(&self) -> Result<Vec<u8>>;
}

/// Inbound message as delivered by a [`BroadcastChannel`]
#[derive(Clone)]
pub struct NetMessage {
    sender_public_key: Vec<u8>,
    message_type: String,
    payload: Payload,
}

impl NetMessage {
    pub fn new(sender_public_key: Vec<u8>, message_type: impl Into<String>, payload: Payload) -> Self {
        Self {
            sender_public_key,
            message_type: message_type.into(),
            payload,
        }
    }

    /// Network-level identity of the sender
    pub fn sender_public_key(&self) -> &[u8] {
        &self.sender_public_key
    }

    pub fn message_type(&self) -> &str {
        &self.message_type
    }

    /// The payload as `T`, if it is one
    pub fn payload<T: Any>(&self) -> Option<&T> {
        self.payload.downcast_ref::<T>()
    }

    /// Shared handle to the payload as `T`, if it is one
    pub fn payload_arc<T: Any + Send + Sync>(&self) -> Option<Arc<T>> {
        self.payload.clone().downcast::<T>().ok()
    }
}

impl std::fmt::Debug for NetMessage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NetMessage")
            .field("sender_public_key", &hex::encode(&self.sender_public_key))
            .field("message_type", &self.message_type)
            .finish_non_exhaustive()
    }
}

/// Group broadcast channel
#[async_trait]
pub trait BroadcastChannel: Send + Sync {
    /// Channel name, shared by every member of one group
    fn name(&self) -> &str;

    /// Broadcast a message to every subscriber, including the sender
    async fn send(&self, message: &dyn TaggedMarshaler) -> Result<()>;

    /// Register the decoder for `message_type`.
    ///
    /// Messages of unregistered types are dropped.
    fn set_unmarshaler(&self, message_type: &'static str, unmarshaler: Unmarshaler);

    /// Next decoded inbound message, `None` once the channel is closed
    async fn recv(&self) -> Option<NetMessage>;
}
