//! In-process broadcast network for tests and single-process groups

use super::{BroadcastChannel, NetMessage, TaggedMarshaler, Unmarshaler};
use crate::Result;
use async_trait::async_trait;
use dashmap::DashMap;
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, warn};

#[derive(Clone)]
struct RawMessage {
    sender_public_key: Vec<u8>,
    message_type: String,
    bytes: Vec<u8>,
}

/// Fan-out hub connecting [`LocalBroadcastChannel`]s by name
#[derive(Clone, Default)]
pub struct LocalNetwork {
    subscribers: Arc<DashMap<String, Vec<mpsc::UnboundedSender<RawMessage>>>>,
}

impl LocalNetwork {
    pub fn new() -> Self {
        Self::default()
    }

    /// Join channel `name` with the network identity `public_key`
    pub fn channel(&self, name: &str, public_key: Vec<u8>) -> LocalBroadcastChannel {
        let (sender, inbox) = mpsc::unbounded_channel();
        self.subscribers
            .entry(name.to_string())
            .or_default()
            .push(sender);

        LocalBroadcastChannel {
            name: name.to_string(),
            public_key,
            subscribers: self.subscribers.clone(),
            unmarshalers: DashMap::new(),
            inbox: Mutex::new(inbox),
        }
    }
}

/// One member's handle on a named local channel
pub struct LocalBroadcastChannel {
    name: String,
    public_key: Vec<u8>,
    subscribers: Arc<DashMap<String, Vec<mpsc::UnboundedSender<RawMessage>>>>,
    unmarshalers: DashMap<String, Unmarshaler>,
    inbox: Mutex<mpsc::UnboundedReceiver<RawMessage>>,
}

impl LocalBroadcastChannel {
    /// Network identity attached to every message sent through this handle
    pub fn public_key(&self) -> &[u8] {
        &self.public_key
    }
}

#[async_trait]
impl BroadcastChannel for LocalBroadcastChannel {
    fn name(&self) -> &str {
        &self.name
    }

    async fn send(&self, message: &dyn TaggedMarshaler) -> Result<()> {
        let raw = RawMessage {
            sender_public_key: self.public_key.clone(),
            message_type: message.message_type().to_string(),
            bytes: message.marshal()?,
        };

        if let Some(mut subscribers) = self.subscribers.get_mut(&self.name) {
            subscribers.retain(|subscriber| subscriber.send(raw.clone()).is_ok());
        }

        Ok(())
    }

    fn set_unmarshaler(&self, message_type: &'static str, unmarshaler: Unmarshaler) {
        self.unmarshalers
            .insert(message_type.to_string(), unmarshaler);
    }

    async fn recv(&self) -> Option<NetMessage> {
        let mut inbox = self.inbox.lock().await;
        loop {
            let raw = inbox.recv().await?;

            let Some(unmarshaler) = self
                .unmarshalers
                .get(&raw.message_type)
                .map(|entry| entry.value().clone())
            else {
                debug!(
                    channel = %self.name,
                    message_type = %raw.message_type,
                    "Dropping message of unregistered type"
                );
                continue;
            };

            match unmarshaler(&raw.bytes) {
                Ok(payload) => {
                    return Some(NetMessage::new(
                        raw.sender_public_key,
                        raw.message_type,
                        payload,
                    ))
                }
                Err(err) => warn!(
                    channel = %self.name,
                    message_type = %raw.message_type,
                    %err,
                    "Dropping undecodable message"
                ),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::net::Payload;
    use crate::Error;
    use std::time::Duration;

    #[derive(Debug, PartialEq)]
    struct Ping(u8);

    impl TaggedMarshaler for Ping {
        fn message_type(&self) -> &'static str {
            "test/ping"
        }

        fn marshal(&self) -> Result<Vec<u8>> {
            Ok(vec![self.0])
        }
    }

    fn ping_unmarshaler() -> Unmarshaler {
        Arc::new(|bytes: &[u8]| match bytes {
            [value] => Ok(Arc::new(Ping(*value)) as Payload),
            _ => Err(Error::Deserialization("bad ping".into())),
        })
    }

    #[tokio::test]
    async fn test_broadcast_reaches_every_member() {
        let network = LocalNetwork::new();
        let alice = network.channel("group", vec![1]);
        let bob = network.channel("group", vec![2]);
        let other = network.channel("other", vec![3]);
        for channel in [&alice, &bob, &other] {
            channel.set_unmarshaler("test/ping", ping_unmarshaler());
        }

        alice.send(&Ping(7)).await.unwrap();

        for channel in [&alice, &bob] {
            let message = channel.recv().await.unwrap();
            assert_eq!(message.sender_public_key(), &[1]);
            assert_eq!(message.message_type(), "test/ping");
            assert_eq!(message.payload::<Ping>(), Some(&Ping(7)));
        }

        let nothing = tokio::time::timeout(Duration::from_millis(50), other.recv()).await;
        assert!(nothing.is_err());
    }

    #[tokio::test]
    async fn test_unregistered_and_undecodable_messages_are_dropped() {
        let network = LocalNetwork::new();
        let alice = network.channel("group", vec![1]);
        let bob = network.channel("group", vec![2]);
        bob.set_unmarshaler("test/ping", ping_unmarshaler());

        struct Garbage;
        impl TaggedMarshaler for Garbage {
            fn message_type(&self) -> &'static str {
                "test/ping"
            }
            fn marshal(&self) -> Result<Vec<u8>> {
                Ok(vec![1, 2, 3])
            }
        }
        struct Unknown;
        impl TaggedMarshaler for Unknown {
            fn message_type(&self) -> &'static str {
                "test/unknown"
            }
            fn marshal(&self) -> Result<Vec<u8>> {
                Ok(vec![])
            }
        }

        alice.send(&Garbage).await.unwrap();
        alice.send(&Unknown).await.unwrap();
        alice.send(&Ping(9)).await.unwrap();

        let message = bob.recv().await.unwrap();
        assert_eq!(message.payload::<Ping>(), Some(&Ping(9)));
    }
}
