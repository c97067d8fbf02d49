//! Block-synchronized protocol state machine
//!
//! A protocol is a chain of [`State`]s. Each state waits `delay_blocks`, runs
//! `initiate` while inbound messages keep flowing into `receive`, and ends
//! after `active_blocks`, or earlier once it has everything it needs.

mod block_counter;
mod machine;

pub use block_counter::{BlockCounter, LocalBlockCounter};
pub use machine::Machine;

use crate::group::MemberIndex;
use crate::net::NetMessage;
use crate::Result;
use async_trait::async_trait;
use parking_lot::Mutex;
use std::any::Any;
use std::sync::Arc;

/// Delay of a state that neither sends nor waits for messages
pub const SILENT_STATE_DELAY_BLOCKS: u64 = 0;

/// Active window of a state that neither sends nor waits for messages
pub const SILENT_STATE_ACTIVE_BLOCKS: u64 = 0;

/// Outcome of [`State::next`]
pub enum Transition {
    /// Continue with the given state
    Next(Box<dyn State>),
    /// The given state was the last one
    Final(Box<dyn State>),
}

/// One step of a protocol
#[async_trait]
pub trait State: Send + Sync + 'static {
    /// Short name used in logs and errors
    fn name(&self) -> &'static str;

    /// Blocks to wait before `initiate`
    fn delay_blocks(&self) -> u64;

    /// Blocks during which the state stays active after `initiate` starts
    fn active_blocks(&self) -> u64;

    /// Compute and send this state's message. Any error aborts the protocol.
    async fn initiate(&self) -> Result<()>;

    /// Accept or drop an inbound message. May run while `initiate` is in
    /// progress.
    fn receive(&self, message: NetMessage) -> Result<()>;

    /// Whether the state may end before its active window runs out
    fn can_transition(&self) -> bool {
        false
    }

    /// Build the following state
    fn next(self: Box<Self>) -> Result<Transition>;

    fn member_index(&self) -> MemberIndex;

    fn into_any(self: Box<Self>) -> Box<dyn Any + Send>;
}

/// Messages accepted so far, shared by all states of one protocol run.
///
/// Messages that arrive early, while a member is still in a previous state,
/// stay here until the state that consumes them asks for them.
#[derive(Clone, Default)]
pub struct MessageHistory {
    messages: Arc<Mutex<Vec<NetMessage>>>,
}

impl MessageHistory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&self, message: NetMessage) {
        self.messages.lock().push(message);
    }

    /// Every accepted payload of type `T`, in arrival order
    pub fn payloads<T: Any + Send + Sync>(&self) -> Vec<Arc<T>> {
        self.messages
            .lock()
            .iter()
            .filter_map(NetMessage::payload_arc::<T>)
            .collect()
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.messages.lock().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_history_filters_by_type() {
        let history = MessageHistory::new();
        history.push(NetMessage::new(vec![1], "a", Arc::new(1u32)));
        history.push(NetMessage::new(vec![2], "b", Arc::new("text")));
        history.push(NetMessage::new(vec![3], "a", Arc::new(2u32)));

        let numbers: Vec<u32> = history.payloads::<u32>().iter().map(|n| **n).collect();
        assert_eq!(numbers, vec![1, 2]);
        assert_eq!(history.len(), 3);
    }
}
