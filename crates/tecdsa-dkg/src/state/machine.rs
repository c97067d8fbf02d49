//! Runner driving a chain of states over a broadcast channel

use super::{BlockCounter, State, Transition};
use crate::net::BroadcastChannel;
use crate::{Error, Result};
use std::sync::Arc;
use tracing::{debug, error, warn};

/// Executes states one after another, starting from an initial state
pub struct Machine {
    channel: Arc<dyn BroadcastChannel>,
    block_counter: Arc<dyn BlockCounter>,
    initial_state: Box<dyn State>,
}

impl Machine {
    pub fn new(
        channel: Arc<dyn BroadcastChannel>,
        block_counter: Arc<dyn BlockCounter>,
        initial_state: Box<dyn State>,
    ) -> Self {
        Self {
            channel,
            block_counter,
            initial_state,
        }
    }

    /// Run until a state reports itself final.
    ///
    /// Returns that state together with the block height at which it ended.
    pub async fn execute(self, start_block_height: u64) -> Result<(Box<dyn State>, u64)> {
        let Machine {
            channel,
            block_counter,
            initial_state,
        } = self;

        let mut state = initial_state;
        let mut block_height = start_block_height;

        loop {
            let initiate_at = block_height + state.delay_blocks();
            let end_at = initiate_at + state.active_blocks();

            debug!(
                member = state.member_index(),
                state = state.name(),
                initiate_at,
                end_at,
                "Entering state"
            );

            route_until(&*state, &*channel, &*block_counter, initiate_at).await?;
            let ended_early = run_active(&*state, &*channel, &*block_counter, end_at).await?;

            block_height = if ended_early {
                block_counter.current_block().await?.max(initiate_at)
            } else {
                end_at
            };

            match state.next()? {
                Transition::Next(next) => state = next,
                Transition::Final(last) => return Ok((last, block_height)),
            }
        }
    }
}

/// Route inbound messages to `state` until the chain reaches `height`
async fn route_until(
    state: &dyn State,
    channel: &dyn BroadcastChannel,
    block_counter: &dyn BlockCounter,
    height: u64,
) -> Result<()> {
    let wait = block_counter.wait_for_block_height(height);
    tokio::pin!(wait);

    loop {
        tokio::select! {
            biased;
            result = &mut wait => return result,
            message = channel.recv() => deliver(state, message)?,
        }
    }
}

/// Run `initiate` and route messages until the active window closes or the
/// state is done early. Returns `true` on an early end.
async fn run_active(
    state: &dyn State,
    channel: &dyn BroadcastChannel,
    block_counter: &dyn BlockCounter,
    end_at: u64,
) -> Result<bool> {
    let initiate = state.initiate();
    tokio::pin!(initiate);
    let window = block_counter.wait_for_block_height(end_at);
    tokio::pin!(window);
    let mut initiated = false;

    loop {
        tokio::select! {
            biased;
            result = &mut initiate, if !initiated => {
                if let Err(err) = result {
                    error!(member = state.member_index(), state = state.name(), %err, "Failed to initiate state");
                    return Err(err);
                }
                initiated = true;
                if state.can_transition() {
                    return Ok(true);
                }
            }
            result = &mut window => {
                result?;
                if !initiated {
                    (&mut initiate).await?;
                }
                return Ok(false);
            }
            message = channel.recv() => {
                deliver(state, message)?;
                if initiated && state.can_transition() {
                    return Ok(true);
                }
            }
        }
    }
}

fn deliver(state: &dyn State, message: Option<crate::net::NetMessage>) -> Result<()> {
    let message = message.ok_or_else(|| Error::Channel("broadcast channel closed".into()))?;
    if let Err(err) = state.receive(message) {
        warn!(member = state.member_index(), state = state.name(), %err, "Failed to receive message");
    }
    Ok(())
}
