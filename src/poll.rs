//! Long-poll bridge
//!
//! Parks HTTP poll requests per conversation until the next message lands
//! there. Each parked request receives exactly the message that woke it;
//! anything that arrives before the client polls again is picked up by the
//! `since` catch-up on that next poll.

use std::collections::HashMap;

use tokio::sync::oneshot;
use tracing::debug;

use crate::error::AppError;
use crate::store::Message;
use crate::types::ConversationId;

/// Default time a poll request is held open
pub const DEFAULT_POLL_TIMEOUT_SECS: u64 = 30;

/// Reply channel of one parked poll request
pub type PollReply = oneshot::Sender<Result<Vec<Message>, AppError>>;

/// Parked poll requests keyed by conversation
#[derive(Debug, Default)]
pub struct LongPollBridge {
    waiters: HashMap<ConversationId, Vec<PollReply>>,
}

impl LongPollBridge {
    pub fn new() -> Self {
        Self::default()
    }

    /// Park a poll request until a message arrives in the conversation
    ///
    /// Requests whose caller has already given up are dropped here.
    pub fn park(&mut self, conversation_id: ConversationId, reply: PollReply) {
        let waiters = self.waiters.entry(conversation_id).or_default();
        waiters.retain(|waiter| !waiter.is_closed());
        waiters.push(reply);
    }

    /// Resolve every parked request for the message's conversation
    ///
    /// Returns how many waiting callers received the message.
    pub fn notify(&mut self, message: &Message) -> usize {
        let Some(waiters) = self.waiters.remove(&message.conversation_id) else {
            return 0;
        };

        let delivered = waiters
            .into_iter()
            .filter_map(|waiter| waiter.send(Ok(vec![message.clone()])).ok())
            .count();

        debug!(
            "Resolved {} poll waiter(s) for {}",
            delivered, message.conversation_id
        );
        delivered
    }

    /// Number of parked requests still waiting, across all conversations
    pub fn waiting(&self) -> usize {
        self.waiters
            .values()
            .flatten()
            .filter(|waiter| !waiter.is_closed())
            .count()
    }
}
