use std::sync::Arc;

use tracing::{event, Level};

use crate::{
    events::{Event, MessageBroker},
    repositories::{LoginAttemptRepository, TokenBlacklistRepository, UserRepository},
};

#[derive(Clone)]
pub struct RepositoryContext {
    pub user_repository: Arc<dyn UserRepository>,
    pub login_attempt_repository: Arc<dyn LoginAttemptRepository>,
    pub token_blacklist_repository: Arc<dyn TokenBlacklistRepository>,
    message_broker: Arc<dyn MessageBroker>,
}

impl RepositoryContext {
    pub fn new(
        user_repository: Arc<dyn UserRepository>,
        login_attempt_repository: Arc<dyn LoginAttemptRepository>,
        token_blacklist_repository: Arc<dyn TokenBlacklistRepository>,
        message_broker: Arc<dyn MessageBroker>,
    ) -> RepositoryContext {
        RepositoryContext {
            user_repository,
            login_attempt_repository,
            token_blacklist_repository,
            message_broker,
        }
    }

    pub fn begin(&self) -> UnitOfWork {
        UnitOfWork {
            message_broker: self.message_broker.clone(),
            pending_events: Vec::new(),
        }
    }
}

/// Events staged by a single command. Nothing reaches the broker until
/// `commit`, and `rollback` drops whatever was staged.
pub struct UnitOfWork {
    message_broker: Arc<dyn MessageBroker>,
    pending_events: Vec<Event>,
}

impl UnitOfWork {
    pub fn add_event(&mut self, event: Event) {
        self.pending_events.push(event);
    }

    #[cfg(test)]
    pub fn pending(&self) -> &[Event] {
        &self.pending_events
    }

    /// Publishes staged events in order and returns how many were delivered.
    /// Stored documents are already durable at this point, so a broker
    /// failure is logged rather than surfaced to the caller.
    pub async fn commit(self) -> usize {
        event!(Level::DEBUG, "Committing {} event(s)", self.pending_events.len());
        let mut delivered = 0;

        for pending in &self.pending_events {
            match self.message_broker.publish_message(pending, pending.destination()).await {
                Ok(()) => delivered += 1,
                Err(e) => event!(Level::WARN, "Failed to publish event to {}: {}", pending.destination(), e),
            }
        }

        delivered
    }

    pub fn rollback(self) {
        event!(Level::DEBUG, "Rolling back {} staged event(s)", self.pending_events.len());
    }
}
