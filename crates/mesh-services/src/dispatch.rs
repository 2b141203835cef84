//! Routes decoded messages to the handler registered for their type id.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;

use mesh_core::{Message, MessageId};

use crate::session::Session;

/// Application logic for one message type.
#[async_trait]
pub trait MessageHandler: Send + Sync {
    async fn handle(&self, session: &Arc<Session>, message: Message) -> anyhow::Result<()>;
}

/// Maps type ids to handlers. Built before a session starts and shared
/// read-only afterwards.
#[derive(Default, Clone)]
pub struct HandlerTable {
    handlers: HashMap<MessageId, Arc<dyn MessageHandler>>,
}

impl HandlerTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// At most one handler per id.
    pub fn register(
        &mut self,
        id: MessageId,
        handler: Arc<dyn MessageHandler>,
    ) -> Result<(), DispatchError> {
        if self.handlers.contains_key(&id) {
            return Err(DispatchError::DuplicateHandler(id));
        }
        self.handlers.insert(id, handler);
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }

    /// Hand `message` to its handler. Returns false if none is registered.
    /// Handler errors are logged and do not end the session.
    pub async fn dispatch(&self, session: &Arc<Session>, message: Message) -> bool {
        let id = message.id();
        let Some(handler) = self.handlers.get(&id) else {
            tracing::debug!(message_id = ?id, "no handler registered, ignoring");
            return false;
        };
        if let Err(e) = handler.handle(session, message).await {
            tracing::warn!(
                message_id = ?id,
                account = %session.account(),
                error = %e,
                "message handling failed"
            );
        }
        true
    }
}

#[derive(Debug, thiserror::Error)]
pub enum DispatchError {
    #[error("handler already registered for {0:?}")]
    DuplicateHandler(MessageId),
}
