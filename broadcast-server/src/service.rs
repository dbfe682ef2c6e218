//! The seam between connection handling and the hub.
//!
//! The transport layer and the session pumps talk to a [`BroadcastService`],
//! which forwards to whatever [`ClientRegistry`] it was built with. In the
//! server that is a [`HubHandle`](crate::hub::HubHandle).

use std::sync::Arc;

use async_trait::async_trait;

use crate::{
    error::HubError,
    message::Message,
    session::{SessionHandle, SessionId},
};

/// Operations the connection layer needs from a session registry.
#[async_trait]
pub trait ClientRegistry: Send + Sync {
    async fn add(&self, session: Arc<SessionHandle>) -> Result<(), HubError>;

    /// Removing a session that is not registered is a no-op.
    async fn remove(&self, session: Arc<SessionHandle>) -> Result<(), HubError>;

    /// `origin` is the session the message came from, if any.
    async fn publish(&self, message: Message, origin: Option<SessionId>) -> Result<(), HubError>;

    /// Number of registered sessions. May lag in-flight requests.
    fn count(&self) -> usize;
}

#[derive(Clone)]
pub struct BroadcastService {
    registry: Arc<dyn ClientRegistry>,
}

impl BroadcastService {
    pub fn new(registry: Arc<dyn ClientRegistry>) -> Self {
        Self { registry }
    }

    pub async fn register_client(&self, session: Arc<SessionHandle>) -> Result<(), HubError> {
        self.registry.add(session).await
    }

    pub async fn unregister_client(&self, session: Arc<SessionHandle>) -> Result<(), HubError> {
        self.registry.remove(session).await
    }

    pub async fn broadcast_message(
        &self,
        message: Message,
        origin: Option<SessionId>,
    ) -> Result<(), HubError> {
        self.registry.publish(message, origin).await
    }

    pub fn client_count(&self) -> usize {
        self.registry.count()
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use std::sync::Mutex;

    use super::*;

    #[derive(Debug, Clone, PartialEq, Eq)]
    pub(crate) enum Call {
        Add(SessionId),
        Remove(SessionId),
        Publish {
            sender: String,
            content: String,
            origin: Option<SessionId>,
        },
    }

    /// Registry that only records what it was asked to do.
    #[derive(Default)]
    pub(crate) struct RecordingRegistry {
        calls: Mutex<Vec<Call>>,
    }

    impl RecordingRegistry {
        pub(crate) fn calls(&self) -> Vec<Call> {
            self.calls.lock().unwrap().clone()
        }

        fn record(&self, call: Call) {
            self.calls.lock().unwrap().push(call);
        }
    }

    #[async_trait]
    impl ClientRegistry for RecordingRegistry {
        async fn add(&self, session: Arc<SessionHandle>) -> Result<(), HubError> {
            self.record(Call::Add(session.id().clone()));
            Ok(())
        }

        async fn remove(&self, session: Arc<SessionHandle>) -> Result<(), HubError> {
            self.record(Call::Remove(session.id().clone()));
            Ok(())
        }

        async fn publish(
            &self,
            message: Message,
            origin: Option<SessionId>,
        ) -> Result<(), HubError> {
            self.record(Call::Publish {
                sender: message.sender().to_string(),
                content: message.content().to_string(),
                origin,
            });
            Ok(())
        }

        fn count(&self) -> usize {
            let calls = self.calls.lock().unwrap();
            let added = calls.iter().filter(|c| matches!(c, Call::Add(_))).count();
            let removed = calls.iter().filter(|c| matches!(c, Call::Remove(_))).count();
            added.saturating_sub(removed)
        }
    }
}
