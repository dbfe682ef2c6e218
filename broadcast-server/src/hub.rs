//! The hub: the single owner of the session registry.
//!
//! [`Hub::run`] is an event loop that handles one [`HubCommand`] at a time in
//! the order they reach its inbox. Producers only ever hold a [`HubHandle`]
//! and enqueue commands, so registration, removal and fan-out never interleave
//! and the registry needs no lock.

use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    },
};

use async_trait::async_trait;
use tokio::{
    select,
    sync::{mpsc, oneshot},
    task::JoinHandle,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::{
    config::{EchoPolicy, HubConfig},
    error::{HubError, SendError},
    message::Message,
    service::ClientRegistry,
    session::{SessionHandle, SessionId},
};

#[derive(Debug)]
pub enum HubCommand {
    Register {
        session: Arc<SessionHandle>,
    },
    Unregister {
        session: Arc<SessionHandle>,
    },
    Broadcast {
        message: Message,
        origin: Option<SessionId>,
    },
    /// Reports the registry size once every earlier command has been handled.
    Count {
        respond_to: oneshot::Sender<usize>,
    },
}

pub struct Hub {
    sessions: HashMap<SessionId, Arc<SessionHandle>>,
    inbox: mpsc::Receiver<HubCommand>,
    echo: EchoPolicy,
    published_count: Arc<AtomicUsize>,
    shutdown: CancellationToken,
}

impl Hub {
    pub fn new(config: &HubConfig) -> (Self, HubHandle) {
        let (commands, inbox) = mpsc::channel(config.inbox_capacity);
        let published_count = Arc::new(AtomicUsize::new(0));
        let shutdown = CancellationToken::new();

        let hub = Self {
            sessions: HashMap::new(),
            inbox,
            echo: config.echo,
            published_count: Arc::clone(&published_count),
            shutdown: shutdown.clone(),
        };
        let handle = HubHandle {
            commands,
            published_count,
            shutdown,
        };
        (hub, handle)
    }

    /// Creates a hub and runs it on its own task.
    pub fn spawn(config: &HubConfig) -> (HubHandle, JoinHandle<()>) {
        let (hub, handle) = Self::new(config);
        (handle, tokio::spawn(hub.run()))
    }

    /// Processes commands until [`HubHandle::shutdown`] is called or every
    /// handle is dropped, then closes all remaining sessions.
    pub async fn run(mut self) {
        loop {
            let command = select! {
                biased;
                () = self.shutdown.cancelled() => break,
                command = self.inbox.recv() => match command {
                    Some(command) => command,
                    None => break,
                },
            };
            self.handle(command);
        }

        info!(sessions = self.sessions.len(), "hub stopping");
        for session in self.sessions.values() {
            session.close();
        }
        self.sessions.clear();
        self.publish_count();
        self.drain_inbox();
    }

    /// Closes sessions whose requests were still queued when the hub stopped.
    /// Pending count requests are dropped, so their callers see `Stopped`.
    fn drain_inbox(&mut self) {
        self.inbox.close();
        while let Ok(command) = self.inbox.try_recv() {
            match command {
                HubCommand::Register { session } | HubCommand::Unregister { session } => {
                    session.close();
                }
                HubCommand::Broadcast { .. } | HubCommand::Count { .. } => {}
            }
        }
    }

    fn handle(&mut self, command: HubCommand) {
        match command {
            HubCommand::Register { session } => self.register(session),
            HubCommand::Unregister { session } => self.unregister(&session),
            HubCommand::Broadcast { message, origin } => self.broadcast(&message, origin.as_ref()),
            HubCommand::Count { respond_to } => {
                // The requester may have given up waiting.
                let _ = respond_to.send(self.sessions.len());
            }
        }
    }

    fn register(&mut self, session: Arc<SessionHandle>) {
        if session.is_closed() {
            debug!(session_id = %session.id(), "ignoring registration of closed session");
            return;
        }
        if self.sessions.contains_key(session.id()) {
            warn!(session_id = %session.id(), "session registered twice");
            return;
        }

        let identity = session.identity().to_string();
        self.sessions.insert(session.id().clone(), session);
        self.publish_count();
        info!(%identity, clients = self.sessions.len(), "client connected");
    }

    fn unregister(&mut self, session: &SessionHandle) {
        if self.sessions.remove(session.id()).is_some() {
            self.publish_count();
            info!(
                identity = session.identity(),
                clients = self.sessions.len(),
                "client disconnected"
            );
        }
    }

    fn broadcast(&mut self, message: &Message, origin: Option<&SessionId>) {
        let frame: Arc<str> = match message.encode() {
            Ok(encoded) => Arc::from(encoded),
            Err(err) => {
                warn!(sender = message.sender(), error = %err, "failed to encode message");
                return;
            }
        };

        let mut dropped = Vec::new();
        let mut recipients = 0usize;
        for (id, session) in &self.sessions {
            if self.echo == EchoPolicy::ExcludeSender && origin == Some(id) {
                continue;
            }
            match session.deliver(Arc::clone(&frame)) {
                Ok(()) => recipients += 1,
                Err(SendError::Closed) => {
                    debug!(session_id = %id, "skipping session that is already closing");
                    dropped.push(id.clone());
                }
                Err(err) => {
                    warn!(
                        session_id = %id,
                        identity = session.identity(),
                        error = %err,
                        "dropping client that cannot keep up"
                    );
                    dropped.push(id.clone());
                }
            }
        }

        // The session's own pumps will still send an unregister; it becomes a no-op.
        for id in &dropped {
            self.sessions.remove(id);
        }
        if !dropped.is_empty() {
            self.publish_count();
        }

        debug!(
            sender = message.sender(),
            recipients,
            dropped = dropped.len(),
            "broadcast message"
        );
    }

    fn publish_count(&self) {
        self.published_count
            .store(self.sessions.len(), Ordering::Release);
    }
}

/// Cloneable front door to a running [`Hub`].
#[derive(Debug, Clone)]
pub struct HubHandle {
    commands: mpsc::Sender<HubCommand>,
    published_count: Arc<AtomicUsize>,
    shutdown: CancellationToken,
}

impl HubHandle {
    pub async fn register(&self, session: Arc<SessionHandle>) -> Result<(), HubError> {
        self.submit(HubCommand::Register { session }).await
    }

    pub async fn unregister(&self, session: Arc<SessionHandle>) -> Result<(), HubError> {
        self.submit(HubCommand::Unregister { session }).await
    }

    pub async fn broadcast(
        &self,
        message: Message,
        origin: Option<SessionId>,
    ) -> Result<(), HubError> {
        self.submit(HubCommand::Broadcast { message, origin }).await
    }

    /// Registry size as of the last command the hub finished.
    ///
    /// Does not wait for the hub, so it can trail requests still queued in
    /// the inbox.
    pub fn count(&self) -> usize {
        self.published_count.load(Ordering::Acquire)
    }

    /// Registry size after every command submitted before this call.
    pub async fn sync_count(&self) -> Result<usize, HubError> {
        let (respond_to, response) = oneshot::channel();
        self.submit(HubCommand::Count { respond_to }).await?;
        response.await.map_err(|_| HubError::Stopped)
    }

    /// Stops the hub. Every registered session is closed.
    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }

    async fn submit(&self, command: HubCommand) -> Result<(), HubError> {
        if self.shutdown.is_cancelled() {
            return Err(HubError::Stopped);
        }
        self.commands
            .send(command)
            .await
            .map_err(|_| HubError::Stopped)
    }
}

#[async_trait]
impl ClientRegistry for HubHandle {
    async fn add(&self, session: Arc<SessionHandle>) -> Result<(), HubError> {
        self.register(session).await
    }

    async fn remove(&self, session: Arc<SessionHandle>) -> Result<(), HubError> {
        self.unregister(session).await
    }

    async fn publish(&self, message: Message, origin: Option<SessionId>) -> Result<(), HubError> {
        self.broadcast(message, origin).await
    }

    fn count(&self) -> usize {
        HubHandle::count(self)
    }
}
