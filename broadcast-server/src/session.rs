//! Client sessions and their pumps.
//!
//! A session is split in two:
//!
//! - [`SessionHandle`] is the shared side. The hub keeps one per registered
//!   session and uses it to enqueue frames or force the session closed.
//! - [`Session`] owns the connection halves and the receiving end of the
//!   outbound queue. [`Session::spawn`] moves them into the inbound and
//!   outbound pump tasks.
//!
//! The pumps share nothing but the queue and the close signal. Whichever pump
//! stops first closes the session, which stops the other one. The inbound pump
//! always unregisters the session on its way out.

use std::{fmt, sync::Arc};

use futures_util::{Sink, SinkExt, Stream, StreamExt};
use tokio::{
    select,
    sync::mpsc::{self, error::TrySendError},
    time::{self, Instant, MissedTickBehavior},
};
use tokio_util::{sync::CancellationToken, task::TaskTracker};
use tracing::{debug, info, trace, warn};

use crate::{
    config::SessionConfig,
    connection::Frame,
    error::{ConnectionError, HubError, SendError, SessionError},
    message::Message,
    service::BroadcastService,
};

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SessionId(String);

impl SessionId {
    pub fn generate() -> Self {
        Self(nanoid::nanoid!())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Shared handle to a live session.
#[derive(Debug)]
pub struct SessionHandle {
    id: SessionId,
    identity: String,
    outbound: mpsc::Sender<Arc<str>>,
    closed: CancellationToken,
}

impl SessionHandle {
    /// Creates a handle with a bounded outbound queue and returns the queue's
    /// receiving end, which belongs to the outbound pump.
    pub fn new(
        identity: impl Into<String>,
        send_buffer: usize,
    ) -> (Arc<Self>, mpsc::Receiver<Arc<str>>) {
        let (outbound, queue) = mpsc::channel(send_buffer);
        let handle = Self {
            id: SessionId::generate(),
            identity: identity.into(),
            outbound,
            closed: CancellationToken::new(),
        };
        (Arc::new(handle), queue)
    }

    pub fn id(&self) -> &SessionId {
        &self.id
    }

    pub fn identity(&self) -> &str {
        &self.identity
    }

    /// Serializes `message` and enqueues it without waiting.
    ///
    /// A full queue means the client cannot keep up: the session is closed
    /// on the spot and [`SendError::QueueFull`] is returned.
    pub fn send(&self, message: &Message) -> Result<(), SendError> {
        let encoded = message.encode()?;
        self.deliver(Arc::from(encoded))
    }

    /// Enqueues an already serialized message without waiting.
    ///
    /// The hub serializes a broadcast once and hands every recipient the same
    /// buffer through this method.
    pub fn deliver(&self, frame: Arc<str>) -> Result<(), SendError> {
        if self.closed.is_cancelled() {
            return Err(SendError::Closed);
        }

        match self.outbound.try_send(frame) {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(_)) => {
                self.close();
                Err(SendError::QueueFull)
            }
            Err(TrySendError::Closed(_)) => {
                self.close();
                Err(SendError::Closed)
            }
        }
    }

    /// Forces the session closed. Safe to call any number of times.
    pub fn close(&self) {
        if !self.closed.is_cancelled() {
            debug!(session_id = %self.id, identity = %self.identity, "closing session");
            self.closed.cancel();
        }
    }

    pub fn is_closed(&self) -> bool {
        self.closed.is_cancelled()
    }

    /// Resolves once the session has been closed.
    pub async fn closed(&self) {
        self.closed.cancelled().await
    }
}

/// A session that owns its connection and has not started pumping yet.
pub struct Session<W, R> {
    handle: Arc<SessionHandle>,
    queue: mpsc::Receiver<Arc<str>>,
    sink: W,
    stream: R,
    config: SessionConfig,
}

impl<W, R> Session<W, R>
where
    W: Sink<Frame, Error = ConnectionError> + Send + Unpin + 'static,
    R: Stream<Item = Result<Frame, ConnectionError>> + Send + Unpin + 'static,
{
    pub fn new(identity: impl Into<String>, sink: W, stream: R, config: SessionConfig) -> Self {
        let (handle, queue) = SessionHandle::new(identity, config.send_buffer);
        Self {
            handle,
            queue,
            sink,
            stream,
            config,
        }
    }

    pub fn handle(&self) -> Arc<SessionHandle> {
        Arc::clone(&self.handle)
    }

    /// Starts both pumps on `tracker` and returns the shared handle.
    pub fn spawn(self, tracker: &TaskTracker, service: BroadcastService) -> Arc<SessionHandle> {
        let Session {
            handle,
            queue,
            sink,
            stream,
            config,
        } = self;

        tracker.spawn(outbound_pump(
            Arc::clone(&handle),
            queue,
            sink,
            config.clone(),
        ));
        tracker.spawn(inbound_pump(Arc::clone(&handle), stream, service, config));

        handle
    }
}

/// Reads frames from the peer and submits each payload to the hub.
///
/// Exits on read error, read deadline, remote close or forced close, then
/// unregisters the session and closes it.
pub async fn inbound_pump<R>(
    handle: Arc<SessionHandle>,
    mut stream: R,
    service: BroadcastService,
    config: SessionConfig,
) where
    R: Stream<Item = Result<Frame, ConnectionError>> + Unpin,
{
    match read_loop(&handle, &mut stream, &service, &config).await {
        Ok(()) => debug!(session_id = %handle.id(), "inbound pump finished"),
        Err(err) => warn!(
            session_id = %handle.id(),
            identity = handle.identity(),
            error = %err,
            "session read failed"
        ),
    }

    if let Err(HubError::Stopped) = service.unregister_client(Arc::clone(&handle)).await {
        // Shutdown already cleared the registry.
        debug!(session_id = %handle.id(), "hub stopped before unregister");
    }
    handle.close();
}

async fn read_loop<R>(
    handle: &SessionHandle,
    stream: &mut R,
    service: &BroadcastService,
    config: &SessionConfig,
) -> Result<(), SessionError>
where
    R: Stream<Item = Result<Frame, ConnectionError>> + Unpin,
{
    loop {
        let next = select! {
            biased;
            () = handle.closed() => return Ok(()),
            next = time::timeout(config.pong_wait, stream.next()) => {
                next.map_err(|_| ConnectionError::Timeout(config.pong_wait))?
            }
        };

        let Some(frame) = next else {
            return Ok(());
        };

        match frame? {
            Frame::Text(text) => submit(handle, service, config, text).await?,
            Frame::Binary(bytes) => match String::from_utf8(bytes) {
                Ok(text) => submit(handle, service, config, text).await?,
                Err(err) => warn!(
                    session_id = %handle.id(),
                    error = %err,
                    "dropping payload that is not valid UTF-8"
                ),
            },
            Frame::Ping(_) | Frame::Pong(_) => trace!(session_id = %handle.id(), "keepalive"),
            Frame::Close => {
                info!(session_id = %handle.id(), identity = handle.identity(), "peer closed connection");
                return Ok(());
            }
        }
    }
}

async fn submit(
    handle: &SessionHandle,
    service: &BroadcastService,
    config: &SessionConfig,
    content: String,
) -> Result<(), SessionError> {
    if content.len() > config.max_message_size {
        return Err(ConnectionError::TooLarge {
            size: content.len(),
            limit: config.max_message_size,
        }
        .into());
    }

    let message = Message::new(handle.identity(), content);
    service
        .broadcast_message(message, Some(handle.id().clone()))
        .await?;
    Ok(())
}

/// Drains the outbound queue to the peer and keeps the connection alive.
///
/// Exits on write failure or forced close, sending a close frame first when
/// the session was closed. The handle owns the queue's only sender, so the
/// queue never closes while this pump holds it.
pub async fn outbound_pump<W>(
    handle: Arc<SessionHandle>,
    mut queue: mpsc::Receiver<Arc<str>>,
    mut sink: W,
    config: SessionConfig,
) where
    W: Sink<Frame, Error = ConnectionError> + Unpin,
{
    if let Err(err) = write_loop(&handle, &mut queue, &mut sink, &config).await {
        warn!(
            session_id = %handle.id(),
            identity = handle.identity(),
            error = %err,
            "session write failed"
        );
    }
    handle.close();
}

async fn write_loop<W>(
    handle: &SessionHandle,
    queue: &mut mpsc::Receiver<Arc<str>>,
    sink: &mut W,
    config: &SessionConfig,
) -> Result<(), ConnectionError>
where
    W: Sink<Frame, Error = ConnectionError> + Unpin,
{
    let mut heartbeat = time::interval_at(Instant::now() + config.ping_period, config.ping_period);
    heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        select! {
            biased;
            () = handle.closed() => {
                send_close(handle, sink, config).await;
                return Ok(());
            }
            Some(first) = queue.recv() => {
                let frame = coalesce(&first, queue);
                write_frame(sink, Frame::Text(frame), config).await?;
            }
            _ = heartbeat.tick() => {
                trace!(session_id = %handle.id(), "sending ping");
                write_frame(sink, Frame::Ping(Vec::new()), config).await?;
            }
        }
    }
}

/// Joins `first` with everything already waiting in the queue.
fn coalesce(first: &str, queue: &mut mpsc::Receiver<Arc<str>>) -> String {
    let mut frame = String::from(first);
    // Bounded by what is queued right now so a busy hub cannot starve the heartbeat.
    for _ in 0..queue.len() {
        match queue.try_recv() {
            Ok(next) => {
                frame.push('\n');
                frame.push_str(&next);
            }
            Err(_) => break,
        }
    }
    frame
}

async fn send_close<W>(handle: &SessionHandle, sink: &mut W, config: &SessionConfig)
where
    W: Sink<Frame, Error = ConnectionError> + Unpin,
{
    // The peer may already be gone; there is nobody left to tell.
    if let Err(err) = write_frame(sink, Frame::Close, config).await {
        debug!(session_id = %handle.id(), error = %err, "failed to send close frame");
    }
}

async fn write_frame<W>(sink: &mut W, frame: Frame, config: &SessionConfig) -> Result<(), ConnectionError>
where
    W: Sink<Frame, Error = ConnectionError> + Unpin,
{
    match time::timeout(config.write_wait, sink.send(frame)).await {
        Ok(result) => result,
        Err(_) => Err(ConnectionError::Timeout(config.write_wait)),
    }
}
