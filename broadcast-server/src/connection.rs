//! Connection adapters.
//!
//! Session pumps only ever see a stream of [`Frame`]s and a sink that accepts
//! them, so the same pump code drives an axum server socket, a tungstenite
//! client socket, or an in-memory channel in tests.

use std::future;

use axum::extract::ws::{Message as WsMessage, WebSocket};
use futures_util::{Sink, SinkExt, Stream, StreamExt};
use tokio_tungstenite::tungstenite::Message as TungsteniteMessage;

use crate::error::ConnectionError;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    Text(String),
    Binary(Vec<u8>),
    Ping(Vec<u8>),
    Pong(Vec<u8>),
    Close,
}

impl From<WsMessage> for Frame {
    fn from(message: WsMessage) -> Self {
        match message {
            WsMessage::Text(text) => Frame::Text(text),
            WsMessage::Binary(bytes) => Frame::Binary(bytes),
            WsMessage::Ping(bytes) => Frame::Ping(bytes),
            WsMessage::Pong(bytes) => Frame::Pong(bytes),
            WsMessage::Close(_) => Frame::Close,
        }
    }
}

impl From<Frame> for WsMessage {
    fn from(frame: Frame) -> Self {
        match frame {
            Frame::Text(text) => WsMessage::Text(text),
            Frame::Binary(bytes) => WsMessage::Binary(bytes),
            Frame::Ping(bytes) => WsMessage::Ping(bytes),
            Frame::Pong(bytes) => WsMessage::Pong(bytes),
            Frame::Close => WsMessage::Close(None),
        }
    }
}

impl From<TungsteniteMessage> for Frame {
    fn from(message: TungsteniteMessage) -> Self {
        match message {
            TungsteniteMessage::Text(text) => Frame::Text(text),
            TungsteniteMessage::Binary(bytes) => Frame::Binary(bytes),
            TungsteniteMessage::Ping(bytes) => Frame::Ping(bytes),
            TungsteniteMessage::Pong(bytes) => Frame::Pong(bytes),
            // Raw frames never surface from a read; treat them as opaque data.
            TungsteniteMessage::Frame(frame) => Frame::Binary(frame.into_data()),
            TungsteniteMessage::Close(_) => Frame::Close,
        }
    }
}

impl From<Frame> for TungsteniteMessage {
    fn from(frame: Frame) -> Self {
        match frame {
            Frame::Text(text) => TungsteniteMessage::Text(text),
            Frame::Binary(bytes) => TungsteniteMessage::Binary(bytes),
            Frame::Ping(bytes) => TungsteniteMessage::Ping(bytes),
            Frame::Pong(bytes) => TungsteniteMessage::Pong(bytes),
            Frame::Close => TungsteniteMessage::Close(None),
        }
    }
}

/// Splits an upgraded server socket into the two halves the pumps own.
pub fn split_websocket(
    socket: WebSocket,
) -> (
    impl Sink<Frame, Error = ConnectionError> + Send + Unpin + 'static,
    impl Stream<Item = Result<Frame, ConnectionError>> + Send + Unpin + 'static,
) {
    let (sink, stream) = socket.split();

    let sink = sink
        .sink_map_err(transport_error)
        .with(|frame: Frame| future::ready(Ok::<_, ConnectionError>(WsMessage::from(frame))));
    let stream = stream.map(|result| result.map(Frame::from).map_err(transport_error));

    (sink, stream)
}

fn transport_error(err: impl std::fmt::Display) -> ConnectionError {
    ConnectionError::Transport(err.to_string())
}
