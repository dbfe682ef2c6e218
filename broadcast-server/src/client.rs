use anyhow::{Context, Result};
use chrono::Local;
use futures_util::{
    stream::{SplitSink, SplitStream},
    SinkExt, StreamExt,
};
use tokio::{
    io::{self, AsyncBufReadExt, AsyncWriteExt, BufReader},
    net::TcpStream,
    select,
};
use tokio_tungstenite::{
    connect_async, tungstenite::Message as WsMessage, MaybeTlsStream, WebSocketStream,
};
use tracing::{debug, info, warn};

use crate::{config::ClientConfig, connection::Frame, message::Message};

type Socket = WebSocketStream<MaybeTlsStream<TcpStream>>;
type Writer = SplitSink<Socket, WsMessage>;
type Reader = SplitStream<Socket>;

pub async fn run(config: ClientConfig) -> Result<()> {
    let (mut reader, mut writer) = establish_connection(&config).await?;
    write_stdout("Connected to server. Type messages and press Enter to send.").await?;

    let mut stdin = BufReader::new(tokio::io::stdin());
    let mut input = String::new();

    run_client_loop(&mut reader, &mut writer, &mut stdin, &mut input).await?;
    shutdown_connection(&mut writer).await;

    Ok(())
}

async fn establish_connection(config: &ClientConfig) -> Result<(Reader, Writer)> {
    let url = config.endpoint()?;
    let (socket, _response) = connect_async(url.as_str())
        .await
        .with_context(|| format!("failed to connect to {}", config.server_addr))?;

    info!(server = %config.server_addr, username = %config.username, "connected");

    let (writer, reader) = socket.split();
    Ok((reader, writer))
}

async fn run_client_loop(
    reader: &mut Reader,
    writer: &mut Writer,
    stdin: &mut BufReader<tokio::io::Stdin>,
    input: &mut String,
) -> Result<()> {
    loop {
        input.clear();
        select! {
            server_message = reader.next() => {
                if !handle_server_message(server_message).await? {
                    break;
                }
            }
            bytes_read = stdin.read_line(input) => {
                if !handle_stdin_input(bytes_read, input, writer).await? {
                    break;
                }
            }
            ctrl_c = tokio::signal::ctrl_c() => {
                handle_ctrl_c(ctrl_c);
                break;
            }
        }
    }
    Ok(())
}

async fn handle_server_message(
    message: Option<Result<WsMessage, tokio_tungstenite::tungstenite::Error>>,
) -> Result<bool> {
    let Some(message) = message else {
        write_stdout("*** server closed the connection").await?;
        return Ok(false);
    };

    let message = match message {
        Ok(message) => message,
        Err(err) => {
            warn!(error = %err, "connection error");
            write_stdout("*** connection lost").await?;
            return Ok(false);
        }
    };

    match Frame::from(message) {
        Frame::Text(text) => render_frame(&text).await?,
        Frame::Binary(bytes) => match String::from_utf8(bytes) {
            Ok(text) => render_frame(&text).await?,
            Err(err) => warn!(error = %err, "ignoring binary frame that is not UTF-8"),
        },
        // tungstenite answers pings on its own.
        Frame::Ping(_) | Frame::Pong(_) => {}
        Frame::Close => {
            write_stdout("*** server closed the connection").await?;
            return Ok(false);
        }
    }
    Ok(true)
}

async fn handle_stdin_input(
    bytes_read: io::Result<usize>,
    input: &str,
    writer: &mut Writer,
) -> Result<bool> {
    let bytes_read = bytes_read?;
    if bytes_read == 0 {
        return Ok(false);
    }

    let text = input.trim_end();
    if text.is_empty() {
        return Ok(true);
    }

    if text.eq_ignore_ascii_case("/quit") {
        write_stdout("*** leaving chat").await?;
        return Ok(false);
    }

    writer
        .send(WsMessage::Text(text.to_string()))
        .await
        .context("failed to send message")?;
    Ok(true)
}

fn handle_ctrl_c(result: io::Result<()>) {
    if let Err(error) = result {
        warn!(?error, "ctrl-c handler failed");
    }
}

/// Sends a close frame; the server may already be gone.
async fn shutdown_connection(writer: &mut Writer) {
    if let Err(error) = writer.close().await {
        debug!(?error, "failed to close connection cleanly");
    }
}

/// Prints every message packed into one frame; undecodable lines are skipped.
async fn render_frame(frame: &str) -> io::Result<()> {
    for decoded in Message::decode_frame(frame) {
        match decoded {
            Ok(message) => write_stdout(&format_message(&message)).await?,
            Err(err) => warn!(error = %err, "failed to decode message"),
        }
    }
    Ok(())
}

pub fn format_message(message: &Message) -> String {
    format!(
        "[{}] {}: {}",
        message.timestamp().with_timezone(&Local).format("%H:%M:%S"),
        message.sender(),
        message.content()
    )
}

async fn write_stdout(line: &str) -> io::Result<()> {
    let mut stdout = tokio::io::stdout();
    stdout.write_all(line.as_bytes()).await?;
    stdout.write_all(b"\n").await?;
    stdout.flush().await
}
