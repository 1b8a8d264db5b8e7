// Downstream websocket listener. One task per client connection drives a
// ClientSession: client frames go in, the session outbox is drained out.
use anyhow::Result;
use futures::{SinkExt, StreamExt};
use relaymux_pool::{ClientSession, Pool, PoolError};
use std::net::SocketAddr;
use tokio::net::{TcpListener, TcpStream};
use tokio_tungstenite::accept_async;
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;

/// Close code sent to a client whose frame could not be understood.
pub const PROTOCOL_ERROR_CLOSE_CODE: u16 = 3000;

// Control frame payloads are capped at 125 bytes, two of which hold the code.
const MAX_CLOSE_REASON_BYTES: usize = 123;

/// Accept clients until the task is aborted.
pub async fn serve(listener: TcpListener, pool: Pool) -> Result<()> {
    loop {
        let (stream, peer) = match listener.accept().await {
            Ok(accepted) => accepted,
            Err(err) => {
                tracing::warn!(error = %err, "accept failed");
                continue;
            }
        };
        let pool = pool.clone();
        tokio::spawn(async move {
            handle_client(stream, peer, pool).await;
        });
    }
}

async fn handle_client(stream: TcpStream, peer: SocketAddr, pool: Pool) {
    let ws = match accept_async(stream).await {
        Ok(ws) => ws,
        Err(err) => {
            tracing::debug!(peer = %peer, error = %err, "websocket handshake failed");
            return;
        }
    };
    let (mut session, mut outbox) = ClientSession::open(&pool);
    let client = session.id().clone();
    tracing::info!(client = %client, peer = %peer, "client connected");

    let (mut sink, mut source) = ws.split();
    loop {
        tokio::select! {
            frame = outbox.recv() => {
                let Some(frame) = frame else { break };
                if sink.send(WsMessage::Text(frame)).await.is_err() {
                    break;
                }
            }
            incoming = source.next() => match incoming {
                Some(Ok(WsMessage::Text(text))) => match session.handle_frame(&text).await {
                    Ok(()) => {}
                    Err(PoolError::MalformedFrame(err)) => {
                        tracing::info!(
                            client = %client,
                            error = %err,
                            "closing client after protocol error"
                        );
                        let close = CloseFrame {
                            code: CloseCode::from(PROTOCOL_ERROR_CLOSE_CODE),
                            reason: close_reason(&err).into(),
                        };
                        if let Err(err) = sink.send(WsMessage::Close(Some(close))).await {
                            tracing::debug!(
                                client = %client,
                                error = %err,
                                "protocol-error close failed"
                            );
                        }
                        break;
                    }
                    Err(err) => {
                        tracing::warn!(client = %client, error = %err, "client operation failed");
                    }
                },
                Some(Ok(WsMessage::Close(_))) | None => break,
                Some(Ok(_)) => {}
                Some(Err(err)) => {
                    tracing::debug!(client = %client, error = %err, "client read failed");
                    break;
                }
            },
        }
    }

    session.close().await;
    tracing::info!(client = %client, "client disconnected");
}

/// Close reason for a rejected client frame. Never echoes client-supplied
/// text and always fits a control frame.
pub fn close_reason(err: &relaymux_wire::Error) -> String {
    let reason = match err {
        relaymux_wire::Error::UnknownKind(_) => "malformed frame: unknown message kind".to_string(),
        other => other.to_string(),
    };
    truncate_utf8(reason, MAX_CLOSE_REASON_BYTES)
}

fn truncate_utf8(mut text: String, max_bytes: usize) -> String {
    if text.len() > max_bytes {
        let mut end = max_bytes;
        while !text.is_char_boundary(end) {
            end -= 1;
        }
        text.truncate(end);
    }
    text
}
