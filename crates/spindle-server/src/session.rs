//! One client session on the socket.
//!
//! A session reads requests line by line and writes responses line by line.
//! Immediate responses and engine replies share one outgoing channel, so a
//! single writer task owns the socket's write half.

use crate::handler::handle_request;
use crate::protocol::{error_codes, Request, Response};
use spindle_core::{Connection, Mailbox, Reply, Requester};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::unix::OwnedWriteHalf;
use tokio::net::UnixStream;
use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver, UnboundedSender};
use tracing::{debug, trace, warn};

/// Mailbox that turns engine replies into JSON-RPC responses for one session.
pub struct SessionMailbox {
    tx: UnboundedSender<Response>,
}

impl SessionMailbox {
    pub fn new(tx: UnboundedSender<Response>) -> Self {
        Self { tx }
    }
}

impl Mailbox for SessionMailbox {
    fn deliver(&self, reply: Reply) -> bool {
        self.tx.send(Response::from_reply(reply)).is_ok()
    }

    fn is_alive(&self) -> bool {
        !self.tx.is_closed()
    }
}

/// Serve one client until it disconnects and every queued reply is written.
pub async fn serve(stream: UnixStream, conn: Connection) -> anyhow::Result<()> {
    let (reader, writer) = stream.into_split();
    let (tx, rx) = unbounded_channel();
    let requester = Requester::new(SessionMailbox::new(tx.clone()));
    let writer_task = tokio::spawn(write_responses(writer, rx));

    let mut reader = BufReader::new(reader);
    let mut line = String::new();

    loop {
        line.clear();
        let bytes_read = reader.read_line(&mut line).await?;

        if bytes_read == 0 {
            debug!("client disconnected");
            break;
        }

        let trimmed = line.trim();
        if trimmed.is_empty() {
            continue;
        }

        trace!(request = %trimmed, "received request");

        let response = match serde_json::from_str::<Request>(trimmed) {
            Ok(req) => handle_request(&conn, &requester, req),
            Err(e) => {
                warn!(error = %e, "failed to parse request");
                Some(Response::error(
                    0,
                    error_codes::PARSE_ERROR,
                    format!("parse error: {}", e),
                ))
            }
        };

        if let Some(response) = response {
            if tx.send(response).is_err() {
                debug!("writer gone, closing session");
                break;
            }
        }
    }

    // Commands still queued hold their own handles on the channel; the writer
    // finishes once the last of them has replied or been discarded.
    drop(tx);
    drop(requester);
    writer_task.await??;
    Ok(())
}

async fn write_responses(
    mut writer: OwnedWriteHalf,
    mut rx: UnboundedReceiver<Response>,
) -> anyhow::Result<()> {
    while let Some(response) = rx.recv().await {
        let json = serde_json::to_string(&response)?;
        trace!(response = %json, "sending response");
        writer.write_all(json.as_bytes()).await?;
        writer.write_all(b"\n").await?;
        writer.flush().await?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::{json, Value};
    use spindle_core::ConnectionConfig;
    use std::time::Duration;

    async fn read_json(lines: &mut tokio::io::Lines<BufReader<tokio::net::unix::OwnedReadHalf>>) -> Value {
        let line = tokio::time::timeout(Duration::from_secs(5), lines.next_line())
            .await
            .expect("timed out")
            .unwrap()
            .expect("stream ended");
        serde_json::from_str(&line).unwrap()
    }

    #[tokio::test]
    async fn test_session_round_trip() {
        let conn = Connection::start(ConnectionConfig::default()).unwrap();
        let (client, server) = UnixStream::pair().unwrap();
        let session = tokio::spawn(serve(server, conn.clone()));

        let (read, mut write) = client.into_split();
        let mut lines = BufReader::new(read).lines();

        write
            .write_all(
                concat!(
                    r#"{"jsonrpc":"2.0","id":1,"method":"ping"}"#,
                    "\n",
                    r#"{"jsonrpc":"2.0","id":2,"method":"open"}"#,
                    "\n",
                    r#"{"jsonrpc":"2.0","id":3,"method":"eval","params":{"source":"'ab' .. 'c'"}}"#,
                    "\n",
                    "not json\n",
                )
                .as_bytes(),
            )
            .await
            .unwrap();

        let mut responses = Vec::new();
        for _ in 0..4 {
            responses.push(read_json(&mut lines).await);
        }

        let by_id = |id: u64| {
            responses
                .iter()
                .find(|r| r["id"] == id && r.get("result").is_some())
                .cloned()
        };
        assert_eq!(by_id(1).unwrap()["result"], json!({"pong": true}));
        assert_eq!(by_id(2).unwrap()["result"], json!({"status": "ok"}));
        assert_eq!(
            by_id(3).unwrap()["result"],
            json!({"status": "ok", "value": {"type": "string", "value": "abc"}})
        );
        assert!(responses
            .iter()
            .any(|r| r["error"]["code"] == error_codes::PARSE_ERROR));

        drop(write);
        drop(lines);
        tokio::time::timeout(Duration::from_secs(5), session)
            .await
            .expect("session did not finish")
            .unwrap()
            .expect("session failed");
    }

    #[test]
    fn test_mailbox_liveness_follows_channel() {
        let (tx, rx) = unbounded_channel();
        let mailbox = SessionMailbox::new(tx);
        assert!(mailbox.is_alive());
        drop(rx);
        assert!(!mailbox.is_alive());
    }
}
