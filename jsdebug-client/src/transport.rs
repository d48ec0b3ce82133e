// Transport seam
//
// Sockets and message framing live outside this crate. The dispatcher only sees
// a pair of channels carrying one JSON document per message.

use serde_json::{json, Value};
use tokio::sync::mpsc;

/// Channel pair connecting the dispatcher to whatever frames bytes on the wire
#[derive(Debug)]
pub struct Transport {
    pub outgoing: mpsc::Sender<String>,
    pub incoming: mpsc::Receiver<String>,
}

impl Transport {
    pub fn new(outgoing: mpsc::Sender<String>, incoming: mpsc::Receiver<String>) -> Self {
        Self { outgoing, incoming }
    }

    /// In-process transport whose other end plays the remote engine
    pub fn loopback(capacity: usize) -> (Transport, RemoteEndpoint) {
        let (request_tx, request_rx) = mpsc::channel(capacity);
        let (reply_tx, reply_rx) = mpsc::channel(capacity);

        (
            Transport::new(request_tx, reply_rx),
            RemoteEndpoint {
                requests: request_rx,
                replies: reply_tx,
                next_seq: 1,
            },
        )
    }
}

/// Engine side of a loopback transport
#[derive(Debug)]
pub struct RemoteEndpoint {
    requests: mpsc::Receiver<String>,
    replies: mpsc::Sender<String>,
    next_seq: u64,
}

impl RemoteEndpoint {
    /// Next request sent by the client, decoded as JSON
    pub async fn recv_request(&mut self) -> Option<Value> {
        let text = self.requests.recv().await?;
        serde_json::from_str(&text).ok()
    }

    pub fn try_recv_request(&mut self) -> Option<Value> {
        let text = self.requests.try_recv().ok()?;
        serde_json::from_str(&text).ok()
    }

    /// Push raw text at the client, bypassing any encoding
    pub async fn send_raw(&self, text: impl Into<String>) -> bool {
        self.replies.send(text.into()).await.is_ok()
    }

    pub async fn respond_success(&mut self, request_seq: u64, body: Value) -> bool {
        self.respond(request_seq, true, None, Some(body), false).await
    }

    pub async fn respond_failure(&mut self, request_seq: u64, message: &str) -> bool {
        self.respond(request_seq, false, Some(message), None, false)
            .await
    }

    /// Reply that also tells the client the engine has resumed
    pub async fn respond_running(&mut self, request_seq: u64) -> bool {
        self.respond(request_seq, true, None, None, true).await
    }

    pub async fn send_event(&mut self, event: &str, body: Value) -> bool {
        let seq = self.bump_seq();
        let packet = json!({"seq": seq, "type": "event", "event": event, "body": body});
        self.send_raw(packet.to_string()).await
    }

    /// Drop the engine side, as if the socket closed
    pub fn disconnect(self) {}

    async fn respond(
        &mut self,
        request_seq: u64,
        success: bool,
        message: Option<&str>,
        body: Option<Value>,
        running: bool,
    ) -> bool {
        let seq = self.bump_seq();
        let mut packet = json!({
            "seq": seq,
            "type": "response",
            "request_seq": request_seq,
            "success": success,
            "running": running,
        });
        if let Some(message) = message {
            packet["message"] = json!(message);
        }
        if let Some(body) = body {
            packet["body"] = body;
        }
        self.send_raw(packet.to_string()).await
    }

    fn bump_seq(&mut self) -> u64 {
        let seq = self.next_seq;
        self.next_seq += 1;
        seq
    }
}
