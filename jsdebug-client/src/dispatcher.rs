// Command dispatcher
//
// Owns the pending-command registry and routes responses back to their callers.
// Every command that carries a callback gets exactly one callback invocation,
// followed by exactly one done notification.

use crate::context::{ContextId, LivenessGuard};
use crate::events::{parse_event, DebuggerEvent};
use crate::protocol::{
    DebugError, DebugResult, DebuggerMessage, IncomingMessage, Response, Seq, SuccessResponse,
};
use crate::transport::Transport;
use std::collections::HashMap;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error, info, warn};

/// Receives the decoded reply (or the reason there is none)
pub type CommandCallback = Box<dyn FnOnce(DebugResult<SuccessResponse>) + Send + 'static>;

/// Fired once the dispatch cycle has finished, after the callback
pub type DoneSignal = Box<dyn FnOnce() + Send + 'static>;

/// Request to send a command
struct CommandRequest {
    message: DebuggerMessage,
    user_initiated: bool,
    guard: Option<LivenessGuard>,
    callback: Option<CommandCallback>,
    done: Option<DoneSignal>,
}

impl CommandRequest {
    fn fail(self, error: DebugError) {
        finish(self.callback, self.done, Err(error));
    }
}

enum DispatcherMessage {
    Command(CommandRequest),
    DismissContext(ContextId),
    /// A command that failed before it could be sent
    Reject {
        error: DebugError,
        callback: Option<CommandCallback>,
        done: Option<DoneSignal>,
    },
}

/// One in-flight command waiting for its response
struct PendingCommand {
    message: DebuggerMessage,
    user_initiated: bool,
    guard: Option<LivenessGuard>,
    callback: CommandCallback,
    done: Option<DoneSignal>,
}

impl PendingCommand {
    fn context(&self) -> Option<ContextId> {
        self.guard.as_ref().map(LivenessGuard::id)
    }

    fn complete(self, outcome: DebugResult<SuccessResponse>) {
        finish(Some(self.callback), self.done, outcome);
    }
}

fn finish(
    callback: Option<CommandCallback>,
    done: Option<DoneSignal>,
    outcome: DebugResult<SuccessResponse>,
) {
    if let Some(callback) = callback {
        callback(outcome);
    }
    if let Some(done) = done {
        done();
    }
}

/// Handle to the dispatcher task. Cheap to clone; every clone feeds the same task.
#[derive(Clone, Debug)]
pub struct DispatcherHandle {
    command_tx: mpsc::UnboundedSender<DispatcherMessage>,
}

impl DispatcherHandle {
    /// Queue a command. Never blocks; if the dispatcher is gone the callback
    /// fails with `ConnectionClosed` before this returns.
    pub fn send(
        &self,
        message: DebuggerMessage,
        user_initiated: bool,
        guard: Option<LivenessGuard>,
        callback: Option<CommandCallback>,
        done: Option<DoneSignal>,
    ) {
        let request = CommandRequest {
            message,
            user_initiated,
            guard,
            callback,
            done,
        };

        if let Err(mpsc::error::SendError(rejected)) =
            self.command_tx.send(DispatcherMessage::Command(request))
        {
            debug!("Dispatcher shut down, failing command");
            if let DispatcherMessage::Command(request) = rejected {
                request.fail(DebugError::ConnectionClosed);
            }
        }
    }

    /// Fail a command that never reached the wire. The callback and `done` run
    /// on the dispatcher task like any other completion; only when the
    /// dispatcher is gone do they run before this returns.
    pub fn reject(
        &self,
        error: DebugError,
        callback: Option<CommandCallback>,
        done: Option<DoneSignal>,
    ) {
        let message = DispatcherMessage::Reject {
            error,
            callback,
            done,
        };

        if let Err(mpsc::error::SendError(rejected)) = self.command_tx.send(message) {
            debug!("Dispatcher shut down, rejecting in place");
            if let DispatcherMessage::Reject {
                error,
                callback,
                done,
            } = rejected
            {
                finish(callback, done, Err(error));
            }
        }
    }

    /// Send a command and wait for its reply
    pub async fn send_command(
        &self,
        message: DebuggerMessage,
        guard: Option<LivenessGuard>,
    ) -> DebugResult<SuccessResponse> {
        let (reply_tx, reply_rx) = oneshot::channel();

        self.send(
            message,
            true,
            guard,
            Some(Box::new(move |outcome| {
                reply_tx.send(outcome).ok();
            })),
            None,
        );

        reply_rx.await.map_err(|_| DebugError::ConnectionClosed)?
    }

    /// Fail every pending command that belongs to `context`
    pub fn dismiss_context(&self, context: ContextId) {
        self.command_tx
            .send(DispatcherMessage::DismissContext(context))
            .ok();
    }

    pub fn is_closed(&self) -> bool {
        self.command_tx.is_closed()
    }
}

/// Start the dispatcher task. Must be called from within a tokio runtime.
pub fn spawn_dispatcher(
    transport: Transport,
    event_tx: mpsc::Sender<DebuggerEvent>,
) -> DispatcherHandle {
    let (command_tx, command_rx) = mpsc::unbounded_channel();

    tokio::spawn(dispatcher_task(transport, command_rx, event_tx));

    DispatcherHandle { command_tx }
}

async fn dispatcher_task(
    transport: Transport,
    mut command_rx: mpsc::UnboundedReceiver<DispatcherMessage>,
    event_tx: mpsc::Sender<DebuggerEvent>,
) {
    info!("Dispatcher started");

    let Transport {
        outgoing,
        mut incoming,
    } = transport;
    let mut pending: HashMap<Seq, PendingCommand> = HashMap::new();
    let mut next_seq: Seq = 1;

    loop {
        tokio::select! {
            message = command_rx.recv() => {
                match message {
                    Some(DispatcherMessage::Command(request)) => {
                        let seq = next_seq;
                        next_seq += 1;
                        write_command(seq, request, &outgoing, &mut pending).await;
                    }
                    Some(DispatcherMessage::DismissContext(context)) => {
                        fail_context(context, &mut pending);
                    }
                    Some(DispatcherMessage::Reject { error, callback, done }) => {
                        debug!("Rejected before dispatch: {}", error);
                        finish(callback, done, Err(error));
                    }
                    None => {
                        info!("All dispatcher handles dropped");
                        break;
                    }
                }
            }

            text = incoming.recv() => {
                match text {
                    Some(text) => handle_incoming(&text, &mut pending, &event_tx),
                    None => {
                        info!("Transport closed");
                        forward_event(&event_tx, DebuggerEvent::Disconnected);
                        break;
                    }
                }
            }
        }
    }

    // Nothing will answer from here on
    command_rx.close();
    while let Ok(message) = command_rx.try_recv() {
        match message {
            DispatcherMessage::Command(request) => request.fail(DebugError::ConnectionClosed),
            DispatcherMessage::Reject {
                error,
                callback,
                done,
            } => finish(callback, done, Err(error)),
            DispatcherMessage::DismissContext(_) => {}
        }
    }
    if !pending.is_empty() {
        warn!("Failing {} pending commands on shutdown", pending.len());
    }
    for (_, command) in pending.drain() {
        command.complete(Err(DebugError::ConnectionClosed));
    }

    info!("Dispatcher shutting down");
}

async fn write_command(
    seq: Seq,
    request: CommandRequest,
    outgoing: &mpsc::Sender<String>,
    pending: &mut HashMap<Seq, PendingCommand>,
) {
    // The context may have been dismissed after the caller checked it
    if let Some(Err(e)) = request.guard.as_ref().map(LivenessGuard::check_live) {
        debug!("Not sending {}: {}", request.message.command, e);
        request.fail(e);
        return;
    }

    let encoded = match request.message.encode(seq) {
        Ok(encoded) => encoded,
        Err(e) => {
            error!("Failed to encode {}: {}", request.message.command, e);
            request.fail(e);
            return;
        }
    };

    if request.user_initiated {
        info!("Sending {} seq={}", request.message.command, seq);
    } else {
        debug!("Sending {} seq={}", request.message.command, seq);
    }

    if outgoing.send(encoded).await.is_err() {
        error!("Failed to write {} seq={}: transport closed", request.message.command, seq);
        request.fail(DebugError::Transport(
            "transport closed before the request was written".to_string(),
        ));
        return;
    }

    let CommandRequest {
        message,
        user_initiated,
        guard,
        callback,
        done,
    } = request;

    match callback {
        Some(callback) => {
            pending.insert(
                seq,
                PendingCommand {
                    message,
                    user_initiated,
                    guard,
                    callback,
                    done,
                },
            );
        }
        // Nobody wants the reply, so the dispatch is finished once written
        None => {
            if let Some(done) = done {
                done();
            }
        }
    }
}

fn handle_incoming(
    text: &str,
    pending: &mut HashMap<Seq, PendingCommand>,
    event_tx: &mpsc::Sender<DebuggerEvent>,
) {
    match IncomingMessage::decode(text) {
        Ok(IncomingMessage::Response(response)) => handle_response(response, pending, event_tx),
        Ok(IncomingMessage::Event(packet)) => {
            debug!("Received event {}", packet.event);
            forward_event(event_tx, parse_event(packet));
        }
        Err(e) => warn!("Discarding inbound message: {}", e),
    }
}

fn handle_response(
    response: Response,
    pending: &mut HashMap<Seq, PendingCommand>,
    event_tx: &mpsc::Sender<DebuggerEvent>,
) {
    let Some(command) = pending.remove(&response.request_seq) else {
        warn!(
            "Received response for unknown request seq={}",
            response.request_seq
        );
        return;
    };

    if command.user_initiated {
        info!(
            "Received {} reply seq={} success={}",
            command.message.command, response.request_seq, response.success
        );
    } else {
        debug!(
            "Received {} reply seq={} success={}",
            command.message.command, response.request_seq, response.success
        );
    }

    let resumed = response.running == Some(true);
    let guard = command.guard.clone();
    command.complete(response.into_success());

    // A paused context ends as soon as the engine says it is running again
    if let Some(guard) = guard.filter(|_| resumed) {
        if guard.dismiss() {
            info!("Engine resumed, context {} dismissed", guard.id());
            fail_context(guard.id(), pending);
            forward_event(event_tx, DebuggerEvent::Resumed);
        }
    }
}

fn fail_context(context: ContextId, pending: &mut HashMap<Seq, PendingCommand>) {
    let seqs: Vec<Seq> = pending
        .iter()
        .filter(|(_, command)| command.context() == Some(context))
        .map(|(seq, _)| *seq)
        .collect();

    if !seqs.is_empty() {
        debug!(
            "Context {} dismissed with {} pending commands",
            context,
            seqs.len()
        );
    }

    for seq in seqs {
        if let Some(command) = pending.remove(&seq) {
            debug!("Abandoning {} seq={}", command.message.command, seq);
            command.complete(Err(DebugError::ContextDismissed));
        }
    }
}

fn forward_event(event_tx: &mpsc::Sender<DebuggerEvent>, event: DebuggerEvent) {
    match event_tx.try_send(event) {
        Ok(_) => {}
        Err(mpsc::error::TrySendError::Full(event)) => {
            error!("Event channel full! Dropping {:?}", event);
        }
        Err(mpsc::error::TrySendError::Closed(_)) => {
            debug!("Event receiver dropped, discarding event");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::RemoteEndpoint;
    use serde_json::json;
    use std::time::Duration;
    use tokio::time::timeout;

    #[derive(Debug, PartialEq)]
    enum Trace {
        Reply(u64, DebugResult<Option<serde_json::Value>>),
        Done(u64),
    }

    struct Harness {
        handle: DispatcherHandle,
        remote: RemoteEndpoint,
        events: mpsc::Receiver<DebuggerEvent>,
        trace_tx: mpsc::UnboundedSender<Trace>,
        trace_rx: mpsc::UnboundedReceiver<Trace>,
    }

    impl Harness {
        fn new() -> Self {
            let (transport, remote) = Transport::loopback(8);
            let (event_tx, events) = mpsc::channel(8);
            let (trace_tx, trace_rx) = mpsc::unbounded_channel();
            Self {
                handle: spawn_dispatcher(transport, event_tx),
                remote,
                events,
                trace_tx,
                trace_rx,
            }
        }

        fn send(&self, tag: u64, command: &str, guard: Option<LivenessGuard>) {
            let reply = self.trace_tx.clone();
            let done = self.trace_tx.clone();
            self.handle.send(
                DebuggerMessage::new(command, None),
                false,
                guard,
                Some(Box::new(move |outcome| {
                    reply
                        .send(Trace::Reply(tag, outcome.map(|r| r.body)))
                        .ok();
                })),
                Some(Box::new(move || {
                    done.send(Trace::Done(tag)).ok();
                })),
            );
        }

        async fn next_trace(&mut self) -> Trace {
            timeout(Duration::from_secs(5), self.trace_rx.recv())
                .await
                .expect("trace timed out")
                .expect("trace channel closed")
        }

        async fn next_seq(&mut self) -> u64 {
            let request = timeout(Duration::from_secs(5), self.remote.recv_request())
                .await
                .expect("request timed out")
                .expect("no request");
            request["seq"].as_u64().unwrap()
        }
    }

    #[tokio::test]
    async fn test_out_of_order_replies_are_correlated() {
        let mut h = Harness::new();

        h.send(1, "first", None);
        h.send(2, "second", None);
        let first = h.next_seq().await;
        let second = h.next_seq().await;
        assert_ne!(first, second);

        h.remote.respond_success(second, json!("two")).await;
        h.remote.respond_success(first, json!("one")).await;

        assert_eq!(h.next_trace().await, Trace::Reply(2, Ok(Some(json!("two")))));
        assert_eq!(h.next_trace().await, Trace::Done(2));
        assert_eq!(h.next_trace().await, Trace::Reply(1, Ok(Some(json!("one")))));
        assert_eq!(h.next_trace().await, Trace::Done(1));
    }

    #[tokio::test]
    async fn test_remote_failure_passes_through() {
        let mut h = Harness::new();

        h.send(1, "evaluate", None);
        let seq = h.next_seq().await;
        h.remote.respond_failure(seq, "SyntaxError: Unexpected token").await;

        assert_eq!(
            h.next_trace().await,
            Trace::Reply(
                1,
                Err(DebugError::Remote("SyntaxError: Unexpected token".to_string()))
            )
        );
        assert_eq!(h.next_trace().await, Trace::Done(1));
    }

    #[tokio::test]
    async fn test_duplicate_reply_is_delivered_once() {
        let mut h = Harness::new();

        h.send(1, "evaluate", None);
        let seq = h.next_seq().await;
        h.remote.respond_success(seq, json!(1)).await;
        h.remote.respond_success(seq, json!(2)).await;

        assert_eq!(h.next_trace().await, Trace::Reply(1, Ok(Some(json!(1)))));
        assert_eq!(h.next_trace().await, Trace::Done(1));

        // Round-trip another command so the duplicate has been processed
        h.send(2, "version", None);
        let seq = h.next_seq().await;
        h.remote.respond_success(seq, json!(3)).await;
        assert_eq!(h.next_trace().await, Trace::Reply(2, Ok(Some(json!(3)))));
        assert_eq!(h.next_trace().await, Trace::Done(2));
    }

    #[tokio::test]
    async fn test_without_callback_done_fires_after_write() {
        let mut h = Harness::new();
        let done = h.trace_tx.clone();

        h.handle.send(
            DebuggerMessage::new("continue", None),
            true,
            None,
            None,
            Some(Box::new(move || {
                done.send(Trace::Done(9)).ok();
            })),
        );

        h.next_seq().await;
        assert_eq!(h.next_trace().await, Trace::Done(9));
    }

    #[tokio::test]
    async fn test_dismissed_guard_sends_nothing() {
        let mut h = Harness::new();
        let guard = LivenessGuard::new();
        guard.dismiss();

        h.send(1, "evaluate", Some(guard));

        assert_eq!(
            h.next_trace().await,
            Trace::Reply(1, Err(DebugError::ContextDismissed))
        );
        assert_eq!(h.next_trace().await, Trace::Done(1));
        assert!(h.remote.try_recv_request().is_none());
    }

    #[tokio::test]
    async fn test_dismiss_context_fails_only_its_commands() {
        let mut h = Harness::new();
        let dismissed = LivenessGuard::new();
        let other = LivenessGuard::new();

        h.send(1, "evaluate", Some(dismissed.clone()));
        h.send(2, "evaluate", Some(other));
        h.next_seq().await;
        let other_seq = h.next_seq().await;

        dismissed.dismiss();
        h.handle.dismiss_context(dismissed.id());

        assert_eq!(
            h.next_trace().await,
            Trace::Reply(1, Err(DebugError::ContextDismissed))
        );
        assert_eq!(h.next_trace().await, Trace::Done(1));

        h.remote.respond_success(other_seq, json!("ok")).await;
        assert_eq!(h.next_trace().await, Trace::Reply(2, Ok(Some(json!("ok")))));
        assert_eq!(h.next_trace().await, Trace::Done(2));
    }

    #[tokio::test]
    async fn test_running_reply_dismisses_context() {
        let mut h = Harness::new();
        let guard = LivenessGuard::new();

        h.send(1, "continue", Some(guard.clone()));
        h.send(2, "evaluate", Some(guard.clone()));
        let continue_seq = h.next_seq().await;
        h.next_seq().await;

        h.remote.respond_running(continue_seq).await;

        assert_eq!(h.next_trace().await, Trace::Reply(1, Ok(None)));
        assert_eq!(h.next_trace().await, Trace::Done(1));
        assert_eq!(
            h.next_trace().await,
            Trace::Reply(2, Err(DebugError::ContextDismissed))
        );
        assert_eq!(h.next_trace().await, Trace::Done(2));
        assert!(!guard.is_live());
        assert_eq!(h.events.recv().await, Some(DebuggerEvent::Resumed));
    }

    #[tokio::test]
    async fn test_transport_close_fails_pending() {
        let mut h = Harness::new();

        h.send(1, "evaluate", None);
        h.next_seq().await;

        let Harness {
            handle,
            remote,
            mut events,
            trace_tx,
            mut trace_rx,
        } = h;
        remote.disconnect();

        let trace = timeout(Duration::from_secs(5), trace_rx.recv()).await.unwrap();
        assert_eq!(trace, Some(Trace::Reply(1, Err(DebugError::ConnectionClosed))));
        assert_eq!(trace_rx.recv().await, Some(Trace::Done(1)));
        assert_eq!(events.recv().await, Some(DebuggerEvent::Disconnected));

        // Later sends fail without hanging
        let reply = trace_tx.clone();
        let (seen_tx, seen_rx) = oneshot::channel();
        timeout(Duration::from_secs(5), async {
            while !handle.is_closed() {
                tokio::task::yield_now().await;
            }
        })
        .await
        .unwrap();
        handle.send(
            DebuggerMessage::new("evaluate", None),
            false,
            None,
            Some(Box::new(move |outcome| {
                reply.send(Trace::Reply(2, outcome.map(|r| r.body))).ok();
                seen_tx.send(()).ok();
            })),
            None,
        );
        seen_rx.await.unwrap();
        assert_eq!(
            trace_rx.recv().await,
            Some(Trace::Reply(2, Err(DebugError::ConnectionClosed)))
        );
    }

    #[tokio::test]
    async fn test_send_command_round_trip() {
        let h = Harness::new();
        let Harness {
            handle, mut remote, ..
        } = h;

        let engine = tokio::spawn(async move {
            let request = remote.recv_request().await.unwrap();
            assert_eq!(request["command"], "version");
            let seq = request["seq"].as_u64().unwrap();
            remote.respond_success(seq, json!({"V8Version": "3.4"})).await;
            remote
        });

        let reply = handle
            .send_command(DebuggerMessage::new("version", None), None)
            .await
            .unwrap();
        assert_eq!(reply.body, Some(json!({"V8Version": "3.4"})));
        engine.await.unwrap();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_reject_completes_on_dispatcher_task() {
        let mut h = Harness::new();
        let caller = std::thread::current().id();
        let (thread_tx, thread_rx) = oneshot::channel();
        let reply = h.trace_tx.clone();
        let done = h.trace_tx.clone();

        h.handle.reject(
            DebugError::MalformedReference("x".to_string()),
            Some(Box::new(move |outcome| {
                thread_tx.send(std::thread::current().id()).ok();
                reply.send(Trace::Reply(1, outcome.map(|r| r.body))).ok();
            })),
            Some(Box::new(move || {
                done.send(Trace::Done(1)).ok();
            })),
        );

        assert_eq!(
            h.next_trace().await,
            Trace::Reply(1, Err(DebugError::MalformedReference("x".to_string())))
        );
        assert_eq!(h.next_trace().await, Trace::Done(1));
        assert_ne!(thread_rx.await.unwrap(), caller);
        assert!(h.remote.try_recv_request().is_none());
    }

    #[tokio::test]
    async fn test_reject_after_shutdown_completes_in_place() {
        let h = Harness::new();
        let Harness {
            handle,
            remote,
            mut trace_rx,
            trace_tx,
            ..
        } = h;
        remote.disconnect();
        timeout(Duration::from_secs(5), async {
            while !handle.is_closed() {
                tokio::task::yield_now().await;
            }
        })
        .await
        .unwrap();

        let reply = trace_tx.clone();
        let done = trace_tx.clone();
        handle.reject(
            DebugError::ContextDismissed,
            Some(Box::new(move |outcome| {
                reply.send(Trace::Reply(1, outcome.map(|r| r.body))).ok();
            })),
            Some(Box::new(move || {
                done.send(Trace::Done(1)).ok();
            })),
        );

        assert_eq!(
            trace_rx.try_recv().ok(),
            Some(Trace::Reply(1, Err(DebugError::ContextDismissed)))
        );
        assert_eq!(trace_rx.try_recv().ok(), Some(Trace::Done(1)));
    }

    #[tokio::test]
    async fn test_pending_entry_keeps_written_message() {
        let (outgoing, mut written) = mpsc::channel(1);
        let mut pending = HashMap::new();
        let message = DebuggerMessage::new("evaluate", Some(json!({"expression": "a"})));

        write_command(
            7,
            CommandRequest {
                message: message.clone(),
                user_initiated: true,
                guard: None,
                callback: Some(Box::new(|_| {})),
                done: None,
            },
            &outgoing,
            &mut pending,
        )
        .await;

        assert!(written.recv().await.is_some());
        let entry = pending.get(&7).unwrap();
        assert_eq!(entry.message, message);
        assert!(entry.user_initiated);
    }

    #[tokio::test]
    async fn test_garbage_inbound_is_ignored() {
        let mut h = Harness::new();

        h.send(1, "evaluate", None);
        let seq = h.next_seq().await;
        h.remote.send_raw("{{ not json").await;
        h.remote.respond_success(seq, json!(true)).await;

        assert_eq!(h.next_trace().await, Trace::Reply(1, Ok(Some(json!(true)))));
        assert_eq!(h.next_trace().await, Trace::Done(1));
    }
}
