// Debug session management
//
// Owns the dispatcher and tracks which paused context, if any, is current

use crate::config::{ClientConfig, ConfigError};
use crate::context::DebugContext;
use crate::dispatcher::{spawn_dispatcher, DispatcherHandle};
use crate::events::{CallFrame, DebuggerEvent};
use crate::protocol::{DebugError, DebugResult, DebuggerMessage};
use crate::transport::Transport;
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, info};

#[derive(Debug)]
pub struct DebugSession {
    dispatcher: DispatcherHandle,
    events: Mutex<mpsc::Receiver<DebuggerEvent>>,
    current: Mutex<Option<Arc<DebugContext>>>,
    config: ClientConfig,
}

impl DebugSession {
    /// Start dispatching over `transport`. Must be called from within a tokio runtime.
    pub fn start(transport: Transport, config: ClientConfig) -> Result<Self, ConfigError> {
        config.validate()?;
        let (event_tx, event_rx) = mpsc::channel(config.event_buffer);
        let dispatcher = spawn_dispatcher(transport, event_tx);
        info!("Debug session started");

        Ok(Self {
            dispatcher,
            events: Mutex::new(event_rx),
            current: Mutex::new(None),
            config,
        })
    }

    pub fn dispatcher(&self) -> &DispatcherHandle {
        &self.dispatcher
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    /// The current paused context, if it is still live
    pub async fn current_context(&self) -> Option<Arc<DebugContext>> {
        let current = self.current.lock().await;
        current.as_ref().filter(|context| context.is_live()).cloned()
    }

    /// Wait for the next engine event and apply its effect on the current context
    pub async fn next_event(&self) -> Option<DebuggerEvent> {
        let event = self.events.lock().await.recv().await?;
        self.apply_event(&event).await;
        Some(event)
    }

    /// Consume events until the engine pauses, returning the new context
    pub async fn wait_for_pause(&self) -> Option<Arc<DebugContext>> {
        loop {
            let event = self.next_event().await?;
            if event.is_pause() {
                return self.current_context().await;
            }
            if event == DebuggerEvent::Disconnected {
                return None;
            }
        }
    }

    async fn apply_event(&self, event: &DebuggerEvent) {
        match event {
            DebuggerEvent::Break { paused } | DebuggerEvent::Exception { paused } => {
                self.on_paused(paused.details.call_frames.clone()).await;
            }
            DebuggerEvent::Resumed | DebuggerEvent::Disconnected => {
                self.dismiss_current().await;
            }
            DebuggerEvent::Other { name } => debug!("Ignoring event {}", name),
        }
    }

    /// Replace the current context with a fresh one for a new pause
    pub async fn on_paused(&self, call_frames: Vec<CallFrame>) -> Arc<DebugContext> {
        let context = DebugContext::new(
            self.dispatcher.clone(),
            call_frames,
            self.config.evaluate_timeout(),
        );

        let previous = self.current.lock().await.replace(Arc::clone(&context));
        if let Some(previous) = previous {
            previous.dismiss();
        }
        context
    }

    /// Dismiss the current context. Returns `false` if there was none to dismiss.
    pub async fn dismiss_current(&self) -> bool {
        match self.current.lock().await.take() {
            Some(context) => context.dismiss(),
            None => false,
        }
    }

    /// Resume the engine, ending the current pause
    pub async fn resume(&self) -> DebugResult<()> {
        let context = self
            .current_context()
            .await
            .ok_or(DebugError::ContextDismissed)?;

        context
            .send_command(DebuggerMessage::new("continue", None))
            .await?;
        self.dismiss_current().await;
        Ok(())
    }
}
