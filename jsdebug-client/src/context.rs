// Paused-execution contexts
//
// A context is valid from the pause event that created it until the engine
// resumes, the session disconnects, or someone dismisses it. It never comes back.

use crate::dispatcher::{CommandCallback, DispatcherHandle, DoneSignal};
use crate::evaluate::EvaluateContext;
use crate::events::CallFrame;
use crate::mirror::LoadableStringFactory;
use crate::protocol::{DebugError, DebugResult, DebuggerMessage, SuccessResponse};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

pub type ContextId = u64;

static NEXT_CONTEXT_ID: AtomicU64 = AtomicU64::new(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContextState {
    Live,
    Dismissed,
}

/// Shared liveness flag for one context. Clones observe the same state.
#[derive(Debug, Clone)]
pub struct LivenessGuard {
    inner: Arc<GuardState>,
}

#[derive(Debug)]
struct GuardState {
    id: ContextId,
    dismissed: AtomicBool,
}

impl LivenessGuard {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(GuardState {
                id: NEXT_CONTEXT_ID.fetch_add(1, Ordering::SeqCst),
                dismissed: AtomicBool::new(false),
            }),
        }
    }

    pub fn id(&self) -> ContextId {
        self.inner.id
    }

    pub fn state(&self) -> ContextState {
        if self.inner.dismissed.load(Ordering::SeqCst) {
            ContextState::Dismissed
        } else {
            ContextState::Live
        }
    }

    pub fn is_live(&self) -> bool {
        self.state() == ContextState::Live
    }

    pub fn check_live(&self) -> DebugResult<()> {
        match self.state() {
            ContextState::Live => Ok(()),
            ContextState::Dismissed => Err(DebugError::ContextDismissed),
        }
    }

    /// Move to `Dismissed`. Returns `true` only for the call that made the transition.
    pub fn dismiss(&self) -> bool {
        self.inner
            .dismissed
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
    }
}

impl Default for LivenessGuard {
    fn default() -> Self {
        Self::new()
    }
}

/// One paused state of the remote engine
#[derive(Debug)]
pub struct DebugContext {
    guard: LivenessGuard,
    dispatcher: DispatcherHandle,
    call_frames: Vec<CallFrame>,
    evaluate_timeout: Duration,
}

impl DebugContext {
    pub fn new(
        dispatcher: DispatcherHandle,
        call_frames: Vec<CallFrame>,
        evaluate_timeout: Duration,
    ) -> Arc<Self> {
        let context = Arc::new(Self {
            guard: LivenessGuard::new(),
            dispatcher,
            call_frames,
            evaluate_timeout,
        });
        info!(
            "Context {} created with {} call frames",
            context.id(),
            context.call_frames.len()
        );
        context
    }

    pub fn id(&self) -> ContextId {
        self.guard.id()
    }

    pub fn state(&self) -> ContextState {
        self.guard.state()
    }

    pub fn is_live(&self) -> bool {
        self.guard.is_live()
    }

    pub fn check_live(&self) -> DebugResult<()> {
        self.guard.check_live()
    }

    pub fn call_frames(&self) -> &[CallFrame] {
        &self.call_frames
    }

    pub fn evaluate_timeout(&self) -> Duration {
        self.evaluate_timeout
    }

    /// Invalidate the context and fail whatever it still has in flight.
    /// Returns `false` if it was already dismissed.
    pub fn dismiss(&self) -> bool {
        if !self.guard.dismiss() {
            return false;
        }
        info!("Context {} dismissed", self.id());
        self.dispatcher.dismiss_context(self.id());
        true
    }

    /// Evaluate in the global scope of this pause
    pub fn global_evaluator(self: &Arc<Self>) -> EvaluateContext {
        EvaluateContext::new(Arc::clone(self), None)
    }

    /// Evaluate in the scope of one call frame of this pause
    pub fn frame_evaluator(self: &Arc<Self>, frame: &CallFrame) -> EvaluateContext {
        EvaluateContext::new(Arc::clone(self), Some(frame.id))
    }

    pub fn top_frame_evaluator(self: &Arc<Self>) -> Option<EvaluateContext> {
        self.call_frames
            .first()
            .map(|frame| self.frame_evaluator(frame))
    }

    pub fn string_factory(&self) -> LoadableStringFactory {
        LoadableStringFactory::new(self.id())
    }

    /// Dispatch a command scoped to this context
    pub fn dispatch(
        &self,
        message: DebuggerMessage,
        user_initiated: bool,
        callback: Option<CommandCallback>,
        done: Option<DoneSignal>,
    ) {
        self.dispatcher.send(
            message,
            user_initiated,
            Some(self.guard.clone()),
            callback,
            done,
        );
    }

    /// Fail a command of this context that could not be built or sent
    pub fn reject(
        &self,
        error: DebugError,
        callback: Option<CommandCallback>,
        done: Option<DoneSignal>,
    ) {
        self.dispatcher.reject(error, callback, done);
    }

    /// Send a command scoped to this context and wait for the reply
    pub async fn send_command(&self, message: DebuggerMessage) -> DebugResult<SuccessResponse> {
        self.check_live()?;
        self.dispatcher
            .send_command(message, Some(self.guard.clone()))
            .await
    }
}
