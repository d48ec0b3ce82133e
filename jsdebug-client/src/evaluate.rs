// Expression evaluation
//
// Builds evaluate requests for a paused context, dispatches them and turns the
// returned value handle into a `JsVariable`. Offered both as a callback API and
// as a blocking call with a bounded wait.

use crate::context::{ContextId, DebugContext};
use crate::dispatcher::{CommandCallback, DoneSignal};
use crate::events::FrameId;
use crate::mirror::{build_mirror, parse_ref_id, JsVariable, LoadableStringFactory, RefId};
use crate::protocol::{DebugError, DebugResult, DebuggerMessage, SuccessResponse};
use crate::rendezvous::rendezvous;
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error};

pub type EvaluationResult = DebugResult<JsVariable>;

/// Receives the outcome of one evaluation
pub type ResultCallback = Box<dyn FnOnce(EvaluationResult) + Send + 'static>;

/// Extra names made visible to the expression, mapped to textual reference ids
pub type AdditionalContext = BTreeMap<String, String>;

/// A name bound to a remote value for the duration of one evaluation
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AdditionalContextEntry {
    name: String,
    #[serde(rename = "handle")]
    ref_id: RefId,
}

impl AdditionalContextEntry {
    pub fn new(name: impl Into<String>, ref_id: RefId) -> Self {
        Self {
            name: name.into(),
            ref_id,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn ref_id(&self) -> RefId {
        self.ref_id
    }
}

/// Convert caller bindings into wire form. No mapping means no wire field;
/// one malformed reference fails the whole conversion.
pub fn convert_additional_context(
    source: Option<&AdditionalContext>,
) -> DebugResult<Option<Vec<AdditionalContextEntry>>> {
    let Some(source) = source else {
        return Ok(None);
    };

    source
        .iter()
        .map(|(name, reference)| {
            parse_ref_id(reference).map(|ref_id| AdditionalContextEntry::new(name.clone(), ref_id))
        })
        .collect::<DebugResult<Vec<_>>>()
        .map(Some)
}

/// A fully formed evaluate request. The frame id and the global flag are
/// derived together, so they can never disagree.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EvaluationRequest {
    expression: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    frame: Option<FrameId>,
    #[serde(skip_serializing_if = "Option::is_none")]
    global: Option<bool>,
    #[serde(rename = "inlineRefs")]
    enable_extended_results: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    additional_context: Option<Vec<AdditionalContextEntry>>,
}

impl EvaluationRequest {
    pub fn new(
        expression: impl Into<String>,
        frame: Option<FrameId>,
        additional_context: Option<Vec<AdditionalContextEntry>>,
    ) -> Self {
        Self {
            expression: expression.into(),
            frame,
            global: frame.is_none().then_some(true),
            enable_extended_results: true,
            additional_context,
        }
    }

    pub fn expression(&self) -> &str {
        &self.expression
    }

    pub fn frame(&self) -> Option<FrameId> {
        self.frame
    }

    /// `Some(true)` for global evaluation, `None` for frame-scoped evaluation
    pub fn global(&self) -> Option<bool> {
        self.global
    }

    pub fn enable_extended_results(&self) -> bool {
        self.enable_extended_results
    }

    pub fn additional_context(&self) -> Option<&[AdditionalContextEntry]> {
        self.additional_context.as_deref()
    }

    pub fn to_message(&self) -> DebugResult<DebuggerMessage> {
        let arguments = serde_json::to_value(self)
            .map_err(|e| DebugError::Transport(format!("Failed to encode evaluate: {}", e)))?;
        Ok(DebuggerMessage::new("evaluate", Some(arguments)))
    }
}

/// Turns the raw evaluate reply into the caller's result
struct EvaluateDecoder {
    expression: String,
    context: ContextId,
    strings: LoadableStringFactory,
}

impl EvaluateDecoder {
    fn decode(self, outcome: DebugResult<SuccessResponse>) -> EvaluationResult {
        let response = outcome?;
        let body = response.evaluate_body().map_err(|e| {
            error!(
                "Contract violation decoding evaluate reply seq={}: {}",
                response.request_seq, e
            );
            e
        })?;

        let mirror = build_mirror(&body, &self.strings);
        Ok(JsVariable::new(self.context, mirror, self.expression))
    }
}

/// Evaluation scope: a paused context plus an optional call frame
#[derive(Debug, Clone)]
pub struct EvaluateContext {
    context: Arc<DebugContext>,
    frame: Option<FrameId>,
}

impl EvaluateContext {
    pub fn new(context: Arc<DebugContext>, frame: Option<FrameId>) -> Self {
        Self { context, frame }
    }

    pub fn context(&self) -> &Arc<DebugContext> {
        &self.context
    }

    pub fn frame_id(&self) -> Option<FrameId> {
        self.frame
    }

    pub fn is_global(&self) -> bool {
        self.frame.is_none()
    }

    pub fn build_request(
        &self,
        expression: &str,
        additional_context: Option<&AdditionalContext>,
    ) -> DebugResult<EvaluationRequest> {
        let bindings = convert_additional_context(additional_context)?;
        Ok(EvaluationRequest::new(expression, self.frame, bindings))
    }

    /// Start an evaluation and return at once. The callback and then `done`
    /// run exactly once on the dispatcher's task, including for failures
    /// detected before anything is sent. Only a dispatcher that has already
    /// shut down completes them on the calling thread.
    pub fn evaluate_async(
        &self,
        expression: &str,
        additional_context: Option<&AdditionalContext>,
        callback: Option<ResultCallback>,
        done: Option<DoneSignal>,
    ) {
        let decoder = EvaluateDecoder {
            expression: expression.to_string(),
            context: self.context.id(),
            strings: self.context.string_factory(),
        };
        let command_callback = callback.map(|callback| -> CommandCallback {
            Box::new(move |outcome| callback(decoder.decode(outcome)))
        });

        let message = self
            .context
            .check_live()
            .and_then(|_| self.build_request(expression, additional_context))
            .and_then(|request| request.to_message());

        match message {
            Ok(message) => self.context.dispatch(message, true, command_callback, done),
            Err(e) => {
                debug!(
                    "Evaluate rejected before dispatch, context {}: {}",
                    self.context.id(),
                    e
                );
                self.context.reject(e, command_callback, done);
            }
        }
    }

    /// Evaluate and block for the context's configured timeout.
    ///
    /// Blocks the calling thread, so it must not run on an async task that the
    /// dispatcher depends on.
    pub fn evaluate_sync(
        &self,
        expression: &str,
        additional_context: Option<&AdditionalContext>,
    ) -> EvaluationResult {
        self.evaluate_sync_with_timeout(
            expression,
            additional_context,
            self.context.evaluate_timeout(),
        )
    }

    pub fn evaluate_sync_with_timeout(
        &self,
        expression: &str,
        additional_context: Option<&AdditionalContext>,
        timeout: Duration,
    ) -> EvaluationResult {
        let (signal, waiter) = rendezvous();

        self.evaluate_async(
            expression,
            additional_context,
            Some(Box::new(move |result| signal.signal(result))),
            None,
        );

        waiter.wait(timeout).unwrap_or_else(|| {
            debug!("Evaluate of {:?} timed out after {:?}", expression, timeout);
            Err(DebugError::Timeout)
        })
    }
}
