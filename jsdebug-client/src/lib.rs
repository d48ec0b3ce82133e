// JavaScript debugger client core
//
// Evaluates expressions against a paused remote JavaScript engine:
// - Request/response correlation over an asynchronous transport
// - Paused-context lifecycle and dismissal
// - Evaluate requests with extra name bindings
// - Blocking and callback-based entry points over the same dispatch path

pub mod config;
pub mod context;
pub mod dispatcher;
pub mod evaluate;
pub mod events;
pub mod mirror;
pub mod protocol;
pub mod rendezvous;
pub mod session;
pub mod transport;

pub use config::{ClientConfig, ConfigError};
pub use context::{ContextState, DebugContext};
pub use evaluate::{AdditionalContext, EvaluateContext, EvaluationResult};
pub use mirror::JsVariable;
pub use protocol::{DebugError, DebugResult};
pub use session::DebugSession;
pub use transport::Transport;
