// Value mirrors
//
// Local snapshots of remote values, built from the value handles the engine
// returns. Construction is pure: no lookups, no I/O.

use crate::context::ContextId;
use crate::protocol::{DebugError, DebugResult, ValueHandle};
use serde_json::Value;

/// Engine-assigned handle of a remote value
pub type RefId = i64;

/// Parse a textual reference handle such as `"123"`
pub fn parse_ref_id(text: &str) -> DebugResult<RefId> {
    text.trim()
        .parse()
        .map_err(|_| DebugError::MalformedReference(text.to_string()))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValueType {
    Undefined,
    Null,
    Boolean,
    Number,
    String,
    Object,
    Function,
    Regexp,
    Error,
    Date,
    Array,
    Frame,
    Script,
    Context,
    Other,
}

impl ValueType {
    pub fn from_wire(name: &str) -> Self {
        match name {
            "undefined" => ValueType::Undefined,
            "null" => ValueType::Null,
            "boolean" => ValueType::Boolean,
            "number" => ValueType::Number,
            "string" => ValueType::String,
            "object" => ValueType::Object,
            "function" => ValueType::Function,
            "regexp" => ValueType::Regexp,
            "error" => ValueType::Error,
            "date" => ValueType::Date,
            "array" => ValueType::Array,
            "frame" => ValueType::Frame,
            "script" => ValueType::Script,
            "context" => ValueType::Context,
            _ => ValueType::Other,
        }
    }

    pub fn is_primitive(self) -> bool {
        matches!(
            self,
            ValueType::Undefined
                | ValueType::Null
                | ValueType::Boolean
                | ValueType::Number
                | ValueType::String
        )
    }
}

/// String value that the engine may have cut short
#[derive(Debug, Clone, PartialEq)]
pub struct LoadableString {
    value: String,
    full_length: u64,
    reload_context: Option<ContextId>,
}

impl LoadableString {
    pub fn value(&self) -> &str {
        &self.value
    }

    /// Length of the string on the remote side, in characters
    pub fn full_length(&self) -> u64 {
        self.full_length
    }

    pub fn is_truncated(&self) -> bool {
        self.reload_context.is_some()
    }

    /// Context the full text can be fetched from, if it was truncated
    pub fn reload_context(&self) -> Option<ContextId> {
        self.reload_context
    }
}

/// Builds [`LoadableString`]s bound to the context that produced them
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LoadableStringFactory {
    context: ContextId,
}

impl LoadableStringFactory {
    pub fn new(context: ContextId) -> Self {
        Self { context }
    }

    pub fn create(&self, handle: &ValueHandle) -> LoadableString {
        let value = match &handle.value {
            Some(Value::String(s)) => s.clone(),
            _ => handle.text.clone().unwrap_or_default(),
        };
        let received = value.chars().count() as u64;
        let full_length = handle.length.unwrap_or(received);
        let truncated = match handle.to_index {
            Some(to_index) => to_index < full_length,
            None => received < full_length,
        };

        LoadableString {
            value,
            full_length,
            reload_context: truncated.then_some(self.context),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum MirrorValue {
    Undefined,
    Null,
    Boolean(bool),
    Number(f64),
    String(LoadableString),
    Object { text: Option<String> },
}

#[derive(Debug, Clone, PartialEq)]
pub struct ValueMirror {
    pub ref_id: RefId,
    pub value_type: ValueType,
    pub value: MirrorValue,
    pub class_name: Option<String>,
}

impl ValueMirror {
    pub fn display_value(&self) -> String {
        match &self.value {
            MirrorValue::Undefined => "undefined".to_string(),
            MirrorValue::Null => "null".to_string(),
            MirrorValue::Boolean(b) => b.to_string(),
            MirrorValue::Number(n) => format_number(*n),
            MirrorValue::String(s) => s.value().to_string(),
            MirrorValue::Object { text } => text.clone().unwrap_or_else(|| {
                format!("#<{}>", self.class_name.as_deref().unwrap_or("Object"))
            }),
        }
    }
}

/// Build a mirror from a value handle
pub fn build_mirror(handle: &ValueHandle, strings: &LoadableStringFactory) -> ValueMirror {
    let value_type = ValueType::from_wire(&handle.value_type);

    let value = match value_type {
        ValueType::Undefined => MirrorValue::Undefined,
        ValueType::Null => MirrorValue::Null,
        ValueType::Boolean => MirrorValue::Boolean(
            handle
                .value
                .as_ref()
                .and_then(Value::as_bool)
                .unwrap_or_else(|| handle.text.as_deref() == Some("true")),
        ),
        ValueType::Number => MirrorValue::Number(number_value(handle)),
        ValueType::String => MirrorValue::String(strings.create(handle)),
        _ => MirrorValue::Object {
            text: handle.text.clone(),
        },
    };

    ValueMirror {
        ref_id: handle.handle,
        value_type,
        value,
        class_name: handle.class_name.clone(),
    }
}

// NaN and the infinities have no JSON form, so only `text` carries them
fn number_value(handle: &ValueHandle) -> f64 {
    handle
        .value
        .as_ref()
        .and_then(Value::as_f64)
        .or_else(|| handle.text.as_deref().and_then(parse_js_number))
        .unwrap_or(f64::NAN)
}

fn parse_js_number(text: &str) -> Option<f64> {
    match text {
        "NaN" => Some(f64::NAN),
        "Infinity" => Some(f64::INFINITY),
        "-Infinity" => Some(f64::NEG_INFINITY),
        other => other.parse().ok(),
    }
}

fn format_number(n: f64) -> String {
    if n.is_nan() {
        "NaN".to_string()
    } else if n == f64::INFINITY {
        "Infinity".to_string()
    } else if n == f64::NEG_INFINITY {
        "-Infinity".to_string()
    } else if n.fract() == 0.0 && n.abs() < 1e15 {
        format!("{}", n as i64)
    } else {
        n.to_string()
    }
}

/// Result of an evaluation as seen by the caller: the expression and its value
#[derive(Debug, Clone, PartialEq)]
pub struct JsVariable {
    name: String,
    mirror: ValueMirror,
    context: ContextId,
}

impl JsVariable {
    pub fn new(context: ContextId, mirror: ValueMirror, name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            mirror,
            context,
        }
    }

    /// The expression text that produced this value
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn mirror(&self) -> &ValueMirror {
        &self.mirror
    }

    pub fn context_id(&self) -> ContextId {
        self.context
    }

    pub fn ref_id(&self) -> RefId {
        self.mirror.ref_id
    }

    pub fn is_primitive(&self) -> bool {
        self.mirror.value_type.is_primitive()
    }

    pub fn display_value(&self) -> String {
        self.mirror.display_value()
    }
}
