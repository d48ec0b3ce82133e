// Debugger event handling
//
// Events are sent by the engine when it pauses or resumes

use crate::protocol::EventPacket;
use serde::{Deserialize, Serialize};
use tracing::warn;

/// Index of a call frame on the paused stack (0 = top)
pub type FrameId = u32;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CallFrame {
    pub id: FrameId,
    #[serde(default)]
    pub function_name: Option<String>,
    #[serde(default)]
    pub line: Option<u32>,
}

/// What the engine reported when it paused
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PausedData {
    #[serde(default)]
    pub details: PausedDetails,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PausedDetails {
    #[serde(default)]
    pub call_frames: Vec<CallFrame>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum DebuggerEvent {
    /// Engine stopped at a breakpoint or a debugger statement
    Break { paused: PausedData },
    /// Engine stopped on a thrown exception
    Exception { paused: PausedData },
    Resumed,
    /// Transport closed; synthesized locally, never sent by the engine
    Disconnected,
    Other { name: String },
}

impl DebuggerEvent {
    /// Whether this event starts a new paused context
    pub fn is_pause(&self) -> bool {
        matches!(
            self,
            DebuggerEvent::Break { .. } | DebuggerEvent::Exception { .. }
        )
    }

    /// Whether this event ends the current paused context
    pub fn ends_pause(&self) -> bool {
        matches!(self, DebuggerEvent::Resumed | DebuggerEvent::Disconnected)
    }
}

/// Parse an event packet. A pause body that does not decode still yields a
/// pause, just without frames.
pub fn parse_event(packet: EventPacket) -> DebuggerEvent {
    match packet.event.as_str() {
        "break" => DebuggerEvent::Break {
            paused: parse_paused(&packet),
        },
        "exception" => DebuggerEvent::Exception {
            paused: parse_paused(&packet),
        },
        "resumed" => DebuggerEvent::Resumed,
        _ => DebuggerEvent::Other { name: packet.event },
    }
}

fn parse_paused(packet: &EventPacket) -> PausedData {
    let Some(body) = packet.body.as_ref() else {
        return PausedData::default();
    };

    match PausedData::deserialize(body) {
        Ok(paused) => paused,
        Err(e) => {
            warn!("Failed to parse {} event body: {}", packet.event, e);
            PausedData::default()
        }
    }
}
