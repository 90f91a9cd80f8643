use serde::{Deserialize, Serialize};

/// Inbound message union carried on the transcript stream.
///
/// Tagged by a `type` field; anything that fails to parse into one of these
/// variants is logged and dropped by the dispatcher, never fatal.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StreamMessage {
    /// A piece of transcribed text
    TranscriptSegment {
        text: String,
        #[serde(default)]
        start_time: f64,
    },

    /// Server acknowledged the connection
    ConnectionEstablished {
        #[serde(default)]
        session_id: Option<String>,
    },

    /// No more transcript results will arrive for this session
    TranscriptComplete,

    /// Server acknowledged a heartbeat
    HeartbeatAck,

    /// Server replied to the initial ping
    Pong,

    /// Stream-level error
    Error { message: String },

    /// Transcription pipeline error (the stream itself is still usable)
    TranscriptionError { message: String },

    /// Processing phase announcement; a phase of "active" counts as the
    /// first-transcript signal even when no text has arrived yet
    Phase { phase: String },
}

/// Outbound JSON control frames
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ControlFrame {
    /// Sent once immediately after connect to unblock server-side loops
    /// that wait for client activity
    Ping,
    /// Sent on the liveness interval while connected
    Heartbeat,
}

impl ControlFrame {
    pub fn to_json(self) -> String {
        // Both variants serialize to a flat `{"type": ...}` object.
        serde_json::to_string(&self).unwrap_or_else(|_| String::from("{}"))
    }
}

/// Events broadcast to stream listeners after dispatch.
///
/// This is the already-filtered view: empty transcript text never reaches a
/// listener, and `phase: "active"` has been folded into `Activated`.
#[derive(Debug, Clone, PartialEq)]
pub enum StreamEvent {
    /// A non-empty transcript segment
    Transcript { text: String, start_time: f64 },
    /// First-activity signal without text (`phase: "active"`)
    Activated,
    /// The session's transcript feed is complete
    Complete,
    /// Transcription failed remotely
    TranscriptionFailed { message: String },
    /// The stream reported an error
    StreamFailed { message: String },
    /// Reconnection attempts were exhausted; an explicit connect is required
    ConnectivityLost,
}
