use crate::error::EngineError;

pub const BYTES_PER_SAMPLE: usize = std::mem::size_of::<i16>();

/// Unit moved through the jitter buffer: one fragment of synthesized speech
/// plus the attribution needed to report playback progress upstream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AudioFrame {
    pub samples: Vec<i16>,     // 24 kHz mono linear PCM
    pub source_id: String,     // conversation item id
    pub content_index: u32,
}

impl AudioFrame {
    pub fn new(samples: Vec<i16>, source_id: impl Into<String>, content_index: u32) -> Self {
        Self {
            samples,
            source_id: source_id.into(),
            content_index,
        }
    }

    /// Decodes little-endian 16-bit PCM as delivered by the session.
    pub fn from_pcm_bytes(
        bytes: &[u8],
        source_id: impl Into<String>,
        content_index: u32,
    ) -> Result<Self, EngineError> {
        if bytes.len() % BYTES_PER_SAMPLE != 0 {
            return Err(EngineError::OddPcmLength { len: bytes.len() });
        }
        let samples = bytes
            .chunks_exact(BYTES_PER_SAMPLE)
            .map(|pair| i16::from_le_bytes([pair[0], pair[1]]))
            .collect();
        Ok(Self::new(samples, source_id, content_index))
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }
}

/// Encodes samples as little-endian PCM bytes for the outbound stream.
pub fn pcm_to_bytes(samples: &[i16]) -> Vec<u8> {
    let mut out = Vec::with_capacity(samples.len() * BYTES_PER_SAMPLE);
    write_pcm_bytes(samples, &mut out);
    out
}

/// Replaces the contents of `out` with the little-endian encoding of
/// `samples`, reusing its allocation.
pub fn write_pcm_bytes(samples: &[i16], out: &mut Vec<u8>) {
    out.clear();
    out.extend(samples.iter().flat_map(|s| s.to_le_bytes()));
}

/// Little-endian byte view of `samples`. Borrows the samples directly on
/// little-endian targets and encodes into `scratch` elsewhere.
pub fn pcm_le_bytes<'a>(samples: &'a [i16], scratch: &'a mut Vec<u8>) -> &'a [u8] {
    if cfg!(target_endian = "little") {
        bytemuck::cast_slice(samples)
    } else {
        write_pcm_bytes(samples, scratch);
        scratch.as_slice()
    }
}

/// Events yielded by the remote conversational session, in arrival order.
#[derive(Debug, Clone, PartialEq)]
pub enum SessionEvent {
    AgentStart { agent: String },
    AgentEnd { agent: String },
    Handoff { from: String, to: String },
    ToolStart { tool: String },
    ToolEnd { tool: String, output: String },
    Audio { item_id: String, content_index: u32, data: Vec<u8> },
    AudioEnd { item_id: String, content_index: u32 },
    /// Server-side VAD detected the user talking over playback.
    AudioInterrupted,
    Error { message: String },
    HistoryUpdated,
    HistoryAdded,
    RawModelEvent { data: String },
    /// Any event kind this engine does not know about yet.
    Unknown { kind: String },
}

impl SessionEvent {
    pub fn kind(&self) -> &str {
        match self {
            Self::AgentStart { .. } => "agent_start",
            Self::AgentEnd { .. } => "agent_end",
            Self::Handoff { .. } => "handoff",
            Self::ToolStart { .. } => "tool_start",
            Self::ToolEnd { .. } => "tool_end",
            Self::Audio { .. } => "audio",
            Self::AudioEnd { .. } => "audio_end",
            Self::AudioInterrupted => "audio_interrupted",
            Self::Error { .. } => "error",
            Self::HistoryUpdated => "history_updated",
            Self::HistoryAdded => "history_added",
            Self::RawModelEvent { .. } => "raw_model_event",
            Self::Unknown { kind } => kind,
        }
    }
}
