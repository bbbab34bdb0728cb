//! One client connection: the per-session state machine and its turn pipeline.
use crate::{
    AudioFormat, SessionId,
    protocol::{ListenMode, ServerFrame},
    vad::VadContext,
};
use tokio::sync::mpsc;

mod controller;
mod turn;

pub use controller::SessionController;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SessionPhase {
    #[default]
    Listening,
    UtteranceActive,
    Transcribing,
    Thinking,
    Speaking,
}

impl std::fmt::Display for SessionPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SessionPhase::Listening => write!(f, "listening"),
            SessionPhase::UtteranceActive => write!(f, "utterance_active"),
            SessionPhase::Transcribing => write!(f, "transcribing"),
            SessionPhase::Thinking => write!(f, "thinking"),
            SessionPhase::Speaking => write!(f, "speaking"),
        }
    }
}

/// What the transport hands to the controller.
#[derive(Debug)]
pub enum Inbound {
    /// One encoded audio frame. `timestamp` is in ms; when absent the time since
    /// the session started is used.
    Audio {
        data: Vec<u8>,
        timestamp: Option<u64>,
    },
    Text(String),
    Closed,
}

/// What the controller asks the transport to send.
#[derive(Debug, Clone, PartialEq)]
pub enum Outbound {
    Control(ServerFrame),
    Audio(Vec<u8>),
    Close,
}

pub type InboundSender = mpsc::UnboundedSender<Inbound>;
pub type InboundReceiver = mpsc::UnboundedReceiver<Inbound>;
pub type OutboundSender = mpsc::UnboundedSender<Outbound>;
pub type OutboundReceiver = mpsc::UnboundedReceiver<Outbound>;

/// Mutable state of one session. Only the controller loop writes it.
#[derive(Debug)]
pub struct SessionState {
    pub session_id: SessionId,
    pub device_id: String,
    pub audio_format: AudioFormat,
    pub listen_mode: ListenMode,
    pub phase: SessionPhase,
    /// Set between `tts start` and `tts stop` (or an abort).
    pub client_is_speaking: bool,
    /// Set by the last abort, cleared when the next turn starts.
    pub client_abort: bool,
    /// Set when the last turn ran to completion.
    pub llm_finish_task: bool,
    pub close_after_chat: bool,
    pub vad_context: VadContext,
    /// Encoded frames of the utterance in progress.
    pub asr_audio: Vec<Vec<u8>>,
    /// Length of `asr_audio` after the last voiced frame.
    pub last_voiced_len: usize,
    /// Manual mode: frames are buffered between `listen start` and `listen stop`.
    pub manual_recording: bool,
    pub current_language: Option<String>,
    pub current_speaker: Option<String>,
    pub turn_id: u64,
}

impl SessionState {
    pub fn new(session_id: SessionId, audio_format: AudioFormat) -> Self {
        Self {
            device_id: session_id.clone(),
            session_id,
            audio_format,
            listen_mode: ListenMode::Auto,
            phase: SessionPhase::Listening,
            client_is_speaking: false,
            client_abort: false,
            llm_finish_task: false,
            close_after_chat: false,
            vad_context: VadContext::default(),
            asr_audio: Vec::new(),
            last_voiced_len: 0,
            manual_recording: false,
            current_language: None,
            current_speaker: None,
            turn_id: 0,
        }
    }

    pub fn clear_utterance(&mut self) {
        self.asr_audio.clear();
        self.last_voiced_len = 0;
    }

    /// Drop the trailing unvoiced frames and hand the utterance out.
    pub fn take_utterance(&mut self) -> Vec<Vec<u8>> {
        let mut frames = std::mem::take(&mut self.asr_audio);
        frames.truncate(self.last_voiced_len);
        self.last_voiced_len = 0;
        frames
    }
}
