use super::{
    InboundReceiver, Inbound, Outbound, OutboundSender, SessionPhase, SessionState,
    turn::{Turn, TurnEnvelope, TurnEvent, TurnInput, TurnReceiver, TurnSender},
};
use crate::{
    AudioFormat,
    codec::{AudioDecoder, PcmDecoder, create_decoder},
    config::Config,
    dialogue::{Dialogue, Message},
    media::SessionProviders,
    protocol::{
        AudioParams, ClientFrame, ClientMessage, ListenMode, ListenState, ServerFrame,
        ServerMessage, TtsState,
    },
};
use anyhow::Result;
use std::sync::{Arc, atomic::AtomicBool};
use tokio::{
    sync::mpsc,
    time::{Instant, sleep_until},
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(super) enum Flow {
    Continue,
    Close,
}

/// Owns one session and is the only writer of its state. Inbound frames, turn
/// events and the idle timer are serialized through `run`.
pub struct SessionController {
    state: SessionState,
    config: Arc<Config>,
    providers: SessionProviders,
    dialogue: Dialogue,
    decoder: Box<dyn AudioDecoder>,
    outbound: OutboundSender,
    turn_tx: TurnSender,
    turn_rx: TurnReceiver,
    /// Token of the running turn, if any. Its id is `state.turn_id`.
    current_turn: Option<CancellationToken>,
    token: CancellationToken,
    started: Instant,
    last_activity: Instant,
}

fn decoder_for(session_id: &str, format: AudioFormat) -> (Box<dyn AudioDecoder>, AudioFormat) {
    match create_decoder(format) {
        Ok(decoder) => (decoder, format),
        Err(e) => {
            warn!(session_id, "{} decoder unavailable, using pcm: {}", format, e);
            (Box::new(PcmDecoder), AudioFormat::Pcm)
        }
    }
}

impl SessionController {
    pub fn new(
        session_id: String,
        config: Arc<Config>,
        providers: SessionProviders,
        outbound: OutboundSender,
        token: CancellationToken,
    ) -> Self {
        let (decoder, audio_format) = decoder_for(&session_id, AudioFormat::default());
        let (turn_tx, turn_rx) = mpsc::unbounded_channel();
        let now = Instant::now();
        Self {
            state: SessionState::new(session_id, audio_format),
            dialogue: Dialogue::new(config.prompt.clone()),
            config,
            providers,
            decoder,
            outbound,
            turn_tx,
            turn_rx,
            current_turn: None,
            token,
            started: now,
            last_activity: now,
        }
    }

    /// Device identity from the transport handshake; a later hello may override it.
    pub fn with_device_id(mut self, device_id: String) -> Self {
        self.state.device_id = device_id;
        self
    }

    pub fn session_id(&self) -> &str {
        &self.state.session_id
    }

    pub fn state(&self) -> &SessionState {
        &self.state
    }

    pub async fn run(mut self, mut inbound: InboundReceiver) -> Result<()> {
        info!(session_id = self.state.session_id, "session started");
        let idle_timeout = self.config.idle_timeout();
        loop {
            if self.outbound.is_closed() {
                debug!(session_id = self.state.session_id, "outbound closed");
                break;
            }
            let deadline = self.last_activity + idle_timeout;
            let flow = tokio::select! {
                _ = self.token.cancelled() => Flow::Close,
                message = inbound.recv() => match message {
                    Some(Inbound::Audio { data, timestamp }) => self.on_audio(data, timestamp),
                    Some(Inbound::Text(text)) => self.on_text(&text),
                    Some(Inbound::Closed) | None => {
                        info!(session_id = self.state.session_id, "client disconnected");
                        Flow::Close
                    }
                },
                Some(envelope) = self.turn_rx.recv() => self.on_turn_event(envelope),
                _ = sleep_until(deadline) => {
                    info!(
                        session_id = self.state.session_id,
                        "no voice or text for {:?}, closing",
                        idle_timeout
                    );
                    self.send_message(ServerMessage::Goodbye);
                    Flow::Close
                }
            };
            if flow == Flow::Close || self.state.close_after_chat {
                break;
            }
        }
        self.shutdown().await;
        Ok(())
    }

    fn send(&self, message: Outbound) {
        if self.outbound.send(message).is_err() {
            trace!(session_id = self.state.session_id, "drop outbound, transport gone");
        }
    }

    fn send_message(&self, message: ServerMessage) {
        self.send(Outbound::Control(ServerFrame::new(
            &self.state.session_id,
            message,
        )));
    }

    fn is_responding(&self) -> bool {
        matches!(
            self.state.phase,
            SessionPhase::Thinking | SessionPhase::Speaking
        )
    }

    pub(super) fn on_audio(&mut self, data: Vec<u8>, timestamp: Option<u64>) -> Flow {
        if self.settle_turn_events() == Flow::Close {
            return Flow::Close;
        }
        let now = timestamp.unwrap_or_else(|| self.started.elapsed().as_millis() as u64);
        let result = self.providers.vad.is_vad(
            &self.state.session_id,
            &data,
            self.decoder.as_mut(),
            &mut self.state.vad_context,
            self.state.listen_mode,
            now,
        );

        if self.state.listen_mode == ListenMode::Manual {
            if self.state.manual_recording {
                self.state.asr_audio.push(data);
                self.state.last_voiced_len = self.state.asr_audio.len();
            }
            return Flow::Continue;
        }

        if result.has_voice {
            self.last_activity = Instant::now();
            if self.is_responding() {
                self.abort("barge-in");
            }
        }
        if result.voice_stopped {
            self.finish_utterance();
            return Flow::Continue;
        }
        if result.is_voice || self.state.vad_context.has_voice {
            self.state.asr_audio.push(data);
            if result.is_voice {
                self.state.last_voiced_len = self.state.asr_audio.len();
            }
            if result.has_voice && self.state.phase == SessionPhase::Listening {
                self.state.phase = SessionPhase::UtteranceActive;
            }
        } else {
            self.state.clear_utterance();
        }
        Flow::Continue
    }

    fn finish_utterance(&mut self) {
        let frames = self.state.take_utterance();
        self.state.vad_context.reset();
        if frames.len() < self.config.min_utterance_frames {
            debug!(
                session_id = self.state.session_id,
                "utterance of {} frames is too short, dropped",
                frames.len()
            );
            if self.state.phase == SessionPhase::UtteranceActive {
                self.state.phase = SessionPhase::Listening;
            }
            return;
        }
        self.start_turn(TurnInput::Audio(frames));
    }

    pub(super) fn on_text(&mut self, text: &str) -> Flow {
        let frame = match ClientFrame::parse(text) {
            Ok(frame) => frame,
            Err(e) => {
                warn!(session_id = self.state.session_id, "{}: {}", e, text);
                return Flow::Continue;
            }
        };
        if self.settle_turn_events() == Flow::Close {
            return Flow::Close;
        }
        self.last_activity = Instant::now();
        match frame.message {
            ClientMessage::Hello {
                audio_params,
                device_id,
            } => self.on_hello(audio_params, device_id),
            ClientMessage::Listen { state, mode, text } => self.on_listen(state, mode, text),
            ClientMessage::Abort { reason } => {
                self.abort(reason.as_deref().unwrap_or("client"));
            }
        }
        Flow::Continue
    }

    fn on_hello(&mut self, audio_params: Option<AudioParams>, device_id: Option<String>) {
        if let Some(device_id) = device_id {
            self.state.device_id = device_id;
        }
        if let Some(params) = audio_params {
            if params.format != self.state.audio_format {
                let (decoder, format) = decoder_for(&self.state.session_id, params.format);
                self.decoder = decoder;
                self.state.audio_format = format;
                self.state.vad_context.reset();
            }
        }
        info!(
            session_id = self.state.session_id,
            device_id = self.state.device_id,
            format = %self.state.audio_format,
            "client hello"
        );
        self.send_message(ServerMessage::Hello {
            transport: "websocket".to_string(),
            audio_params: AudioParams {
                format: AudioFormat::Pcm,
                ..Default::default()
            },
        });
        if self.config.enable_greeting {
            self.start_turn(TurnInput::Speak(self.config.greeting_text.clone()));
        }
    }

    fn on_listen(&mut self, state: ListenState, mode: Option<ListenMode>, text: Option<String>) {
        if let Some(mode) = mode {
            self.state.listen_mode = mode;
        }
        match state {
            ListenState::Start => {
                if self.state.listen_mode == ListenMode::Manual {
                    if self.is_responding() {
                        self.abort("listen start");
                    }
                    self.state.clear_utterance();
                    self.state.manual_recording = true;
                    self.state.phase = SessionPhase::UtteranceActive;
                }
            }
            ListenState::Stop => {
                if self.state.manual_recording {
                    self.state.manual_recording = false;
                    self.finish_utterance();
                }
            }
            ListenState::Detect => {
                let Some(text) = text.filter(|t| !t.trim().is_empty()) else {
                    return;
                };
                if self.is_responding() {
                    self.abort("text input");
                }
                self.start_turn(TurnInput::Text(text));
            }
        }
    }

    /// Cancel the running turn, tell the client to drop queued playback and go
    /// back to listening.
    fn abort(&mut self, reason: &str) {
        info!(
            session_id = self.state.session_id,
            turn_id = self.state.turn_id,
            phase = %self.state.phase,
            "abort: {}",
            reason
        );
        if let Some(token) = self.current_turn.take() {
            token.cancel();
        }
        if self.state.client_is_speaking {
            self.send_message(ServerMessage::tts(TtsState::Stop, None));
        }
        self.send_message(ServerMessage::Abort);
        self.state.client_is_speaking = false;
        self.state.client_abort = true;
        self.state.phase = SessionPhase::Listening;
    }

    fn start_turn(&mut self, input: TurnInput) {
        if self.settle_turn_events() == Flow::Close || self.state.close_after_chat {
            debug!(
                session_id = self.state.session_id,
                "session is closing, turn not started"
            );
            return;
        }
        if self.current_turn.is_some() {
            if self.is_responding() {
                self.abort("superseded");
            } else if let Some(token) = self.current_turn.take() {
                debug!(
                    session_id = self.state.session_id,
                    turn_id = self.state.turn_id,
                    "turn superseded"
                );
                token.cancel();
            }
        }

        self.state.turn_id += 1;
        self.state.client_abort = false;
        self.state.llm_finish_task = false;
        self.state.phase = match input {
            TurnInput::Audio(_) => SessionPhase::Transcribing,
            TurnInput::Text(_) | TurnInput::Speak(_) => SessionPhase::Thinking,
        };
        let token = self.token.child_token();
        self.current_turn = Some(token.clone());

        let turn = Turn {
            turn_id: self.state.turn_id,
            session_id: self.state.session_id.clone(),
            device_id: self.state.device_id.clone(),
            audio_format: self.state.audio_format,
            config: self.config.clone(),
            providers: self.providers.clone(),
            dialogue: self.dialogue.clone(),
            events: self.turn_tx.clone(),
            token,
            speaking: AtomicBool::new(false),
        };
        debug!(
            session_id = self.state.session_id,
            turn_id = self.state.turn_id,
            "turn started"
        );
        tokio::spawn(turn.run(input));
    }

    /// Apply events the current turn queued before the input being handled, so
    /// a turn that already finished is not mistaken for a running one.
    fn settle_turn_events(&mut self) -> Flow {
        while let Ok(envelope) = self.turn_rx.try_recv() {
            if self.on_turn_event(envelope) == Flow::Close {
                return Flow::Close;
            }
        }
        Flow::Continue
    }

    fn on_turn_event(&mut self, envelope: TurnEnvelope) -> Flow {
        if envelope.turn_id != self.state.turn_id || self.current_turn.is_none() {
            trace!(
                session_id = self.state.session_id,
                turn_id = envelope.turn_id,
                "drop stale turn event"
            );
            return Flow::Continue;
        }
        match envelope.event {
            TurnEvent::Phase(phase) => {
                if phase == SessionPhase::Speaking {
                    self.state.client_is_speaking = true;
                }
                self.state.phase = phase;
            }
            TurnEvent::UserTurn(text) => self.dialogue.put(Message::user(text)),
            TurnEvent::Control(message) => {
                if let ServerMessage::Stt {
                    speaker, language, ..
                } = &message
                {
                    if language.is_some() {
                        self.state.current_language = language.clone();
                    }
                    if speaker.is_some() {
                        self.state.current_speaker = speaker.clone();
                    }
                }
                self.send_message(message);
            }
            TurnEvent::Audio(data) => self.send(Outbound::Audio(data)),
            TurnEvent::Finished { reply, close_after } => {
                self.current_turn = None;
                if let Some(reply) = reply {
                    self.dialogue.put(Message::assistant(reply));
                }
                self.state.client_is_speaking = false;
                self.state.llm_finish_task = true;
                self.state.phase = if self.state.vad_context.has_voice {
                    SessionPhase::UtteranceActive
                } else {
                    SessionPhase::Listening
                };
                self.last_activity = Instant::now();
                debug!(
                    session_id = self.state.session_id,
                    turn_id = envelope.turn_id,
                    "turn finished"
                );
                if close_after {
                    self.state.close_after_chat = true;
                    self.send_message(ServerMessage::Goodbye);
                    return Flow::Close;
                }
            }
        }
        Flow::Continue
    }

    async fn shutdown(&mut self) {
        if let Some(token) = self.current_turn.take() {
            token.cancel();
        }
        self.state.clear_utterance();
        self.state.vad_context.reset();
        if let Err(e) = self.providers.tts.close().await {
            warn!(session_id = self.state.session_id, "tts close failed: {}", e);
        }
        if let Some(memory) = &self.providers.memory {
            if !self.dialogue.is_empty() {
                if let Err(e) = memory
                    .save(&self.state.device_id, self.dialogue.messages())
                    .await
                {
                    warn!(session_id = self.state.session_id, "memory save failed: {}", e);
                }
            }
        }
        self.send(Outbound::Close);
        info!(
            session_id = self.state.session_id,
            turns = self.state.turn_id,
            "session closed"
        );
    }
}
