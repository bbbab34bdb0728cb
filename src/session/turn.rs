use super::SessionPhase;
use crate::{
    AudioFormat, FRAME_SAMPLES,
    codec::create_decoder,
    config::Config,
    dialogue::{Dialogue, Message},
    intent::{Intent, is_exit, normalize},
    media::SessionProviders,
    protocol::{ServerMessage, TtsState},
    registry::Action,
    segmenter::{SentenceSegmenter, is_speakable},
    synthesis::SynthesisEvent,
    transcription::{Transcript, collect_transcript},
};
use anyhow::{Result, anyhow};
use futures::{StreamExt, stream::BoxStream};
use std::sync::{
    Arc,
    atomic::{AtomicBool, Ordering},
};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Outbound audio is re-framed to the client frame size.
const OUT_FRAME_BYTES: usize = FRAME_SAMPLES * 2;

pub(super) enum TurnInput {
    /// Encoded frames of one utterance.
    Audio(Vec<Vec<u8>>),
    /// Typed text, handled as if it had been transcribed.
    Text(String),
    /// Speak fixed text without consulting the LLM.
    Speak(String),
}

#[derive(Debug)]
pub(super) enum TurnEvent {
    Phase(SessionPhase),
    /// The user message this turn committed to the dialogue.
    UserTurn(String),
    Control(ServerMessage),
    Audio(Vec<u8>),
    Finished {
        reply: Option<String>,
        close_after: bool,
    },
}

#[derive(Debug)]
pub(super) struct TurnEnvelope {
    pub turn_id: u64,
    pub event: TurnEvent,
}

pub(super) type TurnSender = mpsc::UnboundedSender<TurnEnvelope>;
pub(super) type TurnReceiver = mpsc::UnboundedReceiver<TurnEnvelope>;

#[derive(Debug, Default)]
struct TurnOutcome {
    reply: Option<String>,
    close_after: bool,
}

/// One user turn, run as its own task. It never touches session state; every
/// effect goes back to the controller as a `TurnEvent` tagged with `turn_id`.
pub(super) struct Turn {
    pub turn_id: u64,
    pub session_id: String,
    pub device_id: String,
    pub audio_format: AudioFormat,
    pub config: Arc<Config>,
    pub providers: SessionProviders,
    /// Dialogue as it stood when the turn started.
    pub dialogue: Dialogue,
    pub events: TurnSender,
    pub token: CancellationToken,
    pub speaking: AtomicBool,
}

impl Turn {
    fn emit(&self, event: TurnEvent) {
        if self.token.is_cancelled() {
            return;
        }
        self.events
            .send(TurnEnvelope {
                turn_id: self.turn_id,
                event,
            })
            .ok();
    }

    fn cancelled(&self) -> anyhow::Error {
        anyhow!("turn {} cancelled", self.turn_id)
    }

    pub async fn run(self, input: TurnInput) {
        let result = self.execute(input).await;
        if self.token.is_cancelled() {
            debug!(
                session_id = self.session_id,
                turn_id = self.turn_id,
                "turn cancelled"
            );
            return;
        }
        let outcome = match result {
            Ok(outcome) => outcome,
            Err(e) => {
                warn!(
                    session_id = self.session_id,
                    turn_id = self.turn_id,
                    "turn failed: {}",
                    e
                );
                if let Err(e) = self.speak_text(&self.config.tts_fallback_text).await {
                    warn!(session_id = self.session_id, "fallback speech failed: {}", e);
                }
                TurnOutcome::default()
            }
        };
        if self.speaking.load(Ordering::Relaxed) {
            self.emit(TurnEvent::Control(ServerMessage::tts(TtsState::Stop, None)));
        }
        self.emit(TurnEvent::Finished {
            reply: outcome.reply,
            close_after: outcome.close_after,
        });
    }

    async fn execute(&self, input: TurnInput) -> Result<TurnOutcome> {
        let transcript = match input {
            TurnInput::Speak(text) => {
                self.speak_text(&text).await?;
                return Ok(TurnOutcome::default());
            }
            TurnInput::Text(text) => Transcript {
                text: text.trim().to_string(),
                ..Default::default()
            },
            TurnInput::Audio(frames) => self.transcribe(frames).await?,
        };
        if transcript.text.is_empty() {
            debug!(session_id = self.session_id, "no speech recognized");
            return Ok(TurnOutcome::default());
        }
        info!(session_id = self.session_id, "user said: {}", transcript.text);
        self.emit(TurnEvent::Control(ServerMessage::Stt {
            text: transcript.text.clone(),
            speaker: transcript.speaker,
            language: transcript.language,
        }));
        let text = transcript.text;

        let exit_commands: Vec<String> = self
            .config
            .exit_commands
            .iter()
            .map(|c| normalize(c))
            .collect();
        if is_exit(&exit_commands, &text) {
            return self.farewell().await;
        }

        let intent = match self.providers.intent.recognize(&self.session_id, &text).await {
            Ok(intent) => intent,
            Err(e) => {
                warn!(session_id = self.session_id, "intent recognition failed: {}", e);
                Intent::None
            }
        };
        match intent {
            Intent::Exit => return self.farewell().await,
            Intent::Call { name, arguments } => {
                let response = self
                    .providers
                    .functions
                    .call(&self.session_id, &name, &arguments)
                    .await;
                match response.action {
                    Action::Response => {
                        let reply = response.response.unwrap_or_default();
                        self.emit(TurnEvent::UserTurn(text));
                        self.emit(TurnEvent::Control(ServerMessage::Llm {
                            text: reply.clone(),
                            emotion: None,
                        }));
                        self.speak_text(&reply).await?;
                        return Ok(TurnOutcome {
                            reply: Some(reply),
                            close_after: false,
                        });
                    }
                    Action::ReqLlm => return self.chat(text, response.result).await,
                    action => debug!(
                        session_id = self.session_id,
                        "function {} returned {:?}, falling back to chat",
                        name,
                        action
                    ),
                }
            }
            Intent::ContinueChat | Intent::None => {}
        }
        self.chat(text, None).await
    }

    async fn transcribe(&self, frames: Vec<Vec<u8>>) -> Result<Transcript> {
        // A fresh decoder: the session's decoder state belongs to the live stream.
        let mut decoder = create_decoder(self.audio_format)?;
        let mut audio = Vec::with_capacity(frames.len());
        for frame in &frames {
            match decoder.decode(frame) {
                Ok(pcm) => audio.push(pcm),
                Err(e) => warn!(session_id = self.session_id, "skip undecodable frame: {}", e),
            }
        }
        debug!(
            session_id = self.session_id,
            "transcribing {} frames",
            audio.len()
        );
        let stream = tokio::select! {
            biased;
            _ = self.token.cancelled() => return Err(self.cancelled()),
            stream = self.providers.asr.transcribe(&self.session_id, audio, self.token.clone()) => stream?,
        };
        tokio::select! {
            biased;
            _ = self.token.cancelled() => Err(self.cancelled()),
            transcript = collect_transcript(stream) => transcript,
        }
    }

    async fn farewell(&self) -> Result<TurnOutcome> {
        info!(session_id = self.session_id, "exit phrase, closing after farewell");
        if let Err(e) = self.speak_text(&self.config.exit_reply).await {
            if self.token.is_cancelled() {
                return Err(e);
            }
            warn!(session_id = self.session_id, "farewell speech failed: {}", e);
        }
        Ok(TurnOutcome {
            reply: None,
            close_after: true,
        })
    }

    async fn chat(&self, text: String, context: Option<String>) -> Result<TurnOutcome> {
        self.emit(TurnEvent::UserTurn(text.clone()));
        let memory = match &self.providers.memory {
            Some(memory) => memory
                .query(&self.device_id, &text, self.config.memory_top_k)
                .await
                .unwrap_or_else(|e| {
                    warn!(session_id = self.session_id, "memory query failed: {}", e);
                    vec![]
                }),
            None => vec![],
        };
        let mut dialogue = self.dialogue.clone();
        dialogue.put(Message::user(text));
        let messages = dialogue.llm_messages(&memory, context.as_deref());

        self.emit(TurnEvent::Phase(SessionPhase::Thinking));
        let stream = tokio::select! {
            biased;
            _ = self.token.cancelled() => return Err(self.cancelled()),
            stream = self.providers.llm.chat_stream(&self.session_id, messages, self.token.clone()) => stream?,
        };
        let (sentence_tx, sentence_rx) = mpsc::unbounded_channel();
        let (reply, spoken) = tokio::join!(
            self.generate(stream, sentence_tx),
            self.speak_sentences(sentence_rx)
        );
        let reply = reply?;
        spoken?;
        if reply.is_empty() {
            return Err(anyhow!("llm returned an empty reply"));
        }
        Ok(TurnOutcome {
            reply: Some(reply),
            close_after: false,
        })
    }

    /// Pull deltas from the LLM and forward each completed sentence.
    async fn generate(
        &self,
        mut stream: BoxStream<'static, Result<String>>,
        sentences: mpsc::UnboundedSender<String>,
    ) -> Result<String> {
        let mut segmenter = SentenceSegmenter::new();
        let mut reply = String::new();
        loop {
            let chunk = tokio::select! {
                biased;
                _ = self.token.cancelled() => return Err(self.cancelled()),
                chunk = stream.next() => chunk,
            };
            let Some(chunk) = chunk else {
                break;
            };
            let chunk = chunk?;
            reply.push_str(&chunk);
            for sentence in segmenter.push(&chunk) {
                queue_sentence(&sentences, &sentence);
            }
        }
        if let Some(rest) = segmenter.finish() {
            queue_sentence(&sentences, &rest);
        }
        let reply = reply.trim().to_string();
        if !reply.is_empty() {
            self.emit(TurnEvent::Control(ServerMessage::Llm {
                text: reply.clone(),
                emotion: None,
            }));
        }
        Ok(reply)
    }

    async fn speak_text(&self, text: &str) -> Result<()> {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut segmenter = SentenceSegmenter::new();
        for sentence in segmenter.push(text) {
            queue_sentence(&tx, &sentence);
        }
        if let Some(rest) = segmenter.finish() {
            queue_sentence(&tx, &rest);
        }
        drop(tx);
        self.speak_sentences(rx).await
    }

    /// Synthesize sentences one after another, in the order they were queued.
    async fn speak_sentences(&self, mut sentences: mpsc::UnboundedReceiver<String>) -> Result<()> {
        loop {
            let sentence = tokio::select! {
                biased;
                _ = self.token.cancelled() => return Err(self.cancelled()),
                sentence = sentences.recv() => sentence,
            };
            let Some(sentence) = sentence else {
                return Ok(());
            };
            if !self.speaking.swap(true, Ordering::Relaxed) {
                self.emit(TurnEvent::Control(ServerMessage::tts(TtsState::Start, None)));
                self.emit(TurnEvent::Phase(SessionPhase::Speaking));
            }
            self.emit(TurnEvent::Control(ServerMessage::tts(
                TtsState::SentenceStart,
                Some(&sentence),
            )));
            if let Err(e) = self.synthesize(&sentence).await {
                if self.token.is_cancelled() {
                    return Err(e);
                }
                warn!(
                    session_id = self.session_id,
                    "synthesis failed for {:?}: {}",
                    sentence,
                    e
                );
            }
            self.emit(TurnEvent::Control(ServerMessage::tts(
                TtsState::SentenceEnd,
                Some(&sentence),
            )));
        }
    }

    async fn synthesize(&self, sentence: &str) -> Result<()> {
        let mut stream = tokio::select! {
            biased;
            _ = self.token.cancelled() => return Err(self.cancelled()),
            stream = self.providers.tts.synthesize(&self.session_id, sentence, self.token.clone()) => stream?,
        };
        let mut pending: Vec<u8> = Vec::new();
        let result = loop {
            let event = tokio::select! {
                biased;
                _ = self.token.cancelled() => return Err(self.cancelled()),
                event = stream.next() => event,
            };
            match event {
                None | Some(Ok(SynthesisEvent::Finished)) => break Ok(()),
                Some(Ok(SynthesisEvent::AudioChunk(bytes))) => {
                    pending.extend_from_slice(&bytes);
                    while pending.len() >= OUT_FRAME_BYTES {
                        let frame: Vec<u8> = pending.drain(..OUT_FRAME_BYTES).collect();
                        self.emit(TurnEvent::Audio(frame));
                    }
                }
                Some(Err(e)) => break Err(e),
            }
        };
        if !pending.is_empty() {
            self.emit(TurnEvent::Audio(pending));
        }
        result
    }
}

fn queue_sentence(sentences: &mpsc::UnboundedSender<String>, sentence: &str) {
    let sentence = sentence.trim();
    if is_speakable(sentence) {
        sentences.send(sentence.to_string()).ok();
    }
}
