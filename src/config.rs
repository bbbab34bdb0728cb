use crate::{
    intent::{IntentOption, IntentType},
    llm::{LlmOption, LlmType},
    memory::MemoryType,
    registry::TemplateFunction,
    synthesis::{SynthesisOption, SynthesisType},
    transcription::{TranscriptionOption, TranscriptionType},
    vad::{VadOption, VadType},
};
use anyhow::{Error, Result};
use clap::Parser;
use serde::{Deserialize, Serialize};
use std::time::Duration;

#[derive(Parser, Debug)]
#[command(version)]
pub struct Cli {
    #[clap(long, default_value = "voxgate.toml")]
    pub conf: Option<String>,
}

fn default_config_http_addr() -> String {
    "0.0.0.0:8000".to_string()
}
fn default_config_ws_path() -> String {
    "/voxgate/v1/".to_string()
}
fn default_close_connection_no_voice_time() -> u64 {
    120
}
fn default_min_utterance_frames() -> usize {
    15
}
fn default_greeting_text() -> String {
    "Hi, I'm listening.".to_string()
}
fn default_exit_reply() -> String {
    "Goodbye!".to_string()
}
fn default_tts_fallback_text() -> String {
    "Sorry, something went wrong. Please say that again.".to_string()
}
fn default_exit_commands() -> Vec<String> {
    vec![
        "goodbye".to_string(),
        "bye bye".to_string(),
        "退出".to_string(),
        "再见".to_string(),
    ]
}
fn default_prompt() -> String {
    "You are a friendly voice assistant. Answer briefly in plain spoken sentences.".to_string()
}
fn default_memory_top_k() -> usize {
    3
}

/// Provider names chosen per family, resolved by the `StreamEngine`.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct SelectedModule {
    pub vad: VadType,
    pub asr: TranscriptionType,
    pub llm: LlmType,
    pub tts: SynthesisType,
    pub intent: IntentType,
    pub memory: MemoryType,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Config {
    #[serde(default = "default_config_http_addr")]
    pub http_addr: String,
    #[serde(default = "default_config_ws_path")]
    pub ws_path: String,
    pub log_level: Option<String>,
    pub log_file: Option<String>,
    #[serde(default)]
    pub selected_module: SelectedModule,
    #[serde(default)]
    pub vad: VadOption,
    #[serde(default)]
    pub asr: TranscriptionOption,
    #[serde(default)]
    pub tts: SynthesisOption,
    #[serde(default)]
    pub llm: LlmOption,
    #[serde(default)]
    pub intent: IntentOption,
    /// Extra template handlers added to the function registry.
    #[serde(default)]
    pub functions: Vec<TemplateFunction>,
    #[serde(default = "default_prompt")]
    pub prompt: String,
    /// Seconds; the session closes after this plus 60s without voice or text.
    #[serde(default = "default_close_connection_no_voice_time")]
    pub close_connection_no_voice_time: u64,
    #[serde(default = "default_exit_commands")]
    pub exit_commands: Vec<String>,
    #[serde(default = "default_min_utterance_frames")]
    pub min_utterance_frames: usize,
    /// Speak `greeting_text` after the client's hello.
    #[serde(default)]
    pub enable_greeting: bool,
    #[serde(default = "default_greeting_text")]
    pub greeting_text: String,
    /// Spoken before closing on an exit phrase.
    #[serde(default = "default_exit_reply")]
    pub exit_reply: String,
    #[serde(default = "default_tts_fallback_text")]
    pub tts_fallback_text: String,
    #[serde(default = "default_memory_top_k")]
    pub memory_top_k: usize,
    /// Shared Deepgram key for whichever families select deepgram.
    pub deepgram_api_key: Option<String>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            http_addr: default_config_http_addr(),
            ws_path: default_config_ws_path(),
            log_level: None,
            log_file: None,
            selected_module: SelectedModule::default(),
            vad: VadOption::default(),
            asr: TranscriptionOption::default(),
            tts: SynthesisOption::default(),
            llm: LlmOption::default(),
            intent: IntentOption::default(),
            functions: Vec::new(),
            prompt: default_prompt(),
            close_connection_no_voice_time: default_close_connection_no_voice_time(),
            exit_commands: default_exit_commands(),
            min_utterance_frames: default_min_utterance_frames(),
            enable_greeting: false,
            greeting_text: default_greeting_text(),
            exit_reply: default_exit_reply(),
            tts_fallback_text: default_tts_fallback_text(),
            memory_top_k: default_memory_top_k(),
            deepgram_api_key: None,
        }
    }
}

impl Config {
    pub fn load(path: &str) -> Result<Self, Error> {
        let config = toml::from_str(
            &std::fs::read_to_string(path).map_err(|e| anyhow::anyhow!("{}: {}", e, path))?,
        )?;
        Ok(config)
    }

    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.close_connection_no_voice_time + 60)
    }

    /// ASR options with the shared deepgram key applied.
    pub fn asr_option(&self) -> TranscriptionOption {
        let mut option = self.asr.clone();
        if self.selected_module.asr == TranscriptionType::Deepgram && option.secret_key.is_none() {
            option.secret_key = self.deepgram_api_key.clone();
        }
        option
    }

    /// TTS options with the shared deepgram key applied.
    pub fn tts_option(&self) -> SynthesisOption {
        let mut option = self.tts.clone();
        if self.selected_module.tts == SynthesisType::Deepgram && option.secret_key.is_none() {
            option.secret_key = self.deepgram_api_key.clone();
        }
        option
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_config_dump() {
        let config = Config::default();
        let config_str = toml::to_string(&config).unwrap();
        let parsed: Config = toml::from_str(&config_str).unwrap();
        assert_eq!(parsed.ws_path, config.ws_path);
        assert_eq!(parsed.min_utterance_frames, 15);
        assert_eq!(parsed.selected_module.vad, VadType::Energy);
    }

    #[test]
    fn test_config_load() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            r#"
http_addr = "127.0.0.1:9000"
log_level = "debug"
close_connection_no_voice_time = 30
exit_commands = ["stop talking"]
deepgram_api_key = "dg-key"

[selected_module]
asr = "deepgram"
tts = "deepgram"
memory = "local"

[vad]
threshold_high = 0.6
min_silence_duration_ms = 700

[llm]
model = "qwen-plus"
baseUrl = "http://localhost:11434/v1"

[[intent.rules]]
intent = "timer"
keywords = ["timer"]

[[functions]]
name = "timer"
action = "response"
template = "Timer set for {{minutes|a few}} minutes."
"#
        )
        .unwrap();

        let config = Config::load(file.path().to_str().unwrap()).unwrap();
        assert_eq!(config.http_addr, "127.0.0.1:9000");
        assert_eq!(config.ws_path, "/voxgate/v1/");
        assert_eq!(config.idle_timeout(), Duration::from_secs(90));
        assert_eq!(config.exit_commands, vec!["stop talking"]);
        assert_eq!(config.selected_module.asr, TranscriptionType::Deepgram);
        assert_eq!(config.selected_module.memory, MemoryType::Local);
        assert_eq!(config.selected_module.llm, LlmType::OpenAi);
        assert_eq!(config.vad.threshold_high, 0.6);
        assert_eq!(config.vad.threshold_low, 0.2);
        assert_eq!(config.vad.min_silence_duration_ms, 700);
        assert_eq!(config.llm.base_url.as_deref(), Some("http://localhost:11434/v1"));
        assert_eq!(config.intent.rules[0].intent, "timer");
        assert_eq!(config.functions[0].name, "timer");
        assert_eq!(config.asr_option().secret_key.as_deref(), Some("dg-key"));
        assert_eq!(config.tts_option().secret_key.as_deref(), Some("dg-key"));
    }

    #[test]
    fn test_missing_file_names_path() {
        let err = Config::load("/nonexistent/voxgate.toml").unwrap_err();
        assert!(err.to_string().contains("/nonexistent/voxgate.toml"));
    }
}
