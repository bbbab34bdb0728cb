use crate::{
    config::Config,
    intent::{IntentOption, IntentRecognizer, IntentType, KeywordIntent, NoIntent},
    llm::{LlmClient, LlmOption, LlmType, OpenAiClient},
    memory::{LocalMemory, MemoryProvider, MemoryType},
    registry::{FunctionHandler, FunctionRegistry},
    synthesis::{
        DeepgramTtsClient, DoubaoTtsClient, SynthesisClient, SynthesisOption, SynthesisType,
    },
    transcription::{
        DeepgramAsrClient, DoubaoAsrClient, TranscriptionClient, TranscriptionOption,
        TranscriptionType,
    },
    vad::{VadDetector, VadOption, VadType},
};
use anyhow::{Result, anyhow};
use std::{collections::HashMap, sync::Arc};
use tracing::{debug, info};

pub type FnCreateVad = Box<dyn Fn(&VadOption) -> Result<Arc<VadDetector>> + Send + Sync>;
pub type FnCreateAsrClient =
    Box<dyn Fn(&TranscriptionOption) -> Result<Arc<dyn TranscriptionClient>> + Send + Sync>;
pub type FnCreateTtsClient =
    Box<dyn Fn(&SynthesisOption) -> Result<Arc<dyn SynthesisClient>> + Send + Sync>;
pub type FnCreateLlmClient = Box<dyn Fn(&LlmOption) -> Result<Arc<dyn LlmClient>> + Send + Sync>;
pub type FnCreateIntent =
    Box<dyn Fn(&IntentOption, &[String]) -> Result<Arc<dyn IntentRecognizer>> + Send + Sync>;

/// Everything one session needs from the outside world.
#[derive(Clone)]
pub struct SessionProviders {
    pub vad: Arc<VadDetector>,
    pub asr: Arc<dyn TranscriptionClient>,
    pub tts: Arc<dyn SynthesisClient>,
    pub llm: Arc<dyn LlmClient>,
    pub intent: Arc<dyn IntentRecognizer>,
    pub memory: Option<Arc<dyn MemoryProvider>>,
    pub functions: Arc<FunctionRegistry>,
}

/// Provider registry built once at startup. Sessions ask it for a fresh
/// provider set according to `selected_module`.
pub struct StreamEngine {
    vad_creators: HashMap<VadType, FnCreateVad>,
    asr_creators: HashMap<TranscriptionType, FnCreateAsrClient>,
    tts_creators: HashMap<SynthesisType, FnCreateTtsClient>,
    llm_creators: HashMap<LlmType, FnCreateLlmClient>,
    intent_creators: HashMap<IntentType, FnCreateIntent>,
    /// Memory outlives sessions, so instances are registered rather than creators.
    memories: HashMap<MemoryType, Arc<dyn MemoryProvider>>,
    functions: Arc<FunctionRegistry>,
}

impl Default for StreamEngine {
    fn default() -> Self {
        let mut engine = Self::new();
        engine.register_vad(VadType::Energy, Box::new(VadDetector::create_energy));
        #[cfg(feature = "vad_webrtc")]
        engine.register_vad(VadType::WebRtc, Box::new(VadDetector::create_webrtc));
        engine.register_asr(TranscriptionType::Doubao, Box::new(DoubaoAsrClient::create));
        engine.register_asr(
            TranscriptionType::Deepgram,
            Box::new(DeepgramAsrClient::create),
        );
        engine.register_tts(SynthesisType::Doubao, Box::new(DoubaoTtsClient::create));
        engine.register_tts(SynthesisType::Deepgram, Box::new(DeepgramTtsClient::create));
        engine.register_llm(LlmType::OpenAi, Box::new(OpenAiClient::create));
        engine.register_intent(IntentType::Keyword, Box::new(KeywordIntent::create));
        engine.register_intent(IntentType::NoIntent, Box::new(NoIntent::create));
        if let Ok(memory) = LocalMemory::create() {
            engine.register_memory(MemoryType::Local, memory);
        }
        engine.functions = Arc::new(FunctionRegistry::with_defaults());
        engine
    }
}

impl StreamEngine {
    pub fn new() -> Self {
        Self {
            vad_creators: HashMap::new(),
            asr_creators: HashMap::new(),
            tts_creators: HashMap::new(),
            llm_creators: HashMap::new(),
            intent_creators: HashMap::new(),
            memories: HashMap::new(),
            functions: Arc::new(FunctionRegistry::new()),
        }
    }

    pub fn register_vad(&mut self, vad_type: VadType, creator: FnCreateVad) -> &mut Self {
        self.vad_creators.insert(vad_type, creator);
        self
    }

    pub fn register_asr(
        &mut self,
        asr_type: TranscriptionType,
        creator: FnCreateAsrClient,
    ) -> &mut Self {
        self.asr_creators.insert(asr_type, creator);
        self
    }

    pub fn register_tts(
        &mut self,
        tts_type: SynthesisType,
        creator: FnCreateTtsClient,
    ) -> &mut Self {
        self.tts_creators.insert(tts_type, creator);
        self
    }

    pub fn register_llm(&mut self, llm_type: LlmType, creator: FnCreateLlmClient) -> &mut Self {
        self.llm_creators.insert(llm_type, creator);
        self
    }

    pub fn register_intent(
        &mut self,
        intent_type: IntentType,
        creator: FnCreateIntent,
    ) -> &mut Self {
        self.intent_creators.insert(intent_type, creator);
        self
    }

    pub fn register_memory(
        &mut self,
        memory_type: MemoryType,
        memory: Arc<dyn MemoryProvider>,
    ) -> &mut Self {
        self.memories.insert(memory_type, memory);
        self
    }

    pub fn register_function(&mut self, handler: Arc<dyn FunctionHandler>) -> &mut Self {
        Arc::make_mut(&mut self.functions).register(handler);
        self
    }

    pub fn functions(&self) -> Arc<FunctionRegistry> {
        self.functions.clone()
    }

    pub fn create_vad(&self, vad_type: &VadType, option: &VadOption) -> Result<Arc<VadDetector>> {
        match self.vad_creators.get(vad_type) {
            Some(creator) => creator(option),
            None => Err(anyhow!("VAD type not found: {}", vad_type)),
        }
    }

    pub fn create_asr_client(
        &self,
        asr_type: &TranscriptionType,
        option: &TranscriptionOption,
    ) -> Result<Arc<dyn TranscriptionClient>> {
        match self.asr_creators.get(asr_type) {
            Some(creator) => creator(option),
            None => Err(anyhow!("ASR type not found: {}", asr_type)),
        }
    }

    pub fn create_tts_client(
        &self,
        tts_type: &SynthesisType,
        option: &SynthesisOption,
    ) -> Result<Arc<dyn SynthesisClient>> {
        match self.tts_creators.get(tts_type) {
            Some(creator) => creator(option),
            None => Err(anyhow!("TTS type not found: {}", tts_type)),
        }
    }

    pub fn create_llm_client(
        &self,
        llm_type: &LlmType,
        option: &LlmOption,
    ) -> Result<Arc<dyn LlmClient>> {
        match self.llm_creators.get(llm_type) {
            Some(creator) => creator(option),
            None => Err(anyhow!("LLM type not found: {}", llm_type)),
        }
    }

    pub fn create_intent(
        &self,
        intent_type: &IntentType,
        option: &IntentOption,
        exit_commands: &[String],
    ) -> Result<Arc<dyn IntentRecognizer>> {
        match self.intent_creators.get(intent_type) {
            Some(creator) => creator(option, exit_commands),
            None => Err(anyhow!("Intent type not found: {}", intent_type)),
        }
    }

    pub fn memory(&self, memory_type: &MemoryType) -> Result<Option<Arc<dyn MemoryProvider>>> {
        if *memory_type == MemoryType::NoMemory {
            return Ok(None);
        }
        self.memories
            .get(memory_type)
            .cloned()
            .map(Some)
            .ok_or_else(|| anyhow!("Memory type not found: {}", memory_type))
    }

    /// Resolve `selected_module` into one provider set for a new session.
    pub fn create_providers(&self, config: &Config) -> Result<SessionProviders> {
        let selected = &config.selected_module;
        let providers = SessionProviders {
            vad: self.create_vad(&selected.vad, &config.vad)?,
            asr: self.create_asr_client(&selected.asr, &config.asr_option())?,
            tts: self.create_tts_client(&selected.tts, &config.tts_option())?,
            llm: self.create_llm_client(&selected.llm, &config.llm)?,
            intent: self.create_intent(&selected.intent, &config.intent, &config.exit_commands)?,
            memory: self.memory(&selected.memory)?,
            functions: self.functions.clone(),
        };
        debug!(
            vad = %selected.vad,
            asr = %selected.asr,
            tts = %selected.tts,
            llm = %selected.llm,
            intent = %selected.intent,
            memory = %selected.memory,
            "session providers created"
        );
        Ok(providers)
    }

    /// Add the template handlers declared in the config.
    pub fn load_functions(&mut self, config: &Config) -> &mut Self {
        for function in &config.functions {
            info!("registering function {}", function.name);
            self.register_function(Arc::new(function.clone()));
        }
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::{Action, TemplateFunction};

    #[test]
    fn test_default_engine_resolves_default_config() {
        let engine = StreamEngine::default();
        let providers = engine.create_providers(&Config::default()).unwrap();
        assert_eq!(providers.asr.provider(), TranscriptionType::Doubao);
        assert_eq!(providers.tts.provider(), SynthesisType::Doubao);
        assert_eq!(providers.llm.provider(), LlmType::OpenAi);
        assert!(providers.memory.is_none());
        assert!(providers.functions.contains("weather"));
    }

    #[test]
    fn test_unknown_provider_is_an_error() {
        let engine = StreamEngine::default();
        let mut config = Config::default();
        config.selected_module.asr = TranscriptionType::Other("whisper".to_string());
        let err = engine.create_providers(&config).err().unwrap();
        assert!(err.to_string().contains("whisper"));

        let mut config = Config::default();
        config.selected_module.memory = MemoryType::Other("mem0".to_string());
        assert!(engine.create_providers(&config).is_err());
    }

    #[test]
    fn test_webrtc_vad_is_available_with_its_feature() {
        let engine = StreamEngine::default();
        let mut config = Config::default();
        config.selected_module.vad = VadType::WebRtc;
        let created = engine.create_providers(&config);
        assert_eq!(created.is_ok(), cfg!(feature = "vad_webrtc"));
    }

    #[test]
    fn test_memory_is_shared_across_sessions() {
        let engine = StreamEngine::default();
        let mut config = Config::default();
        config.selected_module.memory = MemoryType::Local;
        let a = engine.create_providers(&config).unwrap().memory.unwrap();
        let b = engine.create_providers(&config).unwrap().memory.unwrap();
        assert!(Arc::ptr_eq(&a, &b));
    }

    #[test]
    fn test_load_functions_extends_registry() {
        let mut engine = StreamEngine::default();
        let mut config = Config::default();
        config.functions.push(TemplateFunction::new(
            "timer",
            Action::Response,
            "Timer set.",
        ));
        engine.load_functions(&config);
        assert!(engine.functions().contains("timer"));
        assert!(engine.functions().contains("play_music"));
    }
}
