//! # Whisper Model
//!
//! Loads a Whisper checkpoint with Candle-rs and exposes it as an
//! [`InferenceEngine`] for the transcription worker.
//!
//! ## Model Loading Process:
//! 1. Resolve `config.json`, `tokenizer.json` and `model.safetensors`, either
//!    from a local directory or from the HuggingFace cache (downloading if needed)
//! 2. Load tokenizer, configuration and mel filters
//! 3. Map the weights onto the selected device
//!
//! ## Decoding:
//! Every call sees exactly one 30 second window. The decoder prefix is
//! `<|startofprev|> prompt.. <|startoftranscript|> <|lang|> <|transcribe|> <|notimestamps|>`
//! and tokens are picked greedily until end-of-text or the token limit, so
//! each call produces a single segment.

use crate::transcription::engine::{DecodeOptions, InferenceEngine, Transcript};
use crate::transcription::mel;
use anyhow::{anyhow, Result};
use candle_core::{Device, IndexOp, Tensor, D};
use candle_nn::VarBuilder;
use candle_transformers::models::whisper::{self as m, Config};
use std::path::{Path, PathBuf};
use tokenizers::Tokenizer;

const START_OF_PREV_TOKEN: &str = "<|startofprev|>";

/// Sample rate every window must already be in.
pub const ENGINE_SAMPLE_RATE: u32 = m::SAMPLE_RATE as u32;

/// Longest window one call can see; older audio is cut off.
pub const ENGINE_WINDOW_MS: u64 = m::CHUNK_LENGTH as u64 * 1000;

/// Language codes with a `<|code|>` token in the multilingual vocabulary.
const LANGUAGES: &[&str] = &[
    "en", "zh", "de", "es", "ru", "ko", "fr", "ja", "pt", "tr", "pl", "ca", "nl", "ar", "sv", "it", "id", "hi",
    "fi", "vi", "he", "uk", "el", "ms", "cs", "ro", "da", "hu", "ta", "no", "th", "ur", "hr", "bg", "lt", "la",
    "mi", "ml", "cy", "sk", "te", "fa", "lv", "bn", "sr", "az", "sl", "kn", "et", "mk", "br", "eu", "is", "hy",
    "ne", "mn", "bs", "kk", "sq", "sw", "gl", "mr", "pa", "si", "km", "sn", "yo", "so", "af", "oc", "ka", "be",
    "tg", "sd", "gu", "am", "yi", "lo", "uz", "fo", "ht", "ps", "tk", "nn", "mt", "sa", "lb", "my", "bo", "tl",
    "mg", "as", "tt", "haw", "ln", "ha", "ba", "jw", "su",
];

/// Whether `code` names a language Whisper can be forced to decode.
pub fn is_supported_language(code: &str) -> bool {
    LANGUAGES.contains(&code)
}

/// Available Whisper model sizes.
///
/// ## Trade-offs:
/// - **Size vs Accuracy**: Larger models are more accurate but slower
/// - **Memory vs Speed**: Each inference holds the whole worker, so a slow
///   model delays every open session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
pub enum ModelSize {
    Tiny,
    Base,
    Small,
    Medium,
    Large,
}

impl ModelSize {
    /// Get the HuggingFace model repository name.
    pub fn repo_name(&self) -> &'static str {
        match self {
            ModelSize::Tiny => "openai/whisper-tiny",
            ModelSize::Base => "openai/whisper-base",
            ModelSize::Small => "openai/whisper-small",
            ModelSize::Medium => "openai/whisper-medium",
            ModelSize::Large => "openai/whisper-large-v2",
        }
    }
}

impl std::str::FromStr for ModelSize {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "tiny" => Ok(ModelSize::Tiny),
            "base" => Ok(ModelSize::Base),
            "small" => Ok(ModelSize::Small),
            "medium" => Ok(ModelSize::Medium),
            "large" => Ok(ModelSize::Large),
            _ => Err(anyhow!("Unknown model size: {}", s)),
        }
    }
}

impl std::fmt::Display for ModelSize {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            ModelSize::Tiny => "tiny",
            ModelSize::Base => "base",
            ModelSize::Small => "small",
            ModelSize::Medium => "medium",
            ModelSize::Large => "large",
        };
        write!(f, "{}", name)
    }
}

/// Token ids that frame every decode.
#[derive(Debug, Clone, Copy)]
struct SpecialTokens {
    sot: u32,
    eot: u32,
    transcribe: u32,
    no_timestamps: u32,
    start_of_prev: u32,
    /// Token of the configured decoding language
    language: u32,
}

/// A loaded Whisper model ready for transcription.
///
/// Owned by the worker thread; never shared.
pub struct WhisperModel {
    model: m::model::Whisper,
    config: Config,
    device: Device,
    tokenizer: Tokenizer,
    mel_filters: Vec<f32>,
    special: SpecialTokens,
    language: String,
}

impl WhisperModel {
    /// Download (or reuse the cached copy of) a model from HuggingFace and load it.
    ///
    /// Honors `HF_TOKEN`, `HF_HUB_CACHE` and `HF_HOME`.
    pub async fn load(size: ModelSize, language: &str, device: Device) -> Result<Self> {
        use hf_hub::api::tokio::ApiBuilder;

        tracing::info!("Loading Whisper {} model from {}", size, size.repo_name());
        tracing::debug!("  HF_TOKEN: {:?}", std::env::var("HF_TOKEN").map(|_| "***SET***"));
        tracing::debug!("  HF_HUB_CACHE: {:?}", std::env::var("HF_HUB_CACHE"));

        let mut builder = ApiBuilder::new()
            .with_token(std::env::var("HF_TOKEN").ok())
            .with_progress(false);

        if let Ok(cache_dir) = std::env::var("HF_HUB_CACHE") {
            builder = builder.with_cache_dir(cache_dir.into());
        } else if let Ok(hf_home) = std::env::var("HF_HOME") {
            builder = builder.with_cache_dir(PathBuf::from(hf_home).join("hub"));
        }

        let api = builder
            .build()
            .map_err(|e| anyhow!("Failed to create HuggingFace API client: {}", e))?;
        let repo = api.model(size.repo_name().to_string());

        let config_file = repo
            .get("config.json")
            .await
            .map_err(|e| anyhow!("Failed to download config.json from {}: {}", size.repo_name(), e))?;
        let tokenizer_file = repo
            .get("tokenizer.json")
            .await
            .map_err(|e| anyhow!("Failed to download tokenizer.json from {}: {}", size.repo_name(), e))?;
        let weights_file = repo
            .get("model.safetensors")
            .await
            .map_err(|e| anyhow!("Failed to download model.safetensors from {}: {}", size.repo_name(), e))?;

        Self::from_files(&config_file, &tokenizer_file, &weights_file, None, language, device)
    }

    /// Load a model from a local directory holding `config.json`,
    /// `tokenizer.json`, `model.safetensors` and optionally `melfilters.bytes`.
    pub fn load_from_dir(dir: &Path, language: &str, device: Device) -> Result<Self> {
        tracing::info!("Loading Whisper model from {}", dir.display());

        Self::from_files(
            &dir.join("config.json"),
            &dir.join("tokenizer.json"),
            &dir.join("model.safetensors"),
            Some(dir),
            language,
            device,
        )
    }

    fn from_files(
        config_file: &Path,
        tokenizer_file: &Path,
        weights_file: &Path,
        mel_dir: Option<&Path>,
        language: &str,
        device: Device,
    ) -> Result<Self> {
        let start_time = std::time::Instant::now();

        if !is_supported_language(language) {
            return Err(anyhow!("Unsupported decoding language: {}", language));
        }

        let config: Config = serde_json::from_reader(std::fs::File::open(config_file)?)?;
        tracing::debug!(
            "Model config: {} mel bins, {} decoder positions",
            config.num_mel_bins,
            config.max_target_positions
        );

        let tokenizer = Tokenizer::from_file(tokenizer_file)
            .map_err(|e| anyhow!("Failed to load tokenizer: {}", e))?;

        let special = SpecialTokens {
            sot: token_id(&tokenizer, m::SOT_TOKEN)?,
            eot: token_id(&tokenizer, m::EOT_TOKEN)?,
            transcribe: token_id(&tokenizer, m::TRANSCRIBE_TOKEN)?,
            no_timestamps: token_id(&tokenizer, m::NO_TIMESTAMPS_TOKEN)?,
            start_of_prev: token_id(&tokenizer, START_OF_PREV_TOKEN)?,
            // English-only checkpoints have no language tokens at all.
            language: token_id(&tokenizer, &format!("<|{}|>", language))?,
        };

        let mel_filters = mel::load_or_compute(mel_dir, config.num_mel_bins, m::SAMPLE_RATE as u32)?;

        let vb = unsafe { VarBuilder::from_mmaped_safetensors(&[weights_file], m::DTYPE, &device)? };
        let model = m::model::Whisper::load(&vb, config.clone())?;

        tracing::info!("Whisper model loaded in {:.2}s", start_time.elapsed().as_secs_f64());

        Ok(Self {
            model,
            config,
            device,
            tokenizer,
            mel_filters,
            special,
            language: language.to_string(),
        })
    }

    /// Log-mel features for one window, shaped `(1, n_mels, N_FRAMES)`.
    fn mel_features(&self, window: &[f32]) -> Result<Tensor> {
        let mut pcm = vec![0.0f32; m::N_SAMPLES];
        let take = window.len().min(m::N_SAMPLES);
        // right-aligned: shorter windows are led by silence
        pcm[m::N_SAMPLES - take..].copy_from_slice(&window[window.len() - take..]);

        let mel = m::audio::pcm_to_mel(&self.config, &pcm, &self.mel_filters);
        let n_mels = self.config.num_mel_bins;
        let frames = mel.len() / n_mels;

        let mel = Tensor::from_vec(mel, (1, n_mels, frames), &self.device)?;
        Ok(mel.narrow(2, 0, frames.min(m::N_FRAMES))?)
    }

    /// Build the decoder prefix. Prompt context is capped so the prefix plus
    /// the generated text still fits the decoder.
    fn prefix(&self, prompt: &[u32], language: &str) -> Result<Vec<u32>> {
        let mut tokens = Vec::with_capacity(prompt.len() + 5);

        let budget = (self.config.max_target_positions / 2).saturating_sub(1);
        if !prompt.is_empty() && budget > 0 {
            let keep = prompt.len().min(budget);
            tokens.push(self.special.start_of_prev);
            tokens.extend_from_slice(&prompt[prompt.len() - keep..]);
        }

        tokens.push(self.special.sot);
        if language == self.language {
            tokens.push(self.special.language);
        } else {
            tokens.push(token_id(&self.tokenizer, &format!("<|{}|>", language))?);
        }
        tokens.push(self.special.transcribe);
        tokens.push(self.special.no_timestamps);
        Ok(tokens)
    }
}

impl InferenceEngine for WhisperModel {
    fn transcribe(&mut self, window: &[f32], prompt: &[u32], options: &DecodeOptions) -> Result<Transcript> {
        let start_time = std::time::Instant::now();

        let mel = self.mel_features(window)?;
        let audio_features = self.model.encoder.forward(&mel, true)?;

        let mut tokens = self.prefix(prompt, &options.language)?;
        let mut output = Vec::new();
        let sample_len = options.max_tokens.min(self.config.max_target_positions / 2);

        for i in 0..sample_len {
            if tokens.len() >= self.config.max_target_positions {
                break;
            }

            let tokens_t = Tensor::new(tokens.as_slice(), &self.device)?.unsqueeze(0)?;
            let ys = self.model.decoder.forward(&tokens_t, &audio_features, i == 0)?;

            let (_, seq_len, _) = ys.dims3()?;
            let logits = self
                .model
                .decoder
                .final_linear(&ys.i((.., seq_len - 1.., ..))?)?
                .i(0)?
                .i(0)?;
            let next_token = logits.argmax(D::Minus1)?.to_scalar::<u32>()?;

            if next_token == self.special.eot {
                break;
            }

            tokens.push(next_token);
            output.push(next_token);
        }

        // timestamp and control tokens sort after end-of-text
        let text_tokens: Vec<u32> = output.into_iter().filter(|t| *t < self.special.eot).collect();
        let text = self
            .tokenizer
            .decode(&text_tokens, true)
            .map_err(|e| anyhow!("Tokenizer decode error: {}", e))?;

        tracing::debug!(
            "Transcribed {:.2}s window in {:.2}s ({} tokens): {:?}",
            window.len() as f64 / m::SAMPLE_RATE as f64,
            start_time.elapsed().as_secs_f64(),
            text_tokens.len(),
            text
        );

        Ok(Transcript {
            segments: vec![text],
            tokens: text_tokens,
        })
    }
}

fn token_id(tokenizer: &Tokenizer, token: &str) -> Result<u32> {
    tokenizer
        .token_to_id(token)
        .ok_or_else(|| anyhow!("Token '{}' not found in vocabulary", token))
}
