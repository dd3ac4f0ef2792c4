//! Pretrained models behind the frame processor.
//!
//! [`ModelRegistry`] owns the four handles (segmentation model, caption
//! model, caption image processor, caption tokenizer) and builds them at most
//! once per registry. The caption package is pulled from the Hugging Face hub
//! and cached locally by `hf-hub`; the segmentation graph is read from the
//! configured model directory.

mod mask_rcnn;
mod vit_gpt2;

pub use mask_rcnn::{Detection, MaskRcnn};
pub use vit_gpt2::{
    decode_caption, greedy_decode, Captioner, GenerationSettings, ImageProcessor, VitGpt2,
    MAX_LENGTH,
};

use crate::{config::ModelConfig, frame::RgbFrame, processor::ProcessingError};
use hf_hub::api::sync::{Api, ApiError};
use parking_lot::Mutex;
use std::{
    path::PathBuf,
    sync::{Arc, OnceLock},
};
use thiserror::Error;
use tokenizers::Tokenizer;

/// ONNX export of `nlpconnect/vit-gpt2-image-captioning`.
pub const CAPTION_MODEL_ID: &str = "Xenova/vit-gpt2-image-captioning";

const ENCODER_FILE: &str = "onnx/encoder_model.onnx";
const DECODER_FILE: &str = "onnx/decoder_model.onnx";
const TOKENIZER_FILE: &str = "tokenizer.json";
const PREPROCESSOR_FILE: &str = "preprocessor_config.json";
const GENERATION_FILE: &str = "generation_config.json";

#[derive(Error, Debug)]
pub enum ModelError {
    #[error("Failed to reach the model hub: {0}")]
    HubUnavailable(#[source] ApiError),
    #[error("Failed to fetch `{file}` from the model hub: {source}")]
    Fetch {
        file: &'static str,
        #[source]
        source: ApiError,
    },
    #[error("Model file not found: {0:?}")]
    MissingFile(PathBuf),
    #[error("ONNX Runtime error: {0}")]
    Ort(#[from] ort::Error),
    #[error("Model `{model}` has an unexpected signature: {detail}")]
    Signature { model: &'static str, detail: String },
    #[error("Failed to read {path:?}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("Invalid model configuration {path:?}: {source}")]
    Json {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
    #[error("Failed to load tokenizer: {0}")]
    Tokenizer(String),
    #[error("Model initialization task failed: {0}")]
    Join(String),
}

pub trait InstanceSegmenter: Send + Sync + 'static {
    fn segment(&self, frame: &RgbFrame) -> Result<Vec<Detection>, ProcessingError>;
}

pub trait ImageCaptioner: Send + Sync + 'static {
    fn caption(&self, frame: &RgbFrame) -> Result<String, ProcessingError>;
}

/// Write-once cell: the first successful initializer wins and every later
/// call returns the same value without running its initializer.
pub struct OnceRegistry<T> {
    cell: OnceLock<T>,
    init_lock: Mutex<()>,
}

impl<T> Default for OnceRegistry<T> {
    fn default() -> Self {
        Self {
            cell: OnceLock::new(),
            init_lock: Mutex::new(()),
        }
    }
}

impl<T> OnceRegistry<T> {
    pub fn get(&self) -> Option<&T> {
        self.cell.get()
    }

    pub fn get_or_try_init<E>(&self, init: impl FnOnce() -> Result<T, E>) -> Result<&T, E> {
        if let Some(value) = self.cell.get() {
            return Ok(value);
        }

        let _guard = self.init_lock.lock();
        if let Some(value) = self.cell.get() {
            return Ok(value);
        }
        let value = init()?;
        Ok(self.cell.get_or_init(|| value))
    }
}

/// The loaded handles. Each is shared read-only for the process lifetime.
pub struct Models {
    segmenter: Arc<MaskRcnn>,
    caption_model: Arc<VitGpt2>,
    image_processor: Arc<ImageProcessor>,
    tokenizer: Arc<Tokenizer>,
}

impl Models {
    fn load(settings: &ModelConfig) -> Result<Self, ModelError> {
        let segmentation_path = settings.segmentation_model_path();
        if !segmentation_path.exists() {
            return Err(ModelError::MissingFile(segmentation_path));
        }
        let segmenter = MaskRcnn::load(&segmentation_path, settings.intra_threads)?;

        let api = Api::new().map_err(ModelError::HubUnavailable)?;
        let repo = api.model(CAPTION_MODEL_ID.to_string());
        let fetch = |file: &'static str| {
            tracing::info!("Resolving {}/{}", CAPTION_MODEL_ID, file);
            repo.get(file)
                .map_err(|source| ModelError::Fetch { file, source })
        };

        let encoder_path = fetch(ENCODER_FILE)?;
        let decoder_path = fetch(DECODER_FILE)?;
        let generation = GenerationSettings::from_file(&fetch(GENERATION_FILE)?)?;
        let caption_model = VitGpt2::load(
            &encoder_path,
            &decoder_path,
            generation,
            settings.intra_threads,
        )?;

        let image_processor = ImageProcessor::from_file(&fetch(PREPROCESSOR_FILE)?)?;

        let tokenizer = Tokenizer::from_file(fetch(TOKENIZER_FILE)?)
            .map_err(|e| ModelError::Tokenizer(e.to_string()))?;
        tracing::info!(
            "Loaded tokenizer with {} tokens",
            tokenizer.get_vocab_size(true)
        );

        Ok(Self {
            segmenter: Arc::new(segmenter),
            caption_model: Arc::new(caption_model),
            image_processor: Arc::new(image_processor),
            tokenizer: Arc::new(tokenizer),
        })
    }

    pub fn segmenter(&self) -> Arc<MaskRcnn> {
        self.segmenter.clone()
    }

    pub fn captioner(&self) -> Captioner {
        Captioner::new(
            self.caption_model.clone(),
            self.image_processor.clone(),
            self.tokenizer.clone(),
        )
    }
}

pub struct ModelRegistry {
    settings: ModelConfig,
    models: OnceRegistry<Models>,
}

impl ModelRegistry {
    pub fn new(settings: ModelConfig) -> Self {
        Self {
            settings,
            models: OnceRegistry::default(),
        }
    }

    /// Loads every model on the first call; later calls return the same handles.
    pub fn models(&self) -> Result<&Models, ModelError> {
        self.models.get_or_try_init(|| {
            tracing::info!("Loading models");
            let started = std::time::Instant::now();
            let models = Models::load(&self.settings)?;
            tracing::info!("Models loaded in {:.2?}", started.elapsed());
            Ok(models)
        })
    }

    pub fn is_initialized(&self) -> bool {
        self.models.get().is_some()
    }
}
