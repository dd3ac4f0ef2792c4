use super::{ImageCaptioner, ModelError};
use crate::{frame::RgbFrame, processor::ProcessingError};
use image::imageops::{self, FilterType};
use ndarray::{s, Array2, Array3, Array4, Ix3};
use ort::{
    session::{builder::GraphOptimizationLevel, Session},
    value::TensorRef,
};
use parking_lot::Mutex;
use serde::{de::DeserializeOwned, Deserialize};
use std::{path::Path, sync::Arc};
use tokenizers::Tokenizer;
use tracing::instrument;

/// Upper bound on the generated sequence, decoder start token included.
pub const MAX_LENGTH: usize = 16;

const GPT2_END_OF_TEXT: u32 = 50256;

fn read_json<T: DeserializeOwned>(path: &Path) -> Result<T, ModelError> {
    let contents = std::fs::read_to_string(path).map_err(|source| ModelError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    serde_json::from_str(&contents).map_err(|source| ModelError::Json {
        path: path.to_path_buf(),
        source,
    })
}

#[derive(Debug, Clone, Copy, Deserialize, PartialEq)]
#[serde(untagged)]
pub enum ProcessorSize {
    Square(u32),
    Exact { height: u32, width: u32 },
}

impl ProcessorSize {
    fn dimensions(&self) -> (u32, u32) {
        match *self {
            ProcessorSize::Square(side) => (side, side),
            ProcessorSize::Exact { height, width } => (width, height),
        }
    }
}

fn default_true() -> bool {
    true
}

fn default_size() -> ProcessorSize {
    ProcessorSize::Square(224)
}

fn default_rescale_factor() -> f32 {
    1. / 255.
}

fn default_mean_std() -> [f32; 3] {
    [0.5, 0.5, 0.5]
}

/// ViT feature extraction as described by `preprocessor_config.json`.
#[derive(Debug, Clone, Deserialize)]
pub struct ImageProcessor {
    #[serde(default = "default_true")]
    pub do_resize: bool,
    #[serde(default = "default_size")]
    pub size: ProcessorSize,
    #[serde(default = "default_true")]
    pub do_rescale: bool,
    #[serde(default = "default_rescale_factor")]
    pub rescale_factor: f32,
    #[serde(default = "default_true")]
    pub do_normalize: bool,
    #[serde(default = "default_mean_std")]
    pub image_mean: [f32; 3],
    #[serde(default = "default_mean_std")]
    pub image_std: [f32; 3],
}

impl ImageProcessor {
    pub fn from_file(path: &Path) -> Result<Self, ModelError> {
        let processor: Self = read_json(path)?;
        tracing::info!(
            "Caption image processor: size {:?}, mean {:?}, std {:?}",
            processor.size,
            processor.image_mean,
            processor.image_std
        );
        Ok(processor)
    }

    /// `[1, 3, H, W]` pixel values for the vision encoder.
    pub fn preprocess(&self, frame: &RgbFrame) -> Result<Array4<f32>, ProcessingError> {
        let image = frame.to_rgb_image()?;
        let image = if self.do_resize {
            let (width, height) = self.size.dimensions();
            imageops::resize(&image, width, height, FilterType::Triangle)
        } else {
            image
        };

        let (width, height) = image.dimensions();
        let mut pixel_values = Array4::<f32>::zeros((1, 3, height as usize, width as usize));
        for (x, y, pixel) in image.enumerate_pixels() {
            for c in 0..3 {
                let mut value = pixel[c] as f32;
                if self.do_rescale {
                    value *= self.rescale_factor;
                }
                if self.do_normalize {
                    value = (value - self.image_mean[c]) / self.image_std[c];
                }
                pixel_values[[0, c, y as usize, x as usize]] = value;
            }
        }

        Ok(pixel_values)
    }
}

fn default_end_of_text() -> u32 {
    GPT2_END_OF_TEXT
}

#[derive(Debug, Clone, Copy, Deserialize, PartialEq, Eq)]
pub struct GenerationSettings {
    #[serde(default = "default_end_of_text")]
    pub decoder_start_token_id: u32,
    #[serde(default = "default_end_of_text")]
    pub eos_token_id: u32,
}

impl Default for GenerationSettings {
    fn default() -> Self {
        Self {
            decoder_start_token_id: GPT2_END_OF_TEXT,
            eos_token_id: GPT2_END_OF_TEXT,
        }
    }
}

impl GenerationSettings {
    pub fn from_file(path: &Path) -> Result<Self, ModelError> {
        read_json(path)
    }
}

/// Greedy autoregressive decoding. `next_logits` receives the sequence so far
/// and returns the scores for the following token. The returned sequence
/// starts with `start`, never exceeds `max_length` and ends at the first `eos`.
pub fn greedy_decode<E, F>(
    start: u32,
    eos: u32,
    max_length: usize,
    mut next_logits: F,
) -> Result<Vec<u32>, E>
where
    F: FnMut(&[u32]) -> Result<Vec<f32>, E>,
    E: From<ProcessingError>,
{
    let mut tokens = vec![start];
    while tokens.len() < max_length {
        let logits = next_logits(&tokens)?;
        let next = argmax(&logits)?;
        tokens.push(next);
        if next == eos {
            break;
        }
    }
    Ok(tokens)
}

fn argmax(logits: &[f32]) -> Result<u32, ProcessingError> {
    logits
        .iter()
        .enumerate()
        .max_by(|(_, a), (_, b)| a.total_cmp(b))
        .map(|(index, _)| index as u32)
        .ok_or_else(|| ProcessingError::UnexpectedOutput("empty logits".to_string()))
}

/// Token ids to text, special tokens dropped.
pub fn decode_caption(
    tokenizer: &Tokenizer,
    token_ids: &[u32],
) -> Result<String, ProcessingError> {
    let text = tokenizer
        .decode(token_ids, true)
        .map_err(|e| ProcessingError::Tokenizer(e.to_string()))?;
    Ok(text.trim().to_string())
}

#[derive(Debug, Clone, Copy)]
struct DecoderSignature {
    attention_mask: bool,
    encoder_attention_mask: bool,
}

/// ViT encoder + GPT-2 decoder pair.
pub struct VitGpt2 {
    encoder: Mutex<Session>,
    decoder: Mutex<Session>,
    decoder_signature: DecoderSignature,
    generation: GenerationSettings,
}

fn build_session(path: &Path, intra_threads: usize) -> Result<Session, ModelError> {
    if !path.exists() {
        return Err(ModelError::MissingFile(path.to_path_buf()));
    }
    let session = Session::builder()?
        .with_optimization_level(GraphOptimizationLevel::Level3)?
        .with_intra_threads(intra_threads)?
        .commit_from_file(path)?;
    Ok(session)
}

fn require(
    model: &'static str,
    kind: &str,
    names: &[String],
    wanted: &str,
) -> Result<(), ModelError> {
    if names.iter().any(|name| name == wanted) {
        return Ok(());
    }
    Err(ModelError::Signature {
        model,
        detail: format!("missing {} `{}` (found {:?})", kind, wanted, names),
    })
}

impl VitGpt2 {
    pub fn load(
        encoder_path: &Path,
        decoder_path: &Path,
        generation: GenerationSettings,
        intra_threads: usize,
    ) -> Result<Self, ModelError> {
        let encoder = build_session(encoder_path, intra_threads)?;
        let encoder_outputs: Vec<String> =
            encoder.outputs.iter().map(|o| o.name.clone()).collect();
        require("vit encoder", "output", &encoder_outputs, "last_hidden_state")?;

        let decoder = build_session(decoder_path, intra_threads)?;
        let decoder_inputs: Vec<String> = decoder.inputs.iter().map(|i| i.name.clone()).collect();
        let decoder_outputs: Vec<String> =
            decoder.outputs.iter().map(|o| o.name.clone()).collect();
        require("gpt2 decoder", "input", &decoder_inputs, "input_ids")?;
        require(
            "gpt2 decoder",
            "input",
            &decoder_inputs,
            "encoder_hidden_states",
        )?;
        require("gpt2 decoder", "output", &decoder_outputs, "logits")?;

        let decoder_signature = DecoderSignature {
            attention_mask: decoder_inputs.iter().any(|n| n == "attention_mask"),
            encoder_attention_mask: decoder_inputs.iter().any(|n| n == "encoder_attention_mask"),
        };
        tracing::info!(
            "Loaded caption model (decoder inputs: {:?}, start token {}, eos token {})",
            decoder_inputs,
            generation.decoder_start_token_id,
            generation.eos_token_id
        );

        Ok(Self {
            encoder: Mutex::new(encoder),
            decoder: Mutex::new(decoder),
            decoder_signature,
            generation,
        })
    }

    /// Vision encoder forward pass: `[1, 3, H, W]` to `[1, patches, hidden]`.
    pub fn encode(&self, pixel_values: &Array4<f32>) -> Result<Array3<f32>, ProcessingError> {
        let mut session = self.encoder.lock();
        let input = TensorRef::from_array_view(pixel_values.view())?;
        let outputs = session.run(ort::inputs!["pixel_values" => input])?;
        let hidden = outputs["last_hidden_state"]
            .try_extract_array::<f32>()?
            .into_dimensionality::<Ix3>()?
            .to_owned();
        Ok(hidden)
    }

    fn next_token_logits(
        &self,
        encoder_hidden_states: &Array3<f32>,
        tokens: &[u32],
    ) -> Result<Vec<f32>, ProcessingError> {
        let input_ids = Array2::from_shape_vec(
            (1, tokens.len()),
            tokens.iter().map(|&t| t as i64).collect(),
        )?;
        let attention_mask = Array2::<i64>::ones((1, tokens.len()));
        let encoder_attention_mask = Array2::<i64>::ones((1, encoder_hidden_states.shape()[1]));

        let mut session = self.decoder.lock();
        let mut inputs = ort::inputs![
            "input_ids" => TensorRef::from_array_view(input_ids.view())?,
            "encoder_hidden_states" => TensorRef::from_array_view(encoder_hidden_states.view())?
        ];
        if self.decoder_signature.attention_mask {
            inputs.push((
                "attention_mask".into(),
                TensorRef::from_array_view(attention_mask.view())?.into(),
            ));
        }
        if self.decoder_signature.encoder_attention_mask {
            inputs.push((
                "encoder_attention_mask".into(),
                TensorRef::from_array_view(encoder_attention_mask.view())?.into(),
            ));
        }

        let outputs = session.run(inputs)?;
        let logits = outputs["logits"]
            .try_extract_array::<f32>()?
            .into_dimensionality::<Ix3>()?;
        if logits.shape()[1] == 0 {
            return Err(ProcessingError::UnexpectedOutput(
                "decoder returned no positions".to_string(),
            ));
        }
        Ok(logits.slice(s![0, -1, ..]).to_vec())
    }

    /// Token ids for a caption, decoder start token first.
    pub fn generate(&self, pixel_values: &Array4<f32>) -> Result<Vec<u32>, ProcessingError> {
        let hidden = self.encode(pixel_values)?;
        let tokens = greedy_decode(
            self.generation.decoder_start_token_id,
            self.generation.eos_token_id,
            MAX_LENGTH,
            |tokens| self.next_token_logits(&hidden, tokens),
        )?;
        tracing::debug!("Generated {} tokens", tokens.len());
        Ok(tokens)
    }
}

/// Caption model, image processor and tokenizer working as one captioner.
#[derive(Clone)]
pub struct Captioner {
    model: Arc<VitGpt2>,
    image_processor: Arc<ImageProcessor>,
    tokenizer: Arc<Tokenizer>,
}

impl Captioner {
    pub fn new(
        model: Arc<VitGpt2>,
        image_processor: Arc<ImageProcessor>,
        tokenizer: Arc<Tokenizer>,
    ) -> Self {
        Self {
            model,
            image_processor,
            tokenizer,
        }
    }
}

impl ImageCaptioner for Captioner {
    #[instrument(skip_all, fields(width = frame.width(), height = frame.height()))]
    fn caption(&self, frame: &RgbFrame) -> Result<String, ProcessingError> {
        let pixel_values = self.image_processor.preprocess(frame)?;
        let tokens = self.model.generate(&pixel_values)?;
        decode_caption(&self.tokenizer, &tokens)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{Rgb, RgbImage};
    use tokenizers::{models::wordlevel::WordLevel, AddedToken};

    fn frame(width: u32, height: u32, value: u8) -> RgbFrame {
        RgbFrame::try_from(RgbImage::from_pixel(width, height, Rgb([value; 3]))).unwrap()
    }

    fn one_hot(index: usize, vocab: usize) -> Vec<f32> {
        let mut logits = vec![0.0; vocab];
        logits[index] = 1.0;
        logits
    }

    #[test]
    fn test_processor_config_square_size() {
        let processor: ImageProcessor = serde_json::from_str(
            r#"{
                "do_normalize": true,
                "do_resize": true,
                "feature_extractor_type": "ViTFeatureExtractor",
                "image_mean": [0.5, 0.5, 0.5],
                "image_std": [0.5, 0.5, 0.5],
                "resample": 2,
                "size": 224
            }"#,
        )
        .unwrap();

        assert_eq!(processor.size, ProcessorSize::Square(224));
        assert!(processor.do_rescale);
        assert!((processor.rescale_factor - 1. / 255.).abs() < 1e-9);
    }

    #[test]
    fn test_processor_config_exact_size() {
        let processor: ImageProcessor =
            serde_json::from_str(r#"{"size": {"height": 224, "width": 160}}"#).unwrap();

        assert_eq!(processor.size.dimensions(), (160, 224));
    }

    #[test]
    fn test_preprocess_normalizes_to_unit_range() {
        let processor: ImageProcessor = serde_json::from_str("{}").unwrap();

        let white = processor.preprocess(&frame(40, 30, 255)).unwrap();
        let black = processor.preprocess(&frame(10, 10, 0)).unwrap();

        assert_eq!(white.shape(), &[1, 3, 224, 224]);
        assert!(white.iter().all(|v| (v - 1.0).abs() < 1e-5));
        assert!(black.iter().all(|v| (v + 1.0).abs() < 1e-5));
    }

    #[test]
    fn test_generation_settings_defaults() {
        let settings: GenerationSettings = serde_json::from_str(
            r#"{"bos_token_id": 50256, "eos_token_id": 50256, "pad_token_id": 50256}"#,
        )
        .unwrap();

        assert_eq!(settings, GenerationSettings::default());
    }

    #[test]
    fn test_greedy_decode_stops_at_eos() {
        let script = [3usize, 7, 0];
        let tokens = greedy_decode::<ProcessingError, _>(0, 0, MAX_LENGTH, |so_far| {
            Ok(one_hot(script[so_far.len() - 1], 10))
        })
        .unwrap();

        assert_eq!(tokens, vec![0, 3, 7, 0]);
    }

    #[test]
    fn test_greedy_decode_caps_sequence_length() {
        let mut calls = 0;
        let tokens = greedy_decode::<ProcessingError, _>(9, 9, MAX_LENGTH, |_| {
            calls += 1;
            Ok(one_hot(4, 10))
        })
        .unwrap();

        assert_eq!(tokens.len(), MAX_LENGTH);
        assert_eq!(calls, MAX_LENGTH - 1);
        assert_eq!(tokens[0], 9);
        assert!(tokens[1..].iter().all(|&t| t == 4));
    }

    #[test]
    fn test_greedy_decode_propagates_errors() {
        let result = greedy_decode::<ProcessingError, _>(0, 1, MAX_LENGTH, |_| Ok(vec![]));
        assert!(matches!(result, Err(ProcessingError::UnexpectedOutput(_))));
    }

    #[test]
    fn test_decode_caption_skips_special_tokens() {
        let vocab = [("<|endoftext|>", 0), ("a", 1), ("dog", 2), ("[UNK]", 3)];
        let model = WordLevel::builder()
            .vocab(
                vocab
                    .into_iter()
                    .map(|(token, id)| (token.to_string(), id))
                    .collect(),
            )
            .unk_token("[UNK]".to_string())
            .build()
            .unwrap();
        let mut tokenizer = Tokenizer::new(model);
        tokenizer.add_special_tokens(&[AddedToken::from("<|endoftext|>", true)]);

        let caption = decode_caption(&tokenizer, &[0, 1, 2, 0]).unwrap();

        assert_eq!(caption, "a dog");
    }

    #[test]
    #[ignore] // needs the caption package from the model hub
    fn test_caption_from_hub() {
        let api = hf_hub::api::sync::Api::new().unwrap();
        let repo = api.model(crate::models::CAPTION_MODEL_ID.to_string());
        let model = VitGpt2::load(
            &repo.get("onnx/encoder_model.onnx").unwrap(),
            &repo.get("onnx/decoder_model.onnx").unwrap(),
            GenerationSettings::default(),
            2,
        )
        .unwrap();
        let processor = ImageProcessor::from_file(&repo.get("preprocessor_config.json").unwrap())
            .unwrap();
        let tokenizer = Tokenizer::from_file(repo.get("tokenizer.json").unwrap()).unwrap();
        let captioner = Captioner::new(Arc::new(model), Arc::new(processor), Arc::new(tokenizer));

        let caption = captioner.caption(&frame(64, 64, 255)).unwrap();

        assert!(!caption.is_empty());
    }
}
