use super::{InstanceSegmenter, ModelError};
use crate::{frame::RgbFrame, processor::ProcessingError};
use ndarray::{s, Array2, Array3, ArrayD, Axis, Ix1, Ix2, Ix4};
use ort::{
    session::{builder::GraphOptimizationLevel, Session},
    value::TensorRef,
};
use parking_lot::Mutex;
use std::path::Path;
use tracing::instrument;

/// One candidate instance as emitted by the segmentation model.
#[derive(Debug, Clone)]
pub struct Detection {
    pub label: i64,
    pub score: f32,
    /// `[x1, y1, x2, y2]` in pixels.
    pub bbox: [f32; 4],
    /// Soft occupancy in `[0, 1]`, shaped `(height, width)` like the frame.
    pub mask: Array2<f32>,
}

struct RawDetections {
    boxes: ArrayD<f32>,
    labels: ArrayD<i64>,
    scores: ArrayD<f32>,
    masks: ArrayD<f32>,
}

/// torchvision `maskrcnn_resnet50_fpn` exported to ONNX: takes a `[3, H, W]`
/// tensor in `[0, 1]` and returns boxes, labels, scores and masks in that order.
pub struct MaskRcnn {
    session: Mutex<Session>,
    output_names: [String; 4],
}

/// Boxes, labels, scores and masks output names, in graph order.
fn detection_outputs(outputs: &[String]) -> Result<[String; 4], ModelError> {
    match outputs {
        [boxes, labels, scores, masks, ..] => Ok([
            boxes.clone(),
            labels.clone(),
            scores.clone(),
            masks.clone(),
        ]),
        _ => Err(ModelError::Signature {
            model: "maskrcnn_resnet50_fpn",
            detail: format!("expected 4 outputs, found {:?}", outputs),
        }),
    }
}

impl MaskRcnn {
    pub fn load(model_path: &Path, intra_threads: usize) -> Result<Self, ModelError> {
        let session = Session::builder()?
            .with_optimization_level(GraphOptimizationLevel::Level3)?
            .with_intra_threads(intra_threads)?
            .commit_from_file(model_path)?;

        let outputs: Vec<String> = session.outputs.iter().map(|o| o.name.clone()).collect();
        let output_names = detection_outputs(&outputs)?;

        tracing::info!(
            "Loaded segmentation model from {:?} (outputs: {:?})",
            model_path,
            output_names
        );

        Ok(Self {
            session: Mutex::new(session),
            output_names,
        })
    }

    fn run_inference(&self, input: &Array3<f32>) -> Result<RawDetections, ProcessingError> {
        let mut session = self.session.lock();

        let owned_buffer;
        let input_view = if input.view().is_standard_layout() {
            input.view()
        } else {
            owned_buffer = input.as_standard_layout().to_owned();
            owned_buffer.view()
        };

        let tensor_ref = TensorRef::from_array_view(input_view)?;
        let outputs = session.run(ort::inputs![tensor_ref])?;

        let [boxes, labels, scores, masks] = &self.output_names;
        Ok(RawDetections {
            boxes: outputs[boxes.as_str()]
                .try_extract_array::<f32>()?
                .to_owned(),
            labels: outputs[labels.as_str()]
                .try_extract_array::<i64>()?
                .to_owned(),
            scores: outputs[scores.as_str()]
                .try_extract_array::<f32>()?
                .to_owned(),
            masks: outputs[masks.as_str()]
                .try_extract_array::<f32>()?
                .to_owned(),
        })
    }
}

impl InstanceSegmenter for MaskRcnn {
    #[instrument(skip_all, fields(width = frame.width(), height = frame.height()))]
    fn segment(&self, frame: &RgbFrame) -> Result<Vec<Detection>, ProcessingError> {
        let input = frame.to_chw_tensor();
        let raw = self.run_inference(&input)?;
        let detections = collect_detections(raw, frame.width(), frame.height())?;
        tracing::debug!("Segmentation returned {} candidates", detections.len());
        Ok(detections)
    }
}

fn unexpected(detail: String) -> ProcessingError {
    ProcessingError::UnexpectedOutput(detail)
}

fn collect_detections(
    raw: RawDetections,
    width: u32,
    height: u32,
) -> Result<Vec<Detection>, ProcessingError> {
    let count = raw.scores.len();
    if raw.scores.ndim() != 1 {
        return Err(unexpected(format!("scores shape {:?}", raw.scores.shape())));
    }
    if raw.boxes.shape() != [count, 4] {
        return Err(unexpected(format!("boxes shape {:?}", raw.boxes.shape())));
    }
    if raw.labels.shape() != [count] {
        return Err(unexpected(format!("labels shape {:?}", raw.labels.shape())));
    }
    let (height, width) = (height as usize, width as usize);
    if raw.masks.shape() != [count, 1, height, width] {
        return Err(unexpected(format!(
            "masks shape {:?}, expected [{}, 1, {}, {}]",
            raw.masks.shape(),
            count,
            height,
            width
        )));
    }

    let boxes = raw.boxes.into_dimensionality::<Ix2>()?;
    let labels = raw.labels.into_dimensionality::<Ix1>()?;
    let scores = raw.scores.into_dimensionality::<Ix1>()?;
    let masks = raw.masks.into_dimensionality::<Ix4>()?;

    let detections = masks
        .axis_iter(Axis(0))
        .enumerate()
        .map(|(i, mask)| Detection {
            label: labels[i],
            score: scores[i],
            bbox: [boxes[[i, 0]], boxes[[i, 1]], boxes[[i, 2]], boxes[[i, 3]]],
            mask: mask.slice(s![0, .., ..]).to_owned(),
        })
        .collect();

    Ok(detections)
}
