use crate::{
    annotate::{draw_outlines, trace_contours, Contours},
    frame::{FrameError, RgbFrame},
    models::{Detection, ImageCaptioner, InstanceSegmenter},
};
use std::{sync::Arc, time::Instant};
use thiserror::Error;
use tracing::instrument;

/// Detections must score strictly above this to be outlined.
pub const CONFIDENCE_THRESHOLD: f32 = 0.8;

#[derive(Error, Debug)]
pub enum ProcessingError {
    #[error("ONNX Runtime error: {0}")]
    Ort(#[from] ort::Error),
    #[error("Tensor shape error: {0}")]
    Shape(#[from] ndarray::ShapeError),
    #[error("Unexpected model output: {0}")]
    UnexpectedOutput(String),
    #[error("OpenCV error: {0}")]
    OpenCv(#[from] opencv::Error),
    #[error("Tokenizer error: {0}")]
    Tokenizer(String),
    #[error(transparent)]
    Frame(#[from] FrameError),
}

pub fn is_confident(score: f32) -> bool {
    score > CONFIDENCE_THRESHOLD
}

#[derive(Debug, Clone)]
pub struct ProcessedFrame {
    pub annotated: RgbFrame,
    pub caption: String,
    pub instances: usize,
    pub contours: usize,
}

pub struct FrameProcessor {
    segmenter: Arc<dyn InstanceSegmenter>,
    captioner: Arc<dyn ImageCaptioner>,
}

impl FrameProcessor {
    pub fn new(
        segmenter: Arc<dyn InstanceSegmenter>,
        captioner: Arc<dyn ImageCaptioner>,
    ) -> Self {
        Self {
            segmenter,
            captioner,
        }
    }

    /// Outlines confident instances on a copy of `frame` and captions it.
    /// Fails as a whole if either branch fails.
    #[instrument(skip_all, fields(width = frame.width(), height = frame.height()))]
    pub fn process(&self, frame: &RgbFrame) -> Result<ProcessedFrame, ProcessingError> {
        let started = Instant::now();
        let detections = self.segmenter.segment(frame)?;
        let segmentation_time = started.elapsed();

        let candidates = detections.len();
        let retained: Vec<Detection> = detections
            .into_iter()
            .filter(|detection| is_confident(detection.score))
            .collect();

        let started = Instant::now();
        let mut contours = Contours::new();
        for detection in &retained {
            for contour in trace_contours(&detection.mask)? {
                contours.push(contour);
            }
        }
        let annotated = draw_outlines(frame, &contours)?;
        let annotation_time = started.elapsed();

        let started = Instant::now();
        let caption = self.captioner.caption(frame)?;
        if caption.is_empty() {
            return Err(ProcessingError::UnexpectedOutput(
                "caption decoded to an empty string".to_string(),
            ));
        }
        let caption_time = started.elapsed();

        tracing::info!(
            candidates,
            instances = retained.len(),
            contours = contours.len(),
            segmentation_ms = segmentation_time.as_millis() as u64,
            annotation_ms = annotation_time.as_millis() as u64,
            caption_ms = caption_time.as_millis() as u64,
            "Processed frame: {}",
            caption
        );

        Ok(ProcessedFrame {
            annotated,
            caption,
            instances: retained.len(),
            contours: contours.len(),
        })
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use image::{Rgb, RgbImage};
    use ndarray::Array2;

    pub struct MockSegmenter {
        pub scores: Vec<f32>,
        pub fail: bool,
    }

    impl InstanceSegmenter for MockSegmenter {
        fn segment(&self, frame: &RgbFrame) -> Result<Vec<Detection>, ProcessingError> {
            if self.fail {
                return Err(ProcessingError::UnexpectedOutput(
                    "boxes shape [1]".to_string(),
                ));
            }
            let (height, width) = (frame.height() as usize, frame.width() as usize);
            Ok(self
                .scores
                .iter()
                .map(|&score| Detection {
                    label: 1,
                    score,
                    bbox: [2.0, 2.0, width as f32 - 2.0, height as f32 - 2.0],
                    mask: Array2::from_shape_fn((height, width), |(y, x)| {
                        let inside = (2..height - 2).contains(&y) && (2..width - 2).contains(&x);
                        if inside {
                            0.97
                        } else {
                            0.02
                        }
                    }),
                })
                .collect())
        }
    }

    pub struct MockCaptioner {
        pub caption: Option<&'static str>,
    }

    impl ImageCaptioner for MockCaptioner {
        fn caption(&self, _frame: &RgbFrame) -> Result<String, ProcessingError> {
            self.caption
                .map(str::to_string)
                .ok_or_else(|| ProcessingError::Tokenizer("unknown token id 99999".to_string()))
        }
    }

    pub fn processor(scores: Vec<f32>) -> FrameProcessor {
        FrameProcessor::new(
            Arc::new(MockSegmenter {
                scores,
                fail: false,
            }),
            Arc::new(MockCaptioner {
                caption: Some("a white square on a white background"),
            }),
        )
    }

    pub fn white_frame(size: u32) -> RgbFrame {
        RgbFrame::try_from(RgbImage::from_pixel(size, size, Rgb([255, 255, 255]))).unwrap()
    }

    #[test]
    fn test_threshold_is_strict() {
        assert!(!is_confident(0.8));
        assert!(!is_confident(0.5));
        assert!(is_confident(0.95));
        // 0.80000001 rounds to 0.8 in single precision, so use the next representable value.
        assert!(is_confident(f32::from_bits(0.8_f32.to_bits() + 1)));
    }

    #[test]
    fn test_detection_at_threshold_is_not_drawn() {
        let frame = white_frame(16);

        let result = processor(vec![0.8]).process(&frame).unwrap();

        assert_eq!(result.instances, 0);
        assert_eq!(result.contours, 0);
        assert_eq!(result.annotated, frame);
    }

    #[test]
    fn test_detection_just_above_threshold_is_drawn() {
        let frame = white_frame(16);
        let score = f32::from_bits(0.8_f32.to_bits() + 1);

        let result = processor(vec![score]).process(&frame).unwrap();

        assert_eq!(result.instances, 1);
        assert_ne!(result.annotated, frame);
    }

    #[test]
    fn test_confident_detection_changes_pixels() {
        let frame = white_frame(24);

        let result = processor(vec![0.95, 0.3]).process(&frame).unwrap();

        assert_eq!(result.instances, 1);
        assert_eq!(result.contours, 1);
        assert_ne!(result.annotated, frame);
        assert_eq!(result.annotated.pixel(2, 2), Some([0, 255, 0]));
        assert_eq!(result.caption, "a white square on a white background");
        // Source frame is never modified.
        assert_eq!(frame, white_frame(24));
    }

    #[test]
    fn test_no_detections_keeps_frame_identical() {
        let frame = white_frame(16);

        let result = processor(vec![]).process(&frame).unwrap();

        assert_eq!(result.annotated, frame);
        assert!(!result.caption.is_empty());
    }

    #[test]
    fn test_segmentation_failure_propagates() {
        let processor = FrameProcessor::new(
            Arc::new(MockSegmenter {
                scores: vec![],
                fail: true,
            }),
            Arc::new(MockCaptioner {
                caption: Some("a cat"),
            }),
        );

        let result = processor.process(&white_frame(8));

        assert!(matches!(result, Err(ProcessingError::UnexpectedOutput(_))));
    }

    #[test]
    fn test_caption_failure_fails_whole_call() {
        let processor = FrameProcessor::new(
            Arc::new(MockSegmenter {
                scores: vec![0.95],
                fail: false,
            }),
            Arc::new(MockCaptioner { caption: None }),
        );

        let result = processor.process(&white_frame(16));

        assert!(matches!(result, Err(ProcessingError::Tokenizer(_))));
    }

    #[test]
    fn test_empty_caption_is_an_error() {
        let processor = FrameProcessor::new(
            Arc::new(MockSegmenter {
                scores: vec![],
                fail: false,
            }),
            Arc::new(MockCaptioner { caption: Some("") }),
        );

        let result = processor.process(&white_frame(8));

        assert!(matches!(result, Err(ProcessingError::UnexpectedOutput(_))));
    }
}
