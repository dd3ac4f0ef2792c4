use crate::{frame::RgbFrame, processor::ProcessingError};
use ndarray::Array2;
use opencv::{
    core::{Mat, Point, Scalar, Vector, CV_8UC1, CV_8UC3},
    imgproc,
    prelude::*,
};

pub type Contour = Vector<Point>;
pub type Contours = Vector<Contour>;

/// Occupancy at or above this fraction of full intensity counts as inside the instance.
pub const MASK_THRESHOLD: f32 = 0.5;
pub const OUTLINE_COLOR: [u8; 3] = [0, 255, 0];
pub const OUTLINE_THICKNESS: i32 = 2;

const OCCUPIED: u8 = 255;

pub fn binarize(mask: &Array2<f32>) -> Vec<u8> {
    mask.iter()
        .map(|&value| if value >= MASK_THRESHOLD { OCCUPIED } else { 0 })
        .collect()
}

fn mat_from_bytes(rows: i32, cols: i32, typ: i32, bytes: &[u8]) -> opencv::Result<Mat> {
    let mut mat = Mat::new_rows_cols_with_default(rows, cols, typ, Scalar::all(0.0))?;
    mat.data_bytes_mut()?.copy_from_slice(bytes);
    Ok(mat)
}

/// Outer boundaries and holes of every occupied region, with straight runs
/// compressed to their end points.
pub fn trace_contours(mask: &Array2<f32>) -> Result<Contours, ProcessingError> {
    let (rows, cols) = mask.dim();
    let binary = mat_from_bytes(rows as i32, cols as i32, CV_8UC1, &binarize(mask))?;

    let mut contours = Contours::new();
    imgproc::find_contours(
        &binary,
        &mut contours,
        imgproc::RETR_TREE,
        imgproc::CHAIN_APPROX_SIMPLE,
        Point::new(0, 0),
    )?;
    Ok(contours)
}

/// Copy of `frame` with every contour outlined. With no contours the copy is
/// pixel-identical to the input.
pub fn draw_outlines(frame: &RgbFrame, contours: &Contours) -> Result<RgbFrame, ProcessingError> {
    if contours.is_empty() {
        return Ok(frame.clone());
    }

    let mut canvas = mat_from_bytes(
        frame.height() as i32,
        frame.width() as i32,
        CV_8UC3,
        frame.as_bytes(),
    )?;
    let [r, g, b] = OUTLINE_COLOR;
    imgproc::draw_contours(
        &mut canvas,
        contours,
        -1,
        Scalar::new(r as f64, g as f64, b as f64, 0.0),
        OUTLINE_THICKNESS,
        imgproc::LINE_8,
        &Mat::default(),
        i32::MAX,
        Point::new(0, 0),
    )?;

    let data = canvas.data_bytes()?.to_vec();
    Ok(RgbFrame::new(frame.width(), frame.height(), data)?)
}
