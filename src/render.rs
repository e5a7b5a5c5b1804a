//! Class encodings and prediction colouring for the web front end.

use std::io::Cursor;

use base64::Engine;
use image::{ImageFormat, RgbImage};
use ndarray::{Array2, Array3, Array4, ArrayView1, ArrayView2, ArrayView3, s};

use crate::ml::argmax;

/// Water, forest, field and built-up, as RGB in `[0, 1]`.
pub const DEFAULT_COLOR_MAP: [[f32; 3]; 4] = [
    [0.0, 0.0, 1.0],
    [0.0, 0.5, 0.0],
    [0.5, 1.0, 0.5],
    [0.5, 0.375, 0.375],
];

/// NLCD land-cover codes and their legend colours.
pub const NLCD_LEGEND: [(u8, [u8; 3]); 16] = [
    (11, [70, 107, 159]),
    (12, [209, 222, 248]),
    (21, [222, 197, 197]),
    (22, [217, 146, 130]),
    (23, [235, 0, 0]),
    (24, [171, 0, 0]),
    (31, [179, 172, 159]),
    (41, [104, 171, 95]),
    (42, [28, 95, 44]),
    (43, [181, 197, 143]),
    (52, [204, 184, 121]),
    (71, [223, 223, 194]),
    (81, [220, 217, 57]),
    (82, [171, 108, 40]),
    (90, [184, 217, 235]),
    (95, [108, 159, 184]),
];

/// One row per label with a 1 in the label's column.
///
/// `num_classes` defaults to one more than the largest label.
pub fn to_categorical(labels: &[usize], num_classes: Option<usize>) -> Array2<f32> {
    let num_classes = num_classes
        .unwrap_or_else(|| labels.iter().max().map_or(0, |max| max + 1));
    let mut out = Array2::zeros((labels.len(), num_classes));
    for (row, &label) in labels.iter().enumerate() {
        if label < num_classes {
            out[[row, label]] = 1.0;
        }
    }
    out
}

/// `(H, W)` class mask to `(class_num, H, W)` channel masks.
pub fn to_one_hot(mask: ArrayView2<'_, u8>, class_num: usize) -> Array3<f32> {
    let (height, width) = mask.dim();
    Array3::from_shape_fn((class_num, height, width), |(c, y, x)| {
        if usize::from(mask[[y, x]]) == c { 1.0 } else { 0.0 }
    })
}

/// `(N, H, W)` masks to `(N, class_num, H, W)`.
pub fn to_one_hot_batch(batch: ArrayView3<'_, u8>, class_num: usize) -> Array4<f32> {
    let (n, height, width) = batch.dim();
    Array4::from_shape_fn((n, class_num, height, width), |(i, c, y, x)| {
        if usize::from(batch[[i, y, x]]) == c { 1.0 } else { 0.0 }
    })
}

/// Paint each pixel with the colour of its most probable class.
///
/// Classes past the end of `color_map` are painted black.
pub fn class_prediction_to_img(pred: ArrayView3<'_, f32>, color_map: &[[f32; 3]]) -> Array3<f32> {
    let (height, width, _) = pred.dim();
    let mut img = Array3::zeros((height, width, 3));
    for y in 0..height {
        for x in 0..width {
            let class = argmax(&pred.slice(s![y, x, ..]).to_vec());
            if let Some(colour) = color_map.get(class) {
                img.slice_mut(s![y, x, ..]).assign(&ArrayView1::from(&colour[..]));
            }
        }
    }
    img
}

/// Colour a raster of class codes through a code to RGB legend.
///
/// Codes missing from `legend` are an error.
pub fn code_map_to_img(codes: ArrayView2<'_, u8>, legend: &[(u8, [u8; 3])]) -> Result<RgbImage, String> {
    let mut table: [Option<[u8; 3]>; 256] = [None; 256];
    for &(code, colour) in legend {
        table[usize::from(code)] = Some(colour);
    }
    let (height, width) = codes.dim();
    let mut raw = Vec::with_capacity(height * width * 3);
    for &code in codes.iter() {
        let colour = table[usize::from(code)]
            .ok_or_else(|| format!("No legend colour for code {code}"))?;
        raw.extend_from_slice(&colour);
    }
    let (w, h) = (
        u32::try_from(width).map_err(|_| "Image too wide".to_string())?,
        u32::try_from(height).map_err(|_| "Image too tall".to_string())?,
    );
    RgbImage::from_raw(w, h, raw).ok_or_else(|| "Image buffer has the wrong length".to_string())
}

/// [`code_map_to_img`] with the NLCD legend.
pub fn nlcd_to_img(codes: ArrayView2<'_, u8>) -> Result<RgbImage, String> {
    code_map_to_img(codes, &NLCD_LEGEND)
}

/// Quantise an `(H, W, 3)` image in `[0, 1]` to 8-bit RGB.
pub fn to_rgb_image(img: ArrayView3<'_, f32>) -> Result<RgbImage, String> {
    let (height, width, channels) = img.dim();
    if channels != 3 {
        return Err(format!("Expected 3 colour channels, got {channels}"));
    }
    let raw: Vec<u8> = img
        .iter()
        .map(|v| (v.clamp(0.0, 1.0) * 255.0).round() as u8)
        .collect();
    let (w, h) = (
        u32::try_from(width).map_err(|_| "Image too wide".to_string())?,
        u32::try_from(height).map_err(|_| "Image too tall".to_string())?,
    );
    RgbImage::from_raw(w, h, raw).ok_or_else(|| "Image buffer has the wrong length".to_string())
}

/// Colour a prediction and return it as a base64-encoded PNG.
pub fn prediction_png_base64(
    pred: ArrayView3<'_, f32>,
    color_map: &[[f32; 3]],
) -> Result<String, String> {
    let img = class_prediction_to_img(pred, color_map);
    let rgb = to_rgb_image(img.view())?;
    let mut bytes = Cursor::new(Vec::new());
    rgb.write_to(&mut bytes, ImageFormat::Png)
        .map_err(|err| format!("PNG encoding failed: {err}"))?;
    Ok(base64::engine::general_purpose::STANDARD.encode(bytes.into_inner()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::{Axis, array};

    #[test]
    fn categorical_rows_are_one_hot() {
        let out = to_categorical(&[0, 2, 1], None);
        assert_eq!(out, array![[1.0, 0.0, 0.0], [0.0, 0.0, 1.0], [0.0, 1.0, 0.0]]);
        assert_eq!(to_categorical(&[1], Some(4)).dim(), (1, 4));
    }

    #[test]
    fn one_hot_masks_split_by_class() {
        let mask = array![[0u8, 1], [2, 1]];
        let one_hot = to_one_hot(mask.view(), 3);
        assert_eq!(one_hot.dim(), (3, 2, 2));
        assert_eq!(one_hot[[1, 0, 1]], 1.0);
        assert_eq!(one_hot[[1, 1, 1]], 1.0);
        assert_eq!(one_hot[[0, 1, 1]], 0.0);
        let batch = to_one_hot_batch(mask.view().insert_axis(Axis(0)), 3);
        assert_eq!(batch.index_axis(Axis(0), 0), one_hot);
    }

    #[test]
    fn argmax_picks_the_colour() {
        let mut pred = Array3::<f32>::zeros((1, 2, 4));
        pred[[0, 0, 3]] = 0.9;
        pred[[0, 1, 1]] = 0.6;
        let img = class_prediction_to_img(pred.view(), &DEFAULT_COLOR_MAP);
        assert_eq!(img.slice(s![0, 0, ..]).to_vec(), vec![0.5, 0.375, 0.375]);
        assert_eq!(img.slice(s![0, 1, ..]).to_vec(), vec![0.0, 0.5, 0.0]);
    }

    #[test]
    fn land_cover_codes_use_the_legend() {
        let codes = array![[11u8, 42], [82, 11]];
        let img = nlcd_to_img(codes.view()).unwrap();
        assert_eq!(img.dimensions(), (2, 2));
        assert_eq!(img.get_pixel(1, 0).0, [28, 95, 44]);
        assert_eq!(img.get_pixel(0, 1).0, [171, 108, 40]);
        assert_eq!(img.get_pixel(1, 1).0, [70, 107, 159]);

        let unknown = array![[11u8, 7]];
        assert!(nlcd_to_img(unknown.view()).unwrap_err().contains("code 7"));
    }

    #[test]
    fn png_round_trips_through_base64() {
        let mut pred = Array3::<f32>::zeros((3, 5, 4));
        pred.slice_mut(s![.., .., 0]).fill(1.0);
        let encoded = prediction_png_base64(pred.view(), &DEFAULT_COLOR_MAP).unwrap();
        let bytes = base64::engine::general_purpose::STANDARD
            .decode(encoded)
            .unwrap();
        let decoded = image::load_from_memory(&bytes).unwrap().to_rgb8();
        assert_eq!(decoded.dimensions(), (5, 3));
        assert_eq!(decoded.get_pixel(2, 1).0, [0, 0, 255]);
    }
}
