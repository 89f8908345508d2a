use crate::types::{DetectionBox, OcrLine};
use failure::Error;
use image::{DynamicImage, GenericImageView, GrayImage, ImageOutputFormat};
use log::debug;
use serde_json::Value;
use std::io::Cursor;

/// External object detector: bounding boxes with class and confidence for
/// one frame. Implementations are opaque to the pipeline.
pub trait PlateDetector: Send + Sync {
    fn detect(&self, image: &DynamicImage) -> Result<Vec<DetectionBox>, Error>;
}

/// External OCR engine: text tokens for a grayscale plate crop, in reading
/// order. An empty list means nothing was recognized.
pub trait TextReader: Send + Sync {
    fn read(&self, plate: &GrayImage) -> Result<Vec<OcrLine>, Error>;
}

/// Crops `image` to the box, clamped to the frame. `None` for a region that
/// is empty after clamping.
pub fn crop_box(image: &DynamicImage, b: &DetectionBox) -> Option<DynamicImage> {
    let (width, height) = image.dimensions();
    let x1 = b.x1.min(width);
    let y1 = b.y1.min(height);
    let x2 = b.x2.min(width);
    let y2 = b.y2.min(height);
    if x2 <= x1 || y2 <= y1 {
        return None;
    }
    Some(image.crop_imm(x1, y1, x2 - x1, y2 - y1))
}

pub fn encode_jpeg(image: &DynamicImage) -> Result<Vec<u8>, Error> {
    let mut buf = Cursor::new(Vec::new());
    image.write_to(&mut buf, ImageOutputFormat::Jpeg(90))?;
    Ok(buf.into_inner())
}

/// Detector reached over HTTP: the frame is POSTed as JPEG, boxes come back
/// as `{"results": [{"class_id", "confidence", "box": [x1,y1,x2,y2]}]}`.
pub struct HttpDetector {
    endpoint: String,
    min_confidence: f64,
}

impl HttpDetector {
    pub fn new(endpoint: String, min_confidence: f64) -> Self {
        Self {
            endpoint,
            min_confidence,
        }
    }
}

impl PlateDetector for HttpDetector {
    fn detect(&self, image: &DynamicImage) -> Result<Vec<DetectionBox>, Error> {
        let body = encode_jpeg(image)?;
        let client = reqwest::blocking::Client::new();
        let response: Value = client
            .post(&self.endpoint)
            .query(&[("conf", self.min_confidence.to_string())])
            .header(reqwest::header::CONTENT_TYPE, "image/jpeg")
            .body(body)
            .send()?
            .error_for_status()?
            .json()?;

        let results = response["results"]
            .as_array()
            .ok_or_else(|| format_err!("Missing results in detector response"))?;
        let mut boxes = Vec::with_capacity(results.len());
        for result in results {
            let bounds = result["box"]
                .as_array()
                .ok_or_else(|| format_err!("Missing box field in detector result"))?;
            if bounds.len() != 4 {
                bail!("Expected 4 box coordinates, got {}", bounds.len());
            }
            let coord = |i: usize| -> Result<u32, Error> {
                let v = bounds[i]
                    .as_f64()
                    .ok_or_else(|| format_err!("Non-numeric box coordinate"))?;
                Ok(v.max(0.0) as u32)
            };
            boxes.push(DetectionBox {
                class_id: result["class_id"]
                    .as_i64()
                    .ok_or_else(|| format_err!("Missing class_id in detector result"))?,
                confidence: result["confidence"]
                    .as_f64()
                    .ok_or_else(|| format_err!("Missing confidence in detector result"))?,
                x1: coord(0)?,
                y1: coord(1)?,
                x2: coord(2)?,
                y2: coord(3)?,
            });
        }
        debug!("Detector returned {} box(es)", boxes.len());
        Ok(boxes)
    }
}

/// OCR engine reached over HTTP: the grayscale crop is POSTed as JPEG,
/// tokens come back as `{"results": [{"text", "confidence"}]}`.
pub struct HttpTextReader {
    endpoint: String,
}

impl HttpTextReader {
    pub fn new(endpoint: String) -> Self {
        Self { endpoint }
    }
}

impl TextReader for HttpTextReader {
    fn read(&self, plate: &GrayImage) -> Result<Vec<OcrLine>, Error> {
        let body = encode_jpeg(&DynamicImage::ImageLuma8(plate.clone()))?;
        let client = reqwest::blocking::Client::new();
        let response: Value = client
            .post(&self.endpoint)
            .header(reqwest::header::CONTENT_TYPE, "image/jpeg")
            .body(body)
            .send()?
            .error_for_status()?
            .json()?;

        let results = response["results"]
            .as_array()
            .ok_or_else(|| format_err!("Missing results in OCR response"))?;
        let mut lines = Vec::with_capacity(results.len());
        for result in results {
            lines.push(OcrLine {
                text: result["text"]
                    .as_str()
                    .ok_or_else(|| format_err!("Missing text in OCR result"))?
                    .to_string(),
                confidence: result["confidence"]
                    .as_f64()
                    .ok_or_else(|| format_err!("Missing confidence in OCR result"))?,
            });
        }
        Ok(lines)
    }
}
