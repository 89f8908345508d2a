use chrono::NaiveDateTime;
use serde::Serialize;

/// One persisted detection: creation time, canonical plate, evidence image.
/// Immutable once appended to the store.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DetectionRecord {
    pub timestamp: NaiveDateTime,
    #[serde(rename = "license_plate")]
    pub plate_number: String,
    pub image_path: String,
}

/// A candidate region reported by the external detector, in pixel space.
#[derive(Debug, Clone)]
pub struct DetectionBox {
    pub class_id: i64,
    pub confidence: f64,
    pub x1: u32,
    pub y1: u32,
    pub x2: u32,
    pub y2: u32,
}

/// One text token recognized by the external OCR engine, in reading order.
#[derive(Debug, Clone)]
pub struct OcrLine {
    pub text: String,
    pub confidence: f64,
}

/// Conjunctive record filters; every field is optional.
#[derive(Debug, Clone, Default)]
pub struct RecordFilter {
    pub start: Option<NaiveDateTime>,
    pub end: Option<NaiveDateTime>,
    pub plate_fragment: Option<String>,
}
