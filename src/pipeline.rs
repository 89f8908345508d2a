use crate::artifact;
use crate::plate::PlateNormalizer;
use crate::store::{self, RecordStore};
use crate::types::{DetectionBox, DetectionRecord};
use crate::vision::{self, PlateDetector, TextReader};
use failure::Error;
use image::DynamicImage;
use log::{debug, error, info};
use std::path::PathBuf;
use std::sync::Arc;

/// What gets persisted as evidence for a detection. Video frames save the
/// cropped plate region; still images save the whole source frame.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ArtifactMode {
    PlateCrop,
    FullFrame,
}

/// Per-frame orchestration: detector boxes in, validated and deduplicated
/// detection records out. Shared freely across request handlers and the
/// background video session.
pub struct FramePipeline {
    detector: Arc<dyn PlateDetector>,
    reader: Arc<dyn TextReader>,
    store: Arc<dyn RecordStore>,
    normalizer: PlateNormalizer,
    artifact_dir: PathBuf,
    plate_class: i64,
    dedup_window_secs: i64,
}

impl FramePipeline {
    pub fn new(
        detector: Arc<dyn PlateDetector>,
        reader: Arc<dyn TextReader>,
        store: Arc<dyn RecordStore>,
        normalizer: PlateNormalizer,
        artifact_dir: PathBuf,
        plate_class: i64,
        dedup_window_secs: i64,
    ) -> Self {
        Self {
            detector,
            reader,
            store,
            normalizer,
            artifact_dir,
            plate_class,
            dedup_window_secs,
        }
    }

    /// Runs the detector on `image` and processes the resulting boxes.
    /// Detector failure propagates; the caller decides whether it aborts a
    /// request or is logged and skipped as one bad frame.
    pub fn detect_and_process(
        &self,
        image: &DynamicImage,
        mode: ArtifactMode,
    ) -> Result<Vec<DetectionRecord>, Error> {
        let boxes = self.detector.detect(image)?;
        Ok(self.process(&boxes, image, mode))
    }

    /// Processes detector boxes for one frame, returning the records actually
    /// created. A failing box is logged and skipped; it never aborts the rest
    /// of the frame.
    pub fn process(
        &self,
        boxes: &[DetectionBox],
        image: &DynamicImage,
        mode: ArtifactMode,
    ) -> Vec<DetectionRecord> {
        let mut created = Vec::new();
        for b in boxes.iter().filter(|b| b.class_id == self.plate_class) {
            match self.process_box(b, image, mode) {
                Ok(Some(record)) => created.push(record),
                Ok(None) => {}
                Err(e) => error!("Failed to process detection box: {}", e),
            }
        }
        created
    }

    fn process_box(
        &self,
        b: &DetectionBox,
        image: &DynamicImage,
        mode: ArtifactMode,
    ) -> Result<Option<DetectionRecord>, Error> {
        debug!(
            "Plate candidate at ({},{})-({},{}) confidence {:.2}",
            b.x1, b.y1, b.x2, b.y2, b.confidence
        );
        let crop = match vision::crop_box(image, b) {
            Some(crop) => crop,
            None => return Ok(None),
        };

        let lines = self.reader.read(&crop.to_luma8())?;
        for l in &lines {
            debug!("OCR token '{}' ({:.2})", l.text, l.confidence);
        }
        let raw = lines
            .iter()
            .map(|l| l.text.as_str())
            .collect::<Vec<_>>()
            .join(" ")
            .trim()
            .to_string();
        if raw.is_empty() {
            return Ok(None);
        }

        let plate = match self.normalizer.normalize(&raw) {
            Some(plate) => plate,
            None => {
                info!("Recognized text is not a valid license plate: {}", raw);
                return Ok(None);
            }
        };

        let evidence = match mode {
            ArtifactMode::PlateCrop => &crop,
            ArtifactMode::FullFrame => image,
        };
        // The artifact is written inside the store's critical section, so a
        // record row always points at a file that already exists and a
        // suppressed duplicate writes nothing.
        let created = self.store.record_if_fresh(&plate, self.dedup_window_secs, &mut || {
            let image_path = artifact::write_jpeg_new(&self.artifact_dir, evidence)?;
            Ok(DetectionRecord {
                timestamp: store::now_timestamp(),
                plate_number: plate.clone(),
                image_path,
            })
        })?;

        match created {
            Some(record) => {
                info!(target: "detections", "Detected license plate: {}", record.plate_number);
                Ok(Some(record))
            }
            None => {
                info!(
                    "Duplicate license plate within {} seconds: {}",
                    self.dedup_window_secs, plate
                );
                Ok(None)
            }
        }
    }
}
