use crate::pipeline::{ArtifactMode, FramePipeline};
use failure::Error;
use image::{DynamicImage, ImageFormat};
use log::{debug, error, info, warn};
use std::fs;
use std::path::Path;

/// Sequential frame supplier for one video source. `Ok(None)` is exhaustion;
/// `Err` is a read failure that ends the session.
pub trait FrameSource {
    fn next_frame(&mut self) -> Result<Option<DynamicImage>, Error>;
}

/// Motion-JPEG stream: frames are concatenated JPEG images, split on the
/// SOI/EOI markers and decoded one at a time. Container formats that need a
/// real demuxer stay behind the `FrameSource` seam.
pub struct MjpegFile {
    data: Vec<u8>,
    offset: usize,
}

const SOI: [u8; 2] = [0xFF, 0xD8];
const EOI: [u8; 2] = [0xFF, 0xD9];

impl MjpegFile {
    pub fn open(path: &Path) -> Result<Self, Error> {
        let data = fs::read(path)?;
        if find_marker(&data, 0, &SOI).is_none() {
            bail!("No JPEG frames found in {:?}", path);
        }
        Ok(Self { data, offset: 0 })
    }
}

impl FrameSource for MjpegFile {
    fn next_frame(&mut self) -> Result<Option<DynamicImage>, Error> {
        let start = match find_marker(&self.data, self.offset, &SOI) {
            Some(start) => start,
            None => return Ok(None),
        };
        let end = find_marker(&self.data, start + SOI.len(), &EOI)
            .ok_or_else(|| format_err!("Truncated JPEG frame at byte {}", start))?
            + EOI.len();
        self.offset = end;
        let frame = image::load_from_memory_with_format(&self.data[start..end], ImageFormat::Jpeg)?;
        Ok(Some(frame))
    }
}

fn find_marker(data: &[u8], from: usize, marker: &[u8; 2]) -> Option<usize> {
    if data.len() < from + marker.len() {
        return None;
    }
    (from..=data.len() - marker.len()).find(|&i| data[i..i + 2] == marker[..])
}

/// Reads frames until exhaustion or a read failure, running the pipeline on
/// each. A frame whose processing fails is logged and skipped; the session
/// carries on with the next one.
pub fn run_session(pipeline: &FramePipeline, source: &mut dyn FrameSource) {
    let mut frame_idx = 0u64;
    loop {
        match source.next_frame() {
            Ok(Some(frame)) => {
                frame_idx += 1;
                debug!("Processing frame {}", frame_idx);
                if let Err(e) = pipeline.detect_and_process(&frame, ArtifactMode::PlateCrop) {
                    error!("Error processing frame {}: {}", frame_idx, e);
                }
            }
            Ok(None) => {
                info!("End of video after {} frame(s)", frame_idx);
                break;
            }
            Err(e) => {
                error!("Failed to read frame {}: {}", frame_idx + 1, e);
                break;
            }
        }
    }
}

/// Runs a session over a caller-supplied scratch file and deletes the file
/// once the session ends, on success and on failure alike.
pub fn run_session_and_cleanup(pipeline: &FramePipeline, scratch: &Path) {
    info!("Starting video session for {:?}", scratch);
    match MjpegFile::open(scratch) {
        Ok(mut source) => run_session(pipeline, &mut source),
        Err(e) => error!("Unable to open video source {:?}: {}", scratch, e),
    }
    match fs::remove_file(scratch) {
        Ok(()) => info!("Scratch file {:?} deleted", scratch),
        Err(e) => warn!("Failed to delete scratch file {:?}: {}", scratch, e),
    }
}
