use chrono::Local;
use failure::Error;
use image::{DynamicImage, ImageOutputFormat};
use log::debug;
use std::fs::OpenOptions;
use std::io::{Cursor, ErrorKind, Write};
use std::path::{Path, PathBuf};

/// Returns an unused artifact path in `dir` without creating the file. Names
/// embed a microsecond timestamp plus a collision counter; the counter is
/// bumped until the existence probe finds a free name. Uniqueness against
/// concurrent callers is finished by `write_jpeg_new`, not here.
pub fn next_artifact_path(dir: &Path) -> PathBuf {
    let mut counter = 0u32;
    loop {
        let stamp = Local::now().format("%Y%m%d_%H%M%S_%6f");
        let candidate = dir.join(format!("plate_{}_{}.jpg", stamp, counter));
        if !candidate.exists() {
            return candidate;
        }
        counter += 1;
    }
}

/// Encodes `image` as JPEG and writes it to a freshly probed artifact path.
/// A racer claiming the same name between probe and create shows up as an
/// already-exists error, which is retried with a new probe; any other I/O
/// failure propagates.
pub fn write_jpeg_new(dir: &Path, image: &DynamicImage) -> Result<String, Error> {
    let mut encoded = Cursor::new(Vec::new());
    image.write_to(&mut encoded, ImageOutputFormat::Jpeg(90))?;
    let encoded = encoded.into_inner();

    loop {
        let path = next_artifact_path(dir);
        match OpenOptions::new().write(true).create_new(true).open(&path) {
            Ok(mut file) => {
                file.write_all(&encoded)?;
                return Ok(path.to_string_lossy().into_owned());
            }
            Err(ref e) if e.kind() == ErrorKind::AlreadyExists => {
                debug!("Artifact path {:?} was claimed concurrently, reprobing", path);
            }
            Err(e) => return Err(e.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::RgbImage;
    use std::collections::HashSet;
    use std::fs;
    use tempfile::tempdir;

    #[test]
    fn first_probe_starts_at_counter_zero() {
        let dir = tempdir().unwrap();
        let path = next_artifact_path(dir.path());
        assert!(!path.exists());
        let name = path.file_name().unwrap().to_string_lossy().into_owned();
        assert!(name.starts_with("plate_"));
        assert!(name.ends_with("_0.jpg"));
    }

    #[test]
    fn probe_skips_existing_files() {
        let dir = tempdir().unwrap();
        let mut seen = HashSet::new();
        for _ in 0..10 {
            let path = next_artifact_path(dir.path());
            assert!(!path.exists());
            assert!(seen.insert(path.clone()));
            // Claim the name the way a caller would, forcing the next probe
            // to move on.
            fs::write(&path, b"jpeg").unwrap();
        }
    }

    #[test]
    fn writes_distinct_artifacts_in_a_tight_loop() {
        let dir = tempdir().unwrap();
        let image = DynamicImage::ImageRgb8(RgbImage::new(8, 8));
        let mut paths = HashSet::new();
        for _ in 0..5 {
            let path = write_jpeg_new(dir.path(), &image).unwrap();
            assert!(Path::new(&path).exists());
            assert!(paths.insert(path));
        }
    }

    #[test]
    fn written_artifact_is_decodable() {
        let dir = tempdir().unwrap();
        let image = DynamicImage::ImageRgb8(RgbImage::new(16, 9));
        let path = write_jpeg_new(dir.path(), &image).unwrap();
        let decoded = image::open(&path).unwrap();
        use image::GenericImageView;
        assert_eq!(decoded.dimensions(), (16, 9));
    }
}
