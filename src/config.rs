use failure::Error;
use std::env;
use std::path::PathBuf;

/// Service settings, read once from the environment by the composition root.
/// Unset variables fall back to defaults; unparseable values are a fatal
/// startup error.
#[derive(Debug, Clone)]
pub struct Config {
    pub port: u16,
    pub csv_file: PathBuf,
    pub artifact_dir: PathBuf,
    pub detector_url: String,
    pub ocr_url: String,
    pub confidence_threshold: f64,
    pub dedup_window_secs: i64,
    pub plate_class: i64,
    /// Overrides the built-in regional-code set when present.
    pub region_codes: Option<Vec<String>>,
}

impl Config {
    pub fn from_env() -> Result<Self, Error> {
        let data_dir = PathBuf::from(env::var("DATA_DIR").unwrap_or_else(|_| "data".to_string()));
        Ok(Self {
            port: parse_var("PORT", 8402)?,
            csv_file: data_dir.join("license_plates.csv"),
            artifact_dir: data_dir.join("detected_plates"),
            detector_url: env::var("DETECTOR_URL")
                .unwrap_or_else(|_| "http://localhost:8500/detect".to_string()),
            ocr_url: env::var("OCR_URL")
                .unwrap_or_else(|_| "http://localhost:8501/ocr".to_string()),
            confidence_threshold: parse_var("CONFIDENCE_THRESHOLD", 0.8)?,
            dedup_window_secs: parse_var("DEDUP_WINDOW_SECS", 10)?,
            plate_class: parse_var("PLATE_CLASS", 0)?,
            region_codes: env::var("PLATE_REGION_CODES").ok().map(|codes| {
                codes
                    .split(',')
                    .map(|c| c.trim().to_string())
                    .filter(|c| !c.is_empty())
                    .collect()
            }),
        })
    }
}

fn parse_var<T: std::str::FromStr>(name: &str, default: T) -> Result<T, Error> {
    match env::var(name) {
        Ok(value) => value
            .parse()
            .map_err(|_| format_err!("Invalid value for {}: {}", name, value)),
        Err(_) => Ok(default),
    }
}
