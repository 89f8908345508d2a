mod api;
mod artifact;
mod config;
mod pipeline;
mod plate;
mod store;
mod types;
mod video;
mod vision;

use crate::config::Config;
use crate::pipeline::FramePipeline;
use crate::plate::PlateNormalizer;
use crate::store::{CsvStore, RecordStore};
use crate::vision::{HttpDetector, HttpTextReader};
use env_logger::Env;
use failure::Error;
use log::{error, info};
use std::fs;
use std::sync::Arc;

#[macro_use]
extern crate failure;

#[tokio::main]
async fn main() {
    env_logger::Builder::from_env(Env::default().default_filter_or("info")).init();
    info!("Starting plate-watch");
    if let Err(e) = run().await {
        error!("Fatal startup error: {}", e);
        std::process::exit(1);
    }
    info!("Exiting main");
}

async fn run() -> Result<(), Error> {
    let config = Config::from_env()?;
    fs::create_dir_all(&config.artifact_dir)?;

    let store = Arc::new(CsvStore::new(config.csv_file.clone()));
    store.ensure_initialized()?;
    info!("Detection log at {:?}", config.csv_file);

    let normalizer = match &config.region_codes {
        Some(codes) => PlateNormalizer::with_regions(codes),
        None => PlateNormalizer::default(),
    };
    let pipeline = Arc::new(FramePipeline::new(
        Arc::new(HttpDetector::new(
            config.detector_url.clone(),
            config.confidence_threshold,
        )),
        Arc::new(HttpTextReader::new(config.ocr_url.clone())),
        store.clone(),
        normalizer,
        config.artifact_dir.clone(),
        config.plate_class,
        config.dedup_window_secs,
    ));

    info!("Listening on port {}", config.port);
    api::serve(config.port, pipeline, store).await;
    Ok(())
}
