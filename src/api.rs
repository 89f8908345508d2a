use crate::pipeline::{ArtifactMode, FramePipeline};
use crate::store::RecordStore;
use crate::types::{DetectionRecord, RecordFilter};
use crate::video;
use bytes::Buf;
use chrono::{Local, NaiveDate, NaiveDateTime};
use futures::StreamExt;
use log::{error, info, warn};
use serde::Deserialize;
use serde_json::json;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use warp::Filter;

const MAX_IMAGE_UPLOAD: u64 = 32 * 1024 * 1024;
const MAX_VIDEO_UPLOAD: u64 = 512 * 1024 * 1024;

#[derive(Debug)]
struct ProcessingError;

impl warp::reject::Reject for ProcessingError {}

#[derive(Debug, Deserialize)]
struct FilterParams {
    start_date: Option<String>,
    end_date: Option<String>,
    plate_number: Option<String>,
}

#[derive(Debug, Deserialize)]
struct SearchParams {
    plate_number: String,
}

pub async fn serve(port: u16, pipeline: Arc<FramePipeline>, store: Arc<dyn RecordStore>) {
    let routes = routes(pipeline, store);
    warp::serve(routes).run(([0, 0, 0, 0], port)).await;
}

fn routes(
    pipeline: Arc<FramePipeline>,
    store: Arc<dyn RecordStore>,
) -> impl Filter<Extract = impl warp::Reply, Error = warp::Rejection> + Clone {
    let with_pipeline = {
        let pipeline = pipeline.clone();
        warp::any().map(move || pipeline.clone())
    };
    let with_store = warp::any().map(move || store.clone());

    let health = warp::get()
        .and(warp::path!("health"))
        .map(|| warp::reply::json(&json!({"status": "healthy"})));

    let process_image = warp::post()
        .and(warp::path!("process_image"))
        .and(warp::filters::multipart::form().max_length(MAX_IMAGE_UPLOAD))
        .and(with_pipeline.clone())
        .and_then(|form, pipeline| async {
            let result = handle_image(form, pipeline).await;
            if let Err(e) = &result {
                error!("Error processing uploaded image: {:?}", e);
            }
            result.map_err(|_| warp::reject::custom(ProcessingError))
        });

    let process_video = warp::post()
        .and(warp::path!("process_video"))
        .and(warp::filters::multipart::form().max_length(MAX_VIDEO_UPLOAD))
        .and(with_pipeline)
        .and_then(|form, pipeline| async {
            let result = handle_video(form, pipeline).await;
            if let Err(e) = &result {
                error!("Error accepting uploaded video: {:?}", e);
            }
            result.map_err(|_| warp::reject::custom(ProcessingError))
        });

    let get_results = warp::get()
        .and(warp::path!("get_results"))
        .and(with_store.clone())
        .map(|store: Arc<dyn RecordStore>| warp::reply::json(&store.list_all()));

    let filter_results = warp::get()
        .and(warp::path!("filter_results"))
        .and(warp::query::<FilterParams>())
        .and(with_store.clone())
        .map(|params: FilterParams, store: Arc<dyn RecordStore>| {
            let filter = match build_filter(&params) {
                Ok(filter) => filter,
                Err(e) => {
                    warn!("Rejecting filter request: {}", e);
                    return warp::reply::json(&Vec::<DetectionRecord>::new());
                }
            };
            warp::reply::json(&store.list_filtered(&filter))
        });

    let search_plate = warp::get()
        .and(warp::path!("search_plate"))
        .and(warp::query::<SearchParams>())
        .and(with_store)
        .map(|params: SearchParams, store: Arc<dyn RecordStore>| {
            match store.find_first(&params.plate_number) {
                Some(record) => warp::reply::json(&record),
                None => warp::reply::json(&json!({})),
            }
        });

    health
        .or(process_image)
        .or(process_video)
        .or(get_results)
        .or(filter_results)
        .or(search_plate)
}

async fn handle_image(
    form: warp::filters::multipart::FormData,
    pipeline: Arc<FramePipeline>,
) -> Result<impl warp::Reply, Box<dyn std::error::Error>> {
    let data = collect_file_part(form).await?;
    let records = tokio::task::spawn_blocking(move || -> Result<_, failure::Error> {
        let image = image::load_from_memory(&data)?;
        // Stills persist the full source frame as evidence.
        pipeline.detect_and_process(&image, ArtifactMode::FullFrame)
    })
    .await??;
    info!("Image processing complete: {} new detection(s)", records.len());
    Ok(warp::reply::json(&json!({"status": "image processing completed"})))
}

async fn handle_video(
    form: warp::filters::multipart::FormData,
    pipeline: Arc<FramePipeline>,
) -> Result<impl warp::Reply, Box<dyn std::error::Error>> {
    let data = collect_file_part(form).await?;
    let scratch = scratch_path();
    std::fs::write(&scratch, &data)?;
    info!("Video upload materialized to {:?}", scratch);

    // Fire and forget: the session owns the scratch file from here and
    // deletes it when it finishes.
    tokio::spawn(async move {
        let result = tokio::task::spawn_blocking(move || {
            video::run_session_and_cleanup(&pipeline, &scratch)
        })
        .await;
        if let Err(e) = result {
            error!("Video session task failed: {}", e);
        }
    });

    Ok(warp::reply::json(&json!({"status": "video processing initiated"})))
}

async fn collect_file_part(
    mut form: warp::filters::multipart::FormData,
) -> Result<Vec<u8>, Box<dyn std::error::Error>> {
    let mut data: Option<Vec<u8>> = None;
    while let Some(part) = form.next().await {
        let part = part?;
        match part.name() {
            "file" => {
                let mut collected: Vec<u8> = vec![];
                let mut stream = part.stream();
                while let Some(buf) = stream.next().await {
                    collected.extend_from_slice(buf?.bytes());
                }
                data = Some(collected);
            }
            other => {
                warn!("Ignoring multipart part {}", other);
            }
        }
    }
    data.ok_or_else(|| format_err!("Missing file part in upload").into())
}

fn build_filter(params: &FilterParams) -> Result<RecordFilter, failure::Error> {
    Ok(RecordFilter {
        start: params.start_date.as_deref().map(parse_bound).transpose()?,
        end: params.end_date.as_deref().map(parse_bound).transpose()?,
        plate_fragment: params.plate_number.clone(),
    })
}

/// Accepts a full ISO datetime or a bare date, the latter read as midnight.
fn parse_bound(value: &str) -> Result<NaiveDateTime, failure::Error> {
    if let Ok(datetime) = NaiveDateTime::parse_from_str(value, "%Y-%m-%dT%H:%M:%S%.f") {
        return Ok(datetime);
    }
    NaiveDate::parse_from_str(value, "%Y-%m-%d")
        .map(|date| date.and_hms(0, 0, 0))
        .map_err(|_| format_err!("Unrecognized date '{}'", value))
}

static UPLOAD_SEQ: AtomicU64 = AtomicU64::new(0);

fn scratch_path() -> PathBuf {
    let seq = UPLOAD_SEQ.fetch_add(1, Ordering::Relaxed);
    std::env::temp_dir().join(format!(
        "plate_watch_upload_{}_{}.mjpeg",
        Local::now().format("%Y%m%d_%H%M%S_%6f"),
        seq
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::plate::PlateNormalizer;
    use crate::store::CsvStore;
    use crate::types::{DetectionBox, OcrLine};
    use crate::vision::{PlateDetector, TextReader};
    use chrono::Duration;
    use failure::Error;
    use image::{DynamicImage, GrayImage};
    use tempfile::tempdir;

    struct IdleDetector;

    impl PlateDetector for IdleDetector {
        fn detect(&self, _image: &DynamicImage) -> Result<Vec<DetectionBox>, Error> {
            Ok(Vec::new())
        }
    }

    struct IdleReader;

    impl TextReader for IdleReader {
        fn read(&self, _plate: &GrayImage) -> Result<Vec<OcrLine>, Error> {
            Ok(Vec::new())
        }
    }

    fn seeded_store(dir: &std::path::Path) -> Arc<CsvStore> {
        let store = Arc::new(CsvStore::new(dir.join("plates.csv")));
        store.ensure_initialized().unwrap();
        for (plate, age) in &[("MH 12 AB 1234", 3600), ("DL 04 C 9876", 60)] {
            store
                .append(&DetectionRecord {
                    timestamp: crate::store::now_timestamp() - Duration::seconds(*age),
                    plate_number: plate.to_string(),
                    image_path: "data/detected_plates/test.jpg".to_string(),
                })
                .unwrap();
        }
        store
    }

    fn test_routes(
        store: Arc<CsvStore>,
        artifact_dir: PathBuf,
    ) -> impl Filter<Extract = impl warp::Reply, Error = warp::Rejection> + Clone {
        let pipeline = Arc::new(FramePipeline::new(
            Arc::new(IdleDetector),
            Arc::new(IdleReader),
            store.clone(),
            PlateNormalizer::default(),
            artifact_dir,
            0,
            10,
        ));
        routes(pipeline, store)
    }

    #[tokio::test]
    async fn health_reports_healthy() {
        let dir = tempdir().unwrap();
        let routes = test_routes(seeded_store(dir.path()), dir.path().to_path_buf());
        let response = warp::test::request().path("/health").reply(&routes).await;
        assert_eq!(response.status(), 200);
        assert_eq!(response.body(), r#"{"status":"healthy"}"#);
    }

    #[tokio::test]
    async fn get_results_returns_every_record() {
        let dir = tempdir().unwrap();
        let routes = test_routes(seeded_store(dir.path()), dir.path().to_path_buf());
        let response = warp::test::request()
            .path("/get_results")
            .reply(&routes)
            .await;
        assert_eq!(response.status(), 200);
        let body: serde_json::Value = serde_json::from_slice(response.body()).unwrap();
        assert_eq!(body.as_array().unwrap().len(), 2);
        assert_eq!(body[0]["license_plate"], "MH 12 AB 1234");
    }

    #[tokio::test]
    async fn filter_results_applies_query_parameters() {
        let dir = tempdir().unwrap();
        let routes = test_routes(seeded_store(dir.path()), dir.path().to_path_buf());
        let response = warp::test::request()
            .path("/filter_results?plate_number=dl%2004")
            .reply(&routes)
            .await;
        let body: serde_json::Value = serde_json::from_slice(response.body()).unwrap();
        assert_eq!(body.as_array().unwrap().len(), 1);
        assert_eq!(body[0]["license_plate"], "DL 04 C 9876");
    }

    #[tokio::test]
    async fn filter_results_with_bad_date_returns_empty_list() {
        let dir = tempdir().unwrap();
        let routes = test_routes(seeded_store(dir.path()), dir.path().to_path_buf());
        let response = warp::test::request()
            .path("/filter_results?start_date=yesterday")
            .reply(&routes)
            .await;
        assert_eq!(response.status(), 200);
        assert_eq!(response.body(), "[]");
    }

    #[tokio::test]
    async fn search_plate_returns_first_match_or_empty_object() {
        let dir = tempdir().unwrap();
        let routes = test_routes(seeded_store(dir.path()), dir.path().to_path_buf());
        let found = warp::test::request()
            .path("/search_plate?plate_number=MH")
            .reply(&routes)
            .await;
        let body: serde_json::Value = serde_json::from_slice(found.body()).unwrap();
        assert_eq!(body["license_plate"], "MH 12 AB 1234");

        let missing = warp::test::request()
            .path("/search_plate?plate_number=KA")
            .reply(&routes)
            .await;
        assert_eq!(missing.body(), "{}");
    }

    #[test]
    fn parse_bound_accepts_dates_and_datetimes() {
        assert_eq!(
            parse_bound("2026-08-07").unwrap(),
            NaiveDate::from_ymd(2026, 8, 7).and_hms(0, 0, 0)
        );
        assert_eq!(
            parse_bound("2026-08-07T10:30:00.500").unwrap(),
            NaiveDate::from_ymd(2026, 8, 7).and_hms_milli(10, 30, 0, 500)
        );
        assert!(parse_bound("last tuesday").is_err());
    }

    #[test]
    fn scratch_paths_are_unique() {
        assert_ne!(scratch_path(), scratch_path());
    }
}
