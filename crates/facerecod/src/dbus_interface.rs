use crate::pipeline::TrackPipeline;
use image::{GrayImage, RgbImage};
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use zbus::interface;

pub const BUS_NAME: &str = "org.facereco.Recognizer1";
pub const OBJECT_PATH: &str = "/org/facereco/Recognizer1";

/// D-Bus interface for the face recognition daemon.
///
/// Bus name: org.facereco.Recognizer1
/// Object path: /org/facereco/Recognizer1
pub struct RecognizerService {
    pipeline: Arc<TrackPipeline>,
    db_path: PathBuf,
    threshold: Mutex<f32>,
}

impl RecognizerService {
    pub fn new(pipeline: Arc<TrackPipeline>, db_path: PathBuf, threshold: f32) -> Self {
        Self {
            pipeline,
            db_path,
            threshold: Mutex::new(threshold),
        }
    }

    fn current_threshold(&self) -> f32 {
        *self.threshold.lock().unwrap_or_else(|e| e.into_inner())
    }
}

fn failed(e: impl std::fmt::Display) -> zbus::fdo::Error {
    zbus::fdo::Error::Failed(e.to_string())
}

/// Decode the frames of one track. The first frame doubles as the
/// representative image.
fn load_track(paths: &[String]) -> Result<(Vec<GrayImage>, Option<RgbImage>), image::ImageError> {
    let mut frames = Vec::with_capacity(paths.len());
    let mut face_image = None;
    for path in paths {
        let img = image::open(path)?;
        if face_image.is_none() {
            face_image = Some(img.to_rgb8());
        }
        frames.push(img.to_luma8());
    }
    Ok((frames, face_image))
}

#[interface(name = "org.facereco.Recognizer1")]
impl RecognizerService {
    /// Identify one track given as image files of aligned face patches.
    /// Returns the track report as JSON.
    async fn identify(&self, paths: Vec<String>) -> zbus::fdo::Result<String> {
        tracing::info!(frames = paths.len(), "identify requested");
        if paths.is_empty() {
            return Err(zbus::fdo::Error::InvalidArgs("no frames given".into()));
        }

        let (frames, face_image) = tokio::task::spawn_blocking(move || load_track(&paths))
            .await
            .map_err(failed)?
            .map_err(|e| zbus::fdo::Error::InvalidArgs(e.to_string()))?;

        let report = self
            .pipeline
            .process_track(&frames, face_image)
            .await
            .map_err(failed)?;
        serde_json::to_string(&report).map_err(failed)
    }

    /// Return daemon status information.
    async fn status(&self) -> zbus::fdo::Result<String> {
        let store = self.pipeline.store();
        Ok(serde_json::json!({
            "version": env!("CARGO_PKG_VERSION"),
            "mode": self.pipeline.mode(),
            "distance_threshold": self.current_threshold(),
            "db_path": self.db_path.display().to_string(),
            "persons": store.person_count(),
            "tracks": store.total_tracks(),
            "descriptors": store.total_descriptors(),
            "size_bytes": store.size_bytes(),
        })
        .to_string())
    }

    /// List stored persons as JSON.
    async fn list_persons(&self) -> zbus::fdo::Result<String> {
        let summaries = self.pipeline.store().summaries();
        serde_json::to_string(&summaries).map_err(failed)
    }

    /// Merge `second` into `first`. Returns the merged person's new id.
    async fn merge_persons(&self, first: u32, second: u32) -> zbus::fdo::Result<u32> {
        tracing::info!(first, second, "merge requested");
        let merged = self
            .pipeline
            .exclusive(|store| store.merge(first as usize, second as usize))
            .await
            .map_err(failed)?;
        Ok(merged as u32)
    }

    async fn rename_person(&self, id: u32, name: &str) -> zbus::fdo::Result<()> {
        tracing::info!(id, name, "rename requested");
        self.pipeline
            .exclusive(|store| store.rename(id as usize, name))
            .await
            .map_err(failed)
    }

    async fn set_distance_threshold(&self, threshold: f64) -> zbus::fdo::Result<()> {
        let threshold = threshold as f32;
        if threshold.is_nan() || threshold <= 0.0 {
            return Err(zbus::fdo::Error::InvalidArgs(format!(
                "threshold {threshold} must be positive"
            )));
        }
        self.pipeline.set_distance_threshold(threshold).map_err(failed)?;
        *self.threshold.lock().unwrap_or_else(|e| e.into_inner()) = threshold;
        Ok(())
    }

    /// Write the database to its configured path.
    async fn save(&self) -> zbus::fdo::Result<()> {
        self.pipeline.save(self.db_path.clone()).await.map_err(failed)
    }

    /// Write the database to another file.
    async fn save_as(&self, path: String) -> zbus::fdo::Result<()> {
        tracing::info!(path = %path, "save requested");
        self.pipeline.save(PathBuf::from(path)).await.map_err(failed)
    }

    /// Replace the database with the contents of `path`. On failure the
    /// current database is kept.
    async fn load_database(&self, path: String) -> zbus::fdo::Result<()> {
        tracing::info!(path = %path, "load requested");
        self.pipeline.load(PathBuf::from(path)).await.map_err(failed)
    }

    /// Remove every person.
    async fn clear(&self) -> zbus::fdo::Result<()> {
        tracing::info!("clear requested");
        self.pipeline.exclusive(|store| store.clear()).await;
        Ok(())
    }
}
