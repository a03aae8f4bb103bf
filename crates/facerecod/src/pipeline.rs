//! Per-track processing: encode, identify, then learn.

use crate::engine::{EngineError, EngineEvent, IngestHandle, MatchEngineHandle};
use facereco_core::{lbp, PersistError, SearchOutcome, SearchPolicy, Store, StoreError, Target, WriteMode};
use image::{GrayImage, RgbImage};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{mpsc, Mutex};

#[derive(Error, Debug)]
pub enum PipelineError {
    #[error("no frame of the track could be encoded")]
    NoUsableFrames,
    #[error("engine error: {0}")]
    Engine(#[from] EngineError),
    #[error("ingestion failed: {0}")]
    Write(#[from] StoreError),
    #[error("database file error: {0}")]
    Persist(#[from] PersistError),
    #[error("database task failed: {0}")]
    Task(#[from] tokio::task::JoinError),
}

/// What the daemon does with each track.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProcessingMode {
    /// Identify, then store the track under the found or a new person.
    #[default]
    Learn,
    /// Identify only.
    Recognize,
    /// Identify using every frame of the track, without writing.
    Test,
}

impl FromStr for ProcessingMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "learn" => Ok(Self::Learn),
            "recognize" => Ok(Self::Recognize),
            "test" => Ok(Self::Test),
            other => Err(format!("unknown processing mode {other:?}")),
        }
    }
}

/// Outcome of processing one track.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TrackReport {
    pub outcome: SearchOutcome,
    /// Person the track now belongs to: the match, or the person created for
    /// it in learn mode.
    pub person_id: Option<usize>,
    pub new_person: bool,
    pub frames_used: usize,
    pub frames_skipped: usize,
    /// Descriptors written to the store.
    pub committed: usize,
}

/// Drives the workers for one track at a time.
///
/// Tracks and store edits are serialised by the pipeline lock, so ingestion
/// targets computed from the store counts stay valid until written.
pub struct TrackPipeline {
    store: Arc<Store>,
    matcher: MatchEngineHandle,
    ingest: IngestHandle,
    mode: ProcessingMode,
    policy: SearchPolicy,
    events: Mutex<mpsc::UnboundedReceiver<EngineEvent>>,
}

impl TrackPipeline {
    pub fn new(
        store: Arc<Store>,
        matcher: MatchEngineHandle,
        ingest: IngestHandle,
        events: mpsc::UnboundedReceiver<EngineEvent>,
        mode: ProcessingMode,
        policy: SearchPolicy,
    ) -> Self {
        Self {
            store,
            matcher,
            ingest,
            mode,
            policy,
            events: Mutex::new(events),
        }
    }

    pub fn mode(&self) -> ProcessingMode {
        self.mode
    }

    pub fn store(&self) -> &Arc<Store> {
        &self.store
    }

    pub fn set_distance_threshold(&self, threshold: f32) -> Result<(), PipelineError> {
        Ok(self.matcher.set_distance_threshold(threshold)?)
    }

    /// Halt both workers, discarding queued work, and wait for any track in
    /// flight to finish first.
    pub async fn shutdown(&self) -> Result<(), PipelineError> {
        let _guard = self.events.lock().await;
        self.matcher.stop(false)?;
        self.ingest.stop()?;
        Ok(())
    }

    /// Run `edit` on the store with no track in flight.
    pub async fn exclusive<R>(&self, edit: impl FnOnce(&Store) -> R) -> R {
        let _guard = self.events.lock().await;
        edit(&self.store)
    }

    /// Write the store to `path` on the blocking pool, with no track in flight.
    pub async fn save(&self, path: PathBuf) -> Result<(), PipelineError> {
        let _guard = self.events.lock().await;
        let store = Arc::clone(&self.store);
        tokio::task::spawn_blocking(move || store.save(&path)).await??;
        Ok(())
    }

    /// Replace the store with the database at `path`. The current contents
    /// are kept if the file cannot be read.
    pub async fn load(&self, path: PathBuf) -> Result<(), PipelineError> {
        let _guard = self.events.lock().await;
        let store = Arc::clone(&self.store);
        tokio::task::spawn_blocking(move || store.load(&path)).await??;
        Ok(())
    }

    /// Identify one track of aligned grayscale face patches and, in learn
    /// mode, store it.
    ///
    /// `face_image` represents the track if it ends up creating a person.
    pub async fn process_track(
        &self,
        frames: &[GrayImage],
        face_image: Option<RgbImage>,
    ) -> Result<TrackReport, PipelineError> {
        let mut events = self.events.lock().await;

        let mut descriptors = Vec::with_capacity(frames.len());
        for (i, frame) in frames.iter().enumerate() {
            match lbp::encode(frame) {
                Ok(d) => descriptors.push(d),
                Err(e) => tracing::warn!(frame = i, error = %e, "skipping frame"),
            }
        }
        if descriptors.is_empty() {
            return Err(PipelineError::NoUsableFrames);
        }
        let frames_skipped = frames.len() - descriptors.len();

        let policy = match self.mode {
            ProcessingMode::Test => SearchPolicy::CountBounded {
                queries: descriptors.len(),
            },
            ProcessingMode::Learn | ProcessingMode::Recognize => self.policy,
        };
        // Queries go in before the start so that a start which decides at
        // once (empty store) discards them along with its session.
        for d in &descriptors {
            self.matcher.push_query(d.clone());
        }
        self.matcher.start(policy)?;
        let outcome = await_decision(&mut events).await?;

        let mut report = TrackReport {
            person_id: outcome.person_id(),
            outcome,
            new_person: false,
            frames_used: descriptors.len(),
            frames_skipped,
            committed: 0,
        };

        if self.mode == ProcessingMode::Learn {
            let target = match report.person_id {
                Some(person) => Target {
                    person,
                    track: self.store.track_count(person),
                },
                None => {
                    if let Some(image) = face_image {
                        self.ingest.push_face_image(image);
                    }
                    report.new_person = true;
                    Target {
                        person: self.store.person_count(),
                        track: 0,
                    }
                }
            };
            report.person_id = Some(target.person);

            for d in descriptors {
                self.ingest.push_descriptor(d);
            }
            self.ingest.start(target, WriteMode::DrainQueue)?;
            report.committed = await_writing_done(&mut events).await?;
        }

        log_result(&self.store, self.mode, &report);
        Ok(report)
    }
}

async fn await_decision(
    events: &mut mpsc::UnboundedReceiver<EngineEvent>,
) -> Result<SearchOutcome, PipelineError> {
    while let Some(event) = events.recv().await {
        match event {
            EngineEvent::MatchFound { person_id, stats } => {
                return Ok(SearchOutcome::Found { person_id, stats })
            }
            EngineEvent::MatchNotFound { stats } => return Ok(SearchOutcome::NotFound { stats }),
            other => tracing::debug!(event = ?other, "ignoring event while searching"),
        }
    }
    Err(EngineError::ChannelClosed.into())
}

/// Wait for a drain session to finish, returning how many descriptors it wrote.
async fn await_writing_done(
    events: &mut mpsc::UnboundedReceiver<EngineEvent>,
) -> Result<usize, PipelineError> {
    let mut committed = 0;
    while let Some(event) = events.recv().await {
        match event {
            EngineEvent::PersonAdded(_) | EngineEvent::TrackAdded(_) | EngineEvent::DescriptorAdded(_) => {
                committed += 1
            }
            EngineEvent::WritingDone => return Ok(committed),
            EngineEvent::WriteFailed(e) => return Err(e.into()),
            other => tracing::debug!(event = ?other, "ignoring event while writing"),
        }
    }
    Err(EngineError::ChannelClosed.into())
}

fn log_result(store: &Store, mode: ProcessingMode, report: &TrackReport) {
    let stats = report.outcome.stats();
    let search_time_ms = stats.elapsed.as_millis() as u64;
    match report.person_id {
        Some(person) => tracing::info!(
            person,
            name = %store.name(person).unwrap_or_default(),
            new = report.new_person,
            ?mode,
            search_time_ms,
            queries = stats.queries_resolved,
            comparisons = stats.comparisons,
            "track identified"
        ),
        None => tracing::info!(
            ?mode,
            search_time_ms,
            queries = stats.queries_resolved,
            comparisons = stats.comparisons,
            "track not identified"
        ),
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::engine::{spawn_ingest_worker, spawn_match_engine};
    use std::time::Duration;

    /// Synthetic patches with clearly different textures per `kind % 3`.
    pub(crate) fn face(kind: u32) -> GrayImage {
        GrayImage::from_fn(64, 72, |x, y| {
            let on = match kind % 3 {
                0 => (x / 6) % 2 == 0,
                1 => (y / 6) % 2 == 0,
                _ => (x / 6 + y / 6) % 2 == 0,
            };
            image::Luma([if on { 200 } else { 30 }])
        })
    }

    pub(crate) fn pipeline(store: Arc<Store>, mode: ProcessingMode) -> TrackPipeline {
        let poll = Duration::from_millis(1);
        let (tx, rx) = mpsc::unbounded_channel();
        let matcher = spawn_match_engine(Arc::clone(&store), 0.37, poll, tx.clone()).unwrap();
        let ingest = spawn_ingest_worker(Arc::clone(&store), poll, tx).unwrap();
        let policy = SearchPolicy::CountBounded { queries: 1 };
        TrackPipeline::new(store, matcher, ingest, rx, mode, policy)
    }

    #[tokio::test]
    async fn test_learn_creates_then_recognizes() {
        let store = Arc::new(Store::new());
        let p = pipeline(Arc::clone(&store), ProcessingMode::Learn);

        let alice = [face(1), face(1)];
        let first = p
            .process_track(&alice, Some(RgbImage::new(4, 4)))
            .await
            .unwrap();
        assert_eq!(first.outcome.person_id(), None);
        assert_eq!(first.person_id, Some(0));
        assert!(first.new_person);
        assert_eq!(first.committed, 2);
        assert_eq!(store.person_count(), 1);
        assert!(store.face_image(0).is_some());

        let second = p.process_track(&alice, None).await.unwrap();
        assert_eq!(second.outcome.person_id(), Some(0));
        assert!(!second.new_person);
        assert_eq!(store.person_count(), 1);
        assert_eq!(store.track_count(0), 2);
        assert_eq!(store.total_descriptors(), 4);
    }

    #[tokio::test]
    async fn test_learn_new_face_adds_person() {
        let store = Arc::new(Store::new());
        let p = pipeline(Arc::clone(&store), ProcessingMode::Learn);
        p.process_track(&[face(1)], None).await.unwrap();
        let report = p.process_track(&[face(2)], None).await.unwrap();
        assert_eq!(report.person_id, Some(1));
        assert!(report.new_person);
        assert_eq!(store.person_count(), 2);
    }

    #[tokio::test]
    async fn test_recognize_does_not_write() {
        let store = Arc::new(Store::new());
        let p = pipeline(Arc::clone(&store), ProcessingMode::Recognize);
        let report = p.process_track(&[face(1)], None).await.unwrap();
        assert_eq!(report.person_id, None);
        assert_eq!(report.committed, 0);
        assert!(store.is_empty());
    }

    #[tokio::test]
    async fn test_test_mode_searches_every_frame() {
        let store = Arc::new(Store::new());
        pipeline(Arc::clone(&store), ProcessingMode::Learn)
            .process_track(&[face(0)], None)
            .await
            .unwrap();

        let p = pipeline(Arc::clone(&store), ProcessingMode::Test);
        let report = p.process_track(&[face(0), face(1), face(2)], None).await.unwrap();
        assert_eq!(report.outcome.person_id(), Some(0));
        assert_eq!(report.outcome.stats().queries_resolved, 3);
        assert_eq!(store.total_descriptors(), 1);
    }

    #[tokio::test]
    async fn test_unusable_frames() {
        let p = pipeline(Arc::new(Store::new()), ProcessingMode::Learn);
        let tiny = GrayImage::new(4, 4);
        assert!(matches!(
            p.process_track(&[tiny], None).await,
            Err(PipelineError::NoUsableFrames)
        ));
    }

    #[tokio::test]
    async fn test_skipped_frames_are_counted() {
        let p = pipeline(Arc::new(Store::new()), ProcessingMode::Learn);
        let report = p
            .process_track(&[GrayImage::new(4, 4), face(3)], None)
            .await
            .unwrap();
        assert_eq!(report.frames_used, 1);
        assert_eq!(report.frames_skipped, 1);
    }

    #[tokio::test]
    async fn test_save_then_load_replaces_store() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("faces.frdb");

        let store = Arc::new(Store::new());
        let p = pipeline(Arc::clone(&store), ProcessingMode::Learn);
        p.process_track(&[face(1)], None).await.unwrap();
        p.save(path.clone()).await.unwrap();

        p.process_track(&[face(2)], None).await.unwrap();
        assert_eq!(store.person_count(), 2);

        p.load(path).await.unwrap();
        assert_eq!(store.person_count(), 1);
        let report = p.process_track(&[face(1)], None).await.unwrap();
        assert_eq!(report.outcome.person_id(), Some(0));
    }

    #[tokio::test]
    async fn test_failed_load_keeps_store() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(Store::new());
        let p = pipeline(Arc::clone(&store), ProcessingMode::Learn);
        p.process_track(&[face(1)], None).await.unwrap();

        assert!(matches!(
            p.load(dir.path().join("missing.frdb")).await,
            Err(PipelineError::Persist(_))
        ));
        assert_eq!(store.person_count(), 1);
    }

    #[test]
    fn test_mode_parsing() {
        assert_eq!("learn".parse(), Ok(ProcessingMode::Learn));
        assert_eq!("Recognize".parse(), Ok(ProcessingMode::Recognize));
        assert_eq!("TEST".parse(), Ok(ProcessingMode::Test));
        assert!("enroll".parse::<ProcessingMode>().is_err());
    }
}
