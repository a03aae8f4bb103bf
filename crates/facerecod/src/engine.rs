use facereco_core::{
    CommitEvent, Descriptor, IngestQueues, IngestSession, MatchSession, SearchOutcome, SearchPolicy,
    SearchStats, SearchStep, Store, StoreError, Target, WorkQueue, WriteMode, WriteStep,
};
use image::RgbImage;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::mpsc::{self, error::TryRecvError};

#[derive(Error, Debug)]
pub enum EngineError {
    #[error("failed to spawn worker thread: {0}")]
    Spawn(#[from] std::io::Error),
    #[error("worker thread exited")]
    ChannelClosed,
}

/// Notifications emitted by the worker threads.
#[derive(Debug, Clone, PartialEq)]
pub enum EngineEvent {
    MatchFound { person_id: usize, stats: SearchStats },
    MatchNotFound { stats: SearchStats },
    PersonAdded(usize),
    TrackAdded(usize),
    DescriptorAdded(usize),
    WritingDone,
    WriteFailed(StoreError),
}

impl From<SearchOutcome> for EngineEvent {
    fn from(outcome: SearchOutcome) -> Self {
        match outcome {
            SearchOutcome::Found { person_id, stats } => EngineEvent::MatchFound { person_id, stats },
            SearchOutcome::NotFound { stats } => EngineEvent::MatchNotFound { stats },
        }
    }
}

impl From<CommitEvent> for EngineEvent {
    fn from(event: CommitEvent) -> Self {
        match event {
            CommitEvent::PersonAdded(p) => EngineEvent::PersonAdded(p),
            CommitEvent::TrackAdded(p) => EngineEvent::TrackAdded(p),
            CommitEvent::DescriptorAdded(p) => EngineEvent::DescriptorAdded(p),
        }
    }
}

/// Control messages for the match engine thread.
enum MatchControl {
    Start(SearchPolicy),
    Stop { finalize: bool },
    SetThreshold(f32),
}

/// Control messages for the ingestion thread.
enum IngestControl {
    Start { target: Target, mode: WriteMode },
    Stop,
}

/// Clone-safe handle to the match engine thread.
#[derive(Clone)]
pub struct MatchEngineHandle {
    tx: mpsc::UnboundedSender<MatchControl>,
    queries: Arc<WorkQueue<Descriptor>>,
}

impl MatchEngineHandle {
    /// Start a search session. The decision arrives as a `MatchFound` or
    /// `MatchNotFound` event.
    pub fn start(&self, policy: SearchPolicy) -> Result<(), EngineError> {
        self.send(MatchControl::Start(policy))
    }

    /// Stop the running session, reporting a decision from the results so
    /// far when `finalize` is set.
    pub fn stop(&self, finalize: bool) -> Result<(), EngineError> {
        self.send(MatchControl::Stop { finalize })
    }

    pub fn set_distance_threshold(&self, threshold: f32) -> Result<(), EngineError> {
        self.send(MatchControl::SetThreshold(threshold))
    }

    /// Queue a descriptor to be identified by the current session.
    pub fn push_query(&self, descriptor: Descriptor) {
        self.queries.push(descriptor);
    }

    fn send(&self, msg: MatchControl) -> Result<(), EngineError> {
        self.tx.send(msg).map_err(|_| EngineError::ChannelClosed)
    }
}

/// Clone-safe handle to the ingestion thread.
#[derive(Clone)]
pub struct IngestHandle {
    tx: mpsc::UnboundedSender<IngestControl>,
    queues: Arc<IngestQueues>,
}

impl IngestHandle {
    /// Start writing queued descriptors towards `target`.
    pub fn start(&self, target: Target, mode: WriteMode) -> Result<(), EngineError> {
        self.send(IngestControl::Start { target, mode })
    }

    pub fn stop(&self) -> Result<(), EngineError> {
        self.send(IngestControl::Stop)
    }

    pub fn push_descriptor(&self, descriptor: Descriptor) {
        self.queues.descriptors.push(descriptor);
    }

    /// Offer the representative image used if the next commit creates a person.
    pub fn push_face_image(&self, image: RgbImage) {
        self.queues.face_images.push(image);
    }

    fn send(&self, msg: IngestControl) -> Result<(), EngineError> {
        self.tx.send(msg).map_err(|_| EngineError::ChannelClosed)
    }
}

/// Spawn the match engine on a dedicated OS thread.
///
/// The thread blocks while idle and otherwise performs one search step per
/// loop iteration, picking up control messages between steps.
pub fn spawn_match_engine(
    store: Arc<Store>,
    threshold: f32,
    poll_interval: Duration,
    events: mpsc::UnboundedSender<EngineEvent>,
) -> Result<MatchEngineHandle, EngineError> {
    let queries = Arc::new(WorkQueue::new());
    let mut session = MatchSession::new(Arc::clone(&queries));
    session.set_threshold(threshold);

    let (tx, mut rx) = mpsc::unbounded_channel::<MatchControl>();

    std::thread::Builder::new()
        .name("facereco-match".into())
        .spawn(move || {
            tracing::info!(threshold, "match engine thread started");
            let emit = |event: EngineEvent| {
                let _ = events.send(event);
            };
            let handle = |session: &mut MatchSession, msg: MatchControl| match msg {
                MatchControl::Start(policy) => {
                    if let Some(outcome) = session.start(policy, &store) {
                        emit(outcome.into());
                    }
                }
                MatchControl::Stop { finalize } => {
                    if let Some(outcome) = session.stop(finalize) {
                        emit(outcome.into());
                    }
                }
                MatchControl::SetThreshold(t) => {
                    tracing::info!(threshold = t, "distance threshold changed");
                    session.set_threshold(t);
                }
            };

            'worker: loop {
                loop {
                    match rx.try_recv() {
                        Ok(msg) => handle(&mut session, msg),
                        Err(TryRecvError::Empty) => break,
                        Err(TryRecvError::Disconnected) => break 'worker,
                    }
                }

                if !session.is_searching() {
                    match rx.blocking_recv() {
                        Some(msg) => {
                            handle(&mut session, msg);
                            continue;
                        }
                        None => break,
                    }
                }

                match session.step(&store) {
                    SearchStep::Progress => {}
                    SearchStep::Idle => std::thread::sleep(poll_interval),
                    SearchStep::Finished(outcome) => emit(outcome.into()),
                }
            }
            tracing::info!("match engine thread exiting");
        })?;

    Ok(MatchEngineHandle { tx, queries })
}

/// Spawn the ingestion worker on a dedicated OS thread.
pub fn spawn_ingest_worker(
    store: Arc<Store>,
    poll_interval: Duration,
    events: mpsc::UnboundedSender<EngineEvent>,
) -> Result<IngestHandle, EngineError> {
    let queues = Arc::new(IngestQueues::new());
    let mut session = IngestSession::new(Arc::clone(&queues));

    let (tx, mut rx) = mpsc::unbounded_channel::<IngestControl>();

    std::thread::Builder::new()
        .name("facereco-ingest".into())
        .spawn(move || {
            tracing::info!("ingest thread started");
            let handle = |session: &mut IngestSession, msg: IngestControl| match msg {
                IngestControl::Start { target, mode } => session.start(target, mode),
                IngestControl::Stop => session.stop(),
            };

            'worker: loop {
                loop {
                    match rx.try_recv() {
                        Ok(msg) => handle(&mut session, msg),
                        Err(TryRecvError::Empty) => break,
                        Err(TryRecvError::Disconnected) => break 'worker,
                    }
                }

                if !session.is_writing() {
                    match rx.blocking_recv() {
                        Some(msg) => {
                            handle(&mut session, msg);
                            continue;
                        }
                        None => break,
                    }
                }

                let event = match session.step(&store) {
                    WriteStep::Committed(event) => event.into(),
                    WriteStep::Idle => {
                        std::thread::sleep(poll_interval);
                        continue;
                    }
                    WriteStep::Done => EngineEvent::WritingDone,
                    WriteStep::Failed(e) => EngineEvent::WriteFailed(e),
                };
                let _ = events.send(event);
            }
            tracing::info!("ingest thread exiting");
        })?;

    Ok(IngestHandle { tx, queues })
}
