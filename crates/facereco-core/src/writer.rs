//! Incremental ingestion of descriptors into the store.

use crate::queue::WorkQueue;
use crate::store::{CommitEvent, Store, StoreError, Target};
use crate::types::Descriptor;
use image::RgbImage;
use std::sync::Arc;

/// FIFOs filled by the producer and drained by an [`IngestSession`].
#[derive(Debug, Default)]
pub struct IngestQueues {
    pub descriptors: WorkQueue<Descriptor>,
    /// Representative images, consumed only when a commit creates a person.
    pub face_images: WorkQueue<RgbImage>,
}

impl IngestQueues {
    pub fn new() -> Self {
        Self::default()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteMode {
    /// Keep waiting for descriptors until stopped.
    Continuous,
    /// Finish as soon as the descriptor queue is empty.
    DrainQueue,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WriteStep {
    Committed(CommitEvent),
    /// Writing, but the descriptor queue is empty.
    Idle,
    /// A drain session emptied the queue and ended.
    Done,
    /// The target could not be applied; the session has ended.
    Failed(StoreError),
}

pub struct IngestSession {
    queues: Arc<IngestQueues>,
    active: Option<(Target, WriteMode)>,
}

impl IngestSession {
    pub fn new(queues: Arc<IngestQueues>) -> Self {
        Self {
            queues,
            active: None,
        }
    }

    pub fn queues(&self) -> &Arc<IngestQueues> {
        &self.queues
    }

    pub fn is_writing(&self) -> bool {
        self.active.is_some()
    }

    /// Begin writing towards `target`.
    ///
    /// The target is kept as given for the whole session. A target meaning
    /// "new person" or "new track" turns into "append to it" once the first
    /// commit has created it.
    pub fn start(&mut self, target: Target, mode: WriteMode) {
        tracing::debug!(person = target.person, track = target.track, ?mode, "writing started");
        self.active = Some((target, mode));
    }

    /// Commit at most one queued descriptor.
    pub fn step(&mut self, store: &Store) -> WriteStep {
        let Some((target, mode)) = self.active else {
            return WriteStep::Idle;
        };

        let Some(descriptor) = self.queues.descriptors.pop() else {
            return match mode {
                WriteMode::Continuous => WriteStep::Idle,
                WriteMode::DrainQueue => {
                    self.active = None;
                    tracing::debug!("write queue drained");
                    WriteStep::Done
                }
            };
        };

        match store.commit(target, descriptor, || self.queues.face_images.pop()) {
            Ok(event) => WriteStep::Committed(event),
            Err(e) => {
                tracing::error!(person = target.person, track = target.track, error = %e, "commit refused");
                self.active = None;
                WriteStep::Failed(e)
            }
        }
    }

    /// End the session and drop queued descriptors. Queued face images are
    /// kept. Idempotent.
    pub fn stop(&mut self) {
        self.queues.descriptors.clear();
        if self.active.take().is_some() {
            tracing::debug!("writing stopped");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scanner::Layout;
    use crate::store::tests::{catalog_with_shape, descriptor};

    fn session() -> IngestSession {
        IngestSession::new(Arc::new(IngestQueues::new()))
    }

    fn drain(session: &mut IngestSession, store: &Store) -> Vec<CommitEvent> {
        let mut events = Vec::new();
        loop {
            match session.step(store) {
                WriteStep::Committed(e) => events.push(e),
                WriteStep::Idle | WriteStep::Done => return events,
                WriteStep::Failed(e) => panic!("commit failed: {e}"),
            }
        }
    }

    #[test]
    fn test_new_person_self_corrects() {
        let store = Store::new();
        let mut s = session();
        s.start(Target { person: 0, track: 0 }, WriteMode::Continuous);

        let n = 4;
        s.queues().face_images.push(RgbImage::new(2, 2));
        s.queues().descriptors.push(descriptor(1.0));
        for i in 0..n {
            s.queues().descriptors.push(descriptor(2.0 + i as f32));
        }

        let events = drain(&mut s, &store);
        assert_eq!(events[0], CommitEvent::PersonAdded(0));
        assert!(events[1..].iter().all(|e| *e == CommitEvent::DescriptorAdded(0)));

        let catalog = store.read();
        assert_eq!(catalog.person_count(), 1);
        assert_eq!(catalog.track_count(0), 1);
        assert_eq!(catalog.descriptor_count(0, 0), n + 1);
        assert!(catalog.person(0).unwrap().face_image().is_some());
        assert!(s.is_writing());
    }

    #[test]
    fn test_new_track_for_known_person() {
        let store = Store::from_catalog(catalog_with_shape(&[&[1], &[2]]));
        let mut s = session();
        s.start(Target { person: 1, track: 1 }, WriteMode::DrainQueue);
        s.queues().descriptors.extend([descriptor(5.0), descriptor(6.0)]);

        let events = drain(&mut s, &store);
        assert_eq!(events, vec![CommitEvent::TrackAdded(1), CommitEvent::DescriptorAdded(1)]);
        assert_eq!(store.track_count(1), 2);
        assert_eq!(store.descriptor_count(1, 1), 2);
        assert_eq!(store.person_count(), 2);
        assert!(!s.is_writing());
    }

    #[test]
    fn test_face_image_left_for_existing_person() {
        let store = Store::from_catalog(catalog_with_shape(&[&[1]]));
        let mut s = session();
        s.queues().face_images.push(RgbImage::new(2, 2));
        s.start(Target { person: 0, track: 1 }, WriteMode::DrainQueue);
        s.queues().descriptors.push(descriptor(1.0));
        drain(&mut s, &store);
        assert_eq!(s.queues().face_images.len(), 1);
        assert!(store.face_image(0).is_none());
    }

    #[test]
    fn test_drain_on_empty_queue_is_done() {
        let store = Store::new();
        let mut s = session();
        s.start(Target { person: 0, track: 0 }, WriteMode::DrainQueue);
        assert_eq!(s.step(&store), WriteStep::Done);
        assert_eq!(s.step(&store), WriteStep::Idle);
        assert!(store.is_empty());
    }

    #[test]
    fn test_out_of_range_target_halts() {
        let store = Store::from_catalog(catalog_with_shape(&[&[1]]));
        let mut s = session();
        s.start(Target { person: 3, track: 0 }, WriteMode::Continuous);
        s.queues().descriptors.push(descriptor(1.0));
        assert_eq!(
            s.step(&store),
            WriteStep::Failed(StoreError::TargetOutOfRange { person: 3, track: 0 })
        );
        assert!(!s.is_writing());
        assert_eq!(store.total_descriptors(), 1);
    }

    #[test]
    fn test_stop_clears_descriptors_only() {
        let mut s = session();
        s.start(Target { person: 0, track: 0 }, WriteMode::Continuous);
        s.queues().descriptors.extend([descriptor(1.0), descriptor(2.0)]);
        s.queues().face_images.push(RgbImage::new(1, 1));
        s.stop();
        s.stop();
        assert!(!s.is_writing());
        assert!(s.queues().descriptors.is_empty());
        assert_eq!(s.queues().face_images.len(), 1);
    }
}
