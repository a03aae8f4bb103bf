//! Hierarchical identity store: persons own tracks, tracks own descriptors.
//!
//! Ids are dense positional indices. Cached aggregates are updated in the
//! same critical section as the structural change they describe.

use crate::persist::{self, PersistError};
use crate::scanner::Layout;
use crate::types::{Descriptor, PersonSummary};
use image::RgbImage;
use std::fs::File;
use std::io::{BufReader, BufWriter, Write};
use std::path::Path;
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};
use thiserror::Error;

/// Name given to persons created by ingestion.
pub const UNKNOWN_PERSON_NAME: &str = "<unknown>";

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StoreError {
    #[error("no person with id {0}")]
    NoSuchPerson(usize),
    #[error("person {person} has no track {track}")]
    NoSuchTrack { person: usize, track: usize },
    #[error("cannot merge person {0} into itself")]
    SelfMerge(usize),
    #[error("commit target ({person}, {track}) is neither existing nor the next free id")]
    TargetOutOfRange { person: usize, track: usize },
    #[error("a new person needs at least one descriptor")]
    EmptyPerson,
    #[error("a track needs at least one descriptor")]
    EmptyTrack,
}

/// One contiguous observation of a face.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Track {
    descriptors: Vec<Descriptor>,
    size_bytes: u64,
}

impl Track {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_descriptor(descriptor: Descriptor) -> Self {
        let mut track = Self::new();
        track.push(descriptor);
        track
    }

    /// Append a descriptor, returning its id within the track.
    pub fn push(&mut self, descriptor: Descriptor) -> usize {
        let id = self.descriptors.len();
        self.size_bytes += descriptor.size_bytes();
        self.descriptors.push(descriptor);
        id
    }

    pub fn descriptor(&self, id: usize) -> Option<&Descriptor> {
        self.descriptors.get(id)
    }

    pub fn descriptors(&self) -> &[Descriptor] {
        &self.descriptors
    }

    pub fn len(&self) -> usize {
        self.descriptors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.descriptors.is_empty()
    }

    pub fn size_bytes(&self) -> u64 {
        self.size_bytes
    }

    pub(crate) fn from_parts(descriptors: Vec<Descriptor>, size_bytes: u64) -> Self {
        Self {
            descriptors,
            size_bytes,
        }
    }
}

/// A named or unnamed identity.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Person {
    name: String,
    face_image: Option<RgbImage>,
    tracks: Vec<Track>,
    descriptor_count: usize,
    size_bytes: u64,
}

impl Person {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Self::default()
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn set_name(&mut self, name: impl Into<String>) {
        self.name = name.into();
    }

    pub fn face_image(&self) -> Option<&RgbImage> {
        self.face_image.as_ref()
    }

    pub fn set_face_image(&mut self, image: Option<RgbImage>) {
        self.face_image = image;
    }

    pub fn tracks(&self) -> &[Track] {
        &self.tracks
    }

    pub fn track(&self, id: usize) -> Option<&Track> {
        self.tracks.get(id)
    }

    pub fn track_count(&self) -> usize {
        self.tracks.len()
    }

    pub fn descriptor_count(&self) -> usize {
        self.descriptor_count
    }

    pub fn size_bytes(&self) -> u64 {
        self.size_bytes
    }

    /// Append a non-empty track, returning its id within the person.
    pub fn add_track(&mut self, track: Track) -> Result<usize, StoreError> {
        if track.is_empty() {
            return Err(StoreError::EmptyTrack);
        }
        Ok(self.push_track(track))
    }

    fn push_track(&mut self, track: Track) -> usize {
        let id = self.tracks.len();
        self.descriptor_count += track.len();
        self.size_bytes += track.size_bytes();
        self.tracks.push(track);
        id
    }

    /// Append to an existing track. `None` if the track does not exist.
    pub fn add_descriptor(&mut self, track: usize, descriptor: Descriptor) -> Option<usize> {
        let size = descriptor.size_bytes();
        let id = self.tracks.get_mut(track)?.push(descriptor);
        self.descriptor_count += 1;
        self.size_bytes += size;
        Some(id)
    }

    /// Move every track of `other` to the end of this person.
    fn absorb(&mut self, other: Person) {
        for track in other.tracks {
            self.push_track(track);
        }
    }

    pub(crate) fn from_parts(
        name: String,
        face_image: Option<RgbImage>,
        tracks: Vec<Track>,
        descriptor_count: usize,
        size_bytes: u64,
    ) -> Self {
        Self {
            name,
            face_image,
            tracks,
            descriptor_count,
            size_bytes,
        }
    }
}

/// Where an ingestion commit should land.
///
/// `person == person_count` creates a person; otherwise
/// `track == track_count(person)` creates a track; otherwise the descriptor is
/// appended. The value is resolved against the current counts on every
/// commit, so a target that once meant "create" means "append" afterwards.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Target {
    pub person: usize,
    pub track: usize,
}

/// What a single commit did to the store.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommitEvent {
    PersonAdded(usize),
    TrackAdded(usize),
    DescriptorAdded(usize),
}

/// Unlocked contents of the store.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Catalog {
    persons: Vec<Person>,
    track_count: usize,
    descriptor_count: usize,
    size_bytes: u64,
}

impl Catalog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.persons.is_empty()
    }

    pub fn persons(&self) -> &[Person] {
        &self.persons
    }

    pub fn person(&self, id: usize) -> Option<&Person> {
        self.persons.get(id)
    }

    pub fn total_tracks(&self) -> usize {
        self.track_count
    }

    pub fn total_descriptors(&self) -> usize {
        self.descriptor_count
    }

    pub fn size_bytes(&self) -> u64 {
        self.size_bytes
    }

    pub fn descriptor(&self, person: usize, track: usize, descriptor: usize) -> Option<&Descriptor> {
        self.persons.get(person)?.track(track)?.descriptor(descriptor)
    }

    pub fn add_person(&mut self, person: Person) -> Result<usize, StoreError> {
        if person.descriptor_count() == 0 {
            return Err(StoreError::EmptyPerson);
        }
        if person.tracks().iter().any(Track::is_empty) {
            return Err(StoreError::EmptyTrack);
        }
        self.track_count += person.track_count();
        self.descriptor_count += person.descriptor_count();
        self.size_bytes += person.size_bytes();

        let id = self.persons.len();
        self.persons.push(person);
        Ok(id)
    }

    pub fn add_track(&mut self, person: usize, track: Track) -> Result<usize, StoreError> {
        let p = self.persons.get_mut(person).ok_or(StoreError::NoSuchPerson(person))?;
        let (len, size) = (track.len(), track.size_bytes());
        let id = p.add_track(track)?;
        self.track_count += 1;
        self.descriptor_count += len;
        self.size_bytes += size;
        Ok(id)
    }

    pub fn add_descriptor(
        &mut self,
        person: usize,
        track: usize,
        descriptor: Descriptor,
    ) -> Result<usize, StoreError> {
        let p = self.persons.get_mut(person).ok_or(StoreError::NoSuchPerson(person))?;
        let size = descriptor.size_bytes();
        let id = p
            .add_descriptor(track, descriptor)
            .ok_or(StoreError::NoSuchTrack { person, track })?;
        self.descriptor_count += 1;
        self.size_bytes += size;
        Ok(id)
    }

    /// Resolve `target` against the current counts and apply the descriptor.
    ///
    /// `face_image` is only consulted when a new person is created.
    pub fn commit(
        &mut self,
        target: Target,
        descriptor: Descriptor,
        face_image: impl FnOnce() -> Option<RgbImage>,
    ) -> Result<CommitEvent, StoreError> {
        let person_count = self.persons.len();

        if target.person == person_count {
            let mut person = Person::new(UNKNOWN_PERSON_NAME);
            person.push_track(Track::with_descriptor(descriptor));
            person.set_face_image(face_image());
            let id = self.add_person(person)?;
            return Ok(CommitEvent::PersonAdded(id));
        }

        let track_count = match self.persons.get(target.person) {
            Some(p) => p.track_count(),
            None => {
                return Err(StoreError::TargetOutOfRange {
                    person: target.person,
                    track: target.track,
                })
            }
        };

        if target.track == track_count {
            self.add_track(target.person, Track::with_descriptor(descriptor))?;
            Ok(CommitEvent::TrackAdded(target.person))
        } else if target.track < track_count {
            self.add_descriptor(target.person, target.track, descriptor)?;
            Ok(CommitEvent::DescriptorAdded(target.person))
        } else {
            Err(StoreError::TargetOutOfRange {
                person: target.person,
                track: target.track,
            })
        }
    }

    /// Append the tracks of `second` to `first` and remove `second`.
    ///
    /// Returns the id of the merged person after removal.
    pub fn merge(&mut self, first: usize, second: usize) -> Result<usize, StoreError> {
        if first == second {
            return Err(StoreError::SelfMerge(first));
        }
        for id in [first, second] {
            if id >= self.persons.len() {
                return Err(StoreError::NoSuchPerson(id));
            }
        }

        let absorbed = self.persons.remove(second);
        let merged_id = if second > first { first } else { first - 1 };
        self.persons[merged_id].absorb(absorbed);
        Ok(merged_id)
    }

    pub fn rename(&mut self, person: usize, name: impl Into<String>) -> Result<(), StoreError> {
        self.persons
            .get_mut(person)
            .ok_or(StoreError::NoSuchPerson(person))?
            .set_name(name);
        Ok(())
    }

    pub fn clear(&mut self) {
        *self = Self::default();
    }

    pub fn summaries(&self) -> Vec<PersonSummary> {
        self.persons
            .iter()
            .enumerate()
            .map(|(id, p)| PersonSummary {
                id,
                name: p.name().to_string(),
                tracks: p.track_count(),
                descriptors: p.descriptor_count(),
                size_bytes: p.size_bytes(),
                has_face_image: p.face_image().is_some(),
            })
            .collect()
    }

    pub(crate) fn from_parts(
        persons: Vec<Person>,
        track_count: usize,
        descriptor_count: usize,
        size_bytes: u64,
    ) -> Self {
        Self {
            persons,
            track_count,
            descriptor_count,
            size_bytes,
        }
    }
}

impl Layout for Catalog {
    fn person_count(&self) -> usize {
        self.persons.len()
    }

    fn track_count(&self, person: usize) -> usize {
        self.persons.get(person).map_or(0, Person::track_count)
    }

    fn descriptor_count(&self, person: usize, track: usize) -> usize {
        self.persons
            .get(person)
            .and_then(|p| p.track(track))
            .map_or(0, Track::len)
    }
}

/// Thread-safe identity store.
///
/// A single reader/writer lock guards the whole catalog: appends, commits and
/// merges are atomic with respect to readers such as a running scan.
#[derive(Debug, Default)]
pub struct Store {
    catalog: RwLock<Catalog>,
}

impl Store {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_catalog(catalog: Catalog) -> Self {
        Self {
            catalog: RwLock::new(catalog),
        }
    }

    /// Shared access for multi-call reads that must see one consistent state.
    pub fn read(&self) -> RwLockReadGuard<'_, Catalog> {
        // Every mutation completes its bookkeeping before it can panic, so the
        // catalog behind a poisoned lock is still consistent.
        self.catalog.read().unwrap_or_else(|e| e.into_inner())
    }

    pub fn write(&self) -> RwLockWriteGuard<'_, Catalog> {
        self.catalog.write().unwrap_or_else(|e| e.into_inner())
    }

    pub fn is_empty(&self) -> bool {
        self.read().is_empty()
    }

    pub fn person_count(&self) -> usize {
        self.read().person_count()
    }

    pub fn total_tracks(&self) -> usize {
        self.read().total_tracks()
    }

    pub fn track_count(&self, person: usize) -> usize {
        self.read().track_count(person)
    }

    pub fn total_descriptors(&self) -> usize {
        self.read().total_descriptors()
    }

    pub fn person_descriptor_count(&self, person: usize) -> usize {
        self.read().person(person).map_or(0, Person::descriptor_count)
    }

    pub fn descriptor_count(&self, person: usize, track: usize) -> usize {
        self.read().descriptor_count(person, track)
    }

    pub fn size_bytes(&self) -> u64 {
        self.read().size_bytes()
    }

    pub fn person_size_bytes(&self, person: usize) -> u64 {
        self.read().person(person).map_or(0, Person::size_bytes)
    }

    pub fn descriptor(&self, person: usize, track: usize, descriptor: usize) -> Option<Descriptor> {
        self.read().descriptor(person, track, descriptor).cloned()
    }

    pub fn name(&self, person: usize) -> Option<String> {
        self.read().person(person).map(|p| p.name().to_string())
    }

    pub fn face_image(&self, person: usize) -> Option<RgbImage> {
        self.read().person(person).and_then(|p| p.face_image().cloned())
    }

    pub fn summaries(&self) -> Vec<PersonSummary> {
        self.read().summaries()
    }

    pub fn add_person(&self, person: Person) -> Result<usize, StoreError> {
        self.write().add_person(person)
    }

    pub fn add_track(&self, person: usize, track: Track) -> Result<usize, StoreError> {
        self.write().add_track(person, track)
    }

    pub fn add_descriptor(&self, person: usize, track: usize, descriptor: Descriptor) -> Result<usize, StoreError> {
        self.write().add_descriptor(person, track, descriptor)
    }

    /// See [`Catalog::commit`]; resolution and mutation share one write lock.
    pub fn commit(
        &self,
        target: Target,
        descriptor: Descriptor,
        face_image: impl FnOnce() -> Option<RgbImage>,
    ) -> Result<CommitEvent, StoreError> {
        self.write().commit(target, descriptor, face_image)
    }

    pub fn merge(&self, first: usize, second: usize) -> Result<usize, StoreError> {
        let merged = self.write().merge(first, second)?;
        tracing::info!(first, second, merged, "persons merged");
        Ok(merged)
    }

    pub fn rename(&self, person: usize, name: &str) -> Result<(), StoreError> {
        self.write().rename(person, name)
    }

    pub fn clear(&self) {
        self.write().clear();
        tracing::info!("database cleared");
    }

    /// Write the database to `path`.
    ///
    /// The data goes to a sibling temporary file first and replaces `path`
    /// only once fully written.
    pub fn save(&self, path: &Path) -> Result<(), PersistError> {
        if let Some(dir) = path.parent().filter(|d| !d.as_os_str().is_empty()) {
            std::fs::create_dir_all(dir)?;
        }
        let tmp = temp_path(path);
        {
            let catalog = self.read();
            let mut out = BufWriter::new(File::create(&tmp)?);
            persist::write_catalog(&catalog, &mut out)?;
            out.flush()?;
            out.get_ref().sync_all()?;
        }
        std::fs::rename(&tmp, path)?;

        tracing::info!(path = %path.display(), "database saved");
        Ok(())
    }

    /// Replace the contents with the database stored at `path`.
    ///
    /// On any failure the current contents are left untouched.
    pub fn load(&self, path: &Path) -> Result<(), PersistError> {
        let mut input = BufReader::new(File::open(path)?);
        let loaded = persist::read_catalog(&mut input)?;

        let persons = loaded.person_count();
        let descriptors = loaded.total_descriptors();
        *self.write() = loaded;

        tracing::info!(path = %path.display(), persons, descriptors, "database loaded");
        Ok(())
    }
}

/// `<path>.tmp`, next to the target so the final rename stays on one filesystem.
pub(crate) fn temp_path(path: &Path) -> std::path::PathBuf {
    let mut name = path.as_os_str().to_owned();
    name.push(".tmp");
    name.into()
}
