//! facereco-core: face descriptor matching and identity storage.
//!
//! Encodes aligned face patches as spatial LBP histograms, keeps them in a
//! person/track hierarchy and searches it incrementally, one comparison per
//! step, so callers can drive searches and ingestion from worker loops.

pub mod lbp;
pub mod persist;
pub mod queue;
pub mod scanner;
pub mod search;
pub mod store;
pub mod types;
pub mod writer;

pub use lbp::{LbpError, LbpImage};
pub use persist::PersistError;
pub use queue::WorkQueue;
pub use search::{MatchSession, SearchPolicy, SearchStep};
pub use store::{CommitEvent, Person, Store, StoreError, Target, Track};
pub use types::{Descriptor, PersonSummary, SearchOutcome, SearchStats, DEFAULT_DISTANCE_THRESHOLD};
pub use writer::{IngestQueues, IngestSession, WriteMode, WriteStep};
