use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;

/// Histogram bins per spatial patch (58 uniform patterns + 1 catch-all).
pub const NUM_PATTERNS: usize = 59;
/// Spatial patches kept out of the 7x7 grid.
pub const NUM_PATCHES: usize = 39;
/// Length of a well-formed descriptor.
pub const DESCRIPTOR_LEN: usize = NUM_PATCHES * NUM_PATTERNS;

/// Default distance below which two descriptors are considered the same face.
pub const DEFAULT_DISTANCE_THRESHOLD: f32 = 0.37;

/// Per-patch chi-square weights, in kept-patch order.
///
/// ```text
///   0  1   2   3   4   5   6        2 1 1 1 1 1 2
///   7  8   9   10  11  12  13       2 4 4 1 4 4 2
///  14  15  16      17  18  19       1 1 1   1 1 1
///      20  21      22  23             1 1   1 1
///      24  25  26  27  28             1 1 1 1 1
///      29  30  31  32  33             1 1 2 1 1
///      34  35  36  37  38             1 1 1 1 1
/// ```
const PATCH_WEIGHTS: [f32; NUM_PATCHES] = [
    2.0, 1.0, 1.0, 1.0, 1.0, 1.0, 2.0, //
    2.0, 4.0, 4.0, 1.0, 4.0, 4.0, 2.0, //
    1.0, 1.0, 1.0, 1.0, 1.0, 1.0, //
    1.0, 1.0, 1.0, 1.0, //
    1.0, 1.0, 1.0, 1.0, 1.0, //
    1.0, 1.0, 2.0, 1.0, 1.0, //
    1.0, 1.0, 1.0, 1.0, 1.0,
];

/// Spatial LBP histogram of one aligned face observation.
///
/// The buffer is shared, so cloning a descriptor out of the store is cheap.
#[derive(Debug, Clone, PartialEq)]
pub struct Descriptor {
    values: Arc<[f32]>,
}

impl Descriptor {
    pub fn from_values(values: Vec<f32>) -> Self {
        Self {
            values: values.into(),
        }
    }

    pub fn values(&self) -> &[f32] {
        &self.values
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// True when the vector has the 39x59 layout the distance expects.
    pub fn is_well_formed(&self) -> bool {
        self.values.len() == DESCRIPTOR_LEN
    }

    /// Bytes occupied by the vector payload.
    pub fn size_bytes(&self) -> u64 {
        (self.values.len() * std::mem::size_of::<f32>()) as u64
    }

    /// Weighted chi-square distance between two descriptors.
    ///
    /// Returns a value in [0, inf). Lower = more similar. A malformed
    /// descriptor on either side yields `f32::MAX`, which never matches.
    pub fn distance(&self, other: &Descriptor) -> f32 {
        if !self.is_well_formed() || !other.is_well_formed() {
            return f32::MAX;
        }

        let mut distance = 0.0f32;
        let patches = self
            .values
            .chunks_exact(NUM_PATTERNS)
            .zip(other.values.chunks_exact(NUM_PATTERNS));

        for (weight, (a, b)) in PATCH_WEIGHTS.iter().zip(patches) {
            for (v1, v2) in a.iter().zip(b.iter()) {
                let sum = v1 + v2;
                if sum > 0.0 {
                    let diff = v1 - v2;
                    distance += weight * (diff * diff) / sum;
                }
            }
        }

        distance
    }
}

/// Counters reported with every search decision.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SearchStats {
    #[serde(rename = "search_time_ms", serialize_with = "as_millis")]
    pub elapsed: Duration,
    /// Queries that reached a result (match or full pass without one).
    pub queries_resolved: usize,
    /// Store entries compared across all queries.
    pub comparisons: u64,
}

fn as_millis<S: serde::Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
    s.serialize_u64(d.as_millis() as u64)
}

/// Final decision of a search session.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "result", rename_all = "snake_case")]
pub enum SearchOutcome {
    Found { person_id: usize, stats: SearchStats },
    NotFound { stats: SearchStats },
}

impl SearchOutcome {
    pub fn stats(&self) -> &SearchStats {
        match self {
            SearchOutcome::Found { stats, .. } | SearchOutcome::NotFound { stats } => stats,
        }
    }

    pub fn person_id(&self) -> Option<usize> {
        match self {
            SearchOutcome::Found { person_id, .. } => Some(*person_id),
            SearchOutcome::NotFound { .. } => None,
        }
    }
}

/// Read-only view of one person, for listings.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PersonSummary {
    pub id: usize,
    pub name: String,
    pub tracks: usize,
    pub descriptors: usize,
    pub size_bytes: u64,
    pub has_face_image: bool,
}
