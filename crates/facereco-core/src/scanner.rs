//! Fair round-robin traversal over every stored descriptor.
//!
//! Each `advance` moves to the next person that still has unread
//! descriptors, and within a person to its next unfinished track. When every
//! descriptor has been visited the scanner wraps back to (0, 0, 0), so
//! `is_at_start()` right after an `advance` means a full pass is complete.

/// Shape of the data being scanned.
///
/// Implemented by the store's read guard; tests use plain nested vectors.
pub trait Layout {
    fn person_count(&self) -> usize;
    fn track_count(&self, person: usize) -> usize;
    fn descriptor_count(&self, person: usize, track: usize) -> usize;
}

/// Coordinates of one stored descriptor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ScanPosition {
    pub person: usize,
    pub track: usize,
    pub descriptor: usize,
}

#[derive(Debug, Clone)]
struct PersonCursor {
    /// `None` once every track of the person is exhausted for this pass.
    active_track: Option<usize>,
    next_descriptor: Vec<usize>,
}

/// Resumable scan state.
///
/// Requires at least one person, every person with at least one track and
/// every track with at least one descriptor. Growth of the layout between
/// calls is picked up lazily; shrinking is not supported.
#[derive(Debug, Clone)]
pub struct FairScanner {
    person: usize,
    cursors: Vec<PersonCursor>,
}

impl FairScanner {
    pub fn new(layout: &impl Layout) -> Self {
        let mut scanner = Self {
            person: 0,
            cursors: Vec::new(),
        };
        scanner.reset(layout);
        scanner
    }

    /// Rewind to the beginning of a fresh pass.
    pub fn reset(&mut self, layout: &impl Layout) {
        self.person = 0;
        self.cursors = (0..layout.person_count())
            .map(|p| PersonCursor {
                active_track: Some(0),
                next_descriptor: vec![0; layout.track_count(p)],
            })
            .collect();
    }

    pub fn current(&self) -> ScanPosition {
        let cursor = &self.cursors[self.person];
        // The active person always has an active track between calls.
        let track = cursor.active_track.unwrap_or(0);
        ScanPosition {
            person: self.person,
            track,
            descriptor: cursor.next_descriptor[track],
        }
    }

    pub fn is_at_start(&self) -> bool {
        self.current()
            == ScanPosition {
                person: 0,
                track: 0,
                descriptor: 0,
            }
    }

    /// Step past the current descriptor.
    pub fn advance(&mut self, layout: &impl Layout) {
        self.grow(layout);

        let current_person = self.person;
        let track_count = layout.track_count(current_person);
        let cursor = &mut self.cursors[current_person];
        let Some(current_track) = cursor.active_track else {
            return;
        };
        cursor.next_descriptor[current_track] += 1;

        let unread = |cursor: &PersonCursor, t: usize| {
            cursor.next_descriptor[t] < layout.descriptor_count(current_person, t)
        };

        cursor.active_track = if track_count > 1 {
            let mut t = current_track;
            loop {
                t = (t + 1) % track_count;
                if unread(cursor, t) {
                    break Some(t);
                }
                if t == current_track {
                    break None;
                }
            }
        } else if unread(cursor, current_track) {
            Some(current_track)
        } else {
            None
        };

        let person_count = self.cursors.len();
        if person_count > 1 {
            let mut p = current_person;
            loop {
                p = (p + 1) % person_count;
                if self.cursors[p].active_track.is_some() {
                    self.person = p;
                    break;
                }
                if p == current_person {
                    self.reset(layout);
                    break;
                }
            }
        } else if self.cursors[current_person].active_track.is_none() {
            self.reset(layout);
        }
    }

    /// Extend the cursor tables to persons and tracks added since the last
    /// call. New entries start unread.
    fn grow(&mut self, layout: &impl Layout) {
        let person_count = layout.person_count();
        for (p, cursor) in self.cursors.iter_mut().enumerate() {
            let track_count = layout.track_count(p);
            if cursor.next_descriptor.len() < track_count {
                cursor.next_descriptor.resize(track_count, 0);
            }
        }
        for p in self.cursors.len()..person_count {
            self.cursors.push(PersonCursor {
                active_track: Some(0),
                next_descriptor: vec![0; layout.track_count(p)],
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    /// `shape[p][t]` = descriptor count of track t of person p.
    struct Shape(Vec<Vec<usize>>);

    impl Layout for Shape {
        fn person_count(&self) -> usize {
            self.0.len()
        }
        fn track_count(&self, person: usize) -> usize {
            self.0[person].len()
        }
        fn descriptor_count(&self, person: usize, track: usize) -> usize {
            self.0[person][track]
        }
    }

    /// Visit positions from a fresh scanner until it wraps around.
    fn one_pass(shape: &Shape) -> Vec<ScanPosition> {
        let mut scanner = FairScanner::new(shape);
        let mut visited = Vec::new();
        loop {
            visited.push(scanner.current());
            scanner.advance(shape);
            if scanner.is_at_start() {
                break;
            }
        }
        visited
    }

    fn assert_complete(shape: &Shape) {
        let visited = one_pass(shape);
        let total: usize = shape.0.iter().flatten().sum();
        assert_eq!(visited.len(), total, "shape {:?}", shape.0);

        let unique: HashSet<_> = visited.iter().copied().collect();
        assert_eq!(unique.len(), total, "duplicates in {:?}", shape.0);
        for pos in &visited {
            assert!(pos.descriptor < shape.0[pos.person][pos.track]);
        }
    }

    #[test]
    fn test_single_descriptor() {
        assert_complete(&Shape(vec![vec![1]]));
    }

    #[test]
    fn test_single_track() {
        assert_complete(&Shape(vec![vec![5]]));
    }

    #[test]
    fn test_uneven_tracks() {
        assert_complete(&Shape(vec![vec![3, 1, 4]]));
    }

    #[test]
    fn test_many_persons_uneven() {
        assert_complete(&Shape(vec![vec![2], vec![1, 5, 2], vec![7], vec![1, 1]]));
    }

    #[test]
    fn test_completeness_over_generated_shapes() {
        for persons in 1..5 {
            for tracks in 1..4 {
                for seed in 0..4 {
                    let shape = Shape(
                        (0..persons)
                            .map(|p| {
                                (0..tracks)
                                    .map(|t| 1 + (p * 3 + t * 5 + seed) % 4)
                                    .collect()
                            })
                            .collect(),
                    );
                    assert_complete(&shape);
                }
            }
        }
    }

    #[test]
    fn test_round_robin_order() {
        let shape = Shape(vec![vec![2, 1], vec![2]]);
        let visited: Vec<_> = one_pass(&shape)
            .into_iter()
            .map(|p| (p.person, p.track, p.descriptor))
            .collect();
        assert_eq!(
            visited,
            vec![(0, 0, 0), (1, 0, 0), (0, 1, 0), (1, 0, 1), (0, 0, 1)]
        );
    }

    #[test]
    fn test_passes_repeat_identically() {
        let shape = Shape(vec![vec![2, 3], vec![1], vec![4, 1]]);
        let mut scanner = FairScanner::new(&shape);
        let mut first = Vec::new();
        let mut second = Vec::new();
        for pass in [&mut first, &mut second] {
            loop {
                pass.push(scanner.current());
                scanner.advance(&shape);
                if scanner.is_at_start() {
                    break;
                }
            }
        }
        assert_eq!(first, second);
    }

    #[test]
    fn test_reset_mid_pass() {
        let shape = Shape(vec![vec![3], vec![3]]);
        let mut scanner = FairScanner::new(&shape);
        scanner.advance(&shape);
        scanner.advance(&shape);
        assert!(!scanner.is_at_start());
        scanner.reset(&shape);
        assert!(scanner.is_at_start());
    }

    #[test]
    fn test_growth_is_scanned() {
        let mut shape = Shape(vec![vec![2]]);
        let mut scanner = FairScanner::new(&shape);
        scanner.advance(&shape);
        // A new person arrives mid-pass.
        shape.0.push(vec![2]);
        let mut visited = vec![scanner.current()];
        loop {
            scanner.advance(&shape);
            if scanner.is_at_start() {
                break;
            }
            visited.push(scanner.current());
        }
        assert_eq!(visited.len(), 3);
        assert!(visited.iter().any(|p| p.person == 1));
    }
}
