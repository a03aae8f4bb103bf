//! Incremental match search.
//!
//! A [`MatchSession`] compares queued query descriptors against the store one
//! comparison per [`MatchSession::step`], so the caller can interleave control
//! messages and enforce deadlines between steps.

use crate::queue::WorkQueue;
use crate::scanner::FairScanner;
use crate::store::Store;
use crate::types::{Descriptor, SearchOutcome, SearchStats, DEFAULT_DISTANCE_THRESHOLD};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// When a search session decides.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SearchPolicy {
    /// Decide once this many queries have a result.
    CountBounded { queries: usize },
    /// Decide after `max`, or after `min` once any query matched.
    TimeBounded { min: Duration, max: Duration },
}

/// Result of one unit of search work.
#[derive(Debug, Clone, PartialEq)]
pub enum SearchStep {
    /// One comparison was made.
    Progress,
    /// Searching, but no query is queued.
    Idle,
    Finished(SearchOutcome),
}

/// `(distance, person)`; `person == None` marks a query that matched nobody.
type QueryResult = (f32, Option<usize>);

struct ActiveSearch {
    policy: SearchPolicy,
    scanner: FairScanner,
    in_flight: Option<Descriptor>,
    results: Vec<QueryResult>,
    matched: bool,
    comparisons: u64,
    started: Instant,
}

impl ActiveSearch {
    fn stats(&self) -> SearchStats {
        SearchStats {
            elapsed: self.started.elapsed(),
            queries_resolved: self.results.len(),
            comparisons: self.comparisons,
        }
    }
}

pub struct MatchSession {
    threshold: f32,
    queries: Arc<WorkQueue<Descriptor>>,
    active: Option<ActiveSearch>,
}

impl MatchSession {
    pub fn new(queries: Arc<WorkQueue<Descriptor>>) -> Self {
        Self {
            threshold: DEFAULT_DISTANCE_THRESHOLD,
            queries,
            active: None,
        }
    }

    pub fn queries(&self) -> &Arc<WorkQueue<Descriptor>> {
        &self.queries
    }

    pub fn threshold(&self) -> f32 {
        self.threshold
    }

    /// Distances strictly below the threshold count as a match. Takes effect
    /// from the next comparison.
    pub fn set_threshold(&mut self, threshold: f32) {
        self.threshold = threshold;
    }

    pub fn is_searching(&self) -> bool {
        self.active.is_some()
    }

    /// Begin a session.
    ///
    /// Returns an immediate `NotFound` with zero statistics when there is
    /// nothing to search (empty store or a zero query budget); the session
    /// then stays idle and the query queue is cleared, as after any decision.
    /// Otherwise queries queued before the start are kept.
    pub fn start(&mut self, policy: SearchPolicy, store: &Store) -> Option<SearchOutcome> {
        let catalog = store.read();
        let no_budget = matches!(policy, SearchPolicy::CountBounded { queries: 0 });
        if catalog.is_empty() || no_budget {
            self.active = None;
            self.queries.clear();
            tracing::debug!(?policy, "nothing to search");
            return Some(SearchOutcome::NotFound {
                stats: SearchStats::default(),
            });
        }

        self.active = Some(ActiveSearch {
            policy,
            scanner: FairScanner::new(&*catalog),
            in_flight: None,
            results: Vec::new(),
            matched: false,
            comparisons: 0,
            started: Instant::now(),
        });
        tracing::debug!(?policy, threshold = self.threshold, "search started");
        None
    }

    /// Perform at most one comparison.
    pub fn step(&mut self, store: &Store) -> SearchStep {
        let Some(active) = self.active.as_mut() else {
            return SearchStep::Idle;
        };

        if let SearchPolicy::TimeBounded { min, max } = active.policy {
            let elapsed = active.started.elapsed();
            if elapsed > max || (elapsed > min && active.matched) {
                return self.finish();
            }
        }

        let catalog = store.read();
        if catalog.is_empty() {
            drop(catalog);
            return self.finish();
        }

        if active.in_flight.is_none() {
            let Some(query) = self.queries.pop() else {
                return SearchStep::Idle;
            };
            active.in_flight = Some(query);
            active.scanner.reset(&*catalog);
        }

        let pos = active.scanner.current();
        let Some(stored) = catalog.descriptor(pos.person, pos.track, pos.descriptor) else {
            // The store shrank under the scan; start the pass over.
            active.scanner.reset(&*catalog);
            return SearchStep::Progress;
        };

        let distance = match &active.in_flight {
            Some(query) => stored.distance(query),
            None => f32::MAX,
        };
        active.comparisons += 1;
        active.scanner.advance(&*catalog);
        drop(catalog);

        let result = if distance < self.threshold {
            active.matched = true;
            Some((distance, Some(pos.person)))
        } else if active.scanner.is_at_start() {
            Some((f32::INFINITY, None))
        } else {
            None
        };

        if let Some(result) = result {
            active.results.push(result);
            active.in_flight = None;

            if let SearchPolicy::CountBounded { queries } = active.policy {
                if active.results.len() >= queries {
                    return self.finish();
                }
            }
        }

        SearchStep::Progress
    }

    /// End the session. Idempotent.
    ///
    /// The query queue is always cleared. With `finalize` set, a running
    /// session reports its decision from the results gathered so far.
    pub fn stop(&mut self, finalize: bool) -> Option<SearchOutcome> {
        if !finalize {
            self.queries.clear();
            if self.active.take().is_some() {
                tracing::debug!("search cancelled");
            }
            return None;
        }
        match self.finish() {
            SearchStep::Finished(outcome) => Some(outcome),
            _ => {
                self.queries.clear();
                None
            }
        }
    }

    fn finish(&mut self) -> SearchStep {
        let Some(active) = self.active.take() else {
            return SearchStep::Idle;
        };
        self.queries.clear();

        let stats = active.stats();
        let best = active
            .results
            .iter()
            .copied()
            .min_by(|a, b| a.0.total_cmp(&b.0));

        let outcome = match best {
            Some((_, Some(person_id))) => SearchOutcome::Found { person_id, stats },
            _ => SearchOutcome::NotFound { stats },
        };

        tracing::debug!(
            person = ?outcome.person_id(),
            search_time_ms = stats.elapsed.as_millis() as u64,
            queries = stats.queries_resolved,
            comparisons = stats.comparisons,
            "search finished"
        );
        SearchStep::Finished(outcome)
    }
}
