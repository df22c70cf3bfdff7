use crate::error::Error;
use crate::room::Candidate;
use log::trace;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::{interval, timeout, MissedTickBehavior};

/// Collects candidates produced locally by the transport during a single negotiation round.
///
/// Transport pushes every discovered candidate and finally `None` once discovery is complete.
/// [CandidateGatherer::gather] waits for that end marker.
#[derive(Debug)]
pub struct CandidateGatherer {
    pending: Mutex<Vec<Option<Candidate>>>,
    interval: Duration,
}

impl CandidateGatherer {
    pub fn new(interval: Duration) -> Self {
        CandidateGatherer {
            pending: Mutex::new(Vec::new()),
            interval,
        }
    }

    /// Enqueues a candidate, or the end-of-candidates marker when `None`.
    pub async fn push(&self, candidate: Option<Candidate>) {
        let mut pending = self.pending.lock().await;
        pending.push(candidate);
    }

    /// Drops everything collected so far.
    pub async fn clear(&self) {
        self.pending.lock().await.clear();
    }

    /// Waits until the end marker shows up, then returns candidates in the order they were
    /// pushed and empties the queue. Fails with [Error::GatherTimeout] if the marker doesn't
    /// arrive within `deadline`, leaving the queue intact.
    pub async fn gather(&self, deadline: Duration) -> Result<Vec<Candidate>, Error> {
        let poll = async {
            let mut ticker = interval(self.interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                let mut pending = self.pending.lock().await;
                if pending.iter().any(Option::is_none) {
                    let candidates: Vec<_> = pending.drain(..).flatten().collect();
                    trace!("gathered {} local candidates", candidates.len());
                    return candidates;
                }
            }
        };
        timeout(deadline, poll)
            .await
            .map_err(|_| Error::GatherTimeout(deadline))
    }
}
