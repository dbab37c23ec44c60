//! Bounded-concurrency execution of part transfers.
//!
//! The scheduler owns the cursor over the parts that still need to be transferred and the set of
//! transfers currently in flight.  Whenever a transfer finishes the free slot is refilled
//! immediately, unless the job is paused, stopped, or has already failed.  Slots left free by a
//! pause are refilled as soon as the job is resumed, even while other parts are still in flight.  The decision whether
//! the job is finished is made after every single completion, so it can't be missed when the last
//! two transfers complete back to back.
use crate::Result;
use futures::stream::FuturesUnordered;
use futures::{FutureExt, StreamExt};
use std::collections::VecDeque;
use std::future::Future;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error};

/// How a single part transfer ended, when it didn't fail
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum PartOutcome {
    /// The part was transferred and recorded
    Uploaded,

    /// The transfer was cancelled.  Not an error, but the part still needs to be transferred.
    Aborted,
}

/// How a scheduler run ended, when it didn't fail
#[derive(Clone, Debug, PartialEq, Eq)]
pub(crate) enum ScheduleOutcome {
    /// Every part was transferred
    Drained,

    /// Transfers were stopped by cancellation; these parts were never transferred, in ascending
    /// order
    Stopped { remaining: Vec<u32> },
}

/// Events the scheduler reports to its owner as it goes
pub(crate) trait ScheduleObserver: Send {
    fn part_launched(&mut self, _part_number: u32, _in_flight: usize) {}
    fn paused(&mut self, _remaining: usize) {}
    fn resumed(&mut self) {}
}

impl ScheduleObserver for () {}

pub(crate) struct Scheduler {
    pending: VecDeque<u32>,
    concurrency: usize,
    paused: watch::Receiver<bool>,
    stop: CancellationToken,
}

impl Scheduler {
    /// Schedule `parts` (in the order given) with at most `concurrency` in flight.
    ///
    /// Launching stops while `paused` is `true`, and for good once `stop` is cancelled.
    pub(crate) fn new(
        parts: impl IntoIterator<Item = u32>,
        concurrency: usize,
        paused: watch::Receiver<bool>,
        stop: CancellationToken,
    ) -> Self {
        Self {
            pending: parts.into_iter().collect(),
            concurrency: concurrency.max(1),
            paused,
            stop,
        }
    }

    fn is_paused(&self) -> bool {
        *self.paused.borrow()
    }

    /// Run transfers until every part is done, the job is stopped, or a transfer fails.
    ///
    /// `launch` produces the future which transfers one part.  A hard failure of any transfer
    /// prevents further launches; transfers already in flight are allowed to finish, and then the
    /// first failure is returned.  Later failures are logged and dropped.
    pub(crate) async fn run<F, Fut, O>(&mut self, mut launch: F, observer: &mut O) -> Result<ScheduleOutcome>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<PartOutcome>>,
        O: ScheduleObserver,
    {
        let mut active = FuturesUnordered::new();
        let mut failure = None;
        let mut stopped = false;

        loop {
            // Fill every free slot
            while failure.is_none() && !stopped && active.len() < self.concurrency {
                if self.stop.is_cancelled() {
                    stopped = true;
                    break;
                }

                if self.is_paused() {
                    break;
                }

                match self.pending.pop_front() {
                    Some(part_number) => {
                        active.push(launch(part_number).map(move |result| (part_number, result)));
                        observer.part_launched(part_number, active.len());
                    }
                    None => break,
                }
            }

            if active.is_empty() {
                if let Some(e) = failure {
                    return Err(e);
                }

                if stopped || self.stop.is_cancelled() {
                    let mut remaining = self.pending.drain(..).collect::<Vec<_>>();
                    remaining.sort_unstable();

                    return Ok(ScheduleOutcome::Stopped { remaining });
                }

                if self.pending.is_empty() {
                    return Ok(ScheduleOutcome::Drained);
                }

                // Nothing in flight, parts left, not stopped: the only way to get here is being
                // paused.  Wait until resumed or stopped.
                observer.paused(self.pending.len());
                debug!(remaining = self.pending.len(), "Scheduling paused");
                self.wait_while_paused().await;
                if !self.stop.is_cancelled() {
                    observer.resumed();
                    debug!("Scheduling resumed");
                }

                continue;
            }

            // Paused with slots free: a resume has to refill them without waiting for an
            // in-flight part to finish first
            let held_by_pause = failure.is_none()
                && !stopped
                && active.len() < self.concurrency
                && !self.pending.is_empty()
                && self.is_paused();

            let next = if held_by_pause {
                tokio::select! {
                    next = active.next() => next,
                    changed = self.paused.changed() => {
                        if changed.is_err() {
                            self.stop.cancel();
                        }
                        continue;
                    }
                    _ = self.stop.cancelled() => continue,
                }
            } else {
                active.next().await
            };

            if let Some((part_number, result)) = next {
                match result {
                    Ok(PartOutcome::Uploaded) => {}
                    Ok(PartOutcome::Aborted) => {
                        debug!(part_number, "Part aborted; no further parts will be launched");
                        self.pending.push_front(part_number);
                        stopped = true;
                    }
                    Err(e) => {
                        if failure.is_none() {
                            error!(part_number, ?e, "Part transfer failed; draining in-flight parts");
                            failure = Some(e);
                        } else {
                            error!(part_number, ?e, "Another part transfer failed after the first failure");
                        }
                    }
                }
            }
        }
    }

    async fn wait_while_paused(&mut self) {
        while self.is_paused() && !self.stop.is_cancelled() {
            tokio::select! {
                _ = self.stop.cancelled() => {}
                changed = self.paused.changed() => {
                    if changed.is_err() {
                        // Whoever could resume us is gone, so this job can never continue
                        self.stop.cancel();
                    }
                }
            }
        }
    }
}
