use std::{collections::VecDeque, sync::Mutex};

use crate::series::Series;

/// Work queue of series for one write phase.
///
/// A series popped off the pool is owned by the popping actor until it is put
/// back or retired, so no two actors ever hold the same series.
#[derive(Debug)]
pub struct SeriesPool {
    queue: Mutex<VecDeque<Series>>,
    retired: Mutex<Vec<Series>>,
    total: usize,
}
impl SeriesPool {
    pub fn new(series: Vec<Series>) -> Self {
        let total = series.len();
        Self {
            queue: Mutex::new(series.into()),
            retired: Mutex::new(vec![]),
            total,
        }
    }

    /// Take the next candidate from the back.
    pub fn pop(&self) -> Option<Series> {
        self.queue.lock().unwrap().pop_back()
    }
    /// Put a series back at the front, behind every other candidate.
    pub fn requeue(&self, series: Series) {
        self.queue.lock().unwrap().push_front(series);
    }
    /// Done for this phase: keep it for the read phase, off the queue.
    pub fn retire(&self, series: Series) {
        self.retired.lock().unwrap().push(series);
    }

    pub fn len(&self) -> usize {
        self.queue.lock().unwrap().len()
    }
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
    pub fn total(&self) -> usize {
        self.total
    }

    /// All series, queued and retired, ordered by unique name.
    ///
    /// # Panics
    ///
    /// If a series got lost, i.e. an actor dropped one instead of putting it
    /// back or retiring it.
    pub fn into_series(self) -> Vec<Series> {
        let mut all: Vec<Series> = self.queue.into_inner().unwrap().into();
        all.extend(self.retired.into_inner().unwrap());
        assert_eq!(
            all.len(),
            self.total,
            "series pool lost series during the write phase"
        );
        all.sort_by(|a, b| a.unique_name().cmp(b.unique_name()));
        all
    }
}
