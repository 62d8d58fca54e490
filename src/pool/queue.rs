//! # Bounded priority queue feeding the dispatcher.
//!
//! Three FIFO lanes (high, normal, low) behind one short-held mutex. The single
//! consumer parks on a [`Notify`] while the queue is empty.

use std::collections::VecDeque;
use std::sync::{Mutex, MutexGuard, PoisonError};

use tokio::sync::Notify;

use crate::pool::task::Priority;

/// Why a push was refused; the item is handed back.
pub(crate) enum PushError<T> {
    Full(T),
    Closed(T),
}

struct Lanes<T> {
    high: VecDeque<T>,
    normal: VecDeque<T>,
    low: VecDeque<T>,
    closed: bool,
}

impl<T> Lanes<T> {
    fn len(&self) -> usize {
        self.high.len() + self.normal.len() + self.low.len()
    }

    fn lane(&mut self, priority: Priority) -> &mut VecDeque<T> {
        match priority {
            Priority::High => &mut self.high,
            Priority::Normal => &mut self.normal,
            Priority::Low => &mut self.low,
        }
    }

    fn pop(&mut self) -> Option<T> {
        self.high
            .pop_front()
            .or_else(|| self.normal.pop_front())
            .or_else(|| self.low.pop_front())
    }
}

pub(crate) struct Queue<T> {
    lanes: Mutex<Lanes<T>>,
    /// `0` = unbounded.
    max_depth: usize,
    notify: Notify,
}

impl<T> Queue<T> {
    pub(crate) fn new(max_depth: usize) -> Self {
        Self {
            lanes: Mutex::new(Lanes {
                high: VecDeque::new(),
                normal: VecDeque::new(),
                low: VecDeque::new(),
                closed: false,
            }),
            max_depth,
            notify: Notify::new(),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Lanes<T>> {
        self.lanes.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn len(&self) -> usize {
        self.lock().len()
    }

    /// Enqueues `item`. When full, items rejected by `alive` are purged first.
    pub(crate) fn push(
        &self,
        item: T,
        priority: Priority,
        alive: impl Fn(&T) -> bool,
    ) -> Result<(), PushError<T>> {
        {
            let mut lanes = self.lock();
            if lanes.closed {
                return Err(PushError::Closed(item));
            }
            if self.max_depth > 0 && lanes.len() >= self.max_depth {
                lanes.high.retain(&alive);
                lanes.normal.retain(&alive);
                lanes.low.retain(&alive);
                if lanes.len() >= self.max_depth {
                    return Err(PushError::Full(item));
                }
            }
            lanes.lane(priority).push_back(item);
        }
        self.notify.notify_one();
        Ok(())
    }

    /// Next item by priority; `None` once closed and empty.
    pub(crate) async fn pop(&self) -> Option<T> {
        loop {
            let notified = self.notify.notified();
            {
                let mut lanes = self.lock();
                if let Some(item) = lanes.pop() {
                    return Some(item);
                }
                if lanes.closed {
                    return None;
                }
            }
            notified.await;
        }
    }

    /// Refuses further pushes; queued items are still handed out.
    pub(crate) fn close(&self) {
        self.lock().closed = true;
        self.notify.notify_waiters();
        self.notify.notify_one();
    }

    /// Removes and returns everything still queued.
    pub(crate) fn drain(&self) -> Vec<T> {
        let mut lanes = self.lock();
        let mut out = Vec::with_capacity(lanes.len());
        while let Some(item) = lanes.pop() {
            out.push(item);
        }
        out
    }
}
