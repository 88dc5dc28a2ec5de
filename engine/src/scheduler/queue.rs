//! Two-class FIFO of deployments waiting for a worker

use std::collections::VecDeque;
use std::sync::Mutex;

use serde::Serialize;
use tokio::sync::Notify;

use crate::models::deployment::Priority;

#[derive(Default)]
struct Lanes {
    interactive: VecDeque<String>,
    automated: VecDeque<String>,
}

impl Lanes {
    fn lane(&mut self, priority: Priority) -> &mut VecDeque<String> {
        match priority {
            Priority::Interactive => &mut self.interactive,
            Priority::Automated => &mut self.automated,
        }
    }
}

/// Queue depth per class
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct QueueDepth {
    pub interactive: usize,
    pub automated: usize,
}

impl QueueDepth {
    pub fn total(&self) -> usize {
        self.interactive + self.automated
    }
}

/// FIFO within each class; interactive work always goes first
#[derive(Default)]
pub struct DeploymentQueue {
    lanes: Mutex<Lanes>,
    notify: Notify,
}

impl DeploymentQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a deployment id; duplicates are ignored
    pub fn push(&self, id: &str, priority: Priority) {
        {
            let mut lanes = self.lanes.lock().unwrap_or_else(|e| e.into_inner());
            if lanes.interactive.iter().chain(lanes.automated.iter()).any(|queued| queued == id) {
                return;
            }
            lanes.lane(priority).push_back(id.to_string());
        }
        self.notify.notify_one();
    }

    pub fn try_pop(&self) -> Option<String> {
        let mut lanes = self.lanes.lock().unwrap_or_else(|e| e.into_inner());
        lanes
            .interactive
            .pop_front()
            .or_else(|| lanes.automated.pop_front())
    }

    /// Wait for the next deployment id
    pub async fn pop(&self) -> String {
        loop {
            let notified = self.notify.notified();
            if let Some(id) = self.try_pop() {
                // pass the wake-up on if more work is waiting
                if !self.is_empty() {
                    self.notify.notify_one();
                }
                return id;
            }
            notified.await;
        }
    }

    /// Drop a queued id; returns whether it was queued
    pub fn remove(&self, id: &str) -> bool {
        let mut guard = self.lanes.lock().unwrap_or_else(|e| e.into_inner());
        let lanes = &mut *guard;
        for lane in [&mut lanes.interactive, &mut lanes.automated] {
            if let Some(position) = lane.iter().position(|queued| queued == id) {
                lane.remove(position);
                return true;
            }
        }
        false
    }

    pub fn depth(&self) -> QueueDepth {
        let lanes = self.lanes.lock().unwrap_or_else(|e| e.into_inner());
        QueueDepth {
            interactive: lanes.interactive.len(),
            automated: lanes.automated.len(),
        }
    }

    pub fn len(&self) -> usize {
        self.depth().total()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
