//! Completion Hand-off
//!
//! Backends report swap completions and vblanks from their own tasks or
//! threads. They never touch server state directly: completions are queued
//! here and drained by the request loop at the start of its next tick.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::Notify;
use xdix_proto::Xid;

/// Swap completion event kinds
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SwapKind {
    Exchange = 1,
    Blit = 2,
    Flip = 3,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Completion {
    SwapComplete {
        drawable: Xid,
        ust: u64,
        msc: u64,
        sbc: u64,
        kind: SwapKind,
    },
    Vblank {
        screen: usize,
        ust: u64,
        msc: u64,
    },
}

#[derive(Default)]
struct Shared {
    queue: Mutex<VecDeque<Completion>>,
    notify: Notify,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, VecDeque<Completion>> {
        self.queue
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }
}

/// Consumer side, owned by the request loop
#[derive(Default)]
pub struct CompletionQueue {
    shared: Arc<Shared>,
}

/// Producer side, cloned into every backend
#[derive(Clone)]
pub struct CompletionSender {
    shared: Arc<Shared>,
}

/// Waits for new completions without borrowing the queue
#[derive(Clone)]
pub struct CompletionWaiter {
    shared: Arc<Shared>,
}

impl CompletionQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn sender(&self) -> CompletionSender {
        CompletionSender {
            shared: self.shared.clone(),
        }
    }

    pub fn waiter(&self) -> CompletionWaiter {
        CompletionWaiter {
            shared: self.shared.clone(),
        }
    }

    /// Take everything queued so far, oldest first
    pub fn drain(&self) -> Vec<Completion> {
        self.shared.lock().drain(..).collect()
    }
}

impl CompletionSender {
    pub fn push(&self, completion: Completion) {
        self.shared.lock().push_back(completion);
        self.shared.notify.notify_one();
    }
}

impl CompletionWaiter {
    pub async fn wait(&self) {
        self.shared.notify.notified().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_drain_preserves_order_across_threads() {
        let queue = CompletionQueue::new();
        let sender = queue.sender();
        let handle = std::thread::spawn(move || {
            for msc in 1..=3 {
                sender.push(Completion::Vblank {
                    screen: 0,
                    ust: msc * 16_667,
                    msc,
                });
            }
        });
        handle.join().unwrap();

        let drained = queue.drain();
        let mscs: Vec<u64> = drained
            .iter()
            .map(|c| match c {
                Completion::Vblank { msc, .. } => *msc,
                _ => 0,
            })
            .collect();
        assert_eq!(mscs, vec![1, 2, 3]);
        assert!(queue.drain().is_empty());
    }

    #[tokio::test]
    async fn test_waiter_wakes_on_push() {
        let queue = CompletionQueue::new();
        let waiter = queue.waiter();
        queue.sender().push(Completion::Vblank {
            screen: 0,
            ust: 0,
            msc: 1,
        });
        // permit is stored even though nobody was waiting yet
        waiter.wait().await;
        assert_eq!(queue.drain().len(), 1);
    }
}
