// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! The per-APIC interrupt request queue.

use parking_lot::Mutex;
use std::collections::VecDeque;

/// A FIFO of pending vector numbers destined for one local APIC.
///
/// Any thread may enqueue (remote processors, the timer, virtual devices).
/// Only the owning processor dequeues, draining the queue into its IRR when
/// it reenters the guest. The lock is held only across O(1) queue operations.
#[derive(Debug)]
pub(crate) struct IrqQueue {
    vectors: Mutex<VecDeque<u32>>,
}

impl IrqQueue {
    pub fn new() -> Self {
        Self {
            vectors: Mutex::new(VecDeque::with_capacity(32)),
        }
    }

    pub fn enqueue(&self, vector: u32) {
        self.vectors.lock().push_back(vector);
    }

    pub fn dequeue(&self) -> Option<u32> {
        self.vectors.lock().pop_front()
    }

    pub fn clear(&self) {
        self.vectors.lock().clear();
    }
}
