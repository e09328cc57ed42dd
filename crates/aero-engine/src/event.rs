use std::collections::VecDeque;

use crate::error::FaultKind;

/// Why a run stopped without faulting.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HaltReason {
    /// `RET` with no outstanding call.
    Return,
    Hlt,
    BudgetExceeded,
}

/// Progress notifications, delivered in order through [`EventQueue`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EngineEvent {
    RunStarted { rip: u64 },
    /// Only emitted when per-instruction tracing is enabled.
    Retired { rip: u64, text: String },
    Trap { rip: u64, vector: u16, result: u64 },
    Faulted {
        rip: u64,
        kind: FaultKind,
        message: String,
    },
    Halted {
        rip: u64,
        executed: u64,
        reason: HaltReason,
    },
    Reset,
}

/// Bounded FIFO of [`EngineEvent`]s. When full, the oldest event is discarded.
#[derive(Debug, Clone)]
pub struct EventQueue {
    events: VecDeque<EngineEvent>,
    capacity: usize,
    dropped: u64,
}

impl EventQueue {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            events: VecDeque::with_capacity(capacity.min(64)),
            capacity,
            dropped: 0,
        }
    }

    pub fn push(&mut self, event: EngineEvent) {
        if self.events.len() == self.capacity {
            self.events.pop_front();
            self.dropped += 1;
        }
        self.events.push_back(event);
    }

    pub fn drain(&mut self) -> Vec<EngineEvent> {
        self.events.drain(..).collect()
    }

    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    /// Events discarded because the queue was full, since creation.
    pub fn dropped(&self) -> u64 {
        self.dropped
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn overflow_drops_oldest_and_counts() {
        let mut q = EventQueue::new(2);
        q.push(EngineEvent::RunStarted { rip: 1 });
        q.push(EngineEvent::RunStarted { rip: 2 });
        q.push(EngineEvent::Reset);
        assert_eq!(q.dropped(), 1);
        assert_eq!(
            q.drain(),
            vec![EngineEvent::RunStarted { rip: 2 }, EngineEvent::Reset]
        );
        assert!(q.is_empty());
    }
}
