//! Run lifecycle events.
//!
//! The executor emits a fixed set of keyed events; listeners observe but
//! never mutate run state (they only see shared references). Fan-out is
//! synchronous and in registration order.

use chrono::{DateTime, Utc};
use indexmap::IndexMap;

use crate::executor::TaskExecutionResult;

/// Event keys for selective subscription.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    RunStart,
    PlanReady,
    DagReady,
    TaskScheduled,
    TaskStart,
    TaskEnd,
    DagRelease,
    Error,
    RunEnd,
}

/// Aggregate counters reported on `run:end`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct RunTotals {
    pub tasks: usize,
    pub failed: usize,
    pub succeeded: usize,
    pub unresolved: usize,
    pub missing_deps: usize,
}

#[derive(Debug, Clone)]
pub enum RunEvent {
    RunStart {
        started_at: DateTime<Utc>,
        task_count: usize,
    },
    PlanReady {
        ids: Vec<String>,
        unresolved: Vec<String>,
        missing_deps: IndexMap<String, Vec<String>>,
    },
    DagReady {
        ready: Vec<String>,
    },
    TaskScheduled {
        id: String,
    },
    TaskStart {
        id: String,
        at: DateTime<Utc>,
    },
    TaskEnd {
        id: String,
        result: TaskExecutionResult,
    },
    DagRelease {
        from: String,
        to: Vec<String>,
    },
    Error {
        stage: String,
        message: String,
        task_id: Option<String>,
    },
    RunEnd {
        ended_at: DateTime<Utc>,
        duration_ms: u64,
        totals: RunTotals,
    },
}

impl RunEvent {
    pub fn kind(&self) -> EventKind {
        match self {
            RunEvent::RunStart { .. } => EventKind::RunStart,
            RunEvent::PlanReady { .. } => EventKind::PlanReady,
            RunEvent::DagReady { .. } => EventKind::DagReady,
            RunEvent::TaskScheduled { .. } => EventKind::TaskScheduled,
            RunEvent::TaskStart { .. } => EventKind::TaskStart,
            RunEvent::TaskEnd { .. } => EventKind::TaskEnd,
            RunEvent::DagRelease { .. } => EventKind::DagRelease,
            RunEvent::Error { .. } => EventKind::Error,
            RunEvent::RunEnd { .. } => EventKind::RunEnd,
        }
    }
}

type Listener = Box<dyn Fn(&RunEvent)>;

/// Keyed event map: listeners subscribe to one kind or to everything.
#[derive(Default)]
pub struct EventBus {
    listeners: Vec<(Option<EventKind>, Listener)>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Subscribe to a single event kind.
    pub fn on(&mut self, kind: EventKind, listener: impl Fn(&RunEvent) + 'static) {
        self.listeners.push((Some(kind), Box::new(listener)));
    }

    /// Subscribe to every event.
    pub fn on_any(&mut self, listener: impl Fn(&RunEvent) + 'static) {
        self.listeners.push((None, Box::new(listener)));
    }

    pub fn emit(&self, event: &RunEvent) {
        let kind = event.kind();
        for (filter, listener) in &self.listeners {
            if filter.is_none() || *filter == Some(kind) {
                listener(event);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;
    use std::rc::Rc;

    #[test]
    fn keyed_listener_sees_only_its_kind() {
        let seen: Rc<RefCell<Vec<EventKind>>> = Rc::new(RefCell::new(Vec::new()));
        let mut bus = EventBus::new();
        let sink = Rc::clone(&seen);
        bus.on(EventKind::TaskStart, move |e| sink.borrow_mut().push(e.kind()));

        bus.emit(&RunEvent::TaskScheduled { id: "a".to_owned() });
        bus.emit(&RunEvent::TaskStart {
            id: "a".to_owned(),
            at: Utc::now(),
        });

        assert_eq!(*seen.borrow(), vec![EventKind::TaskStart]);
    }

    #[test]
    fn any_listener_sees_everything_in_order() {
        let seen: Rc<RefCell<Vec<EventKind>>> = Rc::new(RefCell::new(Vec::new()));
        let mut bus = EventBus::new();
        let sink = Rc::clone(&seen);
        bus.on_any(move |e| sink.borrow_mut().push(e.kind()));

        bus.emit(&RunEvent::DagReady { ready: vec![] });
        bus.emit(&RunEvent::DagRelease {
            from: "a".to_owned(),
            to: vec![],
        });

        assert_eq!(
            *seen.borrow(),
            vec![EventKind::DagReady, EventKind::DagRelease]
        );
    }
}
