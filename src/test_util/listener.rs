use std::sync::{Mutex, PoisonError};

use crate::deploy::AppClientListener;


#[derive(Debug, Clone, Eq, PartialEq)]
pub enum ListenerEvent {
    Connected(String),
    Disconnected,
    Dead(String),
    ExecutorAdded {
        full_id: String,
        worker_id: String,
        host: String,
        cores: u32,
        memory_mb: u32,
    },
    ExecutorRemoved {
        full_id: String,
        message: String,
        exit_status: i32,
        worker_lost: bool,
    },
    WorkerRemoved {
        worker_id: String,
        host: String,
        message: String,
    },
}

/// An [AppClientListener] that records its callbacks in the order they happen
#[derive(Debug, Default)]
pub struct RecordingListener {
    events: Mutex<Vec<ListenerEvent>>,
}

impl RecordingListener {
    pub fn new() -> RecordingListener {
        Default::default()
    }

    pub fn events(&self) -> Vec<ListenerEvent> {
        self.events.lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn record(&self, event: ListenerEvent) {
        self.events.lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(event);
    }
}

impl AppClientListener for RecordingListener {
    fn connected(&self, app_id: &str) {
        self.record(ListenerEvent::Connected(app_id.to_string()));
    }

    fn disconnected(&self) {
        self.record(ListenerEvent::Disconnected);
    }

    fn dead(&self, reason: &str) {
        self.record(ListenerEvent::Dead(reason.to_string()));
    }

    fn executor_added(&self, full_id: &str, worker_id: &str, host: &str, cores: u32, memory_mb: u32) {
        self.record(ListenerEvent::ExecutorAdded {
            full_id: full_id.to_string(),
            worker_id: worker_id.to_string(),
            host: host.to_string(),
            cores,
            memory_mb,
        });
    }

    fn executor_removed(&self, full_id: &str, message: &str, exit_status: i32, worker_lost: bool) {
        self.record(ListenerEvent::ExecutorRemoved {
            full_id: full_id.to_string(),
            message: message.to_string(),
            exit_status,
            worker_lost,
        });
    }

    fn worker_removed(&self, worker_id: &str, host: &str, message: &str) {
        self.record(ListenerEvent::WorkerRemoved {
            worker_id: worker_id.to_string(),
            host: host.to_string(),
            message: message.to_string(),
        });
    }
}
