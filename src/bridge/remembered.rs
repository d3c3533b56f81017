//! Last known-good read per endpoint group.
//!
//! Written only by the poll loop after a successful read and read by the bus
//! callback while merging boost fields. Every update publishes a fresh
//! immutable snapshot through a `watch` channel, so a reader either sees the
//! old snapshot or the new one, never a half-updated mix.

use super::fields::Group;
use serde_json::{Map, Value};
use std::sync::Arc;
use tokio::sync::watch;
use tracing::debug;

pub type Document = Map<String, Value>;

#[derive(Debug, Clone, Default, PartialEq)]
pub struct RememberedState {
    live: Option<Document>,
    info: Option<Document>,
    injection: Option<Document>,
    boost: Option<Document>,
}

impl RememberedState {
    pub fn get(&self, group: Group) -> Option<&Document> {
        match group {
            Group::Live => self.live.as_ref(),
            Group::Info => self.info.as_ref(),
            Group::Injection => self.injection.as_ref(),
            Group::Boost => self.boost.as_ref(),
        }
    }

    fn slot(&mut self, group: Group) -> &mut Option<Document> {
        match group {
            Group::Live => &mut self.live,
            Group::Info => &mut self.info,
            Group::Injection => &mut self.injection,
            Group::Boost => &mut self.boost,
        }
    }
}

pub fn remembered_state() -> (RememberedWriter, RememberedReader) {
    let (tx, rx) = watch::channel(Arc::new(RememberedState::default()));
    (RememberedWriter { tx }, RememberedReader { rx })
}

/// Owned by the poll loop.
#[derive(Debug)]
pub struct RememberedWriter {
    tx: watch::Sender<Arc<RememberedState>>,
}

impl RememberedWriter {
    pub fn record(&self, group: Group, document: Document) {
        let mut next = RememberedState::clone(&self.tx.borrow());
        *next.slot(group) = Some(document);
        self.tx.send_replace(Arc::new(next));
        debug!("Remembered new {} read", group.endpoint());
    }

    pub fn snapshot(&self) -> Arc<RememberedState> {
        self.tx.borrow().clone()
    }
}

#[derive(Debug, Clone)]
pub struct RememberedReader {
    rx: watch::Receiver<Arc<RememberedState>>,
}

impl RememberedReader {
    pub fn snapshot(&self) -> Arc<RememberedState> {
        self.rx.borrow().clone()
    }
}
