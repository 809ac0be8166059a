//! Request correlation
//!
//! Turns an asynchronous backend reply into a synchronous wait. A caller
//! creates a [`Correlator`] under a unique key, publishes its request, and
//! listens; whoever receives the reply looks the key up and delivers.

use dashmap::DashMap;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::debug;

use crate::{Error, Result};

type Entries<T> = DashMap<String, Arc<Correlator<T>>>;

/// Table of pending correlators
pub struct Correlators<T> {
    entries: Arc<Entries<T>>,
}

impl<T: Send + 'static> Correlators<T> {
    pub fn new() -> Self {
        Self {
            entries: Arc::new(DashMap::new()),
        }
    }

    /// Create a correlator under `key`, replacing any previous entry.
    ///
    /// Keys must be unique per request (a UUID, for instance).
    pub fn create(&self, key: impl Into<String>) -> Arc<Correlator<T>> {
        let key = key.into();
        let (tx, rx) = mpsc::channel(1);
        let correlator = Arc::new(Correlator {
            key: key.clone(),
            tx: Mutex::new(Some(tx)),
            rx: tokio::sync::Mutex::new(rx),
            closed: AtomicBool::new(false),
            owner: Arc::downgrade(&self.entries),
        });

        if self.entries.insert(key.clone(), correlator.clone()).is_some() {
            debug!("Correlator {} replaced", key);
        }
        correlator
    }

    pub fn load(&self, key: &str) -> Option<Arc<Correlator<T>>> {
        self.entries.get(key).map(|c| c.value().clone())
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl<T: Send + 'static> Default for Correlators<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Clone for Correlators<T> {
    fn clone(&self) -> Self {
        Self {
            entries: Arc::clone(&self.entries),
        }
    }
}

/// Single-shot reply slot
pub struct Correlator<T> {
    key: String,
    tx: Mutex<Option<mpsc::Sender<T>>>,
    rx: tokio::sync::Mutex<mpsc::Receiver<T>>,
    closed: AtomicBool,
    owner: Weak<Entries<T>>,
}

impl<T: Send + 'static> Correlator<T> {
    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Hand the reply to the waiting caller
    pub fn deliver(&self, value: T) -> Result<()> {
        let tx = self.tx.lock();
        let tx = tx
            .as_ref()
            .ok_or_else(|| Error::ChannelClosed(self.key.clone()))?;

        tx.try_send(value).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => Error::ReplyPending(self.key.clone()),
            mpsc::error::TrySendError::Closed(_) => Error::ChannelClosed(self.key.clone()),
        })
    }

    /// Wait for the reply.
    ///
    /// Returns [`Error::Timeout`] when nothing arrives in time and
    /// [`Error::ChannelClosed`] when the correlator is closed first.
    pub async fn listen(&self, timeout: Duration) -> Result<T> {
        let mut rx = self.rx.lock().await;
        match tokio::time::timeout(timeout, rx.recv()).await {
            Err(_) => Err(Error::Timeout(self.key.clone())),
            Ok(Some(value)) => Ok(value),
            Ok(None) => Err(Error::ChannelClosed(self.key.clone())),
        }
    }

    /// Close the channel and drop the table entry. Safe to call repeatedly.
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }

        self.tx.lock().take();

        if let Some(entries) = self.owner.upgrade() {
            entries.remove_if(&self.key, |_, c| std::ptr::eq(c.as_ref(), self));
        }
    }
}
