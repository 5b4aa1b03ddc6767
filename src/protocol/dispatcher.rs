//! # Dispatcher
//!
//! Per-listener worker threads fed by unbounded queues.
//!
//! Events reach each listener in the order they were dispatched. Removing a
//! listener stops its worker and drops whatever it had not yet processed.

use crate::error::constants::{ERR_DISPATCHER_READ_LOCK, ERR_DISPATCHER_WRITE_LOCK};
use crate::error::{ProtocolError, Result};
use crate::protocol::listener::{guarded, ConnectionEvent, Listener};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};
use tokio::sync::mpsc;
use tracing::{debug, trace};

/// A registered listener and the worker thread that serves it.
///
/// Dropping the registration stops the worker: the running flag goes down,
/// the queue sender is dropped, and anything still queued is discarded.
struct ListenerRegistration<C> {
    name: Arc<str>,
    queue: mpsc::UnboundedSender<ConnectionEvent<C>>,
    running: Arc<AtomicBool>,
}

impl<C> Drop for ListenerRegistration<C> {
    fn drop(&mut self) {
        self.running.store(false, Ordering::Release);
        debug!(listener = %self.name, "Listener removed");
    }
}

/// Fans connection events out to listeners, one dedicated OS thread each.
///
/// A slow or blocking listener delays only its own queue. Queues are
/// unbounded; a listener that never keeps up grows its queue without limit.
pub struct Dispatcher<C> {
    listeners: Arc<RwLock<Vec<ListenerRegistration<C>>>>,
}

impl<C: Send + Sync + 'static> Default for Dispatcher<C> {
    fn default() -> Self {
        Self::new()
    }
}

impl<C: Send + Sync + 'static> Dispatcher<C> {
    pub fn new() -> Self {
        Self {
            listeners: Arc::new(RwLock::new(Vec::new())),
        }
    }

    /// Register a listener and start its worker thread
    pub fn add<L>(&self, name: &str, listener: L) -> Result<()>
    where
        L: Listener<C>,
    {
        self.add_shared(name, Arc::new(listener))
    }

    /// Register an already shared listener
    pub fn add_shared(&self, name: &str, listener: Arc<dyn Listener<C>>) -> Result<()> {
        let mut listeners = self
            .listeners
            .write()
            .map_err(|_| ProtocolError::Custom(ERR_DISPATCHER_WRITE_LOCK.to_string()))?;

        if listeners.iter().any(|l| &*l.name == name) {
            return Err(ProtocolError::DuplicateListener(name.to_string()));
        }

        let name: Arc<str> = Arc::from(name);
        let (queue, rx) = mpsc::unbounded_channel();
        let running = Arc::new(AtomicBool::new(true));

        let worker_name = name.clone();
        let worker_running = running.clone();
        std::thread::Builder::new()
            .name(format!("listener-{name}"))
            .spawn(move || run_worker(worker_name, listener, rx, worker_running))?;

        listeners.push(ListenerRegistration {
            name: name.clone(),
            queue,
            running,
        });
        debug!(listener = %name, "Listener registered");
        Ok(())
    }

    /// Stop and unregister a listener. Events still queued for it are
    /// discarded. Returns whether a listener by that name existed.
    pub fn remove(&self, name: &str) -> Result<bool> {
        let mut listeners = self
            .listeners
            .write()
            .map_err(|_| ProtocolError::Custom(ERR_DISPATCHER_WRITE_LOCK.to_string()))?;

        let before = listeners.len();
        listeners.retain(|l| &*l.name != name);
        Ok(listeners.len() != before)
    }

    /// Queue `event` for every listener, in registration order
    pub fn dispatch(&self, event: ConnectionEvent<C>) -> Result<()> {
        let listeners = self
            .listeners
            .read()
            .map_err(|_| ProtocolError::Custom(ERR_DISPATCHER_READ_LOCK.to_string()))?;

        trace!(
            operation = event.operation(),
            listeners = listeners.len(),
            "Dispatching event"
        );
        for registration in listeners.iter() {
            if registration.running.load(Ordering::Acquire) {
                let _ = registration.queue.send(event.clone());
            }
        }
        Ok(())
    }

    /// Registered listener names in registration order
    pub fn names(&self) -> Vec<String> {
        self.listeners
            .read()
            .map(|l| l.iter().map(|r| r.name.to_string()).collect())
            .unwrap_or_default()
    }

    pub fn len(&self) -> usize {
        self.listeners.read().map(|l| l.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Stop every listener
    pub fn shutdown(&self) {
        let drained = match self.listeners.write() {
            Ok(mut listeners) => std::mem::take(&mut *listeners),
            Err(poisoned) => std::mem::take(&mut *poisoned.into_inner()),
        };
        if !drained.is_empty() {
            debug!(listeners = drained.len(), "Dispatcher shut down");
        }
    }
}

fn run_worker<C: 'static>(
    name: Arc<str>,
    listener: Arc<dyn Listener<C>>,
    mut rx: mpsc::UnboundedReceiver<ConnectionEvent<C>>,
    running: Arc<AtomicBool>,
) {
    while let Some(event) = rx.blocking_recv() {
        if !running.load(Ordering::Acquire) {
            break;
        }
        guarded(&name, event.operation(), || event.deliver(listener.as_ref()));
    }
    trace!(listener = %name, "Listener worker stopped");
}
