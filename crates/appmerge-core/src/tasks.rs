//! Keyed registry of background tasks
//!
//! Holds at most one running task per key. Starting a task for a key that
//! already has one aborts the old task first. A task that ends on its own
//! deregisters through its [`TaskTicket`], which only ever removes the entry
//! it was issued for, so a replacement task is never dropped by its
//! predecessor.

use std::collections::HashMap;
use std::fmt::Debug;
use std::future::Future;
use std::hash::Hash;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tokio::task::JoinHandle;
use tracing::debug;

struct TaskEntry {
    generation: u64,
    handle: JoinHandle<()>,
}

struct RegistryInner<K> {
    next_generation: u64,
    tasks: HashMap<K, TaskEntry>,
}

/// One background task per key
pub struct TaskRegistry<K> {
    name: &'static str,
    inner: Arc<Mutex<RegistryInner<K>>>,
}

impl<K> Clone for TaskRegistry<K> {
    fn clone(&self) -> Self {
        Self {
            name: self.name,
            inner: Arc::clone(&self.inner),
        }
    }
}

/// Issued to each spawned task; lets the task deregister itself
pub struct TaskTicket<K> {
    key: K,
    generation: u64,
    registry: TaskRegistry<K>,
}

impl<K> TaskTicket<K>
where
    K: Eq + Hash + Clone + Debug + Send + 'static,
{
    pub fn key(&self) -> &K {
        &self.key
    }

    /// Remove this task's registry entry without aborting it
    ///
    /// No effect if the entry was already stopped or replaced.
    pub fn finish(&self) {
        let mut inner = self.registry.lock();
        if inner
            .tasks
            .get(&self.key)
            .is_some_and(|entry| entry.generation == self.generation)
        {
            inner.tasks.remove(&self.key);
            debug!(registry = self.registry.name, key = ?self.key, "Task finished");
        }
    }
}

impl<K> TaskRegistry<K>
where
    K: Eq + Hash + Clone + Debug + Send + 'static,
{
    pub fn new(name: &'static str) -> Self {
        Self {
            name,
            inner: Arc::new(Mutex::new(RegistryInner {
                next_generation: 0,
                tasks: HashMap::new(),
            })),
        }
    }

    /// Spawn the task built by `make`, replacing any task already running for `key`
    pub fn spawn<F, Fut>(&self, key: K, make: F)
    where
        F: FnOnce(TaskTicket<K>) -> Fut,
        Fut: Future<Output = ()> + Send + 'static,
    {
        // The lock is held across spawn so the entry exists before the task can finish
        let mut inner = self.lock();
        inner.next_generation += 1;
        let generation = inner.next_generation;

        let ticket = TaskTicket {
            key: key.clone(),
            generation,
            registry: self.clone(),
        };
        let handle = tokio::spawn(make(ticket));

        if let Some(previous) = inner
            .tasks
            .insert(key.clone(), TaskEntry { generation, handle })
        {
            previous.handle.abort();
            debug!(registry = self.name, key = ?key, "Replaced running task");
        } else {
            debug!(registry = self.name, key = ?key, "Started task");
        }
    }

    /// Abort the task for `key`; returns whether one was running
    pub fn stop(&self, key: &K) -> bool {
        match self.lock().tasks.remove(key) {
            Some(entry) => {
                entry.handle.abort();
                debug!(registry = self.name, key = ?key, "Stopped task");
                true
            }
            None => false,
        }
    }

    /// Abort every task; returns how many were running
    pub fn stop_all(&self) -> usize {
        let entries: Vec<TaskEntry> = self.lock().tasks.drain().map(|(_, entry)| entry).collect();
        for entry in &entries {
            entry.handle.abort();
        }
        entries.len()
    }

    pub fn is_active(&self, key: &K) -> bool {
        self.lock()
            .tasks
            .get(key)
            .is_some_and(|entry| !entry.handle.is_finished())
    }

    pub fn len(&self) -> usize {
        self.lock().tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn lock(&self) -> MutexGuard<'_, RegistryInner<K>> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
