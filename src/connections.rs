//! Per-thread object-store client handles.
//!
//! Client handles are never shared between threads: each thread that
//! touches a storage gets its own handle, built on first use by the
//! injected [`ClientFactory`].  A handle lives until its thread releases it
//! or exits; a thread-local guard removes the entry on thread exit.

use std::cell::RefCell;
use std::collections::HashMap;
use std::sync::{Arc, RwLock, Weak};
use std::thread::{self, ThreadId};
use tracing::debug;

use crate::errors::StorageResult;
use crate::metrics::CLIENT_HANDLES_CREATED;
use crate::storage::backend::ObjectStoreClient;

/// Builds a fresh client handle.  Every call must return a new instance.
pub type ClientFactory =
    Arc<dyn Fn() -> StorageResult<Arc<dyn ObjectStoreClient>> + Send + Sync>;

type HandleMap = RwLock<HashMap<ThreadId, Arc<dyn ObjectStoreClient>>>;

/// Removes one thread's handle from one cache when dropped.
struct ThreadRelease {
    handles: Weak<HandleMap>,
    thread: ThreadId,
}

impl Drop for ThreadRelease {
    fn drop(&mut self) {
        if let Some(handles) = self.handles.upgrade() {
            let removed = handles
                .write()
                .unwrap_or_else(|e| e.into_inner())
                .remove(&self.thread);
            if removed.is_some() {
                debug!("released object store client handle for {:?}", self.thread);
            }
        }
    }
}

thread_local! {
    /// Guards for every cache this thread holds a handle in; dropped with
    /// the thread.
    static THREAD_RELEASES: RefCell<Vec<ThreadRelease>> = const { RefCell::new(Vec::new()) };
}

/// Cache of client handles keyed by thread identity.
pub struct ConnectionCache {
    factory: ClientFactory,
    handles: Arc<HandleMap>,
}

impl ConnectionCache {
    pub fn new(factory: ClientFactory) -> Self {
        Self {
            factory,
            handles: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    fn register_release(&self, thread: ThreadId) {
        let handles = Arc::downgrade(&self.handles);
        // Fails only while the thread is already tearing down its locals.
        let _ = THREAD_RELEASES.try_with(|releases| {
            let mut releases = releases.borrow_mut();
            releases.retain(|r| r.handles.strong_count() > 0);
            if !releases.iter().any(|r| r.handles.ptr_eq(&handles)) {
                releases.push(ThreadRelease { handles, thread });
            }
        });
    }

    /// Handle of the calling thread, created on first use.
    pub fn current(&self) -> StorageResult<Arc<dyn ObjectStoreClient>> {
        let id = thread::current().id();
        {
            let handles = self.handles.read().unwrap_or_else(|e| e.into_inner());
            if let Some(handle) = handles.get(&id) {
                return Ok(Arc::clone(handle));
            }
        }

        let handle = (self.factory)()?;
        debug!("created object store client handle for {:?}", id);
        metrics::counter!(CLIENT_HANDLES_CREATED).increment(1);
        self.handles
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(id, Arc::clone(&handle));
        self.register_release(id);
        Ok(handle)
    }

    /// Drop the calling thread's handle, if any.
    pub fn release_current(&self) -> bool {
        let id = thread::current().id();
        self.handles
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&id)
            .is_some()
    }

    /// Number of live handles.
    pub fn len(&self) -> usize {
        self.handles.read().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
