//! Reference-counted process-wide resources.
//!
//! Some libraries behind a backend keep global state that must be
//! initialized once per process and finalized when the last user is gone.
//! A [`ProcessResource`] is declared as a `static` and handed out as
//! [`ProcessGuard`]s: the first acquire runs the initializer, dropping the
//! last guard runs the finalizer.

use std::sync::atomic::{AtomicUsize, Ordering};

use parking_lot::Mutex;
use tracing::debug;

pub struct ProcessResource {
    name: &'static str,
    users: AtomicUsize,
    /// Serializes initialization against finalization.
    transition: Mutex<()>,
    initialize: fn(),
    finalize: fn(),
}

impl ProcessResource {
    pub const fn new(name: &'static str, initialize: fn(), finalize: fn()) -> Self {
        Self {
            name,
            users: AtomicUsize::new(0),
            transition: Mutex::new(()),
            initialize,
            finalize,
        }
    }

    /// Takes a reference, initializing the resource if it is the first one.
    pub fn acquire(&'static self) -> ProcessGuard {
        let _transition = self.transition.lock();
        if self.users.fetch_add(1, Ordering::AcqRel) == 0 {
            debug!("Initializing process resource '{}'", self.name);
            (self.initialize)();
        }
        ProcessGuard { resource: self }
    }

    /// Number of live guards.
    pub fn users(&self) -> usize {
        self.users.load(Ordering::Acquire)
    }

    fn release(&self) {
        let _transition = self.transition.lock();
        if self.users.fetch_sub(1, Ordering::AcqRel) == 1 {
            debug!("Finalizing process resource '{}'", self.name);
            (self.finalize)();
        }
    }
}

/// A live reference to a [`ProcessResource`].
pub struct ProcessGuard {
    resource: &'static ProcessResource,
}

impl ProcessGuard {
    pub fn name(&self) -> &'static str {
        self.resource.name
    }
}

impl Clone for ProcessGuard {
    fn clone(&self) -> Self {
        self.resource.acquire()
    }
}

impl Drop for ProcessGuard {
    fn drop(&mut self) {
        self.resource.release();
    }
}

impl std::fmt::Debug for ProcessGuard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProcessGuard")
            .field("name", &self.resource.name)
            .field("users", &self.resource.users())
            .finish()
    }
}

fn noop() {}

/// Shader compiler state shared by every context in the process.
pub static SHADER_COMPILER: ProcessResource = ProcessResource::new("shader-compiler", noop, noop);
