//! CommonJS module loading across the host/guest boundary.
//!
//! The guest-facing `require` must look synchronous while module resolution
//! and file reads happen on the host's async runtime. The bridge splits the
//! work across three pieces:
//!
//! - [`RequireRuntime`] runs on the guest thread, keeps the module cache, and
//!   blocks on [`SharedSignal`] while the host works.
//! - [`RequireController`] resolves specifiers, reads transitive dependency
//!   closures, and stages response batches.
//! - A pump task owns the async half: it receives resolution requests from the
//!   blocked guest thread and drives the controller.

pub mod controller;
pub mod resolve;
pub mod runtime;
pub mod scan;
pub mod signal;

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use tokio::sync::mpsc;

pub use controller::{LOCAL_PREFIX, LoadedModule, POLYFILL_PREFIX, RequireController};
pub use resolve::{FsSelector, LocalFs, ModuleFs};
pub use runtime::RequireRuntime;
pub use signal::SharedSignal;

use crate::error::Error;
use runtime::LoadRequest;

/// A live loader bridge for one isolate. Dropping it stops the pump; any guest
/// require posted afterwards fails instead of hanging.
pub(crate) struct RequireBridge {
    runtime: Arc<RequireRuntime>,
    pump: tokio::task::JoinHandle<()>,
}

impl RequireBridge {
    /// Wire up the bridge and spawn its pump task. Must run inside a tokio
    /// runtime.
    pub fn open(
        selector: FsSelector,
        root_context: &Path,
        overrides: HashMap<String, PathBuf>,
        include_node_polyfills: bool,
    ) -> Self {
        let signal = Arc::new(SharedSignal::new());
        let controller = Arc::new(RequireController::new(
            selector,
            Arc::clone(&signal),
            overrides,
            include_node_polyfills,
        ));
        let (requests, mut inbox) = mpsc::unbounded_channel::<LoadRequest>();
        let runtime = Arc::new(RequireRuntime::new(
            root_context.display().to_string(),
            requests,
            signal,
            Arc::clone(&controller),
        ));

        let pump = tokio::spawn(async move {
            while let Some(request) = inbox.recv().await {
                if let Err(err) = controller
                    .load(&request.name, &request.from, request.known)
                    .await
                {
                    // load() only errors on protocol misuse; the guest was not
                    // woken and still owns the staged batch.
                    tracing::error!(
                        name = request.name,
                        from = request.from,
                        error = %err,
                        "dropped resolution request"
                    );
                }
            }
        });

        Self { runtime, pump }
    }

    pub fn runtime(&self) -> Arc<RequireRuntime> {
        Arc::clone(&self.runtime)
    }

    /// Latest typed loader failure, if a guest require ended in one.
    pub fn take_failure(&self) -> Option<Error> {
        self.runtime.take_failure()
    }
}

impl Drop for RequireBridge {
    fn drop(&mut self) {
        self.pump.abort();
    }
}
