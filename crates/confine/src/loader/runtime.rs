//! Guest side of the module loader bridge.
//!
//! Implements the engine's [`RequireHook`]: a synchronous-looking `require`
//! backed by a per-isolate module cache and, on a miss, the blocking handshake
//! with the host-side [`RequireController`]. Runs entirely on the guest
//! thread; the cache lock is never held across guest code execution.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::mpsc;

use crate::engine::{BoxError, GuestScope, ModuleBody, ModuleRef, RequireHook};
use crate::error::Error;
use crate::loader::controller::{LoadedModule, RequireController};
use crate::loader::signal::SharedSignal;

/// Names that resolve to an inert empty exports object instead of real host
/// access or a hard failure.
static UNSUPPORTED: &[&str] = &["fs", "net", "tls", "http", "https"];

/// One resolution request posted to the host-side pump.
#[derive(Debug)]
pub(crate) struct LoadRequest {
    pub name: String,
    pub from: String,
    /// Filenames already cached guest-side, so sources are never re-sent.
    pub known: Vec<String>,
}

/// Guest module record. Transitions `unbuilt → loaded` exactly once; the
/// record is marked loaded and given its module object *before* the body
/// executes, so a circular `require` observes the same in-progress exports.
struct ModuleRecord {
    module: Option<ModuleRef>,
    loaded: bool,
    source: Option<String>,
    dirname: String,
    source_url: String,
}

impl ModuleRecord {
    fn new(filename: &str, source: String) -> Self {
        Self {
            module: None,
            loaded: false,
            source: Some(source),
            dirname: dirname_of(filename),
            source_url: format!("file://{filename}"),
        }
    }
}

fn dirname_of(filename: &str) -> String {
    match filename.rsplit_once('/') {
        Some((dir, _)) => dir.to_string(),
        None => String::new(),
    }
}

pub struct RequireRuntime {
    root_context: String,
    requests: mpsc::UnboundedSender<LoadRequest>,
    signal: Arc<SharedSignal>,
    controller: Arc<RequireController>,
    cache: Mutex<HashMap<String, ModuleRecord>>,
    /// Per-context dependency links: requiring filename → name → filename.
    links: Mutex<HashMap<String, HashMap<String, String>>>,
    /// Most recent host-visible failure, kept typed so `run` can surface a
    /// resolution error instead of the engine's stringified guest exception.
    failure: Mutex<Option<Error>>,
}

impl RequireRuntime {
    pub(crate) fn new(
        root_context: String,
        requests: mpsc::UnboundedSender<LoadRequest>,
        signal: Arc<SharedSignal>,
        controller: Arc<RequireController>,
    ) -> Self {
        Self {
            root_context,
            requests,
            signal,
            controller,
            cache: Mutex::new(HashMap::new()),
            links: Mutex::new(HashMap::new()),
            failure: Mutex::new(None),
        }
    }

    pub fn take_failure(&self) -> Option<Error> {
        self.failure.lock().take()
    }

    fn fail(&self, err: Error) -> BoxError {
        let message = err.to_string();
        *self.failure.lock() = Some(err);
        message.into()
    }

    fn link(&self, from: &str, name: &str) -> Option<String> {
        self.links.lock().get(from)?.get(name).cloned()
    }

    /// Merge a response batch: create unbuilt records for new modules and add
    /// dependency links for everything, duplicates included. First link wins.
    fn merge(&self, batch: Vec<LoadedModule>) {
        let mut cache = self.cache.lock();
        let mut links = self.links.lock();
        for module in batch {
            links
                .entry(module.from)
                .or_default()
                .entry(module.name)
                .or_insert_with(|| module.filename.clone());
            cache
                .entry(module.filename.clone())
                .or_insert_with(|| ModuleRecord::new(&module.filename, module.source));
        }
    }

    /// Build the record for `filename`, or return its module object if it was
    /// already built. Dependencies stay unbuilt until their own first require.
    fn build(&self, scope: &mut dyn GuestScope, filename: &str) -> Result<ModuleRef, Error> {
        let built = {
            let cache = self.cache.lock();
            let record = cache
                .get(filename)
                .ok_or_else(|| Error::resolution(filename, &self.root_context))?;
            if record.loaded { record.module } else { None }
        };
        if let Some(module) = built {
            return Ok(module);
        }

        let module = scope.alloc_module()?;
        let (source, dirname, source_url) = {
            let mut cache = self.cache.lock();
            let record = cache
                .get_mut(filename)
                .ok_or_else(|| Error::resolution(filename, &self.root_context))?;
            record.module = Some(module);
            record.loaded = true;
            // Source is not needed again once built; free it.
            (
                record.source.take().unwrap_or_default(),
                record.dirname.clone(),
                record.source_url.clone(),
            )
        };

        if filename.ends_with(".json") {
            scope.set_exports_json(module, &source)?;
        } else {
            scope.run_module_body(
                module,
                &ModuleBody {
                    source: &source,
                    filename,
                    dirname: &dirname,
                    source_url: &source_url,
                },
            )?;
        }
        Ok(module)
    }
}

impl RequireHook for RequireRuntime {
    fn require(
        &self,
        scope: &mut dyn GuestScope,
        name: &str,
        from: Option<&str>,
    ) -> Result<ModuleRef, BoxError> {
        let from = from.unwrap_or(&self.root_context).to_string();

        if UNSUPPORTED.contains(&name) {
            // Inert no-op surface; calling anything on it is a plain guest
            // "not a function" error, not a security exception.
            return Ok(scope.alloc_module().map_err(Error::from).map_err(|e| self.fail(e))?);
        }

        if let Some(filename) = self.link(&from, name) {
            return self.build(scope, &filename).map_err(|e| self.fail(e));
        }

        // Miss: post a resolution request and block until the host stages the
        // response batch. The signal rearms on wake.
        let known = self.cache.lock().keys().cloned().collect();
        self.requests
            .send(LoadRequest {
                name: name.to_string(),
                from: from.clone(),
                known,
            })
            .map_err(|_| self.fail(Error::Configuration("module loader is shut down".into())))?;
        self.signal.wait();

        let batch = self.controller.fetch().map_err(|e| self.fail(e))?;
        self.merge(batch);

        let Some(filename) = self.link(&from, name) else {
            return Err(self.fail(Error::resolution(name, &from)));
        };
        self.build(scope, &filename).map_err(|e| self.fail(e))
    }
}
