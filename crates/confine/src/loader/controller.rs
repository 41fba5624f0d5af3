//! Host side of the module loader bridge.
//!
//! One [`RequireController`] per isolate. Each resolution cycle starts with a
//! blocked guest thread: the controller resolves the requested name, reads the
//! transitive dependency closure, stages the batch, and signals the guest. At
//! most one cycle's results may be staged at a time; starting another before
//! the guest drained the previous batch is a detected error, never a silent
//! interleave.

use std::collections::{HashMap, HashSet, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::error::{Error, Result};
use crate::loader::resolve::{self, FsSelector, LocalFs, ModuleFs};
use crate::loader::scan;
use crate::loader::signal::SharedSignal;

/// Marks a filename that must be read from the host-local disk (require
/// overrides and anything they transitively pull in), bypassing the selector.
pub const LOCAL_PREFIX: &str = "@local:";

/// Marks a filename backed by an embedded polyfill source.
pub const POLYFILL_PREFIX: &str = "@polyfill:";

/// Builtins with an embedded polyfill substitute in `nodejs` mode.
static NODE_POLYFILLS: &[(&str, &str)] = &[
    ("buffer", include_str!("polyfills/buffer.js")),
    ("events", include_str!("polyfills/events.js")),
    ("os", include_str!("polyfills/os.js")),
    ("path", include_str!("polyfills/path.js")),
    ("querystring", include_str!("polyfills/querystring.js")),
    ("string_decoder", include_str!("polyfills/string_decoder.js")),
    ("url", include_str!("polyfills/url.js")),
    ("util", include_str!("polyfills/util.js")),
];

/// Node builtin module names. Never resolvable as files; without a polyfill or
/// override they resolve to nothing at all.
static BUILTIN_MODULES: &[&str] = &[
    "assert",
    "async_hooks",
    "buffer",
    "child_process",
    "cluster",
    "console",
    "constants",
    "crypto",
    "dgram",
    "dns",
    "domain",
    "events",
    "fs",
    "http",
    "http2",
    "https",
    "inspector",
    "module",
    "net",
    "os",
    "path",
    "perf_hooks",
    "process",
    "punycode",
    "querystring",
    "readline",
    "repl",
    "stream",
    "string_decoder",
    "timers",
    "tls",
    "tty",
    "url",
    "util",
    "v8",
    "vm",
    "worker_threads",
    "zlib",
];

fn polyfill_source(name: &str) -> Option<&'static str> {
    NODE_POLYFILLS
        .iter()
        .find(|(polyfill, _)| *polyfill == name)
        .map(|(_, source)| *source)
}

fn is_builtin(name: &str) -> bool {
    BUILTIN_MODULES.binary_search(&name).is_ok()
}

/// Whether `filename` lives outside the selector-visible module tree.
fn is_host_local(filename: &str) -> bool {
    filename.starts_with(LOCAL_PREFIX) || filename.starts_with(POLYFILL_PREFIX)
}

/// One entry of a resolution response batch. An empty `source` marks a
/// duplicate link: the guest already holds `filename` and only needs to link
/// it under a new `(name, from)` edge.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoadedModule {
    pub name: String,
    pub filename: String,
    pub from: String,
    pub source: String,
}

pub struct RequireController {
    selector: FsSelector,
    signal: Arc<SharedSignal>,
    overrides: HashMap<String, PathBuf>,
    include_node_polyfills: bool,
    loaded: Mutex<Option<Result<Vec<LoadedModule>>>>,
}

impl RequireController {
    pub fn new(
        selector: FsSelector,
        signal: Arc<SharedSignal>,
        overrides: HashMap<String, PathBuf>,
        include_node_polyfills: bool,
    ) -> Self {
        Self {
            selector,
            signal,
            overrides,
            include_node_polyfills,
            loaded: Mutex::new(None),
        }
    }

    /// Run one resolution cycle and stage its results, then wake the guest.
    ///
    /// The staged value carries resolution failures too, so the guest always
    /// wakes and observes the outcome. Only the undrained-batch misuse is
    /// reported to the caller without waking anyone: the guest that posted the
    /// pending batch is still entitled to drain it.
    pub async fn load(&self, name: &str, from: &str, known: Vec<String>) -> Result<()> {
        if self.loaded.lock().is_some() {
            return Err(Error::Configuration(
                "resolution cycle already staged: previous results were not drained".to_string(),
            ));
        }

        let result = self.load_cycle(name, from, known).await;
        if let Err(err) = &result {
            tracing::debug!(name, from, error = %err, "resolution cycle failed");
        }
        *self.loaded.lock() = Some(result);
        self.signal.notify();
        Ok(())
    }

    /// Drain the staged batch. Errors if no cycle has completed since the last
    /// drain.
    pub fn fetch(&self) -> Result<Vec<LoadedModule>> {
        self.loaded.lock().take().ok_or_else(|| {
            Error::Configuration("no resolution results staged; nothing to fetch".to_string())
        })?
    }

    /// Resolve `name` from `from` and collect the transitive closure of every
    /// newly discovered module, refusing to re-read filenames in `known`.
    async fn load_cycle(
        &self,
        name: &str,
        from: &str,
        known: Vec<String>,
    ) -> Result<Vec<LoadedModule>> {
        let mut known: HashSet<String> = known.into_iter().collect();
        let mut resolved_ids = HashSet::new();
        let mut memo: HashMap<(String, PathBuf), Option<String>> = HashMap::new();
        let mut modules = Vec::new();
        let mut duplicates = Vec::new();

        let mut queue = VecDeque::new();
        queue.push_back((name.to_string(), from.to_string()));

        while let Some((name, from)) = queue.pop_front() {
            let Some(filename) = self.resolve_one(&name, &from, &mut memo).await? else {
                continue;
            };

            let id = format!("{name}\n{filename}\n{from}");
            if known.contains(&filename) {
                if resolved_ids.insert(id) {
                    duplicates.push(LoadedModule {
                        name,
                        filename,
                        from,
                        source: String::new(),
                    });
                }
                continue;
            }
            known.insert(filename.clone());
            resolved_ids.insert(id);

            let source = self.read_source(&name, &filename, &from).await?;
            for dep in scan::find_requires(&source) {
                queue.push_back((dep, filename.clone()));
            }
            modules.push(LoadedModule {
                name,
                filename,
                from,
                source,
            });
        }

        tracing::debug!(
            root = name,
            new = modules.len(),
            duplicates = duplicates.len(),
            "resolution cycle complete"
        );
        modules.extend(duplicates);
        Ok(modules)
    }

    /// Resolution precedence: polyfill table, override map, builtin rejection,
    /// then filesystem resolution against the requiring file's directory.
    async fn resolve_one(
        &self,
        name: &str,
        from: &str,
        memo: &mut HashMap<(String, PathBuf), Option<String>>,
    ) -> Result<Option<String>> {
        if self.include_node_polyfills && polyfill_source(name).is_some() {
            return Ok(Some(format!("{POLYFILL_PREFIX}{name}")));
        }
        if !is_host_local(from) {
            if let Some(path) = self.overrides.get(name) {
                return Ok(Some(format!("{LOCAL_PREFIX}{}", path.display())));
            }
        }
        if is_builtin(name) {
            return Ok(None);
        }

        // A polyfill may require another polyfilled name (matched above);
        // anything else inside one resolves to nothing.
        if from.starts_with(POLYFILL_PREFIX) {
            return Ok(None);
        }

        let (basedir, host_local) = from.strip_prefix(LOCAL_PREFIX).map_or_else(
            || (parent_dir(Path::new(from)), false),
            |local| (parent_dir(Path::new(local)), true),
        );

        let memo_key = (name.to_string(), basedir.clone());
        if let Some(cached) = memo.get(&memo_key) {
            return Ok(cached.clone());
        }

        let local_fs = LocalFs;
        let fs: &dyn ModuleFs = if host_local {
            &local_fs
        } else {
            self.selector.select(&basedir).as_ref()
        };

        let resolved = resolve::resolve(fs, name, &basedir)
            .await
            .map_err(|err| Error::resolution_with(name, from, err))?
            .map(|path| {
                let path = path.display().to_string();
                if host_local {
                    format!("{LOCAL_PREFIX}{path}")
                } else {
                    path
                }
            });

        memo.insert(memo_key, resolved.clone());
        Ok(resolved)
    }

    async fn read_source(&self, name: &str, filename: &str, from: &str) -> Result<String> {
        if let Some(polyfill) = filename.strip_prefix(POLYFILL_PREFIX) {
            return polyfill_source(polyfill)
                .map(ToString::to_string)
                .ok_or_else(|| Error::resolution(name, from));
        }
        if let Some(local) = filename.strip_prefix(LOCAL_PREFIX) {
            return LocalFs
                .read_file(Path::new(local))
                .await
                .map_err(|err| Error::resolution_with(name, from, err));
        }
        let path = Path::new(filename);
        self.selector
            .select(path)
            .read_file(path)
            .await
            .map_err(|err| Error::resolution_with(name, from, err))
    }
}

fn parent_dir(path: &Path) -> PathBuf {
    path.parent().map_or_else(PathBuf::new, Path::to_path_buf)
}
