//! Confined execution of one guest program.
//!
//! An [`Isolate`] owns one engine context and drives it through a fixed
//! lifecycle: `Idle` until first use, `Open` once the environment is installed
//! and the entry compiled, `Running` while the entry executes, `Closed`
//! afterwards (API calls stay valid), and `Disposed` once torn down. A guest
//! `process.exit(code)` records the code and tears the context down through
//! typed termination, so the run still completes cleanly.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use parking_lot::Mutex;
use serde_json::Value;
use tokio::sync::watch;

use crate::engine::{Engine, EngineContext, EngineError, HostFunction, RequireHook};
use crate::environment::{self, Globals};
use crate::error::{Error, Result};
use crate::imports::ImportResolver;
use crate::loader::{FsSelector, RequireBridge};
use crate::rpc::{ApiDescription, RpcBridge};

/// Guest environment profile.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum Env {
    /// Bare engine globals only.
    #[default]
    Vanilla,
    /// Node compatibility: builtin polyfills, `process`, `Buffer`, microtask
    /// scheduling shims.
    NodeJs,
}

impl Env {
    /// Unrecognized names fall back to [`Env::Vanilla`].
    #[must_use]
    pub fn parse(name: &str) -> Self {
        match name {
            "nodejs" => Self::NodeJs,
            _ => Self::Vanilla,
        }
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum ModuleFormat {
    #[default]
    CommonJs,
    Esm,
}

/// Construction options for one isolate.
#[derive(Clone)]
pub struct IsolateOptions {
    path: PathBuf,
    source: Option<String>,
    format: ModuleFormat,
    env: Env,
    globals: Globals,
    overrides: HashMap<String, PathBuf>,
    selector: FsSelector,
    disable_imports: bool,
}

impl IsolateOptions {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            source: None,
            format: ModuleFormat::default(),
            env: Env::default(),
            globals: Globals::new(),
            overrides: HashMap::new(),
            selector: FsSelector::local(),
            disable_imports: false,
        }
    }

    /// Provide the entry source inline instead of reading it from `path`.
    /// The path still names the entry for resolution and stack traces.
    #[must_use]
    pub fn source(mut self, source: impl Into<String>) -> Self {
        self.source = Some(source.into());
        self
    }

    #[must_use]
    pub fn format(mut self, format: ModuleFormat) -> Self {
        self.format = format;
        self
    }

    #[must_use]
    pub fn env(mut self, env: Env) -> Self {
        self.env = env;
        self
    }

    #[must_use]
    pub fn globals(mut self, globals: Globals) -> Self {
        self.globals = globals;
        self
    }

    /// Redirect a bare `require(name)` to a host-local file, outside the
    /// guest-visible module tree.
    #[must_use]
    pub fn require_override(
        mut self,
        name: impl Into<String>,
        path: impl Into<PathBuf>,
    ) -> Self {
        self.overrides.insert(name.into(), path.into());
        self
    }

    /// Replace the filesystem used for module resolution.
    #[must_use]
    pub fn module_fs(mut self, selector: FsSelector) -> Self {
        self.selector = selector;
        self
    }

    /// Link every static ESM import against the inert placeholder module.
    #[must_use]
    pub fn disable_imports(mut self, disable: bool) -> Self {
        self.disable_imports = disable;
        self
    }

    fn validate(&self) -> Result<()> {
        if !self.path.is_absolute() {
            return Err(Error::Configuration(format!(
                "entry path {:?} must be absolute",
                self.path
            )));
        }
        if self.format == ModuleFormat::Esm && self.env == Env::NodeJs {
            return Err(Error::Configuration(
                "the nodejs environment only supports commonjs entries".to_string(),
            ));
        }
        Ok(())
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LifecycleState {
    Idle,
    Opening,
    Open,
    Running,
    /// The entry ran to completion; API calls remain valid until disposal.
    Closed,
    Disposed,
}

struct OpenState {
    context: Arc<dyn EngineContext>,
    loader: Option<RequireBridge>,
}

pub struct Isolate {
    engine: Arc<dyn Engine>,
    options: IsolateOptions,
    /// Serializes opening, so concurrent first uses share one context.
    init: tokio::sync::Mutex<()>,
    state: Mutex<LifecycleState>,
    open: Mutex<Option<Arc<OpenState>>>,
    rpc: Mutex<Option<RpcBridge>>,
    exit_code: Arc<Mutex<Option<i32>>>,
    closed_tx: watch::Sender<Option<i32>>,
    closed_rx: watch::Receiver<Option<i32>>,
}

impl Isolate {
    pub fn new(engine: Arc<dyn Engine>, options: IsolateOptions) -> Result<Self> {
        options.validate()?;
        let (closed_tx, closed_rx) = watch::channel(None);
        Ok(Self {
            engine,
            options,
            init: tokio::sync::Mutex::new(()),
            state: Mutex::new(LifecycleState::Idle),
            open: Mutex::new(None),
            rpc: Mutex::new(None),
            exit_code: Arc::new(Mutex::new(None)),
            closed_tx,
            closed_rx,
        })
    }

    pub fn state(&self) -> LifecycleState {
        *self.state.lock()
    }

    /// Exit code recorded by a guest `process.exit`, if any.
    pub fn exit_code(&self) -> Option<i32> {
        *self.exit_code.lock()
    }

    /// Open the isolate ahead of time: create the context, install the
    /// environment, and compile the entry. `run` does this on demand.
    pub async fn init(&self) -> Result<()> {
        self.ensure_open().await.map(|_| ())
    }

    /// Execute the entry to completion and discover the exported API.
    pub async fn run(&self) -> Result<()> {
        let open = self.ensure_open().await?;
        {
            let mut state = self.state.lock();
            match *state {
                LifecycleState::Open => *state = LifecycleState::Running,
                LifecycleState::Running => {
                    return Err(Error::Configuration(
                        "entry script is already running".to_string(),
                    ));
                }
                LifecycleState::Closed => {
                    return Err(Error::Configuration(
                        "entry script already ran".to_string(),
                    ));
                }
                LifecycleState::Idle | LifecycleState::Opening | LifecycleState::Disposed => {
                    return Err(Error::Configuration("isolate is closed".to_string()));
                }
            }
        }

        match open.context.run().await {
            Ok(()) => {
                *self.state.lock() = LifecycleState::Closed;
                let rpc = RpcBridge::discover(Arc::clone(&open.context)).await?;
                *self.rpc.lock() = Some(rpc);
                Ok(())
            }
            Err(EngineError::Terminated) if self.exit_code().is_some() => {
                // Intentional guest exit: the run is considered clean and the
                // isolate closes with the recorded code.
                tracing::debug!(code = self.exit_code(), "guest exited");
                self.close();
                Ok(())
            }
            Err(err @ (EngineError::Terminated | EngineError::Disposed)) => {
                Err(Error::Execution(err.to_string()))
            }
            Err(EngineError::Guest(message)) => {
                *self.state.lock() = LifecycleState::Closed;
                // A loader failure surfaces in the guest as a thrown require;
                // prefer the typed error over the stringified exception.
                match open.loader.as_ref().and_then(RequireBridge::take_failure) {
                    Some(failure) => Err(failure),
                    None => Err(Error::Execution(message)),
                }
            }
            Err(err) => Err(err.into()),
        }
    }

    /// The exported API tree. Empty until a run has completed.
    pub fn describe_api(&self) -> ApiDescription {
        self.rpc
            .lock()
            .as_ref()
            .map_or_else(ApiDescription::empty, |rpc| rpc.describe().clone())
    }

    /// Call an exported method by dotted path. Unknown paths fail without
    /// entering the guest; before a run every path is unknown.
    pub async fn handle_api_call(&self, path: &str, args: Vec<Value>) -> Result<Value> {
        let rpc = self.rpc.lock().clone();
        match rpc {
            Some(rpc) => rpc.dispatch(path, args).await,
            None => Err(Error::MethodNotFound(path.to_string())),
        }
    }

    /// Dispose the isolate. Idempotent and safe to call while the entry runs;
    /// an in-flight run observes the disposal. Wakes [`wait_closed`] waiters
    /// with the recorded exit code, zero if the guest never exited.
    ///
    /// [`wait_closed`]: Self::wait_closed
    pub fn close(&self) {
        {
            let mut state = self.state.lock();
            if *state == LifecycleState::Disposed {
                return;
            }
            *state = LifecycleState::Disposed;
        }
        if let Some(open) = self.open.lock().take() {
            open.context.dispose();
        }
        *self.rpc.lock() = None;
        let code = self.exit_code().unwrap_or(0);
        tracing::debug!(code, "isolate closed");
        let _ = self.closed_tx.send(Some(code));
    }

    /// Watch channel carrying `Some(exit_code)` once the isolate closes.
    pub fn closed(&self) -> watch::Receiver<Option<i32>> {
        self.closed_rx.clone()
    }

    /// Wait until the isolate closes, via [`close`](Self::close) or a guest
    /// exit, and return the exit code.
    pub async fn wait_closed(&self) -> i32 {
        let mut closed = self.closed_rx.clone();
        loop {
            if let Some(code) = *closed.borrow_and_update() {
                return code;
            }
            if closed.changed().await.is_err() {
                // Sender dropped with the isolate; it closed by definition.
                return self.exit_code().unwrap_or(0);
            }
        }
    }

    /// Create the context, install the environment, and compile the entry.
    /// Concurrent callers coalesce on one opening.
    async fn ensure_open(&self) -> Result<Arc<OpenState>> {
        let _guard = self.init.lock().await;
        if let Some(open) = self.open.lock().clone() {
            return Ok(open);
        }
        if self.state() == LifecycleState::Disposed {
            return Err(Error::Configuration("isolate is closed".to_string()));
        }

        *self.state.lock() = LifecycleState::Opening;
        let opened = self.open_context().await;
        if opened.is_err() {
            let mut state = self.state.lock();
            if *state == LifecycleState::Opening {
                *state = LifecycleState::Idle;
            }
        }
        opened
    }

    async fn open_context(&self) -> Result<Arc<OpenState>> {
        let context = self.engine.create_context().await?;
        self.options.globals.install(&context).await?;

        let loader = match self.options.format {
            ModuleFormat::CommonJs => {
                let bridge = RequireBridge::open(
                    self.options.selector.clone(),
                    &self.options.path,
                    self.options.overrides.clone(),
                    self.options.env == Env::NodeJs,
                );
                let hook: Arc<dyn RequireHook> = bridge.runtime();
                context.install_require_hook(hook).await?;
                Some(bridge)
            }
            ModuleFormat::Esm => None,
        };

        if self.options.env == Env::NodeJs {
            environment::install_node_environment(&context, self.exit_bridge(&context)).await?;
        }

        let source = match &self.options.source {
            Some(source) => source.clone(),
            None => tokio::fs::read_to_string(&self.options.path)
                .await
                .map_err(|err| {
                    Error::Configuration(format!(
                        "cannot read entry module {}: {err}",
                        self.options.path.display()
                    ))
                })?,
        };
        let origin = self.options.path.display().to_string();
        match self.options.format {
            ModuleFormat::CommonJs => context.compile_script(&source, &origin).await?,
            ModuleFormat::Esm => {
                let base = self
                    .options
                    .path
                    .parent()
                    .map_or_else(PathBuf::new, Path::to_path_buf);
                let resolver = Arc::new(ImportResolver::new(
                    Arc::clone(&context),
                    base,
                    !self.options.disable_imports,
                ));
                context.link_entry_module(&source, &origin, resolver).await?;
            }
        }

        let open = Arc::new(OpenState { context, loader });
        {
            let mut state = self.state.lock();
            if *state == LifecycleState::Disposed {
                // close() raced the opening; never hand out a live context.
                open.context.dispose();
                return Err(Error::Configuration("isolate is closed".to_string()));
            }
            *state = LifecycleState::Open;
            *self.open.lock() = Some(Arc::clone(&open));
        }
        tracing::debug!(entry = %self.options.path.display(), "isolate open");
        Ok(open)
    }

    /// `process.exit`: record the code, then tear the context down through the
    /// typed termination path so `run` can tell it apart from disposal.
    fn exit_bridge(&self, context: &Arc<dyn EngineContext>) -> HostFunction {
        let exit_code = Arc::clone(&self.exit_code);
        let context = Arc::clone(context);
        HostFunction::from_fn(move |args| {
            let code = args
                .first()
                .and_then(Value::as_i64)
                .and_then(|code| i32::try_from(code).ok())
                .unwrap_or(0);
            exit_code.lock().get_or_insert(code);
            context.request_termination();
            async { Ok(Value::Null) }
        })
    }
}
