//! Interface to the embeddable script engine.
//!
//! The engine itself is an external collaborator: it owns the isolated heap,
//! compiles and executes guest code, and enforces the copy/reference marshaling
//! rules at the isolation boundary. Everything this crate needs from it is
//! expressed here as trait surface, so the runtime core never links against a
//! concrete engine.

use std::sync::Arc;

use futures::future::BoxFuture;
use serde_json::Value;

pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;
pub type EngineResult<T, E = EngineError> = core::result::Result<T, E>;

#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    /// The context was torn down through
    /// [`EngineContext::request_termination`] while guest code was executing.
    /// Produced by that path only; generic disposal reports [`Self::Disposed`].
    #[error("guest requested termination")]
    Terminated,

    /// The context was disposed while guest code was executing.
    #[error("context was disposed during execution")]
    Disposed,

    /// Uncaught guest exception, with the guest's own message.
    #[error("{0}")]
    Guest(String),

    /// Engine-internal failure.
    #[error("engine error: {0}")]
    Internal(#[source] anyhow::Error),
}

/// Reference-semantics handle to a guest-heap CJS module object.
///
/// The handle stays valid until the owning context is disposed. Two handles
/// compare equal exactly when they refer to the same guest object, which is
/// what makes `require` identity observable from the host side.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct ModuleRef(pub u64);

/// Handle to a compiled ESM module object owned by the engine.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct CompiledModule(pub u64);

/// Host callable crossing the isolation boundary.
///
/// The guest never sees a raw function pointer; it sees a stub that forwards
/// argument copies to [`invoke`](Self::invoke) and resolves a guest promise
/// with a copy of the result. Invocations of a single bridge must be observed
/// by the host in the order the guest issued them.
#[derive(Clone)]
pub struct HostFunction(Arc<dyn HostFn>);

pub trait HostFn: Send + Sync + 'static {
    fn invoke(&self, args: Vec<Value>) -> BoxFuture<'static, core::result::Result<Value, BoxError>>;
}

impl HostFunction {
    pub fn new(function: impl HostFn) -> Self {
        Self(Arc::new(function))
    }

    /// Wrap an async closure as a host function.
    pub fn from_fn<F, Fut>(function: F) -> Self
    where
        F: Fn(Vec<Value>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = core::result::Result<Value, BoxError>> + Send + 'static,
    {
        struct FnBridge<F>(F);

        impl<F, Fut> HostFn for FnBridge<F>
        where
            F: Fn(Vec<Value>) -> Fut + Send + Sync + 'static,
            Fut: Future<Output = core::result::Result<Value, BoxError>> + Send + 'static,
        {
            fn invoke(
                &self,
                args: Vec<Value>,
            ) -> BoxFuture<'static, core::result::Result<Value, BoxError>> {
                Box::pin((self.0)(args))
            }
        }

        Self::new(FnBridge(function))
    }

    pub fn invoke(
        &self,
        args: Vec<Value>,
    ) -> BoxFuture<'static, core::result::Result<Value, BoxError>> {
        self.0.invoke(args)
    }
}

impl core::fmt::Debug for HostFunction {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_tuple("HostFunction").field(&"<opaque>").finish()
    }
}

/// Source and identity of one CJS module body.
#[derive(Debug, Clone, Copy)]
pub struct ModuleBody<'a> {
    pub source: &'a str,
    /// Resolved filename, as the guest's `__filename`.
    pub filename: &'a str,
    /// Containing directory, as the guest's `__dirname`.
    pub dirname: &'a str,
    /// Synthetic `file://` URL naming the script in stack traces.
    pub source_url: &'a str,
}

/// Synchronous guest-heap operations available while the engine is executing
/// on the guest thread. Handed to [`RequireHook::require`]; unusable outside
/// that call.
pub trait GuestScope {
    /// Allocate a fresh module object (`{ exports: {} }`) on the guest heap.
    fn alloc_module(&mut self) -> EngineResult<ModuleRef>;

    /// Compile `body.source` as a function body receiving `module`, `exports`,
    /// `__filename`, `__dirname` and a `require` closure bound to
    /// `body.filename`, then execute it immediately against `module`. A nested
    /// `require` from the body re-enters the installed hook with `from` set to
    /// `body.filename`.
    fn run_module_body(&mut self, module: ModuleRef, body: &ModuleBody<'_>) -> EngineResult<()>;

    /// Replace `module.exports` with data parsed from JSON source text.
    fn set_exports_json(&mut self, module: ModuleRef, source: &str) -> EngineResult<()>;
}

/// Guest-thread `require` entry point installed by the host.
///
/// The engine invokes this synchronously on the guest thread whenever guest
/// code evaluates `require(name)`. The hook may block that thread (and nothing
/// else) while the host resolves and reads sources. An `Err` return is thrown
/// into the guest as an exception.
pub trait RequireHook: Send + Sync + 'static {
    /// `from` is the resolved filename of the requiring module, or `None` for
    /// the entry script. The returned module's current `exports` value is what
    /// the guest-side `require` call evaluates to.
    fn require(
        &self,
        scope: &mut dyn GuestScope,
        name: &str,
        from: Option<&str>,
    ) -> core::result::Result<ModuleRef, BoxError>;
}

/// Host-side resolver the engine consults while linking ESM imports.
#[async_trait::async_trait]
pub trait ImportHook: Send + Sync + 'static {
    async fn resolve(
        &self,
        specifier: &str,
        referrer: &str,
    ) -> core::result::Result<CompiledModule, BoxError>;
}

/// One isolated context: its own heap and global object.
///
/// All methods are async from the host's perspective; guest execution happens
/// on the engine's own thread of control, never on the caller's executor.
#[async_trait::async_trait]
pub trait EngineContext: Send + Sync + 'static {
    /// Install an empty namespace object at dotted `path` on the guest global.
    /// Parent namespaces must already exist.
    async fn install_namespace(&self, path: &str) -> EngineResult<()>;

    /// Install a function bridge at dotted `path`. The guest-side stub
    /// forwards arguments by value copy, invokes `function`, and returns a
    /// guest promise resolving to a value copy of the result.
    async fn install_bridge(&self, path: &str, function: HostFunction) -> EngineResult<()>;

    /// Install the synchronous `require` hook (CJS format only).
    async fn install_require_hook(&self, hook: Arc<dyn RequireHook>) -> EngineResult<()>;

    /// Run a host-provided setup script on the guest thread, before the entry
    /// executes. The script sees the globals, bridges, and require hook
    /// installed so far; `origin` names it in stack traces.
    async fn run_bootstrap(&self, source: &str, origin: &str) -> EngineResult<()>;

    /// Compile the entry script (CJS format).
    async fn compile_script(&self, source: &str, origin: &str) -> EngineResult<()>;

    /// Compile an ESM module source, returning a handle an [`ImportHook`] can
    /// hand back during linking.
    async fn compile_module(&self, source: &str, origin: &str) -> EngineResult<CompiledModule>;

    /// Compile and link the entry ESM module, resolving every static import
    /// through `imports`.
    async fn link_entry_module(
        &self,
        source: &str,
        origin: &str,
        imports: Arc<dyn ImportHook>,
    ) -> EngineResult<()>;

    /// Execute the compiled entry to completion.
    async fn run(&self) -> EngineResult<()>;

    /// Dotted property paths of every function reachable from the guest's
    /// top-level exports. The traversal must be bounded and guarded by object
    /// identity, so a cyclic export graph terminates; duplicate paths collapse
    /// first-wins. For CJS this walks `module.exports`; for ESM it walks the
    /// entry module's namespace object.
    async fn exported_function_paths(&self) -> EngineResult<Vec<String>>;

    /// Evaluate a property-path access against the guest exports and apply the
    /// call with copy-semantics arguments, returning a copy of the result.
    async fn call_export(&self, path: &str, args: Vec<Value>) -> EngineResult<Value>;

    /// Typed intentional termination: tear the context down so that an
    /// in-flight [`run`](Self::run) returns [`EngineError::Terminated`].
    fn request_termination(&self);

    /// Dispose the context. Idempotent; an in-flight [`run`](Self::run)
    /// returns [`EngineError::Disposed`] unless termination was requested
    /// first.
    fn dispose(&self);
}

/// Engine entry point: creates one isolated context per confined execution.
#[async_trait::async_trait]
pub trait Engine: Send + Sync + 'static {
    async fn create_context(&self) -> EngineResult<Arc<dyn EngineContext>>;
}
