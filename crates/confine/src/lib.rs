pub mod engine;
pub mod environment;
pub mod error;
pub mod imports;
pub mod isolate;
pub mod loader;
pub mod rpc;

/// Log target carrying guest `console.log` output.
pub const TRACE_TARGET_GUEST: &str = "confine::guest";

pub use engine::{
    BoxError, CompiledModule, Engine, EngineContext, EngineError, GuestScope, HostFunction,
    ImportHook, ModuleBody, ModuleRef, RequireHook,
};
pub use environment::{GlobalValue, Globals};
pub use error::{Error, Result};
pub use isolate::{Env, Isolate, IsolateOptions, LifecycleState, ModuleFormat};
pub use loader::{FsSelector, LocalFs, ModuleFs};
pub use rpc::{ApiDescription, ApiNode, RpcBridge};
