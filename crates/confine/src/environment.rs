//! Host-defined guest globals.
//!
//! A [`Globals`] tree describes the namespaces and function bridges installed
//! on the guest global object before the entry script runs. A `console.log`
//! bridge that forwards to host logging is provided unless the tree already
//! defines one.

use std::collections::BTreeMap;
use std::sync::Arc;

use serde_json::Value;

use crate::TRACE_TARGET_GUEST;
use crate::engine::{EngineContext, HostFunction};
use crate::error::{Error, Result};

#[derive(Debug, Clone)]
pub enum GlobalValue {
    Function(HostFunction),
    Namespace(BTreeMap<String, GlobalValue>),
}

/// Tree of globals to install, addressed by dotted paths.
#[derive(Debug, Clone, Default)]
pub struct Globals {
    root: BTreeMap<String, GlobalValue>,
}

impl Globals {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a function bridge at dotted `path`, creating intermediate
    /// namespaces. Fails if the path crosses an existing function.
    pub fn bridge(mut self, path: &str, function: HostFunction) -> Result<Self> {
        insert(&mut self.root, path, GlobalValue::Function(function))?;
        Ok(self)
    }

    /// Register an empty namespace at dotted `path`.
    pub fn namespace(mut self, path: &str) -> Result<Self> {
        insert(
            &mut self.root,
            path,
            GlobalValue::Namespace(BTreeMap::new()),
        )?;
        Ok(self)
    }

    pub fn contains(&self, path: &str) -> bool {
        let mut level = &self.root;
        let mut segments = path.split('.').peekable();
        while let Some(segment) = segments.next() {
            match level.get(segment) {
                None => return false,
                Some(GlobalValue::Function(_)) => return segments.peek().is_none(),
                Some(GlobalValue::Namespace(children)) => {
                    if segments.peek().is_none() {
                        return true;
                    }
                    level = children;
                }
            }
        }
        false
    }

    /// Install the tree on `context`, parents before children. Adds the
    /// default `console.log` bridge when the tree does not define a `console`
    /// of its own.
    pub async fn install(&self, context: &Arc<dyn EngineContext>) -> Result<()> {
        install_level(context, &self.root, None).await?;
        if !self.contains("console") {
            context.install_namespace("console").await?;
            context
                .install_bridge("console.log", default_console_log())
                .await?;
        }
        Ok(())
    }
}

/// Bridge path the nodejs `process.exit` shim calls into.
pub(crate) const EXIT_BRIDGE: &str = "__processExit";

/// Guest-side nodejs compatibility shims: `queueMicrotask`, `nextTick` and
/// `nextTickArgs`, a throwing `setImmediate`, the `process` object, and the
/// `Buffer` global bound through `require('buffer')`.
static NODE_SHIMS: &str = include_str!("environment/nodejs_shims.js");

/// Install the nodejs environment: the exit bridge, then the shim script run
/// on the guest thread. Requires the require hook to be installed already, so
/// the shims can pull in the `buffer` and `events` polyfills.
pub(crate) async fn install_node_environment(
    context: &Arc<dyn EngineContext>,
    exit: HostFunction,
) -> Result<()> {
    context.install_bridge(EXIT_BRIDGE, exit).await?;
    context.run_bootstrap(NODE_SHIMS, "node:environment").await?;
    Ok(())
}

fn insert(root: &mut BTreeMap<String, GlobalValue>, path: &str, value: GlobalValue) -> Result<()> {
    let Some((head, rest)) = split_path(path)? else {
        return Err(Error::Configuration(format!("empty global path {path:?}")));
    };
    let Some(rest) = rest else {
        root.insert(head.to_string(), value);
        return Ok(());
    };
    let entry = root
        .entry(head.to_string())
        .or_insert_with(|| GlobalValue::Namespace(BTreeMap::new()));
    match entry {
        GlobalValue::Namespace(children) => insert(children, rest, value),
        GlobalValue::Function(_) => Err(Error::Configuration(format!(
            "global path {path:?} crosses the function at {head:?}"
        ))),
    }
}

fn split_path(path: &str) -> Result<Option<(&str, Option<&str>)>> {
    match path.split_once('.') {
        Some((head, rest)) if !head.is_empty() && !rest.is_empty() => Ok(Some((head, Some(rest)))),
        Some(_) => Err(Error::Configuration(format!(
            "malformed global path {path:?}"
        ))),
        None if path.is_empty() => Ok(None),
        None => Ok(Some((path, None))),
    }
}

fn install_level(
    context: &Arc<dyn EngineContext>,
    level: &BTreeMap<String, GlobalValue>,
    prefix: Option<&str>,
) -> futures::future::BoxFuture<'static, Result<()>> {
    let context = Arc::clone(context);
    let level = level.clone();
    let prefix = prefix.map(ToString::to_string);
    Box::pin(async move {
        for (name, value) in &level {
            let path = match &prefix {
                Some(prefix) => format!("{prefix}.{name}"),
                None => name.clone(),
            };
            match value {
                GlobalValue::Function(function) => {
                    context.install_bridge(&path, function.clone()).await?;
                }
                GlobalValue::Namespace(children) => {
                    context.install_namespace(&path).await?;
                    install_level(&context, children, Some(&path)).await?;
                }
            }
        }
        Ok(())
    })
}

/// `console.log` implementation: format the argument copies and emit them on
/// the guest log target.
fn default_console_log() -> HostFunction {
    HostFunction::from_fn(|args| async move {
        let line = format_console_args(&args);
        tracing::info!(target: TRACE_TARGET_GUEST, "{line}");
        Ok(Value::Null)
    })
}

pub(crate) fn format_console_args(args: &[Value]) -> String {
    args.iter()
        .map(|arg| match arg {
            Value::String(text) => text.clone(),
            other => other.to_string(),
        })
        .collect::<Vec<_>>()
        .join(" ")
}
