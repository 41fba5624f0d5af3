//! Host-facing view of the guest's exported API.
//!
//! After the entry script runs, the guest's exports are discovered once as a
//! set of dotted function paths and folded into a namespace tree. Calls are
//! validated against that tree before anything crosses the boundary.

use std::collections::BTreeMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::engine::EngineContext;
use crate::error::{Error, Result};

/// One node of the exported API tree.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "children", rename_all = "lowercase")]
pub enum ApiNode {
    Method,
    Namespace(BTreeMap<String, ApiNode>),
}

impl ApiNode {
    fn namespace() -> Self {
        Self::Namespace(BTreeMap::new())
    }

    fn child(&self, name: &str) -> Option<&Self> {
        match self {
            Self::Method => None,
            Self::Namespace(children) => children.get(name),
        }
    }
}

/// The guest API as a namespace tree, built from dotted function paths.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApiDescription {
    pub root: ApiNode,
}

impl ApiDescription {
    pub fn empty() -> Self {
        Self {
            root: ApiNode::namespace(),
        }
    }

    /// Fold dotted paths into a tree. The first registration of a path wins;
    /// a later path cannot turn an existing method into a namespace or descend
    /// through one.
    pub fn from_paths<I, S>(paths: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut root = ApiNode::namespace();
        for path in paths {
            insert_path(&mut root, path.as_ref());
        }
        Self { root }
    }

    /// Whether `path` names a callable method.
    pub fn is_method(&self, path: &str) -> bool {
        let mut node = &self.root;
        for segment in path.split('.') {
            match node.child(segment) {
                Some(next) => node = next,
                None => return false,
            }
        }
        matches!(node, ApiNode::Method)
    }
}

fn insert_path(root: &mut ApiNode, path: &str) {
    let mut node = root;
    let mut segments = path.split('.').peekable();
    while let Some(segment) = segments.next() {
        if segment.is_empty() {
            return;
        }
        let ApiNode::Namespace(children) = node else {
            return;
        };
        if segments.peek().is_none() {
            children.entry(segment.to_string()).or_insert(ApiNode::Method);
            return;
        }
        node = children
            .entry(segment.to_string())
            .or_insert_with(ApiNode::namespace);
    }
}

/// Call dispatcher bound to one context's discovered API.
#[derive(Clone)]
pub struct RpcBridge {
    context: Arc<dyn EngineContext>,
    description: ApiDescription,
}

impl RpcBridge {
    /// Discover the exported API of `context`. Valid once the entry script has
    /// finished populating its exports.
    pub async fn discover(context: Arc<dyn EngineContext>) -> Result<Self> {
        let paths = context.exported_function_paths().await?;
        tracing::debug!(methods = paths.len(), "api discovery complete");
        Ok(Self {
            context,
            description: ApiDescription::from_paths(paths),
        })
    }

    pub fn describe(&self) -> &ApiDescription {
        &self.description
    }

    /// Invoke the method at dotted `path` with copy-semantics arguments.
    ///
    /// Validation is pure: an unknown path fails with
    /// [`Error::MethodNotFound`] before touching the guest, so probing the API
    /// surface cannot run guest code.
    pub async fn dispatch(&self, path: &str, args: Vec<Value>) -> Result<Value> {
        if !self.description.is_method(path) {
            return Err(Error::MethodNotFound(path.to_string()));
        }
        tracing::trace!(path, args = args.len(), "dispatching api call");
        Ok(self.context.call_export(path, args).await?)
    }
}
