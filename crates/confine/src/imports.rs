//! Static-import resolution for ESM entry modules.
//!
//! Imports only resolve to files under the configured base directory. Anything
//! else, including read failures and escapes via `..`, links against a shared
//! inert module instead of failing the link, so a probing guest learns nothing
//! about the host filesystem layout.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use futures::FutureExt;
use futures::future::{BoxFuture, Shared};
use parking_lot::Mutex;
use tokio::sync::OnceCell;

use crate::engine::{BoxError, CompiledModule, EngineContext, ImportHook};
use crate::loader::resolve::normalize;

/// Origin name of the inert module handed out for anything unresolvable.
pub const EMPTY_MODULE_NAME: &str = "@@empty";
const EMPTY_MODULE_SOURCE: &str = "export default {};\n";

type ModuleFuture = Shared<BoxFuture<'static, Result<CompiledModule, String>>>;

/// Resolve `specifier` against the importing module's directory and keep the
/// result only if it stays under `base`.
fn resolve_confined(base: &Path, specifier: &str, referrer: &str) -> Option<PathBuf> {
    let dir = Path::new(referrer).parent().unwrap_or_else(|| Path::new(""));
    let path = normalize(&dir.join(specifier));
    path.starts_with(base).then_some(path)
}

pub struct ImportResolver {
    context: Arc<dyn EngineContext>,
    base: PathBuf,
    enabled: bool,
    empty: OnceCell<CompiledModule>,
    /// Per-path compilation, memoized so repeated imports of one file share a
    /// single compiled module and concurrent links share one in-flight read.
    modules: Mutex<HashMap<PathBuf, ModuleFuture>>,
}

impl ImportResolver {
    pub fn new(context: Arc<dyn EngineContext>, base: PathBuf, enabled: bool) -> Self {
        Self {
            context,
            base: normalize(&base),
            enabled,
            empty: OnceCell::new(),
            modules: Mutex::new(HashMap::new()),
        }
    }

    async fn empty_module(&self) -> Result<CompiledModule, BoxError> {
        let module = self
            .empty
            .get_or_try_init(|| {
                self.context
                    .compile_module(EMPTY_MODULE_SOURCE, EMPTY_MODULE_NAME)
            })
            .await
            .map_err(BoxError::from)?;
        Ok(*module)
    }

    fn load(&self, path: PathBuf) -> ModuleFuture {
        let mut modules = self.modules.lock();
        if let Some(pending) = modules.get(&path) {
            return pending.clone();
        }
        let context = Arc::clone(&self.context);
        let key = path.clone();
        let pending = async move {
            let source = match tokio::fs::read_to_string(&path).await {
                Ok(source) => source,
                Err(err) => {
                    tracing::debug!(path = %path.display(), error = %err, "import read failed");
                    return context
                        .compile_module(EMPTY_MODULE_SOURCE, EMPTY_MODULE_NAME)
                        .await
                        .map_err(|err| err.to_string());
                }
            };
            context
                .compile_module(&source, &path.display().to_string())
                .await
                .map_err(|err| err.to_string())
        }
        .boxed()
        .shared();
        modules.insert(key, pending.clone());
        pending
    }
}

#[async_trait::async_trait]
impl ImportHook for ImportResolver {
    async fn resolve(
        &self,
        specifier: &str,
        referrer: &str,
    ) -> Result<CompiledModule, BoxError> {
        if !self.enabled {
            return self.empty_module().await;
        }
        let Some(path) = resolve_confined(&self.base, specifier, referrer) else {
            tracing::debug!(specifier, referrer, "import escapes module root");
            return self.empty_module().await;
        };
        self.load(path).await.map_err(BoxError::from)
    }
}
