//! Filesystem module resolution.
//!
//! Browser-style resolution over an abstract filesystem: relative and absolute
//! specifiers probe the exact path, `.js`/`.json` extensions, and directory
//! `package.json` main fields; bare specifiers walk `node_modules` directories
//! upward from the requiring file. The backing store is pluggable per path
//! prefix, so module trees can live somewhere other than the local disk.

use std::io;
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;

/// Async filesystem view used for module resolution and source reads.
#[async_trait::async_trait]
pub trait ModuleFs: Send + Sync + 'static {
    async fn read_file(&self, path: &Path) -> io::Result<String>;
    async fn is_file(&self, path: &Path) -> io::Result<bool>;
    async fn is_dir(&self, path: &Path) -> io::Result<bool>;
}

/// Local-disk filesystem over `tokio::fs`.
pub struct LocalFs;

fn absent(err: &io::Error) -> bool {
    matches!(
        err.kind(),
        io::ErrorKind::NotFound | io::ErrorKind::NotADirectory
    )
}

#[async_trait::async_trait]
impl ModuleFs for LocalFs {
    async fn read_file(&self, path: &Path) -> io::Result<String> {
        tokio::fs::read_to_string(path).await
    }

    async fn is_file(&self, path: &Path) -> io::Result<bool> {
        match tokio::fs::metadata(path).await {
            Ok(meta) => Ok(meta.is_file()),
            Err(err) if absent(&err) => Ok(false),
            Err(err) => Err(err),
        }
    }

    async fn is_dir(&self, path: &Path) -> io::Result<bool> {
        match tokio::fs::metadata(path).await {
            Ok(meta) => Ok(meta.is_dir()),
            Err(err) if absent(&err) => Ok(false),
            Err(err) => Err(err),
        }
    }
}

/// Chooses the backing store for a path by longest matching prefix, falling
/// back to the default store (local disk unless replaced).
#[derive(Clone)]
pub struct FsSelector {
    routes: Vec<(PathBuf, Arc<dyn ModuleFs>)>,
    default: Arc<dyn ModuleFs>,
}

impl FsSelector {
    #[must_use]
    pub fn local() -> Self {
        Self {
            routes: Vec::new(),
            default: Arc::new(LocalFs),
        }
    }

    #[must_use]
    pub fn with_default(default: Arc<dyn ModuleFs>) -> Self {
        Self {
            routes: Vec::new(),
            default,
        }
    }

    /// Route paths under `prefix` to `fs`.
    #[must_use]
    pub fn route(mut self, prefix: impl Into<PathBuf>, fs: Arc<dyn ModuleFs>) -> Self {
        self.routes.push((prefix.into(), fs));
        self
    }

    #[must_use]
    pub fn select(&self, path: &Path) -> &Arc<dyn ModuleFs> {
        self.routes
            .iter()
            .filter(|(prefix, _)| path.starts_with(prefix))
            .max_by_key(|(prefix, _)| prefix.as_os_str().len())
            .map_or(&self.default, |(_, fs)| fs)
    }
}

impl Default for FsSelector {
    fn default() -> Self {
        Self::local()
    }
}

/// Lexically normalize `.` and `..` components without touching the
/// filesystem.
pub(crate) fn normalize(path: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                if !out.pop() {
                    out.push(Component::ParentDir);
                }
            }
            other => out.push(other),
        }
    }
    out
}

/// Resolve `name` against `basedir`. `Ok(None)` means the specifier is not
/// resolvable; I/O failures other than absence propagate untouched.
pub async fn resolve(
    fs: &dyn ModuleFs,
    name: &str,
    basedir: &Path,
) -> io::Result<Option<PathBuf>> {
    if name.starts_with("./") || name.starts_with("../") || name.starts_with('/') {
        let candidate = normalize(&basedir.join(name));
        return resolve_path(fs, &candidate).await;
    }

    // Bare specifier: walk node_modules upward from the base directory.
    let mut dir = Some(basedir);
    while let Some(current) = dir {
        let candidate = current.join("node_modules").join(name);
        if let Some(found) = resolve_path(fs, &candidate).await? {
            return Ok(Some(found));
        }
        dir = current.parent();
    }
    Ok(None)
}

async fn resolve_path(fs: &dyn ModuleFs, candidate: &Path) -> io::Result<Option<PathBuf>> {
    if let Some(file) = probe_file(fs, candidate).await? {
        return Ok(Some(file));
    }
    if fs.is_dir(candidate).await? {
        return resolve_directory(fs, candidate).await;
    }
    Ok(None)
}

/// Exact path, then `.js`/`.json` extension probing.
async fn probe_file(fs: &dyn ModuleFs, candidate: &Path) -> io::Result<Option<PathBuf>> {
    if fs.is_file(candidate).await? {
        return Ok(Some(candidate.to_path_buf()));
    }
    for ext in ["js", "json"] {
        let mut probed = candidate.as_os_str().to_owned();
        probed.push(".");
        probed.push(ext);
        let probed = PathBuf::from(probed);
        if fs.is_file(&probed).await? {
            return Ok(Some(probed));
        }
    }
    Ok(None)
}

/// `package.json` `browser`/`main` (string form), then `index.js`/`index.json`.
async fn resolve_directory(fs: &dyn ModuleFs, dir: &Path) -> io::Result<Option<PathBuf>> {
    let manifest = dir.join("package.json");
    if fs.is_file(&manifest).await? {
        let text = fs.read_file(&manifest).await?;
        if let Ok(parsed) = serde_json::from_str::<serde_json::Value>(&text) {
            let field = parsed
                .get("browser")
                .and_then(serde_json::Value::as_str)
                .or_else(|| parsed.get("main").and_then(serde_json::Value::as_str));
            if let Some(main) = field {
                let target = normalize(&dir.join(main));
                if let Some(file) = probe_file(fs, &target).await? {
                    return Ok(Some(file));
                }
                if let Some(file) = probe_file(fs, &target.join("index")).await? {
                    return Ok(Some(file));
                }
            }
        }
    }
    probe_file(fs, &dir.join("index")).await
}
