//! Workflow definitions on disk.
//!
//! A workflows directory holds one `<id>.yaml`, `<id>.yml` or `<id>.json`
//! file per workflow and an optional `templates/` directory for the shared
//! [`TemplateStore`]. Parsed and validated workflows are kept in an LRU cache.

use super::model::Workflow;
use super::template::TemplateStore;
use super::validate::validate;
use crate::config::parse_document;
use crate::{Error, ErrorContext, Result};
use lru::LruCache;
use std::num::NonZeroUsize;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

const EXTENSIONS: [&str; 3] = ["yaml", "yml", "json"];
const DEFAULT_CACHE: usize = 64;

pub struct WorkflowLoader {
    dir: PathBuf,
    templates: TemplateStore,
    cache: Mutex<LruCache<String, Arc<Workflow>>>,
}

impl std::fmt::Debug for WorkflowLoader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkflowLoader")
            .field("dir", &self.dir)
            .field("templates", &self.templates.len())
            .finish()
    }
}

fn cache_size(n: usize) -> NonZeroUsize {
    NonZeroUsize::new(n).unwrap_or(NonZeroUsize::MIN)
}

impl WorkflowLoader {
    /// Open a workflows directory and read its shared templates.
    pub async fn open(dir: impl AsRef<Path>) -> Result<Self> {
        let dir = dir.as_ref().to_path_buf();
        let templates = TemplateStore::from_dir(&dir.join("templates")).await?;
        Ok(Self {
            dir,
            templates,
            cache: Mutex::new(LruCache::new(cache_size(DEFAULT_CACHE))),
        })
    }

    pub fn with_cache_size(self, n: usize) -> Self {
        Self {
            cache: Mutex::new(LruCache::new(cache_size(n))),
            ..self
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn templates(&self) -> &TemplateStore {
        &self.templates
    }

    fn lock_error(e: impl std::fmt::Display) -> Error {
        Error::workflow_with_context(
            format!("workflow cache lock poisoned: {}", e),
            ErrorContext::new().with_source("workflow_loader"),
        )
    }

    /// Load, validate and cache the workflow with this id.
    pub async fn load(&self, id: &str) -> Result<Arc<Workflow>> {
        {
            let mut cache = self.cache.lock().map_err(Self::lock_error)?;
            if let Some(wf) = cache.get(id) {
                return Ok(wf.clone());
            }
        }

        if id.is_empty() || id.contains(['/', '\\']) || id.starts_with('.') {
            return Err(Error::invalid_request(format!("invalid workflow id '{}'", id)));
        }
        let path = self.find(id).await?;
        let workflow = Arc::new(self.load_path(&path).await?);
        if workflow.id != id {
            return Err(Error::validation_with_context(
                format!("file declares id '{}', expected '{}'", workflow.id, id),
                ErrorContext::new().with_source(path.display().to_string()),
            ));
        }

        tracing::debug!(
            event = "workflow_loaded",
            workflow_id = id,
            steps = workflow.steps.len(),
            "workflow loaded"
        );
        let mut cache = self.cache.lock().map_err(Self::lock_error)?;
        cache.put(id.to_string(), workflow.clone());
        Ok(workflow)
    }

    /// Parse and validate one file without touching the cache.
    pub async fn load_path(&self, path: &Path) -> Result<Workflow> {
        let content = tokio::fs::read_to_string(path).await?;
        let ext = path.extension().and_then(|e| e.to_str()).unwrap_or("yaml");
        let workflow: Workflow = parse_document(&content, ext).map_err(|e| {
            Error::validation_with_context(
                format!("cannot parse workflow: {}", e),
                ErrorContext::new().with_source(path.display().to_string()),
            )
        })?;
        validate(&workflow, &self.templates)?;
        Ok(workflow)
    }

    async fn find(&self, id: &str) -> Result<PathBuf> {
        for ext in EXTENSIONS {
            let path = self.dir.join(format!("{}.{}", id, ext));
            if tokio::fs::try_exists(&path).await? {
                return Ok(path);
            }
        }
        Err(Error::not_found(format!(
            "workflow '{}' not found in {}",
            id,
            self.dir.display()
        )))
    }

    /// Workflow files in the directory, sorted by path.
    pub async fn files(&self) -> Result<Vec<PathBuf>> {
        let mut out = Vec::new();
        let mut entries = tokio::fs::read_dir(&self.dir).await?;
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            let known = path
                .extension()
                .and_then(|e| e.to_str())
                .map_or(false, |e| EXTENSIONS.contains(&e));
            if known && entry.file_type().await?.is_file() {
                out.push(path);
            }
        }
        out.sort();
        Ok(out)
    }

    /// Ids of every workflow file, by file stem.
    pub async fn list(&self) -> Result<Vec<String>> {
        Ok(self
            .files()
            .await?
            .iter()
            .filter_map(|p| p.file_stem().and_then(|s| s.to_str()).map(str::to_string))
            .collect())
    }

    /// Parse and validate every file, reporting each outcome.
    pub async fn check_all(&self) -> Result<Vec<(PathBuf, Result<Workflow>)>> {
        let mut out = Vec::new();
        for path in self.files().await? {
            let outcome = self.load_path(&path).await;
            out.push((path, outcome));
        }
        Ok(out)
    }

    pub fn invalidate(&self, id: &str) {
        if let Ok(mut cache) = self.cache.lock() {
            cache.pop(id);
        }
    }

    pub fn clear(&self) {
        if let Ok(mut cache) = self.cache.lock() {
            cache.clear();
        }
    }
}
