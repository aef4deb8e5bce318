//! Codegen orchestration
//!
//! Runs a configurable set of generators over the project, either once
//! (`generate_all`) or continuously under a file watcher (`watch`). One
//! generation is in flight at a time: events arriving while a generation
//! runs are queued and coalesced into exactly one follow-up run, and bursts
//! are collapsed by a short debounce window. A failing generator is logged
//! and never prevents the others from running.
//!
//! Configuration comes from `.spfnrc.json`'s `codegen` field, falling back
//! to `[package.metadata.spfn.codegen]` in `Cargo.toml`, falling back to the
//! built-in contract client generator. Generator entries resolve against a
//! factory registry; there is no runtime code loading, so `package:` and
//! `path` entries must be pre-registered under those keys.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use notify::Watcher;
use serde::Deserialize;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::error::{Error, Result};

pub mod client;

pub use client::ContractClientGenerator;

/// Default debounce window for file-event bursts
pub const DEFAULT_DEBOUNCE: Duration = Duration::from_millis(100);

/// Kind of file-system change delivered to generators
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileEvent {
    Added,
    Changed,
    Removed,
}

/// Project paths shared by all generators
#[derive(Debug, Clone)]
pub struct GeneratorContext {
    pub project_root: PathBuf,
    pub route_dir: PathBuf,
    pub out_dir: PathBuf,
}

/// A pluggable unit of code generation
#[async_trait]
pub trait Generator: Send + Sync {
    /// Unique name, referenced from configuration
    fn name(&self) -> &str;

    /// Glob patterns (relative to the project root) whose changes concern
    /// this generator
    fn watch_patterns(&self) -> Vec<String>;

    async fn generate(&self, ctx: &GeneratorContext) -> Result<()>;

    /// Incremental hook; return `Ok(false)` when the change was not handled
    /// so the orchestrator falls back to a full [`generate`](Self::generate).
    async fn on_file_change(
        &self,
        _path: &Path,
        _event: FileEvent,
        _ctx: &GeneratorContext,
    ) -> Result<bool> {
        Ok(false)
    }
}

// ============================================================================
// Configuration
// ============================================================================

/// `codegen` section of `.spfnrc.json` / `Cargo.toml` metadata
#[derive(Debug, Clone, Deserialize)]
pub struct CodegenConfig {
    #[serde(default = "default_generators")]
    pub generators: Vec<GeneratorEntry>,
}

impl Default for CodegenConfig {
    fn default() -> Self {
        Self {
            generators: default_generators(),
        }
    }
}

/// One configured generator
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum GeneratorEntry {
    /// Built-in or registry-resolved generator, optionally with options
    Named {
        name: String,
        #[serde(default = "default_true")]
        enabled: bool,
        #[serde(flatten)]
        options: serde_json::Map<String, serde_json::Value>,
    },
    /// Local file path; resolvable only through a pre-registered factory
    Local { path: String },
}

fn default_true() -> bool {
    true
}

fn default_generators() -> Vec<GeneratorEntry> {
    vec![GeneratorEntry::Named {
        name: "contract".to_string(),
        enabled: true,
        options: serde_json::Map::new(),
    }]
}

/// Resolve the codegen configuration for a project
pub fn load_codegen_config(project_root: &Path) -> CodegenConfig {
    let rc_path = project_root.join(".spfnrc.json");
    if rc_path.exists() {
        match std::fs::read_to_string(&rc_path)
            .map_err(|e| e.to_string())
            .and_then(|raw| serde_json::from_str::<serde_json::Value>(&raw).map_err(|e| e.to_string()))
        {
            Ok(value) => {
                if let Some(codegen) = value.get("codegen") {
                    match serde_json::from_value::<CodegenConfig>(codegen.clone()) {
                        Ok(config) => return config,
                        Err(e) => {
                            tracing::warn!(".spfnrc.json codegen section is invalid: {}", e)
                        }
                    }
                }
            }
            Err(e) => tracing::warn!(".spfnrc.json could not be read: {}", e),
        }
    }

    let manifest_path = project_root.join("Cargo.toml");
    if manifest_path.exists() {
        if let Ok(raw) = std::fs::read_to_string(&manifest_path) {
            if let Ok(manifest) = raw.parse::<toml::Value>() {
                let metadata = manifest
                    .get("package")
                    .and_then(|p| p.get("metadata"))
                    .and_then(|m| m.get("spfn"))
                    .and_then(|s| s.get("codegen"));
                if let Some(codegen) = metadata {
                    match codegen.clone().try_into::<CodegenConfig>() {
                        Ok(config) => return config,
                        Err(e) => tracing::warn!(
                            "Cargo.toml [package.metadata.spfn.codegen] is invalid: {}",
                            e
                        ),
                    }
                }
            }
        }
    }

    CodegenConfig::default()
}

// ============================================================================
// Generator registry
// ============================================================================

type GeneratorFactory =
    Arc<dyn Fn(&serde_json::Map<String, serde_json::Value>) -> Result<Arc<dyn Generator>> + Send + Sync>;

/// Maps configuration entries to generator instances
pub struct GeneratorRegistry {
    factories: HashMap<String, GeneratorFactory>,
}

impl GeneratorRegistry {
    /// Registry pre-populated with the built-in generators
    pub fn with_builtins() -> Self {
        let mut registry = Self {
            factories: HashMap::new(),
        };
        registry.register("contract", |options| {
            Ok(Arc::new(ContractClientGenerator::from_options(options)?) as Arc<dyn Generator>)
        });
        registry
    }

    pub fn register<F>(&mut self, key: impl Into<String>, factory: F)
    where
        F: Fn(&serde_json::Map<String, serde_json::Value>) -> Result<Arc<dyn Generator>>
            + Send
            + Sync
            + 'static,
    {
        self.factories.insert(key.into(), Arc::new(factory));
    }

    /// Resolve one configuration entry; unknown or disabled entries yield
    /// `None` (with a log line) instead of failing the whole run.
    pub fn resolve(&self, entry: &GeneratorEntry) -> Option<Arc<dyn Generator>> {
        match entry {
            GeneratorEntry::Named {
                name,
                enabled,
                options,
            } => {
                if !enabled {
                    tracing::debug!(generator = %name, "generator disabled by configuration");
                    return None;
                }
                match self.factories.get(name.as_str()) {
                    Some(factory) => match factory(options) {
                        Ok(generator) => Some(generator),
                        Err(e) => {
                            tracing::warn!(generator = %name, "generator construction failed: {}", e);
                            None
                        }
                    },
                    None => {
                        tracing::warn!(
                            generator = %name,
                            "no factory registered for generator, skipping"
                        );
                        None
                    }
                }
            }
            GeneratorEntry::Local { path } => match self.factories.get(path.as_str()) {
                Some(factory) => factory(&serde_json::Map::new()).ok(),
                None => {
                    tracing::warn!(
                        path = %path,
                        "local generator paths require a pre-registered factory, skipping"
                    );
                    None
                }
            },
        }
    }
}

// ============================================================================
// Orchestrator
// ============================================================================

#[derive(Debug, Clone)]
struct WatchEvent {
    path: PathBuf,
    event: FileEvent,
}

/// Owns the generator set, the watcher, and the single-flight discipline
pub struct Orchestrator {
    generators: Vec<Arc<dyn Generator>>,
    ctx: GeneratorContext,
    debounce: Duration,
}

impl std::fmt::Debug for Orchestrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Orchestrator").finish_non_exhaustive()
    }
}

impl Orchestrator {
    pub fn new(ctx: GeneratorContext) -> Self {
        Self {
            generators: Vec::new(),
            ctx,
            debounce: DEFAULT_DEBOUNCE,
        }
    }

    /// Build from resolved configuration
    ///
    /// Generator names are unique; a repeated entry keeps the first
    /// registration.
    pub fn from_config(
        config: &CodegenConfig,
        registry: &GeneratorRegistry,
        ctx: GeneratorContext,
    ) -> Self {
        let mut orchestrator = Self::new(ctx);
        for entry in &config.generators {
            if let Some(generator) = registry.resolve(entry) {
                if orchestrator
                    .generators
                    .iter()
                    .any(|existing| existing.name() == generator.name())
                {
                    tracing::warn!(
                        generator = generator.name(),
                        "duplicate generator entry ignored"
                    );
                    continue;
                }
                orchestrator.generators.push(generator);
            }
        }
        orchestrator
    }

    pub fn register(mut self, generator: Arc<dyn Generator>) -> Self {
        self.generators.push(generator);
        self
    }

    pub fn with_debounce(mut self, debounce: Duration) -> Self {
        self.debounce = debounce;
        self
    }

    pub fn generator_names(&self) -> Vec<String> {
        self.generators.iter().map(|g| g.name().to_string()).collect()
    }

    /// Run every generator once, sequentially; failures are logged and
    /// suppressed so the remaining generators still run.
    pub async fn generate_all(&self) {
        run_generators(&self.generators, &self.ctx, &[]).await;
    }

    /// Watch the project and regenerate on changes until cancelled
    pub async fn watch(&self, cancel: CancellationToken) -> Result<()> {
        let (tx, rx) = mpsc::unbounded_channel::<WatchEvent>();

        let mut watcher = notify::recommended_watcher(move |res: notify::Result<notify::Event>| {
            if let Ok(event) = res {
                if let Some(kind) = map_event_kind(&event.kind) {
                    for path in event.paths {
                        let _ = tx.send(WatchEvent { path, event: kind });
                    }
                }
            }
        })
        .map_err(|e| Error::internal(format!("failed to create file watcher: {}", e)))?;

        for root in self.watch_roots() {
            if root.exists() {
                watcher
                    .watch(&root, notify::RecursiveMode::Recursive)
                    .map_err(|e| {
                        Error::internal(format!("failed to watch {}: {}", root.display(), e))
                    })?;
                tracing::info!(root = %root.display(), "watching for changes");
            }
        }

        self.run_watch_loop(rx, cancel).await;
        Ok(())
    }

    /// Directories to watch: the static prefixes of every pattern
    fn watch_roots(&self) -> Vec<PathBuf> {
        let mut roots = Vec::new();
        for generator in &self.generators {
            for pattern in generator.watch_patterns() {
                let static_prefix: PathBuf = Path::new(&pattern)
                    .components()
                    .take_while(|c| {
                        let text = c.as_os_str().to_string_lossy();
                        !text.contains('*') && !text.contains('[')
                    })
                    .collect();
                let root = if static_prefix.as_os_str().is_empty() {
                    self.ctx.route_dir.clone()
                } else {
                    self.ctx.project_root.join(static_prefix)
                };
                if !roots.contains(&root) {
                    roots.push(root);
                }
            }
        }
        if roots.is_empty() {
            roots.push(self.ctx.route_dir.clone());
        }
        roots
    }

    /// Event loop: single-flight generation with pending coalescing and a
    /// debounce window for bursts. The `running`/`pending` pair lives only
    /// on this task.
    async fn run_watch_loop(
        &self,
        mut rx: mpsc::UnboundedReceiver<WatchEvent>,
        cancel: CancellationToken,
    ) {
        enum Step {
            Cancelled,
            GenerationDone,
            Received(Option<WatchEvent>),
        }

        // Initial generation for current state
        let mut running: Option<JoinHandle<()>> = Some(self.spawn_run(Vec::new()));
        let mut pending: Vec<WatchEvent> = Vec::new();

        loop {
            let step = if let Some(handle) = running.as_mut() {
                tokio::select! {
                    _ = cancel.cancelled() => Step::Cancelled,
                    _ = handle => Step::GenerationDone,
                    maybe = rx.recv() => Step::Received(maybe),
                }
            } else {
                tokio::select! {
                    _ = cancel.cancelled() => Step::Cancelled,
                    maybe = rx.recv() => Step::Received(maybe),
                }
            };

            match step {
                Step::Cancelled => break,
                Step::GenerationDone => {
                    running = None;
                    if !pending.is_empty() {
                        let batch = std::mem::take(&mut pending);
                        tracing::debug!(
                            events = batch.len(),
                            "running coalesced follow-up generation"
                        );
                        running = Some(self.spawn_run(batch));
                    }
                }
                Step::Received(None) => break,
                Step::Received(Some(event)) => {
                    if !self.matches_any(&event.path) {
                        continue;
                    }
                    if running.is_some() {
                        pending.push(event);
                    } else {
                        let batch = self.debounce_burst(event, &mut rx).await;
                        running = Some(self.spawn_run(batch));
                    }
                }
            }
        }

        // Let any in-flight generation finish before returning
        if let Some(handle) = running.take() {
            let _ = handle.await;
        }
        tracing::info!("codegen watcher stopped");
    }

    /// Collect events until the debounce window goes quiet
    async fn debounce_burst(
        &self,
        first: WatchEvent,
        rx: &mut mpsc::UnboundedReceiver<WatchEvent>,
    ) -> Vec<WatchEvent> {
        let mut batch = vec![first];
        let deadline = tokio::time::Instant::now() + self.debounce;
        loop {
            tokio::select! {
                _ = tokio::time::sleep_until(deadline) => break,
                maybe = rx.recv() => match maybe {
                    Some(event) if self.matches_any(&event.path) => batch.push(event),
                    Some(_) => {}
                    None => break,
                }
            }
        }
        batch
    }

    fn spawn_run(&self, batch: Vec<WatchEvent>) -> JoinHandle<()> {
        let generators = self.generators.clone();
        let ctx = self.ctx.clone();
        tokio::spawn(async move {
            run_generators(&generators, &ctx, &batch).await;
        })
    }

    fn matches_any(&self, path: &Path) -> bool {
        let relative = self.relativize(path);
        self.generators
            .iter()
            .any(|g| matches_patterns(&g.watch_patterns(), &relative))
    }

    fn relativize(&self, path: &Path) -> String {
        path.strip_prefix(&self.ctx.project_root)
            .unwrap_or(path)
            .to_string_lossy()
            .replace('\\', "/")
    }
}

/// Sequentially run generators: incremental hooks for the batch when they
/// handle every relevant event, full generation otherwise. An empty batch
/// means a full run for everyone.
async fn run_generators(
    generators: &[Arc<dyn Generator>],
    ctx: &GeneratorContext,
    batch: &[WatchEvent],
) {
    for generator in generators {
        let relevant: Vec<&WatchEvent> = if batch.is_empty() {
            Vec::new()
        } else {
            let patterns = generator.watch_patterns();
            batch
                .iter()
                .filter(|e| {
                    let relative = e
                        .path
                        .strip_prefix(&ctx.project_root)
                        .unwrap_or(&e.path)
                        .to_string_lossy()
                        .replace('\\', "/");
                    matches_patterns(&patterns, &relative)
                })
                .collect()
        };

        if !batch.is_empty() && relevant.is_empty() {
            continue;
        }

        let mut incremental = !relevant.is_empty();
        for event in &relevant {
            match generator.on_file_change(&event.path, event.event, ctx).await {
                Ok(true) => {}
                Ok(false) => {
                    incremental = false;
                    break;
                }
                Err(e) => {
                    tracing::warn!(generator = generator.name(), "incremental hook failed: {}", e);
                    incremental = false;
                    break;
                }
            }
        }
        if incremental {
            tracing::debug!(generator = generator.name(), "incremental update applied");
            continue;
        }

        match generator.generate(ctx).await {
            Ok(()) => tracing::info!(generator = generator.name(), "generation complete"),
            Err(e) => {
                tracing::error!(generator = generator.name(), "generation failed: {}", e)
            }
        }
    }
}

fn map_event_kind(kind: &notify::EventKind) -> Option<FileEvent> {
    use notify::EventKind;
    match kind {
        EventKind::Create(_) => Some(FileEvent::Added),
        EventKind::Modify(_) => Some(FileEvent::Changed),
        EventKind::Remove(_) => Some(FileEvent::Removed),
        _ => None,
    }
}

/// Glob match against a project-relative path
fn matches_patterns(patterns: &[String], relative: &str) -> bool {
    patterns
        .iter()
        .any(|pattern| glob_to_regex(pattern).is_match(relative))
}

/// Compile a glob into a regex: `**` crosses directories, `*` does not
fn glob_to_regex(pattern: &str) -> regex::Regex {
    let mut regex_str = String::from("^");
    let mut chars = pattern.chars().peekable();
    while let Some(c) = chars.next() {
        match c {
            '*' => {
                if chars.peek() == Some(&'*') {
                    chars.next();
                    // `**/` also matches zero directories
                    if chars.peek() == Some(&'/') {
                        chars.next();
                        regex_str.push_str("(?:.*/)?");
                    } else {
                        regex_str.push_str(".*");
                    }
                } else {
                    regex_str.push_str("[^/]*");
                }
            }
            '?' => regex_str.push_str("[^/]"),
            '.' | '+' | '(' | ')' | '[' | ']' | '^' | '$' | '|' | '\\' | '{' | '}' => {
                regex_str.push('\\');
                regex_str.push(c);
            }
            _ => regex_str.push(c),
        }
    }
    regex_str.push('$');
    regex::Regex::new(&regex_str).unwrap_or_else(|_| regex::Regex::new("$^").unwrap())
}
