//! The host registry.
//!
//! Plugin launches are not reentrant-safe — port handshakes, process-group
//! setup, and diagnostic stream stitching all race badly — so every load is
//! serialized behind one of two single-consumer queues. Language runtime
//! loads get their own queue because a language plugin load can be
//! triggered from inside a non-language load (a source-form provider spawns
//! through its runtime's `RunPlugin`), and sharing a queue would deadlock.
//!
//! Instantiated plugins are memoized: analyzers by name, language runtimes
//! by `runtime:root:program:options`, providers by package and version. A
//! read/write lock closes the registry down race-free: loads hold a read
//! lock, and `close` takes the write lock, draining in-flight loads and
//! refusing new ones.

use std::collections::{BTreeMap, HashMap};
use std::future::Future;
use std::path::PathBuf;
use std::pin::Pin;
use std::sync::Arc;

use tokio::sync::{mpsc, oneshot};

use crate::analyzer::{
    shim_invocation, runtime_uses_shim, AnalyzerClient, PolicyAnalyzerOptions,
};
use crate::diag::{DiagSink, Severity};
use crate::engine::{EngineServer, RootResourceCell};
use crate::error::Error;
use crate::language::{LanguageRuntimeClient, ProgramInfo, RunPluginInfo};
use crate::plugin::{HostLogging, LaunchOptions, PluginProcess};
use crate::provider::ProviderClient;
use crate::urn::Urn;
use crate::workspace::{
    infer_runtime, parse_debug_providers, PluginKind, PluginKinds, PluginProjectManifest,
    PluginResolver, PluginSpec, PolicyPackManifest, ProjectPlugin, RuntimeInfo,
};

/// Dynamic providers ship inside the language SDKs; their shims are named
/// after the runtime rather than a package, and their unstructured output is
/// the program's own, so it is not captured for post-mortems.
fn is_dynamic_provider(path: &std::path::Path) -> bool {
    matches!(
        path.file_name().and_then(|n| n.to_str()),
        Some("pulumi-resource-pulumi-nodejs") | Some("pulumi-resource-pulumi-python")
    )
}

/// Configuration for constructing a [`Host`].
pub struct HostConfig {
    pub diag: Arc<dyn DiagSink>,
    pub resolver: Arc<dyn PluginResolver>,
    /// Plugins the project declares explicitly; they override installed
    /// discovery.
    pub project_plugins: Vec<ProjectPlugin>,
    pub logging: HostLogging,
    /// The project root; plugins run with this as their working directory.
    pub root_directory: PathBuf,
    pub program_directory: Option<PathBuf>,
}

type LoadJob = Pin<Box<dyn Future<Output = ()> + Send>>;

struct HostInner {
    diag: Arc<dyn DiagSink>,
    resolver: Arc<dyn PluginResolver>,
    project_plugins: Vec<ProjectPlugin>,
    logging: HostLogging,
    root_directory: PathBuf,
    program_directory: Option<PathBuf>,
    engine: EngineServer,
    root_resource: RootResourceCell,
    debug_providers: BTreeMap<String, u16>,
    language_loads: mpsc::UnboundedSender<LoadJob>,
    plugin_loads: mpsc::UnboundedSender<LoadJob>,
    /// Read-held for the duration of each load; write-held (and then left
    /// `true`) by `close`.
    shutdown: tokio::sync::RwLock<bool>,
    languages: parking_lot::Mutex<HashMap<String, Arc<LanguageRuntimeClient>>>,
    analyzers: parking_lot::Mutex<HashMap<String, Arc<AnalyzerClient>>>,
    providers: parking_lot::Mutex<HashMap<String, Arc<ProviderClient>>>,
}

impl HostInner {
    fn resolve_path(&self, spec: &PluginSpec) -> Result<PathBuf, Error> {
        for project_plugin in &self.project_plugins {
            if project_plugin.matches(spec.kind, &spec.name) {
                return Ok(project_plugin.path.join(spec.file_name()));
            }
        }
        self.resolver.resolve(spec)
    }
}

/// The plugin host: registry, launch queues, and the engine-side callback
/// server, owned as one unit by the embedding engine.
#[derive(Clone)]
pub struct Host {
    inner: Arc<HostInner>,
}

impl Host {
    pub async fn new(config: HostConfig) -> Result<Self, Error> {
        let root_resource: RootResourceCell = Arc::new(parking_lot::Mutex::new(None));
        let engine = EngineServer::bind(config.diag.clone(), root_resource.clone()).await?;

        let (language_loads, language_rx) = mpsc::unbounded_channel();
        let (plugin_loads, plugin_rx) = mpsc::unbounded_channel();
        spawn_load_worker(language_rx);
        spawn_load_worker(plugin_rx);

        let debug_providers = std::env::var("PULUMI_DEBUG_PROVIDERS")
            .map(|v| parse_debug_providers(&v))
            .unwrap_or_default();

        Ok(Host {
            inner: Arc::new(HostInner {
                diag: config.diag,
                resolver: config.resolver,
                project_plugins: config.project_plugins,
                logging: config.logging,
                root_directory: config.root_directory,
                program_directory: config.program_directory,
                engine,
                root_resource,
                debug_providers,
                language_loads,
                plugin_loads,
                shutdown: tokio::sync::RwLock::new(false),
                languages: parking_lot::Mutex::new(HashMap::new()),
                analyzers: parking_lot::Mutex::new(HashMap::new()),
                providers: parking_lot::Mutex::new(HashMap::new()),
            }),
        })
    }

    /// The address of the engine-side callback server, advertised to every
    /// plugin.
    pub fn server_addr(&self) -> String {
        self.inner.engine.addr()
    }

    /// The stack's root resource, as last set by a plugin.
    pub fn root_resource(&self) -> Option<Urn> {
        self.inner.root_resource.lock().clone()
    }

    /// Enqueue a load on one of the two serialized queues and await its
    /// result.
    async fn submit<T, F, Fut>(&self, language: bool, load: F) -> Result<T, Error>
    where
        T: Send + 'static,
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Result<T, Error>> + Send + 'static,
    {
        let (tx, rx) = oneshot::channel();
        let job: LoadJob = Box::pin(async move {
            let _ = tx.send(load().await);
        });
        let queue = if language {
            &self.inner.language_loads
        } else {
            &self.inner.plugin_loads
        };
        queue.send(job).map_err(|_| Error::HostShuttingDown)?;
        rx.await.map_err(|_| Error::HostShuttingDown)?
    }

    /// Load (or fetch the memoized) language runtime for `runtime`.
    pub async fn language_runtime(
        &self,
        runtime: &str,
        info: &ProgramInfo,
    ) -> Result<Arc<LanguageRuntimeClient>, Error> {
        let key = format!(
            "{}:{}:{}:{}",
            runtime,
            info.root_directory.display(),
            info.program_directory.display(),
            serde_json::to_string(&info.options).unwrap_or_default(),
        );
        if let Some(client) = self.inner.languages.lock().get(&key) {
            return Ok(client.clone());
        }

        let host = self.clone();
        let runtime = runtime.to_string();
        let info = info.clone();
        self.submit(true, move || async move {
            let inner = &host.inner;
            let _guard = load_guard(inner)?;
            if let Some(client) = inner.languages.lock().get(&key) {
                return Ok(client.clone());
            }

            let spec = PluginSpec::new(PluginKind::Language, runtime.clone(), None);
            let path = inner.resolve_path(&spec)?;

            // Language plugins take `-key=value` runtime options followed by
            // the engine address as the last positional. Older runtimes are
            // picky about this ordering; preserve it.
            let mut args = Vec::new();
            for (opt, value) in &info.options {
                let rendered = match value {
                    serde_json::Value::String(s) => s.clone(),
                    other => other.to_string(),
                };
                args.push(format!("-{opt}={rendered}"));
            }
            args.push(host.server_addr());

            let plugin = PluginProcess::launch(LaunchOptions {
                kind: PluginKind::Language,
                name: &runtime,
                dir: &inner.root_directory,
                path: &path,
                args,
                env: Vec::new(),
                logging: &inner.logging,
                diag: inner.diag.clone(),
                track_output: false,
            })
            .await?;

            let client = Arc::new(
                LanguageRuntimeClient::new(
                    plugin,
                    &runtime,
                    &host.server_addr(),
                    Some(&info.root_directory),
                    Some(&info.program_directory),
                )
                .await?,
            );
            inner.languages.lock().insert(key, client.clone());
            Ok(client)
        })
        .await
    }

    /// Load a resource provider. Identical `(package, version)` requests
    /// return the cached instance.
    pub async fn provider(
        &self,
        spec: &PluginSpec,
        runtime_options: &BTreeMap<String, serde_json::Value>,
    ) -> Result<Arc<ProviderClient>, Error> {
        let key = match &spec.version {
            Some(v) => format!("{}@{v}", spec.name),
            None => format!("{}@latest", spec.name),
        };
        if let Some(client) = self.inner.providers.lock().get(&key) {
            return Ok(client.clone());
        }

        let host = self.clone();
        let spec = spec.clone();
        let runtime_options = runtime_options.clone();
        self.submit(false, move || async move {
            let inner = &host.inner;
            let _guard = load_guard(inner)?;
            if let Some(client) = inner.providers.lock().get(&key) {
                return Ok(client.clone());
            }

            let engine_addr = host.server_addr();
            let root = Some(inner.root_directory.display().to_string());
            let program = inner
                .program_directory
                .as_ref()
                .map(|p| p.display().to_string());

            // Debug attach: dial a developer-run provider instead of
            // spawning one.
            if let Some(port) = inner.debug_providers.get(&spec.name) {
                let client = Arc::new(
                    ProviderClient::attach(
                        *port,
                        &spec.name,
                        spec.version.clone(),
                        &engine_addr,
                        inner.diag.clone(),
                    )
                    .await?,
                );
                inner.providers.lock().insert(key, client.clone());
                return Ok(client);
            }

            let path = inner.resolve_path(&spec)?;
            let mut env = Vec::new();
            for (opt, value) in &runtime_options {
                let rendered = match value {
                    serde_json::Value::String(s) => s.clone(),
                    other => other.to_string(),
                };
                env.push((format!("PULUMI_RUNTIME_{}", opt.to_uppercase()), rendered));
            }

            let plugin = if path.is_file() {
                let env = if env.is_empty() {
                    Vec::new()
                } else {
                    full_environment(env)
                };
                PluginProcess::launch(LaunchOptions {
                    kind: spec.kind,
                    name: &spec.name,
                    dir: &inner.root_directory,
                    path: &path,
                    args: vec![engine_addr.clone()],
                    env,
                    logging: &inner.logging,
                    diag: inner.diag.clone(),
                    track_output: !is_dynamic_provider(&path),
                })
                .await?
            } else {
                host.delegated_launch(&spec, &path, engine_addr.clone(), env).await?
            };

            let client = Arc::new(
                ProviderClient::new(
                    plugin,
                    &spec.name,
                    spec.version.clone(),
                    &engine_addr,
                    root,
                    program,
                )
                .await?,
            );

            host.warn_on_version_mismatch(&spec, &client).await;

            inner.providers.lock().insert(key, client.clone());
            Ok(client)
        })
        .await
    }

    /// Spawn a source-form plugin through its language runtime.
    async fn delegated_launch(
        &self,
        spec: &PluginSpec,
        path: &std::path::Path,
        engine_addr: String,
        env: Vec<(String, String)>,
    ) -> Result<PluginProcess, Error> {
        let inner = &self.inner;
        let Some(dir) = path.parent().map(|p| p.to_path_buf()) else {
            return Err(Error::Launch {
                plugin: spec.name.clone(),
                reason: format!("{} is not a plugin binary or directory", path.display()),
            });
        };

        let runtime = match spec.kind {
            PluginKind::Language => {
                return Err(Error::Launch {
                    plugin: spec.name.clone(),
                    reason: "language plugins must ship as binaries".to_string(),
                });
            }
            PluginKind::Analyzer => PolicyPackManifest::load(&dir)?.runtime,
            _ => match PluginProjectManifest::load(&dir)? {
                Some(manifest) => manifest.runtime,
                None => infer_runtime(&dir)?,
            },
        };

        let mut program = ProgramInfo::new(&dir, &dir);
        program.options = runtime.options.clone();
        let language = self.language_runtime(&runtime.name, &program).await?;

        let (stdout, stderr, kill) = language
            .run_plugin(&RunPluginInfo {
                kind: Some(spec.kind),
                name: spec.name.clone(),
                pwd: dir.clone(),
                args: vec![engine_addr],
                env: env.into_iter().map(|(k, v)| format!("{k}={v}")).collect(),
                info: program,
            })
            .await?;

        PluginProcess::from_streams(
            &spec.name,
            path.to_path_buf(),
            Box::new(stdout),
            Box::new(stderr),
            kill,
            inner.diag.clone(),
            spec.kind == PluginKind::Resource,
        )
        .await
    }

    async fn warn_on_version_mismatch(&self, spec: &PluginSpec, client: &ProviderClient) {
        let Some(requested) = &spec.version else { return };
        if std::env::var_os("PULUMI_DEV").is_some() {
            return;
        }
        if let Ok(Some(actual)) = client.plugin_info().await {
            if actual < *requested {
                self.inner.diag.log(
                    Severity::Warning,
                    None,
                    &format!(
                        "resource plugin {} is expected to be at version >={requested}, \
                         but the host loaded {actual}; the wrong version may be on your $PATH",
                        spec.name
                    ),
                    0,
                );
            }
        }
    }

    /// Load (or fetch the memoized) installed analyzer by name.
    pub async fn analyzer(&self, name: &str) -> Result<Arc<AnalyzerClient>, Error> {
        if let Some(client) = self.inner.analyzers.lock().get(name) {
            return Ok(client.clone());
        }

        let host = self.clone();
        let name = name.to_string();
        self.submit(false, move || async move {
            let inner = &host.inner;
            let _guard = load_guard(inner)?;
            if let Some(client) = inner.analyzers.lock().get(&name) {
                return Ok(client.clone());
            }

            let spec = PluginSpec::new(PluginKind::Analyzer, name.clone(), None);
            let path = inner.resolve_path(&spec)?;
            let engine_addr = host.server_addr();
            let plugin = PluginProcess::launch(LaunchOptions {
                kind: PluginKind::Analyzer,
                name: &name,
                dir: &inner.root_directory,
                path: &path,
                args: vec![engine_addr.clone()],
                env: Vec::new(),
                logging: &inner.logging,
                diag: inner.diag.clone(),
                track_output: false,
            })
            .await?;

            let client = Arc::new(
                AnalyzerClient::new(plugin, &name, &engine_addr, None, None).await?,
            );
            inner.analyzers.lock().insert(name, client.clone());
            Ok(client)
        })
        .await
    }

    /// Boot a policy pack. The pack's manifest decides the path: nodejs and
    /// python packs launch through their legacy shim analyzers, everything
    /// else through the runtime's `RunPlugin`.
    pub async fn policy_analyzer(
        &self,
        name: &str,
        pack_directory: &std::path::Path,
        opts: &PolicyAnalyzerOptions,
    ) -> Result<Arc<AnalyzerClient>, Error> {
        if let Some(client) = self.inner.analyzers.lock().get(name) {
            return Ok(client.clone());
        }

        let host = self.clone();
        let name = name.to_string();
        let pack_directory = pack_directory.to_path_buf();
        let opts = opts.clone();
        self.submit(false, move || async move {
            let inner = &host.inner;
            let _guard = load_guard(inner)?;
            if let Some(client) = inner.analyzers.lock().get(&name) {
                return Ok(client.clone());
            }

            let manifest = PolicyPackManifest::load(&pack_directory)?;
            let engine_addr = host.server_addr();
            let plugin = if runtime_uses_shim(&manifest.runtime.name) {
                host.shim_policy_launch(&name, &pack_directory, &manifest.runtime, &opts, &engine_addr)
                    .await?
            } else {
                host.language_policy_launch(&name, &pack_directory, &manifest.runtime, &opts, &engine_addr)
                    .await?
            };

            let client = Arc::new(
                AnalyzerClient::new(
                    plugin,
                    &name,
                    &engine_addr,
                    Some(&pack_directory),
                    manifest.version.clone(),
                )
                .await?,
            );
            inner.analyzers.lock().insert(name, client.clone());
            Ok(client)
        })
        .await
    }

    async fn shim_policy_launch(
        &self,
        name: &str,
        pack_directory: &std::path::Path,
        runtime: &RuntimeInfo,
        opts: &PolicyAnalyzerOptions,
        engine_addr: &str,
    ) -> Result<PluginProcess, Error> {
        let inner = &self.inner;
        let invocation = shim_invocation(&runtime.name, engine_addr, opts, &runtime.options);
        let spec = PluginSpec::new(PluginKind::Analyzer, invocation.plugin_name.clone(), None);
        let path = inner.resolve_path(&spec)?;
        PluginProcess::launch(LaunchOptions {
            kind: PluginKind::Analyzer,
            name,
            dir: pack_directory,
            path: &path,
            args: invocation.args,
            env: full_environment(invocation.env),
            logging: &inner.logging,
            diag: inner.diag.clone(),
            track_output: false,
        })
        .await
    }

    async fn language_policy_launch(
        &self,
        name: &str,
        pack_directory: &std::path::Path,
        runtime: &RuntimeInfo,
        opts: &PolicyAnalyzerOptions,
        engine_addr: &str,
    ) -> Result<PluginProcess, Error> {
        let inner = &self.inner;
        let mut program = ProgramInfo::new(pack_directory, pack_directory);
        program.options = runtime.options.clone();
        let language = self.language_runtime(&runtime.name, &program).await?;

        let invocation = shim_invocation(&runtime.name, engine_addr, opts, &BTreeMap::new());
        let (stdout, stderr, kill) = language
            .run_plugin(&RunPluginInfo {
                kind: Some(PluginKind::Analyzer),
                name: name.to_string(),
                pwd: pack_directory.to_path_buf(),
                args: vec![engine_addr.to_string()],
                env: invocation
                    .env
                    .into_iter()
                    .map(|(k, v)| format!("{k}={v}"))
                    .collect(),
                info: program,
            })
            .await?;

        PluginProcess::from_streams(
            name,
            pack_directory.to_path_buf(),
            Box::new(stdout),
            Box::new(stderr),
            kill,
            inner.diag.clone(),
            false,
        )
        .await
    }

    /// Remove a provider from the registry and tear it down.
    pub async fn close_provider(&self, provider: &Arc<ProviderClient>) {
        self.inner
            .providers
            .lock()
            .retain(|_, cached| !Arc::ptr_eq(cached, provider));
        provider.close().await;
    }

    /// Load every plugin in `specs` whose kind is selected by `kinds`,
    /// accumulating failures into one error.
    pub async fn ensure_plugins(
        &self,
        specs: &[PluginSpec],
        kinds: PluginKinds,
    ) -> Result<(), Error> {
        let mut errors = Vec::new();
        for spec in specs {
            if !kinds.contains(spec.kind.flag()) {
                continue;
            }
            let result = match spec.kind {
                PluginKind::Resource => self
                    .provider(spec, &BTreeMap::new())
                    .await
                    .map(|_| ()),
                PluginKind::Language => {
                    let info = ProgramInfo::new(
                        &self.inner.root_directory,
                        self.inner
                            .program_directory
                            .clone()
                            .unwrap_or_else(|| self.inner.root_directory.clone()),
                    );
                    self.language_runtime(&spec.name, &info).await.map(|_| ())
                }
                PluginKind::Analyzer => self.analyzer(&spec.name).await.map(|_| ()),
                PluginKind::Converter | PluginKind::Tool => Ok(()),
            };
            if let Err(e) = result {
                errors.push(e);
            }
        }
        match errors.len() {
            0 => Ok(()),
            1 => Err(errors.pop().unwrap()),
            _ => Err(Error::Aggregate(errors)),
        }
    }

    /// Advisory cancellation: fan out `Cancel` to every loaded provider and
    /// analyzer. In-flight operations are not awaited.
    pub async fn signal_cancellation(&self) {
        let providers: Vec<_> = self.inner.providers.lock().values().cloned().collect();
        let analyzers: Vec<_> = self.inner.analyzers.lock().values().cloned().collect();
        let provider_cancels = providers.iter().map(|p| p.signal_cancellation());
        let analyzer_cancels = analyzers.iter().map(|a| a.signal_cancellation());
        futures::future::join(
            futures::future::join_all(provider_cancels),
            futures::future::join_all(analyzer_cancels),
        )
        .await;
    }

    /// Shut the host down: refuse new loads, drain in-flight ones, and tear
    /// every plugin down deterministically.
    pub async fn close(&self) {
        {
            let mut closed = self.inner.shutdown.write().await;
            *closed = true;
        }

        let providers: Vec<_> = self.inner.providers.lock().drain().map(|(_, p)| p).collect();
        for provider in providers {
            provider.close().await;
        }
        let analyzers: Vec<_> = self.inner.analyzers.lock().drain().map(|(_, a)| a).collect();
        for analyzer in analyzers {
            analyzer.close().await;
        }
        let languages: Vec<_> = self.inner.languages.lock().drain().map(|(_, l)| l).collect();
        for language in languages {
            language.close().await;
        }

        self.inner.engine.shutdown().await;
    }
}

fn spawn_load_worker(mut queue: mpsc::UnboundedReceiver<LoadJob>) {
    tokio::spawn(async move {
        while let Some(job) = queue.recv().await {
            job.await;
        }
    });
}

/// Take the load-side of the shutdown lock, failing fast when `close` holds
/// or awaits the write side.
fn load_guard(inner: &HostInner) -> Result<tokio::sync::RwLockReadGuard<'_, bool>, Error> {
    match inner.shutdown.try_read() {
        Ok(guard) if !*guard => Ok(guard),
        _ => Err(Error::HostShuttingDown),
    }
}

/// The current environment plus `extras`; used when a child needs additions
/// on top of inheritance, since a non-empty launch environment replaces the
/// child's environment wholesale.
fn full_environment(extras: Vec<(String, String)>) -> Vec<(String, String)> {
    let mut env: Vec<(String, String)> = std::env::vars().collect();
    env.retain(|(k, _)| !extras.iter().any(|(ek, _)| ek == k));
    env.extend(extras);
    env
}
