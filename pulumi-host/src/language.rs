//! The typed facade over the language-runtime RPC surface.
//!
//! Beyond running programs, a language runtime is also an indirect process
//! spawner: `RunPlugin` executes a source-form plugin on the host's behalf
//! and streams its stdout/stderr back over gRPC. [`LanguageRuntimeClient::run_plugin`]
//! turns that stream into a pair of pipe readers plus a kill function, so
//! the process supervisor can treat delegated plugins exactly like spawned
//! ones.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use semver::Version;
use tokio::io::AsyncWriteExt;
use tonic::transport::Channel;
use tonic::Code;

use pulumi_proto::pulumirpc::language_runtime_client::LanguageRuntimeClient as LanguageGrpcClient;
use pulumi_proto::pulumirpc::{self, run_plugin_response, Empty, LanguageHandshakeRequest};

use crate::error::Error;
use crate::json;
use crate::plugin::{self, KillFn, PluginProcess};
use crate::workspace::{PluginKind, PluginSpec};

/// Buffer size for the pipes carrying a delegated plugin's output.
const RUN_PLUGIN_PIPE_CAPACITY: usize = 64 * 1024;

/// The program a language runtime operates on.
#[derive(Debug, Clone, Default)]
pub struct ProgramInfo {
    pub root_directory: PathBuf,
    pub program_directory: PathBuf,
    pub entry_point: String,
    pub options: BTreeMap<String, serde_json::Value>,
}

impl ProgramInfo {
    pub fn new(root: impl Into<PathBuf>, program: impl Into<PathBuf>) -> Self {
        ProgramInfo {
            root_directory: root.into(),
            program_directory: program.into(),
            entry_point: ".".to_string(),
            options: BTreeMap::new(),
        }
    }

    fn to_rpc(&self) -> pulumirpc::ProgramInfo {
        pulumirpc::ProgramInfo {
            root_directory: self.root_directory.display().to_string(),
            program_directory: self.program_directory.display().to_string(),
            entry_point: self.entry_point.clone(),
            options: Some(json::json_map_to_struct(&self.options)),
        }
    }
}

/// Everything needed to run a program.
#[derive(Debug, Clone, Default)]
pub struct RunInfo {
    pub project: String,
    pub stack: String,
    pub pwd: PathBuf,
    pub args: Vec<String>,
    pub config: BTreeMap<String, String>,
    pub config_secret_keys: Vec<String>,
    pub dry_run: bool,
    pub parallel: i32,
    pub monitor_address: String,
    pub organization: String,
    pub info: ProgramInfo,
}

/// The outcome of running a program.
#[derive(Debug, Clone)]
pub struct RunOutcome {
    /// An unhandled error message, if the program failed.
    pub error: String,
    /// True if the program already reported the failure itself.
    pub bail: bool,
}

/// Runtime metadata from `About`.
#[derive(Debug, Clone)]
pub struct AboutInfo {
    pub executable: String,
    pub version: String,
    pub metadata: BTreeMap<String, String>,
}

/// A package dependency reported by `GetProgramDependencies`.
#[derive(Debug, Clone)]
pub struct DependencyInfo {
    pub name: String,
    pub version: String,
}

/// A runtime option the user may be prompted for.
#[derive(Debug, Clone)]
pub struct RuntimeOptionPrompt {
    pub key: String,
    pub description: String,
    pub choices: Vec<String>,
    pub default_value: String,
}

/// Everything needed to execute a source-form plugin through the runtime.
#[derive(Debug, Clone, Default)]
pub struct RunPluginInfo {
    pub kind: Option<PluginKind>,
    pub name: String,
    pub pwd: PathBuf,
    pub args: Vec<String>,
    /// Extra environment as NAME=value pairs.
    pub env: Vec<String>,
    pub info: ProgramInfo,
}

/// A connected language runtime.
pub struct LanguageRuntimeClient {
    runtime: String,
    client: LanguageGrpcClient<Channel>,
    plugin: PluginProcess,
}

impl LanguageRuntimeClient {
    /// Wrap an established plugin process, performing the handshake.
    pub async fn new(
        plugin: PluginProcess,
        runtime: &str,
        engine_addr: &str,
        root_directory: Option<&Path>,
        program_directory: Option<&Path>,
    ) -> Result<Self, Error> {
        let channel = plugin.channel();
        let result = plugin::handshake_retry(|| {
            let mut client = LanguageGrpcClient::new(channel.clone());
            let request = LanguageHandshakeRequest {
                engine_address: engine_addr.to_string(),
                root_directory: root_directory.map(|p| p.display().to_string()),
                program_directory: program_directory.map(|p| p.display().to_string()),
            };
            async move { client.handshake(request).await }
        })
        .await;
        match result {
            Ok(_) => {}
            // Older runtimes predate the handshake; carry on.
            Err(status) if status.code() == Code::Unimplemented => {}
            Err(status) => {
                return Err(Error::Handshake {
                    plugin: runtime.to_string(),
                    status: Box::new(status),
                });
            }
        }
        Ok(LanguageRuntimeClient {
            runtime: runtime.to_string(),
            client: LanguageGrpcClient::new(channel)
                .max_decoding_message_size(crate::provider::MAX_RPC_MESSAGE_SIZE)
                .max_encoding_message_size(crate::provider::MAX_RPC_MESSAGE_SIZE),
            plugin,
        })
    }

    pub fn runtime(&self) -> &str {
        &self.runtime
    }

    fn label(&self, method: &str) -> String {
        format!("LanguageRuntime[{}].{}", self.runtime, method)
    }

    /// Compute the plugins a program requires. Runtimes that cannot answer
    /// report none.
    pub async fn get_required_plugins(&self, info: &ProgramInfo) -> Result<Vec<PluginSpec>, Error> {
        let label = self.label("GetRequiredPlugins");
        let mut client = self.client.clone();
        let response = match client
            .get_required_plugins(pulumirpc::GetRequiredPluginsRequest {
                project: String::new(),
                pwd: info.program_directory.display().to_string(),
                program: info.entry_point.clone(),
                info: Some(info.to_rpc()),
            })
            .await
        {
            Ok(response) => response.into_inner(),
            Err(status) if status.code() == Code::Unimplemented => {
                return Ok(Vec::new());
            }
            Err(status) => return Err(Error::rpc(label, status)),
        };

        let mut specs = Vec::with_capacity(response.plugins.len());
        for dep in response.plugins {
            let kind = dep.kind.parse().unwrap_or(PluginKind::Resource);
            let mut spec = PluginSpec::new(kind, dep.name, Version::parse(&dep.version).ok());
            if !dep.server.is_empty() {
                spec.download_url = Some(dep.server);
            }
            spec.checksums = dep.checksums.into_iter().collect();
            specs.push(spec);
        }
        Ok(specs)
    }

    /// Run a program to completion.
    pub async fn run(&self, info: &RunInfo) -> Result<RunOutcome, Error> {
        let label = self.label("Run");
        let mut client = self.client.clone();
        match client
            .run(pulumirpc::RunRequest {
                project: info.project.clone(),
                stack: info.stack.clone(),
                pwd: info.pwd.display().to_string(),
                program: info.info.entry_point.clone(),
                args: info.args.clone(),
                config: info.config.clone().into_iter().collect(),
                dry_run: info.dry_run,
                parallel: info.parallel,
                monitor_address: info.monitor_address.clone(),
                config_secret_keys: info.config_secret_keys.clone(),
                organization: info.organization.clone(),
                info: Some(info.info.to_rpc()),
            })
            .await
        {
            Ok(response) => {
                let r = response.into_inner();
                Ok(RunOutcome {
                    error: r.error,
                    bail: r.bail,
                })
            }
            Err(status) => Err(Error::rpc(label, status)),
        }
    }

    /// Install a program's dependencies, forwarding installer output to the
    /// host's own stdout/stderr. Runtimes without an installer succeed
    /// trivially.
    pub async fn install_dependencies(&self, info: &ProgramInfo, is_plugin: bool) -> Result<(), Error> {
        let label = self.label("InstallDependencies");
        let mut client = self.client.clone();
        let mut stream = match client
            .install_dependencies(pulumirpc::InstallDependenciesRequest {
                directory: info.program_directory.display().to_string(),
                is_terminal: false,
                info: Some(info.to_rpc()),
                use_language_version_tools: false,
                is_plugin,
            })
            .await
        {
            Ok(response) => response.into_inner(),
            Err(status) if status.code() == Code::Unimplemented => return Ok(()),
            Err(status) => return Err(Error::rpc(label, status)),
        };

        let mut stdout = tokio::io::stdout();
        let mut stderr = tokio::io::stderr();
        loop {
            match stream.message().await {
                Ok(Some(frame)) => {
                    if !frame.stdout.is_empty() {
                        let _ = stdout.write_all(&frame.stdout).await;
                        let _ = stdout.flush().await;
                    }
                    if !frame.stderr.is_empty() {
                        let _ = stderr.write_all(&frame.stderr).await;
                        let _ = stderr.flush().await;
                    }
                }
                Ok(None) => return Ok(()),
                Err(status) if status.code() == Code::Unimplemented => return Ok(()),
                Err(status) => return Err(Error::rpc(label, status)),
            }
        }
    }

    /// Fetch runtime metadata.
    pub async fn about(&self, info: &ProgramInfo) -> Result<AboutInfo, Error> {
        let label = self.label("About");
        let mut client = self.client.clone();
        match client
            .about(pulumirpc::AboutRequest {
                info: Some(info.to_rpc()),
            })
            .await
        {
            Ok(response) => {
                let r = response.into_inner();
                Ok(AboutInfo {
                    executable: r.executable,
                    version: r.version,
                    metadata: r.metadata.into_iter().collect(),
                })
            }
            Err(status) => Err(Error::rpc(label, status)),
        }
    }

    /// Compute a program's package dependencies.
    pub async fn get_program_dependencies(
        &self,
        info: &ProgramInfo,
        transitive: bool,
    ) -> Result<Vec<DependencyInfo>, Error> {
        let label = self.label("GetProgramDependencies");
        let mut client = self.client.clone();
        match client
            .get_program_dependencies(pulumirpc::GetProgramDependenciesRequest {
                project: String::new(),
                pwd: info.program_directory.display().to_string(),
                program: info.entry_point.clone(),
                transitive_dependencies: transitive,
                info: Some(info.to_rpc()),
            })
            .await
        {
            Ok(response) => Ok(response
                .into_inner()
                .dependencies
                .into_iter()
                .map(|d| DependencyInfo {
                    name: d.name,
                    version: d.version,
                })
                .collect()),
            Err(status) => Err(Error::rpc(label, status)),
        }
    }

    /// Execute a source-form plugin through this runtime. Returns the read
    /// halves of its stdout/stderr plus a function that kills it; the
    /// process supervisor consumes these exactly as it would a spawned
    /// child's pipes.
    pub async fn run_plugin(
        &self,
        info: &RunPluginInfo,
    ) -> Result<(tokio::io::DuplexStream, tokio::io::DuplexStream, KillFn), Error> {
        let label = self.label("RunPlugin");
        let mut client = self.client.clone();
        let mut stream = client
            .run_plugin(pulumirpc::RunPluginRequest {
                pwd: info.pwd.display().to_string(),
                args: info.args.clone(),
                env: info.env.clone(),
                info: Some(info.info.to_rpc()),
                kind: info.kind.map(|k| k.to_string()).unwrap_or_default(),
                name: info.name.clone(),
            })
            .await
            .map_err(|status| Error::rpc(label, status))?
            .into_inner();

        let (mut stdout_writer, stdout_reader) = tokio::io::duplex(RUN_PLUGIN_PIPE_CAPACITY);
        let (mut stderr_writer, stderr_reader) = tokio::io::duplex(RUN_PLUGIN_PIPE_CAPACITY);

        let pump = tokio::spawn(async move {
            while let Ok(Some(frame)) = stream.message().await {
                match frame.output {
                    Some(run_plugin_response::Output::Stdout(bytes)) => {
                        if stdout_writer.write_all(&bytes).await.is_err() {
                            break;
                        }
                    }
                    Some(run_plugin_response::Output::Stderr(bytes)) => {
                        if stderr_writer.write_all(&bytes).await.is_err() {
                            break;
                        }
                    }
                    // An exit code (or an empty frame) ends the stream; the
                    // writers drop here, delivering EOF to the readers.
                    Some(run_plugin_response::Output::Exitcode(_)) | None => break,
                }
            }
        });

        // Aborting the pump drops the response stream, which cancels the
        // request context and with it the plugin.
        let kill: KillFn = Box::new(move || {
            pump.abort();
        });

        Ok((stdout_reader, stderr_reader, kill))
    }

    /// Convert program source into this runtime's language.
    pub async fn generate_program(
        &self,
        source: BTreeMap<String, String>,
        loader_target: &str,
        strict: bool,
    ) -> Result<(BTreeMap<String, Vec<u8>>, Vec<String>), Error> {
        let label = self.label("GenerateProgram");
        let mut client = self.client.clone();
        match client
            .generate_program(pulumirpc::GenerateProgramRequest {
                source: source.into_iter().collect(),
                loader_target: loader_target.to_string(),
                strict,
            })
            .await
        {
            Ok(response) => {
                let r = response.into_inner();
                Ok((r.source.into_iter().collect(), r.diagnostics))
            }
            Err(status) => Err(Error::rpc(label, status)),
        }
    }

    /// Convert a whole project into this runtime's language.
    pub async fn generate_project(
        &self,
        source_directory: &Path,
        target_directory: &Path,
        project: &str,
        strict: bool,
        loader_target: &str,
        local_dependencies: BTreeMap<String, String>,
    ) -> Result<Vec<String>, Error> {
        let label = self.label("GenerateProject");
        let mut client = self.client.clone();
        match client
            .generate_project(pulumirpc::GenerateProjectRequest {
                source_directory: source_directory.display().to_string(),
                target_directory: target_directory.display().to_string(),
                project: project.to_string(),
                strict,
                loader_target: loader_target.to_string(),
                local_dependencies: local_dependencies.into_iter().collect(),
            })
            .await
        {
            Ok(response) => Ok(response.into_inner().diagnostics),
            Err(status) => Err(Error::rpc(label, status)),
        }
    }

    /// Generate an SDK for a package schema in this runtime's language.
    pub async fn generate_package(
        &self,
        directory: &Path,
        schema: &str,
        extra_files: BTreeMap<String, Vec<u8>>,
        loader_target: &str,
        local_dependencies: BTreeMap<String, String>,
        local: bool,
    ) -> Result<Vec<String>, Error> {
        let label = self.label("GeneratePackage");
        let mut client = self.client.clone();
        match client
            .generate_package(pulumirpc::GeneratePackageRequest {
                directory: directory.display().to_string(),
                schema: schema.to_string(),
                extra_files: extra_files.into_iter().collect(),
                loader_target: loader_target.to_string(),
                local_dependencies: local_dependencies.into_iter().collect(),
                local,
            })
            .await
        {
            Ok(response) => Ok(response.into_inner().diagnostics),
            Err(status) => Err(Error::rpc(label, status)),
        }
    }

    /// Pack a package into a publishable artifact; returns the artifact
    /// path.
    pub async fn pack(&self, package_directory: &Path, destination_directory: &Path) -> Result<PathBuf, Error> {
        let label = self.label("Pack");
        let mut client = self.client.clone();
        match client
            .pack(pulumirpc::PackRequest {
                package_directory: package_directory.display().to_string(),
                destination_directory: destination_directory.display().to_string(),
            })
            .await
        {
            Ok(response) => Ok(PathBuf::from(response.into_inner().artifact_path)),
            Err(status) => Err(Error::rpc(label, status)),
        }
    }

    /// The runtime options a user may be prompted for when setting up a
    /// project.
    pub async fn runtime_options_prompts(
        &self,
        info: &ProgramInfo,
    ) -> Result<Vec<RuntimeOptionPrompt>, Error> {
        let label = self.label("RuntimeOptionsPrompts");
        let mut client = self.client.clone();
        match client
            .runtime_options_prompts(pulumirpc::RuntimeOptionsRequest {
                info: Some(info.to_rpc()),
            })
            .await
        {
            Ok(response) => Ok(response
                .into_inner()
                .prompts
                .into_iter()
                .map(|p| RuntimeOptionPrompt {
                    key: p.key,
                    description: p.description,
                    choices: p.choices,
                    default_value: p.default_value,
                })
                .collect()),
            Err(status) if status.code() == Code::Unimplemented => Ok(Vec::new()),
            Err(status) => Err(Error::rpc(label, status)),
        }
    }

    /// Fetch the runtime's self-reported version, when it implements
    /// `GetPluginInfo`.
    pub async fn plugin_info(&self) -> Result<Option<Version>, Error> {
        let label = self.label("GetPluginInfo");
        let mut client = self.client.clone();
        match client.get_plugin_info(Empty {}).await {
            Ok(response) => Ok(Version::parse(&response.into_inner().version).ok()),
            Err(status) if status.code() == Code::Unimplemented => Ok(None),
            Err(status) => Err(Error::rpc(label, status)),
        }
    }

    /// Synchronously tear the runtime down.
    pub async fn close(&self) {
        self.plugin.close().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn program_info_converts_to_wire_form() {
        let mut info = ProgramInfo::new("/proj", "/proj/infra");
        info.options
            .insert("virtualenv".to_string(), serde_json::Value::String("venv".into()));

        let rpc = info.to_rpc();
        assert_eq!(rpc.root_directory, "/proj");
        assert_eq!(rpc.program_directory, "/proj/infra");
        assert_eq!(rpc.entry_point, ".");
        let options = rpc.options.unwrap();
        assert_eq!(
            options.fields.get("virtualenv"),
            Some(&prost_types::Value {
                kind: Some(prost_types::value::Kind::StringValue("venv".into())),
            })
        );
    }
}
