//! The typed facade over the resource-provider RPC surface.
//!
//! Every resource operation funnels through the same pre-flight: marshal
//! inputs with the options negotiated for this provider, block on the
//! one-shot configuration promise, and short-circuit with a conservative
//! default when the configuration contained unknowns — preview output must
//! never be falsely precise. The facade also absorbs a small museum of
//! protocol history: feature bits discovered from `Configure` on plugins
//! that predate `Handshake`, non-standard error codes from two long-deployed
//! providers, and init-failure details smuggled through gRPC status details.

use std::collections::BTreeMap;
use std::sync::Arc;

use prost::Message;
use semver::Version;
use tonic::transport::Channel;
use tonic::Code;

use pulumi_proto::pulumirpc::resource_monitor_client::ResourceMonitorClient;
use pulumi_proto::pulumirpc::resource_provider_client::ResourceProviderClient;
use pulumi_proto::pulumirpc::{
    self, diff_response, parameterize_request, property_diff, Empty, PluginAttach,
    ProviderHandshakeRequest, RegisterResourceRequest,
};

use crate::diff::{DiffChanges, DiffKind, DiffResult, PropertyDiff};
use crate::error::{Error, InitError, MissingKey, ResultStatus};
use crate::plugin::{self, PluginProcess};
use crate::property::marshal::{marshal_properties, unmarshal_properties, MarshalOptions};
use crate::property::secrets::{annotate_secrets, restore_elided_asset_contents};
use crate::property::{self, PropertyKey, PropertyMap};
use crate::urn::Urn;

/// Providers ship whole schemas and asset payloads in single messages;
/// raise tonic's 4 MiB default accordingly.
pub(crate) const MAX_RPC_MESSAGE_SIZE: usize = 400 * 1024 * 1024;

/// The type token of the dynamic-provider shim bundled with the nodejs SDK.
/// It reports `Internal` where it means `Unimplemented`.
const NODEJS_DYNAMIC_PROVIDER_TYPE: &str = "pulumi:providers:pulumi-nodejs";

/// The type token of the kubernetes provider, whose early releases reported
/// `Unknown` with an "Unimplemented" message, and which fails to unmarshal
/// configuration containing unknowns.
const KUBERNETES_PROVIDER_TYPE: &str = "pulumi:providers:kubernetes";

/// Feature bits negotiated with a provider, fixed once configuration
/// resolves.
#[derive(Debug, Clone, Copy, Default)]
pub struct PluginConfig {
    /// False when the configuration contained unknown values; most
    /// operations then return conservative defaults without calling the
    /// plugin.
    pub known: bool,
    pub accept_secrets: bool,
    pub accept_resources: bool,
    pub accept_outputs: bool,
    pub supports_preview: bool,
    pub supports_autonaming: bool,
}

/// The feature bits a provider reported from `Handshake`. Absent for legacy
/// plugins, whose bits are discovered from `Configure` instead.
#[derive(Debug, Clone, Copy)]
pub struct HandshakeInfo {
    pub accept_secrets: bool,
    pub accept_resources: bool,
    pub accept_outputs: bool,
    pub supports_autonaming: bool,
}

/// A one-shot promise with many readers. Exactly one fulfill or reject.
struct ConfigSource {
    tx: tokio::sync::watch::Sender<Option<Result<PluginConfig, String>>>,
}

impl ConfigSource {
    fn new() -> Self {
        let (tx, _) = tokio::sync::watch::channel(None);
        ConfigSource { tx }
    }

    fn fulfill(&self, config: PluginConfig) {
        self.tx.send_if_modified(|slot| {
            debug_assert!(slot.is_none(), "provider configured twice");
            if slot.is_none() {
                *slot = Some(Ok(config));
                true
            } else {
                false
            }
        });
    }

    fn reject(&self, message: String) {
        self.tx.send_if_modified(|slot| {
            debug_assert!(slot.is_none(), "provider configured twice");
            if slot.is_none() {
                *slot = Some(Err(message));
                true
            } else {
                false
            }
        });
    }

    async fn wait(&self) -> Result<PluginConfig, Error> {
        let mut rx = self.tx.subscribe();
        let resolved = rx
            .wait_for(|slot| slot.is_some())
            .await
            .map_err(|_| Error::ConfigureFailed("provider closed before Configure".into()))?;
        match resolved.as_ref().unwrap() {
            Ok(config) => Ok(*config),
            Err(message) => Err(Error::ConfigureFailed(message.clone())),
        }
    }
}

/// A validation failure reported by `Check`, `CheckConfig`, `Invoke`, or
/// `Call`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CheckFailure {
    pub property: String,
    pub reason: String,
}

/// The checked inputs and failures returned by `Check`/`CheckConfig`.
#[derive(Debug, Clone)]
pub struct CheckOutcome {
    pub inputs: PropertyMap,
    pub failures: Vec<CheckFailure>,
}

/// The outcome of `Create`.
#[derive(Debug, Clone)]
pub struct CreateResult {
    pub id: String,
    pub properties: PropertyMap,
    pub status: ResultStatus,
}

/// The outcome of `Read`.
#[derive(Debug, Clone)]
pub struct ReadResult {
    pub id: String,
    pub inputs: PropertyMap,
    pub outputs: PropertyMap,
    pub status: ResultStatus,
}

/// The outcome of `Update`.
#[derive(Debug, Clone)]
pub struct UpdateResult {
    pub properties: PropertyMap,
    pub status: ResultStatus,
}

/// The outcome of `Construct`.
#[derive(Debug, Clone)]
pub struct ConstructResult {
    pub urn: Urn,
    pub outputs: PropertyMap,
    pub output_dependencies: BTreeMap<PropertyKey, Vec<Urn>>,
}

/// The outcome of `Call`.
#[derive(Debug, Clone, Default)]
pub struct CallResult {
    pub outputs: PropertyMap,
    pub output_dependencies: BTreeMap<PropertyKey, Vec<Urn>>,
    pub failures: Vec<CheckFailure>,
}

/// Deployment-wide context a component construction runs in.
#[derive(Debug, Clone, Default)]
pub struct ConstructInfo {
    pub project: String,
    pub stack: String,
    pub organization: String,
    pub config: BTreeMap<String, String>,
    pub config_secret_keys: Vec<String>,
    pub dry_run: bool,
    pub parallel: i32,
    pub monitor_addr: String,
}

/// Per-resource options for a component construction.
#[derive(Debug, Clone, Default)]
pub struct ConstructOptions {
    pub parent: Option<Urn>,
    pub aliases: Vec<Urn>,
    pub dependencies: Vec<Urn>,
    pub protect: Option<bool>,
    pub providers: BTreeMap<String, String>,
    pub input_dependencies: BTreeMap<PropertyKey, Vec<Urn>>,
}

/// Mapping data returned by `GetMapping`.
#[derive(Debug, Clone)]
pub struct Mapping {
    pub provider: String,
    pub data: Vec<u8>,
}

/// The parameters passed to `Parameterize`.
#[derive(Debug, Clone)]
pub enum ParameterizeParameters {
    Args(Vec<String>),
    Value {
        name: String,
        version: String,
        value: Vec<u8>,
    },
}

/// A connected resource provider.
pub struct ProviderClient {
    pkg: String,
    version: Option<Version>,
    client: ResourceProviderClient<Channel>,
    plugin: Option<PluginProcess>,
    handshake: Option<HandshakeInfo>,
    config: ConfigSource,
    legacy_preview: bool,
}

impl ProviderClient {
    /// Wrap an established plugin process, performing the handshake.
    pub async fn new(
        plugin: PluginProcess,
        pkg: &str,
        version: Option<Version>,
        engine_addr: &str,
        root_directory: Option<String>,
        program_directory: Option<String>,
    ) -> Result<Self, Error> {
        let channel = plugin.channel();
        let handshake =
            Self::do_handshake(&channel, pkg, engine_addr, root_directory, program_directory)
                .await?;
        Ok(Self::from_parts(channel, Some(plugin), pkg, version, handshake))
    }

    /// Dial an already-running provider (debug attach), handshake it, and
    /// tell it where the engine lives.
    pub async fn attach(
        port: u16,
        pkg: &str,
        version: Option<Version>,
        engine_addr: &str,
        diag: Arc<dyn crate::diag::DiagSink>,
    ) -> Result<Self, Error> {
        let plugin = PluginProcess::attach(pkg, diag, port).await?;
        let channel = plugin.channel();
        let handshake = Self::do_handshake(&channel, pkg, engine_addr, None, None).await?;

        let mut client = ResourceProviderClient::new(channel.clone());
        match client
            .attach(PluginAttach {
                address: engine_addr.to_string(),
            })
            .await
        {
            Ok(_) => {}
            Err(status) if status.code() == Code::Unimplemented => {}
            Err(status) => {
                return Err(Error::Handshake {
                    plugin: pkg.to_string(),
                    status: Box::new(status),
                });
            }
        }

        Ok(Self::from_parts(channel, Some(plugin), pkg, version, handshake))
    }

    fn from_parts(
        channel: Channel,
        plugin: Option<PluginProcess>,
        pkg: &str,
        version: Option<Version>,
        handshake: Option<HandshakeInfo>,
    ) -> Self {
        let legacy_preview = std::env::var("PULUMI_LEGACY_PROVIDER_PREVIEW")
            .map(|v| v == "1" || v.eq_ignore_ascii_case("true"))
            .unwrap_or(false);
        ProviderClient {
            pkg: pkg.to_string(),
            version,
            client: ResourceProviderClient::new(channel)
                .max_decoding_message_size(MAX_RPC_MESSAGE_SIZE)
                .max_encoding_message_size(MAX_RPC_MESSAGE_SIZE),
            plugin,
            handshake,
            config: ConfigSource::new(),
            legacy_preview,
        }
    }

    async fn do_handshake(
        channel: &Channel,
        pkg: &str,
        engine_addr: &str,
        root_directory: Option<String>,
        program_directory: Option<String>,
    ) -> Result<Option<HandshakeInfo>, Error> {
        let result = plugin::handshake_retry(|| {
            let mut client = ResourceProviderClient::new(channel.clone());
            let request = ProviderHandshakeRequest {
                engine_address: engine_addr.to_string(),
                root_directory: root_directory.clone(),
                program_directory: program_directory.clone(),
                configure_with_urn: false,
            };
            async move { client.handshake(request).await.map(|r| r.into_inner()) }
        })
        .await;

        match result {
            Ok(response) => Ok(Some(HandshakeInfo {
                accept_secrets: response.accept_secrets,
                accept_resources: response.accept_resources,
                accept_outputs: response.accept_outputs,
                supports_autonaming: response.supports_autonaming_configuration,
            })),
            // Legacy plugin: feature bits come from Configure instead.
            Err(status) if status.code() == Code::Unimplemented => Ok(None),
            Err(status) => Err(Error::Handshake {
                plugin: pkg.to_string(),
                status: Box::new(status),
            }),
        }
    }

    pub fn pkg(&self) -> &str {
        &self.pkg
    }

    pub fn version(&self) -> Option<&Version> {
        self.version.as_ref()
    }

    fn label(&self, method: &str) -> String {
        format!("Provider[{}].{}", self.pkg, method)
    }

    /// Handshake-era feature bits, used by the configuration phase before
    /// the config promise resolves.
    fn handshake_bits(&self) -> (bool, bool, bool) {
        match &self.handshake {
            Some(h) => (h.accept_secrets, h.accept_resources, h.accept_outputs),
            None => (false, false, false),
        }
    }

    fn marshal_opts(&self, label: &str, cfg: &PluginConfig, keep_unknowns: bool) -> MarshalOptions {
        MarshalOptions {
            label: label.to_string(),
            keep_unknowns,
            keep_secrets: cfg.accept_secrets,
            keep_resources: cfg.accept_resources,
            keep_output_values: cfg.accept_outputs,
            ..Default::default()
        }
    }

    /// Options for decoding a provider's response: the engine understands
    /// the whole value model, whatever the provider sent.
    fn unmarshal_opts(&self, label: &str, keep_unknowns: bool) -> MarshalOptions {
        MarshalOptions {
            label: label.to_string(),
            keep_unknowns,
            keep_secrets: true,
            keep_resources: true,
            ..Default::default()
        }
    }

    /// Validate this provider's configuration. Called before `Configure`,
    /// so feature bits come from the handshake alone; configuration that
    /// contains unknowns is passed back unchanged without consulting the
    /// plugin.
    pub async fn check_config(
        &self,
        urn: &Urn,
        olds: &PropertyMap,
        news: &PropertyMap,
        allow_unknowns: bool,
    ) -> Result<CheckOutcome, Error> {
        let label = self.label("CheckConfig");
        if property::contains_unknowns(news) {
            return Ok(CheckOutcome {
                inputs: news.clone(),
                failures: Vec::new(),
            });
        }

        let (accept_secrets, accept_resources, _) = self.handshake_bits();
        let opts = MarshalOptions {
            label: label.clone(),
            keep_unknowns: allow_unknowns,
            keep_secrets: accept_secrets,
            keep_resources: accept_resources,
            ..Default::default()
        };
        let request = pulumirpc::CheckRequest {
            urn: urn.to_string(),
            olds: Some(marshal_properties(olds, &opts)?),
            news: Some(marshal_properties(news, &opts)?),
            random_seed: Vec::new(),
            name: urn.name().to_string(),
            r#type: urn.type_token().to_string(),
        };

        let mut client = self.client.clone();
        match client.check_config(request).await {
            Ok(response) => {
                self.check_outcome(response.into_inner(), &label, news, allow_unknowns, accept_secrets)
            }
            Err(status) if is_config_unimplemented(&status, urn) => Ok(CheckOutcome {
                inputs: news.clone(),
                failures: Vec::new(),
            }),
            Err(status) => Err(Error::rpc(label, status)),
        }
    }

    /// Diff this provider's configuration. Unknown configuration, and
    /// providers that do not implement the method, produce an unknown diff.
    pub async fn diff_config(
        &self,
        urn: &Urn,
        old_inputs: &PropertyMap,
        new_inputs: &PropertyMap,
        allow_unknowns: bool,
        ignore_changes: &[String],
    ) -> Result<DiffResult, Error> {
        let label = self.label("DiffConfig");
        if property::contains_unknowns(new_inputs) {
            return Ok(DiffResult::default());
        }

        let (accept_secrets, accept_resources, _) = self.handshake_bits();
        let opts = MarshalOptions {
            label: label.clone(),
            keep_unknowns: allow_unknowns,
            keep_secrets: accept_secrets,
            keep_resources: accept_resources,
            ..Default::default()
        };
        let request = pulumirpc::DiffRequest {
            id: String::new(),
            urn: urn.to_string(),
            olds: Some(marshal_properties(old_inputs, &opts)?),
            news: Some(marshal_properties(new_inputs, &opts)?),
            ignore_changes: ignore_changes.to_vec(),
            old_inputs: Some(marshal_properties(old_inputs, &opts)?),
            name: urn.name().to_string(),
            r#type: urn.type_token().to_string(),
        };

        let mut client = self.client.clone();
        match client.diff_config(request).await {
            Ok(response) => Ok(diff_result_from_rpc(response.into_inner())),
            Err(status) if is_config_unimplemented(&status, urn) => Ok(DiffResult::default()),
            // Early kubernetes cannot unmarshal configuration containing
            // unknowns; report an unknown diff rather than failing the
            // preview.
            Err(status)
                if urn.type_token() == KUBERNETES_PROVIDER_TYPE
                    && status.message().contains("cannot unmarshal") =>
            {
                Ok(DiffResult::default())
            }
            Err(status) => Err(Error::rpc(label, status)),
        }
    }

    /// Configure the provider. Resolves the configuration promise all
    /// resource operations block on; must be called exactly once.
    pub async fn configure(&self, inputs: PropertyMap) -> Result<(), Error> {
        let label = self.label("Configure");
        let (hs_secrets, hs_resources, hs_outputs) = self.handshake_bits();

        if property::contains_unknowns(&inputs) {
            self.config.fulfill(PluginConfig {
                known: false,
                accept_secrets: hs_secrets,
                accept_resources: hs_resources,
                accept_outputs: hs_outputs,
                supports_preview: false,
                supports_autonaming: self
                    .handshake
                    .map(|h| h.supports_autonaming)
                    .unwrap_or(false),
            });
            return Ok(());
        }

        let opts = MarshalOptions {
            label: label.clone(),
            keep_unknowns: true,
            keep_secrets: hs_secrets,
            keep_resources: hs_resources,
            skip_internal_keys: true,
            ..Default::default()
        };

        // The legacy string map predates structured configuration; older
        // plugins still read it.
        let mut variables = std::collections::HashMap::new();
        for (key, value) in &inputs {
            let text = match value {
                property::PropertyValue::String(s) => s.clone(),
                other => serde_json::to_string(&other.to_json()).unwrap_or_default(),
            };
            variables.insert(format!("{}:config:{}", self.pkg, key), text);
        }

        let request = pulumirpc::ConfigureRequest {
            variables,
            args: Some(marshal_properties(&inputs, &opts)?),
            accept_secrets: true,
            accept_resources: true,
            sends_old_inputs: true,
            sends_old_inputs_to_delete: true,
        };

        let mut client = self.client.clone();
        match client.configure(request).await {
            Ok(response) => {
                let r = response.into_inner();
                self.config.fulfill(PluginConfig {
                    known: true,
                    accept_secrets: self
                        .handshake
                        .map(|h| h.accept_secrets)
                        .unwrap_or(r.accept_secrets),
                    accept_resources: self
                        .handshake
                        .map(|h| h.accept_resources)
                        .unwrap_or(r.accept_resources),
                    accept_outputs: self
                        .handshake
                        .map(|h| h.accept_outputs)
                        .unwrap_or(r.accept_outputs),
                    supports_preview: r.supports_preview,
                    supports_autonaming: self
                        .handshake
                        .map(|h| h.supports_autonaming)
                        .unwrap_or(r.supports_autonaming_configuration),
                });
                Ok(())
            }
            Err(status) => {
                let err = match status_detail::<pulumirpc::ConfigureErrorMissingKeys>(
                    &status,
                    "ConfigureErrorMissingKeys",
                ) {
                    Some(detail) => Error::ConfigureMissingKeys {
                        keys: detail
                            .missing_keys
                            .into_iter()
                            .map(|k| MissingKey {
                                name: k.name,
                                description: k.description,
                            })
                            .collect(),
                    },
                    None => Error::rpc(label, status),
                };
                self.config.reject(err.to_string());
                Err(err)
            }
        }
    }

    /// Validate a resource's inputs prior to `Create` or `Update`.
    pub async fn check(
        &self,
        urn: &Urn,
        olds: &PropertyMap,
        news: &PropertyMap,
        allow_unknowns: bool,
        random_seed: &[u8],
    ) -> Result<CheckOutcome, Error> {
        let label = self.label("Check");
        let cfg = self.config.wait().await?;
        if !cfg.known {
            return Ok(CheckOutcome {
                inputs: news.clone(),
                failures: Vec::new(),
            });
        }

        let opts = self.marshal_opts(&label, &cfg, allow_unknowns);
        let request = pulumirpc::CheckRequest {
            urn: urn.to_string(),
            olds: Some(marshal_properties(olds, &opts)?),
            news: Some(marshal_properties(news, &opts)?),
            random_seed: random_seed.to_vec(),
            name: urn.name().to_string(),
            r#type: urn.type_token().to_string(),
        };

        let mut client = self.client.clone();
        match client.check(request).await {
            Ok(response) => self.check_outcome(
                response.into_inner(),
                &label,
                news,
                allow_unknowns,
                cfg.accept_secrets,
            ),
            Err(status) => Err(Error::rpc(label, status)),
        }
    }

    fn check_outcome(
        &self,
        response: pulumirpc::CheckResponse,
        label: &str,
        news: &PropertyMap,
        allow_unknowns: bool,
        accept_secrets: bool,
    ) -> Result<CheckOutcome, Error> {
        let mut inputs = match response.inputs {
            Some(wire) => unmarshal_properties(&wire, &self.unmarshal_opts(label, allow_unknowns))?,
            None => PropertyMap::new(),
        };
        if !accept_secrets {
            annotate_secrets(&mut inputs, news);
        }
        Ok(CheckOutcome {
            inputs,
            failures: response.failures.into_iter().map(check_failure).collect(),
        })
    }

    /// Diff a resource's actual state against its desired state.
    pub async fn diff(
        &self,
        urn: &Urn,
        id: &str,
        old_outputs: &PropertyMap,
        old_inputs: &PropertyMap,
        new_inputs: &PropertyMap,
        allow_unknowns: bool,
        ignore_changes: &[String],
    ) -> Result<DiffResult, Error> {
        let label = self.label("Diff");
        let cfg = self.config.wait().await?;
        if !cfg.known {
            return Err(Error::DiffUnavailable {
                reason: "The provider for this resource has inputs that are not known during preview"
                    .to_string(),
            });
        }

        let opts = self.marshal_opts(&label, &cfg, allow_unknowns);
        let request = pulumirpc::DiffRequest {
            id: id.to_string(),
            urn: urn.to_string(),
            olds: Some(marshal_properties(old_outputs, &opts)?),
            news: Some(marshal_properties(new_inputs, &opts)?),
            ignore_changes: ignore_changes.to_vec(),
            old_inputs: Some(marshal_properties(old_inputs, &opts)?),
            name: urn.name().to_string(),
            r#type: urn.type_token().to_string(),
        };

        let mut client = self.client.clone();
        match client.diff(request).await {
            Ok(response) => Ok(diff_result_from_rpc(response.into_inner())),
            Err(status) => Err(Error::rpc(label, status)),
        }
    }

    /// Create a resource. In preview, the provider is only consulted when it
    /// supports previews; otherwise the inputs (or nothing, for providers
    /// honoring the conservative contract) stand in for the outputs.
    pub async fn create(
        &self,
        urn: &Urn,
        properties: &PropertyMap,
        timeout: f64,
        preview: bool,
    ) -> Result<CreateResult, Error> {
        let label = self.label("Create");
        let cfg = self.config.wait().await?;
        if !cfg.known {
            assert!(
                preview,
                "Create cannot be called when the provider's configuration is not fully known"
            );
            let outputs = if self.legacy_preview {
                properties.clone()
            } else {
                PropertyMap::new()
            };
            return Ok(CreateResult {
                id: String::new(),
                properties: outputs,
                status: ResultStatus::Ok,
            });
        }
        if preview && (self.legacy_preview || !cfg.supports_preview) {
            return Ok(CreateResult {
                id: String::new(),
                properties: properties.clone(),
                status: ResultStatus::Ok,
            });
        }

        let opts = self.marshal_opts(&label, &cfg, preview);
        let request = pulumirpc::CreateRequest {
            urn: urn.to_string(),
            properties: Some(marshal_properties(properties, &opts)?),
            timeout,
            preview,
            name: urn.name().to_string(),
            r#type: urn.type_token().to_string(),
        };

        let mut client = self.client.clone();
        match client.create(request).await {
            Ok(response) => {
                let r = response.into_inner();
                if r.id.is_empty() && !preview {
                    return Err(Error::Launch {
                        plugin: self.pkg.clone(),
                        reason: format!("provider returned an empty ID from Create({urn})"),
                    });
                }
                let mut outputs = match r.properties {
                    Some(wire) => {
                        unmarshal_properties(&wire, &self.unmarshal_opts(&label, preview))?
                    }
                    None => PropertyMap::new(),
                };
                if !cfg.accept_secrets {
                    annotate_secrets(&mut outputs, properties);
                }
                Ok(CreateResult {
                    id: r.id,
                    properties: outputs,
                    status: ResultStatus::Ok,
                })
            }
            Err(status) => Err(self.resource_error(&label, status)),
        }
    }

    /// Read the live state of a resource.
    pub async fn read(
        &self,
        urn: &Urn,
        id: &str,
        inputs: &PropertyMap,
        state: &PropertyMap,
    ) -> Result<ReadResult, Error> {
        let label = self.label("Read");
        let cfg = self.config.wait().await?;
        if !cfg.known {
            return Ok(ReadResult {
                id: id.to_string(),
                inputs: PropertyMap::new(),
                outputs: PropertyMap::new(),
                status: ResultStatus::Unknown,
            });
        }

        let opts = self.marshal_opts(&label, &cfg, true);
        let request = pulumirpc::ReadRequest {
            id: id.to_string(),
            urn: urn.to_string(),
            properties: Some(marshal_properties(state, &opts)?),
            inputs: Some(marshal_properties(inputs, &opts)?),
            name: urn.name().to_string(),
            r#type: urn.type_token().to_string(),
        };

        let mut client = self.client.clone();
        match client.read(request).await {
            Ok(response) => {
                let r = response.into_inner();
                let unmarshal = self.unmarshal_opts(&label, true);
                let mut outputs = match r.properties {
                    Some(wire) => unmarshal_properties(&wire, &unmarshal)?,
                    None => PropertyMap::new(),
                };
                let mut read_inputs = match r.inputs {
                    Some(wire) => unmarshal_properties(&wire, &unmarshal)?,
                    None => PropertyMap::new(),
                };
                // Providers echo back inputs whose asset contents were
                // elided on the way out; put the contents back.
                restore_elided_asset_contents(inputs, &mut read_inputs);
                if !cfg.accept_secrets {
                    annotate_secrets(&mut outputs, state);
                    annotate_secrets(&mut read_inputs, inputs);
                }
                Ok(ReadResult {
                    id: r.id,
                    inputs: read_inputs,
                    outputs,
                    status: ResultStatus::Ok,
                })
            }
            Err(status) => Err(self.resource_error(&label, status)),
        }
    }

    /// Update a resource in place.
    pub async fn update(
        &self,
        urn: &Urn,
        id: &str,
        olds: &PropertyMap,
        old_inputs: &PropertyMap,
        news: &PropertyMap,
        timeout: f64,
        ignore_changes: &[String],
        preview: bool,
    ) -> Result<UpdateResult, Error> {
        let label = self.label("Update");
        let cfg = self.config.wait().await?;
        if !cfg.known {
            assert!(
                preview,
                "Update cannot be called when the provider's configuration is not fully known"
            );
            let outputs = if self.legacy_preview {
                news.clone()
            } else {
                PropertyMap::new()
            };
            return Ok(UpdateResult {
                properties: outputs,
                status: ResultStatus::Ok,
            });
        }
        if preview && (self.legacy_preview || !cfg.supports_preview) {
            return Ok(UpdateResult {
                properties: news.clone(),
                status: ResultStatus::Ok,
            });
        }

        let opts = self.marshal_opts(&label, &cfg, preview);
        let request = pulumirpc::UpdateRequest {
            id: id.to_string(),
            urn: urn.to_string(),
            olds: Some(marshal_properties(olds, &opts)?),
            news: Some(marshal_properties(news, &opts)?),
            timeout,
            ignore_changes: ignore_changes.to_vec(),
            preview,
            old_inputs: Some(marshal_properties(old_inputs, &opts)?),
            name: urn.name().to_string(),
            r#type: urn.type_token().to_string(),
        };

        let mut client = self.client.clone();
        match client.update(request).await {
            Ok(response) => {
                let r = response.into_inner();
                let mut outputs = match r.properties {
                    Some(wire) => {
                        unmarshal_properties(&wire, &self.unmarshal_opts(&label, preview))?
                    }
                    None => PropertyMap::new(),
                };
                if !cfg.accept_secrets {
                    annotate_secrets(&mut outputs, news);
                }
                Ok(UpdateResult {
                    properties: outputs,
                    status: ResultStatus::Ok,
                })
            }
            Err(status) => Err(self.resource_error(&label, status)),
        }
    }

    /// Delete a resource.
    pub async fn delete(
        &self,
        urn: &Urn,
        id: &str,
        inputs: &PropertyMap,
        outputs: &PropertyMap,
        timeout: f64,
    ) -> Result<ResultStatus, Error> {
        let label = self.label("Delete");
        let cfg = self.config.wait().await?;
        assert!(
            cfg.known,
            "Delete cannot be called when the provider's configuration is not fully known"
        );

        let opts = self.marshal_opts(&label, &cfg, false);
        let request = pulumirpc::DeleteRequest {
            id: id.to_string(),
            urn: urn.to_string(),
            properties: Some(marshal_properties(outputs, &opts)?),
            timeout,
            old_inputs: Some(marshal_properties(inputs, &opts)?),
            name: urn.name().to_string(),
            r#type: urn.type_token().to_string(),
        };

        let mut client = self.client.clone();
        match client.delete(request).await {
            Ok(_) => Ok(ResultStatus::Ok),
            Err(status) => Err(Error::rpc(label, status)),
        }
    }

    /// Construct a provider-managed component resource.
    pub async fn construct(
        &self,
        info: &ConstructInfo,
        type_token: &str,
        name: &str,
        inputs: &PropertyMap,
        options: &ConstructOptions,
    ) -> Result<ConstructResult, Error> {
        let label = self.label("Construct");
        let cfg = self.config.wait().await?;
        if !cfg.known {
            // The component's provider cannot run yet, but the engine still
            // needs a URN for the component: register a stub against the
            // resource monitor and return only that.
            let channel = plugin::dial("resource monitor", &info.monitor_addr).await?;
            let mut monitor = ResourceMonitorClient::new(channel);
            let response = monitor
                .register_resource(RegisterResourceRequest {
                    r#type: type_token.to_string(),
                    name: name.to_string(),
                    parent: options
                        .parent
                        .as_ref()
                        .map(|u| u.to_string())
                        .unwrap_or_default(),
                    custom: false,
                    object: None,
                    accept_secrets: true,
                    accept_resources: true,
                    provider: String::new(),
                    remote: false,
                })
                .await
                .map_err(|status| Error::rpc(label.clone(), status))?
                .into_inner();
            let urn = Urn::parse(&response.urn).map_err(|e| Error::Launch {
                plugin: self.pkg.clone(),
                reason: format!("monitor returned an invalid URN: {e}"),
            })?;
            return Ok(ConstructResult {
                urn,
                outputs: PropertyMap::new(),
                output_dependencies: BTreeMap::new(),
            });
        }

        if !cfg.accept_secrets {
            return Err(Error::Unsupported {
                plugin: self.pkg.clone(),
                feature: "secrets, which components require".to_string(),
            });
        }

        let opts = MarshalOptions {
            label: label.clone(),
            keep_unknowns: info.dry_run,
            keep_secrets: true,
            keep_resources: cfg.accept_resources,
            keep_output_values: cfg.accept_outputs,
            ..Default::default()
        };
        let input_dependencies = options
            .input_dependencies
            .iter()
            .map(|(key, urns)| {
                (
                    key.as_str().to_string(),
                    pulumirpc::construct_request::PropertyDependencies {
                        urns: urns.iter().map(|u| u.to_string()).collect(),
                    },
                )
            })
            .collect();
        let request = pulumirpc::ConstructRequest {
            project: info.project.clone(),
            stack: info.stack.clone(),
            config: info.config.clone().into_iter().collect(),
            dry_run: info.dry_run,
            parallel: info.parallel,
            monitor_endpoint: info.monitor_addr.clone(),
            r#type: type_token.to_string(),
            name: name.to_string(),
            parent: options
                .parent
                .as_ref()
                .map(|u| u.to_string())
                .unwrap_or_default(),
            inputs: Some(marshal_properties(inputs, &opts)?),
            input_dependencies,
            providers: options.providers.clone().into_iter().collect(),
            dependencies: options.dependencies.iter().map(|u| u.to_string()).collect(),
            config_secret_keys: info.config_secret_keys.clone(),
            aliases: options.aliases.iter().map(|u| u.to_string()).collect(),
            protect: options.protect,
            organization: info.organization.clone(),
        };

        let mut client = self.client.clone();
        match client.construct(request).await {
            Ok(response) => {
                let r = response.into_inner();
                let urn = Urn::parse(&r.urn).map_err(|e| Error::Launch {
                    plugin: self.pkg.clone(),
                    reason: format!("provider returned an invalid URN from Construct: {e}"),
                })?;
                let outputs = match r.state {
                    Some(wire) => {
                        unmarshal_properties(&wire, &self.unmarshal_opts(&label, info.dry_run))?
                    }
                    None => PropertyMap::new(),
                };
                let mut output_dependencies = BTreeMap::new();
                for (key, deps) in r.state_dependencies {
                    let mut urns = Vec::with_capacity(deps.urns.len());
                    for urn in &deps.urns {
                        urns.push(Urn::parse(urn).map_err(|e| Error::Launch {
                            plugin: self.pkg.clone(),
                            reason: format!("invalid dependency URN from Construct: {e}"),
                        })?);
                    }
                    output_dependencies.insert(PropertyKey::new(key), urns);
                }
                Ok(ConstructResult {
                    urn,
                    outputs,
                    output_dependencies,
                })
            }
            Err(status) => Err(Error::rpc(label, status)),
        }
    }

    /// Invoke a provider function.
    pub async fn invoke(
        &self,
        token: &str,
        args: &PropertyMap,
    ) -> Result<(PropertyMap, Vec<CheckFailure>), Error> {
        let label = self.label("Invoke");
        let cfg = self.config.wait().await?;
        if !cfg.known {
            return Ok((PropertyMap::new(), Vec::new()));
        }

        let opts = self.marshal_opts(&label, &cfg, false);
        let request = pulumirpc::InvokeRequest {
            tok: token.to_string(),
            args: Some(marshal_properties(args, &opts)?),
        };

        let mut client = self.client.clone();
        match client.invoke(request).await {
            Ok(response) => {
                let r = response.into_inner();
                let ret = match r.r#return {
                    Some(wire) => unmarshal_properties(&wire, &self.unmarshal_opts(&label, false))?,
                    None => PropertyMap::new(),
                };
                Ok((ret, r.failures.into_iter().map(check_failure).collect()))
            }
            Err(status) => Err(Error::rpc(label, status)),
        }
    }

    /// Invoke a provider function that streams results. Each result is
    /// handed to `on_next` as it arrives.
    pub async fn stream_invoke<F>(
        &self,
        token: &str,
        args: &PropertyMap,
        mut on_next: F,
    ) -> Result<Vec<CheckFailure>, Error>
    where
        F: FnMut(PropertyMap) -> Result<(), Error> + Send,
    {
        let label = self.label("StreamInvoke");
        let cfg = self.config.wait().await?;
        if !cfg.known {
            return Ok(Vec::new());
        }

        let opts = self.marshal_opts(&label, &cfg, false);
        let request = pulumirpc::InvokeRequest {
            tok: token.to_string(),
            args: Some(marshal_properties(args, &opts)?),
        };

        let mut client = self.client.clone();
        let mut stream = client
            .stream_invoke(request)
            .await
            .map_err(|status| Error::rpc(label.clone(), status))?
            .into_inner();

        let mut failures = Vec::new();
        loop {
            match stream.message().await {
                Ok(Some(item)) => {
                    failures.extend(item.failures.into_iter().map(check_failure));
                    if let Some(wire) = item.r#return {
                        let ret = unmarshal_properties(&wire, &self.unmarshal_opts(&label, false))?;
                        on_next(ret)?;
                    }
                }
                Ok(None) => return Ok(failures),
                Err(status) => return Err(Error::rpc(label, status)),
            }
        }
    }

    /// Call a method on a provider-managed component resource.
    pub async fn call(
        &self,
        token: &str,
        args: &PropertyMap,
        arg_dependencies: &BTreeMap<PropertyKey, Vec<Urn>>,
        info: &ConstructInfo,
    ) -> Result<CallResult, Error> {
        let label = self.label("Call");
        let cfg = self.config.wait().await?;
        if !cfg.known {
            return Ok(CallResult::default());
        }

        let opts = MarshalOptions {
            label: label.clone(),
            keep_unknowns: info.dry_run,
            keep_secrets: cfg.accept_secrets,
            keep_resources: cfg.accept_resources,
            keep_output_values: cfg.accept_outputs,
            ..Default::default()
        };
        let request = pulumirpc::CallRequest {
            tok: token.to_string(),
            args: Some(marshal_properties(args, &opts)?),
            arg_dependencies: arg_dependencies
                .iter()
                .map(|(key, urns)| {
                    (
                        key.as_str().to_string(),
                        pulumirpc::call_request::ArgumentDependencies {
                            urns: urns.iter().map(|u| u.to_string()).collect(),
                        },
                    )
                })
                .collect(),
            project: info.project.clone(),
            stack: info.stack.clone(),
            config: info.config.clone().into_iter().collect(),
            config_secret_keys: info.config_secret_keys.clone(),
            dry_run: info.dry_run,
            parallel: info.parallel,
            monitor_endpoint: info.monitor_addr.clone(),
            organization: info.organization.clone(),
        };

        let mut client = self.client.clone();
        match client.call(request).await {
            Ok(response) => {
                let r = response.into_inner();
                let outputs = match r.r#return {
                    Some(wire) => {
                        unmarshal_properties(&wire, &self.unmarshal_opts(&label, info.dry_run))?
                    }
                    None => PropertyMap::new(),
                };
                let mut output_dependencies = BTreeMap::new();
                for (key, deps) in r.return_dependencies {
                    let mut urns = Vec::with_capacity(deps.urns.len());
                    for urn in &deps.urns {
                        urns.push(Urn::parse(urn).map_err(|e| Error::Launch {
                            plugin: self.pkg.clone(),
                            reason: format!("invalid dependency URN from Call: {e}"),
                        })?);
                    }
                    output_dependencies.insert(PropertyKey::new(key), urns);
                }
                Ok(CallResult {
                    outputs,
                    output_dependencies,
                    failures: r.failures.into_iter().map(check_failure).collect(),
                })
            }
            Err(status) => Err(Error::rpc(label, status)),
        }
    }

    /// Fetch the provider's package schema.
    pub async fn get_schema(
        &self,
        version: i32,
        subpackage_name: &str,
        subpackage_version: &str,
    ) -> Result<String, Error> {
        let label = self.label("GetSchema");
        let mut client = self.client.clone();
        match client
            .get_schema(pulumirpc::GetSchemaRequest {
                version,
                subpackage_name: subpackage_name.to_string(),
                subpackage_version: subpackage_version.to_string(),
            })
            .await
        {
            Ok(response) => Ok(response.into_inner().schema),
            Err(status) => Err(Error::rpc(label, status)),
        }
    }

    /// Fetch conversion mapping data, if the provider has any for `key`.
    pub async fn get_mapping(&self, key: &str, provider: &str) -> Result<Option<Mapping>, Error> {
        let label = self.label("GetMapping");
        let mut client = self.client.clone();
        match client
            .get_mapping(pulumirpc::GetMappingRequest {
                key: key.to_string(),
                provider: provider.to_string(),
            })
            .await
        {
            Ok(response) => {
                let r = response.into_inner();
                if r.data.is_empty() && r.provider.is_empty() {
                    Ok(None)
                } else {
                    Ok(Some(Mapping {
                        provider: r.provider,
                        data: r.data,
                    }))
                }
            }
            Err(status) if status.code() == Code::Unimplemented => Ok(None),
            Err(status) => Err(Error::rpc(label, status)),
        }
    }

    /// Enumerate the providers this plugin has mapping data for.
    pub async fn get_mappings(&self, key: &str) -> Result<Vec<String>, Error> {
        let label = self.label("GetMappings");
        let mut client = self.client.clone();
        match client
            .get_mappings(pulumirpc::GetMappingsRequest {
                key: key.to_string(),
            })
            .await
        {
            Ok(response) => Ok(response.into_inner().providers),
            Err(status) if status.code() == Code::Unimplemented => Ok(Vec::new()),
            Err(status) => Err(Error::rpc(label, status)),
        }
    }

    /// Re-parameterize the provider into a different package.
    pub async fn parameterize(
        &self,
        parameters: ParameterizeParameters,
    ) -> Result<(String, String), Error> {
        let label = self.label("Parameterize");
        let parameters = match parameters {
            ParameterizeParameters::Args(args) => parameterize_request::Parameters::Args(
                parameterize_request::ParametersArgs { args },
            ),
            ParameterizeParameters::Value {
                name,
                version,
                value,
            } => parameterize_request::Parameters::Value(parameterize_request::ParametersValue {
                name,
                version,
                value,
            }),
        };
        let mut client = self.client.clone();
        match client
            .parameterize(pulumirpc::ParameterizeRequest {
                parameters: Some(parameters),
            })
            .await
        {
            Ok(response) => {
                let r = response.into_inner();
                Ok((r.name, r.version))
            }
            Err(status) => Err(Error::rpc(label, status)),
        }
    }

    /// Fetch the provider's self-reported version, when it implements
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

    /// Ask the provider to abort in-flight operations. Advisory: errors are
    /// reduced to a debug log, and `Unimplemented` is entirely ignored.
    pub async fn signal_cancellation(&self) {
        let mut client = self.client.clone();
        match client.cancel(Empty {}).await {
            Ok(_) => {}
            Err(status) if status.code() == Code::Unimplemented => {}
            Err(status) => {
                log::debug!("Provider[{}].Cancel failed: {status}", self.pkg);
            }
        }
    }

    /// Synchronously tear the provider down.
    pub async fn close(&self) {
        if let Some(plugin) = &self.plugin {
            plugin.close().await;
        }
    }

    /// Map a failed resource operation, preferring the init-failed detail
    /// when the provider attached one.
    fn resource_error(&self, label: &str, status: tonic::Status) -> Error {
        match status_detail::<pulumirpc::ErrorResourceInitFailed>(&status, "ErrorResourceInitFailed")
        {
            Some(detail) => {
                let opts = self.unmarshal_opts(label, true);
                let properties = detail
                    .properties
                    .as_ref()
                    .and_then(|wire| unmarshal_properties(wire, &opts).ok())
                    .unwrap_or_default();
                let inputs = detail
                    .inputs
                    .as_ref()
                    .and_then(|wire| unmarshal_properties(wire, &opts).ok())
                    .unwrap_or_default();
                Error::ResourceInitFailed(InitError {
                    id: detail.id,
                    properties,
                    inputs,
                    reasons: detail.reasons,
                })
            }
            None => Error::rpc(label.to_string(), status),
        }
    }
}

fn check_failure(f: pulumirpc::CheckFailure) -> CheckFailure {
    CheckFailure {
        property: f.property,
        reason: f.reason,
    }
}

/// Decode a typed message out of a gRPC status' `google.rpc.Status` details.
fn status_detail<M: Message + Default>(status: &tonic::Status, type_name: &str) -> Option<M> {
    let details = pulumi_proto::rpc::Status::decode(status.details()).ok()?;
    details
        .details
        .iter()
        .find(|any| {
            any.type_url
                .rsplit('/')
                .next()
                .is_some_and(|name| name.ends_with(type_name))
        })
        .and_then(|any| M::decode(any.value.as_slice()).ok())
}

/// `CheckConfig`/`DiffConfig` responses that must be treated as
/// `Unimplemented` despite their code. Two long-deployed providers return
/// non-standard codes; see the constants above.
fn is_config_unimplemented(status: &tonic::Status, urn: &Urn) -> bool {
    match status.code() {
        Code::Unimplemented => true,
        Code::Internal => urn.type_token() == NODEJS_DYNAMIC_PROVIDER_TYPE,
        Code::Unknown => {
            urn.type_token() == KUBERNETES_PROVIDER_TYPE
                && status.message().contains("Unimplemented")
        }
        _ => false,
    }
}

fn diff_result_from_rpc(response: pulumirpc::DiffResponse) -> DiffResult {
    let changes = match response.changes() {
        diff_response::DiffChanges::DiffUnknown => DiffChanges::Unknown,
        diff_response::DiffChanges::DiffNone => DiffChanges::None,
        diff_response::DiffChanges::DiffSome => DiffChanges::Some,
    };
    let detailed_diff = if response.has_detailed_diff {
        response
            .detailed_diff
            .iter()
            .map(|(path, diff)| {
                let kind = match diff.kind() {
                    property_diff::Kind::Add => DiffKind::Add,
                    property_diff::Kind::AddReplace => DiffKind::AddReplace,
                    property_diff::Kind::Delete => DiffKind::Delete,
                    property_diff::Kind::DeleteReplace => DiffKind::DeleteReplace,
                    property_diff::Kind::Update => DiffKind::Update,
                    property_diff::Kind::UpdateReplace => DiffKind::UpdateReplace,
                };
                (
                    path.clone(),
                    PropertyDiff {
                        kind,
                        input_diff: diff.input_diff,
                    },
                )
            })
            .collect()
    } else {
        BTreeMap::new()
    };
    DiffResult {
        changes,
        replace_keys: response.replaces.into_iter().map(PropertyKey::new).collect(),
        stable_keys: response.stables.into_iter().map(PropertyKey::new).collect(),
        changed_keys: response.diffs.into_iter().map(PropertyKey::new).collect(),
        detailed_diff,
        delete_before_replace: response.delete_before_replace,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn urn(type_token: &str) -> Urn {
        Urn::new("dev", "proj", None, type_token, "default")
    }

    #[test]
    fn unimplemented_is_always_logically_unimplemented() {
        let status = tonic::Status::unimplemented("nope");
        assert!(is_config_unimplemented(&status, &urn("pulumi:providers:aws")));
    }

    #[test]
    fn nodejs_dynamic_internal_is_unimplemented() {
        let status = tonic::Status::internal("boom");
        assert!(is_config_unimplemented(
            &status,
            &urn("pulumi:providers:pulumi-nodejs")
        ));
        assert!(!is_config_unimplemented(
            &status,
            &urn("pulumi:providers:aws")
        ));
    }

    #[test]
    fn kubernetes_unknown_with_marker_is_unimplemented() {
        let status = tonic::Status::unknown("rpc error: Unimplemented");
        assert!(is_config_unimplemented(
            &status,
            &urn("pulumi:providers:kubernetes")
        ));
        let status = tonic::Status::unknown("something else");
        assert!(!is_config_unimplemented(
            &status,
            &urn("pulumi:providers:kubernetes")
        ));
    }

    #[test]
    fn diff_response_conversion_honors_has_detailed_diff() {
        let response = pulumirpc::DiffResponse {
            replaces: vec!["region".into()],
            stables: vec!["arn".into()],
            delete_before_replace: true,
            changes: diff_response::DiffChanges::DiffSome as i32,
            diffs: vec!["region".into(), "size".into()],
            detailed_diff: [(
                "region".to_string(),
                pulumirpc::PropertyDiff {
                    kind: property_diff::Kind::UpdateReplace as i32,
                    input_diff: false,
                },
            )]
            .into_iter()
            .collect(),
            has_detailed_diff: false,
        };
        let result = diff_result_from_rpc(response);
        assert_eq!(result.changes, DiffChanges::Some);
        assert!(result.detailed_diff.is_empty());
        assert!(result.replace());
        assert!(result.delete_before_replace);
    }
}
