//! The typed facade over the policy-analyzer RPC surface.
//!
//! Analyzers come up two ways: modern policy packs run through a language
//! runtime's `RunPlugin`, while nodejs and python packs still boot through a
//! dedicated shim binary that takes the engine address and the pack
//! directory as positional arguments, with the pack's configuration passed
//! through the environment. [`shim_invocation`] builds that legacy command
//! line; the host picks the mode.

use std::collections::BTreeMap;
use std::path::Path;

use tonic::transport::Channel;
use tonic::Code;

use pulumi_proto::pulumirpc::analyzer_client::AnalyzerClient as AnalyzerGrpcClient;
use pulumi_proto::pulumirpc::{self, AnalyzerHandshakeRequest, Empty};

use crate::error::Error;
use crate::json;
use crate::plugin::{self, PluginProcess};
use crate::property::marshal::{marshal_properties, unmarshal_properties, MarshalOptions};
use crate::property::{PropertyMap, PropertyValue};
use crate::urn::Urn;

/// How strictly a policy is enforced.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum EnforcementLevel {
    #[default]
    Advisory,
    Mandatory,
    Disabled,
    Remediate,
}

impl EnforcementLevel {
    fn from_rpc(level: pulumirpc::EnforcementLevel) -> Self {
        match level {
            pulumirpc::EnforcementLevel::Advisory => EnforcementLevel::Advisory,
            pulumirpc::EnforcementLevel::Mandatory => EnforcementLevel::Mandatory,
            pulumirpc::EnforcementLevel::Disabled => EnforcementLevel::Disabled,
            pulumirpc::EnforcementLevel::Remediate => EnforcementLevel::Remediate,
        }
    }

    fn to_rpc(self) -> pulumirpc::EnforcementLevel {
        match self {
            EnforcementLevel::Advisory => pulumirpc::EnforcementLevel::Advisory,
            EnforcementLevel::Mandatory => pulumirpc::EnforcementLevel::Mandatory,
            EnforcementLevel::Disabled => pulumirpc::EnforcementLevel::Disabled,
            EnforcementLevel::Remediate => pulumirpc::EnforcementLevel::Remediate,
        }
    }
}

/// A resource handed to the analyzer, with the options policies may inspect.
#[derive(Debug, Clone, Default)]
pub struct AnalyzerResource {
    pub type_token: String,
    pub properties: PropertyMap,
    pub urn: Option<Urn>,
    pub name: String,
    pub parent: Option<Urn>,
    pub dependencies: Vec<Urn>,
    pub protect: bool,
    pub ignore_changes: Vec<String>,
    pub additional_secret_outputs: Vec<String>,
    pub provider: Option<AnalyzerProviderResource>,
}

/// The provider managing a resource under analysis.
#[derive(Debug, Clone, Default)]
pub struct AnalyzerProviderResource {
    pub type_token: String,
    pub properties: PropertyMap,
    pub urn: Option<Urn>,
    pub name: String,
}

/// A policy violation reported by the analyzer.
#[derive(Debug, Clone)]
pub struct AnalyzeDiagnostic {
    pub policy_name: String,
    pub policy_pack_name: String,
    pub policy_pack_version: String,
    pub description: String,
    pub message: String,
    pub tags: Vec<String>,
    pub enforcement_level: EnforcementLevel,
    pub urn: Option<Urn>,
}

/// A property transformation applied by a remediation policy.
#[derive(Debug, Clone)]
pub struct Remediation {
    pub policy_name: String,
    pub policy_pack_name: String,
    pub policy_pack_version: String,
    pub description: String,
    pub properties: PropertyMap,
    pub diagnostic: String,
}

/// The JSON-schema-shaped configuration schema of a policy.
#[derive(Debug, Clone, Default)]
pub struct PolicyConfigSchema {
    pub properties: BTreeMap<String, serde_json::Value>,
    pub required: Vec<String>,
}

/// Metadata about one policy in a pack.
#[derive(Debug, Clone)]
pub struct PolicyInfo {
    pub name: String,
    pub display_name: String,
    pub description: String,
    pub message: String,
    pub enforcement_level: EnforcementLevel,
    pub config_schema: Option<PolicyConfigSchema>,
}

/// Metadata about the policy pack an analyzer serves.
#[derive(Debug, Clone)]
pub struct AnalyzerInfo {
    pub name: String,
    pub display_name: String,
    pub version: String,
    pub supports_config: bool,
    pub policies: Vec<PolicyInfo>,
    pub initial_config: BTreeMap<String, AnalyzerPolicyConfig>,
}

/// The configuration of a single policy.
#[derive(Debug, Clone, Default)]
pub struct AnalyzerPolicyConfig {
    pub enforcement_level: EnforcementLevel,
    pub properties: PropertyMap,
}

/// Per-stack options an analyzer is configured with before analysis.
#[derive(Debug, Clone, Default)]
pub struct PolicyAnalyzerOptions {
    pub organization: String,
    pub project: String,
    pub stack: String,
    pub dry_run: bool,
    pub config: BTreeMap<String, PropertyValue>,
}

/// The command line and environment for booting a policy pack through the
/// legacy shim analyzer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShimInvocation {
    /// The short name of the shim analyzer plugin to resolve (e.g.
    /// `policy-python`).
    pub plugin_name: String,
    pub args: Vec<String>,
    pub env: Vec<(String, String)>,
}

/// True if the runtime boots policy packs through the legacy shim rather
/// than its language runtime's `RunPlugin`.
pub fn runtime_uses_shim(runtime: &str) -> bool {
    matches!(runtime, "nodejs" | "python")
}

/// Build the legacy shim invocation for a policy pack.
pub fn shim_invocation(
    runtime: &str,
    engine_addr: &str,
    opts: &PolicyAnalyzerOptions,
    runtime_options: &BTreeMap<String, serde_json::Value>,
) -> ShimInvocation {
    let plugin_name = if runtime == "nodejs" {
        "policy".to_string()
    } else {
        format!("policy-{runtime}")
    };

    let mut args = vec![engine_addr.to_string(), ".".to_string()];
    for (key, value) in runtime_options {
        let rendered = match value {
            serde_json::Value::String(s) => s.clone(),
            other => other.to_string(),
        };
        args.push(format!("-{key}={rendered}"));
    }

    let mut env = Vec::new();
    if !opts.config.is_empty() {
        let config: serde_json::Map<String, serde_json::Value> = opts
            .config
            .iter()
            .map(|(k, v)| (k.clone(), v.to_json()))
            .collect();
        env.push((
            "PULUMI_CONFIG".to_string(),
            serde_json::Value::Object(config).to_string(),
        ));
    }
    let dry_run = if opts.dry_run { "true" } else { "false" };
    if runtime == "nodejs" {
        env.push(("PULUMI_NODEJS_ORGANIZATION".to_string(), opts.organization.clone()));
        env.push(("PULUMI_NODEJS_PROJECT".to_string(), opts.project.clone()));
        env.push(("PULUMI_NODEJS_STACK".to_string(), opts.stack.clone()));
        env.push(("PULUMI_NODEJS_DRY_RUN".to_string(), dry_run.to_string()));
    }
    env.push(("PULUMI_ORGANIZATION".to_string(), opts.organization.clone()));
    env.push(("PULUMI_PROJECT".to_string(), opts.project.clone()));
    env.push(("PULUMI_STACK".to_string(), opts.stack.clone()));
    env.push(("PULUMI_DRY_RUN".to_string(), dry_run.to_string()));

    ShimInvocation {
        plugin_name,
        args,
        env,
    }
}

/// A connected policy analyzer.
pub struct AnalyzerClient {
    name: String,
    client: AnalyzerGrpcClient<Channel>,
    plugin: Option<PluginProcess>,
    /// The version declared in `PulumiPolicy.yaml`, which overrides whatever
    /// the analyzer reports about itself.
    version_override: Option<String>,
}

impl AnalyzerClient {
    /// Wrap an established plugin process, performing the handshake.
    pub async fn new(
        plugin: PluginProcess,
        name: &str,
        engine_addr: &str,
        pack_directory: Option<&Path>,
        version_override: Option<String>,
    ) -> Result<Self, Error> {
        let channel = plugin.channel();
        let result = plugin::handshake_retry(|| {
            let mut client = AnalyzerGrpcClient::new(channel.clone());
            let request = AnalyzerHandshakeRequest {
                engine_address: engine_addr.to_string(),
                root_directory: pack_directory.map(|p| p.display().to_string()),
                program_directory: pack_directory.map(|p| p.display().to_string()),
            };
            async move { client.handshake(request).await }
        })
        .await;
        match result {
            Ok(_) => {}
            // Older analyzers predate the handshake; carry on.
            Err(status) if status.code() == Code::Unimplemented => {}
            Err(status) => {
                return Err(Error::Handshake {
                    plugin: name.to_string(),
                    status: Box::new(status),
                });
            }
        }
        Ok(AnalyzerClient {
            name: name.to_string(),
            client: AnalyzerGrpcClient::new(channel)
                .max_decoding_message_size(crate::provider::MAX_RPC_MESSAGE_SIZE)
                .max_encoding_message_size(crate::provider::MAX_RPC_MESSAGE_SIZE),
            plugin: Some(plugin),
            version_override,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    fn label(&self, method: &str) -> String {
        format!("Analyzer[{}].{}", self.name, method)
    }

    fn marshal_opts(&self, label: &str) -> MarshalOptions {
        MarshalOptions {
            label: label.to_string(),
            keep_unknowns: true,
            skip_internal_keys: true,
            ..Default::default()
        }
    }

    fn resource_to_rpc(
        &self,
        resource: &AnalyzerResource,
        opts: &MarshalOptions,
    ) -> Result<pulumirpc::AnalyzeRequest, Error> {
        Ok(pulumirpc::AnalyzeRequest {
            r#type: resource.type_token.clone(),
            properties: Some(marshal_properties(&resource.properties, opts)?),
            urn: resource.urn.as_ref().map(|u| u.to_string()).unwrap_or_default(),
            name: resource.name.clone(),
            options: Some(pulumirpc::AnalyzerResourceOptions {
                protect: resource.protect,
                ignore_changes: resource.ignore_changes.clone(),
                delete_before_replace: false,
                delete_before_replace_defined: false,
                additional_secret_outputs: resource.additional_secret_outputs.clone(),
                aliases: Vec::new(),
                custom_timeouts: None,
                parent: resource
                    .parent
                    .as_ref()
                    .map(|u| u.to_string())
                    .unwrap_or_default(),
            }),
            provider: resource
                .provider
                .as_ref()
                .map(|p| self.provider_to_rpc(p, opts))
                .transpose()?,
        })
    }

    fn provider_to_rpc(
        &self,
        provider: &AnalyzerProviderResource,
        opts: &MarshalOptions,
    ) -> Result<pulumirpc::AnalyzerProviderResource, Error> {
        Ok(pulumirpc::AnalyzerProviderResource {
            r#type: provider.type_token.clone(),
            properties: Some(marshal_properties(&provider.properties, opts)?),
            urn: provider.urn.as_ref().map(|u| u.to_string()).unwrap_or_default(),
            name: provider.name.clone(),
        })
    }

    fn diagnostic_from_rpc(&self, d: pulumirpc::AnalyzeDiagnostic) -> AnalyzeDiagnostic {
        let enforcement_level = EnforcementLevel::from_rpc(d.enforcement_level());
        AnalyzeDiagnostic {
            policy_name: d.policy_name,
            policy_pack_name: d.policy_pack_name,
            policy_pack_version: self
                .version_override
                .clone()
                .unwrap_or(d.policy_pack_version),
            description: d.description,
            message: d.message,
            tags: d.tags,
            enforcement_level,
            urn: Urn::parse(&d.urn).ok(),
        }
    }

    /// Analyze a single resource prior to registration.
    pub async fn analyze(
        &self,
        resource: &AnalyzerResource,
    ) -> Result<Vec<AnalyzeDiagnostic>, Error> {
        let label = self.label("Analyze");
        let opts = self.marshal_opts(&label);
        let request = self.resource_to_rpc(resource, &opts)?;
        let mut client = self.client.clone();
        match client.analyze(request).await {
            Ok(response) => Ok(response
                .into_inner()
                .diagnostics
                .into_iter()
                .map(|d| self.diagnostic_from_rpc(d))
                .collect()),
            Err(status) => Err(Error::rpc(label, status)),
        }
    }

    /// Analyze the whole stack at the end of a deployment. Analyzers that do
    /// not implement stack analysis report nothing.
    pub async fn analyze_stack(
        &self,
        resources: &[AnalyzerResource],
    ) -> Result<Vec<AnalyzeDiagnostic>, Error> {
        let label = self.label("AnalyzeStack");
        let opts = self.marshal_opts(&label);
        let mut rpc_resources = Vec::with_capacity(resources.len());
        for resource in resources {
            let base = self.resource_to_rpc(resource, &opts)?;
            rpc_resources.push(pulumirpc::AnalyzerResource {
                r#type: base.r#type,
                properties: base.properties,
                urn: base.urn,
                name: base.name,
                options: base.options,
                provider: base.provider,
                parent: resource
                    .parent
                    .as_ref()
                    .map(|u| u.to_string())
                    .unwrap_or_default(),
                dependencies: resource.dependencies.iter().map(|u| u.to_string()).collect(),
                property_dependencies: std::collections::HashMap::new(),
            });
        }
        let mut client = self.client.clone();
        match client
            .analyze_stack(pulumirpc::AnalyzeStackRequest {
                resources: rpc_resources,
            })
            .await
        {
            Ok(response) => Ok(response
                .into_inner()
                .diagnostics
                .into_iter()
                .map(|d| self.diagnostic_from_rpc(d))
                .collect()),
            Err(status) if status.code() == Code::Unimplemented => Ok(Vec::new()),
            Err(status) => Err(Error::rpc(label, status)),
        }
    }

    /// Transform a resource's properties through the pack's remediation
    /// policies. Analyzers without remediations report nothing.
    pub async fn remediate(&self, resource: &AnalyzerResource) -> Result<Vec<Remediation>, Error> {
        let label = self.label("Remediate");
        let opts = self.marshal_opts(&label);
        let request = self.resource_to_rpc(resource, &opts)?;
        let mut client = self.client.clone();
        match client.remediate(request).await {
            Ok(response) => {
                let unmarshal = MarshalOptions {
                    label: label.clone(),
                    keep_unknowns: true,
                    keep_secrets: true,
                    ..Default::default()
                };
                let mut remediations = Vec::new();
                for r in response.into_inner().remediations {
                    remediations.push(Remediation {
                        policy_name: r.policy_name,
                        policy_pack_name: r.policy_pack_name,
                        policy_pack_version: self
                            .version_override
                            .clone()
                            .unwrap_or(r.policy_pack_version),
                        description: r.description,
                        properties: match &r.properties {
                            Some(wire) => unmarshal_properties(wire, &unmarshal)?,
                            None => PropertyMap::new(),
                        },
                        diagnostic: r.diagnostic,
                    });
                }
                Ok(remediations)
            }
            Err(status) if status.code() == Code::Unimplemented => Ok(Vec::new()),
            Err(status) => Err(Error::rpc(label, status)),
        }
    }

    /// Configure each policy in the pack.
    pub async fn configure(
        &self,
        policy_config: &BTreeMap<String, AnalyzerPolicyConfig>,
    ) -> Result<(), Error> {
        let label = self.label("Configure");
        let opts = self.marshal_opts(&label);
        let mut config = std::collections::HashMap::new();
        for (policy, c) in policy_config {
            config.insert(
                policy.clone(),
                pulumirpc::PolicyConfig {
                    enforcement_level: c.enforcement_level.to_rpc() as i32,
                    properties: Some(marshal_properties(&c.properties, &opts)?),
                },
            );
        }
        let mut client = self.client.clone();
        match client
            .configure(pulumirpc::ConfigureAnalyzerRequest {
                policy_config: config,
            })
            .await
        {
            Ok(_) => Ok(()),
            Err(status) => Err(Error::rpc(label, status)),
        }
    }

    /// Configure the analyzer with per-stack options. Analyzers that predate
    /// stack configuration ignore it.
    pub async fn configure_stack(&self, opts: &PolicyAnalyzerOptions) -> Result<(), Error> {
        let label = self.label("ConfigureStack");
        let config = opts
            .config
            .iter()
            .map(|(k, v)| {
                let text = match v {
                    PropertyValue::String(s) => s.clone(),
                    other => other.to_json().to_string(),
                };
                (k.clone(), text)
            })
            .collect();
        let mut client = self.client.clone();
        match client
            .configure_stack(pulumirpc::AnalyzerStackConfigureRequest {
                stack: opts.stack.clone(),
                project: opts.project.clone(),
                organization: opts.organization.clone(),
                dry_run: opts.dry_run,
                config,
                config_secret_keys: Vec::new(),
            })
            .await
        {
            Ok(_) => Ok(()),
            Err(status) if status.code() == Code::Unimplemented => Ok(()),
            Err(status) => Err(Error::rpc(label, status)),
        }
    }

    /// Fetch the pack's metadata. A standardized `enforcementLevel` property
    /// is injected into every supplied policy config schema so packs need
    /// not declare it themselves.
    pub async fn analyzer_info(&self) -> Result<AnalyzerInfo, Error> {
        let label = self.label("GetAnalyzerInfo");
        let mut client = self.client.clone();
        let info = match client.get_analyzer_info(Empty {}).await {
            Ok(response) => response.into_inner(),
            Err(status) => return Err(Error::rpc(label, status)),
        };

        let unmarshal = MarshalOptions {
            label: label.clone(),
            keep_secrets: true,
            ..Default::default()
        };
        let mut policies = Vec::with_capacity(info.policies.len());
        for p in info.policies {
            let enforcement_level = EnforcementLevel::from_rpc(p.enforcement_level());
            let config_schema = p.config_schema.map(|schema| {
                let mut properties = schema
                    .properties
                    .as_ref()
                    .map(json::struct_to_json_map)
                    .unwrap_or_default();
                properties
                    .entry("enforcementLevel".to_string())
                    .or_insert_with(enforcement_level_schema);
                PolicyConfigSchema {
                    properties,
                    required: schema.required,
                }
            });
            policies.push(PolicyInfo {
                name: p.name,
                display_name: p.display_name,
                description: p.description,
                message: p.message,
                enforcement_level,
                config_schema,
            });
        }

        let mut initial_config = BTreeMap::new();
        for (policy, c) in info.initial_config {
            initial_config.insert(
                policy,
                AnalyzerPolicyConfig {
                    enforcement_level: EnforcementLevel::from_rpc(c.enforcement_level()),
                    properties: match &c.properties {
                        Some(wire) => unmarshal_properties(wire, &unmarshal)?,
                        None => PropertyMap::new(),
                    },
                },
            );
        }

        Ok(AnalyzerInfo {
            name: info.name,
            display_name: info.display_name,
            version: self.version_override.clone().unwrap_or(info.version),
            supports_config: info.supports_config,
            policies,
            initial_config,
        })
    }

    /// Fetch the analyzer's self-reported version, when it implements
    /// `GetPluginInfo`.
    pub async fn plugin_info(&self) -> Result<Option<semver::Version>, Error> {
        let label = self.label("GetPluginInfo");
        let mut client = self.client.clone();
        match client.get_plugin_info(Empty {}).await {
            Ok(response) => Ok(semver::Version::parse(&response.into_inner().version).ok()),
            Err(status) if status.code() == Code::Unimplemented => Ok(None),
            Err(status) => Err(Error::rpc(label, status)),
        }
    }

    /// Ask the analyzer to abort in-flight analysis. Advisory.
    pub async fn signal_cancellation(&self) {
        let mut client = self.client.clone();
        match client.cancel(Empty {}).await {
            Ok(_) => {}
            Err(status) if status.code() == Code::Unimplemented => {}
            Err(status) => {
                log::debug!("Analyzer[{}].Cancel failed: {status}", self.name);
            }
        }
    }

    /// Synchronously tear the analyzer down.
    pub async fn close(&self) {
        if let Some(plugin) = &self.plugin {
            plugin.close().await;
        }
    }
}

fn enforcement_level_schema() -> serde_json::Value {
    serde_json::json!({
        "type": "string",
        "enum": ["advisory", "mandatory", "remediate", "disabled"],
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn opts() -> PolicyAnalyzerOptions {
        PolicyAnalyzerOptions {
            organization: "org".into(),
            project: "p".into(),
            stack: "s".into(),
            dry_run: true,
            config: [(
                "p:a".to_string(),
                PropertyValue::string("1"),
            )]
            .into_iter()
            .collect(),
        }
    }

    #[test]
    fn python_shim_invocation_matches_the_contract() {
        let invocation = shim_invocation("python", "127.0.0.1:4000", &opts(), &BTreeMap::new());
        assert_eq!(invocation.plugin_name, "policy-python");
        assert_eq!(invocation.args, vec!["127.0.0.1:4000".to_string(), ".".to_string()]);
        let env: BTreeMap<_, _> = invocation.env.into_iter().collect();
        assert_eq!(env.get("PULUMI_CONFIG").map(String::as_str), Some(r#"{"p:a":"1"}"#));
        assert_eq!(env.get("PULUMI_ORGANIZATION").map(String::as_str), Some("org"));
        assert_eq!(env.get("PULUMI_PROJECT").map(String::as_str), Some("p"));
        assert_eq!(env.get("PULUMI_STACK").map(String::as_str), Some("s"));
        assert_eq!(env.get("PULUMI_DRY_RUN").map(String::as_str), Some("true"));
        assert!(!env.contains_key("PULUMI_NODEJS_PROJECT"));
    }

    #[test]
    fn nodejs_shim_gets_prefixed_variables_too() {
        let invocation = shim_invocation("nodejs", "127.0.0.1:4000", &opts(), &BTreeMap::new());
        assert_eq!(invocation.plugin_name, "policy");
        let env: BTreeMap<_, _> = invocation.env.into_iter().collect();
        assert_eq!(env.get("PULUMI_NODEJS_PROJECT").map(String::as_str), Some("p"));
        assert_eq!(env.get("PULUMI_NODEJS_DRY_RUN").map(String::as_str), Some("true"));
        assert_eq!(env.get("PULUMI_PROJECT").map(String::as_str), Some("p"));
    }

    #[test]
    fn runtime_options_become_flags_after_the_positionals() {
        let runtime_options: BTreeMap<String, serde_json::Value> =
            [("virtualenv".to_string(), serde_json::Value::String("venv".into()))]
                .into_iter()
                .collect();
        let invocation =
            shim_invocation("python", "127.0.0.1:4000", &opts(), &runtime_options);
        assert_eq!(
            invocation.args,
            vec![
                "127.0.0.1:4000".to_string(),
                ".".to_string(),
                "-virtualenv=venv".to_string()
            ]
        );
    }

    #[test]
    fn shim_selection() {
        assert!(runtime_uses_shim("nodejs"));
        assert!(runtime_uses_shim("python"));
        assert!(!runtime_uses_shim("go"));
        assert!(!runtime_uses_shim("dotnet"));
    }
}
