//! The host's error taxonomy.
//!
//! Errors are values: every failure class a caller may want to react to is a
//! distinct variant, and context (the method label, the plugin name) is
//! attached by construction rather than recovered by string matching. The
//! one deliberate exception is the pair of legacy provider error-code quirks
//! handled in the provider client, which exist to keep long-deployed plugins
//! working.

use std::time::Duration;

use thiserror::Error;

use crate::property::marshal::MarshalError;
use crate::property::PropertyMap;
use crate::workspace::PluginKind;

/// The result status of a resource operation, mirroring what the step
/// executor records alongside any error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResultStatus {
    /// The operation completed, or failed in a way that left the resource in
    /// a known state.
    Ok,
    /// The operation failed and the state of the resource is unknown.
    Unknown,
    /// The resource was created but did not initialize; live state is
    /// attached to the error.
    PartialFailure,
}

/// A resource was created but failed to initialize. Carries the live state
/// and inputs reported by the provider so the engine can checkpoint them as
/// if the operation had succeeded.
#[derive(Debug, Error)]
#[error("resource '{id}' was created but failed to initialize: {}", .reasons.join("; "))]
pub struct InitError {
    /// The ID assigned to the resource.
    pub id: String,
    /// The live output state of the resource.
    pub properties: PropertyMap,
    /// The live input properties of the resource.
    pub inputs: PropertyMap,
    /// The reasons initialization failed.
    pub reasons: Vec<String>,
}

/// A configuration key the provider reported missing, with its description.
#[derive(Debug, Clone)]
pub struct MissingKey {
    pub name: String,
    pub description: String,
}

/// Errors produced by the plugin host.
#[derive(Debug, Error)]
pub enum Error {
    /// Path resolution failed: the plugin is not installed.
    #[error("no {kind} plugin 'pulumi-{kind}-{name}' found{}", version_suffix(.version))]
    PluginNotFound {
        kind: PluginKind,
        name: String,
        version: Option<semver::Version>,
    },

    /// The policy pack's language SDK is not installed.
    #[error(
        "it looks like the policy pack's dependencies are not installed; \
         try running `npm install` or `yarn install` in {dir}"
    )]
    PolicyPackSdkMissing { dir: String },

    /// The plugin spawned but could not be brought to a usable state.
    #[error("failed to launch plugin {plugin}: {reason}")]
    Launch { plugin: String, reason: String },

    /// The plugin's gRPC endpoint never became ready.
    #[error(
        "plugin {plugin} did not begin responding to RPC connections after {}s",
        .timeout.as_secs()
    )]
    DialTimeout { plugin: String, timeout: Duration },

    /// The first RPC after dial failed with something other than
    /// `Unimplemented`.
    #[error("handshake with plugin {plugin} failed: {status}")]
    Handshake {
        plugin: String,
        status: Box<tonic::Status>,
    },

    /// The codec rejected a value.
    #[error(transparent)]
    Marshal(#[from] MarshalError),

    /// The provider cannot compute a diff; treated as a warning-level signal
    /// by callers, not a failure.
    #[error("{reason}")]
    DiffUnavailable { reason: String },

    /// A resource was created but failed to initialize.
    #[error(transparent)]
    ResourceInitFailed(#[from] InitError),

    /// The provider reported structurally missing configuration.
    #[error("{}", missing_keys_message(.keys))]
    ConfigureMissingKeys { keys: Vec<MissingKey> },

    /// Configuration of the provider failed; operations gated on it inherit
    /// this message.
    #[error("provider configuration failed: {0}")]
    ConfigureFailed(String),

    /// The plugin does not implement a capability the operation requires.
    #[error("plugin {plugin} does not support {feature}")]
    Unsupported { plugin: String, feature: String },

    /// A gRPC status propagated from the plugin, wrapped with the method
    /// label.
    #[error("{label}: {status}")]
    Rpc {
        label: String,
        status: Box<tonic::Status>,
    },

    /// The host is shutting down; no new plugins may be loaded.
    #[error("the plugin host is shutting down")]
    HostShuttingDown,

    /// Several accumulated errors.
    #[error("{}", .0.iter().map(ToString::to_string).collect::<Vec<_>>().join("\n"))]
    Aggregate(Vec<Error>),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Transport(#[from] tonic::transport::Error),
}

impl Error {
    /// Wrap a gRPC status with the label of the method that produced it.
    pub fn rpc(label: impl Into<String>, status: tonic::Status) -> Self {
        Error::Rpc {
            label: label.into(),
            status: Box::new(status),
        }
    }

    /// The result status an operation failing with this error leaves the
    /// resource in: `Internal`, `DataLoss` and `Unknown` codes mean the
    /// resource state is unknown; an init failure is a partial failure; any
    /// other failure left the resource in a known state.
    pub fn result_status(&self) -> ResultStatus {
        match self {
            Error::ResourceInitFailed(_) => ResultStatus::PartialFailure,
            Error::Rpc { status, .. } => match status.code() {
                tonic::Code::Internal | tonic::Code::DataLoss | tonic::Code::Unknown => {
                    ResultStatus::Unknown
                }
                _ => ResultStatus::Ok,
            },
            _ => ResultStatus::Ok,
        }
    }
}

fn version_suffix(version: &Option<semver::Version>) -> String {
    match version {
        Some(v) => format!(" at version v{v}"),
        None => String::new(),
    }
}

fn missing_keys_message(keys: &[MissingKey]) -> String {
    let mut msg = String::from("provider configuration is missing required keys:");
    for key in keys {
        msg.push_str(&format!(
            "\n    - {}: {} (set it with `pulumi config set {} <value>`)",
            key.name, key.description, key.name
        ));
    }
    msg
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rpc_status_mapping() {
        for (code, status) in [
            (tonic::Code::Internal, ResultStatus::Unknown),
            (tonic::Code::DataLoss, ResultStatus::Unknown),
            (tonic::Code::Unknown, ResultStatus::Unknown),
            (tonic::Code::InvalidArgument, ResultStatus::Ok),
            (tonic::Code::FailedPrecondition, ResultStatus::Ok),
        ] {
            let err = Error::rpc("Provider[test].Create", tonic::Status::new(code, "boom"));
            assert_eq!(err.result_status(), status);
        }
    }

    #[test]
    fn init_error_is_partial_failure() {
        let err = Error::from(InitError {
            id: "i-123".into(),
            properties: PropertyMap::new(),
            inputs: PropertyMap::new(),
            reasons: vec!["waiting for DNS".into(), "readiness check failed".into()],
        });
        assert_eq!(err.result_status(), ResultStatus::PartialFailure);
        let msg = err.to_string();
        assert!(msg.contains("waiting for DNS"));
        assert!(msg.contains("readiness check failed"));
    }

    #[test]
    fn missing_keys_name_remediation() {
        let err = Error::ConfigureMissingKeys {
            keys: vec![MissingKey {
                name: "aws:region".into(),
                description: "the AWS region".into(),
            }],
        };
        let msg = err.to_string();
        assert!(msg.contains("aws:region"));
        assert!(msg.contains("pulumi config set aws:region"));
    }
}
