//! Generated gRPC bindings for the Pulumi plugin protocol.
//!
//! The `.proto` sources live under `proto/` and are compiled by `tonic-build`
//! at build time; this crate re-exports the generated modules. Property bags
//! travel as `google.protobuf.Struct` and surface here as
//! [`prost_types::Struct`].

/// The plugin protocol: providers, analyzers, language runtimes and the
/// engine's own callback surface.
pub mod pulumirpc {
    #![allow(clippy::doc_lazy_continuation, clippy::doc_overindented_list_items)]
    tonic::include_proto!("pulumirpc");
}

/// The standard gRPC health-checking protocol, used by the host to decide
/// whether a plugin died or shut down cleanly.
pub mod health {
    tonic::include_proto!("grpc.health.v1");
}

/// `google.rpc.Status`, the carrier for structured error details.
pub mod rpc {
    tonic::include_proto!("google.rpc");
}
