fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Use the vendored protoc unless the environment already provides one.
    if std::env::var_os("PROTOC").is_none() {
        std::env::set_var("PROTOC", protoc_bin_vendored::protoc_bin_path()?);
        std::env::set_var("PROTOC_INCLUDE", protoc_bin_vendored::include_path()?);
    }

    tonic_build::configure()
        .build_client(true)
        .build_server(true)
        .compile_protos(
            &[
                "proto/pulumirpc/plugin.proto",
                "proto/pulumirpc/provider.proto",
                "proto/pulumirpc/analyzer.proto",
                "proto/pulumirpc/language.proto",
                "proto/pulumirpc/engine.proto",
                "proto/pulumirpc/resource.proto",
                "proto/google/rpc/status.proto",
                "proto/grpc/health/v1/health.proto",
            ],
            &["proto"],
        )?;
    Ok(())
}
