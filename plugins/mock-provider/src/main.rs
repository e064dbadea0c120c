//! A minimal resource provider honoring the plugin child contract: print a
//! port line to stdout, then serve `pulumirpc.ResourceProvider` on it.
//! Resources are held in memory; IDs are sequential. Useful for smoke
//! testing the host's launch, handshake, and teardown paths by hand.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use clap::Parser;
use tokio::net::TcpListener;
use tokio_stream::wrappers::TcpListenerStream;
use tonic::transport::Server;
use tonic::{Request, Response, Status};

use pulumi_proto::pulumirpc::resource_provider_server::{
    ResourceProvider, ResourceProviderServer,
};
use pulumi_proto::pulumirpc::{
    CallRequest, CallResponse, CheckRequest, CheckResponse, ConfigureRequest, ConfigureResponse,
    ConstructRequest, ConstructResponse, CreateRequest, CreateResponse, DeleteRequest,
    DiffRequest, DiffResponse, Empty, GetMappingRequest, GetMappingResponse, GetMappingsRequest,
    GetMappingsResponse, GetSchemaRequest, GetSchemaResponse, InvokeRequest, InvokeResponse,
    ParameterizeRequest, ParameterizeResponse, PluginAttach, PluginInfo,
    ProviderHandshakeRequest, ProviderHandshakeResponse, ReadRequest, ReadResponse,
    UpdateRequest, UpdateResponse,
};

/// The mock resource provider.
#[derive(Debug, Parser)]
struct Cli {
    /// The engine's gRPC address.
    engine_address: Option<String>,

    /// Mirror log output to stderr (injected by the host).
    #[arg(long)]
    logtostderr: bool,

    /// Verbosity level (injected by the host).
    #[arg(short = 'v')]
    verbose: Option<u8>,

    /// Tracing endpoint (injected by the host).
    #[arg(long)]
    tracing: Option<String>,
}

#[derive(Default)]
struct MockProvider {
    next_id: AtomicU64,
    resources: Mutex<HashMap<String, prost_types::Struct>>,
}

type RpcResult<T> = Result<Response<T>, Status>;

#[tonic::async_trait]
impl ResourceProvider for MockProvider {
    async fn handshake(
        &self,
        _request: Request<ProviderHandshakeRequest>,
    ) -> RpcResult<ProviderHandshakeResponse> {
        Ok(Response::new(ProviderHandshakeResponse {
            accept_secrets: true,
            accept_resources: true,
            accept_outputs: true,
            supports_autonaming_configuration: false,
        }))
    }

    async fn parameterize(
        &self,
        _request: Request<ParameterizeRequest>,
    ) -> RpcResult<ParameterizeResponse> {
        Err(Status::unimplemented("Parameterize is not supported"))
    }

    async fn get_schema(&self, _request: Request<GetSchemaRequest>) -> RpcResult<GetSchemaResponse> {
        Ok(Response::new(GetSchemaResponse {
            schema: "{}".to_string(),
        }))
    }

    async fn check_config(&self, request: Request<CheckRequest>) -> RpcResult<CheckResponse> {
        let req = request.into_inner();
        Ok(Response::new(CheckResponse {
            inputs: req.news,
            failures: Vec::new(),
        }))
    }

    async fn diff_config(&self, _request: Request<DiffRequest>) -> RpcResult<DiffResponse> {
        Ok(Response::new(DiffResponse::default()))
    }

    async fn configure(&self, _request: Request<ConfigureRequest>) -> RpcResult<ConfigureResponse> {
        Ok(Response::new(ConfigureResponse {
            accept_secrets: true,
            supports_preview: true,
            accept_resources: true,
            accept_outputs: true,
            supports_autonaming_configuration: false,
        }))
    }

    async fn invoke(&self, request: Request<InvokeRequest>) -> RpcResult<InvokeResponse> {
        let req = request.into_inner();
        Ok(Response::new(InvokeResponse {
            r#return: req.args,
            failures: Vec::new(),
        }))
    }

    type StreamInvokeStream =
        std::pin::Pin<Box<dyn tokio_stream::Stream<Item = Result<InvokeResponse, Status>> + Send>>;

    async fn stream_invoke(
        &self,
        request: Request<InvokeRequest>,
    ) -> RpcResult<Self::StreamInvokeStream> {
        let req = request.into_inner();
        let items = vec![Ok(InvokeResponse {
            r#return: req.args,
            failures: Vec::new(),
        })];
        Ok(Response::new(Box::pin(tokio_stream::iter(items))))
    }

    async fn call(&self, _request: Request<CallRequest>) -> RpcResult<CallResponse> {
        Err(Status::unimplemented("Call is not supported"))
    }

    async fn check(&self, request: Request<CheckRequest>) -> RpcResult<CheckResponse> {
        let req = request.into_inner();
        Ok(Response::new(CheckResponse {
            inputs: req.news,
            failures: Vec::new(),
        }))
    }

    async fn diff(&self, _request: Request<DiffRequest>) -> RpcResult<DiffResponse> {
        Ok(Response::new(DiffResponse::default()))
    }

    async fn create(&self, request: Request<CreateRequest>) -> RpcResult<CreateResponse> {
        let req = request.into_inner();
        let id = format!("mock-{}", self.next_id.fetch_add(1, Ordering::SeqCst));
        let properties = req.properties.unwrap_or_default();
        self.resources
            .lock()
            .unwrap()
            .insert(id.clone(), properties.clone());
        log::info!("created {id}");
        Ok(Response::new(CreateResponse {
            id,
            properties: Some(properties),
        }))
    }

    async fn read(&self, request: Request<ReadRequest>) -> RpcResult<ReadResponse> {
        let req = request.into_inner();
        let resources = self.resources.lock().unwrap();
        match resources.get(&req.id) {
            Some(properties) => Ok(Response::new(ReadResponse {
                id: req.id,
                properties: Some(properties.clone()),
                inputs: req.inputs,
            })),
            None => Err(Status::not_found(format!("no resource '{}'", req.id))),
        }
    }

    async fn update(&self, request: Request<UpdateRequest>) -> RpcResult<UpdateResponse> {
        let req = request.into_inner();
        let properties = req.news.unwrap_or_default();
        self.resources
            .lock()
            .unwrap()
            .insert(req.id, properties.clone());
        Ok(Response::new(UpdateResponse {
            properties: Some(properties),
        }))
    }

    async fn delete(&self, request: Request<DeleteRequest>) -> RpcResult<Empty> {
        let req = request.into_inner();
        self.resources.lock().unwrap().remove(&req.id);
        log::info!("deleted {}", req.id);
        Ok(Response::new(Empty {}))
    }

    async fn construct(&self, _request: Request<ConstructRequest>) -> RpcResult<ConstructResponse> {
        Err(Status::unimplemented("Construct is not supported"))
    }

    async fn cancel(&self, _request: Request<Empty>) -> RpcResult<Empty> {
        Ok(Response::new(Empty {}))
    }

    async fn get_plugin_info(&self, _request: Request<Empty>) -> RpcResult<PluginInfo> {
        Ok(Response::new(PluginInfo {
            version: env!("CARGO_PKG_VERSION").to_string(),
        }))
    }

    async fn attach(&self, _request: Request<PluginAttach>) -> RpcResult<Empty> {
        Ok(Response::new(Empty {}))
    }

    async fn get_mapping(&self, _request: Request<GetMappingRequest>) -> RpcResult<GetMappingResponse> {
        Ok(Response::new(GetMappingResponse {
            provider: String::new(),
            data: Vec::new(),
        }))
    }

    async fn get_mappings(
        &self,
        _request: Request<GetMappingsRequest>,
    ) -> RpcResult<GetMappingsResponse> {
        Ok(Response::new(GetMappingsResponse {
            providers: Vec::new(),
        }))
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("warn")).init();
    if let Some(engine) = &cli.engine_address {
        log::debug!("engine at {engine}");
    }

    let listener = TcpListener::bind("127.0.0.1:0").await?;
    let port = listener.local_addr()?.port();

    // The child contract: the port line goes out before anything else.
    println!("{port}");

    Server::builder()
        .add_service(ResourceProviderServer::new(MockProvider::default()))
        .serve_with_incoming(TcpListenerStream::new(listener))
        .await?;
    Ok(())
}
