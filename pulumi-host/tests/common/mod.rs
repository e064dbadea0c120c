//! A scriptable in-process resource provider for client tests.
#![allow(dead_code)]

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};

use prost::Message;
use tokio::net::TcpListener;
use tokio_stream::wrappers::TcpListenerStream;
use tonic::transport::Server;
use tonic::{Code, Request, Response, Status};

use pulumi_proto::pulumirpc::language_runtime_server::{LanguageRuntime, LanguageRuntimeServer};
use pulumi_proto::pulumirpc::resource_provider_server::{
    ResourceProvider, ResourceProviderServer,
};
use pulumi_proto::pulumirpc::{
    run_plugin_response, AboutRequest, AboutResponse, CallRequest, CallResponse, CheckRequest,
    CheckResponse, ConfigureRequest, ConfigureResponse, ConstructRequest, ConstructResponse,
    CreateRequest, CreateResponse, DeleteRequest, DiffRequest, DiffResponse, Empty,
    ErrorResourceInitFailed, GeneratePackageRequest, GeneratePackageResponse,
    GenerateProgramRequest, GenerateProgramResponse, GenerateProjectRequest,
    GenerateProjectResponse, GetMappingRequest, GetMappingResponse, GetMappingsRequest,
    GetMappingsResponse, GetProgramDependenciesRequest, GetProgramDependenciesResponse,
    GetRequiredPluginsRequest, GetRequiredPluginsResponse, GetSchemaRequest, GetSchemaResponse,
    InstallDependenciesRequest, InstallDependenciesResponse, InvokeRequest, InvokeResponse,
    LanguageHandshakeRequest, LanguageHandshakeResponse, PackRequest, PackResponse,
    ParameterizeRequest, ParameterizeResponse, PluginAttach, PluginInfo,
    ProviderHandshakeRequest, ProviderHandshakeResponse, ReadRequest, ReadResponse,
    RunPluginRequest, RunPluginResponse, RunRequest, RunResponse, RuntimeOptionsRequest,
    RuntimeOptionsResponse, UpdateRequest, UpdateResponse,
};

/// What `Create` should do.
#[derive(Debug, Clone, Default)]
pub enum CreateBehavior {
    /// Echo the inputs back as outputs with a fixed ID.
    #[default]
    Echo,
    /// Fail with an `ErrorResourceInitFailed` status detail.
    InitFail {
        id: String,
        properties: BTreeMap<String, String>,
        inputs: BTreeMap<String, String>,
        reasons: Vec<String>,
    },
}

/// Configuration of the scriptable provider.
#[derive(Debug, Clone)]
pub struct TestProviderConfig {
    pub handshake_unimplemented: bool,
    pub accept_secrets: bool,
    pub supports_preview: bool,
    /// When set, `CheckConfig` fails with this code and message.
    pub check_config_error: Option<(Code, String)>,
    pub create: CreateBehavior,
    pub version: String,
}

impl Default for TestProviderConfig {
    fn default() -> Self {
        TestProviderConfig {
            handshake_unimplemented: false,
            accept_secrets: true,
            supports_preview: true,
            check_config_error: None,
            create: CreateBehavior::default(),
            version: "1.0.0".to_string(),
        }
    }
}

#[derive(Default)]
pub struct TestProvider {
    pub config: TestProviderConfig,
    configure_requests: Arc<Mutex<Vec<ConfigureRequest>>>,
}

impl TestProvider {
    pub fn new(config: TestProviderConfig) -> Self {
        TestProvider {
            config,
            configure_requests: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// A shared view of every `Configure` request the provider received.
    pub fn configure_log(&self) -> Arc<Mutex<Vec<ConfigureRequest>>> {
        self.configure_requests.clone()
    }
}

fn string_struct(entries: &BTreeMap<String, String>) -> prost_types::Struct {
    prost_types::Struct {
        fields: entries
            .iter()
            .map(|(k, v)| {
                (
                    k.clone(),
                    prost_types::Value {
                        kind: Some(prost_types::value::Kind::StringValue(v.clone())),
                    },
                )
            })
            .collect(),
    }
}

fn init_failed_status(detail: &ErrorResourceInitFailed) -> Status {
    let any = prost_types::Any {
        type_url: "type.googleapis.com/pulumirpc.ErrorResourceInitFailed".to_string(),
        value: detail.encode_to_vec(),
    };
    let status = pulumi_proto::rpc::Status {
        code: Code::Unknown as i32,
        message: "resource failed to initialize".to_string(),
        details: vec![any],
    };
    Status::with_details(
        Code::Unknown,
        "resource failed to initialize",
        prost::bytes::Bytes::from(status.encode_to_vec()),
    )
}

type RpcResult<T> = Result<Response<T>, Status>;

#[tonic::async_trait]
impl ResourceProvider for TestProvider {
    async fn handshake(
        &self,
        _request: Request<ProviderHandshakeRequest>,
    ) -> RpcResult<ProviderHandshakeResponse> {
        if self.config.handshake_unimplemented {
            return Err(Status::unimplemented("no handshake here"));
        }
        Ok(Response::new(ProviderHandshakeResponse {
            accept_secrets: self.config.accept_secrets,
            accept_resources: true,
            accept_outputs: true,
            supports_autonaming_configuration: false,
        }))
    }

    async fn parameterize(
        &self,
        _request: Request<ParameterizeRequest>,
    ) -> RpcResult<ParameterizeResponse> {
        Err(Status::unimplemented("Parameterize"))
    }

    async fn get_schema(&self, _request: Request<GetSchemaRequest>) -> RpcResult<GetSchemaResponse> {
        Ok(Response::new(GetSchemaResponse {
            schema: "{}".to_string(),
        }))
    }

    async fn check_config(&self, request: Request<CheckRequest>) -> RpcResult<CheckResponse> {
        if let Some((code, message)) = &self.config.check_config_error {
            return Err(Status::new(*code, message.clone()));
        }
        let req = request.into_inner();
        Ok(Response::new(CheckResponse {
            inputs: req.news,
            failures: Vec::new(),
        }))
    }

    async fn diff_config(&self, _request: Request<DiffRequest>) -> RpcResult<DiffResponse> {
        Ok(Response::new(DiffResponse::default()))
    }

    async fn configure(&self, request: Request<ConfigureRequest>) -> RpcResult<ConfigureResponse> {
        self.configure_requests
            .lock()
            .unwrap()
            .push(request.into_inner());
        Ok(Response::new(ConfigureResponse {
            accept_secrets: self.config.accept_secrets,
            supports_preview: self.config.supports_preview,
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
        let items = vec![
            Ok(InvokeResponse {
                r#return: req.args.clone(),
                failures: Vec::new(),
            }),
            Ok(InvokeResponse {
                r#return: req.args,
                failures: Vec::new(),
            }),
        ];
        Ok(Response::new(Box::pin(tokio_stream::iter(items))))
    }

    async fn call(&self, _request: Request<CallRequest>) -> RpcResult<CallResponse> {
        Err(Status::unimplemented("Call"))
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
        match &self.config.create {
            CreateBehavior::Echo => {
                let req = request.into_inner();
                Ok(Response::new(CreateResponse {
                    id: "test-1".to_string(),
                    properties: req.properties,
                }))
            }
            CreateBehavior::InitFail {
                id,
                properties,
                inputs,
                reasons,
            } => Err(init_failed_status(&ErrorResourceInitFailed {
                id: id.clone(),
                properties: Some(string_struct(properties)),
                reasons: reasons.clone(),
                inputs: Some(string_struct(inputs)),
            })),
        }
    }

    async fn read(&self, request: Request<ReadRequest>) -> RpcResult<ReadResponse> {
        let req = request.into_inner();
        Ok(Response::new(ReadResponse {
            id: req.id,
            properties: req.properties,
            inputs: req.inputs,
        }))
    }

    async fn update(&self, request: Request<UpdateRequest>) -> RpcResult<UpdateResponse> {
        let req = request.into_inner();
        Ok(Response::new(UpdateResponse {
            properties: req.news,
        }))
    }

    async fn delete(&self, _request: Request<DeleteRequest>) -> RpcResult<Empty> {
        Ok(Response::new(Empty {}))
    }

    async fn construct(&self, _request: Request<ConstructRequest>) -> RpcResult<ConstructResponse> {
        Err(Status::unimplemented("Construct"))
    }

    async fn cancel(&self, _request: Request<Empty>) -> RpcResult<Empty> {
        Ok(Response::new(Empty {}))
    }

    async fn get_plugin_info(&self, _request: Request<Empty>) -> RpcResult<PluginInfo> {
        Ok(Response::new(PluginInfo {
            version: self.config.version.clone(),
        }))
    }

    async fn attach(&self, _request: Request<PluginAttach>) -> RpcResult<Empty> {
        Ok(Response::new(Empty {}))
    }

    async fn get_mapping(&self, _request: Request<GetMappingRequest>) -> RpcResult<GetMappingResponse> {
        Err(Status::unimplemented("GetMapping"))
    }

    async fn get_mappings(
        &self,
        _request: Request<GetMappingsRequest>,
    ) -> RpcResult<GetMappingsResponse> {
        Err(Status::unimplemented("GetMappings"))
    }
}

/// Serve a scripted provider on an ephemeral port; returns the port. The
/// server task runs until the test process exits.
pub async fn serve(provider: TestProvider) -> u16 {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    tokio::spawn(async move {
        let _ = Server::builder()
            .add_service(ResourceProviderServer::new(provider))
            .serve_with_incoming(TcpListenerStream::new(listener))
            .await;
    });
    port
}

/// What the fake language runtime's `RunPlugin` should stream back.
#[derive(Debug, Clone, Default)]
pub enum RunPluginScript {
    /// End the stream immediately.
    #[default]
    Empty,
    /// Send these frames in order, then end the stream.
    Frames(Vec<run_plugin_response::Output>),
    /// Stream stdout chunks until the client goes away.
    Endless,
}

/// A scriptable in-process language runtime.
#[derive(Debug, Default)]
pub struct TestLanguageRuntime {
    pub run_plugin: RunPluginScript,
}

type LanguageStream<T> =
    std::pin::Pin<Box<dyn tokio_stream::Stream<Item = Result<T, Status>> + Send>>;

#[tonic::async_trait]
impl LanguageRuntime for TestLanguageRuntime {
    async fn handshake(
        &self,
        _request: Request<LanguageHandshakeRequest>,
    ) -> RpcResult<LanguageHandshakeResponse> {
        Ok(Response::new(LanguageHandshakeResponse {}))
    }

    async fn get_required_plugins(
        &self,
        _request: Request<GetRequiredPluginsRequest>,
    ) -> RpcResult<GetRequiredPluginsResponse> {
        Err(Status::unimplemented("GetRequiredPlugins"))
    }

    async fn run(&self, _request: Request<RunRequest>) -> RpcResult<RunResponse> {
        Ok(Response::new(RunResponse {
            error: String::new(),
            bail: false,
        }))
    }

    async fn get_plugin_info(&self, _request: Request<Empty>) -> RpcResult<PluginInfo> {
        Ok(Response::new(PluginInfo {
            version: "1.0.0".to_string(),
        }))
    }

    type InstallDependenciesStream = LanguageStream<InstallDependenciesResponse>;

    async fn install_dependencies(
        &self,
        _request: Request<InstallDependenciesRequest>,
    ) -> RpcResult<Self::InstallDependenciesStream> {
        Err(Status::unimplemented("InstallDependencies"))
    }

    async fn runtime_options_prompts(
        &self,
        _request: Request<RuntimeOptionsRequest>,
    ) -> RpcResult<RuntimeOptionsResponse> {
        Err(Status::unimplemented("RuntimeOptionsPrompts"))
    }

    async fn about(&self, _request: Request<AboutRequest>) -> RpcResult<AboutResponse> {
        Ok(Response::new(AboutResponse {
            executable: "mock-lang".to_string(),
            version: "1.0.0".to_string(),
            metadata: Default::default(),
        }))
    }

    async fn get_program_dependencies(
        &self,
        _request: Request<GetProgramDependenciesRequest>,
    ) -> RpcResult<GetProgramDependenciesResponse> {
        Ok(Response::new(GetProgramDependenciesResponse {
            dependencies: Vec::new(),
        }))
    }

    type RunPluginStream = LanguageStream<RunPluginResponse>;

    async fn run_plugin(
        &self,
        _request: Request<RunPluginRequest>,
    ) -> RpcResult<Self::RunPluginStream> {
        match &self.run_plugin {
            RunPluginScript::Empty => Ok(Response::new(Box::pin(tokio_stream::iter(
                Vec::<Result<RunPluginResponse, Status>>::new(),
            )))),
            RunPluginScript::Frames(frames) => {
                let items: Vec<Result<RunPluginResponse, Status>> = frames
                    .iter()
                    .cloned()
                    .map(|output| {
                        Ok(RunPluginResponse {
                            output: Some(output),
                        })
                    })
                    .collect();
                Ok(Response::new(Box::pin(tokio_stream::iter(items))))
            }
            RunPluginScript::Endless => {
                let (tx, rx) = tokio::sync::mpsc::channel(4);
                tokio::spawn(async move {
                    loop {
                        let frame = RunPluginResponse {
                            output: Some(run_plugin_response::Output::Stdout(b"tick\n".to_vec())),
                        };
                        if tx.send(Ok(frame)).await.is_err() {
                            break;
                        }
                        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
                    }
                });
                Ok(Response::new(Box::pin(
                    tokio_stream::wrappers::ReceiverStream::new(rx),
                )))
            }
        }
    }

    async fn generate_program(
        &self,
        _request: Request<GenerateProgramRequest>,
    ) -> RpcResult<GenerateProgramResponse> {
        Err(Status::unimplemented("GenerateProgram"))
    }

    async fn generate_project(
        &self,
        _request: Request<GenerateProjectRequest>,
    ) -> RpcResult<GenerateProjectResponse> {
        Err(Status::unimplemented("GenerateProject"))
    }

    async fn generate_package(
        &self,
        _request: Request<GeneratePackageRequest>,
    ) -> RpcResult<GeneratePackageResponse> {
        Err(Status::unimplemented("GeneratePackage"))
    }

    async fn pack(&self, _request: Request<PackRequest>) -> RpcResult<PackResponse> {
        Err(Status::unimplemented("Pack"))
    }
}

/// Serve a scripted language runtime on an ephemeral port; returns the
/// port. The server task runs until the test process exits.
pub async fn serve_language(runtime: TestLanguageRuntime) -> u16 {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    tokio::spawn(async move {
        let _ = Server::builder()
            .add_service(LanguageRuntimeServer::new(runtime))
            .serve_with_incoming(TcpListenerStream::new(listener))
            .await;
    });
    port
}
