//! The engine-side gRPC server plugins phone home to.
//!
//! Every plugin is told this server's address at launch. The surface is
//! intentionally tiny: a logging endpoint routed into the injected
//! diagnostic sink, and a get/set cell for the stack's root resource URN
//! that plugins use to auto-parent.

use std::net::SocketAddr;
use std::sync::Arc;

use tokio::net::TcpListener;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio_stream::wrappers::TcpListenerStream;
use tonic::{Request, Response, Status};

use pulumi_proto::pulumirpc::engine_server::{Engine, EngineServer as EngineGrpcServer};
use pulumi_proto::pulumirpc::{
    Empty, GetRootResourceRequest, GetRootResourceResponse, LogRequest, LogSeverity,
    SetRootResourceRequest, SetRootResourceResponse,
};

use crate::diag::{DiagSink, Severity};
use crate::error::Error;
use crate::urn::Urn;

/// The shared root-resource cell. Owned by the host, not process-global.
pub type RootResourceCell = Arc<parking_lot::Mutex<Option<Urn>>>;

struct EngineService {
    diag: Arc<dyn DiagSink>,
    root: RootResourceCell,
}

#[tonic::async_trait]
impl Engine for EngineService {
    async fn log(&self, request: Request<LogRequest>) -> Result<Response<Empty>, Status> {
        let req = request.into_inner();
        let severity = match req.severity() {
            LogSeverity::Debug => Severity::Debug,
            LogSeverity::Info => Severity::Info,
            LogSeverity::Warning => Severity::Warning,
            LogSeverity::Error => Severity::Error,
        };
        let urn = if req.urn.is_empty() {
            None
        } else {
            Urn::parse(&req.urn).ok()
        };
        if req.ephemeral {
            self.diag
                .log_status(severity, urn.as_ref(), &req.message, req.stream_id);
        } else {
            self.diag
                .log(severity, urn.as_ref(), &req.message, req.stream_id);
        }
        Ok(Response::new(Empty {}))
    }

    async fn get_root_resource(
        &self,
        _request: Request<GetRootResourceRequest>,
    ) -> Result<Response<GetRootResourceResponse>, Status> {
        let urn = self
            .root
            .lock()
            .as_ref()
            .map(|u| u.to_string())
            .unwrap_or_default();
        Ok(Response::new(GetRootResourceResponse { urn }))
    }

    async fn set_root_resource(
        &self,
        request: Request<SetRootResourceRequest>,
    ) -> Result<Response<SetRootResourceResponse>, Status> {
        let req = request.into_inner();
        let urn = Urn::parse(&req.urn)
            .map_err(|e| Status::invalid_argument(e.to_string()))?;
        *self.root.lock() = Some(urn);
        Ok(Response::new(SetRootResourceResponse {}))
    }
}

/// The running engine-side server.
pub struct EngineServer {
    addr: SocketAddr,
    shutdown: parking_lot::Mutex<Option<oneshot::Sender<()>>>,
    task: parking_lot::Mutex<Option<JoinHandle<()>>>,
}

impl EngineServer {
    /// Bind the server on an ephemeral local port and start serving.
    pub async fn bind(diag: Arc<dyn DiagSink>, root: RootResourceCell) -> Result<Self, Error> {
        let listener = TcpListener::bind("127.0.0.1:0").await?;
        let addr = listener.local_addr()?;
        let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();

        let service = EngineGrpcServer::new(EngineService { diag, root });
        let task = tokio::spawn(async move {
            let incoming = TcpListenerStream::new(listener);
            let result = tonic::transport::Server::builder()
                .add_service(service)
                .serve_with_incoming_shutdown(incoming, async {
                    let _ = shutdown_rx.await;
                })
                .await;
            if let Err(e) = result {
                log::error!("engine callback server failed: {e}");
            }
        });

        Ok(EngineServer {
            addr,
            shutdown: parking_lot::Mutex::new(Some(shutdown_tx)),
            task: parking_lot::Mutex::new(Some(task)),
        })
    }

    /// The address plugins should dial, in `host:port` form.
    pub fn addr(&self) -> String {
        self.addr.to_string()
    }

    /// Stop serving and wait for the listener to wind down.
    pub async fn shutdown(&self) {
        if let Some(tx) = self.shutdown.lock().take() {
            let _ = tx.send(());
        }
        let task = self.task.lock().take();
        if let Some(task) = task {
            let _ = task.await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::diag::MemorySink;
    use pulumi_proto::pulumirpc::engine_client::EngineClient;

    #[tokio::test]
    async fn log_and_root_resource_round_trip() {
        let sink = Arc::new(MemorySink::new());
        let root: RootResourceCell = Arc::new(parking_lot::Mutex::new(None));
        let server = EngineServer::bind(sink.clone(), root.clone()).await.unwrap();

        let mut client = EngineClient::connect(format!("http://{}", server.addr()))
            .await
            .unwrap();

        client
            .log(LogRequest {
                severity: LogSeverity::Warning as i32,
                message: "be careful".into(),
                urn: String::new(),
                stream_id: 7,
                ephemeral: false,
            })
            .await
            .unwrap();

        let urn = "urn:pulumi:dev::proj::pulumi:pulumi:Stack::proj-dev";
        client
            .set_root_resource(SetRootResourceRequest { urn: urn.into() })
            .await
            .unwrap();
        let fetched = client
            .get_root_resource(GetRootResourceRequest {})
            .await
            .unwrap()
            .into_inner();
        assert_eq!(fetched.urn, urn);
        assert_eq!(root.lock().as_ref().unwrap().as_str(), urn);

        let entries = sink.entries();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].severity, Severity::Warning);
        assert_eq!(entries[0].message, "be careful");
        assert_eq!(entries[0].stream_id, 7);

        server.shutdown().await;
    }
}
