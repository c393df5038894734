//! gRPC client for the companion process.
//!
//! The companion exposes service `agentcompanion.Companion`. Calls go
//! through tonic's generic `Grpc` client with a `ProstCodec`, so no
//! generated stubs are needed; the method path comes from `MessageType`.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use tonic::client::Grpc;
use tonic::codec::{ProstCodec, Streaming};
use tonic::codegen::http::uri::PathAndQuery;
use tonic::transport::{Channel, Endpoint};
use tonic::Status;

use crate::comms::channel::{ChannelTransport, ReplyStream, RpcBackend};
use crate::comms::messages::{Reply, Request};
use crate::comms::transport::TransportError;

#[derive(Clone, Debug)]
pub struct GrpcBackend {
    channel: Channel,
}

impl GrpcBackend {
    /// Build a channel that dials on first use. Must run inside a tokio
    /// runtime context.
    pub fn connect_lazy(endpoint: &str, connect_timeout: Duration) -> Result<Self, TransportError> {
        let endpoint_cfg = Endpoint::from_shared(endpoint.to_string())
            .map_err(|e| TransportError::InvalidEndpoint(endpoint.into(), e.to_string()))?
            .connect_timeout(connect_timeout);
        Ok(Self { channel: endpoint_cfg.connect_lazy() })
    }

    async fn ready(&self) -> Result<Grpc<Channel>, Status> {
        let mut grpc = Grpc::new(self.channel.clone());
        grpc.ready()
            .await
            .map_err(|e| Status::unavailable(format!("companion not ready: {e}")))?;
        Ok(grpc)
    }

    async fn call<Q, P>(&self, path: &'static str, request: Q) -> Result<P, Status>
    where
        Q: prost::Message + Send + Sync + 'static,
        P: prost::Message + Default + Send + Sync + 'static,
    {
        let mut grpc = self.ready().await?;
        let codec: ProstCodec<Q, P> = ProstCodec::default();
        let response = grpc
            .unary(tonic::Request::new(request), PathAndQuery::from_static(path), codec)
            .await?;
        Ok(response.into_inner())
    }

    async fn stream<Q, P>(&self, path: &'static str, request: Q) -> Result<Streaming<P>, Status>
    where
        Q: prost::Message + Send + Sync + 'static,
        P: prost::Message + Default + Send + Sync + 'static,
    {
        let mut grpc = self.ready().await?;
        let codec: ProstCodec<Q, P> = ProstCodec::default();
        let response = grpc
            .server_streaming(tonic::Request::new(request), PathAndQuery::from_static(path), codec)
            .await?;
        Ok(response.into_inner())
    }
}

#[async_trait]
impl RpcBackend for GrpcBackend {
    async fn unary(&self, request: Request) -> Result<Reply, Status> {
        let path = request.message_type().method_path();
        match request {
            Request::Ping(m) => self.call(path, m).await.map(Reply::Pong),
            Request::ContainerCommand(m) => self.call(path, m).await.map(Reply::ContainerCommand),
            Request::SwarmState(m) => self.call(path, m).await.map(Reply::SwarmState),
            Request::Notify(m) => self.call(path, m).await.map(Reply::Notify),
            Request::OrchestratorEvents(_) | Request::Trace(_) => {
                Err(Status::invalid_argument(format!("{path} is a streaming method")))
            }
        }
    }

    async fn open_stream(&self, request: Request) -> Result<ReplyStream, Status> {
        let path = request.message_type().method_path();
        match request {
            Request::OrchestratorEvents(m) => Ok(self
                .stream(path, m)
                .await?
                .map(|item| item.map(Reply::OrchestratorEvent))
                .boxed()),
            Request::Trace(m) => Ok(self
                .stream(path, m)
                .await?
                .map(|item| item.map(Reply::TraceRecord))
                .boxed()),
            _ => Err(Status::invalid_argument(format!("{path} is a unary method"))),
        }
    }
}

impl ChannelTransport {
    /// Transport that reaches the companion over gRPC.
    pub fn grpc(connect_timeout: Duration) -> std::io::Result<Self> {
        ChannelTransport::new(move |endpoint| {
            GrpcBackend::connect_lazy(endpoint, connect_timeout)
                .map(|backend| Arc::new(backend) as Arc<dyn RpcBackend>)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::comms::messages::Ping;

    #[test]
    fn malformed_endpoint_is_rejected() {
        let err = GrpcBackend::connect_lazy("not a uri", Duration::from_secs(1)).unwrap_err();
        assert!(matches!(err, TransportError::InvalidEndpoint(ref e, _) if e == "not a uri"));
    }

    #[tokio::test]
    async fn unreachable_companion_fails_the_call() {
        // nothing listens on the discard port
        let backend = GrpcBackend::connect_lazy("http://127.0.0.1:9", Duration::from_millis(200)).unwrap();
        let err = backend.unary(Request::Ping(Ping { token: 1 })).await.unwrap_err();
        assert_ne!(err.code(), tonic::Code::Ok);
    }

    #[tokio::test]
    async fn unary_request_on_stream_method_is_refused() {
        let backend = GrpcBackend::connect_lazy("http://127.0.0.1:9", Duration::from_millis(200)).unwrap();
        let err = backend.unary(Request::Trace(Default::default())).await.unwrap_err();
        assert_eq!(err.code(), tonic::Code::InvalidArgument);
    }
}
