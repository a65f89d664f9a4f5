// Pre-generated protobuf/gRPC bindings for proto/nodecontrol.proto.
//
// Normally emitted at build time by `tonic::include_proto!("nodecontrol")`
// via tonic-build (which shells out to `protoc`). This environment has no
// `protoc` available, so the equivalent generated code is committed here and
// included by `crate::proto`. The surface mirrors what tonic-build 0.12 /
// prost 0.13 produce for this `.proto`.
#[allow(clippy::derive_partial_eq_without_eq)]
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct RendezvousRequest {
    #[prost(string, tag = "1")]
    pub job_id: ::prost::alloc::string::String,
    #[prost(uint32, tag = "2")]
    pub rank: u32,
    #[prost(string, repeated, tag = "3")]
    pub peer_addrs: ::prost::alloc::vec::Vec<::prost::alloc::string::String>,
}
#[allow(clippy::derive_partial_eq_without_eq)]
#[derive(Clone, Copy, PartialEq, ::prost::Message)]
pub struct RendezvousReply {
    #[prost(bool, tag = "1")]
    pub ready: bool,
}
#[allow(clippy::derive_partial_eq_without_eq)]
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct StartRunRequest {
    #[prost(string, tag = "1")]
    pub job_id: ::prost::alloc::string::String,
}
#[allow(clippy::derive_partial_eq_without_eq)]
#[derive(Clone, Copy, PartialEq, ::prost::Message)]
pub struct StartRunReply {
    #[prost(bool, tag = "1")]
    pub started: bool,
}
#[allow(clippy::derive_partial_eq_without_eq)]
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ProbeRequest {
    #[prost(string, tag = "1")]
    pub job_id: ::prost::alloc::string::String,
}
#[allow(clippy::derive_partial_eq_without_eq)]
#[derive(Clone, Copy, PartialEq, ::prost::Message)]
pub struct ProbeReply {
    #[prost(enumeration = "RunState", tag = "1")]
    pub state: i32,
    /// Unix millis of the node's most recent internal heartbeat.
    #[prost(int64, tag = "2")]
    pub heartbeat_ms: i64,
    /// Exit code of the sampling process, set once state is SUCCEEDED/FAILED.
    #[prost(int32, tag = "3")]
    pub exit_code: i32,
}
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, ::prost::Enumeration)]
#[repr(i32)]
pub enum RunState {
    Unknown = 0,
    Serving = 1,
    Succeeded = 2,
    Failed = 3,
}
impl RunState {
    /// String value of the enum field names used in the ProtoBuf definition.
    ///
    /// The values are not transformed in any way and thus are considered stable
    /// (if the ProtoBuf definition does not change) and safe for programmatic use.
    pub fn as_str_name(&self) -> &'static str {
        match self {
            RunState::Unknown => "RUN_STATE_UNKNOWN",
            RunState::Serving => "RUN_STATE_SERVING",
            RunState::Succeeded => "RUN_STATE_SUCCEEDED",
            RunState::Failed => "RUN_STATE_FAILED",
        }
    }
    /// Creates an enum from field names used in the ProtoBuf definition.
    pub fn from_str_name(value: &str) -> ::core::option::Option<Self> {
        match value {
            "RUN_STATE_UNKNOWN" => Some(Self::Unknown),
            "RUN_STATE_SERVING" => Some(Self::Serving),
            "RUN_STATE_SUCCEEDED" => Some(Self::Succeeded),
            "RUN_STATE_FAILED" => Some(Self::Failed),
            _ => None,
        }
    }
}
/// Generated client implementations.
pub mod node_control_client {
    #![allow(unused_variables, dead_code, missing_docs, clippy::let_unit_value)]
    use tonic::codegen::http::Uri;
    use tonic::codegen::*;
    #[derive(Debug, Clone)]
    pub struct NodeControlClient<T> {
        inner: tonic::client::Grpc<T>,
    }
    impl NodeControlClient<tonic::transport::Channel> {
        /// Attempt to create a new client by connecting to a given endpoint.
        pub async fn connect<D>(dst: D) -> Result<Self, tonic::transport::Error>
        where
            D: TryInto<tonic::transport::Endpoint>,
            D::Error: Into<StdError>,
        {
            let conn = tonic::transport::Endpoint::new(dst)?.connect().await?;
            Ok(Self::new(conn))
        }
    }
    impl<T> NodeControlClient<T>
    where
        T: tonic::client::GrpcService<tonic::body::BoxBody>,
        T::Error: Into<StdError>,
        T::ResponseBody: Body<Data = Bytes> + Send + 'static,
        <T::ResponseBody as Body>::Error: Into<StdError> + Send,
    {
        pub fn new(inner: T) -> Self {
            let inner = tonic::client::Grpc::new(inner);
            Self { inner }
        }
        pub fn with_origin(inner: T, origin: Uri) -> Self {
            let inner = tonic::client::Grpc::with_origin(inner, origin);
            Self { inner }
        }
        pub fn with_interceptor<F>(
            inner: T,
            interceptor: F,
        ) -> NodeControlClient<InterceptedService<T, F>>
        where
            F: tonic::service::Interceptor,
            T::ResponseBody: Default,
            T: tonic::codegen::Service<
                http::Request<tonic::body::BoxBody>,
                Response = http::Response<
                    <T as tonic::client::GrpcService<tonic::body::BoxBody>>::ResponseBody,
                >,
            >,
            <T as tonic::codegen::Service<http::Request<tonic::body::BoxBody>>>::Error:
                Into<StdError> + Send + Sync,
        {
            NodeControlClient::new(InterceptedService::new(inner, interceptor))
        }
        /// Compress requests with the given encoding.
        ///
        /// This requires the server to support it otherwise it might respond with an
        /// error.
        #[must_use]
        pub fn send_compressed(mut self, encoding: CompressionEncoding) -> Self {
            self.inner = self.inner.send_compressed(encoding);
            self
        }
        /// Enable decompressing responses.
        #[must_use]
        pub fn accept_compressed(mut self, encoding: CompressionEncoding) -> Self {
            self.inner = self.inner.accept_compressed(encoding);
            self
        }
        /// Limits the maximum size of a decoded message.
        ///
        /// Default: `4MB`
        #[must_use]
        pub fn max_decoding_message_size(mut self, limit: usize) -> Self {
            self.inner = self.inner.max_decoding_message_size(limit);
            self
        }
        /// Limits the maximum size of an encoded message.
        ///
        /// Default: `usize::MAX`
        #[must_use]
        pub fn max_encoding_message_size(mut self, limit: usize) -> Self {
            self.inner = self.inner.max_encoding_message_size(limit);
            self
        }
        /// Deliver the full peer address list for the node group. The node must
        /// not report ready=true until it can reach every peer.
        pub async fn rendezvous(
            &mut self,
            request: impl tonic::IntoRequest<super::RendezvousRequest>,
        ) -> std::result::Result<tonic::Response<super::RendezvousReply>, tonic::Status> {
            self.inner.ready().await.map_err(|e| {
                tonic::Status::unknown(format!("Service was not ready: {}", e.into()))
            })?;
            let codec = tonic::codec::ProstCodec::default();
            let path =
                http::uri::PathAndQuery::from_static("/nodecontrol.NodeControl/Rendezvous");
            let mut req = request.into_request();
            req.extensions_mut()
                .insert(GrpcMethod::new("nodecontrol.NodeControl", "Rendezvous"));
            self.inner.unary(req, path, codec).await
        }
        /// Collective start barrier: sampling begins only after every rank has
        /// acknowledged this call.
        pub async fn start_run(
            &mut self,
            request: impl tonic::IntoRequest<super::StartRunRequest>,
        ) -> std::result::Result<tonic::Response<super::StartRunReply>, tonic::Status> {
            self.inner.ready().await.map_err(|e| {
                tonic::Status::unknown(format!("Service was not ready: {}", e.into()))
            })?;
            let codec = tonic::codec::ProstCodec::default();
            let path = http::uri::PathAndQuery::from_static("/nodecontrol.NodeControl/StartRun");
            let mut req = request.into_request();
            req.extensions_mut()
                .insert(GrpcMethod::new("nodecontrol.NodeControl", "StartRun"));
            self.inner.unary(req, path, codec).await
        }
        /// Poll node health. SERVING while sampling, SUCCEEDED/FAILED once the
        /// sampling process has exited.
        pub async fn probe(
            &mut self,
            request: impl tonic::IntoRequest<super::ProbeRequest>,
        ) -> std::result::Result<tonic::Response<super::ProbeReply>, tonic::Status> {
            self.inner.ready().await.map_err(|e| {
                tonic::Status::unknown(format!("Service was not ready: {}", e.into()))
            })?;
            let codec = tonic::codec::ProstCodec::default();
            let path = http::uri::PathAndQuery::from_static("/nodecontrol.NodeControl/Probe");
            let mut req = request.into_request();
            req.extensions_mut()
                .insert(GrpcMethod::new("nodecontrol.NodeControl", "Probe"));
            self.inner.unary(req, path, codec).await
        }
    }
}
