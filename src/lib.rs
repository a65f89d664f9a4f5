pub mod cluster;
pub mod config;
pub mod dashboard;
pub mod error;
pub mod metrics;
pub mod scheduler;
pub mod server;
pub mod shutdown;
pub mod store;
pub mod tasks;

// Re-export generated protobuf types for the compute-node contract.
// The bindings are committed (see src/proto_gen.rs) because this build
// environment has no `protoc`; `tonic::include_proto!` would otherwise pull
// the copy that build.rs generates from proto/nodecontrol.proto.
pub mod proto {
    include!("proto_gen.rs");
}
