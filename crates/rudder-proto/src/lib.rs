//! Generated protobuf/gRPC bindings for the resource service.

pub mod resource {
    tonic::include_proto!("resource");
}
