//! Generated Protocol Buffer types for the cbsaga gRPC services.
//!
//! This crate only carries the generated message and service types plus the
//! file descriptor set for gRPC reflection; service implementations live in
//! `cbsaga-grpc`.

pub mod orchestrator {
    pub mod v1 {
        tonic::include_proto!("cbsaga.orchestrator.v1");

        /// File descriptor set for gRPC server reflection.
        pub const FILE_DESCRIPTOR_SET: &[u8] =
            include_bytes!(concat!(env!("OUT_DIR"), "/cbsaga_descriptor.bin"));
    }
}
