pub mod config;
pub mod db;
pub mod error;
pub mod events;
pub mod orchestrator;
pub mod registry;
pub mod scheduler;
pub mod scm;
pub mod server;
pub mod shutdown;
pub mod store;
pub mod tls;

// Re-export generated protobuf types
pub mod proto {
    tonic::include_proto!("gantry");
}
