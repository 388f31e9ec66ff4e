pub mod client;
pub mod client_service;
pub mod cluster_service;
pub mod convert;
pub mod server;

pub use client::GrpcTransport;
pub use server::GrpcServer;
