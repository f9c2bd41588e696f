use std::sync::Arc;

use clap::Parser;
use config::Config;
use dotenv::dotenv;
use error::BoxError;
use log::info;
use output::OutputRoot;
use registry::SessionRegistry;
use server_inner::ServerInner;
use tokio::net::TcpListener;
use tonic::transport::Server;

pub mod service {
    tonic::include_proto!("transcoder");
}

mod config;
mod connection;
mod error;
mod flv;
mod output;
mod registry;
mod server;
mod server_inner;
mod session;
mod shutdown;
mod transcoder;

#[tokio::main]
async fn main() -> Result<(), BoxError> {
    dotenv().ok();
    env_logger::init();

    let config = Config::parse();
    info!("Starting with {:?}", config);

    let registry = SessionRegistry::new();
    let listener = TcpListener::bind(config.rtmp_addr).await?;
    let ingest = server::run(
        listener,
        OutputRoot::new(&config.output_root),
        Arc::new(config.profile()),
        registry.clone(),
    );

    let control = Server::builder()
        .add_service(service::transcoder_server::TranscoderServer::new(
            ServerInner::new(registry),
        ))
        .serve(config.grpc_addr);
    info!("Control service on {}", config.grpc_addr);

    tokio::select! {
        result = ingest => result?,
        result = control => result?,
        result = shutdown::wait_for_signal() => {
            result?;
            info!("Performing graceful shutdown...");
            if config.cleanup_on_shutdown {
                shutdown::cleanup(&config.output_root).await;
            }
        }
    }

    info!("Exiting");
    Ok(())
}
