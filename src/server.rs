use std::sync::Arc;

use log::{error, info};
use tokio::net::TcpListener;
use tokio_stream::wrappers::TcpListenerStream;
use tokio_stream::StreamExt;

use crate::connection::Connection;
use crate::error::BoxError;
use crate::output::OutputRoot;
use crate::registry::SessionRegistry;
use crate::session::{ActiveStreams, Session};
use crate::transcoder::Launcher;

/// Accepts RTMP connections forever, one fresh [`Session`] per socket.
pub async fn run<L: Launcher>(
    listener: TcpListener,
    output: OutputRoot,
    launcher: Arc<L>,
    registry: SessionRegistry,
) -> Result<(), BoxError> {
    info!("Listening on {}", listener.local_addr()?);
    let streams = ActiveStreams::default();
    let mut incoming = TcpListenerStream::new(listener);

    while let Some(stream) = incoming.next().await {
        let stream = match stream {
            Ok(stream) => stream,
            Err(e) => {
                error!("Failed to accept connection: {}", e);
                continue;
            }
        };
        let peer = stream.peer_addr().ok();
        if let Err(e) = stream.set_nodelay(true) {
            error!("Failed to set TCP_NODELAY: {}", e);
        }

        let session = Session::new(output.clone(), launcher.clone(), streams.clone());
        let id = registry.insert(session.handle()).await;
        info!("Connection {}: New connection from {:?}", id, peer);

        let registry = registry.clone();
        tokio::spawn(async move {
            if let Err(e) = Connection::new(id, session).run(stream).await {
                error!("Connection {}: Error: {}", id, e);
            }
            registry.remove(id).await;
            info!("Connection {}: closed", id);
        });
    }
    Ok(())
}
