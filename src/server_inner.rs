use log::info;
use tonic::{Request, Response, Status};

use crate::registry::SessionRegistry;
use crate::service::{
    transcoder_server::Transcoder, CloseSessionRequest, CloseSessionResponse,
    ListSessionsRequest, ListSessionsResponse, SessionInfo, SessionState,
};
use crate::session;

pub struct ServerInner {
    sessions: SessionRegistry,
}

impl ServerInner {
    pub fn new(sessions: SessionRegistry) -> Self {
        ServerInner { sessions }
    }
}

fn session_state(status: session::Status) -> SessionState {
    match status {
        session::Status::Idle => SessionState::Idle,
        session::Status::Publishing => SessionState::Publishing,
        session::Status::Closed => SessionState::Closed,
    }
}

#[tonic::async_trait]
impl Transcoder for ServerInner {
    async fn list_sessions(
        &self,
        _request: Request<ListSessionsRequest>,
    ) -> Result<Response<ListSessionsResponse>, Status> {
        let sessions = self
            .sessions
            .snapshot()
            .await
            .into_iter()
            .map(|(id, handle)| {
                let (tags_forwarded, bytes_forwarded) = handle.forwarded();
                SessionInfo {
                    session_id: id as u64,
                    publishing_name: handle.publishing_name().unwrap_or_default(),
                    state: session_state(handle.status()) as i32,
                    tags_forwarded,
                    bytes_forwarded,
                    transcoder_pid: handle.transcoder_pid().unwrap_or_default(),
                }
            })
            .collect();

        Ok(Response::new(ListSessionsResponse { sessions }))
    }

    async fn close_session(
        &self,
        request: Request<CloseSessionRequest>,
    ) -> Result<Response<CloseSessionResponse>, Status> {
        let session_id = request.into_inner().session_id;
        let handle = match usize::try_from(session_id) {
            Ok(id) => self.sessions.get(id).await,
            Err(_) => None,
        }
        .ok_or_else(|| Status::not_found(format!("no session with id {}", session_id)))?;

        info!("Closing session {} on request", session_id);
        handle.close();

        Ok(Response::new(CloseSessionResponse { status: 0 }))
    }
}
