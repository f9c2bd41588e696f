use std::io;

use thiserror::Error;

pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Failures surfaced by the session state machine.
///
/// Only the variants returned from a callback are seen by the protocol layer;
/// metadata decode failures and forwarding failures are logged and absorbed.
#[derive(Error, Debug)]
pub enum SessionError {
    #[error("invalid publish request: {0}")]
    InvalidRequest(String),

    #[error("stream '{0}' is already being published")]
    AlreadyPublishing(String),

    #[error("output path error: {0}")]
    Path(String),

    #[error("transcoder startup failed: {0}")]
    Startup(String),

    #[error("failed to decode frame: {0}")]
    Decode(#[from] DecodeError),
}

#[derive(Error, Debug, PartialEq, Eq)]
pub enum DecodeError {
    #[error("empty {0} payload")]
    Empty(&'static str),

    #[error("truncated {kind} header: need {need} bytes, got {got}")]
    Truncated {
        kind: &'static str,
        need: usize,
        got: usize,
    },

    #[error("script data: {0}")]
    Script(String),
}

#[derive(Error, Debug)]
pub enum ConnectionError {
    #[error("io error: {0}")]
    Io(#[from] io::Error),

    #[error("handshake failed: {0}")]
    Handshake(String),

    #[error("rtmp session error: {0}")]
    Rtmp(String),

    #[error("publish rejected: {0}")]
    Rejected(SessionError),

    #[error("stream terminated: {0}")]
    Stream(SessionError),
}
