use std::collections::{HashMap, VecDeque};

use log::{debug, error, info, warn};
use rml_amf0::Amf0Value;
use rml_rtmp::handshake::{Handshake, HandshakeProcessResult, PeerType};
use rml_rtmp::sessions::{
    ServerSession, ServerSessionConfig, ServerSessionEvent, ServerSessionResult, StreamMetadata,
};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::ConnectionError;
use crate::session::StreamHandler;

const READ_BUFFER_SIZE: usize = 4096;

/// Drives one RTMP connection and translates its events into
/// [`StreamHandler`] callbacks.
pub struct Connection<H> {
    id: usize,
    handler: H,
    handshake: Handshake,
    rtmp_session: Option<ServerSession>,
}

impl<H: StreamHandler> Connection<H> {
    pub fn new(id: usize, handler: H) -> Self {
        Connection {
            id,
            handler,
            handshake: Handshake::new(PeerType::Server),
            rtmp_session: None,
        }
    }

    /// Runs until the peer disconnects or the stream fails. `on_close` is
    /// called exactly once on the way out.
    pub async fn run<S>(mut self, mut stream: S) -> Result<(), ConnectionError>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send,
    {
        let result = self.drive(&mut stream).await;
        self.handler.on_close().await;
        let _ = stream.shutdown().await;
        result
    }

    async fn drive<S>(&mut self, stream: &mut S) -> Result<(), ConnectionError>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send,
    {
        let p0_and_p1 = self
            .handshake
            .generate_outbound_p0_and_p1()
            .map_err(|e| ConnectionError::Handshake(format!("{:?}", e)))?;
        stream.write_all(&p0_and_p1).await?;

        let mut buf = vec![0u8; READ_BUFFER_SIZE];
        loop {
            let n = stream.read(&mut buf).await?;
            if n == 0 {
                info!("Connection {}: peer closed the connection", self.id);
                return Ok(());
            }
            self.handle_bytes(stream, &buf[..n]).await?;
        }
    }

    async fn handle_bytes<S>(&mut self, stream: &mut S, bytes: &[u8]) -> Result<(), ConnectionError>
    where
        S: AsyncWrite + Unpin + Send,
    {
        let results = match self.rtmp_session.as_mut() {
            Some(session) => session
                .handle_input(bytes)
                .map_err(|e| ConnectionError::Rtmp(format!("{:?}", e)))?,
            None => {
                let result = self
                    .handshake
                    .process_bytes(bytes)
                    .map_err(|e| ConnectionError::Handshake(format!("{:?}", e)))?;
                match result {
                    HandshakeProcessResult::InProgress { response_bytes } => {
                        stream.write_all(&response_bytes).await?;
                        return Ok(());
                    }
                    HandshakeProcessResult::Completed {
                        response_bytes,
                        remaining_bytes,
                    } => {
                        stream.write_all(&response_bytes).await?;
                        debug!("Connection {}: handshake completed", self.id);

                        let (mut session, mut results) =
                            ServerSession::new(ServerSessionConfig::new())
                                .map_err(|e| ConnectionError::Rtmp(format!("{:?}", e)))?;
                        results.extend(
                            session
                                .handle_input(&remaining_bytes)
                                .map_err(|e| ConnectionError::Rtmp(format!("{:?}", e)))?,
                        );
                        self.rtmp_session = Some(session);
                        results
                    }
                }
            }
        };

        self.handle_results(stream, results).await
    }

    async fn handle_results<S>(
        &mut self,
        stream: &mut S,
        results: Vec<ServerSessionResult>,
    ) -> Result<(), ConnectionError>
    where
        S: AsyncWrite + Unpin + Send,
    {
        let mut pending: VecDeque<ServerSessionResult> = results.into();
        while let Some(result) = pending.pop_front() {
            match result {
                ServerSessionResult::OutboundResponse(packet) => {
                    stream.write_all(&packet.bytes).await?;
                }
                ServerSessionResult::RaisedEvent(event) => {
                    match self.handle_event(event).await {
                        Ok(results) => pending.extend(results),
                        Err(hangup) => {
                            // let the peer see the rejection before hanging up
                            for result in hangup.results {
                                if let ServerSessionResult::OutboundResponse(packet) = result {
                                    stream.write_all(&packet.bytes).await?;
                                }
                            }
                            return Err(hangup.error);
                        }
                    }
                }
                ServerSessionResult::UnhandleableMessageReceived(_) => {
                    debug!("Connection {}: skipping unhandleable message", self.id);
                }
            }
        }
        Ok(())
    }

    async fn handle_event(
        &mut self,
        event: ServerSessionEvent,
    ) -> Result<Vec<ServerSessionResult>, Hangup> {
        match event {
            ServerSessionEvent::ConnectionRequested {
                request_id,
                app_name,
                ..
            } => {
                info!("Connection {}: connect to app '{}'", self.id, app_name);
                self.accept(request_id)
            }

            ServerSessionEvent::PublishStreamRequested {
                request_id,
                app_name,
                stream_key,
                ..
            } => {
                info!(
                    "Connection {}: publish requested on '{}/{}'",
                    self.id, app_name, stream_key
                );
                match self.handler.on_publish(&stream_key).await {
                    Ok(()) => self.accept(request_id),
                    Err(e) => {
                        warn!("Connection {}: publish rejected: {}", self.id, e);
                        let results = self
                            .reject(request_id, "NetStream.Publish.BadName", &e.to_string())
                            .unwrap_or_default();
                        Err(Hangup {
                            error: ConnectionError::Rejected(e),
                            results,
                        })
                    }
                }
            }

            ServerSessionEvent::PlayStreamRequested {
                request_id,
                stream_key,
                ..
            } => {
                warn!(
                    "Connection {}: refusing playback of '{}'",
                    self.id, stream_key
                );
                self.reject(request_id, "NetStream.Play.Failed", "playback is not supported")
                    .map_err(Hangup::from)
            }

            // rml_rtmp parses @setDataFrame itself, so this is a rebuilt
            // record and not the publisher's bytes.
            ServerSessionEvent::StreamMetadataChanged { metadata, .. } => {
                let payload = metadata_payload(&metadata);
                self.handler.on_metadata_frame(0, &payload).await;
                Ok(Vec::new())
            }

            ServerSessionEvent::AudioDataReceived {
                data, timestamp, ..
            } => match self.handler.on_audio_frame(timestamp.value, &data).await {
                Ok(()) => Ok(Vec::new()),
                Err(e) => {
                    error!("Connection {}: bad audio data: {}", self.id, e);
                    Err(Hangup::from(ConnectionError::Stream(e)))
                }
            },

            ServerSessionEvent::VideoDataReceived {
                data, timestamp, ..
            } => match self.handler.on_video_frame(timestamp.value, &data).await {
                Ok(()) => Ok(Vec::new()),
                Err(e) => {
                    error!("Connection {}: bad video data: {}", self.id, e);
                    Err(Hangup::from(ConnectionError::Stream(e)))
                }
            },

            ServerSessionEvent::PublishStreamFinished {
                app_name,
                stream_key,
                ..
            } => {
                info!(
                    "Connection {}: publish of '{}/{}' finished",
                    self.id, app_name, stream_key
                );
                Ok(Vec::new())
            }

            other => {
                debug!("Connection {}: ignoring event {:?}", self.id, other);
                Ok(Vec::new())
            }
        }
    }

    fn accept(&mut self, request_id: u32) -> Result<Vec<ServerSessionResult>, Hangup> {
        self.rtmp_session
            .as_mut()
            .ok_or_else(|| ConnectionError::Rtmp("no rtmp session".to_string()))?
            .accept_request(request_id)
            .map_err(|e| Hangup::from(ConnectionError::Rtmp(format!("{:?}", e))))
    }

    fn reject(
        &mut self,
        request_id: u32,
        code: &str,
        description: &str,
    ) -> Result<Vec<ServerSessionResult>, ConnectionError> {
        self.rtmp_session
            .as_mut()
            .ok_or_else(|| ConnectionError::Rtmp("no rtmp session".to_string()))?
            .reject_request(request_id, code, description)
            .map_err(|e| ConnectionError::Rtmp(format!("{:?}", e)))
    }
}

/// Terminates the connection after `results` have been sent.
struct Hangup {
    error: ConnectionError,
    results: Vec<ServerSessionResult>,
}

impl From<ConnectionError> for Hangup {
    fn from(error: ConnectionError) -> Self {
        Hangup {
            error,
            results: Vec::new(),
        }
    }
}

/// Rebuilds the `onMetaData` script record the publisher sent with
/// `@setDataFrame`, which the rtmp session hands over already parsed.
///
/// The rebuild is lossy: only the fields `StreamMetadata` models survive.
/// Keys such as `duration`, `fileSize` or encoder specific extras are gone
/// by the time the session sees them.
pub fn metadata_payload(metadata: &StreamMetadata) -> Vec<u8> {
    let mut properties = HashMap::new();
    let mut number = |key: &str, value: Option<f64>| {
        if let Some(value) = value {
            properties.insert(key.to_string(), Amf0Value::Number(value));
        }
    };
    number("width", metadata.video_width.map(f64::from));
    number("height", metadata.video_height.map(f64::from));
    number("framerate", metadata.video_frame_rate.map(f64::from));
    number("videodatarate", metadata.video_bitrate_kbps.map(f64::from));
    number("audiodatarate", metadata.audio_bitrate_kbps.map(f64::from));
    number("audiosamplerate", metadata.audio_sample_rate.map(f64::from));
    number("audiochannels", metadata.audio_channels.map(f64::from));

    number("videocodecid", metadata.video_codec_id.map(f64::from));
    number("audiocodecid", metadata.audio_codec_id.map(f64::from));
    if let Some(encoder) = &metadata.encoder {
        properties.insert("encoder".to_string(), Amf0Value::Utf8String(encoder.clone()));
    }
    if let Some(stereo) = metadata.audio_is_stereo {
        properties.insert("stereo".to_string(), Amf0Value::Boolean(stereo));
    }

    let values = vec![
        Amf0Value::Utf8String("onMetaData".to_string()),
        Amf0Value::Object(properties),
    ];
    rml_amf0::serialize(&values).unwrap_or_default()
}
