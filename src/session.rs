use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use log::{debug, error, info, warn};
use tokio::process::ChildStdin;
use tokio::sync::watch;

use crate::error::SessionError;
use crate::flv::{AudioData, FlvMuxer, FlvTag, ScriptData, TagData, VideoData};
use crate::output::OutputRoot;
use crate::transcoder::{Launcher, Transcoder};

/// Protocol callbacks driven by one connection.
///
/// Calls arrive serially for a given connection. Payload slices are only
/// valid for the duration of the call.
#[tonic::async_trait]
pub trait StreamHandler: Send + Sync {
    async fn on_publish(&self, name: &str) -> Result<(), SessionError>;

    /// Metadata problems never end the stream, so nothing is returned.
    async fn on_metadata_frame(&self, timestamp: u32, payload: &[u8]);

    async fn on_audio_frame(&self, timestamp: u32, payload: &[u8]) -> Result<(), SessionError>;

    async fn on_video_frame(&self, timestamp: u32, payload: &[u8]) -> Result<(), SessionError>;

    async fn on_close(&self);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Status {
    Idle,
    Publishing,
    Closed,
}

type SharedMuxer = Arc<tokio::sync::Mutex<FlvMuxer<ChildStdin>>>;

enum State {
    Idle,
    Publishing(Publishing),
    Closed,
}

impl State {
    fn status(&self) -> Status {
        match self {
            State::Idle => Status::Idle,
            State::Publishing(_) => Status::Publishing,
            State::Closed => Status::Closed,
        }
    }
}

/// Everything acquired on entering `Publishing`.
struct Publishing {
    name: String,
    muxer: SharedMuxer,
    transcoder: Transcoder,
    _claim: StreamClaim,
}

impl Publishing {
    /// Ends the stream: pipe first, then the process. Never waits on a frame
    /// write; a writer holding the pipe sees the close signal and drops the
    /// pipe itself.
    fn release(self) {
        let Publishing {
            name,
            muxer,
            transcoder,
            _claim,
        } = self;

        match muxer.try_lock() {
            Ok(mut muxer) => muxer.close(),
            Err(_) => debug!("Session '{}': write in flight, pipe left to the writer", name),
        }
        transcoder.terminate();
        info!("Session '{}': released transcoder and pipe", name);
    }
}

struct Shared {
    state: Mutex<State>,
    // last known name, kept after close for reporting
    name: Mutex<Option<String>>,
    // flips to true once, when the session closes
    closed: watch::Sender<bool>,
    tags_forwarded: AtomicU64,
    bytes_forwarded: AtomicU64,
}

impl Shared {
    fn state(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn record(&self, muxer: &FlvMuxer<ChildStdin>) {
        self.tags_forwarded.store(muxer.tags_written(), Ordering::Relaxed);
        self.bytes_forwarded.store(muxer.bytes_written(), Ordering::Relaxed);
    }

    fn close(&self) {
        let previous = {
            let mut state = self.state();
            self.closed.send_replace(true);
            std::mem::replace(&mut *state, State::Closed)
        };
        match previous {
            State::Publishing(publishing) => publishing.release(),
            State::Idle => debug!("Session closed before publishing"),
            State::Closed => {}
        }
    }
}

/// Out-of-band view of a session, used by the registry and control service.
#[derive(Clone)]
pub struct SessionHandle {
    shared: Arc<Shared>,
}

impl SessionHandle {
    pub fn status(&self) -> Status {
        self.shared.state().status()
    }

    pub fn publishing_name(&self) -> Option<String> {
        self.shared
            .name
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    pub fn transcoder_pid(&self) -> Option<u32> {
        match &*self.shared.state() {
            State::Publishing(publishing) => publishing.transcoder.pid(),
            _ => None,
        }
    }

    /// Tags and bytes written to the transcoder so far, header included.
    pub fn forwarded(&self) -> (u64, u64) {
        (
            self.shared.tags_forwarded.load(Ordering::Relaxed),
            self.shared.bytes_forwarded.load(Ordering::Relaxed),
        )
    }

    /// Closes the session from outside the connection task. Idempotent,
    /// and returns without waiting for a frame write in progress.
    pub fn close(&self) {
        self.shared.close();
    }
}

/// Names currently being published, shared by all sessions of a server.
#[derive(Clone, Default)]
pub struct ActiveStreams {
    names: Arc<Mutex<HashSet<String>>>,
}

impl ActiveStreams {
    fn claim(&self, name: &str) -> Option<StreamClaim> {
        let mut names = self.names.lock().unwrap_or_else(|e| e.into_inner());
        if names.insert(name.to_string()) {
            Some(StreamClaim {
                name: name.to_string(),
                streams: self.clone(),
            })
        } else {
            None
        }
    }

    #[cfg(test)]
    pub fn contains(&self, name: &str) -> bool {
        self.names
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .contains(name)
    }
}

struct StreamClaim {
    name: String,
    streams: ActiveStreams,
}

impl Drop for StreamClaim {
    fn drop(&mut self) {
        self.streams
            .names
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&self.name);
    }
}

/// Per-connection ingest session: `Idle -> Publishing -> Closed`.
pub struct Session<L> {
    output: OutputRoot,
    launcher: Arc<L>,
    streams: ActiveStreams,
    shared: Arc<Shared>,
}

impl<L: Launcher> Session<L> {
    pub fn new(output: OutputRoot, launcher: Arc<L>, streams: ActiveStreams) -> Self {
        Session {
            output,
            launcher,
            streams,
            shared: Arc::new(Shared {
                state: Mutex::new(State::Idle),
                name: Mutex::new(None),
                closed: watch::Sender::new(false),
                tags_forwarded: AtomicU64::new(0),
                bytes_forwarded: AtomicU64::new(0),
            }),
        }
    }

    pub fn handle(&self) -> SessionHandle {
        SessionHandle {
            shared: self.shared.clone(),
        }
    }

    async fn start(&self, name: &str) -> Result<Publishing, SessionError> {
        let output = self.output.prepare(name).await?;
        let claim = self
            .streams
            .claim(&output.name)
            .ok_or_else(|| SessionError::AlreadyPublishing(output.name.clone()))?;

        let (transcoder, stdin) = Transcoder::spawn(self.launcher.command(&output))?;
        let muxer = match FlvMuxer::new(stdin).await {
            Ok(muxer) => muxer,
            Err(e) => {
                transcoder.terminate();
                return Err(SessionError::Startup(format!(
                    "failed to write flv header: {}",
                    e
                )));
            }
        };
        self.shared.record(&muxer);

        Ok(Publishing {
            name: output.name,
            muxer: Arc::new(tokio::sync::Mutex::new(muxer)),
            transcoder,
            _claim: claim,
        })
    }

    /// Muxer of the running stream, or `None` when frames must be ignored.
    fn active_muxer(&self) -> Option<SharedMuxer> {
        match &*self.shared.state() {
            State::Publishing(publishing) => Some(publishing.muxer.clone()),
            _ => None,
        }
    }

    async fn forward(&self, muxer: SharedMuxer, tag: FlvTag) {
        let mut closed = self.shared.closed.subscribe();
        let mut muxer = muxer.lock().await;
        // close may have started while we were waiting for the lock
        if muxer.is_closed() || *closed.borrow_and_update() {
            return;
        }

        tokio::select! {
            result = muxer.write_tag(&tag) => match result {
                Ok(()) => self.shared.record(&muxer),
                Err(e) => warn!(
                    "Failed to forward {:?} tag at {}ms: {}",
                    tag.tag_type(),
                    tag.timestamp,
                    e
                ),
            },
            _ = closed.changed() => {
                debug!("Close interrupted a {:?} tag write", tag.tag_type());
            }
        }

        // release skips a busy pipe, so the last writer closes it
        if *closed.borrow() {
            muxer.close();
        }
    }
}

#[tonic::async_trait]
impl<L: Launcher> StreamHandler for Session<L> {
    async fn on_publish(&self, name: &str) -> Result<(), SessionError> {
        info!("OnPublish: {:?}", name);

        match &*self.shared.state() {
            State::Idle => {}
            State::Publishing(publishing) => {
                return Err(SessionError::AlreadyPublishing(publishing.name.clone()))
            }
            State::Closed => {
                return Err(SessionError::InvalidRequest("session is closed".to_string()))
            }
        }
        if name.is_empty() {
            return Err(SessionError::InvalidRequest(
                "publishing name is empty".to_string(),
            ));
        }

        let publishing = self.start(name).await?;

        // a close may have landed while the transcoder was starting
        let abandoned = {
            let mut state = self.shared.state();
            if matches!(*state, State::Idle) {
                info!(
                    "Session '{}': publishing (transcoder pid {:?})",
                    publishing.name,
                    publishing.transcoder.pid()
                );
                *self.shared.name.lock().unwrap_or_else(|e| e.into_inner()) =
                    Some(publishing.name.clone());
                *state = State::Publishing(publishing);
                None
            } else {
                Some(publishing)
            }
        };

        match abandoned {
            None => Ok(()),
            Some(publishing) => {
                warn!("Session '{}': closed while starting, releasing", publishing.name);
                publishing.release();
                Err(SessionError::InvalidRequest(
                    "session closed during publish".to_string(),
                ))
            }
        }
    }

    async fn on_metadata_frame(&self, timestamp: u32, payload: &[u8]) {
        let Some(muxer) = self.active_muxer() else {
            return;
        };

        let script = match ScriptData::decode(payload) {
            Ok(script) => script,
            Err(e) => {
                error!("Failed to decode script data: {}", e);
                return;
            }
        };
        debug!("Forwarding script data '{}' at {}ms", script.name, timestamp);

        self.forward(
            muxer,
            FlvTag {
                timestamp,
                data: TagData::Script(script),
            },
        )
        .await;
    }

    async fn on_audio_frame(&self, timestamp: u32, payload: &[u8]) -> Result<(), SessionError> {
        let Some(muxer) = self.active_muxer() else {
            return Ok(());
        };

        let audio = AudioData::decode(payload)?;
        self.forward(
            muxer,
            FlvTag {
                timestamp,
                data: TagData::Audio(audio),
            },
        )
        .await;
        Ok(())
    }

    async fn on_video_frame(&self, timestamp: u32, payload: &[u8]) -> Result<(), SessionError> {
        let Some(muxer) = self.active_muxer() else {
            return Ok(());
        };

        let video = VideoData::decode(payload)?;
        if video.is_keyframe() {
            debug!("Keyframe at {}ms", timestamp);
        }
        self.forward(
            muxer,
            FlvTag {
                timestamp,
                data: TagData::Video(video),
            },
        )
        .await;
        Ok(())
    }

    async fn on_close(&self) {
        info!("Client disconnected");
        self.shared.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::output::OutputDir;
    use crate::transcoder::tests::{exited, wait_for_exit};
    use crate::transcoder::TranscoderProfile;
    use std::path::{Path, PathBuf};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;
    use tokio::process::Command;

    const CAPTURE: &str = "capture.flv";

    /// Stands in for ffmpeg: copies stdin into `<dir>/capture.flv`.
    #[derive(Default)]
    struct CaptureLauncher {
        spawned: AtomicUsize,
    }

    impl Launcher for CaptureLauncher {
        fn command(&self, output: &OutputDir) -> Command {
            self.spawned.fetch_add(1, Ordering::SeqCst);
            let mut command = Command::new("sh");
            command
                .arg("-c")
                .arg(format!("exec cat > {}", CAPTURE))
                .current_dir(&output.path);
            command
        }
    }

    /// Holds the pipe open without reading it. The shell forks, so killing
    /// it leaves `sleep` behind with the read end.
    struct StalledLauncher;

    impl Launcher for StalledLauncher {
        fn command(&self, output: &OutputDir) -> Command {
            let mut command = Command::new("sh");
            command
                .arg("-c")
                .arg("sleep 10; true")
                .current_dir(&output.path);
            command
        }
    }

    fn session(root: &Path) -> (Session<CaptureLauncher>, Arc<CaptureLauncher>) {
        let launcher = Arc::new(CaptureLauncher::default());
        let session = Session::new(
            OutputRoot::new(root.join("public")),
            launcher.clone(),
            ActiveStreams::default(),
        );
        (session, launcher)
    }

    async fn wait_for_len(path: &PathBuf, len: u64) -> Vec<u8> {
        for _ in 0..200 {
            if let Ok(data) = tokio::fs::read(path).await {
                if data.len() as u64 >= len {
                    return data;
                }
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("capture never reached {} bytes", len);
    }

    const VIDEO: [u8; 8] = [0x17, 0x01, 0x00, 0x00, 0x00, 0x65, 0x88, 0x84];

    #[tokio::test]
    async fn publish_forward_and_close() {
        let tmp = tempfile::tempdir().unwrap();
        let (session, launcher) = session(tmp.path());
        let handle = session.handle();

        session.on_publish("stream1").await.unwrap();
        assert_eq!(session.handle().status(), Status::Publishing);
        assert!(tmp.path().join("public/stream1").is_dir());
        assert_eq!(handle.publishing_name().as_deref(), Some("stream1"));
        let pid = handle.transcoder_pid().unwrap();

        session.on_video_frame(1234, &VIDEO).await.unwrap();
        assert_eq!(handle.forwarded(), (1, 13 + 11 + 8 + 4));

        let capture = tmp.path().join("public/stream1").join(CAPTURE);
        let data = wait_for_len(&capture, 13 + 11 + 8 + 4).await;
        assert_eq!(&data[..3], b"FLV");
        let tag = &data[13..];
        assert_eq!(tag[0], 9);
        assert_eq!(&tag[1..4], &[0, 0, 8]);
        assert_eq!(&tag[4..8], &[0x00, 0x04, 0xd2, 0x00]);
        assert_eq!(&tag[11..19], &VIDEO);

        session.on_close().await;
        assert_eq!(session.handle().status(), Status::Closed);
        assert_eq!(handle.transcoder_pid(), None);
        assert!(wait_for_exit(pid).await, "transcoder {} outlived the session", pid);
        assert_eq!(launcher.spawned.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn empty_name_is_invalid_request() {
        let tmp = tempfile::tempdir().unwrap();
        let (session, launcher) = session(tmp.path());

        let err = session.on_publish("").await.unwrap_err();
        assert!(matches!(err, SessionError::InvalidRequest(_)));
        assert_eq!(session.handle().status(), Status::Idle);
        assert_eq!(launcher.spawned.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn traversal_is_path_error() {
        let tmp = tempfile::tempdir().unwrap();
        let (session, launcher) = session(tmp.path());

        let err = session.on_publish("../../etc").await.unwrap_err();
        assert!(matches!(err, SessionError::Path(_)));
        assert_eq!(session.handle().status(), Status::Idle);
        assert!(!tmp.path().join("etc").exists());
        assert_eq!(launcher.spawned.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn missing_transcoder_is_startup_error() {
        let tmp = tempfile::tempdir().unwrap();
        let streams = ActiveStreams::default();
        let profile = TranscoderProfile {
            program: tmp.path().join("missing-ffmpeg"),
            ..TranscoderProfile::default()
        };
        let session = Session::new(
            OutputRoot::new(tmp.path().join("public")),
            Arc::new(profile),
            streams.clone(),
        );

        let err = session.on_publish("stream1").await.unwrap_err();
        assert!(matches!(err, SessionError::Startup(_)));
        assert_eq!(session.handle().status(), Status::Idle);
        assert!(!streams.contains("stream1"));
        assert_eq!(session.handle().forwarded(), (0, 0));
    }

    #[tokio::test]
    async fn second_publish_keeps_first_transcoder() {
        let tmp = tempfile::tempdir().unwrap();
        let (session, launcher) = session(tmp.path());

        session.on_publish("stream1").await.unwrap();
        let err = session.on_publish("stream2").await.unwrap_err();
        assert!(matches!(err, SessionError::AlreadyPublishing(name) if name == "stream1"));
        assert_eq!(session.handle().status(), Status::Publishing);
        assert_eq!(launcher.spawned.load(Ordering::SeqCst), 1);

        // the first pipe is still usable
        session.on_video_frame(0, &VIDEO).await.unwrap();
        assert_eq!(session.handle().forwarded().0, 1);
        session.on_close().await;
    }

    #[tokio::test]
    async fn concurrent_publish_of_same_name_is_rejected() {
        let tmp = tempfile::tempdir().unwrap();
        let launcher = Arc::new(CaptureLauncher::default());
        let streams = ActiveStreams::default();
        let root = OutputRoot::new(tmp.path().join("public"));
        let first = Session::new(root.clone(), launcher.clone(), streams.clone());
        let second = Session::new(root, launcher.clone(), streams.clone());

        first.on_publish("stream1").await.unwrap();
        let err = second.on_publish("./stream1").await.unwrap_err();
        assert!(matches!(err, SessionError::AlreadyPublishing(_)));
        assert_eq!(second.handle().status(), Status::Idle);

        // released with the first session
        first.on_close().await;
        assert!(!streams.contains("stream1"));
        second.on_publish("stream1").await.unwrap();
        second.on_close().await;
        assert_eq!(launcher.spawned.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn malformed_metadata_is_dropped() {
        let tmp = tempfile::tempdir().unwrap();
        let (session, _) = session(tmp.path());
        session.on_publish("stream1").await.unwrap();

        for payload in [&[][..], &[0xff, 0x01][..], &[0x02, 0x00, 0x0a][..]] {
            session.on_metadata_frame(0, payload).await;
            assert_eq!(session.handle().status(), Status::Publishing);
        }
        assert_eq!(session.handle().forwarded().0, 0);

        let metadata = rml_amf0::serialize(&vec![
            rml_amf0::Amf0Value::Utf8String("onMetaData".to_string()),
            rml_amf0::Amf0Value::Object(Default::default()),
        ])
        .unwrap();
        session.on_metadata_frame(0, &metadata).await;
        assert_eq!(session.handle().forwarded().0, 1);
        session.on_close().await;
    }

    #[tokio::test]
    async fn malformed_media_is_fatal_and_not_forwarded() {
        let tmp = tempfile::tempdir().unwrap();
        let (session, _) = session(tmp.path());
        session.on_publish("stream1").await.unwrap();

        let err = session.on_audio_frame(0, &[0xaf]).await.unwrap_err();
        assert!(matches!(err, SessionError::Decode(_)));
        let err = session.on_video_frame(0, &[]).await.unwrap_err();
        assert!(matches!(err, SessionError::Decode(_)));
        assert_eq!(session.handle().forwarded(), (0, 13));

        session.on_close().await;
    }

    #[tokio::test]
    async fn frames_after_close_are_ignored() {
        let tmp = tempfile::tempdir().unwrap();
        let (session, launcher) = session(tmp.path());
        session.on_publish("stream1").await.unwrap();
        session.on_close().await;

        session.on_video_frame(10, &VIDEO).await.unwrap();
        session.on_audio_frame(10, &[0xaf, 0x01, 0x21]).await.unwrap();
        session.on_metadata_frame(10, &[0x02]).await;
        // malformed frames are ignored too once closed
        session.on_video_frame(10, &[]).await.unwrap();
        assert_eq!(session.handle().forwarded().0, 0);

        assert!(session.on_publish("stream1").await.is_err());
        assert_eq!(session.handle().status(), Status::Closed);
        assert_eq!(launcher.spawned.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn close_is_idempotent() {
        let tmp = tempfile::tempdir().unwrap();
        let (session, _) = session(tmp.path());
        let handle = session.handle();
        session.on_publish("stream1").await.unwrap();

        handle.close();
        session.on_close().await;
        handle.close();
        assert_eq!(session.handle().status(), Status::Closed);
        assert_eq!(handle.status(), Status::Closed);
    }

    #[tokio::test]
    async fn close_from_idle() {
        let tmp = tempfile::tempdir().unwrap();
        let (session, launcher) = session(tmp.path());
        session.on_close().await;
        assert_eq!(session.handle().status(), Status::Closed);
        assert_eq!(launcher.spawned.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn frames_before_publish_are_ignored() {
        let tmp = tempfile::tempdir().unwrap();
        let (session, _) = session(tmp.path());
        session.on_video_frame(0, &VIDEO).await.unwrap();
        session.on_audio_frame(0, &[]).await.unwrap();
        assert_eq!(session.handle().status(), Status::Idle);
    }

    #[tokio::test]
    async fn out_of_band_close_races_frames() {
        let tmp = tempfile::tempdir().unwrap();
        let (session, _) = session(tmp.path());
        let handle = session.handle();
        session.on_publish("stream1").await.unwrap();

        let closer = tokio::spawn(async move { handle.close() });
        for ts in 0..50 {
            session.on_video_frame(ts, &VIDEO).await.unwrap();
        }
        closer.await.unwrap();
        assert_eq!(session.handle().status(), Status::Closed);
    }

    #[tokio::test]
    async fn out_of_band_close_unblocks_a_stalled_write() {
        let tmp = tempfile::tempdir().unwrap();
        let session = Arc::new(Session::new(
            OutputRoot::new(tmp.path().join("public")),
            Arc::new(StalledLauncher),
            ActiveStreams::default(),
        ));
        let handle = session.handle();
        session.on_publish("stream1").await.unwrap();
        let pid = handle.transcoder_pid().unwrap();
        assert!(!exited(pid));

        let mut frame = vec![0u8; 64 * 1024];
        frame[..5].copy_from_slice(&VIDEO[..5]);
        let writer = {
            let session = session.clone();
            tokio::spawn(async move {
                let mut ts = 0;
                while session.handle().status() == Status::Publishing {
                    session.on_video_frame(ts, &frame).await.unwrap();
                    ts += 40;
                }
            })
        };

        // wait for the pipe to fill up
        let mut last = handle.forwarded();
        loop {
            tokio::time::sleep(Duration::from_millis(100)).await;
            let now = handle.forwarded();
            if now == last {
                break;
            }
            last = now;
        }
        assert!(!writer.is_finished());

        handle.close();
        assert_eq!(handle.status(), Status::Closed);
        tokio::time::timeout(Duration::from_secs(5), writer)
            .await
            .expect("stalled writer was not released by close")
            .unwrap();
        assert!(wait_for_exit(pid).await);
    }
}
