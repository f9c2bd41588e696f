use std::net::SocketAddr;
use std::path::PathBuf;

use clap::{ArgAction, Parser};

use crate::transcoder::TranscoderProfile;

/// Process-wide settings, read once at startup after `.env` is loaded.
#[derive(Parser, Debug, Clone)]
#[command(name = "kawa-hls")]
#[command(about = "RTMP ingest publishing rolling HLS playlists", long_about = None)]
pub struct Config {
    /// RTMP listen address
    #[arg(long, env = "RTMP_ADDR", default_value = "0.0.0.0:1935")]
    pub rtmp_addr: SocketAddr,

    /// gRPC control service address
    #[arg(long, env = "GRPC_ADDR", default_value = "[::1]:50051")]
    pub grpc_addr: SocketAddr,

    /// Directory holding one subdirectory per published stream
    #[arg(long, env = "OUTPUT_ROOT", default_value = "public")]
    pub output_root: PathBuf,

    /// Transcoder binary
    #[arg(long, env = "FFMPEG_PATH", default_value = "ffmpeg")]
    pub ffmpeg_path: PathBuf,

    /// Segment duration in seconds
    #[arg(long, env = "HLS_TIME", default_value_t = 2, value_parser = clap::value_parser!(u32).range(1..))]
    pub hls_time: u32,

    /// Number of segments kept in the playlist
    #[arg(long, env = "HLS_LIST_SIZE", default_value_t = 5, value_parser = clap::value_parser!(u32).range(1..))]
    pub hls_list_size: u32,

    /// Ask ffmpeg not to buffer input
    #[arg(long, env = "HLS_LOW_LATENCY", default_value_t = true, action = ArgAction::Set)]
    pub hls_low_latency: bool,

    /// Remove playlists and segments on SIGINT/SIGTERM
    #[arg(long, env = "CLEANUP_ON_SHUTDOWN", default_value_t = true, action = ArgAction::Set)]
    pub cleanup_on_shutdown: bool,
}

impl Config {
    pub fn profile(&self) -> TranscoderProfile {
        TranscoderProfile {
            program: self.ffmpeg_path.clone(),
            segment_seconds: self.hls_time,
            list_size: self.hls_list_size,
            low_latency: self.hls_low_latency,
            ..TranscoderProfile::default()
        }
    }
}
