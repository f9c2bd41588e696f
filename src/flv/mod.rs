//! Thin FLV adapter: decodes RTMP media payloads into tags and re-muxes
//! them into a container stream for the transcoder.

mod muxer;
mod tag;

pub use muxer::FlvMuxer;
pub use tag::{AudioData, FlvTag, ScriptData, TagData, VideoData};
