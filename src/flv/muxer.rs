use std::io;

use bytes::{BufMut, BytesMut};
use tokio::io::{AsyncWrite, AsyncWriteExt};

use super::tag::FlvTag;

const TAG_HEADER_LEN: usize = 11;
const FLAG_AUDIO: u8 = 0x04;
const FLAG_VIDEO: u8 = 0x01;

/// Writes a contiguous FLV stream into `W`.
///
/// The file header goes out on construction; afterwards every tag is
/// written with a single `write_all` so a slow reader applies backpressure
/// to the caller.
pub struct FlvMuxer<W> {
    writer: Option<W>,
    tags_written: u64,
    bytes_written: u64,
}

impl<W: AsyncWrite + Unpin> FlvMuxer<W> {
    pub async fn new(mut writer: W) -> io::Result<Self> {
        let mut header = BytesMut::with_capacity(13);
        header.put_slice(b"FLV");
        header.put_u8(1);
        header.put_u8(FLAG_AUDIO | FLAG_VIDEO);
        header.put_u32(9);
        // PreviousTagSize0
        header.put_u32(0);
        writer.write_all(&header).await?;

        Ok(FlvMuxer {
            writer: Some(writer),
            tags_written: 0,
            bytes_written: header.len() as u64,
        })
    }

    pub async fn write_tag(&mut self, tag: &FlvTag) -> io::Result<()> {
        let writer = self
            .writer
            .as_mut()
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotConnected, "muxer is closed"))?;

        let body = tag
            .encode_body()
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
        if body.len() > 0x00ff_ffff {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("tag body of {} bytes does not fit in 24 bits", body.len()),
            ));
        }

        let mut buf = BytesMut::with_capacity(TAG_HEADER_LEN + body.len() + 4);
        buf.put_u8(tag.tag_type() as u8);
        put_u24(&mut buf, body.len() as u32);
        put_u24(&mut buf, tag.timestamp & 0x00ff_ffff);
        buf.put_u8((tag.timestamp >> 24) as u8);
        // stream id, always zero
        put_u24(&mut buf, 0);
        buf.put_slice(&body);
        buf.put_u32((TAG_HEADER_LEN + body.len()) as u32);

        writer.write_all(&buf).await?;
        self.tags_written += 1;
        self.bytes_written += buf.len() as u64;
        Ok(())
    }

    /// Drops the underlying writer, which signals end-of-stream to the reader.
    pub fn close(&mut self) {
        self.writer = None;
    }

    pub fn is_closed(&self) -> bool {
        self.writer.is_none()
    }

    pub fn tags_written(&self) -> u64 {
        self.tags_written
    }

    pub fn bytes_written(&self) -> u64 {
        self.bytes_written
    }
}

fn put_u24(buf: &mut BytesMut, value: u32) {
    buf.put_u8((value >> 16) as u8);
    buf.put_u8((value >> 8) as u8);
    buf.put_u8(value as u8);
}
