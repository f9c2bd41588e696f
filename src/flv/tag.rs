use std::io::Cursor;

use bytes::{BufMut, Bytes, BytesMut};
use rml_amf0::Amf0Value;

use crate::error::DecodeError;

pub const SOUND_FORMAT_AAC: u8 = 10;
pub const CODEC_ID_AVC: u8 = 7;
pub const CODEC_ID_HEVC: u8 = 12;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TagType {
    Audio = 8,
    Video = 9,
    ScriptData = 18,
}

#[derive(Debug, Clone, PartialEq)]
pub struct AudioData {
    pub sound_format: u8,
    pub sound_rate: u8,
    pub sound_size: u8,
    pub sound_type: u8,
    /// Present for AAC only: 0 = sequence header, 1 = raw frame.
    pub aac_packet_type: Option<u8>,
    pub data: Bytes,
}

impl AudioData {
    /// Decodes an FLV audio tag body. The remaining bytes are copied, the
    /// input slice does not need to outlive the call.
    pub fn decode(payload: &[u8]) -> Result<Self, DecodeError> {
        let (&flags, rest) = payload.split_first().ok_or(DecodeError::Empty("audio"))?;
        let sound_format = flags >> 4;

        let (aac_packet_type, body) = if sound_format == SOUND_FORMAT_AAC {
            let (&packet_type, body) = rest.split_first().ok_or(DecodeError::Truncated {
                kind: "aac",
                need: 2,
                got: payload.len(),
            })?;
            (Some(packet_type), body)
        } else {
            (None, rest)
        };

        Ok(AudioData {
            sound_format,
            sound_rate: (flags >> 2) & 0x03,
            sound_size: (flags >> 1) & 0x01,
            sound_type: flags & 0x01,
            aac_packet_type,
            data: Bytes::copy_from_slice(body),
        })
    }

    fn encode_into(&self, buf: &mut BytesMut) {
        buf.put_u8(
            (self.sound_format << 4)
                | ((self.sound_rate & 0x03) << 2)
                | ((self.sound_size & 0x01) << 1)
                | (self.sound_type & 0x01),
        );
        if let Some(packet_type) = self.aac_packet_type {
            buf.put_u8(packet_type);
        }
        buf.put_slice(&self.data);
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct VideoData {
    pub frame_type: u8,
    pub codec_id: u8,
    /// AVC/HEVC packet type and composition time offset.
    pub packet: Option<(u8, i32)>,
    pub data: Bytes,
}

impl VideoData {
    pub fn decode(payload: &[u8]) -> Result<Self, DecodeError> {
        let (&flags, rest) = payload.split_first().ok_or(DecodeError::Empty("video"))?;
        let codec_id = flags & 0x0f;

        let (packet, body) = if codec_id == CODEC_ID_AVC || codec_id == CODEC_ID_HEVC {
            if rest.len() < 4 {
                return Err(DecodeError::Truncated {
                    kind: "avc",
                    need: 5,
                    got: payload.len(),
                });
            }
            let packet_type = rest[0];
            let composition_time = sign_extend_24(
                (u32::from(rest[1]) << 16) | (u32::from(rest[2]) << 8) | u32::from(rest[3]),
            );
            (Some((packet_type, composition_time)), &rest[4..])
        } else {
            (None, rest)
        };

        Ok(VideoData {
            frame_type: flags >> 4,
            codec_id,
            packet,
            data: Bytes::copy_from_slice(body),
        })
    }

    pub fn is_keyframe(&self) -> bool {
        self.frame_type == 1
    }

    fn encode_into(&self, buf: &mut BytesMut) {
        buf.put_u8((self.frame_type << 4) | (self.codec_id & 0x0f));
        if let Some((packet_type, composition_time)) = self.packet {
            buf.put_u8(packet_type);
            let cts = (composition_time as u32) & 0x00ff_ffff;
            buf.put_u8((cts >> 16) as u8);
            buf.put_u8((cts >> 8) as u8);
            buf.put_u8(cts as u8);
        }
        buf.put_slice(&self.data);
    }
}

fn sign_extend_24(value: u32) -> i32 {
    ((value << 8) as i32) >> 8
}

/// A script data record such as `onMetaData` followed by its values.
#[derive(Debug, Clone, PartialEq)]
pub struct ScriptData {
    pub name: String,
    pub values: Vec<Amf0Value>,
}

impl ScriptData {
    pub fn decode(payload: &[u8]) -> Result<Self, DecodeError> {
        let mut cursor = Cursor::new(payload);
        let mut values = rml_amf0::deserialize(&mut cursor)
            .map_err(|e| DecodeError::Script(format!("{:?}", e)))?;

        if values.len() < 2 {
            return Err(DecodeError::Script(format!(
                "expected a name and a value, got {} amf0 values",
                values.len()
            )));
        }
        let name = match values.remove(0) {
            Amf0Value::Utf8String(name) => name,
            other => {
                return Err(DecodeError::Script(format!(
                    "record name is not a string: {:?}",
                    other
                )))
            }
        };

        Ok(ScriptData { name, values })
    }

    fn encode_into(&self, buf: &mut BytesMut) -> Result<(), String> {
        let mut values = Vec::with_capacity(self.values.len() + 1);
        values.push(Amf0Value::Utf8String(self.name.clone()));
        values.extend(self.values.iter().cloned());
        let bytes = rml_amf0::serialize(&values).map_err(|e| format!("{:?}", e))?;
        buf.put_slice(&bytes);
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum TagData {
    Audio(AudioData),
    Video(VideoData),
    Script(ScriptData),
}

#[derive(Debug, Clone, PartialEq)]
pub struct FlvTag {
    pub timestamp: u32,
    pub data: TagData,
}

impl FlvTag {
    pub fn tag_type(&self) -> TagType {
        match self.data {
            TagData::Audio(_) => TagType::Audio,
            TagData::Video(_) => TagType::Video,
            TagData::Script(_) => TagType::ScriptData,
        }
    }

    pub(crate) fn encode_body(&self) -> Result<BytesMut, String> {
        let mut buf = BytesMut::new();
        match &self.data {
            TagData::Audio(audio) => audio.encode_into(&mut buf),
            TagData::Video(video) => video.encode_into(&mut buf),
            TagData::Script(script) => script.encode_into(&mut buf)?,
        }
        Ok(buf)
    }
}
