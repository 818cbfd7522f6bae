use std::sync::Arc;

use bytes::Bytes;

use crate::frame::{DecodedFrame, EncodedFrame, RawFrame};

/// Single encode capability: one raw frame in, one encoded payload out. The
/// bitstream format is opaque to the pipeline.
pub trait FrameEncoder: Send {
    fn encode(&mut self, frame: &RawFrame, force_keyframe: bool) -> anyhow::Result<EncodedFrame>;
}

/// Single decode capability, one instance per output stream.
pub trait FrameDecoder: Send {
    fn decode(&mut self, payload: &[u8], width: u32, height: u32) -> anyhow::Result<DecodedFrame>;
}

pub type EncoderFactory =
    Arc<dyn Fn(&EncoderSettings) -> anyhow::Result<Box<dyn FrameEncoder>> + Send + Sync>;
pub type DecoderFactory =
    Arc<dyn Fn(u32, u32) -> anyhow::Result<Box<dyn FrameDecoder>> + Send + Sync>;

#[derive(Debug, Clone)]
pub struct EncoderSettings {
    pub width: u32,
    pub height: u32,
    pub bitrate: u64,
    pub keyframe_interval: u64,
}

impl Default for EncoderSettings {
    fn default() -> Self {
        Self {
            width: 1920,
            height: 1080,
            bitrate: 1_000_000,
            keyframe_interval: 25,
        }
    }
}

const FRAME_KEY: u8 = b'K';
const FRAME_DELTA: u8 = b'D';
const HEADER_LEN: usize = 9;

/// Toy predictive codec: keyframes carry the literal I420 frame, delta
/// frames carry an XOR against the previous frame. A delta is only decodable
/// with an intact reference, so dropped frames produce real decode errors
/// and exercise the keyframe-request recovery path without an external
/// codec. Payload layout: 1-byte frame type, u32 LE width, u32 LE height,
/// frame bytes.
pub struct DeltaEncoder {
    settings: EncoderSettings,
    previous: Option<Vec<u8>>,
    frame_index: u64,
}

impl DeltaEncoder {
    pub fn new(settings: EncoderSettings) -> anyhow::Result<Self> {
        if settings.width == 0 || settings.height == 0 {
            anyhow::bail!(
                "invalid encoder dimensions {}x{}",
                settings.width,
                settings.height
            );
        }
        Ok(Self {
            settings,
            previous: None,
            frame_index: 0,
        })
    }
}

fn encode_header(out: &mut Vec<u8>, frame_type: u8, width: u32, height: u32) {
    out.push(frame_type);
    out.extend_from_slice(&width.to_le_bytes());
    out.extend_from_slice(&height.to_le_bytes());
}

fn decode_header(payload: &[u8]) -> anyhow::Result<(u8, u32, u32)> {
    if payload.len() < HEADER_LEN {
        anyhow::bail!("payload of {} bytes is shorter than the header", payload.len());
    }
    let width = u32::from_le_bytes(payload[1..5].try_into()?);
    let height = u32::from_le_bytes(payload[5..9].try_into()?);
    Ok((payload[0], width, height))
}

impl FrameEncoder for DeltaEncoder {
    fn encode(&mut self, frame: &RawFrame, force_keyframe: bool) -> anyhow::Result<EncodedFrame> {
        let expected = RawFrame::i420_len(frame.width, frame.height);
        if frame.data.len() != expected {
            anyhow::bail!(
                "frame is {} bytes, expected {} for {}x{} I420",
                frame.data.len(),
                expected,
                frame.width,
                frame.height
            );
        }

        let interval_hit = self.settings.keyframe_interval > 0
            && self.frame_index % self.settings.keyframe_interval == 0;
        let keyframe = force_keyframe || interval_hit || self.previous.is_none();
        self.frame_index += 1;

        let mut out = Vec::with_capacity(HEADER_LEN + frame.data.len());
        if keyframe {
            encode_header(&mut out, FRAME_KEY, frame.width, frame.height);
            out.extend_from_slice(&frame.data);
        } else {
            let previous = self.previous.as_ref().expect("delta without reference");
            encode_header(&mut out, FRAME_DELTA, frame.width, frame.height);
            out.extend(frame.data.iter().zip(previous).map(|(a, b)| a ^ b));
        }
        self.previous = Some(frame.data.to_vec());

        Ok(EncodedFrame {
            data: Bytes::from(out),
            is_keyframe: keyframe,
        })
    }
}

pub struct DeltaDecoder {
    previous: Option<Vec<u8>>,
}

impl DeltaDecoder {
    pub fn new() -> Self {
        Self { previous: None }
    }
}

impl Default for DeltaDecoder {
    fn default() -> Self {
        Self::new()
    }
}

impl FrameDecoder for DeltaDecoder {
    fn decode(&mut self, payload: &[u8], width: u32, height: u32) -> anyhow::Result<DecodedFrame> {
        let (frame_type, w, h) = decode_header(payload)?;
        if w != width || h != height {
            anyhow::bail!("payload is {w}x{h}, stream expects {width}x{height}");
        }
        let body = &payload[HEADER_LEN..];
        if body.len() != RawFrame::i420_len(w, h) {
            anyhow::bail!("payload body of {} bytes does not match {w}x{h} I420", body.len());
        }

        let data = match frame_type {
            FRAME_KEY => body.to_vec(),
            FRAME_DELTA => {
                let previous = self
                    .previous
                    .as_ref()
                    .ok_or_else(|| anyhow::anyhow!("delta frame without reference"))?;
                body.iter().zip(previous).map(|(a, b)| a ^ b).collect()
            }
            other => anyhow::bail!("unknown frame type {other:#04x}"),
        };
        self.previous = Some(data.clone());

        Ok(DecodedFrame {
            data,
            width: w,
            height: h,
        })
    }
}

/// Factories for the built-in delta codec; the default wiring for tests and
/// the synthetic demo.
pub fn delta_encoder_factory() -> EncoderFactory {
    Arc::new(|settings| Ok(Box::new(DeltaEncoder::new(settings.clone())?) as Box<dyn FrameEncoder>))
}

pub fn delta_decoder_factory() -> DecoderFactory {
    Arc::new(|_width, _height| Ok(Box::new(DeltaDecoder::new()) as Box<dyn FrameDecoder>))
}

#[cfg(test)]
#[path = "codec_test.rs"]
mod codec_test;
