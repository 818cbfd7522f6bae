//! Real H.264 codec backend over the `openh264` crate (feature `openh264`).
//! The pipeline itself never looks inside the bitstream; these are just
//! `FrameEncoder`/`FrameDecoder` implementations the session can wire in
//! instead of the built-in delta codec.

use std::sync::Arc;

use bytes::Bytes;
use openh264::OpenH264API;
use openh264::decoder::{Decoder, DecoderConfig};
use openh264::encoder::{Encoder, EncoderConfig, FrameType};
use openh264::formats::YUVSource;

use crate::codec::{
    DecoderFactory, EncoderFactory, EncoderSettings, FrameDecoder, FrameEncoder,
};
use crate::frame::{DecodedFrame, EncodedFrame, RawFrame};

/// Packed I420 frame viewed as an openh264 source.
struct I420View<'a> {
    data: &'a [u8],
    width: usize,
    height: usize,
}

impl YUVSource for I420View<'_> {
    fn dimensions(&self) -> (usize, usize) {
        (self.width, self.height)
    }

    fn strides(&self) -> (usize, usize, usize) {
        (self.width, self.width / 2, self.width / 2)
    }

    fn y(&self) -> &[u8] {
        &self.data[..self.width * self.height]
    }

    fn u(&self) -> &[u8] {
        let y_size = self.width * self.height;
        &self.data[y_size..y_size + y_size / 4]
    }

    fn v(&self) -> &[u8] {
        let y_size = self.width * self.height;
        &self.data[y_size + y_size / 4..y_size + y_size / 2]
    }
}

pub struct H264Encoder {
    encoder: Encoder,
    settings: EncoderSettings,
}

impl H264Encoder {
    pub fn new(settings: EncoderSettings) -> anyhow::Result<Self> {
        let api = OpenH264API::from_source();
        // No intra-period knob in this openh264 release; keyframe cadence is
        // driven entirely by `force_intra_frame` via the request path.
        let config = EncoderConfig::new().set_bitrate_bps(settings.bitrate as u32);
        let encoder = Encoder::with_api_config(api, config)
            .map_err(|e| anyhow::anyhow!("openh264 encoder init: {e}"))?;
        Ok(Self { encoder, settings })
    }
}

impl FrameEncoder for H264Encoder {
    fn encode(&mut self, frame: &RawFrame, force_keyframe: bool) -> anyhow::Result<EncodedFrame> {
        let expected = RawFrame::i420_len(frame.width, frame.height);
        anyhow::ensure!(
            frame.data.len() == expected,
            "frame is {} bytes, expected {expected} for {}x{} I420",
            frame.data.len(),
            frame.width,
            frame.height
        );
        anyhow::ensure!(
            frame.width == self.settings.width && frame.height == self.settings.height,
            "frame is {}x{}, encoder configured for {}x{}",
            frame.width,
            frame.height,
            self.settings.width,
            self.settings.height
        );

        if force_keyframe {
            self.encoder.force_intra_frame();
        }
        let source = I420View {
            data: &frame.data,
            width: frame.width as usize,
            height: frame.height as usize,
        };
        let bitstream = self
            .encoder
            .encode(&source)
            .map_err(|e| anyhow::anyhow!("openh264 encode: {e}"))?;
        let is_keyframe = matches!(bitstream.frame_type(), FrameType::IDR | FrameType::I);
        Ok(EncodedFrame {
            data: Bytes::from(bitstream.to_vec()),
            is_keyframe,
        })
    }
}

pub struct H264Decoder {
    decoder: Decoder,
}

impl H264Decoder {
    pub fn new() -> anyhow::Result<Self> {
        let api = OpenH264API::from_source();
        let decoder = Decoder::with_api_config(api, DecoderConfig::new())
            .map_err(|e| anyhow::anyhow!("openh264 decoder init: {e}"))?;
        Ok(Self { decoder })
    }
}

impl FrameDecoder for H264Decoder {
    fn decode(&mut self, payload: &[u8], width: u32, height: u32) -> anyhow::Result<DecodedFrame> {
        let decoded = self
            .decoder
            .decode(payload)
            .map_err(|e| anyhow::anyhow!("openh264 decode: {e}"))?
            .ok_or_else(|| anyhow::anyhow!("no frame produced (waiting for keyframe?)"))?;

        let (w, h) = decoded.dimensions();
        anyhow::ensure!(
            w == width as usize && h == height as usize,
            "decoded {w}x{h}, stream expects {width}x{height}"
        );

        // Repack the strided planes into tight I420.
        let (stride_y, stride_u, stride_v) = decoded.strides();
        let mut data = Vec::with_capacity(RawFrame::i420_len(width, height));
        for row in 0..h {
            data.extend_from_slice(&decoded.y()[row * stride_y..row * stride_y + w]);
        }
        for row in 0..h / 2 {
            data.extend_from_slice(&decoded.u()[row * stride_u..row * stride_u + w / 2]);
        }
        for row in 0..h / 2 {
            data.extend_from_slice(&decoded.v()[row * stride_v..row * stride_v + w / 2]);
        }

        Ok(DecodedFrame {
            data,
            width,
            height,
        })
    }
}

pub fn h264_encoder_factory() -> EncoderFactory {
    Arc::new(|settings| Ok(Box::new(H264Encoder::new(settings.clone())?) as Box<dyn FrameEncoder>))
}

pub fn h264_decoder_factory() -> DecoderFactory {
    Arc::new(|_width, _height| Ok(Box::new(H264Decoder::new()?) as Box<dyn FrameDecoder>))
}

#[cfg(test)]
#[path = "h264_test.rs"]
mod h264_test;
