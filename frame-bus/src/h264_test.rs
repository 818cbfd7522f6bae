use crate::codec::{EncoderSettings, FrameDecoder, FrameEncoder};
use crate::frame::RawFrame;
use crate::h264::{H264Decoder, H264Encoder};

const W: u32 = 64;
const H: u32 = 64;

fn settings() -> EncoderSettings {
    EncoderSettings {
        width: W,
        height: H,
        bitrate: 200_000,
        keyframe_interval: 25,
    }
}

fn gray_frame(luma: u8) -> RawFrame {
    let y_size = (W * H) as usize;
    let mut data = vec![luma; y_size];
    data.extend(std::iter::repeat(128u8).take(y_size / 2));
    RawFrame::new(data, W, H)
}

#[test]
fn encoder_builds_and_first_frame_is_self_contained() -> anyhow::Result<()> {
    let mut encoder = H264Encoder::new(settings())?;
    let encoded = encoder.encode(&gray_frame(100), false)?;
    assert!(encoded.is_keyframe);
    assert!(!encoded.data.is_empty());
    Ok(())
}

#[test]
fn forced_keyframe_after_deltas() -> anyhow::Result<()> {
    let mut encoder = H264Encoder::new(settings())?;
    for luma in [100, 110, 120] {
        encoder.encode(&gray_frame(luma), false)?;
    }
    let forced = encoder.encode(&gray_frame(130), true)?;
    assert!(forced.is_keyframe, "forced encode must come back intra");
    Ok(())
}

#[test]
fn bitstream_round_trips_to_right_geometry() -> anyhow::Result<()> {
    let mut encoder = H264Encoder::new(settings())?;
    let mut decoder = H264Decoder::new()?;

    // The decoder may buffer its first packets before emitting a picture.
    for luma in 0..10u8 {
        let encoded = encoder.encode(&gray_frame(100 + luma), false)?;
        if let Ok(decoded) = decoder.decode(&encoded.data, W, H) {
            assert_eq!((decoded.width, decoded.height), (W, H));
            assert_eq!(decoded.data.len(), RawFrame::i420_len(W, H));
            return Ok(());
        }
    }
    anyhow::bail!("decoder produced no picture after 10 frames");
}

#[test]
fn wrong_sized_input_is_rejected() -> anyhow::Result<()> {
    let mut encoder = H264Encoder::new(settings())?;
    let bad = RawFrame::new(vec![0u8; 17], W, H);
    assert!(encoder.encode(&bad, false).is_err());
    Ok(())
}
