use std::time::Duration;

#[cfg(not(feature = "openh264"))]
use frame_bus::codec::{delta_decoder_factory, delta_encoder_factory};
use frame_bus::consumer::NullSink;
use frame_bus::stats::CountersSnapshot;

mod session;
mod source;

use session::{Session, SessionConfig};
use source::SyntheticSource;

/// Final report printed on shutdown, one JSON object on stdout.
#[derive(serde::Serialize)]
struct SessionReport {
    width: u32,
    height: u32,
    fps: u32,
    num_streams: u32,
    num_consumers: usize,
    pool_size: usize,
    frames_in: u64,
    producer_busy_drops: u64,
    encoded: u64,
    encode_errors: u64,
    keyframes_encoded: u64,
    keyframe_requests: u64,
    notify_failures: u64,
    pool_published: u64,
    pool_dropped_busy: u64,
    pool_dropped_too_large: u64,
    consumer_busy_drops: u64,
    decode_errors: u64,
    decoded: u64,
}

fn env_or<T: std::str::FromStr>(key: &str, default: T) -> T {
    match std::env::var(key) {
        Ok(value) => match value.parse() {
            Ok(parsed) => parsed,
            Err(_) => {
                log::warn!("ignoring unparseable {key}={value}");
                default
            }
        },
        Err(_) => default,
    }
}

fn config_from_env() -> SessionConfig {
    let defaults = SessionConfig::default();
    SessionConfig {
        width: env_or("STREAMFAN_WIDTH", defaults.width),
        height: env_or("STREAMFAN_HEIGHT", defaults.height),
        fps: env_or("STREAMFAN_FPS", defaults.fps),
        num_streams: env_or("STREAMFAN_STREAMS", defaults.num_streams),
        num_consumers: env_or("STREAMFAN_CONSUMERS", defaults.num_consumers),
        pool_size: env_or("STREAMFAN_POOL_SIZE", defaults.pool_size),
        max_frame_size: env_or("STREAMFAN_MAX_FRAME_SIZE", defaults.max_frame_size),
        bitrate: env_or("STREAMFAN_BITRATE", defaults.bitrate),
        keyframe_interval: env_or("STREAMFAN_KEYFRAME_INTERVAL", defaults.keyframe_interval),
        use_gpu: env_or("STREAMFAN_GPU", true),
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    env_logger::init();

    let config = config_from_env();
    let duration = Duration::from_secs(env_or("STREAMFAN_DURATION_SECS", 10u64));

    #[cfg(feature = "openh264")]
    let (encoder_factory, decoder_factory) = (
        frame_bus::h264::h264_encoder_factory(),
        frame_bus::h264::h264_decoder_factory(),
    );
    #[cfg(not(feature = "openh264"))]
    let (encoder_factory, decoder_factory) = (delta_encoder_factory(), delta_decoder_factory());

    let source = Box::new(SyntheticSource::new(config.width, config.height));
    let session = Session::start(
        config.clone(),
        encoder_factory,
        decoder_factory,
        |_consumer_id| Box::new(NullSink),
        source,
    )
    .await?;

    tokio::select! {
        _ = tokio::time::sleep(duration) => {
            log::info!("run duration elapsed: {:?}", session.counters());
        }
        _ = tokio::signal::ctrl_c() => {
            log::info!("interrupted, shutting down: {:?}", session.counters());
        }
    }

    let pool = std::sync::Arc::clone(session.pool());
    let snapshot = session.teardown().await?;
    let report = build_report(&config, &snapshot, &pool);
    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(())
}

fn build_report(
    config: &SessionConfig,
    snapshot: &CountersSnapshot,
    pool: &frame_bus::pool::FramePool,
) -> SessionReport {
    use std::sync::atomic::Ordering;
    let pool_counters = pool.counters();
    SessionReport {
        width: config.width,
        height: config.height,
        fps: config.fps,
        num_streams: config.num_streams,
        num_consumers: config.num_consumers,
        pool_size: config.pool_size,
        frames_in: snapshot.frames_in,
        producer_busy_drops: snapshot.producer_busy_drops,
        encoded: snapshot.encoded,
        encode_errors: snapshot.encode_errors,
        keyframes_encoded: snapshot.keyframes_encoded,
        keyframe_requests: snapshot.keyframe_requests,
        notify_failures: snapshot.notify_failures,
        pool_published: pool_counters.published.load(Ordering::Relaxed),
        pool_dropped_busy: pool_counters.dropped_busy.load(Ordering::Relaxed),
        pool_dropped_too_large: pool_counters.dropped_too_large.load(Ordering::Relaxed),
        consumer_busy_drops: snapshot.consumer_busy_drops,
        decode_errors: snapshot.decode_errors,
        decoded: snapshot.decoded,
    }
}
