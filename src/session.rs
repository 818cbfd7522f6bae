use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::time::Duration;

use anyhow::Context;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

use frame_bus::codec::{DecoderFactory, EncoderFactory, EncoderSettings};
use frame_bus::consumer::{ConsumerContext, ConsumerTask, RenderSink};
use frame_bus::frame::{
    CaptureSender, ConsumerCmd, ConsumerEvent, EventReceiver, NotifySender, RawFrame,
};
use frame_bus::gpu::{Accelerator, YuvPackKernel, rgba_to_i420};
use frame_bus::pool::FramePool;
use frame_bus::producer::{ProducerContext, ProducerTask};
use frame_bus::readback::{DEFAULT_DEPTH, ReadbackRing};
use frame_bus::stats::{CountersSnapshot, PipelineCounters};

use crate::source::FrameSource;

/// How long to wait for each startup and teardown handshake before giving up
/// on a worker.
const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Clone, Debug)]
pub struct SessionConfig {
    pub width: u32,
    pub height: u32,
    pub fps: u32,
    pub num_streams: u32,
    pub num_consumers: usize,
    pub pool_size: usize,
    pub max_frame_size: usize,
    pub bitrate: u64,
    pub keyframe_interval: u64,
    /// Try the GPU conversion path. Detection failure degrades to the CPU
    /// path for the whole session, never per frame.
    pub use_gpu: bool,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            width: 640,
            height: 360,
            fps: 30,
            num_streams: 4,
            num_consumers: 2,
            pool_size: 8,
            max_frame_size: 512 * 1024,
            bitrate: 1_000_000,
            keyframe_interval: 25,
            use_gpu: false,
        }
    }
}

/// One running capture -> encode -> fan-out -> decode pipeline and every
/// handle needed to shut it down in order.
pub struct Session {
    pool: Arc<FramePool>,
    counters: Arc<PipelineCounters>,
    pump_cancel: CancellationToken,
    pump_handle: JoinHandle<()>,
    producer: ProducerTask,
    producer_handle: JoinHandle<()>,
    consumers: Vec<(ConsumerTask, NotifySender, JoinHandle<()>)>,
    // Held so late worker events never hit a closed channel.
    _events: EventReceiver,
}

impl Session {
    /// Brings the whole pipeline up: detect the accelerator, create the
    /// pool, spawn and configure the consumers, then start the producer and
    /// the capture pump. Any worker that fails its handshake aborts the
    /// start; a session never runs partially configured.
    pub async fn start(
        config: SessionConfig,
        encoder_factory: EncoderFactory,
        decoder_factory: DecoderFactory,
        mut sink_factory: impl FnMut(usize) -> Box<dyn RenderSink>,
        source: Box<dyn FrameSource>,
    ) -> anyhow::Result<Session> {
        anyhow::ensure!(config.num_streams >= 1, "need at least one stream");
        anyhow::ensure!(config.num_consumers >= 1, "need at least one consumer");
        anyhow::ensure!(
            config.width % 2 == 0 && config.height % 2 == 0,
            "I420 needs even dimensions, got {}x{}",
            config.width,
            config.height
        );
        let frame_len = RawFrame::i420_len(config.width, config.height);
        anyhow::ensure!(
            config.max_frame_size >= frame_len + 16,
            "max frame size {} cannot hold a {}x{} keyframe",
            config.max_frame_size,
            config.width,
            config.height
        );

        let accelerator = if config.use_gpu {
            let acc = Accelerator::detect().await;
            if acc.is_none() {
                log::warn!("gpu requested but unavailable, using cpu conversion");
            }
            acc
        } else {
            None
        };

        let (publisher, pool) = FramePool::new(config.pool_size, config.max_frame_size);
        let counters = Arc::new(PipelineCounters::default());
        let (control_tx, control_rx) = mpsc::unbounded_channel();
        let (event_tx, mut events) = mpsc::unbounded_channel();

        let mut consumers = Vec::with_capacity(config.num_consumers);
        for consumer_id in 0..config.num_consumers {
            let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
            let task = ConsumerTask::new();
            let handle = task
                .start(ConsumerContext {
                    consumer_id,
                    pool: Arc::clone(&pool),
                    cmd_rx,
                    events: event_tx.clone(),
                    control_tx: control_tx.clone(),
                    decoder_factory: Arc::clone(&decoder_factory),
                    sink: sink_factory(consumer_id),
                    counters: Arc::clone(&counters),
                    width: config.width,
                    height: config.height,
                })
                .await;
            consumers.push((task, cmd_tx, handle));
        }

        if let Err(e) = handshake(&config, &consumers, &mut events).await {
            for (task, _, _) in &consumers {
                task.stop();
            }
            return Err(e);
        }

        let encoder = match encoder_factory(&EncoderSettings {
            width: config.width,
            height: config.height,
            bitrate: config.bitrate,
            keyframe_interval: config.keyframe_interval,
        }) {
            Ok(encoder) => encoder,
            Err(e) => {
                for (task, _, _) in &consumers {
                    task.stop();
                }
                return Err(e.context("encoder init"));
            }
        };

        let (capture_tx, capture_rx) = mpsc::channel(1);
        let producer = ProducerTask::new();
        let producer_handle = producer
            .start(ProducerContext {
                publisher,
                encoder,
                capture_rx,
                control_rx,
                consumers: consumers.iter().map(|(_, tx, _)| tx.clone()).collect(),
                num_streams: config.num_streams,
                counters: Arc::clone(&counters),
            })
            .await;

        let pump_cancel = CancellationToken::new();
        let pump_handle = tokio::spawn(capture_pump(
            pump_cancel.clone(),
            config.clone(),
            source,
            accelerator,
            capture_tx,
            Arc::clone(&counters),
        ));

        log::info!(
            "session up: {}x{}@{}fps, {} streams over {} consumers",
            config.width,
            config.height,
            config.fps,
            config.num_streams,
            config.num_consumers
        );

        Ok(Session {
            pool,
            counters,
            pump_cancel,
            pump_handle,
            producer,
            producer_handle,
            consumers,
            _events: events,
        })
    }

    pub fn pool(&self) -> &Arc<FramePool> {
        &self.pool
    }

    pub fn counters(&self) -> CountersSnapshot {
        self.counters.snapshot()
    }

    /// Ordered shutdown: stop feeding, stop publishing, then make every
    /// consumer drain and acknowledge before the pool goes away. After this
    /// returns no slot has an outstanding reference.
    pub async fn teardown(self) -> anyhow::Result<CountersSnapshot> {
        self.pump_cancel.cancel();
        if let Err(e) = self.pump_handle.await {
            log::error!("capture pump panicked: {e}");
        }

        self.producer.stop();
        if let Err(e) = self.producer_handle.await {
            log::error!("producer panicked: {e}");
        }

        for (consumer_id, (_task, cmd_tx, handle)) in self.consumers.into_iter().enumerate() {
            let (ack_tx, ack_rx) = tokio::sync::oneshot::channel();
            if cmd_tx.send(ConsumerCmd::Cleanup { ack: ack_tx }).is_ok() {
                tokio::time::timeout(HANDSHAKE_TIMEOUT, ack_rx)
                    .await
                    .with_context(|| format!("consumer {consumer_id} cleanup timed out"))?
                    .with_context(|| format!("consumer {consumer_id} exited before its ack"))?;
            }
            if let Err(e) = handle.await {
                log::error!("consumer {consumer_id} panicked: {e}");
            }
        }

        for slot in 0..self.pool.pool_size() {
            let refcount = self.pool.control().refcount(slot);
            if refcount != 0 {
                log::error!("slot {slot} leaked with refcount {refcount} after teardown");
            }
        }

        log::info!("session down");
        Ok(self.counters.snapshot())
    }
}

/// Startup handshake: every consumer reports ready, then each stream is
/// assigned round-robin and must come back `StreamReady`.
async fn handshake(
    config: &SessionConfig,
    consumers: &[(ConsumerTask, NotifySender, JoinHandle<()>)],
    events: &mut EventReceiver,
) -> anyhow::Result<()> {
    let mut ready = 0usize;
    while ready < consumers.len() {
        let event = tokio::time::timeout(HANDSHAKE_TIMEOUT, events.recv())
            .await
            .context("timed out waiting for consumers to start")?
            .context("event channel closed during startup")?;
        match event {
            ConsumerEvent::Ready { consumer_id } => {
                log::debug!("consumer {consumer_id} ready");
                ready += 1;
            }
            other => anyhow::bail!("unexpected event during startup: {other:?}"),
        }
    }

    for stream_id in 0..config.num_streams {
        let target = stream_id as usize % consumers.len();
        consumers[target]
            .1
            .send(ConsumerCmd::Configure { stream_id })
            .map_err(|_| anyhow::anyhow!("consumer {target} gone before configure"))?;
    }

    let mut configured = 0;
    while configured < config.num_streams {
        let event = tokio::time::timeout(HANDSHAKE_TIMEOUT, events.recv())
            .await
            .context("timed out waiting for stream configuration")?
            .context("event channel closed during configure")?;
        match event {
            ConsumerEvent::StreamReady { stream_id } => {
                log::debug!("stream {stream_id} configured");
                configured += 1;
            }
            ConsumerEvent::StreamFailed { stream_id, error } => {
                anyhow::bail!("stream {stream_id} failed to configure: {error}");
            }
            other => anyhow::bail!("unexpected event during configure: {other:?}"),
        }
    }
    Ok(())
}

/// Paces the frame source and converts RGBA to I420, on the GPU when an
/// accelerator is present. A frame arriving while the producer still holds
/// the previous one is dropped here, at the boundary, so capture never backs
/// up.
async fn capture_pump(
    cancel: CancellationToken,
    config: SessionConfig,
    mut source: Box<dyn FrameSource>,
    accelerator: Option<Accelerator>,
    capture_tx: CaptureSender,
    counters: Arc<PipelineCounters>,
) {
    let frame_len = RawFrame::i420_len(config.width, config.height);
    let mut gpu = match accelerator {
        Some(acc) => match gpu_state(&acc, config.width, config.height) {
            Ok((kernel, ring)) => Some((acc, kernel, ring)),
            Err(e) => {
                log::warn!("gpu setup failed, using cpu conversion: {e:#}");
                None
            }
        },
        None => None,
    };
    log::info!(
        "capture pump running ({} conversion)",
        if gpu.is_some() { "gpu" } else { "cpu" }
    );

    let mut ticker =
        tokio::time::interval(Duration::from_secs_f64(1.0 / config.fps.max(1) as f64));
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => {}
        }

        let rgba = source.next_frame();
        let mut gpu_failed = false;
        let converted = match gpu.as_mut() {
            Some((acc, kernel, ring)) => match convert_gpu(acc, kernel, ring, &rgba).await {
                Ok(out) => out,
                Err(e) => {
                    // The device is gone or misbehaving; finish the session
                    // on the CPU path.
                    log::error!("gpu conversion failed, degrading to cpu: {e:#}");
                    gpu_failed = true;
                    None
                }
            },
            None => Some(rgba_to_i420(&rgba, config.width, config.height)),
        };
        if gpu_failed {
            if let Some((_, _, ring)) = gpu.take() {
                ring.destroy();
            }
            continue;
        }
        // The GPU pipeline is one frame deep; its first call has no output.
        let Some(mut yuv) = converted else { continue };
        yuv.truncate(frame_len);

        match capture_tx.try_send(RawFrame::new(yuv, config.width, config.height)) {
            Ok(()) => {}
            Err(TrySendError::Full(_)) => {
                counters.producer_busy_drops.fetch_add(1, Ordering::Relaxed);
            }
            Err(TrySendError::Closed(_)) => break,
        }
    }

    if let Some((_, _, ring)) = gpu.take() {
        ring.destroy();
    }
    log::debug!("capture pump stopped");
}

fn gpu_state(
    acc: &Accelerator,
    width: u32,
    height: u32,
) -> anyhow::Result<(YuvPackKernel, ReadbackRing)> {
    let kernel = YuvPackKernel::new(acc, width, height)?;
    let ring = ReadbackRing::new(acc, DEFAULT_DEPTH, kernel.packed_len())?;
    Ok((kernel, ring))
}

async fn convert_gpu(
    acc: &Accelerator,
    kernel: &YuvPackKernel,
    ring: &mut ReadbackRing,
    rgba: &[u8],
) -> anyhow::Result<Option<Vec<u8>>> {
    kernel.upload_rgba(acc, rgba)?;
    ring.cycle(kernel.storage(), |encoder| kernel.record(encoder))
        .await
}

#[cfg(test)]
#[path = "session_test.rs"]
mod session_test;
