use std::sync::Arc;
use std::sync::atomic::Ordering;

use tokio_util::sync::CancellationToken;

use crate::codec::FrameEncoder;
use crate::frame::{
    CaptureReceiver, ConsumerCmd, ControlCmd, ControlReceiver, FrameNotify, NotifySender,
    WorkerState,
};
use crate::pool::{PoolPublisher, PublishError};
use crate::stats::PipelineCounters;

/// Log "slot busy" at most every N drops; sustained backpressure would
/// otherwise flood the log at frame rate.
const DROP_LOG_INTERVAL: u64 = 120;

/// Everything the producer loop owns, passed explicitly instead of living in
/// shared globals.
pub struct ProducerContext {
    pub publisher: PoolPublisher,
    pub encoder: Box<dyn FrameEncoder>,
    pub capture_rx: CaptureReceiver,
    pub control_rx: ControlReceiver,
    /// One notify channel per consumer; stream `i` goes to consumer
    /// `i % consumers.len()`.
    pub consumers: Vec<NotifySender>,
    pub num_streams: u32,
    pub counters: Arc<PipelineCounters>,
}

/// The single logical writer: encodes capture frames and publishes them into
/// the pool. One encode in flight at a time; a frame that arrives while the
/// previous one is being encoded never queues (the capture channel has
/// capacity 1 and the feeding side drops on a full channel).
pub struct ProducerTask {
    cancel: CancellationToken,
}

impl ProducerTask {
    pub fn new() -> Self {
        Self {
            cancel: CancellationToken::new(),
        }
    }

    pub fn stop(&self) {
        self.cancel.cancel();
    }

    pub async fn start(&self, ctx: ProducerContext) -> tokio::task::JoinHandle<()> {
        let cancel = self.cancel.clone();
        tokio::spawn(async move { producer_loop(cancel, ctx).await })
    }
}

impl Default for ProducerTask {
    fn default() -> Self {
        Self::new()
    }
}

async fn producer_loop(cancel: CancellationToken, mut ctx: ProducerContext) {
    let mut state = WorkerState::Running;
    log::info!(
        "producer {}: {} streams over {} consumers, pool of {} slots",
        state,
        ctx.num_streams,
        ctx.consumers.len(),
        ctx.publisher.pool().pool_size()
    );

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            frame = ctx.capture_rx.recv() => {
                let Some(frame) = frame else { break };
                handle_frame(&mut ctx, frame);
            }
        }
    }

    state = WorkerState::Draining;
    log::debug!("producer {state}");
    // Stop notifying: pending capture frames are discarded, consumers keep
    // draining whatever was already published.
    state = WorkerState::Stopped;
    log::info!("producer {state}");
}

fn handle_frame(ctx: &mut ProducerContext, frame: crate::frame::RawFrame) {
    ctx.counters.frames_in.fetch_add(1, Ordering::Relaxed);

    let mut force_keyframe = false;
    while let Ok(cmd) = ctx.control_rx.try_recv() {
        match cmd {
            ControlCmd::RequestKeyframe { stream_id } => {
                log::debug!("keyframe requested for stream {stream_id}");
                ctx.counters.keyframe_requests.fetch_add(1, Ordering::Relaxed);
                force_keyframe = true;
            }
        }
    }

    let encoded = match ctx.encoder.encode(&frame, force_keyframe) {
        Ok(encoded) => encoded,
        Err(e) => {
            log::error!("encode error: {e:#}");
            ctx.counters.encode_errors.fetch_add(1, Ordering::Relaxed);
            return;
        }
    };
    ctx.counters.encoded.fetch_add(1, Ordering::Relaxed);
    if encoded.is_keyframe {
        ctx.counters.keyframes_encoded.fetch_add(1, Ordering::Relaxed);
    }

    let result = match ctx.publisher.publish(&encoded.data, ctx.num_streams) {
        Ok(result) => result,
        Err(PublishError::SlotBusy { slot }) => {
            let dropped = ctx
                .publisher
                .pool()
                .counters()
                .dropped_busy
                .load(Ordering::Relaxed);
            if dropped % DROP_LOG_INTERVAL == 1 {
                log::debug!("slot {slot} busy, dropped {dropped} frames so far (backpressure)");
            }
            return;
        }
        Err(e @ PublishError::PayloadTooLarge { .. }) => {
            log::warn!("frame dropped: {e}");
            return;
        }
    };

    for stream_id in 0..ctx.num_streams {
        let target = stream_id as usize % ctx.consumers.len();
        let notify = FrameNotify {
            slot: result.slot,
            size: result.size,
            stream_id,
            width: frame.width,
            height: frame.height,
        };
        if ctx.consumers[target]
            .send(ConsumerCmd::Decode(notify))
            .is_err()
        {
            // Consumer is gone; release on its behalf so the slot drains.
            ctx.publisher.pool().release(result.slot);
            ctx.counters.notify_failures.fetch_add(1, Ordering::Relaxed);
        }
    }
}

#[cfg(test)]
#[path = "producer_test.rs"]
mod producer_test;
