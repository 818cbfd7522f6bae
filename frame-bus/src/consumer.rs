use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::Ordering;

use tokio_util::sync::CancellationToken;

use crate::codec::{DecoderFactory, FrameDecoder};
use crate::frame::{
    ConsumerCmd, ConsumerEvent, ControlCmd, ControlSender, DecodedFrame, EventSender, FrameNotify,
    NotifyReceiver, WorkerState,
};
use crate::pool::FramePool;
use crate::stats::PipelineCounters;

/// Where decoded frames go. On-screen presentation is outside this crate;
/// the session plugs in whatever sink it wants.
pub trait RenderSink: Send {
    fn render(&mut self, stream_id: u32, frame: &DecodedFrame) -> anyhow::Result<()>;
}

/// Discards frames. Useful for benchmarks and tests that only care about
/// pipeline behavior.
pub struct NullSink;

impl RenderSink for NullSink {
    fn render(&mut self, _stream_id: u32, _frame: &DecodedFrame) -> anyhow::Result<()> {
        Ok(())
    }
}

pub struct ConsumerContext {
    pub consumer_id: usize,
    pub pool: Arc<FramePool>,
    pub cmd_rx: NotifyReceiver,
    pub events: EventSender,
    pub control_tx: ControlSender,
    pub decoder_factory: DecoderFactory,
    pub sink: Box<dyn RenderSink>,
    pub counters: Arc<PipelineCounters>,
    pub width: u32,
    pub height: u32,
}

/// One independent reader context. Owns a static subset of output streams
/// (one decoder each), pulls published slots, decodes, renders, releases.
///
/// The central contract: every `Decode` notification releases its slot
/// exactly once, whether it was decoded, dropped while busy, targeted an
/// unknown stream, or failed to decode. `SlotLease` enforces this by
/// releasing on drop.
pub struct ConsumerTask {
    cancel: CancellationToken,
}

impl ConsumerTask {
    pub fn new() -> Self {
        Self {
            cancel: CancellationToken::new(),
        }
    }

    pub fn stop(&self) {
        self.cancel.cancel();
    }

    pub async fn start(&self, ctx: ConsumerContext) -> tokio::task::JoinHandle<()> {
        let cancel = self.cancel.clone();
        tokio::spawn(async move { consumer_loop(cancel, ctx).await })
    }
}

impl Default for ConsumerTask {
    fn default() -> Self {
        Self::new()
    }
}

struct ConsumerState {
    decoders: HashMap<u32, Box<dyn FrameDecoder>>,
    state: WorkerState,
}

async fn consumer_loop(cancel: CancellationToken, mut ctx: ConsumerContext) {
    let mut state = ConsumerState {
        decoders: HashMap::new(),
        state: WorkerState::Ready,
    };
    let _ = ctx.events.send(ConsumerEvent::Ready {
        consumer_id: ctx.consumer_id,
    });
    log::debug!("consumer {} {}", ctx.consumer_id, state.state);

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            cmd = ctx.cmd_rx.recv() => {
                let Some(cmd) = cmd else { break };
                match cmd {
                    ConsumerCmd::Configure { stream_id } => {
                        handle_configure(&mut ctx, &mut state, stream_id);
                    }
                    ConsumerCmd::Decode(notify) => {
                        state.state = WorkerState::Running;
                        handle_decode(&mut ctx, &mut state, notify);
                        // Anything that queued while we were decoding is
                        // stale: release it unseen and ask for a keyframe so
                        // the stream can re-sync after the gap.
                        if drain_backlog(&mut ctx, &mut state).await {
                            return;
                        }
                    }
                    ConsumerCmd::Cleanup { ack } => {
                        cleanup(&mut ctx, &mut state, ack);
                        return;
                    }
                }
            }
        }
    }

    state.state = WorkerState::Stopped;
    log::debug!("consumer {} {}", ctx.consumer_id, state.state);
}

fn handle_configure(ctx: &mut ConsumerContext, state: &mut ConsumerState, stream_id: u32) {
    match (ctx.decoder_factory)(ctx.width, ctx.height) {
        Ok(decoder) => {
            state.decoders.insert(stream_id, decoder);
            state.state = WorkerState::Configured;
            log::info!("consumer {} owns stream {stream_id}", ctx.consumer_id);
            let _ = ctx.events.send(ConsumerEvent::StreamReady { stream_id });
        }
        Err(e) => {
            let _ = ctx.events.send(ConsumerEvent::StreamFailed {
                stream_id,
                error: format!("{e:#}"),
            });
        }
    }
}

fn handle_decode(ctx: &mut ConsumerContext, state: &mut ConsumerState, notify: FrameNotify) {
    let lease = ctx.pool.lease(notify.slot);

    let Some(decoder) = state.decoders.get_mut(&notify.stream_id) else {
        log::warn!(
            "consumer {}: notification for unowned stream {}",
            ctx.consumer_id,
            notify.stream_id
        );
        return; // lease drop releases the slot
    };

    let view = lease.view();
    match decoder.decode(&view, notify.width, notify.height) {
        Ok(frame) => {
            drop(view);
            ctx.counters.decoded.fetch_add(1, Ordering::Relaxed);
            if let Err(e) = ctx.sink.render(notify.stream_id, &frame) {
                log::error!("render error on stream {}: {e:#}", notify.stream_id);
            }
        }
        Err(e) => {
            // Never fatal: this frame is lost, recover via keyframe.
            log::debug!("decode error on stream {}: {e:#}", notify.stream_id);
            ctx.counters.decode_errors.fetch_add(1, Ordering::Relaxed);
            request_keyframe(&ctx.control_tx, notify.stream_id);
        }
    }
}

/// Releases every notification that queued during the last decode. Returns
/// true if a `Cleanup` was encountered and the task must exit.
async fn drain_backlog(ctx: &mut ConsumerContext, state: &mut ConsumerState) -> bool {
    while let Ok(cmd) = ctx.cmd_rx.try_recv() {
        match cmd {
            ConsumerCmd::Decode(stale) => {
                ctx.pool.release(stale.slot);
                ctx.counters.consumer_busy_drops.fetch_add(1, Ordering::Relaxed);
                request_keyframe(&ctx.control_tx, stale.stream_id);
            }
            ConsumerCmd::Configure { stream_id } => {
                handle_configure(ctx, state, stream_id);
            }
            ConsumerCmd::Cleanup { ack } => {
                cleanup(ctx, state, ack);
                return true;
            }
        }
    }
    false
}

fn cleanup(
    ctx: &mut ConsumerContext,
    state: &mut ConsumerState,
    ack: tokio::sync::oneshot::Sender<()>,
) {
    state.state = WorkerState::Draining;
    log::debug!("consumer {} {}", ctx.consumer_id, state.state);
    // Release everything still queued so no slot leaks, then drop the
    // decoders. After the ack fires this task references no pool slot.
    while let Ok(cmd) = ctx.cmd_rx.try_recv() {
        if let ConsumerCmd::Decode(stale) = cmd {
            ctx.pool.release(stale.slot);
        }
    }
    state.decoders.clear();
    state.state = WorkerState::Stopped;
    log::info!("consumer {} {}", ctx.consumer_id, state.state);
    let _ = ack.send(());
}

fn request_keyframe(control_tx: &ControlSender, stream_id: u32) {
    let _ = control_tx.send(ControlCmd::RequestKeyframe { stream_id });
}

#[cfg(test)]
#[path = "consumer_test.rs"]
mod consumer_test;
