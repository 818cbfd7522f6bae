use std::sync::atomic::Ordering;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::{mpsc, oneshot};
use tokio::time::timeout;

use crate::codec::{
    DecoderFactory, DeltaDecoder, DeltaEncoder, EncoderSettings, FrameDecoder, FrameEncoder,
    delta_decoder_factory,
};
use crate::consumer::{ConsumerContext, ConsumerTask, NullSink};
use crate::frame::{
    ConsumerCmd, ConsumerEvent, ControlCmd, ControlReceiver, DecodedFrame, EventReceiver,
    FrameNotify, NotifySender, RawFrame,
};
use crate::pool::{FramePool, PoolPublisher};
use crate::stats::PipelineCounters;

const W: u32 = 4;
const H: u32 = 4;

struct Harness {
    task: ConsumerTask,
    handle: tokio::task::JoinHandle<()>,
    cmd_tx: NotifySender,
    events: EventReceiver,
    control_rx: ControlReceiver,
    publisher: PoolPublisher,
    pool: Arc<FramePool>,
    counters: Arc<PipelineCounters>,
}

async fn spawn_consumer(decoder_factory: DecoderFactory) -> Harness {
    let (publisher, pool) = FramePool::new(4, 65536);
    let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
    let (event_tx, mut events) = mpsc::unbounded_channel();
    let (control_tx, control_rx) = mpsc::unbounded_channel();
    let counters = Arc::new(PipelineCounters::default());

    let task = ConsumerTask::new();
    let handle = task
        .start(ConsumerContext {
            consumer_id: 0,
            pool: Arc::clone(&pool),
            cmd_rx,
            events: event_tx,
            control_tx,
            decoder_factory,
            sink: Box::new(NullSink),
            counters: Arc::clone(&counters),
            width: W,
            height: H,
        })
        .await;

    match timeout(Duration::from_secs(2), events.recv()).await {
        Ok(Some(ConsumerEvent::Ready { consumer_id: 0 })) => {}
        other => panic!("expected Ready, got {other:?}"),
    }

    Harness {
        task,
        handle,
        cmd_tx,
        events,
        control_rx,
        publisher,
        pool,
        counters,
    }
}

async fn configure(harness: &mut Harness, stream_id: u32) {
    harness
        .cmd_tx
        .send(ConsumerCmd::Configure { stream_id })
        .unwrap();
    match timeout(Duration::from_secs(2), harness.events.recv()).await {
        Ok(Some(ConsumerEvent::StreamReady { stream_id: ready })) => {
            assert_eq!(ready, stream_id);
        }
        other => panic!("expected StreamReady, got {other:?}"),
    }
}

/// Every frame a keyframe, so any single payload decodes on its own.
fn keyframe_payload(encoder: &mut DeltaEncoder, seed: u8) -> Vec<u8> {
    let data = (0..RawFrame::i420_len(W, H))
        .map(|i| (i as u8).wrapping_add(seed))
        .collect();
    let raw = RawFrame::new(data, W, H);
    encoder.encode(&raw, true).unwrap().data.to_vec()
}

fn test_encoder() -> DeltaEncoder {
    DeltaEncoder::new(EncoderSettings {
        width: W,
        height: H,
        keyframe_interval: 1,
        ..Default::default()
    })
    .unwrap()
}

fn notify(slot: usize, size: u32, stream_id: u32) -> ConsumerCmd {
    ConsumerCmd::Decode(FrameNotify {
        slot,
        size,
        stream_id,
        width: W,
        height: H,
    })
}

async fn wait_for(mut condition: impl FnMut() -> bool) {
    for _ in 0..200 {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("condition not reached within 2s");
}

/// Decoder that parks inside `decode` until the test lets it continue, so
/// notifications can be queued behind a decode deterministically.
struct GatedDecoder {
    entered: std::sync::mpsc::Sender<()>,
    resume: std::sync::mpsc::Receiver<()>,
    inner: DeltaDecoder,
}

impl FrameDecoder for GatedDecoder {
    fn decode(&mut self, payload: &[u8], width: u32, height: u32) -> anyhow::Result<DecodedFrame> {
        self.entered.send(()).ok();
        self.resume.recv().ok();
        self.inner.decode(payload, width, height)
    }
}

fn gated_factory() -> (
    DecoderFactory,
    std::sync::mpsc::Receiver<()>,
    std::sync::mpsc::Sender<()>,
) {
    let (entered_tx, entered_rx) = std::sync::mpsc::channel();
    let (resume_tx, resume_rx) = std::sync::mpsc::channel();
    let slots = Mutex::new(Some((entered_tx, resume_rx)));
    let factory: DecoderFactory = Arc::new(move |_w, _h| {
        let (entered, resume) = slots
            .lock()
            .unwrap()
            .take()
            .ok_or_else(|| anyhow::anyhow!("gated decoder already taken"))?;
        Ok(Box::new(GatedDecoder {
            entered,
            resume,
            inner: DeltaDecoder::new(),
        }) as Box<dyn FrameDecoder>)
    });
    (factory, entered_rx, resume_tx)
}

#[tokio::test]
async fn decodes_and_releases_on_success() {
    let mut harness = spawn_consumer(delta_decoder_factory()).await;
    configure(&mut harness, 0).await;

    let mut encoder = test_encoder();
    let payload = keyframe_payload(&mut encoder, 1);
    let result = harness.publisher.publish(&payload, 1).unwrap();
    harness
        .cmd_tx
        .send(notify(result.slot, result.size, 0))
        .unwrap();

    let counters = Arc::clone(&harness.counters);
    wait_for(|| counters.decoded.load(Ordering::Relaxed) == 1).await;
    assert_eq!(harness.pool.control().refcount(result.slot), 0);
    assert_eq!(harness.counters.decode_errors.load(Ordering::Relaxed), 0);

    harness.task.stop();
    harness.handle.await.unwrap();
}

#[tokio::test]
async fn decode_error_releases_and_requests_keyframe() {
    let mut harness = spawn_consumer(delta_decoder_factory()).await;
    configure(&mut harness, 3).await;

    // A delta whose keyframe this consumer never saw.
    let mut encoder = DeltaEncoder::new(EncoderSettings {
        width: W,
        height: H,
        keyframe_interval: 1000,
        ..Default::default()
    })
    .unwrap();
    let _key = keyframe_payload(&mut encoder, 1);
    let data = (0..RawFrame::i420_len(W, H)).map(|i| i as u8).collect();
    let delta = encoder
        .encode(&RawFrame::new(data, W, H), false)
        .unwrap()
        .data
        .to_vec();

    let result = harness.publisher.publish(&delta, 1).unwrap();
    harness
        .cmd_tx
        .send(notify(result.slot, result.size, 3))
        .unwrap();

    let counters = Arc::clone(&harness.counters);
    wait_for(|| counters.decode_errors.load(Ordering::Relaxed) == 1).await;
    assert_eq!(harness.pool.control().refcount(result.slot), 0);

    match timeout(Duration::from_secs(2), harness.control_rx.recv()).await {
        Ok(Some(ControlCmd::RequestKeyframe { stream_id: 3 })) => {}
        other => panic!("expected keyframe request, got {other:?}"),
    }

    harness.task.stop();
    harness.handle.await.unwrap();
}

#[tokio::test]
async fn unowned_stream_notification_is_released() {
    let mut harness = spawn_consumer(delta_decoder_factory()).await;
    // No Configure: stream 7 is not ours.

    let mut encoder = test_encoder();
    let payload = keyframe_payload(&mut encoder, 1);
    let result = harness.publisher.publish(&payload, 1).unwrap();
    harness
        .cmd_tx
        .send(notify(result.slot, result.size, 7))
        .unwrap();

    let pool = Arc::clone(&harness.pool);
    wait_for(move || pool.control().refcount(result.slot) == 0).await;
    assert_eq!(harness.counters.decoded.load(Ordering::Relaxed), 0);

    harness.task.stop();
    harness.handle.await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn backlog_is_released_with_keyframe_requests() {
    let (factory, entered_rx, resume_tx) = gated_factory();
    let mut harness = spawn_consumer(factory).await;
    configure(&mut harness, 0).await;

    let mut encoder = test_encoder();
    let first = harness
        .publisher
        .publish(&keyframe_payload(&mut encoder, 1), 1)
        .unwrap();
    harness
        .cmd_tx
        .send(notify(first.slot, first.size, 0))
        .unwrap();

    // The consumer is now parked inside decode; queue two more behind it.
    entered_rx.recv_timeout(Duration::from_secs(2)).unwrap();
    let second = harness
        .publisher
        .publish(&keyframe_payload(&mut encoder, 2), 1)
        .unwrap();
    let third = harness
        .publisher
        .publish(&keyframe_payload(&mut encoder, 3), 1)
        .unwrap();
    harness
        .cmd_tx
        .send(notify(second.slot, second.size, 0))
        .unwrap();
    harness
        .cmd_tx
        .send(notify(third.slot, third.size, 0))
        .unwrap();
    resume_tx.send(()).unwrap();

    let counters = Arc::clone(&harness.counters);
    wait_for(|| counters.consumer_busy_drops.load(Ordering::Relaxed) == 2).await;
    assert_eq!(harness.counters.decoded.load(Ordering::Relaxed), 1);
    for slot in [first.slot, second.slot, third.slot] {
        assert_eq!(harness.pool.control().refcount(slot), 0);
    }

    // One re-sync request per dropped frame.
    for _ in 0..2 {
        match timeout(Duration::from_secs(2), harness.control_rx.recv()).await {
            Ok(Some(ControlCmd::RequestKeyframe { stream_id: 0 })) => {}
            other => panic!("expected keyframe request, got {other:?}"),
        }
    }

    harness.task.stop();
    harness.handle.await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn cleanup_drains_queue_and_acks() {
    let (factory, entered_rx, resume_tx) = gated_factory();
    let mut harness = spawn_consumer(factory).await;
    configure(&mut harness, 0).await;

    let mut encoder = test_encoder();
    let first = harness
        .publisher
        .publish(&keyframe_payload(&mut encoder, 1), 1)
        .unwrap();
    harness
        .cmd_tx
        .send(notify(first.slot, first.size, 0))
        .unwrap();
    entered_rx.recv_timeout(Duration::from_secs(2)).unwrap();

    // Queue a cleanup with a stale notification on either side of it.
    let second = harness
        .publisher
        .publish(&keyframe_payload(&mut encoder, 2), 1)
        .unwrap();
    let third = harness
        .publisher
        .publish(&keyframe_payload(&mut encoder, 3), 1)
        .unwrap();
    harness
        .cmd_tx
        .send(notify(second.slot, second.size, 0))
        .unwrap();
    let (ack_tx, ack_rx) = oneshot::channel();
    harness
        .cmd_tx
        .send(ConsumerCmd::Cleanup { ack: ack_tx })
        .unwrap();
    harness
        .cmd_tx
        .send(notify(third.slot, third.size, 0))
        .unwrap();
    resume_tx.send(()).unwrap();

    timeout(Duration::from_secs(2), ack_rx)
        .await
        .expect("cleanup ack timed out")
        .expect("cleanup ack dropped");

    // After the ack nothing this consumer saw is still held.
    for slot in [first.slot, second.slot, third.slot] {
        assert_eq!(harness.pool.control().refcount(slot), 0);
    }
    // The consumer task exited on its own.
    harness.handle.await.unwrap();
}

#[tokio::test]
async fn decoder_init_failure_reports_stream_failed() {
    let failing: DecoderFactory =
        Arc::new(|_w, _h| anyhow::bail!("decoder backend unavailable"));
    let mut harness = spawn_consumer(failing).await;

    harness
        .cmd_tx
        .send(ConsumerCmd::Configure { stream_id: 2 })
        .unwrap();
    match timeout(Duration::from_secs(2), harness.events.recv()).await {
        Ok(Some(ConsumerEvent::StreamFailed { stream_id: 2, error })) => {
            assert!(error.contains("unavailable"), "{error}");
        }
        other => panic!("expected StreamFailed, got {other:?}"),
    }

    harness.task.stop();
    harness.handle.await.unwrap();
}
