use bytes::Bytes;

/// Raw planar I420 frame handed to the encoder (or produced by the decoder
/// before render).
#[derive(Clone, Debug)]
pub struct RawFrame {
    pub data: Bytes,
    pub width: u32,
    pub height: u32,
}

impl RawFrame {
    pub fn new(data: Vec<u8>, width: u32, height: u32) -> Self {
        Self {
            data: Bytes::from(data),
            width,
            height,
        }
    }

    /// Byte length of a packed I420 frame at the given dimensions.
    pub fn i420_len(width: u32, height: u32) -> usize {
        let y = width as usize * height as usize;
        y + y / 2
    }
}

/// Output of one encode call.
#[derive(Clone, Debug)]
pub struct EncodedFrame {
    pub data: Bytes,
    pub is_keyframe: bool,
}

/// Decoded frame ready for a render sink.
#[derive(Clone, Debug)]
pub struct DecodedFrame {
    pub data: Vec<u8>,
    pub width: u32,
    pub height: u32,
}

/// Producer -> consumer notification for one published slot. The payload
/// itself stays in the pool; this message is the only thing that crosses the
/// channel.
#[derive(Clone, Copy, Debug)]
pub struct FrameNotify {
    pub slot: usize,
    pub size: u32,
    pub stream_id: u32,
    pub width: u32,
    pub height: u32,
}

/// Commands handled by a consumer task.
pub enum ConsumerCmd {
    /// Take ownership of one output stream and initialize its decoder.
    Configure { stream_id: u32 },
    /// A new slot was published for one of this consumer's streams.
    Decode(FrameNotify),
    /// Drain, release everything still queued and acknowledge. After the ack
    /// the consumer no longer references any pool slot.
    Cleanup {
        ack: tokio::sync::oneshot::Sender<()>,
    },
}

/// Events a consumer reports back to the session.
#[derive(Debug)]
pub enum ConsumerEvent {
    Ready { consumer_id: usize },
    StreamReady { stream_id: u32 },
    StreamFailed { stream_id: u32, error: String },
}

/// Consumer -> producer control path. Only aggregate signals cross this
/// boundary, never per-frame errors.
#[derive(Clone, Copy, Debug)]
pub enum ControlCmd {
    /// Force the next encode to be a self-contained keyframe.
    RequestKeyframe { stream_id: u32 },
}

pub type NotifySender = tokio::sync::mpsc::UnboundedSender<ConsumerCmd>;
pub type NotifyReceiver = tokio::sync::mpsc::UnboundedReceiver<ConsumerCmd>;
pub type ControlSender = tokio::sync::mpsc::UnboundedSender<ControlCmd>;
pub type ControlReceiver = tokio::sync::mpsc::UnboundedReceiver<ControlCmd>;
pub type EventSender = tokio::sync::mpsc::UnboundedSender<ConsumerEvent>;
pub type EventReceiver = tokio::sync::mpsc::UnboundedReceiver<ConsumerEvent>;
/// Capture channel is bounded to 1: a frame arriving while the previous
/// encode is still in flight is dropped at the producer boundary.
pub type CaptureSender = tokio::sync::mpsc::Sender<RawFrame>;
pub type CaptureReceiver = tokio::sync::mpsc::Receiver<RawFrame>;

/// Lifecycle of one worker task. Every worker type moves through the same
/// states, driven by the same message-passing discipline.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum WorkerState {
    Uninit,
    Ready,
    Configured,
    Running,
    Draining,
    Stopped,
}

impl std::fmt::Display for WorkerState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            WorkerState::Uninit => "uninit",
            WorkerState::Ready => "ready",
            WorkerState::Configured => "configured",
            WorkerState::Running => "running",
            WorkerState::Draining => "draining",
            WorkerState::Stopped => "stopped",
        };
        f.write_str(s)
    }
}
