use std::sync::Arc;

use crate::gpu::Accelerator;

pub const DEFAULT_DEPTH: usize = 3;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum BufferState {
    Free,
    MapPending,
    Mapped,
}

struct RingBuffer {
    buffer: wgpu::Buffer,
    state: BufferState,
}

struct PendingMap {
    index: usize,
    rx: futures_intrusive::channel::shared::OneshotReceiver<
        Result<(), wgpu::BufferAsyncError>,
    >,
}

/// K-deep ring of MAP_READ buffers that overlaps one frame's readback with
/// the next frame's compute dispatch. Each `cycle` call returns the
/// *previous* call's converted bytes (one-frame latency) and kicks off the
/// current frame's GPU work without waiting for it.
///
/// At most K-1 buffers are map-pending or mapped at once; a buffer is
/// written again only after its map completed and it was unmapped, K frames
/// later.
pub struct ReadbackRing {
    device: Arc<wgpu::Device>,
    queue: Arc<wgpu::Queue>,
    buffers: Vec<RingBuffer>,
    frame_bytes: u64,
    frame_index: u64,
    pending: Option<PendingMap>,
}

impl ReadbackRing {
    pub fn new(acc: &Accelerator, depth: usize, frame_bytes: u64) -> anyhow::Result<Self> {
        anyhow::ensure!(depth >= 1, "ring depth must be at least 1");
        anyhow::ensure!(
            frame_bytes > 0 && frame_bytes % 4 == 0,
            "frame size {frame_bytes} must be a positive multiple of 4"
        );

        let buffers = (0..depth)
            .map(|i| RingBuffer {
                buffer: acc.device.create_buffer(&wgpu::BufferDescriptor {
                    label: Some(&format!("readback ring {i}")),
                    size: frame_bytes,
                    usage: wgpu::BufferUsages::COPY_DST | wgpu::BufferUsages::MAP_READ,
                    mapped_at_creation: false,
                }),
                state: BufferState::Free,
            })
            .collect();

        Ok(Self {
            device: Arc::clone(&acc.device),
            queue: Arc::clone(&acc.queue),
            buffers,
            frame_bytes,
            frame_index: 0,
            pending: None,
        })
    }

    pub fn depth(&self) -> usize {
        self.buffers.len()
    }

    pub fn frame_bytes(&self) -> u64 {
        self.frame_bytes
    }

    /// Runs one pipeline step for input frame `i`:
    ///
    /// 1. awaits the map issued last call for buffer `i % K`, copies its
    ///    bytes out and unmaps; that is frame `i-1`'s data;
    /// 2. records the caller's compute pass for frame `i`;
    /// 3. copies the compute output into buffer `(i+1) % K` and submits;
    /// 4. issues the map request for that buffer without awaiting it.
    ///
    /// Returns `None` on the first call (nothing in flight yet).
    pub async fn cycle(
        &mut self,
        src: &wgpu::Buffer,
        record: impl FnOnce(&mut wgpu::CommandEncoder),
    ) -> anyhow::Result<Option<Vec<u8>>> {
        let out = match self.pending.take() {
            Some(pending) => Some(self.finish_map(pending).await?),
            None => None,
        };

        let next = ((self.frame_index + 1) % self.depth() as u64) as usize;
        anyhow::ensure!(
            self.buffers[next].state == BufferState::Free,
            "ring buffer {next} targeted before its previous map was drained"
        );

        let mut encoder = self
            .device
            .create_command_encoder(&wgpu::CommandEncoderDescriptor {
                label: Some("readback ring"),
            });
        record(&mut encoder);
        encoder.copy_buffer_to_buffer(src, 0, &self.buffers[next].buffer, 0, self.frame_bytes);
        self.queue.submit(Some(encoder.finish()));

        let (sender, receiver) = futures_intrusive::channel::shared::oneshot_channel();
        self.buffers[next]
            .buffer
            .slice(..)
            .map_async(wgpu::MapMode::Read, move |res| {
                sender.send(res).ok();
            });
        self.buffers[next].state = BufferState::MapPending;
        self.pending = Some(PendingMap {
            index: next,
            rx: receiver,
        });

        self.frame_index += 1;
        Ok(out)
    }

    async fn finish_map(&mut self, pending: PendingMap) -> anyhow::Result<Vec<u8>> {
        self.device.poll(wgpu::Maintain::Wait);
        match pending.rx.receive().await {
            Some(Ok(())) => {}
            Some(Err(e)) => anyhow::bail!("readback map failed: {e:?}"),
            None => anyhow::bail!("readback map callback dropped"),
        }

        let entry = &mut self.buffers[pending.index];
        entry.state = BufferState::Mapped;
        let bytes = {
            let view = entry.buffer.slice(..).get_mapped_range();
            view.to_vec()
        };
        // Unmap promptly so the buffer is Free again when the ring wraps.
        entry.buffer.unmap();
        entry.state = BufferState::Free;
        Ok(bytes)
    }

    /// Session teardown: settles any in-flight map before the buffers go
    /// away.
    pub fn destroy(mut self) {
        if let Some(pending) = self.pending.take() {
            self.device.poll(wgpu::Maintain::Wait);
            let entry = &mut self.buffers[pending.index];
            entry.buffer.unmap();
            entry.state = BufferState::Free;
        }
        for entry in &self.buffers {
            entry.buffer.destroy();
        }
    }
}

#[cfg(test)]
#[path = "readback_test.rs"]
mod readback_test;
