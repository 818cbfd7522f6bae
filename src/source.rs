/// Produces one RGBA capture frame per call. The session owns one source and
/// paces it at the configured frame rate.
pub trait FrameSource: Send {
    fn next_frame(&mut self) -> Vec<u8>;
}

/// Animated gradient with a moving block, roughly the texture of a screen
/// share: large static-ish regions plus a small region of real motion, so
/// delta frames stay small but never empty.
pub struct SyntheticSource {
    width: u32,
    height: u32,
    tick: u32,
}

impl SyntheticSource {
    pub fn new(width: u32, height: u32) -> Self {
        Self {
            width,
            height,
            tick: 0,
        }
    }
}

impl FrameSource for SyntheticSource {
    fn next_frame(&mut self) -> Vec<u8> {
        let w = self.width as usize;
        let h = self.height as usize;
        let t = self.tick;
        self.tick = self.tick.wrapping_add(1);

        let block_x = (t as usize * 3) % w.max(1);
        let block_y = (t as usize * 2) % h.max(1);

        let mut rgba = vec![0u8; w * h * 4];
        for y in 0..h {
            for x in 0..w {
                let px = (y * w + x) * 4;
                rgba[px] = (x as u32 + t / 8) as u8;
                rgba[px + 1] = (y as u32 + t / 16) as u8;
                rgba[px + 2] = 64;
                rgba[px + 3] = 255;
                if x.abs_diff(block_x) < 8 && y.abs_diff(block_y) < 8 {
                    rgba[px] = 255;
                    rgba[px + 1] = (t * 9) as u8;
                    rgba[px + 2] = 0;
                }
            }
        }
        rgba
    }
}
