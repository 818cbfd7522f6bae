#![allow(dead_code)]

//! Lossy live-video fan-out: one producer publishes encoded frames into a
//! fixed pool of shared slots, N independent consumers decode the same bytes
//! without copying and release each slot on their own schedule.
//!
//! Data flow:
//! ```text
//! capture ──► [gpu convert + readback ring | cpu convert] ──► ProducerTask
//!                                                                 │ publish
//!                                                                 ▼
//!                                                             FramePool
//!                                                                 │ notify (slot, size, stream)
//!                                    ┌────────────────────────────┼───────────────┐
//!                                    ▼                            ▼               ▼
//!                              ConsumerTask 0              ConsumerTask 1   ConsumerTask N-1
//!                              decode ─► render ─► release (always, on every path)
//! ```

pub mod codec;
pub mod consumer;
pub mod frame;
pub mod gpu;
pub mod pool;
pub mod producer;
pub mod readback;
pub mod stats;

#[cfg(feature = "openh264")]
pub mod h264;
