#[macro_use]
extern crate log;

pub mod buffers;
pub mod connection;
pub mod dll;
pub mod error;
pub mod format;
pub mod pod;
pub mod protocol;

/// Direction of a PCM stream, seen from the device.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Playback,
    Capture,
}
