//! The ALSA pcm engine: device negotiation and the timer-driven transfer
//! loop

pub mod clock;
pub mod device;
pub mod io;
pub mod pcm;

pub use device::{AudioInfo, FormatDescriptor, FormatFilter, State, StreamEvents};
pub use io::{start_device, RunningDevice};
