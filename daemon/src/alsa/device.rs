//! PCM device state and hardware parameter negotiation

use std::ffi::CString;
use std::sync::Arc;

use alsa_sys as alsa;
use anyhow::anyhow;
use nix::sys::timerfd::{ClockId, TimerFd, TimerFlags};
use wavepipe_core::buffers::{BufferPool, IoStatus};
use wavepipe_core::dll::{Dll, DLL_BW_MAX};
use wavepipe_core::error::{DaemonResult, Fault, ResultExt};
use wavepipe_core::format::{SampleFormat, DEFAULT_CHANNELS, DEFAULT_RATE, FORMATS};
use wavepipe_core::Direction;

use crate::alsa::clock::{ClockCell, TransportCell};
use crate::alsa::pcm::{self, HwParams, Pcm, SwParams, UFrames};
use crate::config::Config;

/// Buffers allocated per negotiated format
const N_BUFFERS: usize = 4;

/// The device-native rendering of a sample format
pub fn format_to_alsa(format: SampleFormat) -> pcm::Format {
    use SampleFormat::*;
    match format {
        S8 => alsa::SND_PCM_FORMAT_S8,
        U8 | U8P => alsa::SND_PCM_FORMAT_U8,
        S16LE | S16P => alsa::SND_PCM_FORMAT_S16_LE,
        S16BE => alsa::SND_PCM_FORMAT_S16_BE,
        U16LE => alsa::SND_PCM_FORMAT_U16_LE,
        U16BE => alsa::SND_PCM_FORMAT_U16_BE,
        S24_32LE | S24_32P => alsa::SND_PCM_FORMAT_S24_LE,
        S24_32BE => alsa::SND_PCM_FORMAT_S24_BE,
        U24_32LE => alsa::SND_PCM_FORMAT_U24_LE,
        U24_32BE => alsa::SND_PCM_FORMAT_U24_BE,
        S24LE | S24P => alsa::SND_PCM_FORMAT_S24_3LE,
        S24BE => alsa::SND_PCM_FORMAT_S24_3BE,
        U24LE => alsa::SND_PCM_FORMAT_U24_3LE,
        U24BE => alsa::SND_PCM_FORMAT_U24_3BE,
        S32LE | S32P => alsa::SND_PCM_FORMAT_S32_LE,
        S32BE => alsa::SND_PCM_FORMAT_S32_BE,
        U32LE => alsa::SND_PCM_FORMAT_U32_LE,
        U32BE => alsa::SND_PCM_FORMAT_U32_BE,
        F32LE | F32P => alsa::SND_PCM_FORMAT_FLOAT_LE,
        F32BE => alsa::SND_PCM_FORMAT_FLOAT_BE,
        F64LE | F64P => alsa::SND_PCM_FORMAT_FLOAT64_LE,
        F64BE => alsa::SND_PCM_FORMAT_FLOAT64_BE,
    }
}

/// A negotiated or requested stream format
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AudioInfo {
    pub format: SampleFormat,
    pub rate: u32,
    pub channels: u32,
}

/// One axis of an enumerated format descriptor
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Choice<T> {
    Single(T),
    /// Multiple discrete candidates, preferred first
    Enum(Vec<T>),
    Range { default: T, min: T, max: T },
}

impl<T: PartialEq + PartialOrd + Copy> Choice<T> {
    pub fn admits(&self, v: T) -> bool {
        match self {
            Choice::Single(x) => *x == v,
            Choice::Enum(xs) => xs.contains(&v),
            Choice::Range { min, max, .. } => *min <= v && v <= *max,
        }
    }

    pub fn default_value(&self) -> T {
        match self {
            Choice::Single(x) => *x,
            Choice::Enum(xs) => xs[0],
            Choice::Range { default, .. } => *default,
        }
    }
}

/// Builds the integer axis of a descriptor: a single value collapses the
/// choice, otherwise the preferred default is clamped into the range
pub fn range_choice(min: u32, max: u32, preferred: u32) -> Choice<u32> {
    if min == max {
        Choice::Single(min)
    } else {
        Choice::Range {
            default: preferred.clamp(min, max),
            min,
            max,
        }
    }
}

/// The composite descriptor produced by format enumeration
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FormatDescriptor {
    pub format: Choice<SampleFormat>,
    pub rate: Choice<u32>,
    pub channels: Choice<u32>,
}

/// Pattern a caller narrows enumeration with; `None` axes match anything
#[derive(Debug, Clone, Copy, Default)]
pub struct FormatFilter {
    pub format: Option<SampleFormat>,
    pub rate: Option<u32>,
    pub channels: Option<u32>,
}

impl FormatDescriptor {
    pub fn matches(&self, filter: &FormatFilter) -> bool {
        let format_ok = match filter.format {
            Some(f) => match &self.format {
                Choice::Single(x) => *x == f,
                Choice::Enum(xs) => xs.contains(&f),
                Choice::Range { .. } => false,
            },
            None => true,
        };
        format_ok
            && filter.rate.map_or(true, |r| self.rate.admits(r))
            && filter.channels.map_or(true, |c| self.channels.admits(c))
    }
}

/// Resolves a near-match negotiation: accept what the device granted when
/// nearest matching is allowed, otherwise only an exact grant
pub fn resolve_near(requested: u32, granted: u32, nearest: bool) -> Option<u32> {
    if granted == requested || nearest {
        Some(granted)
    } else {
        None
    }
}

/// Callbacks from the data loop into the buffer producer or consumer.
/// They run on the data loop and must not block.
pub trait StreamEvents: Send {
    /// The loop needs buffers (playback) or produced one (capture)
    fn ready(&mut self, pool: &mut BufferPool, status: IoStatus);
    /// A playback buffer was fully consumed and may be refilled
    fn reuse_buffer(&mut self, id: u32);
}

/// Discards all notifications
pub struct NoEvents;

impl StreamEvents for NoEvents {
    fn ready(&mut self, _pool: &mut BufferPool, _status: IoStatus) {}
    fn reuse_buffer(&mut self, _id: u32) {}
}

pub(crate) struct Opened {
    pub pcm: Pcm,
    pub timer: TimerFd,
}

/// Everything one PCM endpoint carries between open and close
pub struct State {
    pub direction: Direction,
    pub device: String,
    pub min_latency: u32,
    period_target: UFrames,

    pub(crate) opened: Option<Opened>,

    pub format: Option<SampleFormat>,
    pub(crate) alsa_format: pcm::Format,
    pub rate: u32,
    pub channels: u32,
    pub frame_size: usize,
    pub buffer_frames: UFrames,
    pub period_frames: UFrames,

    /// Frames moved since the device started
    pub sample_count: u64,
    pub(crate) sample_time: u64,
    /// Target frames-in-flight
    pub threshold: u32,
    pub(crate) safety: f64,
    /// Scheduled wakeup, absolute monotonic nanoseconds
    pub next_time: u64,
    pub(crate) last_time: u64,

    /// Follows an external reference clock; the own timer stays idle
    pub slaved: bool,
    pub alsa_started: bool,
    pub started: bool,

    pub dll: Dll,
    pub old_dt: f64,

    pub pool: BufferPool,
    pub io_status: IoStatus,
    /// Id of the playback buffer most recently drained
    pub last_consumed: Option<u32>,
    pub(crate) ready_offset: usize,

    /// Clock observations published to followers
    pub clock: Option<Arc<ClockCell>>,
    /// Transport this device follows when slaved
    pub position: Option<Arc<TransportCell>>,

    pub(crate) events: Box<dyn StreamEvents>,
}

impl State {
    pub fn new(config: &Config, direction: Direction, events: Box<dyn StreamEvents>) -> State {
        State {
            direction,
            device: config.device.clone(),
            min_latency: config.min_latency,
            period_target: config.period as UFrames,
            opened: None,
            format: None,
            alsa_format: alsa::SND_PCM_FORMAT_UNKNOWN,
            rate: config.rate,
            channels: config.channels,
            frame_size: 0,
            buffer_frames: 0,
            period_frames: 0,
            sample_count: 0,
            sample_time: 0,
            threshold: config.min_latency,
            safety: 0.0,
            next_time: 0,
            last_time: 0,
            slaved: false,
            alsa_started: false,
            started: false,
            dll: Dll::new(DLL_BW_MAX),
            old_dt: 1.0,
            pool: BufferPool::new(0, 0),
            io_status: IoStatus::Ok,
            last_consumed: None,
            ready_offset: 0,
            clock: None,
            position: None,
            events,
        }
    }

    /// Opens the device handle and the wakeup timer. A second open is a
    /// no-op.
    pub fn open(&mut self) -> DaemonResult<()> {
        if self.opened.is_some() {
            return Ok(());
        }

        info!("opening device '{}'", self.device);
        let name = CString::new(self.device.as_str()).fault(Fault::Device)?;
        let pcm = Pcm::open(&name, self.direction)
            .map_err(|e| anyhow!("open failed: {e}"))
            .fault(Fault::Device)?;
        let timer = TimerFd::new(
            ClockId::CLOCK_MONOTONIC,
            TimerFlags::TFD_CLOEXEC | TimerFlags::TFD_NONBLOCK,
        )
        .fault(Fault::Device)?;

        self.opened = Some(Opened { pcm, timer });
        self.sample_count = 0;
        self.sample_time = 0;
        Ok(())
    }

    pub fn close(&mut self) -> DaemonResult<()> {
        if let Some(opened) = self.opened.take() {
            info!("closing device '{}'", self.device);
            drop(opened);
        }
        Ok(())
    }

    pub fn is_open(&self) -> bool {
        self.opened.is_some()
    }

    /// The device handle; only valid between open and close
    pub(crate) fn pcm(&self) -> &Pcm {
        &self.opened.as_ref().expect("device is open").pcm
    }

    /// Composes the device's format descriptor and walks `start..start+num`
    /// through it, applying `filter`. With the default channel path there
    /// is exactly one composite descriptor at index 0; filtered-out entries
    /// do not advance the caller's count.
    pub fn enum_format(
        &mut self,
        start: u32,
        num: u32,
        filter: Option<&FormatFilter>,
    ) -> DaemonResult<Vec<FormatDescriptor>> {
        let was_open = self.opened.is_some();
        self.open()?;
        let result = self.enum_format_inner(start, num, filter);
        if !was_open {
            self.close()?;
        }
        result
    }

    fn enum_format_inner(
        &mut self,
        start: u32,
        num: u32,
        filter: Option<&FormatFilter>,
    ) -> DaemonResult<Vec<FormatDescriptor>> {
        let pcm = self.pcm();
        let hw = HwParams::any(pcm)
            .map_err(|e| anyhow!("no configurations available: {e}"))
            .fault(Fault::Device)?;

        let fmask = hw.format_mask().fault(Fault::Device)?;
        let amask = hw.access_mask().fault(Fault::Device)?;

        let mut formats = Vec::new();
        for f in FORMATS {
            if !fmask.test(format_to_alsa(*f)) {
                continue;
            }
            if amask.test_mmap_interleaved() {
                formats.push(*f);
            }
            if amask.test_mmap_noninterleaved() {
                if let Some(planar) = f.planar_variant() {
                    formats.push(planar);
                }
            }
        }
        if formats.is_empty() {
            return Err(anyhow!("device supports no mappable format")).fault(Fault::Device);
        }
        let format = if formats.len() == 1 {
            Choice::Single(formats[0])
        } else {
            Choice::Enum(formats)
        };

        let rate = range_choice(
            hw.get_rate_min().fault(Fault::Device)?,
            hw.get_rate_max().fault(Fault::Device)?,
            DEFAULT_RATE,
        );
        let channels = range_choice(
            hw.get_channels_min().fault(Fault::Device)?,
            hw.get_channels_max().fault(Fault::Device)?,
            DEFAULT_CHANNELS,
        );

        let descriptor = FormatDescriptor {
            format,
            rate,
            channels,
        };

        let mut out = Vec::new();
        let mut index = start;
        while (out.len() as u32) < num {
            if index > 0 {
                break;
            }
            index += 1;
            if let Some(filter) = filter {
                if !descriptor.matches(filter) {
                    continue;
                }
            }
            out.push(descriptor.clone());
        }
        Ok(out)
    }

    /// Negotiates hardware parameters: mmap interleaved access, timer
    /// wakeups only, the exact sample format, near-matched channels and
    /// rate. Returns what was granted; a non-exact grant fails unless
    /// `nearest` is set.
    pub fn set_format(&mut self, info: AudioInfo, nearest: bool) -> DaemonResult<AudioInfo> {
        self.open()?;

        let alsa_format = format_to_alsa(info.format);
        let mut granted = info;

        let (period, buffer) = {
            let pcm = self.pcm();
            let hw = HwParams::any(pcm)
                .map_err(|e| anyhow!("no configurations available: {e}"))
                .fault(Fault::Device)?;

            hw.set_rate_resample(false).fault(Fault::Device)?;
            hw.set_access_mmap_interleaved().fault(Fault::Device)?;

            // wakeups come from our timer
            if hw.can_disable_period_wakeup() {
                hw.set_period_wakeup(false).fault(Fault::Device)?;
            }

            hw.set_format(alsa_format).fault(Fault::Device)?;

            let rchannels = hw.set_channels_near(info.channels).fault(Fault::Device)?;
            granted.channels = match resolve_near(info.channels, rchannels, nearest) {
                Some(c) => c,
                None => {
                    warn!(
                        "channels do not match (requested {}, got {rchannels})",
                        info.channels
                    );
                    return Err(anyhow!("EINVAL: channel count mismatch")).fault(Fault::Device);
                }
            };

            let rrate = hw.set_rate_near(info.rate).fault(Fault::Device)?;
            granted.rate = match resolve_near(info.rate, rrate, nearest) {
                Some(r) => r,
                None => {
                    warn!("rate does not match (requested {}, got {rrate})", info.rate);
                    return Err(anyhow!("EINVAL: rate mismatch")).fault(Fault::Device);
                }
            };

            let period = hw
                .set_period_size_near(self.period_target)
                .fault(Fault::Device)?;
            let max_buffer = hw.get_buffer_size_max().fault(Fault::Device)?;
            let buffer = hw.set_buffer_size_near(max_buffer).fault(Fault::Device)?;

            pcm.hw_params(&hw).fault(Fault::Device)?;

            (period, buffer)
        };

        self.period_frames = period;
        self.buffer_frames = buffer;
        self.format = Some(granted.format);
        self.alsa_format = alsa_format;
        self.rate = granted.rate;
        self.channels = granted.channels;
        self.frame_size =
            granted.channels as usize * granted.format.physical_width();

        let periods = if self.period_frames > 0 {
            self.buffer_frames / self.period_frames
        } else {
            0
        };
        info!(
            "'{}': buffer frames {}, period frames {}, periods {}, frame_size {}",
            self.device, self.buffer_frames, self.period_frames, periods, self.frame_size
        );

        // fresh buffers for the negotiated geometry
        self.pool = BufferPool::new(N_BUFFERS, self.period_frames as usize * self.frame_size);

        Ok(granted)
    }

    /// Timestamping on, no automatic start, no period events
    pub(crate) fn set_swparams(&mut self) -> DaemonResult<()> {
        let pcm = self.pcm();
        let sw = SwParams::current(pcm).fault(Fault::Device)?;
        sw.set_tstamp_enabled().fault(Fault::Device)?;
        sw.set_start_threshold_never().fault(Fault::Device)?;
        sw.set_period_event(false).fault(Fault::Device)?;
        pcm.sw_params(&sw).fault(Fault::Device)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_every_format_maps_to_alsa() {
        for f in FORMATS {
            assert_ne!(format_to_alsa(*f), alsa::SND_PCM_FORMAT_UNKNOWN);
            if let Some(p) = f.planar_variant() {
                assert_ne!(format_to_alsa(p), alsa::SND_PCM_FORMAT_UNKNOWN);
            }
        }
    }

    #[test]
    fn test_range_choice_collapses_single() {
        assert_eq!(range_choice(48000, 48000, 44100), Choice::Single(48000));
    }

    #[test]
    fn test_range_choice_clamps_preferred() {
        let c = range_choice(8000, 44100, 48000);
        assert_eq!(
            c,
            Choice::Range {
                default: 44100,
                min: 8000,
                max: 44100
            }
        );
        assert_eq!(c.default_value(), 44100);
        assert!(c.admits(22050));
        assert!(!c.admits(96000));
    }

    #[test]
    fn test_resolve_near_requires_flag_for_fallback() {
        // exact grants always pass
        assert_eq!(resolve_near(48000, 48000, false), Some(48000));
        // clamped grants only with nearest matching enabled
        assert_eq!(resolve_near(96000, 48000, true), Some(48000));
        assert_eq!(resolve_near(96000, 48000, false), None);
    }

    #[test]
    #[ignore = "needs an ALSA device"]
    fn test_enumerate_default_device() {
        let mut config = crate::config::Config::default();
        config.device = "default".into();
        let mut state = State::new(&config, Direction::Playback, Box::new(NoEvents));
        let descriptors = state.enum_format(0, 4, None).unwrap();
        assert_eq!(descriptors.len(), 1);
        assert!(!state.is_open(), "probe must close what it opened");
    }

    #[test]
    fn test_descriptor_filter() {
        let desc = FormatDescriptor {
            format: Choice::Enum(vec![SampleFormat::S16LE, SampleFormat::S32LE]),
            rate: range_choice(8000, 96000, 48000),
            channels: Choice::Single(2),
        };
        assert!(desc.matches(&FormatFilter::default()));
        assert!(desc.matches(&FormatFilter {
            format: Some(SampleFormat::S16LE),
            rate: Some(44100),
            channels: Some(2),
        }));
        assert!(!desc.matches(&FormatFilter {
            format: Some(SampleFormat::F64LE),
            ..Default::default()
        }));
        assert!(!desc.matches(&FormatFilter {
            channels: Some(6),
            ..Default::default()
        }));
    }
}
