//! Thin checked wrappers over the parts of alsa-lib the pcm engine uses
//!
//! Only the calls the timer-driven engine needs are wrapped; every ALSA
//! return code is checked and carried as an [AlsaError] holding the
//! function name and the negative errno.

use std::ffi::CStr;
use std::fmt;
use std::ptr;

use alsa_sys as alsa;
use libc::{c_int, c_uint};
use wavepipe_core::Direction;

pub type Frames = alsa::snd_pcm_sframes_t;
pub type UFrames = alsa::snd_pcm_uframes_t;
pub type Format = alsa::snd_pcm_format_t;

// open mode bits from alsa/pcm.h
const OPEN_NONBLOCK: c_int = 0x0000_0001;
const OPEN_NO_AUTO_RESAMPLE: c_int = 0x0001_0000;
const OPEN_NO_AUTO_CHANNELS: c_int = 0x0002_0000;
const OPEN_NO_AUTO_FORMAT: c_int = 0x0004_0000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AlsaError(&'static str, c_int);

pub type Result<T> = std::result::Result<T, AlsaError>;

impl AlsaError {
    /// The positive unix error number
    pub fn errno(&self) -> i32 {
        -self.1
    }

    /// Underrun, overrun or suspend; recoverable via [Pcm::recover]
    pub fn is_xrun(&self) -> bool {
        self.1 == -libc::EPIPE || self.1 == -libc::ESTRPIPE
    }
}

impl fmt::Display for AlsaError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let s = unsafe { CStr::from_ptr(alsa::snd_strerror(self.1)) };
        write!(
            f,
            "{}: {} (code {})",
            self.0,
            s.to_str().unwrap_or("(invalid utf8)"),
            self.1
        )
    }
}

impl std::error::Error for AlsaError {}

macro_rules! acheck {
    ($f:ident ( $($x:expr),* )) => {{
        let r = unsafe { alsa::$f( $($x),* ) };
        if r < 0 {
            Err(AlsaError(stringify!($f), r as c_int))
        } else {
            Ok(r)
        }
    }};
}

/// snd_pcm_t wrapper
pub struct Pcm(*mut alsa::snd_pcm_t);

// The handle is owned by exactly one loop at a time; moving it between the
// main loop and a data-loop thread transfers that ownership wholesale.
unsafe impl Send for Pcm {}

impl Pcm {
    /// Opens the device non-blocking with automatic resampling, channel and
    /// format conversion disabled; the daemon does its own matching.
    pub fn open(name: &CStr, direction: Direction) -> Result<Pcm> {
        let stream = match direction {
            Direction::Playback => alsa::SND_PCM_STREAM_PLAYBACK,
            Direction::Capture => alsa::SND_PCM_STREAM_CAPTURE,
        };
        let mode =
            OPEN_NONBLOCK | OPEN_NO_AUTO_RESAMPLE | OPEN_NO_AUTO_CHANNELS | OPEN_NO_AUTO_FORMAT;
        let mut handle = ptr::null_mut();
        acheck!(snd_pcm_open(&mut handle, name.as_ptr(), stream, mode)).map(|_| Pcm(handle))
    }

    pub fn start(&self) -> Result<()> {
        acheck!(snd_pcm_start(self.0)).map(|_| ())
    }

    pub fn drop_stream(&self) -> Result<()> {
        acheck!(snd_pcm_drop(self.0)).map(|_| ())
    }

    pub fn prepare(&self) -> Result<()> {
        acheck!(snd_pcm_prepare(self.0)).map(|_| ())
    }

    pub fn rewind(&self, frames: UFrames) -> Result<Frames> {
        let r = unsafe { alsa::snd_pcm_rewind(self.0, frames) };
        if r < 0 {
            Err(AlsaError("snd_pcm_rewind", r as c_int))
        } else {
            Ok(r)
        }
    }

    pub fn avail(&self) -> Result<Frames> {
        let r = unsafe { alsa::snd_pcm_avail(self.0) };
        if r < 0 {
            Err(AlsaError("snd_pcm_avail", r as c_int))
        } else {
            Ok(r)
        }
    }

    /// Recovers from an xrun or suspend
    pub fn recover(&self, err: AlsaError, silent: bool) -> Result<()> {
        acheck!(snd_pcm_recover(self.0, err.1, silent as c_int)).map(|_| ())
    }

    pub fn status(&self) -> Result<Status> {
        let status = Status::new()?;
        acheck!(snd_pcm_status(self.0, status.0)).map(|_| status)
    }

    pub fn hw_params(&self, params: &HwParams) -> Result<()> {
        acheck!(snd_pcm_hw_params(self.0, params.0)).map(|_| ())
    }

    pub fn sw_params(&self, params: &SwParams) -> Result<()> {
        acheck!(snd_pcm_sw_params(self.0, params.0)).map(|_| ())
    }

    /// Maps the next contiguous region of the ring buffer for direct
    /// access, clamped to `frames`
    pub fn mmap_begin(&self, frames: UFrames) -> Result<(MmapAreas, UFrames, UFrames)> {
        let mut areas = ptr::null();
        let mut offset: UFrames = 0;
        let mut got: UFrames = frames;
        acheck!(snd_pcm_mmap_begin(self.0, &mut areas, &mut offset, &mut got))
            .map(|_| (MmapAreas(areas), offset, got))
    }

    pub fn mmap_commit(&self, offset: UFrames, frames: UFrames) -> Result<Frames> {
        let r = unsafe { alsa::snd_pcm_mmap_commit(self.0, offset, frames) };
        if r < 0 {
            Err(AlsaError("snd_pcm_mmap_commit", r as c_int))
        } else {
            Ok(r)
        }
    }
}

impl Drop for Pcm {
    fn drop(&mut self) {
        unsafe { alsa::snd_pcm_close(self.0) };
    }
}

/// The channel areas yielded by [Pcm::mmap_begin], valid until the commit
pub struct MmapAreas(pub(crate) *const alsa::snd_pcm_channel_area_t);

impl MmapAreas {
    /// Start of interleaved frame `offset`
    ///
    /// # Safety
    /// Only valid between mmap_begin and mmap_commit, within the frame
    /// count returned by mmap_begin.
    pub unsafe fn frame_ptr(&self, offset: UFrames, frame_size: usize) -> *mut u8 {
        let area = &*self.0;
        (area.addr as *mut u8).add(offset as usize * frame_size)
    }

    /// Fills `frames` frames starting at `offset` with silence in the
    /// device's native format
    pub fn silence(
        &self,
        offset: UFrames,
        channels: u32,
        frames: UFrames,
        format: Format,
    ) -> Result<()> {
        acheck!(snd_pcm_areas_silence(
            self.0,
            offset,
            channels as c_uint,
            frames,
            format
        ))
        .map(|_| ())
    }
}

/// snd_pcm_status_t wrapper
pub struct Status(*mut alsa::snd_pcm_status_t);

impl Status {
    fn new() -> Result<Status> {
        let mut p = ptr::null_mut();
        acheck!(snd_pcm_status_malloc(&mut p)).map(|_| Status(p))
    }

    pub fn state(&self) -> alsa::snd_pcm_state_t {
        unsafe { alsa::snd_pcm_status_get_state(self.0) }
    }

    pub fn is_xrun_state(&self) -> bool {
        self.state() == alsa::SND_PCM_STATE_XRUN
    }

    /// Now and trigger timestamps in nanoseconds
    pub fn htstamp(&self) -> i64 {
        let mut ts: alsa::snd_htimestamp_t = unsafe { std::mem::zeroed() };
        unsafe { alsa::snd_pcm_status_get_htstamp(self.0, &mut ts) };
        ts.tv_sec as i64 * 1_000_000_000 + ts.tv_nsec as i64
    }

    pub fn trigger_htstamp(&self) -> i64 {
        let mut ts: alsa::snd_htimestamp_t = unsafe { std::mem::zeroed() };
        unsafe { alsa::snd_pcm_status_get_trigger_htstamp(self.0, &mut ts) };
        ts.tv_sec as i64 * 1_000_000_000 + ts.tv_nsec as i64
    }
}

impl Drop for Status {
    fn drop(&mut self) {
        unsafe { alsa::snd_pcm_status_free(self.0) };
    }
}

/// snd_pcm_hw_params_t wrapper
pub struct HwParams<'a>(*mut alsa::snd_pcm_hw_params_t, &'a Pcm);

impl<'a> HwParams<'a> {
    pub fn any(pcm: &'a Pcm) -> Result<HwParams<'a>> {
        let mut p = ptr::null_mut();
        acheck!(snd_pcm_hw_params_malloc(&mut p))?;
        let params = HwParams(p, pcm);
        acheck!(snd_pcm_hw_params_any((params.1).0, params.0)).map(|_| params)
    }

    pub fn set_rate_resample(&self, resample: bool) -> Result<()> {
        acheck!(snd_pcm_hw_params_set_rate_resample(
            (self.1).0,
            self.0,
            resample as c_uint
        ))
        .map(|_| ())
    }

    pub fn set_access_mmap_interleaved(&self) -> Result<()> {
        acheck!(snd_pcm_hw_params_set_access(
            (self.1).0,
            self.0,
            alsa::SND_PCM_ACCESS_MMAP_INTERLEAVED
        ))
        .map(|_| ())
    }

    pub fn can_disable_period_wakeup(&self) -> bool {
        unsafe { alsa::snd_pcm_hw_params_can_disable_period_wakeup(self.0) != 0 }
    }

    pub fn set_period_wakeup(&self, enable: bool) -> Result<()> {
        acheck!(snd_pcm_hw_params_set_period_wakeup(
            (self.1).0,
            self.0,
            enable as c_uint
        ))
        .map(|_| ())
    }

    pub fn set_format(&self, format: Format) -> Result<()> {
        acheck!(snd_pcm_hw_params_set_format((self.1).0, self.0, format)).map(|_| ())
    }

    pub fn set_channels_near(&self, channels: u32) -> Result<u32> {
        let mut v = channels as c_uint;
        acheck!(snd_pcm_hw_params_set_channels_near((self.1).0, self.0, &mut v))
            .map(|_| v as u32)
    }

    pub fn set_rate_near(&self, rate: u32) -> Result<u32> {
        let mut v = rate as c_uint;
        let mut dir = 0;
        acheck!(snd_pcm_hw_params_set_rate_near(
            (self.1).0,
            self.0,
            &mut v,
            &mut dir
        ))
        .map(|_| v as u32)
    }

    pub fn set_period_size_near(&self, frames: UFrames) -> Result<UFrames> {
        let mut v = frames;
        let mut dir = 0;
        acheck!(snd_pcm_hw_params_set_period_size_near(
            (self.1).0,
            self.0,
            &mut v,
            &mut dir
        ))
        .map(|_| v)
    }

    pub fn get_buffer_size_max(&self) -> Result<UFrames> {
        let mut v: UFrames = 0;
        acheck!(snd_pcm_hw_params_get_buffer_size_max(self.0, &mut v)).map(|_| v)
    }

    pub fn set_buffer_size_near(&self, frames: UFrames) -> Result<UFrames> {
        let mut v = frames;
        acheck!(snd_pcm_hw_params_set_buffer_size_near((self.1).0, self.0, &mut v)).map(|_| v)
    }

    pub fn get_rate_min(&self) -> Result<u32> {
        let mut v: c_uint = 0;
        let mut dir = 0;
        acheck!(snd_pcm_hw_params_get_rate_min(self.0, &mut v, &mut dir)).map(|_| v as u32)
    }

    pub fn get_rate_max(&self) -> Result<u32> {
        let mut v: c_uint = 0;
        let mut dir = 0;
        acheck!(snd_pcm_hw_params_get_rate_max(self.0, &mut v, &mut dir)).map(|_| v as u32)
    }

    pub fn get_channels_min(&self) -> Result<u32> {
        let mut v: c_uint = 0;
        acheck!(snd_pcm_hw_params_get_channels_min(self.0, &mut v)).map(|_| v as u32)
    }

    pub fn get_channels_max(&self) -> Result<u32> {
        let mut v: c_uint = 0;
        acheck!(snd_pcm_hw_params_get_channels_max(self.0, &mut v)).map(|_| v as u32)
    }

    pub fn format_mask(&self) -> Result<FormatMask> {
        let mask = FormatMask::new()?;
        unsafe { alsa::snd_pcm_hw_params_get_format_mask(self.0, mask.0) };
        Ok(mask)
    }

    pub fn access_mask(&self) -> Result<AccessMask> {
        let mask = AccessMask::new()?;
        acheck!(snd_pcm_hw_params_get_access_mask(self.0, mask.0)).map(|_| mask)
    }
}

impl<'a> Drop for HwParams<'a> {
    fn drop(&mut self) {
        unsafe { alsa::snd_pcm_hw_params_free(self.0) };
    }
}

pub struct FormatMask(*mut alsa::snd_pcm_format_mask_t);

impl FormatMask {
    fn new() -> Result<FormatMask> {
        let mut p = ptr::null_mut();
        acheck!(snd_pcm_format_mask_malloc(&mut p)).map(|_| FormatMask(p))
    }

    pub fn test(&self, format: Format) -> bool {
        unsafe { alsa::snd_pcm_format_mask_test(self.0, format) != 0 }
    }
}

impl Drop for FormatMask {
    fn drop(&mut self) {
        unsafe { alsa::snd_pcm_format_mask_free(self.0) };
    }
}

pub struct AccessMask(*mut alsa::snd_pcm_access_mask_t);

impl AccessMask {
    fn new() -> Result<AccessMask> {
        let mut p = ptr::null_mut();
        acheck!(snd_pcm_access_mask_malloc(&mut p)).map(|_| AccessMask(p))
    }

    pub fn test_mmap_interleaved(&self) -> bool {
        unsafe {
            alsa::snd_pcm_access_mask_test(self.0, alsa::SND_PCM_ACCESS_MMAP_INTERLEAVED) != 0
        }
    }

    pub fn test_mmap_noninterleaved(&self) -> bool {
        unsafe {
            alsa::snd_pcm_access_mask_test(self.0, alsa::SND_PCM_ACCESS_MMAP_NONINTERLEAVED) != 0
        }
    }
}

impl Drop for AccessMask {
    fn drop(&mut self) {
        unsafe { alsa::snd_pcm_access_mask_free(self.0) };
    }
}

/// snd_pcm_sw_params_t wrapper
pub struct SwParams<'a>(*mut alsa::snd_pcm_sw_params_t, &'a Pcm);

impl<'a> SwParams<'a> {
    pub fn current(pcm: &'a Pcm) -> Result<SwParams<'a>> {
        let mut p = ptr::null_mut();
        acheck!(snd_pcm_sw_params_malloc(&mut p))?;
        let params = SwParams(p, pcm);
        acheck!(snd_pcm_sw_params_current((params.1).0, params.0)).map(|_| params)
    }

    pub fn set_tstamp_enabled(&self) -> Result<()> {
        acheck!(snd_pcm_sw_params_set_tstamp_mode(
            (self.1).0,
            self.0,
            alsa::SND_PCM_TSTAMP_ENABLE
        ))
        .map(|_| ())
    }

    /// Pushes the automatic start out of reach; the engine starts the
    /// device explicitly after priming
    pub fn set_start_threshold_never(&self) -> Result<()> {
        acheck!(snd_pcm_sw_params_set_start_threshold(
            (self.1).0,
            self.0,
            libc::c_long::MAX as UFrames
        ))
        .map(|_| ())
    }

    pub fn set_period_event(&self, enable: bool) -> Result<()> {
        acheck!(snd_pcm_sw_params_set_period_event(
            (self.1).0,
            self.0,
            enable as c_int
        ))
        .map(|_| ())
    }
}

impl<'a> Drop for SwParams<'a> {
    fn drop(&mut self) {
        unsafe { alsa::snd_pcm_sw_params_free(self.0) };
    }
}
