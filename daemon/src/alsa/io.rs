//! The timer-driven transfer loop
//!
//! One thread per started device runs the timeout handlers off a monotonic
//! timerfd armed with absolute expiries. The hot path takes no locks and
//! allocates nothing; cross-loop mutation arrives through the invoke
//! queue's eventfd.

use std::io::ErrorKind;
use std::os::fd::{AsFd, AsRawFd, BorrowedFd};
use std::sync::Arc;
use std::thread::JoinHandle;

use anyhow::anyhow;
use nix::errno::Errno;
use nix::sys::time::TimeSpec;
use nix::sys::timerfd::{Expiration, TimerSetTimeFlags};
use nix::time::{clock_gettime, ClockId};
use polling::{Event, Events, Poller};
use wavepipe_core::buffers::{BufferFlags, BufferHeader, BufferPool, Chunk, IoStatus};
use wavepipe_core::dll::{DLL_BW_MAX, DLL_BW_MIN, DLL_BW_PERIOD};
use wavepipe_core::error::{DaemonResult, Fault, ResultExt};
use wavepipe_core::Direction;

use crate::alsa::device::State;
use crate::alsa::pcm::{AlsaError, Frames, MmapAreas, UFrames};
use crate::mainloop::InvokeQueue;

const NSEC_PER_SEC: u64 = 1_000_000_000;

type IoResult<T> = Result<T, AlsaError>;

fn now_nsec() -> u64 {
    match clock_gettime(ClockId::CLOCK_MONOTONIC) {
        Ok(ts) => ts.tv_sec() as u64 * NSEC_PER_SEC + ts.tv_nsec() as u64,
        Err(_) => 0,
    }
}

/// Arms the absolute wakeup unless the device follows an external clock
fn set_timeout(state: &State, time: u64) {
    if state.slaved {
        return;
    }
    if let Some(opened) = &state.opened {
        let ts = TimeSpec::new(
            (time / NSEC_PER_SEC) as i64,
            (time % NSEC_PER_SEC) as i64,
        );
        if let Err(e) = opened
            .timer
            .set(Expiration::OneShot(ts), TimerSetTimeFlags::TFD_TIMER_ABSTIME)
        {
            warn!("cannot arm timer: {e}");
        }
    }
}

/// Reschedule rule for a playback wakeup that came while the device still
/// holds two quanta or more
pub(crate) fn playback_next_after_early(now: u64, threshold: u32, rate: u32) -> u64 {
    now + (threshold as u64 / 2) * NSEC_PER_SEC / rate as u64
}

/// Reschedule rule for a capture wakeup before a full quantum accumulated
pub(crate) fn capture_next_after_early(now: u64, avail: Frames, threshold: u32, rate: u32) -> u64 {
    now + (threshold as u64).saturating_sub(avail.max(0) as u64) * NSEC_PER_SEC / rate as u64
}

/// Converts the observed wakeup into the next one via the loop filter and
/// publishes the clock observation
pub(crate) fn update_time(state: &mut State, nsec: u64, delay: Frames, slaved: bool) {
    let sample_time = state.sample_count;
    let mut elapsed = if slaved {
        state.threshold as u64
    } else {
        sample_time - state.sample_time
    };

    let mut delay = delay;
    let mut extra = 0.0;
    let sdelay;
    if state.direction == Direction::Capture {
        elapsed = state.threshold as u64;
        extra = elapsed as f64 / state.rate as f64;
        sdelay = delay - elapsed as i64;
    } else {
        if elapsed == 0 {
            elapsed = state.threshold as u64 / 2;
            delay = state.threshold as Frames / 2;
        }
        state.sample_time = sample_time;
        sdelay = -delay;
    }

    // match the wakeup phase against the frames actually in flight
    let mut tw = nsec as f64 * 1e-9 - sdelay as f64 / state.rate as f64 - state.safety;
    tw = state.dll.update(tw, elapsed as f64 / state.rate as f64);
    state.next_time = ((tw + extra - state.safety) * 1e9) as u64;

    if state.dll.bw > DLL_BW_MIN && tw > state.dll.base + DLL_BW_PERIOD {
        state.dll.set_bandwidth(DLL_BW_MIN);
    }

    if let Some(clock) = &state.clock {
        clock.publish(
            state.last_time,
            state.rate,
            state.sample_count,
            sdelay,
            state.dll.dt,
        );
    }

    state.old_dt = state.dll.dt.clamp(0.95, 1.05);

    trace!(
        "{} {} {} {} {} {} {}",
        nsec,
        state.old_dt,
        delay,
        elapsed,
        state.threshold,
        state.next_time,
        tw
    );

    state.last_time = nsec;
}

/// Xrun and suspend handling: query what happened, recover the device,
/// reset the loop filter to fast lock-in and re-prime the stream
fn alsa_recover(state: &mut State, err: AlsaError) -> IoResult<()> {
    {
        let pcm = state.pcm();
        match pcm.status() {
            Ok(status) if status.is_xrun_state() => {
                let stall = (status.htstamp() - status.trigger_htstamp()).max(0);
                let missing = stall as u64 * state.rate as u64 / NSEC_PER_SEC;
                error!(
                    "'{}': xrun of {} usec, {missing} frames",
                    state.device,
                    stall / 1000
                );
            }
            Ok(status) => error!("recover from error state {}", status.state()),
            Err(e) => {
                error!("snd_pcm_status error: {e}");
                return Err(e);
            }
        }
        if let Err(e) = pcm.recover(err, true) {
            error!("snd_pcm_recover error: {e}");
            return Err(e);
        }
    }

    state.dll.init(DLL_BW_MAX);

    if state.direction == Direction::Capture {
        if let Err(e) = state.pcm().start() {
            error!("snd_pcm_start: {e}");
            return Err(e);
        }
        state.alsa_started = true;
    } else {
        state.alsa_started = false;
        write_frames(state, state.threshold as UFrames * 2, true)?;
    }
    Ok(())
}

/// Frames in flight, recovering once when the query itself reports an xrun
fn get_status(state: &mut State) -> IoResult<Frames> {
    let first = state.pcm().avail();
    let avail = match first {
        Ok(avail) => avail,
        Err(e) => {
            alsa_recover(state, e)?;
            state.pcm().avail()?
        }
    };
    Ok(match state.direction {
        Direction::Playback => state.buffer_frames as Frames - avail,
        Direction::Capture => avail,
    })
}

/// Moves frames from the ready queue into `dst`, honouring each chunk's
/// circular wrap. Returns frames written and the fully drained buffer ids
/// (already flagged checked-out and popped).
pub(crate) fn drain_ready(
    pool: &mut BufferPool,
    ready_offset: &mut usize,
    frame_size: usize,
    dst: &mut [u8],
) -> (usize, Vec<u32>) {
    let mut frames_written = 0usize;
    let mut consumed = Vec::new();
    let mut to_write = dst.len() / frame_size;
    let mut dpos = 0usize;

    while to_write > 0 {
        let Some(bid) = pool.front_ready() else { break };

        let (n_frames, n_bytes, size) = {
            let b = pool.get(bid).unwrap();
            let size = b.chunk.size as usize;
            let maxsize = b.data.len();
            let index = b.chunk.offset as usize + *ready_offset;

            let avail = (size - *ready_offset) / frame_size;
            let n_frames = avail.min(to_write);
            let n_bytes = n_frames * frame_size;

            let offs = index % maxsize;
            let l0 = n_bytes.min(maxsize - offs);
            let l1 = n_bytes - l0;

            dst[dpos..dpos + l0].copy_from_slice(&b.data[offs..offs + l0]);
            if l1 > 0 {
                dst[dpos + l0..dpos + n_bytes].copy_from_slice(&b.data[..l1]);
            }
            (n_frames, n_bytes, size)
        };

        if n_bytes == 0 && *ready_offset < size {
            // sub-frame residue cannot make progress; drop the buffer
            let id = pool.pop_ready().unwrap();
            pool.get_mut(id).unwrap().flags.insert(BufferFlags::OUT);
            consumed.push(id);
            *ready_offset = 0;
            continue;
        }

        *ready_offset += n_bytes;
        if *ready_offset >= size {
            let id = pool.pop_ready().unwrap();
            pool.get_mut(id).unwrap().flags.insert(BufferFlags::OUT);
            consumed.push(id);
            *ready_offset = 0;
        }

        frames_written += n_frames;
        dpos += n_bytes;
        to_write -= n_frames;
    }

    (frames_written, consumed)
}

/// Fills one free buffer from captured bytes, stamping its header and
/// chunk. Returns the buffer id and frames taken.
pub(crate) fn capture_one(
    pool: &mut BufferPool,
    src: &[u8],
    frame_size: usize,
    header: BufferHeader,
) -> Option<(u32, usize)> {
    let id = pool.pop_free()?;
    let b = pool.get_mut(id).unwrap();
    b.header = header;

    let maxsize = b.data.len();
    let avail = maxsize / frame_size;
    let frames = avail.min(src.len() / frame_size);
    let n_bytes = frames * frame_size;

    let index = 0usize;
    let offs = index % maxsize;
    let l0 = n_bytes.min(maxsize - offs);
    let l1 = n_bytes - l0;

    b.data[offs..offs + l0].copy_from_slice(&src[..l0]);
    if l1 > 0 {
        b.data[..l1].copy_from_slice(&src[l0..n_bytes]);
    }

    b.chunk = Chunk {
        offset: index as u32,
        size: n_bytes as u32,
        stride: frame_size as u32,
    };
    b.flags.insert(BufferFlags::OUT);

    Some((id, frames))
}

/// The playback transfer: drain ready buffers into the mapped ring, pad
/// with silence, commit, and start the device on the first committed data
pub(crate) fn write_frames(state: &mut State, silence: UFrames, start: bool) -> IoResult<()> {
    if let Some(position) = &state.position {
        let size = position.size();
        if size != 0 && state.threshold != size {
            state.threshold = size;
        }
    }

    if state.slaved {
        if let Some(position) = state.position.clone() {
            // follow the reference clock instead of our own wallclock
            let master = position
                .clock
                .position()
                .wrapping_add_signed(position.clock.delay());
            let nsec = master.saturating_mul(NSEC_PER_SEC) / state.rate as u64;

            let delay = get_status(state)?;
            update_time(state, nsec, delay, true);

            trace!("slave {} {} {} {}", state.dll.dt, nsec, delay, state.rate);

            if delay > state.threshold as Frames * 2 {
                // shed latency
                state.pcm().rewind(state.threshold as UFrames)?;
            }
        }
    }

    let mut silence = silence;
    let mut total_written: UFrames = 0;
    loop {
        let (areas, offset, frames) = state.pcm().mmap_begin(state.buffer_frames)?;
        trace!("begin {offset} {frames} {}", state.threshold);

        silence = silence.min(frames);
        let frame_size = state.frame_size;

        let written = {
            let dst = unsafe {
                std::slice::from_raw_parts_mut(
                    areas.frame_ptr(offset, frame_size),
                    frames as usize * frame_size,
                )
            };
            let (data_frames, consumed) =
                drain_ready(&mut state.pool, &mut state.ready_offset, frame_size, dst);
            for id in consumed {
                state.last_consumed = Some(id);
                trace!("reuse buffer {id}");
                state.events.reuse_buffer(id);
            }
            let mut written = data_frames as UFrames;
            silence = silence.saturating_sub(written);

            if silence > 0 {
                trace!("silence {silence}");
                if let Err(e) = areas.silence(
                    offset + written,
                    state.channels,
                    silence,
                    state.alsa_format,
                ) {
                    warn!("silence failed: {e}");
                }
                written += silence;
            }
            written
        };

        trace!("commit {offset} {written} {}", state.sample_count);
        total_written += written;

        match state.pcm().mmap_commit(offset, written) {
            Ok(_) => {}
            Err(e) if e.is_xrun() => error!("snd_pcm_mmap_commit error: {e}"),
            Err(e) => {
                error!("snd_pcm_mmap_commit error: {e}");
                return Err(e);
            }
        }

        if state.pool.ready_is_empty() || written == 0 {
            break;
        }
    }

    state.sample_count += total_written as u64;

    if !state.alsa_started && total_written > 0 && start {
        trace!("starting device after {total_written} primed frames");
        if let Err(e) = state.pcm().start() {
            error!("snd_pcm_start: {e}");
            return Err(e);
        }
        state.alsa_started = true;
    }
    Ok(())
}

fn handle_play(state: &mut State) {
    if let Some(position) = &state.position {
        let size = position.size();
        if size != 0 {
            state.threshold = size;
        }
    }

    let now = now_nsec();
    let delay = match get_status(state) {
        Ok(delay) => delay,
        Err(_) => return,
    };

    trace!(
        "timeout {delay} {now} {} {} {}",
        state.next_time,
        state.threshold,
        state.sample_count
    );

    if delay >= state.threshold as Frames * 2 {
        trace!("early wakeup {delay} {}", state.threshold);
        state.next_time = playback_next_after_early(now, state.threshold, state.rate);
        return;
    }

    update_time(state, now, delay, false);

    if state.pool.ready_is_empty() {
        state.io_status = IoStatus::NeedBuffer;
        state.events.ready(&mut state.pool, IoStatus::NeedBuffer);
    } else if let Err(e) = write_frames(state, 0, true) {
        error!("write failed: {e}");
    }
}

fn capture_pass(
    state: &mut State,
    areas: &MmapAreas,
    offset: UFrames,
    frames: UFrames,
    now: u64,
) -> UFrames {
    if state.pool.free_len() == 0 {
        // nothing to capture into; a full quantum is dropped and the read
        // cycle ends after this pass
        warn!("'{}': no more buffers", state.device);
        return state.threshold as UFrames;
    }

    let frame_size = state.frame_size;
    let src = unsafe {
        std::slice::from_raw_parts(
            areas.frame_ptr(offset, frame_size),
            frames as usize * frame_size,
        )
    };
    let header = BufferHeader {
        seq: state.sample_count,
        pts: now as i64,
        dts_offset: 0,
    };
    let Some((id, got)) = capture_one(&mut state.pool, src, frame_size, header) else {
        return 0;
    };

    if !matches!(state.io_status, IoStatus::HaveBuffer(_)) {
        state.io_status = IoStatus::HaveBuffer(id);
    } else {
        state.pool.push_ready(id);
    }
    state.events.ready(&mut state.pool, IoStatus::HaveBuffer(id));

    got as UFrames
}

fn handle_capture(state: &mut State) {
    if let Some(position) = &state.position {
        let size = position.size();
        if size != 0 {
            state.threshold = size;
        }
    }

    let now = now_nsec();
    let delay = match get_status(state) {
        Ok(delay) => delay,
        Err(_) => return,
    };

    trace!(
        "timeout {delay} {now} {} {} {}",
        state.next_time,
        state.threshold,
        state.sample_count
    );

    if delay < state.threshold as Frames {
        trace!("early wakeup {delay} {}", state.threshold);
        state.next_time = capture_next_after_early(now, delay, state.threshold, state.rate);
        return;
    }

    update_time(state, now, delay, false);

    let to_read = (delay as UFrames).min(state.threshold as UFrames);
    let mut total_read: UFrames = 0;
    while total_read < to_read {
        let wanted = to_read - total_read;
        let (areas, offset, frames) =
            match state.pcm().mmap_begin(wanted) {
                Ok(mapped) => mapped,
                Err(e) => {
                    error!("snd_pcm_mmap_begin error: {e}");
                    return;
                }
            };

        let read = capture_pass(state, &areas, offset, frames, now);

        trace!("commit {offset} {read}");
        match state.pcm().mmap_commit(offset, read) {
            Ok(_) => {}
            Err(e) if e.is_xrun() => error!("snd_pcm_mmap_commit error: {e}"),
            Err(e) => {
                error!("snd_pcm_mmap_commit error: {e}");
                return;
            }
        }

        total_read += read;
        if read < frames {
            break;
        }
    }
    state.sample_count += total_read as u64;
}

fn on_timeout(state: &mut State) {
    if state.started {
        if let Some(opened) = &state.opened {
            let mut buf = [0u8; 8];
            match nix::unistd::read(opened.timer.as_fd().as_raw_fd(), &mut buf) {
                Ok(_) => {}
                Err(Errno::EAGAIN) => {}
                Err(e) => warn!("error reading timerfd: {e}"),
            }
        }
    }

    match state.direction {
        Direction::Playback => handle_play(state),
        Direction::Capture => handle_capture(state),
    }

    set_timeout(state, state.next_time);
}

struct LoopState {
    state: State,
    stop: bool,
}

/// Handle on a device whose data loop is running
pub struct RunningDevice {
    invoke: Arc<InvokeQueue<LoopState>>,
    thread: JoinHandle<State>,
}

impl RunningDevice {
    /// Posts a closure onto the data loop without waiting
    pub fn invoke(&self, f: impl FnOnce(&mut State) + Send + 'static) {
        self.invoke.invoke(move |ls| f(&mut ls.state));
    }

    /// Posts a closure and blocks until the data loop ran it
    pub fn invoke_sync<R: Send + 'static>(
        &self,
        f: impl FnOnce(&mut State) -> R + Send + 'static,
    ) -> DaemonResult<R> {
        self.invoke.invoke_sync(move |ls| f(&mut ls.state))
    }

    /// Stops transfer: the timer watch goes away, the stream drops, and
    /// the state comes back to the caller
    pub fn pause(self) -> DaemonResult<State> {
        self.invoke.invoke(|ls| ls.stop = true);
        let mut state = self
            .thread
            .join()
            .map_err(|_| anyhow!("data loop panicked"))
            .fault(Fault::Invoke)?;

        if let Some(opened) = &state.opened {
            let _ = opened.timer.unset();
            if let Err(e) = opened.pcm.drop_stream() {
                error!("snd_pcm_drop: {e}");
            }
        }
        state.started = false;
        state.alsa_started = false;
        debug!("'{}': paused", state.device);
        Ok(state)
    }
}

/// Prepares the device, primes the stream and spawns the data loop
pub fn start_device(mut state: State) -> DaemonResult<RunningDevice> {
    if state.started {
        return Err(anyhow!("device already started")).fault(Fault::Device);
    }
    state.open()?;

    state.threshold = match &state.position {
        Some(position) if position.size() != 0 => position.size(),
        _ => state.min_latency,
    };

    state.dll.init(DLL_BW_MAX);
    state.old_dt = 1.0;
    state.safety = 0.0;

    debug!(
        "'{}': start threshold {} slaved {}",
        state.device, state.threshold, state.slaved
    );

    state.set_swparams()?;
    state
        .pcm()
        .prepare()
        .map_err(|e| anyhow!("snd_pcm_prepare error: {e}"))
        .fault(Fault::Device)?;

    state.pool.reset(state.direction);

    match state.direction {
        Direction::Playback => {
            state.alsa_started = false;
            let prime_frames = state.threshold as UFrames * 2;
            write_frames(&mut state, prime_frames, true)
                .map_err(|e| anyhow!("priming failed: {e}"))
                .fault(Fault::Device)?;
        }
        Direction::Capture => {
            state
                .pcm()
                .start()
                .map_err(|e| anyhow!("snd_pcm_start: {e}"))
                .fault(Fault::Device)?;
            state.alsa_started = true;
        }
    }

    state.io_status = IoStatus::Ok;
    state.last_consumed = None;

    if !state.slaved {
        state
            .opened
            .as_ref()
            .unwrap()
            .timer
            .set(
                Expiration::OneShot(TimeSpec::new(0, 1)),
                TimerSetTimeFlags::empty(),
            )
            .fault(Fault::Device)?;
    }

    state.started = true;

    let invoke = Arc::new(InvokeQueue::new()?);
    let thread_invoke = invoke.clone();
    let name = format!("data-{}", state.device);
    let thread = std::thread::Builder::new()
        .name(name)
        .spawn(move || {
            run_data_loop(
                LoopState {
                    state,
                    stop: false,
                },
                thread_invoke,
            )
        })
        .fault(Fault::Device)?;

    Ok(RunningDevice { invoke, thread })
}

const KEY_TIMER: usize = 0;
const KEY_INVOKE: usize = 1;

fn run_data_loop(mut ls: LoopState, invoke: Arc<InvokeQueue<LoopState>>) -> State {
    let poller = match Poller::new() {
        Ok(p) => p,
        Err(e) => {
            error!("data loop poller: {e}");
            return ls.state;
        }
    };

    let timer_fd = ls
        .state
        .opened
        .as_ref()
        .map(|o| o.timer.as_fd().as_raw_fd());
    unsafe {
        if let Some(fd) = timer_fd {
            let _ = poller.add(fd, Event::readable(KEY_TIMER));
        }
        let _ = poller.add(invoke.as_raw_fd(), Event::readable(KEY_INVOKE));
    }

    let mut events = Events::new();
    while !ls.stop {
        events.clear();
        match poller.wait(&mut events, None) {
            Ok(_) => {}
            Err(e) if e.kind() == ErrorKind::Interrupted => continue,
            Err(e) => {
                error!("data loop poll: {e}");
                break;
            }
        }

        for event in events.iter() {
            match event.key {
                KEY_INVOKE => {
                    invoke.drain(&mut ls);
                    let _ = poller.modify(
                        unsafe { BorrowedFd::borrow_raw(invoke.as_raw_fd()) },
                        Event::readable(KEY_INVOKE),
                    );
                }
                KEY_TIMER => {
                    on_timeout(&mut ls.state);
                    if let Some(fd) = timer_fd {
                        let _ = poller.modify(
                            unsafe { BorrowedFd::borrow_raw(fd) },
                            Event::readable(KEY_TIMER),
                        );
                    }
                }
                _ => {}
            }
            if ls.stop {
                break;
            }
        }
    }

    ls.state
}

#[cfg(test)]
mod tests {
    use wavepipe_core::buffers::BufferPool;

    use super::*;
    use crate::alsa::device::NoEvents;
    use crate::config::Config;

    fn test_state(direction: Direction) -> State {
        let mut state = State::new(&Config::default(), direction, Box::new(NoEvents));
        state.rate = 48000;
        state.threshold = 1024;
        state.frame_size = 4;
        state
    }

    #[test]
    fn test_playback_early_wakeup_reschedules_half_quantum() {
        let next = playback_next_after_early(1_000_000, 1024, 48000);
        assert_eq!(next, 1_000_000 + 512 * NSEC_PER_SEC / 48000);
    }

    #[test]
    fn test_capture_early_wakeup_waits_for_missing_frames() {
        let next = capture_next_after_early(1_000_000, 24, 1024, 48000);
        assert_eq!(next, 1_000_000 + 1000 * NSEC_PER_SEC / 48000);
    }

    #[test]
    fn test_update_time_schedules_one_quantum_ahead() {
        let mut state = test_state(Direction::Playback);
        let now = 5 * NSEC_PER_SEC;
        update_time(&mut state, now, 1024, false);
        // first observation primes the filter: next wakeup sits one
        // threshold past the adjusted phase
        let expected = now + 1024 * NSEC_PER_SEC / 48000;
        let diff = state.next_time as i64 - expected as i64;
        assert!(diff.abs() < 1_000_000, "next_time off by {diff} ns");
    }

    #[test]
    fn test_update_time_publishes_clock() {
        use crate::alsa::clock::ClockCell;
        use std::sync::Arc;

        let mut state = test_state(Direction::Playback);
        state.clock = Some(Arc::new(ClockCell::new()));
        state.sample_count = 4096;
        update_time(&mut state, NSEC_PER_SEC, 512, false);
        let clock = state.clock.as_ref().unwrap();
        assert_eq!(clock.position(), 4096);
        assert_eq!(clock.delay(), -512);
        assert_eq!(clock.rate(), 48000);
    }

    #[test]
    fn test_update_time_keeps_old_dt_clamped() {
        let mut state = test_state(Direction::Playback);
        let mut now = NSEC_PER_SEC;
        for _ in 0..50 {
            update_time(&mut state, now, 1024, false);
            // wildly jittered wakeups must not escape the clamp
            now += 3 * 1024 * NSEC_PER_SEC / 48000;
            state.sample_count += 1024;
            assert!(state.old_dt >= 0.95 && state.old_dt <= 1.05);
        }
    }

    fn ready_buffer(pool: &mut BufferPool, id: u32, offset: u32, data: &[u8]) {
        let b = pool.get_mut(id).unwrap();
        let maxsize = b.data.len();
        for (i, byte) in data.iter().enumerate() {
            b.data[(offset as usize + i) % maxsize] = *byte;
        }
        b.chunk = Chunk {
            offset,
            size: data.len() as u32,
            stride: 4,
        };
        pool.push_ready(id);
    }

    #[test]
    fn test_drain_ready_copies_and_recycles() {
        let mut pool = BufferPool::new(2, 16);
        pool.reset(Direction::Playback);
        ready_buffer(&mut pool, 0, 0, &[1u8; 8]);
        ready_buffer(&mut pool, 1, 0, &[2u8; 8]);

        let mut ready_offset = 0usize;
        let mut dst = [0u8; 16];
        let (frames, consumed) = drain_ready(&mut pool, &mut ready_offset, 4, &mut dst);
        assert_eq!(frames, 4);
        assert_eq!(consumed, vec![0, 1]);
        assert_eq!(&dst[..8], &[1u8; 8]);
        assert_eq!(&dst[8..], &[2u8; 8]);
        assert!(pool.ready_is_empty());
        assert_eq!(ready_offset, 0);
    }

    #[test]
    fn test_drain_ready_partial_keeps_offset() {
        let mut pool = BufferPool::new(1, 16);
        pool.reset(Direction::Playback);
        ready_buffer(&mut pool, 0, 0, &[7u8; 16]);

        let mut ready_offset = 0usize;
        let mut dst = [0u8; 8];
        let (frames, consumed) = drain_ready(&mut pool, &mut ready_offset, 4, &mut dst);
        assert_eq!(frames, 2);
        assert!(consumed.is_empty());
        assert_eq!(ready_offset, 8);
        assert_eq!(pool.ready_len(), 1);

        // the second half drains the buffer
        let (frames, consumed) = drain_ready(&mut pool, &mut ready_offset, 4, &mut dst);
        assert_eq!(frames, 2);
        assert_eq!(consumed, vec![0]);
        assert_eq!(ready_offset, 0);
    }

    #[test]
    fn test_drain_ready_honours_circular_wrap() {
        let mut pool = BufferPool::new(1, 8);
        pool.reset(Direction::Playback);
        // chunk starts near the end of the region and wraps around
        ready_buffer(&mut pool, 0, 6, &[1, 2, 3, 4, 5, 6, 7, 8]);

        let mut ready_offset = 0usize;
        let mut dst = [0u8; 8];
        let (frames, _) = drain_ready(&mut pool, &mut ready_offset, 4, &mut dst);
        assert_eq!(frames, 2);
        assert_eq!(dst, [1, 2, 3, 4, 5, 6, 7, 8]);
    }

    #[test]
    fn test_capture_one_stamps_and_checks_out() {
        let mut pool = BufferPool::new(2, 16);
        pool.reset(Direction::Capture);

        let src = [9u8; 12];
        let header = BufferHeader {
            seq: 42,
            pts: 7,
            dts_offset: 0,
        };
        let (id, frames) = capture_one(&mut pool, &src, 4, header).unwrap();
        assert_eq!(frames, 3);

        let b = pool.get(id).unwrap();
        assert_eq!(b.header.seq, 42);
        assert_eq!(b.header.pts, 7);
        assert_eq!(b.chunk.size, 12);
        assert_eq!(b.chunk.stride, 4);
        assert!(b.flags.contains(BufferFlags::OUT));
        assert_eq!(&b.data[..12], &src);
        assert_eq!(pool.free_len(), 1);
        assert_eq!(pool.in_flight(), 1);
    }

    #[test]
    fn test_capture_one_with_empty_free_queue() {
        let mut pool = BufferPool::new(1, 16);
        pool.reset(Direction::Playback); // nothing on the free queue
        let header = BufferHeader::default();
        assert!(capture_one(&mut pool, &[0u8; 8], 4, header).is_none());
    }

    /// Fake interleaved channel area backed by plain memory
    fn fake_area(ring: &[u8], frame_size: usize) -> alsa_sys::snd_pcm_channel_area_t {
        alsa_sys::snd_pcm_channel_area_t {
            addr: ring.as_ptr() as *mut libc::c_void,
            first: 0,
            step: (frame_size * 8) as libc::c_uint,
        }
    }

    #[test]
    fn test_capture_pass_without_free_buffers_drops_a_quantum() {
        let mut state = test_state(Direction::Capture);
        state.threshold = 1024;
        state.pool = BufferPool::new(0, 0);
        state.pool.reset(Direction::Capture);

        let ring = vec![0u8; 64];
        let area = fake_area(&ring, state.frame_size);
        let areas = MmapAreas(&area);

        // a short grant still costs the full quantum
        let read = capture_pass(&mut state, &areas, 0, 16, 0);
        assert_eq!(read, state.threshold as UFrames);
    }

    #[test]
    fn test_capture_cycle_stops_when_free_queue_runs_dry() {
        let mut state = test_state(Direction::Capture);
        state.threshold = 1024;
        // one free buffer of 256 frames, so the queue runs dry mid-cycle
        state.pool = BufferPool::new(1, 256 * 4);
        state.pool.reset(Direction::Capture);

        let ring = vec![1u8; 1024 * 4];
        let area = fake_area(&ring, state.frame_size);
        let areas = MmapAreas(&area);

        // the read cycle of handle_capture: the device grants at most 256
        // frames per mmap pass, so draining the quantum needs several
        let to_read: UFrames = 1024;
        let mut total_read: UFrames = 0;
        let mut passes = 0;
        while total_read < to_read {
            let wanted = to_read - total_read;
            let frames = wanted.min(256);
            let read = capture_pass(&mut state, &areas, 0, frames, 0);
            total_read += read;
            passes += 1;
            if read < frames {
                break;
            }
        }

        // pass one fills the only free buffer; pass two finds the queue
        // dry, drops a whole quantum and ends the cycle right there
        assert_eq!(passes, 2, "cycle must stop once the free queue is empty");
        assert!(total_read >= to_read);
        assert!(matches!(state.io_status, IoStatus::HaveBuffer(_)));
    }

    #[test]
    fn test_slaved_updates_converge_to_master_rate() {
        let mut state = test_state(Direction::Playback);
        state.slaved = true;

        // reference clock runs 200 ppm fast relative to the device rate
        let ratio = 1.0002;
        let mut master_pos = 0.0f64;
        for _ in 0..500 {
            master_pos += 1024.0 * ratio;
            let nsec = (master_pos * NSEC_PER_SEC as f64 / 48000.0) as u64;
            update_time(&mut state, nsec, 1024, true);
        }
        assert!(
            (state.dll.dt - ratio).abs() < 1e-4,
            "dt {} never locked onto {ratio}",
            state.dll.dt
        );
    }

    #[test]
    fn test_capture_update_time_accounts_for_quantum() {
        let mut state = test_state(Direction::Capture);
        let now = NSEC_PER_SEC;
        // exactly one quantum in flight means zero signed delay
        update_time(&mut state, now, 1024, false);
        let clockless_next = state.next_time;
        // the capture schedule includes the extra quantum of read-ahead
        assert!(clockless_next > now);
    }

    #[test]
    fn test_sample_count_monotone_over_updates() {
        let mut state = test_state(Direction::Playback);
        let mut last = state.sample_count;
        for i in 0..100 {
            state.sample_count += 1024;
            update_time(&mut state, (i + 1) * 21_333_333, 1024, false);
            assert!(state.sample_count >= last);
            last = state.sample_count;
        }
    }
}
