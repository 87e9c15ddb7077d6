//! Cross-loop messaging
//!
//! The main loop and each device's data loop run in different threads. An
//! [InvokeQueue] posts closures onto the owning loop's queue; the eventfd
//! wakes the loop out of its poll. The blocking flavour parks the caller on
//! a oneshot rendezvous until the target loop executed the closure.

use std::collections::VecDeque;
use std::os::fd::{AsFd, AsRawFd, RawFd};
use std::sync::Mutex;

use nix::sys::eventfd::{EfdFlags, EventFd};
use wavepipe_core::error::{DaemonResult, Fault, ResultExt};

type InvokeFn<T> = Box<dyn FnOnce(&mut T) + Send>;

pub struct InvokeQueue<T> {
    queue: Mutex<VecDeque<InvokeFn<T>>>,
    efd: EventFd,
}

impl<T> InvokeQueue<T> {
    pub fn new() -> DaemonResult<Self> {
        let efd = EventFd::from_value_and_flags(0, EfdFlags::EFD_NONBLOCK | EfdFlags::EFD_CLOEXEC)
            .fault(Fault::Invoke)?;
        Ok(Self {
            queue: Mutex::new(VecDeque::new()),
            efd,
        })
    }

    pub fn as_raw_fd(&self) -> RawFd {
        self.efd.as_fd().as_raw_fd()
    }

    /// Posts a closure without waiting for it to run
    pub fn invoke(&self, f: impl FnOnce(&mut T) + Send + 'static) {
        self.queue.lock().unwrap().push_back(Box::new(f));
        let _ = nix::unistd::write(&self.efd, &1u64.to_ne_bytes());
    }

    /// Posts a closure and blocks until the owning loop ran it, returning
    /// its result. Must not be called from the owning loop itself.
    pub fn invoke_sync<R: Send + 'static>(
        &self,
        f: impl FnOnce(&mut T) -> R + Send + 'static,
    ) -> DaemonResult<R> {
        let (tx, rx) = oneshot::channel();
        self.invoke(move |t| {
            // A dropped receiver just discards the result
            let _ = tx.send(f(t));
        });
        rx.recv().fault(Fault::Invoke)
    }

    /// Runs all pending closures; called by the owning loop after its
    /// eventfd signalled readable
    pub fn drain(&self, target: &mut T) {
        let mut buf = [0u8; 8];
        let _ = nix::unistd::read(self.efd.as_fd().as_raw_fd(), &mut buf);
        loop {
            let next = self.queue.lock().unwrap().pop_front();
            match next {
                Some(f) => f(target),
                None => break,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;

    #[test]
    fn test_invoke_runs_in_order() {
        let q: InvokeQueue<Vec<u32>> = InvokeQueue::new().unwrap();
        q.invoke(|v| v.push(1));
        q.invoke(|v| v.push(2));
        let mut target = Vec::new();
        q.drain(&mut target);
        assert_eq!(target, vec![1, 2]);
    }

    #[test]
    fn test_invoke_sync_returns_result() {
        let q: Arc<InvokeQueue<u32>> = Arc::new(InvokeQueue::new().unwrap());

        let poster = {
            let q = q.clone();
            std::thread::spawn(move || q.invoke_sync(|v| *v + 1).unwrap())
        };

        // Act as the owning loop until the caller got its answer
        let mut target = 41;
        while !poster.is_finished() {
            q.drain(&mut target);
            std::thread::yield_now();
        }
        assert_eq!(poster.join().unwrap(), 42);
    }

    #[test]
    fn test_eventfd_signals_readable() {
        let q: InvokeQueue<()> = InvokeQueue::new().unwrap();
        q.invoke(|_| {});
        let mut buf = 0u64.to_ne_bytes();
        let n = nix::unistd::read(q.efd.as_fd().as_raw_fd(), &mut buf).unwrap();
        assert_eq!(n, 8);
    }
}
