use nix::errno::Errno;
use nix::sys::time::TimeSpec;
use nix::time::{ClockId, clock_gettime};
use std::cell::UnsafeCell;
use std::os::raw::c_int;
use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum SemaphoreError {
    #[error("Semaphore operation failed: {0}")]
    Os(#[from] Errno),
}

/// Unnamed POSIX semaphore living inside a shared mapping.
///
/// Initialized with `pshared = 1`, so any process mapping the same segment
/// can wait on and post it. The value is never moved after `init`.
#[repr(C)]
pub struct SharedSemaphore {
    sem: UnsafeCell<libc::sem_t>,
}

unsafe impl Send for SharedSemaphore {}
unsafe impl Sync for SharedSemaphore {}

impl SharedSemaphore {
    /// Initialize the semaphore in place.
    ///
    /// # Safety
    ///
    /// No thread or process may be using this semaphore, and the memory must
    /// stay mapped at a stable address for as long as anyone uses it.
    pub unsafe fn init(&self, initial_value: u32) -> Result<(), SemaphoreError> {
        let ret = unsafe { libc::sem_init(self.sem.get(), 1, initial_value) };
        if ret != 0 {
            return Err(Errno::last().into());
        }
        Ok(())
    }

    /// # Safety
    ///
    /// Nobody may be blocked on, or later use, this semaphore.
    pub unsafe fn destroy(&self) -> Result<(), SemaphoreError> {
        let ret = unsafe { libc::sem_destroy(self.sem.get()) };
        if ret != 0 {
            return Err(Errno::last().into());
        }
        Ok(())
    }

    pub fn wait(&self) -> Result<(), SemaphoreError> {
        loop {
            let ret = unsafe { libc::sem_wait(self.sem.get()) };
            if ret == 0 {
                return Ok(());
            }
            match Errno::last() {
                Errno::EINTR => continue,
                errno => return Err(errno.into()),
            }
        }
    }

    /// Wait at most `timeout`. Returns `false` if the deadline passed first.
    pub fn wait_timeout(&self, timeout: Duration) -> Result<bool, SemaphoreError> {
        // sem_timedwait only takes an absolute CLOCK_REALTIME deadline
        let deadline = clock_gettime(ClockId::CLOCK_REALTIME)? + TimeSpec::from_duration(timeout);

        loop {
            let ret = unsafe { libc::sem_timedwait(self.sem.get(), deadline.as_ref()) };
            if ret == 0 {
                return Ok(true);
            }
            match Errno::last() {
                Errno::EINTR => continue,
                Errno::ETIMEDOUT => return Ok(false),
                errno => return Err(errno.into()),
            }
        }
    }

    /// Wait forever or until `timeout`, depending on the option.
    pub fn wait_for(&self, timeout: Option<Duration>) -> Result<bool, SemaphoreError> {
        match timeout {
            Some(timeout) => self.wait_timeout(timeout),
            None => self.wait().map(|()| true),
        }
    }

    pub fn try_wait(&self) -> Result<bool, SemaphoreError> {
        let ret = unsafe { libc::sem_trywait(self.sem.get()) };
        if ret == 0 {
            Ok(true)
        } else {
            let errno = Errno::last();
            if errno == Errno::EAGAIN {
                Ok(false)
            } else {
                Err(errno.into())
            }
        }
    }

    pub fn post(&self) -> Result<(), SemaphoreError> {
        let ret = unsafe { libc::sem_post(self.sem.get()) };
        if ret != 0 {
            return Err(Errno::last().into());
        }
        Ok(())
    }

    pub fn value(&self) -> Result<i32, SemaphoreError> {
        let mut val: c_int = 0;
        let ret = unsafe { libc::sem_getvalue(self.sem.get(), &mut val) };
        if ret != 0 {
            return Err(Errno::last().into());
        }
        Ok(val)
    }

    /// Consume every outstanding post. Returns how many were dropped.
    pub fn drain(&self) -> Result<u32, SemaphoreError> {
        let mut drained = 0;
        while self.try_wait()? {
            drained += 1;
        }
        Ok(drained)
    }

    /// Take the semaphore as a binary lock, released when the guard drops.
    pub fn lock(&self) -> Result<SemaphoreGuard<'_>, SemaphoreError> {
        self.wait()?;
        Ok(SemaphoreGuard { sem: self })
    }

    pub fn lock_timeout(
        &self,
        timeout: Duration,
    ) -> Result<Option<SemaphoreGuard<'_>>, SemaphoreError> {
        Ok(self
            .wait_timeout(timeout)?
            .then_some(SemaphoreGuard { sem: self }))
    }
}

/// Scoped hold on a [`SharedSemaphore`] used as a lock.
///
/// Posts on drop, including during unwinding.
#[must_use = "the lock is released as soon as the guard is dropped"]
pub struct SemaphoreGuard<'a> {
    sem: &'a SharedSemaphore,
}

impl Drop for SemaphoreGuard<'_> {
    fn drop(&mut self) {
        if let Err(e) = self.sem.post() {
            tracing::error!("Failed to release semaphore: {}", e);
        }
    }
}

#[cfg(test)]
pub(crate) fn heap_semaphore(initial_value: u32) -> Box<SharedSemaphore> {
    // sem_t is plain bytes, all-zero is a valid pre-init state
    let sem: Box<SharedSemaphore> = Box::new(unsafe { std::mem::zeroed() });
    unsafe { sem.init(initial_value).unwrap() };
    sem
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;
    use std::time::Instant;

    #[test]
    fn test_post_then_try_wait() {
        let sem = heap_semaphore(0);

        assert!(!sem.try_wait().unwrap(), "Fresh semaphore should be empty");
        sem.post().unwrap();
        assert_eq!(sem.value().unwrap(), 1);
        assert!(sem.try_wait().unwrap());
        assert_eq!(sem.value().unwrap(), 0);
    }

    #[test]
    fn test_wait_timeout_expires() {
        let sem = heap_semaphore(0);

        let start = Instant::now();
        let acquired = sem.wait_timeout(Duration::from_millis(50)).unwrap();

        assert!(!acquired, "Nothing posted, wait should time out");
        assert!(start.elapsed() >= Duration::from_millis(40));
    }

    #[test]
    fn test_wait_wakes_on_post_from_other_thread() {
        let sem: Arc<Box<SharedSemaphore>> = Arc::new(heap_semaphore(0));
        let poster = Arc::clone(&sem);

        let handle = thread::spawn(move || {
            thread::sleep(Duration::from_millis(20));
            poster.post().unwrap();
        });

        assert!(sem.wait_timeout(Duration::from_secs(5)).unwrap());
        handle.join().unwrap();
    }

    #[test]
    fn test_drain_consumes_all_posts() {
        let sem = heap_semaphore(3);
        sem.post().unwrap();

        assert_eq!(sem.drain().unwrap(), 4);
        assert_eq!(sem.value().unwrap(), 0);
    }

    #[test]
    fn test_guard_releases_on_drop() {
        let sem = heap_semaphore(1);

        {
            let _guard = sem.lock().unwrap();
            assert_eq!(sem.value().unwrap(), 0, "Held lock should read as taken");
            assert!(
                sem.lock_timeout(Duration::from_millis(10))
                    .unwrap()
                    .is_none()
            );
        }

        assert_eq!(sem.value().unwrap(), 1, "Guard drop should release");
    }

    #[test]
    fn test_guard_releases_on_panic() {
        let sem: Arc<Box<SharedSemaphore>> = Arc::new(heap_semaphore(1));
        let inner = Arc::clone(&sem);

        let result = thread::spawn(move || {
            let _guard = inner.lock().unwrap();
            panic!("holder crashed");
        })
        .join();

        assert!(result.is_err());
        assert_eq!(
            sem.value().unwrap(),
            1,
            "Unwinding should still release the lock"
        );
    }
}
