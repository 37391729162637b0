use parking_lot::{Condvar, Mutex};

use crate::{Cancelled, CancellationToken, POLL_INTERVAL};

/// A one-shot barrier: closed until [`Latch::open`] is called, then open forever.
#[derive(Debug, Default)]
pub struct Latch {
    opened: Mutex<bool>,
    cond: Condvar,
}

impl Latch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn open(&self) {
        let mut opened = self.opened.lock();
        if !*opened {
            *opened = true;
            self.cond.notify_all();
        }
    }

    pub fn is_open(&self) -> bool {
        *self.opened.lock()
    }

    /// Blocks until the latch opens or `token` is cancelled.
    pub fn wait(&self, token: &CancellationToken) -> Result<(), Cancelled> {
        let mut opened = self.opened.lock();
        while !*opened {
            Cancelled::check(token)?;
            self.cond.wait_for(&mut opened, POLL_INTERVAL);
        }
        Ok(())
    }
}

/// A counting semaphore whose acquisition honors cancellation.
#[derive(Debug)]
pub struct Semaphore {
    available: Mutex<usize>,
    cond: Condvar,
}

impl Semaphore {
    pub fn new(permits: usize) -> Self {
        Self {
            available: Mutex::new(permits),
            cond: Condvar::new(),
        }
    }

    pub fn acquire(&self, token: &CancellationToken) -> Result<SemaphorePermit<'_>, Cancelled> {
        let mut available = self.available.lock();
        loop {
            Cancelled::check(token)?;
            if *available > 0 {
                *available -= 1;
                return Ok(SemaphorePermit { semaphore: self });
            }
            self.cond.wait_for(&mut available, POLL_INTERVAL);
        }
    }

    pub fn try_acquire(&self) -> Option<SemaphorePermit<'_>> {
        let mut available = self.available.lock();
        if *available == 0 {
            return None;
        }
        *available -= 1;
        Some(SemaphorePermit { semaphore: self })
    }
}

/// Returns its permit to the semaphore on drop.
#[derive(Debug)]
pub struct SemaphorePermit<'a> {
    semaphore: &'a Semaphore,
}

impl Drop for SemaphorePermit<'_> {
    fn drop(&mut self) {
        *self.semaphore.available.lock() += 1;
        self.semaphore.cond.notify_one();
    }
}
