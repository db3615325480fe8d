//! Single-fulfillment result cell
//!
//! Whichever thread performs a batch's physical write fulfills every
//! member's promise; the owner of the commit only waits on it.

use std::sync::{Condvar, Mutex};
use std::time::Duration;

use crate::binlog::BinlogResult;

#[derive(Debug)]
pub struct Promise<T> {
    value: Mutex<Option<T>>,
    ready: Condvar,
}

impl<T: Clone> Promise<T> {
    pub fn new() -> Self {
        Self {
            value: Mutex::new(None),
            ready: Condvar::new(),
        }
    }

    /// Store `value` and wake all waiters. Returns false if the promise was
    /// already fulfilled; the first value wins.
    pub fn fulfill(&self, value: T) -> BinlogResult<bool> {
        let mut slot = self.value.lock()?;
        if slot.is_some() {
            return Ok(false);
        }
        *slot = Some(value);
        self.ready.notify_all();
        Ok(true)
    }

    pub fn try_get(&self) -> BinlogResult<Option<T>> {
        Ok(self.value.lock()?.clone())
    }

    pub fn is_fulfilled(&self) -> BinlogResult<bool> {
        Ok(self.value.lock()?.is_some())
    }

    /// Block until fulfilled
    pub fn wait(&self) -> BinlogResult<T> {
        let mut slot = self.value.lock()?;
        loop {
            if let Some(value) = slot.as_ref() {
                return Ok(value.clone());
            }
            slot = self.ready.wait(slot)?;
        }
    }

    /// Block until fulfilled or `timeout` passes
    pub fn wait_timeout(&self, timeout: Duration) -> BinlogResult<Option<T>> {
        let slot = self.value.lock()?;
        let (slot, _) = self
            .ready
            .wait_timeout_while(slot, timeout, |v| v.is_none())?;
        Ok(slot.clone())
    }
}

impl<T: Clone> Default for Promise<T> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn test_first_fulfillment_wins() {
        let p = Promise::new();
        assert!(p.fulfill(1).unwrap());
        assert!(!p.fulfill(2).unwrap());
        assert_eq!(p.wait().unwrap(), 1);
    }

    #[test]
    fn test_wait_across_threads() {
        let p = Arc::new(Promise::new());
        let waiter = {
            let p = Arc::clone(&p);
            thread::spawn(move || p.wait().unwrap())
        };
        p.fulfill("done".to_string()).unwrap();
        assert_eq!(waiter.join().unwrap(), "done");
    }

    #[test]
    fn test_wait_timeout_expires() {
        let p: Promise<u32> = Promise::new();
        assert_eq!(p.wait_timeout(Duration::from_millis(5)).unwrap(), None);
        assert!(!p.is_fulfilled().unwrap());
    }
}
