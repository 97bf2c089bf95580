//! Per-address rate limiting with two sliding windows.
//!
//! Every address carries a request window and a failure window. Both maps
//! live behind one mutex and are pruned on every access, so inactive
//! addresses shrink back to nothing.

use std::collections::HashMap;
use std::net::IpAddr;
use std::time::{Duration, Instant};

use parking_lot::Mutex;

#[derive(Debug, Default)]
struct Windows {
    reqs: HashMap<IpAddr, Vec<Instant>>,
    fails: HashMap<IpAddr, Vec<Instant>>,
}

/// Sliding-window limiter keyed by client address.
#[derive(Debug)]
pub struct IpLimiter {
    inner: Mutex<Windows>,
    req_window: Duration,
    max_reqs: usize,
    fail_window: Duration,
    max_fails: usize,
}

fn prune(map: &mut HashMap<IpAddr, Vec<Instant>>, window: Duration, now: Instant) {
    map.retain(|_, times| {
        // An entry exactly at the window edge has aged out.
        times.retain(|t| now.saturating_duration_since(*t) < window);
        !times.is_empty()
    });
}

impl IpLimiter {
    pub fn new(
        req_window: Duration,
        max_reqs: usize,
        fail_window: Duration,
        max_fails: usize,
    ) -> Self {
        Self {
            inner: Mutex::new(Windows::default()),
            req_window,
            max_reqs,
            fail_window,
            max_fails,
        }
    }

    /// Admits or rejects a request from `ip`.
    ///
    /// The current timestamp is always appended to the request window
    /// first; on rejection the suggested wait until the oldest entry ages
    /// out is returned, floored to one second.
    pub fn allow(&self, ip: IpAddr, now: Instant) -> Result<(), Duration> {
        let mut inner = self.inner.lock();
        prune(&mut inner.reqs, self.req_window, now);
        prune(&mut inner.fails, self.fail_window, now);

        let reqs = inner.reqs.entry(ip).or_default();
        reqs.push(now);
        if reqs.len() > self.max_reqs {
            let oldest = reqs[0];
            let wait = self
                .req_window
                .saturating_sub(now.saturating_duration_since(oldest))
                .max(Duration::from_secs(1));
            return Err(wait);
        }

        if let Some(fails) = inner.fails.get(&ip) {
            if fails.len() > self.max_fails {
                let oldest = fails[0];
                let wait = self
                    .fail_window
                    .saturating_sub(now.saturating_duration_since(oldest))
                    .max(Duration::from_secs(1));
                return Err(wait);
            }
        }
        Ok(())
    }

    /// Records a 4xx outcome for `ip` in the failure window.
    pub fn record_failure(&self, ip: IpAddr, now: Instant) {
        let mut inner = self.inner.lock();
        prune(&mut inner.fails, self.fail_window, now);
        inner.fails.entry(ip).or_default().push(now);
    }

    #[cfg(test)]
    fn tracked_addresses(&self) -> usize {
        let inner = self.inner.lock();
        inner.reqs.len() + inner.fails.len()
    }
}
