//! Random-access marker index (§4.8), grounded on `stf_indexer.hpp`
//! (`original_source/`) for the granule-based background scan design,
//! and on the teacher's one-helper-thread-per-subsystem model (no
//! global scheduler) used throughout `samply`'s profiling code.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::JoinHandle;

use log::trace;

pub const DEFAULT_GRANULE: u64 = 1024;

#[derive(Default)]
struct Shared {
    entries: Mutex<BTreeMap<u64, u64>>,
    condvar: Condvar,
    scan_complete: AtomicBool,
}

/// Builds and serves a `marker_count -> file_offset` index in the
/// background, so callers can seek close to a target marker without a
/// linear scan from the start of the trace.
pub struct Indexer {
    shared: Arc<Shared>,
    cancel: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl Indexer {
    /// Spawns the background scan. `scan_one`, given the file offset to
    /// resume from, must advance past exactly one marker record and
    /// return `Some(new_offset)`, or `None` at end of stream.
    pub fn spawn<F>(granule: u64, mut scan_one: F) -> Self
    where
        F: FnMut(u64) -> Option<u64> + Send + 'static,
    {
        let shared = Arc::new(Shared::default());
        let cancel = Arc::new(AtomicBool::new(false));

        let shared_bg = Arc::clone(&shared);
        let cancel_bg = Arc::clone(&cancel);
        let handle = std::thread::Builder::new()
            .name("stf-indexer".into())
            .spawn(move || {
                let mut offset = 0u64;
                let mut marker_count = 0u64;
                {
                    let mut entries = shared_bg.entries.lock().unwrap();
                    entries.insert(0, 0);
                }
                loop {
                    if cancel_bg.load(Ordering::Relaxed) {
                        trace!("index scan cancelled at marker {marker_count}");
                        break;
                    }
                    match scan_one(offset) {
                        Some(new_offset) => {
                            offset = new_offset;
                            marker_count += 1;
                            if marker_count % granule.max(1) == 0 {
                                let mut entries = shared_bg.entries.lock().unwrap();
                                entries.insert(marker_count, offset);
                                shared_bg.condvar.notify_all();
                            }
                        }
                        None => break,
                    }
                }
                shared_bg.scan_complete.store(true, Ordering::Relaxed);
                shared_bg.condvar.notify_all();
            })
            .expect("failed to spawn indexer thread");

        Self {
            shared,
            cancel,
            handle: Some(handle),
        }
    }

    /// Returns the largest recorded `(marker_count, file_offset)` entry
    /// with `marker_count <= n`, blocking until either the scan has
    /// passed `n` or has completed entirely.
    pub fn find_nearest_entry(&self, n: u64) -> (u64, u64) {
        let mut entries = self.shared.entries.lock().unwrap();
        loop {
            if let Some((&count, &offset)) = entries.range(..=n).next_back() {
                let scanned_past_n = entries.keys().any(|&k| k > n);
                if scanned_past_n || self.shared.scan_complete.load(Ordering::Relaxed) {
                    return (count, offset);
                }
            }
            if self.shared.scan_complete.load(Ordering::Relaxed) {
                return entries
                    .range(..=n)
                    .next_back()
                    .map(|(&c, &o)| (c, o))
                    .unwrap_or((0, 0));
            }
            entries = self.shared.condvar.wait(entries).unwrap();
        }
    }

    pub fn is_scan_complete(&self) -> bool {
        self.shared.scan_complete.load(Ordering::Relaxed)
    }
}

impl Drop for Indexer {
    fn drop(&mut self) {
        self.cancel.store(true, Ordering::Relaxed);
        self.shared.condvar.notify_all();
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU64;

    #[test]
    fn index_builds_granule_entries_and_serves_lookups() {
        let total = Arc::new(AtomicU64::new(0));
        let total_bg = Arc::clone(&total);
        let indexer = Indexer::spawn(4, move |offset| {
            let n = total_bg.fetch_add(1, Ordering::SeqCst);
            if n >= 20 {
                None
            } else {
                Some(offset + 1)
            }
        });

        // Block until the scan is done; in a real trace this would be a
        // bounded wait on a much larger stream.
        while !indexer.is_scan_complete() {
            std::thread::yield_now();
        }

        let (count, offset) = indexer.find_nearest_entry(10);
        assert_eq!(count, 8);
        assert_eq!(offset, 8);

        let (count, _) = indexer.find_nearest_entry(3);
        assert_eq!(count, 0);
    }

    #[test]
    fn cancel_stops_the_scan() {
        let indexer = Indexer::spawn(1, |offset| Some(offset + 1));
        drop(indexer);
    }
}
