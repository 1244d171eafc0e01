//! A tree of weighted progress counters. A node has a number of units; a
//! child hands its fraction up to its parent, scaled to the units it was
//! given. Reads are a single atomic load.

use std::sync::{Arc, Mutex, Weak};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

struct Inner {
    total: AtomicU64,
    completed: AtomicU64,
    /// cached fraction, as f64 bits
    fraction: AtomicU64,
    cancelled: AtomicBool,
    children: Mutex<Vec<(u64, Progress)>>,
    parent: Mutex<Option<Weak<Inner>>>,
}

#[derive(Clone)]
pub struct Progress {
    inner: Arc<Inner>,
}

impl Progress {
    pub fn new(total: u64) -> Progress {
        Progress {
            inner: Arc::new(Inner {
                total: AtomicU64::new(total),
                completed: AtomicU64::new(0),
                fraction: AtomicU64::new(0f64.to_bits()),
                cancelled: AtomicBool::new(false),
                children: Mutex::new(Vec::new()),
                parent: Mutex::new(None),
            }),
        }
    }

    /// Whether both handles point at the same node
    pub fn same_as(&self, other: &Progress) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    pub fn total(&self) -> u64 {
        self.inner.total.load(Ordering::SeqCst)
    }

    /// Grow (or shrink) the number of units this node counts toward
    pub fn set_total(&self, total: u64) {
        self.inner.total.store(total, Ordering::SeqCst);
        self.recompute();
    }

    /// Give `units` of our total to `child`
    pub fn add_child(&self, child: &Progress, units: u64) {
        {
            let mut parent = lock!(child.inner.parent);
            *parent = Some(Arc::downgrade(&self.inner));
        }
        lock!(self.inner.children).push((units, child.clone()));
        self.recompute();
    }

    /// Mark `units` of our own work done. Never moves backwards.
    pub fn set_completed(&self, units: u64) {
        let units = std::cmp::min(units, self.total());
        self.inner.completed.fetch_max(units, Ordering::SeqCst);
        self.recompute();
    }

    /// Mark everything done, children included
    pub fn finish(&self) {
        let children = lock!(self.inner.children).iter().map(|(_, x)| x.clone()).collect::<Vec<_>>();
        for child in children {
            child.finish();
        }
        self.set_completed(self.total());
    }

    /// Done fraction, 0.0 to 1.0
    pub fn fraction(&self) -> f64 {
        f64::from_bits(self.inner.fraction.load(Ordering::SeqCst))
    }

    pub fn is_finished(&self) -> bool {
        self.fraction() >= 1.0
    }

    /// Cancel this node and everything under it
    pub fn cancel(&self) {
        self.inner.cancelled.store(true, Ordering::SeqCst);
        let children = lock!(self.inner.children).iter().map(|(_, x)| x.clone()).collect::<Vec<_>>();
        for child in children {
            child.cancel();
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.inner.cancelled.load(Ordering::SeqCst)
    }

    fn recompute(&self) {
        Progress::recompute_inner(&self.inner);
    }

    fn recompute_inner(inner: &Arc<Inner>) {
        let total = inner.total.load(Ordering::SeqCst);
        let fraction = if total == 0 {
            0.0
        } else {
            let mut done = inner.completed.load(Ordering::SeqCst) as f64;
            for (units, child) in lock!(inner.children).iter() {
                done += (*units as f64) * child.fraction();
            }
            (done / total as f64).min(1.0)
        };
        inner.fraction.store(fraction.to_bits(), Ordering::SeqCst);
        let parent = lock!(inner.parent).as_ref().and_then(|x| x.upgrade());
        if let Some(parent) = parent {
            Progress::recompute_inner(&parent);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn weights_children() {
        let transfer = Progress::new(100);
        let unzip = Progress::new(100);
        let download = Progress::new(100);
        download.add_child(&transfer, 90);
        download.add_child(&unzip, 10);
        transfer.set_completed(50);
        assert!((download.fraction() - 0.45).abs() < 1e-9);
        transfer.set_completed(100);
        assert!((download.fraction() - 0.9).abs() < 1e-9);
        unzip.finish();
        assert!(download.is_finished());
    }

    #[test]
    fn aggregates_into_a_growing_batch() {
        let batch = Progress::new(0);
        let one = Progress::new(100);
        let two = Progress::new(100);
        batch.set_total(100);
        batch.add_child(&one, 100);
        batch.set_total(200);
        batch.add_child(&two, 100);
        one.finish();
        assert!((batch.fraction() - 0.5).abs() < 1e-9);
        two.set_completed(50);
        assert!((batch.fraction() - 0.75).abs() < 1e-9);
    }

    #[test]
    fn never_goes_backwards() {
        let progress = Progress::new(10);
        progress.set_completed(7);
        progress.set_completed(3);
        assert!((progress.fraction() - 0.7).abs() < 1e-9);
        progress.set_completed(30);
        assert!(progress.is_finished());
    }

    #[test]
    fn clones_share_a_node() {
        let progress = Progress::new(10);
        let clone = progress.clone();
        assert!(progress.same_as(&clone));
        assert!(!progress.same_as(&Progress::new(10)));
        clone.set_completed(5);
        assert!((progress.fraction() - 0.5).abs() < 1e-9);
    }

    #[test]
    fn cancel_cascades() {
        let parent = Progress::new(100);
        let child = Progress::new(100);
        parent.add_child(&child, 100);
        parent.cancel();
        assert!(child.is_cancelled());
    }
}
