//! Parallel for-loop over an index range with work stealing.
//!
//! `[0, n)` is split evenly between `nthr` helpers. Each helper claims
//! indices from its own cursor; a helper that runs dry steals half of a
//! random victim's remaining range. The loop is over once every helper has
//! declared itself idle at the same time.
//!
//! ```ignore
//! let desc = ParFor::new(nthr, n, true);
//! pool.scoped(|scope| {
//!     for _ in 0..nthr {
//!         scope.execute(|| desc.run(|i| visit(i)));
//!     }
//! });
//! ```

use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};

use rand::Rng;

use crate::error::throw;
use crate::utils::{osyield, procyield, usleep};

/// Per-helper cursor: `begin` in the low half, `end` in the high half.
struct Cursor {
    pos: AtomicU64,
}

#[inline]
fn pack(begin: u32, end: u32) -> u64 {
    begin as u64 | (end as u64) << 32
}

#[inline]
fn unpack(pos: u64) -> (u32, u32) {
    (pos as u32, (pos >> 32) as u32)
}

/// Counters summed over all helpers.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ParForStats {
    /// Successful steals.
    pub nsteal: u64,
    /// Indices obtained by stealing.
    pub nstealcnt: u64,
    pub nprocyield: u64,
    pub nosyield: u64,
    pub nsleep: u64,
}

#[derive(Default)]
struct LocalStats {
    nsteal: u64,
    nstealcnt: u64,
    nprocyield: u64,
    nosyield: u64,
    nsleep: u64,
}

pub struct ParFor {
    nthr: u32,
    cnt: u32,
    /// If false, a helper that found nothing to steal for a while leaves
    /// without waiting for the others.
    wait: bool,
    thrseq: AtomicU32,
    done: AtomicU32,
    thr: Box<[Cursor]>,
    nsteal: AtomicU64,
    nstealcnt: AtomicU64,
    nprocyield: AtomicU64,
    nosyield: AtomicU64,
    nsleep: AtomicU64,
}

impl ParFor {
    pub fn new(nthr: usize, n: usize, wait: bool) -> Self {
        if nthr == 0 || nthr > u32::MAX as usize || n > u32::MAX as usize {
            throw(&format!("parfor: invalid setup (nthr={}, n={})", nthr, n));
        }
        let thr = (0..nthr)
            .map(|i| {
                let begin = (n as u64 * i as u64 / nthr as u64) as u32;
                let end = (n as u64 * (i as u64 + 1) / nthr as u64) as u32;
                Cursor {
                    pos: AtomicU64::new(pack(begin, end)),
                }
            })
            .collect();
        Self {
            nthr: nthr as u32,
            cnt: n as u32,
            wait,
            thrseq: AtomicU32::new(0),
            done: AtomicU32::new(0),
            thr,
            nsteal: AtomicU64::new(0),
            nstealcnt: AtomicU64::new(0),
            nprocyield: AtomicU64::new(0),
            nosyield: AtomicU64::new(0),
            nsleep: AtomicU64::new(0),
        }
    }

    pub fn nthr(&self) -> usize {
        self.nthr as usize
    }

    pub fn len(&self) -> usize {
        self.cnt as usize
    }

    pub fn is_empty(&self) -> bool {
        self.cnt == 0
    }

    /// Participates as the next helper; exactly `nthr` calls are expected.
    /// `body` runs once for every index claimed by this helper.
    pub fn run(&self, mut body: impl FnMut(usize)) {
        let tid = self.thrseq.fetch_add(1, Ordering::AcqRel);
        if tid >= self.nthr {
            throw("parfor: invalid tid");
        }

        if self.nthr == 1 {
            for i in 0..self.cnt {
                body(i as usize);
            }
            return;
        }

        let me = &self.thr[tid as usize];
        let mut stats = LocalStats::default();
        let mut rng = rand::thread_rng();
        let nthr = self.nthr as usize;

        'outer: loop {
            loop {
                let pos = me.pos.fetch_add(1, Ordering::AcqRel).wrapping_add(1);
                let (begin, end) = unpack(pos);
                let begin = begin.wrapping_sub(1);
                if begin >= end {
                    break;
                }
                body(begin as usize);
            }

            // Out of local work: steal.
            let mut idle = false;
            let mut attempt = 0usize;
            loop {
                if attempt > nthr * 4 && !idle {
                    idle = true;
                    self.done.fetch_add(1, Ordering::AcqRel);
                }
                let extra = if idle { 0 } else { 1 };
                if self.done.load(Ordering::Acquire) + extra == self.nthr {
                    if !idle {
                        self.done.fetch_add(1, Ordering::AcqRel);
                    }
                    break 'outer;
                }

                let mut v = rng.gen_range(0..nthr - 1);
                if v >= tid as usize {
                    v += 1;
                }
                let victim = &self.thr[v];
                let mut stolen = None;
                loop {
                    let pos = victim.pos.load(Ordering::Acquire);
                    let (begin, end) = unpack(pos);
                    if begin.wrapping_add(1) >= end {
                        break;
                    }
                    if idle {
                        self.done.fetch_sub(1, Ordering::AcqRel);
                        idle = false;
                    }
                    let mid = begin + (end - begin) / 2;
                    if victim
                        .pos
                        .compare_exchange(pos, pack(begin, mid), Ordering::AcqRel, Ordering::Relaxed)
                        .is_ok()
                    {
                        stolen = Some((mid, end));
                        break;
                    }
                }

                if let Some((begin, end)) = stolen {
                    if idle {
                        throw("parfor: should not be idle");
                    }
                    me.pos.store(pack(begin, end), Ordering::Release);
                    stats.nsteal += 1;
                    stats.nstealcnt += (end - begin) as u64;
                    break;
                }

                if attempt < nthr {
                    // Spin.
                } else if attempt < 4 * nthr {
                    stats.nprocyield += 1;
                    procyield(20);
                } else if !self.wait {
                    // Most of the work is done by now.
                    if !idle {
                        self.done.fetch_add(1, Ordering::AcqRel);
                    }
                    break 'outer;
                } else if attempt < 6 * nthr {
                    stats.nosyield += 1;
                    osyield();
                } else {
                    stats.nsleep += 1;
                    usleep(1);
                }
                attempt += 1;
            }
        }

        self.nsteal.fetch_add(stats.nsteal, Ordering::Relaxed);
        self.nstealcnt.fetch_add(stats.nstealcnt, Ordering::Relaxed);
        self.nprocyield.fetch_add(stats.nprocyield, Ordering::Relaxed);
        self.nosyield.fetch_add(stats.nosyield, Ordering::Relaxed);
        self.nsleep.fetch_add(stats.nsleep, Ordering::Relaxed);
    }

    pub fn stats(&self) -> ParForStats {
        ParForStats {
            nsteal: self.nsteal.load(Ordering::Relaxed),
            nstealcnt: self.nstealcnt.load(Ordering::Relaxed),
            nprocyield: self.nprocyield.load(Ordering::Relaxed),
            nosyield: self.nosyield.load(Ordering::Relaxed),
            nsleep: self.nsleep.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU8;
    use std::time::Duration;

    fn run_with(nthr: usize, n: usize, slow: impl Fn(usize) -> bool + Sync) -> Vec<u8> {
        let desc = ParFor::new(nthr, n, true);
        let hits: Vec<AtomicU8> = (0..n).map(|_| AtomicU8::new(0)).collect();
        let pool = scoped_thread_pool::Pool::new(nthr);
        pool.scoped(|scope| {
            for _ in 0..nthr {
                let desc = &desc;
                let hits = &hits;
                let slow = &slow;
                scope.execute(move || {
                    desc.run(|i| {
                        if slow(i) {
                            std::thread::sleep(Duration::from_micros(200));
                        }
                        hits[i].fetch_add(1, Ordering::Relaxed);
                    })
                });
            }
        });
        pool.shutdown();
        hits.iter().map(|h| h.load(Ordering::Relaxed)).collect()
    }

    #[test]
    fn every_index_runs_once() {
        let hits = run_with(4, 1000, |_| false);
        assert!(hits.iter().all(|&h| h == 1));
    }

    #[test]
    fn skewed_work_is_stolen() {
        // All the slow indices sit in the first helper's range.
        let hits = run_with(4, 400, |i| i < 100);
        assert!(hits.iter().all(|&h| h == 1));
    }

    #[test]
    fn single_helper_and_empty_ranges() {
        let hits = run_with(1, 10, |_| false);
        assert_eq!(hits, vec![1; 10]);
        let hits = run_with(3, 0, |_| false);
        assert!(hits.is_empty());
        let hits = run_with(8, 3, |_| false);
        assert_eq!(hits, vec![1; 3]);
    }

    #[test]
    fn even_split() {
        let desc = ParFor::new(3, 10, false);
        let ranges: Vec<_> = desc
            .thr
            .iter()
            .map(|c| unpack(c.pos.load(Ordering::Relaxed)))
            .collect();
        assert_eq!(ranges, vec![(0, 3), (3, 6), (6, 10)]);
        assert_eq!(desc.stats(), ParForStats::default());
    }
}
