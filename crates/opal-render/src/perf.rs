//! Per-pass timing records.
//!
//! Each named pass keeps a fixed window of recent GPU samples; the pipeline
//! snapshots the whole set once per frame for the caller. Passes are
//! re-registered every frame in dispatch order, so the snapshot reflects the
//! passes the last frame actually ran.

/// Samples kept per pass.
const SAMPLE_WINDOW: usize = 64;

/// Aggregated timing of one named render pass.
#[derive(Debug, Clone, PartialEq)]
pub struct PassStats {
    pub name: String,
    /// Most recent GPU time in nanoseconds; 0 when the backend has no timer.
    pub last_ns: u64,
    /// Average over the sample window.
    pub avg_ns: u64,
    /// Peak over the sample window.
    pub peak_ns: u64,
    pub samples: u32,
}

#[derive(Debug)]
struct PassRecord {
    name: String,
    window: Vec<u64>,
    next: usize,
    /// Set when the pass ran this frame; stale records are dropped.
    seen: bool,
}

impl PassRecord {
    fn push(&mut self, ns: u64) {
        if self.window.len() < SAMPLE_WINDOW {
            self.window.push(ns);
        } else {
            self.window[self.next] = ns;
            self.next = (self.next + 1) % SAMPLE_WINDOW;
        }
        self.seen = true;
    }

    fn stats(&self) -> PassStats {
        let last = if self.window.is_empty() {
            0
        } else if self.window.len() < SAMPLE_WINDOW {
            self.window[self.window.len() - 1]
        } else {
            self.window[(self.next + SAMPLE_WINDOW - 1) % SAMPLE_WINDOW]
        };
        let sum: u64 = self.window.iter().sum();
        let avg = if self.window.is_empty() {
            0
        } else {
            sum / self.window.len() as u64
        };
        PassStats {
            name: self.name.clone(),
            last_ns: last,
            avg_ns: avg,
            peak_ns: self.window.iter().copied().max().unwrap_or(0),
            samples: self.window.len() as u32,
        }
    }
}

/// Tracks timing for every pass of the running pipeline.
#[derive(Debug, Default)]
pub struct PerfTracker {
    passes: Vec<PassRecord>,
    /// Dispatch order of the current frame, as indices into `passes`.
    frame_order: Vec<usize>,
}

impl PerfTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start a new frame: forget last frame's dispatch order and mark all
    /// records unseen.
    pub fn begin_frame(&mut self) {
        self.frame_order.clear();
        for p in &mut self.passes {
            p.seen = false;
        }
    }

    /// Record one dispatched pass. `gpu_ns` of None records a zero sample so
    /// the pass still shows up in the snapshot.
    pub fn record(&mut self, name: &str, gpu_ns: Option<u64>) {
        let idx = match self.passes.iter().position(|p| p.name == name) {
            Some(i) => i,
            None => {
                self.passes.push(PassRecord {
                    name: name.to_string(),
                    window: Vec::new(),
                    next: 0,
                    seen: false,
                });
                self.passes.len() - 1
            }
        };
        self.passes[idx].push(gpu_ns.unwrap_or(0));
        self.frame_order.push(idx);
    }

    /// Stats of every pass the current frame dispatched, in dispatch order.
    pub fn snapshot(&self) -> Vec<PassStats> {
        self.frame_order
            .iter()
            .map(|&i| self.passes[i].stats())
            .collect()
    }

    /// Drop records of passes that did not run this frame, e.g. after a
    /// reconfiguration changed the pass list.
    pub fn prune(&mut self) {
        // frame_order indexes shift on removal; rebuild it by name.
        let names: Vec<String> = self
            .frame_order
            .iter()
            .map(|&i| self.passes[i].name.clone())
            .collect();
        self.passes.retain(|p| p.seen);
        self.frame_order = names
            .iter()
            .filter_map(|n| self.passes.iter().position(|p| &p.name == n))
            .collect();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_record_and_snapshot_order() {
        let mut perf = PerfTracker::new();
        perf.begin_frame();
        perf.record("convert", Some(100));
        perf.record("scale", Some(300));
        perf.record("dither", None);
        let snap = perf.snapshot();
        assert_eq!(snap.len(), 3);
        assert_eq!(snap[0].name, "convert");
        assert_eq!(snap[1].name, "scale");
        assert_eq!(snap[2].last_ns, 0);
    }

    #[test]
    fn test_window_statistics() {
        let mut perf = PerfTracker::new();
        for ns in [100u64, 200, 600] {
            perf.begin_frame();
            perf.record("scale", Some(ns));
        }
        let snap = perf.snapshot();
        assert_eq!(snap[0].last_ns, 600);
        assert_eq!(snap[0].avg_ns, 300);
        assert_eq!(snap[0].peak_ns, 600);
        assert_eq!(snap[0].samples, 3);
    }

    #[test]
    fn test_window_is_bounded() {
        let mut perf = PerfTracker::new();
        for i in 0..(SAMPLE_WINDOW as u64 + 10) {
            perf.begin_frame();
            perf.record("p", Some(i));
        }
        let snap = perf.snapshot();
        assert_eq!(snap[0].samples, SAMPLE_WINDOW as u32);
        assert_eq!(snap[0].last_ns, SAMPLE_WINDOW as u64 + 9);
        // The oldest 10 samples fell out of the window.
        assert_eq!(snap[0].peak_ns, SAMPLE_WINDOW as u64 + 9);
    }

    #[test]
    fn test_prune_drops_stale_passes() {
        let mut perf = PerfTracker::new();
        perf.begin_frame();
        perf.record("a", Some(1));
        perf.record("b", Some(1));
        perf.begin_frame();
        perf.record("b", Some(2));
        perf.prune();
        let snap = perf.snapshot();
        assert_eq!(snap.len(), 1);
        assert_eq!(snap[0].name, "b");
        assert_eq!(snap[0].samples, 2);
    }
}
