//! Temporal interpolation surface ring.
//!
//! Fully rendered frames are parked in a small ring of surfaces; on every
//! vsync the mix coefficient between the two (or more, for wider temporal
//! kernels) most recent surfaces is derived from the vsync offset. Frame ids
//! must grow monotonically; a jump backwards (seek, stream switch) drops the
//! whole ring so stale frames never blend into fresh ones.

use opal_core::TextureHandle;
use tracing::{debug, warn};

/// Surfaces kept in the ring.
pub const SURFACES_MAX: usize = 10;

/// One parked frame.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Surface {
    pub tex: TextureHandle,
    pub w: u32,
    pub h: u32,
    /// Content identity of the frame rendered into this surface.
    pub id: u64,
}

#[derive(Debug, Default)]
pub struct SurfaceRing {
    surfaces: Vec<Surface>,
    /// Index of the most recently committed surface.
    head: usize,
}

/// How the ring judged the incoming frame id.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Validity {
    /// Monotonic continuation; interpolation may proceed.
    Valid,
    /// Already rendered; reuse the parked surface.
    Present,
    /// Monotonicity broke; the ring was invalidated.
    Invalid,
}

impl SurfaceRing {
    pub fn new() -> Self {
        Self::default()
    }

    /// Drop every surface, returning them so the caller can recycle their
    /// textures.
    pub fn drain(&mut self) -> Vec<Surface> {
        self.head = 0;
        std::mem::take(&mut self.surfaces)
    }

    pub fn valid_count(&self) -> usize {
        self.surfaces.len()
    }

    pub fn latest(&self) -> Option<&Surface> {
        self.surfaces.get(self.head)
    }

    pub fn contains(&self, id: u64) -> bool {
        self.surfaces.iter().any(|s| s.id == id)
    }

    /// Judge a new frame id against the ring. Ids must strictly grow; a
    /// repeat is fine (the frame is already parked), anything older means
    /// the caller should [`drain`](Self::drain) before continuing.
    pub fn check(&self, id: u64) -> Validity {
        let Some(latest) = self.latest() else {
            return Validity::Valid;
        };
        if self.contains(id) {
            return Validity::Present;
        }
        if id < latest.id {
            warn!(
                id,
                latest = latest.id,
                "non-monotonic frame id, interpolation surfaces are stale"
            );
            return Validity::Invalid;
        }
        Validity::Valid
    }

    /// Park a rendered frame. The caller owns texture lifetime; an evicted
    /// surface is returned so its texture can go back to the pool.
    pub fn commit(&mut self, surface: Surface) -> Option<Surface> {
        debug_assert!(!self.contains(surface.id));
        if self.surfaces.len() < SURFACES_MAX {
            self.surfaces.push(surface);
            self.head = self.surfaces.len() - 1;
            None
        } else {
            let slot = (self.head + 1) % SURFACES_MAX;
            let evicted = self.surfaces[slot];
            self.surfaces[slot] = surface;
            self.head = slot;
            debug!(evicted = evicted.id, "interpolation surface recycled");
            Some(evicted)
        }
    }

    /// The `taps` most recent surfaces, oldest first. Shorter than `taps`
    /// while the ring is still filling.
    pub fn window(&self, taps: usize) -> Vec<Surface> {
        let n = taps.min(self.surfaces.len());
        let mut out = Vec::with_capacity(n);
        for i in (0..n).rev() {
            let idx = (self.head + self.surfaces.len() - i) % self.surfaces.len();
            out.push(self.surfaces[idx]);
        }
        out
    }
}

/// Mix coefficient between the two newest surfaces for this vsync, plus
/// whether the window had to shift back one frame (the vsync landed before
/// the newest frame's presentation time).
pub fn plan_mix(vsync_offset: f64, ideal_frame_duration: f64) -> (f32, bool) {
    if ideal_frame_duration <= 0.0 {
        return (0.0, false);
    }
    let mut mix = vsync_offset / ideal_frame_duration;
    let shifted = mix < 0.0;
    if shifted {
        mix += 1.0;
    }
    (mix.clamp(0.0, 1.0) as f32, shifted)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn surf(id: u64) -> Surface {
        Surface {
            tex: TextureHandle(100 + id),
            w: 16,
            h: 16,
            id,
        }
    }

    #[test]
    fn test_monotonic_commits_fill_the_ring() {
        let mut ring = SurfaceRing::new();
        for id in 0..SURFACES_MAX as u64 + 3 {
            assert_eq!(ring.check(id), Validity::Valid);
            let evicted = ring.commit(surf(id));
            assert_eq!(evicted.is_some(), id >= SURFACES_MAX as u64);
        }
        assert_eq!(ring.valid_count(), SURFACES_MAX);
        assert_eq!(ring.latest().unwrap().id, SURFACES_MAX as u64 + 2);
    }

    #[test]
    fn test_repeated_id_is_present() {
        let mut ring = SurfaceRing::new();
        ring.commit(surf(5));
        assert_eq!(ring.check(5), Validity::Present);
        assert_eq!(ring.valid_count(), 1);
    }

    #[test]
    fn test_backwards_id_invalidates() {
        let mut ring = SurfaceRing::new();
        ring.commit(surf(5));
        ring.commit(surf(6));
        assert_eq!(ring.check(4), Validity::Invalid);
        // The stale surfaces come back out for texture recycling, and the
        // very next frame starts a fresh ring.
        assert_eq!(ring.drain().len(), 2);
        assert_eq!(ring.valid_count(), 0);
        assert_eq!(ring.check(4), Validity::Valid);
    }

    #[test]
    fn test_window_is_oldest_first() {
        let mut ring = SurfaceRing::new();
        for id in 0..4 {
            ring.commit(surf(id));
        }
        let w = ring.window(3);
        assert_eq!(w.iter().map(|s| s.id).collect::<Vec<_>>(), vec![1, 2, 3]);
        // A wider request than the ring holds is truncated.
        assert_eq!(ring.window(9).len(), 4);
    }

    #[test]
    fn test_window_wraps_after_eviction() {
        let mut ring = SurfaceRing::new();
        for id in 0..SURFACES_MAX as u64 + 2 {
            ring.commit(surf(id));
        }
        let w = ring.window(2);
        assert_eq!(
            w.iter().map(|s| s.id).collect::<Vec<_>>(),
            vec![SURFACES_MAX as u64, SURFACES_MAX as u64 + 1]
        );
    }

    #[test]
    fn test_mix_is_clamped() {
        assert_eq!(plan_mix(0.0, 20.0), (0.0, false));
        assert_eq!(plan_mix(10.0, 20.0), (0.5, false));
        assert_eq!(plan_mix(40.0, 20.0), (1.0, false));
    }

    #[test]
    fn test_negative_offset_shifts_back_one_frame() {
        let (mix, shifted) = plan_mix(-5.0, 20.0);
        assert!(shifted);
        assert!((mix - 0.75).abs() < 1e-6);
    }

    #[test]
    fn test_degenerate_duration_disables_mixing() {
        assert_eq!(plan_mix(5.0, 0.0), (0.0, false));
    }
}
