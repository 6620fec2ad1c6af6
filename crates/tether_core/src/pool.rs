//! Pool of reusable simulation instances.
//!
//! Slots are created lazily at first checkout and reused until the pool is
//! torn down, at which point every live handle is released (on drop). The
//! pool mutex is the single serialization point; work inside a leased slot
//! proceeds unsynchronized with other slots.

use crate::api::{FmuBinary, FmuInstance};
use crate::error::FmuError;
use std::sync::Mutex;

/// Lifecycle phase of a slot's instance with respect to the wire protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlotPhase {
    Uninitialized,
    Initializing,
    Initialized,
    Evaluated,
}

/// One simulation instance with its per-instance buffers. All buffers are
/// indexed by variable id and sized to the full variable count.
pub struct Slot {
    pub(crate) id: usize,
    pub(crate) handle: Option<Box<dyn FmuInstance>>,
    pub(crate) phase: SlotPhase,
    /// Last known value per variable, NaN while unknown.
    pub(crate) values: Vec<f64>,
    /// Seed on the way in, sensitivity on the way out.
    pub(crate) sens: Vec<f64>,
    pub(crate) changed: Vec<bool>,
    pub(crate) requested: Vec<bool>,
    /// Sticky record of every variable the caller has set as an input.
    pub(crate) applied: Vec<bool>,
    /// Which input column requested each output, for diagnostics.
    pub(crate) wrt: Vec<usize>,
    // Gather scratch, compacted index lists with wire references.
    pub(crate) id_in: Vec<usize>,
    pub(crate) vr_in: Vec<u32>,
    pub(crate) v_in: Vec<f64>,
    pub(crate) id_out: Vec<usize>,
    pub(crate) vr_out: Vec<u32>,
    pub(crate) v_out: Vec<f64>,
    pub(crate) d_in: Vec<f64>,
    pub(crate) d_out: Vec<f64>,
    pub(crate) fd_out: Vec<f64>,
    pub(crate) nominal_out: Vec<f64>,
}

impl Slot {
    fn new(id: usize, n_vars: usize) -> Self {
        Self {
            id,
            handle: None,
            phase: SlotPhase::Uninitialized,
            values: vec![f64::NAN; n_vars],
            sens: vec![0.0; n_vars],
            changed: vec![false; n_vars],
            requested: vec![false; n_vars],
            applied: vec![false; n_vars],
            wrt: vec![usize::MAX; n_vars],
            id_in: Vec::new(),
            vr_in: Vec::new(),
            v_in: Vec::new(),
            id_out: Vec::new(),
            vr_out: Vec::new(),
            v_out: Vec::new(),
            d_in: Vec::new(),
            d_out: Vec::new(),
            fd_out: Vec::new(),
            nominal_out: Vec::new(),
        }
    }

    /// Values to unknown, seeds to zero, all marks cleared.
    fn reset_buffers(&mut self) {
        self.phase = SlotPhase::Uninitialized;
        self.values.fill(f64::NAN);
        self.sens.fill(0.0);
        self.changed.fill(false);
        self.requested.fill(false);
        self.applied.fill(false);
        self.wrt.fill(usize::MAX);
    }

    pub(crate) fn instance_mut(&mut self) -> Result<&mut (dyn FmuInstance + 'static), FmuError> {
        let id = self.id;
        self.handle
            .as_deref_mut()
            .ok_or(FmuError::Protocol {
                call: "missing instance handle",
                slot: id,
            })
    }

    pub fn value(&self, id: usize) -> f64 {
        self.values[id]
    }

    pub fn sensitivity(&self, id: usize) -> f64 {
        self.sens[id]
    }
}

/// Exclusive lease of one slot for the duration of one logical call.
pub struct SlotLease {
    pub(crate) id: usize,
    pub(crate) slot: Box<Slot>,
}

impl SlotLease {
    pub fn id(&self) -> usize {
        self.id
    }
}

struct PoolInner {
    slots: Vec<Option<Box<Slot>>>,
    free: Vec<usize>,
}

/// Growable collection of slots with O(1) checkout via an explicit free list.
pub struct InstancePool {
    inner: Mutex<PoolInner>,
    n_vars: usize,
}

impl InstancePool {
    pub fn new(n_vars: usize) -> Self {
        Self {
            inner: Mutex::new(PoolInner {
                slots: Vec::new(),
                free: Vec::new(),
            }),
            n_vars,
        }
    }

    /// Lends a free slot, instantiating the unit on first use. Failure to
    /// instantiate is fatal for the call; the slot id returns to the free
    /// list.
    pub fn checkout(&self, binary: &dyn FmuBinary) -> Result<SlotLease, FmuError> {
        let (id, mut slot) = {
            let mut inner = self.inner.lock().expect("instance pool lock poisoned");
            if let Some(id) = inner.free.pop() {
                let slot = inner.slots[id]
                    .take()
                    .unwrap_or_else(|| Box::new(Slot::new(id, self.n_vars)));
                (id, slot)
            } else {
                let id = inner.slots.len();
                inner.slots.push(None);
                (id, Box::new(Slot::new(id, self.n_vars)))
            }
        };
        if slot.handle.is_none() {
            // Instantiate outside the lock, the wire call may be slow.
            match binary.instantiate() {
                Ok(handle) => {
                    slot.handle = Some(handle);
                    slot.reset_buffers();
                }
                Err(err) => {
                    let mut inner = self.inner.lock().expect("instance pool lock poisoned");
                    inner.slots[id] = Some(slot);
                    inner.free.push(id);
                    return Err(err);
                }
            }
        }
        Ok(SlotLease { id, slot })
    }

    /// Returns a slot to the pool. The instance handle survives for reuse.
    /// A stale lease for an id that is already resident is dropped, never
    /// allowed to clobber the resident slot.
    pub fn release(&self, lease: SlotLease) {
        let mut inner = self.inner.lock().expect("instance pool lock poisoned");
        if inner.slots[lease.id].is_some() {
            log::warn!("slot {} released while not checked out", lease.id);
            return;
        }
        inner.slots[lease.id] = Some(lease.slot);
        inner.free.push(lease.id);
    }

    /// Number of slots ever created, leased or not.
    pub fn capacity(&self) -> usize {
        self.inner.lock().expect("instance pool lock poisoned").slots.len()
    }
}

#[cfg(test)]
mod tests {
    use super::{InstancePool, Slot, SlotLease};
    use crate::mock::MockUnit;
    use std::sync::atomic::Ordering;

    #[test]
    fn checkout_instantiates_lazily_and_reuses() {
        let unit = MockUnit::new(2, |_| {});
        let pool = InstancePool::new(2);

        let lease = pool.checkout(&unit).expect("checkout");
        assert_eq!(lease.id(), 0);
        assert_eq!(unit.instantiations.load(Ordering::SeqCst), 1);
        pool.release(lease);

        // Same slot comes back, no second instantiation.
        let lease = pool.checkout(&unit).expect("checkout");
        assert_eq!(lease.id(), 0);
        assert_eq!(unit.instantiations.load(Ordering::SeqCst), 1);
        pool.release(lease);
        assert_eq!(pool.capacity(), 1);
    }

    #[test]
    fn concurrent_leases_get_distinct_slots() {
        let unit = MockUnit::new(1, |_| {});
        let pool = InstancePool::new(1);

        let a = pool.checkout(&unit).expect("checkout");
        let b = pool.checkout(&unit).expect("checkout");
        assert_ne!(a.id(), b.id());
        assert_eq!(unit.instantiations.load(Ordering::SeqCst), 2);
        pool.release(a);
        pool.release(b);
    }

    #[test]
    fn stale_release_never_clobbers_the_resident_slot() {
        let unit = MockUnit::new(1, |_| {});
        let pool = InstancePool::new(1);
        let lease = pool.checkout(&unit).expect("checkout");
        pool.release(lease);
        assert_eq!(unit.instantiations.load(Ordering::SeqCst), 1);

        // A stale lease for an id that is already back in the pool.
        let stale = SlotLease {
            id: 0,
            slot: Box::new(Slot::new(0, 1)),
        };
        pool.release(stale);

        // The resident slot keeps its live instance and its free-list entry.
        let lease = pool.checkout(&unit).expect("checkout");
        assert_eq!(lease.id(), 0);
        assert_eq!(unit.instantiations.load(Ordering::SeqCst), 1);
        pool.release(lease);
        assert_eq!(pool.capacity(), 1);
    }

    #[test]
    fn failed_instantiation_returns_id_to_free_list() {
        let unit = MockUnit::new(1, |_| {}).with_failure("instantiate");
        let pool = InstancePool::new(1);
        assert!(pool.checkout(&unit).is_err());
        assert_eq!(pool.capacity(), 1);

        let ok = MockUnit::new(1, |_| {});
        let lease = pool.checkout(&ok).expect("checkout after failure");
        assert_eq!(lease.id(), 0);
        pool.release(lease);
    }
}
