//! A vclock is a dense mapping from replica-id to the highest LSN ever
//! accepted from that replica. It is the sole piece of durable-adjacent
//! state this subsystem reasons about: everything else (WAL position,
//! secondary indexes, ...) belongs to the storage engine.

use std::cmp::Ordering;

use relay_wire::{Lsn, ReplicaId, WireVclock, N_MAX};

/// `Vclock::get(r)` on a replica-id never heard from returns `0`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Vclock {
    lsn: [Lsn; N_MAX as usize],
}

impl Default for Vclock {
    fn default() -> Self {
        Vclock {
            lsn: [0; N_MAX as usize],
        }
    }
}

impl Vclock {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, replica_id: ReplicaId) -> Lsn {
        self.lsn[replica_id as usize]
    }

    /// Monotonic update: raise the lsn recorded for `replica_id` to `lsn`
    /// if `lsn` is greater than what's there, and return the *previous*
    /// value either way. Never moves a replica's lsn backwards.
    pub fn follow(&mut self, replica_id: ReplicaId, lsn: Lsn) -> Lsn {
        let slot = &mut self.lsn[replica_id as usize];
        let prev = *slot;
        if lsn > prev {
            *slot = lsn;
        }
        prev
    }

    /// Unconditionally set a replica's lsn, used only to seed a vclock from
    /// a snapshot received over the wire (join / subscribe / reseed).
    pub fn reset(&mut self, replica_id: ReplicaId, lsn: Lsn) {
        self.lsn[replica_id as usize] = lsn;
    }

    pub fn copy(&mut self, other: &Vclock) {
        self.lsn = other.lsn;
    }

    /// The partial order over vclocks: `Some(Less)` if `self <= other`
    /// componentwise and strictly less somewhere, `Some(Equal)` if equal
    /// everywhere, `Some(Greater)` symmetrically, `None` if incomparable.
    pub fn compare(&self, other: &Vclock) -> Option<Ordering> {
        let mut less = false;
        let mut greater = false;
        for i in 0..N_MAX as usize {
            match self.lsn[i].cmp(&other.lsn[i]) {
                Ordering::Less => less = true,
                Ordering::Greater => greater = true,
                Ordering::Equal => {}
            }
        }
        match (less, greater) {
            (false, false) => Some(Ordering::Equal),
            (true, false) => Some(Ordering::Less),
            (false, true) => Some(Ordering::Greater),
            (true, true) => None,
        }
    }

    /// `self <= other` componentwise; `None` (incomparable) counts as false.
    pub fn le(&self, other: &Vclock) -> bool {
        matches!(self.compare(other), Some(Ordering::Less) | Some(Ordering::Equal))
    }

    pub fn to_wire(&self) -> WireVclock {
        (1..N_MAX)
            .filter_map(|r| {
                let lsn = self.lsn[r as usize];
                (lsn > 0).then_some((r, lsn))
            })
            .collect()
    }

    pub fn from_wire(wire: &WireVclock) -> Self {
        let mut vclock = Self::new();
        for (&replica_id, &lsn) in wire {
            vclock.reset(replica_id, lsn);
        }
        vclock
    }
}

#[cfg(test)]
use test_log::test;

#[test]
fn never_heard_is_zero() {
    let vc = Vclock::new();
    assert_eq!(vc.get(5), 0);
}

#[test]
fn follow_is_monotonic() {
    let mut vc = Vclock::new();
    assert_eq!(vc.follow(1, 10), 0);
    assert_eq!(vc.get(1), 10);
    assert_eq!(vc.follow(1, 5), 10);
    assert_eq!(vc.get(1), 10, "follow must never move a replica backwards");
    assert_eq!(vc.follow(1, 20), 10);
    assert_eq!(vc.get(1), 20);
}

#[test]
fn compare_partial_order() {
    let mut a = Vclock::new();
    let mut b = Vclock::new();
    assert_eq!(a.compare(&b), Some(Ordering::Equal));

    a.reset(1, 5);
    assert_eq!(a.compare(&b), Some(Ordering::Greater));
    assert_eq!(b.compare(&a), Some(Ordering::Less));
    assert!(b.le(&a));
    assert!(!a.le(&b));

    b.reset(2, 5);
    assert_eq!(a.compare(&b), None, "divergent vclocks are incomparable");
    assert!(!a.le(&b));
    assert!(!b.le(&a));
}

#[test]
fn wire_round_trip_omits_zeros() {
    let mut vc = Vclock::new();
    vc.reset(1, 10);
    vc.reset(3, 7);
    let wire = vc.to_wire();
    assert_eq!(wire.len(), 2);
    assert_eq!(wire.get(&1), Some(&10));
    assert_eq!(wire.get(&2), None);

    let back = Vclock::from_wire(&wire);
    assert_eq!(back, vc);
}
