//! Debounce gate for positional edits.
//!
//! Drags and resizes arrive as bursts. Each item gets a lane holding at most
//! one debouncing burst and at most one burst in flight; a burst is persisted
//! once, after its quiet period, with the last position it saw. Lanes for
//! different items never interact.
//!
//! The gate does no I/O itself. The session spawns the quiet-period timer
//! for the generation returned by [`DebounceGate::push`], hands its handle to
//! [`DebounceGate::arm`], and calls [`DebounceGate::fire`] when it expires.

use std::collections::HashMap;
use std::time::Duration;

use tokio::task::JoinHandle;

use crate::item::{ItemId, Position};

/// A burst of edits waiting for its quiet period to pass.
#[derive(Debug)]
struct Burst<W> {
    generation: u64,
    /// Position before the burst's first edit.
    baseline: Position,
    position: Position,
    waiters: Vec<W>,
    /// Quiet period elapsed while another burst was in flight.
    ready: bool,
}

/// A burst whose update call has been issued.
#[derive(Debug)]
struct Flight<W> {
    seq: u64,
    baseline: Position,
    waiters: Vec<W>,
}

/// Per-item gate state. Also the unit that can be detached while a delete is
/// pending and re-attached if the delete fails.
#[derive(Debug)]
pub struct Lane<W> {
    pending: Option<Burst<W>>,
    in_flight: Option<Flight<W>>,
    timer: Option<JoinHandle<()>>,
}

impl<W> Lane<W> {
    fn new() -> Self {
        Lane {
            pending: None,
            in_flight: None,
            timer: None,
        }
    }

    pub fn is_idle(&self) -> bool {
        self.pending.is_none() && self.in_flight.is_none()
    }

    /// Settle a flight while the lane is detached. A ready burst stays put
    /// until the lane is attached again.
    pub fn settle_detached(&mut self, seq: u64, succeeded: bool) -> Option<Settlement<W>> {
        self.settle(seq, succeeded, false)
    }

    fn settle(&mut self, seq: u64, succeeded: bool, launch_ready: bool) -> Option<Settlement<W>> {
        if self.in_flight.as_ref().map(|f| f.seq) != Some(seq) {
            return None;
        }
        let flight = self.in_flight.take()?;

        let mut revert_to = None;
        if !succeeded {
            match self.pending.as_mut() {
                // The newer burst never had this flight's position confirmed.
                Some(burst) => burst.baseline = flight.baseline,
                None => revert_to = Some(flight.baseline),
            }
        }

        let ready = launch_ready && self.pending.as_ref().is_some_and(|burst| burst.ready);
        let next = if ready { self.launch() } else { None };

        Some(Settlement {
            waiters: flight.waiters,
            revert_to,
            next,
            idle: self.is_idle(),
        })
    }

    fn launch(&mut self) -> Option<Launch> {
        let burst = self.pending.take()?;
        self.in_flight = Some(Flight {
            seq: burst.generation,
            baseline: burst.baseline,
            waiters: burst.waiters,
        });
        Some(Launch {
            seq: burst.generation,
            position: burst.position,
        })
    }

    fn cancel_timer(&mut self) {
        if let Some(timer) = self.timer.take() {
            timer.abort();
        }
    }

    /// Every caller still waiting on this lane.
    pub fn into_waiters(mut self) -> Vec<W> {
        self.cancel_timer();
        let mut waiters = Vec::new();
        if let Some(flight) = self.in_flight.take() {
            waiters.extend(flight.waiters);
        }
        if let Some(burst) = self.pending.take() {
            waiters.extend(burst.waiters);
        }
        waiters
    }
}

/// A burst leaving the gate for persistence.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Launch {
    pub seq: u64,
    pub position: Position,
}

/// Outcome of a settled flight.
#[derive(Debug)]
pub struct Settlement<W> {
    pub waiters: Vec<W>,
    /// Position the cache must revert to, if any.
    pub revert_to: Option<Position>,
    /// A burst that was ready and is now launched.
    pub next: Option<Launch>,
    /// Nothing left debouncing or in flight for the item.
    pub idle: bool,
}

#[derive(Debug)]
pub struct DebounceGate<W> {
    quiet_period: Duration,
    lanes: HashMap<ItemId, Lane<W>>,
    next_generation: u64,
}

impl<W> DebounceGate<W> {
    pub fn new(quiet_period: Duration) -> Self {
        DebounceGate {
            quiet_period,
            lanes: HashMap::new(),
            next_generation: 0,
        }
    }

    pub fn quiet_period(&self) -> Duration {
        self.quiet_period
    }

    fn generation(&mut self) -> u64 {
        self.next_generation += 1;
        self.next_generation
    }

    /// Whether anything is debouncing or in flight for `id`.
    pub fn is_active(&self, id: &ItemId) -> bool {
        self.lanes.contains_key(id)
    }

    /// Record a positional edit. `current` is the item's position before this
    /// edit and becomes the baseline if a new burst starts.
    ///
    /// Returns the generation the caller must arm a timer for.
    pub fn push(&mut self, id: &ItemId, current: Position, target: Position, waiter: W) -> u64 {
        let generation = self.generation();
        let lane = self.lanes.entry(id.clone()).or_insert_with(Lane::new);
        lane.cancel_timer();
        match lane.pending.as_mut() {
            Some(burst) => {
                burst.generation = generation;
                burst.position = target;
                burst.ready = false;
                burst.waiters.push(waiter);
            }
            None => {
                lane.pending = Some(Burst {
                    generation,
                    baseline: current,
                    position: target,
                    waiters: vec![waiter],
                    ready: false,
                });
            }
        }
        generation
    }

    /// Attach the timer for the lane's current generation.
    pub fn arm(&mut self, id: &ItemId, timer: JoinHandle<()>) {
        match self.lanes.get_mut(id) {
            Some(lane) => {
                lane.cancel_timer();
                lane.timer = Some(timer);
            }
            None => timer.abort(),
        }
    }

    /// Quiet period for `generation` elapsed. Returns the burst to persist,
    /// or `None` if the timer was superseded or must wait for a flight.
    pub fn fire(&mut self, id: &ItemId, generation: u64) -> Option<Launch> {
        let lane = self.lanes.get_mut(id)?;
        let burst = lane.pending.as_mut()?;
        if burst.generation != generation {
            return None;
        }
        lane.timer = None;
        if lane.in_flight.is_some() {
            burst.ready = true;
            return None;
        }
        lane.launch()
    }

    /// The update call for flight `seq` finished.
    pub fn settle(&mut self, id: &ItemId, seq: u64, succeeded: bool) -> Option<Settlement<W>> {
        let lane = self.lanes.get_mut(id)?;
        let settlement = lane.settle(seq, succeeded, true)?;
        if settlement.idle {
            self.lanes.remove(id);
        }
        Some(settlement)
    }

    /// A confirmed position arrived from elsewhere; failures now revert to it.
    pub fn rebase(&mut self, id: &ItemId, position: Position) {
        if let Some(lane) = self.lanes.get_mut(id) {
            if let Some(flight) = lane.in_flight.as_mut() {
                flight.baseline = position;
            }
            if let Some(burst) = lane.pending.as_mut() {
                burst.baseline = position;
            }
        }
    }

    /// Position to fall back to if everything active for `id` were dropped.
    pub fn baseline(&self, id: &ItemId) -> Option<Position> {
        let lane = self.lanes.get(id)?;
        lane.in_flight
            .as_ref()
            .map(|f| f.baseline)
            .or_else(|| lane.pending.as_ref().map(|b| b.baseline))
    }

    /// Take the lane out of the gate, cancelling its timer.
    pub fn detach(&mut self, id: &ItemId) -> Option<Lane<W>> {
        let mut lane = self.lanes.remove(id)?;
        lane.cancel_timer();
        Some(lane)
    }

    /// Put a detached lane back. Returns the generation to re-arm if it had
    /// a debouncing burst.
    pub fn attach(&mut self, id: &ItemId, mut lane: Lane<W>) -> Option<u64> {
        if lane.is_idle() {
            return None;
        }
        let generation = match lane.pending.is_some() {
            true => Some(self.generation()),
            false => None,
        };
        if let (Some(burst), Some(generation)) = (lane.pending.as_mut(), generation) {
            burst.generation = generation;
            burst.ready = false;
        }
        if let Some(previous) = self.lanes.insert(id.clone(), lane) {
            // Should not happen: the item was absent while detached.
            drop(previous.into_waiters());
        }
        generation
    }

    /// Drop the lane and return everyone waiting on it.
    pub fn discard(&mut self, id: &ItemId) -> Vec<W> {
        self.detach(id).map(Lane::into_waiters).unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::item::ItemTime;

    fn pos(s: &str) -> Position {
        Position::new(ItemTime::parse(s).unwrap(), None)
    }

    fn gate() -> DebounceGate<u32> {
        DebounceGate::new(Duration::from_millis(300))
    }

    #[test]
    fn test_burst_collapses_to_last_position() {
        let mut gate = gate();
        let id = ItemId::permanent("42");
        let g1 = gate.push(&id, pos("2025-03-01"), pos("2025-03-02"), 1);
        let g2 = gate.push(&id, pos("2025-03-02"), pos("2025-03-03"), 2);
        let g3 = gate.push(&id, pos("2025-03-03"), pos("2025-03-04"), 3);

        assert_eq!(gate.fire(&id, g1), None);
        assert_eq!(gate.fire(&id, g2), None);
        let launch = gate.fire(&id, g3).unwrap();
        assert_eq!(launch.position, pos("2025-03-04"));
        // A stale timer firing again launches nothing.
        assert_eq!(gate.fire(&id, g3), None);

        let settled = gate.settle(&id, launch.seq, true).unwrap();
        assert_eq!(settled.waiters, vec![1, 2, 3]);
        assert_eq!(settled.revert_to, None);
        assert!(settled.idle);
        assert!(!gate.is_active(&id));
    }

    #[test]
    fn test_failure_reverts_to_burst_baseline() {
        let mut gate = gate();
        let id = ItemId::permanent("42");
        gate.push(&id, pos("2025-03-01"), pos("2025-03-02"), 1);
        let g = gate.push(&id, pos("2025-03-02"), pos("2025-03-03"), 2);
        let launch = gate.fire(&id, g).unwrap();

        let settled = gate.settle(&id, launch.seq, false).unwrap();
        assert_eq!(settled.revert_to, Some(pos("2025-03-01")));
    }

    #[test]
    fn test_lanes_are_independent() {
        let mut gate = gate();
        let a = ItemId::permanent("a");
        let b = ItemId::permanent("b");
        let ga = gate.push(&a, pos("2025-03-01"), pos("2025-03-02"), 1);
        let gb = gate.push(&b, pos("2025-04-01"), pos("2025-04-02"), 2);
        assert!(gate.fire(&a, ga).is_some());
        assert!(gate.fire(&b, gb).is_some());
    }

    #[test]
    fn test_single_flight_defers_ready_burst() {
        let mut gate = gate();
        let id = ItemId::permanent("42");
        let g1 = gate.push(&id, pos("2025-03-01"), pos("2025-03-02"), 1);
        let first = gate.fire(&id, g1).unwrap();

        let g2 = gate.push(&id, pos("2025-03-02"), pos("2025-03-05"), 2);
        // Quiet period elapsed but the first flight is still out.
        assert_eq!(gate.fire(&id, g2), None);

        let settled = gate.settle(&id, first.seq, true).unwrap();
        assert_eq!(settled.waiters, vec![1]);
        let next = settled.next.unwrap();
        assert_eq!(next.position, pos("2025-03-05"));
        assert!(!settled.idle);
    }

    #[test]
    fn test_failed_flight_hands_baseline_to_newer_burst() {
        let mut gate = gate();
        let id = ItemId::permanent("42");
        let g1 = gate.push(&id, pos("2025-03-01"), pos("2025-03-02"), 1);
        let first = gate.fire(&id, g1).unwrap();
        let g2 = gate.push(&id, pos("2025-03-02"), pos("2025-03-05"), 2);

        let settled = gate.settle(&id, first.seq, false).unwrap();
        // The newer burst is still visible; nothing to revert yet.
        assert_eq!(settled.revert_to, None);

        let second = gate.fire(&id, g2).unwrap();
        let settled = gate.settle(&id, second.seq, false).unwrap();
        assert_eq!(settled.revert_to, Some(pos("2025-03-01")));
    }

    #[test]
    fn test_rebase_moves_revert_target() {
        let mut gate = gate();
        let id = ItemId::permanent("42");
        let g = gate.push(&id, pos("2025-03-01"), pos("2025-03-02"), 1);
        gate.rebase(&id, pos("2025-03-09"));
        let launch = gate.fire(&id, g).unwrap();
        let settled = gate.settle(&id, launch.seq, false).unwrap();
        assert_eq!(settled.revert_to, Some(pos("2025-03-09")));
    }

    #[test]
    fn test_detach_and_attach_rearms_pending_burst() {
        let mut gate = gate();
        let id = ItemId::permanent("42");
        let g = gate.push(&id, pos("2025-03-01"), pos("2025-03-02"), 1);
        let lane = gate.detach(&id).unwrap();
        assert!(!gate.is_active(&id));
        assert_eq!(gate.fire(&id, g), None);

        let rearmed = gate.attach(&id, lane).unwrap();
        assert_ne!(rearmed, g);
        let launch = gate.fire(&id, rearmed).unwrap();
        assert_eq!(launch.position, pos("2025-03-02"));
    }

    #[test]
    fn test_detached_flight_settles_without_launching() {
        let mut gate = gate();
        let id = ItemId::permanent("42");
        let g1 = gate.push(&id, pos("2025-03-01"), pos("2025-03-02"), 1);
        let first = gate.fire(&id, g1).unwrap();
        let g2 = gate.push(&id, pos("2025-03-02"), pos("2025-03-05"), 2);
        gate.fire(&id, g2);

        let mut lane = gate.detach(&id).unwrap();
        let settled = lane.settle_detached(first.seq, true).unwrap();
        assert_eq!(settled.waiters, vec![1]);
        assert!(settled.next.is_none());
        assert!(!lane.is_idle());

        let rearmed = gate.attach(&id, lane).unwrap();
        assert_eq!(gate.fire(&id, rearmed).unwrap().position, pos("2025-03-05"));
    }

    #[test]
    fn test_discard_returns_all_waiters() {
        let mut gate = gate();
        let id = ItemId::permanent("42");
        let g = gate.push(&id, pos("2025-03-01"), pos("2025-03-02"), 1);
        gate.fire(&id, g).unwrap();
        gate.push(&id, pos("2025-03-02"), pos("2025-03-03"), 2);
        let mut waiters = gate.discard(&id);
        waiters.sort();
        assert_eq!(waiters, vec![1, 2]);
        assert!(!gate.is_active(&id));
    }
}
