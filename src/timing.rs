//! Cycle budget counter and event scheduling.
//!
//! Guest code runs in slices. At the start of a slice `downcount` is loaded
//! with the slice length; executing code subtracts its cycle cost, and once
//! the counter goes negative control returns to the outer loop, which folds
//! the slice into the global clock and fires due events.

use std::{cmp::Reverse, collections::BinaryHeap};

/// Upper bound on a slice when no event is scheduled sooner.
pub const MAX_SLICE_LENGTH: i32 = 100_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct EventType(usize);

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
struct Event {
    time: u64,
    seq: u64,
    ty: EventType,
    userdata: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FiredEvent {
    pub ty: EventType,
    pub userdata: u64,
    pub cycles_late: u64,
}

pub struct CoreTiming {
    /// Remaining cycles in the current slice. Compiled code holds a raw
    /// pointer to this field.
    pub downcount: i32,
    slice_length: i32,
    global_timer: u64,
    idled_cycles: u64,
    events: BinaryHeap<Reverse<Event>>,
    event_names: Vec<String>,
    seq: u64,
}

impl Default for CoreTiming {
    fn default() -> Self {
        Self::new()
    }
}

impl CoreTiming {
    pub fn new() -> Self {
        Self {
            downcount: 0,
            slice_length: 0,
            global_timer: 0,
            idled_cycles: 0,
            events: BinaryHeap::new(),
            event_names: vec![],
            seq: 0,
        }
    }

    pub fn register_event(&mut self, name: &str) -> EventType {
        self.event_names.push(name.to_string());
        EventType(self.event_names.len() - 1)
    }

    pub fn event_name(&self, ty: EventType) -> &str {
        &self.event_names[ty.0]
    }

    /// Global cycle count, including the part of the current slice already
    /// executed.
    pub fn ticks(&self) -> u64 {
        let executed = (self.slice_length as i64 - self.downcount as i64).max(0);
        self.global_timer + executed as u64
    }

    pub fn idled_cycles(&self) -> u64 {
        self.idled_cycles
    }

    pub fn has_pending_events(&self) -> bool {
        !self.events.is_empty()
    }

    pub fn schedule_event(&mut self, cycles_into_future: u64, ty: EventType, userdata: u64) {
        let time = self.ticks() + cycles_into_future;
        self.seq += 1;
        self.events.push(Reverse(Event {
            time,
            seq: self.seq,
            ty,
            userdata,
        }));
        log::debug!(
            "Scheduled {} ({userdata:#x}) at {time}",
            self.event_name(ty)
        );

        // End the running slice early so the event fires on time.
        let slice_end = self.global_timer + self.slice_length as u64;
        if time < slice_end {
            let shrink = (slice_end - time) as i32;
            self.slice_length -= shrink;
            self.downcount -= shrink;
        }
    }

    /// Removes the first pending event matching `ty` and `userdata`,
    /// returning how many cycles it still had to go.
    pub fn unschedule_event(&mut self, ty: EventType, userdata: u64) -> Option<u64> {
        let now = self.ticks();
        let mut events = std::mem::take(&mut self.events).into_sorted_vec();
        // Sorted descending by `Reverse`, so the earliest event is last.
        let pos = events
            .iter()
            .rposition(|Reverse(e)| e.ty == ty && e.userdata == userdata);
        let removed = pos.map(|pos| events.remove(pos).0);
        self.events = events.into_iter().collect();
        removed.map(|e| e.time.saturating_sub(now))
    }

    /// Folds the finished slice into the global clock, pops every event
    /// that is due and starts the next slice, bounded by the next event and
    /// by `until`.
    pub fn advance(&mut self, until: u64) -> Vec<FiredEvent> {
        let executed = self.slice_length as i64 - self.downcount as i64;
        self.global_timer += executed.max(0) as u64;

        let mut fired = vec![];
        while let Some(Reverse(e)) = self.events.peek() {
            if e.time > self.global_timer {
                break;
            }
            fired.push(FiredEvent {
                ty: e.ty,
                userdata: e.userdata,
                cycles_late: self.global_timer - e.time,
            });
            self.events.pop();
        }

        let mut slice = MAX_SLICE_LENGTH as u64;
        if let Some(Reverse(e)) = self.events.peek() {
            slice = slice.min(e.time - self.global_timer);
        }
        slice = slice.min(until.saturating_sub(self.global_timer));

        self.slice_length = slice as i32;
        self.downcount = self.slice_length;
        fired
    }

    /// Skips the rest of the current slice without running guest code.
    pub fn idle(&mut self) {
        if self.downcount > 0 {
            self.idled_cycles += self.downcount as u64;
        }
        self.downcount = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn slices_stop_at_target() {
        let mut t = CoreTiming::new();
        assert!(t.advance(1000).is_empty());
        assert_eq!(t.downcount, 1000);
        t.downcount -= 300;
        assert_eq!(t.ticks(), 300);
        t.downcount = -5;
        t.advance(1000);
        assert_eq!(t.ticks(), 1005);
        assert_eq!(t.downcount, 0);
    }

    #[test]
    fn events_fire_in_order() {
        let mut t = CoreTiming::new();
        let a = t.register_event("a");
        let b = t.register_event("b");
        t.advance(u64::MAX);
        t.schedule_event(50, b, 2);
        t.schedule_event(20, a, 1);
        assert_eq!(t.downcount, 20);

        t.downcount -= 25;
        let fired = t.advance(u64::MAX);
        assert_eq!(
            fired,
            vec![FiredEvent {
                ty: a,
                userdata: 1,
                cycles_late: 5
            }]
        );
        assert_eq!(t.downcount, 25);

        t.downcount = 0;
        let fired = t.advance(u64::MAX);
        assert_eq!(fired.len(), 1);
        assert_eq!(fired[0].ty, b);
        assert_eq!(t.event_name(fired[0].ty), "b");
        assert_eq!(t.downcount, MAX_SLICE_LENGTH);
    }

    #[test]
    fn scheduling_mid_slice_shortens_it() {
        let mut t = CoreTiming::new();
        let ev = t.register_event("ev");
        t.advance(u64::MAX);
        t.downcount -= 100;
        t.schedule_event(10, ev, 0);
        assert_eq!(t.ticks(), 100);
        assert_eq!(t.downcount, 10);
    }

    #[test]
    fn unschedule_reports_remaining_cycles() {
        let mut t = CoreTiming::new();
        let ev = t.register_event("ev");
        t.advance(u64::MAX);
        t.schedule_event(500, ev, 7);
        t.schedule_event(900, ev, 8);
        t.downcount -= 100;
        assert_eq!(t.unschedule_event(ev, 7), Some(400));
        assert_eq!(t.unschedule_event(ev, 7), None);
        assert!(t.has_pending_events());
    }

    #[test]
    fn idle_skips_to_next_event() {
        let mut t = CoreTiming::new();
        let ev = t.register_event("ev");
        t.advance(u64::MAX);
        t.schedule_event(300, ev, 0);
        t.idle();
        let fired = t.advance(u64::MAX);
        assert_eq!(fired.len(), 1);
        assert_eq!(t.ticks(), 300);
        assert_eq!(t.idled_cycles(), 300);
    }
}
