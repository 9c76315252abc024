//! Cycle-counted event scheduler
//!
//! All "waiting" inside the DMA core is expressed as a future event in this
//! queue; nothing ever blocks. Deferred channel completions are pushed with a
//! floor of 1 cycle, and force-stopping a channel removes its pending event so
//! a stale completion can never fire.

use crate::dmac::Channel;
use crate::sif::SifChannel;
use bincode::{Decode, Encode};
use std::cmp::Ordering;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Encode, Decode)]
pub enum SchedulerEventType {
    EeDmaFinish(Channel),
    IopDmaFinish(SifChannel),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Encode, Decode)]
pub struct SchedulerEvent {
    pub event_type: SchedulerEventType,
    pub cpu_cycles: u64,
}

impl SchedulerEvent {
    pub fn ee_dma_finish(channel: Channel, cpu_cycles: u64) -> Self {
        Self { event_type: SchedulerEventType::EeDmaFinish(channel), cpu_cycles }
    }

    pub fn iop_dma_finish(channel: SifChannel, cpu_cycles: u64) -> Self {
        Self { event_type: SchedulerEventType::IopDmaFinish(channel), cpu_cycles }
    }
}

impl PartialOrd for SchedulerEvent {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for SchedulerEvent {
    fn cmp(&self, other: &Self) -> Ordering {
        self.cpu_cycles.cmp(&other.cpu_cycles)
    }
}

#[derive(Debug, Clone, Encode, Decode)]
pub struct Scheduler {
    cpu_cycle_counter: u64,
    // Small event set (one slot per DMA channel at most); a linear-scan Vec
    // beats a heap at this size and keeps update/remove trivial
    events: Vec<SchedulerEvent>,
}

impl Scheduler {
    pub fn new() -> Self {
        Self { cpu_cycle_counter: 0, events: Vec::with_capacity(16) }
    }

    pub fn cpu_cycle_counter(&self) -> u64 {
        self.cpu_cycle_counter
    }

    pub fn increment_cpu_cycles(&mut self, cpu_cycles: u64) {
        self.cpu_cycle_counter += cpu_cycles;
    }

    pub fn update_or_push_event(&mut self, event: SchedulerEvent) {
        log::trace!(
            "Scheduled event of type {:?} at cycles {}, current {}",
            event.event_type,
            event.cpu_cycles,
            self.cpu_cycle_counter
        );

        match self.events.iter_mut().find(|e| e.event_type == event.event_type) {
            Some(existing) => existing.cpu_cycles = event.cpu_cycles,
            None => self.events.push(event),
        }
    }

    pub fn remove_event(&mut self, event_type: SchedulerEventType) {
        self.events.retain(|event| event.event_type != event_type);
    }

    pub fn event_scheduled(&self, event_type: SchedulerEventType) -> bool {
        self.events.iter().any(|event| event.event_type == event_type)
    }

    pub fn is_event_ready(&self) -> bool {
        self.events.iter().any(|event| event.cpu_cycles <= self.cpu_cycle_counter)
    }

    pub fn pop_ready_event(&mut self) -> Option<SchedulerEvent> {
        let (idx, &event) = self
            .events
            .iter()
            .enumerate()
            .min_by_key(|(_, event)| event.cpu_cycles)
            .filter(|(_, event)| event.cpu_cycles <= self.cpu_cycle_counter)?;

        self.events.swap_remove(idx);
        Some(event)
    }
}

impl Default for Scheduler {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pops_in_cycle_order() {
        let mut scheduler = Scheduler::new();

        scheduler.update_or_push_event(SchedulerEvent::ee_dma_finish(Channel::Gif, 30));
        scheduler.update_or_push_event(SchedulerEvent::ee_dma_finish(Channel::Sif0, 10));
        scheduler.update_or_push_event(SchedulerEvent::iop_dma_finish(SifChannel::Sif0, 20));

        assert!(scheduler.pop_ready_event().is_none());

        scheduler.increment_cpu_cycles(100);

        let order: Vec<u64> = std::iter::from_fn(|| scheduler.pop_ready_event())
            .map(|event| event.cpu_cycles)
            .collect();
        assert_eq!(order, vec![10, 20, 30]);
    }

    #[test]
    fn update_replaces_existing_event() {
        let mut scheduler = Scheduler::new();

        scheduler.update_or_push_event(SchedulerEvent::ee_dma_finish(Channel::Gif, 30));
        scheduler.update_or_push_event(SchedulerEvent::ee_dma_finish(Channel::Gif, 50));

        scheduler.increment_cpu_cycles(40);
        assert!(scheduler.pop_ready_event().is_none());

        scheduler.increment_cpu_cycles(10);
        assert_eq!(scheduler.pop_ready_event().map(|e| e.cpu_cycles), Some(50));
    }

    #[test]
    fn remove_cancels_event() {
        let mut scheduler = Scheduler::new();

        scheduler.update_or_push_event(SchedulerEvent::ee_dma_finish(Channel::SprTo, 5));
        scheduler.remove_event(SchedulerEventType::EeDmaFinish(Channel::SprTo));

        scheduler.increment_cpu_cycles(1000);
        assert!(scheduler.pop_ready_event().is_none());
    }
}
