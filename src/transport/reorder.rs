use std::collections::{BTreeMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::Instant;

use crate::packet::Packet;

const DEFAULT_CAPACITY: usize = 100;
const DEFAULT_MAX_GAP: i32 = 50;
const DEFAULT_DUPLICATE_WINDOW: usize = 100;

#[derive(Debug, Default, Clone, Copy)]
pub struct ReorderStats {
    pub packets_received: u64,
    pub packets_delivered: u64,
    pub packets_reordered: u64,
    pub packets_dropped: u64,
    pub duplicates: u64,
    pub gaps_detected: u64,
    pub current_buffer_size: u64,
    pub max_buffer_size_reached: u64,
}

#[derive(Default)]
struct Counters {
    packets_received: AtomicU64,
    packets_delivered: AtomicU64,
    packets_reordered: AtomicU64,
    packets_dropped: AtomicU64,
    duplicates: AtomicU64,
    gaps_detected: AtomicU64,
    max_buffer_size_reached: AtomicU64,
}

struct State {
    next_expected: u16,
    buffer: BTreeMap<u16, Packet>,
    recent_sequences: VecDeque<u16>,
    last_delivery: Instant,
}

/// Per-peer buffer restoring in-sequence delivery over an unordered
/// transport. One instance exists per source [`crate::uuid_registry::NodeHash`].
pub struct ReorderBuffer {
    state: Mutex<State>,
    capacity: usize,
    max_gap: i32,
    allow_duplicates: bool,
    counters: Counters,
}

/// True iff `a` precedes `b` under 16-bit modular sequence arithmetic,
/// handling the wrap from 65535 back to 0.
pub fn seq_before(a: u16, b: u16) -> bool {
    let diff = (b.wrapping_sub(a)) as i16;
    diff > 0 && (diff as i32) < 32768
}

impl ReorderBuffer {
    pub fn new(initial_expected: u16) -> Self {
        Self {
            state: Mutex::new(State {
                next_expected: initial_expected,
                buffer: BTreeMap::new(),
                recent_sequences: VecDeque::with_capacity(DEFAULT_DUPLICATE_WINDOW),
                last_delivery: Instant::now(),
            }),
            capacity: DEFAULT_CAPACITY,
            max_gap: DEFAULT_MAX_GAP,
            allow_duplicates: false,
            counters: Counters::default(),
        }
    }

    /// Feeds an incoming packet through the buffer, returning every packet
    /// now ready for delivery to the router, in order.
    pub fn receive(&self, packet: Packet) -> Vec<Packet> {
        self.counters.packets_received.fetch_add(1, Ordering::Relaxed);
        let mut state = self.state.lock().unwrap();
        let seq = packet.sequence;
        let mut delivered = Vec::new();

        if seq == state.next_expected {
            let filled_a_gap = !state.buffer.is_empty();
            state.last_delivery = Instant::now();
            remember_sequence(&mut state.recent_sequences, seq);
            state.next_expected = state.next_expected.wrapping_add(1);
            if filled_a_gap {
                self.counters.packets_reordered.fetch_add(1, Ordering::Relaxed);
            }
            delivered.push(packet);
            drain_consecutive(&mut state, &mut delivered, &self.counters);
        } else if seq_before(seq, state.next_expected) {
            let is_duplicate = state.recent_sequences.contains(&seq);
            if is_duplicate {
                self.counters.duplicates.fetch_add(1, Ordering::Relaxed);
                if self.allow_duplicates {
                    delivered.push(packet);
                }
            } else {
                // earlier than expected but not a known duplicate: treat as
                // a very late arrival and drop it rather than rewind state.
                self.counters.packets_dropped.fetch_add(1, Ordering::Relaxed);
            }
        } else {
            let gap = seq.wrapping_sub(state.next_expected) as i32;
            if gap > self.max_gap {
                self.counters.gaps_detected.fetch_add(1, Ordering::Relaxed);
                state.buffer.retain(|&s, _| seq_before(seq, s));
                state.next_expected = seq.wrapping_add(1);
                remember_sequence(&mut state.recent_sequences, seq);
                state.last_delivery = Instant::now();
                delivered.push(packet);
                drain_consecutive(&mut state, &mut delivered, &self.counters);
            } else {
                if state.buffer.len() >= self.capacity {
                    if let Some((&oldest, _)) = state.buffer.iter().next() {
                        state.buffer.remove(&oldest);
                        self.counters.packets_dropped.fetch_add(1, Ordering::Relaxed);
                    }
                }
                state.buffer.insert(seq, packet);
                let size = state.buffer.len() as u64;
                if size > self.counters.max_buffer_size_reached.load(Ordering::Relaxed) {
                    self.counters.max_buffer_size_reached.store(size, Ordering::Relaxed);
                }
            }
        }

        self.counters
            .packets_delivered
            .fetch_add(delivered.len() as u64, Ordering::Relaxed);
        delivered
    }

    /// Forces delivery past a stuck gap once the oldest buffered entry has
    /// aged past `timeout`. Intended to be called from a periodic timer.
    pub fn flush_stale(&self, timeout: std::time::Duration) -> Vec<Packet> {
        let mut state = self.state.lock().unwrap();
        if state.buffer.is_empty() || state.last_delivery.elapsed() < timeout {
            return Vec::new();
        }
        let mut delivered = Vec::new();
        if let Some((&oldest, _)) = state.buffer.iter().next() {
            state.next_expected = oldest;
            drain_consecutive(&mut state, &mut delivered, &self.counters);
        }
        self.counters
            .packets_delivered
            .fetch_add(delivered.len() as u64, Ordering::Relaxed);
        delivered
    }

    pub fn stats(&self) -> ReorderStats {
        let state = self.state.lock().unwrap();
        ReorderStats {
            packets_received: self.counters.packets_received.load(Ordering::Relaxed),
            packets_delivered: self.counters.packets_delivered.load(Ordering::Relaxed),
            packets_reordered: self.counters.packets_reordered.load(Ordering::Relaxed),
            packets_dropped: self.counters.packets_dropped.load(Ordering::Relaxed),
            duplicates: self.counters.duplicates.load(Ordering::Relaxed),
            gaps_detected: self.counters.gaps_detected.load(Ordering::Relaxed),
            current_buffer_size: state.buffer.len() as u64,
            max_buffer_size_reached: self.counters.max_buffer_size_reached.load(Ordering::Relaxed),
        }
    }
}

fn remember_sequence(recent: &mut VecDeque<u16>, seq: u16) {
    recent.push_back(seq);
    if recent.len() > DEFAULT_DUPLICATE_WINDOW {
        recent.pop_front();
    }
}

fn drain_consecutive(state: &mut State, delivered: &mut Vec<Packet>, counters: &Counters) {
    while let Some(packet) = state.buffer.remove(&state.next_expected) {
        remember_sequence(&mut state.recent_sequences, state.next_expected);
        state.next_expected = state.next_expected.wrapping_add(1);
        state.last_delivery = Instant::now();
        counters.packets_reordered.fetch_add(1, Ordering::Relaxed);
        delivered.push(packet);
    }
}
