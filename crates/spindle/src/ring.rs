//! Per-channel receive ring
//!
//! Fixed-size ring holding one channel's continuous samples between arrival
//! on the wire and consumption by a Transfer. Fixed size power-of-2 for
//! efficient modulo. Positions grow without bound and wrap through the mask,
//! so `write_pos - read_pos` is always the occupancy.
//!
//! Unlike an audio ring that refuses samples when full, this one overwrites
//! the oldest: the instrument keeps streaming whether or not the caller
//! polls, and a slow poller loses the oldest data, same as it would against
//! the device's own buffer. `push` reports how many samples were dropped so
//! the transport can account for the overrun.

/// SPSC-style sample ring. Callers synchronize externally (the transport
/// keeps rings behind a mutex); methods take `&mut self`.
#[derive(Debug)]
pub struct SampleRing {
    data: Vec<i16>,
    capacity: usize,
    write_pos: usize,
    read_pos: usize,
}

impl SampleRing {
    /// Create a ring with the given capacity (rounded up to power of 2).
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.next_power_of_two();
        Self {
            data: vec![0; capacity],
            capacity,
            write_pos: 0,
            read_pos: 0,
        }
    }

    /// Append samples, evicting the oldest on overflow. Returns the number
    /// of samples dropped (0 when the ring had room).
    pub fn push(&mut self, samples: &[i16]) -> usize {
        let mut dropped = 0;

        // An input longer than the ring can only keep its newest tail.
        let src = if samples.len() > self.capacity {
            dropped += samples.len() - self.capacity;
            &samples[samples.len() - self.capacity..]
        } else {
            samples
        };

        let occupied = self.write_pos.wrapping_sub(self.read_pos);
        let space = self.capacity - occupied;
        if src.len() > space {
            let evict = src.len() - space;
            self.read_pos = self.read_pos.wrapping_add(evict);
            dropped += evict;
        }

        for (i, &sample) in src.iter().enumerate() {
            let pos = self.write_pos.wrapping_add(i) & (self.capacity - 1);
            self.data[pos] = sample;
        }
        self.write_pos = self.write_pos.wrapping_add(src.len());

        dropped
    }

    /// Pop up to `count` samples into `out`. Returns the number popped.
    pub fn pop_into(&mut self, out: &mut Vec<i16>, count: usize) -> usize {
        let occupied = self.write_pos.wrapping_sub(self.read_pos);
        let to_read = count.min(occupied);

        out.reserve(to_read);
        for i in 0..to_read {
            let pos = self.read_pos.wrapping_add(i) & (self.capacity - 1);
            out.push(self.data[pos]);
        }
        self.read_pos = self.read_pos.wrapping_add(to_read);

        to_read
    }

    /// Number of samples available to read
    pub fn available(&self) -> usize {
        self.write_pos.wrapping_sub(self.read_pos)
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn clear(&mut self) {
        self.read_pos = self.write_pos;
    }
}
