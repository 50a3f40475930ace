//! Deterministic test signals
//!
//! Integer triangle oscillators, one per channel. Phase accumulates in a
//! u32 and the wave is carved out of the top bits, so synthesis is exact,
//! portable, and reproducible run to run. No floating point, no RNG.

use spindleproto::constants::TICKS_PER_SECOND;

/// One channel's oscillator. Frequency and amplitude are derived from the
/// channel number so every channel's stream is distinguishable.
#[derive(Debug, Clone)]
pub struct ToneSynth {
    phase: u32,
    step: u32,
    amplitude: i32,
}

impl ToneSynth {
    pub fn for_channel(channel: u16) -> Self {
        // 3..300 Hz spread across the channel space, at the 30 kHz device rate
        let hz = 3 + u32::from(channel % 100) * 3;
        let step = ((u64::from(hz) << 32) / u64::from(TICKS_PER_SECOND)) as u32;
        Self {
            phase: 0,
            step,
            amplitude: 2000 + i32::from(channel) * 8,
        }
    }

    /// ADC counts the wave peaks at.
    pub fn amplitude(&self) -> i16 {
        self.amplitude as i16
    }

    pub fn next_sample(&mut self) -> i16 {
        self.phase = self.phase.wrapping_add(self.step);
        // top 18 bits of phase span one full period
        let p = (self.phase >> 14) as i32;
        let tri = if p < 131_072 { p - 65_536 } else { 196_608 - p };
        ((tri * self.amplitude) / 65_536) as i16
    }

    /// Advance the phase as if `ticks` samples had been produced, without
    /// producing them. Used when the device buffer would drop them anyway.
    pub fn skip(&mut self, ticks: u32) {
        self.phase = self.phase.wrapping_add(self.step.wrapping_mul(ticks));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bounded_by_amplitude() {
        let mut synth = ToneSynth::for_channel(42);
        let bound = i32::from(synth.amplitude());
        for _ in 0..100_000 {
            let s = i32::from(synth.next_sample());
            assert!(s.abs() <= bound, "sample {s} exceeds amplitude {bound}");
        }
    }

    #[test]
    fn deterministic_per_channel() {
        let mut a = ToneSynth::for_channel(7);
        let mut b = ToneSynth::for_channel(7);
        for _ in 0..1000 {
            assert_eq!(a.next_sample(), b.next_sample());
        }
    }

    #[test]
    fn channels_differ() {
        let mut a = ToneSynth::for_channel(0);
        let mut b = ToneSynth::for_channel(1);
        let first: Vec<i16> = (0..64).map(|_| a.next_sample()).collect();
        let second: Vec<i16> = (0..64).map(|_| b.next_sample()).collect();
        assert_ne!(first, second);
    }

    #[test]
    fn skip_matches_produced_samples() {
        let mut skipped = ToneSynth::for_channel(12);
        let mut produced = ToneSynth::for_channel(12);

        skipped.skip(500);
        for _ in 0..500 {
            produced.next_sample();
        }
        for _ in 0..100 {
            assert_eq!(skipped.next_sample(), produced.next_sample());
        }
    }

    #[test]
    fn wave_oscillates() {
        let mut synth = ToneSynth::for_channel(50);
        // channel 50 runs at 153 Hz; one period is under 200 samples, so a
        // second of samples must cross zero in both directions many times
        let samples: Vec<i16> = (0..30_000).map(|_| synth.next_sample()).collect();
        assert!(samples.iter().any(|&s| s > 1000));
        assert!(samples.iter().any(|&s| s < -1000));
    }
}
