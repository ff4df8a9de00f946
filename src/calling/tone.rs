//! Generated call audio.
//!
//! Outgoing audio is a quiet 440 Hz tone encoded as G.711 mu-law, one
//! 20 ms frame at a time. Muted frames are mu-law silence.

/// Samples per 20 ms frame at 8 kHz.
pub const FRAME_SAMPLES: usize = 160;

/// Mu-law encoding of zero.
pub const ULAW_SILENCE: u8 = 0xFF;

/// Continuous sine generator producing 8 kHz mono frames.
pub struct ToneGenerator {
    phase: f64,
    phase_inc: f64,
    amplitude: f64,
}

impl ToneGenerator {
    pub fn new(frequency: f64, amplitude: f64) -> Self {
        Self {
            phase: 0.0,
            phase_inc: 2.0 * std::f64::consts::PI * frequency / 8000.0,
            amplitude: amplitude.clamp(0.0, 1.0),
        }
    }

    /// Next 20 ms of linear PCM.
    pub fn next_frame(&mut self) -> Vec<i16> {
        let mut samples = Vec::with_capacity(FRAME_SAMPLES);
        for _ in 0..FRAME_SAMPLES {
            samples.push((self.phase.sin() * self.amplitude * 32767.0) as i16);
            self.phase += self.phase_inc;
            if self.phase > 2.0 * std::f64::consts::PI {
                self.phase -= 2.0 * std::f64::consts::PI;
            }
        }
        samples
    }

    /// Next 20 ms as a PCMU payload.
    pub fn next_pcmu_frame(&mut self) -> Vec<u8> {
        self.next_frame().into_iter().map(linear_to_ulaw).collect()
    }
}

impl Default for ToneGenerator {
    fn default() -> Self {
        Self::new(440.0, 0.2)
    }
}

/// One 20 ms frame of PCMU silence.
pub fn silence_frame() -> Vec<u8> {
    vec![ULAW_SILENCE; FRAME_SAMPLES]
}

/// G.711 mu-law encoder.
pub fn linear_to_ulaw(sample: i16) -> u8 {
    const BIAS: i32 = 0x84;
    const CLIP: i32 = 32635;

    let (sign, mag) = if sample < 0 {
        (0x80u8, (-(sample as i32)).min(CLIP))
    } else {
        (0u8, (sample as i32).min(CLIP))
    };
    let biased = mag + BIAS;

    // Segment is the position of the leading bit above bit 7.
    let mut exponent: u8 = 7;
    while exponent > 0 && biased & (0x80 << exponent) == 0 {
        exponent -= 1;
    }
    let mantissa = ((biased >> (exponent + 3)) & 0x0F) as u8;

    !(sign | (exponent << 4) | mantissa)
}
