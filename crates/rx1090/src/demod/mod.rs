/*!
 * The 2.4 MHz Mode S demodulator.
 *
 * When sampling at 2.4 MHz we have exactly 6 samples per 5 symbols. Each
 * symbol is 500 ns wide, each sample 416.7 ns.
 *
 * We maintain a phase offset expressed in units of 1/5 of a sample, i.e.
 * 1/6 of a symbol, 83.333 ns. Each symbol processed advances the phase
 * offset by 6, i.e. 6/5 of a sample, 500 ns.
 *
 * The correlation functions below correlate a 1-0 pair of symbols (i.e. one
 * manchester encoded bit) starting at the given sample, assuming the symbol
 * starts at a fixed 0-5 phase offset within m[0]. They return a correlation
 * value interpreted as >0 = 1 bit, <0 = 0 bit.
 *
 * The functions sum to zero so there is no need to adjust for the DC offset
 * of the input signal (slice_phase2 is the slightly unbalanced exception).
 */
pub mod score;

use crate::decode::icao::IcaoFilter;
use crate::decode::MODES_LONG_MSG_BYTES;
use score::{address_of, frame_bits, Scorer};
use tracing::trace;

/// The preamble is 8 µs, i.e. 19.2 samples at 2.4 MHz
pub const PREAMBLE_SAMPLES: usize = 19;

/// Room needed past a candidate preamble start to slice a full long
/// frame; buffer sources carry this much overlap between buffers
pub const FRAME_WINDOW: usize =
    PREAMBLE_SAMPLES + 1 + MODES_LONG_MSG_BYTES * 20 + 4;

const PREAMBLE_THRESHOLD_DEFAULT: i32 = 75;

/// One buffer of 16-bit magnitude samples at 2.4 Msps, stamped with the
/// 12 MHz sample clock and the wall clock at its first sample.
pub struct MagnitudeBuffer {
    pub data: Vec<u16>,
    /// 12 MHz counter at the first sample
    pub sample_timestamp: u64,
    /// wall clock at the first sample, seconds since the epoch
    pub system_timestamp: f64,
    /// mean magnitude over the buffer, as a fraction of full scale
    pub mean_level: f64,
    /// mean squared magnitude over the buffer, as a fraction of full scale
    pub mean_power: f64,
}

impl MagnitudeBuffer {
    pub fn new(
        data: Vec<u16>,
        sample_timestamp: u64,
        system_timestamp: f64,
    ) -> Self {
        let mut sum_level = 0.0_f64;
        let mut sum_power = 0.0_f64;
        for &s in &data {
            let f = f64::from(s) / 65535.0;
            sum_level += f;
            sum_power += f * f;
        }
        let n = data.len().max(1) as f64;
        MagnitudeBuffer {
            data,
            sample_timestamp,
            system_timestamp,
            mean_level: sum_level / n,
            mean_power: sum_power / n,
        }
    }
}

/// Precomputed I/Q to magnitude lookup, 8-bit unsigned pairs in, u16 out.
pub struct MagnitudeTable {
    table: Vec<u16>,
}

impl MagnitudeTable {
    pub fn new() -> Self {
        let mut table = vec![0u16; 256 * 256];
        for i in 0..256usize {
            for q in 0..256usize {
                let fi = (i as f64 - 127.5) / 127.5;
                let fq = (q as f64 - 127.5) / 127.5;
                let mag = libm::sqrt(fi * fi + fq * fq) * 65535.0
                    / std::f64::consts::SQRT_2;
                table[(i << 8) | q] = libm::round(mag) as u16;
            }
        }
        MagnitudeTable { table }
    }

    #[inline]
    pub fn magnitude(&self, i: u8, q: u8) -> u16 {
        self.table[(usize::from(i) << 8) | usize::from(q)]
    }

    /// Convert a buffer of interleaved I/Q bytes to magnitudes
    pub fn compute(&self, iq: &[u8]) -> Vec<u16> {
        iq.chunks_exact(2)
            .map(|pair| self.magnitude(pair[0], pair[1]))
            .collect()
    }
}

impl Default for MagnitudeTable {
    fn default() -> Self {
        Self::new()
    }
}

#[inline]
fn slice_phase0(m: &[u16]) -> i32 {
    18 * i32::from(m[0]) - 15 * i32::from(m[1]) - 3 * i32::from(m[2])
}

#[inline]
fn slice_phase1(m: &[u16]) -> i32 {
    14 * i32::from(m[0]) - 5 * i32::from(m[1]) - 9 * i32::from(m[2])
}

// Slightly DC unbalanced but better results
#[inline]
fn slice_phase2(m: &[u16]) -> i32 {
    16 * i32::from(m[0]) + 5 * i32::from(m[1]) - 20 * i32::from(m[2])
}

#[inline]
fn slice_phase3(m: &[u16]) -> i32 {
    7 * i32::from(m[0]) + 11 * i32::from(m[1]) - 18 * i32::from(m[2])
}

#[inline]
fn slice_phase4(m: &[u16]) -> i32 {
    4 * i32::from(m[0]) + 15 * i32::from(m[1]) - 20 * i32::from(m[2])
        + i32::from(m[3])
}

/// Extract one byte from the magnitude samples, advancing the cursor and
/// the phase. Each step consumes 19 samples except the 4 -> 0 wraparound
/// which consumes 20; these exact counts keep byte boundaries aligned.
fn slice_byte(m: &[u16], ptr: &mut usize, phase: &mut usize) -> u8 {
    let p = *ptr;
    let the_byte = match *phase {
        0 => {
            let b = (u8::from(slice_phase0(&m[p..]) > 0) << 7)
                | (u8::from(slice_phase2(&m[p + 2..]) > 0) << 6)
                | (u8::from(slice_phase4(&m[p + 4..]) > 0) << 5)
                | (u8::from(slice_phase1(&m[p + 7..]) > 0) << 4)
                | (u8::from(slice_phase3(&m[p + 9..]) > 0) << 3)
                | (u8::from(slice_phase0(&m[p + 12..]) > 0) << 2)
                | (u8::from(slice_phase2(&m[p + 14..]) > 0) << 1)
                | u8::from(slice_phase4(&m[p + 16..]) > 0);
            *phase = 1;
            *ptr += 19;
            b
        }
        1 => {
            let b = (u8::from(slice_phase1(&m[p..]) > 0) << 7)
                | (u8::from(slice_phase3(&m[p + 2..]) > 0) << 6)
                | (u8::from(slice_phase0(&m[p + 5..]) > 0) << 5)
                | (u8::from(slice_phase2(&m[p + 7..]) > 0) << 4)
                | (u8::from(slice_phase4(&m[p + 9..]) > 0) << 3)
                | (u8::from(slice_phase1(&m[p + 12..]) > 0) << 2)
                | (u8::from(slice_phase3(&m[p + 14..]) > 0) << 1)
                | u8::from(slice_phase0(&m[p + 17..]) > 0);
            *phase = 2;
            *ptr += 19;
            b
        }
        2 => {
            let b = (u8::from(slice_phase2(&m[p..]) > 0) << 7)
                | (u8::from(slice_phase4(&m[p + 2..]) > 0) << 6)
                | (u8::from(slice_phase1(&m[p + 5..]) > 0) << 5)
                | (u8::from(slice_phase3(&m[p + 7..]) > 0) << 4)
                | (u8::from(slice_phase0(&m[p + 10..]) > 0) << 3)
                | (u8::from(slice_phase2(&m[p + 12..]) > 0) << 2)
                | (u8::from(slice_phase4(&m[p + 14..]) > 0) << 1)
                | u8::from(slice_phase1(&m[p + 17..]) > 0);
            *phase = 3;
            *ptr += 19;
            b
        }
        3 => {
            let b = (u8::from(slice_phase3(&m[p..]) > 0) << 7)
                | (u8::from(slice_phase0(&m[p + 3..]) > 0) << 6)
                | (u8::from(slice_phase2(&m[p + 5..]) > 0) << 5)
                | (u8::from(slice_phase4(&m[p + 7..]) > 0) << 4)
                | (u8::from(slice_phase1(&m[p + 10..]) > 0) << 3)
                | (u8::from(slice_phase3(&m[p + 12..]) > 0) << 2)
                | (u8::from(slice_phase0(&m[p + 15..]) > 0) << 1)
                | u8::from(slice_phase2(&m[p + 17..]) > 0);
            *phase = 4;
            *ptr += 19;
            b
        }
        _ => {
            let b = (u8::from(slice_phase4(&m[p..]) > 0) << 7)
                | (u8::from(slice_phase1(&m[p + 3..]) > 0) << 6)
                | (u8::from(slice_phase3(&m[p + 5..]) > 0) << 5)
                | (u8::from(slice_phase0(&m[p + 8..]) > 0) << 4)
                | (u8::from(slice_phase2(&m[p + 10..]) > 0) << 3)
                | (u8::from(slice_phase4(&m[p + 12..]) > 0) << 2)
                | (u8::from(slice_phase1(&m[p + 15..]) > 0) << 1)
                | u8::from(slice_phase3(&m[p + 17..]) > 0);
            *phase = 0;
            *ptr += 20;
            b
        }
    };
    the_byte
}

/// Demodulator counters, merged into the shutdown report
#[derive(Debug, Default, Clone)]
pub struct DemodStats {
    pub preambles: u32,
    pub preamble_phase: [u32; 5],
    pub best_phase: [u32; 5],
    pub rejected_bad: u32,
    pub rejected_unknown_icao: u32,
    pub accepted: u32,
    pub accepted_corrected: u32,
    pub samples_processed: u64,
    pub samples_dropped: u64,
    pub noise_power_sum: f64,
    pub noise_power_count: u64,
    pub signal_power_sum: f64,
    pub signal_power_count: u64,
    pub peak_signal_power: f64,
    pub strong_signal_count: u32,
}

/// One accepted frame, before any decoding
#[derive(Debug, Clone)]
pub struct DemodMessage {
    pub bytes: [u8; MODES_LONG_MSG_BYTES],
    pub byte_len: usize,
    pub score: i32,
    /// 12 MHz clock at the end of bit 56
    pub timestamp: u64,
    /// wall clock, seconds
    pub system_timestamp: f64,
    /// mean signal power over the message body, linear 0..1
    pub signal_level: f64,
    /// the winning try-phase, 4..=8
    pub phase: u8,
    pub corrected: bool,
}

#[derive(Debug, Clone)]
pub struct DemodConfig {
    pub preamble_threshold: i32,
    pub fix_df: bool,
    pub nfix_crc: u8,
}

impl Default for DemodConfig {
    fn default() -> Self {
        DemodConfig {
            preamble_threshold: PREAMBLE_THRESHOLD_DEFAULT,
            fix_df: false,
            nfix_crc: 0,
        }
    }
}

pub struct Demodulator {
    config: DemodConfig,
    scorer: Scorer,
    pub icao: IcaoFilter,
    pub stats: DemodStats,
}

struct Best {
    score: i32,
    phase: usize,
    buffer: usize,
    fix: Option<usize>,
}

impl Demodulator {
    pub fn new(config: DemodConfig) -> Self {
        let scorer = Scorer::new(config.fix_df, config.nfix_crc);
        Demodulator {
            config,
            scorer,
            icao: IcaoFilter::default(),
            stats: DemodStats::default(),
        }
    }

    /// Let the demodulator know the reader dropped samples; the preamble
    /// threshold is floored at its default from then on.
    pub fn note_dropped_samples(&mut self, n: u64) {
        self.stats.samples_dropped += n;
    }

    fn preamble_threshold(&self) -> i32 {
        if self.stats.samples_dropped > 0 {
            self.config
                .preamble_threshold
                .max(PREAMBLE_THRESHOLD_DEFAULT)
        } else {
            self.config.preamble_threshold
        }
    }

    /// Slice one message candidate at the given try-phase and keep it if it
    /// beats the current best score. The two buffers alternate so the best
    /// candidate survives while the next one is tried without copying.
    #[allow(clippy::too_many_arguments)]
    fn score_phase(
        &mut self,
        try_phase: usize,
        m: &[u16],
        pa: usize,
        buffers: &mut [[u8; MODES_LONG_MSG_BYTES]; 2],
        active: &mut usize,
        best: &mut Best,
    ) {
        self.stats.preamble_phase[try_phase - 4] += 1;

        let mut ptr = pa + PREAMBLE_SAMPLES + try_phase / 5;
        let mut phase = try_phase % 5;

        buffers[*active][0] = slice_byte(m, &mut ptr, &mut phase);

        // Inspect the DF field early, only continue slicing messages where
        // the DF appears valid
        let Some(byte_len) = self.scorer.frame_bytes(buffers[*active][0])
        else {
            if -2 > best.score {
                // only so the preamble counts as detected
                best.score = -2;
            }
            return;
        };

        for i in 1..byte_len {
            buffers[*active][i] = slice_byte(m, &mut ptr, &mut phase);
        }

        let (score, fix) =
            self.scorer
                .score(&buffers[*active], byte_len * 8, &self.icao);
        if score > best.score {
            *best = Best {
                score,
                phase: try_phase,
                buffer: *active,
                fix,
            };
            // swap to the other buffer so the winning bytes are not
            // clobbered by the next attempt
            *active ^= 1;
        }
    }

    /// Search one magnitude buffer for Mode S messages.
    pub fn demodulate(&mut self, mag: &MagnitudeBuffer) -> Vec<DemodMessage> {
        let m = &mag.data;
        let mut out = Vec::new();

        if m.len() < PREAMBLE_SAMPLES {
            // shorter than one preamble window: nothing to consume
            return out;
        }

        let mut buffers = [[0u8; MODES_LONG_MSG_BYTES]; 2];
        let mut active = 0usize;
        let mut sum_scaled_signal_power = 0u64;

        self.icao.age(mag.system_timestamp);

        let threshold = self.preamble_threshold();

        let mut pa = 0usize;
        while pa + FRAME_WINDOW < m.len() {
            // A cheap pre-check against the preamble shape cuts most of
            // the CPU spent here.
            //
            // Ideal sample values for preambles with different phases,
            // Xn being the first data symbol with phase offset N:
            //
            // sample#: 0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0
            // phase 3: 2/4\0/5\1 0 0 0 0/5\1/3 3\0 0 0 0 0 0 X4
            // phase 4: 1/5\0/4\2 0 0 0 0/4\2 2/4\0 0 0 0 0 0 0 X0
            // phase 5: 0/5\1/3 3\0 0 0 0/3 3\1/5\0 0 0 0 0 0 0 X1
            // phase 6: 0/4\2 2/4\0 0 0 0 2/4\0/5\1 0 0 0 0 0 0 X2
            // phase 7: 0/3 3\1/5\0 0 0 0 1/5\0/4\2 0 0 0 0 0 0 X3
            if !(m[pa + 1] > m[pa + 7]
                && m[pa + 12] > m[pa + 14]
                && m[pa + 12] > m[pa + 15])
            {
                pa += 1;
                continue;
            }

            // 5 gaps known to be quiet whatever the phase
            let base_noise = i32::from(m[pa + 5])
                + i32::from(m[pa + 8])
                + i32::from(m[pa + 16])
                + i32::from(m[pa + 17])
                + i32::from(m[pa + 18]);

            let ref_level = (base_noise * threshold) >> 5;

            let mut best = Best {
                score: -42,
                phase: 0,
                buffer: 0,
                fix: None,
            };

            let diff_2_3 = i32::from(m[pa + 2]) - i32::from(m[pa + 3]);
            let sum_1_4 = i32::from(m[pa + 1]) + i32::from(m[pa + 4]);
            let diff_10_11 = i32::from(m[pa + 10]) - i32::from(m[pa + 11]);
            let common3456 =
                sum_1_4 - diff_2_3 + i32::from(m[pa + 9]) + i32::from(m[pa + 12]);

            // peaks at 1,3,9,11-12 and 1,3,9,12: phases 3 and 4
            if common3456 - diff_10_11 >= ref_level {
                self.score_phase(4, m, pa, &mut buffers, &mut active, &mut best);
                self.score_phase(5, m, pa, &mut buffers, &mut active, &mut best);
            }

            // peaks at 1,3-4,9-10,12 and 1,4,10,12: phases 5 and 6
            if common3456 + diff_10_11 >= ref_level {
                self.score_phase(6, m, pa, &mut buffers, &mut active, &mut best);
                self.score_phase(7, m, pa, &mut buffers, &mut active, &mut best);
            }

            // peaks at 1-2,4,10,12: phase 7
            if sum_1_4 + 2 * diff_2_3 + diff_10_11 + i32::from(m[pa + 12])
                >= ref_level
            {
                self.score_phase(8, m, pa, &mut buffers, &mut active, &mut best);
            }

            // no preamble detected
            if best.score == -42 {
                pa += 1;
                continue;
            }

            self.stats.preambles += 1;

            if best.score < 0 {
                if best.score == -1 {
                    self.stats.rejected_unknown_icao += 1;
                } else {
                    self.stats.rejected_bad += 1;
                }
                pa += 1;
                continue;
            }

            let bytes = &mut buffers[best.buffer];
            if let Some(bit) = best.fix {
                bytes[bit / 8] ^= 0x80 >> (bit % 8);
                self.stats.accepted_corrected += 1;
            } else {
                self.stats.accepted += 1;
            }
            self.stats.best_phase[best.phase - 4] += 1;

            let msg_bits = frame_bits(bytes[0]);
            let byte_len = msg_bits / 8;

            // For consistency with how the Beast / Radarcape does it, the
            // timestamp is reported at the end of bit 56 even for a
            // 112-bit frame
            let timestamp = mag.sample_timestamp
                + (pa as u64) * 5
                + (8 + 56) * 12
                + best.phase as u64;
            let system_timestamp = mag.system_timestamp
                + (timestamp - mag.sample_timestamp) as f64 / 12e6;

            // CRC-verified frames announce an address worth remembering
            let df = bytes[0] >> 3;
            if df == 11 || df == 17 || df == 18 {
                self.icao.insert(address_of(bytes));
            }

            // measure signal power over the message body
            let signal_len = msg_bits * 12 / 5;
            let mut scaled_signal_power = 0u64;
            for k in 0..signal_len {
                let sample = u64::from(m[pa + PREAMBLE_SAMPLES + k]);
                scaled_signal_power += sample * sample;
            }
            let signal_power =
                scaled_signal_power as f64 / 65535.0 / 65535.0;
            let signal_level = signal_power / signal_len as f64;
            self.stats.signal_power_sum += signal_power;
            self.stats.signal_power_count += signal_len as u64;
            sum_scaled_signal_power += scaled_signal_power;

            if signal_level > self.stats.peak_signal_power {
                self.stats.peak_signal_power = signal_level;
            }
            if signal_level > 0.50119 {
                // signal power above -3 dBFS
                self.stats.strong_signal_count += 1;
            }

            trace!(
                "accepted DF{df} at phase {} with score {}",
                best.phase,
                best.score
            );

            out.push(DemodMessage {
                bytes: *bytes,
                byte_len,
                score: best.score,
                timestamp,
                system_timestamp,
                signal_level,
                phase: best.phase as u8,
                corrected: best.fix.is_some(),
            });

            // Skip ahead, but deliberately short of the full frame so the
            // preamble detector can still catch a near-colliding follower
            pa += msg_bits * 8 / 4;
            pa += 1;
        }

        self.stats.samples_processed += m.len() as u64;

        // update the noise floor estimate with everything that was not
        // signal in this buffer
        let sum_signal_power =
            sum_scaled_signal_power as f64 / 65535.0 / 65535.0;
        self.stats.noise_power_sum +=
            mag.mean_power * m.len() as f64 - sum_signal_power;
        self.stats.noise_power_count += m.len() as u64;

        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hexlit::hex;

    const FRAME: [u8; 14] = hex!("8D40058B58C901375147EFD09357");

    /// Synthesize 2.4 Msps magnitudes for one frame whose preamble starts
    /// at the given 12 MHz unit offset, over a deterministic noise floor.
    fn synthesize(frame: &[u8], start_unit: usize, samples: usize) -> Vec<u16> {
        const AMP: u32 = 600;
        let mut units = vec![0u32; samples * 5 + 50];

        // deterministic noise floor
        let mut state: u64 = 0x2a;
        for u in units.iter_mut() {
            state = (state.wrapping_mul(1_103_515_245) + 12_345) & 0x7fff_ffff;
            *u = ((state >> 16) % 40) as u32;
        }

        let mut pulse = |sym: usize| {
            for u in 0..6 {
                let pos = start_unit + sym * 6 + u;
                if pos < units.len() {
                    units[pos] = AMP;
                }
            }
        };

        // preamble pulses at symbols 0, 2, 7 and 9
        for sym in [0, 2, 7, 9] {
            pulse(sym);
        }
        // data: one bit is two symbols, high-low for a 1, low-high for a 0
        for i in 0..frame.len() * 8 {
            let bit = (frame[i / 8] >> (7 - i % 8)) & 1;
            pulse(16 + 2 * i + usize::from(bit == 0));
        }

        (0..samples)
            .map(|k| (units[5 * k..5 * k + 5].iter().sum::<u32>() / 5) as u16)
            .collect()
    }

    #[test]
    fn demodulates_clean_df17_at_phase_5() {
        // preamble aligned where the slicer locks at try-phase 5
        let data = synthesize(&FRAME, 100 * 5 + 6, 500);
        let mag = MagnitudeBuffer::new(data, 0, 0.);

        let mut demod = Demodulator::new(DemodConfig::default());
        let messages = demod.demodulate(&mag);

        assert_eq!(messages.len(), 1);
        let msg = &messages[0];
        assert_eq!(msg.bytes, FRAME);
        assert_eq!(msg.byte_len, 14);
        assert!(msg.score > 0);
        assert_eq!(msg.phase, 5);
        assert_eq!(demod.stats.accepted, 1);

        // end of bit 56: buffer clock + 5 units per sample + preamble and
        // 56 bits at 12 units each, plus the phase offset
        assert_eq!(msg.timestamp, 100 * 5 + (8 + 56) * 12 + 5);
        assert_eq!(
            (msg.timestamp - (8 + 56) * 12 - u64::from(msg.phase)) % 5,
            0
        );
    }

    #[test]
    fn short_buffer_produces_nothing() {
        let mag = MagnitudeBuffer::new(vec![0u16; 12], 0, 0.);
        let mut demod = Demodulator::new(DemodConfig::default());
        assert!(demod.demodulate(&mag).is_empty());
        assert_eq!(demod.stats.samples_processed, 0);
    }

    #[test]
    fn noise_only_buffer_produces_nothing() {
        let mut state: u64 = 0x5057;
        let data: Vec<u16> = (0..2400)
            .map(|_| {
                state =
                    (state.wrapping_mul(1_103_515_245) + 12_345) & 0x7fff_ffff;
                ((state >> 16) % 40) as u16
            })
            .collect();
        let mag = MagnitudeBuffer::new(data, 0, 0.);
        let mut demod = Demodulator::new(DemodConfig::default());
        assert!(demod.demodulate(&mag).is_empty());
        assert_eq!(demod.stats.accepted, 0);
        assert_eq!(demod.stats.samples_processed, 2400);
    }

    #[test]
    fn magnitude_table_scales_to_full_range() {
        let table = MagnitudeTable::new();
        assert!(table.magnitude(127, 127) < 512);
        assert!(table.magnitude(255, 255) > 60000);
        let mags = table.compute(&[127, 127, 255, 127]);
        assert_eq!(mags.len(), 2);
        assert!(mags[0] < mags[1]);
    }
}
