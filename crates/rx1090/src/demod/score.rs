use crate::decode::crc::{modes_checksum, SyndromeTable};
use crate::decode::icao::IcaoFilter;
use crate::decode::{
    message_len_by_type, MODES_LONG_MSG_BYTES, MODES_SHORT_MSG_BYTES,
};

/**
 * Score a demodulated Mode S frame before any real decoding happens.
 *
 * The verdict of [`Scorer::score`]:
 *  - `>= 0`: a candidate, higher is better;
 *  - `-1`: plausible frame whose address/parity residue matches no
 *    recently seen aircraft;
 *  - `-2`: bad CRC or an unusable downlink format.
 *
 * Frames whose CRC vouches for them (DF11 with II=0, DF17/18) score the
 * highest; surveillance replies only score when their overlaid address is
 * already known.
 */
pub struct Scorer {
    valid_df_short: u32,
    valid_df_long: u32,
    syndromes: SyndromeTable,
    nfix_crc: u8,
}

fn generate_damage_set(df: u8, damage_bits: u32) -> u32 {
    let mut result = 1 << df;
    if damage_bits == 0 {
        return result;
    }

    for bit in 0..5 {
        let damaged_df = df ^ (1 << bit);
        result |= generate_damage_set(damaged_df, damage_bits - 1);
    }

    result
}

impl Scorer {
    /// The damage set is only generated when both CRC repair and DF repair
    /// are enabled; a one-bit error in the DF field of a DF17 frame can
    /// then still reach the CRC check.
    pub fn new(fix_df: bool, nfix_crc: u8) -> Self {
        // DFs that we directly understand without correction
        let valid_df_short = (1 << 0) | (1 << 4) | (1 << 5) | (1 << 11);
        let mut valid_df_long =
            (1 << 16) | (1 << 17) | (1 << 18) | (1 << 20) | (1 << 21);

        if fix_df && nfix_crc > 0 {
            // only correct towards DF17, other types are less useful
            valid_df_long |= generate_damage_set(17, 1);
        }

        Scorer {
            valid_df_short,
            valid_df_long,
            syndromes: SyndromeTable::new(MODES_LONG_MSG_BYTES * 8),
            nfix_crc,
        }
    }

    /// Message length in bytes implied by the first demodulated byte, or
    /// None when the DF can neither be used directly nor repaired.
    pub fn frame_bytes(&self, first_byte: u8) -> Option<usize> {
        let df = u32::from(first_byte >> 3);
        if self.valid_df_long & (1 << df) != 0 {
            Some(MODES_LONG_MSG_BYTES)
        } else if self.valid_df_short & (1 << df) != 0 {
            Some(MODES_SHORT_MSG_BYTES)
        } else {
            None
        }
    }

    /// Score a sliced frame. The second value names the bit to flip when
    /// the score was only reachable through a single-bit repair.
    pub fn score(
        &self,
        msg: &[u8],
        bits: usize,
        icao: &IcaoFilter,
    ) -> (i32, Option<usize>) {
        let df = msg[0] >> 3;
        let crc = match modes_checksum(msg, bits) {
            Ok(crc) => crc,
            Err(_) => return (-2, None),
        };

        match df {
            0 | 4 | 5 | 16 => {
                // The residue is the address: only known aircraft count
                if icao.contains(crc) {
                    (1000, None)
                } else {
                    (-1, None)
                }
            }
            11 => {
                let addr = address_of(msg);
                if crc == 0 {
                    // All-call reply with II=0, CRC-verified
                    (1600, None)
                } else if crc & 0xFF_FF80 == 0 {
                    // Non-zero interrogator identifier in the low bits
                    if icao.contains(addr) {
                        (1000, None)
                    } else {
                        (-1, None)
                    }
                } else {
                    (-2, None)
                }
            }
            17 | 18 => {
                if crc == 0 {
                    return (1800, None);
                }
                if self.nfix_crc > 0 {
                    if let Some(bit) = self.syndromes.error_bit(crc) {
                        let mut repaired = [0u8; MODES_LONG_MSG_BYTES];
                        repaired.copy_from_slice(&msg[..MODES_LONG_MSG_BYTES]);
                        repaired[bit / 8] ^= 0x80 >> (bit % 8);
                        // Do not trust a repaired frame from an aircraft
                        // never heard of
                        if icao.contains(address_of(&repaired)) {
                            return (1400, Some(bit));
                        }
                        return (-1, None);
                    }
                }
                (-2, None)
            }
            20 | 21 => {
                if icao.contains(crc) {
                    (1000, None)
                } else {
                    (-1, None)
                }
            }
            _ => (-2, None),
        }
    }
}

/// The announced address carried in bytes 1..4 (DF11, DF17, DF18)
pub fn address_of(msg: &[u8]) -> u32 {
    (u32::from(msg[1]) << 16) | (u32::from(msg[2]) << 8) | u32::from(msg[3])
}

pub fn frame_bits(first_byte: u8) -> usize {
    message_len_by_type(first_byte >> 3)
}

#[cfg(test)]
mod tests {
    use super::*;
    use hexlit::hex;

    #[test]
    fn df17_with_valid_crc_scores_best() {
        let scorer = Scorer::new(false, 0);
        let icao = IcaoFilter::default();
        let bytes = hex!("8d406b902015a678d4d220aa4bda");
        let (score, fix) = scorer.score(&bytes, 112, &icao);
        assert_eq!(score, 1800);
        assert_eq!(fix, None);
    }

    #[test]
    fn surveillance_reply_needs_a_known_address() {
        let scorer = Scorer::new(false, 0);
        let mut icao = IcaoFilter::default();
        let bytes = hex!("28001a00e1d6ff"); // DF5 from 4d0131
        let (score, _) = scorer.score(&bytes, 56, &icao);
        assert_eq!(score, -1);

        icao.insert(0x4d0131);
        let (score, _) = scorer.score(&bytes, 56, &icao);
        assert_eq!(score, 1000);
    }

    #[test]
    fn single_bit_repair_when_enabled() {
        let scorer = Scorer::new(true, 1);
        let mut icao = IcaoFilter::default();
        let mut bytes = hex!("8d406b902015a678d4d220aa4bda");
        bytes[7] ^= 0x01;

        // a repaired frame is only trusted for a known aircraft
        let (score, _) = scorer.score(&bytes, 112, &icao);
        assert_eq!(score, -1);

        icao.insert(0x406b90);
        let (score, fix) = scorer.score(&bytes, 112, &icao);
        assert_eq!(score, 1400);
        assert_eq!(fix, Some(63));

        let strict = Scorer::new(false, 0);
        let (score, fix) = strict.score(&bytes, 112, &icao);
        assert_eq!(score, -2);
        assert_eq!(fix, None);
    }

    #[test]
    fn damage_set_honours_the_flag() {
        let strict = Scorer::new(false, 0);
        // 0x8d ^ a flipped top bit: DF 19 is not acceptable without repair
        assert_eq!(strict.frame_bytes(19 << 3), None);

        let lenient = Scorer::new(true, 1);
        // 19 = 17 ^ (1 << 1) is one bit away from DF17
        assert_eq!(lenient.frame_bytes(19 << 3), Some(14));
    }
}
