use deku::prelude::*;

/// The 25-bit Mode S generator polynomial.
const GENERATOR: u128 = 0x1FF_F409;

/**
 * Compute the CRC remainder over a full 56 or 112 bit Mode S frame.
 *
 * The 24-bit parity field is part of the division, so the remainder is 0
 * for an undamaged frame whose parity carries no address (DF11 with II=0,
 * DF17/18). For the AP downlink formats (DF0, 4, 5, 16, 20, 21) the
 * transponder overlays its address on the parity, and the remainder *is*
 * the 24-bit address announced by the frame.
 */
pub fn modes_checksum(message: &[u8], bits: usize) -> Result<u32, DekuError> {
    let n = bits / 8;
    if message.len() < n {
        return Err(DekuError::Incomplete(NeedSize::new(bits)));
    }

    let mut rem: u128 = 0;
    for &byte in &message[..n] {
        rem = (rem << 8) | u128::from(byte);
    }

    for i in (24..bits).rev() {
        if (rem >> i) & 1 == 1 {
            rem ^= GENERATOR << (i - 24);
        }
    }

    Ok((rem & 0xFF_FFFF) as u32)
}

/**
 * The syndromes a single flipped bit leaves in the CRC remainder.
 *
 * Indexed by bit position within a frame of `bits` length; looking up an
 * observed remainder tells which bit to flip to repair the frame. Only
 * meaningful for remainders produced by one bit error.
 */
pub struct SyndromeTable {
    bits: usize,
    syndromes: Vec<u32>,
}

impl SyndromeTable {
    pub fn new(bits: usize) -> Self {
        let syndromes = (0..bits)
            .map(|i| {
                let mut msg = [0u8; 14];
                msg[i / 8] = 0x80 >> (i % 8);
                modes_checksum(&msg, bits).unwrap_or(0)
            })
            .collect();
        SyndromeTable { bits, syndromes }
    }

    /// Which single bit flip explains this remainder, if any.
    pub fn error_bit(&self, remainder: u32) -> Option<usize> {
        self.syndromes.iter().position(|&s| s == remainder)
    }

    pub fn bits(&self) -> usize {
        self.bits
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hexlit::hex;

    #[test]
    fn remainder_is_zero_for_valid_adsb() {
        let bytes = hex!("8d406b902015a678d4d220aa4bda");
        assert_eq!(modes_checksum(&bytes, 112).unwrap(), 0);
        let bytes = hex!("8D40058B58C901375147EFD09357");
        assert_eq!(modes_checksum(&bytes, 112).unwrap(), 0);
    }

    #[test]
    fn remainder_is_nonzero_for_damaged_adsb() {
        let bytes = hex!("8d4ca251204994b1c36e60a5343d");
        assert_ne!(modes_checksum(&bytes, 112).unwrap(), 0);
    }

    #[test]
    fn syndrome_identifies_the_flipped_bit() {
        let mut bytes = hex!("8d406b902015a678d4d220aa4bda");
        bytes[3] ^= 0x10; // flip bit 27
        let rem = modes_checksum(&bytes, 112).unwrap();
        let table = SyndromeTable::new(112);
        assert_eq!(table.error_bit(rem), Some(27));
    }

    #[test]
    fn short_frame_remainder_is_the_address() {
        // DF5 identity reply from icao24 4d0131
        let bytes = hex!("28001a00e1d6ff");
        assert_eq!(modes_checksum(&bytes, 56).unwrap(), 0x4d0131);
    }
}
