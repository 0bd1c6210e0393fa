/*!
 * Raw Beast-like text framing: one `*<hex>;` record per frame, 14 hex
 * characters for a short frame and 28 for a long one.
 */

/// Accumulates stream bytes and yields complete frame payloads. A client
/// closing mid-frame simply drops the accumulator with the partial record.
#[derive(Default)]
pub struct RawFramer {
    acc: Vec<u8>,
    pub good: u64,
    pub empty: u64,
    pub unrecognized: u64,
}

impl RawFramer {
    /// Feed stream bytes, collect every complete frame found so far.
    pub fn push(&mut self, data: &[u8]) -> Vec<Vec<u8>> {
        self.acc.extend_from_slice(data);
        let mut frames = Vec::new();

        loop {
            // drop noise up to the next start-of-record
            let Some(start) = self.acc.iter().position(|&b| b == b'*') else {
                self.acc.clear();
                break;
            };
            if start > 0 {
                self.acc.drain(..start);
            }
            // wait for the end-of-record separator
            let Some(end) = self.acc.iter().position(|&b| b == b';') else {
                break;
            };

            let record = &self.acc[1..end];
            match record.len() {
                0 => self.empty += 1,
                14 | 28 => match hex::decode(record) {
                    Ok(bytes) => {
                        self.good += 1;
                        frames.push(bytes);
                    }
                    Err(_) => self.unrecognized += 1,
                },
                _ => self.unrecognized += 1,
            }
            self.acc.drain(..=end);
        }

        frames
    }
}

/// One output record per accepted message
pub fn encode_frame(bytes: &[u8]) -> String {
    format!("*{};\n", hex::encode(bytes))
}

#[cfg(test)]
mod tests {
    use super::*;
    use hexlit::hex;

    #[test]
    fn round_trip() {
        let frame = hex!("8d4840d6202cc371c32ce0576098");
        let line = encode_frame(&frame);
        assert_eq!(line, "*8d4840d6202cc371c32ce0576098;\n");

        let mut framer = RawFramer::default();
        let frames = framer.push(line.as_bytes());
        assert_eq!(frames, vec![frame.to_vec()]);
        assert_eq!(framer.good, 1);
    }

    #[test]
    fn reassembles_split_records() {
        let mut framer = RawFramer::default();
        assert!(framer.push(b"*8d4840d620").is_empty());
        let frames = framer.push(b"2cc371c32ce0576098;\n*5d48");
        assert_eq!(frames.len(), 1);
        let frames = framer.push(b"40d6a6d3f9;\n");
        assert_eq!(frames, vec![hex!("5d4840d6a6d3f9").to_vec()]);
        assert_eq!(framer.good, 2);
    }

    #[test]
    fn skips_noise_and_counts_junk() {
        let mut framer = RawFramer::default();
        let frames =
            framer.push(b"noise*zz;*;*8d4840d6202cc371c32ce0576098;\n");
        assert_eq!(frames.len(), 1);
        assert_eq!(framer.good, 1);
        assert_eq!(framer.empty, 1);
        assert_eq!(framer.unrecognized, 1);
    }
}
