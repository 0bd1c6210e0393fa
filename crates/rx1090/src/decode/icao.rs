use std::collections::HashSet;

/**
 * A filter of recently seen ICAO addresses.
 *
 * Frames whose CRC confirms their content (DF11, DF17, DF18) announce an
 * address we can trust; the surveillance replies (DF0, 4, 5, 16, 20, 21)
 * only carry their address overlaid on the parity field, so the recovered
 * residue is worth something only if that address has been seen in a
 * trustworthy frame recently. The scorer consults this filter for exactly
 * that purpose.
 *
 * Ageing works with two epochs: inserts go to the current epoch, lookups
 * consult both, and a flip drops everything older than two periods.
 */
pub struct IcaoFilter {
    current: HashSet<u32>,
    previous: HashSet<u32>,
    flipped_at: f64,
    period: f64,
}

impl Default for IcaoFilter {
    fn default() -> Self {
        Self::new(60.)
    }
}

impl IcaoFilter {
    pub fn new(period: f64) -> Self {
        IcaoFilter {
            current: HashSet::new(),
            previous: HashSet::new(),
            flipped_at: 0.,
            period,
        }
    }

    pub fn insert(&mut self, addr: u32) {
        self.current.insert(addr);
    }

    pub fn contains(&self, addr: u32) -> bool {
        self.current.contains(&addr) || self.previous.contains(&addr)
    }

    /// Call periodically with the current time; entries older than two
    /// periods are dropped.
    pub fn age(&mut self, now: f64) {
        if now - self.flipped_at >= self.period {
            self.previous = std::mem::take(&mut self.current);
            self.flipped_at = now;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ages_out_after_two_periods() {
        let mut filter = IcaoFilter::new(60.);
        filter.age(0.);
        filter.insert(0x406b90);
        assert!(filter.contains(0x406b90));

        filter.age(61.);
        assert!(filter.contains(0x406b90));

        filter.age(122.);
        assert!(!filter.contains(0x406b90));
    }
}
