/*!
 * Mode S demodulation and decoding.
 *
 * The [`demod`] module turns 2.4 MHz magnitude sample buffers into scored
 * Mode S frames; the [`decode`] module turns frames into typed messages
 * (downlink formats, extended squitter payloads, CPR positions).
 */
pub mod decode;
pub mod demod;

pub mod prelude {
    /// This re-export is necessary to decode messages
    pub use deku::prelude::*;

    pub use crate::decode::adsb::{ADSB, ME};
    pub use crate::decode::bds::bds05::AirbornePosition;
    pub use crate::decode::bds::bds06::SurfacePosition;
    pub use crate::decode::bds::bds08::AircraftIdentification;
    pub use crate::decode::bds::bds09::AirborneVelocity;
    /// The root structure to decode messages
    pub use crate::decode::Message;
    pub use crate::decode::DF::*;
    pub use crate::decode::{cpr::Position, ICAO};

    pub use crate::demod::{Demodulator, MagnitudeBuffer};
}
