use crate::decode::cpr::CPRFormat;
use deku::bitvec::{BitSlice, Msb0};
use deku::prelude::*;
use serde::Serialize;

/**
 * ## Surface Position (BDS 0,6)
 *
 * Extended squitter message carrying the position of aircraft on the ground.
 * Instead of an altitude, the message encodes ground speed and track angle.
 *
 * | TC  | MOV | S   | TRK | T   | F   | LAT-CPR | LON-CPR |
 * | --- | --- | --- | --- | --- | --- | ------- | ------- |
 * | 5   | 7   | 1   | 7   | 1   | 1   | 17      | 17      |
 */
#[derive(Debug, PartialEq, Serialize, DekuRead, Copy, Clone)]
pub struct SurfacePosition {
    #[deku(bits = "5")]
    #[serde(skip)]
    /// The typecode value (between 5 and 8)
    pub tc: u8,

    #[deku(reader = "read_groundspeed(deku::rest)")]
    /// Ground speed decoded from the 7-bit movement field, non-linear
    /// encoding with finer steps at taxi speeds. None when the field
    /// carries no information (0) or a reserved value (125..=127).
    pub groundspeed: Option<f64>,

    #[deku(bits = "1")]
    #[serde(skip)]
    /// Validity of the ground track angle
    pub track_status: bool,

    #[deku(
        bits = "7",
        map = "|value: u8| -> Result<_, DekuError> {
            if *track_status {
                Ok(Some(value as f64 * 360. / 128.))
            } else {
                Ok(None)
            }
        }"
    )]
    /// Ground track angle, clockwise from true north, LSB 360/128 degrees.
    /// None when the status bit marks it invalid.
    pub track: Option<f64>,

    #[deku(bits = "1")]
    #[serde(skip)]
    // UTC sync or not
    pub t: bool,

    pub parity: CPRFormat,

    #[deku(bits = "17", endian = "big")]
    pub lat_cpr: u32,

    #[deku(bits = "17", endian = "big")]
    pub lon_cpr: u32,

    #[deku(skip, default = "None")]
    #[serde(skip_serializing_if = "Option::is_none")]
    /// Latitude in decimal degrees, once decoded
    pub latitude: Option<f64>,

    #[deku(skip, default = "None")]
    #[serde(skip_serializing_if = "Option::is_none")]
    /// Longitude in decimal degrees, once decoded
    pub longitude: Option<f64>,
}

/// Decode the 7-bit movement field into a speed in knots.
///
/// | Code    | Meaning                          | Quantization |
/// |---------|----------------------------------|--------------|
/// | 0       | No information available         |              |
/// | 1       | Aircraft stopped                 | 0 kt         |
/// | 2-8     | [0.125, 1.0) kt                  | 0.125 kt     |
/// | 9-12    | [1.0, 2.0) kt                    | 0.25 kt      |
/// | 13-38   | [2.0, 15.0) kt                   | 0.5 kt       |
/// | 39-93   | [15.0, 70.0) kt                  | 1.0 kt       |
/// | 94-108  | [70.0, 100.0) kt                 | 2.0 kt       |
/// | 109-123 | [100.0, 175.0) kt                | 5.0 kt       |
/// | 124     | >= 175 kt                        |              |
/// | 125-127 | Reserved                         |              |
fn read_groundspeed(
    rest: &BitSlice<u8, Msb0>,
) -> Result<(&BitSlice<u8, Msb0>, Option<f64>), DekuError> {
    let (rest, mov) =
        u8::read(rest, (deku::ctx::Endian::Big, deku::ctx::BitSize(7)))?;
    let value = match mov {
        0 => None,
        1 => Some(0.),
        2..=8 => Some(0.125 + (mov - 2) as f64 * 0.125),
        9..=12 => Some(1. + (mov - 9) as f64 * 0.25),
        13..=38 => Some(2. + (mov - 13) as f64 * 0.5),
        39..=93 => Some(15. + (mov - 39) as f64 * 1.),
        94..=108 => Some(70. + (mov - 94) as f64 * 2.),
        109..=123 => Some(100. + (mov - 109) as f64 * 5.),
        124 => Some(175.),
        125..=u8::MAX => None, // Reserved
    };
    Ok((rest, value))
}

#[cfg(test)]
mod tests {
    use crate::prelude::*;
    use hexlit::hex;

    #[test]
    fn test_surface_position() {
        let bytes = hex!("8c4841753a9a153237aef0f275be");
        let (_, msg) = Message::from_bytes((&bytes, 0)).unwrap();
        if let ExtendedSquitterADSB(adsb_msg) = msg.df {
            if let ME::BDS06(SurfacePosition {
                track, groundspeed, ..
            }) = adsb_msg.message
            {
                assert_eq!(track, Some(92.8125));
                assert_eq!(groundspeed, Some(17.));
                return;
            }
        }
        unreachable!();
    }

    #[test]
    fn test_movement_no_info() {
        // movement code 0: no information available
        let bytes = hex!("8c3944f8400002acb23cda192b95");
        let (_, msg) = Message::from_bytes((&bytes, 0)).unwrap();
        if let ExtendedSquitterADSB(adsb_msg) = msg.df {
            if let ME::BDS06(SurfacePosition { groundspeed, .. }) =
                adsb_msg.message
            {
                assert_eq!(groundspeed, None);
                return;
            }
        }
        unreachable!();
    }
}
