use crate::decode::cpr::CPRFormat;
use crate::decode::{gray_to_altitude, squawk_from_id13};
use deku::bitvec::{BitSlice, Msb0};
use deku::prelude::*;
use serde::Serialize;

/**
 * ## Airborne Position (BDS 0,5)
 *
 * with barometric altitude (TC=9..=18) or geometric height (TC=20..=22)
 *
 * | TC | SS | SAF | ALT | T | F | LAT-CPR | LON-CPR |
 * | -- | -- | --- | --- | - | - | ------- | ------- |
 * | 5  | 2  |  1  | 12  | 1 | 1 |   17    |   17    |
 */
#[derive(Debug, PartialEq, Serialize, DekuRead, Copy, Clone)]
pub struct AirbornePosition {
    #[deku(bits = "5")]
    #[serde(skip)]
    /// The typecode value (between 9 and 18 or between 20 and 22)
    pub tc: u8,

    #[serde(skip)]
    /// The surveillance status
    pub ss: SurveillanceStatus,

    #[deku(bits = "1")]
    #[serde(skip)]
    /// Single Antenna Flag in ADS-B v0 or v1,
    /// NIC supplement-b in ADS-B v2
    pub saf: u8,

    #[deku(reader = "decode_ac12(deku::rest)")]
    #[serde(rename = "altitude")]
    /// The altitude in feet, None if unavailable
    pub alt: Option<u16>,

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

/// Decode the altitude value encoded on 12 bits
fn decode_ac12(
    rest: &BitSlice<u8, Msb0>,
) -> Result<(&BitSlice<u8, Msb0>, Option<u16>), DekuError> {
    let (rest, num) =
        u16::read(rest, (deku::ctx::Endian::Big, deku::ctx::BitSize(12)))?;

    let q = num & 0x10;

    if q > 0 {
        let n = ((num & 0x0fe0) >> 1) | (num & 0x000f);
        let n = n * 25;
        if n > 1000 {
            Ok((rest, Some(n - 1000)))
        } else {
            Ok((rest, None))
        }
    } else {
        let mut n = ((num & 0x0fc0) << 1) | (num & 0x003f);
        n = squawk_from_id13(n);
        if let Ok(n) = gray_to_altitude(n) {
            Ok((rest, u16::try_from(n * 100).ok()))
        } else {
            Ok((rest, None))
        }
    }
}

#[derive(Debug, PartialEq, Eq, DekuRead, Copy, Clone)]
#[deku(type = "u8", bits = "2")]
pub enum SurveillanceStatus {
    NoCondition = 0,
    PermanentAlert = 1,
    TemporaryAlert = 2,
    SPICondition = 3,
}

#[cfg(test)]
mod tests {
    use crate::prelude::*;
    use hexlit::hex;

    #[test]
    fn test_airborne_position() {
        let bytes = hex!("8D40058B58C901375147EFD09357");
        let msg = Message::from_bytes((&bytes, 0)).unwrap().1;
        if let ExtendedSquitterADSB(adsb) = msg.df {
            if let ME::BDS05(me) = adsb.message {
                assert_eq!(me.alt, Some(39000));
                assert_eq!(me.parity, crate::decode::cpr::CPRFormat::Even);
                return;
            }
        }
        unreachable!();
    }

    #[test]
    fn test_json_fields() {
        let bytes = hex!("8D40058B58C901375147EFD09357");
        let msg = Message::from_bytes((&bytes, 0)).unwrap().1;
        let json = serde_json::to_value(&msg).unwrap();
        assert_eq!(json["icao24"], "40058b");
        assert_eq!(json["altitude"], 39000);
        assert_eq!(json["BDS"], "0,5");
    }
}
