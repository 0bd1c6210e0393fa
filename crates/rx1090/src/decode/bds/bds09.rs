use deku::bitvec::{BitSlice, Msb0};
use deku::prelude::*;
use serde::ser::SerializeStruct;
use serde::Serialize;

/**
 * ## Airborne Velocity (BDS 0,9)
 *
 * Airborne velocities are all transmitted with Type Code 19. Four different
 * subtypes are defined in bits 6-8 of the ME field. All subtypes share a
 * similar overall message structure.
 *
 * Subtypes 1 and 2 report ground speeds; subtypes 3 and 4 report true or
 * indicated airspeed, used when the position cannot be determined from the
 * GNSS system. Subtypes 2 and 4 are the supersonic variants with a speed
 * resolution of 4 kt instead of 1 kt.
 */
#[derive(Debug, PartialEq, Serialize, DekuRead, Clone)]
pub struct AirborneVelocity {
    #[deku(bits = "3")]
    #[serde(skip)]
    /// The subtype value
    pub subtype: u8,

    #[deku(bits = "1")]
    #[serde(skip)]
    /// The intent change flag
    pub intent_change: bool,

    #[deku(bits = "1")]
    #[serde(skip)]
    /// The IFR capability flag
    pub ifr_capability: bool,

    #[deku(bits = "3")]
    #[serde(rename = "NACv")]
    /// The Navigation Accuracy Category, velocity (NACv)
    pub nac_v: u8,

    #[deku(ctx = "*subtype")]
    #[serde(flatten)]
    /// Contains a ground or an air speed depending on the subtype
    pub velocity: AirborneVelocitySubType,

    /// The source for the vertical rate measurement
    #[serde(skip)]
    pub vrate_src: VerticalRateSource,

    #[serde(skip)]
    /// The sign of the vertical rate value
    pub vrate_sign: Sign,

    #[deku(
        endian = "big",
        bits = "9",
        map = "|v: u16| -> Result<_, DekuError> {
            if v == 0 { Ok(None) }
            else {
                Ok(Some(vrate_sign.value() * (v as i16 - 1) * 64))
            }
        }"
    )]
    #[serde(skip_serializing_if = "Option::is_none")]
    /// The vertical rate value in ft/mn, None if unavailable
    pub vertical_rate: Option<i16>,

    #[deku(bits = "2")]
    #[serde(skip)]
    pub reserved: u8,

    #[serde(skip)]
    /// The sign of the difference between GNSS height and barometric altitude
    pub gnss_sign: Sign,

    #[deku(reader = "read_geobaro(deku::rest, *gnss_sign)")]
    #[serde(skip_serializing_if = "Option::is_none")]
    /// The signed difference between GNSS height and barometric altitude
    pub geo_minus_baro: Option<i16>,
}

fn read_geobaro(
    rest: &BitSlice<u8, Msb0>,
    gnss_sign: Sign,
) -> Result<(&BitSlice<u8, Msb0>, Option<i16>), DekuError> {
    let (rest, value) =
        u8::read(rest, (deku::ctx::Endian::Big, deku::ctx::BitSize(7)))?;
    let value = if value > 1 {
        match gnss_sign {
            Sign::Positive => Some(25 * (value as i16 - 1)),
            Sign::Negative => Some(-25 * (value as i16 - 1)),
        }
    } else {
        None
    };
    Ok((rest, value))
}

#[derive(Debug, PartialEq, Serialize, DekuRead, Clone)]
#[deku(ctx = "subtype: u8", id = "subtype")]
#[serde(untagged)]
pub enum AirborneVelocitySubType {
    #[deku(id = "0")]
    Reserved0(#[deku(bits = "22")] u32),

    #[deku(id_pat = "1..=2")]
    GroundSpeedDecoding(GroundSpeedDecoding),

    #[deku(id = "3")]
    AirspeedSubsonic(AirspeedDecoding),

    #[deku(id = "4")]
    AirspeedSupersonic(AirspeedDecoding),

    #[deku(id_pat = "5..=7")]
    Reserved1(#[deku(bits = "22")] u32),
}

#[derive(Debug, PartialEq, DekuRead, Copy, Clone)]
#[deku(type = "u8", bits = "1")]
pub enum Sign {
    Positive = 0,
    Negative = 1,
}

impl Sign {
    #[must_use]
    pub fn value(&self) -> i16 {
        match self {
            Self::Positive => 1,
            Self::Negative => -1,
        }
    }
}

/// Subtypes 1 and 2 only differ by the speed quantum (1 kt, or 4 kt for
/// the supersonic variant nobody transmits); the quantum is left at 1 kt.
#[derive(Debug, PartialEq, Serialize, DekuRead, Copy, Clone)]
pub struct GroundSpeedDecoding {
    #[serde(skip)]
    pub ew_sign: Sign,

    #[deku(
        endian = "big",
        bits = "10",
        map = "|v: u16| -> Result<_, DekuError> {
            if v == 0 { Ok(None) }
            else {
                Ok(Some(f64::from((v as i16 - 1) * ew_sign.value())))
            }
        }"
    )]
    #[serde(skip)]
    /// The East-West velocity component in kts
    pub ew_vel: Option<f64>,

    #[serde(skip)]
    pub ns_sign: Sign,

    #[deku(
        endian = "big",
        bits = "10",
        map = "|v: u16| -> Result<_, DekuError> {
            if v == 0 { Ok(None) }
            else {
                Ok(Some(f64::from((v as i16 - 1) * ns_sign.value())))
            }
        }"
    )]
    #[serde(skip)]
    /// The North-South velocity component in kts
    pub ns_vel: Option<f64>,

    #[deku(
        skip,
        default = "match (ew_vel, ns_vel) {
            (Some(ew), Some(ns)) => Some(libm::hypot(*ew, *ns)),
            _ => None,
        }"
    )]
    #[serde(skip_serializing_if = "Option::is_none")]
    /// The ground speed in kts, computed from both components
    pub groundspeed: Option<f64>,

    #[deku(
        skip,
        default = "match (ew_vel, ns_vel) {
            (Some(ew), Some(ns)) => {
                let h = libm::atan2(*ew, *ns)
                    * (360.0 / (2.0 * std::f64::consts::PI));
                Some(if h < 0.0 { h + 360. } else { h })
            }
            _ => None,
        }"
    )]
    #[serde(skip_serializing_if = "Option::is_none")]
    /// The track angle in degrees, clockwise from true north
    pub track: Option<f64>,
}

#[derive(Debug, PartialEq, DekuRead, Copy, Clone)]
pub struct AirspeedDecoding {
    #[deku(bits = "1")]
    pub status_heading: bool,

    #[deku(
        endian = "big",
        bits = "10",
        map = "|val: u16| -> Result<_, DekuError> {
            if *status_heading {
                Ok(Some(val as f64 * 360. / 1024.))
            } else { Ok(None) }
        }"
    )]
    /// The magnetic heading in degrees, None if the status bit is unset
    pub heading: Option<f64>,

    pub airspeed_type: AirspeedType,

    #[deku(
        endian = "big",
        bits = "10",
        map = "|value: u16| -> Result<_, DekuError> {
            if value == 0 { return Ok(None) }
            Ok(Some(value - 1))
        }"
    )]
    /// The airspeed in kts, None if unavailable
    pub airspeed: Option<u16>,
}

impl Serialize for AirspeedDecoding {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::ser::Serializer,
    {
        let mut state = serializer.serialize_struct("Message", 2)?;
        if let Some(heading) = &self.heading {
            state.serialize_field("heading", heading)?;
        }
        if let Some(airspeed) = &self.airspeed {
            match &self.airspeed_type {
                AirspeedType::IAS => {
                    state.serialize_field("IAS", &airspeed)?;
                }
                AirspeedType::TAS => {
                    state.serialize_field("TAS", &airspeed)?;
                }
            }
        }
        state.end()
    }
}

#[derive(Debug, PartialEq, DekuRead, Copy, Clone)]
#[deku(type = "u8", bits = "1")]
#[allow(clippy::upper_case_acronyms)]
pub enum AirspeedType {
    IAS = 0,
    TAS = 1,
}

/// The source of the vertical rate value
#[derive(Debug, PartialEq, DekuRead, Copy, Clone)]
#[deku(type = "u8", bits = "1")]
pub enum VerticalRateSource {
    BarometricPressureAltitude = 0,
    GeometricAltitude = 1,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::prelude::*;
    use approx::assert_relative_eq;
    use hexlit::hex;

    #[test]
    fn test_groundspeed_velocity() {
        let bytes = hex!("8D485020994409940838175B284F");
        let msg = Message::from_bytes((&bytes, 0)).unwrap().1;
        if let ExtendedSquitterADSB(adsb_msg) = msg.df {
            if let ME::BDS09(velocity) = adsb_msg.message {
                assert_eq!(velocity.vertical_rate, Some(-832));
                if let AirborneVelocitySubType::GroundSpeedDecoding(gs) =
                    velocity.velocity
                {
                    assert_relative_eq!(
                        gs.groundspeed.unwrap(),
                        159.,
                        max_relative = 1e-2
                    );
                    assert_relative_eq!(
                        gs.track.unwrap(),
                        182.88,
                        max_relative = 1e-3
                    );
                    return;
                }
            }
        }
        unreachable!();
    }
}
