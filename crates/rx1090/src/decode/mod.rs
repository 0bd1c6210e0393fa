pub mod adsb;
pub mod bds;
pub mod cpr;
pub mod crc;
pub mod icao;
pub mod time;

use adsb::{ADSB, ME};
use crc::modes_checksum;
use deku::bitvec::{BitSlice, Msb0};
use deku::prelude::*;
use serde::ser::{Serialize, Serializer};
use std::fmt;

pub const MODES_SHORT_MSG_BYTES: usize = 7;
pub const MODES_LONG_MSG_BYTES: usize = 14;

/// Frame length implied by the downlink format: every format of 16 and
/// above is 112 bits, everything below is 56, so the high bit of the DF
/// value decides.
pub fn message_len_by_type(df: u8) -> usize {
    if df & 0x10 != 0 {
        MODES_LONG_MSG_BYTES * 8
    } else {
        MODES_SHORT_MSG_BYTES * 8
    }
}

/**
 * The downlink formats this receiver handles.
 *
 * The first five bits of every frame name its format. Short 56-bit
 * frames: DF0 (air-air surveillance), DF4/DF5 (altitude and identity
 * replies), DF11 (all-call). Long 112-bit frames: DF16 (long air-air),
 * DF17/DF18 (extended squitter), DF20/DF21 (Comm-B replies, their MB
 * payload carried opaque) and DF24 upwards (Comm-D).
 *
 * Apart from DF11, DF17 and DF18, the transponder overlays its address
 * on the parity bits, which is why the deku context threads the frame
 * checksum down to the [`IcaoParity`] fields.
 */
#[derive(Debug, PartialEq, serde::Serialize, DekuRead, Clone)]
#[deku(type = "u8", bits = "5", ctx = "crc: u32")]
#[serde(tag = "DF")]
pub enum DF {
    /// DF=0: Short Air-Air Surveillance, the ACAS reply
    #[deku(id = "0")]
    #[serde(rename = "DF0")]
    ShortAirAirSurveillance {
        /// Vertical status: 1 when on the ground
        #[deku(bits = "1")]
        #[serde(skip)]
        vs: u8,
        /// Crosslink capability
        #[deku(bits = "1")]
        #[serde(skip)]
        cc: u8,
        #[deku(bits = "1")]
        #[serde(skip)]
        unused: u8,
        /// ACAS sensitivity level
        #[deku(bits = "3")]
        #[serde(skip)]
        sl: u8,
        #[deku(bits = "2")]
        #[serde(skip)]
        unused1: u8,
        /// Reply information
        #[deku(bits = "4")]
        #[serde(skip)]
        ri: u8,
        #[deku(bits = "2")]
        #[serde(skip)]
        unused2: u8,
        #[serde(rename = "altitude")]
        ac: AC13Field,
        #[serde(rename = "icao24")]
        #[deku(ctx = "crc")]
        ap: IcaoParity,
    },

    /// DF=4: Surveillance Altitude Reply
    #[deku(id = "4")]
    #[serde(rename = "DF4")]
    SurveillanceAltitudeReply {
        #[serde(skip)]
        fs: FlightStatus,
        /// Downlink request
        #[deku(bits = "5")]
        #[serde(skip)]
        dr: u8,
        /// Utility message
        #[deku(bits = "6")]
        #[serde(skip)]
        um: u8,
        #[serde(rename = "altitude")]
        ac: AC13Field,
        #[serde(rename = "icao24")]
        #[deku(ctx = "crc")]
        ap: IcaoParity,
    },

    /// DF=5: Surveillance Identity Reply, carrying the squawk
    #[deku(id = "5")]
    #[serde(rename = "DF5")]
    SurveillanceIdentityReply {
        fs: FlightStatus,
        /// Downlink request
        #[deku(bits = "5")]
        #[serde(skip)]
        dr: u8,
        /// Utility message
        #[deku(bits = "6")]
        #[serde(skip)]
        um: u8,
        #[serde(rename = "squawk")]
        id: IdentityCode,
        #[serde(rename = "icao24")]
        #[deku(ctx = "crc")]
        ap: IcaoParity,
    },

    /// DF=11: All-call reply, the frame that announces an address
    #[deku(id = "11")]
    #[serde(rename = "DF11")]
    AllCallReply {
        capability: Capability,
        #[serde(rename = "icao24")]
        icao: ICAO,
        /// Parity overlaid with the interrogator identifier
        #[serde(skip)]
        p_icao: ICAO,
    },

    /// DF=16: Long Air-Air Surveillance, ACAS coordination
    #[deku(id = "16")]
    #[serde(rename = "DF16")]
    LongAirAirSurveillance {
        /// Vertical status: 1 when on the ground
        #[deku(bits = "1")]
        vs: u8,
        #[deku(bits = "2")]
        #[serde(skip)]
        reserved1: u8,
        /// ACAS sensitivity level
        #[deku(bits = "3")]
        sl: u8,
        #[deku(bits = "2")]
        #[serde(skip)]
        reserved2: u8,
        /// Reply information
        #[deku(bits = "4")]
        ri: u8,
        #[deku(bits = "2")]
        #[serde(skip)]
        reserved3: u8,
        #[serde(rename = "altitude")]
        ac: AC13Field,
        /// MV, the 56-bit resolution advisory payload
        #[deku(count = "7")]
        #[serde(skip)]
        mv: Vec<u8>,
        #[serde(rename = "icao24")]
        #[deku(ctx = "crc")]
        ap: IcaoParity,
    },

    /// DF=17: the ADS-B extended squitter
    #[deku(id = "17")]
    #[serde(rename = "ADSB")]
    ExtendedSquitterADSB(ADSB),

    /// DF=18: extended squitter from equipment that cannot be
    /// interrogated (TIS-B and non-transponder ADS-B)
    #[deku(id = "18")]
    #[serde(rename = "TISB")]
    ExtendedSquitterTisB {
        cf: ControlField,
        #[serde(skip)]
        pi: ICAO,
    },

    /// DF=20: Comm-B Altitude Reply. The register number is not carried
    /// in the frame, so the MB payload stays opaque here.
    #[deku(id = "20")]
    #[serde(rename = "DF20")]
    CommBAltitudeReply {
        #[serde(skip)]
        fs: FlightStatus,
        /// Downlink request
        #[deku(bits = "5")]
        #[serde(skip)]
        dr: u8,
        /// Utility message
        #[deku(bits = "6")]
        #[serde(skip)]
        um: u8,
        #[serde(rename = "altitude")]
        ac: AC13Field,
        /// MB, the 56-bit Comm-B payload
        #[deku(count = "7")]
        #[serde(skip)]
        mb: Vec<u8>,
        #[serde(rename = "icao24")]
        #[deku(ctx = "crc")]
        ap: IcaoParity,
    },

    /// DF=21: Comm-B Identity Reply
    #[deku(id = "21")]
    #[serde(rename = "DF21")]
    CommBIdentityReply {
        #[serde(skip)]
        fs: FlightStatus,
        /// Downlink request
        #[deku(bits = "5")]
        #[serde(skip)]
        dr: u8,
        /// Utility message
        #[deku(bits = "6")]
        #[serde(skip)]
        um: u8,
        #[serde(rename = "squawk")]
        id: IdentityCode,
        /// MB, the 56-bit Comm-B payload
        #[deku(count = "7")]
        #[serde(skip)]
        mb: Vec<u8>,
        #[serde(rename = "icao24")]
        #[deku(ctx = "crc")]
        ap: IcaoParity,
    },

    /// DF=24..=31: Comm-D extended length message segments
    #[deku(id_pat = "24..=31")]
    CommDExtended {
        #[deku(bits = "1")]
        spare: u8,
        /// KE: downlink transmission or uplink acknowledgement
        #[deku(bits = "1")]
        #[serde(skip)]
        ke: u8,
        /// D-segment number
        #[deku(bits = "4")]
        nd: u8,
        /// MD, the 80-bit segment payload
        #[deku(count = "10")]
        md: Vec<u8>,
        parity: ICAO,
    },
}

/// A decoded Mode S downlink frame.
///
/// `Message::from_bytes` runs the CRC over the whole frame before
/// dispatching on the format: a DF17 frame with a non-zero remainder is
/// refused outright, and for the address/parity formats the remainder
/// doubles as the announced address.
#[derive(Debug, PartialEq, serde::Serialize, DekuRead, Clone)]
pub struct Message {
    /// Frame checksum remainder: 0 for an undamaged ADS-B frame, the
    /// icao24 address for the AP formats
    #[deku(reader = "Self::read_remainder(deku::input_bits)")]
    #[serde(skip)]
    pub crc: u32,

    #[serde(flatten)]
    #[deku(ctx = "*crc")]
    pub df: DF,
}

impl Message {
    fn read_remainder(
        rest: &BitSlice<u8, Msb0>,
    ) -> Result<(&BitSlice<u8, Msb0>, u32), DekuError> {
        let (_, bytes, _) = rest.domain().region().unwrap();

        // the DF field alone settles how many bits the checksum covers
        let df = bytes[0] >> 3;
        let crc = modes_checksum(bytes, message_len_by_type(df))?;

        if df == 17 && crc != 0 {
            return Err(DekuError::Assertion(format!(
                "refusing DF17 frame with CRC remainder {crc}"
            )));
        }
        Ok((rest, crc))
    }
}

/// A 24-bit ICAO transponder address
#[derive(PartialEq, Eq, PartialOrd, Ord, DekuRead, Hash, Copy, Clone)]
pub struct ICAO(#[deku(bits = 24, endian = "big")] pub u32);

impl fmt::Debug for ICAO {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:06x}", self.0)
    }
}

impl Serialize for ICAO {
    fn serialize<S: Serializer>(
        &self,
        serializer: S,
    ) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&format!("{:06x}", self.0))
    }
}

/// The address recovered from an address/parity field.
///
/// Nothing is left to read once the checksum pass has consumed the
/// frame, hence the zero-effect map: the field's value is the remainder
/// handed down through the deku context.
#[derive(PartialEq, Eq, PartialOrd, Ord, DekuRead, Hash, Copy, Clone)]
#[deku(ctx = "crc: u32")]
pub struct IcaoParity(
    #[deku(bits = 24, map = "|_v: u32| -> Result<_, DekuError> { Ok(crc) }")]
    pub u32,
);

impl fmt::Debug for IcaoParity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:06x}", self.0)
    }
}

impl Serialize for IcaoParity {
    fn serialize<S: Serializer>(
        &self,
        serializer: S,
    ) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&format!("{:06x}", self.0))
    }
}

/// The 13-bit identity code: a squawk of four octal digits, stored so
/// that the hex rendering reads as those digits
#[derive(PartialEq, Eq, DekuRead, Copy, Clone)]
pub struct IdentityCode(#[deku(reader = "Self::read(deku::rest)")] pub u16);

impl IdentityCode {
    fn read(
        rest: &BitSlice<u8, Msb0>,
    ) -> Result<(&BitSlice<u8, Msb0>, u16), DekuError> {
        let (rest, field) =
            u16::read(rest, (deku::ctx::Endian::Big, deku::ctx::BitSize(13)))?;
        Ok((rest, squawk_from_id13(field)))
    }
}

impl fmt::Debug for IdentityCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:04x}", self.0)
    }
}

impl Serialize for IdentityCode {
    fn serialize<S: Serializer>(
        &self,
        serializer: S,
    ) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&format!("{:04x}", self.0))
    }
}

/// The 13-bit altitude code of the surveillance replies, in feet
#[derive(Debug, PartialEq, Eq, serde::Serialize, DekuRead, Copy, Clone)]
pub struct AC13Field(#[deku(reader = "Self::read(deku::rest)")] pub u16);

impl AC13Field {
    fn read(
        rest: &BitSlice<u8, Msb0>,
    ) -> Result<(&BitSlice<u8, Msb0>, u16), DekuError> {
        let (rest, field) =
            u16::read(rest, (deku::ctx::Endian::Big, deku::ctx::BitSize(13)))?;

        // M selects metric units, Q selects 25 ft quanta, neither means
        // the altitude is Gillham coded
        let altitude = if field & 0x0040 != 0 {
            let meters = ((field & 0x1f80) >> 2) | (field & 0x3f);
            (meters as f32 * 3.28084) as u16
        } else if field & 0x0010 != 0 {
            // 11 bits once Q and M are squeezed out
            let n = ((field & 0x1f80) >> 2)
                | ((field & 0x0020) >> 1)
                | (field & 0x000f);
            if n > 40 {
                n * 25 - 1000
            } else {
                0
            }
        } else {
            match gray_to_altitude(squawk_from_id13(field)) {
                Ok(n) => (100 * n) as u16,
                Err(_) => 0,
            }
        };
        Ok((rest, altitude))
    }
}

/// Transponder capability, broadcast with the all-call reply and the
/// extended squitter
#[derive(Debug, PartialEq, serde::Serialize, DekuRead, Copy, Clone)]
#[deku(type = "u8", bits = "3")]
pub enum Capability {
    /// Level 1 transponder, surveillance only
    #[serde(rename = "level1")]
    Level1 = 0x00,
    #[deku(id_pat = "0x01..=0x03")]
    #[serde(rename = "reserved")]
    Reserved,
    /// Level 2 or above, on the ground
    #[serde(rename = "ground")]
    Ground = 0x04,
    /// Level 2 or above, airborne
    #[serde(rename = "airborne")]
    Airborne = 0x05,
    /// Level 2 or above, either airborne or on the ground
    #[serde(rename = "ground/airborne")]
    GroundAirborne = 0x06,
    /// The DR field is non-zero, or FS reports an alert or SPI
    #[serde(rename = "DR0")]
    Dr0 = 0x07,
}

/// Flight status of the surveillance replies: alert and SPI conditions,
/// and whether the aircraft reports itself on the ground
#[derive(Debug, PartialEq, serde::Serialize, DekuRead, Copy, Clone)]
#[deku(type = "u8", bits = "3")]
#[serde(rename_all = "snake_case")]
pub enum FlightStatus {
    Airborne = 0b000,
    OnGround = 0b001,
    AlertAirborne = 0b010,
    AlertOnGround = 0b011,
    AlertSpi = 0b100,
    Spi = 0b101,
    Reserved = 0b110,
    NotAssigned = 0b111,
}

impl FlightStatus {
    pub fn on_ground(&self) -> bool {
        matches!(self, Self::OnGround | Self::AlertOnGround)
    }

    pub fn alert(&self) -> bool {
        matches!(
            self,
            Self::AlertAirborne | Self::AlertOnGround | Self::AlertSpi
        )
    }

    pub fn spi(&self) -> bool {
        matches!(self, Self::AlertSpi | Self::Spi)
    }
}

/// The DF18 control field: an ADS-B style payload whose address may live
/// in an alternate, non-transponder address space
#[derive(Debug, PartialEq, serde::Serialize, DekuRead, Clone)]
pub struct ControlField {
    #[serde(skip)]
    pub t: ControlFieldType,
    /// AA, the announced address
    #[serde(rename = "icao24")]
    pub aa: ICAO,
    /// ME, the extended squitter payload
    #[serde(flatten)]
    pub me: ME,
}

/// How the DF18 payload and its address space are to be read
#[derive(Debug, PartialEq, serde::Serialize, DekuRead, Clone)]
#[deku(type = "u8", bits = "3")]
pub enum ControlFieldType {
    /// ADS-B from a non-transponder device
    #[deku(id = "0")]
    AdsbNonTransponder,

    /// ADS-B, alternate address space
    #[deku(id = "1")]
    AdsbOtherAddress,

    /// Fine format TIS-B
    #[deku(id = "2")]
    TisbFine,

    /// Coarse format TIS-B
    #[deku(id = "3")]
    TisbCoarse,

    /// TIS-B management message
    #[deku(id = "4")]
    TisbManage,

    /// TIS-B relay of an ADS-B message, anonymous addresses
    #[deku(id = "5")]
    TisbRelay,

    /// TIS-B carrying the same payload as DF17
    #[deku(id = "6")]
    TisbAdsb,

    #[deku(id = "7")]
    Reserved,
}

/// Undo the interleave of a 13-bit identity field.
///
/// Four octal digits A, B, C, D arrive with their bits spread over the
/// field as C1-A1-C2-A2-C4-A4-0-B1-D1-B2-D2-B4-D4; the result packs
/// them into four hex nibbles reading ABCD, which is how squawks are
/// stored and rendered everywhere else.
#[rustfmt::skip]
pub fn squawk_from_id13(field: u16) -> u16 {
    let mut squawk: u16 = 0;

    if field & 0x1000 != 0 { squawk |= 0x0010; } // C1
    if field & 0x0800 != 0 { squawk |= 0x1000; } // A1
    if field & 0x0400 != 0 { squawk |= 0x0020; } // C2
    if field & 0x0200 != 0 { squawk |= 0x2000; } // A2
    if field & 0x0100 != 0 { squawk |= 0x0040; } // C4
    if field & 0x0080 != 0 { squawk |= 0x4000; } // A4
    // bit 6 is X (spare), or M in an altitude field
    if field & 0x0020 != 0 { squawk |= 0x0100; } // B1
    if field & 0x0010 != 0 { squawk |= 0x0001; } // D1
    if field & 0x0008 != 0 { squawk |= 0x0200; } // B2
    if field & 0x0004 != 0 { squawk |= 0x0002; } // D2
    if field & 0x0002 != 0 { squawk |= 0x0400; } // B4
    if field & 0x0001 != 0 { squawk |= 0x0004; } // D4

    squawk
}

/// Turn a Gillham (reflected Gray) altitude code into hundreds of feet.
///
/// The DAB bits form a Gray count of 500 ft steps and the C bits a 100 ft
/// sub-count from 1 to 5; odd 500 ft steps run the sub-count backwards.
/// Codes that violate the fixed-zero bits or the C range are rejected.
#[rustfmt::skip]
pub fn gray_to_altitude(gray: u16) -> Result<i32, &'static str> {
    let mut five_hundreds: u32 = 0;
    let mut one_hundreds: u32 = 0;

    // zero bits must be zero and the C digit cannot be empty
    if (gray & 0x8889) != 0 || (gray & 0x00f0) == 0 {
        return Err("Invalid altitude");
    }

    if gray & 0x0010 != 0 { one_hundreds ^= 0x007; } // C1
    if gray & 0x0020 != 0 { one_hundreds ^= 0x003; } // C2
    if gray & 0x0040 != 0 { one_hundreds ^= 0x001; } // C4

    // 7 and 5 swap places in this code
    if (one_hundreds & 5) == 5 { one_hundreds ^= 2; }

    if one_hundreds > 5 { return Err("Invalid altitude"); }

    // D1 is never part of an altitude
    if gray & 0x0002 != 0 { five_hundreds ^= 0x0ff; } // D2
    if gray & 0x0004 != 0 { five_hundreds ^= 0x07f; } // D4
    if gray & 0x1000 != 0 { five_hundreds ^= 0x03f; } // A1
    if gray & 0x2000 != 0 { five_hundreds ^= 0x01f; } // A2
    if gray & 0x4000 != 0 { five_hundreds ^= 0x00f; } // A4
    if gray & 0x0100 != 0 { five_hundreds ^= 0x007; } // B1
    if gray & 0x0200 != 0 { five_hundreds ^= 0x003; } // B2
    if gray & 0x0400 != 0 { five_hundreds ^= 0x001; } // B4

    // odd steps reverse the sub-count
    if five_hundreds & 1 != 0 && one_hundreds <= 6 {
        one_hundreds = 6 - one_hundreds;
    }

    let n = (five_hundreds * 5) + one_hundreds;
    if n >= 13 {
        Ok(n as i32 - 13)
    } else {
        Err("Invalid altitude")
    }
}

#[cfg(test)]
mod tests {

    use super::*;
    use deku::DekuContainerRead;
    use hexlit::hex;

    #[test]
    fn test_ac13field() {
        let bytes = hex!("a0001910cc300030aa0000eae004");
        let msg = Message::from_bytes((&bytes, 0)).unwrap().1;
        match msg.df {
            DF::CommBAltitudeReply { ac, .. } => {
                assert_eq!(ac.0, 39000);
            }
            _ => unreachable!(),
        }
    }

    #[test]
    fn test_invalid_crc() {
        let bytes = hex!("8d4ca251204994b1c36e60a5343d");
        let msg = Message::from_bytes((&bytes, 0));
        if let Err(e) = msg {
            match e {
                DekuError::Assertion(_msg) => (),
                _ => unreachable!(),
            }
        } else {
            unreachable!()
        }
    }

    #[test]
    fn test_icao_from_parity() {
        // DF5 identity reply from icao24 4d0131
        let bytes = hex!("28001a00e1d6ff");
        let msg = Message::from_bytes((&bytes, 0)).unwrap().1;
        match msg.df {
            DF::SurveillanceIdentityReply { ap, .. } => {
                assert_eq!(ap.0, 0x4d0131);
            }
            _ => unreachable!(),
        }
    }
}
