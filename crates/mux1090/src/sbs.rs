/*!
 * SBS/Basestation text records: 22 comma-separated fields per line, CRLF
 * terminated, date and time rendered in local time.
 */
use chrono::{DateTime, Local};
use rx1090::decode::adsb::ME;
use rx1090::decode::bds::bds09::AirborneVelocitySubType;
use rx1090::decode::cpr::Position;
use rx1090::decode::{FlightStatus, Message, DF};

/// The per-message fields an SBS input line may carry
#[derive(Debug, Default, PartialEq)]
pub struct SbsMessage {
    pub icao24: u32,
    pub transmission: u8,
    pub callsign: Option<String>,
    pub altitude: Option<i32>,
    pub groundspeed: Option<f64>,
    pub track: Option<f64>,
    pub latitude: Option<f64>,
    pub longitude: Option<f64>,
    pub vertical_rate: Option<i16>,
    pub squawk: Option<u16>,
    pub on_ground: bool,
}

impl std::str::FromStr for SbsMessage {
    type Err = String;

    fn from_str(line: &str) -> Result<Self, Self::Err> {
        let fields: Vec<&str> =
            line.trim_end_matches(['\r', '\n']).split(',').collect();
        if fields.first() != Some(&"MSG") {
            return Err("not a MSG record".to_string());
        }
        let transmission = fields
            .get(1)
            .and_then(|f| f.parse::<u8>().ok())
            .ok_or("missing transmission type")?;
        let icao24 = fields
            .get(4)
            .and_then(|f| u32::from_str_radix(f, 16).ok())
            .ok_or("missing hex ident")?;

        let text = |i: usize| -> Option<String> {
            fields
                .get(i)
                .map(|f| f.trim())
                .filter(|f| !f.is_empty())
                .map(|f| f.to_string())
        };
        let num = |i: usize| -> Option<f64> {
            fields.get(i).and_then(|f| f.trim().parse::<f64>().ok())
        };

        Ok(SbsMessage {
            icao24,
            transmission,
            callsign: text(10),
            altitude: num(11).map(|v| v as i32),
            groundspeed: num(12),
            track: num(13),
            latitude: num(14),
            longitude: num(15),
            vertical_rate: num(16).map(|v| v as i16),
            // the squawk field is 4 octal digits read as hex, same
            // convention as the identity code
            squawk: fields
                .get(17)
                .and_then(|f| u16::from_str_radix(f.trim(), 16).ok()),
            on_ground: matches!(
                fields.get(21).map(|f| f.trim()),
                Some("-1") | Some("1")
            ),
        })
    }
}

fn flag(b: bool) -> &'static str {
    if b {
        "-1"
    } else {
        "0"
    }
}

fn fs_flags(fs: &FlightStatus) -> (&'static str, &'static str, &'static str) {
    (flag(fs.alert()), flag(fs.spi()), flag(fs.on_ground()))
}

/// Encode one accepted message as an SBS line. `position` carries the
/// coordinates the fleet table just decoded for this very message, if
/// any. Messages with no SBS mapping yield None.
pub fn encode(
    msg: &Message,
    position: Option<Position>,
    now: DateTime<Local>,
) -> Option<String> {
    let date = now.format("%Y/%m/%d");
    let time = now.format("%H:%M:%S%.3f");

    let header = |tt: u8, icao24: u32| {
        format!("MSG,{tt},111,11111,{icao24:06X},111111,{date},{time},{date},{time}")
    };

    let (lat, lon) = match position {
        Some(p) => (
            format!("{:.5}", p.latitude),
            format!("{:.5}", p.longitude),
        ),
        None => (String::new(), String::new()),
    };

    let line = match &msg.df {
        DF::SurveillanceAltitudeReply { fs, ac, ap, .. } => {
            let (alert, spi, ground) = fs_flags(fs);
            format!(
                "{},,{},,,,,,,{alert},,{spi},{ground}",
                header(5, ap.0),
                ac.0
            )
        }
        DF::CommBAltitudeReply { fs, ac, ap, .. } => {
            let (alert, spi, ground) = fs_flags(fs);
            format!(
                "{},,{},,,,,,,{alert},,{spi},{ground}",
                header(5, ap.0),
                ac.0
            )
        }
        DF::SurveillanceIdentityReply { fs, id, ap, .. } => {
            let (alert, spi, ground) = fs_flags(fs);
            format!(
                "{},,,,,,,,{:04x},{alert},,{spi},{ground}",
                header(6, ap.0),
                id.0
            )
        }
        DF::CommBIdentityReply { fs, id, ap, .. } => {
            let (alert, spi, ground) = fs_flags(fs);
            format!(
                "{},,,,,,,,{:04x},{alert},,{spi},{ground}",
                header(6, ap.0),
                id.0
            )
        }
        DF::AllCallReply { icao, .. } => {
            format!("{},,,,,,,,,,,,", header(8, icao.0))
        }
        DF::ExtendedSquitterADSB(adsb) => {
            let icao24 = adsb.icao24.0;
            match &adsb.message {
                ME::BDS08(id) => {
                    format!("{},{},,,,,,,,,,,", header(1, icao24), id.callsign)
                }
                ME::BDS05(me) => {
                    let alt = me
                        .alt
                        .map(|a| a.to_string())
                        .unwrap_or_default();
                    format!(
                        "{},,{alt},,,{lat},{lon},,,0,0,0,0",
                        header(3, icao24)
                    )
                }
                ME::BDS06(me) => {
                    let gs = me
                        .groundspeed
                        .map(|v| format!("{v:.1}"))
                        .unwrap_or_default();
                    let trk = me
                        .track
                        .map(|v| format!("{v:.1}"))
                        .unwrap_or_default();
                    format!(
                        "{},,,{gs},{trk},{lat},{lon},,,0,0,0,-1",
                        header(2, icao24)
                    )
                }
                ME::BDS09(me) => {
                    let vr = me
                        .vertical_rate
                        .map(|v| v.to_string())
                        .unwrap_or_default();
                    match &me.velocity {
                        AirborneVelocitySubType::GroundSpeedDecoding(gs) => {
                            let speed = gs
                                .groundspeed
                                .map(|v| format!("{v:.1}"))
                                .unwrap_or_default();
                            let track = gs
                                .track
                                .map(|v| format!("{v:.1}"))
                                .unwrap_or_default();
                            format!(
                                "{},,,{speed},{track},,,{vr},,0,0,0,0",
                                header(4, icao24)
                            )
                        }
                        _ => format!(
                            "{},,,,,,,{vr},,0,0,0,0",
                            header(4, icao24)
                        ),
                    }
                }
                _ => return None,
            }
        }
        _ => return None,
    };

    Some(format!("{line}\r\n"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use hexlit::hex;
    use rx1090::prelude::DekuContainerRead;
    use std::str::FromStr;

    #[test]
    fn encode_identification() {
        let bytes = hex!("8d406b902015a678d4d220aa4bda");
        let msg = Message::from_bytes((&bytes, 0)).unwrap().1;
        let line = encode(&msg, None, Local::now()).unwrap();
        assert!(line.starts_with("MSG,1,111,11111,406B90,111111,"));
        assert!(line.contains(",EZY85MH,"));
        assert!(line.ends_with("\r\n"));
    }

    #[test]
    fn encode_and_parse_position() {
        let bytes = hex!("8D40058B58C901375147EFD09357");
        let msg = Message::from_bytes((&bytes, 0)).unwrap().1;
        let pos = Position {
            latitude: 49.81755,
            longitude: 6.08442,
        };
        let line = encode(&msg, Some(pos), Local::now()).unwrap();

        let parsed = SbsMessage::from_str(&line).unwrap();
        assert_eq!(parsed.transmission, 3);
        assert_eq!(parsed.icao24, 0x40058b);
        assert_eq!(parsed.altitude, Some(39000));
        assert_eq!(parsed.latitude, Some(49.81755));
        assert_eq!(parsed.longitude, Some(6.08442));
    }

    #[test]
    fn parse_a_basestation_line() {
        let line = "MSG,3,1,1,4CA2D6,1,2026/08/01,10:21:32.591,\
                    2026/08/01,10:21:32.591,,37000,,,52.26578,3.91312,,,0,0,0,0";
        let parsed = SbsMessage::from_str(line).unwrap();
        assert_eq!(parsed.icao24, 0x4ca2d6);
        assert_eq!(parsed.altitude, Some(37000));
        assert_eq!(parsed.latitude, Some(52.26578));
        assert!(!parsed.on_ground);
        assert_eq!(parsed.callsign, None);
    }
}
