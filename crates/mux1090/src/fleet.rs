/*!
 * The live aircraft table: one record per 24-bit address, fed by the
 * demodulator and the network inputs, drained by the JSON and text
 * publishers.
 */
use std::collections::BTreeMap;

use rx1090::decode::adsb::ME;
use rx1090::decode::bds::bds05::AirbornePosition;
use rx1090::decode::bds::bds06::SurfacePosition;
use rx1090::decode::bds::bds09::AirborneVelocitySubType;
use rx1090::decode::cpr::{self, dist_haversine, Position};
use rx1090::decode::{Message, DF};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::aircraftdb::{self, AircraftDb};
use crate::sbs::SbsMessage;

/// Both CPR fragments of a pair must be younger than this
const CPR_PAIR_WINDOW: f64 = 10.0;

/// A previous position stays usable as a local decoding reference this long
const LOCAL_REFERENCE_WINDOW: f64 = 180.0;

/// Dead reckoning starts once the position is this old
const ESTIMATE_AFTER: f64 = 1.0;

const KM_PER_NM: f64 = 1.852;

/// Display lifecycle of a record: newly created records are flagged for
/// one publish cycle, stale ones get a last appearance before removal
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShowState {
    FirstTime,
    Normal,
    LastTime,
    None,
}

#[derive(Debug)]
pub struct Aircraft {
    pub addr: u32,
    pub callsign: Option<String>,
    pub squawk: Option<u16>,
    pub altitude: Option<i32>,
    pub groundspeed: Option<f64>,
    /// track over ground; None while no valid heading was received
    pub track: Option<f64>,
    pub vertical_rate: Option<i16>,
    pub on_ground: bool,

    /// last observed position and when it was decoded
    pub position: Option<Position>,
    pub position_time: f64,
    /// distance from the receiver, in km
    pub distance: Option<f64>,

    pub even_airborne: Option<AirbornePosition>,
    pub even_airborne_time: f64,
    pub odd_airborne: Option<AirbornePosition>,
    pub odd_airborne_time: f64,
    pub even_surface: Option<SurfacePosition>,
    pub even_surface_time: f64,
    pub odd_surface: Option<SurfacePosition>,
    pub odd_surface_time: f64,

    /// dead-reckoned estimate; never overwrites the observed position
    pub est_position: Option<Position>,
    pub est_distance: Option<f64>,
    pub est_seen_last: f64,

    /// ring of the most recent signal power measurements
    pub sig_levels: [f64; 4],
    pub sig_idx: usize,
    pub sig_count: usize,

    pub seen_first: f64,
    pub seen_last: f64,
    pub messages: u32,
    pub show: ShowState,

    pub registration: Option<String>,
    pub typecode: Option<String>,
    pub operator: Option<String>,
    pub country: Option<&'static str>,
    pub military: bool,
}

impl Aircraft {
    fn new(addr: u32, now: f64, db: &AircraftDb) -> Self {
        let info = db.lookup(addr);
        Aircraft {
            addr,
            callsign: None,
            squawk: None,
            altitude: None,
            groundspeed: None,
            track: None,
            vertical_rate: None,
            on_ground: false,
            position: None,
            position_time: 0.,
            distance: None,
            even_airborne: None,
            even_airborne_time: 0.,
            odd_airborne: None,
            odd_airborne_time: 0.,
            even_surface: None,
            even_surface_time: 0.,
            odd_surface: None,
            odd_surface_time: 0.,
            est_position: None,
            est_distance: None,
            est_seen_last: now,
            sig_levels: [0.; 4],
            sig_idx: 0,
            sig_count: 0,
            seen_first: now,
            seen_last: now,
            messages: 0,
            show: ShowState::FirstTime,
            registration: info.and_then(|i| i.registration.clone()),
            typecode: info.and_then(|i| i.typecode.clone()),
            operator: info.and_then(|i| i.operator.clone()),
            country: aircraftdb::country_of(addr),
            military: aircraftdb::is_military(addr),
        }
    }

    fn note_signal(&mut self, level: f64) {
        self.sig_levels[self.sig_idx] = level;
        self.sig_idx = (self.sig_idx + 1) % self.sig_levels.len();
        self.sig_count = (self.sig_count + 1).min(self.sig_levels.len());
    }

    /// Mean of the recent signal levels, in dBFS
    pub fn rssi(&self) -> Option<f64> {
        if self.sig_count == 0 {
            return None;
        }
        let sum: f64 = self.sig_levels[..self.sig_count].iter().sum();
        let mean = sum / self.sig_count as f64;
        if mean > 0. {
            Some(10. * mean.log10())
        } else {
            None
        }
    }
}

#[derive(Debug, Default, Clone)]
pub struct CprStats {
    pub airborne: u32,
    pub surface: u32,
    pub global_ok: u32,
    pub global_bad: u32,
    pub global_skipped: u32,
    pub local_ok: u32,
    pub local_skipped: u32,
    pub range_checks: u32,
    pub speed_checks: u32,
}

/// Which decoding produced a position candidate
enum PosSource {
    Global,
    Local,
}

pub struct FleetTable {
    pub aircraft: BTreeMap<u32, Aircraft>,
    pub home: Option<Position>,
    pub max_range_nm: f64,
    pub stale_seconds: f64,
    pub cpr: CprStats,
    pub messages_total: u64,
    pub unique_aircraft: u32,
    pub single_message_aircraft: u32,
}

/// The address a message is about, when it carries or implies one
pub fn icao24(msg: &Message) -> Option<u32> {
    match &msg.df {
        DF::ShortAirAirSurveillance { ap, .. } => Some(ap.0),
        DF::SurveillanceAltitudeReply { ap, .. } => Some(ap.0),
        DF::SurveillanceIdentityReply { ap, .. } => Some(ap.0),
        DF::AllCallReply { icao, .. } => Some(icao.0),
        DF::LongAirAirSurveillance { ap, .. } => Some(ap.0),
        DF::ExtendedSquitterADSB(adsb) => Some(adsb.icao24.0),
        DF::ExtendedSquitterTisB { cf, .. } => Some(cf.aa.0),
        DF::CommBAltitudeReply { ap, .. } => Some(ap.0),
        DF::CommBIdentityReply { ap, .. } => Some(ap.0),
        _ => None,
    }
}

/// Only these frames carry a CRC-confirmed address; the surveillance
/// replies may only update aircraft that already exist.
fn confirms_address(msg: &Message) -> bool {
    matches!(
        &msg.df,
        DF::AllCallReply { .. }
            | DF::ExtendedSquitterADSB(_)
            | DF::ExtendedSquitterTisB { .. }
    )
}

impl FleetTable {
    pub fn new(
        home: Option<Position>,
        max_range_nm: f64,
        stale_seconds: f64,
    ) -> Self {
        FleetTable {
            aircraft: BTreeMap::new(),
            home,
            max_range_nm,
            stale_seconds,
            cpr: CprStats::default(),
            messages_total: 0,
            unique_aircraft: 0,
            single_message_aircraft: 0,
        }
    }

    /// Apply one decoded message. Returns the position this very message
    /// produced, if any, so the SBS publisher can put it on the line.
    pub fn update(
        &mut self,
        msg: &Message,
        now: f64,
        signal: Option<f64>,
        db: &AircraftDb,
    ) -> Option<Position> {
        let addr = icao24(msg)?;

        if !self.aircraft.contains_key(&addr) {
            if !confirms_address(msg) {
                // an unknown address recovered from parity only: not
                // enough to create a record
                return None;
            }
            self.unique_aircraft += 1;
            self.aircraft.insert(addr, Aircraft::new(addr, now, db));
        }
        // split borrows: the record on one side, the gates on the other
        let record = self.aircraft.get_mut(&addr).expect("just inserted");
        record.seen_last = now;
        // an actual sighting is at least as fresh as any estimate, so
        // seen_first <= seen_last <= est_seen_last holds unconditionally
        record.est_seen_last = record.est_seen_last.max(now);
        record.messages += 1;
        if let Some(level) = signal {
            record.note_signal(level);
        }
        self.messages_total += 1;

        let home = self.home;
        let max_range_nm = self.max_range_nm;
        let cpr = &mut self.cpr;

        match &msg.df {
            DF::ShortAirAirSurveillance { vs, ac, .. }
            | DF::LongAirAirSurveillance { vs, ac, .. } => {
                record.on_ground = *vs == 1;
                if ac.0 > 0 {
                    record.altitude = Some(i32::from(ac.0));
                }
                None
            }
            DF::SurveillanceAltitudeReply { fs, ac, .. }
            | DF::CommBAltitudeReply { fs, ac, .. } => {
                record.on_ground = fs.on_ground();
                if ac.0 > 0 {
                    record.altitude = Some(i32::from(ac.0));
                }
                None
            }
            DF::SurveillanceIdentityReply { fs, id, .. }
            | DF::CommBIdentityReply { fs, id, .. } => {
                record.on_ground = fs.on_ground();
                record.squawk = Some(id.0);
                None
            }
            DF::ExtendedSquitterADSB(adsb) => {
                apply_me(record, &adsb.message, now, home, max_range_nm, cpr)
            }
            DF::ExtendedSquitterTisB { cf, .. } => {
                apply_me(record, &cf.me, now, home, max_range_nm, cpr)
            }
            _ => None,
        }
    }

    /// Apply a partial state update from an SBS input line
    pub fn apply_sbs(&mut self, sbs: &SbsMessage, now: f64, db: &AircraftDb) {
        let record = self
            .aircraft
            .entry(sbs.icao24)
            .or_insert_with(|| Aircraft::new(sbs.icao24, now, db));
        record.seen_last = now;
        record.est_seen_last = record.est_seen_last.max(now);
        record.messages += 1;
        self.messages_total += 1;

        if let Some(callsign) = &sbs.callsign {
            record.callsign = Some(callsign.clone());
        }
        if sbs.altitude.is_some() {
            record.altitude = sbs.altitude;
        }
        if sbs.groundspeed.is_some() {
            record.groundspeed = sbs.groundspeed;
        }
        if sbs.track.is_some() {
            record.track = sbs.track;
        }
        if sbs.vertical_rate.is_some() {
            record.vertical_rate = sbs.vertical_rate;
        }
        if sbs.squawk.is_some() {
            record.squawk = sbs.squawk;
        }
        record.on_ground = sbs.on_ground;
        if let (Some(latitude), Some(longitude)) =
            (sbs.latitude, sbs.longitude)
        {
            let position = Position {
                latitude,
                longitude,
            };
            record.position = Some(position);
            record.position_time = now;
            record.est_position = None;
            record.distance = self
                .home
                .as_ref()
                .map(|home| dist_haversine(home, &position));
        }
    }

    /// Dead reckoning: between position updates, estimate where each
    /// aircraft with a valid heading and speed has moved. Estimates are
    /// kept apart from observed state.
    pub fn tick(&mut self, now: f64) {
        let home = self.home;
        for record in self.aircraft.values_mut() {
            let (Some(position), Some(track), Some(groundspeed)) =
                (record.position, record.track, record.groundspeed)
            else {
                continue;
            };
            let elapsed = now - record.position_time;
            if elapsed < ESTIMATE_AFTER {
                continue;
            }

            // flat earth is fine over the few NM this covers
            let distance_nm = groundspeed * elapsed / 3600.;
            let heading = track.to_radians();
            let d_lat = distance_nm / 60. * heading.cos();
            let d_lon = distance_nm / 60. * heading.sin()
                / position.latitude.to_radians().cos().max(1e-6);
            let estimate = Position {
                latitude: position.latitude + d_lat,
                longitude: position.longitude + d_lon,
            };
            record.est_distance = home
                .as_ref()
                .map(|home| dist_haversine(home, &estimate));
            record.est_position = Some(estimate);
            record.est_seen_last = now;
        }
    }

    /// Advance the show-state machine by one publish cycle and drop the
    /// records whose last appearance has passed.
    pub fn publish_cycle(&mut self, now: f64) {
        let stale = self.stale_seconds;
        for record in self.aircraft.values_mut() {
            record.show = match record.show {
                ShowState::FirstTime => ShowState::Normal,
                ShowState::Normal if now - record.seen_last > stale => {
                    ShowState::LastTime
                }
                ShowState::LastTime => ShowState::None,
                state => state,
            };
        }
        let single = &mut self.single_message_aircraft;
        self.aircraft.retain(|addr, record| {
            if record.show == ShowState::None {
                if record.messages == 1 {
                    *single += 1;
                }
                debug!("removing aircraft {addr:06x}");
                false
            } else {
                true
            }
        });
    }

    pub fn to_json(&self, now: f64) -> serde_json::Value {
        let aircraft: Vec<AircraftJson> = self
            .aircraft
            .values()
            .map(|record| AircraftJson::from_record(record, now))
            .collect();
        serde_json::json!({
            "now": now,
            "messages": self.messages_total,
            "aircraft": aircraft,
        })
    }
}

/// Apply an extended squitter payload, running the position pipeline for
/// the airborne and surface variants
fn apply_me(
    record: &mut Aircraft,
    me: &ME,
    now: f64,
    home: Option<Position>,
    max_range_nm: f64,
    cpr_stats: &mut CprStats,
) -> Option<Position> {
    match me {
        ME::BDS08(id) => {
            record.callsign = Some(id.callsign.clone());
            None
        }
        ME::BDS09(velocity) => {
            record.vertical_rate =
                velocity.vertical_rate.or(record.vertical_rate);
            match &velocity.velocity {
                AirborneVelocitySubType::GroundSpeedDecoding(gs) => {
                    if gs.groundspeed.is_some() {
                        record.groundspeed = gs.groundspeed;
                    }
                    if gs.track.is_some() {
                        record.track = gs.track;
                    }
                }
                AirborneVelocitySubType::AirspeedSubsonic(airspeed)
                | AirborneVelocitySubType::AirspeedSupersonic(airspeed) => {
                    if airspeed.heading.is_some() {
                        record.track = airspeed.heading;
                    }
                }
                _ => {}
            }
            None
        }
        ME::BDS05(airborne) => {
            record.on_ground = false;
            if airborne.alt.is_some() {
                record.altitude = airborne.alt.map(i32::from);
            }
            airborne_position_update(
                record,
                airborne,
                now,
                home,
                max_range_nm,
                cpr_stats,
            )
        }
        ME::BDS06(surface) => {
            record.on_ground = true;
            record.altitude = None;
            if surface.groundspeed.is_some() {
                record.groundspeed = surface.groundspeed;
            }
            if surface.track.is_some() {
                record.track = surface.track;
            }
            surface_position_update(
                record,
                surface,
                now,
                home,
                max_range_nm,
                cpr_stats,
            )
        }
        _ => None,
    }
}

/// Range and speed plausibility gates shared by the airborne and surface
/// pipelines
fn gate_position(
    record: &Aircraft,
    candidate: Position,
    now: f64,
    home: Option<Position>,
    max_range_nm: f64,
    cpr_stats: &mut CprStats,
) -> bool {
    if let Some(home) = &home {
        if dist_haversine(home, &candidate) > max_range_nm * KM_PER_NM {
            cpr_stats.range_checks += 1;
            return false;
        }
    }
    if let Some(previous) = &record.position {
        let elapsed = (now - record.position_time).max(0.5);
        let distance_nm = dist_haversine(previous, &candidate) / KM_PER_NM;
        let implied_kt = distance_nm / (elapsed / 3600.);
        let envelope = record
            .groundspeed
            .map_or(600., |gs| (2. * gs).max(600.));
        if implied_kt > envelope {
            cpr_stats.speed_checks += 1;
            return false;
        }
    }
    true
}

fn accept_position(
    record: &mut Aircraft,
    position: Position,
    now: f64,
    home: Option<Position>,
) {
    record.distance = home
        .as_ref()
        .map(|home| dist_haversine(home, &position));
    record.position = Some(position);
    record.position_time = now;
    record.est_position = None;
    record.est_distance = None;
    record.est_seen_last = record.est_seen_last.max(now);
}

fn airborne_position_update(
    record: &mut Aircraft,
    me: &AirbornePosition,
    now: f64,
    home: Option<Position>,
    max_range_nm: f64,
    cpr_stats: &mut CprStats,
) -> Option<Position> {
    use rx1090::decode::cpr::CPRFormat;

    cpr_stats.airborne += 1;

    // fragment timestamps only move forward
    let same_parity_time = match me.parity {
        CPRFormat::Even => record.even_airborne_time,
        CPRFormat::Odd => record.odd_airborne_time,
    };
    if now < same_parity_time {
        return None;
    }

    let (opposite, opposite_time) = match me.parity {
        CPRFormat::Even => (record.odd_airborne, record.odd_airborne_time),
        CPRFormat::Odd => (record.even_airborne, record.even_airborne_time),
    };

    let mut candidate = None;
    let mut source = PosSource::Local;

    if let Some(oldest) = &opposite {
        if now - opposite_time < CPR_PAIR_WINDOW {
            source = PosSource::Global;
            candidate = cpr::airborne_position(oldest, me);
            if candidate.is_none() {
                cpr_stats.global_bad += 1;
            }
        } else {
            cpr_stats.global_skipped += 1;
        }
    }

    if candidate.is_none() {
        source = PosSource::Local;
        if let Some(previous) = record.position {
            if now - record.position_time < LOCAL_REFERENCE_WINDOW {
                candidate = cpr::airborne_position_with_reference(
                    me,
                    previous.latitude,
                    previous.longitude,
                );
            }
        }
        if candidate.is_none() {
            if let Some(home) = &home {
                candidate = cpr::airborne_position_with_reference(
                    me,
                    home.latitude,
                    home.longitude,
                );
            }
        }
        if candidate.is_none() {
            cpr_stats.local_skipped += 1;
        }
    }

    if let Some(position) = candidate {
        if !gate_position(
            record,
            position,
            now,
            home,
            max_range_nm,
            cpr_stats,
        ) {
            candidate = None;
        }
    }

    // store the fragment for the next pair in any case
    match me.parity {
        CPRFormat::Even => {
            record.even_airborne = Some(*me);
            record.even_airborne_time = now;
        }
        CPRFormat::Odd => {
            record.odd_airborne = Some(*me);
            record.odd_airborne_time = now;
        }
    }

    let position = candidate?;
    match source {
        PosSource::Global => cpr_stats.global_ok += 1,
        PosSource::Local => cpr_stats.local_ok += 1,
    }
    accept_position(record, position, now, home);
    Some(position)
}

fn surface_position_update(
    record: &mut Aircraft,
    me: &SurfacePosition,
    now: f64,
    home: Option<Position>,
    max_range_nm: f64,
    cpr_stats: &mut CprStats,
) -> Option<Position> {
    use rx1090::decode::cpr::CPRFormat;

    cpr_stats.surface += 1;

    let same_parity_time = match me.parity {
        CPRFormat::Even => record.even_surface_time,
        CPRFormat::Odd => record.odd_surface_time,
    };
    if now < same_parity_time {
        return None;
    }

    // both the global ambiguity and the local decode need a reference
    let reference = record.position.or(home);

    let (opposite, opposite_time) = match me.parity {
        CPRFormat::Even => (record.odd_surface, record.odd_surface_time),
        CPRFormat::Odd => (record.even_surface, record.even_surface_time),
    };

    let mut candidate = None;
    let mut source = PosSource::Local;

    if let (Some(oldest), Some(reference)) = (&opposite, &reference) {
        if now - opposite_time < CPR_PAIR_WINDOW {
            source = PosSource::Global;
            candidate = cpr::surface_position(
                oldest,
                me,
                reference.latitude,
                reference.longitude,
            );
            if candidate.is_none() {
                cpr_stats.global_bad += 1;
            }
        } else {
            cpr_stats.global_skipped += 1;
        }
    }

    if candidate.is_none() {
        source = PosSource::Local;
        if let Some(reference) = &reference {
            candidate = cpr::surface_position_with_reference(
                me,
                reference.latitude,
                reference.longitude,
            );
        }
        if candidate.is_none() {
            cpr_stats.local_skipped += 1;
        }
    }

    if let Some(position) = candidate {
        if !gate_position(
            record,
            position,
            now,
            home,
            max_range_nm,
            cpr_stats,
        ) {
            candidate = None;
        }
    }

    match me.parity {
        CPRFormat::Even => {
            record.even_surface = Some(*me);
            record.even_surface_time = now;
        }
        CPRFormat::Odd => {
            record.odd_surface = Some(*me);
            record.odd_surface_time = now;
        }
    }

    let position = candidate?;
    match source {
        PosSource::Global => cpr_stats.global_ok += 1,
        PosSource::Local => cpr_stats.local_ok += 1,
    }
    accept_position(record, position, now, home);
    Some(position)
}

/// One aircraft as it appears in `/data/aircraft.json`
#[derive(Debug, Serialize, Deserialize)]
pub struct AircraftJson {
    pub hex: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub flight: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub squawk: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub alt_baro: Option<i32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub gs: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub track: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub baro_rate: Option<i16>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub lat: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub lon: Option<f64>,
    /// seconds since the position was observed
    #[serde(skip_serializing_if = "Option::is_none")]
    pub seen_pos: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub est_lat: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub est_lon: Option<f64>,
    pub seen: f64,
    pub messages: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rssi: Option<f64>,
    #[serde(rename = "r", skip_serializing_if = "Option::is_none")]
    pub registration: Option<String>,
    #[serde(rename = "t", skip_serializing_if = "Option::is_none")]
    pub typecode: Option<String>,
    #[serde(rename = "ownOp", skip_serializing_if = "Option::is_none")]
    pub operator: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub country: Option<String>,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub military: bool,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub ground: bool,
}

impl AircraftJson {
    fn from_record(record: &Aircraft, now: f64) -> Self {
        AircraftJson {
            hex: format!("{:06x}", record.addr),
            flight: record.callsign.clone(),
            squawk: record.squawk.map(|squawk| format!("{squawk:04x}")),
            alt_baro: record.altitude,
            gs: record.groundspeed,
            track: record.track,
            baro_rate: record.vertical_rate,
            lat: record.position.map(|p| p.latitude),
            lon: record.position.map(|p| p.longitude),
            seen_pos: record
                .position
                .map(|_| (now - record.position_time).max(0.)),
            est_lat: record.est_position.map(|p| p.latitude),
            est_lon: record.est_position.map(|p| p.longitude),
            seen: (now - record.seen_last).max(0.),
            messages: record.messages,
            rssi: record.rssi(),
            registration: record.registration.clone(),
            typecode: record.typecode.clone(),
            operator: record.operator.clone(),
            country: record.country.map(|c| c.to_string()),
            military: record.military,
            ground: record.on_ground,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hexlit::hex;
    use rx1090::prelude::*;

    const EVEN: [u8; 14] = hex!("8D40058B58C901375147EFD09357");
    const ODD: [u8; 14] = hex!("8D40058B58C904A87F402D3B8C59");

    fn message(bytes: &[u8]) -> Message {
        Message::from_bytes((bytes, 0)).unwrap().1
    }

    fn fleet() -> FleetTable {
        FleetTable::new(None, 360., 60.)
    }

    #[test]
    fn first_frame_creates_a_record_without_position() {
        let mut fleet = fleet();
        let db = AircraftDb::empty();
        let pos = fleet.update(&message(&EVEN), 0.0, Some(0.01), &db);

        assert_eq!(pos, None);
        let record = &fleet.aircraft[&0x40058b];
        assert_eq!(record.messages, 1);
        assert_eq!(record.show, ShowState::FirstTime);
        assert!(record.position.is_none());
        assert!(record.seen_first <= record.seen_last);
    }

    #[test]
    fn global_cpr_after_second_frame() {
        let mut fleet = fleet();
        let db = AircraftDb::empty();
        fleet.update(&message(&EVEN), 0.0, None, &db);
        let pos = fleet
            .update(&message(&ODD), 0.5, None, &db)
            .expect("global decode");

        assert!((pos.latitude - 49.81755).abs() < 1e-3);
        assert!((pos.longitude - 6.08442).abs() < 1e-3);
        assert_eq!(fleet.cpr.global_ok, 1);

        let record = &fleet.aircraft[&0x40058b];
        assert_eq!(record.position.unwrap().latitude, pos.latitude);
        assert_eq!(record.altitude, Some(39000));
    }

    #[test]
    fn cpr_pair_freshness_boundary() {
        let db = AircraftDb::empty();

        // exactly 10 s apart: the pair is rejected
        let mut fleet = fleet();
        fleet.update(&message(&EVEN), 0.0, None, &db);
        let pos = fleet.update(&message(&ODD), CPR_PAIR_WINDOW, None, &db);
        assert_eq!(pos, None);
        assert_eq!(fleet.cpr.global_ok, 0);

        // 9.999 s apart: accepted
        let mut fleet = FleetTable::new(None, 360., 60.);
        fleet.update(&message(&EVEN), 0.0, None, &db);
        let pos = fleet.update(&message(&ODD), 9.999, None, &db);
        assert!(pos.is_some());
    }

    #[test]
    fn range_gate_drops_impossible_positions() {
        // receiver pretends to be in Sydney, the pair decodes in Europe
        let home = Position {
            latitude: -33.9,
            longitude: 151.2,
        };
        let mut fleet = FleetTable::new(Some(home), 300., 60.);
        let db = AircraftDb::empty();
        fleet.update(&message(&EVEN), 0.0, None, &db);
        let pos = fleet.update(&message(&ODD), 0.5, None, &db);
        assert_eq!(pos, None);
        assert_eq!(fleet.cpr.range_checks, 1);
        assert!(fleet.aircraft[&0x40058b].position.is_none());
    }

    #[test]
    fn surveillance_replies_do_not_create_records() {
        let mut fleet = fleet();
        let db = AircraftDb::empty();
        // DF5 identity reply from 4d0131
        let msg = message(&hex!("28001a00e1d6ff"));
        assert_eq!(fleet.update(&msg, 0.0, None, &db), None);
        assert!(fleet.aircraft.is_empty());

        // once the aircraft is known, the squawk is applied
        fleet
            .aircraft
            .insert(0x4d0131, Aircraft::new(0x4d0131, 0.0, &db));
        fleet.update(&msg, 1.0, None, &db);
        assert!(fleet.aircraft[&0x4d0131].squawk.is_some());
    }

    #[test]
    fn show_state_lifecycle() {
        let mut fleet = fleet();
        let db = AircraftDb::empty();
        fleet.update(&message(&EVEN), 0.0, None, &db);

        let addr = 0x40058b;
        assert_eq!(fleet.aircraft[&addr].show, ShowState::FirstTime);

        fleet.publish_cycle(1.0);
        assert_eq!(fleet.aircraft[&addr].show, ShowState::Normal);

        // nothing heard for longer than the stale threshold
        fleet.publish_cycle(100.0);
        assert_eq!(fleet.aircraft[&addr].show, ShowState::LastTime);

        // one final appearance, then the record is gone
        fleet.publish_cycle(101.0);
        assert!(!fleet.aircraft.contains_key(&addr));
    }

    #[test]
    fn est_seen_last_never_lags_seen_last() {
        let mut fleet = fleet();
        let db = AircraftDb::empty();
        fleet
            .aircraft
            .insert(0x4d0131, Aircraft::new(0x4d0131, 0.0, &db));

        // squawk-only traffic: no heading or speed ever shows up, so
        // dead reckoning never runs for this record
        let msg = message(&hex!("28001a00e1d6ff"));
        fleet.update(&msg, 7.5, None, &db);
        fleet.tick(8.0);

        let record = &fleet.aircraft[&0x4d0131];
        assert!(record.seen_first <= record.seen_last);
        assert!(record.seen_last <= record.est_seen_last);
    }

    #[test]
    fn dead_reckoning_keeps_observed_position() {
        let mut fleet = fleet();
        let db = AircraftDb::empty();
        fleet.update(&message(&EVEN), 0.0, None, &db);
        fleet.update(&message(&ODD), 0.5, None, &db);

        // velocity: 159 kt on track 183
        let velocity = message(&hex!("8d40058b99440994083817e64d37"));
        fleet.update(&velocity, 0.6, None, &db);

        fleet.tick(10.6);
        let record = &fleet.aircraft[&0x40058b];
        let observed = record.position.unwrap();
        let estimate = record.est_position.unwrap();
        assert!((observed.latitude - 49.81755).abs() < 1e-3);
        // heading roughly south: the estimate moved, the observation not
        assert!(estimate.latitude < observed.latitude);
        assert!(record.est_seen_last >= record.seen_last);
    }

    #[test]
    fn snapshot_json_round_trip() {
        let mut fleet = fleet();
        let db = AircraftDb::empty();
        fleet.update(&message(&EVEN), 0.0, None, &db);
        fleet.update(&message(&ODD), 0.5, None, &db);
        fleet.update(
            &message(&hex!("8d406b902015a678d4d220aa4bda")),
            0.6,
            None,
            &db,
        );

        let json = fleet.to_json(1.0);
        let aircraft: Vec<AircraftJson> =
            serde_json::from_value(json["aircraft"].clone()).unwrap();
        assert_eq!(aircraft.len(), 2);

        let entry = aircraft.iter().find(|a| a.hex == "40058b").unwrap();
        let record = &fleet.aircraft[&0x40058b];
        assert_eq!(entry.alt_baro, record.altitude);
        let lat = record.position.unwrap().latitude;
        assert!((entry.lat.unwrap() - lat).abs() < 1e-6);

        let entry = aircraft.iter().find(|a| a.hex == "406b90").unwrap();
        assert_eq!(entry.flight.as_deref(), Some("EZY85MH"));
    }
}
