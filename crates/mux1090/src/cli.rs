use clap::Parser;
use rx1090::decode::cpr::Position;

use crate::services::Cidr;

/// One `host:port` endpoint for the active services
#[derive(Debug, Clone)]
pub struct Endpoint {
    pub host: String,
    pub port: u16,
}

impl std::str::FromStr for Endpoint {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s
            .strip_prefix("tcp://")
            .unwrap_or(s);
        let (host, port) = s
            .rsplit_once(':')
            .ok_or_else(|| format!("expected host:port, got '{s}'"))?;
        let port = port
            .parse::<u16>()
            .map_err(|e| format!("invalid port in '{s}': {e}"))?;
        Ok(Endpoint {
            host: host.to_string(),
            port,
        })
    }
}

impl std::fmt::Display for Endpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

/// Comma-separated CIDR entries; a trailing single octet `a/bits` is
/// auto-expanded to `a.0.0.0/bits` for compatibility
#[derive(Debug, Clone, Default)]
pub struct DenyList(pub Vec<Cidr>);

impl std::str::FromStr for DenyList {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        s.split(',')
            .map(|p| p.trim())
            .filter(|p| !p.is_empty())
            .map(|p| p.parse::<Cidr>())
            .collect::<Result<Vec<Cidr>, String>>()
            .map(DenyList)
    }
}

#[derive(Debug, Parser)]
#[command(
    name = "mux1090",
    version,
    about = "Demodulate Mode S from an SDR sample stream and re-publish \
             decoded aircraft over raw, SBS and HTTP endpoints"
)]
pub struct Options {
    /// Read 8-bit I/Q samples from this file instead of an SDR front end
    #[arg(long)]
    pub ifile: Option<String>,

    /// Pace the file replay at real time (2.4 Msps)
    #[arg(long, default_value = "false")]
    pub throttle: bool,

    /// Latitude of the receiver
    #[arg(long)]
    pub lat: Option<f64>,

    /// Longitude of the receiver
    #[arg(long)]
    pub lon: Option<f64>,

    /// Drop positions further than this many NM from the receiver
    #[arg(long, default_value = "300.0")]
    pub max_range: f64,

    /// Preamble acceptance threshold (in 1/32 units above the noise floor)
    #[arg(long, default_value = "75")]
    pub preamble_threshold: i32,

    /// Correct single bit errors using the CRC
    #[arg(long, default_value = "false")]
    pub fix_crc: bool,

    /// Also repair single bit errors in the DF field of long frames
    #[arg(long, default_value = "false")]
    pub fix_df: bool,

    /// Port for the raw Beast-like text input listener
    #[arg(long, default_value = "30001")]
    pub net_ri_port: u16,

    /// Port for the raw Beast-like text output listener
    #[arg(long, default_value = "30002")]
    pub net_ro_port: u16,

    /// Port for the SBS/Basestation output listener
    #[arg(long, default_value = "30003")]
    pub net_sbs_port: u16,

    /// Port for the SBS/Basestation input listener
    #[arg(long, default_value = "30004")]
    pub net_sbsi_port: u16,

    /// Port for the HTTP server
    #[arg(long, default_value = "8080")]
    pub net_http_port: u16,

    /// Accept raw input over UDP instead of TCP
    #[arg(long, default_value = "false")]
    pub net_ri_udp: bool,

    /// Connect out for raw input instead of listening, as host:port
    #[arg(long)]
    pub host_raw: Option<Endpoint>,

    /// Connect out for SBS input instead of listening, as host:port
    #[arg(long)]
    pub host_sbs: Option<Endpoint>,

    /// Deny list for raw services, comma-separated CIDR entries
    #[arg(long)]
    pub deny_raw: Option<DenyList>,

    /// Deny list for SBS services, comma-separated CIDR entries
    #[arg(long)]
    pub deny_sbs: Option<DenyList>,

    /// Deny list for the HTTP service, comma-separated CIDR entries
    #[arg(long)]
    pub deny_http: Option<DenyList>,

    /// Root directory for the files served over HTTP
    #[arg(long, default_value = "web")]
    pub web_root: String,

    /// Page that / redirects to
    #[arg(long, default_value = "index.html")]
    pub web_page: String,

    /// Serve the built-in packed filesystem instead of web-root
    #[arg(long, default_value = "false")]
    pub packed_web: bool,

    /// Do not honour HTTP keep-alive requests
    #[arg(long, default_value = "false")]
    pub no_keep_alive: bool,

    /// Refresh interval advertised in receiver.json, in milliseconds
    #[arg(long, default_value = "1000")]
    pub json_interval: u64,

    /// Aircraft are dropped after this many seconds without a message
    #[arg(long, short = 'x', default_value = "60")]
    pub expire: u64,

    /// Path to the aircraft metadata CSV database
    #[arg(long)]
    pub aircraft_db: Option<String>,

    /// Print every decoded message as JSON
    #[arg(short, long, default_value = "false")]
    pub verbose: bool,
}

impl Options {
    pub fn home(&self) -> Option<Position> {
        match (self.lat, self.lon) {
            (Some(latitude), Some(longitude)) => Some(Position {
                latitude,
                longitude,
            }),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_endpoint() {
        let ep: Endpoint = "localhost:30005".parse().unwrap();
        assert_eq!(ep.host, "localhost");
        assert_eq!(ep.port, 30005);

        let ep: Endpoint = "tcp://10.0.0.2:30001".parse().unwrap();
        assert_eq!(ep.host, "10.0.0.2");
        assert_eq!(ep.port, 30001);

        assert!("noport".parse::<Endpoint>().is_err());
    }

    #[test]
    fn test_deny_list() {
        let list: DenyList = "10/8, 192.168.0.0/16".parse().unwrap();
        assert_eq!(list.0.len(), 2);
        assert_eq!(format!("{}", list.0[0]), "10.0.0.0/8");
        assert_eq!(format!("{}", list.0[1]), "192.168.0.0/16");

        assert!("10/8,bogus".parse::<DenyList>().is_err());
    }
}
