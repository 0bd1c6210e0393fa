/*!
 * The five network services and their client registries.
 *
 * Every service owns an arena of client records; a record is addressed by
 * a stable index plus a generation counter, so a handle kept across a
 * removal is detected instead of resolving to an unrelated client. The
 * publisher walks clients in insertion order, which keeps subscribers
 * seeing fleet updates in arrival order.
 */
use std::future::Future;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::time::Duration;

use tokio::net::TcpStream;
use tokio::sync::mpsc::UnboundedSender;
use tracing::{debug, info};

/// Timeout armed for every active connect attempt
pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ServiceKind {
    RawIn,
    RawOut,
    SbsIn,
    SbsOut,
    Http,
}

impl ServiceKind {
    pub const ALL: [ServiceKind; 5] = [
        ServiceKind::RawOut,
        ServiceKind::RawIn,
        ServiceKind::SbsOut,
        ServiceKind::SbsIn,
        ServiceKind::Http,
    ];

    pub fn name(self) -> &'static str {
        match self {
            ServiceKind::RawOut => "Raw TCP output",
            ServiceKind::RawIn => "Raw TCP input",
            ServiceKind::SbsOut => "SBS TCP output",
            ServiceKind::SbsIn => "SBS TCP input",
            ServiceKind::Http => "HTTP server",
        }
    }
}

impl std::fmt::Display for ServiceKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// An IPv4 network in CIDR notation. A spec with fewer than four octets
/// is padded with zeroes, so `10/8` reads as `10.0.0.0/8`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Cidr {
    net: u32,
    bits: u8,
}

impl Cidr {
    pub fn matches(&self, ip: Ipv4Addr) -> bool {
        let mask = if self.bits == 0 {
            0
        } else {
            u32::MAX << (32 - self.bits)
        };
        (u32::from(ip) & mask) == (self.net & mask)
    }
}

impl std::str::FromStr for Cidr {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (addr, bits) = s
            .split_once('/')
            .ok_or_else(|| format!("missing /bits in '{s}'"))?;
        let bits = bits
            .parse::<u8>()
            .map_err(|e| format!("invalid prefix in '{s}': {e}"))?;
        if bits > 32 {
            return Err(format!("prefix too long in '{s}'"));
        }
        let mut octets = [0u8; 4];
        let parts: Vec<&str> = addr.split('.').collect();
        if parts.is_empty() || parts.len() > 4 {
            return Err(format!("invalid address in '{s}'"));
        }
        for (i, part) in parts.iter().enumerate() {
            octets[i] = part
                .parse::<u8>()
                .map_err(|e| format!("invalid octet in '{s}': {e}"))?;
        }
        Ok(Cidr {
            net: u32::from(Ipv4Addr::from(octets)),
            bits,
        })
    }
}

impl std::fmt::Display for Cidr {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", Ipv4Addr::from(self.net), self.bits)
    }
}

/// A stable handle to a client record: index into the arena plus the
/// generation the slot had when the record was created
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ClientId {
    index: usize,
    generation: u32,
}

/// One live socket belonging to a service
#[derive(Debug)]
pub struct Client {
    /// connection id, unique for the process lifetime
    pub id: u64,
    pub addr: SocketAddr,
    /// accepted on a listener, as opposed to actively initiated
    pub accepted: bool,
    /// send queue towards the writer half, for the out services
    pub sender: Option<UnboundedSender<Vec<u8>>>,
}

struct Slot {
    generation: u32,
    client: Option<Client>,
}

/// Index-keyed client arena with O(1) free and insertion-order iteration
#[derive(Default)]
pub struct Arena {
    slots: Vec<Slot>,
    free: Vec<usize>,
    order: Vec<ClientId>,
    live: usize,
}

impl Arena {
    pub fn insert(&mut self, client: Client) -> ClientId {
        let index = match self.free.pop() {
            Some(index) => {
                self.slots[index].client = Some(client);
                index
            }
            None => {
                self.slots.push(Slot {
                    generation: 0,
                    client: Some(client),
                });
                self.slots.len() - 1
            }
        };
        let id = ClientId {
            index,
            generation: self.slots[index].generation,
        };
        self.order.push(id);
        self.live += 1;
        id
    }

    pub fn get(&self, id: ClientId) -> Option<&Client> {
        let slot = self.slots.get(id.index)?;
        if slot.generation != id.generation {
            return None;
        }
        slot.client.as_ref()
    }

    pub fn get_mut(&mut self, id: ClientId) -> Option<&mut Client> {
        let slot = self.slots.get_mut(id.index)?;
        if slot.generation != id.generation {
            return None;
        }
        slot.client.as_mut()
    }

    pub fn remove(&mut self, id: ClientId) -> Option<Client> {
        let slot = self.slots.get_mut(id.index)?;
        if slot.generation != id.generation {
            return None;
        }
        let client = slot.client.take()?;
        slot.generation += 1;
        self.free.push(id.index);
        self.live -= 1;
        // the order list is cleaned lazily once it outgrows the live set
        if self.order.len() > 2 * self.live + 8 {
            let slots = &self.slots;
            self.order.retain(|id| {
                slots[id.index].generation == id.generation
            });
        }
        Some(client)
    }

    pub fn len(&self) -> usize {
        self.live
    }

    pub fn is_empty(&self) -> bool {
        self.live == 0
    }

    /// Iterate live clients in insertion order
    pub fn iter(&self) -> impl Iterator<Item = (ClientId, &Client)> {
        self.order.iter().filter_map(move |&id| {
            let slot = &self.slots[id.index];
            if slot.generation == id.generation {
                slot.client.as_ref().map(|c| (id, c))
            } else {
                None
            }
        })
    }
}

/// Everything one logical service keeps: listener parameters, client
/// registry, counters and the last error
pub struct Service {
    pub kind: ServiceKind,
    pub port: u16,
    pub url: Option<String>,
    pub clients: Arena,
    pub bytes_in: u64,
    pub bytes_out: u64,
    pub accepted: u64,
    pub removed: u64,
    pub unknown: u64,
    pub connected: u64,
    pub unique_clients: u64,
    pub last_error: Option<String>,
    pub deny: Vec<Cidr>,
}

impl Service {
    fn new(kind: ServiceKind, port: u16) -> Self {
        Service {
            kind,
            port,
            url: None,
            clients: Arena::default(),
            bytes_in: 0,
            bytes_out: 0,
            accepted: 0,
            removed: 0,
            unknown: 0,
            connected: 0,
            unique_clients: 0,
            last_error: None,
            deny: Vec::new(),
        }
    }

    pub fn store_error(&mut self, err: String) {
        debug!("{err}");
        self.last_error = Some(err);
    }

    pub fn open_connections(&self) -> usize {
        self.clients.len()
    }
}

/// An append-only record of distinct client addresses, for the report
pub struct UniqueIp {
    pub addr: IpAddr,
    pub kind: ServiceKind,
    pub seen: f64,
}

pub struct ServiceSet {
    pub raw_in: Service,
    pub raw_out: Service,
    pub sbs_in: Service,
    pub sbs_out: Service,
    pub http: Service,
    pub unique_ips: Vec<UniqueIp>,
    next_conn_id: u64,
}

impl ServiceSet {
    pub fn new(
        raw_in_port: u16,
        raw_out_port: u16,
        sbs_in_port: u16,
        sbs_out_port: u16,
        http_port: u16,
    ) -> Self {
        ServiceSet {
            raw_in: Service::new(ServiceKind::RawIn, raw_in_port),
            raw_out: Service::new(ServiceKind::RawOut, raw_out_port),
            sbs_in: Service::new(ServiceKind::SbsIn, sbs_in_port),
            sbs_out: Service::new(ServiceKind::SbsOut, sbs_out_port),
            http: Service::new(ServiceKind::Http, http_port),
            unique_ips: Vec::new(),
            next_conn_id: 1,
        }
    }

    pub fn get(&self, kind: ServiceKind) -> &Service {
        match kind {
            ServiceKind::RawIn => &self.raw_in,
            ServiceKind::RawOut => &self.raw_out,
            ServiceKind::SbsIn => &self.sbs_in,
            ServiceKind::SbsOut => &self.sbs_out,
            ServiceKind::Http => &self.http,
        }
    }

    pub fn get_mut(&mut self, kind: ServiceKind) -> &mut Service {
        match kind {
            ServiceKind::RawIn => &mut self.raw_in,
            ServiceKind::RawOut => &mut self.raw_out,
            ServiceKind::SbsIn => &mut self.sbs_in,
            ServiceKind::SbsOut => &mut self.sbs_out,
            ServiceKind::Http => &mut self.http,
        }
    }

    /// Access control for an incoming connection. Loopback peers are
    /// always admitted; everyone else is recorded in the unique-IP set
    /// and checked against the service's deny list.
    pub fn client_admit(
        &mut self,
        kind: ServiceKind,
        addr: SocketAddr,
        now: f64,
    ) -> bool {
        let ip = addr.ip();
        if ip.is_loopback() {
            return true;
        }

        if !self.unique_ips.iter().any(|u| u.addr == ip) {
            self.unique_ips.push(UniqueIp {
                addr: ip,
                kind,
                seen: now,
            });
            self.get_mut(kind).unique_clients += 1;
        }

        let deny = match ip {
            IpAddr::V4(ip4) => {
                self.get(kind).deny.iter().any(|c| c.matches(ip4))
            }
            // no deny list support for IPv6 peers
            IpAddr::V6(_) => false,
        };
        if deny {
            info!("Opening connection: {addr} denied (service: \"{kind}\")");
        }
        !deny
    }

    /// Register a connection with its service; `accepted` distinguishes
    /// listener clients from actively initiated connections.
    pub fn add_client(
        &mut self,
        kind: ServiceKind,
        addr: SocketAddr,
        accepted: bool,
        sender: Option<UnboundedSender<Vec<u8>>>,
    ) -> ClientId {
        let id = self.next_conn_id;
        self.next_conn_id += 1;
        let service = self.get_mut(kind);
        if accepted {
            service.accepted += 1;
        } else {
            service.connected += 1;
        }
        debug!("Opening connection: {addr} (conn-id: {id}, service: \"{kind}\")");
        service.clients.insert(Client {
            id,
            addr,
            accepted,
            sender,
        })
    }

    /// Unlink and free one connection record. A stale handle (already
    /// freed, slot reused) is counted as unknown and ignored.
    pub fn free_client(&mut self, kind: ServiceKind, id: ClientId) {
        let service = self.get_mut(kind);
        match service.clients.remove(id) {
            Some(client) => {
                service.removed += 1;
                debug!(
                    "Closing connection: {} (conn-id: {}, service: \"{kind}\")",
                    client.addr, client.id
                );
            }
            None => service.unknown += 1,
        }
    }

    /// Send one payload to every subscriber of an out service, in
    /// insertion order. Clients whose writer is gone are freed.
    pub fn broadcast(&mut self, kind: ServiceKind, payload: &[u8]) {
        let service = self.get_mut(kind);
        let mut dead = Vec::new();
        let mut sent = 0u64;
        for (id, client) in service.clients.iter() {
            if let Some(sender) = &client.sender {
                if sender.send(payload.to_vec()).is_ok() {
                    sent += 1;
                } else {
                    dead.push(id);
                }
            }
        }
        service.bytes_out += sent * payload.len() as u64;
        for id in dead {
            self.free_client(kind, id);
        }
    }
}

/// Wrap an active connect attempt with the per-service timeout. The error
/// string is what ends up in the service's last-error slot.
pub async fn connect_with_timeout<F>(
    connect: F,
    timeout: Duration,
    kind: ServiceKind,
    url: &str,
) -> Result<TcpStream, String>
where
    F: Future<Output = std::io::Result<TcpStream>>,
{
    match tokio::time::timeout(timeout, connect).await {
        Err(_elapsed) => Err(format!(
            "Timeout in connection to host {url} (service: \"{}\")",
            kind.name()
        )),
        Ok(Err(e)) => Err(format!(
            "Connection to host {url} failed; {e} (service: \"{}\")",
            kind.name()
        )),
        Ok(Ok(stream)) => Ok(stream),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::SocketAddr;

    fn addr(s: &str) -> SocketAddr {
        s.parse().unwrap()
    }

    #[test]
    fn cidr_expansion_and_matching() {
        let cidr: Cidr = "10/8".parse().unwrap();
        assert_eq!(format!("{cidr}"), "10.0.0.0/8");
        assert!(cidr.matches(Ipv4Addr::new(10, 1, 2, 3)));
        assert!(!cidr.matches(Ipv4Addr::new(11, 1, 2, 3)));

        let cidr: Cidr = "192.168/16".parse().unwrap();
        assert!(cidr.matches(Ipv4Addr::new(192, 168, 44, 5)));
        assert!(!cidr.matches(Ipv4Addr::new(192, 169, 44, 5)));

        assert!("1.2.3.4".parse::<Cidr>().is_err());
        assert!("1.2.3.4/40".parse::<Cidr>().is_err());
    }

    #[test]
    fn arena_generations_catch_stale_handles() {
        let mut arena = Arena::default();
        let a = arena.insert(Client {
            id: 1,
            addr: addr("127.0.0.1:4000"),
            accepted: true,
            sender: None,
        });
        assert!(arena.get(a).is_some());
        assert!(arena.remove(a).is_some());
        assert!(arena.get(a).is_none());

        // the slot is reused under a new generation
        let b = arena.insert(Client {
            id: 2,
            addr: addr("127.0.0.1:4001"),
            accepted: true,
            sender: None,
        });
        assert!(arena.get(a).is_none());
        assert_eq!(arena.get(b).unwrap().id, 2);
        assert!(arena.remove(a).is_none());
        assert_eq!(arena.len(), 1);
    }

    #[test]
    fn accepts_minus_removes_is_open_connections() {
        let mut set = ServiceSet::new(30001, 30002, 30004, 30003, 8080);
        let a = set.add_client(
            ServiceKind::RawOut,
            addr("127.0.0.1:50000"),
            true,
            None,
        );
        let _b = set.add_client(
            ServiceKind::RawOut,
            addr("127.0.0.1:50001"),
            true,
            None,
        );
        set.free_client(ServiceKind::RawOut, a);

        let service = set.get(ServiceKind::RawOut);
        assert_eq!(
            service.accepted - service.removed,
            service.open_connections() as u64
        );
    }

    #[tokio::test]
    async fn raw_out_preserves_order() {
        let mut set = ServiceSet::new(30001, 30002, 30004, 30003, 8080);
        let (tx1, mut rx1) = tokio::sync::mpsc::unbounded_channel();
        let (tx2, mut rx2) = tokio::sync::mpsc::unbounded_channel();
        set.add_client(
            ServiceKind::RawOut,
            addr("127.0.0.1:50000"),
            true,
            Some(tx1),
        );
        set.add_client(
            ServiceKind::RawOut,
            addr("127.0.0.1:50001"),
            true,
            Some(tx2),
        );

        set.broadcast(ServiceKind::RawOut, b"*8d4840d6202cc371c32ce0576098;\n");
        set.broadcast(ServiceKind::RawOut, b"*5d4840d6a6d3f9;\n");

        for rx in [&mut rx1, &mut rx2] {
            assert_eq!(
                rx.try_recv().unwrap(),
                b"*8d4840d6202cc371c32ce0576098;\n".to_vec()
            );
            assert_eq!(rx.try_recv().unwrap(), b"*5d4840d6a6d3f9;\n".to_vec());
        }
    }

    #[test]
    fn deny_list_blocks_external_peers() {
        let mut set = ServiceSet::new(30001, 30002, 30004, 30003, 8080);
        set.raw_out.deny.push("10/8".parse().unwrap());

        // loopback is always admitted
        assert!(set.client_admit(
            ServiceKind::RawOut,
            addr("127.0.0.1:9999"),
            0.
        ));
        assert!(set.client_admit(
            ServiceKind::RawOut,
            addr("172.16.0.9:9999"),
            0.
        ));
        assert!(!set.client_admit(
            ServiceKind::RawOut,
            addr("10.2.3.4:9999"),
            0.
        ));

        // two distinct external addresses were seen
        assert_eq!(set.unique_ips.len(), 2);
        assert_eq!(set.get(ServiceKind::RawOut).unique_clients, 2);
    }

    #[tokio::test]
    async fn active_connect_times_out() {
        let err = connect_with_timeout(
            std::future::pending(),
            Duration::from_millis(50),
            ServiceKind::RawIn,
            "10.255.255.1:30005",
        )
        .await
        .unwrap_err();
        assert!(err.starts_with("Timeout in connection to host"));
        assert!(err.contains("Raw TCP input"));
    }
}
