//! SSDP transport (§4.3, §6.1 wire format): the dual multicast/unicast socket model,
//! the five message kinds, search-target dispatch against a device tree, and
//! CACHE-CONTROL clamping. `crate::host` drives the responder/announcer side of this
//! module; `crate::control_point` drives the consumer/searcher side.

use std::{
    fmt::Display,
    net::{Ipv4Addr, SocketAddr, SocketAddrV4},
    str::FromStr,
};

use anyhow::Context;
use socket2::{Domain, Protocol, Socket, Type};
use tokio::net::UdpSocket;

use crate::{
    model::Device,
    types::{ResourceType, Udn, Usn, VersionMatch, Timeout},
};

pub const SSDP_MULTICAST_IP: Ipv4Addr = Ipv4Addr::new(239, 255, 255, 250);
pub const SSDP_PORT: u16 = 1900;

pub fn ssdp_multicast_addr() -> SocketAddr {
    SocketAddr::V4(SocketAddrV4::new(SSDP_MULTICAST_IP, SSDP_PORT))
}

/// Binds the multicast listener: joins `239.255.255.250` on `iface`, bound to
/// `0.0.0.0:1900` so NOTIFY/M-SEARCH traffic from any peer on the group is received
/// (mirrors the teacher's `bind_ssdp_socket`, generalized to a caller-chosen TTL).
pub fn bind_multicast_socket(iface: Ipv4Addr, ttl: u32) -> anyhow::Result<UdpSocket> {
    let socket = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))?;
    socket.set_ttl(ttl)?;
    socket.set_reuse_address(true)?;
    socket.set_nonblocking(true)?;
    socket.set_multicast_loop_v4(true)?;
    socket.join_multicast_v4(&SSDP_MULTICAST_IP, &iface)?;
    socket.bind(&SocketAddr::V4(SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, SSDP_PORT)).into())?;
    Ok(UdpSocket::from_std(socket.into())?)
}

/// Binds the per-instance unicast socket (§4.3): `iface:1900` if free (it usually isn't,
/// since the multicast listener above already holds it on most stacks), else the first
/// free port in UDA's ephemeral range `[49152, 65535]`. Outbound announcements and
/// M-SEARCH requests go out from this socket.
pub async fn bind_unicast_socket(iface: Ipv4Addr) -> anyhow::Result<UdpSocket> {
    if let Ok(socket) = UdpSocket::bind(SocketAddr::V4(SocketAddrV4::new(iface, SSDP_PORT))).await {
        return Ok(socket);
    }
    for port in 49152..=65535u16 {
        if let Ok(socket) = UdpSocket::bind(SocketAddr::V4(SocketAddrV4::new(iface, port))).await {
            return Ok(socket);
        }
    }
    anyhow::bail!("no free port in the ephemeral range [49152, 65535]")
}

/// UDP-connect-to-a-public-address trick to discover which local interface the OS
/// would route outbound traffic through; no packets actually reach the far end.
/// NOTE: doesn't account for multi-homed hosts that want a specific interface chosen.
pub async fn resolve_local_addr() -> anyhow::Result<Ipv4Addr> {
    let probe = UdpSocket::bind(SocketAddr::V4(SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, 0))).await?;
    probe
        .connect(SocketAddr::V4(SocketAddrV4::new(Ipv4Addr::new(8, 8, 8, 8), 0)))
        .await?;
    match probe.local_addr().context("read local addr")?.ip() {
        std::net::IpAddr::V4(addr) => Ok(addr),
        std::net::IpAddr::V6(_) => anyhow::bail!("resolved an IPv6 local address, IPv6 is out of scope"),
    }
}

/// A parsed `ST:`/`NT:` value (§4.3 search-target dispatch).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SearchTarget {
    All,
    RootDevice,
    Uuid(Udn),
    Device(ResourceType),
    Service(ResourceType),
}

impl SearchTarget {
    /// The literal token as it appears on the wire, used both to echo `ST:` on a
    /// discovery response to a non-`ssdp:all` request and to build the byebye/renewal
    /// `NT:` value for a specific resource.
    pub fn header_value(&self) -> String {
        match self {
            SearchTarget::All => "ssdp:all".to_owned(),
            SearchTarget::RootDevice => "upnp:rootdevice".to_owned(),
            SearchTarget::Uuid(udn) => udn.to_string(),
            SearchTarget::Device(rt) | SearchTarget::Service(rt) => rt.to_string(),
        }
    }
}

impl Display for SearchTarget {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.header_value())
    }
}

impl FromStr for SearchTarget {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        use crate::types::ResourceKind;
        Ok(match s {
            "ssdp:all" => SearchTarget::All,
            "upnp:rootdevice" => SearchTarget::RootDevice,
            rest if rest.starts_with("uuid:") => SearchTarget::Uuid(Udn::from_str(rest)?),
            rest if rest.starts_with("urn:") => {
                let rt = ResourceType::from_str(rest)?;
                match rt.kind {
                    ResourceKind::Device => SearchTarget::Device(rt),
                    ResourceKind::Service => SearchTarget::Service(rt),
                }
            }
            other => anyhow::bail!("unrecognized search target {other}"),
        })
    }
}

/// Every `(NT-or-ST text, USN)` pair a root device tree advertises in one alive burst
/// or `ssdp:all` discovery response: root-flag + bare UDN + device type for every
/// device in the tree, plus one entry per service (§4.3's announcement cadence).
pub fn alive_targets(root: &std::sync::Arc<Device>) -> Vec<(String, Usn)> {
    let mut out = Vec::new();
    collect_device_targets(root, true, &mut out);
    out
}

fn collect_device_targets(device: &Device, is_root: bool, out: &mut Vec<(String, Usn)>) {
    let udn = device.udn.clone();
    if is_root {
        out.push(("upnp:rootdevice".to_owned(), Usn::root_device(udn.clone())));
    }
    out.push((udn.to_string(), Usn::bare(udn.clone())));
    out.push((
        device.device_type.to_string(),
        Usn::resource_type(udn.clone(), device.device_type.clone()),
    ));
    for service in &device.services {
        out.push((
            service.service_type.to_string(),
            Usn::resource_type(udn.clone(), service.service_type.clone()),
        ));
    }
    for embedded in &device.embedded_devices {
        collect_device_targets(embedded, false, out);
    }
}

/// Dispatches one search target against a root device tree (§4.3), returning the
/// `(ST text, USN)` pairs to answer with. Inclusive version matching is used for
/// device/service type searches per §4.1.
pub fn search_responses(target: &SearchTarget, root: &std::sync::Arc<Device>) -> Vec<(String, Usn)> {
    let devices = root.walk();
    match target {
        SearchTarget::All => alive_targets(root),
        SearchTarget::RootDevice => {
            vec![("upnp:rootdevice".to_owned(), Usn::root_device(root.udn.clone()))]
        }
        SearchTarget::Uuid(udn) => devices
            .iter()
            .find(|d| &d.udn == udn)
            .map(|d| vec![(d.udn.to_string(), Usn::bare(d.udn.clone()))])
            .unwrap_or_default(),
        SearchTarget::Device(rt) => devices
            .iter()
            .filter(|d| rt.matches(&d.device_type, VersionMatch::Inclusive))
            .map(|d| (rt.to_string(), Usn::resource_type(d.udn.clone(), d.device_type.clone())))
            .collect(),
        SearchTarget::Service(rt) => devices
            .iter()
            .flat_map(|d| {
                d.services
                    .iter()
                    .filter(|s| rt.matches(&s.service_type, VersionMatch::Inclusive))
                    .map(|s| (rt.to_string(), Usn::resource_type(d.udn.clone(), s.service_type.clone())))
                    .collect::<Vec<_>>()
            })
            .collect(),
    }
}

fn rfc1123_now() -> String {
    let now = time::OffsetDateTime::now_utc();
    let format = time::format_description::parse_borrowed::<2>(
        "[weekday repr:short], [day padding:zero] [month repr:short] [year] [hour]:[minute]:[second] GMT",
    )
    .expect("format description is a compile-time constant");
    now.format(&format).expect("RFC1123 formatting cannot fail for a valid OffsetDateTime")
}

/// `NOTIFY * HTTP/1.1` with `NTS: ssdp:alive` (§6.1, bit-exact).
#[derive(Debug, Clone)]
pub struct AliveMessage {
    pub nt: String,
    pub usn: Usn,
    pub location: String,
    pub cache_control: Timeout,
    pub server: String,
    pub boot_id: u32,
    pub config_id: u32,
    pub search_port: Option<u16>,
}

impl Display for AliveMessage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "NOTIFY * HTTP/1.1\r\n\
HOST: {host}\r\n\
CACHE-CONTROL: max-age={max_age}\r\n\
LOCATION: {location}\r\n\
NT: {nt}\r\n\
NTS: ssdp:alive\r\n\
SERVER: {server}\r\n\
USN: {usn}\r\n\
BOOTID.UPNP.ORG: {boot_id}\r\n\
CONFIGID.UPNP.ORG: {config_id}\r\n",
            host = ssdp_multicast_addr(),
            max_age = self.cache_control.0,
            location = self.location,
            nt = self.nt,
            server = self.server,
            usn = self.usn,
            boot_id = self.boot_id,
            config_id = self.config_id,
        )?;
        if let Some(port) = self.search_port {
            write!(f, "SEARCHPORT.UPNP.ORG: {port}\r\n")?;
        }
        write!(f, "\r\n")
    }
}

/// Same header set as [`AliveMessage`] minus `LOCATION`/`CACHE-CONTROL`/`SERVER` (§6.1).
#[derive(Debug, Clone)]
pub struct ByeByeMessage {
    pub nt: String,
    pub usn: Usn,
    pub boot_id: u32,
    pub config_id: u32,
}

impl Display for ByeByeMessage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "NOTIFY * HTTP/1.1\r\n\
HOST: {host}\r\n\
NT: {nt}\r\n\
NTS: ssdp:byebye\r\n\
USN: {usn}\r\n\
BOOTID.UPNP.ORG: {boot_id}\r\n\
CONFIGID.UPNP.ORG: {config_id}\r\n\r\n",
            host = ssdp_multicast_addr(),
            nt = self.nt,
            usn = self.usn,
            boot_id = self.boot_id,
            config_id = self.config_id,
        )
    }
}

/// `NOTIFY * HTTP/1.1` with `NTS: ssdp:update` (§6.1, UDA 1.1 only).
#[derive(Debug, Clone)]
pub struct UpdateMessage {
    pub nt: String,
    pub usn: Usn,
    pub location: String,
    pub boot_id: u32,
    pub config_id: u32,
    pub next_boot_id: u32,
    pub search_port: Option<u16>,
}

impl Display for UpdateMessage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "NOTIFY * HTTP/1.1\r\n\
HOST: {host}\r\n\
LOCATION: {location}\r\n\
NT: {nt}\r\n\
NTS: ssdp:update\r\n\
USN: {usn}\r\n\
BOOTID.UPNP.ORG: {boot_id}\r\n\
CONFIGID.UPNP.ORG: {config_id}\r\n\
NEXTBOOTID.UPNP.ORG: {next_boot_id}\r\n",
            host = ssdp_multicast_addr(),
            location = self.location,
            nt = self.nt,
            usn = self.usn,
            boot_id = self.boot_id,
            config_id = self.config_id,
            next_boot_id = self.next_boot_id,
        )?;
        if let Some(port) = self.search_port {
            write!(f, "SEARCHPORT.UPNP.ORG: {port}\r\n")?;
        }
        write!(f, "\r\n")
    }
}

/// `M-SEARCH * HTTP/1.1` (§6.1).
#[derive(Debug, Clone)]
pub struct SearchRequest {
    pub st: SearchTarget,
    pub mx: u8,
    pub user_agent: Option<String>,
}

impl Display for SearchRequest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "M-SEARCH * HTTP/1.1\r\n\
HOST: {host}\r\n\
MAN: \"ssdp:discover\"\r\n\
MX: {mx}\r\n\
ST: {st}\r\n",
            host = ssdp_multicast_addr(),
            mx = self.mx,
            st = self.st,
        )?;
        if let Some(user_agent) = &self.user_agent {
            write!(f, "USER-AGENT: {user_agent}\r\n")?;
        }
        write!(f, "\r\n")
    }
}

/// `HTTP/1.1 200 OK` discovery response to an M-SEARCH (§6.1).
#[derive(Debug, Clone)]
pub struct DiscoveryResponse {
    pub st: String,
    pub usn: Usn,
    pub location: String,
    pub cache_control: Timeout,
    pub server: String,
    pub boot_id: u32,
    pub config_id: u32,
    pub search_port: Option<u16>,
}

impl Display for DiscoveryResponse {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "HTTP/1.1 200 OK\r\n\
CACHE-CONTROL: max-age={max_age}\r\n\
DATE: {date}\r\n\
EXT:\r\n\
LOCATION: {location}\r\n\
SERVER: {server}\r\n\
ST: {st}\r\n\
USN: {usn}\r\n\
BOOTID.UPNP.ORG: {boot_id}\r\n\
CONFIGID.UPNP.ORG: {config_id}\r\n",
            max_age = self.cache_control.0,
            date = rfc1123_now(),
            location = self.location,
            server = self.server,
            st = self.st,
            usn = self.usn,
            boot_id = self.boot_id,
            config_id = self.config_id,
        )?;
        if let Some(port) = self.search_port {
            write!(f, "SEARCHPORT.UPNP.ORG: {port}\r\n")?;
        }
        write!(f, "\r\n")
    }
}

#[derive(Debug, Clone)]
pub enum SsdpMessage {
    Alive(AliveMessage),
    ByeBye(ByeByeMessage),
    Update(UpdateMessage),
    Search(SearchRequest),
    DiscoveryResponse(DiscoveryResponse),
}

impl SsdpMessage {
    /// Parses a raw datagram's header-style lines into one of the five kinds (§4.3).
    /// Malformed messages should be logged and dropped by the caller, not propagated.
    pub fn parse(raw: &str) -> anyhow::Result<Self> {
        let mut lines = raw.lines();
        let request_line = lines.next().context("empty datagram")?;
        let headers: Vec<(&str, &str)> = lines.filter_map(|l| l.split_once(':')).collect();
        let get = |name: &str| -> Option<&str> {
            headers
                .iter()
                .find(|(k, _)| k.eq_ignore_ascii_case(name))
                .map(|(_, v)| v.trim())
        };

        if request_line.starts_with("M-SEARCH") {
            let st = get("ST").context("missing ST")?.parse()?;
            let mx: u8 = get("MX").context("missing MX")?.parse().context("parse MX")?;
            let user_agent = get("USER-AGENT").map(str::to_owned);
            return Ok(SsdpMessage::Search(SearchRequest { st, mx, user_agent }));
        }

        if request_line.starts_with("HTTP/1.1 200") {
            let cache_control = parse_cache_control(get("CACHE-CONTROL").context("missing CACHE-CONTROL")?)?;
            let usn = Usn::from_str(get("USN").context("missing USN")?)?;
            return Ok(SsdpMessage::DiscoveryResponse(DiscoveryResponse {
                st: get("ST").context("missing ST")?.to_owned(),
                usn,
                location: get("LOCATION").context("missing LOCATION")?.to_owned(),
                cache_control,
                server: get("SERVER").context("missing SERVER")?.to_owned(),
                boot_id: get("BOOTID.UPNP.ORG").and_then(|v| v.parse().ok()).unwrap_or(0),
                config_id: get("CONFIGID.UPNP.ORG").and_then(|v| v.parse().ok()).unwrap_or(0),
                search_port: get("SEARCHPORT.UPNP.ORG").and_then(|v| v.parse().ok()),
            }));
        }

        if request_line.starts_with("NOTIFY") {
            let nts = get("NTS").context("missing NTS")?;
            let nt = get("NT").context("missing NT")?.to_owned();
            let usn = Usn::from_str(get("USN").context("missing USN")?)?;
            let boot_id = get("BOOTID.UPNP.ORG").and_then(|v| v.parse().ok()).unwrap_or(0);
            let config_id = get("CONFIGID.UPNP.ORG").and_then(|v| v.parse().ok()).unwrap_or(0);
            return match nts {
                "ssdp:alive" => {
                    let cache_control =
                        parse_cache_control(get("CACHE-CONTROL").context("missing CACHE-CONTROL")?)?;
                    Ok(SsdpMessage::Alive(AliveMessage {
                        nt,
                        usn,
                        location: get("LOCATION").context("missing LOCATION")?.to_owned(),
                        cache_control,
                        server: get("SERVER").context("missing SERVER")?.to_owned(),
                        boot_id,
                        config_id,
                        search_port: get("SEARCHPORT.UPNP.ORG").and_then(|v| v.parse().ok()),
                    }))
                }
                "ssdp:byebye" => Ok(SsdpMessage::ByeBye(ByeByeMessage {
                    nt,
                    usn,
                    boot_id,
                    config_id,
                })),
                "ssdp:update" => Ok(SsdpMessage::Update(UpdateMessage {
                    nt,
                    usn,
                    location: get("LOCATION").context("missing LOCATION")?.to_owned(),
                    boot_id,
                    config_id,
                    next_boot_id: get("NEXTBOOTID.UPNP.ORG")
                        .context("missing NEXTBOOTID.UPNP.ORG")?
                        .parse()
                        .context("parse NEXTBOOTID.UPNP.ORG")?,
                    search_port: get("SEARCHPORT.UPNP.ORG").and_then(|v| v.parse().ok()),
                })),
                other => anyhow::bail!("unknown NTS value {other}"),
            };
        }

        anyhow::bail!("unrecognized SSDP request line: {request_line}")
    }
}

/// `CACHE-CONTROL: max-age=<n>`, clamped to `[5, 86400]` (§4.3, testable property 7).
fn parse_cache_control(value: &str) -> anyhow::Result<Timeout> {
    let (prefix, seconds) = value.split_once('=').context("split max-age")?;
    anyhow::ensure!(prefix.trim() == "max-age", "expected max-age, got {prefix}");
    let seconds: u32 = seconds.trim().parse().context("parse max-age seconds")?;
    Ok(Timeout::clamp_ssdp(seconds))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::ResourceType;

    #[test]
    fn parses_msearch_and_notify_alive() {
        let search = "M-SEARCH * HTTP/1.1\r\nHOST: 239.255.255.250:1900\r\nMAN: \"ssdp:discover\"\r\nMX: 3\r\nST: ssdp:all\r\n\r\n";
        match SsdpMessage::parse(search).unwrap() {
            SsdpMessage::Search(req) => {
                assert_eq!(req.mx, 3);
                assert_eq!(req.st, SearchTarget::All);
            }
            other => panic!("expected Search, got {other:?}"),
        }

        let udn = Udn::generate();
        let alive = format!(
            "NOTIFY * HTTP/1.1\r\nHOST: 239.255.255.250:1900\r\nCACHE-CONTROL: max-age=100000\r\nLOCATION: http://127.0.0.1:0/d.xml\r\nNT: upnp:rootdevice\r\nNTS: ssdp:alive\r\nSERVER: t/1 UPnP/1.1 p/1\r\nUSN: {udn}::upnp:rootdevice\r\n\r\n"
        );
        match SsdpMessage::parse(&alive).unwrap() {
            SsdpMessage::Alive(msg) => {
                assert_eq!(msg.cache_control.0, Timeout::SSDP_MAX);
                assert_eq!(msg.nt, "upnp:rootdevice");
            }
            other => panic!("expected Alive, got {other:?}"),
        }
    }

    #[test]
    fn search_target_roundtrips() {
        let rt: SearchTarget = "urn:schemas-upnp-org:service:SwitchPower:1".parse().unwrap();
        assert!(matches!(rt, SearchTarget::Service(_)));
        assert_eq!(rt.to_string(), "urn:schemas-upnp-org:service:SwitchPower:1");
        assert_eq!("ssdp:all".parse::<SearchTarget>().unwrap(), SearchTarget::All);
        assert_eq!(
            "upnp:rootdevice".parse::<SearchTarget>().unwrap(),
            SearchTarget::RootDevice
        );
    }

    #[test]
    fn alive_targets_cover_root_bare_type_and_services() {
        use crate::model::{Action, ArgumentSpec, Device, DeviceBuilder, Origin, Service, StateVariable};
        use crate::datatype::{DataType, Value};
        use crate::model::Eventing;
        use std::sync::Arc;

        let status = Arc::new(StateVariable::new("Status", DataType::Boolean, Eventing::None, None, Some(Value::Boolean(false))));
        let service = Service::new(
            ResourceType::service("schemas-upnp-org", "SwitchPower", 1),
            crate::types::ServiceId::new("upnp-org", "switchpower1"),
            "/scpd.xml",
            "/control",
            "/event",
            vec![Arc::new(Action::new("GetStatus", Vec::<ArgumentSpec>::new()))],
            vec![status],
        );
        let root = Device::new_root(
            DeviceBuilder {
                device_type: ResourceType::device("schemas-upnp-org", "BinaryLight", 1),
                udn: Udn::generate(),
                friendly_name: "light".into(),
                manufacturer: "acme".into(),
                manufacturer_url: None,
                model_description: None,
                model_name: "light".into(),
                model_number: None,
                model_url: None,
                serial_number: None,
                upc: None,
                presentation_url: None,
                icons: vec![],
                services: vec![service],
                embedded_devices: vec![],
            },
            Origin::Host,
        );
        let targets = alive_targets(&root);
        // root flag + bare UDN + device type + one service type
        assert_eq!(targets.len(), 4);
        assert!(targets.iter().any(|(nt, _)| nt == "upnp:rootdevice"));
        assert!(targets
            .iter()
            .any(|(nt, _)| nt == "urn:schemas-upnp-org:service:SwitchPower:1"));
    }
}
