//! Value objects from §3 of the device architecture: UDN, resource type, service id,
//! USN, timeout and subscription id. Each is an immutable type with parse/format and,
//! where the architecture calls for it, a comparison mode.

use std::{fmt::Display, str::FromStr};

use anyhow::Context;
use serde::Serialize;

/// `uuid:XXXXXXXX-XXXX-XXXX-XXXX-XXXXXXXXXXXX`. Identity of one device instance, root or
/// embedded. Stable for the lifetime of the device, survives reboots.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
pub struct Udn(String);

impl Udn {
    pub fn new(uuid: uuid::Uuid) -> Self {
        Self(format!("uuid:{uuid}"))
    }

    pub fn generate() -> Self {
        Self::new(uuid::Uuid::new_v4())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn uuid(&self) -> anyhow::Result<uuid::Uuid> {
        self.0
            .strip_prefix("uuid:")
            .context("udn missing uuid: prefix")?
            .parse()
            .context("parse uuid")
    }
}

impl Display for Udn {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for Udn {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let uuid: uuid::Uuid = s
            .strip_prefix("uuid:")
            .context("udn should start with uuid:")?
            .parse()
            .context("parse uuid")?;
        Ok(Self::new(uuid))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResourceKind {
    Device,
    Service,
}

impl Display for ResourceKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ResourceKind::Device => write!(f, "device"),
            ResourceKind::Service => write!(f, "service"),
        }
    }
}

/// `urn:<vendor-domain>:{device,service}:<type>:<majorVersion>[.<minorVersion>]`.
///
/// Supports inclusive version matching per §4.1: same vendor/kind/type, target version
/// less than or equal to the stored version.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResourceType {
    pub vendor: String,
    pub kind: ResourceKind,
    pub type_name: String,
    pub major: u32,
    pub minor: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VersionMatch {
    Exact,
    Inclusive,
}

impl ResourceType {
    pub fn device(vendor: impl Into<String>, type_name: impl Into<String>, major: u32) -> Self {
        Self {
            vendor: vendor.into(),
            kind: ResourceKind::Device,
            type_name: type_name.into(),
            major,
            minor: 0,
        }
    }

    pub fn service(vendor: impl Into<String>, type_name: impl Into<String>, major: u32) -> Self {
        Self {
            vendor: vendor.into(),
            kind: ResourceKind::Service,
            type_name: type_name.into(),
            major,
            minor: 0,
        }
    }

    pub fn matches(&self, stored: &ResourceType, mode: VersionMatch) -> bool {
        if self.vendor != stored.vendor || self.kind != stored.kind || self.type_name != stored.type_name {
            return false;
        }
        match mode {
            VersionMatch::Exact => self.major == stored.major && self.minor == stored.minor,
            VersionMatch::Inclusive => {
                (self.major, self.minor) <= (stored.major, stored.minor)
            }
        }
    }
}

impl Display for ResourceType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "urn:{}:{}:{}:{}",
            self.vendor, self.kind, self.type_name, self.major
        )?;
        if self.minor != 0 {
            write!(f, ".{}", self.minor)?;
        }
        Ok(())
    }
}

impl FromStr for ResourceType {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut parts = s.splitn(5, ':');
        anyhow::ensure!(parts.next() == Some("urn"), "resource type must start with urn:");
        let vendor = parts.next().context("vendor domain")?.to_owned();
        let kind = match parts.next().context("device/service discriminator")? {
            "device" => ResourceKind::Device,
            "service" => ResourceKind::Service,
            other => anyhow::bail!("unknown resource kind: {other}"),
        };
        let type_name = parts.next().context("resource type name")?.to_owned();
        let version = parts.next().context("resource version")?;
        let (major, minor) = match version.split_once('.') {
            Some((major, minor)) => (major.parse()?, minor.parse()?),
            None => (version.parse()?, 0),
        };
        Ok(Self {
            vendor,
            kind,
            type_name,
            major,
            minor,
        })
    }
}

/// `urn:<vendor>:serviceId:<id>`. Unique within one device.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ServiceId(String);

impl ServiceId {
    pub fn new(vendor: impl Display, id: impl Display) -> Self {
        Self(format!("urn:{vendor}:serviceId:{id}"))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Display for ServiceId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for ServiceId {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        anyhow::ensure!(s.starts_with("urn:"), "service id must start with urn:");
        Ok(Self(s.to_owned()))
    }
}

/// Unique Service Name: UDN plus a resource discriminator, as carried on the wire in
/// `USN:`.
#[derive(Debug, Clone)]
pub struct Usn {
    pub udn: Udn,
    pub resource: UsnResource,
}

#[derive(Debug, Clone)]
pub enum UsnResource {
    RootDevice,
    Bare,
    Device(ResourceType),
    Service(ResourceType),
}

impl Usn {
    pub const fn root_device(udn: Udn) -> Self {
        Self {
            udn,
            resource: UsnResource::RootDevice,
        }
    }

    pub const fn bare(udn: Udn) -> Self {
        Self {
            udn,
            resource: UsnResource::Bare,
        }
    }

    pub const fn resource_type(udn: Udn, rt: ResourceType) -> Self {
        let resource = match rt.kind {
            ResourceKind::Device => UsnResource::Device(rt),
            ResourceKind::Service => UsnResource::Service(rt),
        };
        Self { udn, resource }
    }
}

impl Display for Usn {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.udn)?;
        match &self.resource {
            UsnResource::RootDevice => write!(f, "::upnp:rootdevice"),
            UsnResource::Bare => Ok(()),
            UsnResource::Device(rt) => write!(f, "::{rt}"),
            UsnResource::Service(rt) => write!(f, "::{rt}"),
        }
    }
}

impl FromStr for Usn {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let Some((udn, rest)) = s.split_once("::") else {
            return Ok(Self::bare(Udn::from_str(s)?));
        };
        let udn = Udn::from_str(udn)?;
        if rest == "upnp:rootdevice" {
            return Ok(Self::root_device(udn));
        }
        let rt = ResourceType::from_str(rest)?;
        Ok(Self::resource_type(udn, rt))
    }
}

/// A `CACHE-CONTROL`/`TIMEOUT` duration in seconds, clamped to the range the
/// architecture allows (`[5, 86400]` for SSDP max-age; GENA timeouts use
/// [`Timeout::clamp_gena`]).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct Timeout(pub u32);

impl Timeout {
    pub const SSDP_MIN: u32 = 5;
    pub const SSDP_MAX: u32 = 86400;
    pub const GENA_DEFAULT: u32 = 1800;

    pub fn clamp_ssdp(seconds: u32) -> Self {
        Self(seconds.clamp(Self::SSDP_MIN, Self::SSDP_MAX))
    }

    pub fn clamp_gena(seconds: Option<u32>) -> Self {
        Self(seconds.unwrap_or(Self::GENA_DEFAULT).max(1))
    }
}

/// GENA subscription identifier, a UUID URN.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Sid(uuid::Uuid);

impl Sid {
    pub fn generate() -> Self {
        Self(uuid::Uuid::new_v4())
    }

    pub fn uuid(&self) -> uuid::Uuid {
        self.0
    }
}

impl Display for Sid {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "uuid:{}", self.0)
    }
}

impl FromStr for Sid {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let raw = s.strip_prefix("uuid:").unwrap_or(s);
        Ok(Self(raw.parse().context("parse SID uuid")?))
    }
}

/// `<specVersion>` element: UDA major/minor. §4.2 requires `major=1`, `minor ∈ {0,1}`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SpecVersion {
    pub major: u32,
    pub minor: u32,
}

impl SpecVersion {
    pub const fn upnp_v1() -> Self {
        Self { major: 1, minor: 0 }
    }
    pub const fn upnp_v1_1() -> Self {
        Self { major: 1, minor: 1 }
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        anyhow::ensure!(self.major == 1, "unsupported UDA major version {}", self.major);
        anyhow::ensure!(
            self.minor == 0 || self.minor == 1,
            "unsupported UDA minor version {}",
            self.minor
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resource_type_roundtrip() {
        let rt = ResourceType::from_str("urn:schemas-upnp-org:service:SwitchPower:1").unwrap();
        assert_eq!(rt.vendor, "schemas-upnp-org");
        assert_eq!(rt.kind, ResourceKind::Service);
        assert_eq!(rt.type_name, "SwitchPower");
        assert_eq!(rt.major, 1);
        assert_eq!(rt.to_string(), "urn:schemas-upnp-org:service:SwitchPower:1");
    }

    #[test]
    fn inclusive_match_is_monotonic() {
        let stored = ResourceType::from_str("urn:schemas-upnp-org:device:BinaryLight:2").unwrap();
        let target1 = ResourceType::from_str("urn:schemas-upnp-org:device:BinaryLight:1").unwrap();
        let target2 = ResourceType::from_str("urn:schemas-upnp-org:device:BinaryLight:2").unwrap();
        let target3 = ResourceType::from_str("urn:schemas-upnp-org:device:BinaryLight:3").unwrap();
        assert!(target1.matches(&stored, VersionMatch::Inclusive));
        assert!(target2.matches(&stored, VersionMatch::Inclusive));
        assert!(!target3.matches(&stored, VersionMatch::Inclusive));
    }

    #[test]
    fn usn_parses_root_device() {
        let udn = Udn::generate();
        let usn = Usn::root_device(udn.clone());
        let parsed = Usn::from_str(&usn.to_string()).unwrap();
        assert!(matches!(parsed.resource, UsnResource::RootDevice));
        assert_eq!(parsed.udn, udn);
    }

    #[test]
    fn timeout_clamps_to_ssdp_bounds() {
        assert_eq!(Timeout::clamp_ssdp(1).0, Timeout::SSDP_MIN);
        assert_eq!(Timeout::clamp_ssdp(100_000).0, Timeout::SSDP_MAX);
        assert_eq!(Timeout::clamp_ssdp(1800).0, 1800);
    }
}
