//! Plain configuration structs the embedding application fills in and hands to
//! [`crate::host::DeviceHost::init`] / [`crate::control_point::ControlPoint::init`].
//! There is deliberately no env-var or config-file loading layer here (out of scope per
//! the top-level non-goals) — construct these the way the teacher's own `Upnp::init`
//! constructs its listener config, from values the application already has.

use std::net::Ipv4Addr;

use crate::product_tokens::{ProductToken, UpnpAgent};

fn default_user_agent() -> UpnpAgent<'static> {
    UpnpAgent::new(
        ProductToken::new("Unix", "1.0"),
        "1.1",
        ProductToken::new("upnp-stack", env!("CARGO_PKG_VERSION")),
    )
}

/// Configuration for a [`crate::host::DeviceHost`].
#[derive(Debug, Clone)]
pub struct HostConfig {
    /// Interface to bind the SSDP unicast socket and the HTTP description/control
    /// server to. `UNSPECIFIED` binds all interfaces.
    pub bind_address: Ipv4Addr,
    /// TCP port for the description/SOAP/GENA HTTP server. `0` asks the OS for a free
    /// ephemeral port, which is what `location` in `ssdp:alive`/description responses
    /// then reports back.
    pub http_port: u16,
    pub user_agent: UpnpAgent<'static>,
    /// IP TTL stamped on outgoing SSDP datagrams (§6.1 recommends `2`).
    pub ssdp_ttl: u32,
    /// Default `CACHE-CONTROL` max-age advertised for devices that don't specify one
    /// explicitly; also halves into the `ssdp:alive` announce cadence (§4.3).
    pub default_max_age: u32,
    /// Number of back-to-back `ssdp:alive` / `ssdp:byebye` datagrams sent per
    /// notification to guard against UDP loss (§4.3).
    pub announce_burst: u32,
    /// Floor on the per-device action invoker worker pool, in case a device exposes
    /// very few actions (§4.7: `max(1, actionCount / 4)`).
    pub action_pool_min_workers: usize,
}

impl Default for HostConfig {
    fn default() -> Self {
        Self {
            bind_address: Ipv4Addr::UNSPECIFIED,
            http_port: 0,
            user_agent: default_user_agent(),
            ssdp_ttl: 2,
            default_max_age: 1800,
            announce_burst: 3,
            action_pool_min_workers: 1,
        }
    }
}

/// Configuration for a [`crate::control_point::ControlPoint`].
#[derive(Debug, Clone)]
pub struct ControlPointConfig {
    /// Interface to bind the SSDP unicast socket and the GENA callback HTTP server to.
    pub bind_address: Ipv4Addr,
    /// TCP port the GENA callback server listens on; `0` picks a free ephemeral port,
    /// which is what gets embedded in the `CALLBACK` header of outgoing `SUBSCRIBE`s.
    pub callback_port: u16,
    pub user_agent: UpnpAgent<'static>,
    /// IP TTL stamped on outgoing SSDP datagrams (§6.1 recommends `2`); also used for
    /// the multicast socket joined to receive `ssdp:alive`/`byebye`/`update`.
    pub ssdp_ttl: u32,
    /// `MX` advertised on outgoing `M-SEARCH`es (§4.3).
    pub search_mx: u8,
    /// Bound on the number of device trees built concurrently from distinct
    /// `ssdp:alive`/search-response advertisements racing in at once (§4.4).
    pub build_concurrency: usize,
    /// Retry delay after a failed subscription renewal before trying again (§4.6).
    pub renewal_retry_delay_secs: u64,
}

impl Default for ControlPointConfig {
    fn default() -> Self {
        Self {
            bind_address: Ipv4Addr::UNSPECIFIED,
            callback_port: 0,
            user_agent: default_user_agent(),
            ssdp_ttl: 2,
            search_mx: 3,
            build_concurrency: 8,
            renewal_retry_delay_secs: 30,
        }
    }
}
