//! The control point (§4.5): consumes SSDP advertisements, builds device trees over
//! HTTP, invokes remote actions via SOAP, and keeps a shadow copy of remote state
//! current through GENA subscriptions.
//!
//! Mirrors the host's lifecycle shape (`DeviceHost::init`/`quit`) but drives its device
//! trees from the network instead of from local files: every `ssdp:alive`/discovery
//! response that names an unknown UDN enqueues a fetch-and-build task, every `ssdp:byebye`
//! tears the matching tree (and its subscriptions) down.

use std::{
    collections::HashMap,
    net::{Ipv4Addr, SocketAddr},
    sync::{
        atomic::{AtomicU32, Ordering},
        Arc,
    },
    time::Duration,
};

use anyhow::Context;
use axum::{extract::Request, http::StatusCode, response::IntoResponse, Router};
use tokio::{net::TcpListener, sync::RwLock};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::{
    config::ControlPointConfig,
    description::{self, BuilderMode, Fetcher, RawDeviceDescription, RawScpd},
    error::ActionCallError,
    gena::{PropertySet, RemoteSubscription, SubscriptionState},
    model::{ActionInputs, ActionOutputs, Device, Origin},
    soap::{ActionError, ActionPayload, ActionResponse, InArgumentPayload, SoapMessage, WritableAction},
    ssdp::{self, SearchRequest, SearchTarget, SsdpMessage},
    types::{Sid, Udn},
    FromXml,
};

/// Fetches descriptions/SCPDs/icons over HTTP (§4.2's "control point uses HTTP" half of
/// [`Fetcher`]). URLs in a description are relative to the location it was fetched from.
pub struct HttpFetcher {
    http: reqwest::Client,
    base: String,
}

impl HttpFetcher {
    pub fn new(http: reqwest::Client, location: &str) -> Self {
        let base = location.rsplit_once('/').map(|(base, _)| base.to_owned()).unwrap_or_default();
        Self { http, base }
    }

    fn resolve(&self, url: &str) -> String {
        if url.starts_with("http://") || url.starts_with("https://") {
            url.to_owned()
        } else {
            format!("{}/{}", self.base, url.trim_start_matches('/'))
        }
    }
}

#[async_trait::async_trait]
impl Fetcher for HttpFetcher {
    async fn fetch(&self, url: &str) -> anyhow::Result<Vec<u8>> {
        let resolved = self.resolve(url);
        let response = self
            .http
            .get(&resolved)
            .timeout(Duration::from_secs(5))
            .send()
            .await
            .with_context(|| format!("fetching {resolved}"))?
            .error_for_status()
            .with_context(|| format!("fetching {resolved}"))?;
        Ok(response.bytes().await?.to_vec())
    }
}

/// One discovered root device tree plus the bookkeeping that isn't part of the shared
/// model: liveness expiry and the set of remote subscriptions the CP holds against its
/// evented services, keyed by the service's `ServiceId` so a byebye can tear them all
/// down without walking every `RemoteSubscription` in the registry.
struct TrackedDevice {
    device: Arc<Device>,
    expires_at: RwLock<tokio::time::Instant>,
    subscriptions: Vec<Arc<RemoteSubscription>>,
    /// `CONFIGID.UPNP.ORG` this tree was built from; an `ssdp:update` (or a later
    /// alive/discovery-response) carrying a different value means the description
    /// itself changed, not just liveness, so the tree is torn down and refetched rather
    /// than patched in place.
    config_id: AtomicU32,
}

/// Discovers remote devices and lets the embedding application invoke their actions and
/// observe their evented state (§4.5). Construct with [`ControlPoint::new`], call
/// [`ControlPoint::init`] to start the discovery listener and GENA callback server, then
/// [`ControlPoint::devices`] / [`ControlPoint::invoke_action`]. [`ControlPoint::quit`]
/// tears everything down.
pub struct ControlPoint {
    config: ControlPointConfig,
    cancellation: CancellationToken,
    http: reqwest::Client,
    devices: RwLock<HashMap<Udn, Arc<TrackedDevice>>>,
    /// Subscriptions addressable by the random callback-path component handed out on
    /// subscribe, since an incoming NOTIFY only carries that path, not the UDN.
    by_callback_path: RwLock<HashMap<String, Arc<RemoteSubscription>>>,
    local_addr: tokio::sync::OnceCell<Ipv4Addr>,
    callback_port: tokio::sync::OnceCell<u16>,
    building: tokio::sync::Mutex<std::collections::HashSet<Udn>>,
}

impl ControlPoint {
    pub fn new(config: ControlPointConfig) -> Arc<Self> {
        Arc::new(Self {
            config,
            cancellation: CancellationToken::new(),
            http: reqwest::Client::new(),
            devices: RwLock::new(HashMap::new()),
            by_callback_path: RwLock::new(HashMap::new()),
            local_addr: tokio::sync::OnceCell::new(),
            callback_port: tokio::sync::OnceCell::new(),
            building: tokio::sync::Mutex::new(std::collections::HashSet::new()),
        })
    }

    /// Binds the GENA callback HTTP server and SSDP sockets, sends the initial
    /// `ssdp:all` M-SEARCH, and spawns the listener/expiry background tasks.
    pub async fn init(self: &Arc<Self>) -> anyhow::Result<()> {
        let local_addr = ssdp::resolve_local_addr().await?;
        let listener = TcpListener::bind(SocketAddr::new(self.config.bind_address.into(), self.config.callback_port)).await?;
        let callback_port = listener.local_addr()?.port();
        let _ = self.local_addr.set(local_addr);
        let _ = self.callback_port.set(callback_port);

        let cp = self.clone();
        let router = Router::new().fallback(move |request: Request| {
            let cp = cp.clone();
            async move { cp.handle_notify(request).await }
        });

        let cancellation = self.cancellation.clone();
        tokio::spawn(async move {
            if let Err(err) = axum::serve(listener, router)
                .with_graceful_shutdown(cancellation.cancelled_owned())
                .await
            {
                tracing::error!(%err, "control point GENA callback server failed");
            }
        });

        let unicast = Arc::new(ssdp::bind_unicast_socket(self.config.bind_address).await?);
        let multicast = Arc::new(ssdp::bind_multicast_socket(self.config.bind_address, self.config.ssdp_ttl)?);
        self.spawn_listener(unicast.clone(), multicast);
        self.spawn_expiry_sweep();

        let search = SearchRequest {
            st: SearchTarget::All,
            mx: self.config.search_mx,
            user_agent: Some(self.config.user_agent.to_string()),
        };
        let _ = unicast.send_to(search.to_string().as_bytes(), ssdp::ssdp_multicast_addr()).await;

        tracing::info!(%local_addr, callback_port, "control point initialized");
        Ok(())
    }

    /// Listens on both sockets this control point owns: the unicast socket receives
    /// `M-SEARCH` discovery responses addressed directly back to it, while the
    /// multicast socket (joined to the SSDP group) receives `ssdp:alive`/`byebye`/
    /// `update` `NOTIFY`s the network at large is broadcasting — a responder never
    /// unicasts those, so without group membership the control point would never see
    /// an advertisement it didn't itself solicit with an `M-SEARCH`.
    fn spawn_listener(self: &Arc<Self>, unicast: Arc<tokio::net::UdpSocket>, multicast: Arc<tokio::net::UdpSocket>) {
        let cp = self.clone();
        tokio::spawn(async move {
            let mut ubuf = vec![0u8; 4096];
            let mut mbuf = vec![0u8; 4096];
            loop {
                tokio::select! {
                    _ = cp.cancellation.cancelled() => return,
                    result = unicast.recv_from(&mut ubuf) => {
                        let Ok((len, _from)) = result else { continue };
                        let Ok(text) = std::str::from_utf8(&ubuf[..len]) else { continue };
                        let Ok(message) = SsdpMessage::parse(text) else { continue };
                        let cp = cp.clone();
                        tokio::spawn(async move { cp.handle_ssdp_message(message).await });
                    }
                    result = multicast.recv_from(&mut mbuf) => {
                        let Ok((len, _from)) = result else { continue };
                        let Ok(text) = std::str::from_utf8(&mbuf[..len]) else { continue };
                        let Ok(message) = SsdpMessage::parse(text) else { continue };
                        let cp = cp.clone();
                        tokio::spawn(async move { cp.handle_ssdp_message(message).await });
                    }
                }
            }
        });
    }

    async fn handle_ssdp_message(self: Arc<Self>, message: SsdpMessage) {
        match message {
            SsdpMessage::Alive(alive) => {
                self.on_available(&alive.usn.udn, alive.location, alive.cache_control.0, alive.config_id).await;
            }
            SsdpMessage::DiscoveryResponse(resp) => {
                self.on_available(&resp.usn.udn, resp.location, resp.cache_control.0, resp.config_id).await;
            }
            SsdpMessage::ByeBye(byebye) => {
                self.on_unavailable(&byebye.usn.udn).await;
            }
            SsdpMessage::Update(update) => {
                self.on_available(&update.usn.udn, update.location, 1800, update.config_id).await;
            }
            SsdpMessage::Search(_) => {}
        }
    }

    /// *Available* (§4.5): refresh liveness and merge a location for a known device
    /// whose `configId` hasn't changed; otherwise (unknown UDN, or a changed `configId`
    /// per `ssdp:update`) tear down any stale tree and kick off a fresh build. Concurrent
    /// alives for the same UDN collapse into a single build via `building`.
    async fn on_available(self: &Arc<Self>, udn: &Udn, location: String, max_age: u32, config_id: u32) {
        let known_config_id = self.devices.read().await.get(udn).map(|t| t.config_id.load(Ordering::SeqCst));
        match known_config_id {
            Some(known) if known == config_id => {
                if let Some(tracked) = self.devices.read().await.get(udn) {
                    tracked.device.add_location(location);
                    *tracked.expires_at.write().await = tokio::time::Instant::now() + Duration::from_secs(max_age as u64 * 2);
                }
                return;
            }
            Some(_) => {
                tracing::info!(udn = %udn, config_id, "device configId changed, rebuilding tree");
                self.on_unavailable(udn).await;
            }
            None => {}
        }

        {
            let mut building = self.building.lock().await;
            if !building.insert(udn.clone()) {
                return;
            }
        }
        let cp = self.clone();
        let udn = udn.clone();
        tokio::spawn(async move {
            let result = cp.fetch_and_add_device(&location, max_age, config_id).await;
            cp.building.lock().await.remove(&udn);
            if let Err(err) = result {
                tracing::warn!(%err, %location, "failed to build device from advertisement");
            }
        });
    }

    async fn on_unavailable(&self, udn: &Udn) {
        let tracked = self.devices.write().await.remove(udn);
        let Some(tracked) = tracked else { return };
        let mut by_path = self.by_callback_path.write().await;
        for sub in &tracked.subscriptions {
            by_path.retain(|_, other| !Arc::ptr_eq(other, sub));
        }
        tracing::info!(udn = %udn, "device went offline");
    }

    /// Fetches the description and every SCPD it references, builds the live tree,
    /// attaches it, starts the tree's expiry timer, then subscribes to every evented
    /// service (§4.5 FetchAndAddDevice).
    async fn fetch_and_add_device(self: &Arc<Self>, location: &str, max_age: u32, config_id: u32) -> anyhow::Result<()> {
        let fetcher = HttpFetcher::new(self.http.clone(), location);
        let bytes = fetcher.fetch(location).await?;
        let mut reader = quick_xml::Reader::from_reader(bytes.as_slice());
        let raw = RawDeviceDescription::read_xml(&mut reader)?;

        if self.devices.read().await.contains_key(&raw.device.udn) {
            return Ok(());
        }

        let scpds = self.fetch_scpds(&raw.device, &fetcher).await?;
        let udn = raw.device.udn.clone();
        let device = description::build_device_tree(raw, &scpds, BuilderMode::Lenient, Origin::ControlPoint)?;
        device.add_location(location.to_owned());
        device.set_description(String::from_utf8_lossy(&bytes).into_owned());

        let mut subscriptions = Vec::new();
        for tree_device in device.walk() {
            for service in &tree_device.services {
                if service.evented_variables().next().is_none() {
                    continue;
                }
                let subscription = Arc::new(RemoteSubscription::new(service.service_id.clone()));
                let callback_path = format!("/{}", Uuid::new_v4());
                self.by_callback_path.write().await.insert(callback_path.clone(), subscription.clone());

                let cp = self.clone();
                let service = service.clone();
                let subscription_task = subscription.clone();
                let callback_path_task = callback_path;
                tokio::spawn(async move {
                    cp.run_subscription(service, subscription_task, callback_path_task).await;
                });
                subscriptions.push(subscription);
            }
        }

        self.devices.write().await.insert(
            udn,
            Arc::new(TrackedDevice {
                device,
                expires_at: RwLock::new(tokio::time::Instant::now() + Duration::from_secs(max_age as u64 * 2)),
                subscriptions,
                config_id: AtomicU32::new(config_id),
            }),
        );
        Ok(())
    }

    fn fetch_scpds<'a>(
        &'a self,
        device: &'a crate::description::RawDevice,
        fetcher: &'a HttpFetcher,
    ) -> std::pin::Pin<Box<dyn std::future::Future<Output = anyhow::Result<HashMap<String, (String, RawScpd)>>> + Send + 'a>> {
        Box::pin(async move {
            let mut out = HashMap::new();
            for service in &device.service_list {
                if out.contains_key(&service.scpd_url) {
                    continue;
                }
                let bytes = fetcher.fetch(&service.scpd_url).await?;
                let text = String::from_utf8(bytes).context("scpd is not valid utf-8")?;
                let mut reader = quick_xml::Reader::from_reader(text.as_bytes());
                let scpd = RawScpd::read_xml(&mut reader)?;
                out.insert(service.scpd_url.clone(), (text, scpd));
            }
            for child in &device.device_list {
                out.extend(self.fetch_scpds(child, fetcher).await?);
            }
            Ok(out)
        })
    }

    /// Drives one service's subscription lifecycle: subscribe, renew at roughly half the
    /// granted timeout, retry after `renewal_retry_delay_secs` on failure, until the
    /// control point shuts down or the owning device is removed.
    async fn run_subscription(self: Arc<Self>, service: Arc<crate::model::Service>, subscription: Arc<RemoteSubscription>, callback_path: String) {
        loop {
            if self.cancellation.is_cancelled() {
                return;
            }
            let callback_url = format!(
                "http://{}:{}{}",
                self.local_addr.get().expect("local addr set at init"),
                self.callback_port.get().expect("callback port set at init"),
                callback_path
            );
            subscription.begin_subscribing().await;
            match self.send_subscribe(&service.event_sub_url, &[callback_url], None).await {
                Ok((sid, timeout)) => {
                    subscription.mark_subscribed(sid, timeout).await;
                    let renew_after = Duration::from_secs((timeout.0 / 2).max(1) as u64);
                    self.wait_for_renewal_or_failure(&subscription, renew_after).await;
                    if self.cancellation.is_cancelled() {
                        return;
                    }
                }
                Err(err) => {
                    tracing::warn!(%err, url = %service.event_sub_url, "subscribe failed");
                    subscription.mark_failed().await;
                    tokio::select! {
                        _ = self.cancellation.cancelled() => return,
                        _ = tokio::time::sleep(Duration::from_secs(self.config.renewal_retry_delay_secs)) => {}
                    }
                    continue;
                }
            }

            loop {
                if self.cancellation.is_cancelled() {
                    return;
                }
                let Some(sid) = subscription.sid().await else { break };
                subscription.begin_renewing().await;
                match self.renew_subscribe(&service.event_sub_url, &sid).await {
                    Ok(timeout) => {
                        subscription.mark_renewed(timeout).await;
                        let renew_after = Duration::from_secs((timeout.0 / 2).max(1) as u64);
                        self.wait_for_renewal_or_failure(&subscription, renew_after).await;
                        if self.cancellation.is_cancelled() {
                            return;
                        }
                    }
                    Err(err) => {
                        tracing::warn!(%err, url = %service.event_sub_url, "subscription renewal failed, resubscribing");
                        subscription.mark_failed().await;
                        tokio::select! {
                            _ = self.cancellation.cancelled() => return,
                            _ = tokio::time::sleep(Duration::from_secs(self.config.renewal_retry_delay_secs)) => {}
                        }
                        break;
                    }
                }
            }
        }
    }

    /// Sleeps up to `duration` in short ticks, waking early if the control point shuts
    /// down or the subscription is marked [`SubscriptionState::Failed`] by the NOTIFY
    /// handler's SEQ check — lets a mid-interval resubscribe happen promptly instead of
    /// waiting out the rest of the renewal period.
    async fn wait_for_renewal_or_failure(&self, subscription: &RemoteSubscription, duration: Duration) {
        let tick = Duration::from_secs(5);
        let deadline = tokio::time::Instant::now() + duration;
        while tokio::time::Instant::now() < deadline {
            if self.cancellation.is_cancelled() || subscription.state().await == SubscriptionState::Failed {
                return;
            }
            let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
            tokio::time::sleep(tick.min(remaining)).await;
        }
    }

    async fn send_subscribe(&self, event_sub_url: &str, callback_urls: &[String], sid: Option<&Sid>) -> anyhow::Result<(Sid, crate::types::Timeout)> {
        let callback_header = callback_urls.iter().map(|u| format!("<{u}>")).collect::<Vec<_>>().join(" ");
        let mut request = self
            .http
            .request(reqwest::Method::from_bytes(b"SUBSCRIBE").expect("SUBSCRIBE is a valid method"), event_sub_url)
            .timeout(Duration::from_secs(5));
        request = match sid {
            Some(sid) => request.header("SID", sid.to_string()),
            None => request
                .header("CALLBACK", callback_header)
                .header("NT", "upnp:event")
                .header("TIMEOUT", "Second-1800"),
        };
        let response = request.send().await?;
        anyhow::ensure!(response.status().is_success(), "subscribe rejected with {}", response.status());
        let sid = response
            .headers()
            .get("SID")
            .and_then(|v| v.to_str().ok())
            .context("subscribe response missing SID")?
            .parse::<Sid>()?;
        let timeout = response
            .headers()
            .get("TIMEOUT")
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.strip_prefix("Second-"))
            .and_then(|v| v.parse::<u32>().ok())
            .map(crate::types::Timeout)
            .unwrap_or(crate::types::Timeout(crate::types::Timeout::GENA_DEFAULT));
        Ok((sid, timeout))
    }

    async fn renew_subscribe(&self, event_sub_url: &str, sid: &Sid) -> anyhow::Result<crate::types::Timeout> {
        let (_, timeout) = self.send_subscribe(event_sub_url, &[], Some(sid)).await?;
        Ok(timeout)
    }

    /// CP-side notify handler (§4.5): resolves the subscription by callback-path,
    /// validates SID and SEQ, applies the propertyset to the shadow state variables.
    /// Always responds `200` on a recognized path, even when SEQ is out of order, per
    /// UDA: the delivery itself is never rejected, only the subscription is repaired.
    async fn handle_notify(self: Arc<Self>, request: Request) -> axum::response::Response {
        let path = request.uri().path().to_owned();
        let headers = request.headers().clone();
        let Some(subscription) = self.by_callback_path.read().await.get(&path).cloned() else {
            return StatusCode::NOT_FOUND.into_response();
        };

        let Some(sid) = headers.get("SID").and_then(|v| v.to_str().ok()).and_then(|v| v.parse::<Sid>().ok()) else {
            return StatusCode::BAD_REQUEST.into_response();
        };
        let Some(tracked_sid) = subscription.sid().await else {
            return StatusCode::PRECONDITION_FAILED.into_response();
        };
        if sid.uuid() != tracked_sid.uuid() {
            return StatusCode::PRECONDITION_FAILED.into_response();
        }

        let Some(seq) = headers.get("SEQ").and_then(|v| v.to_str().ok()).and_then(|v| v.parse::<u32>().ok()) else {
            return StatusCode::BAD_REQUEST.into_response();
        };
        if !subscription.check_and_advance_seq(seq) {
            tracing::warn!(service_id = %subscription.service_id.as_str(), seq, "gena sequence mismatch, resubscribing");
            let sub = subscription.clone();
            tokio::spawn(async move { sub.mark_failed().await });
            return StatusCode::OK.into_response();
        }

        let body = match axum::body::to_bytes(request.into_body(), 1024 * 1024).await {
            Ok(bytes) => bytes,
            Err(_) => return StatusCode::BAD_REQUEST.into_response(),
        };
        let mut reader = quick_xml::Reader::from_reader(body.as_ref());
        let propertyset = match PropertySet::read_xml(&mut reader) {
            Ok(propertyset) => propertyset,
            Err(err) => {
                tracing::warn!(%err, "malformed gena propertyset");
                return StatusCode::BAD_REQUEST.into_response();
            }
        };

        self.apply_propertyset(&subscription.service_id, propertyset).await;
        StatusCode::OK.into_response()
    }

    async fn apply_propertyset(&self, service_id: &crate::types::ServiceId, propertyset: PropertySet) {
        let devices = self.devices.read().await;
        for tracked in devices.values() {
            for device in tracked.device.walk() {
                let Some(service) = device.find_service(service_id) else { continue };
                for (name, value) in &propertyset.properties {
                    if let Some(var) = service.find_state_variable(name) {
                        if let Err(err) = var.set(value.clone()).await {
                            tracing::warn!(%err, name, "failed to apply notified value");
                        }
                    }
                }
                return;
            }
        }
    }

    fn spawn_expiry_sweep(self: &Arc<Self>) {
        let cp = self.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = cp.cancellation.cancelled() => return,
                    _ = tokio::time::sleep(Duration::from_secs(30)) => {}
                }
                let now = tokio::time::Instant::now();
                let mut expired = Vec::new();
                for (udn, tracked) in cp.devices.read().await.iter() {
                    if *tracked.expires_at.read().await <= now {
                        expired.push(udn.clone());
                    }
                }
                for udn in expired {
                    cp.on_unavailable(&udn).await;
                }
            }
        });
    }

    /// Every currently known root device tree.
    pub async fn devices(&self) -> Vec<Arc<Device>> {
        self.devices.read().await.values().map(|t| t.device.clone()).collect()
    }

    pub async fn find_device(&self, udn: &Udn) -> Option<Arc<Device>> {
        self.devices.read().await.get(udn).map(|t| t.device.clone())
    }

    /// Proxies an action call over SOAP (§4.5, §4.8): the action must belong to a
    /// service on a tree this control point discovered. Rejects a location that isn't
    /// reachable on the control point's own `/24` (§9 open question, kept as specified).
    pub async fn invoke_action(&self, action: Arc<crate::model::Action>, inputs: ActionInputs) -> Result<ActionOutputs, ActionCallError> {
        let service = action.parent_service().ok_or(ActionCallError::Network(anyhow::anyhow!("action has no parent service")))?;
        let device = service.parent_device().and_then(|d| d.root()).ok_or(ActionCallError::Network(anyhow::anyhow!("service has no owning device")))?;

        let location = device
            .locations()
            .into_iter()
            .find(|loc| self.is_reachable(loc))
            .ok_or_else(|| ActionCallError::Unreachable(device.udn.clone()))?;
        let base = location.rsplit_once('/').map(|(base, _)| base.to_owned()).unwrap_or_default();
        let control_url = if service.control_url.starts_with("http://") || service.control_url.starts_with("https://") {
            service.control_url.clone()
        } else {
            format!("{base}/{}", service.control_url.trim_start_matches('/'))
        };

        let mut writer = WritableAction::new(&action.name, &service.service_type).map_err(|e| ActionCallError::Network(e.into()))?;
        for arg in action.in_arguments() {
            let value = inputs.get(&arg.name).ok_or_else(|| ActionCallError::Network(anyhow::anyhow!("missing input {}", arg.name)))?;
            writer.write_argument(&arg.name, value).map_err(|e| ActionCallError::Network(e.into()))?;
        }
        let body = writer.finish().map_err(|e| ActionCallError::Network(e.into()))?;

        let soap_action = format!("\"{}#{}\"", service.service_type, action.name);
        let response = self
            .http
            .post(&control_url)
            .header("CONTENT-TYPE", "text/xml; charset=\"utf-8\"")
            .header("SOAPACTION", soap_action)
            .timeout(Duration::from_secs(30))
            .body(body)
            .send()
            .await
            .map_err(|e| ActionCallError::Network(e.into()))?;

        let response_body = response.bytes().await.map_err(|e| ActionCallError::Network(e.into()))?;
        let parsed = SoapMessage::<Result<ActionResponse<InArgumentPayload>, ActionError>>::from_xml(response_body.as_ref())
            .map_err(ActionCallError::Network)?
            .into_inner();

        match parsed {
            Ok(action_response) => {
                let mut outputs = ActionOutputs::new();
                let args = ActionPayload {
                    name: action_response.action_name.clone(),
                    arguments: action_response.args,
                }
                .arguments_map();
                for out in action.out_arguments() {
                    let raw = args
                        .get(&out.name)
                        .ok_or_else(|| ActionCallError::Network(anyhow::anyhow!("response omitted output {}", out.name)))?;
                    let value = crate::datatype::Value::coerce(out.data_type(), raw).map_err(|e| ActionCallError::Network(e))?;
                    outputs.insert(out.name.clone(), value);
                }
                Ok(outputs)
            }
            Err(action_error) => Err(ActionCallError::Protocol(action_error)),
        }
    }

    /// §9: fixed `/24` reachability check, implemented as specified rather than fixed.
    fn is_reachable(&self, location: &str) -> bool {
        let Some(local) = self.local_addr.get() else { return false };
        let Ok(url) = reqwest::Url::parse(location) else { return false };
        let Some(host) = url.host_str() else { return false };
        let Ok(addr) = host.parse::<Ipv4Addr>() else { return false };
        addr.octets()[..3] == local.octets()[..3]
    }

    /// Tears the control point down (§5): cancels every subscription task and the
    /// callback server/SSDP listener via the shared token. Remote subscriptions are not
    /// explicitly unsubscribed; they expire on their own on the host side.
    pub async fn quit(&self) {
        self.cancellation.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn http_fetcher_resolves_relative_urls_against_location() {
        let fetcher = HttpFetcher::new(reqwest::Client::new(), "http://10.0.0.5:8080/abc/device_description.xml");
        assert_eq!(fetcher.resolve("/scpd.xml"), "http://10.0.0.5:8080/abc/scpd.xml");
        assert_eq!(fetcher.resolve("scpd.xml"), "http://10.0.0.5:8080/abc/scpd.xml");
        assert_eq!(fetcher.resolve("http://other/x"), "http://other/x");
    }
}
