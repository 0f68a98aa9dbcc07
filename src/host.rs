//! The device host (§4.4, §4.3 announcer/responder side, §4.6 delivery): builds one or
//! more root device trees from local description/SCPD files, serves them over HTTP
//! (description, SCPD, icons, SOAP control, GENA subscribe/unsubscribe), and keeps them
//! announced on the network until [`DeviceHost::quit`] is called.
//!
//! Lifecycle mirrors the teacher's `Upnp::init`/shutdown shape: a cancellation token
//! gates both the HTTP server's graceful shutdown and the SSDP background tasks, so one
//! `cancel()` call tears down everything this host owns.

use std::{
    collections::HashMap,
    net::{Ipv4Addr, SocketAddr},
    path::PathBuf,
    sync::{atomic::Ordering, Arc},
    time::Duration,
};

use anyhow::Context;
use axum::{
    extract::Request,
    http::{HeaderMap, StatusCode},
    response::IntoResponse,
    routing::{get, post},
    Router,
};
use axum_extra::headers::{self, HeaderMapExt};
use rand::Rng;
use tokio::{net::TcpListener, sync::RwLock};
use tokio_util::sync::CancellationToken;

use crate::{
    action::ActionInvoker,
    config::HostConfig,
    datatype::Value,
    description::{self, BuilderMode, Fetcher, RawDeviceDescription, RawScpd},
    error::LifecycleError,
    gena::{SubscribeRequest, SubscriberRegistry},
    model::{ActionFn, Device, Origin, Service},
    soap::{ActionError, ActionErrorCode, ActionPayload, ActionResponse, InArgumentPayload, OutArgumentsPayload, SoapMessage},
    ssdp::{self, AliveMessage, ByeByeMessage, SearchTarget, SsdpMessage},
    types::ServiceId,
    FromXml,
};

/// Reads descriptions/SCPDs/icons off the local filesystem, relative to `base_dir`
/// (§4.2: "the host uses local file paths"). URLs are treated as paths relative to
/// `base_dir` regardless of a leading `/`, since that's how they're declared in the
/// description XML the caller hands us.
pub struct LocalFetcher {
    base_dir: PathBuf,
}

impl LocalFetcher {
    pub fn new(base_dir: impl Into<PathBuf>) -> Self {
        Self { base_dir: base_dir.into() }
    }

    fn resolve(&self, url: &str) -> PathBuf {
        self.base_dir.join(url.trim_start_matches('/'))
    }
}

#[async_trait::async_trait]
impl Fetcher for LocalFetcher {
    async fn fetch(&self, url: &str) -> anyhow::Result<Vec<u8>> {
        let path = self.resolve(url);
        tokio::fs::read(&path)
            .await
            .with_context(|| format!("reading {}", path.display()))
    }
}

/// One root device to publish, supplied by the embedding application: where its
/// description document lives, the directory its SCPD/icon references resolve against,
/// and the local implementation of each action it declares.
pub struct RootDeviceSpec {
    pub description_path: PathBuf,
    pub base_dir: PathBuf,
    pub mode: BuilderMode,
    pub handlers: HashMap<(ServiceId, String), ActionFn>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum HostState {
    Uninitialized,
    Initialized,
    Exiting,
}

struct RootEntry {
    device: Arc<Device>,
    registry: Arc<SubscriberRegistry>,
    base_dir: PathBuf,
}

/// Publishes a tree of devices and services on the network (§4.4). Construct with
/// [`DeviceHost::new`], add trees with [`DeviceHost::add_root_device`], then
/// [`DeviceHost::init`] to start serving. [`DeviceHost::quit`] tears everything down.
pub struct DeviceHost {
    config: HostConfig,
    state: RwLock<HostState>,
    roots: RwLock<Vec<RootEntry>>,
    cancellation: CancellationToken,
    http: reqwest::Client,
    unicast: tokio::sync::OnceCell<Arc<tokio::net::UdpSocket>>,
    local_addr: tokio::sync::OnceCell<Ipv4Addr>,
    http_port: tokio::sync::OnceCell<u16>,
}

impl DeviceHost {
    pub fn new(config: HostConfig) -> Arc<Self> {
        Arc::new(Self {
            config,
            state: RwLock::new(HostState::Uninitialized),
            roots: RwLock::new(Vec::new()),
            cancellation: CancellationToken::new(),
            http: reqwest::Client::new(),
            unicast: tokio::sync::OnceCell::new(),
            local_addr: tokio::sync::OnceCell::new(),
            http_port: tokio::sync::OnceCell::new(),
        })
    }

    async fn state(&self) -> HostState {
        *self.state.read().await
    }

    /// Parses the description and every SCPD it references, builds the live device
    /// tree, installs the caller's action handlers, and wires GENA change hooks — but
    /// does not announce or serve anything yet; call [`DeviceHost::init`] once every
    /// root has been added.
    pub async fn add_root_device(&self, spec: RootDeviceSpec) -> Result<Arc<Device>, LifecycleError> {
        if self.state().await != HostState::Uninitialized {
            return Err(LifecycleError::InvalidConfiguration(
                "cannot add a root device after init".into(),
            ));
        }

        let fetcher = LocalFetcher::new(spec.base_dir.clone());
        let description_path = spec
            .description_path
            .to_str()
            .ok_or_else(|| LifecycleError::InvalidConfiguration("description path is not valid utf-8".into()))?;
        let raw_bytes = fetcher
            .fetch(description_path)
            .await
            .map_err(LifecycleError::InvalidDeviceDescription)?;
        let mut reader = quick_xml::Reader::from_reader(raw_bytes.as_slice());
        let raw = RawDeviceDescription::read_xml(&mut reader).map_err(LifecycleError::InvalidDeviceDescription)?;

        let scpds = self
            .fetch_scpds(&raw.device, &fetcher)
            .await
            .map_err(LifecycleError::InvalidServiceDescription)?;

        let device = description::build_device_tree(raw, &scpds, spec.mode, Origin::Host)
            .map_err(LifecycleError::InvalidDeviceDescription)?;

        let mut total_actions = 0usize;
        for tree_device in device.walk() {
            for service in &tree_device.services {
                total_actions += service.actions.len();
                for action in &service.actions {
                    if let Some(handler) = spec.handlers.get(&(service.service_id.clone(), action.name.clone())) {
                        let _ = action.set_handler(handler.clone());
                    }
                }
            }
        }
        device.status().set_invoker(ActionInvoker::new(total_actions));

        let registry = Arc::new(SubscriberRegistry::new(self.http.clone()));
        for tree_device in device.walk() {
            for service in &tree_device.services {
                for var in service.evented_variables() {
                    let registry = registry.clone();
                    let service_id = service.service_id.clone();
                    let var_name = var.name.clone();
                    var.bind_change_hook(Arc::new(move |value: &Value| {
                        let registry = registry.clone();
                        let service_id = service_id.clone();
                        let var_name = var_name.clone();
                        let value = value.clone();
                        tokio::spawn(async move {
                            registry.notify_change(&service_id, &var_name, value).await;
                        });
                    }));
                }
            }
        }

        self.roots.write().await.push(RootEntry {
            device: device.clone(),
            registry,
            base_dir: spec.base_dir,
        });
        Ok(device)
    }

    /// Walks a raw device tree collecting every distinct `SCPDURL`, fetches and parses
    /// each (§4.2's SCPD-is-a-separate-fetch split), keyed by the URL it was declared
    /// under so [`description::build_device_tree`] can stitch them back in.
    fn fetch_scpds<'a>(
        &'a self,
        device: &'a crate::description::RawDevice,
        fetcher: &'a LocalFetcher,
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

    /// Binds the HTTP server and SSDP sockets, renders and stores each root's
    /// description now that its location is known, and spawns the responder,
    /// announcer and subscription-sweep background tasks.
    pub async fn init(self: &Arc<Self>) -> Result<(), LifecycleError> {
        {
            let mut state = self.state.write().await;
            if *state != HostState::Uninitialized {
                return Err(LifecycleError::AlreadyInitialized);
            }
            *state = HostState::Initialized;
        }

        let local_addr = ssdp::resolve_local_addr()
            .await
            .map_err(LifecycleError::UndefinedFailure)?;
        let listener = TcpListener::bind(SocketAddr::new(self.config.bind_address.into(), self.config.http_port))
            .await
            .map_err(|e| LifecycleError::UndefinedFailure(e.into()))?;
        let http_port = listener
            .local_addr()
            .map_err(|e| LifecycleError::UndefinedFailure(e.into()))?
            .port();
        let _ = self.local_addr.set(local_addr);
        let _ = self.http_port.set(http_port);

        let roots = self.roots.read().await;
        for root in roots.iter() {
            let location = format!(
                "http://{local_addr}:{http_port}/{}/device_description.xml",
                root.device.udn.as_str().trim_start_matches("uuid:")
            );
            root.device.add_location(location);
            let config_id = root.device.status().config_id.load(Ordering::SeqCst);
            let rendered = description::render_device_description(&root.device, config_id)
                .map_err(LifecycleError::InvalidDeviceDescription)?;
            root.device.set_description(rendered);
        }

        let router = self.build_router(&roots).await;
        drop(roots);

        let cancellation = self.cancellation.clone();
        tokio::spawn(async move {
            if let Err(err) = axum::serve(listener, router)
                .with_graceful_shutdown(cancellation.cancelled_owned())
                .await
            {
                tracing::error!(%err, "device host HTTP server failed");
            }
        });

        let unicast = Arc::new(
            ssdp::bind_unicast_socket(self.config.bind_address)
                .await
                .map_err(|e| LifecycleError::UndefinedFailure(e))?,
        );
        let _ = self.unicast.set(unicast.clone());
        let multicast = Arc::new(
            ssdp::bind_multicast_socket(self.config.bind_address, self.config.ssdp_ttl)
                .map_err(|e| LifecycleError::UndefinedFailure(e))?,
        );

        self.spawn_responder(multicast);
        self.spawn_announcer(unicast.clone());
        self.spawn_sweep();

        tracing::info!(%local_addr, http_port, "device host initialized");
        Ok(())
    }

    async fn build_router(&self, roots: &[RootEntry]) -> Router {
        let mut router = Router::new();
        for root in roots {
            for device in root.device.walk() {
                let description_path = format!("/{}/device_description.xml", device.udn.as_str().trim_start_matches("uuid:"));
                let root_device = root.device.clone();
                router = router.route(
                    &description_path,
                    get(move || {
                        let root_device = root_device.clone();
                        async move {
                            let mut headers = HeaderMap::new();
                            headers.typed_insert(headers::ContentType::xml());
                            (headers, root_device.description())
                        }
                    }),
                );

                for icon in &device.icons {
                    let path = icon.url.clone();
                    let mimetype = icon.mimetype.clone();
                    let abs = root.base_dir.join(icon.url.trim_start_matches('/'));
                    router = router.route(
                        &path,
                        get(move || {
                            let abs = abs.clone();
                            let mimetype = mimetype.clone();
                            async move {
                                match tokio::fs::read(&abs).await {
                                    Ok(bytes) => {
                                        let mut headers = HeaderMap::new();
                                        if let Ok(value) = mimetype.parse() {
                                            headers.insert(axum::http::header::CONTENT_TYPE, value);
                                        }
                                        (StatusCode::OK, headers, bytes).into_response()
                                    }
                                    Err(err) => {
                                        tracing::warn!(%err, "icon fetch failed");
                                        StatusCode::NOT_FOUND.into_response()
                                    }
                                }
                            }
                        }),
                    );
                }

                for service in &device.services {
                    router = self.register_service_routes(router, root.registry.clone(), service.clone());
                }
            }
        }
        router
    }

    fn register_service_routes(&self, mut router: Router, registry: Arc<SubscriberRegistry>, service: Arc<Service>) -> Router {
        let scpd_service = service.clone();
        router = router.route(
            &service.scpd_url.clone(),
            get(move || {
                let service = scpd_service.clone();
                async move {
                    let mut headers = HeaderMap::new();
                    headers.typed_insert(headers::ContentType::xml());
                    (headers, service.raw_scpd().to_owned())
                }
            }),
        );

        let control_service = service.clone();
        router = router.route(
            &control_service.control_url.clone(),
            post(move |headers: HeaderMap, body: String| {
                let service = control_service.clone();
                async move { handle_control(service, headers, body).await }
            }),
        );

        let gena_service = service.clone();
        let gena_registry = registry.clone();
        router = router.route(
            &gena_service.event_sub_url.clone(),
            axum::routing::any(move |request: Request| {
                let service = gena_service.clone();
                let registry = gena_registry.clone();
                async move { handle_gena(service, registry, request).await }
            }),
        );

        router
    }

    fn spawn_responder(self: &Arc<Self>, multicast: Arc<tokio::net::UdpSocket>) {
        let host = self.clone();
        let unicast = host.unicast.get().expect("unicast socket bound before spawning responder").clone();
        tokio::spawn(async move {
            let mut buf = vec![0u8; 4096];
            loop {
                tokio::select! {
                    _ = host.cancellation.cancelled() => return,
                    result = multicast.recv_from(&mut buf) => {
                        let Ok((len, from)) = result else { continue };
                        let Ok(text) = std::str::from_utf8(&buf[..len]) else { continue };
                        let Ok(SsdpMessage::Search(req)) = SsdpMessage::parse(text) else { continue };
                        let host = host.clone();
                        let unicast = unicast.clone();
                        tokio::spawn(async move {
                            let delay = rand::rng().random_range(0..req.mx.max(1) as u64);
                            tokio::time::sleep(Duration::from_secs(delay)).await;
                            host.answer_search(&req.st, &unicast, from).await;
                        });
                    }
                }
            }
        });
    }

    /// Replies directly to `reply_to`, the address the `M-SEARCH` datagram arrived
    /// from, not to the multicast group (§6.1: the discovery response is unicast back
    /// to the querying control point).
    async fn answer_search(&self, target: &SearchTarget, unicast: &tokio::net::UdpSocket, reply_to: SocketAddr) {
        let roots = self.roots.read().await;
        let local_addr = *self.local_addr.get().expect("local addr resolved at init");
        let http_port = *self.http_port.get().expect("http port bound at init");
        for root in roots.iter() {
            let status = root.device.status();
            for (st, usn) in ssdp::search_responses(target, &root.device) {
                let response = ssdp::DiscoveryResponse {
                    st,
                    usn,
                    location: format!(
                        "http://{local_addr}:{http_port}/{}/device_description.xml",
                        root.device.udn.as_str().trim_start_matches("uuid:")
                    ),
                    cache_control: crate::types::Timeout::clamp_ssdp(self.config.default_max_age),
                    server: self.config.user_agent.to_string(),
                    boot_id: status.boot_id.load(Ordering::SeqCst),
                    config_id: status.config_id.load(Ordering::SeqCst),
                    search_port: None,
                };
                let _ = unicast.send_to(response.to_string().as_bytes(), reply_to).await;
            }
        }
    }

    fn spawn_announcer(self: &Arc<Self>, unicast: Arc<tokio::net::UdpSocket>) {
        let host = self.clone();
        tokio::spawn(async move {
            let interval = Duration::from_secs((host.config.default_max_age / 2).max(1) as u64);
            loop {
                host.announce_alive(&unicast).await;
                tokio::select! {
                    _ = host.cancellation.cancelled() => return,
                    _ = tokio::time::sleep(interval) => {}
                }
            }
        });
    }

    async fn announce_alive(&self, unicast: &tokio::net::UdpSocket) {
        let roots = self.roots.read().await;
        for root in roots.iter() {
            let status = root.device.status();
            status.online.store(true, Ordering::SeqCst);
            for location in root.device.locations() {
                for (nt, usn) in ssdp::alive_targets(&root.device) {
                    let message = AliveMessage {
                        nt,
                        usn,
                        location: location.clone(),
                        cache_control: crate::types::Timeout::clamp_ssdp(self.config.default_max_age),
                        server: self.config.user_agent.to_string(),
                        boot_id: status.boot_id.load(Ordering::SeqCst),
                        config_id: status.config_id.load(Ordering::SeqCst),
                        search_port: None,
                    };
                    for _ in 0..self.config.announce_burst {
                        let _ = unicast.send_to(message.to_string().as_bytes(), ssdp::ssdp_multicast_addr()).await;
                    }
                }
            }
        }
    }

    fn spawn_sweep(self: &Arc<Self>) {
        let host = self.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = host.cancellation.cancelled() => return,
                    _ = tokio::time::sleep(Duration::from_secs(60)) => {}
                }
                let roots = host.roots.read().await;
                for root in roots.iter() {
                    root.registry.sweep_expired().await;
                }
            }
        });
    }

    /// Tears the host down (§5): announces `ssdp:byebye` for every root, drains each
    /// tree's action invoker, then cancels the shared token, which stops the HTTP
    /// server (after in-flight requests finish) and every background task.
    pub async fn quit(&self) -> Result<(), LifecycleError> {
        {
            let mut state = self.state.write().await;
            if *state == HostState::Uninitialized {
                return Err(LifecycleError::InvalidConfiguration("not initialized".into()));
            }
            *state = HostState::Exiting;
        }

        if let Some(unicast) = self.unicast.get() {
            let roots = self.roots.read().await;
            for root in roots.iter() {
                let status = root.device.status();
                for (nt, usn) in ssdp::alive_targets(&root.device) {
                    let message = ByeByeMessage {
                        nt,
                        usn,
                        boot_id: status.boot_id.load(Ordering::SeqCst),
                        config_id: status.config_id.load(Ordering::SeqCst),
                    };
                    for _ in 0..self.config.announce_burst {
                        let _ = unicast.send_to(message.to_string().as_bytes(), ssdp::ssdp_multicast_addr()).await;
                    }
                }
                if let Some(invoker) = status.invoker() {
                    invoker.shutdown().await;
                }
            }
        }

        self.cancellation.cancel();
        Ok(())
    }
}

async fn handle_control(service: Arc<Service>, headers: HeaderMap, body: String) -> axum::response::Response {
    match handle_control_inner(service, headers, body).await {
        Ok(response) => response.into_response(),
        Err(err) => err.into_response(),
    }
}

async fn handle_control_inner(service: Arc<Service>, headers: HeaderMap, body: String) -> Result<ActionResponse<OutArgumentsPayload>, ActionError> {
    let soap_action = headers
        .get("soapaction")
        .and_then(|v| v.to_str().ok())
        .ok_or_else(|| ActionError::with_description(ActionErrorCode::ActionFailed, "missing SOAPACTION header"))?;
    let soap_action = soap_action.trim_matches('"');
    let (_, action_name) = soap_action
        .split_once('#')
        .ok_or_else(|| ActionError::with_description(ActionErrorCode::ActionFailed, "malformed SOAPACTION header"))?;

    let payload: SoapMessage<ActionPayload<InArgumentPayload>> =
        SoapMessage::from_xml(body.as_bytes()).map_err(|e| ActionError::with_description(ActionErrorCode::ActionFailed, e.to_string()))?;
    let payload = payload.into_inner();

    let action = service.find_action(action_name).ok_or_else(ActionError::not_implemented)?.clone();
    let args = payload.arguments_map();

    let mut inputs = HashMap::new();
    for arg in action.in_arguments() {
        let raw = args
            .get(&arg.name)
            .ok_or_else(|| ActionError::with_description(ActionErrorCode::InvalidArgs, format!("missing argument {}", arg.name)))?;
        let value = Value::coerce(arg.data_type(), raw)
            .map_err(|e| ActionError::with_description(ActionErrorCode::ArgumentValueInvalid, e.to_string()))?;
        inputs.insert(arg.name.clone(), value);
    }

    let invoker = service
        .parent_device()
        .and_then(|d| d.root())
        .and_then(|root| root.status().invoker().cloned())
        .ok_or_else(|| ActionError::with_description(ActionErrorCode::ActionFailed, "device has no action invoker"))?;

    let invocation = invoker
        .invoke(action.clone(), inputs)
        .await
        .map_err(|e| ActionError::with_description(ActionErrorCode::ActionFailed, e.to_string()))?;
    let outputs = invocation
        .wait_timeout(Duration::from_secs(30))
        .await
        .map_err(|e| match e {
            crate::error::ActionCallError::Protocol(err) => err,
            other => ActionError::with_description(ActionErrorCode::ActionFailed, other.to_string()),
        })?;

    let mut args = Vec::new();
    for out in action.out_arguments() {
        let value = outputs
            .get(&out.name)
            .ok_or_else(|| ActionError::with_description(ActionErrorCode::ActionFailed, format!("handler omitted output {}", out.name)))?;
        args.push(OutArgumentsPayload::new(out.name.clone(), value.clone()));
    }

    Ok(ActionResponse {
        action_name: action.name.clone(),
        service_type: service.service_type.clone(),
        args,
    })
}

async fn handle_gena(service: Arc<Service>, registry: Arc<SubscriberRegistry>, request: Request) -> axum::response::Response {
    let method = request.method().clone();
    let headers = request.headers().clone();
    let header_map: HashMap<String, String> = headers
        .iter()
        .filter_map(|(k, v)| v.to_str().ok().map(|v| (k.as_str().to_ascii_uppercase(), v.to_owned())))
        .collect();

    match method.as_str() {
        "SUBSCRIBE" => handle_subscribe(service, registry, header_map).await,
        "UNSUBSCRIBE" => handle_unsubscribe(registry, header_map).await,
        _ => StatusCode::METHOD_NOT_ALLOWED.into_response(),
    }
}

async fn handle_subscribe(service: Arc<Service>, registry: Arc<SubscriberRegistry>, headers: HashMap<String, String>) -> axum::response::Response {
    let parsed = match SubscribeRequest::parse_headers(&headers).and_then(|r| {
        r.validate()?;
        Ok(r)
    }) {
        Ok(parsed) => parsed,
        Err(_) => return StatusCode::BAD_REQUEST.into_response(),
    };

    if let Some(sid) = &parsed.sid {
        return match registry.renew(sid, parsed.timeout).await {
            Ok(timeout) => subscribe_response(sid.clone(), timeout),
            Err(_) => StatusCode::PRECONDITION_FAILED.into_response(),
        };
    }

    match registry.subscribe(&service, parsed.callback_urls, parsed.timeout).await {
        Ok((sid, timeout)) => subscribe_response(sid, timeout),
        Err(crate::error::SubscribeError::NothingToSubscribeTo) => {
            // §4.4 leniency: a service with nothing to publish still gets a SID,
            // just one the registry never tracks, so it times out on its own.
            let sid = crate::types::Sid::generate();
            subscribe_response(sid, crate::types::Timeout(86400))
        }
        Err(_) => StatusCode::PRECONDITION_FAILED.into_response(),
    }
}

fn subscribe_response(sid: crate::types::Sid, timeout: crate::types::Timeout) -> axum::response::Response {
    let mut headers = HeaderMap::new();
    headers.insert("SID", sid.to_string().parse().expect("sid is a valid header value"));
    headers.insert(
        "TIMEOUT",
        format!("Second-{}", timeout.0).parse().expect("timeout is a valid header value"),
    );
    (StatusCode::OK, headers).into_response()
}

async fn handle_unsubscribe(registry: Arc<SubscriberRegistry>, headers: HashMap<String, String>) -> axum::response::Response {
    let Some(sid) = headers.get("SID").and_then(|v| v.parse::<crate::types::Sid>().ok()) else {
        return StatusCode::BAD_REQUEST.into_response();
    };
    match registry.unsubscribe(&sid).await {
        Ok(()) => StatusCode::OK.into_response(),
        Err(_) => StatusCode::PRECONDITION_FAILED.into_response(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn local_fetcher_resolves_relative_to_base_dir() {
        let fetcher = LocalFetcher::new("/srv/device");
        assert_eq!(fetcher.resolve("/scpd.xml"), PathBuf::from("/srv/device/scpd.xml"));
        assert_eq!(fetcher.resolve("scpd.xml"), PathBuf::from("/srv/device/scpd.xml"));
    }
}
