//! GENA eventing (§4.5 control-point subscription state machine, §4.6 host-side
//! delivery, §6.5 wire format). The host side owns a [`SubscriberRegistry`] per device
//! tree; the control point side owns one [`RemoteSubscription`] per subscribed service.

use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicU32, Ordering},
        Arc,
    },
    time::{Duration, Instant},
};

use anyhow::Context;
use quick_xml::events::{BytesEnd, BytesStart, BytesText, Event};
use tokio::sync::{mpsc, RwLock};

use std::str::FromStr;

use crate::{
    datatype::Value,
    model::Service,
    types::{Sid, Timeout},
    FromXml, IntoXml, XmlReaderExt, XmlWriter,
};

pub const NOTIFY_NT: &str = "upnp:event";
pub const NOTIFY_NTS: &str = "upnp:propchange";
const PROPERTYSET_NS: &str = "urn:schemas-upnp-org:event-1-0";

/// A departure from UDA's 30s initial-NOTIFY acknowledgement window, down to 3s: the
/// initial event carries no information a late-arriving subscriber couldn't get from a
/// plain `GetStateVariable`-equivalent poll, so this stack fails the subscription fast
/// instead of blocking it for 30s on a single slow callback.
pub const INITIAL_NOTIFY_ACK_TIMEOUT: Duration = Duration::from_secs(3);

/// `<e:propertyset>` body of a NOTIFY request (§6.5).
#[derive(Debug, Clone, Default)]
pub struct PropertySet {
    pub properties: Vec<(String, Value)>,
}

impl PropertySet {
    pub fn single(name: impl Into<String>, value: Value) -> Self {
        Self {
            properties: vec![(name.into(), value)],
        }
    }

    pub async fn snapshot(service: &Service) -> Self {
        let mut properties = Vec::new();
        for var in service.evented_variables() {
            properties.push((var.name.clone(), var.get().await));
        }
        Self { properties }
    }
}

impl IntoXml for PropertySet {
    fn write_xml(&self, w: &mut XmlWriter) -> std::io::Result<()> {
        let mut root = BytesStart::new("e:propertyset");
        root.push_attribute(("xmlns:e", PROPERTYSET_NS));
        w.write_event(Event::Start(root))?;
        for (name, value) in &self.properties {
            w.write_event(Event::Start(BytesStart::new("e:property")))?;
            w.write_event(Event::Start(BytesStart::new(name.as_str())))?;
            w.write_event(Event::Text(BytesText::new(&value.as_text())))?;
            w.write_event(Event::End(BytesEnd::new(name.as_str())))?;
            w.write_event(Event::End(BytesEnd::new("e:property")))?;
        }
        w.write_event(Event::End(BytesEnd::new("e:propertyset")))
    }
}

impl<'a> FromXml<'a> for PropertySet {
    fn read_xml(r: &mut quick_xml::Reader<&'a [u8]>) -> anyhow::Result<Self> {
        r.read_to_start()?; // <e:propertyset>
        let mut properties = Vec::new();
        loop {
            let (empty, start) = r.read_to_start_or_empty()?;
            if start.local_name().as_ref() != b"property" {
                anyhow::bail!("expected e:property element");
            }
            if empty {
                break;
            }
            let (var_empty, var_start) = r.read_to_start_or_empty()?;
            let name = String::from_utf8_lossy(var_start.local_name().as_ref()).into_owned();
            let text = if var_empty {
                String::new()
            } else {
                let text = r.read_text()?.decode()?.into_owned();
                r.read_end()?;
                text
            };
            properties.push((name, Value::String(text)));
            r.read_end()?; // </e:property>
            // peek: propertyset either closes or holds more properties; read_event tells us which
            match r.read_event_err_eof()? {
                quick_xml::events::Event::End(_) => break,
                quick_xml::events::Event::Start(start) => {
                    if start.local_name().as_ref() != b"property" {
                        anyhow::bail!("expected e:property element");
                    }
                    let (var_empty, var_start) = r.read_to_start_or_empty()?;
                    let name = String::from_utf8_lossy(var_start.local_name().as_ref()).into_owned();
                    let text = if var_empty {
                        String::new()
                    } else {
                        let text = r.read_text()?.decode()?.into_owned();
                        r.read_end()?;
                        text
                    };
                    properties.push((name, Value::String(text)));
                    r.read_end()?;
                }
                _ => anyhow::bail!("unexpected event inside propertyset"),
            }
        }
        Ok(Self { properties })
    }
}

/// Parsed `SUBSCRIBE`/renewal request headers (§6.5). `callback_urls` is empty on a
/// renewal (the `SID` is present instead); exactly one of the two must hold per the
/// UDA's mutual-exclusion rule, enforced by [`SubscribeRequest::validate`].
#[derive(Debug, Clone, Default)]
pub struct SubscribeRequest {
    pub callback_urls: Vec<String>,
    pub nt: Option<String>,
    pub sid: Option<Sid>,
    pub timeout: Option<u32>,
}

impl SubscribeRequest {
    pub fn parse_headers(headers: &HashMap<String, String>) -> anyhow::Result<Self> {
        let get = |name: &str| headers.get(&name.to_ascii_uppercase()).map(String::as_str);
        let callback_urls = get("CALLBACK")
            .map(parse_callback_urls)
            .transpose()?
            .unwrap_or_default();
        let sid = get("SID").map(Sid::from_str).transpose().context("parse SID")??;
        let timeout = get("TIMEOUT")
            .map(parse_timeout_header)
            .transpose()
            .context("parse TIMEOUT")?;
        Ok(Self {
            callback_urls,
            nt: get("NT").map(str::to_owned),
            sid,
            timeout,
        })
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        match (self.sid.is_some(), self.callback_urls.is_empty()) {
            (true, true) => Ok(()),
            (false, false) => Ok(()),
            (true, false) => anyhow::bail!("SID and CALLBACK are mutually exclusive"),
            (false, true) => anyhow::bail!("need either CALLBACK (initial subscribe) or SID (renewal)"),
        }
    }
}

fn parse_callback_urls(raw: &str) -> anyhow::Result<Vec<String>> {
    let mut out = Vec::new();
    let mut rest = raw;
    while let Some(start) = rest.find('<') {
        let end = rest[start..].find('>').context("unterminated CALLBACK entry")? + start;
        out.push(rest[start + 1..end].to_owned());
        rest = &rest[end + 1..];
    }
    anyhow::ensure!(!out.is_empty(), "CALLBACK header carried no <url> entries");
    Ok(out)
}

fn parse_timeout_header(raw: &str) -> anyhow::Result<u32> {
    let seconds = raw.trim().strip_prefix("Second-").context("TIMEOUT must be Second-<n> or Second-infinite")?;
    if seconds == "infinite" {
        return Ok(Timeout::GENA_DEFAULT);
    }
    seconds.parse().context("parse TIMEOUT seconds")
}

use std::str::FromStr as _StdFromStr;
impl Sid {
    fn from_str(s: &str) -> anyhow::Result<Self> {
        _StdFromStr::from_str(s)
    }
}

/// One host-side subscriber: its callback URLs, its current TIMEOUT, and a private
/// delivery task that sends NOTIFYs strictly in order (§4.6: a subscriber must never
/// see SEQ go backwards or out of order, so delivery is single-threaded per subscriber
/// even though the registry as a whole serves many subscribers concurrently).
pub struct Subscriber {
    pub sid: Sid,
    pub service_id: crate::types::ServiceId,
    pub callback_urls: Vec<String>,
    timeout: RwLock<Timeout>,
    renewed_at: RwLock<Instant>,
    seq: AtomicU32,
    tx: mpsc::Sender<PropertySet>,
}

impl Subscriber {
    fn spawn(
        sid: Sid,
        service_id: crate::types::ServiceId,
        callback_urls: Vec<String>,
        timeout: Timeout,
        http: reqwest::Client,
    ) -> Arc<Self> {
        let (tx, rx) = mpsc::channel(256);
        let subscriber = Arc::new(Self {
            sid,
            service_id,
            callback_urls,
            timeout: RwLock::new(timeout),
            renewed_at: RwLock::new(Instant::now()),
            seq: AtomicU32::new(0),
            tx,
        });
        tokio::spawn(Self::run_delivery(subscriber.clone(), rx, http));
        subscriber
    }

    async fn run_delivery(self: Arc<Self>, mut rx: mpsc::Receiver<PropertySet>, http: reqwest::Client) {
        while let Some(props) = rx.recv().await {
            let seq = self.next_seq();
            if let Err(err) = self.deliver_once(&http, seq, &props).await {
                tracing::warn!(sid = %self.sid, seq, %err, "NOTIFY delivery failed");
            }
        }
    }

    /// SEQ wraps back to 0 on overflow (§3 invariants: "on wrap, it resets to 0"),
    /// which `AtomicU32::fetch_add` already does on its own via wrapping arithmetic.
    fn next_seq(&self) -> u32 {
        self.seq.fetch_add(1, Ordering::SeqCst)
    }

    async fn deliver_once(&self, http: &reqwest::Client, seq: u32, props: &PropertySet) -> anyhow::Result<()> {
        let body = props.into_string()?;
        for url in &self.callback_urls {
            let result = http
                .request(reqwest::Method::from_bytes(b"NOTIFY").expect("NOTIFY is a valid method token"), url)
                .header("NT", NOTIFY_NT)
                .header("NTS", NOTIFY_NTS)
                .header("SID", self.sid.to_string())
                .header("SEQ", seq.to_string())
                .header("CONTENT-TYPE", "text/xml; charset=\"utf-8\"")
                .body(body.clone())
                .timeout(INITIAL_NOTIFY_ACK_TIMEOUT)
                .send()
                .await;
            match result {
                Ok(resp) if resp.status().is_success() => return Ok(()),
                Ok(resp) => tracing::debug!(%url, status = %resp.status(), "callback rejected NOTIFY"),
                Err(err) => tracing::debug!(%url, %err, "callback unreachable"),
            }
        }
        anyhow::bail!("no callback URL accepted the NOTIFY")
    }

    pub async fn enqueue(&self, props: PropertySet) -> bool {
        self.tx.send(props).await.is_ok()
    }

    pub async fn renew(&self, timeout: Timeout) {
        *self.timeout.write().await = timeout;
        *self.renewed_at.write().await = Instant::now();
    }

    async fn is_expired(&self) -> bool {
        let timeout = *self.timeout.read().await;
        self.renewed_at.read().await.elapsed() > Duration::from_secs(timeout.0 as u64)
    }
}

/// Registry of every active subscriber for one device tree's services (§4.6).
pub struct SubscriberRegistry {
    http: reqwest::Client,
    by_sid: RwLock<HashMap<Sid, Arc<Subscriber>>>,
}

impl SubscriberRegistry {
    pub fn new(http: reqwest::Client) -> Self {
        Self {
            http,
            by_sid: RwLock::new(HashMap::new()),
        }
    }

    /// `service` must have at least one evented state variable (§4.4's SUBSCRIBE
    /// handler rejects a service with none before reaching here).
    pub async fn subscribe(
        &self,
        service: &Service,
        callback_urls: Vec<String>,
        requested_timeout: Option<u32>,
    ) -> Result<(Sid, Timeout), crate::error::SubscribeError> {
        if service.evented_variables().next().is_none() {
            return Err(crate::error::SubscribeError::NothingToSubscribeTo);
        }
        let sid = Sid::generate();
        let timeout = Timeout::clamp_gena(requested_timeout);
        let subscriber = Subscriber::spawn(sid.clone(), service.service_id.clone(), callback_urls, timeout, self.http.clone());
        self.by_sid.write().await.insert(sid.clone(), subscriber.clone());
        subscriber.enqueue(PropertySet::snapshot(service).await).await;
        Ok((sid, timeout))
    }

    pub async fn renew(&self, sid: &Sid, requested_timeout: Option<u32>) -> Result<Timeout, crate::error::SubscribeError> {
        let registry = self.by_sid.read().await;
        let subscriber = registry.get(sid).ok_or(crate::error::SubscribeError::UnknownSid)?;
        let timeout = Timeout::clamp_gena(requested_timeout);
        subscriber.renew(timeout).await;
        Ok(timeout)
    }

    pub async fn unsubscribe(&self, sid: &Sid) -> Result<(), crate::error::SubscribeError> {
        self.by_sid
            .write()
            .await
            .remove(sid)
            .map(|_| ())
            .ok_or(crate::error::SubscribeError::UnknownSid)
    }

    /// Called from the [`crate::model::ChangeHook`] bound on every evented state
    /// variable, fanning the new value out to every subscriber of the owning service.
    pub async fn notify_change(&self, service_id: &crate::types::ServiceId, var_name: &str, value: Value) {
        let registry = self.by_sid.read().await;
        for subscriber in registry.values().filter(|s| &s.service_id == service_id) {
            subscriber.enqueue(PropertySet::single(var_name, value.clone())).await;
        }
    }

    /// Periodic sweep dropping subscribers who never renewed before their TIMEOUT
    /// lapsed. `crate::host::DeviceHost` drives this on an interval.
    pub async fn sweep_expired(&self) {
        let mut expired = Vec::new();
        for (sid, subscriber) in self.by_sid.read().await.iter() {
            if subscriber.is_expired().await {
                expired.push(sid.clone());
            }
        }
        if expired.is_empty() {
            return;
        }
        let mut registry = self.by_sid.write().await;
        for sid in expired {
            registry.remove(&sid);
        }
    }

    pub async fn subscriber_count(&self) -> usize {
        self.by_sid.read().await.len()
    }
}

/// Control-point-side subscription state machine (§4.5's ASCII diagram):
/// `Unsubscribed -> Subscribing -> Subscribed -> Renewing -> Subscribed`, with a
/// sequence mismatch or a failed renewal dropping back to `Unsubscribed` so the caller
/// resubscribes from scratch rather than trusting a shadow copy it can no longer prove
/// is current.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubscriptionState {
    Unsubscribed,
    Subscribing,
    Subscribed,
    Renewing,
    Failed,
}

/// One control point's view of its subscription to a remote service's eventing URL.
pub struct RemoteSubscription {
    pub service_id: crate::types::ServiceId,
    state: RwLock<SubscriptionState>,
    sid: RwLock<Option<Sid>>,
    expected_seq: AtomicU32,
    timeout: RwLock<Timeout>,
}

impl RemoteSubscription {
    pub fn new(service_id: crate::types::ServiceId) -> Self {
        Self {
            service_id,
            state: RwLock::new(SubscriptionState::Unsubscribed),
            sid: RwLock::new(None),
            expected_seq: AtomicU32::new(0),
            timeout: RwLock::new(Timeout::clamp_gena(None)),
        }
    }

    pub async fn state(&self) -> SubscriptionState {
        *self.state.read().await
    }

    pub async fn begin_subscribing(&self) {
        *self.state.write().await = SubscriptionState::Subscribing;
    }

    pub async fn mark_subscribed(&self, sid: Sid, timeout: Timeout) {
        *self.sid.write().await = Some(sid);
        *self.timeout.write().await = timeout;
        self.expected_seq.store(0, Ordering::SeqCst);
        *self.state.write().await = SubscriptionState::Subscribed;
    }

    pub async fn begin_renewing(&self) {
        *self.state.write().await = SubscriptionState::Renewing;
    }

    pub async fn mark_renewed(&self, timeout: Timeout) {
        *self.timeout.write().await = timeout;
        *self.state.write().await = SubscriptionState::Subscribed;
    }

    pub async fn mark_failed(&self) {
        *self.sid.write().await = None;
        *self.state.write().await = SubscriptionState::Failed;
    }

    pub async fn mark_unsubscribed(&self) {
        *self.sid.write().await = None;
        *self.state.write().await = SubscriptionState::Unsubscribed;
    }

    pub async fn sid(&self) -> Option<Sid> {
        self.sid.read().await.clone()
    }

    pub async fn timeout(&self) -> Timeout {
        *self.timeout.read().await
    }

    /// §4.5: a NOTIFY whose SEQ isn't exactly the next expected value means at least
    /// one event was missed or delivered out of order. The shadow copy can no longer be
    /// trusted, so the caller must resubscribe rather than keep applying updates.
    pub fn check_and_advance_seq(&self, seq: u32) -> bool {
        let expected = self.expected_seq.load(Ordering::SeqCst);
        if seq != expected {
            return false;
        }
        self.expected_seq.store(seq.wrapping_add(1), Ordering::SeqCst);
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Action, ArgumentSpec, DataType, Eventing, StateVariable};

    fn service_with_one_evented_var() -> Arc<Service> {
        let status = Arc::new(StateVariable::new(
            "Status",
            DataType::Boolean,
            Eventing::UnicastOnly,
            None,
            Some(Value::Boolean(false)),
        ));
        Service::new(
            crate::types::ResourceType::service("schemas-upnp-org", "SwitchPower", 1),
            crate::types::ServiceId::new("upnp-org", "switchpower1"),
            "/scpd.xml",
            "/control",
            "/event",
            vec![Arc::new(Action::new("GetStatus", Vec::<ArgumentSpec>::new()))],
            vec![status],
        )
    }

    #[test]
    fn parses_callback_header_with_multiple_urls() {
        let urls = parse_callback_urls("<http://10.0.0.2:4004/cb><http://10.0.0.2:4005/cb>").unwrap();
        assert_eq!(urls, vec!["http://10.0.0.2:4004/cb", "http://10.0.0.2:4005/cb"]);
    }

    #[test]
    fn subscribe_request_rejects_both_callback_and_sid() {
        let mut headers = HashMap::new();
        headers.insert("CALLBACK".to_owned(), "<http://a/b>".to_owned());
        headers.insert("SID".to_owned(), Sid::generate().to_string());
        let request = SubscribeRequest::parse_headers(&headers).unwrap();
        assert!(request.validate().is_err());
    }

    #[tokio::test]
    async fn subscribe_rejects_service_with_no_evented_variables() {
        let registry = SubscriberRegistry::new(reqwest::Client::new());
        let status = Arc::new(StateVariable::new(
            "Status",
            DataType::Boolean,
            Eventing::None,
            None,
            Some(Value::Boolean(false)),
        ));
        let service = Service::new(
            crate::types::ResourceType::service("schemas-upnp-org", "SwitchPower", 1),
            crate::types::ServiceId::new("upnp-org", "switchpower1"),
            "/scpd.xml",
            "/control",
            "/event",
            vec![],
            vec![status],
        );
        let result = registry.subscribe(&service, vec!["http://127.0.0.1:1/cb".into()], None).await;
        assert!(matches!(result, Err(crate::error::SubscribeError::NothingToSubscribeTo)));
    }

    #[tokio::test]
    async fn unsubscribe_of_unknown_sid_fails() {
        let registry = SubscriberRegistry::new(reqwest::Client::new());
        let result = registry.unsubscribe(&Sid::generate()).await;
        assert!(matches!(result, Err(crate::error::SubscribeError::UnknownSid)));
    }

    #[test]
    fn seq_check_rejects_gap_and_accepts_wraparound() {
        let sub = RemoteSubscription::new(crate::types::ServiceId::new("upnp-org", "switchpower1"));
        assert!(sub.check_and_advance_seq(0));
        assert!(sub.check_and_advance_seq(1));
        assert!(!sub.check_and_advance_seq(5));
        sub.expected_seq.store(u32::MAX, Ordering::SeqCst);
        assert!(sub.check_and_advance_seq(u32::MAX));
        assert_eq!(sub.expected_seq.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn subscriber_seq_wraps_to_zero_not_one() {
        let subscriber = Subscriber::spawn(
            Sid::generate(),
            crate::types::ServiceId::new("upnp-org", "switchpower1"),
            vec!["http://127.0.0.1:1/cb".into()],
            Timeout::clamp_gena(None),
            reqwest::Client::new(),
        );
        subscriber.seq.store(u32::MAX, Ordering::SeqCst);
        assert_eq!(subscriber.next_seq(), u32::MAX);
        assert_eq!(subscriber.seq.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn propertyset_roundtrips_through_xml() {
        let service = service_with_one_evented_var();
        let set = PropertySet::snapshot(&service).await;
        let xml = set.into_string().unwrap();
        let mut reader = quick_xml::Reader::from_str(&xml);
        let parsed = PropertySet::read_xml(&mut reader).unwrap();
        assert_eq!(parsed.properties.len(), 1);
        assert_eq!(parsed.properties[0].0, "Status");
    }
}
