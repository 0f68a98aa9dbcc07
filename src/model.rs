//! The in-memory device tree (§4.1): [`Device`] → [`Service`] → [`Action`] /
//! [`StateVariable`], shared between a [`crate::host::DeviceHost`] (built from local
//! descriptions) and a [`crate::control_point::ControlPoint`] (built by parsing a
//! remote description fetched over HTTP). Both sides use the same types because the
//! architecture draws no distinction between "a service I implement" and "a service I
//! observed" once the tree is built — only who is allowed to call `invoke` differs, and
//! that's enforced by whether an [`Action`] has a handler installed.
//!
//! Ownership follows the teacher's UDN/tree conventions: a device owns its embedded
//! devices and services outright (`Vec<Arc<_>>`); back-references from service/device to
//! parent are `Weak`, set once via [`std::sync::OnceLock`] during construction, so the
//! tree has no reference cycles and drops cleanly.

use std::{
    collections::HashMap,
    future::Future,
    pin::Pin,
    sync::{
        atomic::{AtomicBool, AtomicU32, Ordering},
        Arc, OnceLock, Weak,
    },
};

use tokio::sync::RwLock;

use crate::{
    datatype::{DataType, Value},
    soap::ActionError,
    types::{ResourceType, ServiceId, Udn},
};

/// Whether a state variable is announced via GENA when it changes (§4.2 `sendEvents` /
/// `multicast`). UDA 1.1 layers a second attribute on top of `sendEvents`: a variable can
/// be evented only to unicast subscribers, or additionally announced over the multicast
/// event channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Eventing {
    None,
    UnicastOnly,
    UnicastAndMulticast,
}

impl Eventing {
    /// `send_events` is the `sendEvents` attribute (`"yes"`/`"no"`, defaults handled by
    /// the caller); `multicast` is the optional `multicast` attribute, only meaningful
    /// when `send_events` is `"yes"`.
    pub fn from_attrs(send_events: &str, multicast: Option<&str>) -> anyhow::Result<Self> {
        let evented = match send_events {
            "yes" => true,
            "no" => false,
            other => anyhow::bail!("sendEvents must be yes or no, got {other}"),
        };
        if !evented {
            return Ok(Eventing::None);
        }
        let multicast = match multicast {
            None => false,
            Some("yes") => true,
            Some("no") => false,
            Some(other) => anyhow::bail!("multicast must be yes or no, got {other}"),
        };
        Ok(if multicast {
            Eventing::UnicastAndMulticast
        } else {
            Eventing::UnicastOnly
        })
    }

    pub fn send_events_attr(&self) -> &'static str {
        match self {
            Eventing::None => "no",
            Eventing::UnicastOnly | Eventing::UnicastAndMulticast => "yes",
        }
    }

    pub fn multicast_attr(&self) -> Option<&'static str> {
        match self {
            Eventing::UnicastAndMulticast => Some("yes"),
            _ => None,
        }
    }

    pub fn is_evented(&self) -> bool {
        !matches!(self, Eventing::None)
    }

    pub fn is_multicast(&self) -> bool {
        matches!(self, Eventing::UnicastAndMulticast)
    }
}

/// `<allowedValueRange>` / `<allowedValueList>` (§4.2).
#[derive(Debug, Clone)]
pub enum Constraint {
    Range { min: f64, max: f64, step: f64 },
    List(Vec<String>),
}

impl Constraint {
    pub fn validate(&self, value: &Value) -> anyhow::Result<()> {
        match self {
            Constraint::Range { min, max, step } => {
                let v = value
                    .as_f64()
                    .ok_or_else(|| anyhow::anyhow!("allowedValueRange applies to numeric types only"))?;
                anyhow::ensure!(
                    v >= *min && v <= *max,
                    "value {v} outside allowed range [{min}, {max}]"
                );
                if *step > 0.0 {
                    let steps = (v - min) / step;
                    anyhow::ensure!(
                        (steps - steps.round()).abs() < 1e-9,
                        "value {v} is not a multiple of step {step} from {min}"
                    );
                }
                Ok(())
            }
            Constraint::List(allowed) => {
                let text = value.as_text();
                anyhow::ensure!(
                    allowed.iter().any(|a| a == &text),
                    "value {text} is not one of the allowed values"
                );
                Ok(())
            }
        }
    }
}

/// A single `<stateVariable>`. Holds its own current value behind an async lock since
/// both the control handler (on the host) and the eventing worker (emitting a NOTIFY on
/// change) need to read or update it without blocking the runtime.
/// Invoked after a state variable's value actually changes, so the eventing layer can
/// enqueue a NOTIFY without `StateVariable` knowing anything about GENA. Takes the new
/// value by reference so observers that don't care (most won't fire at all, since only
/// evented variables get a hook bound) pay nothing.
pub type ChangeHook = Arc<dyn Fn(&Value) + Send + Sync>;

#[derive(Debug)]
pub struct StateVariable {
    pub name: String,
    pub data_type: DataType,
    pub eventing: Eventing,
    pub constraint: Option<Constraint>,
    pub default: Option<Value>,
    value: RwLock<Value>,
    parent_service: OnceLock<Weak<Service>>,
    change_hook: OnceLock<ChangeHook>,
}

impl StateVariable {
    pub fn new(
        name: impl Into<String>,
        data_type: DataType,
        eventing: Eventing,
        constraint: Option<Constraint>,
        default: Option<Value>,
    ) -> Self {
        let initial = default
            .clone()
            .unwrap_or_else(|| zero_value(data_type));
        Self {
            name: name.into(),
            data_type,
            eventing,
            constraint,
            default,
            value: RwLock::new(initial),
            parent_service: OnceLock::new(),
            change_hook: OnceLock::new(),
        }
    }

    pub(crate) fn bind_parent(&self, parent: Weak<Service>) {
        let _ = self.parent_service.set(parent);
    }

    pub fn parent_service(&self) -> Option<Arc<Service>> {
        self.parent_service.get().and_then(Weak::upgrade)
    }

    /// Bound once by `DeviceHost::init` for every evented variable in the tree. Calling
    /// this more than once on the same variable is a bug on our side, not a runtime
    /// condition callers need to handle, so we drop the result like `bind_parent` does.
    pub(crate) fn bind_change_hook(&self, hook: ChangeHook) {
        let _ = self.change_hook.set(hook);
    }

    pub async fn get(&self) -> Value {
        self.value.read().await.clone()
    }

    /// Validates `value` against the declared constraint (if any) before storing it.
    /// Returns `true` if the stored value actually changed, which is what the eventing
    /// layer uses to decide whether a NOTIFY is owed. Fires the change hook, if one is
    /// bound, after the write lock is released.
    pub async fn set(&self, value: Value) -> anyhow::Result<bool> {
        anyhow::ensure!(
            value.data_type() == self.data_type,
            "type mismatch setting {}: expected {}, got {}",
            self.name,
            self.data_type,
            value.data_type()
        );
        if let Some(constraint) = &self.constraint {
            constraint.validate(&value)?;
        }
        let changed = {
            let mut guard = self.value.write().await;
            let changed = *guard != value;
            *guard = value.clone();
            changed
        };
        if changed {
            if let Some(hook) = self.change_hook.get() {
                hook(&value);
            }
        }
        Ok(changed)
    }

    /// Mutation entry point for application code external to the crate. Unlike [`set`],
    /// this rejects the call outright on a control-point-owned variable (§4.1: a control
    /// point's copy of remote state is read-only except through GENA delivery, which
    /// applies values through `set` directly rather than through here).
    pub async fn set_checked(&self, value: Value, origin: Origin) -> anyhow::Result<bool> {
        anyhow::ensure!(
            origin == Origin::Host,
            "state variable {} is owned by a control point and cannot be set directly",
            self.name
        );
        self.set(value).await
    }
}

fn zero_value(data_type: DataType) -> Value {
    match data_type {
        DataType::Boolean => Value::Boolean(false),
        DataType::String | DataType::Uri => Value::String(String::new()),
        dt if dt.is_integer() => Value::Int(0, dt),
        dt if dt.is_numeric() => Value::Real(0.0, dt),
        other => Value::coerce(other, "").unwrap_or(Value::String(String::new())),
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArgumentDirection {
    In,
    Out,
}

/// An `<argument>` of an `<action>`, bound to the state variable that types it.
#[derive(Debug, Clone)]
pub struct ArgumentSpec {
    pub name: String,
    pub direction: ArgumentDirection,
    pub related_state_variable: Arc<StateVariable>,
    pub is_retval: bool,
}

impl ArgumentSpec {
    pub fn data_type(&self) -> DataType {
        self.related_state_variable.data_type
    }
}

pub type ActionInputs = HashMap<String, Value>;
pub type ActionOutputs = HashMap<String, Value>;

/// A host-side action implementation. Boxed so `Action` doesn't need a generic
/// parameter per service, the same tradeoff the teacher makes with
/// `Box<dyn IntoXml>` for output arguments.
pub type ActionFn = Arc<
    dyn Fn(ActionInputs) -> Pin<Box<dyn Future<Output = Result<ActionOutputs, ActionError>> + Send>>
        + Send
        + Sync,
>;

pub struct Action {
    pub name: String,
    pub arguments: Vec<ArgumentSpec>,
    handler: OnceLock<ActionFn>,
    parent_service: OnceLock<Weak<Service>>,
}

impl std::fmt::Debug for Action {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Action")
            .field("name", &self.name)
            .field("arguments", &self.arguments)
            .field("has_handler", &self.handler.get().is_some())
            .finish()
    }
}

impl Action {
    pub fn new(name: impl Into<String>, arguments: Vec<ArgumentSpec>) -> Self {
        Self {
            name: name.into(),
            arguments,
            handler: OnceLock::new(),
            parent_service: OnceLock::new(),
        }
    }

    pub(crate) fn bind_parent(&self, parent: Weak<Service>) {
        let _ = self.parent_service.set(parent);
    }

    pub fn parent_service(&self) -> Option<Arc<Service>> {
        self.parent_service.get().and_then(Weak::upgrade)
    }

    pub fn in_arguments(&self) -> impl Iterator<Item = &ArgumentSpec> {
        self.arguments.iter().filter(|a| a.direction == ArgumentDirection::In)
    }

    pub fn out_arguments(&self) -> impl Iterator<Item = &ArgumentSpec> {
        self.arguments.iter().filter(|a| a.direction == ArgumentDirection::Out)
    }

    /// Installs the local implementation. Only meaningful on the host side; a control
    /// point never calls this for actions built from a fetched description, since it
    /// invokes remotely instead (`crate::control_point::ControlPoint::invoke_action`).
    pub fn set_handler(&self, f: ActionFn) -> Result<(), ActionFn> {
        self.handler.set(f)
    }

    pub fn handler(&self) -> Option<&ActionFn> {
        self.handler.get()
    }

    pub fn is_local(&self) -> bool {
        self.handler.get().is_some()
    }
}

/// `<service>`: a `serviceType`/`serviceId` pair, its SCPD and three URLs, and the
/// actions/state variables parsed out of the SCPD.
pub struct Service {
    pub service_type: ResourceType,
    pub service_id: ServiceId,
    pub scpd_url: String,
    pub control_url: String,
    pub event_sub_url: String,
    pub actions: Vec<Arc<Action>>,
    pub state_variables: Vec<Arc<StateVariable>>,
    parent_device: OnceLock<Weak<Device>>,
    /// The `<scpd>` document this service was built from, verbatim (§3). Set once by
    /// `crate::description::build_service` after parsing, empty until then.
    raw_scpd: OnceLock<String>,
}

impl std::fmt::Debug for Service {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Service")
            .field("service_type", &self.service_type)
            .field("service_id", &self.service_id)
            .finish()
    }
}

impl Service {
    pub fn new(
        service_type: ResourceType,
        service_id: ServiceId,
        scpd_url: impl Into<String>,
        control_url: impl Into<String>,
        event_sub_url: impl Into<String>,
        actions: Vec<Arc<Action>>,
        state_variables: Vec<Arc<StateVariable>>,
    ) -> Arc<Self> {
        let service = Arc::new(Self {
            service_type,
            service_id,
            scpd_url: scpd_url.into(),
            control_url: control_url.into(),
            event_sub_url: event_sub_url.into(),
            actions,
            state_variables,
            parent_device: OnceLock::new(),
            raw_scpd: OnceLock::new(),
        });
        let weak = Arc::downgrade(&service);
        for action in &service.actions {
            action.bind_parent(weak.clone());
        }
        for sv in &service.state_variables {
            sv.bind_parent(weak.clone());
        }
        service
    }

    pub(crate) fn bind_parent(self: &Arc<Self>, parent: Weak<Device>) {
        let _ = self.parent_device.set(parent);
    }

    pub fn parent_device(&self) -> Option<Arc<Device>> {
        self.parent_device.get().and_then(Weak::upgrade)
    }

    pub fn find_action(&self, name: &str) -> Option<&Arc<Action>> {
        self.actions.iter().find(|a| a.name == name)
    }

    pub fn find_state_variable(&self, name: &str) -> Option<&Arc<StateVariable>> {
        self.state_variables.iter().find(|v| v.name == name)
    }

    pub fn evented_variables(&self) -> impl Iterator<Item = &Arc<StateVariable>> {
        self.state_variables.iter().filter(|v| v.eventing.is_evented())
    }

    pub fn raw_scpd(&self) -> &str {
        self.raw_scpd.get().map(String::as_str).unwrap_or_default()
    }

    pub(crate) fn set_raw_scpd(&self, raw: String) {
        let _ = self.raw_scpd.set(raw);
    }
}

/// Which side of the architecture built this tree. A [`crate::host::DeviceHost`] owns
/// its variables outright; a [`crate::control_point::ControlPoint`] only ever holds a
/// shadow copy kept current by GENA, so direct mutation through
/// [`StateVariable::set_checked`] is rejected on that side.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Origin {
    Host,
    ControlPoint,
}

/// Mutable, root-device-wide status: BOOTID/CONFIGID for `ssdp:update` (§4.5), SEARCHPORT
/// (§6.2) and whether the tree is currently announced online. Embedded devices read this
/// through their [`Device::root`] pointer rather than holding their own copy. Also the
/// anchor point for the tree-wide [`crate::action::ActionInvoker`] and `origin` tag,
/// since both are properties of the tree as a whole rather than of any one device in it.
pub struct DeviceStatus {
    pub boot_id: AtomicU32,
    pub config_id: AtomicU32,
    pub search_port: std::sync::Mutex<Option<u16>>,
    pub online: AtomicBool,
    pub origin: Origin,
    pub invoker: OnceLock<Arc<crate::action::ActionInvoker>>,
    /// Absolute URLs the tree is reachable at (§3: a device may be advertised from more
    /// than one location, e.g. one per local interface on the host side, or merged from
    /// several `ssdp:alive`s for the same UDN on the control-point side).
    locations: std::sync::Mutex<Vec<String>>,
    /// The exact bytes the root device description was built from (host side: rendered
    /// once at `DeviceHost::init`; control-point side: whatever was fetched). Kept
    /// verbatim rather than re-rendered so `description()` round-trips (§8 property 1).
    raw_description: std::sync::Mutex<String>,
}

impl std::fmt::Debug for DeviceStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeviceStatus")
            .field("boot_id", &self.boot_id)
            .field("config_id", &self.config_id)
            .field("online", &self.online)
            .field("origin", &self.origin)
            .finish()
    }
}

impl DeviceStatus {
    fn new(origin: Origin) -> Self {
        Self {
            boot_id: AtomicU32::new(0),
            config_id: AtomicU32::new(0),
            search_port: std::sync::Mutex::new(None),
            online: AtomicBool::new(false),
            origin,
            invoker: OnceLock::new(),
            locations: std::sync::Mutex::new(Vec::new()),
            raw_description: std::sync::Mutex::new(String::new()),
        }
    }

    pub fn bump_boot_id(&self) -> u32 {
        let next = self.boot_id.fetch_add(1, Ordering::SeqCst) + 1;
        next
    }

    /// Installs the tree-wide action invoker. Called once by `DeviceHost::init` after
    /// the full tree (and thus its total action count) is known.
    pub fn set_invoker(&self, invoker: Arc<crate::action::ActionInvoker>) {
        let _ = self.invoker.set(invoker);
    }

    pub fn invoker(&self) -> Option<&Arc<crate::action::ActionInvoker>> {
        self.invoker.get()
    }
}

/// `<device>`: identity, presentation metadata, embedded services/devices, and (root
/// devices only) mutable [`DeviceStatus`].
pub struct Device {
    pub device_type: ResourceType,
    pub udn: Udn,
    pub friendly_name: String,
    pub manufacturer: String,
    pub manufacturer_url: Option<String>,
    pub model_description: Option<String>,
    pub model_name: String,
    pub model_number: Option<String>,
    pub model_url: Option<String>,
    pub serial_number: Option<String>,
    pub upc: Option<String>,
    pub presentation_url: Option<String>,
    pub icons: Vec<Icon>,
    pub services: Vec<Arc<Service>>,
    pub embedded_devices: Vec<Arc<Device>>,
    /// Present only on the root device of a tree; embedded devices look this up via
    /// `root()`.
    status: Option<Arc<DeviceStatus>>,
    root: OnceLock<Weak<Device>>,
    parent: OnceLock<Weak<Device>>,
}

#[derive(Debug, Clone)]
pub struct Icon {
    pub mimetype: String,
    pub width: u32,
    pub height: u32,
    pub depth: u32,
    pub url: String,
}

impl std::fmt::Debug for Device {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Device")
            .field("device_type", &self.device_type)
            .field("udn", &self.udn)
            .field("friendly_name", &self.friendly_name)
            .finish()
    }
}

#[allow(clippy::too_many_arguments)]
pub struct DeviceBuilder {
    pub device_type: ResourceType,
    pub udn: Udn,
    pub friendly_name: String,
    pub manufacturer: String,
    pub manufacturer_url: Option<String>,
    pub model_description: Option<String>,
    pub model_name: String,
    pub model_number: Option<String>,
    pub model_url: Option<String>,
    pub serial_number: Option<String>,
    pub upc: Option<String>,
    pub presentation_url: Option<String>,
    pub icons: Vec<Icon>,
    pub services: Vec<Arc<Service>>,
    pub embedded_devices: Vec<Arc<Device>>,
}

impl Device {
    fn from_builder(builder: DeviceBuilder, status: Option<Arc<DeviceStatus>>) -> Arc<Self> {
        Arc::new(Self {
            device_type: builder.device_type,
            udn: builder.udn,
            friendly_name: builder.friendly_name,
            manufacturer: builder.manufacturer,
            manufacturer_url: builder.manufacturer_url,
            model_description: builder.model_description,
            model_name: builder.model_name,
            model_number: builder.model_number,
            model_url: builder.model_url,
            serial_number: builder.serial_number,
            upc: builder.upc,
            presentation_url: builder.presentation_url,
            icons: builder.icons,
            services: builder.services,
            embedded_devices: builder.embedded_devices,
            status,
            root: OnceLock::new(),
            parent: OnceLock::new(),
        })
    }

    /// Builds a root device: allocates fresh [`DeviceStatus`], wires every embedded
    /// device/service's parent and root back-references. This is the only entry point
    /// `description::build_device_tree` uses for the top of a tree; embedded devices
    /// must go through [`Device::new_embedded`] instead, since only the root carries a
    /// [`DeviceStatus`] (§4.1) — building one with `new_root` would pin its `root()` to
    /// itself and `wire` would then silently fail to overwrite it (`OnceLock` already
    /// set), leaving it permanently unreachable from the real root.
    pub fn new_root(builder: DeviceBuilder, origin: Origin) -> Arc<Self> {
        let status = Some(Arc::new(DeviceStatus::new(origin)));
        let device = Self::from_builder(builder, status);
        device.wire(Arc::downgrade(&device));
        device
    }

    /// Builds an embedded device with no status of its own (§4.1: only root devices own
    /// a [`DeviceStatus`]; this one reaches it through [`Device::root`] once the parent
    /// tree calls `wire`). Never call this for the top of a tree.
    pub(crate) fn new_embedded(builder: DeviceBuilder) -> Arc<Self> {
        Self::from_builder(builder, None)
    }

    fn wire(self: &Arc<Self>, root: Weak<Device>) {
        let _ = self.root.set(root.clone());
        for service in &self.services {
            service.bind_parent(Arc::downgrade(self));
        }
        for embedded in &self.embedded_devices {
            let _ = embedded.parent.set(Arc::downgrade(self));
            embedded.wire(root.clone());
        }
    }

    pub fn is_root(&self) -> bool {
        self.parent.get().is_none()
    }

    pub fn parent(&self) -> Option<Arc<Device>> {
        self.parent.get().and_then(Weak::upgrade)
    }

    pub fn root(&self) -> Option<Arc<Device>> {
        self.root.get().and_then(Weak::upgrade)
    }

    pub fn status(&self) -> Arc<DeviceStatus> {
        if let Some(status) = &self.status {
            return status.clone();
        }
        self.root()
            .and_then(|root| root.status.clone())
            .expect("every device in a wired tree reaches a root with a status")
    }

    pub fn origin(&self) -> Origin {
        self.status().origin
    }

    /// Depth-first walk of this device and every embedded device (§4.1: a tree, devices
    /// may nest arbitrarily deep).
    pub fn walk(self: &Arc<Self>) -> Vec<Arc<Device>> {
        let mut out = vec![self.clone()];
        for embedded in &self.embedded_devices {
            out.extend(embedded.walk());
        }
        out
    }

    pub fn find_service(&self, service_id: &ServiceId) -> Option<&Arc<Service>> {
        self.services.iter().find(|s| &s.service_id == service_id)
    }

    /// §4.1 `servicesByType(rt, versionMatch)`: every service on this device (not its
    /// embedded devices) whose type matches `rt` under `mode`.
    pub fn services_by_type(
        &self,
        rt: &ResourceType,
        mode: crate::types::VersionMatch,
    ) -> Vec<&Arc<Service>> {
        self.services
            .iter()
            .filter(|s| rt.matches(&s.service_type, mode))
            .collect()
    }

    pub fn find_by_udn(self: &Arc<Self>, udn: &Udn) -> Option<Arc<Device>> {
        self.walk().into_iter().find(|d| &d.udn == udn)
    }

    /// Absolute URLs this tree's root is reachable at (§3). Shared by every device in
    /// the tree since only the root is independently fetchable.
    pub fn locations(&self) -> Vec<String> {
        self.status().locations.lock().expect("lock poisoned").clone()
    }

    pub fn add_location(&self, location: String) {
        let mut locations = self.status().locations.lock().expect("lock poisoned");
        if !locations.contains(&location) {
            locations.push(location);
        }
    }

    /// The root device description document this tree was built from, verbatim
    /// (§3: `raw description text`).
    pub fn description(&self) -> String {
        self.status().raw_description.lock().expect("lock poisoned").clone()
    }

    pub fn set_description(&self, raw: String) {
        *self.status().raw_description.lock().expect("lock poisoned") = raw;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::datatype::DataType;

    fn switch_power() -> Arc<Service> {
        let target = Arc::new(StateVariable::new(
            "Target",
            DataType::Boolean,
            Eventing::None,
            None,
            Some(Value::Boolean(false)),
        ));
        let status = Arc::new(StateVariable::new(
            "Status",
            DataType::Boolean,
            Eventing::UnicastOnly,
            None,
            Some(Value::Boolean(false)),
        ));
        let set_target = Arc::new(Action::new(
            "SetTarget",
            vec![ArgumentSpec {
                name: "newTargetValue".into(),
                direction: ArgumentDirection::In,
                related_state_variable: target.clone(),
                is_retval: false,
            }],
        ));
        Service::new(
            ResourceType::service("schemas-upnp-org", "SwitchPower", 1),
            ServiceId::new("upnp-org", "switchpower1"),
            "/scpd.xml",
            "/control",
            "/event",
            vec![set_target],
            vec![target, status],
        )
    }

    #[test]
    fn service_binds_action_and_variable_back_references() {
        let service = switch_power();
        let action = service.find_action("SetTarget").unwrap();
        assert!(Arc::ptr_eq(&action.parent_service().unwrap(), &service));
        let var = service.find_state_variable("Target").unwrap();
        assert!(Arc::ptr_eq(&var.parent_service().unwrap(), &service));
    }

    #[test]
    fn embedded_devices_resolve_root_and_parent() {
        let leaf = Device::new_embedded(DeviceBuilder {
            device_type: ResourceType::device("schemas-upnp-org", "BinaryLight", 1),
            udn: Udn::generate(),
            friendly_name: "leaf".into(),
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
            services: vec![switch_power()],
            embedded_devices: vec![],
        });
        let root = Device::new_root(DeviceBuilder {
            device_type: ResourceType::device("schemas-upnp-org", "BinaryLight", 1),
            udn: Udn::generate(),
            friendly_name: "root".into(),
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
            services: vec![],
            embedded_devices: vec![leaf],
        }, Origin::Host);
        assert!(root.is_root());
        let embedded = &root.embedded_devices[0];
        assert!(!embedded.is_root());
        assert!(Arc::ptr_eq(&embedded.parent().unwrap(), &root));
        assert!(Arc::ptr_eq(&embedded.root().unwrap(), &root));
    }

    #[tokio::test]
    async fn state_variable_set_reports_change_and_validates_type() {
        let var = StateVariable::new("Target", DataType::Boolean, Eventing::None, None, None);
        assert!(var.set(Value::Boolean(true)).await.unwrap());
        assert!(!var.set(Value::Boolean(true)).await.unwrap());
        assert!(var.set(Value::Int(1, DataType::I4)).await.is_err());
    }
}
