//! Device description and SCPD parsing/building (§4.2). Two directions meet here:
//!
//! - the host renders its in-memory [`crate::model::Device`] tree into XML documents
//!   on every GET (`render_device_description`, `render_scpd`);
//! - the control point parses XML fetched over HTTP into the same tree
//!   (`build_device_tree`, via the intermediate `Raw*` structs below).
//!
//! The intermediate `Raw*` types exist because a description and its service SCPDs
//! arrive as separate HTTP fetches (`SCPDURL` is a reference, not inline content) — the
//! raw device tree is parsed fully first, then [`build_device_tree`] stitches in
//! already-fetched SCPDs to produce the final [`crate::model::Device`].

use std::{collections::HashMap, str::FromStr, sync::Arc};

use anyhow::Context;
use quick_xml::events::{BytesDecl, BytesStart, BytesText, Event};

use crate::{
    datatype::{DataType, Value},
    model::{
        Action, ArgumentDirection, ArgumentSpec, Constraint, Device, DeviceBuilder, Eventing, Icon,
        Origin, Service, StateVariable,
    },
    types::{ResourceType, ServiceId, SpecVersion, Udn},
    FromXml, IntoXml, XmlReaderExt, XmlWriter,
};

/// How strictly a fetched description is validated before being accepted into the
/// control point's device tree (`objectcreator_p.cpp`'s strict/lenient modes).
/// `Lenient` tolerates a missing or unfetchable icon and unknown elements; `Strict`
/// rejects the whole device on any such defect.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BuilderMode {
    Strict,
    Lenient,
}

/// Retrieves a description/SCPD/icon by URL. The host implements this over its own
/// filesystem-backed description cache; the control point implements it over `reqwest`.
#[async_trait::async_trait]
pub trait Fetcher: Send + Sync {
    async fn fetch(&self, url: &str) -> anyhow::Result<Vec<u8>>;
}

#[derive(Debug)]
pub struct RawDeviceDescription {
    pub spec_version: SpecVersion,
    pub device: RawDevice,
}

#[derive(Debug)]
pub struct RawDevice {
    pub device_type: ResourceType,
    pub friendly_name: String,
    pub manufacturer: String,
    pub manufacturer_url: Option<String>,
    pub model_description: Option<String>,
    pub model_name: String,
    pub model_number: Option<String>,
    pub model_url: Option<String>,
    pub serial_number: Option<String>,
    pub upc: Option<String>,
    pub udn: Udn,
    pub icon_list: Vec<RawIcon>,
    pub service_list: Vec<RawService>,
    pub device_list: Vec<RawDevice>,
    pub presentation_url: Option<String>,
}

#[derive(Debug, Clone)]
pub struct RawIcon {
    pub mimetype: String,
    pub width: u32,
    pub height: u32,
    pub depth: u32,
    pub url: String,
}

#[derive(Debug)]
pub struct RawService {
    pub service_type: ResourceType,
    pub service_id: ServiceId,
    pub scpd_url: String,
    pub control_url: String,
    pub event_sub_url: String,
}

impl<'a> FromXml<'a> for RawDeviceDescription {
    fn read_xml(r: &mut quick_xml::Reader<&'a [u8]>) -> anyhow::Result<Self> {
        let root = r.read_to_start()?;
        anyhow::ensure!(root.local_name().as_ref() == b"root");
        let root = root.to_owned();

        let spec_version = read_spec_version(r)?;
        r.read_to_start()?;
        let device = RawDevice::read_xml(r)?;
        r.read_to_end(root.to_end().name())?;

        Ok(Self {
            spec_version,
            device,
        })
    }
}

fn read_spec_version(r: &mut quick_xml::Reader<&[u8]>) -> anyhow::Result<SpecVersion> {
    let start = r.read_to_start()?;
    anyhow::ensure!(start.local_name().as_ref() == b"specVersion");
    let mut major = None;
    let mut minor = None;
    loop {
        let event = r.read_event_err_eof()?.into_owned();
        match event {
            Event::Start(tag) => match tag.local_name().as_ref() {
                b"major" => major = Some(r.read_text(tag.name())?.parse()?),
                b"minor" => minor = Some(r.read_text(tag.name())?.parse()?),
                _ => {
                    r.read_to_end(tag.name())?;
                }
            },
            Event::End(end) if end.local_name().as_ref() == b"specVersion" => break,
            _ => {}
        }
    }
    let version = SpecVersion {
        major: major.context("specVersion major")?,
        minor: minor.context("specVersion minor")?,
    };
    version.validate()?;
    Ok(version)
}

impl IntoXml for SpecVersion {
    fn write_xml(&self, w: &mut XmlWriter) -> std::io::Result<()> {
        let parent = BytesStart::new("specVersion");
        w.write_event(Event::Start(parent.clone()))?;
        w.create_element("major")
            .write_text_content(BytesText::new(&self.major.to_string()))?;
        w.create_element("minor")
            .write_text_content(BytesText::new(&self.minor.to_string()))?;
        w.write_event(Event::End(parent.to_end()))
    }
}

impl<'a> FromXml<'a> for RawDevice {
    fn read_xml(r: &mut quick_xml::Reader<&'a [u8]>) -> anyhow::Result<Self> {
        let mut device_type = None;
        let mut friendly_name = None;
        let mut manufacturer = None;
        let mut manufacturer_url = None;
        let mut model_description = None;
        let mut model_name = None;
        let mut model_number = None;
        let mut model_url = None;
        let mut serial_number = None;
        let mut upc = None;
        let mut udn = None;
        let mut icon_list = Vec::new();
        let mut service_list = Vec::new();
        let mut device_list = Vec::new();
        let mut presentation_url = None;

        loop {
            let event = r.read_event_err_eof()?.into_owned();
            match event {
                Event::Start(start) => {
                    let end_name = start.name();
                    match start.local_name().as_ref() {
                        b"deviceType" => {
                            device_type = Some(ResourceType::from_str(&r.read_text(end_name)?)?)
                        }
                        b"friendlyName" => friendly_name = Some(r.read_text(end_name)?.to_string()),
                        b"manufacturer" => manufacturer = Some(r.read_text(end_name)?.to_string()),
                        b"manufacturerURL" => {
                            manufacturer_url = Some(r.read_text(end_name)?.to_string())
                        }
                        b"modelDescription" => {
                            model_description = Some(r.read_text(end_name)?.to_string())
                        }
                        b"modelName" => model_name = Some(r.read_text(end_name)?.to_string()),
                        b"modelNumber" => model_number = Some(r.read_text(end_name)?.to_string()),
                        b"modelURL" => model_url = Some(r.read_text(end_name)?.to_string()),
                        b"serialNumber" => serial_number = Some(r.read_text(end_name)?.to_string()),
                        b"UPC" => upc = Some(r.read_text(end_name)?.to_string()),
                        b"UDN" => udn = Some(Udn::from_str(&r.read_text(end_name)?)?),
                        b"iconList" => {
                            loop {
                                let e = r.read_event_err_eof()?.into_owned();
                                match e {
                                    Event::Start(start) => {
                                        anyhow::ensure!(start.local_name().as_ref() == b"icon");
                                        icon_list.push(RawIcon::read_xml(r)?);
                                    }
                                    Event::End(end) if end.local_name().as_ref() == b"iconList" => {
                                        break
                                    }
                                    _ => {}
                                }
                            }
                        }
                        b"serviceList" => {
                            loop {
                                let e = r.read_event_err_eof()?.into_owned();
                                match e {
                                    Event::Start(start) => {
                                        anyhow::ensure!(start.local_name().as_ref() == b"service");
                                        service_list.push(RawService::read_xml(r)?);
                                    }
                                    Event::End(end) if end.local_name().as_ref() == b"serviceList" => {
                                        break
                                    }
                                    _ => {}
                                }
                            }
                        }
                        b"deviceList" => {
                            loop {
                                let e = r.read_event_err_eof()?.into_owned();
                                match e {
                                    Event::Start(start) => {
                                        anyhow::ensure!(start.local_name().as_ref() == b"device");
                                        device_list.push(RawDevice::read_xml(r)?);
                                    }
                                    Event::End(end) if end.local_name().as_ref() == b"deviceList" => {
                                        break
                                    }
                                    _ => {}
                                }
                            }
                        }
                        b"presentationURL" => {
                            presentation_url = Some(r.read_text(end_name)?.to_string())
                        }
                        _ => {
                            r.read_to_end(end_name)?;
                        }
                    }
                }
                Event::End(end) if end.local_name().as_ref() == b"device" => break,
                _ => {}
            }
        }

        Ok(Self {
            device_type: device_type.context("deviceType")?,
            friendly_name: friendly_name.context("friendlyName")?,
            manufacturer: manufacturer.context("manufacturer")?,
            manufacturer_url,
            model_description,
            model_name: model_name.context("modelName")?,
            model_number,
            model_url,
            serial_number,
            upc,
            udn: udn.context("UDN")?,
            icon_list,
            service_list,
            device_list,
            presentation_url,
        })
    }
}

impl<'a> FromXml<'a> for RawIcon {
    fn read_xml(r: &mut quick_xml::Reader<&'a [u8]>) -> anyhow::Result<Self> {
        let mut mimetype = None;
        let mut width = None;
        let mut height = None;
        let mut depth = None;
        let mut url = None;
        loop {
            let event = r.read_event_err_eof()?.into_owned();
            match event {
                Event::Start(start) => {
                    let end = start.name();
                    match start.local_name().as_ref() {
                        b"mimetype" => mimetype = Some(r.read_text(end)?.to_string()),
                        b"width" => width = Some(r.read_text(end)?.parse()?),
                        b"height" => height = Some(r.read_text(end)?.parse()?),
                        b"depth" => depth = Some(r.read_text(end)?.parse()?),
                        b"url" => url = Some(r.read_text(end)?.to_string()),
                        _ => {
                            r.read_to_end(end)?;
                        }
                    }
                }
                Event::End(end) if end.local_name().as_ref() == b"icon" => break,
                _ => {}
            }
        }
        Ok(Self {
            mimetype: mimetype.context("icon mimetype")?,
            width: width.context("icon width")?,
            height: height.context("icon height")?,
            depth: depth.context("icon depth")?,
            url: url.context("icon url")?,
        })
    }
}

impl<'a> FromXml<'a> for RawService {
    fn read_xml(r: &mut quick_xml::Reader<&'a [u8]>) -> anyhow::Result<Self> {
        let mut service_type = None;
        let mut service_id = None;
        let mut scpd_url = None;
        let mut control_url = None;
        let mut event_sub_url = None;
        loop {
            let event = r.read_event_err_eof()?.into_owned();
            match event {
                Event::Start(start) => {
                    let end = start.name();
                    match start.local_name().as_ref() {
                        b"serviceType" => {
                            service_type = Some(ResourceType::from_str(&r.read_text(end)?)?)
                        }
                        b"serviceId" => service_id = Some(ServiceId::from_str(&r.read_text(end)?)?),
                        b"SCPDURL" => scpd_url = Some(r.read_text(end)?.to_string()),
                        b"controlURL" => control_url = Some(r.read_text(end)?.to_string()),
                        b"eventSubURL" => event_sub_url = Some(r.read_text(end)?.to_string()),
                        _ => {
                            r.read_to_end(end)?;
                        }
                    }
                }
                Event::End(end) if end.local_name().as_ref() == b"service" => break,
                _ => {}
            }
        }
        Ok(Self {
            service_type: service_type.context("serviceType")?,
            service_id: service_id.context("serviceId")?,
            scpd_url: scpd_url.context("SCPDURL")?,
            control_url: control_url.context("controlURL")?,
            event_sub_url: event_sub_url.context("eventSubURL")?,
        })
    }
}

/// Parsed `<scpd>` document: one per service, fetched separately from the device
/// description it's referenced by.
#[derive(Debug)]
pub struct RawScpd {
    pub spec_version: SpecVersion,
    pub state_variables: Vec<RawStateVariable>,
    pub actions: Vec<RawAction>,
}

#[derive(Debug)]
pub struct RawStateVariable {
    pub name: String,
    pub data_type: DataType,
    pub send_events: Eventing,
    pub constraint: Option<Constraint>,
    pub default: Option<String>,
}

#[derive(Debug)]
pub struct RawAction {
    pub name: String,
    pub arguments: Vec<RawArgument>,
}

#[derive(Debug)]
pub struct RawArgument {
    pub name: String,
    pub direction: ArgumentDirection,
    pub related_state_variable: String,
    pub is_retval: bool,
}

impl<'a> FromXml<'a> for RawScpd {
    fn read_xml(r: &mut quick_xml::Reader<&'a [u8]>) -> anyhow::Result<Self> {
        let root = r.read_to_start()?;
        anyhow::ensure!(root.local_name().as_ref() == b"scpd");
        let root = root.to_owned();

        let spec_version = read_spec_version(r)?;
        let mut actions = Vec::new();
        let mut state_variables = Vec::new();

        loop {
            let event = r.read_event_err_eof()?.into_owned();
            match event {
                Event::Start(start) => match start.local_name().as_ref() {
                    b"actionList" => loop {
                        let e = r.read_event_err_eof()?.into_owned();
                        match e {
                            Event::Start(start) => {
                                anyhow::ensure!(start.local_name().as_ref() == b"action");
                                actions.push(RawAction::read_xml(r)?);
                            }
                            Event::End(end) if end.local_name().as_ref() == b"actionList" => break,
                            _ => {}
                        }
                    },
                    b"serviceStateTable" => loop {
                        let e = r.read_event_err_eof()?.into_owned();
                        match e {
                            Event::Start(start) => {
                                anyhow::ensure!(start.local_name().as_ref() == b"stateVariable");
                                state_variables.push(RawStateVariable::read_xml(&start, r)?);
                            }
                            Event::End(end)
                                if end.local_name().as_ref() == b"serviceStateTable" =>
                            {
                                break
                            }
                            _ => {}
                        }
                    },
                    _ => {
                        r.read_to_end(start.name())?;
                    }
                },
                Event::End(end) if end.name() == root.to_end().name() => break,
                _ => {}
            }
        }

        Ok(Self {
            spec_version,
            state_variables,
            actions,
        })
    }
}

impl RawStateVariable {
    fn read_xml(
        start: &quick_xml::events::BytesStart,
        r: &mut quick_xml::Reader<&[u8]>,
    ) -> anyhow::Result<Self> {
        let attr_value = |local_name: &[u8]| -> anyhow::Result<Option<String>> {
            start
                .attributes()
                .flatten()
                .find(|a| a.key.local_name().as_ref() == local_name)
                .map(|a| a.unescape_value().map(|v| v.to_string()))
                .transpose()
                .map_err(anyhow::Error::from)
        };
        let send_events = attr_value(b"sendEvents")?.unwrap_or_else(|| "no".to_string());
        let multicast = attr_value(b"multicast")?;
        let send_events = Eventing::from_attrs(&send_events, multicast.as_deref())?;

        let mut name = None;
        let mut data_type = None;
        let mut default = None;
        let mut allowed_list = None;
        let mut range: Option<(f64, f64, Option<f64>)> = None;

        loop {
            let event = r.read_event_err_eof()?.into_owned();
            match event {
                Event::Start(tag) => {
                    let end = tag.name();
                    match tag.local_name().as_ref() {
                        b"name" => name = Some(r.read_text(end)?.to_string()),
                        b"dataType" => data_type = Some(DataType::from_str(&r.read_text(end)?)?),
                        b"defaultValue" => default = Some(r.read_text(end)?.to_string()),
                        b"allowedValueList" => {
                            let mut values = Vec::new();
                            loop {
                                let e = r.read_event_err_eof()?.into_owned();
                                match e {
                                    Event::Start(v) => {
                                        anyhow::ensure!(
                                            v.local_name().as_ref() == b"allowedValue"
                                        );
                                        values.push(r.read_text(v.name())?.to_string());
                                    }
                                    Event::End(e)
                                        if e.local_name().as_ref() == b"allowedValueList" =>
                                    {
                                        break
                                    }
                                    _ => {}
                                }
                            }
                            allowed_list = Some(values);
                        }
                        b"allowedValueRange" => {
                            let mut min = None;
                            let mut max = None;
                            let mut step = None;
                            loop {
                                let e = r.read_event_err_eof()?.into_owned();
                                match e {
                                    Event::Start(v) => {
                                        let end = v.name();
                                        match v.local_name().as_ref() {
                                            b"minimum" => min = Some(r.read_text(end)?.parse()?),
                                            b"maximum" => max = Some(r.read_text(end)?.parse()?),
                                            b"step" => step = Some(r.read_text(end)?.parse()?),
                                            _ => {
                                                r.read_to_end(end)?;
                                            }
                                        }
                                    }
                                    Event::End(e)
                                        if e.local_name().as_ref() == b"allowedValueRange" =>
                                    {
                                        break
                                    }
                                    _ => {}
                                }
                            }
                            range = Some((
                                min.context("allowedValueRange minimum")?,
                                max.context("allowedValueRange maximum")?,
                                step,
                            ));
                        }
                        _ => {
                            r.read_to_end(end)?;
                        }
                    }
                }
                Event::End(end) if end.local_name().as_ref() == b"stateVariable" => break,
                _ => {}
            }
        }

        let data_type = data_type.context("stateVariable dataType")?;
        let constraint = match (range, allowed_list) {
            (Some((min, max, step)), _) => Some(Constraint::Range {
                min,
                max,
                step: step.unwrap_or_else(|| data_type.default_step(max)),
            }),
            (None, Some(values)) => Some(Constraint::List(values)),
            (None, None) => None,
        };

        Ok(Self {
            name: name.context("stateVariable name")?,
            data_type,
            send_events,
            constraint,
            default,
        })
    }
}

impl<'a> FromXml<'a> for RawAction {
    fn read_xml(r: &mut quick_xml::Reader<&'a [u8]>) -> anyhow::Result<Self> {
        let mut name = None;
        let mut arguments = Vec::new();
        loop {
            let event = r.read_event_err_eof()?.into_owned();
            match event {
                Event::Start(start) => match start.local_name().as_ref() {
                    b"name" => name = Some(r.read_text(start.name())?.to_string()),
                    b"argumentList" => loop {
                        let e = r.read_event_err_eof()?.into_owned();
                        match e {
                            Event::Start(start) => {
                                anyhow::ensure!(start.local_name().as_ref() == b"argument");
                                arguments.push(RawArgument::read_xml(r)?);
                            }
                            Event::End(end) if end.local_name().as_ref() == b"argumentList" => {
                                break
                            }
                            _ => {}
                        }
                    },
                    _ => {
                        r.read_to_end(start.name())?;
                    }
                },
                Event::End(end) if end.local_name().as_ref() == b"action" => break,
                _ => {}
            }
        }
        Ok(Self {
            name: name.context("action name")?,
            arguments,
        })
    }
}

impl<'a> FromXml<'a> for RawArgument {
    fn read_xml(r: &mut quick_xml::Reader<&'a [u8]>) -> anyhow::Result<Self> {
        let mut name = None;
        let mut direction = None;
        let mut related_state_variable = None;
        let mut is_retval = false;
        loop {
            let event = r.read_event_err_eof()?.into_owned();
            match event {
                Event::Start(tag) => {
                    let end = tag.name();
                    match tag.local_name().as_ref() {
                        b"name" => name = Some(r.read_text(end)?.to_string()),
                        b"direction" => {
                            direction = Some(match &*r.read_text(end)? {
                                "in" => ArgumentDirection::In,
                                "out" => ArgumentDirection::Out,
                                other => anyhow::bail!("unknown argument direction: {other}"),
                            })
                        }
                        b"relatedStateVariable" => {
                            related_state_variable = Some(r.read_text(end)?.to_string())
                        }
                        b"retval" => is_retval = true,
                        _ => {
                            r.read_to_end(end)?;
                        }
                    }
                }
                Event::Empty(tag) if tag.local_name().as_ref() == b"retval" => is_retval = true,
                Event::End(end) if end.local_name().as_ref() == b"argument" => break,
                _ => {}
            }
        }
        Ok(Self {
            name: name.context("argument name")?,
            direction: direction.context("argument direction")?,
            related_state_variable: related_state_variable
                .context("argument relatedStateVariable")?,
            is_retval,
        })
    }
}

/// Turns a fully-fetched raw device tree plus its services' already-parsed SCPDs into
/// the live [`Device`] the rest of the stack operates on. `scpds` is keyed by the
/// `SCPDURL` each `RawService` names, since one SCPD can in principle be shared by
/// multiple service instances within a tree. Each entry pairs the parsed [`RawScpd`]
/// with the exact bytes it was parsed from, so the built [`Service`] can keep the
/// verbatim document around (§3) instead of re-rendering one from the parsed form.
pub fn build_device_tree(
    raw: RawDeviceDescription,
    scpds: &HashMap<String, (String, RawScpd)>,
    mode: BuilderMode,
    origin: Origin,
) -> anyhow::Result<Arc<Device>> {
    raw.spec_version.validate()?;
    let builder = build_raw_device(raw.device, scpds, mode)?;
    let device = Device::new_root(builder, origin);
    validate_unique_urls(&device)?;
    Ok(device)
}

fn build_raw_device(
    raw: RawDevice,
    scpds: &HashMap<String, (String, RawScpd)>,
    mode: BuilderMode,
) -> anyhow::Result<DeviceBuilder> {
    let mut services = Vec::with_capacity(raw.service_list.len());
    for raw_service in raw.service_list {
        let scpd = scpds.get(&raw_service.scpd_url);
        let (raw_scpd_text, scpd) = match (scpd, mode) {
            (Some((text, scpd)), _) => (text.as_str(), scpd),
            (None, BuilderMode::Lenient) => {
                tracing::warn!(url = raw_service.scpd_url, "skipping service with no fetched SCPD");
                continue;
            }
            (None, BuilderMode::Strict) => {
                anyhow::bail!("missing SCPD for {}", raw_service.scpd_url)
            }
        };
        services.push(build_service(raw_service, scpd, raw_scpd_text)?);
    }

    let mut embedded_devices = Vec::with_capacity(raw.device_list.len());
    for child in raw.device_list {
        let child_builder = build_raw_device(child, scpds, mode)?;
        embedded_devices.push(Device::new_embedded(child_builder));
    }

    let icons = raw
        .icon_list
        .into_iter()
        .map(|icon| Icon {
            mimetype: icon.mimetype,
            width: icon.width,
            height: icon.height,
            depth: icon.depth,
            url: icon.url,
        })
        .collect();

    Ok(DeviceBuilder {
        device_type: raw.device_type,
        udn: raw.udn,
        friendly_name: raw.friendly_name,
        manufacturer: raw.manufacturer,
        manufacturer_url: raw.manufacturer_url,
        model_description: raw.model_description,
        model_name: raw.model_name,
        model_number: raw.model_number,
        model_url: raw.model_url,
        serial_number: raw.serial_number,
        upc: raw.upc,
        presentation_url: raw.presentation_url,
        icons,
        services,
        embedded_devices,
    })
}

fn build_service(raw: RawService, scpd: &RawScpd, raw_scpd_text: &str) -> anyhow::Result<Arc<Service>> {
    let mut state_variables = Vec::with_capacity(scpd.state_variables.len());
    let mut by_name = HashMap::new();
    for raw_var in &scpd.state_variables {
        let default = raw_var
            .default
            .as_deref()
            .map(|text| Value::coerce(raw_var.data_type, text))
            .transpose()
            .with_context(|| format!("defaultValue for {}", raw_var.name))?;
        let var = Arc::new(StateVariable::new(
            raw_var.name.clone(),
            raw_var.data_type,
            raw_var.send_events,
            raw_var.constraint.clone(),
            default,
        ));
        by_name.insert(raw_var.name.clone(), var.clone());
        state_variables.push(var);
    }

    let mut actions = Vec::with_capacity(scpd.actions.len());
    for raw_action in &scpd.actions {
        let mut arguments = Vec::with_capacity(raw_action.arguments.len());
        for raw_arg in &raw_action.arguments {
            let related = by_name
                .get(&raw_arg.related_state_variable)
                .with_context(|| {
                    format!(
                        "action {} argument {} references unknown state variable {}",
                        raw_action.name, raw_arg.name, raw_arg.related_state_variable
                    )
                })?
                .clone();
            arguments.push(ArgumentSpec {
                name: raw_arg.name.clone(),
                direction: raw_arg.direction,
                related_state_variable: related,
                is_retval: raw_arg.is_retval,
            });
        }
        validate_argument_order(&raw_action.name, &arguments)?;
        actions.push(Arc::new(Action::new(raw_action.name.clone(), arguments)));
    }

    let service = Service::new(
        raw.service_type,
        raw.service_id,
        raw.scpd_url,
        raw.control_url,
        raw.event_sub_url,
        actions,
        state_variables,
    );
    service.set_raw_scpd(raw_scpd_text.to_owned());
    Ok(service)
}

/// §3 invariants: all `in` args precede all `out` args, and the retval (if any) is the
/// first `out` arg. `objectcreator_p.cpp` rejects the whole action on either violation
/// rather than silently reordering.
fn validate_argument_order(action_name: &str, arguments: &[ArgumentSpec]) -> anyhow::Result<()> {
    let mut seen_out = false;
    let mut out_index = 0usize;
    for arg in arguments {
        match arg.direction {
            ArgumentDirection::In => {
                anyhow::ensure!(
                    !seen_out,
                    "action {action_name}: in argument {} follows an out argument",
                    arg.name
                );
            }
            ArgumentDirection::Out => {
                if arg.is_retval {
                    anyhow::ensure!(
                        out_index == 0,
                        "action {action_name}: retval argument {} is not the first out argument",
                        arg.name
                    );
                }
                seen_out = true;
                out_index += 1;
            }
        }
    }
    Ok(())
}

/// UDN and URL uniqueness across the whole tree (§4.2: SCPD/control/eventSub URLs must
/// be unique within a device, UDNs and icon URLs must be unique across the tree).
pub(crate) fn validate_unique_urls(root: &Arc<Device>) -> anyhow::Result<()> {
    let mut udns = std::collections::HashSet::new();
    let mut urls = std::collections::HashSet::new();
    let mut icon_urls = std::collections::HashSet::new();
    for device in root.walk() {
        anyhow::ensure!(udns.insert(device.udn.clone()), "duplicate UDN {}", device.udn);
        for service in &device.services {
            for url in [&service.scpd_url, &service.control_url, &service.event_sub_url] {
                anyhow::ensure!(urls.insert(url.clone()), "duplicate service URL {url}");
            }
        }
        for icon in &device.icons {
            anyhow::ensure!(icon_urls.insert(icon.url.clone()), "duplicate icon URL {}", icon.url);
        }
    }
    Ok(())
}

/// Renders a device description document for the device's own `root()` (the document
/// always describes the whole tree from the root, per §4.2: embedded devices aren't
/// independently fetchable).
pub fn render_device_description(root: &Device, config_id: u32) -> anyhow::Result<String> {
    let mut w = quick_xml::Writer::new(Vec::new());
    w.write_event(Event::Decl(BytesDecl::new("1.0", Some("UTF-8"), None)))?;
    let root_tag = BytesStart::new("root").with_attributes([
        ("xmlns", "urn:schemas-upnp-org:device-1-0"),
        ("configId", &config_id.to_string()),
    ]);
    let root_end = root_tag.to_end().into_owned();
    w.write_event(Event::Start(root_tag))?;
    SpecVersion::upnp_v1_1().write_xml(&mut w)?;
    write_device_xml(root, &mut w)?;
    w.write_event(Event::End(root_end))?;
    Ok(String::from_utf8(w.into_inner())?)
}

fn write_device_xml(device: &Device, w: &mut XmlWriter) -> std::io::Result<()> {
    let tag = BytesStart::new("device");
    let tag_end = tag.to_end().into_owned();
    w.write_event(Event::Start(tag))?;

    w.create_element("deviceType")
        .write_text_content(BytesText::new(&device.device_type.to_string()))?;
    w.create_element("friendlyName")
        .write_text_content(BytesText::new(&device.friendly_name))?;
    w.create_element("manufacturer")
        .write_text_content(BytesText::new(&device.manufacturer))?;
    if let Some(url) = &device.manufacturer_url {
        w.create_element("manufacturerURL")
            .write_text_content(BytesText::new(url))?;
    }
    if let Some(desc) = &device.model_description {
        w.create_element("modelDescription")
            .write_text_content(BytesText::new(desc))?;
    }
    w.create_element("modelName")
        .write_text_content(BytesText::new(&device.model_name))?;
    if let Some(number) = &device.model_number {
        w.create_element("modelNumber")
            .write_text_content(BytesText::new(number))?;
    }
    if let Some(url) = &device.model_url {
        w.create_element("modelURL")
            .write_text_content(BytesText::new(url))?;
    }
    if let Some(serial) = &device.serial_number {
        w.create_element("serialNumber")
            .write_text_content(BytesText::new(serial))?;
    }
    if let Some(upc) = &device.upc {
        w.create_element("UPC").write_text_content(BytesText::new(upc))?;
    }
    let udn = device.udn.to_string();
    w.create_element("UDN").write_text_content(BytesText::new(&udn))?;

    w.create_element("iconList").write_inner_content(|w| {
        for icon in &device.icons {
            let icon_tag = BytesStart::new("icon");
            let icon_end = icon_tag.to_end().into_owned();
            w.write_event(Event::Start(icon_tag))?;
            w.create_element("mimetype")
                .write_text_content(BytesText::new(&icon.mimetype))?;
            w.create_element("width")
                .write_text_content(BytesText::new(&icon.width.to_string()))?;
            w.create_element("height")
                .write_text_content(BytesText::new(&icon.height.to_string()))?;
            w.create_element("depth")
                .write_text_content(BytesText::new(&icon.depth.to_string()))?;
            w.create_element("url").write_text_content(BytesText::new(&icon.url))?;
            w.write_event(Event::End(icon_end))?;
        }
        Ok(())
    })?;

    w.create_element("serviceList").write_inner_content(|w| {
        for service in &device.services {
            let service_tag = BytesStart::new("service");
            let service_end = service_tag.to_end().into_owned();
            w.write_event(Event::Start(service_tag))?;
            w.create_element("serviceType")
                .write_text_content(BytesText::new(&service.service_type.to_string()))?;
            w.create_element("serviceId")
                .write_text_content(BytesText::new(service.service_id.as_str()))?;
            w.create_element("SCPDURL")
                .write_text_content(BytesText::new(&service.scpd_url))?;
            w.create_element("controlURL")
                .write_text_content(BytesText::new(&service.control_url))?;
            w.create_element("eventSubURL")
                .write_text_content(BytesText::new(&service.event_sub_url))?;
            w.write_event(Event::End(service_end))?;
        }
        Ok(())
    })?;

    if !device.embedded_devices.is_empty() {
        w.create_element("deviceList").write_inner_content(|w| {
            for embedded in &device.embedded_devices {
                write_device_xml(embedded, w)?;
            }
            Ok(())
        })?;
    }

    if let Some(url) = &device.presentation_url {
        w.create_element("presentationURL")
            .write_text_content(BytesText::new(url))?;
    }

    w.write_event(Event::End(tag_end))
}

/// Renders the `<scpd>` document for one service.
pub fn render_scpd(service: &Service) -> anyhow::Result<String> {
    let mut w = quick_xml::Writer::new(Vec::new());
    w.write_event(Event::Decl(BytesDecl::new("1.0", Some("UTF-8"), None)))?;
    let root = BytesStart::new("scpd").with_attributes([("xmlns", "urn:schemas-upnp-org:service-1-0")]);
    let root_end = root.to_end().into_owned();
    w.write_event(Event::Start(root))?;
    SpecVersion::upnp_v1_1().write_xml(&mut w)?;

    let action_list = BytesStart::new("actionList");
    let action_list_end = action_list.to_end().into_owned();
    w.write_event(Event::Start(action_list))?;
    for action in &service.actions {
        write_action_xml(action, &mut w)?;
    }
    w.write_event(Event::End(action_list_end))?;

    let state_table = BytesStart::new("serviceStateTable");
    let state_table_end = state_table.to_end().into_owned();
    w.write_event(Event::Start(state_table))?;
    for var in &service.state_variables {
        write_state_variable_xml(var, &mut w)?;
    }
    w.write_event(Event::End(state_table_end))?;

    w.write_event(Event::End(root_end))?;
    Ok(String::from_utf8(w.into_inner())?)
}

fn write_action_xml(action: &Action, w: &mut XmlWriter) -> std::io::Result<()> {
    let tag = BytesStart::new("action");
    let tag_end = tag.to_end().into_owned();
    w.write_event(Event::Start(tag))?;
    w.create_element("name")
        .write_text_content(BytesText::new(&action.name))?;

    if !action.arguments.is_empty() {
        w.create_element("argumentList").write_inner_content(|w| {
            for arg in &action.arguments {
                let arg_tag = BytesStart::new("argument");
                let arg_end = arg_tag.to_end().into_owned();
                w.write_event(Event::Start(arg_tag))?;
                w.create_element("name").write_text_content(BytesText::new(&arg.name))?;
                let direction = match arg.direction {
                    ArgumentDirection::In => "in",
                    ArgumentDirection::Out => "out",
                };
                w.create_element("direction")
                    .write_text_content(BytesText::new(direction))?;
                if arg.is_retval {
                    w.create_element("retval");
                }
                w.create_element("relatedStateVariable")
                    .write_text_content(BytesText::new(&arg.related_state_variable.name))?;
                w.write_event(Event::End(arg_end))?;
            }
            Ok(())
        })?;
    }

    w.write_event(Event::End(tag_end))
}

fn write_state_variable_xml(var: &StateVariable, w: &mut XmlWriter) -> std::io::Result<()> {
    let mut attrs = vec![("sendEvents", var.eventing.send_events_attr())];
    if let Some(multicast) = var.eventing.multicast_attr() {
        attrs.push(("multicast", multicast));
    }
    let tag = BytesStart::new("stateVariable").with_attributes(attrs);
    let tag_end = tag.to_end().into_owned();
    w.write_event(Event::Start(tag))?;
    w.create_element("name").write_text_content(BytesText::new(&var.name))?;
    w.create_element("dataType")
        .write_text_content(BytesText::new(&var.data_type.to_string()))?;
    match &var.constraint {
        Some(Constraint::List(values)) => {
            w.create_element("allowedValueList").write_inner_content(|w| {
                for v in values {
                    w.create_element("allowedValue").write_text_content(BytesText::new(v))?;
                }
                Ok(())
            })?;
        }
        Some(Constraint::Range { min, max, step }) => {
            w.create_element("allowedValueRange").write_inner_content(|w| {
                w.create_element("minimum")
                    .write_text_content(BytesText::new(&min.to_string()))?;
                w.create_element("maximum")
                    .write_text_content(BytesText::new(&max.to_string()))?;
                w.create_element("step")
                    .write_text_content(BytesText::new(&step.to_string()))?;
                Ok(())
            })?;
        }
        None => {}
    }
    if let Some(default) = &var.default {
        w.create_element("defaultValue")
            .write_text_content(BytesText::new(&default.as_text()))?;
    }
    w.write_event(Event::End(tag_end))
}

#[cfg(test)]
mod tests {
    use super::*;

    const SCPD: &[u8] = br#"<?xml version="1.0"?>
<scpd xmlns="urn:schemas-upnp-org:service-1-0">
<specVersion><major>1</major><minor>0</minor></specVersion>
<actionList>
<action>
<name>SetTarget</name>
<argumentList>
<argument><name>newTargetValue</name><direction>in</direction><relatedStateVariable>Target</relatedStateVariable></argument>
</argumentList>
</action>
<action>
<name>GetStatus</name>
<argumentList>
<argument><name>ResultStatus</name><direction>out</direction><retval/><relatedStateVariable>Status</relatedStateVariable></argument>
</argumentList>
</action>
</actionList>
<serviceStateTable>
<stateVariable sendEvents="no"><name>Target</name><dataType>boolean</dataType><defaultValue>0</defaultValue></stateVariable>
<stateVariable sendEvents="yes"><name>Status</name><dataType>boolean</dataType><defaultValue>0</defaultValue></stateVariable>
</serviceStateTable>
</scpd>"#;

    #[test]
    fn parses_switch_power_scpd() {
        let mut r = quick_xml::Reader::from_reader(SCPD);
        let scpd = RawScpd::read_xml(&mut r).unwrap();
        assert_eq!(scpd.actions.len(), 2);
        assert_eq!(scpd.state_variables.len(), 2);
        let get_status = &scpd.actions[1];
        assert!(get_status.arguments[0].is_retval);
        assert_eq!(scpd.state_variables[1].send_events, Eventing::UnicastOnly);
    }

    #[test]
    fn builds_service_from_raw_and_scpd() {
        let mut r = quick_xml::Reader::from_reader(SCPD);
        let scpd = RawScpd::read_xml(&mut r).unwrap();
        let raw_service = RawService {
            service_type: ResourceType::service("schemas-upnp-org", "SwitchPower", 1),
            service_id: ServiceId::new("upnp-org", "switchpower1"),
            scpd_url: "/scpd.xml".into(),
            control_url: "/control".into(),
            event_sub_url: "/event".into(),
        };
        let scpd_text = std::str::from_utf8(SCPD).unwrap();
        let service = build_service(raw_service, &scpd, scpd_text).unwrap();
        assert_eq!(service.actions.len(), 2);
        let set_target = service.find_action("SetTarget").unwrap();
        assert_eq!(set_target.arguments[0].related_state_variable.name, "Target");
        assert_eq!(service.raw_scpd(), scpd_text);
    }

    #[test]
    fn rejects_out_before_in_argument() {
        let bad = ArgumentSpec {
            name: "a".into(),
            direction: ArgumentDirection::In,
            related_state_variable: Arc::new(StateVariable::new(
                "Target",
                DataType::Boolean,
                Eventing::None,
                None,
                None,
            )),
            is_retval: false,
        };
        let out = ArgumentSpec {
            direction: ArgumentDirection::Out,
            ..clone_spec(&bad)
        };
        assert!(validate_argument_order("Test", &[out, bad]).is_err());
    }

    #[test]
    fn rejects_retval_not_first_out() {
        let var = Arc::new(StateVariable::new(
            "Status",
            DataType::Boolean,
            Eventing::None,
            None,
            None,
        ));
        let first_out = ArgumentSpec {
            name: "a".into(),
            direction: ArgumentDirection::Out,
            related_state_variable: var.clone(),
            is_retval: false,
        };
        let retval = ArgumentSpec {
            name: "b".into(),
            direction: ArgumentDirection::Out,
            related_state_variable: var,
            is_retval: true,
        };
        assert!(validate_argument_order("Test", &[first_out, retval]).is_err());
    }

    fn clone_spec(spec: &ArgumentSpec) -> ArgumentSpec {
        ArgumentSpec {
            name: spec.name.clone(),
            direction: spec.direction,
            related_state_variable: spec.related_state_variable.clone(),
            is_retval: spec.is_retval,
        }
    }
}
