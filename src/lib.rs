#![doc = include_str!("../README.md")]

/// Action invocation (§4.7): a per-device worker pool that runs local action handlers
/// off the caller's task, with synchronous and callback completion modes.
pub mod action;
/// Runtime-typed UPnP value model (§3, §4.3): `DataType`/`Value`, coercion between the
/// wire string form and a concrete Rust representation, and the constraints a
/// `stateVariable` can carry (allowed list, numeric range).
pub mod datatype;
/// Device and service description documents (§4.2): parsing a fetched description/SCPD
/// into the live device tree, and rendering the tree back into the same documents on
/// the host side.
pub mod description;
/// Public-boundary error types returned by [`host::DeviceHost`] and
/// [`control_point::ControlPoint`].
pub mod error;
/// General Event Notification Architecture (§4.6): the `NOTIFY`/`SUBSCRIBE` wire format,
/// the host's per-subscriber delivery queue, and the control point's subscription state
/// machine.
pub mod gena;
/// The in-memory device tree (§3): `Device`, `Service`, `Action`, `StateVariable` and
/// the `Arc`/`Weak` wiring that lets any node navigate to its parent and root.
pub mod model;
/// Product token parsing and rendering for the `SERVER`/`USER-AGENT` header (§4.1).
pub mod product_tokens;
/// SOAP 1.1 control envelopes (§4.3): request/response/fault parsing and rendering.
pub mod soap;
/// Simple Service Discovery Protocol (§4.1): multicast/unicast message parsing and
/// rendering, and the search-target matching rules.
pub mod ssdp;
/// Wire-level value types shared across the other modules: resource types, service and
/// device identifiers, spec version negotiation.
pub mod types;

/// Host-side runtime configuration ([`config::HostConfig`]) and control-point-side
/// runtime configuration ([`config::ControlPointConfig`]).
pub mod config;
/// The device host (§4.4): SSDP announcer/responder, HTTP description/control/eventing
/// server, and device-tree lifecycle.
pub mod host;
/// The control point (§4.5): SSDP discovery consumer, device-tree build orchestrator,
/// remote action invocation, and GENA subscription management.
pub mod control_point;

/// Useful utility functions for [Reader](quick_xml::Reader)
pub trait XmlReaderExt<'a> {
    fn read_event_err_eof(&mut self) -> anyhow::Result<quick_xml::events::Event<'a>>;
    fn read_to_start(&mut self) -> anyhow::Result<quick_xml::events::BytesStart<'a>>;
    fn read_to_start_or_empty(
        &mut self,
    ) -> anyhow::Result<(bool, quick_xml::events::BytesStart<'a>)>;
    fn read_end(&mut self) -> anyhow::Result<quick_xml::events::BytesEnd<'a>>;
    fn read_text(&mut self) -> anyhow::Result<quick_xml::events::BytesText<'a>>;
}

impl<'a> XmlReaderExt<'a> for quick_xml::Reader<&'a [u8]> {
    fn read_event_err_eof(&mut self) -> anyhow::Result<quick_xml::events::Event<'a>> {
        let event = self.read_event()?;
        match event {
            quick_xml::events::Event::Eof => Err(anyhow::anyhow!("early eof")),
            _ => Ok(event),
        }
    }
    fn read_to_start(&mut self) -> anyhow::Result<quick_xml::events::BytesStart<'a>> {
        loop {
            let event = self.read_event_err_eof()?.into_owned();
            if let quick_xml::events::Event::Start(e) = event {
                break Ok(e);
            }
        }
    }
    fn read_to_start_or_empty(
        &mut self,
    ) -> anyhow::Result<(bool, quick_xml::events::BytesStart<'a>)> {
        loop {
            let event = self.read_event_err_eof()?.into_owned();
            match event {
                quick_xml::events::Event::Start(e) => break Ok((false, e)),
                quick_xml::events::Event::Empty(e) => break Ok((true, e)),
                _ => (),
            }
        }
    }
    fn read_end(&mut self) -> anyhow::Result<quick_xml::events::BytesEnd<'a>> {
        let event = self.read_event()?;
        match event {
            quick_xml::events::Event::End(e) => Ok(e),
            e => anyhow::bail!("expected end, got {:?}", e),
        }
    }
    fn read_text(&mut self) -> anyhow::Result<quick_xml::events::BytesText<'a>> {
        let event = self.read_event()?;
        match event {
            quick_xml::events::Event::Text(e) => Ok(e),
            e => anyhow::bail!("expected text, got {:?}", e),
        }
    }
}

pub type XmlWriter = quick_xml::Writer<Vec<u8>>;

/// Allows structs to serialize themselves into xml fragments
pub trait IntoXml {
    fn write_xml(&self, w: &mut XmlWriter) -> std::io::Result<()>;

    fn into_string(&self) -> std::io::Result<String> {
        let mut w = quick_xml::Writer::new(Vec::new());
        self.write_xml(&mut w)?;
        Ok(String::from_utf8(w.into_inner()).expect("produced value to be utf-8"))
    }
}

impl std::fmt::Debug for Box<dyn IntoXml> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}",
            self.into_string().expect("writing to an in-memory buffer cannot fail")
        )
    }
}

/// Allows structs to deserialize themselves from xml reader
pub trait FromXml<'a> {
    fn read_xml(r: &mut quick_xml::Reader<&'a [u8]>) -> anyhow::Result<Self>
    where
        Self: Sized;
}

impl<T: IntoXml> IntoXml for Vec<T> {
    fn write_xml(&self, w: &mut XmlWriter) -> std::io::Result<()> {
        for el in self {
            el.write_xml(w)?;
        }
        Ok(())
    }
}
