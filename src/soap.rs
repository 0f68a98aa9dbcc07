//! SOAP 1.1 envelope codec and the UPnP control error table (§4.7, §6.4). Generalized
//! from a per-service, compile-time-typed scan into a plain name/value payload: the
//! device model (`crate::model`) maps argument names to `Value`s once the envelope has
//! been parsed, instead of this module knowing about any particular service.

use std::{borrow::Cow, collections::HashMap};

use anyhow::Context;
use axum::{http::HeaderMap, response::IntoResponse};
use axum_extra::headers::{self, HeaderMapExt};
use quick_xml::events::{BytesDecl, BytesEnd, BytesStart, BytesText, Event};
use reqwest::StatusCode;

use crate::{types::ResourceType, FromXml, IntoXml, XmlReaderExt, XmlWriter};

#[derive(Debug)]
pub struct SoapMessage<T> {
    inner: T,
}

impl<T> SoapMessage<T> {
    pub fn new(payload: T) -> Self {
        Self { inner: payload }
    }

    pub fn into_inner(self) -> T {
        self.inner
    }
}

impl<'a, T: FromXml<'a>> SoapMessage<T> {
    pub fn from_xml(raw_xml: &'a [u8]) -> anyhow::Result<Self> {
        use quick_xml::Reader;
        let mut r = Reader::from_reader(raw_xml);

        let envelope = r.read_to_start()?.into_owned();
        anyhow::ensure!(envelope.local_name().as_ref() == b"Envelope");
        let body = r.read_to_start()?.into_owned();
        anyhow::ensure!(body.local_name().as_ref() == b"Body");

        let payload = T::read_xml(&mut r)?;

        r.read_to_end(body.name())?;
        r.read_to_end(envelope.name())?;
        Ok(Self { inner: payload })
    }
}

impl<'a, T: FromXml<'a>> FromXml<'a> for SoapMessage<T> {
    fn read_xml(r: &mut quick_xml::Reader<&'a [u8]>) -> anyhow::Result<Self> {
        let envelope = r.read_to_start()?.into_owned();
        anyhow::ensure!(envelope.local_name().as_ref() == b"Envelope");
        let body = r.read_to_start()?.into_owned();
        anyhow::ensure!(body.local_name().as_ref() == b"Body");

        let payload = T::read_xml(r)?;

        r.read_to_end(body.name())?;
        r.read_to_end(envelope.name())?;
        Ok(Self { inner: payload })
    }
}

impl<T: IntoXml> SoapMessage<T> {
    pub fn into_xml(self) -> anyhow::Result<String> {
        use quick_xml::Writer;
        let mut w = Writer::new(Vec::new());
        w.write_event(Event::Decl(BytesDecl::new("1.0", Some("UTF-8"), None)))?;
        let envelope = BytesStart::new("s:Envelope").with_attributes([
            ("xmlns:s", "http://schemas.xmlsoap.org/soap/envelope/"),
            (
                "s:encodingStyle",
                "http://schemas.xmlsoap.org/soap/encoding/",
            ),
        ]);
        let envelope_end = envelope.to_end().into_owned();
        w.write_event(Event::Start(envelope.clone()))?;

        let body = BytesStart::new("s:Body");
        let body_end = body.to_end().into_owned();
        w.write_event(Event::Start(body))?;

        self.inner.write_xml(&mut w)?;

        w.write_event(Event::End(body_end))?;
        w.write_event(Event::End(envelope_end))?;
        Ok(String::from_utf8(w.into_inner())?)
    }
}

impl<T: IntoXml> IntoResponse for SoapMessage<T> {
    fn into_response(self) -> axum::response::Response {
        let mut header_map = HeaderMap::new();
        header_map.typed_insert(headers::ContentType::xml());
        let body = self.into_xml().expect("serialization not fail");
        (header_map, body).into_response()
    }
}

/// An action name plus its arguments, in either direction.
#[derive(Debug, Clone)]
pub struct ActionPayload<T> {
    pub name: String,
    pub arguments: Vec<T>,
}

impl<'a> FromXml<'a> for ActionPayload<InArgumentPayload<'a>> {
    fn read_xml(r: &mut quick_xml::Reader<&'a [u8]>) -> anyhow::Result<Self>
    where
        Self: Sized,
    {
        let action_name_tag = r.read_to_start()?;
        let action_name_tag_end = action_name_tag.to_end().into_owned();
        let action_name = String::from_utf8(action_name_tag.local_name().into_inner().to_vec())?;
        let mut arguments = Vec::new();

        loop {
            let next = r.read_event_err_eof()?.into_owned();
            match next {
                Event::Start(var) => {
                    let name = String::from_utf8(var.local_name().into_inner().to_vec())?;
                    let value = r.read_text(var.name())?;
                    arguments.push(InArgumentPayload { name, value });
                }
                Event::End(end) if end == action_name_tag_end => {
                    break;
                }
                _ => (),
            }
        }

        Ok(Self {
            name: action_name,
            arguments,
        })
    }
}

impl IntoXml for ActionPayload<InArgumentPayload<'_>> {
    fn write_xml(&self, w: &mut XmlWriter) -> std::io::Result<()> {
        let action = BytesStart::new(self.name());
        let action_end = action.to_end().into_owned();
        w.write_event(Event::Start(action))?;

        for argument in &self.arguments {
            w.create_element(argument.name())
                .write_text_content(BytesText::new(&argument.value))?;
        }

        w.write_event(Event::End(action_end))
    }
}

impl IntoXml for ActionPayload<OutArgumentsPayload> {
    fn write_xml(&self, w: &mut XmlWriter) -> std::io::Result<()> {
        let action_name = format!("u:{}", self.name());
        let action = BytesStart::new(&action_name);
        let action_end = action.to_end().into_owned();
        w.write_event(Event::Start(action))?;

        for argument in &self.arguments {
            w.create_element(argument.name())
                .write_inner_content(|w| argument.value.write_xml(w))?;
        }

        w.write_event(Event::End(action_end))
    }
}

impl<'a> ActionPayload<InArgumentPayload<'a>> {
    pub fn arguments_map(&self) -> HashMap<String, &str> {
        self.arguments
            .iter()
            .map(|a| (a.name.clone(), a.value.as_ref()))
            .collect()
    }
}

impl<T> ActionPayload<T> {
    pub fn name(&self) -> &str {
        &self.name
    }
}

#[derive(Debug, Clone)]
pub struct InArgumentPayload<'a> {
    pub name: String,
    pub value: Cow<'a, str>,
}

impl InArgumentPayload<'_> {
    pub fn name(&self) -> &str {
        &self.name
    }
}

pub struct OutArgumentsPayload {
    pub name: String,
    pub value: Box<dyn IntoXml + Send + Sync>,
}

impl std::fmt::Debug for OutArgumentsPayload {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OutArgumentsPayload")
            .field("name", &self.name)
            .field("value", &self.value.into_string().unwrap_or_default())
            .finish()
    }
}

impl OutArgumentsPayload {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn new(name: impl Into<String>, value: impl IntoXml + Send + Sync + 'static) -> Self {
        Self {
            name: name.into(),
            value: Box::new(value),
        }
    }
}

/// Writes an action call/response into a single buffer directly, the way
/// `crate::control_point` assembles an outgoing SOAP request without building an
/// intermediate payload struct first.
pub struct WritableAction {
    w: quick_xml::Writer<Vec<u8>>,
    action_name: String,
}

impl WritableAction {
    pub fn new(action_name: &str, service_type: &ResourceType) -> quick_xml::Result<Self> {
        let mut w = quick_xml::Writer::new(Vec::new());
        w.write_event(Event::Decl(BytesDecl::new("1.0", Some("UTF-8"), None)))?;
        let envelope = BytesStart::new("s:Envelope").with_attributes([
            ("xmlns:s", "http://schemas.xmlsoap.org/soap/envelope/"),
            (
                "s:encodingStyle",
                "http://schemas.xmlsoap.org/soap/encoding/",
            ),
        ]);
        w.write_event(Event::Start(envelope))?;
        let body = BytesStart::new("s:Body");
        w.write_event(Event::Start(body))?;

        let action_name = format!("u:{action_name}");
        let urn = service_type.to_string();
        let action = BytesStart::new(&action_name).with_attributes([("xmlns:u", urn.as_str())]);
        w.write_event(Event::Start(action))?;

        Ok(Self { w, action_name })
    }

    pub fn write_argument<T: IntoXml>(&mut self, name: &str, argument: &T) -> quick_xml::Result<()> {
        self.w
            .create_element(name)
            .write_inner_content(|w| argument.write_xml(w))?;
        Ok(())
    }

    pub fn finish(mut self) -> quick_xml::Result<String> {
        self.w
            .write_event(Event::End(BytesEnd::new(self.action_name)))?;
        self.w.write_event(Event::End(BytesEnd::new("s:Body")))?;
        self.w
            .write_event(Event::End(BytesEnd::new("s:Envelope")))?;
        Ok(String::from_utf8(self.w.into_inner())?)
    }
}

#[derive(Debug)]
pub struct ActionResponse<T> {
    pub action_name: String,
    pub service_type: ResourceType,
    pub args: Vec<T>,
}

impl IntoXml for ActionResponse<OutArgumentsPayload> {
    fn write_xml(&self, w: &mut XmlWriter) -> std::io::Result<()> {
        let action = BytesStart::new(format!("u:{}Response", self.action_name))
            .with_attributes([("xmlns:u", self.service_type.to_string().as_str())]);
        let action_end = action.to_end().into_owned();
        w.write_event(Event::Start(action))?;

        for argument in &self.args {
            w.create_element(argument.name())
                .write_inner_content(|w| argument.value.write_xml(w))?;
        }

        w.write_event(Event::End(action_end))
    }
}

impl<'a> ActionResponse<InArgumentPayload<'a>> {
    pub fn read_xml(
        r: &mut quick_xml::Reader<&'a [u8]>,
        service_type: ResourceType,
        action_tag_name: quick_xml::name::QName<'_>,
    ) -> anyhow::Result<Self> {
        let mut arguments = Vec::new();

        while let Ok(event) = r.read_event() {
            match event {
                Event::Start(start) => {
                    let name = String::from_utf8(start.local_name().as_ref().to_vec())?;
                    let value = r.read_text(start.name())?;
                    arguments.push(InArgumentPayload { name, value });
                }
                Event::End(end) if end.name() == action_tag_name => {
                    break;
                }
                Event::Text(_) => {}
                r => {
                    anyhow::bail!("expected action end, got {:?}", r);
                }
            }
        }

        let action_name = std::str::from_utf8(action_tag_name.into_inner())
            .context("convert action tag name to string")?;
        let action_name = action_name
            .strip_suffix("Response")
            .context("strip Response suffix")?
            .to_owned();

        Ok(Self {
            action_name,
            service_type,
            args: arguments,
        })
    }
}

impl IntoResponse for ActionResponse<OutArgumentsPayload> {
    fn into_response(self) -> axum::response::Response {
        SoapMessage::new(self).into_response()
    }
}

impl<'a> FromXml<'a> for Result<ActionResponse<InArgumentPayload<'a>>, ActionError> {
    fn read_xml(r: &mut quick_xml::Reader<&'a [u8]>) -> anyhow::Result<Self> {
        let start = r.read_to_start()?;
        match start.local_name().as_ref() {
            b"Fault" => Ok(Err(ActionError::read_xml(r, start.name())?)),
            other if other.ends_with(b"Response") => {
                let urn = start
                    .attributes()
                    .flatten()
                    .filter_map(|attr| attr.unescape_value().ok())
                    .find_map(|attr| attr.starts_with("urn").then(|| attr.parse::<ResourceType>()))
                    .transpose()?;
                let urn = urn.context("urn attribute is not found")?;
                ActionResponse::read_xml(r, urn, start.name()).map(Ok)
            }
            r => Err(anyhow::anyhow!("expected fault or response, got {:?}", r)),
        }
    }
}

/// The full UDA §4.7 control error table.
#[derive(Debug, Clone, Copy)]
pub enum ActionErrorCode {
    Success,
    InvalidAction,
    InvalidArgs,
    ActionFailed,
    ArgumentValueInvalid,
    ArgumentValueOutOfRange,
    OptionalActionNotImplemented,
    OutOfMemory,
    HumanInterventionRequired,
    StringArgumentTooLong,
    UndefinedFailure,
    Other(u16),
}

impl ActionErrorCode {
    pub fn code(&self) -> i32 {
        match self {
            ActionErrorCode::Success => 0,
            ActionErrorCode::InvalidAction => 401,
            ActionErrorCode::InvalidArgs => 402,
            ActionErrorCode::ActionFailed => 501,
            ActionErrorCode::ArgumentValueInvalid => 600,
            ActionErrorCode::ArgumentValueOutOfRange => 601,
            ActionErrorCode::OptionalActionNotImplemented => 602,
            ActionErrorCode::OutOfMemory => 603,
            ActionErrorCode::HumanInterventionRequired => 604,
            ActionErrorCode::StringArgumentTooLong => 605,
            ActionErrorCode::UndefinedFailure => -1,
            ActionErrorCode::Other(code) => *code as i32,
        }
    }
}

impl From<u16> for ActionErrorCode {
    fn from(value: u16) -> Self {
        match value {
            401 => ActionErrorCode::InvalidAction,
            402 => ActionErrorCode::InvalidArgs,
            501 => ActionErrorCode::ActionFailed,
            600 => ActionErrorCode::ArgumentValueInvalid,
            601 => ActionErrorCode::ArgumentValueOutOfRange,
            602 => ActionErrorCode::OptionalActionNotImplemented,
            603 => ActionErrorCode::OutOfMemory,
            604 => ActionErrorCode::HumanInterventionRequired,
            605 => ActionErrorCode::StringArgumentTooLong,
            _ => ActionErrorCode::Other(value),
        }
    }
}

impl From<ActionErrorCode> for ActionError {
    fn from(code: ActionErrorCode) -> Self {
        Self {
            code,
            description: None,
        }
    }
}

#[derive(Debug)]
pub struct ActionError {
    pub code: ActionErrorCode,
    pub description: Option<String>,
}

impl ActionError {
    pub fn not_implemented() -> Self {
        Self {
            code: ActionErrorCode::OptionalActionNotImplemented,
            description: None,
        }
    }

    pub fn with_description(code: ActionErrorCode, description: impl Into<String>) -> Self {
        Self {
            code,
            description: Some(description.into()),
        }
    }
}

impl From<anyhow::Error> for ActionError {
    fn from(err: anyhow::Error) -> Self {
        Self {
            code: ActionErrorCode::ActionFailed,
            description: Some(err.to_string()),
        }
    }
}

impl std::fmt::Display for ActionError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if let Some(description) = &self.description {
            write!(f, "{}: {}", self.code.code(), description)
        } else {
            write!(f, "{}", self.code.code())
        }
    }
}
impl std::error::Error for ActionError {}

impl IntoXml for ActionError {
    fn write_xml(&self, w: &mut XmlWriter) -> std::io::Result<()> {
        let parent = BytesStart::new("s:Fault");
        let parent_end = parent.to_end().into_owned();
        w.write_event(Event::Start(parent.clone()))?;

        w.create_element("faultcode")
            .write_text_content(BytesText::new("s:Client"))?;
        w.create_element("faultstring")
            .write_text_content(BytesText::new("UPnPError"))?;
        let detail = BytesStart::new("detail");
        let detail_end = detail.to_end().into_owned();
        w.write_event(Event::Start(detail.clone()))?;

        w.create_element("UPnPError")
            .with_attribute(("xmlns", "schemas-upnp-org:control-1-0"))
            .write_inner_content::<_, quick_xml::Error>(|w| {
                w.create_element("errorCode")
                    .write_text_content(BytesText::new(&self.code.code().to_string()))?;
                if let Some(description) = &self.description {
                    w.create_element("errorDescription")
                        .write_text_content(BytesText::new(description))?;
                }
                Ok(())
            })?;

        w.write_event(Event::End(detail_end))?;
        w.write_event(Event::End(parent_end))
    }
}

impl ActionError {
    fn read_xml<'a>(
        r: &mut quick_xml::Reader<&'a [u8]>,
        end_tag: quick_xml::name::QName<'_>,
    ) -> anyhow::Result<Self> {
        let fault_code = r.read_to_start()?;
        anyhow::ensure!(fault_code.local_name().as_ref() == b"faultcode");
        r.read_to_end(fault_code.name())?;
        let fault_string = r.read_to_start()?;
        anyhow::ensure!(fault_string.local_name().as_ref() == b"faultstring");
        let fault_string_text = r.read_text(fault_string.name())?;
        anyhow::ensure!(fault_string_text == "UPnPError");
        let detail = r.read_to_start()?;
        anyhow::ensure!(detail.local_name().as_ref() == b"detail");
        let upnp_error = r.read_to_start()?;
        anyhow::ensure!(upnp_error.local_name().as_ref() == b"UPnPError");
        let error_code = r.read_to_start()?;
        anyhow::ensure!(error_code.local_name().as_ref() == b"errorCode");
        let code = r.read_text(error_code.name())?;
        let code: u16 = code.parse().context("parse error code")?;
        let mut description = None;

        while let Ok(event) = r.read_event() {
            match event {
                Event::Start(start) => {
                    anyhow::ensure!(start.local_name().as_ref() == b"errorDescription");
                    description = Some(r.read_text(start.name())?.to_string());
                    r.read_to_end(upnp_error.name())?;
                    break;
                }
                Event::End(end) => {
                    anyhow::ensure!(end == upnp_error.to_end());
                    break;
                }
                Event::Text(_) => {}
                r => Err(anyhow::anyhow!(
                    "expected description or fault end, got {:?}",
                    r
                ))?,
            }
        }

        r.read_to_end(detail.name())?;
        r.read_to_end(end_tag)?;

        Ok(Self {
            code: code.into(),
            description,
        })
    }
}

impl IntoResponse for ActionError {
    fn into_response(self) -> axum::response::Response {
        let status_code = StatusCode::INTERNAL_SERVER_ERROR;
        let body = SoapMessage::new(self);
        (status_code, body).into_response()
    }
}

#[cfg(test)]
mod tests {
    use crate::soap::{InArgumentPayload, SoapMessage};

    use super::ActionPayload;

    #[test]
    fn parse_action_payload_xml() {
        let raw = br#"<?xml version="1.0"?>
<s:Envelope
xmlns:s="http://schemas.xmlsoap.org/soap/envelope/"
s:encodingStyle="http://schemas.xmlsoap.org/soap/encoding/">
<s:Body>
<u:actionName xmlns:u="urn:schemas-upnp-org:service:serviceType:v">
<argumentName>in arg value</argumentName>
<anotherArgument>another value</anotherArgument>
<!-- other in args and their values go here, if any -->
</u:actionName>
</s:Body>
</s:Envelope>"#;
        let payload: SoapMessage<ActionPayload<InArgumentPayload>> =
            SoapMessage::from_xml(raw).unwrap();
        let payload = payload.into_inner();
        assert_eq!(payload.name, "actionName");
        let args = payload.arguments_map();
        assert_eq!(args.get("argumentName"), Some("in arg value").as_ref());
        assert_eq!(args.get("anotherArgument"), Some("another value").as_ref());
    }

    #[test]
    fn fault_roundtrips_through_xml() {
        use super::ActionError;
        use crate::IntoXml;
        let err = ActionError::with_description(super::ActionErrorCode::ArgumentValueOutOfRange, "out of range");
        let xml = err.into_string().unwrap();
        assert!(xml.contains("601"));
        assert!(xml.contains("out of range"));
    }
}
