//! Wire document tree and the codecs that carry it.
//!
//! Requests and responses are small XML-shaped trees. On the wire they are
//! either WBXML (a binary collaborator codec plugged in by the host) or plain
//! XML, which [`XmlCodec`] handles.

use crate::error::{ProtocolError, ProtocolResult};
use bytes::Bytes;
use quick_xml::events::{BytesDecl, BytesEnd, BytesStart, BytesText, Event};
use quick_xml::{Reader, Writer};
use serde::{Deserialize, Serialize};
use std::str::FromStr;

/// Content type of WBXML-encoded bodies.
pub const WBXML_CONTENT_TYPE: &str = "application/vnd.ms-sync.wbxml";

/// Content type of plain XML bodies.
pub const XML_CONTENT_TYPE: &str = "text/xml";

/// One node of a wire document.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Element {
    /// Local element name.
    pub name: String,
    /// Default namespace declared on this element, if any.
    pub namespace: Option<String>,
    /// Text content.
    pub text: Option<String>,
    /// Child elements in document order.
    pub children: Vec<Element>,
}

impl Element {
    /// Creates an empty element.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Self::default()
        }
    }

    /// Creates a text-only element.
    pub fn leaf(name: impl Into<String>, text: impl Into<String>) -> Self {
        Self::new(name).with_text(text)
    }

    /// Sets the namespace.
    pub fn with_namespace(mut self, namespace: impl Into<String>) -> Self {
        self.namespace = Some(namespace.into());
        self
    }

    /// Sets the text content.
    pub fn with_text(mut self, text: impl Into<String>) -> Self {
        self.text = Some(text.into());
        self
    }

    /// Appends a child and returns self.
    pub fn with_child(mut self, child: Element) -> Self {
        self.children.push(child);
        self
    }

    /// Appends a text-only child and returns self.
    pub fn with_leaf(self, name: impl Into<String>, text: impl Into<String>) -> Self {
        self.with_child(Element::leaf(name, text))
    }

    /// Appends a child in place.
    pub fn push(&mut self, child: Element) {
        self.children.push(child);
    }

    /// Returns the text content, if any.
    pub fn text(&self) -> Option<&str> {
        self.text.as_deref()
    }

    /// Returns the first child with the given name.
    pub fn child(&self, name: &str) -> Option<&Element> {
        self.children.iter().find(|c| c.name == name)
    }

    /// Returns every child with the given name.
    pub fn children_named<'a>(&'a self, name: &'a str) -> impl Iterator<Item = &'a Element> + 'a {
        self.children.iter().filter(move |c| c.name == name)
    }

    /// Returns the text of the first child with the given name.
    pub fn child_text(&self, name: &str) -> Option<&str> {
        self.child(name).and_then(Element::text)
    }

    /// Returns the named child or a missing-element error.
    pub fn require(&self, name: &str) -> ProtocolResult<&Element> {
        self.child(name)
            .ok_or_else(|| ProtocolError::missing(&self.name, name))
    }

    /// Returns the named child's text or a missing-element error.
    pub fn require_text(&self, name: &str) -> ProtocolResult<&str> {
        self.child_text(name)
            .ok_or_else(|| ProtocolError::missing(&self.name, name))
    }

    /// Parses the named child's text, if the child is present.
    pub fn parse_child<T: FromStr>(&self, name: &str) -> ProtocolResult<Option<T>> {
        match self.child_text(name) {
            None => Ok(None),
            Some(raw) => raw
                .trim()
                .parse::<T>()
                .map(Some)
                .map_err(|_| ProtocolError::invalid(name, raw)),
        }
    }

    /// Returns the root as `expected` or an unexpected-root error.
    pub fn expect_root(&self, expected: &str) -> ProtocolResult<&Element> {
        if self.name == expected {
            Ok(self)
        } else {
            Err(ProtocolError::UnexpectedRoot {
                expected: expected.to_string(),
                found: self.name.clone(),
            })
        }
    }
}

/// Turns documents into bytes and back.
///
/// Implementations must be stateless between calls; the transport shares one
/// instance across every in-flight request of an account.
pub trait DocumentCodec: Send + Sync {
    /// MIME content type this codec produces and accepts.
    fn content_type(&self) -> &'static str;

    /// Encodes a document.
    fn encode(&self, document: &Element) -> ProtocolResult<Bytes>;

    /// Decodes a document.
    fn decode(&self, bytes: &[u8]) -> ProtocolResult<Element>;
}

/// Plain XML codec built on `quick-xml`.
#[derive(Debug, Clone, Copy, Default)]
pub struct XmlCodec;

impl XmlCodec {
    /// Creates the codec.
    pub fn new() -> Self {
        Self
    }

    fn write_element(writer: &mut Writer<Vec<u8>>, element: &Element) -> ProtocolResult<()> {
        let mut start = BytesStart::new(element.name.as_str());
        if let Some(ns) = &element.namespace {
            start.push_attribute(("xmlns", ns.as_str()));
        }

        if element.text.is_none() && element.children.is_empty() {
            return writer.write_event(Event::Empty(start)).map_err(codec_err);
        }

        writer.write_event(Event::Start(start)).map_err(codec_err)?;
        if let Some(text) = &element.text {
            writer
                .write_event(Event::Text(BytesText::new(text)))
                .map_err(codec_err)?;
        }
        for child in &element.children {
            Self::write_element(writer, child)?;
        }
        writer
            .write_event(Event::End(BytesEnd::new(element.name.as_str())))
            .map_err(codec_err)
    }

    fn open(start: &BytesStart<'_>) -> ProtocolResult<Element> {
        let name = std::str::from_utf8(start.local_name().as_ref())
            .map_err(codec_err)?
            .to_string();
        let mut element = Element::new(name);
        for attr in start.attributes() {
            let attr = attr.map_err(codec_err)?;
            if attr.key.as_ref() == b"xmlns" {
                let value = attr.unescape_value().map_err(codec_err)?;
                element.namespace = Some(value.into_owned());
            }
        }
        Ok(element)
    }
}

fn codec_err(err: impl std::fmt::Display) -> ProtocolError {
    ProtocolError::codec(err.to_string())
}

fn append_text(stack: &mut [Element], text: &str) {
    if let Some(top) = stack.last_mut() {
        match &mut top.text {
            Some(existing) => existing.push_str(text),
            None => top.text = Some(text.to_string()),
        }
    }
}

impl DocumentCodec for XmlCodec {
    fn content_type(&self) -> &'static str {
        XML_CONTENT_TYPE
    }

    fn encode(&self, document: &Element) -> ProtocolResult<Bytes> {
        let mut writer = Writer::new(Vec::new());
        writer
            .write_event(Event::Decl(BytesDecl::new("1.0", Some("utf-8"), None)))
            .map_err(codec_err)?;
        Self::write_element(&mut writer, document)?;
        Ok(Bytes::from(writer.into_inner()))
    }

    fn decode(&self, bytes: &[u8]) -> ProtocolResult<Element> {
        let mut reader = Reader::from_reader(bytes);
        reader.config_mut().trim_text(true);

        let mut stack: Vec<Element> = Vec::new();
        let mut root: Option<Element> = None;
        let mut buf = Vec::new();

        loop {
            match reader.read_event_into(&mut buf).map_err(codec_err)? {
                Event::Start(start) => {
                    if root.is_some() {
                        return Err(ProtocolError::codec("content after document root"));
                    }
                    stack.push(Self::open(&start)?);
                }
                Event::Empty(start) => {
                    let element = Self::open(&start)?;
                    match stack.last_mut() {
                        Some(parent) => parent.push(element),
                        None if root.is_none() => root = Some(element),
                        None => return Err(ProtocolError::codec("content after document root")),
                    }
                }
                Event::End(_) => {
                    let element = stack
                        .pop()
                        .ok_or_else(|| ProtocolError::codec("unbalanced end tag"))?;
                    match stack.last_mut() {
                        Some(parent) => parent.push(element),
                        None => root = Some(element),
                    }
                }
                Event::Text(text) => {
                    let text = text.unescape().map_err(codec_err)?;
                    append_text(&mut stack, &text);
                }
                Event::CData(data) => {
                    let raw = data.into_inner();
                    let text = std::str::from_utf8(&raw).map_err(codec_err)?;
                    append_text(&mut stack, text);
                }
                Event::Eof => break,
                _ => {}
            }
            buf.clear();
        }

        if !stack.is_empty() {
            return Err(ProtocolError::codec("document truncated"));
        }
        root.ok_or_else(|| ProtocolError::codec("empty document"))
    }
}
