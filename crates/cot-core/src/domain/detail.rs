//! Generic detail tree for the open-ended part of a CoT event.
//!
//! The `<detail>` element of a CoT event is an extension point: clients put
//! chat lines, links, marti destination lists, icons, colours and anything
//! else they invent under it.  The fixed protobuf schema only models a handful
//! of those elements, so everything else is kept here as a plain tagged tree
//! and carried through the relay untouched.
//!
//! # Shape
//!
//! ```text
//! <detail>                         Node { name: "detail", .. }
//!   <contact callsign="Alpha"/>      ├─ Node { name: "contact", attrs: [callsign] }
//!   <link uid="x" relation="p-p"/>   ├─ Node { name: "link", .. }
//!   <remarks>hello</remarks>         └─ Node { name: "remarks", text: "hello" }
//! </detail>
//! ```
//!
//! Attribute names are unique within one node; sibling order is preserved and
//! same-name siblings (several `link` children, say) are allowed.

use std::fmt;

use quick_xml::events::{BytesEnd, BytesStart, BytesText, Event};
use quick_xml::{Reader, Writer};
use thiserror::Error;

/// Name of the container element every detail tree hangs under.
pub const DETAIL_TAG: &str = "detail";

/// Errors produced while parsing or rendering detail markup.
#[derive(Debug, Error)]
pub enum DetailError {
    /// The underlying XML reader rejected the input.
    #[error("malformed detail markup: {0}")]
    Xml(#[from] quick_xml::Error),

    /// An attribute, name or text node could not be decoded.
    #[error("malformed detail content: {0}")]
    Malformed(String),

    /// The input ended while an element was still open.
    #[error("markup ended with <{0}> still open")]
    Unclosed(String),

    /// The input contained no element at all.
    #[error("markup contains no element")]
    Empty,

    /// Writing the tree back to markup failed.
    #[error("failed to render detail markup: {0}")]
    Render(String),
}

/// One element of a detail tree.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Node {
    name: String,
    attrs: Vec<(String, String)>,
    text: String,
    children: Vec<Node>,
}

impl Node {
    /// Creates an element with no attributes, text or children.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Self::default()
        }
    }

    /// Creates an empty `<detail>` container.
    pub fn detail() -> Self {
        Self::new(DETAIL_TAG)
    }

    /// Builder-style attribute setter.
    pub fn with_attr(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.set_attr(name, value);
        self
    }

    /// Builder-style text setter.
    pub fn with_text(mut self, text: impl Into<String>) -> Self {
        self.text = text.into();
        self
    }

    /// Builder-style child append.
    pub fn with_child(mut self, child: Node) -> Self {
        self.children.push(child);
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn text(&self) -> &str {
        &self.text
    }

    pub fn set_text(&mut self, text: impl Into<String>) {
        self.text = text.into();
    }

    pub fn children(&self) -> &[Node] {
        &self.children
    }

    /// Iterates `(name, value)` attribute pairs in insertion order.
    pub fn attrs(&self) -> impl Iterator<Item = (&str, &str)> {
        self.attrs.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    pub fn attr_count(&self) -> usize {
        self.attrs.len()
    }

    /// Returns the value of attribute `name`, if present.
    pub fn attr(&self, name: &str) -> Option<&str> {
        self.attrs
            .iter()
            .find(|(k, _)| k == name)
            .map(|(_, v)| v.as_str())
    }

    /// Sets attribute `name`, replacing any existing value.
    pub fn set_attr(&mut self, name: impl Into<String>, value: impl Into<String>) {
        let name = name.into();
        let value = value.into();
        match self.attrs.iter_mut().find(|(k, _)| *k == name) {
            Some(slot) => slot.1 = value,
            None => self.attrs.push((name, value)),
        }
    }

    /// True when the element has neither children nor text.
    pub fn is_leaf(&self) -> bool {
        self.children.is_empty() && self.text.is_empty()
    }

    // ── Child lookup ──────────────────────────────────────────────────────────

    /// Returns the first direct child called `name`.
    pub fn first(&self, name: &str) -> Option<&Node> {
        self.children.iter().find(|c| c.name == name)
    }

    /// Mutable variant of [`Node::first`].
    pub fn first_mut(&mut self, name: &str) -> Option<&mut Node> {
        self.children.iter_mut().find(|c| c.name == name)
    }

    /// Iterates every direct child called `name`.
    pub fn all<'a>(&'a self, name: &'a str) -> impl Iterator<Item = &'a Node> + 'a {
        self.children.iter().filter(move |c| c.name == name)
    }

    pub fn has(&self, name: &str) -> bool {
        self.first(name).is_some()
    }

    /// Attribute `attr` of the first child called `child`, or `""`.
    pub fn child_attr(&self, child: &str, attr: &str) -> &str {
        self.first(child).and_then(|c| c.attr(attr)).unwrap_or_default()
    }

    // ── Mutation ──────────────────────────────────────────────────────────────

    /// Appends a child element and returns a handle to it.
    pub fn add_child(&mut self, name: &str, attrs: &[(&str, &str)], text: &str) -> &mut Node {
        let mut node = Node::new(name).with_text(text);
        for (k, v) in attrs {
            node.set_attr(*k, *v);
        }
        self.push_child(node)
    }

    /// Appends an already built child and returns a handle to it.
    pub fn push_child(&mut self, node: Node) -> &mut Node {
        self.children.push(node);
        let last = self.children.len() - 1;
        &mut self.children[last]
    }

    /// Updates the attributes of the first child called `name`, creating the
    /// child when it does not exist yet.
    pub fn add_or_change_child(&mut self, name: &str, attrs: &[(&str, &str)]) -> &mut Node {
        let idx = match self.children.iter().position(|c| c.name == name) {
            Some(idx) => idx,
            None => {
                self.children.push(Node::new(name));
                self.children.len() - 1
            }
        };
        let child = &mut self.children[idx];
        for (k, v) in attrs {
            child.set_attr(*k, *v);
        }
        child
    }

    /// Removes every direct child whose name is in `names`.
    pub fn remove_tags(&mut self, names: &[&str]) {
        self.children.retain(|c| !names.contains(&c.name.as_str()));
    }

    /// Removes and returns the child at position `idx`.
    pub(crate) fn take_child(&mut self, idx: usize) -> Node {
        self.children.remove(idx)
    }

    /// Appends a `p-p` (parent-point) link to `uid`.
    pub fn add_pp_link(&mut self, uid: &str, typ: &str, callsign: &str) {
        let mut link = Node::new("link");
        if !uid.is_empty() {
            link.set_attr("uid", uid);
        }
        if !typ.is_empty() {
            link.set_attr("type", typ);
        }
        if !callsign.is_empty() {
            link.set_attr("parent_callsign", callsign);
        }
        link.set_attr("relation", "p-p");
        self.children.push(link);
    }

    /// Callsigns listed in `<marti><dest callsign=".."/></marti>`.
    pub fn dest_callsigns(&self) -> Vec<String> {
        self.first("marti")
            .map(|marti| {
                marti
                    .all("dest")
                    .filter_map(|d| d.attr("callsign"))
                    .filter(|c| !c.is_empty())
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default()
    }

    // ── Parsing ───────────────────────────────────────────────────────────────

    /// Parses a complete markup document into a tree rooted at its first
    /// element.  Text is kept exactly as written except for whitespace-only
    /// runs, which are layout between elements and are dropped.  CDATA is
    /// kept as text.
    ///
    /// # Errors
    ///
    /// Returns [`DetailError`] when the markup is not well formed.
    pub fn parse(xml: &str) -> Result<Node, DetailError> {
        let mut reader = Reader::from_str(xml);

        let mut stack: Vec<Node> = Vec::new();
        let mut root: Option<Node> = None;

        loop {
            match reader.read_event()? {
                Event::Start(start) => stack.push(node_from_start(&start)?),
                Event::Empty(start) => {
                    let node = node_from_start(&start)?;
                    attach(&mut stack, &mut root, node);
                }
                Event::End(_) => {
                    // The reader verifies end names, so the top is the match.
                    if let Some(node) = stack.pop() {
                        attach(&mut stack, &mut root, node);
                    }
                }
                Event::Text(text) => {
                    if text.iter().all(u8::is_ascii_whitespace) {
                        continue;
                    }
                    if let Some(top) = stack.last_mut() {
                        let text = text
                            .unescape()
                            .map_err(|e| DetailError::Malformed(e.to_string()))?;
                        top.text.push_str(&text);
                    }
                }
                Event::CData(data) => {
                    if let Some(top) = stack.last_mut() {
                        top.text.push_str(&utf8(&data)?);
                    }
                }
                Event::Eof => break,
                _ => {}
            }
        }

        if let Some(open) = stack.pop() {
            return Err(DetailError::Unclosed(open.name));
        }
        root.ok_or(DetailError::Empty)
    }

    /// Parses a detail fragment: either a full `<detail>...</detail>` element
    /// or the bare children that go inside one.  An empty string yields an
    /// empty container.
    ///
    /// # Errors
    ///
    /// Returns [`DetailError`] when the fragment is not well formed.
    pub fn detail_from_str(fragment: &str) -> Result<Node, DetailError> {
        let trimmed = fragment.trim();
        if trimmed.is_empty() {
            return Ok(Node::detail());
        }
        if trimmed.starts_with("<detail>") || trimmed.starts_with("<detail ") {
            return Node::parse(trimmed);
        }
        Node::parse(&format!("<{DETAIL_TAG}>{trimmed}</{DETAIL_TAG}>"))
    }

    // ── Rendering ─────────────────────────────────────────────────────────────

    /// Renders this element, including itself, as markup.
    ///
    /// # Errors
    ///
    /// Returns [`DetailError::Render`] if the writer fails.
    pub fn to_xml(&self) -> Result<String, DetailError> {
        let mut writer = Writer::new(Vec::new());
        self.write_into(&mut writer)?;
        utf8(&writer.into_inner())
    }

    /// Renders only the children, without the surrounding element.  This is
    /// the form carried in the protobuf `xmlDetail` field.
    ///
    /// # Errors
    ///
    /// Returns [`DetailError::Render`] if the writer fails.
    pub fn inner_xml(&self) -> Result<String, DetailError> {
        let mut writer = Writer::new(Vec::new());
        for child in &self.children {
            child.write_into(&mut writer)?;
        }
        utf8(&writer.into_inner())
    }

    pub(crate) fn write_into(&self, writer: &mut Writer<Vec<u8>>) -> Result<(), DetailError> {
        let mut start = BytesStart::new(self.name.as_str());
        for (k, v) in &self.attrs {
            start.push_attribute((k.as_str(), v.as_str()));
        }

        if self.is_leaf() {
            return emit(writer, Event::Empty(start));
        }

        emit(writer, Event::Start(start))?;
        if !self.text.is_empty() {
            emit(writer, Event::Text(BytesText::new(&self.text)))?;
        }
        for child in &self.children {
            child.write_into(writer)?;
        }
        emit(writer, Event::End(BytesEnd::new(self.name.as_str())))
    }

    fn print(&self, f: &mut fmt::Formatter<'_>, indent: usize) -> fmt::Result {
        write!(f, "{:indent$}{}", "", self.name)?;
        for (k, v) in &self.attrs {
            write!(f, " {k}={v:?}")?;
        }
        if !self.text.is_empty() {
            write!(f, " text={:?}", self.text)?;
        }
        writeln!(f)?;
        for child in &self.children {
            child.print(f, indent + 2)?;
        }
        Ok(())
    }
}

impl fmt::Display for Node {
    /// Indented outline used in debug logs.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.children.is_empty() {
            return write!(f, "*empty*");
        }
        for child in &self.children {
            child.print(f, 0)?;
        }
        Ok(())
    }
}

// ── Helpers ───────────────────────────────────────────────────────────────────

fn node_from_start(start: &BytesStart<'_>) -> Result<Node, DetailError> {
    let mut node = Node::new(utf8(start.name().as_ref())?);
    for attr in start.attributes() {
        let attr = attr.map_err(|e| DetailError::Malformed(e.to_string()))?;
        let key = utf8(attr.key.as_ref())?;
        let value = attr
            .unescape_value()
            .map_err(|e| DetailError::Malformed(e.to_string()))?;
        node.set_attr(key, value.into_owned());
    }
    Ok(node)
}

fn attach(stack: &mut [Node], root: &mut Option<Node>, node: Node) {
    match stack.last_mut() {
        Some(parent) => parent.children.push(node),
        None => {
            if root.is_none() {
                *root = Some(node);
            }
        }
    }
}

fn emit(writer: &mut Writer<Vec<u8>>, event: Event<'_>) -> Result<(), DetailError> {
    writer
        .write_event(event)
        .map_err(|e| DetailError::Render(e.to_string()))
}

fn utf8(bytes: &[u8]) -> Result<String, DetailError> {
    std::str::from_utf8(bytes)
        .map(str::to_string)
        .map_err(|e| DetailError::Malformed(e.to_string()))
}

// ── Tests ─────────────────────────────────────────────────────────────────────
