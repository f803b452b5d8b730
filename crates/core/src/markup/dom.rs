//! A small mutable markup tree.
//!
//! Well-formed input is read with quick-xml. Content documents that are not
//! well-formed go through html5ever's tree builder (via `scraper`), which
//! closes, reparents and drops tags the way browsers do. Entities are decoded
//! once on the way in (including HTML named entities XML does not define,
//! such as `&nbsp;`), and serialization re-escapes only the XML-reserved
//! characters, so the output is always well-formed XML.

use std::borrow::Cow;
use std::fmt::Write;

use quick_xml::events::{BytesStart, BytesText, Event};
use quick_xml::{Reader as XmlReader, Writer as XmlWriter};
use scraper::{Html, Node as HtmlNode};

use crate::error::MarkupError;

pub type NodeId = usize;

const ROOT: NodeId = 0;

/// HTML elements that never have content.
const VOID_ELEMENTS: &[&str] = &[
    "area", "base", "br", "col", "embed", "hr", "img", "input", "link", "meta", "param", "source",
    "track", "wbr",
];

pub fn is_void_element(local_name: &str) -> bool {
    VOID_ELEMENTS
        .iter()
        .any(|v| v.eq_ignore_ascii_case(local_name))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParseMode {
    /// Generic XML (OPF, NCX, SVG): every empty element self-closes.
    Xml,
    /// Content documents: HTML void elements are self-closing, everything
    /// else keeps an explicit end tag.
    Xhtml,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NodeKind {
    Document,
    Element(Element),
    Text(String),
    Comment(String),
    CData(String),
    Declaration(String),
    Doctype(String),
    ProcessingInstruction(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Element {
    /// Qualified name as written (`svg`, `dc:title`, ...).
    pub name: String,
    pub attrs: Vec<(String, String)>,
}

impl Element {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            attrs: Vec::new(),
        }
    }

    pub fn local_name(&self) -> &str {
        local_name(&self.name)
    }

    pub fn is(&self, local: &str) -> bool {
        self.local_name().eq_ignore_ascii_case(local)
    }

    pub fn attr(&self, name: &str) -> Option<&str> {
        self.attrs
            .iter()
            .find(|(k, _)| k == name)
            .map(|(_, v)| v.as_str())
    }

    pub fn set_attr(&mut self, name: &str, value: impl Into<String>) {
        let value = value.into();
        match self.attrs.iter_mut().find(|(k, _)| k == name) {
            Some((_, v)) => *v = value,
            None => self.attrs.push((name.to_string(), value)),
        }
    }

    pub fn remove_attr(&mut self, name: &str) -> Option<String> {
        let idx = self.attrs.iter().position(|(k, _)| k == name)?;
        Some(self.attrs.remove(idx).1)
    }
}

pub fn local_name(qualified: &str) -> &str {
    qualified.rsplit(':').next().unwrap_or(qualified)
}

#[derive(Debug, Clone)]
struct Node {
    kind: NodeKind,
    parent: Option<NodeId>,
    children: Vec<NodeId>,
}

/// Arena-backed document. Detached nodes stay in the arena but are no
/// longer reachable from the root and are never serialized.
#[derive(Debug, Clone)]
pub struct Document {
    nodes: Vec<Node>,
    mode: ParseMode,
}

impl Document {
    pub fn new(mode: ParseMode) -> Self {
        Self {
            nodes: vec![Node {
                kind: NodeKind::Document,
                parent: None,
                children: Vec::new(),
            }],
            mode,
        }
    }

    pub fn parse_xml(src: &str) -> Result<Self, MarkupError> {
        Self::parse(src, ParseMode::Xml)
    }

    pub fn parse_xhtml(src: &str) -> Result<Self, MarkupError> {
        Self::parse(src, ParseMode::Xhtml)
    }

    /// Parse `src` into a tree.
    ///
    /// Well-formed input is read as XML. In [`ParseMode::Xhtml`], input that
    /// is not well-formed is recovered with the HTML5 tree builder instead;
    /// in [`ParseMode::Xml`] it is an error.
    pub fn parse(src: &str, mode: ParseMode) -> Result<Self, MarkupError> {
        let src = src.strip_prefix('\u{feff}').unwrap_or(src);
        match Self::parse_well_formed(src, mode) {
            Ok(doc) => Ok(doc),
            Err(e) if mode == ParseMode::Xhtml => {
                tracing::debug!("Not well-formed ({}), recovering as HTML", e);
                Ok(Self::parse_html(src))
            }
            Err(e) => Err(e),
        }
    }

    fn parse_well_formed(src: &str, mode: ParseMode) -> Result<Self, MarkupError> {
        let mut reader = XmlReader::from_str(src);
        reader.config_mut().trim_text(false);
        reader.config_mut().check_end_names = true;

        let mut doc = Document::new(mode);
        let mut open: Vec<NodeId> = vec![ROOT];

        loop {
            let event = reader
                .read_event()
                .map_err(|e| parse_error(&reader, e.to_string()))?;
            let top = *open.last().unwrap_or(&ROOT);

            match event {
                Event::Start(ref e) => {
                    let el = element_from_start(e);
                    let void = mode == ParseMode::Xhtml && is_void_element(el.local_name());
                    let id = doc.push(NodeKind::Element(el));
                    doc.append_child(top, id);
                    if !void {
                        open.push(id);
                    }
                }
                Event::Empty(ref e) => {
                    let id = doc.push(NodeKind::Element(element_from_start(e)));
                    doc.append_child(top, id);
                }
                Event::End(ref e) => {
                    // `<br>text</br>` reads as a void `br` followed by text.
                    let void = mode == ParseMode::Xhtml && is_void_element(local_name(&qname(e.name())));
                    if !void {
                        open.pop();
                    }
                }
                Event::Text(e) => {
                    let raw = e.into_inner();
                    let text = html_escape::decode_html_entities(&String::from_utf8_lossy(&raw)).into_owned();
                    doc.append_text(top, &text);
                }
                Event::CData(e) => {
                    let raw = e.into_inner();
                    let id = doc.push(NodeKind::CData(String::from_utf8_lossy(&raw).into_owned()));
                    doc.append_child(top, id);
                }
                Event::Comment(e) => {
                    let raw = e.into_inner();
                    let id = doc.push(NodeKind::Comment(String::from_utf8_lossy(&raw).into_owned()));
                    doc.append_child(top, id);
                }
                Event::Decl(ref e) => {
                    let version = e
                        .version()
                        .map(|v| String::from_utf8_lossy(&v).into_owned())
                        .unwrap_or_else(|_| "1.0".to_string());
                    let mut decl = format!("version=\"{version}\" encoding=\"UTF-8\"");
                    if let Some(Ok(standalone)) = e.standalone() {
                        let _ = write!(decl, " standalone=\"{}\"", String::from_utf8_lossy(&standalone));
                    }
                    let id = doc.push(NodeKind::Declaration(decl));
                    doc.append_child(ROOT, id);
                }
                Event::DocType(e) => {
                    let raw = e.into_inner();
                    let id = doc.push(NodeKind::Doctype(String::from_utf8_lossy(&raw).trim().to_string()));
                    doc.append_child(ROOT, id);
                }
                Event::PI(ref e) => {
                    let raw: &[u8] = e;
                    let id = doc.push(NodeKind::ProcessingInstruction(String::from_utf8_lossy(raw).into_owned()));
                    doc.append_child(top, id);
                }
                Event::Eof => break,
            }
        }

        if open.len() > 1 {
            let unclosed = open
                .iter()
                .filter_map(|&id| doc.element(id))
                .map(|el| el.name.as_str())
                .collect::<Vec<_>>()
                .join(", ");
            return Err(parse_error(&reader, format!("unclosed elements at end of input: {unclosed}")));
        }
        Ok(doc)
    }

    /// Build the tree with html5ever's error-recovering tree builder.
    fn parse_html(src: &str) -> Self {
        let prepared = prepare_for_html(src).unwrap_or_else(|e| {
            tracing::debug!("Tokenizer pre-pass failed ({}), parsing as is", e);
            PreparedMarkup::unprocessed(src)
        });

        let html = if prepared.is_document {
            Html::parse_document(&prepared.markup)
        } else {
            Html::parse_fragment(&prepared.markup)
        };
        tracing::trace!("HTML tree builder recovered from {} errors", html.errors.len());

        let mut doc = Document::new(ParseMode::Xhtml);
        if prepared.has_declaration {
            let id = doc.push(NodeKind::Declaration("version=\"1.0\" encoding=\"UTF-8\"".to_string()));
            doc.append_child(ROOT, id);
        }

        // A fragment is wrapped in a synthetic `html` element; its content is
        // what belongs at the root.
        let mut top_level: Vec<_> = html.tree.root().children().collect();
        let wrapper = match top_level.as_slice() {
            [only] if !prepared.is_document && only.value().as_element().is_some_and(|el| el.name() == "html") => {
                Some(*only)
            }
            _ => None,
        };
        if let Some(wrapper) = wrapper {
            top_level = wrapper.children().collect();
        }

        let mut pending: Vec<(NodeId, _)> = top_level.into_iter().rev().map(|node| (ROOT, node)).collect();
        while let Some((parent, node)) = pending.pop() {
            let created = match node.value() {
                HtmlNode::Element(el) => {
                    let mut element = Element::new(el.name());
                    for (name, value) in el.attrs.iter() {
                        let key = match &name.prefix {
                            Some(prefix) => format!("{prefix}:{}", name.local),
                            None => name.local.to_string(),
                        };
                        element.set_attr(&key, value.to_string());
                    }
                    Some(doc.push(NodeKind::Element(element)))
                }
                HtmlNode::Text(text) => {
                    doc.append_text(parent, text);
                    None
                }
                HtmlNode::Comment(comment) => Some(doc.push(NodeKind::Comment(String::from(&*comment.comment)))),
                HtmlNode::Doctype(doctype) => Some(doc.push(NodeKind::Doctype(doctype_text(doctype)))),
                HtmlNode::ProcessingInstruction(pi) => Some(doc.push(NodeKind::ProcessingInstruction(
                    format!("{} {}", &*pi.target, &*pi.data),
                ))),
                HtmlNode::Document | HtmlNode::Fragment => None,
            };
            if let Some(id) = created {
                doc.append_child(parent, id);
                let children: Vec<_> = node.children().collect();
                pending.extend(children.into_iter().rev().map(|child| (id, child)));
            }
        }
        doc
    }

    pub fn mode(&self) -> ParseMode {
        self.mode
    }

    pub fn root(&self) -> NodeId {
        ROOT
    }

    pub fn kind(&self, id: NodeId) -> &NodeKind {
        &self.nodes[id].kind
    }

    pub fn kind_mut(&mut self, id: NodeId) -> &mut NodeKind {
        &mut self.nodes[id].kind
    }

    pub fn element(&self, id: NodeId) -> Option<&Element> {
        match &self.nodes[id].kind {
            NodeKind::Element(el) => Some(el),
            _ => None,
        }
    }

    pub fn element_mut(&mut self, id: NodeId) -> Option<&mut Element> {
        match &mut self.nodes[id].kind {
            NodeKind::Element(el) => Some(el),
            _ => None,
        }
    }

    pub fn parent(&self, id: NodeId) -> Option<NodeId> {
        self.nodes[id].parent
    }

    pub fn children(&self, id: NodeId) -> &[NodeId] {
        &self.nodes[id].children
    }

    /// Reachable descendants of `id` in document order, excluding `id`.
    pub fn descendants(&self, id: NodeId) -> Vec<NodeId> {
        let mut out = Vec::new();
        let mut stack: Vec<NodeId> = self.nodes[id].children.iter().rev().copied().collect();
        while let Some(next) = stack.pop() {
            out.push(next);
            stack.extend(self.nodes[next].children.iter().rev().copied());
        }
        out
    }

    /// All reachable elements with the given local name, in document order.
    pub fn elements_by_name(&self, local: &str) -> Vec<NodeId> {
        self.descendants(ROOT)
            .into_iter()
            .filter(|&id| self.element(id).is_some_and(|el| el.is(local)))
            .collect()
    }

    pub fn first_element(&self, local: &str) -> Option<NodeId> {
        self.descendants(ROOT)
            .into_iter()
            .find(|&id| self.element(id).is_some_and(|el| el.is(local)))
    }

    /// Direct element children of `id` with the given local name.
    pub fn child_elements(&self, id: NodeId, local: &str) -> Vec<NodeId> {
        self.nodes[id]
            .children
            .iter()
            .copied()
            .filter(|&c| self.element(c).is_some_and(|el| el.is(local)))
            .collect()
    }

    pub fn is_element(&self, id: NodeId, local: &str) -> bool {
        self.element(id).is_some_and(|el| el.is(local))
    }

    pub fn attr(&self, id: NodeId, name: &str) -> Option<&str> {
        self.element(id).and_then(|el| el.attr(name))
    }

    /// Set an attribute. Returns false when `id` is not an element.
    pub fn set_attr(&mut self, id: NodeId, name: &str, value: impl Into<String>) -> bool {
        match self.element_mut(id) {
            Some(el) => {
                el.set_attr(name, value);
                true
            }
            None => false,
        }
    }

    pub fn create_element(&mut self, name: &str, attrs: &[(&str, &str)]) -> NodeId {
        let mut el = Element::new(name);
        for (k, v) in attrs {
            el.set_attr(k, *v);
        }
        self.push(NodeKind::Element(el))
    }

    pub fn create_text(&mut self, text: &str) -> NodeId {
        self.push(NodeKind::Text(text.to_string()))
    }

    pub fn append_child(&mut self, parent: NodeId, child: NodeId) {
        self.detach(child);
        self.nodes[child].parent = Some(parent);
        self.nodes[parent].children.push(child);
    }

    pub fn prepend_child(&mut self, parent: NodeId, child: NodeId) {
        self.detach(child);
        self.nodes[child].parent = Some(parent);
        self.nodes[parent].children.insert(0, child);
    }

    /// Remove `id` (and its subtree) from its parent.
    pub fn detach(&mut self, id: NodeId) {
        if let Some(parent) = self.nodes[id].parent.take() {
            self.nodes[parent].children.retain(|&c| c != id);
        }
    }

    /// Join runs of sibling text nodes left behind by removals.
    pub fn merge_adjacent_text(&mut self) {
        let mut parents = self.descendants(ROOT);
        parents.push(ROOT);
        for id in parents {
            let children = std::mem::take(&mut self.nodes[id].children);
            let mut kept: Vec<NodeId> = Vec::with_capacity(children.len());
            for child in children {
                let prev = kept
                    .last()
                    .copied()
                    .filter(|&p| matches!(self.nodes[p].kind, NodeKind::Text(_)));
                let is_text = matches!(self.nodes[child].kind, NodeKind::Text(_));
                match prev {
                    Some(prev) if is_text => {
                        let text = match &mut self.nodes[child].kind {
                            NodeKind::Text(t) => std::mem::take(t),
                            _ => String::new(),
                        };
                        if let NodeKind::Text(existing) = &mut self.nodes[prev].kind {
                            existing.push_str(&text);
                        }
                        self.nodes[child].parent = None;
                    }
                    _ => kept.push(child),
                }
            }
            self.nodes[id].children = kept;
        }
    }

    /// Concatenated text and CDATA content of the subtree.
    pub fn text_content(&self, id: NodeId) -> String {
        let mut out = String::new();
        for node in self.descendants(id) {
            match &self.nodes[node].kind {
                NodeKind::Text(t) | NodeKind::CData(t) => out.push_str(t),
                _ => {}
            }
        }
        out
    }

    pub fn serialize(&self) -> String {
        let mut out = String::new();
        for &child in &self.nodes[ROOT].children {
            self.write_node(child, &mut out);
        }
        out
    }

    fn write_node(&self, id: NodeId, out: &mut String) {
        let node = &self.nodes[id];
        match &node.kind {
            NodeKind::Document => {
                for &child in &node.children {
                    self.write_node(child, out);
                }
            }
            NodeKind::Element(el) => {
                out.push('<');
                out.push_str(&el.name);
                for (key, value) in &el.attrs {
                    let _ = write!(
                        out,
                        " {}=\"{}\"",
                        key,
                        html_escape::encode_double_quoted_attribute(value)
                    );
                }
                let self_close = node.children.is_empty()
                    && (self.mode == ParseMode::Xml || is_void_element(el.local_name()));
                if self_close {
                    out.push_str("/>");
                } else {
                    out.push('>');
                    for &child in &node.children {
                        self.write_node(child, out);
                    }
                    out.push_str("</");
                    out.push_str(&el.name);
                    out.push('>');
                }
            }
            NodeKind::Text(t) => out.push_str(&html_escape::encode_text(t)),
            NodeKind::Comment(c) => {
                let _ = write!(out, "<!--{}-->", comment_text(c));
            }
            NodeKind::CData(c) => {
                let _ = write!(out, "<![CDATA[{c}]]>");
            }
            NodeKind::Declaration(d) => {
                let _ = write!(out, "<?xml {d}?>");
            }
            NodeKind::Doctype(d) => {
                let _ = write!(out, "<!DOCTYPE {d}>");
            }
            NodeKind::ProcessingInstruction(p) => {
                let _ = write!(out, "<?{p}?>");
            }
        }
    }

    fn push(&mut self, kind: NodeKind) -> NodeId {
        self.nodes.push(Node {
            kind,
            parent: None,
            children: Vec::new(),
        });
        self.nodes.len() - 1
    }

    fn append_text(&mut self, parent: NodeId, text: &str) {
        if text.is_empty() {
            return;
        }
        if let Some(&last) = self.nodes[parent].children.last() {
            if let NodeKind::Text(ref mut existing) = self.nodes[last].kind {
                existing.push_str(text);
                return;
            }
        }
        let id = self.push(NodeKind::Text(text.to_string()));
        self.append_child(parent, id);
    }
}

fn parse_error(reader: &XmlReader<&[u8]>, detail: String) -> MarkupError {
    MarkupError::Parse {
        detail,
        position: reader.buffer_position() as u64,
    }
}

fn qname(name: quick_xml::name::QName<'_>) -> String {
    String::from_utf8_lossy(name.as_ref()).into_owned()
}

/// XML forbids `--` inside a comment and a trailing `-`.
fn comment_text(text: &str) -> Cow<'_, str> {
    if !text.contains("--") && !text.ends_with('-') {
        return Cow::Borrowed(text);
    }
    let mut safe = text.to_string();
    while safe.contains("--") {
        safe = safe.replace("--", "- -");
    }
    if safe.ends_with('-') {
        safe.push(' ');
    }
    Cow::Owned(safe)
}

fn doctype_text(doctype: &scraper::node::Doctype) -> String {
    let mut text = doctype.name().to_string();
    match (doctype.public_id(), doctype.system_id()) {
        ("", "") => {}
        ("", system) => {
            let _ = write!(text, " SYSTEM \"{system}\"");
        }
        (public, "") => {
            let _ = write!(text, " PUBLIC \"{public}\"");
        }
        (public, system) => {
            let _ = write!(text, " PUBLIC \"{public}\" \"{system}\"");
        }
    }
    text
}

/// Markup handed to the HTML tree builder.
struct PreparedMarkup {
    markup: String,
    has_declaration: bool,
    /// Whether the first element is `html`; otherwise the input is a fragment.
    is_document: bool,
}

impl PreparedMarkup {
    fn unprocessed(src: &str) -> Self {
        let trimmed = src.trim_start();
        let (has_declaration, markup) = match trimmed.strip_prefix("<?xml").and_then(|rest| rest.split_once("?>")) {
            Some((_, rest)) => (true, rest),
            None => (false, src),
        };
        let is_document = markup.to_ascii_lowercase().contains("<html");
        Self {
            markup: markup.to_string(),
            has_declaration,
            is_document,
        }
    }
}

/// Re-tokenize XHTML so the HTML tree builder reads it the way an XML reader
/// would: the XML declaration is lifted out, stray `</br>` end tags are
/// dropped, non-void self-closing elements are expanded to start/end pairs
/// and CDATA sections become text.
fn prepare_for_html(src: &str) -> Result<PreparedMarkup, String> {
    let mut reader = XmlReader::from_str(src);
    {
        let config = reader.config_mut();
        config.trim_text(false);
        config.check_end_names = false;
        config.allow_unmatched_ends = true;
        config.check_comments = false;
    }
    let mut writer = XmlWriter::new(Vec::with_capacity(src.len()));
    let mut has_declaration = false;
    let mut first_element: Option<String> = None;
    let mut raw_text_depth = 0usize;

    loop {
        let event = reader.read_event().map_err(|e| e.to_string())?;
        let written = match event {
            Event::Eof => break,
            Event::Decl(_) => {
                has_declaration = true;
                Ok(())
            }
            Event::Start(e) => {
                let name = qname(e.name());
                first_element.get_or_insert_with(|| name.clone());
                if is_raw_text_element(&name) {
                    raw_text_depth += 1;
                }
                writer.write_event(Event::Start(e))
            }
            Event::Empty(e) => {
                let name = qname(e.name());
                first_element.get_or_insert_with(|| name.clone());
                if is_void_element(local_name(&name)) {
                    writer.write_event(Event::Empty(e))
                } else {
                    writer
                        .write_event(Event::Start(e.borrow()))
                        .and_then(|()| writer.write_event(Event::End(e.to_end())))
                }
            }
            Event::End(e) => {
                let name = qname(e.name());
                if local_name(&name).eq_ignore_ascii_case("br") {
                    Ok(())
                } else {
                    if is_raw_text_element(&name) {
                        raw_text_depth = raw_text_depth.saturating_sub(1);
                    }
                    writer.write_event(Event::End(e))
                }
            }
            Event::CData(e) => {
                let content = String::from_utf8_lossy(&e.into_inner()).into_owned();
                let text = if raw_text_depth > 0 {
                    BytesText::from_escaped(content)
                } else {
                    BytesText::new(&content).into_owned()
                };
                writer.write_event(Event::Text(text))
            }
            other => writer.write_event(other),
        };
        written.map_err(|e| e.to_string())?;
    }

    Ok(PreparedMarkup {
        markup: String::from_utf8_lossy(&writer.into_inner()).into_owned(),
        has_declaration,
        is_document: first_element.is_some_and(|name| local_name(&name).eq_ignore_ascii_case("html")),
    })
}

/// Elements whose content the HTML tokenizer does not decode.
fn is_raw_text_element(name: &str) -> bool {
    let local = local_name(name);
    local.eq_ignore_ascii_case("script") || local.eq_ignore_ascii_case("style")
}

fn element_from_start(e: &BytesStart) -> Element {
    let mut el = Element::new(qname(e.name()));
    let mut attrs = e.html_attributes();
    attrs.with_checks(false);
    for attr in attrs.flatten() {
        let key = String::from_utf8_lossy(attr.key.as_ref()).into_owned();
        if el.attr(&key).is_some() {
            continue;
        }
        let raw = String::from_utf8_lossy(&attr.value);
        let value = html_escape::decode_html_entities(&raw).into_owned();
        el.attrs.push((key, value));
    }
    el
}
