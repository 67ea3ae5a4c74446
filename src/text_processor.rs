//! # Markup / Style Processing Module
//!
//! Minificazione tollerante di XHTML/HTML e CSS, senza costruire un DOM.
//!
//! ## Markup (`MarkupMinifier`):
//! - Rimuove i commenti
//! - Whitespace tra tag: una sequenza con newline accanto a un elemento di blocco
//!   viene eliminata, altrimenti diventa un singolo spazio
//! - Rimuove attributi vuoti (`class`, `style`, `id`, `lang`, `dir`) e i `type`
//!   di default di `<script>` e `<style>`
//! - Il contenuto di `pre`, `textarea`, `script`, `style` e le sezioni CDATA
//!   restano byte per byte
//!
//! ## Style (`CssMinifier`):
//! - Rimuove i commenti e gli spazi attorno a `{ } ; , >`, attorno a `:` solo
//!   dentro i blocchi di dichiarazioni
//! - Elimina l'ultimo `;` prima di `}`
//! - Normalizza i valori: `0px` → `0`, `0.5` → `.5`, `#aabbcc` → `#abc`
//! - Stringhe e `url(...)` restano invariate
//!
//! Entrambi sono macchine a stati alimentate a blocchi (`feed`/`finish`): i file
//! oltre la soglia di streaming vengono letti e scritti a chunk senza mai essere
//! caricati interi. Il risultato viene applicato solo se strettamente più corto.

use crate::cancel::CancellationToken;
use crate::config::Config;
use crate::resource::{Resource, ResourceOutcome, SkipReason, TextFormat};
use regex::Regex;
use std::borrow::Cow;
use std::collections::VecDeque;
use std::fs::{self, File};
use std::io::{self, BufWriter, Read, Write};
use std::path::Path;
use std::sync::{Arc, OnceLock};
use tracing::{debug, warn};

const READ_CHUNK: usize = 64 * 1024;

/// Streaming minifier
pub trait Minifier {
    fn feed(&mut self, chunk: &str, out: &mut String);
    fn finish(&mut self, out: &mut String);
}

/// A minified result is applied only when strictly shorter
pub fn apply_if_shorter(original_len: u64, minified_len: u64) -> bool {
    minified_len < original_len
}

pub fn minifier_for(format: TextFormat) -> Box<dyn Minifier + Send> {
    match format {
        TextFormat::Html => Box::new(MarkupMinifier::new()),
        TextFormat::Css => Box::new(CssMinifier::new()),
    }
}

/// Minify a whole document in memory
pub fn minify(format: TextFormat, input: &str) -> String {
    let mut minifier = minifier_for(format);
    let mut out = String::with_capacity(input.len());
    minifier.feed(input, &mut out);
    minifier.finish(&mut out);
    out
}

// ---------------------------------------------------------------------------
// Markup
// ---------------------------------------------------------------------------

const RAW_TEXT_ELEMENTS: &[&str] = &["pre", "textarea", "script", "style"];
const EMPTY_DROPPABLE_ATTRS: &[&str] = &["class", "style", "id", "lang", "dir"];
const BLOCK_ELEMENTS: &[&str] = &[
    "html", "head", "body", "title", "meta", "link", "style", "script", "base", "p", "div", "section",
    "article", "aside", "header", "footer", "nav", "main", "h1", "h2", "h3", "h4", "h5", "h6", "ul",
    "ol", "li", "dl", "dt", "dd", "table", "thead", "tbody", "tfoot", "tr", "td", "th", "caption",
    "colgroup", "col", "blockquote", "figure", "figcaption", "hr", "br", "pre", "address", "form",
    "fieldset", "legend", "hgroup", "details", "summary", "center", "noscript",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum MarkupState {
    Text,
    Tag,
    Raw,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Emitted {
    Nothing,
    Text,
    Tag { block: bool },
}

#[derive(Debug)]
pub struct MarkupMinifier {
    state: MarkupState,
    tag: String,
    quote: Option<char>,
    /// Pending whitespace run; `true` if it contains a line break
    pending_ws: Option<bool>,
    last: Emitted,
    raw_close: Vec<char>,
    raw_tail: VecDeque<char>,
}

impl Default for MarkupMinifier {
    fn default() -> Self {
        Self::new()
    }
}

impl MarkupMinifier {
    pub fn new() -> Self {
        Self {
            state: MarkupState::Text,
            tag: String::new(),
            quote: None,
            pending_ws: None,
            last: Emitted::Nothing,
            raw_close: Vec::new(),
            raw_tail: VecDeque::new(),
        }
    }

    fn resolve_ws(&mut self, next_block: bool, out: &mut String) {
        let Some(newline) = self.pending_ws.take() else {
            return;
        };
        let prev_block = matches!(self.last, Emitted::Tag { block: true });
        match self.last {
            Emitted::Nothing => {}
            _ if newline && (prev_block || next_block) => {}
            _ => out.push(' '),
        }
    }

    fn text_char(&mut self, c: char, out: &mut String) {
        if c.is_whitespace() {
            let newline = c == '\n' || c == '\r';
            self.pending_ws = Some(self.pending_ws.unwrap_or(false) || newline);
        } else if c == '<' {
            self.state = MarkupState::Tag;
            self.tag.clear();
            self.quote = None;
        } else {
            self.resolve_ws(false, out);
            out.push(c);
            self.last = Emitted::Text;
        }
    }

    fn tag_char(&mut self, c: char, out: &mut String) {
        if self.tag.starts_with("!--") {
            if c == '>' && self.tag.len() >= 5 && self.tag.ends_with("--") {
                self.tag.clear();
                self.state = MarkupState::Text;
            } else {
                self.tag.push(c);
            }
            return;
        }

        if self.tag.starts_with("![CDATA[") {
            if c == '>' && self.tag.ends_with("]]") {
                self.emit_verbatim_tag(out);
            } else {
                self.tag.push(c);
            }
            return;
        }

        if let Some(q) = self.quote {
            if c == q {
                self.quote = None;
            }
            self.tag.push(c);
            return;
        }

        match c {
            '"' | '\'' if self.tag.trim_end().ends_with('=') => {
                self.quote = Some(c);
                self.tag.push(c);
            }
            '>' => self.complete_tag(out),
            _ => self.tag.push(c),
        }
    }

    fn emit_verbatim_tag(&mut self, out: &mut String) {
        self.resolve_ws(true, out);
        out.push('<');
        out.push_str(&self.tag);
        out.push('>');
        self.last = Emitted::Tag { block: true };
        self.tag.clear();
        self.state = MarkupState::Text;
    }

    fn complete_tag(&mut self, out: &mut String) {
        if self.tag.starts_with('!') || self.tag.starts_with('?') {
            self.emit_verbatim_tag(out);
            return;
        }

        let parsed = minify_tag(&self.tag);
        let block = BLOCK_ELEMENTS.contains(&parsed.name.as_str());
        self.resolve_ws(block, out);
        out.push('<');
        out.push_str(&parsed.text);
        out.push('>');
        self.last = Emitted::Tag { block };
        self.tag.clear();

        if !parsed.closing && !parsed.self_closing && RAW_TEXT_ELEMENTS.contains(&parsed.name.as_str()) {
            self.raw_close = format!("</{}", parsed.name).chars().collect();
            self.raw_tail.clear();
            self.state = MarkupState::Raw;
        } else {
            self.state = MarkupState::Text;
        }
    }

    fn raw_char(&mut self, c: char, out: &mut String) {
        self.raw_tail.push_back(c);
        let n = self.raw_close.len();

        if self.raw_tail.len() >= n {
            let start = self.raw_tail.len() - n;
            let matched = self
                .raw_tail
                .iter()
                .skip(start)
                .zip(self.raw_close.iter())
                .all(|(a, b)| a.to_ascii_lowercase() == *b);
            if matched {
                for _ in 0..start {
                    if let Some(ch) = self.raw_tail.pop_front() {
                        out.push(ch);
                    }
                }
                // `<` was consumed by the match; the tag buffer holds the rest
                self.tag = self.raw_tail.iter().skip(1).collect();
                self.raw_tail.clear();
                self.quote = None;
                self.pending_ws = None;
                self.last = Emitted::Text;
                self.state = MarkupState::Tag;
                return;
            }
        }

        while self.raw_tail.len() > n {
            if let Some(ch) = self.raw_tail.pop_front() {
                out.push(ch);
            }
        }
    }
}

impl Minifier for MarkupMinifier {
    fn feed(&mut self, chunk: &str, out: &mut String) {
        for c in chunk.chars() {
            match self.state {
                MarkupState::Text => self.text_char(c, out),
                MarkupState::Tag => self.tag_char(c, out),
                MarkupState::Raw => self.raw_char(c, out),
            }
        }
    }

    fn finish(&mut self, out: &mut String) {
        match self.state {
            MarkupState::Tag => {
                self.resolve_ws(false, out);
                out.push('<');
                out.push_str(&self.tag);
                self.tag.clear();
            }
            MarkupState::Raw => out.extend(self.raw_tail.drain(..)),
            MarkupState::Text => {}
        }
        self.pending_ws = None;
        self.state = MarkupState::Text;
    }
}

struct MinifiedTag {
    name: String,
    text: String,
    closing: bool,
    self_closing: bool,
}

/// Rebuild a start or end tag (content between `<` and `>`) with normalized spacing
fn minify_tag(raw: &str) -> MinifiedTag {
    if let Some(rest) = raw.strip_prefix('/') {
        let name = rest.trim().to_string();
        return MinifiedTag {
            name: name.to_ascii_lowercase(),
            text: format!("/{}", name),
            closing: true,
            self_closing: false,
        };
    }

    let body = raw.trim_end();
    let (body, self_closing) = match body.strip_suffix('/') {
        Some(stripped) => (stripped, true),
        None => (body, false),
    };

    let name_end = body.find(char::is_whitespace).unwrap_or(body.len());
    let name = &body[..name_end];
    let lower = name.to_ascii_lowercase();

    let mut text = String::with_capacity(body.len());
    text.push_str(name);
    for attr in parse_attributes(&body[name_end..]) {
        if drop_attribute(&lower, &attr) {
            continue;
        }
        text.push(' ');
        text.push_str(attr.name);
        if let Some(value) = attr.value {
            text.push('=');
            match attr.quote {
                Some(q) => {
                    text.push(q);
                    text.push_str(value);
                    text.push(q);
                }
                None => text.push_str(value),
            }
        }
    }
    if self_closing {
        text.push('/');
    }

    MinifiedTag {
        name: lower,
        text,
        closing: false,
        self_closing,
    }
}

struct Attribute<'a> {
    name: &'a str,
    value: Option<&'a str>,
    quote: Option<char>,
}

fn parse_attributes(input: &str) -> Vec<Attribute<'_>> {
    let bytes = input.as_bytes();
    let mut attrs = Vec::new();
    let mut i = 0;

    let skip_ws = |mut i: usize| {
        while i < bytes.len() && bytes[i].is_ascii_whitespace() {
            i += 1;
        }
        i
    };

    loop {
        i = skip_ws(i);
        if i >= bytes.len() {
            break;
        }
        let name_start = i;
        while i < bytes.len() && !bytes[i].is_ascii_whitespace() && bytes[i] != b'=' {
            i += 1;
        }
        let name = &input[name_start..i];

        let after_name = skip_ws(i);
        if after_name < bytes.len() && bytes[after_name] == b'=' {
            i = skip_ws(after_name + 1);
            if i < bytes.len() && (bytes[i] == b'"' || bytes[i] == b'\'') {
                let q = bytes[i];
                let value_start = i + 1;
                let mut j = value_start;
                while j < bytes.len() && bytes[j] != q {
                    j += 1;
                }
                attrs.push(Attribute {
                    name,
                    value: Some(&input[value_start..j]),
                    quote: Some(q as char),
                });
                i = (j + 1).min(bytes.len());
            } else {
                let value_start = i;
                while i < bytes.len() && !bytes[i].is_ascii_whitespace() {
                    i += 1;
                }
                attrs.push(Attribute {
                    name,
                    value: Some(&input[value_start..i]),
                    quote: None,
                });
            }
        } else {
            attrs.push(Attribute {
                name,
                value: None,
                quote: None,
            });
        }
        if name.is_empty() {
            i += 1;
        }
    }
    attrs
}

fn drop_attribute(element: &str, attr: &Attribute<'_>) -> bool {
    let name = attr.name.to_ascii_lowercase();
    let Some(value) = attr.value else {
        return false;
    };
    if EMPTY_DROPPABLE_ATTRS.contains(&name.as_str()) && value.trim().is_empty() {
        return true;
    }
    name == "type"
        && match element {
            "script" => value.eq_ignore_ascii_case("text/javascript"),
            "style" => value.eq_ignore_ascii_case("text/css"),
            _ => false,
        }
}

// ---------------------------------------------------------------------------
// Style
// ---------------------------------------------------------------------------

const RULE_LIST_AT_RULES: &[&str] = &[
    "@media",
    "@supports",
    "@document",
    "@-moz-document",
    "@layer",
    "@container",
    "@scope",
    "@keyframes",
    "@-webkit-keyframes",
    "@-moz-keyframes",
];
const LENGTH_UNITS: &[&str] = &[
    "", "px", "em", "rem", "ex", "ch", "pt", "pc", "cm", "mm", "in", "q", "vw", "vh", "vmin", "vmax",
];
const PRELUDE_CAPTURE: usize = 32;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CssState {
    Normal,
    Str { quote: char, escaped: bool },
    Slash,
    Comment { star: bool },
    Url { quote: Option<char>, escaped: bool },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Block {
    Rules,
    Declarations,
}

#[derive(Debug)]
pub struct CssMinifier {
    state: CssState,
    token: String,
    pending_space: bool,
    pending_semicolon: bool,
    last: Option<char>,
    blocks: Vec<Block>,
    prelude: String,
    in_value: bool,
    property: String,
    function_depth: usize,
}

impl Default for CssMinifier {
    fn default() -> Self {
        Self::new()
    }
}

fn is_word_char(c: char) -> bool {
    c.is_alphanumeric() || matches!(c, '-' | '_' | '.' | '#' | '%' | '\\') || !c.is_ascii()
}

impl CssMinifier {
    pub fn new() -> Self {
        Self {
            state: CssState::Normal,
            token: String::new(),
            pending_space: false,
            pending_semicolon: false,
            last: None,
            blocks: Vec::new(),
            prelude: String::new(),
            in_value: false,
            property: String::new(),
            function_depth: 0,
        }
    }

    fn in_declarations(&self) -> bool {
        self.blocks.last() == Some(&Block::Declarations)
    }

    /// `0px` is not `0` inside `calc()` and friends, nor as a flex basis
    fn keeps_zero_units(&self) -> bool {
        let property = self.property.as_str();
        self.function_depth > 0
            || property == "flex"
            || property == "flex-basis"
            || property.ends_with("-flex")
            || property.ends_with("-flex-basis")
    }

    fn end_declaration(&mut self) {
        self.in_value = false;
        self.property.clear();
        self.function_depth = 0;
    }

    fn is_separator(&self, c: char) -> bool {
        matches!(c, '{' | '}' | ';' | ',' | '>') || (c == ':' && self.in_declarations())
    }

    fn emit(&mut self, piece: &str, out: &mut String) {
        let Some(first) = piece.chars().next() else {
            return;
        };
        if self.pending_semicolon {
            out.push(';');
            self.last = Some(';');
            self.pending_semicolon = false;
        }
        if self.pending_space {
            self.pending_space = false;
            if let Some(last) = self.last {
                if !self.is_separator(last) && !self.is_separator(first) {
                    out.push(' ');
                    self.capture_prelude(" ");
                }
            }
        }
        out.push_str(piece);
        self.capture_prelude(piece);
        self.last = piece.chars().last();
    }

    fn capture_prelude(&mut self, piece: &str) {
        if self.prelude.len() < PRELUDE_CAPTURE {
            self.prelude.push_str(&piece.to_ascii_lowercase());
        }
    }

    fn flush_token(&mut self, out: &mut String) {
        if self.token.is_empty() {
            return;
        }
        let token = std::mem::take(&mut self.token);
        if self.in_declarations() && self.in_value {
            let normalized = normalize_value(&token, !self.keeps_zero_units());
            self.emit(&normalized, out);
        } else {
            self.emit(&token, out);
        }
    }

    fn open_block(&mut self, out: &mut String) {
        let prelude = self.prelude.trim_start();
        let kind = if RULE_LIST_AT_RULES
            .iter()
            .any(|rule| prelude.starts_with(rule) && !prelude[rule.len()..].starts_with(|c: char| is_word_char(c)))
        {
            Block::Rules
        } else {
            Block::Declarations
        };
        self.pending_space = false;
        self.emit("{", out);
        self.blocks.push(kind);
        self.prelude.clear();
        self.end_declaration();
    }

    fn close_block(&mut self, out: &mut String) {
        self.pending_semicolon = false;
        self.pending_space = false;
        out.push('}');
        self.last = Some('}');
        self.blocks.pop();
        self.prelude.clear();
        self.end_declaration();
    }

    fn normal_char(&mut self, c: char, out: &mut String) {
        if c.is_whitespace() {
            self.flush_token(out);
            self.pending_space = true;
            return;
        }
        if is_word_char(c) {
            self.token.push(c);
            return;
        }

        match c {
            '"' | '\'' => {
                self.flush_token(out);
                self.emit(&c.to_string(), out);
                self.state = CssState::Str { quote: c, escaped: false };
            }
            '/' => {
                self.flush_token(out);
                self.state = CssState::Slash;
            }
            '(' => {
                let is_url = self.token.eq_ignore_ascii_case("url");
                self.flush_token(out);
                self.emit("(", out);
                if is_url {
                    self.state = CssState::Url {
                        quote: None,
                        escaped: false,
                    };
                } else {
                    self.function_depth += 1;
                }
            }
            ')' => {
                self.flush_token(out);
                self.function_depth = self.function_depth.saturating_sub(1);
                self.emit(")", out);
            }
            '{' => {
                self.flush_token(out);
                self.open_block(out);
            }
            '}' => {
                self.flush_token(out);
                self.close_block(out);
            }
            ';' => {
                self.flush_token(out);
                self.pending_space = false;
                self.pending_semicolon = true;
                self.end_declaration();
                self.prelude.clear();
            }
            ':' => {
                self.flush_token(out);
                if self.in_declarations() && !self.in_value {
                    self.in_value = true;
                    self.property = self.prelude.trim().to_string();
                }
                self.emit(":", out);
            }
            _ => {
                self.flush_token(out);
                self.emit(&c.to_string(), out);
            }
        }
    }

    fn process(&mut self, c: char, out: &mut String) {
        match self.state {
            CssState::Normal => self.normal_char(c, out),
            CssState::Str { quote, escaped } => {
                out.push(c);
                self.state = if escaped {
                    CssState::Str { quote, escaped: false }
                } else if c == '\\' {
                    CssState::Str { quote, escaped: true }
                } else if c == quote {
                    self.last = Some(c);
                    CssState::Normal
                } else {
                    CssState::Str { quote, escaped: false }
                };
            }
            CssState::Slash => {
                if c == '*' {
                    self.state = CssState::Comment { star: false };
                } else {
                    self.state = CssState::Normal;
                    self.emit("/", out);
                    self.process(c, out);
                }
            }
            CssState::Comment { star } => {
                self.state = if star && c == '/' {
                    self.pending_space = true;
                    CssState::Normal
                } else {
                    CssState::Comment { star: c == '*' }
                };
            }
            CssState::Url { quote, escaped } => match quote {
                Some(q) => {
                    out.push(c);
                    self.state = if escaped {
                        CssState::Url { quote, escaped: false }
                    } else if c == '\\' {
                        CssState::Url { quote, escaped: true }
                    } else if c == q {
                        CssState::Url { quote: None, escaped: false }
                    } else {
                        CssState::Url { quote, escaped: false }
                    };
                }
                None => {
                    if escaped {
                        out.push(c);
                        self.state = CssState::Url { quote: None, escaped: false };
                    } else if c == ')' {
                        out.push(c);
                        self.last = Some(')');
                        self.state = CssState::Normal;
                    } else if c == '"' || c == '\'' {
                        out.push(c);
                        self.state = CssState::Url { quote: Some(c), escaped: false };
                    } else if !c.is_whitespace() {
                        out.push(c);
                        self.state = CssState::Url { quote: None, escaped: c == '\\' };
                    }
                }
            },
        }
    }
}

impl Minifier for CssMinifier {
    fn feed(&mut self, chunk: &str, out: &mut String) {
        for c in chunk.chars() {
            self.process(c, out);
        }
    }

    fn finish(&mut self, out: &mut String) {
        if self.state == CssState::Slash {
            self.state = CssState::Normal;
            self.emit("/", out);
        }
        self.flush_token(out);
        if self.pending_semicolon {
            out.push(';');
            self.pending_semicolon = false;
        }
        self.pending_space = false;
    }
}

fn number_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"^([+-]?)([0-9]*)(\.[0-9]+)?([a-zA-Z%]*)$").unwrap_or_else(|_| unreachable!())
    })
}

/// Shorten a single value token: zero lengths, leading zeros, hex colours
pub fn normalize_value_token(token: &str) -> Cow<'_, str> {
    normalize_value(token, true)
}

fn normalize_value(token: &str, strip_zero_units: bool) -> Cow<'_, str> {
    if let Some(hex) = token.strip_prefix('#') {
        let b = hex.as_bytes();
        if b.len() == 6
            && hex.chars().all(|c| c.is_ascii_hexdigit())
            && b[0].eq_ignore_ascii_case(&b[1])
            && b[2].eq_ignore_ascii_case(&b[3])
            && b[4].eq_ignore_ascii_case(&b[5])
        {
            let short: String = [b[0], b[2], b[4]].iter().map(|c| (*c as char).to_ascii_lowercase()).collect();
            return Cow::Owned(format!("#{}", short));
        }
        return Cow::Borrowed(token);
    }

    let Some(caps) = number_pattern().captures(token) else {
        return Cow::Borrowed(token);
    };
    let sign = caps.get(1).map_or("", |m| m.as_str());
    let int = caps.get(2).map_or("", |m| m.as_str());
    let frac = caps.get(3).map_or("", |m| m.as_str());
    let unit = caps.get(4).map_or("", |m| m.as_str());
    if int.is_empty() && frac.is_empty() {
        return Cow::Borrowed(token);
    }

    let int_zero = int.chars().all(|c| c == '0');
    let frac_zero = frac.chars().skip(1).all(|c| c == '0');
    if strip_zero_units && int_zero && frac_zero && LENGTH_UNITS.contains(&unit.to_ascii_lowercase().as_str()) {
        return Cow::Borrowed("0");
    }
    if !int.is_empty() && int_zero && !frac.is_empty() && !frac_zero {
        return Cow::Owned(format!("{}{}{}", sign, frac, unit));
    }
    Cow::Borrowed(token)
}

// ---------------------------------------------------------------------------
// Processor
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum MinifyResult {
    Applied { size: u64 },
    Unchanged,
    NotText,
}

pub struct TextProcessor {
    config: Arc<Config>,
}

impl TextProcessor {
    pub fn new(config: Arc<Config>) -> Self {
        Self { config }
    }

    pub async fn optimize(&self, resource: &Resource, format: TextFormat, cancel: &CancellationToken) -> ResourceOutcome {
        let original_size = match resource.size() {
            Ok(size) => size,
            Err(e) => return ResourceOutcome::failed(e),
        };
        if original_size < self.config.thresholds.markup_floor {
            return ResourceOutcome::skipped(SkipReason::BelowFloor);
        }

        let streamed = original_size > self.config.thresholds.markup_stream;
        let path = resource.path.clone();
        let token = cancel.clone();
        let result = tokio::task::spawn_blocking(move || {
            if streamed {
                minify_streamed(&path, format, original_size, &token)
            } else {
                minify_in_memory(&path, format)
            }
        })
        .await;

        match result {
            Ok(Ok(MinifyResult::Applied { size })) => ResourceOutcome::Optimized {
                original_size,
                optimized_size: size,
                method: format!(
                    "minify {}{}",
                    match format {
                        TextFormat::Html => "markup",
                        TextFormat::Css => "css",
                    },
                    if streamed { " (streamed)" } else { "" }
                ),
            },
            Ok(Ok(MinifyResult::Unchanged)) => ResourceOutcome::skipped(SkipReason::NoGain),
            Ok(Ok(MinifyResult::NotText)) => {
                debug!("{} is not UTF-8, left unchanged", resource.name);
                ResourceOutcome::skipped(SkipReason::Passthrough)
            }
            Ok(Err(e)) => {
                warn!("Minification of {} failed: {}", resource.name, e);
                ResourceOutcome::failed(e)
            }
            Err(e) => ResourceOutcome::failed(e),
        }
    }
}

fn staging_file(path: &Path) -> io::Result<tempfile::NamedTempFile> {
    let parent = path.parent().unwrap_or_else(|| Path::new("."));
    tempfile::Builder::new().prefix(".min-").tempfile_in(parent)
}

fn minify_in_memory(path: &Path, format: TextFormat) -> io::Result<MinifyResult> {
    let bytes = fs::read(path)?;
    let Ok(text) = String::from_utf8(bytes) else {
        return Ok(MinifyResult::NotText);
    };
    let minified = minify(format, &text);
    if !apply_if_shorter(text.len() as u64, minified.len() as u64) {
        return Ok(MinifyResult::Unchanged);
    }

    let mut staged = staging_file(path)?;
    staged.write_all(minified.as_bytes())?;
    staged.persist(path).map_err(|e| e.error)?;
    Ok(MinifyResult::Applied {
        size: minified.len() as u64,
    })
}

fn minify_streamed(
    path: &Path,
    format: TextFormat,
    original_size: u64,
    cancel: &CancellationToken,
) -> io::Result<MinifyResult> {
    let mut input = File::open(path)?;
    let staged = staging_file(path)?;
    let mut writer = BufWriter::new(staged.as_file());
    let mut minifier = minifier_for(format);

    let mut buffer = vec![0u8; READ_CHUNK];
    let mut carry: Vec<u8> = Vec::new();
    let mut out = String::with_capacity(READ_CHUNK);
    let mut written = 0u64;

    loop {
        if cancel.is_cancelled() {
            return Err(io::Error::new(io::ErrorKind::Interrupted, "operation cancelled"));
        }
        let read = input.read(&mut buffer)?;
        if read == 0 {
            break;
        }
        carry.extend_from_slice(&buffer[..read]);

        let valid = match std::str::from_utf8(&carry) {
            Ok(_) => carry.len(),
            Err(e) if e.error_len().is_none() => e.valid_up_to(),
            Err(_) => return Ok(MinifyResult::NotText),
        };
        let text = std::str::from_utf8(&carry[..valid]).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;

        out.clear();
        minifier.feed(text, &mut out);
        writer.write_all(out.as_bytes())?;
        written += out.len() as u64;
        carry.drain(..valid);
    }

    if !carry.is_empty() {
        return Ok(MinifyResult::NotText);
    }
    out.clear();
    minifier.finish(&mut out);
    writer.write_all(out.as_bytes())?;
    written += out.len() as u64;
    writer.flush()?;
    drop(writer);

    if !apply_if_shorter(original_size, written) {
        return Ok(MinifyResult::Unchanged);
    }
    staged.persist(path).map_err(|e| e.error)?;
    Ok(MinifyResult::Applied { size: written })
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn html(input: &str) -> String {
        minify(TextFormat::Html, input)
    }

    fn css(input: &str) -> String {
        minify(TextFormat::Css, input)
    }

    #[test]
    fn test_markup_comments_and_block_whitespace() {
        let input = "<?xml version=\"1.0\" encoding=\"utf-8\"?>\n<html>\n  <body>\n    <!-- note -->\n    <p>Hello   <b>big</b>\n  world</p>\n  </body>\n</html>\n";
        assert_eq!(
            html(input),
            "<?xml version=\"1.0\" encoding=\"utf-8\"?><html><body><p>Hello <b>big</b> world</p></body></html>"
        );
    }

    #[test]
    fn test_inline_newline_keeps_single_space() {
        assert_eq!(html("<p><em>one</em>\n<em>two</em></p>"), "<p><em>one</em> <em>two</em></p>");
        assert_eq!(html("<p>a <!-- x --> b</p>"), "<p>a b</p>");
    }

    #[test]
    fn test_markup_attributes() {
        assert_eq!(
            html("<div  class=\"\"   id=\"main\" style=' '><img src=\"a.png\"  alt=\"\" /></div>"),
            "<div id=\"main\"><img src=\"a.png\" alt=\"\"/></div>"
        );
        assert_eq!(
            html("<script type=\"text/javascript\" src=\"a.js\"></script>"),
            "<script src=\"a.js\"></script>"
        );
        assert_eq!(html("<style type=\"text/css\">p{}</style>"), "<style>p{}</style>");
        assert_eq!(html("<a title=\"a > b\" href=\"x\">y</a>"), "<a title=\"a > b\" href=\"x\">y</a>");
    }

    #[test]
    fn test_raw_text_elements_preserved() {
        let input = "<pre>  line 1\n\n  <!-- kept -->\n</pre>\n<p>x</p>";
        assert_eq!(html(input), "<pre>  line 1\n\n  <!-- kept -->\n</pre><p>x</p>");

        let script = "<script>\nif (a < b) {  x(); }\n</SCRIPT>";
        assert_eq!(html(script), script);
    }

    #[test]
    fn test_cdata_preserved() {
        let input = "<svg><![CDATA[  a  >  b ]]></svg>";
        assert_eq!(html(input), input);
    }

    #[test]
    fn test_markup_streaming_matches_whole() {
        let input = "<html>\n<head><title> T </title></head>\n<body><pre> a\n b </pre>\n<p class=\"\">x  y</p><!-- c --></body></html>";
        let whole = html(input);
        for split in 1..input.len() {
            if !input.is_char_boundary(split) {
                continue;
            }
            let mut minifier = MarkupMinifier::new();
            let mut out = String::new();
            minifier.feed(&input[..split], &mut out);
            minifier.feed(&input[split..], &mut out);
            minifier.finish(&mut out);
            assert_eq!(out, whole, "split at {}", split);
        }
    }

    #[test]
    fn test_css_basic() {
        let input = "/* header */\nbody {\n  margin : 0px ;\n  color: #AABBCC;\n  line-height: 0.5em;\n}\n\na > b , c { padding: 0.0px 1.50em; }\n";
        assert_eq!(
            css(input),
            "body{margin:0;color:#abc;line-height:.5em}a>b,c{padding:0 1.50em}"
        );
    }

    #[test]
    fn test_css_selectors_keep_descendant_space() {
        assert_eq!(css("a :hover { color : red }"), "a :hover{color:red}");
        assert_eq!(css("#aabbcc .x { }"), "#aabbcc .x{}");
        assert_eq!(
            css("@media screen and (max-width: 600px) {\n  p a:hover { margin: 0px; }\n}"),
            "@media screen and (max-width: 600px){p a:hover{margin:0}}"
        );
    }

    #[test]
    fn test_css_strings_and_urls_untouched() {
        assert_eq!(
            css("p::before { content: \"  0px  ;  \"; background: url( a.png ) }"),
            "p::before{content:\"  0px  ;  \";background:url(a.png)}"
        );
        assert_eq!(
            css("@font-face { src: url(\"fonts/My Font.woff\") format('woff'); }"),
            "@font-face{src:url(\"fonts/My Font.woff\") format('woff')}"
        );
        assert_eq!(css("p { font: 12px/1.5 serif }"), "p{font:12px/1.5 serif}");
    }

    #[test]
    fn test_css_keyframes_and_zero_percent() {
        assert_eq!(
            css("@keyframes fade { 0% { opacity: 0 } 100% { opacity: 1 } }"),
            "@keyframes fade{0%{opacity:0}100%{opacity:1}}"
        );
        assert_eq!(css("p { width: 0% }"), "p{width:0%}");
    }

    #[test]
    fn test_css_zero_lengths_kept_in_functions_and_flex() {
        assert_eq!(css("p { width: calc(0px + 1em) }"), "p{width:calc(0px + 1em)}");
        assert_eq!(css("p { width: max(0px, 10%); margin: 0px }"), "p{width:max(0px,10%);margin:0}");
        assert_eq!(css("p { flex: 1 1 0px }"), "p{flex:1 1 0px}");
        assert_eq!(css("p { -webkit-flex-basis: 0px; padding: 0.0em }"), "p{-webkit-flex-basis:0px;padding:0}");
        assert_eq!(css("p { flex-grow: 0; margin: 0px 0.5em }"), "p{flex-grow:0;margin:0 .5em}");
        assert_eq!(
            css("p { transform: translate(0px, 0.5em); background: url( 0px.png ) }"),
            "p{transform:translate(0px,.5em);background:url(0px.png)}"
        );
    }

    #[test]
    fn test_normalize_value_token() {
        assert_eq!(normalize_value_token("0px"), "0");
        assert_eq!(normalize_value_token("-0.0em"), "0");
        assert_eq!(normalize_value_token("0.75"), ".75");
        assert_eq!(normalize_value_token("-0.5em"), "-.5em");
        assert_eq!(normalize_value_token("10px"), "10px");
        assert_eq!(normalize_value_token("0s"), "0s");
        assert_eq!(normalize_value_token("#FFffFF"), "#fff");
        assert_eq!(normalize_value_token("#abcdef"), "#abcdef");
        assert_eq!(normalize_value_token("auto"), "auto");
    }

    #[test]
    fn test_apply_if_shorter() {
        assert!(apply_if_shorter(100, 99));
        assert!(!apply_if_shorter(100, 100));
        assert!(!apply_if_shorter(100, 101));
    }

    #[tokio::test]
    async fn test_already_minimal_markup_unchanged() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("ch.xhtml");
        let content = format!("<p>{}</p>", "x".repeat(2_000));
        std::fs::write(&path, &content).unwrap();

        let processor = TextProcessor::new(Arc::new(Config::default()));
        let outcome = processor
            .optimize(&Resource::new("ch.xhtml", &path), TextFormat::Html, &CancellationToken::new())
            .await;
        assert_eq!(outcome, ResourceOutcome::skipped(SkipReason::NoGain));
        assert_eq!(std::fs::read_to_string(&path).unwrap(), content);
    }

    #[tokio::test]
    async fn test_small_markup_below_floor() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("a.css");
        std::fs::write(&path, "p {  margin: 0px;  }").unwrap();

        let processor = TextProcessor::new(Arc::new(Config::default()));
        let outcome = processor
            .optimize(&Resource::new("a.css", &path), TextFormat::Css, &CancellationToken::new())
            .await;
        assert_eq!(outcome, ResourceOutcome::skipped(SkipReason::BelowFloor));
    }

    #[tokio::test]
    async fn test_streamed_minification() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("big.css");
        let rule = "body {\n    margin : 0px ;\n    color: #ffffff;   /* é */\n}\n";
        let content = rule.repeat(3_000);
        std::fs::write(&path, &content).unwrap();

        let mut config = Config::default();
        config.thresholds.markup_stream = 10_000;
        let processor = TextProcessor::new(Arc::new(config));
        let outcome = processor
            .optimize(&Resource::new("big.css", &path), TextFormat::Css, &CancellationToken::new())
            .await;

        match outcome {
            ResourceOutcome::Optimized { method, optimized_size, .. } => {
                assert!(method.ends_with("(streamed)"));
                assert_eq!(optimized_size, std::fs::metadata(&path).unwrap().len());
            }
            other => panic!("unexpected outcome {:?}", other),
        }
        assert_eq!(
            std::fs::read_to_string(&path).unwrap(),
            "body{margin:0;color:#fff}".repeat(3_000)
        );
    }

    #[tokio::test]
    async fn test_non_utf8_is_passthrough() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("latin1.html");
        let mut content = b"<p>  caf".to_vec();
        content.push(0xE9);
        content.extend(vec![b' '; 2_000]);
        std::fs::write(&path, &content).unwrap();

        let processor = TextProcessor::new(Arc::new(Config::default()));
        let outcome = processor
            .optimize(&Resource::new("latin1.html", &path), TextFormat::Html, &CancellationToken::new())
            .await;
        assert_eq!(outcome, ResourceOutcome::skipped(SkipReason::Passthrough));
        assert_eq!(std::fs::read(&path).unwrap(), content);
    }
}
