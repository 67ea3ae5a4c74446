//! # Font Processing Module
//!
//! Riduce i font incorporati sapendo quali caratteri il libro usa davvero.
//!
//! ## Pipeline per font:
//! 1. **Size guard**: sotto `font_floor` → `Skipped(BelowFloor)`
//! 2. **Inventario**: code point mappati dalla `cmap` (vedi `sfnt`)
//! 3. **Caratteri usati**: testo del markup (entità decodificate), stringhe CSS
//!    `content:` e ASCII stampabile, più maiuscole/minuscole se un `text-transform`
//!    le richiede; calcolati una volta per run in `RunState`
//! 4. **Subset** se i caratteri usati coprono una piccola parte dell'inventario,
//!    tenuto solo se più piccolo
//! 5. **Repack** lossless nello stesso container
//! 6. **Senza tool**: rimozione in-process della tabella `DSIG`

use crate::cancel::CancellationToken;
use crate::config::Config;
use crate::file_manager::FileManager;
use crate::optimizer::encoder::{EncodeJob, EncodeOp, Encoder};
use crate::policy::{self, FontAction};
use crate::resource::{FontFormat, Resource, ResourceOutcome, SkipReason, TextFormat};
use crate::sfnt;
use crate::state::{CharSet, RunState};
use anyhow::Result;
use regex::Regex;
use std::fmt::Write as _;
use std::path::PathBuf;
use std::sync::{Arc, OnceLock};
use tracing::{debug, info, warn};

pub struct FontProcessor {
    config: Arc<Config>,
    encoder: Arc<dyn Encoder>,
    state: Arc<RunState>,
    scratch: PathBuf,
    /// Markup and style files scanned for used characters
    text_sources: Arc<Vec<(PathBuf, TextFormat)>>,
}

impl FontProcessor {
    pub fn new(
        config: Arc<Config>,
        encoder: Arc<dyn Encoder>,
        state: Arc<RunState>,
        scratch: PathBuf,
        text_sources: Arc<Vec<(PathBuf, TextFormat)>>,
    ) -> Self {
        Self {
            config,
            encoder,
            state,
            scratch,
            text_sources,
        }
    }

    pub async fn optimize(&self, resource: &Resource, format: FontFormat, cancel: &CancellationToken) -> ResourceOutcome {
        match self.try_optimize(resource, format, cancel).await {
            Ok(outcome) => outcome,
            Err(e) => {
                warn!("Font {} failed: {:#}", resource.name, e);
                ResourceOutcome::failed(format!("{:#}", e))
            }
        }
    }

    async fn used_chars(&self) -> Arc<CharSet> {
        let sources = Arc::clone(&self.text_sources);
        let keep_ascii = self.config.font_subset_keep_ascii;
        self.state
            .used_chars(|| async move {
                tokio::task::spawn_blocking(move || collect_used_chars(&sources, keep_ascii))
                    .await
                    .unwrap_or_default()
            })
            .await
    }

    async fn try_optimize(
        &self,
        resource: &Resource,
        format: FontFormat,
        cancel: &CancellationToken,
    ) -> Result<ResourceOutcome> {
        let original_size = resource.size()?;
        if original_size < self.config.thresholds.font_floor {
            return Ok(ResourceOutcome::skipped(SkipReason::BelowFloor));
        }

        let data = tokio::fs::read(&resource.path).await?;
        let inventory = sfnt::cmap_coverage(&data);
        let used = self.used_chars().await;
        let covered: Vec<char> = match &inventory {
            Some(inventory) => used.iter().copied().filter(|c| inventory.contains(&(*c as u32))).collect(),
            None => Vec::new(),
        };
        let action = policy::font_action(
            covered.len(),
            inventory.as_ref().map(|i| i.len()),
            self.config.font_subset_ratio,
        );
        let flavor = policy::font_flavor(format);
        debug!(
            "{}: {} of {:?} code points used, {:?}",
            resource.name,
            covered.len(),
            inventory.as_ref().map(|i| i.len()),
            action
        );

        let scratch = FileManager::scratch_dir(&self.scratch, "font-")?;
        let ext = resource
            .path
            .extension()
            .map(|e| e.to_string_lossy().to_lowercase())
            .unwrap_or_else(|| "font".to_string());

        let mut ops = Vec::with_capacity(2);
        if action == FontAction::Subset {
            let unicodes_file = scratch.path().join("unicodes.txt");
            tokio::fs::write(&unicodes_file, unicodes_list(&covered)).await?;
            ops.push(EncodeOp::FontSubset { unicodes_file, flavor });
        }
        ops.push(EncodeOp::FontRepack { flavor });

        let mut attempted = 0usize;
        let mut last_error = None;
        for (index, op) in ops.into_iter().enumerate() {
            if !self.encoder.supports(&op) {
                continue;
            }
            attempted += 1;

            let output = scratch.path().join(format!("candidate-{}.{}", index, ext));
            let label = op.label();
            let job = EncodeJob::new(op, &resource.path, &output);
            let encoded = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(anyhow::anyhow!("cancelled")),
                encoded = self.encoder.encode(&job) => encoded,
            };
            match encoded {
                Ok(path) => {
                    let size = tokio::fs::metadata(&path).await?.len();
                    if size < original_size {
                        FileManager::replace_file(&resource.path, &path).await?;
                        info!("{}: {} {} → {} bytes", resource.name, label, original_size, size);
                        return Ok(ResourceOutcome::Optimized {
                            original_size,
                            optimized_size: size,
                            method: label,
                        });
                    }
                    debug!("{}: {} gave no gain ({} bytes)", resource.name, label, size);
                }
                Err(e) if e.is_unavailable() => attempted -= 1,
                Err(e) => {
                    warn!("{}: {} failed: {}", resource.name, label, e);
                    last_error = Some(e.to_string());
                }
            }
        }

        if attempted == 0 {
            return self.strip_metadata(resource, data, original_size).await;
        }
        Ok(match last_error {
            Some(reason) => ResourceOutcome::failed(reason),
            None => ResourceOutcome::skipped(SkipReason::NoGain),
        })
    }

    async fn strip_metadata(&self, resource: &Resource, data: Vec<u8>, original_size: u64) -> Result<ResourceOutcome> {
        let Some(stripped) = sfnt::strip_dsig(&data) else {
            return Ok(ResourceOutcome::skipped(SkipReason::NoGain));
        };
        let size = stripped.len() as u64;
        if size >= original_size {
            return Ok(ResourceOutcome::skipped(SkipReason::NoGain));
        }

        let staged = tempfile::Builder::new()
            .prefix(".font-")
            .tempfile_in(&self.scratch)?
            .into_temp_path();
        tokio::fs::write(&staged, &stripped).await?;
        FileManager::replace_file(&resource.path, &staged).await?;
        Ok(ResourceOutcome::Optimized {
            original_size,
            optimized_size: size,
            method: "strip DSIG".to_string(),
        })
    }
}

/// One `U+XXXX` per line
fn unicodes_list(chars: &[char]) -> String {
    let mut list = String::with_capacity(chars.len() * 8);
    for c in chars {
        let _ = writeln!(list, "U+{:04X}", *c as u32);
    }
    list
}

fn content_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r#"content\s*:\s*(?:"((?:[^"\\]|\\.)*)"|'((?:[^'\\]|\\.)*)')"#).unwrap_or_else(|_| unreachable!())
    })
}

fn text_transform_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"(?i)text-transform\s*:\s*(uppercase|lowercase|capitalize)").unwrap_or_else(|_| unreachable!())
    })
}

#[derive(Debug, Default, Clone, Copy)]
struct CaseMapping {
    upper: bool,
    lower: bool,
}

impl CaseMapping {
    fn scan(&mut self, text: &str) {
        for caps in text_transform_pattern().captures_iter(text) {
            match caps[1].to_ascii_lowercase().as_str() {
                "lowercase" => self.lower = true,
                _ => self.upper = true,
            }
        }
    }

    fn apply(self, chars: &mut CharSet) {
        let mut mapped = Vec::new();
        for c in chars.iter() {
            if self.upper {
                mapped.extend(c.to_uppercase());
            }
            if self.lower {
                mapped.extend(c.to_lowercase());
            }
        }
        chars.extend(mapped);
    }
}

/// Characters rendered by the book's text, including the case forms a
/// `text-transform` anywhere in the sources can produce
pub fn collect_used_chars(sources: &[(PathBuf, TextFormat)], keep_ascii: bool) -> CharSet {
    let mut chars = CharSet::new();
    let mut case_mapping = CaseMapping::default();
    if keep_ascii {
        chars.extend((0x20u8..0x7F).map(char::from));
    }
    for (path, format) in sources {
        let text = match std::fs::read(path) {
            Ok(bytes) => String::from_utf8_lossy(&bytes).into_owned(),
            Err(e) => {
                warn!("Cannot scan {}: {}", path.display(), e);
                continue;
            }
        };
        if *format == TextFormat::Html {
            markup_text_chars(&text, &mut chars);
        }
        css_content_chars(&text, &mut chars);
        case_mapping.scan(&text);
    }
    case_mapping.apply(&mut chars);
    chars.retain(|c| !c.is_control());
    chars
}

fn markup_text_chars(markup: &str, chars: &mut CharSet) {
    let mut in_tag = false;
    let mut text = String::new();
    for c in markup.chars() {
        match (in_tag, c) {
            (false, '<') => {
                decode_entities(&text, chars);
                text.clear();
                in_tag = true;
            }
            (true, '>') => in_tag = false,
            (false, _) => text.push(c),
            (true, _) => {}
        }
    }
    decode_entities(&text, chars);
}

fn css_content_chars(css: &str, chars: &mut CharSet) {
    for caps in content_pattern().captures_iter(css) {
        let Some(value) = caps.get(1).or_else(|| caps.get(2)) else {
            continue;
        };
        let mut iter = value.as_str().chars().peekable();
        while let Some(c) = iter.next() {
            if c != '\\' {
                chars.insert(c);
                continue;
            }
            let mut hex = String::new();
            while hex.len() < 6 {
                match iter.peek() {
                    Some(h) if h.is_ascii_hexdigit() => {
                        hex.push(*h);
                        iter.next();
                    }
                    _ => break,
                }
            }
            if hex.is_empty() {
                if let Some(escaped) = iter.next() {
                    chars.insert(escaped);
                }
            } else {
                if iter.peek() == Some(&' ') {
                    iter.next();
                }
                if let Some(decoded) = u32::from_str_radix(&hex, 16).ok().and_then(char::from_u32) {
                    chars.insert(decoded);
                }
            }
        }
    }
}

fn named_entity(name: &str) -> Option<char> {
    Some(match name {
        "amp" => '&',
        "lt" => '<',
        "gt" => '>',
        "quot" => '"',
        "apos" => '\'',
        "nbsp" => '\u{A0}',
        "shy" => '\u{AD}',
        "copy" => '©',
        "reg" => '®',
        "trade" => '™',
        "deg" => '°',
        "middot" => '·',
        "laquo" => '«',
        "raquo" => '»',
        "ndash" => '–',
        "mdash" => '—',
        "lsquo" => '‘',
        "rsquo" => '’',
        "sbquo" => '‚',
        "ldquo" => '“',
        "rdquo" => '”',
        "bdquo" => '„',
        "hellip" => '…',
        "bull" => '•',
        "dagger" => '†',
        "Dagger" => '‡',
        "sect" => '§',
        "para" => '¶',
        "euro" => '€',
        "pound" => '£',
        "times" => '×',
        "eacute" => 'é',
        "egrave" => 'è',
        "agrave" => 'à',
        "ccedil" => 'ç',
        "auml" => 'ä',
        "ouml" => 'ö',
        "uuml" => 'ü',
        "szlig" => 'ß',
        "divide" => '÷',
        "thinsp" => '\u{2009}',
        "ensp" => '\u{2002}',
        "emsp" => '\u{2003}',
        _ => return None,
    })
}

fn decode_entities(text: &str, chars: &mut CharSet) {
    let mut rest = text;
    while let Some(amp) = rest.find('&') {
        chars.extend(rest[..amp].chars().filter(|c| !c.is_whitespace() || *c == '\u{A0}'));
        let after = &rest[amp + 1..];
        let decoded = after.find(';').filter(|end| *end <= 10).and_then(|end| {
            let name = &after[..end];
            let c = if let Some(hex) = name.strip_prefix("#x").or_else(|| name.strip_prefix("#X")) {
                u32::from_str_radix(hex, 16).ok().and_then(char::from_u32)
            } else if let Some(dec) = name.strip_prefix('#') {
                dec.parse::<u32>().ok().and_then(char::from_u32)
            } else {
                named_entity(name)
            };
            c.map(|c| (c, end))
        });
        match decoded {
            Some((c, end)) => {
                chars.insert(c);
                rest = &after[end + 1..];
            }
            None => {
                chars.insert('&');
                rest = after;
            }
        }
    }
    chars.extend(rest.chars().filter(|c| !c.is_whitespace() || *c == '\u{A0}'));
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::optimizer::encoder::fake::FakeEncoder;
    use crate::sfnt::testing::sample_font;
    use tempfile::TempDir;

    struct Fixture {
        _dir: TempDir,
        font: PathBuf,
        processor: FontProcessor,
        encoder: Arc<FakeEncoder>,
    }

    fn fixture(encoder: FakeEncoder, markup: &str, keep_ascii: bool) -> Fixture {
        let dir = TempDir::new().unwrap();
        let scratch = dir.path().join("scratch");
        std::fs::create_dir_all(&scratch).unwrap();
        let chapter = dir.path().join("ch1.xhtml");
        std::fs::write(&chapter, markup).unwrap();
        let font = dir.path().join("serif.ttf");
        std::fs::write(&font, sample_font(80_000)).unwrap();

        let config = Config {
            font_subset_keep_ascii: keep_ascii,
            ..Config::default()
        };
        let encoder = Arc::new(encoder);
        let processor = FontProcessor::new(
            Arc::new(config),
            encoder.clone(),
            Arc::new(RunState::new()),
            scratch,
            Arc::new(vec![(chapter, TextFormat::Html)]),
        );
        Fixture {
            _dir: dir,
            font,
            processor,
            encoder,
        }
    }

    #[test]
    fn test_decode_entities() {
        let mut chars = CharSet::new();
        decode_entities("a&amp;b &#x201C;q&#8221; &mdash; &bogus; &", &mut chars);
        for c in ['a', '&', 'b', '“', 'q', '”', '—', 'o', 'g', 'u', 's', ';'] {
            assert!(chars.contains(&c), "missing {:?}", c);
        }
        assert!(!chars.contains(&' '));
    }

    #[test]
    fn test_collect_used_chars() {
        let dir = TempDir::new().unwrap();
        let html = dir.path().join("a.xhtml");
        let css = dir.path().join("a.css");
        std::fs::write(&html, "<p class=\"zzz\">Caf&eacute; é &#x263A;</p>").unwrap();
        std::fs::write(&css, "p::before { content: \"\\2014 \" } q::after { content: '»' }").unwrap();

        let sources = vec![(html, TextFormat::Html), (css, TextFormat::Css)];
        let chars = collect_used_chars(&sources, false);
        for c in ['C', 'a', 'f', 'é', '☺', '—', '»'] {
            assert!(chars.contains(&c), "missing {:?}", c);
        }
        assert!(!chars.contains(&'z'));

        let with_ascii = collect_used_chars(&sources, true);
        assert!(with_ascii.contains(&'z'));
        assert!(with_ascii.contains(&'~'));
    }

    #[test]
    fn test_text_transform_adds_case_forms() {
        let dir = TempDir::new().unwrap();
        let html = dir.path().join("a.xhtml");
        let css = dir.path().join("a.css");
        std::fs::write(&html, "<h1>straße é</h1><p style=\"text-transform: lowercase\">QR</p>").unwrap();
        std::fs::write(&css, "h1 { Text-Transform : UPPERCASE }").unwrap();

        let plain = collect_used_chars(&[(html.clone(), TextFormat::Html)], false);
        assert!(plain.contains(&'q'));
        assert!(!plain.contains(&'T'));

        let sources = vec![(html, TextFormat::Html), (css, TextFormat::Css)];
        let chars = collect_used_chars(&sources, false);
        for c in ['S', 'T', 'R', 'A', 'E', 'É', 'q', 'r', 's', 'ß'] {
            assert!(chars.contains(&c), "missing {:?}", c);
        }
    }

    #[test]
    fn test_unicodes_list() {
        assert_eq!(unicodes_list(&['A', '☺']), "U+0041\nU+263A\n");
    }

    #[tokio::test]
    async fn test_small_font_below_floor() {
        let f = fixture(FakeEncoder::shrinking(0.5), "<p>ABC</p>", false);
        std::fs::write(&f.font, sample_font(100)).unwrap();
        let outcome = f
            .processor
            .optimize(&Resource::new("serif.ttf", &f.font), FontFormat::TrueType, &CancellationToken::new())
            .await;
        assert_eq!(outcome, ResourceOutcome::skipped(SkipReason::BelowFloor));
        assert!(f.encoder.calls().is_empty());
    }

    #[tokio::test]
    async fn test_low_coverage_subsets() {
        let f = fixture(FakeEncoder::shrinking(0.3), "<p>ABC</p>", false);
        let before = std::fs::metadata(&f.font).unwrap().len();
        let outcome = f
            .processor
            .optimize(&Resource::new("serif.ttf", &f.font), FontFormat::TrueType, &CancellationToken::new())
            .await;

        match outcome {
            ResourceOutcome::Optimized { method, optimized_size, .. } => {
                assert_eq!(method, "font subset");
                assert!(optimized_size < before);
            }
            other => panic!("unexpected outcome {:?}", other),
        }
        assert!(matches!(f.encoder.calls()[0], EncodeOp::FontSubset { .. }));
    }

    #[tokio::test]
    async fn test_high_coverage_repacks() {
        let f = fixture(FakeEncoder::shrinking(0.8), "<p>ABCDEFGHIJKLMNOPQRSTUVWXYZ</p>", false);
        let outcome = f
            .processor
            .optimize(&Resource::new("serif.ttf", &f.font), FontFormat::TrueType, &CancellationToken::new())
            .await;

        assert!(matches!(outcome, ResourceOutcome::Optimized { ref method, .. } if method == "font repack"));
        assert_eq!(f.encoder.calls(), vec![EncodeOp::FontRepack { flavor: crate::optimizer::encoder::FontFlavor::Sfnt }]);
    }

    #[tokio::test]
    async fn test_no_tools_strips_dsig() {
        let f = fixture(FakeEncoder::unavailable(), "<p>ABC</p>", true);
        let before = std::fs::read(&f.font).unwrap();
        let outcome = f
            .processor
            .optimize(&Resource::new("serif.ttf", &f.font), FontFormat::TrueType, &CancellationToken::new())
            .await;

        assert!(matches!(outcome, ResourceOutcome::Optimized { ref method, .. } if method == "strip DSIG"));
        let after = std::fs::read(&f.font).unwrap();
        assert_eq!(after.len(), before.len() - 8 * 1024 - 16);
        assert_eq!(sfnt::cmap_coverage(&after), sfnt::cmap_coverage(&before));
    }

    #[tokio::test]
    async fn test_failing_tools_keep_original() {
        let f = fixture(FakeEncoder::failing(), "<p>ABC</p>", false);
        let before = std::fs::read(&f.font).unwrap();
        let outcome = f
            .processor
            .optimize(&Resource::new("serif.ttf", &f.font), FontFormat::TrueType, &CancellationToken::new())
            .await;

        assert!(matches!(outcome, ResourceOutcome::Failed { .. }));
        assert_eq!(std::fs::read(&f.font).unwrap(), before);
    }
}
