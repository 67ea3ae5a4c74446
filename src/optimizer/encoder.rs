//! # Encoder Collaborator
//!
//! Interfaccia stretta verso gli encoder esterni: la pipeline fornisce
//! (input, operazione con parametri, output) e considera riuscita solo
//! un'invocazione che lascia un file di output non vuoto.
//!
//! ## Implementazioni:
//! - `ExternalEncoder`: lancia i tool risolti da `ToolPathResolver` con
//!   `tokio::process::Command`, limite di tempo per invocazione e `kill_on_drop`
//! - `FakeEncoder` (solo test): riduce l'input di un fattore configurabile,
//!   può fallire, essere indisponibile o lento
//!
//! ## Tool per operazione (in ordine di preferenza):
//! | Operazione      | Tool                |
//! |-----------------|---------------------|
//! | Prepare         | magick, convert     |
//! | JpegLossy       | cjpeg (mozjpeg)     |
//! | JpegLossless    | jpegtran            |
//! | PngQuantize     | pngquant            |
//! | PngLossless     | oxipng              |
//! | Gif             | gifsicle            |
//! | WebpLossy/Lossless | cwebp            |
//! | FontSubset/Repack  | pyftsubset       |

use crate::error::EncodeError;
use crate::tool_resolver::{Tool, ToolPathResolver};
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::process::Command;
use tracing::{debug, warn};

/// Font container produced by a font operation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FontFlavor {
    Sfnt,
    Woff,
    Woff2,
}

impl FontFlavor {
    fn flag(&self) -> Option<&'static str> {
        match self {
            FontFlavor::Sfnt => None,
            FontFlavor::Woff => Some("--flavor=woff"),
            FontFlavor::Woff2 => Some("--flavor=woff2"),
        }
    }
}

/// One encoding step with its parameters
#[derive(Debug, Clone, PartialEq)]
pub enum EncodeOp {
    /// Strip metadata and, when `bound` is set, shrink to fit inside it
    Prepare {
        bound: Option<(u32, u32)>,
        memory_mb: u64,
    },
    JpegLossy { quality: u8 },
    JpegLossless,
    PngQuantize { quality: u8 },
    PngLossless,
    Gif { lossy: Option<u8> },
    WebpLossy { quality: u8 },
    WebpLossless,
    /// Keep only the code points listed in `unicodes_file`
    FontSubset {
        unicodes_file: PathBuf,
        flavor: FontFlavor,
    },
    /// Rewrite every glyph into the given container
    FontRepack { flavor: FontFlavor },
}

impl EncodeOp {
    /// Tools able to run this operation, best first
    pub fn tools(&self) -> &'static [Tool] {
        match self {
            EncodeOp::Prepare { .. } => &[Tool::Magick, Tool::Convert],
            EncodeOp::JpegLossy { .. } => &[Tool::Cjpeg],
            EncodeOp::JpegLossless => &[Tool::Jpegtran],
            EncodeOp::PngQuantize { .. } => &[Tool::Pngquant],
            EncodeOp::PngLossless => &[Tool::Oxipng],
            EncodeOp::Gif { .. } => &[Tool::Gifsicle],
            EncodeOp::WebpLossy { .. } | EncodeOp::WebpLossless => &[Tool::Cwebp],
            EncodeOp::FontSubset { .. } | EncodeOp::FontRepack { .. } => &[Tool::Pyftsubset],
        }
    }

    /// Short human label, recorded as the optimization method
    pub fn label(&self) -> String {
        match self {
            EncodeOp::Prepare { bound: Some((w, h)), .. } => format!("strip+resize {}x{}", w, h),
            EncodeOp::Prepare { bound: None, .. } => "strip".to_string(),
            EncodeOp::JpegLossy { quality } => format!("jpeg q{}", quality),
            EncodeOp::JpegLossless => "jpeg lossless".to_string(),
            EncodeOp::PngQuantize { quality } => format!("png palette q{}", quality),
            EncodeOp::PngLossless => "png lossless".to_string(),
            EncodeOp::Gif { lossy: Some(level) } => format!("gif lossy {}", level),
            EncodeOp::Gif { lossy: None } => "gif".to_string(),
            EncodeOp::WebpLossy { quality } => format!("webp q{}", quality),
            EncodeOp::WebpLossless => "webp lossless".to_string(),
            EncodeOp::FontSubset { .. } => "font subset".to_string(),
            EncodeOp::FontRepack { .. } => "font repack".to_string(),
        }
    }

    /// Whether the operation never discards pixel or glyph information
    pub fn is_lossless(&self) -> bool {
        matches!(
            self,
            EncodeOp::JpegLossless
                | EncodeOp::PngLossless
                | EncodeOp::Gif { lossy: None }
                | EncodeOp::WebpLossless
                | EncodeOp::FontRepack { .. }
        )
    }

    fn args(&self, tool: Tool, input: &str, output: &str) -> Vec<String> {
        let mut args: Vec<String> = Vec::new();
        let mut push = |items: &[&str]| args.extend(items.iter().map(|s| s.to_string()));

        match (self, tool) {
            (EncodeOp::Prepare { bound, memory_mb }, Tool::Magick | Tool::Convert) => {
                let memory = format!("{}MiB", memory_mb);
                push(&["-limit", "memory", memory.as_str(), "-limit", "thread", "1", input, "-strip"]);
                if let Some((w, h)) = bound {
                    let geometry = crate::resize::shrink_geometry(*w, *h);
                    push(&["-filter", "Lanczos", "-resize", geometry.as_str()]);
                }
                push(&["-quality", "100", output]);
            }
            (EncodeOp::JpegLossy { quality }, _) => {
                let q = quality.to_string();
                push(&["-quality", q.as_str(), "-optimize", "-progressive", "-outfile", output, input]);
            }
            (EncodeOp::JpegLossless, _) => {
                push(&["-copy", "none", "-optimize", "-progressive", "-outfile", output, input]);
            }
            (EncodeOp::PngQuantize { quality }, _) => {
                let range = format!("{}-{}", quality.saturating_sub(20), quality);
                push(&["--quality", range.as_str(), "--speed", "1", "--strip", "--force", "--output", output, input]);
            }
            (EncodeOp::PngLossless, _) => {
                push(&["-o", "4", "--strip", "safe", "--out", output, input]);
            }
            (EncodeOp::Gif { lossy }, _) => {
                push(&["-O3", "--no-comments", "--no-extensions"]);
                if let Some(level) = lossy {
                    let lossy = format!("--lossy={}", level);
                    push(&[lossy.as_str()]);
                }
                push(&["-o", output, input]);
            }
            (EncodeOp::WebpLossy { quality }, _) => {
                let q = quality.to_string();
                push(&["-q", q.as_str(), "-m", "6", "-metadata", "none", "-mt", input, "-o", output]);
            }
            (EncodeOp::WebpLossless, _) => {
                push(&["-lossless", "-z", "9", "-metadata", "none", "-mt", input, "-o", output]);
            }
            (EncodeOp::FontSubset { unicodes_file, flavor }, _) => {
                let unicodes = format!("--unicodes-file={}", unicodes_file.to_string_lossy());
                let out = format!("--output-file={}", output);
                push(&[input, unicodes.as_str(), out.as_str(), "--layout-features=*", "--drop-tables+=DSIG", "--notdef-outline"]);
                if let Some(flag) = flavor.flag() {
                    push(&[flag]);
                }
            }
            (EncodeOp::FontRepack { flavor }, _) => {
                let out = format!("--output-file={}", output);
                push(&[
                    input,
                    "--unicodes=*",
                    "--glyphs=*",
                    "--layout-features=*",
                    "--name-IDs=*",
                    "--name-languages=*",
                    "--notdef-outline",
                    "--drop-tables+=DSIG",
                    out.as_str(),
                ]);
                if let Some(flag) = flavor.flag() {
                    push(&[flag]);
                }
            }
            (EncodeOp::Prepare { .. }, _) => {}
        }
        args
    }
}

/// One encoder invocation
#[derive(Debug, Clone, PartialEq)]
pub struct EncodeJob {
    pub op: EncodeOp,
    pub input: PathBuf,
    pub output: PathBuf,
}

impl EncodeJob {
    pub fn new(op: EncodeOp, input: impl Into<PathBuf>, output: impl Into<PathBuf>) -> Self {
        Self {
            op,
            input: input.into(),
            output: output.into(),
        }
    }
}

/// Opaque encoder collaborator
#[async_trait]
pub trait Encoder: Send + Sync {
    /// Run `job`; success means `job.output` exists and is non-empty
    async fn encode(&self, job: &EncodeJob) -> Result<PathBuf, EncodeError>;

    /// Whether some backend can run `op`
    fn supports(&self, op: &EncodeOp) -> bool;
}

/// Output contract shared by every encoder
pub(crate) async fn verify_output(output: &Path, tool: &str) -> Result<PathBuf, EncodeError> {
    match tokio::fs::metadata(output).await {
        Ok(meta) if meta.len() > 0 => Ok(output.to_path_buf()),
        _ => Err(EncodeError::EmptyOutput(tool.to_string())),
    }
}

/// Encoder backed by external command-line tools
pub struct ExternalEncoder {
    resolver: Arc<ToolPathResolver>,
    timeout: Duration,
}

impl ExternalEncoder {
    pub fn new(resolver: Arc<ToolPathResolver>, timeout: Duration) -> Self {
        Self { resolver, timeout }
    }

    async fn run_tool(&self, tool: Tool, program: &Path, args: &[String]) -> Result<(), EncodeError> {
        debug!("Running {} {:?}", tool, args);
        let start = Instant::now();

        let child = Command::new(program)
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()?;

        let output = tokio::time::timeout(self.timeout, child.wait_with_output())
            .await
            .map_err(|_| EncodeError::TimedOut {
                tool: tool.to_string(),
                after: self.timeout,
            })??;

        if output.status.success() {
            debug!("{} finished in {:?}", tool, start.elapsed());
            return Ok(());
        }

        let stderr = String::from_utf8_lossy(&output.stderr);
        let stderr = stderr.trim();
        let tail: String = stderr
            .char_indices()
            .rev()
            .nth(300)
            .map(|(i, _)| stderr[i..].to_string())
            .unwrap_or_else(|| stderr.to_string());
        Err(EncodeError::Failed {
            tool: tool.to_string(),
            status: output.status.to_string(),
            stderr: tail,
        })
    }
}

#[async_trait]
impl Encoder for ExternalEncoder {
    async fn encode(&self, job: &EncodeJob) -> Result<PathBuf, EncodeError> {
        let input = job.input.to_string_lossy();
        let output = job.output.to_string_lossy();
        let mut last_error = None;

        for &tool in job.op.tools() {
            let Some(program) = self.resolver.resolve_tool(tool) else {
                continue;
            };
            let args = job.op.args(tool, &input, &output);
            match self.run_tool(tool, &program, &args).await {
                Ok(()) => return verify_output(&job.output, tool.binary()).await,
                Err(e) => {
                    warn!("{} failed on {}: {}", tool, job.input.display(), e);
                    last_error = Some(e);
                }
            }
        }

        Err(last_error.unwrap_or_else(|| {
            let names: Vec<&str> = job.op.tools().iter().map(|t| t.binary()).collect();
            EncodeError::Unavailable(names.join("/"))
        }))
    }

    fn supports(&self, op: &EncodeOp) -> bool {
        op.tools().iter().any(|tool| self.resolver.is_tool_available(*tool))
    }
}
