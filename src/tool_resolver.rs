//! # Tool Path Resolver
//!
//! Trova i binari degli encoder esterni.
//!
//! ## Strategia di ricerca:
//! 1. Directory indicata da `EPUB_OPTIMIZER_TOOLS_DIR` (tool bundled), anche in
//!    sottocartelle `<dir>/<tool>/<tool>`
//! 2. `PATH` di sistema
//!
//! Su Windows viene aggiunto il suffisso `.exe`. Ogni resolver ha una cache propria
//! (nessuno stato globale): il risultato di una ricerca vale per tutta la sua vita.

use std::collections::HashMap;
use std::env;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use tracing::debug;

/// Environment variable pointing at a directory of bundled tools
pub const TOOLS_DIR_ENV: &str = "EPUB_OPTIMIZER_TOOLS_DIR";

/// Encoder binaries the optimizer knows how to drive
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Tool {
    Magick,
    Convert,
    Cjpeg,
    Jpegtran,
    Pngquant,
    Oxipng,
    Gifsicle,
    Cwebp,
    Pyftsubset,
}

impl Tool {
    pub const ALL: [Tool; 9] = [
        Tool::Magick,
        Tool::Convert,
        Tool::Cjpeg,
        Tool::Jpegtran,
        Tool::Pngquant,
        Tool::Oxipng,
        Tool::Gifsicle,
        Tool::Cwebp,
        Tool::Pyftsubset,
    ];

    pub fn binary(&self) -> &'static str {
        match self {
            Tool::Magick => "magick",
            Tool::Convert => "convert",
            Tool::Cjpeg => "cjpeg",
            Tool::Jpegtran => "jpegtran",
            Tool::Pngquant => "pngquant",
            Tool::Oxipng => "oxipng",
            Tool::Gifsicle => "gifsicle",
            Tool::Cwebp => "cwebp",
            Tool::Pyftsubset => "pyftsubset",
        }
    }

    fn group(&self) -> &'static str {
        match self {
            Tool::Magick | Tool::Convert => "Strip/resize",
            Tool::Cjpeg | Tool::Jpegtran => "JPEG",
            Tool::Pngquant | Tool::Oxipng => "PNG",
            Tool::Gifsicle => "GIF",
            Tool::Cwebp => "WebP",
            Tool::Pyftsubset => "Fonts",
        }
    }

    fn install_hint(&self) -> &'static str {
        match self {
            Tool::Magick | Tool::Convert => "sudo apt-get install imagemagick",
            Tool::Cjpeg => "install mozjpeg (provides cjpeg with JPEG input)",
            Tool::Jpegtran => "sudo apt-get install libjpeg-turbo-progs",
            Tool::Pngquant => "sudo apt-get install pngquant",
            Tool::Oxipng => "cargo install oxipng",
            Tool::Gifsicle => "sudo apt-get install gifsicle",
            Tool::Cwebp => "sudo apt-get install webp",
            Tool::Pyftsubset => "pip install fonttools brotli",
        }
    }
}

impl fmt::Display for Tool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.binary())
    }
}

/// Tool path resolver with a per-instance cache
#[derive(Debug)]
pub struct ToolPathResolver {
    tools_dir: Option<PathBuf>,
    search_path: Vec<PathBuf>,
    cache: Mutex<HashMap<Tool, Option<PathBuf>>>,
}

impl ToolPathResolver {
    /// Resolver configured from the process environment
    pub fn new() -> Self {
        let tools_dir = env::var_os(TOOLS_DIR_ENV)
            .map(PathBuf::from)
            .filter(|dir| dir.is_dir());
        if let Some(dir) = &tools_dir {
            debug!("Bundled tools directory: {:?}", dir);
        }

        let search_path = env::var_os("PATH")
            .map(|paths| env::split_paths(&paths).collect())
            .unwrap_or_default();

        Self::with_dirs(tools_dir, search_path)
    }

    pub fn with_dirs(tools_dir: Option<PathBuf>, search_path: Vec<PathBuf>) -> Self {
        Self {
            tools_dir,
            search_path,
            cache: Mutex::new(HashMap::new()),
        }
    }

    /// Resolve the path to a specific tool
    pub fn resolve_tool(&self, tool: Tool) -> Option<PathBuf> {
        let mut cache = self
            .cache
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        if let Some(cached) = cache.get(&tool) {
            return cached.clone();
        }

        let resolved = self.lookup(tool);
        match &resolved {
            Some(path) => debug!("Resolved {} -> {:?}", tool, path),
            None => debug!("Tool not found: {}", tool),
        }
        cache.insert(tool, resolved.clone());
        resolved
    }

    fn lookup(&self, tool: Tool) -> Option<PathBuf> {
        let file_name = executable_name(tool.binary());

        if let Some(dir) = &self.tools_dir {
            let candidates = [dir.join(&file_name), dir.join(tool.binary()).join(&file_name)];
            if let Some(found) = candidates.into_iter().find(|p| is_executable(p)) {
                return Some(found);
            }
        }

        self.search_path
            .iter()
            .map(|dir| dir.join(&file_name))
            .find(|p| is_executable(p))
    }

    pub fn is_tool_available(&self, tool: Tool) -> bool {
        self.resolve_tool(tool).is_some()
    }

    pub fn get_available_tools(&self) -> Vec<Tool> {
        Tool::ALL
            .into_iter()
            .filter(|tool| self.is_tool_available(*tool))
            .collect()
    }

    /// Check if a tool is available and provide installation instructions if not
    pub fn check_tool_with_instructions(&self, tool: Tool) -> Result<PathBuf, String> {
        self.resolve_tool(tool).ok_or_else(|| {
            format!(
                "Tool '{}' not found (searched {} and PATH). To install: {}",
                tool,
                TOOLS_DIR_ENV,
                tool.install_hint()
            )
        })
    }

    /// Get a report of tool availability
    pub fn tools_report(&self) -> String {
        let mut report = String::from("Encoder tool availability\n");
        match &self.tools_dir {
            Some(dir) => report.push_str(&format!("Bundled tools dir: {:?}\n", dir)),
            None => report.push_str(&format!("Bundled tools dir: none ({} unset)\n", TOOLS_DIR_ENV)),
        }

        let mut current_group = "";
        for tool in Tool::ALL {
            if tool.group() != current_group {
                current_group = tool.group();
                report.push_str(&format!("\n{}:\n", current_group));
            }
            match self.resolve_tool(tool) {
                Some(path) => report.push_str(&format!("  ✅ {} -> {:?}\n", tool, path)),
                None => report.push_str(&format!("  ❌ {} (install with: {})\n", tool, tool.install_hint())),
            }
        }
        report
    }
}

impl Default for ToolPathResolver {
    fn default() -> Self {
        Self::new()
    }
}

fn executable_name(binary: &str) -> String {
    if cfg!(windows) {
        format!("{}.exe", binary)
    } else {
        binary.to_string()
    }
}

fn is_executable(path: &Path) -> bool {
    path.is_file()
}
