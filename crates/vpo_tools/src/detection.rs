//! Tool discovery and capability enumeration.
//!
//! Runs once at startup: locate each tool on PATH (or at a configured
//! path), parse its version banner, and for ffmpeg enumerate the available
//! encoders and muxers so the planner can check encoder availability
//! without spawning anything.

use std::collections::HashMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;

use regex::Regex;
use tokio::process::Command;
use tracing::{debug, warn};

use crate::error::ToolError;

/// Timeout for version/capability detection commands.
const DETECTION_TIMEOUT: Duration = Duration::from_secs(10);

/// The four tool roles the orchestrator consumes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ToolKind {
    Ffprobe,
    Ffmpeg,
    Mkvmerge,
    Mkvpropedit,
}

impl ToolKind {
    pub fn binary_name(&self) -> &'static str {
        match self {
            Self::Ffprobe => "ffprobe",
            Self::Ffmpeg => "ffmpeg",
            Self::Mkvmerge => "mkvmerge",
            Self::Mkvpropedit => "mkvpropedit",
        }
    }

    /// ffmpeg-family tools take `-version`; the MKVToolNix pair takes
    /// `--version`.
    fn version_flag(&self) -> &'static str {
        match self {
            Self::Ffprobe | Self::Ffmpeg => "-version",
            Self::Mkvmerge | Self::Mkvpropedit => "--version",
        }
    }

    /// What the tool is used for; shows up in "tool missing" errors.
    pub fn purpose(&self) -> &'static str {
        match self {
            Self::Ffprobe => "container and track introspection",
            Self::Ffmpeg => "transcoding and non-Matroska remuxing",
            Self::Mkvmerge => "Matroska remuxing and track filtering",
            Self::Mkvpropedit => "in-place metadata editing",
        }
    }
}

impl fmt::Display for ToolKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.binary_name())
    }
}

/// One discovered tool.
#[derive(Debug, Clone)]
pub struct ToolInfo {
    pub path: PathBuf,
    pub version: Option<Vec<u32>>,
}

/// ffmpeg capabilities enumerated at startup.
#[derive(Debug, Clone, Default)]
pub struct FfmpegCapabilities {
    pub encoders: Vec<String>,
    pub muxers: Vec<String>,
}

impl FfmpegCapabilities {
    pub fn has_encoder(&self, name: &str) -> bool {
        self.encoders.iter().any(|e| e == name)
    }
}

/// Everything discovered about the installed tools.
#[derive(Debug, Clone, Default)]
pub struct ToolRegistry {
    tools: HashMap<ToolKind, ToolInfo>,
    pub capabilities: Option<FfmpegCapabilities>,
}

impl ToolRegistry {
    pub fn get(&self, kind: ToolKind) -> Option<&ToolInfo> {
        self.tools.get(&kind)
    }

    /// Path of a tool, or a [`ToolError::NotAvailable`] naming its purpose.
    pub fn require(&self, kind: ToolKind) -> Result<&Path, ToolError> {
        self.tools
            .get(&kind)
            .map(|info| info.path.as_path())
            .ok_or_else(|| ToolError::not_available(kind.binary_name(), kind.purpose()))
    }

    pub fn insert(&mut self, kind: ToolKind, info: ToolInfo) {
        self.tools.insert(kind, info);
    }

    /// Encoder names, when ffmpeg capability discovery ran.
    pub fn encoder_names(&self) -> Option<Vec<String>> {
        self.capabilities.as_ref().map(|c| c.encoders.clone())
    }
}

/// Parse a version banner fragment into comparable components.
/// Handles `6.1.1`, `n6.1.1` (ffmpeg nightlies) and `v81.0`.
pub fn parse_version(raw: &str) -> Option<Vec<u32>> {
    let trimmed = raw.trim().trim_start_matches(['n', 'v']);
    let re = Regex::new(r"^(\d+(?:\.\d+)*)").ok()?;
    let captures = re.captures(trimmed)?;
    captures[1]
        .split('.')
        .map(|part| part.parse().ok())
        .collect()
}

async fn run_detection(path: &Path, args: &[&str]) -> Result<String, ToolError> {
    let tool = path.display().to_string();
    let output = tokio::time::timeout(
        DETECTION_TIMEOUT,
        Command::new(path).args(args).output(),
    )
    .await
    .map_err(|_| ToolError::Timeout {
        tool: tool.clone(),
        seconds: DETECTION_TIMEOUT.as_secs(),
    })?
    .map_err(|e| ToolError::io(tool, e))?;

    Ok(String::from_utf8_lossy(&output.stdout).into_owned())
}

fn extract_banner_version(banner: &str) -> Option<Vec<u32>> {
    // "ffmpeg version 6.1.1 ..." / "mkvmerge v81.0 ('...') ..."
    banner
        .split_whitespace()
        .skip_while(|word| !word.starts_with(|c: char| c.is_ascii_digit() || c == 'n' || c == 'v'))
        .find_map(parse_version)
}

async fn detect_one(kind: ToolKind, configured: Option<&Path>) -> Option<ToolInfo> {
    let path = match configured {
        Some(path) if path.exists() => path.to_path_buf(),
        _ => which::which(kind.binary_name()).ok()?,
    };

    let version = match run_detection(&path, &[kind.version_flag()]).await {
        Ok(banner) => extract_banner_version(&banner),
        Err(e) => {
            warn!("version detection for {kind} failed: {e}");
            None
        }
    };

    debug!("detected {kind} at {} (version {version:?})", path.display());
    Some(ToolInfo { path, version })
}

/// Parse `ffmpeg -encoders` output: skip the header, take the second column.
fn parse_capability_listing(output: &str) -> Vec<String> {
    output
        .lines()
        .skip_while(|line| !line.trim_start().starts_with("---"))
        .skip(1)
        .filter_map(|line| line.split_whitespace().nth(1))
        .map(|name| name.to_string())
        .collect()
}

async fn detect_capabilities(ffmpeg: &Path) -> FfmpegCapabilities {
    let mut capabilities = FfmpegCapabilities::default();
    match run_detection(ffmpeg, &["-hide_banner", "-encoders"]).await {
        Ok(output) => capabilities.encoders = parse_capability_listing(&output),
        Err(e) => warn!("encoder enumeration failed: {e}"),
    }
    match run_detection(ffmpeg, &["-hide_banner", "-muxers"]).await {
        Ok(output) => capabilities.muxers = parse_capability_listing(&output),
        Err(e) => warn!("muxer enumeration failed: {e}"),
    }
    capabilities
}

/// Discover all tools. Missing tools are simply absent from the registry;
/// callers get a specific error from [`ToolRegistry::require`] at use time.
pub async fn detect_tools() -> ToolRegistry {
    let mut registry = ToolRegistry::default();

    for kind in [
        ToolKind::Ffprobe,
        ToolKind::Ffmpeg,
        ToolKind::Mkvmerge,
        ToolKind::Mkvpropedit,
    ] {
        if let Some(info) = detect_one(kind, None).await {
            registry.insert(kind, info);
        }
    }

    if let Some(ffmpeg) = registry.get(ToolKind::Ffmpeg).map(|i| i.path.clone()) {
        registry.capabilities = Some(detect_capabilities(&ffmpeg).await);
    }

    registry
}
