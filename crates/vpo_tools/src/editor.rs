//! In-place metadata editing via mkvpropedit.
//!
//! Flag, language and title changes rewrite container headers without
//! repacking streams. mkvpropedit addresses tracks 1-based in container
//! order; `track_index` here is the zero-based index used everywhere else.

use std::path::Path;
use std::time::Duration;

use crate::detection::{ToolKind, ToolRegistry};
use crate::error::ToolError;
use crate::exec::{run_tool, ToolOutput};

const EDIT_TIMEOUT: Duration = Duration::from_secs(120);

/// One track's pending header edits.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MetadataEdit {
    pub track_index: i64,
    pub set_default: Option<bool>,
    pub set_forced: Option<bool>,
    pub set_language: Option<String>,
    pub set_title: Option<String>,
}

impl MetadataEdit {
    pub fn is_empty(&self) -> bool {
        self.set_default.is_none()
            && self.set_forced.is_none()
            && self.set_language.is_none()
            && self.set_title.is_none()
    }
}

/// Build the mkvpropedit argument list for a set of edits.
pub fn build_mkvpropedit_args(path: &Path, edits: &[MetadataEdit]) -> Vec<String> {
    let mut args = vec![path.to_string_lossy().into_owned()];

    for edit in edits {
        if edit.is_empty() {
            continue;
        }
        args.push("--edit".to_string());
        args.push(format!("track:@{}", edit.track_index + 1));
        if let Some(value) = edit.set_default {
            args.push("--set".to_string());
            args.push(format!("flag-default={}", value as u8));
        }
        if let Some(value) = edit.set_forced {
            args.push("--set".to_string());
            args.push(format!("flag-forced={}", value as u8));
        }
        if let Some(language) = &edit.set_language {
            args.push("--set".to_string());
            args.push(format!("language={language}"));
        }
        if let Some(title) = &edit.set_title {
            args.push("--set".to_string());
            args.push(format!("name={title}"));
        }
    }

    args
}

/// Apply edits in place. Returns the captured output for the job log.
pub async fn apply_metadata_edits(
    registry: &ToolRegistry,
    path: &Path,
    edits: &[MetadataEdit],
) -> Result<ToolOutput, ToolError> {
    let tool = registry.require(ToolKind::Mkvpropedit)?;
    let args = build_mkvpropedit_args(path, edits);
    run_tool("mkvpropedit", tool, &args, EDIT_TIMEOUT).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    #[test]
    fn args_address_tracks_one_based() {
        let edits = vec![MetadataEdit {
            track_index: 1,
            set_default: Some(true),
            set_forced: Some(false),
            ..Default::default()
        }];
        let args = build_mkvpropedit_args(&PathBuf::from("/m/f.mkv"), &edits);
        assert_eq!(
            args,
            vec![
                "/m/f.mkv",
                "--edit",
                "track:@2",
                "--set",
                "flag-default=1",
                "--set",
                "flag-forced=0",
            ]
        );
    }

    #[test]
    fn language_and_title_edits() {
        let edits = vec![MetadataEdit {
            track_index: 0,
            set_language: Some("deu".to_string()),
            set_title: Some("German".to_string()),
            ..Default::default()
        }];
        let args = build_mkvpropedit_args(&PathBuf::from("/m/f.mkv"), &edits);
        assert!(args.contains(&"language=deu".to_string()));
        assert!(args.contains(&"name=German".to_string()));
    }

    #[test]
    fn empty_edits_are_skipped() {
        let edits = vec![MetadataEdit::default()];
        let args = build_mkvpropedit_args(&PathBuf::from("/m/f.mkv"), &edits);
        assert_eq!(args, vec!["/m/f.mkv"]);
    }
}
