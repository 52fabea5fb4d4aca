//! Adapter selection.
//!
//! Exactly one tool executes a plan's file mutation. Selection is by
//! capability, in priority order: container change → remux; track removal
//! → remux (Matroska requires mkvmerge, anything else ffmpeg); reorder →
//! mkvmerge; metadata-only → mkvpropedit in place. Each step checks the
//! required tool is actually installed before committing to it.

use crate::detection::{ToolKind, ToolRegistry};
use crate::error::ToolError;

/// The aspects of a plan that matter for routing.
#[derive(Debug, Clone, Copy, Default)]
pub struct PlanShape {
    pub changes_container: bool,
    pub removes_tracks: bool,
    pub reorders_tracks: bool,
    pub edits_metadata: bool,
}

/// Chosen tool and the reason it was chosen.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Route {
    pub tool: ToolKind,
    pub reason: &'static str,
}

fn is_matroska(container: &str) -> bool {
    let lowered = container.to_ascii_lowercase();
    lowered.contains("matroska") || lowered == "mkv" || lowered == "webm"
}

/// Pick the tool for a plan. `target_container` is the container after the
/// operation (the current one when the plan does not change it).
pub fn select_route(
    registry: &ToolRegistry,
    shape: PlanShape,
    target_container: &str,
) -> Result<Route, ToolError> {
    let matroska = is_matroska(target_container);

    if shape.changes_container || shape.removes_tracks {
        let tool = if matroska {
            ToolKind::Mkvmerge
        } else {
            ToolKind::Ffmpeg
        };
        registry.require(tool)?;
        let reason = if shape.changes_container {
            "container change requires a remux"
        } else {
            "track removal requires a remux"
        };
        return Ok(Route { tool, reason });
    }

    if shape.reorders_tracks {
        registry.require(ToolKind::Mkvmerge)?;
        return Ok(Route {
            tool: ToolKind::Mkvmerge,
            reason: "track reordering requires a remux",
        });
    }

    registry.require(ToolKind::Mkvpropedit)?;
    Ok(Route {
        tool: ToolKind::Mkvpropedit,
        reason: "metadata-only change edits in place",
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::detection::ToolInfo;
    use std::path::PathBuf;

    fn registry_with(kinds: &[ToolKind]) -> ToolRegistry {
        let mut registry = ToolRegistry::default();
        for kind in kinds {
            registry.insert(
                *kind,
                ToolInfo {
                    path: PathBuf::from(format!("/usr/bin/{}", kind.binary_name())),
                    version: None,
                },
            );
        }
        registry
    }

    #[test]
    fn container_change_routes_to_remuxer_for_target() {
        let registry = registry_with(&[ToolKind::Mkvmerge, ToolKind::Ffmpeg]);
        let shape = PlanShape {
            changes_container: true,
            ..Default::default()
        };
        assert_eq!(
            select_route(&registry, shape, "matroska").unwrap().tool,
            ToolKind::Mkvmerge
        );
        assert_eq!(
            select_route(&registry, shape, "mp4").unwrap().tool,
            ToolKind::Ffmpeg
        );
    }

    #[test]
    fn track_removal_in_mkv_requires_mkvmerge() {
        let registry = registry_with(&[ToolKind::Ffmpeg]);
        let shape = PlanShape {
            removes_tracks: true,
            ..Default::default()
        };
        let err = select_route(&registry, shape, "matroska").unwrap_err();
        assert!(err.to_string().contains("mkvmerge"));
    }

    #[test]
    fn reorder_routes_to_mkvmerge() {
        let registry = registry_with(&[ToolKind::Mkvmerge]);
        let shape = PlanShape {
            reorders_tracks: true,
            ..Default::default()
        };
        assert_eq!(
            select_route(&registry, shape, "matroska").unwrap().tool,
            ToolKind::Mkvmerge
        );
    }

    #[test]
    fn metadata_only_routes_to_editor() {
        let registry = registry_with(&[ToolKind::Mkvpropedit]);
        let shape = PlanShape {
            edits_metadata: true,
            ..Default::default()
        };
        let route = select_route(&registry, shape, "matroska").unwrap();
        assert_eq!(route.tool, ToolKind::Mkvpropedit);
    }

    #[test]
    fn missing_editor_surfaces_specific_error() {
        let registry = registry_with(&[]);
        let err = select_route(&registry, PlanShape::default(), "matroska").unwrap_err();
        let message = err.to_string();
        assert!(message.contains("mkvpropedit"));
        assert!(message.contains("in-place"));
    }
}
