//! The workspace-visibility map and the sway IPC payload handlers.
//!
//! One entry per (workspace, output) pair currently visible, kept in the
//! order of the last GET_WORKSPACES reply. Entries match on name OR
//! output so that focus changes and moves reuse the stale entry.

use serde::Deserialize;

use crate::config::activate_workspace;
use crate::error::WsbgError;
use crate::output::Output;

#[derive(Debug, PartialEq, Eq)]
pub struct Workspace {
    pub name: String,
    pub output: String,
}

/// Record that `name` is now visible on `output`, reusing a matching
/// entry from `workspaces[start..]`. The entry is (re)inserted at
/// `start`; the returned index is where the next snapshot entry goes.
pub fn update_workspace(
    workspaces: &mut Vec<Workspace>,
    start: usize,
    name: &str,
    output: &str,
    outputs: &mut [Output],
) -> usize {
    let mut entry = None;
    for index in start..workspaces.len() {
        let name_matches = workspaces[index].name == name;
        let output_matches = workspaces[index].output == output;
        if !name_matches && !output_matches {
            continue;
        }
        let existing = workspaces.remove(index);
        // A full match means nothing became visible that wasn't already.
        let changed = !name_matches || !output_matches;
        entry = Some((existing, changed));
        break;
    }

    let (mut workspace, changed) = entry.unwrap_or_else(|| {
        (
            Workspace {
                name: String::new(),
                output: String::new(),
            },
            true,
        )
    });

    if changed {
        workspace.name = name.to_string();
        workspace.output = output.to_string();
        apply_visibility(outputs, name, output);
    }

    workspaces.insert(start, workspace);
    start + 1
}

/// Walk the config list of the named output and move its active config
/// to the one matching the now-visible workspace (or the default),
/// setting `config_change` when it actually moves.
pub fn apply_visibility(outputs: &mut [Output], workspace: &str, output_name: &str) {
    for output in outputs.iter_mut() {
        if output.name.as_deref() != Some(output_name) {
            continue;
        }
        if let Some(active) = output.active {
            let (new_active, changed) = activate_workspace(&output.configs, active, workspace);
            output.active = Some(new_active);
            output.config_change = output.config_change || changed;
        }
        break;
    }
}

#[derive(Deserialize)]
struct WorkspaceInfo {
    name: Option<String>,
    output: Option<String>,
    #[serde(default)]
    visible: bool,
}

/// Rebuild the visibility list from a GET_WORKSPACES reply, preserving
/// reply order and dropping entries no longer mentioned.
pub fn handle_workspaces_reply(
    payload: &[u8],
    workspaces: &mut Vec<Workspace>,
    outputs: &mut [Output],
) -> Result<(), WsbgError> {
    let reply: Vec<WorkspaceInfo> =
        serde_json::from_slice(payload).map_err(|e| WsbgError::IpcProtocol(e.to_string()))?;

    let mut last = 0;
    for info in reply {
        let (name, output) = match (info.name, info.output) {
            (Some(name), Some(output)) if info.visible => (name, output),
            _ => continue,
        };
        last = update_workspace(workspaces, last, &name, &output, outputs);
    }
    workspaces.truncate(last);
    Ok(())
}

#[derive(Deserialize)]
struct WorkspaceEvent {
    change: Option<String>,
    current: Option<WorkspaceInfo>,
}

/// Apply a single workspace event. Only changes that move visibility
/// are interesting; everything else is ignored.
pub fn handle_workspace_event(
    payload: &[u8],
    workspaces: &mut Vec<Workspace>,
    outputs: &mut [Output],
) -> Result<(), WsbgError> {
    let event: WorkspaceEvent =
        serde_json::from_slice(payload).map_err(|e| WsbgError::IpcProtocol(e.to_string()))?;

    match event.change.as_deref() {
        Some("init" | "focus" | "move" | "rename") => {}
        _ => return Ok(()),
    }
    if let Some(current) = event.current {
        if let (Some(name), Some(output)) = (current.name, current.output) {
            update_workspace(workspaces, 0, &name, &output, outputs);
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn names(workspaces: &[Workspace]) -> Vec<(&str, &str)> {
        workspaces
            .iter()
            .map(|w| (w.name.as_str(), w.output.as_str()))
            .collect()
    }

    #[test]
    fn test_update_inserts_and_reuses() {
        let mut workspaces = Vec::new();
        update_workspace(&mut workspaces, 0, "1", "eDP-1", &mut []);
        assert_eq!(names(&workspaces), [("1", "eDP-1")]);

        // Focus moved to another workspace on the same output.
        update_workspace(&mut workspaces, 0, "2", "eDP-1", &mut []);
        assert_eq!(names(&workspaces), [("2", "eDP-1")]);

        // A workspace moved to another output.
        update_workspace(&mut workspaces, 0, "2", "HDMI-A-1", &mut []);
        assert_eq!(names(&workspaces), [("2", "HDMI-A-1")]);

        // Unrelated pair gets its own entry.
        update_workspace(&mut workspaces, 0, "5", "DP-2", &mut []);
        assert_eq!(names(&workspaces), [("5", "DP-2"), ("2", "HDMI-A-1")]);
    }

    #[test]
    fn test_snapshot_rebuild_preserves_order_and_drops_stale() {
        let mut workspaces = vec![
            Workspace { name: "9".into(), output: "OLD".into() },
            Workspace { name: "1".into(), output: "eDP-1".into() },
        ];
        let payload = br#"[
            {"name": "1", "output": "eDP-1", "visible": true},
            {"name": "2", "output": "eDP-1", "visible": false},
            {"name": "3", "output": "HDMI-A-1", "visible": true, "focused": true}
        ]"#;
        handle_workspaces_reply(payload, &mut workspaces, &mut []).unwrap();
        assert_eq!(names(&workspaces), [("1", "eDP-1"), ("3", "HDMI-A-1")]);
    }

    #[test]
    fn test_reply_must_be_a_list() {
        let mut workspaces = Vec::new();
        let err = handle_workspaces_reply(b"{}", &mut workspaces, &mut []);
        assert!(matches!(err, Err(WsbgError::IpcProtocol(_))));
    }

    #[test]
    fn test_event_filters_change_kind() {
        let mut workspaces = Vec::new();
        let focus =
            br#"{"change": "focus", "current": {"name": "2", "output": "HDMI-A-1"}}"#;
        handle_workspace_event(focus, &mut workspaces, &mut []).unwrap();
        assert_eq!(names(&workspaces), [("2", "HDMI-A-1")]);

        // An "urgent" change carries no visibility information.
        let urgent =
            br#"{"change": "urgent", "current": {"name": "7", "output": "HDMI-A-1"}}"#;
        handle_workspace_event(urgent, &mut workspaces, &mut []).unwrap();
        assert_eq!(names(&workspaces), [("2", "HDMI-A-1")]);
    }

    #[test]
    fn test_event_with_malformed_json_is_an_error() {
        let mut workspaces = Vec::new();
        let err = handle_workspace_event(b"{not json", &mut workspaces, &mut []);
        assert!(matches!(err, Err(WsbgError::IpcProtocol(_))));
        assert!(workspaces.is_empty());
    }
}
