use crate::idgen::{self, RecordKind, TreeCounter, TreeDirectory};
use crate::ipc::error::{err, ok};
use crate::ipc::types::{AppState, Request};
use crate::store;
use serde_json::json;
use std::path::PathBuf;

fn handle_health(state: &mut AppState, req: &Request) -> serde_json::Value {
    ok(
        &req.id,
        json!({
            "version": env!("CARGO_PKG_VERSION"),
            "workspacePath": state.workspace.as_ref().map(|p| p.to_string_lossy().to_string())
        }),
    )
}

fn handle_workspace_select(state: &mut AppState, req: &Request) -> serde_json::Value {
    let p = req
        .params
        .get("path")
        .and_then(|v| v.as_str())
        .map(PathBuf::from);
    let Some(path) = p else {
        return err(&req.id, "bad_params", "missing params.path", None);
    };

    match store::open_store(&path) {
        Ok(tree) => {
            // One-time repair pass: a counter that drifted behind the ids
            // already on disk is raised before any allocation happens.
            for kind in [RecordKind::Student, RecordKind::Teacher] {
                let counter = TreeCounter::new(&tree, kind);
                let directory = TreeDirectory::new(&tree, kind);
                idgen::reconcile_counter(kind, &counter, &directory);
            }

            state.workspace = Some(path.clone());
            state.store = Some(tree);
            ok(&req.id, json!({ "workspacePath": path.to_string_lossy() }))
        }
        Err(e) => err(&req.id, "store_open_failed", format!("{e:?}"), None),
    }
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "health" => Some(handle_health(state, req)),
        "workspace.select" => Some(handle_workspace_select(state, req)),
        _ => None,
    }
}
