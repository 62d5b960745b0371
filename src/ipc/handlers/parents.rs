use crate::ipc::error::{err, ok};
use crate::ipc::helpers::{
    bad_params, conflict, get_required_str, profile_image, store_read, store_write, username_taken,
    now_iso, HandlerErr,
};
use crate::ipc::types::{AppState, Request};
use crate::store::{self, Tree};
use serde_json::json;

fn string_list(params: &serde_json::Value, key: &str) -> Result<Vec<String>, HandlerErr> {
    let Some(raw) = params.get(key).and_then(|v| v.as_array()) else {
        return Err(bad_params(format!("missing {}", key)));
    };
    raw.iter()
        .map(|v| {
            v.as_str()
                .map(str::to_string)
                .ok_or_else(|| bad_params(format!("{} must contain strings", key)))
        })
        .collect()
}

fn register(tree: &Tree, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let name = get_required_str(params, "name")?;
    let username = get_required_str(params, "username")?;
    let phone = get_required_str(params, "phone")?;
    let password = get_required_str(params, "password")?;
    let profile_url = profile_image(params);

    let student_ids = string_list(params, "studentIds")?;
    let relationships = string_list(params, "relationships")?;
    if student_ids.is_empty() {
        return Err(bad_params("at least one studentId is required"));
    }
    if student_ids.len() != relationships.len() {
        return Err(bad_params("Each student must have a relationship"));
    }

    if username_taken(tree, &username)? {
        return Err(conflict("Username already exists"));
    }

    let parent_user_id = store::push_key();
    tree.set(
        &format!("Users/{parent_user_id}"),
        &json!({
            "userId": parent_user_id,
            "username": username,
            "phone": phone,
            "name": name,
            "password": password,
            "role": "parent",
            "profileImage": profile_url,
            "isActive": true
        }),
    )
    .map_err(store_write)?;

    let parent_id = tree
        .push(
            "Parents",
            &json!({
                "userId": parent_user_id,
                "status": "active",
                "createdAt": now_iso()
            }),
        )
        .map_err(store_write)?;

    // Link children both ways; unknown studentIds are skipped, not fatal.
    let mut linked = 0;
    for (student_id, relationship) in student_ids.iter().zip(&relationships) {
        let student_path = format!("Students/{student_id}");
        if !tree.exists(&student_path).map_err(store_read)? {
            tracing::warn!(%student_id, "parent registration references unknown student");
            continue;
        }
        tree.push(
            &format!("Parents/{parent_id}/children"),
            &json!({
                "studentId": student_id,
                "relationship": relationship
            }),
        )
        .map_err(store_write)?;
        tree.set(
            &format!("{student_path}/parents/{parent_id}"),
            &json!({ "relationship": relationship }),
        )
        .map_err(store_write)?;
        linked += 1;
    }

    Ok(json!({
        "message": "Parent registered successfully",
        "parentId": parent_id,
        "parentUserId": parent_user_id,
        "linkedChildren": linked
    }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "parents.register" => {
            let Some(tree) = state.store.as_ref() else {
                return Some(err(&req.id, "no_workspace", "select a workspace first", None));
            };
            Some(match register(tree, &req.params) {
                Ok(result) => ok(&req.id, result),
                Err(e) => e.response(&req.id),
            })
        }
        _ => None,
    }
}
