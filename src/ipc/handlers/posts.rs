use crate::ipc::error::{err, ok};
use crate::ipc::helpers::{
    get_required_str, get_optional_str, not_found, store_read, store_write, now_iso, HandlerErr,
    DEFAULT_PROFILE_IMAGE,
};
use crate::ipc::types::{AppState, Request};
use crate::store::Tree;
use serde_json::{json, Map, Value};

fn create(tree: &Tree, params: &Value) -> Result<Value, HandlerErr> {
    let admin_id = get_required_str(params, "adminId")?;
    let message = get_required_str(params, "message")?;
    let post_url = get_optional_str(params, "postUrl");

    let post_id = tree
        .push(
            "Posts",
            &json!({
                "adminId": admin_id,
                "message": message,
                "postUrl": post_url,
                "time": now_iso(),
                "likeCount": 0,
                "likes": {}
            }),
        )
        .map_err(store_write)?;

    Ok(json!({ "postId": post_id }))
}

/// Feed view: every post joined with its author's account, newest first.
fn list(tree: &Tree, _params: &Value) -> Result<Value, HandlerErr> {
    let mut out = Vec::new();
    for (post_id, post) in tree.children("Posts").map_err(store_read)? {
        let admin_id = post.get("adminId").and_then(|v| v.as_str()).unwrap_or("");
        let user = if admin_id.is_empty() {
            None
        } else {
            tree.get(&format!("Users/{admin_id}")).map_err(store_read)?
        };
        let user = user.unwrap_or_else(|| json!({}));

        out.push(json!({
            "postId": post_id,
            "adminId": admin_id,
            "adminName": user.get("name").and_then(|v| v.as_str()).unwrap_or("Admin"),
            "adminProfile": user
                .get("profileImage")
                .and_then(|v| v.as_str())
                .unwrap_or(DEFAULT_PROFILE_IMAGE),
            "message": post.get("message").and_then(|v| v.as_str()).unwrap_or(""),
            "postUrl": post.get("postUrl").cloned().unwrap_or(Value::Null),
            "timestamp": post.get("time").and_then(|v| v.as_str()).unwrap_or(""),
            "likeCount": post.get("likeCount").cloned().unwrap_or(json!(0)),
            "likes": post.get("likes").cloned().unwrap_or_else(|| json!({}))
        }));
    }

    out.sort_by(|a, b| {
        let ta = a["timestamp"].as_str().unwrap_or("");
        let tb = b["timestamp"].as_str().unwrap_or("");
        tb.cmp(ta)
    });
    Ok(json!({ "posts": out }))
}

fn like(tree: &Tree, params: &Value) -> Result<Value, HandlerErr> {
    let post_id = get_required_str(params, "postId")?;
    let teacher_id = get_required_str(params, "teacherId")?;

    let post_path = format!("Posts/{post_id}");
    let Some(post) = tree.get(&post_path).map_err(store_read)? else {
        return Err(not_found("Post not found"));
    };

    let mut likes = match post.get("likes") {
        Some(Value::Object(m)) => m.clone(),
        _ => Map::new(),
    };
    let liked = if likes.contains_key(&teacher_id) {
        likes.remove(&teacher_id);
        false
    } else {
        likes.insert(teacher_id.clone(), json!(true));
        true
    };
    let like_count = likes.len();

    let mut patch = Map::new();
    patch.insert("likes".to_string(), Value::Object(likes));
    patch.insert("likeCount".to_string(), json!(like_count));
    tree.update(&post_path, &patch).map_err(store_write)?;

    Ok(json!({ "likeCount": like_count, "liked": liked }))
}

fn mark_seen(tree: &Tree, params: &Value) -> Result<Value, HandlerErr> {
    let post_id = get_required_str(params, "postId")?;
    let teacher_id = get_required_str(params, "teacherId")?;

    let post_path = format!("Posts/{post_id}");
    let Some(post) = tree.get(&post_path).map_err(store_read)? else {
        return Err(not_found("Post not found"));
    };

    let mut seen_by = match post.get("seenBy") {
        Some(Value::Object(m)) => m.clone(),
        _ => Map::new(),
    };
    seen_by.insert(teacher_id, json!(true));

    let mut patch = Map::new();
    patch.insert("seenBy".to_string(), Value::Object(seen_by));
    tree.update(&post_path, &patch).map_err(store_write)?;

    Ok(json!({ "seen": true }))
}

fn handle(
    state: &mut AppState,
    req: &Request,
    run: fn(&Tree, &Value) -> Result<Value, HandlerErr>,
) -> serde_json::Value {
    let Some(tree) = state.store.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    match run(tree, &req.params) {
        Ok(result) => ok(&req.id, result),
        Err(e) => e.response(&req.id),
    }
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "posts.create" => Some(handle(state, req, create)),
        "posts.list" => Some(handle(state, req, list)),
        "posts.like" => Some(handle(state, req, like)),
        "posts.markSeen" => Some(handle(state, req, mark_seen)),
        _ => None,
    }
}
