use crate::idgen::{self, RecordKind, TreeCounter, TreeDirectory};
use crate::ipc::error::{err, ok};
use crate::ipc::helpers::{
    conflict, get_required_str, get_str_or_default, get_optional_str, profile_image, store_write,
    username_taken, HandlerErr,
};
use crate::ipc::types::{AppState, Request};
use crate::store::{self, Tree};
use chrono::{Datelike, Utc};
use serde_json::json;
use std::time::{SystemTime, UNIX_EPOCH};

/// Reserve and return the next student identifier without creating any
/// record. The sequence number is consumed either way.
fn generate_id(tree: &Tree) -> Result<serde_json::Value, HandlerErr> {
    let counter = TreeCounter::new(tree, RecordKind::Student);
    let directory = TreeDirectory::new(tree, RecordKind::Student);
    let student_id = idgen::allocate(RecordKind::Student, &counter, &directory);
    Ok(json!({ "studentId": student_id }))
}

fn register(tree: &Tree, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let name = get_required_str(params, "name")?;
    let password = get_required_str(params, "password")?;
    let grade = get_required_str(params, "grade")?;
    let section = get_required_str(params, "section")?;

    let provided_username = get_optional_str(params, "username");
    let email = get_str_or_default(params, "email");
    let phone = get_str_or_default(params, "phone");
    let dob = get_str_or_default(params, "dob");
    let gender = get_str_or_default(params, "gender");
    let profile_url = profile_image(params);

    if let Some(ref username) = provided_username {
        if username_taken(tree, username)? {
            return Err(conflict("Username already exists!"));
        }
    }

    let counter = TreeCounter::new(tree, RecordKind::Student);
    let directory = TreeDirectory::new(tree, RecordKind::Student);
    let student_id = idgen::allocate(RecordKind::Student, &counter, &directory);

    // The account logs in with the studentId unless an explicit username
    // was supplied. The allocator already checked the id against existing
    // usernames; if one raced in anyway, a numeric suffix keeps the
    // account creatable.
    let mut username = provided_username
        .clone()
        .unwrap_or_else(|| student_id.clone());
    if provided_username.is_none() && username_taken(tree, &username)? {
        username = format!("{student_id}_{:03}", subsecond_digits());
    }

    let year = Utc::now().year();
    let academic_year = format!("{}_{}", year - 1, year);

    let user_id = store::push_key();
    tree.set(
        &format!("Users/{user_id}"),
        &json!({
            "userId": user_id,
            "username": username,
            "name": name,
            "password": password,
            "profileImage": profile_url,
            "role": "student",
            "isActive": true,
            "email": email,
            "phone": phone,
            "dob": dob,
            "gender": gender,
            "studentId": student_id
        }),
    )
    .map_err(store_write)?;

    tree.set(
        &format!("Students/{student_id}"),
        &json!({
            "userId": user_id,
            "studentId": student_id,
            "academicYear": academic_year,
            "dob": dob,
            "grade": grade,
            "section": section,
            "status": "active"
        }),
    )
    .map_err(store_write)?;

    Ok(json!({
        "message": "Student registered successfully!",
        "studentId": student_id,
        "username": username,
        "profileImage": profile_url
    }))
}

fn subsecond_digits() -> u128 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos() % 1000)
        .unwrap_or(0)
}

fn handle_generate_id(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(tree) = state.store.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    match generate_id(tree) {
        Ok(result) => ok(&req.id, result),
        Err(e) => e.response(&req.id),
    }
}

fn handle_register(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(tree) = state.store.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    match register(tree, &req.params) {
        Ok(result) => ok(&req.id, result),
        Err(e) => e.response(&req.id),
    }
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "students.generateId" => Some(handle_generate_id(state, req)),
        "students.register" => Some(handle_register(state, req)),
        _ => None,
    }
}
