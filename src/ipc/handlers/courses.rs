use crate::ipc::error::{err, ok};
use crate::ipc::helpers::{bad_params, get_required_str, store_read, store_write, HandlerErr};
use crate::ipc::types::{AppState, Request};
use crate::store::Tree;
use serde_json::json;

/// Roster of a course: every student whose grade+section matches, with
/// whatever marks have been recorded for them in this course.
fn students(tree: &Tree, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let course_id = get_required_str(params, "courseId")?;

    let Some(course) = tree
        .get(&format!("Courses/{course_id}"))
        .map_err(store_read)?
    else {
        return Ok(json!({ "students": [], "course": null }));
    };
    let grade = course.get("grade").cloned().unwrap_or(json!(null));
    let section = course.get("section").cloned().unwrap_or(json!(null));

    let mut out = Vec::new();
    for (student_id, student) in tree.children("Students").map_err(store_read)? {
        if student.get("grade") != Some(&grade) || student.get("section") != Some(&section) {
            continue;
        }
        let Some(user_id) = student.get("userId").and_then(|v| v.as_str()) else {
            continue;
        };
        let Some(user) = tree.get(&format!("Users/{user_id}")).map_err(store_read)? else {
            continue;
        };
        let marks = tree
            .get(&format!("ClassMarks/{course_id}/{student_id}"))
            .map_err(store_read)?
            .unwrap_or_else(|| json!({}));
        out.push(json!({
            "studentId": student_id,
            "name": user.get("name"),
            "username": user.get("username"),
            "marks": {
                "mark20": marks.get("mark20").cloned().unwrap_or(json!(0)),
                "mark30": marks.get("mark30").cloned().unwrap_or(json!(0)),
                "mark50": marks.get("mark50").cloned().unwrap_or(json!(0)),
                "mark100": marks.get("mark100").cloned().unwrap_or(json!(0))
            }
        }));
    }

    Ok(json!({
        "students": out,
        "course": {
            "subject": course.get("subject"),
            "grade": grade,
            "section": section
        }
    }))
}

fn update_marks(tree: &Tree, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let course_id = get_required_str(params, "courseId")?;
    let Some(updates) = params.get("updates").and_then(|v| v.as_array()) else {
        return Err(bad_params("missing updates"));
    };

    for update in updates {
        let student_id = get_required_str(update, "studentId")?;
        let marks = update.get("marks").cloned().unwrap_or_else(|| json!({}));
        tree.set(
            &format!("ClassMarks/{course_id}/{student_id}"),
            &json!({
                "mark20": marks.get("mark20").cloned().unwrap_or(json!(0)),
                "mark30": marks.get("mark30").cloned().unwrap_or(json!(0)),
                "mark50": marks.get("mark50").cloned().unwrap_or(json!(0))
            }),
        )
        .map_err(store_write)?;
    }

    Ok(json!({ "message": "Marks updated successfully!" }))
}

fn handle(
    state: &mut AppState,
    req: &Request,
    run: fn(&Tree, &serde_json::Value) -> Result<serde_json::Value, HandlerErr>,
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
        "courses.students" => Some(handle(state, req, students)),
        "courses.updateMarks" => Some(handle(state, req, update_marks)),
        _ => None,
    }
}
