use crate::ipc::error::{err, ok};
use crate::ipc::helpers::{
    bad_params, get_required_str, get_str_or_default, get_optional_str, store_read, store_write,
    now_iso, HandlerErr,
};
use crate::ipc::types::{AppState, Request};
use crate::store::Tree;
use chrono::{Datelike, Utc};
use serde_json::{json, Value};

/// Academic years arrive in mixed shapes ("2025/26", "2025_26"); a slash
/// would silently nest the plan one path level deeper, so normalize it.
fn academic_year(params: &Value) -> String {
    match get_optional_str(params, "academicYear") {
        Some(ay) => ay.replace('/', "_"),
        None => {
            let year = Utc::now().year();
            format!("{}_{:02}", year, (year + 1) % 100)
        }
    }
}

/// Client-supplied submission keys become tree path segments.
fn sanitize_key(key: &str) -> String {
    key.chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '_' || c == '-' {
                c
            } else {
                '_'
            }
        })
        .collect()
}

/// Week number may arrive as a JSON number or a string.
fn week_label(params: &Value) -> Result<(Value, String), HandlerErr> {
    match params.get("week") {
        Some(Value::Number(n)) => Ok((json!(n), n.to_string())),
        Some(Value::String(s)) if !s.trim().is_empty() => {
            let s = s.trim().to_string();
            Ok((json!(s), s))
        }
        _ => Err(bad_params("teacherId and week are required")),
    }
}

fn save_week(tree: &Tree, params: &Value) -> Result<Value, HandlerErr> {
    let teacher_id = get_required_str(params, "teacherId")?;
    let (week, label) = week_label(params)?;
    let course_id = get_required_str(params, "courseId")?;
    let ay = academic_year(params);

    let week_topic = get_str_or_default(params, "weekTopic");
    let days = params.get("days").cloned().unwrap_or_else(|| json!([]));

    let obj = json!({
        "teacherId": teacher_id,
        "courseId": course_id,
        "academicYear": ay,
        "week": week,
        "weekTopic": week_topic,
        "days": days,
        "updatedAt": now_iso()
    });
    tree.set(
        &format!("LessonPlans/{teacher_id}/{ay}/courses/{course_id}/week_{label}"),
        &obj,
    )
    .map_err(store_write)?;

    Ok(json!({ "message": "Week plan saved", "data": obj }))
}

fn save_annual(tree: &Tree, params: &Value) -> Result<Value, HandlerErr> {
    let teacher_id = get_required_str(params, "teacherId")?;
    let course_id = get_required_str(params, "courseId")?;
    let ay = academic_year(params);
    let annual_rows = params.get("annualRows").cloned().unwrap_or_else(|| json!([]));

    let obj = json!({
        "teacherId": teacher_id,
        "courseId": course_id,
        "academicYear": ay,
        "annualRows": annual_rows,
        "updatedAt": now_iso()
    });
    tree.set(
        &format!("LessonPlans/{teacher_id}/{ay}/courses/{course_id}/annual"),
        &obj,
    )
    .map_err(store_write)?;

    Ok(json!({ "message": "Annual plan saved", "data": obj }))
}

fn get(tree: &Tree, params: &Value) -> Result<Value, HandlerErr> {
    let teacher_id = get_required_str(params, "teacherId")?;
    let ay = academic_year(params);

    let path = match get_optional_str(params, "courseId") {
        Some(course_id) => format!("LessonPlans/{teacher_id}/{ay}/courses/{course_id}"),
        None => format!("LessonPlans/{teacher_id}/{ay}"),
    };
    let data = tree
        .get(&path)
        .map_err(store_read)?
        .unwrap_or_else(|| json!({}));
    Ok(json!({ "data": data }))
}

fn submissions(tree: &Tree, params: &Value) -> Result<Value, HandlerErr> {
    let teacher_id = get_required_str(params, "teacherId")?;
    let course_id = get_required_str(params, "courseId")?;
    let ay = academic_year(params);

    let mut out = Vec::new();
    let base = format!("LessonPlanSubmissions/{teacher_id}/{ay}/{course_id}");
    for (child_key, entry) in tree.children(&base).map_err(store_read)? {
        let Value::Object(mut obj) = entry else {
            continue;
        };
        obj.insert("childKey".to_string(), json!(child_key));
        out.push(Value::Object(obj));
    }
    Ok(json!({ "data": out }))
}

fn submit_daily(tree: &Tree, params: &Value) -> Result<Value, HandlerErr> {
    let teacher_id = get_required_str(params, "teacherId")?;
    let course_id = get_required_str(params, "courseId")?;
    let key = get_required_str(params, "key")?;
    let ay = academic_year(params);

    let week = params.get("week").cloned().unwrap_or(Value::Null);
    let day_name = get_str_or_default(params, "dayName");
    let submitted_at = get_optional_str(params, "submittedAt").unwrap_or_else(now_iso);

    let child = sanitize_key(&key);
    let path = format!("LessonPlanSubmissions/{teacher_id}/{ay}/{course_id}/{child}");

    // A day is submitted once; re-submits answer with the stored entry.
    if let Some(existing) = tree.get(&path).map_err(store_read)? {
        return Ok(json!({ "message": "Already submitted", "data": existing }));
    }

    let obj = json!({
        "teacherId": teacher_id,
        "courseId": course_id,
        "academicYear": ay,
        "key": key,
        "childKey": child,
        "week": week,
        "dayName": day_name,
        "submittedAt": submitted_at
    });
    tree.set(&path, &obj).map_err(store_write)?;

    Ok(json!({ "message": "Submission saved", "data": obj }))
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
        "planner.saveWeek" => Some(handle(state, req, save_week)),
        "planner.saveAnnual" => Some(handle(state, req, save_annual)),
        "planner.get" => Some(handle(state, req, get)),
        "planner.submissions" => Some(handle(state, req, submissions)),
        "planner.submitDaily" => Some(handle(state, req, submit_daily)),
        _ => None,
    }
}
