use crate::idgen::{self, RecordKind, TreeCounter, TreeDirectory};
use crate::ipc::error::{err, ok};
use crate::ipc::helpers::{
    bad_params, conflict, get_required_str, get_str_or_default, get_optional_str, not_found,
    profile_image, store_read, store_write, username_taken, HandlerErr, DEFAULT_PROFILE_IMAGE,
};
use crate::ipc::types::{AppState, Request};
use crate::store::{self, Tree};
use serde_json::json;

struct CourseInput {
    grade: String,
    section: String,
    subject: String,
}

impl CourseInput {
    /// `course_<subject>_<grade><SECTION>`, the shared course key used by
    /// assignments, marks and rosters.
    fn course_id(&self) -> String {
        format!(
            "course_{}_{}{}",
            self.subject.to_lowercase(),
            self.grade,
            self.section.to_uppercase()
        )
    }
}

fn parse_courses(params: &serde_json::Value) -> Result<Vec<CourseInput>, HandlerErr> {
    let Some(raw) = params.get("courses") else {
        return Ok(Vec::new());
    };
    let Some(items) = raw.as_array() else {
        return Err(bad_params("courses must be an array"));
    };
    let mut out = Vec::with_capacity(items.len());
    for item in items {
        let grade = get_required_str(item, "grade")?;
        let section = get_required_str(item, "section")?;
        let subject = get_required_str(item, "subject")?;
        out.push(CourseInput {
            grade,
            section,
            subject,
        });
    }
    Ok(out)
}

fn register(tree: &Tree, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let name = get_required_str(params, "name")?;
    let password = get_required_str(params, "password")?;
    let provided_username = get_optional_str(params, "username");
    let email = get_str_or_default(params, "email");
    let phone = get_str_or_default(params, "phone");
    let gender = get_str_or_default(params, "gender");
    let profile_url = profile_image(params);
    let courses = parse_courses(params)?;

    if let Some(ref username) = provided_username {
        if username_taken(tree, username)? {
            return Err(conflict("Username already exists!"));
        }
    }

    // A subject can only be assigned once per grade+section across the
    // whole school.
    let existing_assignments = tree.children("TeacherAssignments").map_err(store_read)?;
    for course in &courses {
        let course_id = course.course_id();
        let taken = existing_assignments.iter().any(|(_, a)| {
            a.get("courseId").and_then(|v| v.as_str()) == Some(course_id.as_str())
        });
        if taken {
            return Err(conflict(format!(
                "{} already assigned in Grade {}{}",
                course.subject, course.grade, course.section
            )));
        }
    }

    let counter = TreeCounter::new(tree, RecordKind::Teacher);
    let directory = TreeDirectory::new(tree, RecordKind::Teacher);
    let teacher_id = idgen::allocate(RecordKind::Teacher, &counter, &directory);

    let username = provided_username.unwrap_or_else(|| teacher_id.clone());

    let user_id = store::push_key();
    tree.set(
        &format!("Users/{user_id}"),
        &json!({
            "userId": user_id,
            "username": username,
            "name": name,
            "password": password,
            "role": "teacher",
            "isActive": true,
            "profileImage": profile_url,
            "email": email,
            "phone": phone,
            "gender": gender,
            "teacherId": teacher_id
        }),
    )
    .map_err(store_write)?;

    tree.set(
        &format!("Teachers/{teacher_id}"),
        &json!({
            "userId": user_id,
            "teacherId": teacher_id,
            "status": "active"
        }),
    )
    .map_err(store_write)?;

    for course in &courses {
        let course_id = course.course_id();
        let course_path = format!("Courses/{course_id}");
        if !tree.exists(&course_path).map_err(store_read)? {
            tree.set(
                &course_path,
                &json!({
                    "name": course.subject,
                    "subject": course.subject,
                    "grade": course.grade,
                    "section": course.section
                }),
            )
            .map_err(store_write)?;
        }
        tree.push(
            "TeacherAssignments",
            &json!({
                "teacherId": teacher_id,
                "courseId": course_id
            }),
        )
        .map_err(store_write)?;
    }

    Ok(json!({
        "message": "Teacher registered successfully!",
        "teacherKey": teacher_id,
        "profileImage": profile_url
    }))
}

fn login(tree: &Tree, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let username = get_required_str(params, "username")?;
    let password = get_required_str(params, "password")?;

    let mut teacher_user: Option<(String, serde_json::Value)> = None;
    for (key, user) in tree.children("Users").map_err(store_read)? {
        if user.get("username").and_then(|v| v.as_str()) == Some(username.as_str())
            && user.get("role").and_then(|v| v.as_str()) == Some("teacher")
        {
            teacher_user = Some((key, user));
            break;
        }
    }
    let Some((user_id, user)) = teacher_user else {
        return Err(not_found("Teacher not found"));
    };

    let mut teacher_key: Option<(String, serde_json::Value)> = None;
    for (key, teacher) in tree.children("Teachers").map_err(store_read)? {
        if teacher.get("userId").and_then(|v| v.as_str()) == Some(user_id.as_str()) {
            teacher_key = Some((key, teacher));
            break;
        }
    }
    let Some((teacher_key, teacher)) = teacher_key else {
        return Err(not_found("Teacher not found"));
    };

    if user.get("password").and_then(|v| v.as_str()) != Some(password.as_str()) {
        return Err(HandlerErr::new("unauthorized", "Invalid password"));
    }

    let profile = teacher
        .get("profileImage")
        .or_else(|| user.get("profileImage"))
        .and_then(|v| v.as_str())
        .unwrap_or(DEFAULT_PROFILE_IMAGE);

    Ok(json!({
        "teacher": {
            "teacherKey": teacher_key,
            "userId": user_id,
            "name": user.get("name"),
            "username": user.get("username"),
            "profileImage": profile
        }
    }))
}

/// Assignment rows for one teacher joined with their course records.
fn courses_of(tree: &Tree, teacher_key: &str) -> Result<Vec<serde_json::Value>, HandlerErr> {
    let mut out = Vec::new();
    for (_, assignment) in tree.children("TeacherAssignments").map_err(store_read)? {
        if assignment.get("teacherId").and_then(|v| v.as_str()) != Some(teacher_key) {
            continue;
        }
        let Some(course_id) = assignment.get("courseId").and_then(|v| v.as_str()) else {
            continue;
        };
        let Some(course) = tree
            .get(&format!("Courses/{course_id}"))
            .map_err(store_read)?
        else {
            continue;
        };
        out.push(json!({
            "courseId": course_id,
            "subject": course.get("subject"),
            "grade": course.get("grade"),
            "section": course.get("section")
        }));
    }
    Ok(out)
}

fn courses(tree: &Tree, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let teacher_key = get_required_str(params, "teacherKey")?;
    Ok(json!({ "courses": courses_of(tree, &teacher_key)? }))
}

/// Per-course rosters for a teacher, marks included, looked up by the
/// account's userId (the dashboard only holds the login response).
fn students(tree: &Tree, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let user_id = get_required_str(params, "userId")?;

    let mut teacher_key: Option<String> = None;
    for (key, teacher) in tree.children("Teachers").map_err(store_read)? {
        if teacher.get("userId").and_then(|v| v.as_str()) == Some(user_id.as_str()) {
            teacher_key = Some(key);
            break;
        }
    }
    let Some(teacher_key) = teacher_key else {
        return Ok(json!({ "courses": [], "message": "Teacher not found" }));
    };

    let all_students = tree.children("Students").map_err(store_read)?;
    let mut course_students = Vec::new();

    for (_, assignment) in tree.children("TeacherAssignments").map_err(store_read)? {
        if assignment.get("teacherId").and_then(|v| v.as_str()) != Some(teacher_key.as_str()) {
            continue;
        }
        let Some(course_id) = assignment.get("courseId").and_then(|v| v.as_str()) else {
            continue;
        };
        let Some(course) = tree
            .get(&format!("Courses/{course_id}"))
            .map_err(store_read)?
        else {
            continue;
        };
        let grade = course.get("grade").cloned().unwrap_or_default();
        let section = course.get("section").cloned().unwrap_or_default();

        let mut students_list = Vec::new();
        for (student_id, student) in &all_students {
            if student.get("grade") != Some(&grade) || student.get("section") != Some(&section) {
                continue;
            }
            let Some(student_user_id) = student.get("userId").and_then(|v| v.as_str()) else {
                continue;
            };
            let Some(user) = tree
                .get(&format!("Users/{student_user_id}"))
                .map_err(store_read)?
            else {
                continue;
            };
            let marks = tree
                .get(&format!("ClassMarks/{course_id}/{student_id}"))
                .map_err(store_read)?
                .unwrap_or_else(|| json!({}));
            students_list.push(json!({
                "studentId": student_id,
                "name": user.get("name"),
                "username": user.get("username"),
                "marks": {
                    "mark20": marks.get("mark20").cloned().unwrap_or(json!(0)),
                    "mark30": marks.get("mark30").cloned().unwrap_or(json!(0)),
                    "mark50": marks.get("mark50").cloned().unwrap_or(json!(0))
                }
            }));
        }

        course_students.push(json!({
            "subject": course.get("subject"),
            "grade": grade,
            "section": section,
            "students": students_list
        }));
    }

    Ok(json!({ "courses": course_students }))
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
        "teachers.register" => Some(handle(state, req, register)),
        "teachers.login" => Some(handle(state, req, login)),
        "teachers.courses" => Some(handle(state, req, courses)),
        "teachers.students" => Some(handle(state, req, students)),
        _ => None,
    }
}
