mod test_support;

use chrono::Datelike;
use serde_json::json;
use test_support::{request_err, request_ok, spawn_sidecar, temp_dir};

fn year_suffix() -> String {
    format!("{:02}", chrono::Utc::now().year() % 100)
}

#[test]
fn student_ids_are_sequential_and_double_as_usernames() {
    let workspace = temp_dir("schoolhub-reg-ids");
    let ys = year_suffix();
    let (_child, mut stdin, mut reader) = spawn_sidecar();

    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "1",
        "workspace.select",
        json!({ "path": workspace.to_string_lossy() }),
    );

    for (i, expected_seq) in [("2", "0001"), ("3", "0002"), ("4", "0003")] {
        let result = request_ok(
            &mut stdin,
            &mut reader,
            i,
            "students.register",
            json!({
                "name": format!("Student {}", expected_seq),
                "password": "pw",
                "grade": "7",
                "section": "a"
            }),
        );
        let expected = format!("GES_{}_{}", expected_seq, ys);
        assert_eq!(
            result.get("studentId").and_then(|v| v.as_str()),
            Some(expected.as_str())
        );
        // No username supplied, so the account logs in with the id itself.
        assert_eq!(
            result.get("username").and_then(|v| v.as_str()),
            Some(expected.as_str())
        );
    }

    let _ = std::fs::remove_dir_all(workspace);
}

#[test]
fn generate_id_reserves_its_sequence_number() {
    let workspace = temp_dir("schoolhub-reg-reserve");
    let ys = year_suffix();
    let (_child, mut stdin, mut reader) = spawn_sidecar();

    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "1",
        "workspace.select",
        json!({ "path": workspace.to_string_lossy() }),
    );

    let generated = request_ok(&mut stdin, &mut reader, "2", "students.generateId", json!({}));
    assert_eq!(
        generated.get("studentId").and_then(|v| v.as_str()),
        Some(format!("GES_0001_{}", ys).as_str())
    );

    // The reserved number is consumed even though no record was written.
    let registered = request_ok(
        &mut stdin,
        &mut reader,
        "3",
        "students.register",
        json!({ "name": "After Reserve", "password": "pw", "grade": "8", "section": "b" }),
    );
    assert_eq!(
        registered.get("studentId").and_then(|v| v.as_str()),
        Some(format!("GES_0002_{}", ys).as_str())
    );

    let _ = std::fs::remove_dir_all(workspace);
}

#[test]
fn provided_username_collision_is_rejected() {
    let workspace = temp_dir("schoolhub-reg-username");
    let (_child, mut stdin, mut reader) = spawn_sidecar();

    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "1",
        "workspace.select",
        json!({ "path": workspace.to_string_lossy() }),
    );

    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "2",
        "students.register",
        json!({
            "name": "First",
            "username": "abebe",
            "password": "pw",
            "grade": "7",
            "section": "a"
        }),
    );
    let code = request_err(
        &mut stdin,
        &mut reader,
        "3",
        "students.register",
        json!({
            "name": "Second",
            "username": "abebe",
            "password": "pw",
            "grade": "7",
            "section": "a"
        }),
    );
    assert_eq!(code, "conflict");

    let _ = std::fs::remove_dir_all(workspace);
}

#[test]
fn sequence_survives_a_daemon_restart() {
    let workspace = temp_dir("schoolhub-reg-restart");
    let ys = year_suffix();

    {
        let (mut child, mut stdin, mut reader) = spawn_sidecar();
        let _ = request_ok(
            &mut stdin,
            &mut reader,
            "1",
            "workspace.select",
            json!({ "path": workspace.to_string_lossy() }),
        );
        let first = request_ok(
            &mut stdin,
            &mut reader,
            "2",
            "students.register",
            json!({ "name": "Before", "password": "pw", "grade": "7", "section": "a" }),
        );
        assert_eq!(
            first.get("studentId").and_then(|v| v.as_str()),
            Some(format!("GES_0001_{}", ys).as_str())
        );
        drop(stdin);
        let _ = child.wait();
    }

    let (_child, mut stdin, mut reader) = spawn_sidecar();
    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "1",
        "workspace.select",
        json!({ "path": workspace.to_string_lossy() }),
    );
    let second = request_ok(
        &mut stdin,
        &mut reader,
        "2",
        "students.register",
        json!({ "name": "After", "password": "pw", "grade": "7", "section": "a" }),
    );
    assert_eq!(
        second.get("studentId").and_then(|v| v.as_str()),
        Some(format!("GES_0002_{}", ys).as_str())
    );

    let _ = std::fs::remove_dir_all(workspace);
}
