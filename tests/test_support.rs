#![allow(dead_code)]

use std::path::{Path, PathBuf};

use cartabled::ipc::{handle_request, AppState, Request};
use chrono::{Duration, Utc};
use serde_json::json;

pub fn temp_dir(prefix: &str) -> PathBuf {
    std::env::temp_dir().join(format!("{}-{}", prefix, uuid::Uuid::new_v4()))
}

pub fn request(
    state: &mut AppState,
    id: &str,
    method: &str,
    params: serde_json::Value,
) -> serde_json::Value {
    handle_request(
        state,
        Request {
            id: id.to_string(),
            method: method.to_string(),
            params,
        },
    )
}

pub fn request_ok(
    state: &mut AppState,
    id: &str,
    method: &str,
    params: serde_json::Value,
) -> serde_json::Value {
    let resp = request(state, id, method, params);
    assert_eq!(
        resp.get("ok").and_then(|v| v.as_bool()),
        Some(true),
        "{} failed: {}",
        method,
        resp
    );
    resp.get("result").cloned().expect("result")
}

/// Asserts failure and returns the error code.
pub fn request_err(
    state: &mut AppState,
    id: &str,
    method: &str,
    params: serde_json::Value,
) -> String {
    let resp = request(state, id, method, params);
    assert_eq!(
        resp.get("ok").and_then(|v| v.as_bool()),
        Some(false),
        "{} unexpectedly succeeded: {}",
        method,
        resp
    );
    resp.get("error")
        .and_then(|e| e.get("code"))
        .and_then(|v| v.as_str())
        .expect("error code")
        .to_string()
}

pub fn open_state(workspace: &Path) -> AppState {
    let mut state = AppState {
        workspace: None,
        db: None,
    };
    let _ = request_ok(
        &mut state,
        "ws",
        "workspace.select",
        json!({ "path": workspace.to_string_lossy() }),
    );
    state
}

pub fn seed_class(state: &mut AppState, name: &str) -> String {
    request_ok(state, "seed", "classes.create", json!({ "name": name }))
        .get("classId")
        .and_then(|v| v.as_str())
        .expect("classId")
        .to_string()
}

pub fn seed_student(state: &mut AppState, class_id: &str, last: &str, first: &str) -> String {
    request_ok(
        state,
        "seed",
        "students.create",
        json!({ "classId": class_id, "lastName": last, "firstName": first }),
    )
    .get("studentId")
    .and_then(|v| v.as_str())
    .expect("studentId")
    .to_string()
}

pub fn seed_subject(state: &mut AppState, name: &str, coefficient: i64) -> String {
    request_ok(
        state,
        "seed",
        "subjects.create",
        json!({ "name": name, "coefficient": coefficient }),
    )
    .get("subjectId")
    .and_then(|v| v.as_str())
    .expect("subjectId")
    .to_string()
}

pub fn seed_exercise(state: &mut AppState, subject_id: &str, title: &str, tier: i64) -> String {
    request_ok(
        state,
        "seed",
        "exercises.create",
        json!({ "subjectId": subject_id, "title": title, "difficultyTier": tier }),
    )
    .get("exerciseId")
    .and_then(|v| v.as_str())
    .expect("exerciseId")
    .to_string()
}

/// Adds an already-validated grade dated `days_ago` before now.
pub fn seed_validated_grade(
    state: &mut AppState,
    student_id: &str,
    subject_id: &str,
    value: f64,
    days_ago: i64,
) -> String {
    let date = (Utc::now() - Duration::days(days_ago)).to_rfc3339();
    request_ok(
        state,
        "seed",
        "grades.add",
        json!({
            "studentId": student_id,
            "subjectId": subject_id,
            "value": value,
            "evaluationType": "exam",
            "date": date,
            "validated": true
        }),
    )
    .get("gradeId")
    .and_then(|v| v.as_str())
    .expect("gradeId")
    .to_string()
}
