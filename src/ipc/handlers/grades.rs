use chrono::Utc;
use rusqlite::OptionalExtension;
use serde_json::json;
use uuid::Uuid;

use crate::ipc::error::{err, ok};
use crate::ipc::helpers::{db_conn, optional_str, required_f64, required_str};
use crate::ipc::types::{AppState, Request};

const EVALUATION_TYPES: [&str; 3] = ["homework", "exam", "lab"];

fn handle_add(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(v) => v,
        Err(e) => return e,
    };
    let student_id = match required_str(req, "studentId") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let subject_id = match required_str(req, "subjectId") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let value = match required_f64(req, "value") {
        Ok(v) => v,
        Err(e) => return e,
    };
    if !(0.0..=20.0).contains(&value) {
        return err(&req.id, "bad_params", "value must be within 0..=20", None);
    }
    // Grades carry two-decimal precision.
    let value = (value * 100.0).round() / 100.0;

    let evaluation_type = match required_str(req, "evaluationType") {
        Ok(v) => v,
        Err(e) => return e,
    };
    if !EVALUATION_TYPES.contains(&evaluation_type.as_str()) {
        return err(
            &req.id,
            "bad_params",
            "evaluationType must be one of: homework, exam, lab",
            Some(json!({ "evaluationType": evaluation_type })),
        );
    }

    let date = match optional_str(req, "date") {
        Some(raw) => match chrono::DateTime::parse_from_rfc3339(&raw) {
            Ok(d) => d.with_timezone(&Utc).to_rfc3339(),
            Err(e) => {
                return err(
                    &req.id,
                    "bad_params",
                    format!("date must be RFC3339: {}", e),
                    None,
                )
            }
        },
        None => Utc::now().to_rfc3339(),
    };
    let validated = req
        .params
        .get("validated")
        .and_then(|v| v.as_bool())
        .unwrap_or(false);

    let student_exists: Option<i64> = match conn
        .query_row("SELECT 1 FROM students WHERE id = ?", [&student_id], |r| r.get(0))
        .optional()
    {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    if student_exists.is_none() {
        return err(&req.id, "not_found", "student not found", None);
    }
    let subject_exists: Option<i64> = match conn
        .query_row("SELECT 1 FROM subjects WHERE id = ?", [&subject_id], |r| r.get(0))
        .optional()
    {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    if subject_exists.is_none() {
        return err(&req.id, "not_found", "subject not found", None);
    }

    let id = Uuid::new_v4().to_string();
    if let Err(e) = conn.execute(
        "INSERT INTO grades(id, student_id, subject_id, value, evaluation_type, date, validated)
         VALUES (?, ?, ?, ?, ?, ?, ?)",
        rusqlite::params![
            id,
            student_id,
            subject_id,
            value,
            evaluation_type,
            date,
            validated as i64
        ],
    ) {
        return err(&req.id, "db_query_failed", e.to_string(), None);
    }
    ok(&req.id, json!({ "gradeId": id }))
}

fn handle_validate(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(v) => v,
        Err(e) => return e,
    };
    let grade_id = match required_str(req, "gradeId") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let updated = match conn.execute(
        "UPDATE grades SET validated = 1 WHERE id = ?",
        [&grade_id],
    ) {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    if updated == 0 {
        return err(&req.id, "not_found", "grade not found", None);
    }
    ok(&req.id, json!({ "gradeId": grade_id, "validated": true }))
}

fn handle_list(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(v) => v,
        Err(e) => return e,
    };
    let student_id = match required_str(req, "studentId") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let mut stmt = match conn.prepare(
        "SELECT g.id, g.subject_id, s.name, g.value, g.evaluation_type, g.date, g.validated
         FROM grades g
         JOIN subjects s ON s.id = g.subject_id
         WHERE g.student_id = ?
         ORDER BY g.date",
    ) {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    let rows = match stmt
        .query_map([&student_id], |r| {
            Ok(json!({
                "id": r.get::<_, String>(0)?,
                "subjectId": r.get::<_, String>(1)?,
                "subjectName": r.get::<_, String>(2)?,
                "value": r.get::<_, f64>(3)?,
                "evaluationType": r.get::<_, String>(4)?,
                "date": r.get::<_, String>(5)?,
                "validated": r.get::<_, i64>(6)? != 0
            }))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
    {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    ok(&req.id, json!({ "grades": rows }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "grades.add" => Some(handle_add(state, req)),
        "grades.validate" => Some(handle_validate(state, req)),
        "grades.list" => Some(handle_list(state, req)),
        _ => None,
    }
}
