use chrono::Utc;
use rusqlite::OptionalExtension;
use serde_json::json;
use uuid::Uuid;

use crate::ipc::error::{err, ok};
use crate::ipc::helpers::{db_conn, required_i64, required_str};
use crate::ipc::types::{AppState, Request};

fn handle_create(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(v) => v,
        Err(e) => return e,
    };
    let subject_id = match required_str(req, "subjectId") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let title = match required_str(req, "title") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let tier = match required_i64(req, "difficultyTier") {
        Ok(v) => v,
        Err(e) => return e,
    };
    if !(1..=3).contains(&tier) {
        return err(
            &req.id,
            "bad_params",
            "difficultyTier must be 1 (easy), 2 (medium) or 3 (hard)",
            None,
        );
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
        "INSERT INTO exercises(id, subject_id, title, difficulty_tier, created_at)
         VALUES (?, ?, ?, ?, ?)",
        rusqlite::params![id, subject_id, title, tier, Utc::now().to_rfc3339()],
    ) {
        return err(&req.id, "db_query_failed", e.to_string(), None);
    }
    ok(&req.id, json!({ "exerciseId": id }))
}

fn handle_list(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(v) => v,
        Err(e) => return e,
    };
    let subject_id = match required_str(req, "subjectId") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let tier = req.params.get("difficultyTier").and_then(|v| v.as_i64());

    let mut stmt = match conn.prepare(
        "SELECT id, title, difficulty_tier
         FROM exercises
         WHERE subject_id = ? AND (?2 IS NULL OR difficulty_tier = ?2)
         ORDER BY id",
    ) {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    let rows = match stmt
        .query_map(rusqlite::params![subject_id, tier], |r| {
            Ok(json!({
                "id": r.get::<_, String>(0)?,
                "title": r.get::<_, String>(1)?,
                "difficultyTier": r.get::<_, i64>(2)?
            }))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
    {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    ok(&req.id, json!({ "exercises": rows }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "exercises.create" => Some(handle_create(state, req)),
        "exercises.list" => Some(handle_list(state, req)),
        _ => None,
    }
}
