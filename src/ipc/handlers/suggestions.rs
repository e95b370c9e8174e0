use chrono::Utc;
use rand::rngs::StdRng;
use rand::SeedableRng;
use serde_json::json;

use crate::analysis::{self, round1, round2, PerformanceReport};
use crate::ipc::error::{err, ok};
use crate::ipc::helpers::{core_err, db_conn, required_bool, required_str};
use crate::ipc::types::{AppState, Request};
use crate::suggest;

const MAX_SUGGESTION_COUNT: i64 = 100;
const DEFAULT_SUGGESTION_COUNT: i64 = 5;

fn parse_count(req: &Request) -> Result<usize, serde_json::Value> {
    let Some(raw) = req.params.get("nb") else {
        return Ok(DEFAULT_SUGGESTION_COUNT as usize);
    };
    let Some(n) = raw.as_i64() else {
        return Err(err(&req.id, "bad_params", "nb must be an integer", None));
    };
    if n <= 0 || n > MAX_SUGGESTION_COUNT {
        return Err(err(
            &req.id,
            "bad_params",
            format!("nb must be within 1..={}", MAX_SUGGESTION_COUNT),
            Some(json!({ "nb": n })),
        ));
    }
    Ok(n as usize)
}

fn rng_from_params(req: &Request) -> StdRng {
    match req.params.get("rngSeed").and_then(|v| v.as_u64()) {
        Some(seed) => StdRng::seed_from_u64(seed),
        None => StdRng::from_entropy(),
    }
}

fn risk_subjects_json(report: &PerformanceReport) -> Vec<serde_json::Value> {
    let mut at_risk: Vec<&analysis::SubjectPerformance> =
        report.per_subject.iter().filter(|p| p.at_risk).collect();
    at_risk.sort_by(|a, b| {
        b.priority
            .partial_cmp(&a.priority)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then_with(|| a.subject_id.cmp(&b.subject_id))
    });
    at_risk
        .iter()
        .map(|p| {
            json!({
                "nom": p.subject_name,
                "moyenne": round1(p.average),
                "priorite": p.priority.round() as i64
            })
        })
        .collect()
}

fn handle_pour_etudiant(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(v) => v,
        Err(e) => return e,
    };
    let etudiant_id = match required_str(req, "etudiantId") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let count = match parse_count(req) {
        Ok(v) => v,
        Err(e) => return e,
    };

    let now = Utc::now();
    // Nothing is persisted unless analysis succeeds.
    let report = match analysis::analyze_student(conn, &etudiant_id, now) {
        Ok(v) => v,
        Err(e) => return core_err(req, e),
    };
    let exclude = match suggest::recent_exercise_ids(conn, &etudiant_id, now) {
        Ok(v) => v,
        Err(e) => return core_err(req, e),
    };

    let mut rng = rng_from_params(req);
    let candidates = match suggest::rank(conn, &report, &exclude, count, &mut rng) {
        Ok(v) => v,
        Err(e) => return core_err(req, e),
    };
    let stored = match suggest::record(conn, &etudiant_id, &candidates, now) {
        Ok(v) => v,
        Err(e) => return core_err(req, e),
    };

    let suggestions_json = stored
        .iter()
        .map(|s| {
            json!({
                "id_suggestion": s.id,
                "id_exercice": s.exercise_id,
                "titre": s.title,
                "subject_nom": s.subject_name,
                "niveau_difficulte": s.tier,
                "raison": s.reason,
                "note_actuelle": s.source_average.map(round1),
                "priorite": s.priority.round() as i64
            })
        })
        .collect::<Vec<_>>();

    ok(
        &req.id,
        json!({
            "success": true,
            "etudiant_id": report.student.id,
            "etudiant_nom": report.student.display_name,
            "nb_suggestions": suggestions_json.len(),
            "suggestions": suggestions_json,
            "analyse": {
                "moyenne_generale": report.global_average.map(round1),
                "niveau_global": report.level.as_str(),
                "progression": report.trend.as_str(),
                "matieres_risque": risk_subjects_json(&report)
            }
        }),
    )
}

fn handle_analyse_complete(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(v) => v,
        Err(e) => return e,
    };
    let etudiant_id = match required_str(req, "etudiantId") {
        Ok(v) => v,
        Err(e) => return e,
    };

    let report = match analysis::analyze_student(conn, &etudiant_id, Utc::now()) {
        Ok(v) => v,
        Err(e) => return core_err(req, e),
    };

    let mut per_subject = serde_json::Map::new();
    for p in &report.per_subject {
        per_subject.insert(
            p.subject_id.clone(),
            json!({
                "nom": p.subject_name,
                "moyenne": round2(p.average),
                "nb_notes": p.sample_count,
                "coefficient": p.coefficient,
                "priorite": p.priority.round() as i64
            }),
        );
    }

    ok(
        &req.id,
        json!({
            "moyenne_generale": report.global_average.map(round2),
            "performance_par_matiere": per_subject,
            "matieres_risque": risk_subjects_json(&report),
            "progression": report.trend.as_str(),
            "niveau_global": report.level.as_str(),
            "etudiant": {
                "id": report.student.id,
                "nom": report.student.display_name,
                "classe": report.student.class_name
            }
        }),
    )
}

fn handle_feedback(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(v) => v,
        Err(e) => return e,
    };
    let suggestion_id = match required_str(req, "suggestionId") {
        Ok(v) => v,
        Err(e) => return e,
    };
    // Required by the surface even though only the viewed flag changes.
    let _est_utile = match required_bool(req, "estUtile") {
        Ok(v) => v,
        Err(e) => return e,
    };

    let updated = match conn.execute(
        "UPDATE suggestions SET viewed = 1 WHERE id = ?",
        [&suggestion_id],
    ) {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    if updated == 0 {
        return err(&req.id, "not_found", "suggestion not found", None);
    }

    ok(
        &req.id,
        json!({ "success": true, "message": "Feedback enregistre" }),
    )
}

fn handle_list(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(v) => v,
        Err(e) => return e,
    };
    let etudiant_id = match required_str(req, "etudiantId") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let mut stmt = match conn.prepare(
        "SELECT sg.id, sg.exercise_id, e.title, sg.subject_id, s.name,
                sg.source_average, sg.reason, sg.suggested_tier, sg.created_at,
                sg.viewed, sg.completed
         FROM suggestions sg
         JOIN exercises e ON e.id = sg.exercise_id
         JOIN subjects s ON s.id = sg.subject_id
         WHERE sg.student_id = ?
         ORDER BY sg.created_at DESC, sg.id",
    ) {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    let rows = match stmt
        .query_map([&etudiant_id], |r| {
            Ok(json!({
                "id": r.get::<_, String>(0)?,
                "exerciseId": r.get::<_, String>(1)?,
                "titre": r.get::<_, String>(2)?,
                "subjectId": r.get::<_, String>(3)?,
                "subjectNom": r.get::<_, String>(4)?,
                "noteActuelle": r.get::<_, Option<f64>>(5)?,
                "raison": r.get::<_, String>(6)?,
                "niveauSuggere": r.get::<_, i64>(7)?,
                "createdAt": r.get::<_, String>(8)?,
                "viewed": r.get::<_, i64>(9)? != 0,
                "completed": r.get::<_, i64>(10)? != 0
            }))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
    {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    ok(&req.id, json!({ "suggestions": rows }))
}

fn handle_notifications_list(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(v) => v,
        Err(e) => return e,
    };
    let student_id = match required_str(req, "studentId") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let mut stmt = match conn.prepare(
        "SELECT id, kind, title, body, suggestion_id, created_at, read
         FROM notifications
         WHERE student_id = ?
         ORDER BY created_at DESC, id",
    ) {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    let rows = match stmt
        .query_map([&student_id], |r| {
            Ok(json!({
                "id": r.get::<_, String>(0)?,
                "kind": r.get::<_, String>(1)?,
                "title": r.get::<_, String>(2)?,
                "body": r.get::<_, String>(3)?,
                "suggestionId": r.get::<_, Option<String>>(4)?,
                "createdAt": r.get::<_, String>(5)?,
                "read": r.get::<_, i64>(6)? != 0
            }))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
    {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    ok(&req.id, json!({ "notifications": rows }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "suggestions.pourEtudiant" => Some(handle_pour_etudiant(state, req)),
        "suggestions.analyseComplete" => Some(handle_analyse_complete(state, req)),
        "suggestions.feedback" => Some(handle_feedback(state, req)),
        "suggestions.list" => Some(handle_list(state, req)),
        "notifications.list" => Some(handle_notifications_list(state, req)),
        _ => None,
    }
}
