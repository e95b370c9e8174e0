use chrono::{DateTime, Utc};
use rusqlite::Connection;
use uuid::Uuid;

/// Append a notification row for a freshly stored suggestion. Callers treat
/// failure as best-effort: persistence of the suggestion itself must never
/// depend on this.
pub fn notify_suggestion(
    conn: &Connection,
    student_id: &str,
    suggestion_id: &str,
    exercise_title: &str,
    reason: &str,
    now: DateTime<Utc>,
) -> anyhow::Result<()> {
    conn.execute(
        "INSERT INTO notifications(id, student_id, kind, title, body, suggestion_id, created_at, read)
         VALUES (?, ?, 'suggestion', ?, ?, ?, ?, 0)",
        rusqlite::params![
            Uuid::new_v4().to_string(),
            student_id,
            format!("Nouvel exercice suggere : {}", exercise_title),
            reason,
            suggestion_id,
            now.to_rfc3339(),
        ],
    )?;
    Ok(())
}
