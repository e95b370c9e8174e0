use chrono::{DateTime, Duration, Utc};
use rusqlite::{Connection, OptionalExtension};
use serde::Serialize;
use std::collections::HashMap;

/// Passing mark on the 0-20 scale; subjects below it are "at risk".
pub const PASSING_MARK: f64 = 10.0;
/// Averages at or above this need no remediation at all.
pub const EXCELLENCE_MARK: f64 = 16.0;

/// Trailing window for the progression signal, split at its midpoint.
pub const TREND_WINDOW_DAYS: i64 = 30;
pub const TREND_SPLIT_DAYS: i64 = 15;
/// Half-to-half mean shift that counts as a real move.
pub const TREND_SHIFT: f64 = 2.0;

#[derive(Debug, Clone, Serialize)]
pub struct CoreError {
    pub code: String,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<serde_json::Value>,
}

impl CoreError {
    pub fn new(code: &str, message: impl Into<String>) -> Self {
        Self {
            code: code.to_string(),
            message: message.into(),
            details: None,
        }
    }
}

pub fn round1(x: f64) -> f64 {
    (x * 10.0).round() / 10.0
}

pub fn round2(x: f64) -> f64 {
    (x * 100.0).round() / 100.0
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum Level {
    #[serde(rename = "critique")]
    Critical,
    #[serde(rename = "debutant")]
    Beginner,
    #[serde(rename = "intermediaire")]
    Intermediate,
    #[serde(rename = "expert")]
    Expert,
}

impl Level {
    pub fn from_average(avg: Option<f64>) -> Self {
        let Some(avg) = avg else {
            return Level::Beginner;
        };
        if avg >= EXCELLENCE_MARK {
            Level::Expert
        } else if avg >= 12.0 {
            Level::Intermediate
        } else if avg >= PASSING_MARK {
            Level::Beginner
        } else {
            Level::Critical
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Level::Critical => "critique",
            Level::Beginner => "debutant",
            Level::Intermediate => "intermediaire",
            Level::Expert => "expert",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum Trend {
    #[serde(rename = "en_progres")]
    Improving,
    #[serde(rename = "en_baisse")]
    Declining,
    #[serde(rename = "stable")]
    Stable,
    #[serde(rename = "donnees_insuffisantes")]
    InsufficientData,
}

impl Trend {
    pub fn as_str(self) -> &'static str {
        match self {
            Trend::Improving => "en_progres",
            Trend::Declining => "en_baisse",
            Trend::Stable => "stable",
            Trend::InsufficientData => "donnees_insuffisantes",
        }
    }
}

/// A validated grade row, as fetched for one student.
#[derive(Debug, Clone)]
pub struct GradeRow {
    pub subject_id: String,
    pub value: f64,
    pub date: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct SubjectRef {
    pub id: String,
    pub name: String,
    pub coefficient: i64,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SubjectPerformance {
    pub subject_id: String,
    pub subject_name: String,
    pub coefficient: i64,
    pub average: f64,
    pub sample_count: usize,
    pub priority: f64,
    pub at_risk: bool,
}

#[derive(Debug, Clone)]
pub struct StudentRef {
    pub id: String,
    pub display_name: String,
    pub class_name: Option<String>,
}

/// Derived, never persisted; recomputing from the same grade set is
/// idempotent.
#[derive(Debug, Clone)]
pub struct PerformanceReport {
    pub student: StudentRef,
    pub global_average: Option<f64>,
    pub level: Level,
    pub trend: Trend,
    pub per_subject: Vec<SubjectPerformance>,
}

fn mean(values: &[f64]) -> Option<f64> {
    if values.is_empty() {
        return None;
    }
    Some(values.iter().sum::<f64>() / (values.len() as f64))
}

/// Urgency score for one subject: deficit below the passing mark, amplified
/// by the subject coefficient, capped to 0..=100. Exactly 0 once the
/// average reaches the excellence mark.
pub fn priority_score(average: f64, coefficient: i64) -> f64 {
    if average >= EXCELLENCE_MARK {
        return 0.0;
    }
    ((PASSING_MARK - average) * (coefficient as f64) * 5.0).clamp(0.0, 100.0)
}

/// Progression over the trailing 30 days: earlier half vs later half,
/// split at day 15.
pub fn trend_over_window(grades: &[GradeRow], now: DateTime<Utc>) -> Trend {
    let window_start = now - Duration::days(TREND_WINDOW_DAYS);
    let split = now - Duration::days(TREND_SPLIT_DAYS);

    let recent: Vec<&GradeRow> = grades.iter().filter(|g| g.date >= window_start).collect();
    if recent.len() < 2 {
        return Trend::InsufficientData;
    }

    let earlier: Vec<f64> = recent
        .iter()
        .filter(|g| g.date < split)
        .map(|g| g.value)
        .collect();
    let later: Vec<f64> = recent
        .iter()
        .filter(|g| g.date >= split)
        .map(|g| g.value)
        .collect();

    let (Some(earlier_avg), Some(later_avg)) = (mean(&earlier), mean(&later)) else {
        return Trend::InsufficientData;
    };

    let diff = later_avg - earlier_avg;
    if diff > TREND_SHIFT {
        Trend::Improving
    } else if diff < -TREND_SHIFT {
        Trend::Declining
    } else {
        Trend::Stable
    }
}

/// Pure aggregation over a student's validated grades. Only subjects that
/// actually have grades appear in `per_subject`, sorted by subject id.
pub fn build_report(
    student: StudentRef,
    grades: &[GradeRow],
    subjects: &HashMap<String, SubjectRef>,
    now: DateTime<Utc>,
) -> PerformanceReport {
    let all_values: Vec<f64> = grades.iter().map(|g| g.value).collect();
    let global_average = mean(&all_values);

    let mut by_subject: HashMap<&str, Vec<f64>> = HashMap::new();
    for g in grades {
        by_subject
            .entry(g.subject_id.as_str())
            .or_default()
            .push(g.value);
    }

    let mut per_subject: Vec<SubjectPerformance> = Vec::new();
    for (subject_id, values) in &by_subject {
        let Some(subject) = subjects.get(*subject_id) else {
            continue;
        };
        let Some(average) = mean(values) else {
            continue;
        };
        per_subject.push(SubjectPerformance {
            subject_id: subject.id.clone(),
            subject_name: subject.name.clone(),
            coefficient: subject.coefficient,
            average,
            sample_count: values.len(),
            priority: priority_score(average, subject.coefficient),
            at_risk: average < PASSING_MARK,
        });
    }
    per_subject.sort_by(|a, b| a.subject_id.cmp(&b.subject_id));

    PerformanceReport {
        student,
        global_average,
        level: Level::from_average(global_average),
        trend: trend_over_window(grades, now),
        per_subject,
    }
}

fn load_student(conn: &Connection, student_id: &str) -> Result<Option<StudentRef>, CoreError> {
    conn.query_row(
        "SELECT s.id, s.first_name, s.last_name, c.name
         FROM students s
         LEFT JOIN classes c ON c.id = s.class_id
         WHERE s.id = ?",
        [student_id],
        |r| {
            let first: String = r.get(1)?;
            let last: String = r.get(2)?;
            Ok(StudentRef {
                id: r.get(0)?,
                display_name: format!("{} {}", first, last),
                class_name: r.get(3)?,
            })
        },
    )
    .optional()
    .map_err(|e| CoreError::new("db_query_failed", e.to_string()))
}

fn load_validated_grades(conn: &Connection, student_id: &str) -> Result<Vec<GradeRow>, CoreError> {
    let mut stmt = conn
        .prepare(
            "SELECT subject_id, value, date
             FROM grades
             WHERE student_id = ? AND validated = 1
             ORDER BY date",
        )
        .map_err(|e| CoreError::new("db_query_failed", e.to_string()))?;
    let rows = stmt
        .query_map([student_id], |r| {
            let subject_id: String = r.get(0)?;
            let value: f64 = r.get(1)?;
            let date: String = r.get(2)?;
            Ok((subject_id, value, date))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(|e| CoreError::new("db_query_failed", e.to_string()))?;

    let mut out = Vec::with_capacity(rows.len());
    for (subject_id, value, date) in rows {
        let date = DateTime::parse_from_rfc3339(&date)
            .map(|d| d.with_timezone(&Utc))
            .map_err(|e| {
                CoreError::new("db_query_failed", format!("bad grade date {}: {}", date, e))
            })?;
        out.push(GradeRow {
            subject_id,
            value,
            date,
        });
    }
    Ok(out)
}

pub fn load_subjects(conn: &Connection) -> Result<HashMap<String, SubjectRef>, CoreError> {
    let mut stmt = conn
        .prepare("SELECT id, name, coefficient FROM subjects")
        .map_err(|e| CoreError::new("db_query_failed", e.to_string()))?;
    let rows = stmt
        .query_map([], |r| {
            Ok(SubjectRef {
                id: r.get(0)?,
                name: r.get(1)?,
                coefficient: r.get(2)?,
            })
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(|e| CoreError::new("db_query_failed", e.to_string()))?;
    Ok(rows.into_iter().map(|s| (s.id.clone(), s)).collect())
}

/// Analyze one student's validated grades. Read-only; an unknown student is
/// an error, a student without grades is a neutral report.
pub fn analyze_student(
    conn: &Connection,
    student_id: &str,
    now: DateTime<Utc>,
) -> Result<PerformanceReport, CoreError> {
    let Some(student) = load_student(conn, student_id)? else {
        return Err(CoreError::new("not_found", "student not found"));
    };
    let grades = load_validated_grades(conn, student_id)?;
    let subjects = load_subjects(conn)?;
    Ok(build_report(student, &grades, &subjects, now))
}
