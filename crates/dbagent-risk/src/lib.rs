//! Static, multi-axis SQL risk evaluator.
//!
//! Five additive scoring axes (operation type, blast radius, referential
//! integrity, performance, injection heuristics), a hardcoded
//! dangerous-pattern list, and fixed 30/60/80 level thresholds.
//! `estimated_impact` rides along as a one-word damage summary distinct
//! from `level`.
//!
//! This crate is pure: no I/O, no async, no knowledge of the scheduler that
//! consumes its output.

use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;

/// Overall risk bucket, assigned from the additive score.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RiskLevel {
    Low,
    Medium,
    High,
    Critical,
}

impl RiskLevel {
    fn from_score(score: f64) -> Self {
        if score >= 80.0 {
            RiskLevel::Critical
        } else if score >= 60.0 {
            RiskLevel::High
        } else if score >= 30.0 {
            RiskLevel::Medium
        } else {
            RiskLevel::Low
        }
    }
}

/// Coarse estimate of how much data a statement could touch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EstimatedImpact {
    Low,
    Medium,
    High,
}

/// Optional schema-shape hints the caller can supply to sharpen the scope
/// and integrity axes. Table sizes and foreign-key membership come from an
/// out-of-band schema cache the caller owns; this crate never queries a
/// live connection itself.
#[derive(Debug, Clone, Default)]
pub struct RiskContext {
    /// Known row counts, keyed by table name.
    pub table_sizes: std::collections::HashMap<String, u64>,
    /// Table names known to be referenced by a foreign key from elsewhere.
    pub foreign_keys: HashSet<String>,
}

/// Full assessment of one SQL statement.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RiskAssessment {
    pub level: RiskLevel,
    /// Raw additive score, clamped to `[0, 100]`.
    pub score: f64,
    pub reasons: Vec<String>,
    pub recommendations: Vec<String>,
    pub requires_confirmation: bool,
    pub estimated_impact: EstimatedImpact,
    pub affected_tables: Vec<String>,
    pub operation_type: String,
}

const OPERATIONS: &[&str] = &[
    "SELECT", "INSERT", "UPDATE", "DELETE", "CREATE", "ALTER", "DROP", "TRUNCATE",
];

fn operation_weight(op: &str) -> f64 {
    match op {
        "SELECT" => 1.0,
        "INSERT" => 2.0,
        "UPDATE" => 3.0,
        "DELETE" => 4.0,
        "CREATE" => 2.5,
        "ALTER" => 4.5,
        "DROP" => 5.0,
        "TRUNCATE" => 4.8,
        _ => 2.0,
    }
}

static RE_DROP_TABLE: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?i)\bDROP\s+TABLE\b").unwrap());
static RE_TRUNCATE_TABLE: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?i)\bTRUNCATE\s+TABLE\b").unwrap());
static RE_ALTER_DROP: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?is)\bALTER\s+TABLE\b.*\bDROP\b").unwrap());
static RE_DROP_DATABASE: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?i)\bDROP\s+DATABASE\b").unwrap());
static RE_DROP_SCHEMA: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?i)\bDROP\s+SCHEMA\b").unwrap());
static RE_JOIN: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?i)\bJOIN\b").unwrap());

static TABLE_NAME_PATTERNS: Lazy<Vec<Regex>> = Lazy::new(|| {
    [
        r"(?i)FROM\s+(\w+)",
        r"(?i)JOIN\s+(\w+)",
        r"(?i)UPDATE\s+(\w+)",
        r"(?i)INSERT\s+INTO\s+(\w+)",
        r"(?i)DELETE\s+FROM\s+(\w+)",
        r"(?i)CREATE\s+TABLE\s+(\w+)",
        r"(?i)ALTER\s+TABLE\s+(\w+)",
        r"(?i)DROP\s+TABLE\s+(\w+)",
        r"(?i)TRUNCATE\s+TABLE\s+(\w+)",
    ]
    .iter()
    .map(|p| Regex::new(p).unwrap())
    .collect()
});

static INJECTION_PATTERNS: Lazy<Vec<Regex>> = Lazy::new(|| {
    [
        r"(?is)'.*?OR.*?'.*?'",
        r"(?is)'.*?UNION.*?SELECT",
        r"(?is)'.*?;.*?--",
        r"(?is)'.*?;.*?DROP",
    ]
    .iter()
    .map(|p| Regex::new(p).unwrap())
    .collect()
});

fn extract_operation_type(sql: &str) -> String {
    let upper = sql.to_uppercase();
    let upper = upper.trim_start();
    for op in OPERATIONS {
        if upper.starts_with(op) {
            return op.to_string();
        }
    }
    "UNKNOWN".to_string()
}

fn extract_table_names(sql: &str) -> Vec<String> {
    let mut tables = HashSet::new();
    for re in TABLE_NAME_PATTERNS.iter() {
        for cap in re.captures_iter(sql) {
            tables.insert(cap[1].to_string());
        }
    }
    let mut tables: Vec<String> = tables.into_iter().collect();
    tables.sort();
    tables
}

/// Named dangerous pattern checks. Missing-WHERE on `DELETE`/`UPDATE` is
/// scored separately in `assess_operation_risk`, not here, to avoid
/// double-counting the same condition.
fn dangerous_pattern_hits(sql: &str) -> Vec<&'static str> {
    let mut hits = Vec::new();
    if RE_DROP_TABLE.is_match(sql) {
        hits.push("DROP TABLE");
    }
    if RE_TRUNCATE_TABLE.is_match(sql) {
        hits.push("TRUNCATE TABLE");
    }
    if RE_ALTER_DROP.is_match(sql) {
        hits.push("ALTER TABLE ... DROP");
    }
    if RE_DROP_DATABASE.is_match(sql) {
        hits.push("DROP DATABASE");
    }
    if RE_DROP_SCHEMA.is_match(sql) {
        hits.push("DROP SCHEMA");
    }
    hits
}

fn assess_operation_risk(operation_type: &str, sql: &str, sql_upper: &str) -> (f64, Vec<String>) {
    let mut score = operation_weight(operation_type) * 10.0;
    let mut reasons = Vec::new();

    for pattern in dangerous_pattern_hits(sql) {
        score += 30.0;
        reasons.push(format!("dangerous pattern detected: {pattern}"));
    }

    if matches!(operation_type, "DROP" | "TRUNCATE") {
        reasons.push("high-risk operation: may cause permanent data loss".to_string());
    } else if matches!(operation_type, "DELETE" | "UPDATE") && !sql_upper.contains("WHERE") {
        score += 25.0;
        reasons.push("missing WHERE clause: may affect all rows".to_string());
    }

    (score, reasons)
}

fn assess_scope_risk(tables: &[String], context: &RiskContext) -> (f64, Vec<String>) {
    let mut score = 0.0;
    let mut reasons = Vec::new();

    if tables.len() > 3 {
        score += 15.0;
        reasons.push(format!("touches {} tables: elevated operational complexity", tables.len()));
    }

    for table in tables {
        if let Some(&size) = context.table_sizes.get(table) {
            if size > 1_000_000 {
                score += 20.0;
                reasons.push(format!("large table operation ({table}): may affect performance"));
            }
        }
    }

    (score, reasons)
}

fn assess_integrity_risk(sql_upper: &str, tables: &[String], context: &RiskContext) -> (f64, Vec<String>) {
    let mut score = 0.0;
    let mut reasons = Vec::new();

    if (sql_upper.contains("DELETE") || sql_upper.contains("UPDATE"))
        && tables.iter().any(|t| context.foreign_keys.contains(t))
    {
        score += 10.0;
        reasons.push("may affect foreign key relationships".to_string());
    }

    (score, reasons)
}

fn assess_performance_risk(sql: &str, sql_upper: &str) -> (f64, Vec<String>) {
    let mut score = 0.0;
    let mut reasons = Vec::new();

    if !sql_upper.contains("WHERE") && sql_upper.contains("SELECT") {
        score += 15.0;
        reasons.push("may cause a full table scan".to_string());
    }

    let join_count = RE_JOIN.find_iter(sql).count();
    if join_count > 2 {
        score += join_count as f64 * 5.0;
        reasons.push(format!("complex join ({join_count} joins): may affect performance"));
    }

    (score, reasons)
}

fn assess_security_risk(sql: &str) -> (f64, Vec<String>) {
    for pattern in INJECTION_PATTERNS.iter() {
        if pattern.is_match(sql) {
            return (40.0, vec!["potential SQL injection pattern detected".to_string()]);
        }
    }
    (0.0, Vec::new())
}

fn generate_recommendations(operation_type: &str, level: RiskLevel, reasons: &[String], sql_upper: &str) -> Vec<String> {
    let mut recs = Vec::new();

    if matches!(level, RiskLevel::High | RiskLevel::Critical) {
        recs.push("verify this operation in a test environment first".to_string());
    }
    if !sql_upper.contains("WHERE") && matches!(operation_type, "UPDATE" | "DELETE") {
        recs.push("add a WHERE clause to limit the affected rows".to_string());
    }
    if matches!(operation_type, "DROP" | "TRUNCATE") {
        recs.push("take a backup before running this statement".to_string());
    }
    if reasons.iter().any(|r| r == "may cause a full table scan") {
        recs.push("add an appropriate index or WHERE clause".to_string());
    }

    recs
}

fn requires_confirmation(level: RiskLevel, operation_type: &str, sql_upper: &str) -> bool {
    if matches!(level, RiskLevel::High | RiskLevel::Critical) {
        return true;
    }
    if matches!(operation_type, "DROP" | "TRUNCATE" | "ALTER") {
        return true;
    }
    if matches!(operation_type, "UPDATE" | "DELETE") && !sql_upper.contains("WHERE") {
        return true;
    }
    false
}

fn estimate_impact(operation_type: &str, sql_upper: &str) -> EstimatedImpact {
    if matches!(operation_type, "DROP" | "TRUNCATE") {
        EstimatedImpact::High
    } else if matches!(operation_type, "DELETE" | "UPDATE") && !sql_upper.contains("WHERE") {
        EstimatedImpact::High
    } else if matches!(operation_type, "ALTER" | "CREATE") {
        EstimatedImpact::Medium
    } else {
        EstimatedImpact::Low
    }
}

/// Evaluate one SQL statement across all five risk axes.
///
/// Pure and deterministic: the same `(sql, context)` always yields the same
/// assessment. `context` is optional schema-shape knowledge the caller may
/// not have; its absence must never itself raise the score, only withhold
/// the sharper scope/integrity signal it would otherwise add.
pub fn evaluate(sql: &str, context: Option<&RiskContext>) -> RiskAssessment {
    let sql = sql.trim();
    let sql_upper = sql.to_uppercase();
    let empty_context = RiskContext::default();
    let context = context.unwrap_or(&empty_context);

    let operation_type = extract_operation_type(sql);
    let affected_tables = extract_table_names(sql);

    let mut reasons = Vec::new();
    let mut total_score = 0.0;

    let (op_score, op_reasons) = assess_operation_risk(&operation_type, sql, &sql_upper);
    total_score += op_score;
    reasons.extend(op_reasons);

    let (scope_score, scope_reasons) = assess_scope_risk(&affected_tables, context);
    total_score += scope_score;
    reasons.extend(scope_reasons);

    let (integrity_score, integrity_reasons) = assess_integrity_risk(&sql_upper, &affected_tables, context);
    total_score += integrity_score;
    reasons.extend(integrity_reasons);

    let (perf_score, perf_reasons) = assess_performance_risk(sql, &sql_upper);
    total_score += perf_score;
    reasons.extend(perf_reasons);

    let (sec_score, sec_reasons) = assess_security_risk(sql);
    total_score += sec_score;
    reasons.extend(sec_reasons);

    let level = RiskLevel::from_score(total_score);
    let recommendations = generate_recommendations(&operation_type, level, &reasons, &sql_upper);
    let requires_confirmation = requires_confirmation(level, &operation_type, &sql_upper);
    let estimated_impact = estimate_impact(&operation_type, &sql_upper);

    RiskAssessment {
        level,
        score: total_score.min(100.0),
        reasons,
        recommendations,
        requires_confirmation,
        estimated_impact,
        affected_tables,
        operation_type,
    }
}
