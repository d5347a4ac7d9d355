// ============================================================================
// QUERY PLAN INTELLIGENCE
// ============================================================================
// Turns EXPLAIN payloads already present on records into structured plan
// attributes and tracks per-query plan history for regression detection.
// Nothing here ever talks to a database.
//
//   raw payload ──▶ PlanParser (dialect) ──▶ PlanNode tree ──▶ PlanSummary
//                                                                 │
//                                  PlanHistory (per query id) ◀───┘
//                                           │
//                                           ▼
//                                    PlanRegression
// ============================================================================

pub mod anonymizer;
mod extractor;
pub mod history;
mod mysql;
mod postgres;

use std::hash::Hasher;
use std::time::Duration;

use compact_str::CompactString;
use serde::{Deserialize, Serialize};
use smallvec::SmallVec;
use xxhash_rust::xxh3::Xxh3;

use crate::config::PlanExtractorConfig;
use crate::error::{ProcessingError, ProcessingResult};
use crate::types::{Clock, Instant};

pub use anonymizer::QueryAnonymizer;
pub use extractor::{attrs, PlanExtractor};
pub use history::{PerformanceSnapshot, PlanHistory, PlanObservation, PlanRegression, RegressionSeverity};

// ----------------------------------------------------------------------------
// Dialects
// ----------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PlanDialect {
    PostgreSql,
    MySql,
}

impl PlanDialect {
    pub fn as_str(&self) -> &'static str {
        match self {
            PlanDialect::PostgreSql => "postgresql",
            PlanDialect::MySql => "mysql",
        }
    }

    /// Map a `db.system` style name onto a dialect.
    pub fn from_system(name: &str) -> Option<Self> {
        match name.trim().to_ascii_lowercase().as_str() {
            "postgresql" | "postgres" | "pg" => Some(PlanDialect::PostgreSql),
            "mysql" | "mariadb" => Some(PlanDialect::MySql),
            _ => None,
        }
    }

    /// Guess the dialect from the payload shape.
    pub fn detect(raw: &str) -> Option<Self> {
        let trimmed = raw.trim_start();
        if trimmed.starts_with('{') || trimmed.starts_with('[') {
            if raw.contains("\"query_block\"") {
                Some(PlanDialect::MySql)
            } else if raw.contains("\"Plan\"") || raw.contains("\"Node Type\"") {
                Some(PlanDialect::PostgreSql)
            } else {
                None
            }
        } else if raw.contains("(cost=") {
            Some(PlanDialect::PostgreSql)
        } else {
            None
        }
    }
}

// ----------------------------------------------------------------------------
// Plan Tree
// ----------------------------------------------------------------------------

/// One operator of a parsed plan, dialect neutral.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PlanNode {
    pub node_type: CompactString,
    pub relation: Option<CompactString>,
    pub index: Option<CompactString>,
    pub join_type: Option<CompactString>,
    pub total_cost: Option<f64>,
    pub rows: Option<f64>,
    /// Reads every row of `relation`
    pub full_scan: bool,
    pub children: Vec<PlanNode>,
}

impl PlanNode {
    pub fn new(node_type: impl Into<CompactString>) -> Self {
        Self {
            node_type: node_type.into(),
            ..Default::default()
        }
    }

    fn is_nested_loop(&self) -> bool {
        self.node_type == "Nested Loop"
    }
}

/// Parse-time budget checked while walking a plan.
pub struct Deadline<'a> {
    clock: &'a Clock,
    expires_at: Instant,
    timeout: Duration,
}

impl<'a> Deadline<'a> {
    pub fn new(clock: &'a Clock, timeout: Duration) -> Self {
        Self {
            clock,
            expires_at: clock.now() + timeout,
            timeout,
        }
    }

    #[inline]
    pub fn check(&self) -> ProcessingResult<()> {
        if self.clock.now() > self.expires_at {
            Err(ProcessingError::ParseTimeout {
                timeout_ms: self.timeout.as_millis() as u64,
            })
        } else {
            Ok(())
        }
    }
}

/// Dialect specific front end producing a [`PlanNode`] tree.
pub trait PlanParser: Send + Sync {
    fn dialect(&self) -> PlanDialect;

    fn parse(&self, raw: &str, deadline: &Deadline<'_>) -> ProcessingResult<PlanNode>;
}

fn parser_for(dialect: PlanDialect, raw: &str) -> &'static dyn PlanParser {
    match dialect {
        PlanDialect::MySql => &mysql::MySqlJsonParser,
        PlanDialect::PostgreSql => {
            let trimmed = raw.trim_start();
            if trimmed.starts_with('{') || trimmed.starts_with('[') {
                &postgres::PostgresJsonParser
            } else {
                &postgres::PostgresTextParser
            }
        }
    }
}

/// Parse a JSON number that may also arrive as a string (`"12.50"`).
pub(crate) fn json_f64(value: Option<&serde_json::Value>) -> Option<f64> {
    match value? {
        serde_json::Value::Number(n) => n.as_f64(),
        serde_json::Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

pub(crate) fn json_str(value: Option<&serde_json::Value>) -> Option<CompactString> {
    value
        .and_then(|v| v.as_str())
        .filter(|s| !s.is_empty())
        .map(CompactString::from)
}

// ----------------------------------------------------------------------------
// Plan Summary
// ----------------------------------------------------------------------------

/// Attributes derived from a parsed plan.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PlanSummary {
    pub dialect: PlanDialect,
    /// Structural hash: operators, relations, indexes, join types and shape
    pub hash: u64,
    pub root_operation: CompactString,
    /// Distinct node types in pre-order of first appearance
    pub node_types: SmallVec<[CompactString; 8]>,
    pub total_cost: f64,
    pub estimated_rows: f64,
    pub tables: SmallVec<[CompactString; 4]>,
    pub indexes: SmallVec<[CompactString; 4]>,
    /// Fully scanned relations and the rows each scan is estimated to read
    pub seq_scans: SmallVec<[(CompactString, f64); 4]>,
    pub nested_loop_depth: u32,
    pub node_count: u32,
    pub depth: u32,
}

impl PlanSummary {
    pub fn from_tree(dialect: PlanDialect, root: &PlanNode) -> Self {
        let mut summary = Self {
            dialect,
            hash: structural_hash(root),
            root_operation: root.node_type.clone(),
            node_types: SmallVec::new(),
            total_cost: root.total_cost.unwrap_or(0.0),
            estimated_rows: root.rows.unwrap_or(0.0),
            tables: SmallVec::new(),
            indexes: SmallVec::new(),
            seq_scans: SmallVec::new(),
            nested_loop_depth: 0,
            node_count: 0,
            depth: 0,
        };
        summary.visit(root, 1, 0);
        summary
    }

    fn visit(&mut self, node: &PlanNode, depth: u32, loops_above: u32) {
        self.node_count += 1;
        self.depth = self.depth.max(depth);

        let loops = loops_above + u32::from(node.is_nested_loop());
        self.nested_loop_depth = self.nested_loop_depth.max(loops);

        if !self.node_types.contains(&node.node_type) {
            self.node_types.push(node.node_type.clone());
        }
        if let Some(table) = &node.relation {
            if !self.tables.contains(table) {
                self.tables.push(table.clone());
            }
            if node.full_scan {
                self.seq_scans.push((table.clone(), node.rows.unwrap_or(0.0)));
            }
        }
        if let Some(index) = &node.index {
            if !self.indexes.contains(index) {
                self.indexes.push(index.clone());
            }
        }
        for child in &node.children {
            self.visit(child, depth + 1, loops);
        }
    }

    /// Hash rendered the way it is attached to records.
    pub fn hash_hex(&self) -> String {
        format!("{:016x}", self.hash)
    }

    #[inline]
    pub fn has_seq_scan(&self) -> bool {
        !self.seq_scans.is_empty()
    }

    #[inline]
    pub fn has_nested_loop(&self) -> bool {
        self.nested_loop_depth > 0
    }

    /// Rows produced per unit of cost; 0 when the plan has no cost.
    pub fn efficiency(&self) -> f64 {
        if self.total_cost > 0.0 {
            self.estimated_rows / self.total_cost
        } else {
            0.0
        }
    }

    /// Largest fully scanned relation, if any.
    pub fn largest_seq_scan(&self) -> Option<(&str, f64)> {
        self.seq_scans
            .iter()
            .max_by(|a, b| a.1.total_cmp(&b.1))
            .map(|(table, rows)| (table.as_str(), *rows))
    }

    pub fn needs_optimization(&self, config: &PlanExtractorConfig) -> bool {
        self.seq_scans.iter().any(|(_, rows)| *rows >= config.large_table_rows)
            || self.total_cost >= config.high_cost_threshold
            || self.nested_loop_depth >= 3
    }
}

fn structural_hash(root: &PlanNode) -> u64 {
    fn walk(node: &PlanNode, hasher: &mut Xxh3) {
        hasher.write(node.node_type.as_bytes());
        for part in [&node.relation, &node.index, &node.join_type] {
            hasher.write_u8(0x1f);
            if let Some(text) = part {
                hasher.write(text.as_bytes());
            }
        }
        hasher.write_u8(u8::from(node.full_scan));
        hasher.write_u32(node.children.len() as u32);
        hasher.write_u8(b'(');
        for child in &node.children {
            walk(child, hasher);
        }
        hasher.write_u8(b')');
    }

    let mut hasher = Xxh3::new();
    walk(root, &mut hasher);
    hasher.finish()
}

// ----------------------------------------------------------------------------
// Extraction
// ----------------------------------------------------------------------------

/// Parse `raw` into a summary. `dialect = None` detects it from the payload.
pub fn extract(
    raw: &str,
    dialect: Option<PlanDialect>,
    config: &PlanExtractorConfig,
    clock: &Clock,
) -> ProcessingResult<PlanSummary> {
    if raw.len() > config.max_plan_bytes {
        return Err(ProcessingError::PlanTooLarge {
            size: raw.len(),
            limit: config.max_plan_bytes,
        });
    }
    let dialect = match dialect.or_else(|| PlanDialect::detect(raw)) {
        Some(dialect) => dialect,
        None => {
            return Err(ProcessingError::UnsupportedDialect {
                dialect: "unknown".into(),
            })
        }
    };

    let deadline = Deadline::new(clock, config.parse_timeout);
    let parser = parser_for(dialect, raw);
    let root = parser.parse(raw, &deadline)?;
    Ok(PlanSummary::from_tree(parser.dialect(), &root))
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    const PG_JSON: &str = r#"[{"Plan": {
        "Node Type": "Nested Loop", "Join Type": "Inner", "Total Cost": 250.5, "Plan Rows": 120,
        "Plans": [
            {"Node Type": "Seq Scan", "Relation Name": "orders", "Total Cost": 180.0, "Plan Rows": 50000},
            {"Node Type": "Index Scan", "Relation Name": "users", "Index Name": "users_pkey",
             "Total Cost": 0.3, "Plan Rows": 1}
        ]
    }}]"#;

    fn config() -> PlanExtractorConfig {
        PlanExtractorConfig::default()
    }

    #[test]
    fn test_dialect_detection() {
        assert_eq!(PlanDialect::detect(PG_JSON), Some(PlanDialect::PostgreSql));
        assert_eq!(PlanDialect::detect(r#"{"query_block": {}}"#), Some(PlanDialect::MySql));
        assert_eq!(
            PlanDialect::detect("Seq Scan on t  (cost=0.00..1.00 rows=1 width=4)"),
            Some(PlanDialect::PostgreSql)
        );
        assert_eq!(PlanDialect::detect("hello"), None);
        assert_eq!(PlanDialect::from_system("PostgreSQL"), Some(PlanDialect::PostgreSql));
        assert_eq!(PlanDialect::from_system("oracle"), None);
    }

    #[test]
    fn test_summary_of_postgres_json() {
        let (clock, _mock) = Clock::mock();
        let summary = extract(PG_JSON, None, &config(), &clock).unwrap();

        assert_eq!(summary.root_operation, "Nested Loop");
        assert_eq!(summary.node_count, 3);
        assert_eq!(summary.depth, 2);
        assert_eq!(summary.total_cost, 250.5);
        let tables: Vec<&str> = summary.tables.iter().map(|t| t.as_str()).collect();
        assert_eq!(tables, vec!["orders", "users"]);
        assert_eq!(summary.indexes.len(), 1);
        assert_eq!(summary.largest_seq_scan(), Some(("orders", 50000.0)));
        assert!(summary.has_nested_loop());
        assert!(summary.needs_optimization(&config()));
        assert!((summary.efficiency() - 120.0 / 250.5).abs() < 1e-9);
    }

    #[test]
    fn test_hash_ignores_costs_but_not_structure() {
        let (clock, _mock) = Clock::mock();
        let first = extract(PG_JSON, None, &config(), &clock).unwrap();
        let again = extract(PG_JSON, None, &config(), &clock).unwrap();
        assert_eq!(first.hash, again.hash);

        let recosted = PG_JSON.replace("250.5", "999.0").replace("50000", "7");
        assert_eq!(extract(&recosted, None, &config(), &clock).unwrap().hash, first.hash);

        let reindexed = PG_JSON.replace("users_pkey", "users_email_idx");
        assert_ne!(extract(&reindexed, None, &config(), &clock).unwrap().hash, first.hash);
    }

    #[test]
    fn test_size_limit_and_unknown_dialect() {
        let (clock, _mock) = Clock::mock();
        let small = PlanExtractorConfig {
            max_plan_bytes: 16,
            ..config()
        };
        assert!(matches!(
            extract(PG_JSON, None, &small, &clock),
            Err(ProcessingError::PlanTooLarge { .. })
        ));
        assert!(matches!(
            extract("not a plan", None, &config(), &clock),
            Err(ProcessingError::UnsupportedDialect { .. })
        ));
    }

    #[test]
    fn test_expired_deadline_aborts_parse() {
        let (clock, mock) = Clock::mock();
        let deadline = Deadline::new(&clock, Duration::from_millis(100));
        assert!(deadline.check().is_ok());
        mock.increment(Duration::from_millis(101));
        assert_eq!(
            deadline.check(),
            Err(ProcessingError::ParseTimeout { timeout_ms: 100 })
        );
    }
}
