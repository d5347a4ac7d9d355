//! PostgreSQL `EXPLAIN` front ends: `FORMAT JSON` and the default text form.

use compact_str::CompactString;
use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::Value;

use super::{json_f64, json_str, Deadline, PlanDialect, PlanNode, PlanParser};
use crate::error::{ProcessingError, ProcessingResult};

const DIALECT: &str = "postgresql";

fn malformed(message: impl Into<String>) -> ProcessingError {
    ProcessingError::malformed_plan(DIALECT, message)
}

fn is_full_scan(node_type: &str) -> bool {
    node_type == "Seq Scan" || node_type == "Parallel Seq Scan"
}

// ----------------------------------------------------------------------------
// JSON
// ----------------------------------------------------------------------------

pub(super) struct PostgresJsonParser;

impl PlanParser for PostgresJsonParser {
    fn dialect(&self) -> PlanDialect {
        PlanDialect::PostgreSql
    }

    fn parse(&self, raw: &str, deadline: &Deadline<'_>) -> ProcessingResult<PlanNode> {
        let value: Value = serde_json::from_str(raw).map_err(|e| malformed(e.to_string()))?;

        // `[{"Plan": {...}}]`, `{"Plan": {...}}` or a bare node.
        let top = match &value {
            Value::Array(items) => items.first().ok_or_else(|| malformed("empty plan array"))?,
            other => other,
        };
        let plan = top.get("Plan").unwrap_or(top);
        if !plan.is_object() {
            return Err(malformed("plan is not an object"));
        }
        json_node(plan, deadline)
    }
}

fn json_node(value: &Value, deadline: &Deadline<'_>) -> ProcessingResult<PlanNode> {
    deadline.check()?;

    let node_type = json_str(value.get("Node Type")).ok_or_else(|| malformed("node without \"Node Type\""))?;
    let mut node = PlanNode {
        full_scan: is_full_scan(&node_type),
        relation: json_str(value.get("Relation Name")),
        index: json_str(value.get("Index Name")),
        join_type: json_str(value.get("Join Type")),
        total_cost: json_f64(value.get("Total Cost")),
        rows: json_f64(value.get("Plan Rows")),
        node_type,
        children: Vec::new(),
    };

    if let Some(children) = value.get("Plans") {
        let children = children.as_array().ok_or_else(|| malformed("\"Plans\" is not an array"))?;
        node.children = children
            .iter()
            .map(|child| json_node(child, deadline))
            .collect::<ProcessingResult<_>>()?;
    }
    Ok(node)
}

// ----------------------------------------------------------------------------
// Text
// ----------------------------------------------------------------------------

static NODE_LINE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"^(?P<indent>\s*)(?:->\s+)?(?P<label>\S.*?)\s+\(cost=(?P<startup>[\d.]+)\.\.(?P<total>[\d.]+) rows=(?P<rows>\d+) width=\d+\)",
    )
    .expect("valid plan line regex")
});

static JOIN_LABEL: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^(?P<op>Hash|Merge|Nested Loop)\s+(?P<kind>Left|Right|Full|Semi|Anti)(?: Semi| Anti)?\s+Join$")
        .expect("valid join label regex")
});

pub(super) struct PostgresTextParser;

impl PlanParser for PostgresTextParser {
    fn dialect(&self) -> PlanDialect {
        PlanDialect::PostgreSql
    }

    fn parse(&self, raw: &str, deadline: &Deadline<'_>) -> ProcessingResult<PlanNode> {
        let mut stack: Vec<(usize, PlanNode)> = Vec::new();
        let mut root: Option<PlanNode> = None;

        for line in raw.lines() {
            deadline.check()?;
            // Detail lines (Filter:, Sort Key:, ...) carry no cost block.
            let Some(caps) = NODE_LINE.captures(line) else {
                continue;
            };
            let indent = caps["indent"].len();
            let node = text_node(&caps["label"], &caps["total"], &caps["rows"]);

            while stack.last().is_some_and(|(top, _)| *top >= indent) {
                if let Some((_, finished)) = stack.pop() {
                    attach(&mut stack, &mut root, finished)?;
                }
            }
            stack.push((indent, node));
        }
        while let Some((_, finished)) = stack.pop() {
            attach(&mut stack, &mut root, finished)?;
        }
        root.ok_or_else(|| malformed("no plan nodes found"))
    }
}

fn attach(stack: &mut [(usize, PlanNode)], root: &mut Option<PlanNode>, node: PlanNode) -> ProcessingResult<()> {
    match stack.last_mut() {
        Some((_, parent)) => {
            parent.children.push(node);
            Ok(())
        }
        None if root.is_none() => {
            *root = Some(node);
            Ok(())
        }
        None => Err(malformed("more than one root node")),
    }
}

/// Split `Index Scan using idx on orders o` into operator, index and relation.
fn text_node(label: &str, total: &str, rows: &str) -> PlanNode {
    let (head, relation) = match label.split_once(" on ") {
        Some((head, rest)) => (head, rest.split_whitespace().next()),
        None => (label, None),
    };
    let (op, index) = match head.split_once(" using ") {
        Some((op, index)) => (op.trim(), Some(index.trim())),
        None => (head.trim(), None),
    };

    let (node_type, join_type) = match JOIN_LABEL.captures(op) {
        Some(caps) => {
            let base = &caps["op"];
            let node_type = if base == "Nested Loop" {
                CompactString::from(base)
            } else {
                CompactString::from(format!("{} Join", base))
            };
            (node_type, Some(CompactString::from(&caps["kind"])))
        }
        None => (CompactString::from(op), None),
    };

    // `Bitmap Index Scan on idx` names the index, not a table.
    let (relation, index) = if node_type == "Bitmap Index Scan" {
        (None, relation.or(index))
    } else {
        (relation, index)
    };

    PlanNode {
        full_scan: is_full_scan(&node_type),
        relation: relation.map(CompactString::from),
        index: index.map(CompactString::from),
        join_type,
        total_cost: total.parse().ok(),
        rows: rows.parse().ok(),
        node_type,
        children: Vec::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::plan::PlanSummary;
    use crate::types::Clock;
    use pretty_assertions::assert_eq;
    use std::time::Duration;

    const TEXT_PLAN: &str = "\
                                  QUERY PLAN
-------------------------------------------------------------------------------
 Hash Left Join  (cost=35.50..82.12 rows=1200 width=16)
   Hash Cond: (o.user_id = u.id)
   ->  Seq Scan on orders o  (cost=0.00..30.40 rows=2040 width=8)
         Filter: (total > 100)
   ->  Hash  (cost=22.00..22.00 rows=1200 width=8)
         ->  Index Scan using users_pkey on users u  (cost=0.28..22.00 rows=1200 width=8)
";

    fn parse_text(raw: &str) -> ProcessingResult<PlanNode> {
        let clock = Clock::new();
        let deadline = Deadline::new(&clock, Duration::from_secs(1));
        PostgresTextParser.parse(raw, &deadline)
    }

    #[test]
    fn test_text_plan_tree() {
        let root = parse_text(TEXT_PLAN).unwrap();
        assert_eq!(root.node_type, "Hash Join");
        assert_eq!(root.join_type.as_deref(), Some("Left"));
        assert_eq!(root.total_cost, Some(82.12));
        assert_eq!(root.children.len(), 2);

        let scan = &root.children[0];
        assert_eq!(scan.node_type, "Seq Scan");
        assert_eq!(scan.relation.as_deref(), Some("orders"));
        assert!(scan.full_scan);

        let hash = &root.children[1];
        assert_eq!(hash.node_type, "Hash");
        let index_scan = &hash.children[0];
        assert_eq!(index_scan.index.as_deref(), Some("users_pkey"));
        assert_eq!(index_scan.relation.as_deref(), Some("users"));

        let summary = PlanSummary::from_tree(PlanDialect::PostgreSql, &root);
        assert_eq!(summary.depth, 3);
        assert_eq!(summary.node_count, 4);
    }

    #[test]
    fn test_text_plan_hash_is_stable() {
        let a = PlanSummary::from_tree(PlanDialect::PostgreSql, &parse_text(TEXT_PLAN).unwrap());
        let b = PlanSummary::from_tree(PlanDialect::PostgreSql, &parse_text(TEXT_PLAN).unwrap());
        assert_eq!(a.hash, b.hash);
    }

    #[test]
    fn test_malformed_inputs() {
        assert!(matches!(parse_text("nothing here"), Err(ProcessingError::MalformedPlan { .. })));

        let clock = Clock::new();
        let deadline = Deadline::new(&clock, Duration::from_secs(1));
        assert!(PostgresJsonParser.parse("{\"Plan\": ", &deadline).is_err());
        assert!(PostgresJsonParser.parse("[]", &deadline).is_err());
        assert!(PostgresJsonParser
            .parse(r#"{"Plan": {"Total Cost": 1.0}}"#, &deadline)
            .is_err());
    }
}
