//! MySQL `EXPLAIN FORMAT=JSON` front end.

use compact_str::CompactString;
use serde_json::Value;

use super::{json_f64, json_str, Deadline, PlanDialect, PlanNode, PlanParser};
use crate::error::{ProcessingError, ProcessingResult};

const DIALECT: &str = "mysql";

fn malformed(message: impl Into<String>) -> ProcessingError {
    ProcessingError::malformed_plan(DIALECT, message)
}

pub(super) struct MySqlJsonParser;

impl PlanParser for MySqlJsonParser {
    fn dialect(&self) -> PlanDialect {
        PlanDialect::MySql
    }

    fn parse(&self, raw: &str, deadline: &Deadline<'_>) -> ProcessingResult<PlanNode> {
        let value: Value = serde_json::from_str(raw).map_err(|e| malformed(e.to_string()))?;
        let block = value
            .get("query_block")
            .ok_or_else(|| malformed("missing \"query_block\""))?;
        query_block(block, deadline)
    }
}

fn query_block(block: &Value, deadline: &Deadline<'_>) -> ProcessingResult<PlanNode> {
    deadline.check()?;
    let mut root = PlanNode::new("Query Block");
    root.total_cost = json_f64(block.get("cost_info").and_then(|c| c.get("query_cost")));
    root.children = operations(block, deadline)?;
    if root.children.is_empty() {
        return Err(malformed("query block without tables"));
    }
    // Estimated rows of a block: the largest per-scan estimate beneath it.
    root.rows = max_rows(&root.children);
    Ok(root)
}

fn max_rows(nodes: &[PlanNode]) -> Option<f64> {
    nodes
        .iter()
        .flat_map(|n| n.rows.into_iter().chain(max_rows(&n.children)))
        .reduce(f64::max)
}

/// Operators found directly inside a block-like object.
fn operations(value: &Value, deadline: &Deadline<'_>) -> ProcessingResult<Vec<PlanNode>> {
    deadline.check()?;
    let mut out = Vec::new();

    if let Some(table) = value.get("table") {
        out.push(table_node(table, deadline)?);
    }
    if let Some(items) = value.get("nested_loop") {
        let items = items
            .as_array()
            .ok_or_else(|| malformed("\"nested_loop\" is not an array"))?;
        let mut join = PlanNode::new("Nested Loop");
        for item in items {
            join.children.extend(operations(item, deadline)?);
        }
        out.push(join);
    }
    for (key, node_type) in [
        ("ordering_operation", "Sort"),
        ("grouping_operation", "Aggregate"),
        ("duplicates_removal", "Unique"),
        ("windowing", "Window"),
    ] {
        if let Some(inner) = value.get(key) {
            let mut node = PlanNode::new(node_type);
            node.children = operations(inner, deadline)?;
            out.push(node);
        }
    }
    Ok(out)
}

fn table_node(table: &Value, deadline: &Deadline<'_>) -> ProcessingResult<PlanNode> {
    deadline.check()?;
    let access = table
        .get("access_type")
        .and_then(Value::as_str)
        .unwrap_or("unknown");

    let node_type = match access {
        "ALL" => CompactString::from("Table Scan"),
        "index" => CompactString::from("Full Index Scan"),
        "range" => CompactString::from("Index Range Scan"),
        "ref" | "eq_ref" | "ref_or_null" => CompactString::from("Index Lookup"),
        "const" | "system" => CompactString::from("Constant Lookup"),
        other => CompactString::from(format!("Access ({})", other)),
    };
    let cost_info = table.get("cost_info");

    let mut node = PlanNode {
        node_type,
        relation: json_str(table.get("table_name")),
        index: json_str(table.get("key")),
        join_type: None,
        total_cost: json_f64(cost_info.and_then(|c| c.get("prefix_cost")))
            .or_else(|| json_f64(cost_info.and_then(|c| c.get("read_cost")))),
        rows: json_f64(table.get("rows_examined_per_scan")),
        full_scan: access == "ALL",
        children: Vec::new(),
    };

    if let Some(sub) = table.get("materialized_from_subquery") {
        if let Some(block) = sub.get("query_block") {
            node.children.push(query_block(block, deadline)?);
        }
    }
    Ok(node)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::plan::PlanSummary;
    use crate::types::Clock;
    use pretty_assertions::assert_eq;
    use std::time::Duration;

    const MYSQL_PLAN: &str = r#"{
      "query_block": {
        "select_id": 1,
        "cost_info": {"query_cost": "20512.40"},
        "ordering_operation": {
          "using_filesort": true,
          "nested_loop": [
            {"table": {"table_name": "orders", "access_type": "ALL",
                       "rows_examined_per_scan": 48000,
                       "cost_info": {"read_cost": "120.00", "prefix_cost": "4920.00"}}},
            {"table": {"table_name": "customers", "access_type": "eq_ref", "key": "PRIMARY",
                       "rows_examined_per_scan": 1,
                       "cost_info": {"prefix_cost": "20512.40"}}}
          ]
        }
      }
    }"#;

    fn parse(raw: &str) -> ProcessingResult<PlanNode> {
        let clock = Clock::new();
        let deadline = Deadline::new(&clock, Duration::from_secs(1));
        MySqlJsonParser.parse(raw, &deadline)
    }

    #[test]
    fn test_mysql_plan_tree() {
        let root = parse(MYSQL_PLAN).unwrap();
        let summary = PlanSummary::from_tree(PlanDialect::MySql, &root);

        assert_eq!(summary.root_operation, "Query Block");
        assert_eq!(summary.total_cost, 20512.4);
        assert_eq!(summary.estimated_rows, 48000.0);
        assert_eq!(summary.largest_seq_scan(), Some(("orders", 48000.0)));
        assert_eq!(summary.nested_loop_depth, 1);
        assert_eq!(summary.depth, 4);
        assert_eq!(summary.indexes.len(), 1);
    }

    #[test]
    fn test_mysql_rejects_unknown_shapes() {
        assert!(parse(r#"{"plan": {}}"#).is_err());
        assert!(parse(r#"{"query_block": {"select_id": 1}}"#).is_err());
        assert!(parse(r#"{"query_block": {"nested_loop": {}}}"#).is_err());
    }
}
