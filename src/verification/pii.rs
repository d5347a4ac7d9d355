//! PII detection and redaction over text attributes.

use std::ops::Range;
use std::sync::Arc;

use compact_str::CompactString;
use once_cell::sync::Lazy;
use regex::Regex;
use serde::Serialize;
use smallvec::{smallvec, SmallVec};

use crate::config::{EnforcementAction, PiiConfig, PiiPatternKind};
use crate::error::{ConfigError, ConfigResult};
use crate::metrics::PipelineMetrics;
use crate::types::Record;

pub const PII_ACTION_ATTRIBUTE: &str = "pii.action_taken";
pub const PII_PATTERNS_ATTRIBUTE: &str = "pii.patterns";

/// Pattern name reported when a field is too large to scan.
pub const OVERSIZED_FIELD: &str = "oversized_field";

static EMAIL: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)\b[a-z0-9._%+-]+@[a-z0-9.-]+\.[a-z]{2,}\b").expect("valid email regex"));
static SSN: Lazy<Regex> = Lazy::new(|| Regex::new(r"\b\d{3}-\d{2}-\d{4}\b").expect("valid ssn regex"));
static CREDIT_CARD: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\b(?:\d[ -]?){12,18}\d\b").expect("valid credit card regex"));
static PHONE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?:\+?1[-. ]?)?(?:\(\d{3}\)|\b\d{3})[-. ]?\d{3}[-. ]\d{4}\b").expect("valid phone regex")
});
static IPV4: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"\b(?:(?:25[0-5]|2[0-4]\d|1\d\d|[1-9]?\d)\.){3}(?:25[0-5]|2[0-4]\d|1\d\d|[1-9]?\d)\b")
        .expect("valid ipv4 regex")
});

fn builtin(kind: PiiPatternKind) -> Option<&'static Regex> {
    match kind {
        PiiPatternKind::Email => Some(&EMAIL),
        PiiPatternKind::Ssn => Some(&SSN),
        PiiPatternKind::CreditCard => Some(&CREDIT_CARD),
        PiiPatternKind::Phone => Some(&PHONE),
        PiiPatternKind::Ipv4 => Some(&IPV4),
        PiiPatternKind::Custom => None,
    }
}

/// Luhn checksum over the digits of `candidate`.
pub fn luhn_valid(candidate: &str) -> bool {
    let digits: SmallVec<[u32; 19]> = candidate.chars().filter_map(|c| c.to_digit(10)).collect();
    if !(13..=19).contains(&digits.len()) {
        return false;
    }
    let sum: u32 = digits
        .iter()
        .rev()
        .enumerate()
        .map(|(i, &d)| {
            if i % 2 == 1 {
                let doubled = d * 2;
                if doubled > 9 {
                    doubled - 9
                } else {
                    doubled
                }
            } else {
                d
            }
        })
        .sum();
    sum % 10 == 0
}

struct CompiledPattern {
    name: CompactString,
    kind: PiiPatternKind,
    regex: Regex,
    action: EnforcementAction,
}

impl CompiledPattern {
    fn matches<'t>(&'t self, text: &'t str) -> impl Iterator<Item = Range<usize>> + 't {
        self.regex
            .find_iter(text)
            .filter(|m| self.kind != PiiPatternKind::CreditCard || luhn_valid(m.as_str()))
            .map(|m| m.range())
    }
}

/// PII found in one attribute.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PiiFinding {
    pub field: CompactString,
    pub patterns: SmallVec<[CompactString; 2]>,
    pub action: EnforcementAction,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct PiiReport {
    pub findings: Vec<PiiFinding>,
}

impl PiiReport {
    /// Strictest action across all fields.
    pub fn action(&self) -> Option<EnforcementAction> {
        self.findings.iter().map(|f| f.action).max()
    }

    /// Sorted distinct pattern names.
    pub fn pattern_names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self
            .findings
            .iter()
            .flat_map(|f| f.patterns.iter().map(CompactString::as_str))
            .collect();
        names.sort_unstable();
        names.dedup();
        names
    }
}

pub struct PiiDetector {
    config: PiiConfig,
    patterns: Vec<CompiledPattern>,
    metrics: Arc<PipelineMetrics>,
}

impl PiiDetector {
    pub fn new(config: PiiConfig, metrics: Arc<PipelineMetrics>) -> ConfigResult<Self> {
        let patterns = config
            .patterns
            .iter()
            .map(|p| {
                let regex = match (&p.regex, builtin(p.kind)) {
                    (Some(expr), _) => Regex::new(expr)
                        .map_err(|e| ConfigError::invalid_pattern(p.name.clone(), e.to_string()))?,
                    (None, Some(re)) => re.clone(),
                    (None, None) => {
                        return Err(ConfigError::invalid_pattern(
                            p.name.clone(),
                            "custom patterns require a regex",
                        ))
                    }
                };
                Ok(CompiledPattern {
                    name: CompactString::from(p.name.as_str()),
                    kind: p.kind,
                    regex,
                    action: p.action,
                })
            })
            .collect::<ConfigResult<Vec<_>>>()?;

        Ok(Self {
            config,
            patterns,
            metrics,
        })
    }

    fn scanned_fields(&self, record: &Record) -> Vec<CompactString> {
        let excluded = |name: &str| self.config.exclude_fields.iter().any(|f| f == name);
        if self.config.scan_all_string_fields {
            record
                .sorted_keys()
                .into_iter()
                .filter(|k| !excluded(k) && record.get_str(k).is_some())
                .cloned()
                .collect()
        } else {
            self.config
                .fields
                .iter()
                .filter(|f| !excluded(f))
                .map(|f| CompactString::from(f.as_str()))
                .collect()
        }
    }

    /// Scan one text value. Returns the finding and, when redaction applies,
    /// the scrubbed text.
    pub fn scan_text(&self, field: &str, text: &str) -> Option<(PiiFinding, Option<String>)> {
        if text.len() > self.config.max_scan_bytes {
            let finding = PiiFinding {
                field: CompactString::from(field),
                patterns: smallvec![CompactString::from(OVERSIZED_FIELD)],
                action: EnforcementAction::Alert,
            };
            return Some((finding, None));
        }

        let mut names: SmallVec<[CompactString; 2]> = SmallVec::new();
        let mut action: Option<EnforcementAction> = None;
        let mut spans: Vec<Range<usize>> = Vec::new();
        for pattern in &self.patterns {
            let mut hit = false;
            for span in pattern.matches(text) {
                hit = true;
                if pattern.action >= EnforcementAction::Redact {
                    spans.push(span);
                }
            }
            if !hit {
                continue;
            }
            names.push(pattern.name.clone());
            action = action.max(Some(pattern.action));
        }

        let action = action?;
        let redacted = (action == EnforcementAction::Redact)
            .then(|| redact(text, spans, &self.config.redaction_placeholder));
        Some((
            PiiFinding {
                field: CompactString::from(field),
                patterns: names,
                action,
            },
            redacted,
        ))
    }

    /// Scan the configured fields of `record`, redacting in place where the
    /// strictest action for a field is `redact`.
    pub fn apply(&self, record: &mut Record) -> PiiReport {
        let mut report = PiiReport::default();
        for field in self.scanned_fields(record) {
            let Some(text) = record.get_str(&field) else {
                continue;
            };
            let Some((finding, redacted)) = self.scan_text(&field, text) else {
                continue;
            };
            if let Some(redacted) = redacted {
                record.set(&field, redacted);
            }
            self.metrics
                .pii_matches
                .with_label_values(&[finding.action.as_str()])
                .inc();
            report.findings.push(finding);
        }

        if let Some(action) = report.action() {
            record.set(PII_ACTION_ATTRIBUTE, action.as_str());
            record.set(PII_PATTERNS_ATTRIBUTE, report.pattern_names().join(","));
        }
        report
    }
}

/// Replace the union of `spans` with `placeholder`.
fn redact(text: &str, mut spans: Vec<Range<usize>>, placeholder: &str) -> String {
    spans.sort_unstable_by_key(|r| (r.start, r.end));
    let mut merged: Vec<Range<usize>> = Vec::with_capacity(spans.len());
    for span in spans {
        match merged.last_mut() {
            Some(last) if span.start <= last.end => last.end = last.end.max(span.end),
            _ => merged.push(span),
        }
    }

    let mut out = String::with_capacity(text.len());
    let mut cursor = 0;
    for span in merged {
        out.push_str(&text[cursor..span.start]);
        out.push_str(placeholder);
        cursor = span.end;
    }
    out.push_str(&text[cursor..]);
    out
}
