use regex::{Regex, RegexBuilder};
use rusqlite::Connection;
use tracing::debug;

use crate::error::{LedgerError, Result};
use crate::models::{ColumnGroup, ParsedRow, Rule};

pub const MATCH_TYPES: [&str; 3] = ["contains", "starts_with", "regex"];

/// Result of a rule hit: what goes into the description and category cells.
#[derive(Debug, Clone, PartialEq)]
pub struct Categorized {
    pub rule_id: i64,
    pub description: String,
    pub category: String,
}

fn build_regex(pattern: &str) -> Result<Regex> {
    RegexBuilder::new(pattern)
        .case_insensitive(true)
        .build()
        .map_err(|e| LedgerError::InvalidRequest(format!("invalid regex '{pattern}': {e}")))
}

/// Upper-case the first letter of every alphabetic run, lower-case the rest.
pub fn title_case(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    let mut prev_alpha = false;
    for ch in s.chars() {
        if ch.is_alphabetic() {
            if prev_alpha {
                out.extend(ch.to_lowercase());
            } else {
                out.extend(ch.to_uppercase());
            }
            prev_alpha = true;
        } else {
            out.push(ch);
            prev_alpha = false;
        }
    }
    out
}

/// The text a rule is tested against: remittance then counterparty.
pub fn match_text(row: &ParsedRow) -> String {
    format!("{} {}", row.remittance, row.counterparty).trim().to_string()
}

/// If `rule` matches `text`, the value substituted for `{c}`.
///
/// For regex rules with capture groups that is the second group when there
/// are several, otherwise the first; without groups it is the whole match.
fn capture(rule: &Rule, text: &str) -> Option<String> {
    let upper = text.to_uppercase();
    let pat = rule.pattern.to_uppercase();
    let found = match rule.match_type.as_str() {
        "contains" => upper.find(&pat).map(|i| (i, i + pat.len())),
        "starts_with" => upper.starts_with(&pat).then_some((0, pat.len())),
        "regex" => {
            let re = build_regex(&rule.pattern).ok()?;
            let caps = re.captures(text)?;
            let m = match caps.len() {
                1 => caps.get(0),
                2 => caps.get(1),
                _ => caps.get(2),
            }?;
            return Some(title_case(m.as_str().trim()));
        }
        _ => None,
    }?;
    // case folding can change byte lengths; fall back to the pattern itself
    let hit = upper
        .get(found.0..found.1)
        .and_then(|_| text.get(found.0..found.1))
        .unwrap_or(&rule.pattern);
    Some(title_case(hit.trim()))
}

fn render(template: Option<&str>, c: &str, row: &ParsedRow) -> String {
    match template {
        Some(t) if !t.trim().is_empty() => t.replace("{c}", c).trim().to_string(),
        _ => row.default_description(),
    }
}

pub fn load_rules(conn: &Connection, group: Option<ColumnGroup>) -> Result<Vec<Rule>> {
    let mut stmt = conn.prepare(
        "SELECT id, pattern, match_type, column_group, description, category, priority, hit_count \
         FROM rules WHERE is_active = 1 ORDER BY priority DESC, id",
    )?;
    let raws: Vec<(i64, String, String, String, Option<String>, String, i64, i64)> = stmt
        .query_map([], |row| {
            Ok((
                row.get(0)?,
                row.get(1)?,
                row.get(2)?,
                row.get(3)?,
                row.get(4)?,
                row.get(5)?,
                row.get(6)?,
                row.get(7)?,
            ))
        })?
        .collect::<std::result::Result<Vec<_>, _>>()?;

    let mut rules = Vec::with_capacity(raws.len());
    for (id, pattern, match_type, g, description, category, priority, hit_count) in raws {
        let rule_group: ColumnGroup = g.parse()?;
        if group.is_some_and(|want| want != rule_group) {
            continue;
        }
        rules.push(Rule {
            id,
            pattern,
            match_type,
            group: rule_group,
            description,
            category,
            priority,
            hit_count,
        });
    }
    Ok(rules)
}

pub fn add_rule(
    conn: &Connection,
    pattern: &str,
    match_type: &str,
    group: ColumnGroup,
    description: Option<&str>,
    category: &str,
    priority: i64,
) -> Result<i64> {
    if !MATCH_TYPES.contains(&match_type) {
        return Err(LedgerError::InvalidRequest(format!(
            "match type must be one of {}",
            MATCH_TYPES.join(", ")
        )));
    }
    if match_type == "regex" {
        build_regex(pattern)?;
    }
    if category.trim().is_empty() {
        return Err(LedgerError::InvalidRequest("rule category is empty".into()));
    }
    conn.execute(
        "INSERT INTO rules (pattern, match_type, column_group, description, category, priority) \
         VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
        rusqlite::params![pattern, match_type, group.as_str(), description, category, priority],
    )?;
    Ok(conn.last_insert_rowid())
}

/// Categories already used by rules of a group, for review prompts.
pub fn known_categories(conn: &Connection, group: ColumnGroup) -> Result<Vec<String>> {
    let mut stmt = conn.prepare(
        "SELECT DISTINCT category FROM rules WHERE column_group = ?1 AND is_active = 1 ORDER BY category",
    )?;
    let rows = stmt
        .query_map([group.as_str()], |r| r.get(0))?
        .collect::<std::result::Result<Vec<String>, _>>()?;
    Ok(rows)
}

/// Find the highest-priority rule of the row's group that matches it and
/// bump that rule's hit count.
pub fn categorize(conn: &Connection, row: &ParsedRow) -> Result<Option<Categorized>> {
    let group = ColumnGroup::for_amount(row.amount);
    let text = match_text(row);
    for rule in load_rules(conn, Some(group))? {
        if let Some(c) = capture(&rule, &text) {
            conn.execute("UPDATE rules SET hit_count = hit_count + 1 WHERE id = ?1", [rule.id])?;
            let description = render(rule.description.as_deref(), &c, row);
            debug!(rule = rule.id, %description, category = %rule.category, "rule matched");
            return Ok(Some(Categorized {
                rule_id: rule.id,
                description,
                category: rule.category,
            }));
        }
    }
    Ok(None)
}
