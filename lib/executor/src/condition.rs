//! Condition block evaluation.
//!
//! A condition block holds an ordered list of branches (`if`, `else if`,
//! `else`), each with a boolean expression written in the editor's
//! JavaScript-flavored syntax. The first branch whose expression is true is
//! selected, and only edges leaving that branch's handle stay active.
//!
//! References are bound as variables rather than pasted into the expression
//! text, so a string value can never change the expression's structure.
//! The expression itself is evaluated with minijinja.

use crate::error::BlockError;
use crate::resolve::BlockScope;
use blockflow_core::BlockId;
use blockflow_workflow::{Block, SubBlockValues, WorkflowSource, find_references};
use minijinja::{Environment, Value};
use serde::Deserialize;
use serde_json::{Map as JsonMap, Value as JsonValue, json};

/// Sub-block holding the branch list.
pub const CONDITIONS_FIELD: &str = "conditions";

/// One branch of a condition block.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct ConditionBranch {
    pub id: String,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub value: String,
}

impl ConditionBranch {
    /// The `else` branch, and a branch left empty, always match.
    fn always_matches(&self) -> bool {
        self.title.trim().eq_ignore_ascii_case("else") || self.value.trim().is_empty()
    }
}

/// Reads the branch list from a block's configuration.
///
/// # Errors
///
/// Returns `InvalidConfig` when the list is not an array of branches.
pub fn parse_branches(values: &SubBlockValues) -> Result<Vec<ConditionBranch>, BlockError> {
    let Some(conditions) = values.get_json(CONDITIONS_FIELD) else {
        return Ok(Vec::new());
    };
    serde_json::from_value(conditions).map_err(|e| BlockError::InvalidConfig {
        message: format!("conditions: {e}"),
    })
}

/// Evaluates a condition block and builds its output.
///
/// # Errors
///
/// Fails on an unresolvable reference or an expression that does not parse.
pub fn evaluate<S: WorkflowSource + ?Sized>(
    source: &S,
    block: &Block,
    values: &SubBlockValues,
    scope: &BlockScope<'_>,
) -> Result<JsonValue, BlockError> {
    let mut selected = None;
    for branch in parse_branches(values)? {
        if branch.always_matches() || evaluate_expression(&branch.value, scope)? {
            selected = Some(branch);
            break;
        }
    }

    let Some(branch) = selected else {
        tracing::debug!(block_id = %block.id, "no condition branch matched");
        return Ok(json!({
            "conditionResult": false,
            "selectedConditionId": null,
            "selectedPath": null,
        }));
    };

    Ok(json!({
        "conditionResult": true,
        "selectedConditionId": branch.id,
        "selectedPath": selected_path(source, &block.id, &branch.id),
    }))
}

/// Describes the block the chosen branch leads to.
fn selected_path<S: WorkflowSource + ?Sized>(
    source: &S,
    block_id: &BlockId,
    condition_id: &str,
) -> JsonValue {
    source
        .edges()
        .iter()
        .filter(|edge| &edge.source == block_id)
        .find(|edge| edge.condition_id() == Some(condition_id))
        .and_then(|edge| source.block(&edge.target))
        .map_or(JsonValue::Null, |target| {
            json!({
                "blockId": target.id,
                "blockType": target.block_type.as_str(),
                "blockTitle": target.name,
            })
        })
}

/// Evaluates one branch expression to a boolean.
///
/// # Errors
///
/// Fails on an unresolvable reference or an expression that does not parse.
pub fn evaluate_expression(expression: &str, scope: &BlockScope<'_>) -> Result<bool, BlockError> {
    let (bound, context) = bind_references(expression, scope)?;
    let translated = translate_expression(&bound);
    let env = Environment::new();
    let compiled = env
        .compile_expression(&translated)
        .map_err(|e| BlockError::InvalidConfig {
            message: format!("condition {expression:?}: {e}"),
        })?;
    let result = compiled
        .eval(Value::from_serialize(&context))
        .map_err(|e| BlockError::InvalidConfig {
            message: format!("condition {expression:?}: {e}"),
        })?;
    Ok(result.is_true())
}

/// Replaces each resolvable reference with a generated variable name.
///
/// # Errors
///
/// Fails on the first reference that does not resolve.
pub fn bind_references(
    expression: &str,
    scope: &BlockScope<'_>,
) -> Result<(String, JsonMap<String, JsonValue>), BlockError> {
    let mut bound = String::with_capacity(expression.len());
    let mut context = JsonMap::new();
    let mut from = 0;
    for span in find_references(expression) {
        let Some(value) = scope.lookup(&span.reference)? else {
            continue;
        };
        let name = format!("__ref{}", context.len());
        bound.push_str(&expression[from..span.start]);
        bound.push_str(&name);
        context.insert(name, value);
        from = span.end;
    }
    bound.push_str(&expression[from..]);
    Ok((bound, context))
}

/// Rewrites JavaScript operators and literals into minijinja syntax.
///
/// String literals are copied unchanged.
#[must_use]
pub fn translate_expression(expression: &str) -> String {
    let chars: Vec<char> = expression.chars().collect();
    let mut out = String::with_capacity(expression.len());
    let mut i = 0;
    while i < chars.len() {
        let c = chars[i];
        let next = chars.get(i + 1).copied();
        let after = chars.get(i + 2).copied();
        match c {
            '"' | '\'' => {
                let start = i;
                i += 1;
                while i < chars.len() && chars[i] != c {
                    if chars[i] == '\\' {
                        i += 1;
                    }
                    i += 1;
                }
                let end = (i + 1).min(chars.len());
                out.extend(&chars[start..end]);
                i = end;
                continue;
            }
            '=' if next == Some('=') && after == Some('=') => {
                out.push_str("==");
                i += 3;
                continue;
            }
            '!' if next == Some('=') && after == Some('=') => {
                out.push_str("!=");
                i += 3;
                continue;
            }
            '!' if next == Some('=') => {
                out.push_str("!=");
                i += 2;
                continue;
            }
            '!' => out.push_str(" not "),
            '&' if next == Some('&') => {
                out.push_str(" and ");
                i += 2;
                continue;
            }
            '|' if next == Some('|') => {
                out.push_str(" or ");
                i += 2;
                continue;
            }
            c if c.is_alphabetic() || c == '_' => {
                let start = i;
                while i < chars.len() && (chars[i].is_alphanumeric() || chars[i] == '_') {
                    i += 1;
                }
                let word: String = chars[start..i].iter().collect();
                out.push_str(match word.as_str() {
                    "null" | "undefined" => "none",
                    _ => &word,
                });
                continue;
            }
            c => out.push(c),
        }
        i += 1;
    }
    out
}
