//! Route selection and its priority/bonus tiebreak.
//!
//! A conditioned rule that matches gets a +1 "evaluation bonus", one that
//! fails to evaluate gets a -1 penalty, and the bonus is only ever applied
//! *among the already priority-minimal candidates* — it can never pull a
//! lower-priority rule ahead of a higher-priority one.

use crate::error::{RelayError, Result};
use crate::model::RoutingRule;
use crate::rules;
use serde_json::Value;
use tracing::warn;
use uuid::Uuid;

/// Select the single routing rule that should handle this message, out of
/// `candidates` (already filtered by the caller to active rules whose
/// `client_id`/`topic_id` match and whose `device_id` is this device or
/// NULL).
pub fn select_route(candidates: Vec<RoutingRule>, ctx: &Value, message_id: i64) -> Result<RoutingRule> {
    let mut scored: Vec<(RoutingRule, i32)> = Vec::with_capacity(candidates.len());

    for candidate in candidates {
        let bonus = match &candidate.conditions {
            Some(expr) if !expr.trim().is_empty() => {
                let rule: Value = match serde_json::from_str(expr) {
                    Ok(v) => v,
                    Err(_) => {
                        warn!(rule_id = %candidate.id, "condition in route is not valid json; treating as conditionless with decreased priority");
                        scored.push((candidate, -1));
                        continue;
                    }
                };
                match rules::eval(&rule, ctx) {
                    Ok(true) => 1,
                    Ok(false) => continue, // doesn't match: drop the candidate entirely
                    Err(_) => {
                        warn!(rule_id = %candidate.id, "condition in route failed to evaluate; treating as conditionless with decreased priority");
                        -1
                    }
                }
            }
            _ => 0,
        };
        scored.push((candidate, bonus));
    }

    if scored.is_empty() {
        return Err(RelayError::NoRouteFound(message_id));
    }

    let min_priority = scored.iter().map(|(c, _)| c.priority).min().unwrap();
    let prioritary: Vec<_> = scored.into_iter().filter(|(c, _)| c.priority == min_priority).collect();

    let min_adjusted = prioritary.iter().map(|(c, bonus)| c.priority - bonus).min().unwrap();
    let mut tied: Vec<RoutingRule> = prioritary
        .into_iter()
        .filter(|(c, bonus)| c.priority - bonus == min_adjusted)
        .map(|(c, _)| c)
        .collect();

    tied.sort_by(|a, b| b.created_at.cmp(&a.created_at));

    if tied.len() > 1 {
        let ids: Vec<String> = tied.iter().map(|r| format!("route #{}", r.id)).collect();
        warn!(message_id, candidates = %ids.join(","), "multiple routes possible; newest one selected");
    }

    Ok(tied.into_iter().next().expect("checked non-empty above"))
}

pub fn parse_parser_config(route: &RoutingRule) -> Result<Value> {
    let raw = route.parser_config.as_deref().unwrap_or("{}");
    let raw = if raw.trim().is_empty() { "{}" } else { raw };
    serde_json::from_str(raw).map_err(|e| RelayError::BadParserConfig(route.id, e.to_string()))
}
