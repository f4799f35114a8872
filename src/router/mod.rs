//! PGN/address-based egress routing with per-PGN memoization
//! (spec.md §4.8).
//!
//! No direct teacher analogue exists for rule-based routing; this module
//! is styled after the teacher's single-mutex registries
//! (`address::Registry`, `transport::TransportEngine`) and after
//! `original_source/afs_fastapi/equipment/message_queue_optimization.py`'s
//! PGN classification sets, generalized into user-supplied ordered rules
//! instead of the Python reference's fixed classification tables.
use std::collections::HashMap;

use tokio::sync::Mutex;

use crate::queue::PriorityClass;

/// An unordered set matcher: `None` matches anything, `Some(values)`
/// matches only the listed values.
#[derive(Debug, Clone, Default)]
pub struct Filter<T: Eq + std::hash::Hash> {
    values: Option<Vec<T>>,
}

impl<T: Eq + std::hash::Hash> Filter<T> {
    pub fn any() -> Self {
        Self { values: None }
    }

    pub fn one_of(values: Vec<T>) -> Self {
        Self { values: Some(values) }
    }

    fn matches(&self, value: &T) -> bool {
        match &self.values {
            None => true,
            Some(values) => values.contains(value),
        }
    }
}

#[derive(Debug, Clone)]
pub struct Rule {
    pub pgn: Filter<u32>,
    pub source: Filter<u8>,
    pub destination: Filter<u8>,
    pub priority: PriorityClass,
    pub interfaces: Vec<String>,
    pub enabled: bool,
}

impl Rule {
    fn matches(&self, pgn: u32, source: u8, destination: Option<u8>) -> bool {
        let destination_matches = match destination {
            Some(destination) => self.destination.matches(&destination),
            None => true,
        };
        self.enabled && self.pgn.matches(&pgn) && self.source.matches(&source) && destination_matches
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct RouteDecision {
    pub interfaces: Vec<String>,
    pub priority: PriorityClass,
}

/// Fallback applied when no rule matches a message.
const DEFAULT_INTERFACE_PRIORITY: PriorityClass = PriorityClass::Low;

struct State {
    rules: Vec<Rule>,
    active_interfaces: Vec<String>,
    memo: HashMap<(u32, u8, Option<u8>), RouteDecision>,
}

pub struct Router {
    state: Mutex<State>,
}

impl Router {
    pub fn new(active_interfaces: Vec<String>) -> Self {
        Self { state: Mutex::new(State { rules: Vec::new(), active_interfaces, memo: HashMap::new() }) }
    }

    pub async fn set_rules(&self, rules: Vec<Rule>) {
        let mut state = self.state.lock().await;
        state.rules = rules;
        state.memo.clear();
    }

    pub async fn add_rule(&self, rule: Rule) {
        let mut state = self.state.lock().await;
        state.rules.push(rule);
        state.memo.clear();
    }

    pub async fn set_active_interfaces(&self, interfaces: Vec<String>) {
        let mut state = self.state.lock().await;
        state.active_interfaces = interfaces;
        state.memo.clear();
    }

    /// Route a decoded message: every matching rule (in insertion order)
    /// contributes its interfaces to the union, and tightens the effective
    /// priority whenever its own priority is stricter (lower variant
    /// ordinal). Unmatched messages go to every active interface at
    /// `PriorityClass::Low`. Results are memoized per `(pgn, source,
    /// destination)` key until rules or the active interface set change.
    pub async fn route(&self, pgn: u32, source: u8, destination: Option<u8>) -> RouteDecision {
        let key = (pgn, source, destination);
        let mut state = self.state.lock().await;
        if let Some(cached) = state.memo.get(&key) {
            return cached.clone();
        }

        let mut interfaces: Vec<String> = Vec::new();
        let mut priority: Option<PriorityClass> = None;
        let mut matched = false;

        for rule in &state.rules {
            if !rule.matches(pgn, source, destination) {
                continue;
            }
            matched = true;
            for interface in &rule.interfaces {
                if !interfaces.contains(interface) {
                    interfaces.push(interface.clone());
                }
            }
            priority = Some(match priority {
                Some(current) if current <= rule.priority => current,
                _ => rule.priority,
            });
        }

        let decision = if matched {
            RouteDecision { interfaces, priority: priority.unwrap_or(DEFAULT_INTERFACE_PRIORITY) }
        } else {
            RouteDecision { interfaces: state.active_interfaces.clone(), priority: DEFAULT_INTERFACE_PRIORITY }
        };

        state.memo.insert(key, decision.clone());
        decision
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rule(pgn: u32, interfaces: &[&str], priority: PriorityClass) -> Rule {
        Rule {
            pgn: Filter::one_of(vec![pgn]),
            source: Filter::any(),
            destination: Filter::any(),
            priority,
            interfaces: interfaces.iter().map(|s| s.to_string()).collect(),
            enabled: true,
        }
    }

    #[tokio::test]
    async fn unmatched_message_goes_to_all_active_interfaces_at_low_priority() {
        let router = Router::new(vec!["can0".into(), "can1".into()]);
        let decision = router.route(0xF004, 0x20, None).await;
        assert_eq!(decision.interfaces, vec!["can0".to_string(), "can1".to_string()]);
        assert_eq!(decision.priority, PriorityClass::Low);
    }

    #[tokio::test]
    async fn matching_rule_contributes_its_interfaces_and_priority() {
        let router = Router::new(vec!["can0".into()]);
        router.add_rule(rule(0xFECA, &["can1"], PriorityClass::Critical)).await;
        let decision = router.route(0xFECA, 0x20, None).await;
        assert_eq!(decision.interfaces, vec!["can1".to_string()]);
        assert_eq!(decision.priority, PriorityClass::Critical);
    }

    #[tokio::test]
    async fn two_matching_rules_union_interfaces_and_keep_strictest_priority() {
        let router = Router::new(vec![]);
        router.add_rule(rule(0xFECA, &["can0"], PriorityClass::Normal)).await;
        router.add_rule(rule(0xFECA, &["can1"], PriorityClass::Critical)).await;
        let decision = router.route(0xFECA, 0x20, None).await;
        assert_eq!(decision.interfaces, vec!["can0".to_string(), "can1".to_string()]);
        assert_eq!(decision.priority, PriorityClass::Critical);
    }

    #[tokio::test]
    async fn disabled_rule_is_skipped() {
        let router = Router::new(vec!["can0".into()]);
        let mut disabled = rule(0xFECA, &["can1"], PriorityClass::Critical);
        disabled.enabled = false;
        router.add_rule(disabled).await;
        let decision = router.route(0xFECA, 0x20, None).await;
        assert_eq!(decision.interfaces, vec!["can0".to_string()]);
    }

    #[tokio::test]
    async fn result_is_memoized_until_rules_change() {
        let router = Router::new(vec!["can0".into()]);
        let first = router.route(0xFECA, 0x20, None).await;
        router.add_rule(rule(0xFECA, &["can1"], PriorityClass::Critical)).await;
        let second = router.route(0xFECA, 0x20, None).await;
        assert_ne!(first, second);
    }
}
