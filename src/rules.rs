use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::RwLock;

use thiserror::Error;

use crate::device_registry::DeviceKey;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ForwardingRule {
    pub source: DeviceKey,
    pub dest: DeviceKey,
    pub channel_filter: Option<u8>,
    pub message_type_filter: Option<u8>,
}

impl ForwardingRule {
    /// Does this rule apply to a raw MIDI message with the given first
    /// (status) byte?
    pub fn matches(&self, status_byte: u8) -> bool {
        let channel = status_byte & 0x0F;
        let msg_type = status_byte & 0xF0;
        self.channel_filter.is_none_or(|c| c == channel)
            && self.message_type_filter.is_none_or(|t| t == msg_type)
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum RuleError {
    #[error("adding this rule would create a forwarding cycle through {through:?}")]
    WouldCreateCycle { through: DeviceKey },
}

/// Index from a source endpoint to the rules that fan its messages out to
/// other endpoints. Rule insertion is rejected when it would close a cycle
/// reachable purely through configured rules — a best-effort guard against
/// obvious misconfiguration, not a substitute for the network-wide
/// loop-prevention carried in packet forwarding contexts.
pub struct RuleEngine {
    rules: RwLock<HashMap<DeviceKey, Vec<ForwardingRule>>>,
}

impl RuleEngine {
    pub fn new() -> Self {
        Self { rules: RwLock::new(HashMap::new()) }
    }

    pub fn add_rule(&self, rule: ForwardingRule) -> Result<(), RuleError> {
        let mut rules = self.rules.write().unwrap();
        if let Some(cycle_point) = would_cycle(&rules, rule.source, rule.dest) {
            return Err(RuleError::WouldCreateCycle { through: cycle_point });
        }
        rules.entry(rule.source).or_default().push(rule);
        Ok(())
    }

    pub fn remove_rule(&self, source: DeviceKey, dest: DeviceKey) {
        let mut rules = self.rules.write().unwrap();
        if let Some(list) = rules.get_mut(&source) {
            list.retain(|r| r.dest != dest);
            if list.is_empty() {
                rules.remove(&source);
            }
        }
    }

    pub fn rules_for(&self, source: DeviceKey) -> Vec<ForwardingRule> {
        self.rules.read().unwrap().get(&source).cloned().unwrap_or_default()
    }
}

impl Default for RuleEngine {
    fn default() -> Self {
        Self::new()
    }
}

/// Breadth-first search from the candidate `dest` back to `source`: if
/// `source` is reachable, adding `source -> dest` would close a cycle.
fn would_cycle(
    rules: &HashMap<DeviceKey, Vec<ForwardingRule>>,
    source: DeviceKey,
    dest: DeviceKey,
) -> Option<DeviceKey> {
    if source == dest {
        return Some(source);
    }
    let mut visited = HashSet::new();
    let mut queue = VecDeque::new();
    queue.push_back(dest);
    visited.insert(dest);
    while let Some(current) = queue.pop_front() {
        if current == source {
            return Some(current);
        }
        if let Some(list) = rules.get(&current) {
            for rule in list {
                if visited.insert(rule.dest) {
                    queue.push_back(rule.dest);
                }
            }
        }
    }
    None
}
