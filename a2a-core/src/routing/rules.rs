//! Routing rules.

use crate::protocol::A2AMessage;
use std::fmt;
use std::sync::Arc;

pub type MessagePredicate = Arc<dyn Fn(&A2AMessage) -> bool + Send + Sync>;
pub type MessageTransform = Arc<dyn Fn(A2AMessage) -> A2AMessage + Send + Sync>;

#[derive(Clone)]
pub enum RuleCondition {
    MessageType(String),
    Source(String),
    Destination(String),
    /// Matches the destination's domain
    Domain(String),
    Protocol(String),
    All(Vec<RuleCondition>),
    Any(Vec<RuleCondition>),
    Custom(MessagePredicate),
}

impl RuleCondition {
    pub fn custom(predicate: impl Fn(&A2AMessage) -> bool + Send + Sync + 'static) -> Self {
        RuleCondition::Custom(Arc::new(predicate))
    }

    pub fn matches(&self, message: &A2AMessage) -> bool {
        match self {
            RuleCondition::MessageType(t) => &message.message_type == t,
            RuleCondition::Source(id) => &message.source.id == id,
            RuleCondition::Destination(id) => &message.destination.id == id,
            RuleCondition::Domain(domain) => message.destination.domain.as_deref() == Some(domain.as_str()),
            RuleCondition::Protocol(p) => &message.routing.protocol == p,
            RuleCondition::All(conditions) => conditions.iter().all(|c| c.matches(message)),
            RuleCondition::Any(conditions) => conditions.iter().any(|c| c.matches(message)),
            RuleCondition::Custom(predicate) => predicate(message),
        }
    }
}

impl fmt::Debug for RuleCondition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RuleCondition::MessageType(t) => f.debug_tuple("MessageType").field(t).finish(),
            RuleCondition::Source(id) => f.debug_tuple("Source").field(id).finish(),
            RuleCondition::Destination(id) => f.debug_tuple("Destination").field(id).finish(),
            RuleCondition::Domain(d) => f.debug_tuple("Domain").field(d).finish(),
            RuleCondition::Protocol(p) => f.debug_tuple("Protocol").field(p).finish(),
            RuleCondition::All(c) => f.debug_tuple("All").field(c).finish(),
            RuleCondition::Any(c) => f.debug_tuple("Any").field(c).finish(),
            RuleCondition::Custom(_) => f.write_str("Custom(..)"),
        }
    }
}

#[derive(Clone)]
pub enum RuleAction {
    Forward,
    /// Deliver a copy to each recipient instead of the original destination
    Broadcast(Vec<crate::protocol::AgentIdentifier>),
    /// Rewrite the message, then forward it
    Transform(MessageTransform),
    /// Park the message until the destination's queue is flushed
    Queue,
    Drop,
}

impl RuleAction {
    pub fn transform(f: impl Fn(A2AMessage) -> A2AMessage + Send + Sync + 'static) -> Self {
        RuleAction::Transform(Arc::new(f))
    }

    pub fn name(&self) -> &'static str {
        match self {
            RuleAction::Forward => "forward",
            RuleAction::Broadcast(_) => "broadcast",
            RuleAction::Transform(_) => "transform",
            RuleAction::Queue => "queue",
            RuleAction::Drop => "drop",
        }
    }
}

impl fmt::Debug for RuleAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RuleAction::Broadcast(recipients) => f
                .debug_tuple("Broadcast")
                .field(&recipients.iter().map(|r| r.id.as_str()).collect::<Vec<_>>())
                .finish(),
            other => f.write_str(other.name()),
        }
    }
}

#[derive(Debug, Clone)]
pub struct RoutingRule {
    pub id: String,
    pub condition: RuleCondition,
    pub action: RuleAction,
    /// Higher runs first
    pub priority: i32,
    pub enabled: bool,
}

impl RoutingRule {
    pub fn new(id: impl Into<String>, condition: RuleCondition, action: RuleAction, priority: i32) -> Self {
        Self {
            id: id.into(),
            condition,
            action,
            priority,
            enabled: true,
        }
    }

    pub fn applies_to(&self, message: &A2AMessage) -> bool {
        self.enabled && self.condition.matches(message)
    }
}

/// First enabled matching rule, assuming `rules` is sorted by descending priority.
pub(crate) fn first_match<'a>(rules: &'a [RoutingRule], message: &A2AMessage) -> Option<&'a RoutingRule> {
    rules.iter().find(|rule| rule.applies_to(message))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{AgentIdentifier, AgentRole, Payload};

    fn message(message_type: &str) -> A2AMessage {
        let queen = AgentIdentifier::new("queen", AgentRole::Queen, "mem://queen");
        let drone = AgentIdentifier::new("drone-1", AgentRole::Drone, "mem://drone-1").with_domain("mining");
        A2AMessage::new(queen, drone, message_type, Payload::text("dig"), "http")
    }

    #[test]
    fn test_composite_conditions() {
        let msg = message("task");
        let both = RuleCondition::All(vec![
            RuleCondition::MessageType("task".into()),
            RuleCondition::Domain("mining".into()),
        ]);
        let either = RuleCondition::Any(vec![
            RuleCondition::Source("nobody".into()),
            RuleCondition::Protocol("http".into()),
        ]);

        assert!(both.matches(&msg));
        assert!(either.matches(&msg));
        assert!(!RuleCondition::Destination("drone-2".into()).matches(&msg));
        assert!(RuleCondition::custom(|m| m.payload.data.len() == 3).matches(&msg));
    }

    #[test]
    fn test_first_enabled_match_wins() {
        let mut low = RoutingRule::new("low", RuleCondition::MessageType("task".into()), RuleAction::Forward, 1);
        let mut high = RoutingRule::new("high", RuleCondition::MessageType("task".into()), RuleAction::Drop, 10);
        let rules = vec![high.clone(), low.clone()];
        assert_eq!(first_match(&rules, &message("task")).map(|r| r.id.as_str()), Some("high"));

        high.enabled = false;
        low.enabled = true;
        let rules = vec![high, low];
        assert_eq!(first_match(&rules, &message("task")).map(|r| r.id.as_str()), Some("low"));
        assert!(first_match(&rules, &message("event")).is_none());
    }
}
