//! Topic naming, validation and wildcard matching.
//!
//! Concrete topics have exactly three levels:
//!
//! ```text
//! <namespace>/<class>/<component>      class ∈ {cmd, data, status}
//! ```
//!
//! Subscription patterns may replace a level with `+` (exactly one level) or
//! end with `#` (zero or more remaining levels).

use orchestrator_types::{ESTOP_COMPONENT, HalError};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TopicClass {
    Cmd,
    Data,
    Status,
}

impl TopicClass {
    pub fn as_str(&self) -> &'static str {
        match self {
            TopicClass::Cmd => "cmd",
            TopicClass::Data => "data",
            TopicClass::Status => "status",
        }
    }

    fn parse(level: &str) -> Option<Self> {
        match level {
            "cmd" => Some(TopicClass::Cmd),
            "data" => Some(TopicClass::Data),
            "status" => Some(TopicClass::Status),
            _ => None,
        }
    }
}

/// A validated concrete topic.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TopicName<'a> {
    pub namespace: &'a str,
    pub class: TopicClass,
    pub component: &'a str,
}

impl TopicName<'_> {
    pub fn is_emergency_stop(&self) -> bool {
        self.class == TopicClass::Cmd && self.component == ESTOP_COMPONENT
    }
}

fn is_identifier(level: &str) -> bool {
    !level.is_empty() && level.bytes().all(|b| b.is_ascii_alphanumeric() || b == b'_')
}

/// Parse and validate a concrete topic within `namespace`.
///
/// # Errors
///
/// Returns [`HalError::Validation`] when the topic does not follow the
/// three-level convention or belongs to another namespace.
pub fn parse_topic<'a>(namespace: &str, topic: &'a str) -> Result<TopicName<'a>, HalError> {
    let invalid = |why: &str| HalError::validation(format!("invalid topic `{topic}`: {why}"));
    let mut levels = topic.split('/');
    let (Some(ns), Some(class), Some(component), None) =
        (levels.next(), levels.next(), levels.next(), levels.next())
    else {
        return Err(invalid("expected <namespace>/<class>/<component>"));
    };
    if ns != namespace {
        return Err(invalid("unknown namespace"));
    }
    let class = TopicClass::parse(class).ok_or_else(|| invalid("class must be cmd, data or status"))?;
    if !is_identifier(component) {
        return Err(invalid("component must match [A-Za-z0-9_]+"));
    }
    Ok(TopicName {
        namespace: ns,
        class,
        component,
    })
}

/// Validate a subscription pattern within `namespace`.
///
/// # Errors
///
/// Returns [`HalError::Validation`] for misplaced wildcards, too many
/// levels, or literal levels that break the topic convention.
pub fn validate_pattern(namespace: &str, pattern: &str) -> Result<(), HalError> {
    let invalid = |why: &str| HalError::validation(format!("invalid pattern `{pattern}`: {why}"));
    let levels: Vec<&str> = pattern.split('/').collect();
    if levels.len() > 3 {
        return Err(invalid("more than three levels"));
    }
    for (i, level) in levels.iter().enumerate() {
        let last = i + 1 == levels.len();
        match *level {
            "#" if last => return Ok(()),
            "#" => return Err(invalid("`#` is only allowed as the last level")),
            "+" => continue,
            l if l.contains('+') || l.contains('#') => {
                return Err(invalid("wildcards must occupy a whole level"));
            }
            l => {
                let ok = match i {
                    0 => l == namespace,
                    1 => TopicClass::parse(l).is_some(),
                    _ => is_identifier(l),
                };
                if !ok {
                    return Err(invalid("literal level breaks the topic convention"));
                }
            }
        }
    }
    if levels.len() != 3 {
        return Err(invalid("expected three levels"));
    }
    Ok(())
}

/// MQTT-style match of `topic` against `pattern`.
pub fn topic_matches(pattern: &str, topic: &str) -> bool {
    let mut p = pattern.split('/');
    let mut t = topic.split('/');
    loop {
        match (p.next(), t.next()) {
            (Some("#"), _) => return true,
            (Some("+"), Some(_)) => {}
            (Some(a), Some(b)) if a == b => {}
            (None, None) => return true,
            _ => return false,
        }
    }
}

/// Builds topics for one namespace.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Topics {
    namespace: String,
}

impl Topics {
    pub fn new(namespace: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
        }
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    pub fn topic(&self, class: TopicClass, component: &str) -> String {
        format!("{}/{}/{}", self.namespace, class.as_str(), component)
    }

    pub fn cmd(&self, component: &str) -> String {
        self.topic(TopicClass::Cmd, component)
    }

    pub fn data(&self, component: &str) -> String {
        self.topic(TopicClass::Data, component)
    }

    pub fn status(&self, component: &str) -> String {
        self.topic(TopicClass::Status, component)
    }

    pub fn estop(&self) -> String {
        self.cmd(ESTOP_COMPONENT)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const NS: &str = "orchestrator";

    #[test]
    fn well_formed_topics_parse() {
        let t = parse_topic(NS, "orchestrator/data/left_encoder").unwrap();
        assert_eq!(t.class, TopicClass::Data);
        assert_eq!(t.component, "left_encoder");
        assert!(parse_topic(NS, "orchestrator/cmd/estop").unwrap().is_emergency_stop());
    }

    #[test]
    fn malformed_topics_are_rejected() {
        for bad in [
            "",
            "orchestrator/data",
            "orchestrator/data/left/extra",
            "orchestrator/ack/left_motor",
            "robot/data/lidar",
            "orchestrator/data/",
            "orchestrator/data/left-motor",
            "orchestrator/data/+",
        ] {
            assert!(parse_topic(NS, bad).is_err(), "{bad} should be rejected");
        }
    }

    #[test]
    fn patterns_validate() {
        for good in [
            "orchestrator/data/+",
            "orchestrator/+/lidar",
            "orchestrator/#",
            "#",
            "orchestrator/cmd/estop",
        ] {
            assert!(validate_pattern(NS, good).is_ok(), "{good} should be accepted");
        }
        for bad in [
            "orchestrator/#/lidar",
            "orchestrator/data/+encoder",
            "orchestrator/data",
            "orchestrator/data/a/b",
            "other/#",
        ] {
            assert!(validate_pattern(NS, bad).is_err(), "{bad} should be rejected");
        }
    }

    #[test]
    fn wildcard_matching() {
        assert!(topic_matches("orchestrator/data/+", "orchestrator/data/lidar"));
        assert!(!topic_matches("orchestrator/data/+", "orchestrator/cmd/lidar"));
        assert!(topic_matches("orchestrator/#", "orchestrator/status/robot"));
        assert!(topic_matches("orchestrator/+/robot", "orchestrator/status/robot"));
        assert!(!topic_matches("orchestrator/data/lidar", "orchestrator/data/lidar2"));
        assert!(!topic_matches("orchestrator/+", "orchestrator/data/lidar"));
    }

    #[test]
    fn builders_produce_valid_topics() {
        let topics = Topics::new(NS);
        assert_eq!(topics.estop(), "orchestrator/cmd/estop");
        assert!(parse_topic(NS, &topics.data("left_encoder")).is_ok());
        assert!(parse_topic(NS, &topics.status("robot")).is_ok());
    }
}
