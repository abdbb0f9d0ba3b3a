//! Topic ACLs compiled from an MQTT profile.
//!
//! Publish patterns go through variable substitution (`$ID` plus the
//! client's named values) and become regular expressions with the MQTT
//! wildcards mapped: `+` to one level, `/#` to the remaining levels.
//! Subscribe entries are exact strings after the same substitution.

use regex::Regex;
use ubergang_common::{Error, MqttClient, MqttProfile, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Classification {
    Allowed,
    Blocked,
}

impl Classification {
    pub fn as_str(&self) -> &'static str {
        match self {
            Classification::Allowed => "allowed",
            Classification::Blocked => "blocked",
        }
    }
}

pub struct Acl {
    allow_publish: Vec<Regex>,
    allow_subscribe: Vec<String>,
}

impl Acl {
    pub fn new(client: &MqttClient, profile: &MqttProfile) -> Result<Self> {
        let subst = |s: &str| -> String {
            let mut out = s.replace("$ID", &client.id);
            for (name, value) in &client.values {
                out = out.replace(&format!("${name}"), value);
            }
            out
        };

        let make_regex = |pattern: &str| -> Result<Regex> {
            let pattern = pattern.replace('+', "[^/]+").replace("/#", "/.+");
            Regex::new(&format!("^{pattern}$"))
                .map_err(|e| Error::InvalidConfig(format!("bad topic pattern: {e}")))
        };

        let mut allow_publish = Vec::new();
        for topic in &profile.allow_publish {
            allow_publish.push(make_regex(&subst(topic))?);
        }
        let allow_subscribe = profile.allow_subscribe.iter().map(|t| subst(t)).collect();

        Ok(Self {
            allow_publish,
            allow_subscribe,
        })
    }

    pub fn validate_publish_topic(&self, topic: &str) -> Classification {
        if self.allow_publish.iter().any(|re| re.is_match(topic)) {
            Classification::Allowed
        } else {
            Classification::Blocked
        }
    }

    pub fn validate_subscribe_topic(&self, topic: &str) -> Classification {
        if self.allow_subscribe.iter().any(|t| t == topic) {
            Classification::Allowed
        } else {
            Classification::Blocked
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn acl(publish: &[&str], subscribe: &[&str], values: &[(&str, &str)]) -> Acl {
        let client = MqttClient {
            id: "C1".into(),
            profile_id: "p".into(),
            password: String::new(),
            values: values
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect::<HashMap<_, _>>(),
        };
        let profile = MqttProfile {
            id: "p".into(),
            allow_publish: publish.iter().map(|s| s.to_string()).collect(),
            allow_subscribe: subscribe.iter().map(|s| s.to_string()).collect(),
        };
        Acl::new(&client, &profile).unwrap()
    }

    #[test]
    fn test_id_substitution() {
        let acl = acl(&["$ID/out"], &["$ID/in"], &[]);
        assert_eq!(acl.validate_publish_topic("C1/out"), Classification::Allowed);
        assert_eq!(acl.validate_publish_topic("C1/boom"), Classification::Blocked);
        assert_eq!(acl.validate_subscribe_topic("C1/in"), Classification::Allowed);
        assert_eq!(acl.validate_subscribe_topic("C1/foo"), Classification::Blocked);
    }

    #[test]
    fn test_named_value_substitution() {
        let acl = acl(&["site/$LOC/+/data"], &[], &[("LOC", "oslo")]);
        assert_eq!(
            acl.validate_publish_topic("site/oslo/dev3/data"),
            Classification::Allowed
        );
        assert_eq!(
            acl.validate_publish_topic("site/bergen/dev3/data"),
            Classification::Blocked
        );
    }

    #[test]
    fn test_plus_matches_single_level() {
        let acl = acl(&["a/+/c"], &[], &[]);
        assert_eq!(acl.validate_publish_topic("a/b/c"), Classification::Allowed);
        assert_eq!(acl.validate_publish_topic("a/b/x/c"), Classification::Blocked);
    }

    #[test]
    fn test_hash_matches_remaining_levels() {
        let acl = acl(&["a/#"], &[], &[]);
        assert_eq!(acl.validate_publish_topic("a/b"), Classification::Allowed);
        assert_eq!(acl.validate_publish_topic("a/b/c/d"), Classification::Allowed);
        assert_eq!(acl.validate_publish_topic("b/a"), Classification::Blocked);
    }

    #[test]
    fn test_subscribe_is_exact_match() {
        let acl = acl(&[], &["a/+/c"], &[]);
        // Subscribe entries are literals, not patterns.
        assert_eq!(acl.validate_subscribe_topic("a/+/c"), Classification::Allowed);
        assert_eq!(acl.validate_subscribe_topic("a/b/c"), Classification::Blocked);
    }
}
