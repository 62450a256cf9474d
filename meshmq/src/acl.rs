//! Publish and subscribe authorization.
//!
//! [`DefaultAcl`] walks the configured rules in order; the first rule whose client,
//! username, action and topic all apply decides. When no rule applies the operation is
//! allowed, so an empty rule list allows everything.
//!
//! Rule topics may contain placeholders expanded per connection:
//! - `${clientid}`
//! - `${username}`, a rule using it never applies to a connection without a username

use async_trait::async_trait;

use crate::conf::{AclAction, AclRule, Permission};
use crate::topic::Topic;
use crate::types::{Action, ConnectInfo};

pub const PLACEHOLDER_USERNAME: &str = "${username}";
pub const PLACEHOLDER_CLIENTID: &str = "${clientid}";

#[async_trait]
pub trait AclChecker: Sync + Send {
    /// `topic` is a topic name for [`Action::Publish`] and a topic filter for
    /// [`Action::Subscribe`].
    async fn check_allowed(&self, info: &ConnectInfo, topic: &str, action: Action) -> bool;
}

pub struct DefaultAcl {
    rules: Vec<AclRule>,
}

impl DefaultAcl {
    pub fn new(rules: Vec<AclRule>) -> Self {
        Self { rules }
    }

    fn rule_topic(rule: &AclRule, info: &ConnectInfo) -> Option<Topic> {
        let mut topic = rule.topic.replace(PLACEHOLDER_CLIENTID, &info.client_id);
        if topic.contains(PLACEHOLDER_USERNAME) {
            topic = topic.replace(PLACEHOLDER_USERNAME, info.username.as_deref()?);
        }
        match topic.parse::<Topic>() {
            Ok(t) => Some(t),
            Err(e) => {
                log::warn!("acl rule topic ignored, {}", e);
                None
            }
        }
    }

    fn hit(rule: &AclRule, info: &ConnectInfo, topic: &str, action: Action) -> bool {
        let action_hit = matches!(
            (rule.action, action),
            (AclAction::All, _) | (AclAction::Publish, Action::Publish) | (AclAction::Subscribe, Action::Subscribe)
        );
        if !action_hit {
            return false;
        }
        if rule.clientid.as_deref().is_some_and(|c| c != &*info.client_id) {
            return false;
        }
        if let Some(username) = rule.username.as_deref() {
            if info.username.as_deref() != Some(username) {
                return false;
            }
        }

        let Some(rule_topic) = Self::rule_topic(rule, info) else {
            return false;
        };
        match action {
            Action::Publish => rule_topic.matches_str(topic),
            Action::Subscribe => match topic.parse::<Topic>() {
                Ok(filter) => rule_topic.matches(&filter),
                Err(_) => false,
            },
        }
    }
}

#[async_trait]
impl AclChecker for DefaultAcl {
    async fn check_allowed(&self, info: &ConnectInfo, topic: &str, action: Action) -> bool {
        for rule in &self.rules {
            if Self::hit(rule, info, topic, action) {
                let allowed = rule.permission == Permission::Allow;
                if !allowed {
                    log::debug!("{} {} `{}` denied by rule {:?}", info.client_id, action, topic, rule);
                }
                return allowed;
            }
        }
        true
    }
}
