use std::fmt::{self, Write};
use std::ops;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

pub const SEPARATOR: char = '/';
pub const SINGLE_WILDCARD: &str = "+";
pub const MULTI_WILDCARD: &str = "#";

#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum TopicError {
    #[error("InvalidTopic({0})")]
    InvalidTopic(String),
    #[error("InvalidLevel({0})")]
    InvalidLevel(String),
}

#[inline]
fn is_metadata(s: &str) -> bool {
    s.starts_with('$')
}

/// One `/`-separated segment of a topic name or topic filter.
#[derive(Debug, Eq, PartialEq, Ord, PartialOrd, Clone, Hash, Serialize, Deserialize)]
pub enum Level {
    Normal(String),
    /// `$`-prefixed first level, e.g. `$SYS`
    Metadata(String),
    Blank,
    /// `+`
    SingleWildcard,
    /// `#`
    MultiWildcard,
}

impl Level {
    #[inline]
    pub fn is_wildcard(&self) -> bool {
        matches!(self, Level::SingleWildcard | Level::MultiWildcard)
    }

    #[inline]
    pub fn is_metadata(&self) -> bool {
        matches!(self, Level::Metadata(_))
    }

    #[inline]
    pub fn value(&self) -> Option<&str> {
        match self {
            Level::Normal(s) | Level::Metadata(s) => Some(s),
            _ => None,
        }
    }

    /// Literal comparison against a raw topic segment.
    #[inline]
    fn eq_segment(&self, seg: &str) -> bool {
        match self {
            Level::Normal(s) | Level::Metadata(s) => s == seg,
            Level::Blank => seg.is_empty(),
            Level::SingleWildcard | Level::MultiWildcard => false,
        }
    }
}

impl FromStr for Level {
    type Err = TopicError;

    #[inline]
    fn from_str(s: &str) -> Result<Self, TopicError> {
        match s {
            SINGLE_WILDCARD => Ok(Level::SingleWildcard),
            MULTI_WILDCARD => Ok(Level::MultiWildcard),
            "" => Ok(Level::Blank),
            _ if s.contains(['+', '#']) => {
                Err(TopicError::InvalidLevel(format!("level `{}` mixes text with a wildcard", s)))
            }
            _ if is_metadata(s) => Ok(Level::Metadata(s.to_owned())),
            _ => Ok(Level::Normal(s.to_owned())),
        }
    }
}

impl fmt::Display for Level {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Level::Normal(s) | Level::Metadata(s) => f.write_str(s),
            Level::Blank => Ok(()),
            Level::SingleWildcard => f.write_char('+'),
            Level::MultiWildcard => f.write_char('#'),
        }
    }
}

/// A parsed topic name or topic filter.
///
/// Parsing enforces the structural rules shared by both: `#` only as the last level,
/// `$`-prefixed levels only in first position, and no wildcard characters inside a
/// text level.
#[derive(Debug, Eq, PartialEq, Ord, PartialOrd, Clone, Hash, Serialize, Deserialize)]
pub struct Topic(Vec<Level>);

impl Topic {
    #[inline]
    pub fn levels(&self) -> &[Level] {
        &self.0
    }

    #[inline]
    pub fn has_wildcard(&self) -> bool {
        self.0.iter().any(Level::is_wildcard)
    }

    /// Whether this filter selects the topic name `topic`.
    ///
    /// `+` consumes exactly one level, `#` the remaining levels including none at all,
    /// and neither wildcard matches a `$`-prefixed first level.
    pub fn matches_str(&self, topic: &str) -> bool {
        let mut filter = self.0.iter();
        for (idx, seg) in topic.split(SEPARATOR).enumerate() {
            let reserved = idx == 0 && is_metadata(seg);
            match filter.next() {
                Some(Level::MultiWildcard) => return !reserved,
                Some(Level::SingleWildcard) if reserved => return false,
                Some(Level::SingleWildcard) => {}
                Some(level) if level.eq_segment(seg) => {}
                _ => return false,
            }
        }
        matches!(filter.next(), None | Some(Level::MultiWildcard))
    }

    /// Whether this filter covers every topic the filter `other` can select.
    pub fn matches(&self, other: &Topic) -> bool {
        let mut lhs = self.0.iter();
        for (idx, rhs) in other.0.iter().enumerate() {
            let reserved = idx == 0 && rhs.is_metadata();
            match lhs.next() {
                Some(Level::MultiWildcard) => return !reserved,
                Some(Level::SingleWildcard) if reserved || *rhs == Level::MultiWildcard => return false,
                Some(Level::SingleWildcard) => {}
                Some(level) if level == rhs => {}
                _ => return false,
            }
        }
        matches!(lhs.next(), None | Some(Level::MultiWildcard))
    }

    fn validate(&self) -> Result<(), String> {
        let last = self.0.len().saturating_sub(1);
        for (pos, level) in self.0.iter().enumerate() {
            match level {
                Level::MultiWildcard if pos != last => return Err("`#` must be the last level".into()),
                Level::Metadata(_) if pos != 0 => return Err("`$` level must come first".into()),
                _ => {}
            }
        }
        Ok(())
    }
}

impl FromStr for Topic {
    type Err = TopicError;

    #[inline]
    fn from_str(s: &str) -> Result<Self, TopicError> {
        let topic = s.split(SEPARATOR).map(Level::from_str).collect::<Result<Vec<_>, _>>().map(Topic)?;
        topic.validate().map_err(|e| TopicError::InvalidTopic(format!("invalid topic `{}`, {}", s, e)))?;
        Ok(topic)
    }
}

impl From<Vec<Level>> for Topic {
    fn from(v: Vec<Level>) -> Self {
        Topic(v)
    }
}

impl ops::Deref for Topic {
    type Target = [Level];

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl fmt::Display for Topic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (idx, level) in self.0.iter().enumerate() {
            if idx > 0 {
                f.write_char(SEPARATOR)?;
            }
            level.fmt(f)?;
        }
        Ok(())
    }
}

/// Parses a topic name used by PUBLISH; wildcards are rejected.
pub fn parse_topic_name(s: &str) -> Result<Topic, TopicError> {
    let topic = Topic::from_str(s)?;
    if topic.has_wildcard() {
        return Err(TopicError::InvalidTopic(format!("topic name `{}` contains a wildcard", s)));
    }
    Ok(topic)
}
