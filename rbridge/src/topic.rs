//! Topic names and filters.
//!
//! Topics are split on `/` into [`Level`]s. A filter may contain `+` (one level) and a trailing
//! `#` (any number of levels, including none). A leading `$` level is metadata and is never
//! matched by a wildcard in first position; `$` anywhere else is an ordinary character.
//!
//! Resource topics written over CoAP and HTTP are opaque names, [`Topic::literal`] splits them
//! without giving `+` or `#` any meaning.

use std::fmt::{self, Write};
use std::{ops, str::FromStr};

use serde::{Deserialize, Serialize};

#[derive(Clone, Debug, PartialEq, thiserror::Error)]
pub enum TopicError {
    #[error("InvalidTopic({0})")]
    InvalidTopic(String),
    #[error("InvalidLevel({0})")]
    InvalidLevel(String),
}

#[derive(Debug, Eq, PartialEq, Ord, PartialOrd, Clone, Hash, Serialize, Deserialize)]
pub enum Level {
    Normal(String),
    Metadata(String), // $SYS
    Blank,
    SingleWildcard, // Single level wildcard +
    MultiWildcard,  // Multi-level wildcard #
}

impl Level {
    #[inline]
    pub fn value(&self) -> Option<&str> {
        match *self {
            Level::Normal(ref s) | Level::Metadata(ref s) => Some(s),
            _ => None,
        }
    }

    #[inline]
    pub fn is_metadata(&self) -> bool {
        matches!(*self, Level::Metadata(_))
    }

    #[inline]
    pub fn is_wildcard(&self) -> bool {
        matches!(*self, Level::SingleWildcard | Level::MultiWildcard)
    }

    #[inline]
    fn matches_name(&self, name: &str) -> bool {
        match self {
            Level::Normal(s) | Level::Metadata(s) => s == name,
            Level::Blank => name.is_empty(),
            Level::SingleWildcard | Level::MultiWildcard => true,
        }
    }
}

impl FromStr for Level {
    type Err = TopicError;

    #[inline]
    fn from_str(s: &str) -> Result<Self, TopicError> {
        match s {
            "+" => Ok(Level::SingleWildcard),
            "#" => Ok(Level::MultiWildcard),
            "" => Ok(Level::Blank),
            _ => {
                if s.contains(['+', '#']) {
                    Err(TopicError::InvalidLevel(format!("invalid level `{}` contains +|#", s)))
                } else if s.starts_with('$') {
                    Ok(Level::Metadata(String::from(s)))
                } else {
                    Ok(Level::Normal(String::from(s)))
                }
            }
        }
    }
}

impl fmt::Display for Level {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match *self {
            Level::Normal(ref s) | Level::Metadata(ref s) => f.write_str(s.as_str()),
            Level::Blank => Ok(()),
            Level::SingleWildcard => f.write_char('+'),
            Level::MultiWildcard => f.write_char('#'),
        }
    }
}

#[derive(Debug, Eq, PartialEq, Ord, PartialOrd, Clone, Hash, Serialize, Deserialize)]
pub struct Topic(Vec<Level>);

impl Topic {
    /// Splits a topic name on `/` only, `+` and `#` are ordinary characters here.
    #[inline]
    pub fn literal(name: &str) -> Topic {
        let levels = name
            .split('/')
            .enumerate()
            .map(|(pos, l)| match l {
                "" => Level::Blank,
                l if pos == 0 && l.starts_with('$') => Level::Metadata(l.into()),
                l => Level::Normal(l.into()),
            })
            .collect();
        Topic(levels)
    }

    #[inline]
    pub fn levels(&self) -> &Vec<Level> {
        &self.0
    }

    /// True if this is a filter rather than a concrete topic name.
    #[inline]
    pub fn is_wildcard(&self) -> bool {
        self.0.iter().any(|l| l.is_wildcard())
    }

    #[inline]
    fn is_valid(&self) -> bool {
        let last = self.0.len().saturating_sub(1);
        self.0.iter().enumerate().all(|(pos, level)| !matches!(level, Level::MultiWildcard) || pos == last)
    }

    /// Matches this filter against a concrete topic name.
    pub fn matches_str<S: AsRef<str> + ?Sized>(&self, topic: &S) -> bool {
        let topic = topic.as_ref();
        let metadata = topic.starts_with('$');
        let mut names = topic.split('/');
        for (pos, level) in self.0.iter().enumerate() {
            if pos == 0 && metadata && level.is_wildcard() {
                return false;
            }
            if matches!(level, Level::MultiWildcard) {
                return true;
            }
            match names.next() {
                Some(name) if level.matches_name(name) => continue,
                _ => return false,
            }
        }
        names.next().is_none()
    }
}

impl From<Vec<Level>> for Topic {
    fn from(v: Vec<Level>) -> Self {
        Topic(v)
    }
}

impl ops::Deref for Topic {
    type Target = Vec<Level>;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl FromStr for Topic {
    type Err = TopicError;

    #[inline]
    fn from_str(s: &str) -> Result<Self, TopicError> {
        let levels = s
            .split('/')
            .enumerate()
            .map(|(pos, l)| match Level::from_str(l)? {
                Level::Metadata(m) if pos > 0 => Ok(Level::Normal(m)),
                level => Ok(level),
            })
            .collect::<Result<Vec<_>, TopicError>>()?;
        let topic = Topic(levels);
        if topic.is_valid() {
            Ok(topic)
        } else {
            Err(TopicError::InvalidTopic(format!("invalid topic `{}`", s)))
        }
    }
}

impl fmt::Display for Topic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut first = true;
        for level in &self.0 {
            if first {
                first = false;
            } else {
                f.write_char('/')?;
            }
            level.fmt(f)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn topic(s: &str) -> Topic {
        Topic::from_str(s).unwrap()
    }

    #[test]
    fn parse_levels() {
        assert_eq!(
            topic("/finance/+/#").levels(),
            &vec![Level::Blank, Level::Normal("finance".into()), Level::SingleWildcard, Level::MultiWildcard]
        );
        assert_eq!(topic("$SYS/a").levels()[0], Level::Metadata("$SYS".into()));
        assert_eq!(topic("a/$b").levels()[1], Level::Normal("$b".into()));
        assert!(Topic::from_str("sport/tennis#").is_err());
        assert!(Topic::from_str("sport/#/ranking").is_err());
        assert!(Topic::from_str("sport+").is_err());
        assert!(topic("a/+").is_wildcard());
        assert!(!topic("/hello").is_wildcard());
    }

    #[test]
    fn literal_names() {
        assert_eq!(Topic::literal("a+b").levels(), &vec![Level::Normal("a+b".into())]);
        assert_eq!(Topic::literal("a/+").levels()[1], Level::Normal("+".into()));
        assert!(!Topic::literal("x/#").is_wildcard());
        assert_eq!(Topic::literal("$SYS/a"), topic("$SYS/a"));
        assert_eq!(Topic::literal("/hello"), topic("/hello"));
        assert_eq!(Topic::literal("a/+/#").to_string(), "a/+/#");
        //a filter still reaches literal levels
        assert!(topic("a/+").matches_str("a/+"));
        assert!(topic("+").matches_str("a+b"));
    }

    #[test]
    fn display_roundtrip() {
        for s in ["hello", "/hello", "a//b", "+/tennis/#", "$SYS/x", ""] {
            assert_eq!(topic(s).to_string(), s);
        }
    }

    #[test]
    fn matches() {
        let t = topic("sport/tennis/player1/#");
        assert!(t.matches_str("sport/tennis/player1"));
        assert!(t.matches_str("sport/tennis/player1/ranking"));
        assert!(t.matches_str("sport/tennis/player1/score/wimbledon"));
        assert!(topic("sport/#").matches_str("sport"));

        let t = topic("sport/tennis/+");
        assert!(t.matches_str("sport/tennis/player1"));
        assert!(!t.matches_str("sport/tennis/player1/ranking"));

        let t = topic("sport/+");
        assert!(!t.matches_str("sport"));
        assert!(t.matches_str("sport/"));

        assert!(topic("+/+").matches_str("/finance"));
        assert!(topic("/+").matches_str("/finance"));
        assert!(!topic("+").matches_str("/finance"));
        assert!(!topic("/hello").matches_str("hello"));
        assert!(!topic("hello").matches_str("/hello"));

        assert!(!topic("#").matches_str("$SYS"));
        assert!(!topic("+/monitor/Clients").matches_str("$SYS/monitor/Clients"));
        assert!(topic("$SYS/#").matches_str("$SYS/"));
        assert!(topic("$SYS/monitor/+").matches_str("$SYS/monitor/Clients"));
        assert!(topic("a/+").matches_str("a/$b"));
    }
}
