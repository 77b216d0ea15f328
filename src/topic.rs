//! 購読するトピックの解決。
//!
//! `topics`にはカンマ区切りのトピック名か、`/.../`で囲んだ正規表現を指定する。
//! 正規表現の場合はブローカーのトピック一覧と照合し、定期的に再解決する。
use crate::error::ConfigError;
use regex::Regex;
use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

#[derive(Clone, Debug)]
pub enum Subscription {
    /// 順序付きのトピック名
    Topics(Vec<String>),
    /// トピック名の先頭に一致させる正規表現
    Pattern(Regex),
}

impl Subscription {
    pub fn parse(value: &str) -> Result<Self, ConfigError> {
        let value = value.trim();
        if let Some(expression) = value
            .strip_prefix('/')
            .and_then(|s| s.strip_suffix('/'))
            .filter(|s| !s.is_empty())
        {
            let regex = Regex::new(&format!("^(?:{})", expression))?;
            return Ok(Subscription::Pattern(regex));
        }
        let mut topics: Vec<String> = vec![];
        for topic in value.split(',').map(str::trim).filter(|t| !t.is_empty()) {
            if !topics.iter().any(|t| t == topic) {
                topics.push(topic.to_string());
            }
        }
        if topics.is_empty() {
            return Err(ConfigError::invalid("topics", "at least one topic is required"));
        }
        Ok(Subscription::Topics(topics))
    }

    pub fn is_pattern(&self) -> bool {
        matches!(self, Subscription::Pattern(_))
    }

    pub fn matches(&self, topic: &str) -> bool {
        match self {
            Subscription::Topics(topics) => topics.iter().any(|t| t == topic),
            Subscription::Pattern(regex) => !topic.starts_with("__") && regex.is_match(topic),
        }
    }
}

impl FromStr for Subscription {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Subscription::parse(s)
    }
}

impl fmt::Display for Subscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Subscription::Topics(topics) => write!(f, "{}", topics.join(",")),
            Subscription::Pattern(regex) => {
                let expression = regex.as_str();
                let inner = expression
                    .strip_prefix("^(?:")
                    .and_then(|s| s.strip_suffix(')'))
                    .unwrap_or(expression);
                write!(f, "/{}/", inner)
            }
        }
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ResolveError {
    /// 一致するトピックが無い。トピックが作成されるまで再試行する。
    #[error("NoMatchingTopic: no topic matches {0}")]
    Empty(String),
}

/// 再解決によって購読するトピックが変化したことを表す。
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TopicChange {
    pub added: Vec<String>,
    pub removed: Vec<String>,
    /// 変化後のトピック一覧
    pub topics: Vec<String>,
}

/// [Subscription]を具体的なトピック名の一覧へ解決する。
#[derive(Clone, Debug)]
pub struct TopicResolver {
    subscription: Subscription,
    current: Vec<String>,
}

impl TopicResolver {
    pub fn new(subscription: Subscription) -> Self {
        Self {
            subscription,
            current: vec![],
        }
    }

    pub fn subscription(&self) -> &Subscription {
        &self.subscription
    }

    /// 解決にブローカーのトピック一覧が必要かどうか。
    pub fn needs_catalog(&self) -> bool {
        self.subscription.is_pattern()
    }

    /// 最後に適用したトピック一覧
    pub fn current(&self) -> &[String] {
        &self.current
    }

    /// トピック一覧を解決する。明示的な指定の場合、`catalog`は参照しない。
    pub fn resolve(&self, catalog: &[String]) -> Result<Vec<String>, ResolveError> {
        let topics = match &self.subscription {
            Subscription::Topics(topics) => topics.clone(),
            Subscription::Pattern(_) => catalog
                .iter()
                .filter(|t| self.subscription.matches(t))
                .cloned()
                .collect::<BTreeSet<_>>()
                .into_iter()
                .collect(),
        };
        if topics.is_empty() {
            return Err(ResolveError::Empty(self.subscription.to_string()));
        }
        Ok(topics)
    }

    /// `topics`を現在の一覧と比較する。変化が無ければNone。
    pub fn diff(&self, topics: &[String]) -> Option<TopicChange> {
        let added = topics
            .iter()
            .filter(|t| !self.current.contains(t))
            .cloned()
            .collect::<Vec<_>>();
        let removed = self
            .current
            .iter()
            .filter(|t| !topics.contains(t))
            .cloned()
            .collect::<Vec<_>>();
        if added.is_empty() && removed.is_empty() {
            return None;
        }
        Some(TopicChange {
            added,
            removed,
            topics: topics.to_vec(),
        })
    }

    /// 購読の更新に成功したトピック一覧を記録する。
    pub fn apply(&mut self, topics: Vec<String>) {
        self.current = topics;
    }
}
