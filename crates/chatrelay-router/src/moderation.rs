//! Moderation gate
//!
//! Checkers run in a fixed order and the first one that flags content stops
//! the chain. The gate itself never fails: a checker that cannot reach its
//! backend reports [`Verdict::Unavailable`] and the text is let through with
//! the `moderation_unavailable` category attached.

use chatrelay_core::{
    ClassifierConfig, Error, ModerationAction, ModerationConfig, ModerationResult, Result,
    SafetyLevel, MODERATION_UNAVAILABLE,
};
use chatrelay_llm::ModerationClassifier;
use regex::Regex;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

/// Outcome of a single checker.
#[derive(Clone, Debug, PartialEq)]
pub enum Verdict {
    Allow,
    /// Safe, but these categories should be surfaced as warnings.
    Monitor { categories: BTreeSet<String>, confidence: f32 },
    Block {
        categories: BTreeSet<String>,
        reason: String,
        confidence: f32,
    },
    Unavailable(String),
}

#[async_trait::async_trait]
pub trait Checker: Send + Sync {
    fn name(&self) -> &str;

    async fn check(&self, text: &str, level: SafetyLevel) -> Verdict;
}

// ============================================================
// Pattern
// ============================================================

/// Blacklist words and configured regexes.
pub struct PatternChecker {
    rules: Vec<(Regex, String)>,
}

impl PatternChecker {
    pub fn new(blacklist: &[String], patterns: &[(String, String)]) -> Result<Self> {
        let mut rules = Vec::new();
        let words: Vec<String> = blacklist
            .iter()
            .map(|w| w.trim())
            .filter(|w| !w.is_empty())
            .map(whole_word)
            .collect();
        if !words.is_empty() {
            let re = Regex::new(&format!("(?i)(?:{})", words.join("|")))
                .map_err(|e| Error::config(format!("moderation blacklist: {}", e)))?;
            rules.push((re, "blacklist".to_string()));
        }
        for (pattern, category) in patterns {
            let re = Regex::new(pattern)
                .map_err(|e| Error::config(format!("moderation pattern {:?}: {}", pattern, e)))?;
            rules.push((re, category.clone()));
        }
        Ok(Self { rules })
    }
}

/// Escape `word` and anchor it so it only matches as a whole token. `\b` needs
/// a word character on its inner side, so edges that are punctuation are
/// bounded by a non-word character or the ends of the text instead.
fn whole_word(word: &str) -> String {
    let is_word = |c: char| c.is_alphanumeric() || c == '_';
    let starts = word.chars().next().map_or(false, is_word);
    let ends = word.chars().last().map_or(false, is_word);
    format!(
        "{}{}{}",
        if starts { r"\b" } else { r"(?:^|[^\w])" },
        regex::escape(word),
        if ends { r"\b" } else { r"(?:[^\w]|$)" },
    )
}

#[async_trait::async_trait]
impl Checker for PatternChecker {
    fn name(&self) -> &str {
        "pattern"
    }

    async fn check(&self, text: &str, _level: SafetyLevel) -> Verdict {
        let categories: BTreeSet<String> = self
            .rules
            .iter()
            .filter(|(re, _)| re.is_match(text))
            .map(|(_, category)| category.clone())
            .collect();
        if categories.is_empty() {
            return Verdict::Allow;
        }
        let reason = format!(
            "message matched blocked content ({})",
            categories.iter().cloned().collect::<Vec<_>>().join(", ")
        );
        Verdict::Block {
            categories,
            reason,
            confidence: 1.0,
        }
    }
}

// ============================================================
// Length
// ============================================================

pub struct LengthChecker {
    max_chars: usize,
}

impl LengthChecker {
    pub fn new(max_chars: usize) -> Self {
        Self { max_chars }
    }
}

#[async_trait::async_trait]
impl Checker for LengthChecker {
    fn name(&self) -> &str {
        "length"
    }

    async fn check(&self, text: &str, _level: SafetyLevel) -> Verdict {
        let chars = text.chars().count();
        if chars <= self.max_chars {
            return Verdict::Allow;
        }
        Verdict::Block {
            categories: BTreeSet::from(["length".to_string()]),
            reason: format!(
                "message is {} characters, limit is {}",
                chars, self.max_chars
            ),
            confidence: 1.0,
        }
    }
}

// ============================================================
// Classifier
// ============================================================

/// External classifier with a category policy table.
pub struct ClassifierChecker {
    classifier: Arc<dyn ModerationClassifier>,
    policy: BTreeMap<String, ModerationAction>,
    default_action: ModerationAction,
    timeout: Duration,
}

impl ClassifierChecker {
    pub fn new(
        classifier: Arc<dyn ModerationClassifier>,
        policy: BTreeMap<String, ModerationAction>,
        default_action: ModerationAction,
        timeout: Duration,
    ) -> Self {
        Self {
            classifier,
            policy,
            default_action,
            timeout,
        }
    }

    fn action_for(&self, category: &str, level: SafetyLevel) -> ModerationAction {
        let base = self
            .policy
            .get(category)
            .copied()
            .unwrap_or(self.default_action);
        level.adjust(base)
    }
}

#[async_trait::async_trait]
impl Checker for ClassifierChecker {
    fn name(&self) -> &str {
        "classifier"
    }

    async fn check(&self, text: &str, level: SafetyLevel) -> Verdict {
        let classification =
            match tokio::time::timeout(self.timeout, self.classifier.classify(text)).await {
                Ok(Ok(c)) => c,
                Ok(Err(e)) => return Verdict::Unavailable(e.to_string()),
                Err(_) => {
                    return Verdict::Unavailable(format!(
                        "classifier timed out after {}ms",
                        self.timeout.as_millis()
                    ))
                }
            };

        let mut blocked = BTreeSet::new();
        let mut monitored = BTreeSet::new();
        let mut block_score: f32 = 0.0;
        let mut monitor_score: f32 = 0.0;
        for (category, score) in &classification.categories {
            match self.action_for(category, level) {
                ModerationAction::Block => {
                    blocked.insert(category.clone());
                    block_score = block_score.max(*score);
                }
                ModerationAction::Monitor => {
                    monitored.insert(category.clone());
                    monitor_score = monitor_score.max(*score);
                }
                ModerationAction::Allow => {}
            }
        }

        if !blocked.is_empty() {
            let reason = format!(
                "message flagged for {}",
                blocked.iter().cloned().collect::<Vec<_>>().join(", ")
            );
            return Verdict::Block {
                categories: blocked,
                reason,
                confidence: block_score,
            };
        }
        if !monitored.is_empty() {
            return Verdict::Monitor {
                categories: monitored,
                confidence: monitor_score,
            };
        }
        Verdict::Allow
    }
}

// ============================================================
// Gate
// ============================================================

pub struct ModerationGate {
    checkers: Vec<Box<dyn Checker>>,
}

impl ModerationGate {
    /// Checkers run in the given order.
    pub fn new(checkers: Vec<Box<dyn Checker>>) -> Self {
        Self { checkers }
    }

    /// Pattern, then length, then the classifier when one is supplied.
    pub fn from_config(
        config: &ModerationConfig,
        classifier: Option<Arc<dyn ModerationClassifier>>,
    ) -> Result<Self> {
        let patterns: Vec<(String, String)> = config
            .patterns
            .iter()
            .map(|p| (p.pattern.clone(), p.category.clone()))
            .collect();
        let mut checkers: Vec<Box<dyn Checker>> = vec![
            Box::new(PatternChecker::new(&config.blacklist, &patterns)?),
            Box::new(LengthChecker::new(config.max_chars)),
        ];
        if let Some(classifier) = classifier {
            let timeout_ms = config
                .classifier
                .as_ref()
                .map_or(ClassifierConfig::default().timeout_ms, |c| c.timeout_ms);
            checkers.push(Box::new(ClassifierChecker::new(
                classifier,
                config.categories.clone(),
                config.default_action,
                Duration::from_millis(timeout_ms),
            )));
        }
        Ok(Self::new(checkers))
    }

    pub async fn check(&self, text: &str, level: SafetyLevel) -> ModerationResult {
        if text.trim().is_empty() {
            return ModerationResult::allow();
        }

        let mut result = ModerationResult::allow();
        for checker in &self.checkers {
            match checker.check(text, level).await {
                Verdict::Allow => {}
                Verdict::Monitor {
                    categories,
                    confidence,
                } => {
                    debug!(checker = checker.name(), "monitored categories: {:?}", categories);
                    result.categories.extend(categories);
                    result.confidence = result.confidence.min(confidence);
                }
                Verdict::Block {
                    categories,
                    reason,
                    confidence,
                } => {
                    debug!(checker = checker.name(), "blocked: {}", reason);
                    return ModerationResult {
                        safe: false,
                        categories,
                        confidence,
                        reason: Some(reason),
                    };
                }
                Verdict::Unavailable(reason) => {
                    warn!(checker = checker.name(), "moderation unavailable: {}", reason);
                    result.categories.insert(MODERATION_UNAVAILABLE.to_string());
                    result.confidence = 0.0;
                    result.reason = Some(reason);
                }
            }
        }
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn blacklist_is_whole_word_and_case_insensitive() {
        let checker = PatternChecker::new(&["darn".to_string()], &[]).unwrap();
        assert!(matches!(
            checker.check("well DARN it", SafetyLevel::Standard).await,
            Verdict::Block { .. }
        ));
        assert_eq!(
            checker.check("darning socks", SafetyLevel::Standard).await,
            Verdict::Allow
        );
    }

    #[test]
    fn word_boundaries_only_on_word_edges() {
        assert_eq!(whole_word("darn"), r"\bdarn\b");
        assert_eq!(whole_word("a$$"), r"\ba\$\$(?:[^\w]|$)");
        assert_eq!(whole_word("@home"), r"(?:^|[^\w])@home\b");
    }

    #[tokio::test]
    async fn length_counts_chars_not_bytes() {
        let checker = LengthChecker::new(3);
        assert_eq!(checker.check("héé", SafetyLevel::Standard).await, Verdict::Allow);
        assert!(matches!(
            checker.check("four", SafetyLevel::Standard).await,
            Verdict::Block { .. }
        ));
    }

    #[test]
    fn bad_pattern_is_config_error() {
        let err = PatternChecker::new(&[], &[("(unclosed".into(), "x".into())])
            .err()
            .unwrap();
        assert_eq!(err.kind(), chatrelay_core::ErrorKind::Config);
    }
}
