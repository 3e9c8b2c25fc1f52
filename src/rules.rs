//! Domain rules.
//!
//! A rules file holds one `<tag> <pattern>` pair per line. `#` starts a comment.
//! Patterns are globs over the full domain name: `*` matches any run of
//! characters (including none), `?` matches exactly one character and `.` is
//! literal. The first rule whose pattern matches wins.

use parking_lot::RwLock;
use regex::Regex;
use std::path::Path;
use std::sync::Arc;
use tracing::info;

use crate::error::RuleError;

/// Written to the rules path when no rules file exists.
const RULES_TEMPLATE: &str = "\
# Example:
# block example.com
# allow analytics.example.com
# block *.example.com
";

/// A tagged domain pattern.
#[derive(Debug, Clone)]
pub struct Rule {
    /// Tag passed to triggers on match.
    pub tag: String,
    /// Pattern as written in the rules file.
    pub pattern: String,
    matcher: Regex,
}

impl Rule {
    /// Compile a rule from its tag and glob pattern.
    pub fn new(tag: impl Into<String>, pattern: impl Into<String>) -> Result<Self, RuleError> {
        let pattern = pattern.into();
        let matcher = compile(&pattern)?;
        Ok(Self {
            tag: tag.into(),
            pattern,
            matcher,
        })
    }

    /// Whether the pattern matches the whole domain.
    pub fn matches(&self, domain: &str) -> bool {
        self.matcher.is_match(domain)
    }
}

/// Translate a glob pattern into an anchored regex.
///
/// Characters other than `.`, `*` and `?` are passed through unchanged.
pub fn compile(pattern: &str) -> Result<Regex, RuleError> {
    let body = pattern
        .replace('.', r"\.")
        .replace('*', ".*")
        .replace('?', ".");

    Regex::new(&format!("^{}$", body)).map_err(|source| RuleError::Pattern {
        pattern: pattern.to_string(),
        source,
    })
}

/// Ordered, immutable list of rules.
#[derive(Debug, Clone, Default)]
pub struct RuleSet {
    rules: Vec<Rule>,
}

impl RuleSet {
    /// Build a rule set from already compiled rules, preserving order.
    pub fn new(rules: Vec<Rule>) -> Self {
        Self { rules }
    }

    /// Parse rules from text.
    pub fn parse(text: &str) -> Result<Self, RuleError> {
        let mut rules = Vec::new();

        for (index, line) in text.lines().enumerate() {
            let line = match line.find('#') {
                Some(comment) => &line[..comment],
                None => line,
            };

            let fields: Vec<&str> = line.split_whitespace().collect();
            match fields.as_slice() {
                [] => continue,
                [tag, pattern] => rules.push(Rule::new(*tag, *pattern)?),
                _ => return Err(RuleError::Syntax { line: index + 1 }),
            }
        }

        Ok(Self { rules })
    }

    /// Load rules from a file, creating it with a commented example if it does not exist.
    pub async fn load(path: &Path) -> Result<Self, RuleError> {
        let io_err = |source| RuleError::Io {
            path: path.to_path_buf(),
            source,
        };

        let text = match tokio::fs::read_to_string(path).await {
            Ok(text) => text,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tokio::fs::write(path, RULES_TEMPLATE)
                    .await
                    .map_err(io_err)?;
                info!(path = %path.display(), "Wrote example rules file");
                RULES_TEMPLATE.to_string()
            }
            Err(e) => return Err(io_err(e)),
        };

        Self::parse(&text)
    }

    /// First rule matching the domain, in file order.
    pub fn find(&self, domain: &str) -> Option<&Rule> {
        self.rules.iter().find(|rule| rule.matches(domain))
    }

    /// Number of rules.
    pub fn len(&self) -> usize {
        self.rules.len()
    }

    /// Whether the set has no rules.
    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    /// Iterate rules in file order.
    pub fn iter(&self) -> impl Iterator<Item = &Rule> {
        self.rules.iter()
    }
}

/// Rule set shared between the supervisor and a running server.
///
/// Readers take a snapshot; the supervisor swaps in whole new sets.
#[derive(Debug, Clone, Default)]
pub struct SharedRules {
    inner: Arc<RwLock<Arc<RuleSet>>>,
}

impl SharedRules {
    /// Share an initial rule set.
    pub fn new(rules: Arc<RuleSet>) -> Self {
        Self {
            inner: Arc::new(RwLock::new(rules)),
        }
    }

    /// Current snapshot.
    pub fn load(&self) -> Arc<RuleSet> {
        self.inner.read().clone()
    }

    /// Replace the rule set. In-flight readers keep their snapshot.
    pub fn store(&self, rules: Arc<RuleSet>) {
        *self.inner.write() = rules;
    }
}
