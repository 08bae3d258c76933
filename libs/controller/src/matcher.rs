use crate::settings::{BuildRecipe, RepoRule};

use regex::Regex;
use thiserror::Error;

#[derive(Error, Debug)]
#[error("invalid regex in rule {rule}: {source}")]
pub struct MatcherError {
    rule: usize,
    #[source]
    source: regex::Error,
}

struct CompiledRule {
    repo: Regex,
    branch: Regex,
    builds: Vec<BuildRecipe>,
}

/// Ordered `(repo, branch)` matching over the configured rules.
///
/// Pure and side-effect free; used at deploy time and to filter webhook
/// events before anything touches the cluster. First match wins.
pub struct RepoMatcher {
    rules: Vec<CompiledRule>,
}

impl RepoMatcher {
    /// Compile the rule set. Regexes are anchored on both ends, so a rule
    /// `"acme/svc"` matches that repo exactly, not as a substring.
    pub fn new(rules: &[RepoRule]) -> Result<Self, MatcherError> {
        let compiled = rules
            .iter()
            .enumerate()
            .map(|(i, rule)| {
                let compile = |pattern: &str| {
                    Regex::new(&format!("^(?:{pattern})$"))
                        .map_err(|source| MatcherError { rule: i, source })
                };
                Ok(CompiledRule {
                    repo: compile(&rule.repo)?,
                    branch: compile(&rule.branch)?,
                    builds: rule.builds.clone(),
                })
            })
            .collect::<Result<Vec<_>, _>>()?;
        Ok(RepoMatcher { rules: compiled })
    }

    /// Recipes of the first rule matching `(repo, branch)`, or `None` when
    /// the input should be rejected. Matching is case-insensitive on the
    /// repo side (GitHub repo names are).
    pub fn matches(&self, repo: &str, branch: &str) -> Option<&[BuildRecipe]> {
        let repo = repo.to_lowercase();
        self.rules
            .iter()
            .find(|rule| rule.repo.is_match(&repo) && rule.branch.is_match(branch))
            .map(|rule| rule.builds.as_slice())
    }
}
