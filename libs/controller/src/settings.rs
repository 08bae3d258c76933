use std::collections::HashMap;
use std::env;
use std::path::PathBuf;

use serde::Deserialize;
use thiserror::Error;

/// Configuration errors are fatal at startup.
#[derive(Error, Debug)]
pub enum SettingsError {
    #[error("missing required environment variable {0}")]
    Missing(&'static str),

    #[error("invalid value for {var}: {source}")]
    Json {
        var: &'static str,
        #[source]
        source: serde_json::Error,
    },

    #[error("invalid value for {var}: {reason}")]
    Invalid { var: &'static str, reason: String },
}

/// One way to build a matched repo: which image to run and which kubefiles
/// directory to render, plus extra template variables.
#[derive(Debug, Clone, Deserialize, PartialEq)]
pub struct BuildRecipe {
    pub image: String,
    #[serde(default)]
    pub kubefiles_path: Option<PathBuf>,
    #[serde(default)]
    pub template_vars: HashMap<String, String>,
}

/// An ordered matching rule: regexes over `(repo, branch)` and the recipes
/// to build on a match.
#[derive(Debug, Clone, Deserialize, PartialEq)]
pub struct RepoRule {
    pub repo: String,
    pub branch: String,
    pub builds: Vec<BuildRecipe>,
}

#[derive(Debug, Clone)]
pub struct Settings {
    /// Ordered deploy rules, first match wins.
    pub repos: Vec<RepoRule>,
    /// Namespace all build resources live in.
    pub build_namespace: String,
    /// Wildcard domain suffix; a build is served at `http://<slug>.<domain>`.
    pub build_domain: String,
    pub build_env: HashMap<String, String>,
    pub build_secret_env: HashMap<String, String>,
    pub build_template_vars: HashMap<String, String>,
    pub default_kubefiles_path: PathBuf,
    pub max_initializing: usize,
    pub max_started: usize,
    pub max_deployed: usize,
    pub api_admin_user: String,
    pub api_admin_password: String,
    pub github_token: Option<String>,
    pub github_webhook_secret: Option<String>,
    pub base_url: String,
    pub additional_footer_html: Option<String>,
}

impl Settings {
    pub fn from_env() -> Result<Self, SettingsError> {
        Self::from_lookup(&|var| env::var(var).ok())
    }

    fn from_lookup(get: &dyn Fn(&str) -> Option<String>) -> Result<Self, SettingsError> {
        let settings = Settings {
            repos: required_json(get, "RUNBOAT_REPOS")?,
            build_namespace: required(get, "RUNBOAT_BUILD_NAMESPACE")?,
            build_domain: required(get, "RUNBOAT_BUILD_DOMAIN")?,
            build_env: optional_json(get, "RUNBOAT_BUILD_ENV")?.unwrap_or_default(),
            build_secret_env: optional_json(get, "RUNBOAT_BUILD_SECRET_ENV")?.unwrap_or_default(),
            build_template_vars: optional_json(get, "RUNBOAT_BUILD_TEMPLATE_VARS")?
                .unwrap_or_default(),
            default_kubefiles_path: get("RUNBOAT_DEFAULT_KUBEFILES_PATH")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from("kubefiles")),
            max_initializing: positive(get, "RUNBOAT_MAX_INITIALIZING", 2)?,
            max_started: positive(get, "RUNBOAT_MAX_STARTED", 6)?,
            max_deployed: positive(get, "RUNBOAT_MAX_DEPLOYED", 60)?,
            api_admin_user: required(get, "RUNBOAT_API_ADMIN_USER")?,
            api_admin_password: required(get, "RUNBOAT_API_ADMIN_PASSWORD")?,
            github_token: get("RUNBOAT_GITHUB_TOKEN"),
            github_webhook_secret: get("RUNBOAT_GITHUB_WEBHOOK_SECRET"),
            base_url: get("RUNBOAT_BASE_URL").unwrap_or_else(|| "http://localhost:8080".into()),
            additional_footer_html: get("RUNBOAT_ADDITIONAL_FOOTER_HTML"),
        };
        if settings.repos.is_empty() {
            return Err(SettingsError::Invalid {
                var: "RUNBOAT_REPOS",
                reason: "at least one rule is required".into(),
            });
        }
        Ok(settings)
    }

    /// Secret environment handed to templates; the configured GitHub token is
    /// exposed as `GITHUB_TOKEN` so builds can fetch private repositories.
    pub fn effective_secret_env(&self) -> HashMap<String, String> {
        let mut env = self.build_secret_env.clone();
        if let Some(token) = &self.github_token {
            env.entry("GITHUB_TOKEN".into()).or_insert_with(|| token.clone());
        }
        env
    }

    /// Kubefiles directory for a recipe, falling back to the global default.
    pub fn kubefiles_path_for(&self, recipe: &BuildRecipe) -> PathBuf {
        recipe
            .kubefiles_path
            .clone()
            .unwrap_or_else(|| self.default_kubefiles_path.clone())
    }
}

fn required(get: &dyn Fn(&str) -> Option<String>, var: &'static str) -> Result<String, SettingsError> {
    get(var).filter(|v| !v.is_empty()).ok_or(SettingsError::Missing(var))
}

fn required_json<T: serde::de::DeserializeOwned>(
    get: &dyn Fn(&str) -> Option<String>,
    var: &'static str,
) -> Result<T, SettingsError> {
    let raw = required(get, var)?;
    serde_json::from_str(&raw).map_err(|source| SettingsError::Json { var, source })
}

fn optional_json<T: serde::de::DeserializeOwned>(
    get: &dyn Fn(&str) -> Option<String>,
    var: &'static str,
) -> Result<Option<T>, SettingsError> {
    match get(var) {
        None => Ok(None),
        Some(raw) if raw.is_empty() => Ok(None),
        Some(raw) => serde_json::from_str(&raw)
            .map(Some)
            .map_err(|source| SettingsError::Json { var, source }),
    }
}

fn positive(
    get: &dyn Fn(&str) -> Option<String>,
    var: &'static str,
    default: usize,
) -> Result<usize, SettingsError> {
    match get(var) {
        None => Ok(default),
        Some(raw) => match raw.parse::<usize>() {
            Ok(n) if n > 0 => Ok(n),
            Ok(_) => Err(SettingsError::Invalid {
                var,
                reason: "must be a positive integer".into(),
            }),
            Err(e) => Err(SettingsError::Invalid {
                var,
                reason: e.to_string(),
            }),
        },
    }
}
