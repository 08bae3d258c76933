use std::collections::BTreeMap;
use std::path::Path;

use base64::Engine;
use kube::api::DynamicObject;
use regex::Regex;
use serde::Deserialize;

use crate::build::LABEL_BUILD;
use crate::error::{Error, Result};
use crate::settings::{BuildRecipe, Settings};

/// Which resource bundle of a kubefiles directory to render.
///
/// `deployment`, `initialize` and `cleanup` must exist; `start` and `stop`
/// are optional hooks since starting and stopping are primarily scale
/// operations on the workload.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BundleMode {
    Deployment,
    Initialize,
    Start,
    Stop,
    Cleanup,
}

impl BundleMode {
    fn filename(&self) -> &'static str {
        match self {
            BundleMode::Deployment => "deployment.yaml",
            BundleMode::Initialize => "initialize.yaml",
            BundleMode::Start => "start.yaml",
            BundleMode::Stop => "stop.yaml",
            BundleMode::Cleanup => "cleanup.yaml",
        }
    }

    fn required(&self) -> bool {
        matches!(
            self,
            BundleMode::Deployment | BundleMode::Initialize | BundleMode::Cleanup
        )
    }
}

/// Render one bundle: read `<kubefiles_path>/<mode>.yaml`, substitute
/// `{{ var }}` placeholders, parse the multi-document YAML and stamp the
/// build label on every resource.
pub fn render(
    kubefiles_path: &Path,
    mode: BundleMode,
    build_name: &str,
    vars: &BTreeMap<String, String>,
) -> Result<Vec<DynamicObject>> {
    let path = kubefiles_path.join(mode.filename());
    let raw = match std::fs::read_to_string(&path) {
        Ok(raw) => raw,
        Err(_) if !mode.required() => return Ok(vec![]),
        Err(e) => {
            return Err(Error::Template(format!(
                "cannot read {}: {e}",
                path.display()
            )))
        }
    };

    let rendered = substitute(&raw, vars)?;

    let mut objects = Vec::new();
    for document in serde_yaml::Deserializer::from_str(&rendered) {
        let value = serde_yaml::Value::deserialize(document)?;
        if value.is_null() {
            continue;
        }
        let json = serde_json::to_value(&value)?;
        let mut object: DynamicObject = serde_json::from_value(json)?;
        if object.types.as_ref().map_or(true, |t| t.kind.is_empty()) {
            return Err(Error::Template(format!(
                "{}: document without apiVersion/kind",
                path.display()
            )));
        }
        object
            .metadata
            .labels
            .get_or_insert_with(Default::default)
            .insert(LABEL_BUILD.to_string(), build_name.to_string());
        objects.push(object);
    }
    Ok(objects)
}

fn substitute(raw: &str, vars: &BTreeMap<String, String>) -> Result<String> {
    // compiled per call; bundles are rendered a few times per build lifetime
    let placeholder = Regex::new(r"\{\{\s*([A-Za-z0-9_]+)\s*\}\}").expect("static regex");
    let mut missing = None;
    let rendered = placeholder.replace_all(raw, |caps: &regex::Captures| {
        let key = &caps[1];
        match vars.get(key) {
            Some(value) => value.clone(),
            None => {
                missing.get_or_insert_with(|| key.to_string());
                String::new()
            }
        }
    });
    match missing {
        Some(key) => Err(Error::Template(format!("unknown template variable {key}"))),
        None => Ok(rendered.into_owned()),
    }
}

/// Variables bag for a build's bundles: identity scalars, the environment
/// bags serialized as JSON (valid inline YAML), global template vars, then
/// recipe vars, later entries winning.
#[allow(clippy::too_many_arguments)]
pub fn template_vars(
    settings: &Settings,
    recipe: &BuildRecipe,
    name: &str,
    repo: &str,
    target_branch: &str,
    pr: Option<u64>,
    commit: &str,
) -> BTreeMap<String, String> {
    let git_ref = match pr {
        Some(pr) => format!("refs/pull/{pr}/head"),
        None => format!("refs/heads/{target_branch}"),
    };

    let env_list: Vec<serde_json::Value> = settings
        .build_env
        .iter()
        .collect::<BTreeMap<_, _>>()
        .into_iter()
        .map(|(k, v)| serde_json::json!({"name": k, "value": v}))
        .collect();

    let secret_data: BTreeMap<String, String> = settings
        .effective_secret_env()
        .into_iter()
        .map(|(k, v)| (k, base64::engine::general_purpose::STANDARD.encode(v)))
        .collect();

    let mut vars = BTreeMap::new();
    vars.insert("name".into(), name.to_string());
    vars.insert("slug".into(), name.to_string());
    vars.insert("image".into(), recipe.image.clone());
    vars.insert("repo".into(), repo.to_string());
    vars.insert("git_ref".into(), git_ref);
    vars.insert(
        "pr".into(),
        pr.map(|n| n.to_string()).unwrap_or_default(),
    );
    vars.insert("commit".into(), commit.to_string());
    vars.insert("build_domain".into(), settings.build_domain.clone());
    vars.insert("namespace".into(), settings.build_namespace.clone());
    vars.insert(
        "build_env_json".into(),
        serde_json::to_string(&env_list).unwrap_or_else(|_| "[]".into()),
    );
    vars.insert(
        "build_secret_env_json".into(),
        serde_json::to_string(&secret_data).unwrap_or_else(|_| "{}".into()),
    );
    for (k, v) in &settings.build_template_vars {
        vars.insert(k.clone(), v.clone());
    }
    for (k, v) in &recipe.template_vars {
        vars.insert(k.clone(), v.clone());
    }
    vars
}
