use regex::{Captures, Regex};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;

pub type TemplateVars = BTreeMap<String, String>;

#[derive(Debug, thiserror::Error)]
pub enum TemplateError {
    #[error("cannot read template {path}: {source}")]
    Unreadable {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Substitutes `{{ VAR }}` placeholders into template text.
pub trait TemplateEngine: Send + Sync {
    fn render(&self, template: &str, vars: &TemplateVars) -> String;
}

/// Plain placeholder substitution. Unknown variables render as empty text.
#[derive(Debug, Clone, Copy, Default)]
pub struct PlaceholderEngine;

fn placeholder() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"\{\{\s*([A-Za-z_][A-Za-z0-9_]*)\s*\}\}")
            .unwrap_or_else(|e| panic!("placeholder pattern must compile: {}", e))
    })
}

impl TemplateEngine for PlaceholderEngine {
    fn render(&self, template: &str, vars: &TemplateVars) -> String {
        placeholder()
            .replace_all(template, |caps: &Captures<'_>| {
                vars.get(&caps[1]).cloned().unwrap_or_default()
            })
            .into_owned()
    }
}

/// Names referenced by `template`, in order of first appearance.
pub fn referenced_variables(template: &str) -> Vec<String> {
    let mut names: Vec<String> = Vec::new();
    for caps in placeholder().captures_iter(template) {
        let name = caps[1].to_string();
        if !names.contains(&name) {
            names.push(name);
        }
    }
    names
}

/// Referenced names with no binding in `vars`; these render empty.
pub fn unbound_variables(template: &str, vars: &TemplateVars) -> Vec<String> {
    referenced_variables(template)
        .into_iter()
        .filter(|name| !vars.contains_key(name))
        .collect()
}

pub fn load_template(path: &Path) -> Result<String, TemplateError> {
    fs::read_to_string(path).map_err(|source| TemplateError::Unreadable {
        path: path.to_path_buf(),
        source,
    })
}
