//! Template renderer
//!
//! Wraps a minijinja environment over a template directory. The renderer
//! exposes the helpers templates rely on: `ini_escape`, `quote`,
//! `sha256sum`, `derive_password`, and recursive `render`.
//!
//! Each render pass builds a fresh environment so the helper closures can
//! capture the tick's options snapshot; the per-tick cost is negligible
//! next to the remote calls surrounding it.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use minijinja::{path_loader, Environment, ErrorKind, State, Value};
use sha2::{Digest, Sha256};
use tracing::error;

use super::TEMPLATE_SUFFIX;
use crate::password::{derive_site_password, vcenter_password, MasterKey, TemplateClass};
use crate::{Error, Result};

/// Flat options map handed to templates as top-level variables
pub type Options = BTreeMap<String, String>;

/// Renders scope-prefixed templates from a directory
pub struct TemplateRenderer {
    root: PathBuf,
}

impl TemplateRenderer {
    /// Create a renderer over the given template directory
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// The template directory this renderer reads from
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Template file names eligible for a scope, in sorted order
    ///
    /// A template is eligible if its name begins with the scope token and
    /// ends with `.yaml.j2`.
    pub fn eligible(&self, scope: &str) -> Result<Vec<String>> {
        let entries = std::fs::read_dir(&self.root).map_err(|e| {
            Error::template(format!(
                "cannot read template directory {}: {}",
                self.root.display(),
                e
            ))
        })?;

        let mut names: Vec<String> = entries
            .filter_map(|entry| entry.ok())
            .filter_map(|entry| entry.file_name().into_string().ok())
            .filter(|name| name.starts_with(scope) && name.ends_with(TEMPLATE_SUFFIX))
            .collect();
        names.sort();
        Ok(names)
    }

    /// Render every eligible template for a scope into one YAML stream
    ///
    /// A template that fails to parse or render contributes nothing and is
    /// logged loudly; the remaining templates still render. The returned
    /// stream separates each template's output with a document marker.
    pub fn render_scope(
        &self,
        scope: &str,
        options: &Options,
        master_key: Option<&MasterKey>,
    ) -> Result<String> {
        let names = self.eligible(scope)?;
        let env = self.environment(options, master_key.cloned());
        let ctx = Value::from_serialize(options);

        let mut out = String::new();
        for name in names {
            let rendered = env
                .get_template(&name)
                .and_then(|template| template.render(ctx.clone()));
            match rendered {
                Ok(body) => {
                    out.push_str("---\n");
                    out.push_str(&body);
                    out.push('\n');
                }
                Err(e) => {
                    error!(template = %name, error = %e, "template failed, skipped for this tick");
                }
            }
        }
        Ok(out)
    }

    /// Build the environment for one options snapshot
    fn environment(&self, options: &Options, master_key: Option<MasterKey>) -> Environment<'static> {
        let mut env = Environment::new();
        env.set_loader(path_loader(self.root.clone()));

        env.add_filter("ini_escape", ini_escape);
        env.add_filter("quote", quote);
        env.add_filter("sha256sum", sha256sum);

        let config_username = options.get("username").cloned();
        let master_password = options.get("master_password").cloned();
        let host = options.get("host").cloned();
        env.add_function(
            "derive_password",
            move |username: Option<String>| -> std::result::Result<String, minijinja::Error> {
                let host = host.clone().ok_or_else(|| {
                    minijinja::Error::new(
                        ErrorKind::InvalidOperation,
                        "derive_password needs the `host` option",
                    )
                })?;
                let derived = match (&username, &master_key) {
                    // Common path: no override, master key already stretched
                    (None, Some(key)) => vcenter_password(key, &host),
                    _ => {
                        let user = username
                            .clone()
                            .or_else(|| config_username.clone())
                            .ok_or_else(|| {
                                minijinja::Error::new(
                                    ErrorKind::InvalidOperation,
                                    "derive_password needs a username",
                                )
                            })?;
                        let master = master_password.clone().ok_or_else(|| {
                            minijinja::Error::new(
                                ErrorKind::InvalidOperation,
                                "derive_password needs the `master_password` option",
                            )
                        })?;
                        derive_site_password(&user, &master, &host, 1, TemplateClass::Long)
                            .map(|p| p.replace('/', ""))
                    }
                };
                derived.map_err(|e| {
                    minijinja::Error::new(ErrorKind::InvalidOperation, e.to_string())
                })
            },
        );

        let ctx = Value::from_serialize(options);
        env.add_function(
            "render",
            move |state: &State, name: String| -> std::result::Result<String, minijinja::Error> {
                let template = state.env().get_template(&name)?;
                template.render(ctx.clone())
            },
        );

        env
    }
}

/// Escape `$` for ini-style config consumers
fn ini_escape(value: String) -> String {
    value.replace('$', "$$")
}

/// Ini-escape and wrap in double quotes, escaping embedded quotes
fn quote(value: String) -> String {
    format!("\"{}\"", ini_escape(value).replace('"', "\\\""))
}

/// Lowercase hex SHA-256 of the input
fn sha256sum(value: String) -> String {
    format!("{:x}", Sha256::digest(value.as_bytes()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    fn write_template(dir: &TempDir, name: &str, body: &str) {
        fs::write(dir.path().join(name), body).unwrap();
    }

    fn options(pairs: &[(&str, &str)]) -> Options {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    // =========================================================================
    // Story: Scope-based template lookup
    // =========================================================================

    #[test]
    fn test_eligible_filters_by_scope_and_suffix() {
        let dir = TempDir::new().unwrap();
        write_template(&dir, "vcenter_cluster_cloud.yaml.j2", "kind: A");
        write_template(&dir, "vcenter_cluster_agent.yaml.j2", "kind: B");
        write_template(&dir, "vcenter_datacenter_dns.yaml.j2", "kind: C");
        write_template(&dir, "global_settings.yaml.j2", "kind: D");
        write_template(&dir, "vcenter_cluster_notes.txt", "not a template");

        let renderer = TemplateRenderer::new(dir.path());
        let names = renderer.eligible("vcenter_cluster").unwrap();
        assert_eq!(
            names,
            vec![
                "vcenter_cluster_agent.yaml.j2".to_string(),
                "vcenter_cluster_cloud.yaml.j2".to_string(),
            ]
        );
    }

    #[test]
    fn test_render_is_stable_across_passes() {
        let dir = TempDir::new().unwrap();
        write_template(
            &dir,
            "vcenter_cluster_a.yaml.j2",
            "apiVersion: v1\nkind: ConfigMap\nmetadata:\n  name: {{ name }}\n",
        );
        write_template(
            &dir,
            "vcenter_cluster_b.yaml.j2",
            "apiVersion: v1\nkind: Secret\nmetadata:\n  name: {{ name }}-secret\n",
        );

        let renderer = TemplateRenderer::new(dir.path());
        let opts = options(&[("name", "bb01")]);
        let first = renderer.render_scope("vcenter_cluster", &opts, None).unwrap();
        let second = renderer.render_scope("vcenter_cluster", &opts, None).unwrap();
        assert_eq!(first, second);
        assert!(first.contains("name: bb01\n"));
        assert!(first.contains("name: bb01-secret\n"));
    }

    #[test]
    fn test_failing_template_is_skipped() {
        let dir = TempDir::new().unwrap();
        write_template(&dir, "global_broken.yaml.j2", "{{ unclosed");
        write_template(
            &dir,
            "global_ok.yaml.j2",
            "apiVersion: v1\nkind: ConfigMap\nmetadata:\n  name: survivor\n",
        );

        let renderer = TemplateRenderer::new(dir.path());
        let out = renderer.render_scope("global", &options(&[]), None).unwrap();
        assert!(out.contains("name: survivor"));
        assert!(!out.contains("unclosed"));
    }

    // =========================================================================
    // Story: Template helpers
    // =========================================================================

    #[test]
    fn test_ini_escape_filter() {
        let dir = TempDir::new().unwrap();
        write_template(&dir, "global_ini.yaml.j2", "value: {{ raw | ini_escape }}");

        let renderer = TemplateRenderer::new(dir.path());
        let out = renderer
            .render_scope("global", &options(&[("raw", "pa$$word")]), None)
            .unwrap();
        assert!(out.contains("value: pa$$$$word"));
    }

    #[test]
    fn test_ini_escape_idempotent_without_dollar() {
        assert_eq!(ini_escape("plain".into()), "plain");
        assert_eq!(ini_escape(ini_escape("plain".into())), "plain");
    }

    #[test]
    fn test_quote_filter() {
        assert_eq!(quote("a\"b".into()), "\"a\\\"b\"");
        assert_eq!(quote("a$b".into()), "\"a$$b\"");
    }

    #[test]
    fn test_sha256sum_filter() {
        assert_eq!(
            sha256sum("hello".into()),
            "2cf24dba5fb0a30e26e83b2ac5b9e29e1b161e5c1fa7425e73043362938b9824"
        );
    }

    #[test]
    fn test_derive_password_matches_direct_derivation() {
        let dir = TempDir::new().unwrap();
        write_template(&dir, "global_pw.yaml.j2", "password: {{ derive_password() }}");

        let key = MasterKey::new("operator", "master-secret").unwrap();
        let expected = vcenter_password(&key, "vc-a-1.example").unwrap();

        let renderer = TemplateRenderer::new(dir.path());
        let opts = options(&[
            ("username", "operator"),
            ("master_password", "master-secret"),
            ("host", "vc-a-1.example"),
        ]);
        let out = renderer.render_scope("global", &opts, Some(&key)).unwrap();
        assert!(out.contains(&format!("password: {}", expected)));
    }

    #[test]
    fn test_recursive_render_function() {
        let dir = TempDir::new().unwrap();
        write_template(&dir, "snippet.yaml.j2", "inner-{{ name }}");
        write_template(
            &dir,
            "global_outer.yaml.j2",
            "value: {{ render(\"snippet.yaml.j2\") }}",
        );

        let renderer = TemplateRenderer::new(dir.path());
        let out = renderer
            .render_scope("global", &options(&[("name", "bb01")]), None)
            .unwrap();
        assert!(out.contains("value: inner-bb01"));
    }
}
