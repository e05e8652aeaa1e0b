//! Manifest templating
//!
//! Kubernetes manifests are rendered from Jinja-style templates living on
//! a searchable path. Templates are grouped by a scope prefix in the file
//! name and rendered with a flat string-to-string options map; the output
//! is a multi-document YAML stream consumed by [`crate::state`].
//!
//! Scopes are emitted in a fixed order per tick: `global` once, then
//! `vcenter_cluster` per matching cluster, then `vcenter_datacenter` per
//! availability zone. Within a scope, templates render in sorted-name
//! order so identical inputs produce byte-identical output across ticks.

mod renderer;

pub use renderer::{Options, TemplateRenderer};

/// Scope prefix for templates rendered once per tick
pub const SCOPE_GLOBAL: &str = "global";

/// Scope prefix for templates rendered once per matching cluster
pub const SCOPE_CLUSTER: &str = "vcenter_cluster";

/// Scope prefix for templates rendered once per availability zone
pub const SCOPE_DATACENTER: &str = "vcenter_datacenter";

/// Suffix a file must carry to be considered a template
pub const TEMPLATE_SUFFIX: &str = ".yaml.j2";
