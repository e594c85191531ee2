use anyhow::{Context, Result};
use serde_json::{json, Value as Json};
use std::collections::BTreeSet;
use std::path::Path;
use std::process::Command;

use securebucket_core::{ResourceGraph, StackContext};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Runner { Terraform, Tofu }

pub fn pick_runner(prefer: Option<Runner>) -> Result<Runner> {
    if let Some(p) = prefer { return Ok(p); }
    if which::which("tofu").is_ok() { Ok(Runner::Tofu) }
    else if which::which("terraform").is_ok() { Ok(Runner::Terraform) }
    else { anyhow::bail!("Neither 'tofu' nor 'terraform' found in PATH") }
}

/// Deep merge: objects merge key by key, anything else in `b` replaces `a`.
pub fn merge(a: Json, b: Json) -> Json {
    match (a, b) {
        (Json::Object(mut ma), Json::Object(mb)) => {
            for (k, v) in mb {
                let existing = ma.remove(&k).unwrap_or(Json::Null);
                ma.insert(k, merge(existing, v));
            }
            Json::Object(ma)
        }
        (_, v) => v,
    }
}

/// Renders a resource graph as a Terraform JSON configuration for the AWS provider.
pub fn render(graph: &ResourceGraph, ctx: &StackContext) -> Result<Json> {
    let mut tf = json!({
        "terraform": { "required_providers": { "aws": { "source": "hashicorp/aws", "version": "~> 5.0" } } },
        "provider": { "aws": { "region": ctx.region, "allowed_account_ids": [ctx.account] } },
    });
    let mut seen = BTreeSet::new();
    for r in graph.ordered().context("order resources")? {
        let fragment = r.tf_json();
        // Distinct logical ids may still collide once snake-cased; merge would overwrite silently.
        if let Some(types) = fragment.get("resource").and_then(Json::as_object) {
            for (ty, named) in types {
                for name in named.as_object().into_iter().flat_map(|m| m.keys()) {
                    if !seen.insert((ty.clone(), name.clone())) {
                        anyhow::bail!("{}: Terraform resource {}.{} is already declared", r.id(), ty, name);
                    }
                }
            }
        }
        tf = merge(tf, fragment);
    }
    for o in graph.outputs() {
        let mut body = json!({ "value": o.value });
        if let Some(d) = &o.description { body["description"] = json!(d); }
        tf = merge(tf, json!({ "output": { o.id.as_str(): body } }));
    }
    Ok(tf)
}

pub fn write_tf_json(tf: &Json, out: &Path) -> Result<()> {
    std::fs::create_dir_all(out)?;
    std::fs::write(out.join("main.tf.json"), serde_json::to_string_pretty(tf)?)?;
    Ok(())
}

fn bin(r: Runner) -> &'static str { match r { Runner::Terraform => "terraform", Runner::Tofu => "tofu" } }

fn run(r: Runner, out: &Path, args: &[&str]) -> Result<()> {
    let step = args.first().copied().unwrap_or("");
    tracing::info!(runner = bin(r), dir = %out.display(), step, "running");
    let st = Command::new(bin(r)).arg(format!("-chdir={}", out.display())).args(args).status()
        .with_context(|| format!("spawn {}", step))?;
    if !st.success() { anyhow::bail!("{} failed", step) } ; Ok(())
}

pub fn run_init(r: Runner, out: &Path) -> Result<()> { run(r, out, &["init", "-input=false"]) }
pub fn run_plan(r: Runner, out: &Path) -> Result<()> { run(r, out, &["plan", "-input=false"]) }
pub fn run_apply(r: Runner, out: &Path) -> Result<()> { run(r, out, &["apply", "-input=false", "-auto-approve"]) }
pub fn run_destroy(r: Runner, out: &Path) -> Result<()> { run(r, out, &["destroy", "-input=false", "-auto-approve"]) }
