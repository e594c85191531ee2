
use anyhow::{Context, Result};
use serde::{Serialize, Deserialize};
use serde_json::{Value as Json, Map as JsonMap};
use std::collections::BTreeMap;
use std::path::Path;
use std::process::Command;

use securebucket_core::ResourceGraph;

pub const TEMPLATE_VERSION: &str = "2010-09-09";

fn aws() -> Result<String> {
    let p = which::which("aws").context("aws cli not found in PATH")?;
    Ok(p.to_string_lossy().into_owned())
}

pub fn write_template(tpl: &CfnTemplate, out: &Path) -> Result<std::path::PathBuf> {
    std::fs::create_dir_all(out)?;
    let path = out.join("template.json");
    std::fs::write(&path, serde_json::to_string_pretty(tpl)?)
        .with_context(|| format!("write {}", path.display()))?;
    Ok(path)
}

pub fn deploy_stack(stack_name: &str, template_file: &Path, region: Option<&str>) -> Result<()> {
    let aws = aws()?;
    let mut cmd = Command::new(aws);
    cmd.arg("cloudformation").arg("deploy")
        .arg("--stack-name").arg(stack_name)
        .arg("--template-file").arg(template_file)
        .arg("--capabilities").arg("CAPABILITY_NAMED_IAM")
        .arg("--no-fail-on-empty-changeset");
    if let Some(r) = region { cmd.arg("--region").arg(r); }
    tracing::info!(stack = stack_name, template = %template_file.display(), "cloudformation deploy");
    let st = cmd.status().context("spawn aws cloudformation deploy")?;
    if !st.success() { anyhow::bail!("cloudformation deploy failed") }
    Ok(())
}

pub fn delete_stack(stack_name: &str, region: Option<&str>) -> Result<()> {
    let aws = aws()?;
    let mut cmd = Command::new(aws);
    cmd.arg("cloudformation").arg("delete-stack")
        .arg("--stack-name").arg(stack_name);
    if let Some(r) = region { cmd.arg("--region").arg(r); }
    tracing::info!(stack = stack_name, "cloudformation delete-stack");
    let st = cmd.status().context("aws cloudformation delete-stack")?;
    if !st.success() { anyhow::bail!("cloudformation delete-stack failed") }
    Ok(())
}

/// Output values of a deployed stack, keyed by output logical id.
pub fn stack_outputs(stack_name: &str, region: Option<&str>) -> Result<BTreeMap<String, String>> {
    let aws = aws()?;
    let mut cmd = Command::new(aws);
    cmd.arg("cloudformation").arg("describe-stacks")
        .arg("--stack-name").arg(stack_name)
        .arg("--query").arg("Stacks[0].Outputs")
        .arg("--output").arg("json");
    if let Some(r) = region { cmd.arg("--region").arg(r); }
    let out = cmd.output().context("aws cloudformation describe-stacks")?;
    if !out.status.success() { anyhow::bail!("cloudformation describe-stacks failed") }
    parse_stack_outputs(&out.stdout)
}

fn parse_stack_outputs(raw: &[u8]) -> Result<BTreeMap<String, String>> {
    #[derive(Deserialize)]
    struct Described {
        #[serde(rename = "OutputKey")] key: String,
        #[serde(rename = "OutputValue")] value: String,
    }
    let described: Option<Vec<Described>> = serde_json::from_slice(raw).context("parse stack outputs")?;
    Ok(described.unwrap_or_default().into_iter().map(|d| (d.key, d.value)).collect())
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CfnResource {
    #[serde(rename="Type")]
    pub type_name: String,
    #[serde(rename="Properties", default)]
    pub properties: JsonMap<String, Json>,
    #[serde(rename="DependsOn", default, skip_serializing_if = "Vec::is_empty")]
    pub depends_on: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CfnOutput {
    #[serde(rename="Value")] pub value: Json,
    #[serde(rename="Description", default, skip_serializing_if = "Option::is_none")] pub description: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CfnTemplate {
    #[serde(rename="AWSTemplateFormatVersion")] pub version: Option<String>,
    #[serde(rename="Description")] pub description: Option<String>,
    #[serde(rename="Resources")] pub resources: BTreeMap<String, CfnResource>,
    #[serde(rename="Outputs", default, skip_serializing_if = "BTreeMap::is_empty")]
    pub outputs: BTreeMap<String, CfnOutput>,
}

/// Renders a resource graph as a CloudFormation template.
pub fn synth(graph: &ResourceGraph, description: &str) -> Result<CfnTemplate> {
    let mut resources = BTreeMap::new();
    for r in graph.ordered().context("order resources")? {
        let properties = match r.cfn_properties() {
            Json::Object(m) => m,
            other => anyhow::bail!("{} rendered non-object properties: {}", r.id(), other),
        };
        resources.insert(r.id().to_string(), CfnResource {
            type_name: r.cfn_type().to_string(),
            properties,
            depends_on: r.deps().into_iter().map(String::from).collect(),
        });
    }
    let outputs = graph.outputs().iter()
        .map(|o| (o.id.to_string(), CfnOutput { value: Json::String(o.value.clone()), description: o.description.clone() }))
        .collect();
    Ok(CfnTemplate {
        version: Some(TEMPLATE_VERSION.to_string()),
        description: Some(description.to_string()),
        resources,
        outputs,
    })
}

// ---- assertions over a synthesized template ----

/// `actual` matches `expected` when every key of an expected object is present and matches,
/// arrays match element-wise with equal length, and scalars are equal.
pub fn object_like(actual: &Json, expected: &Json) -> bool {
    match (actual, expected) {
        (Json::Object(a), Json::Object(e)) => e.iter().all(|(k, ev)| a.get(k).map_or(false, |av| object_like(av, ev))),
        (Json::Array(a), Json::Array(e)) => a.len() == e.len() && a.iter().zip(e).all(|(av, ev)| object_like(av, ev)),
        (a, e) => a == e,
    }
}

impl CfnTemplate {
    pub fn find_resources(&self, type_name: &str) -> Vec<(&str, &CfnResource)> {
        self.resources.iter()
            .filter(|(_, r)| r.type_name == type_name)
            .map(|(id, r)| (id.as_str(), r))
            .collect()
    }

    pub fn resource_count(&self, type_name: &str) -> usize { self.find_resources(type_name).len() }

    /// True when some resource of `type_name` has properties matching `expected` (see [`object_like`]).
    pub fn has_resource_properties(&self, type_name: &str, expected: &Json) -> bool {
        self.find_resources(type_name).iter()
            .any(|(_, r)| object_like(&Json::Object(r.properties.clone()), expected))
    }

    pub fn output_value(&self, id: &str) -> Option<&Json> { self.outputs.get(id).map(|o| &o.value) }
}
