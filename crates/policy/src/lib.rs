

use anyhow::Result;
use regex::Regex;
use serde_json::Value as Json;
use std::fmt;

use securebucket_cfn::CfnTemplate;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Severity { Warning, Error }

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Finding { pub resource: String, pub severity: Severity, pub message: String }

impl fmt::Display for Finding {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.resource, self.message)
    }
}

/// Plan-time checks over a synthesized CloudFormation template.
pub struct Policy {
    pub allow_unencrypted: bool,
    pub deny_broad_grants: bool,
    broad_managed: Regex,
}

/// String-or-list IAM fields (`Action`, `Resource`).
fn as_list(v: Option<&Json>) -> Vec<&str> {
    match v {
        Some(Json::String(s)) => vec![s.as_str()],
        Some(Json::Array(a)) => a.iter().filter_map(Json::as_str).collect(),
        _ => Vec::new(),
    }
}

fn statements(doc: Option<&Json>) -> &[Json] {
    doc.and_then(|d| d.get("Statement")).and_then(Json::as_array).map(Vec::as_slice).unwrap_or(&[])
}

fn pins_claim(stmt: &Json, claim: &str) -> bool {
    let Some(cond) = stmt.get("Condition").and_then(Json::as_object) else { return false };
    ["StringEquals", "StringLike"].iter().any(|op| {
        cond.get(*op).and_then(Json::as_object)
            .map_or(false, |keys| keys.iter().any(|(k, v)| k.ends_with(claim) && v.as_str().map_or(false, |s| !s.is_empty() && s != "*")))
    })
}

impl Policy {
    pub fn new(allow_unencrypted: bool, deny_broad_grants: bool) -> Self {
        Self {
            allow_unencrypted,
            deny_broad_grants,
            broad_managed: Regex::new(r"^arn:[a-z-]+:iam::aws:policy/(.*FullAccess|AdministratorAccess|PowerUserAccess)$")
                .expect("static regex"),
        }
    }

    pub fn findings(&self, tpl: &CfnTemplate) -> Vec<Finding> {
        let mut out = Vec::new();
        let broad = if self.deny_broad_grants { Severity::Error } else { Severity::Warning };
        let mut push = |resource: &str, severity, message: String| {
            out.push(Finding { resource: resource.to_string(), severity, message })
        };

        for (id, bucket) in tpl.find_resources("AWS::S3::Bucket") {
            if !bucket.properties.contains_key("BucketEncryption") {
                let sev = if self.allow_unencrypted { Severity::Warning } else { Severity::Error };
                push(id, sev, "S3 bucket requires encryption (SSE-S3 or KMS)".to_string());
            }
        }

        for (id, role) in tpl.find_resources("AWS::IAM::Role") {
            for stmt in statements(role.properties.get("AssumeRolePolicyDocument")) {
                if stmt.pointer("/Principal/Federated").is_none() { continue; }
                if !pins_claim(stmt, ":sub") {
                    push(id, Severity::Error, "federated trust does not pin the token 'sub' claim".to_string());
                }
                if !pins_claim(stmt, ":aud") {
                    push(id, Severity::Warning, "federated trust does not pin the token 'aud' claim".to_string());
                }
            }
            for arn in as_list(role.properties.get("ManagedPolicyArns")) {
                if self.broad_managed.is_match(arn) {
                    push(id, broad, format!("broad managed policy attached: {}", arn));
                }
            }
        }

        for (id, policy) in tpl.find_resources("AWS::IAM::Policy") {
            for stmt in statements(policy.properties.get("PolicyDocument")) {
                let wide_action = as_list(stmt.get("Action")).iter().any(|a| *a == "*" || a.ends_with(":*"));
                let wide_resource = as_list(stmt.get("Resource")).iter().any(|r| *r == "*");
                if wide_action || wide_resource {
                    push(id, broad, "statement grants wildcard actions or resources".to_string());
                }
            }
        }
        out
    }

    /// Logs every finding and fails if any is an error.
    pub fn check_template(&self, tpl: &CfnTemplate) -> Result<Vec<Finding>> {
        let findings = self.findings(tpl);
        let mut errors = Vec::new();
        for f in &findings {
            match f.severity {
                Severity::Warning => tracing::warn!(resource = %f.resource, "{}", f.message),
                Severity::Error => {
                    tracing::error!(resource = %f.resource, "{}", f.message);
                    errors.push(f.to_string());
                }
            }
        }
        if !errors.is_empty() {
            anyhow::bail!("Policy: {}", errors.join("; "));
        }
        Ok(findings)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn template(resources: Json) -> CfnTemplate {
        serde_json::from_value(json!({
            "AWSTemplateFormatVersion": "2010-09-09",
            "Description": "t",
            "Resources": resources,
        })).unwrap()
    }

    fn trust(condition: Json) -> Json {
        json!({ "Version": "2012-10-17", "Statement": [{
            "Effect": "Allow",
            "Principal": { "Federated": "arn:aws:iam::123456789012:oidc-provider/token.actions.githubusercontent.com" },
            "Action": "sts:AssumeRoleWithWebIdentity",
            "Condition": condition,
        }]})
    }

    #[test]
    fn unencrypted_bucket_is_an_error_unless_allowed() {
        let tpl = template(json!({ "B": { "Type": "AWS::S3::Bucket", "Properties": { "BucketName": "b" } } }));
        assert!(Policy::new(false, false).check_template(&tpl).is_err());
        let findings = Policy::new(true, false).check_template(&tpl).unwrap();
        assert_eq!(findings.len(), 1);
        assert_eq!(findings[0].severity, Severity::Warning);
    }

    #[test]
    fn federated_trust_must_pin_subject() {
        let loose = template(json!({ "R": { "Type": "AWS::IAM::Role", "Properties": {
            "AssumeRolePolicyDocument": trust(json!({ "StringEquals": { "token.actions.githubusercontent.com:aud": "sts.amazonaws.com" } }))
        }}}));
        let err = Policy::new(false, false).check_template(&loose).unwrap_err();
        assert!(err.to_string().contains("'sub'"));

        let pinned = template(json!({ "R": { "Type": "AWS::IAM::Role", "Properties": {
            "AssumeRolePolicyDocument": trust(json!({
                "StringEquals": { "token.actions.githubusercontent.com:aud": "sts.amazonaws.com" },
                "StringLike": { "token.actions.githubusercontent.com:sub": "repo:o/r:*" }
            }))
        }}}));
        assert!(Policy::new(false, false).findings(&pinned).is_empty());
    }

    #[test]
    fn broad_grants_warn_or_deny() {
        let tpl = template(json!({
            "R": { "Type": "AWS::IAM::Role", "Properties": {
                "ManagedPolicyArns": ["arn:aws:iam::aws:policy/AmazonS3FullAccess"]
            }},
            "P": { "Type": "AWS::IAM::Policy", "Properties": { "PolicyDocument": { "Statement": [
                { "Effect": "Allow", "Action": ["s3:*"], "Resource": ["arn:aws:s3:::b"] }
            ]}}}
        }));
        let findings = Policy::new(false, false).check_template(&tpl).unwrap();
        assert_eq!(findings.len(), 2);
        assert!(findings.iter().all(|f| f.severity == Severity::Warning));
        assert!(Policy::new(false, true).check_template(&tpl).is_err());
    }

    #[test]
    fn scoped_statements_pass() {
        let tpl = template(json!({ "P": { "Type": "AWS::IAM::Policy", "Properties": { "PolicyDocument": { "Statement": [
            { "Effect": "Allow", "Action": ["kms:Decrypt"], "Resource": ["arn:aws:kms:us-east-1:123456789012:key/k"] }
        ]}}}}));
        assert!(Policy::new(false, true).findings(&tpl).is_empty());
    }
}
