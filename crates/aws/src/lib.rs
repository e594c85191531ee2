use serde::{Serialize, Deserialize};
use serde_json::{json, Value as Json, Map as JsonMap};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

use securebucket_core::{LogicalId, Resource, StackContext};

pub const GITHUB_OIDC_HOST: &str = "token.actions.githubusercontent.com";
pub const STS_AUDIENCE: &str = "sts.amazonaws.com";
pub const POLICY_VERSION: &str = "2012-10-17";

pub fn managed_policy_arn(partition: &str, name: &str) -> String {
    format!("arn:{}:iam::aws:policy/{}", partition, name)
}

/// Terraform resource name derived from a logical id: `SecureResourcesGitHubOIDCRole` ->
/// `secure_resources_git_hub_oidc_role`.
pub fn tf_name(id: &LogicalId) -> String {
    let chars: Vec<char> = id.as_str().chars().collect();
    let mut out = String::with_capacity(chars.len() + 8);
    for (i, &c) in chars.iter().enumerate() {
        if c.is_ascii_uppercase() && i > 0 {
            let prev = chars[i - 1];
            let next_lower = chars.get(i + 1).map_or(false, |n| n.is_ascii_lowercase());
            if prev.is_ascii_lowercase() || prev.is_ascii_digit() || (prev.is_ascii_uppercase() && next_lower) {
                out.push('_');
            }
        }
        out.push(c.to_ascii_lowercase());
    }
    out
}

// ---- ARNs ----

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ArnError {
    #[error("'{0}' is not an ARN (expected arn:partition:service:region:account:resource)")]
    Malformed(String),
    #[error("ARN '{arn}' is for service '{found}', expected '{expected}'")]
    WrongService { arn: String, expected: &'static str, found: String },
    #[error("ARN '{0}' does not name a KMS key (expected key/<key-id>)")]
    NotAKey(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Arn {
    pub partition: String,
    pub service: String,
    pub region: String,
    pub account: String,
    pub resource: String,
}

impl FromStr for Arn {
    type Err = ArnError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let parts: Vec<&str> = s.splitn(6, ':').collect();
        match parts.as_slice() {
            ["arn", partition, service, region, account, resource]
                if !partition.is_empty() && !service.is_empty() && !resource.is_empty() =>
            {
                Ok(Arn {
                    partition: partition.to_string(),
                    service: service.to_string(),
                    region: region.to_string(),
                    account: account.to_string(),
                    resource: resource.to_string(),
                })
            }
            _ => Err(ArnError::Malformed(s.to_string())),
        }
    }
}

impl fmt::Display for Arn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "arn:{}:{}:{}:{}:{}", self.partition, self.service, self.region, self.account, self.resource)
    }
}

// ---- lookups of existing resources (resolved offline, nothing is declared) ----

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImportedBucket { pub name: String, pub arn: String }

impl ImportedBucket {
    pub fn from_name(ctx: &StackContext, name: &str) -> Self {
        Self { name: name.to_string(), arn: ctx.s3_arn(name) }
    }
    /// ARN matching every object in the bucket.
    pub fn objects_arn(&self) -> String { format!("{}/*", self.arn) }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImportedKey { pub arn: Arn, pub key_id: String }

impl ImportedKey {
    pub fn from_arn(arn: &str) -> Result<Self, ArnError> {
        let parsed: Arn = arn.parse()?;
        if parsed.service != "kms" {
            return Err(ArnError::WrongService { arn: arn.to_string(), expected: "kms", found: parsed.service });
        }
        let key_id = match parsed.resource.strip_prefix("key/") {
            Some(id) if !id.is_empty() && !parsed.region.is_empty() && !parsed.account.is_empty() => id.to_string(),
            _ => return Err(ArnError::NotAKey(arn.to_string())),
        };
        Ok(Self { arn: parsed, key_id })
    }
    pub fn arn_string(&self) -> String { self.arn.to_string() }
}

// ---- IAM policy documents ----

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Effect { Allow, Deny }

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Principal {
    Federated(String),
    Service(String),
    #[serde(rename = "AWS")]
    Aws(String),
}

/// Condition block: operator (`StringEquals`) -> context key -> value.
pub type Conditions = BTreeMap<String, BTreeMap<String, String>>;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct Statement {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sid: Option<String>,
    pub effect: Effect,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub principal: Option<Principal>,
    pub action: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub resource: Vec<String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub condition: Conditions,
}

impl Statement {
    pub fn allow<A, R>(actions: A, resources: R) -> Self
    where
        A: IntoIterator, A::Item: Into<String>,
        R: IntoIterator, R::Item: Into<String>,
    {
        Self {
            sid: None,
            effect: Effect::Allow,
            principal: None,
            action: actions.into_iter().map(Into::into).collect(),
            resource: resources.into_iter().map(Into::into).collect(),
            condition: Conditions::new(),
        }
    }

    /// Trust statement letting tokens from a federated OIDC provider assume the role.
    pub fn web_identity(provider_arn: &str, condition: Conditions) -> Self {
        Self {
            sid: None,
            effect: Effect::Allow,
            principal: Some(Principal::Federated(provider_arn.to_string())),
            action: vec!["sts:AssumeRoleWithWebIdentity".to_string()],
            resource: Vec::new(),
            condition,
        }
    }

    pub fn with_sid(mut self, sid: &str) -> Self { self.sid = Some(sid.to_string()); self }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct PolicyDocument {
    pub version: String,
    pub statement: Vec<Statement>,
}

impl PolicyDocument {
    pub fn new(statement: Vec<Statement>) -> Self {
        Self { version: POLICY_VERSION.to_string(), statement }
    }
    pub fn to_json(&self) -> Json {
        serde_json::to_value(self).unwrap_or(Json::Null)
    }
}

// ---- declarable resources ----

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum BucketEncryption {
    Unencrypted,
    S3Managed,
    Kms { key_arn: String },
}

impl BucketEncryption {
    pub fn sse_algorithm(&self) -> Option<&'static str> {
        match self {
            BucketEncryption::Unencrypted => None,
            BucketEncryption::S3Managed => Some("AES256"),
            BucketEncryption::Kms { .. } => Some("aws:kms"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct S3Bucket {
    pub id: LogicalId,
    pub bucket_name: String,
    pub versioned: bool,
    pub encryption: BucketEncryption,
}

impl Resource for S3Bucket {
    fn id(&self) -> &LogicalId { &self.id }
    fn cfn_type(&self) -> &'static str { "AWS::S3::Bucket" }

    fn cfn_properties(&self) -> Json {
        let mut props = json!({ "BucketName": self.bucket_name });
        if self.versioned {
            props["VersioningConfiguration"] = json!({ "Status": "Enabled" });
        }
        if let Some(alg) = self.encryption.sse_algorithm() {
            let mut by_default = json!({ "SSEAlgorithm": alg });
            if let BucketEncryption::Kms { key_arn } = &self.encryption {
                by_default["KMSMasterKeyID"] = json!(key_arn);
            }
            props["BucketEncryption"] = json!({
                "ServerSideEncryptionConfiguration": [ { "ServerSideEncryptionByDefault": by_default } ]
            });
        }
        props
    }

    fn tf_json(&self) -> Json {
        let name = tf_name(&self.id);
        let bucket_ref = format!("${{aws_s3_bucket.{}.id}}", name);
        let mut o = json!({
            "resource": { "aws_s3_bucket": { name.clone(): { "bucket": self.bucket_name } } }
        });
        if self.versioned {
            o["resource"]["aws_s3_bucket_versioning"] = json!({
                name.clone(): { "bucket": bucket_ref, "versioning_configuration": { "status": "Enabled" } }
            });
        }
        if let Some(alg) = self.encryption.sse_algorithm() {
            let mut by_default = json!({ "sse_algorithm": alg });
            if let BucketEncryption::Kms { key_arn } = &self.encryption {
                by_default["kms_master_key_id"] = json!(key_arn);
            }
            o["resource"]["aws_s3_bucket_server_side_encryption_configuration"] = json!({
                name: { "bucket": bucket_ref, "rule": [ { "apply_server_side_encryption_by_default": by_default } ] }
            });
        }
        o
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IamRole {
    pub id: LogicalId,
    pub role_name: String,
    pub description: Option<String>,
    pub assume_role_policy: PolicyDocument,
    pub managed_policy_arns: Vec<String>,
}

impl Resource for IamRole {
    fn id(&self) -> &LogicalId { &self.id }
    fn cfn_type(&self) -> &'static str { "AWS::IAM::Role" }

    fn cfn_properties(&self) -> Json {
        let mut props = json!({
            "RoleName": self.role_name,
            "AssumeRolePolicyDocument": self.assume_role_policy.to_json(),
        });
        if let Some(desc) = &self.description { props["Description"] = json!(desc); }
        if !self.managed_policy_arns.is_empty() {
            props["ManagedPolicyArns"] = json!(self.managed_policy_arns);
        }
        props
    }

    fn tf_json(&self) -> Json {
        let name = tf_name(&self.id);
        let mut body = json!({
            "name": self.role_name,
            "assume_role_policy": self.assume_role_policy.to_json().to_string(),
        });
        if let Some(desc) = &self.description { body["description"] = json!(desc); }
        let mut o = json!({ "resource": { "aws_iam_role": { name.clone(): body } } });
        if !self.managed_policy_arns.is_empty() {
            let role_ref = format!("${{aws_iam_role.{}.name}}", name);
            let mut attachments = JsonMap::new();
            for (i, arn) in self.managed_policy_arns.iter().enumerate() {
                attachments.insert(format!("{}_{}", name, i), json!({ "role": role_ref, "policy_arn": arn }));
            }
            o["resource"]["aws_iam_role_policy_attachment"] = Json::Object(attachments);
        }
        o
    }
}

/// Inline policy attached to one role.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IamPolicy {
    pub id: LogicalId,
    pub policy_name: String,
    pub document: PolicyDocument,
    pub role: LogicalId,
}

impl Resource for IamPolicy {
    fn id(&self) -> &LogicalId { &self.id }
    fn deps(&self) -> BTreeSet<LogicalId> { BTreeSet::from([self.role.clone()]) }
    fn cfn_type(&self) -> &'static str { "AWS::IAM::Policy" }

    fn cfn_properties(&self) -> Json {
        json!({
            "PolicyName": self.policy_name,
            "PolicyDocument": self.document.to_json(),
            "Roles": [ { "Ref": self.role.as_str() } ],
        })
    }

    fn tf_json(&self) -> Json {
        json!({
            "resource": { "aws_iam_role_policy": { tf_name(&self.id): {
                "name": self.policy_name,
                "role": format!("${{aws_iam_role.{}.name}}", tf_name(&self.role)),
                "policy": self.document.to_json().to_string(),
            }}}
        })
    }
}
