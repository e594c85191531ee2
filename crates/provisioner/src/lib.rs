//! Bucket security provisioner.
//!
//! Turns a [`ProvisioningRequest`] into resource declarations: an S3 bucket (created, or
//! resolved by name), its encryption, and an IAM role that GitHub Actions can assume through
//! OIDC federation for exactly one repository. Nothing is deployed here; the returned
//! [`ResourceGraph`] is handed to a renderer (CloudFormation or Terraform JSON).

use regex::Regex;
use serde::{Serialize, Deserialize};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::OnceLock;
use thiserror::Error;

use securebucket_aws::{
    managed_policy_arn, ArnError, BucketEncryption, Conditions, IamPolicy, IamRole, ImportedBucket,
    ImportedKey, PolicyDocument, S3Bucket, Statement, GITHUB_OIDC_HOST, STS_AUDIENCE,
};
use securebucket_core::{GraphError, LogicalId, Output, ResourceGraph, StackContext};

pub const BUCKET_ACTIONS: [&str; 3] = ["s3:GetObject", "s3:PutObject", "s3:ListBucket"];
pub const KEY_ACTIONS: [&str; 4] = ["kms:Encrypt", "kms:Decrypt", "kms:GenerateDataKey", "kms:DescribeKey"];
/// AWS-managed policy attached in create mode.
pub const BROAD_S3_POLICY: &str = "AmazonS3FullAccess";

pub const BUCKET_NAME_OUTPUT: &str = "BucketName";
pub const IMPORTED_BUCKET_NAME_OUTPUT: &str = "ImportedBucketName";
pub const ROLE_ARN_OUTPUT: &str = "OIDCRoleArn";

const MAX_ROLE_NAME: usize = 64;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProvisionError {
    #[error("bucket name or project id must not be empty")]
    EmptyName,
    #[error("invalid bucket name '{0}': {1}")]
    InvalidBucketName(String, &'static str),
    #[error("repository '{0}' must be of the form <org>/<repo>")]
    InvalidRepository(String),
    #[error("a GitHub repository (<org>/<repo>) is required in {0} mode")]
    MissingRepository(&'static str),
    #[error("a KMS key ARN is required in reference mode")]
    MissingKeyArn,
    #[error("invalid KMS key ARN: {0}")]
    InvalidKeyArn(#[from] ArnError),
    #[error("role name '{0}' exceeds 64 characters")]
    RoleNameTooLong(String),
    #[error("account id '{0}' must be 12 digits")]
    InvalidAccount(String),
    #[error(transparent)]
    Graph(#[from] GraphError),
}

// ---- request ----

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum ProvisioningRequest {
    /// Declare a new bucket named after the project.
    Create(CreateRequest),
    /// Bind to an existing bucket and KMS key.
    Reference(ReferenceRequest),
}

impl ProvisioningRequest {
    pub fn mode(&self) -> &'static str {
        match self {
            ProvisioningRequest::Create(_) => "create",
            ProvisioningRequest::Reference(_) => "reference",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CreateRequest {
    #[serde(alias = "projectId")]
    pub project_id: String,
    #[serde(default, alias = "enableVersioning")]
    pub enable_versioning: bool,
    #[serde(default, alias = "enableEncryption")]
    pub enable_encryption: bool,
    #[serde(default, alias = "githubRepo")]
    pub github_repo: Option<String>,
}

impl CreateRequest {
    pub fn new(project_id: impl Into<String>) -> Self {
        Self { project_id: project_id.into(), enable_versioning: false, enable_encryption: false, github_repo: None }
    }
    pub fn versioned(mut self) -> Self { self.enable_versioning = true; self }
    pub fn encrypted(mut self) -> Self { self.enable_encryption = true; self }
    pub fn github_repo(mut self, repo: impl Into<String>) -> Self { self.github_repo = Some(repo.into()); self }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReferenceRequest {
    #[serde(default, alias = "githubRepo")]
    pub github_repo: Option<String>,
    #[serde(alias = "bucketName")]
    pub bucket_name: String,
    #[serde(default, alias = "kmsKeyArn")]
    pub kms_key_arn: Option<String>,
}

// ---- derived entities ----

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum BucketOrigin { Created, Imported }

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum EncryptionMode {
    None,
    /// SSE-S3.
    ProviderManaged,
    ExternalKey { key_arn: String },
}

impl EncryptionMode {
    pub fn sse_algorithm(&self) -> Option<&'static str> { self.bucket_encryption().sse_algorithm() }

    fn bucket_encryption(&self) -> BucketEncryption {
        match self {
            EncryptionMode::None => BucketEncryption::Unencrypted,
            EncryptionMode::ProviderManaged => BucketEncryption::S3Managed,
            EncryptionMode::ExternalKey { key_arn } => BucketEncryption::Kms { key_arn: key_arn.clone() },
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BucketDescriptor {
    pub name: String,
    pub arn: String,
    /// Only meaningful for created buckets; imported buckets keep whatever they already have.
    pub versioned: bool,
    pub encryption: EncryptionMode,
    pub origin: BucketOrigin,
}

/// `<org>/<repo>` on GitHub.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GitHubRepo { pub org: String, pub name: String }

impl GitHubRepo {
    pub fn parse(s: &str) -> Result<Self, ProvisionError> {
        static RE: OnceLock<Regex> = OnceLock::new();
        let re = RE.get_or_init(|| {
            Regex::new(r"^([A-Za-z0-9](?:[A-Za-z0-9-]{0,38}))/([A-Za-z0-9._-]{1,100})$").expect("static regex")
        });
        let caps = re.captures(s).ok_or_else(|| ProvisionError::InvalidRepository(s.to_string()))?;
        let name = &caps[2];
        if name == "." || name == ".." {
            return Err(ProvisionError::InvalidRepository(s.to_string()));
        }
        Ok(Self { org: caps[1].to_string(), name: name.to_string() })
    }

    /// Token subjects accepted from this repository: any ref, environment or event.
    pub fn subject_pattern(&self) -> String { format!("repo:{}:*", self) }
}

impl fmt::Display for GitHubRepo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result { write!(f, "{}/{}", self.org, self.name) }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TrustCondition {
    pub provider_arn: String,
    pub audience: String,
    pub subject: String,
}

impl TrustCondition {
    pub fn github(ctx: &StackContext, repo: &GitHubRepo) -> Self {
        Self {
            provider_arn: ctx.iam_arn(&format!("oidc-provider/{}", GITHUB_OIDC_HOST)),
            audience: STS_AUDIENCE.to_string(),
            subject: repo.subject_pattern(),
        }
    }

    /// `aud` must match exactly; `sub` is a wildcard pattern and needs `StringLike`.
    pub fn to_statement(&self) -> Statement {
        let mut cond = Conditions::new();
        cond.entry("StringEquals".to_string()).or_default()
            .insert(format!("{}:aud", GITHUB_OIDC_HOST), self.audience.clone());
        cond.entry("StringLike".to_string()).or_default()
            .insert(format!("{}:sub", GITHUB_OIDC_HOST), self.subject.clone());
        Statement::web_identity(&self.provider_arn, cond)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum CapabilityGrant {
    ManagedPolicy { arn: String },
    Scoped { sid: String, actions: Vec<String>, resources: Vec<String> },
}

impl CapabilityGrant {
    fn scoped(sid: &str, actions: &[&str], resources: Vec<String>) -> Self {
        CapabilityGrant::Scoped {
            sid: sid.to_string(),
            actions: actions.iter().map(|a| a.to_string()).collect(),
            resources,
        }
    }

    /// Grants not bound to specific resource ARNs.
    pub fn is_broad(&self) -> bool {
        match self {
            CapabilityGrant::ManagedPolicy { .. } => true,
            CapabilityGrant::Scoped { resources, .. } => resources.iter().any(|r| r == "*"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TrustedIdentity {
    pub role_name: String,
    pub role_arn: String,
    pub trust: TrustCondition,
    pub grants: Vec<CapabilityGrant>,
}

impl TrustedIdentity {
    pub fn managed_policy_arns(&self) -> Vec<String> {
        self.grants.iter().filter_map(|g| match g {
            CapabilityGrant::ManagedPolicy { arn } => Some(arn.clone()),
            _ => None,
        }).collect()
    }

    /// Inline statements for the scoped grants, in grant order.
    pub fn scoped_statements(&self) -> Vec<Statement> {
        self.grants.iter().filter_map(|g| match g {
            CapabilityGrant::Scoped { sid, actions, resources } => {
                Some(Statement::allow(actions.clone(), resources.clone()).with_sid(sid))
            }
            _ => None,
        }).collect()
    }
}

/// Result of one provisioning pass.
#[derive(Debug)]
pub struct Provisioned {
    pub bucket: BucketDescriptor,
    pub identity: Option<TrustedIdentity>,
    /// Declared output name (`BucketName`, `OIDCRoleArn`, ...) -> value.
    pub outputs: BTreeMap<String, String>,
    pub graph: ResourceGraph,
}

impl Provisioned {
    pub fn output(&self, name: &str) -> Option<&str> { self.outputs.get(name).map(String::as_str) }

    /// Moves the declarations into a stack graph. On a logical id collision nothing is moved.
    pub fn register(&mut self, stack: &mut ResourceGraph) -> Result<(), ProvisionError> {
        stack.merge(std::mem::take(&mut self.graph))?;
        Ok(())
    }
}

// ---- validation ----

fn validate_bucket_name(name: &str) -> Result<(), ProvisionError> {
    static RE: OnceLock<Regex> = OnceLock::new();
    static IP: OnceLock<Regex> = OnceLock::new();
    let re = RE.get_or_init(|| Regex::new(r"^[a-z0-9][a-z0-9.-]{1,61}[a-z0-9]$").expect("static regex"));
    let ip = IP.get_or_init(|| Regex::new(r"^\d{1,3}(\.\d{1,3}){3}$").expect("static regex"));
    let bad = |why| Err(ProvisionError::InvalidBucketName(name.to_string(), why));
    if !re.is_match(name) {
        return bad("use 3-63 lowercase letters, digits, dots or hyphens, starting and ending with a letter or digit");
    }
    if name.contains("..") { return bad("must not contain consecutive dots"); }
    if ip.is_match(name) { return bad("must not be formatted as an IP address"); }
    if name.starts_with("xn--") { return bad("must not start with 'xn--'"); }
    if name.ends_with("-s3alias") { return bad("must not end with '-s3alias'"); }
    Ok(())
}

fn validate_role_name(name: String) -> Result<String, ProvisionError> {
    if name.len() > MAX_ROLE_NAME { Err(ProvisionError::RoleNameTooLong(name)) } else { Ok(name) }
}

fn non_empty(s: &str) -> Result<&str, ProvisionError> {
    let s = s.trim();
    if s.is_empty() { Err(ProvisionError::EmptyName) } else { Ok(s) }
}

// ---- provisioning ----

/// Validates `request` and declares its resources under `scope_id`.
///
/// All validation happens before the first declaration, so an error leaves nothing behind.
#[tracing::instrument(skip(ctx, request), fields(mode = request.mode(), stack = %ctx.stack_name))]
pub fn provision(ctx: &StackContext, scope_id: &str, request: &ProvisioningRequest) -> Result<Provisioned, ProvisionError> {
    if !ctx.account_is_valid() {
        return Err(ProvisionError::InvalidAccount(ctx.account.clone()));
    }
    let scope = LogicalId::new(scope_id)?;
    let out = match request {
        ProvisioningRequest::Create(r) => provision_create(ctx, &scope, r)?,
        ProvisioningRequest::Reference(r) => provision_reference(ctx, &scope, r)?,
    };
    tracing::info!(
        bucket = %out.bucket.name,
        role = out.identity.as_ref().map(|i| i.role_name.as_str()).unwrap_or("-"),
        resources = out.graph.len(),
        "declared secure bucket"
    );
    Ok(out)
}

fn provision_create(ctx: &StackContext, scope: &LogicalId, r: &CreateRequest) -> Result<Provisioned, ProvisionError> {
    let project = non_empty(&r.project_id)?;
    let bucket_name = format!("{}-my-bucket", project);
    validate_bucket_name(&bucket_name)?;
    let repo = match r.github_repo.as_deref().map(str::trim) {
        Some(s) if !s.is_empty() => Some(GitHubRepo::parse(s)?),
        _ => None,
    };
    // The role name only constrains the project id when a role is declared.
    let repo = repo
        .map(|repo| validate_role_name(format!("{}-github-oidc-role", project)).map(|name| (repo, name)))
        .transpose()?;

    let encryption = if r.enable_encryption { EncryptionMode::ProviderManaged } else { EncryptionMode::None };
    let bucket = BucketDescriptor {
        arn: ctx.s3_arn(&bucket_name),
        name: bucket_name,
        versioned: r.enable_versioning,
        encryption,
        origin: BucketOrigin::Created,
    };

    let identity = repo.map(|(repo, role_name)| TrustedIdentity {
        role_arn: ctx.iam_arn(&format!("role/{}", role_name)),
        role_name,
        trust: TrustCondition::github(ctx, &repo),
        grants: vec![CapabilityGrant::ManagedPolicy { arn: managed_policy_arn(ctx.partition(), BROAD_S3_POLICY) }],
    });

    let mut graph = ResourceGraph::new();
    graph.add(S3Bucket {
        id: scope.child("SecureS3Bucket")?,
        bucket_name: bucket.name.clone(),
        versioned: bucket.versioned,
        encryption: bucket.encryption.bucket_encryption(),
    })?;

    let mut outputs = BTreeMap::new();
    if let Some(identity) = &identity {
        declare_identity(&mut graph, scope, identity)?;
        publish(&mut graph, &mut outputs, scope, ROLE_ARN_OUTPUT, &identity.role_arn, "ARN of the GitHub Actions OIDC role")?;
    }
    publish(&mut graph, &mut outputs, scope, BUCKET_NAME_OUTPUT, &bucket.name, "Name of the secure bucket")?;

    Ok(Provisioned { bucket, identity, outputs, graph })
}

fn provision_reference(ctx: &StackContext, scope: &LogicalId, r: &ReferenceRequest) -> Result<Provisioned, ProvisionError> {
    let bucket_name = non_empty(&r.bucket_name)?;
    validate_bucket_name(bucket_name)?;
    let repo = match r.github_repo.as_deref().map(str::trim) {
        Some(s) if !s.is_empty() => GitHubRepo::parse(s)?,
        _ => return Err(ProvisionError::MissingRepository("reference")),
    };
    let key = match r.kms_key_arn.as_deref().map(str::trim) {
        Some(s) if !s.is_empty() => ImportedKey::from_arn(s)?,
        _ => return Err(ProvisionError::MissingKeyArn),
    };
    let role_name = validate_role_name(format!("{}-oidc-role", bucket_name))?;

    let imported = ImportedBucket::from_name(ctx, bucket_name);
    let key_arn = key.arn_string();
    let bucket = BucketDescriptor {
        name: imported.name.clone(),
        arn: imported.arn.clone(),
        versioned: false,
        encryption: EncryptionMode::ExternalKey { key_arn: key_arn.clone() },
        origin: BucketOrigin::Imported,
    };

    let identity = TrustedIdentity {
        role_arn: ctx.iam_arn(&format!("role/{}", role_name)),
        role_name,
        trust: TrustCondition::github(ctx, &repo),
        grants: vec![
            CapabilityGrant::scoped("BucketObjectAccess", &BUCKET_ACTIONS, vec![imported.arn.clone(), imported.objects_arn()]),
            CapabilityGrant::scoped("KeyAccess", &KEY_ACTIONS, vec![key_arn]),
        ],
    };

    let mut graph = ResourceGraph::new();
    let mut outputs = BTreeMap::new();
    declare_identity(&mut graph, scope, &identity)?;
    publish(&mut graph, &mut outputs, scope, IMPORTED_BUCKET_NAME_OUTPUT, &bucket.name, "Name of the referenced bucket")?;
    publish(&mut graph, &mut outputs, scope, ROLE_ARN_OUTPUT, &identity.role_arn, "ARN of the GitHub Actions OIDC role")?;

    Ok(Provisioned { bucket, identity: Some(identity), outputs, graph })
}

fn declare_identity(graph: &mut ResourceGraph, scope: &LogicalId, identity: &TrustedIdentity) -> Result<(), ProvisionError> {
    let role_id = scope.child("GitHubOIDCRole")?;
    graph.add(IamRole {
        id: role_id.clone(),
        role_name: identity.role_name.clone(),
        description: Some(format!("Assumed by GitHub Actions for {}", identity.trust.subject)),
        assume_role_policy: PolicyDocument::new(vec![identity.trust.to_statement()]),
        managed_policy_arns: identity.managed_policy_arns(),
    })?;
    let statements = identity.scoped_statements();
    if !statements.is_empty() {
        graph.add(IamPolicy {
            id: role_id.child("DefaultPolicy")?,
            policy_name: format!("{}-access", identity.role_name),
            document: PolicyDocument::new(statements),
            role: role_id,
        })?;
    }
    for g in identity.grants.iter().filter(|g| g.is_broad()) {
        tracing::warn!(role = %identity.role_name, grant = ?g, "role carries a broad grant");
    }
    Ok(())
}

fn publish(
    graph: &mut ResourceGraph,
    outputs: &mut BTreeMap<String, String>,
    scope: &LogicalId,
    name: &str,
    value: &str,
    description: &str,
) -> Result<(), ProvisionError> {
    graph.add_output(Output {
        id: scope.child(name)?,
        value: value.to_string(),
        description: Some(description.to_string()),
    })?;
    outputs.insert(name.to_string(), value.to_string());
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn repo_ids_need_org_and_name() {
        let repo = GitHubRepo::parse("myorg/my.repo_1").unwrap();
        assert_eq!(repo.org, "myorg");
        assert_eq!(repo.subject_pattern(), "repo:myorg/my.repo_1:*");
        for bad in ["", "myorg", "myorg/", "/repo", "a/b/c", "-org/repo", "org/..", "org/re po"] {
            assert!(GitHubRepo::parse(bad).is_err(), "{bad} should be rejected");
        }
    }

    #[test]
    fn bucket_names_follow_s3_rules() {
        assert!(validate_bucket_name("evinovadevops-secure-bucket").is_ok());
        assert!(validate_bucket_name("a.b-c").is_ok());
        for bad in ["ab", "Upper-case", "-leading", "trailing-", "a..b", "192.168.1.1", "xn--bucket", "x-s3alias"] {
            assert!(validate_bucket_name(bad).is_err(), "{bad} should be rejected");
        }
        assert!(validate_bucket_name(&"a".repeat(64)).is_err());
    }

    #[test]
    fn trust_statement_pins_subject() {
        let ctx = StackContext::new("s", "123456789012", "us-east-1");
        let trust = TrustCondition::github(&ctx, &GitHubRepo::parse("o/r").unwrap());
        let st = trust.to_statement();
        assert_eq!(st.condition["StringLike"]["token.actions.githubusercontent.com:sub"], "repo:o/r:*");
        assert_eq!(st.condition["StringEquals"]["token.actions.githubusercontent.com:aud"], "sts.amazonaws.com");
        assert_eq!(trust.provider_arn, "arn:aws:iam::123456789012:oidc-provider/token.actions.githubusercontent.com");
    }

    #[test]
    fn managed_policy_grant_is_broad() {
        assert!(CapabilityGrant::ManagedPolicy { arn: "x".into() }.is_broad());
        assert!(!CapabilityGrant::scoped("S", &["s3:GetObject"], vec!["arn:aws:s3:::b".into()]).is_broad());
        assert!(CapabilityGrant::scoped("S", &["s3:GetObject"], vec!["*".into()]).is_broad());
    }

    #[test]
    fn encryption_modes_map_to_algorithms() {
        assert_eq!(EncryptionMode::None.sse_algorithm(), None);
        assert_eq!(EncryptionMode::ProviderManaged.sse_algorithm(), Some("AES256"));
        assert_eq!(EncryptionMode::ExternalKey { key_arn: "k".into() }.sse_algorithm(), Some("aws:kms"));
    }
}
