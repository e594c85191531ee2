use serde_json::{json, Value as Json};

use securebucket_cfn::{synth, CfnTemplate};
use securebucket_core::{ResourceGraph, StackContext};
use securebucket_policy::{Policy, Severity};
use securebucket_provisioner::{
    provision, BucketOrigin, CreateRequest, EncryptionMode, ProvisionError, Provisioned, ProvisioningRequest,
    ReferenceRequest,
};

const KEY_ARN: &str = "arn:aws:kms:us-east-1:248896117205:key/0c7e8b39-f431-4aa9-a187-ac430fb8030a";

fn ctx() -> StackContext { StackContext::new("TestStack", "248896117205", "us-east-1") }

fn reference(repo: Option<&str>, bucket: &str, key: Option<&str>) -> ProvisioningRequest {
    ProvisioningRequest::Reference(ReferenceRequest {
        github_repo: repo.map(str::to_string),
        bucket_name: bucket.to_string(),
        kms_key_arn: key.map(str::to_string),
    })
}

fn evinova() -> ProvisioningRequest {
    reference(Some("skdba8/evinovadevops"), "evinovadevops-secure-bucket", Some(KEY_ARN))
}

fn template(p: &Provisioned) -> CfnTemplate { synth(&p.graph, "test").unwrap() }

fn trust_statements(tpl: &CfnTemplate) -> Vec<Json> {
    let roles = tpl.find_resources("AWS::IAM::Role");
    assert_eq!(roles.len(), 1);
    roles[0].1.properties["AssumeRolePolicyDocument"]["Statement"].as_array().unwrap().clone()
}

#[test]
fn create_mode_versioned_encrypted_bucket_with_role() {
    let req = ProvisioningRequest::Create(CreateRequest::new("testproj").versioned().encrypted().github_repo("myorg/myrepo"));
    let p = provision(&ctx(), "TestBucket", &req).unwrap();

    assert_eq!(p.bucket.name, "testproj-my-bucket");
    assert_eq!(p.bucket.origin, BucketOrigin::Created);
    assert!(p.bucket.versioned);
    assert_eq!(p.bucket.encryption, EncryptionMode::ProviderManaged);

    let tpl = template(&p);
    assert!(tpl.has_resource_properties("AWS::S3::Bucket", &json!({
        "BucketName": "testproj-my-bucket",
        "VersioningConfiguration": { "Status": "Enabled" },
        "BucketEncryption": { "ServerSideEncryptionConfiguration": [
            { "ServerSideEncryptionByDefault": { "SSEAlgorithm": "AES256" } }
        ]},
    })));
    assert!(tpl.has_resource_properties("AWS::IAM::Role", &json!({
        "RoleName": "testproj-github-oidc-role",
        "ManagedPolicyArns": ["arn:aws:iam::aws:policy/AmazonS3FullAccess"],
    })));
    assert_eq!(tpl.resource_count("AWS::IAM::Policy"), 0);

    let identity = p.identity.as_ref().unwrap();
    assert_eq!(identity.trust.subject, "repo:myorg/myrepo:*");
    assert_eq!(p.output("BucketName"), Some("testproj-my-bucket"));
    assert_eq!(p.output("OIDCRoleArn"), Some("arn:aws:iam::248896117205:role/testproj-github-oidc-role"));
    assert_eq!(tpl.output_value("TestBucketBucketName"), Some(&json!("testproj-my-bucket")));
}

#[test]
fn create_mode_defaults_are_off_and_role_is_optional() {
    let p = provision(&ctx(), "Scope", &ProvisioningRequest::Create(CreateRequest::new("plain"))).unwrap();
    assert!(!p.bucket.versioned);
    assert_eq!(p.bucket.encryption, EncryptionMode::None);
    assert!(p.identity.is_none());
    assert_eq!(p.output("OIDCRoleArn"), None);

    let tpl = template(&p);
    assert_eq!(tpl.resource_count("AWS::IAM::Role"), 0);
    let (_, bucket) = tpl.find_resources("AWS::S3::Bucket")[0];
    assert!(!bucket.properties.contains_key("VersioningConfiguration"));
    assert!(!bucket.properties.contains_key("BucketEncryption"));
}

#[test]
fn empty_repo_in_create_mode_means_no_role() {
    let req = ProvisioningRequest::Create(CreateRequest::new("p").github_repo("  "));
    assert!(provision(&ctx(), "Scope", &req).unwrap().identity.is_none());
}

#[test]
fn long_project_id_only_limits_role_when_one_is_declared() {
    let project = "a".repeat(50);
    let p = provision(&ctx(), "S", &ProvisioningRequest::Create(CreateRequest::new(project.clone()))).unwrap();
    assert_eq!(p.bucket.name, format!("{}-my-bucket", project));
    assert!(p.identity.is_none());

    let with_role = ProvisioningRequest::Create(CreateRequest::new(project.clone()).github_repo("o/r"));
    assert_eq!(
        provision(&ctx(), "S", &with_role).unwrap_err(),
        ProvisionError::RoleNameTooLong(format!("{}-github-oidc-role", project))
    );
}

#[test]
fn default_create_request_needs_allow_unencrypted() {
    let tpl = template(&provision(&ctx(), "S", &ProvisioningRequest::Create(CreateRequest::new("plain"))).unwrap());
    let err = Policy::new(false, false).check_template(&tpl).unwrap_err();
    assert!(err.to_string().contains("requires encryption"));

    let findings = Policy::new(true, false).check_template(&tpl).unwrap();
    assert_eq!(findings.len(), 1);
    assert_eq!(findings[0].severity, Severity::Warning);
}

#[test]
fn trust_policy_has_one_federated_statement_pinned_to_repo() {
    for req in [
        ProvisioningRequest::Create(CreateRequest::new("testproj").github_repo("myorg/myrepo")),
        reference(Some("myorg/myrepo"), "some-bucket", Some(KEY_ARN)),
    ] {
        let tpl = template(&provision(&ctx(), "Scope", &req).unwrap());
        let statements = trust_statements(&tpl);
        assert_eq!(statements.len(), 1);
        let st = &statements[0];
        assert_eq!(st["Principal"], json!({
            "Federated": "arn:aws:iam::248896117205:oidc-provider/token.actions.githubusercontent.com"
        }));
        assert_eq!(st["Action"], json!(["sts:AssumeRoleWithWebIdentity"]));
        assert_eq!(st["Condition"]["StringLike"]["token.actions.githubusercontent.com:sub"], "repo:myorg/myrepo:*");
        assert_eq!(st["Condition"]["StringEquals"]["token.actions.githubusercontent.com:aud"], "sts.amazonaws.com");
    }
}

#[test]
fn reference_mode_grants_are_scoped_to_bucket_and_key() {
    let p = provision(&ctx(), "SecureResources", &evinova()).unwrap();
    let tpl = template(&p);

    assert_eq!(tpl.resource_count("AWS::S3::Bucket"), 0);
    let policies = tpl.find_resources("AWS::IAM::Policy");
    assert_eq!(policies.len(), 1);
    let (_, policy) = policies[0];
    assert_eq!(policy.properties["Roles"], json!([{ "Ref": "SecureResourcesGitHubOIDCRole" }]));
    assert_eq!(policy.depends_on, vec!["SecureResourcesGitHubOIDCRole".to_string()]);
    assert_eq!(policy.properties["PolicyDocument"]["Statement"], json!([
        {
            "Sid": "BucketObjectAccess",
            "Effect": "Allow",
            "Action": ["s3:GetObject", "s3:PutObject", "s3:ListBucket"],
            "Resource": ["arn:aws:s3:::evinovadevops-secure-bucket", "arn:aws:s3:::evinovadevops-secure-bucket/*"],
        },
        {
            "Sid": "KeyAccess",
            "Effect": "Allow",
            "Action": ["kms:Encrypt", "kms:Decrypt", "kms:GenerateDataKey", "kms:DescribeKey"],
            "Resource": [KEY_ARN],
        },
    ]));

    let role = tpl.find_resources("AWS::IAM::Role")[0].1;
    assert!(!role.properties.contains_key("ManagedPolicyArns"));
    assert!(Policy::new(false, true).findings(&tpl).is_empty());
}

#[test]
fn reference_mode_outputs() {
    let p = provision(&ctx(), "SecureResources", &evinova()).unwrap();
    assert_eq!(p.bucket.origin, BucketOrigin::Imported);
    assert_eq!(p.bucket.encryption, EncryptionMode::ExternalKey { key_arn: KEY_ARN.to_string() });
    assert_eq!(p.output("ImportedBucketName"), Some("evinovadevops-secure-bucket"));
    assert_eq!(p.output("BucketName"), None);
    assert!(p.output("OIDCRoleArn").unwrap().contains("evinovadevops-secure-bucket-oidc-role"));

    let tpl = template(&p);
    assert_eq!(tpl.output_value("SecureResourcesImportedBucketName"), Some(&json!("evinovadevops-secure-bucket")));
    assert!(tpl.outputs.contains_key("SecureResourcesOIDCRoleArn"));
}

#[test]
fn reference_mode_requires_repo_and_key() {
    assert_eq!(
        provision(&ctx(), "S", &reference(None, "b-bucket", Some(KEY_ARN))).unwrap_err(),
        ProvisionError::MissingRepository("reference")
    );
    assert_eq!(
        provision(&ctx(), "S", &reference(Some("o/r"), "b-bucket", None)).unwrap_err(),
        ProvisionError::MissingKeyArn
    );
    assert!(matches!(
        provision(&ctx(), "S", &reference(Some("o/r"), "b-bucket", Some("arn:aws:kms:us-east-1:1:alias/x"))),
        Err(ProvisionError::InvalidKeyArn(_))
    ));
}

#[test]
fn malformed_inputs_fail_before_declaring() {
    let bad = [
        (ProvisioningRequest::Create(CreateRequest::new("")), ProvisionError::EmptyName),
        (reference(Some("o/r"), " ", Some(KEY_ARN)), ProvisionError::EmptyName),
        (
            ProvisioningRequest::Create(CreateRequest::new("p").github_repo("not-a-repo")),
            ProvisionError::InvalidRepository("not-a-repo".to_string()),
        ),
    ];
    for (req, want) in bad {
        assert_eq!(provision(&ctx(), "S", &req).unwrap_err(), want);
    }
    assert!(matches!(
        provision(&ctx(), "S", &ProvisioningRequest::Create(CreateRequest::new("Bad_Project"))),
        Err(ProvisionError::InvalidBucketName(..))
    ));
    let long = "a".repeat(60);
    assert!(matches!(
        provision(&ctx(), "S", &reference(Some("o/r"), &long, Some(KEY_ARN))),
        Err(ProvisionError::RoleNameTooLong(_))
    ));
    assert!(matches!(
        provision(&StackContext::new("s", "not-an-account", "us-east-1"), "S", &evinova()),
        Err(ProvisionError::InvalidAccount(_))
    ));
    assert!(matches!(provision(&ctx(), "bad-scope", &evinova()), Err(ProvisionError::Graph(_))));
}

#[test]
fn identical_requests_render_identically() {
    for req in [evinova(), ProvisioningRequest::Create(CreateRequest::new("p").versioned().github_repo("o/r"))] {
        let a = template(&provision(&ctx(), "S", &req).unwrap());
        let b = template(&provision(&ctx(), "S", &req).unwrap());
        assert_eq!(a, b);
    }
}

#[test]
fn register_merges_into_stack_once() {
    let mut stack = ResourceGraph::new();
    let mut first = provision(&ctx(), "S", &evinova()).unwrap();
    first.register(&mut stack).unwrap();
    assert_eq!(stack.len(), 2);
    assert_eq!(stack.outputs().len(), 2);

    let mut again = provision(&ctx(), "S", &evinova()).unwrap();
    assert!(matches!(again.register(&mut stack), Err(ProvisionError::Graph(_))));
    assert_eq!(stack.len(), 2);

    let mut other_scope = provision(&ctx(), "Other", &evinova()).unwrap();
    other_scope.register(&mut stack).unwrap();
    assert_eq!(stack.len(), 4);
}

#[test]
fn create_mode_broad_grant_is_flagged() {
    let req = ProvisioningRequest::Create(CreateRequest::new("p").encrypted().github_repo("o/r"));
    let tpl = template(&provision(&ctx(), "S", &req).unwrap());
    let findings = Policy::new(false, false).check_template(&tpl).unwrap();
    assert_eq!(findings.len(), 1);
    assert_eq!(findings[0].severity, Severity::Warning);
    assert!(findings[0].message.contains("AmazonS3FullAccess"));
    assert!(Policy::new(false, true).check_template(&tpl).is_err());
}

#[test]
fn terraform_rendering_matches_declarations() {
    let c = ctx();
    let p = provision(&c, "SecureResources", &evinova()).unwrap();
    let tf = securebucket_tfcompat::render(&p.graph, &c).unwrap();
    let role = &tf["resource"]["aws_iam_role"]["secure_resources_git_hub_oidc_role"];
    assert_eq!(role["name"], "evinovadevops-secure-bucket-oidc-role");
    let trust: Json = serde_json::from_str(role["assume_role_policy"].as_str().unwrap()).unwrap();
    assert_eq!(trust["Statement"][0]["Condition"]["StringLike"]["token.actions.githubusercontent.com:sub"],
               "repo:skdba8/evinovadevops:*");
    let policy = &tf["resource"]["aws_iam_role_policy"]["secure_resources_git_hub_oidc_role_default_policy"];
    assert_eq!(policy["role"], "${aws_iam_role.secure_resources_git_hub_oidc_role.name}");
    assert_eq!(tf["output"]["SecureResourcesImportedBucketName"]["value"], "evinovadevops-secure-bucket");
}
