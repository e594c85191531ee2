use anyhow::{Context, Result};
use secrecy::ExposeSecret;
use serde::Deserialize;
use std::path::{Path, PathBuf};

use securebucket_core::StackContext;
use securebucket_provisioner::{ProvisioningRequest, ReferenceRequest};

/// Stack configuration file (YAML, optionally age-encrypted).
#[derive(Debug, Deserialize)]
pub struct Config {
    pub stack: String,
    pub context: AccountContext,
    #[serde(default = "default_scope")]
    pub scope: String,
    pub secure_bucket: ProvisioningRequest,
}

#[derive(Debug, Deserialize)]
pub struct AccountContext {
    pub account: String,
    pub region: String,
    #[serde(default)]
    pub partition: Option<String>,
}

fn default_scope() -> String { "SecureResources".to_string() }

impl Config {
    /// The request this tool ships with when no config file is given.
    pub fn builtin() -> Self {
        Config {
            stack: "SecureBucketStack".to_string(),
            context: AccountContext { account: "248896117205".to_string(), region: "us-east-1".to_string(), partition: None },
            scope: default_scope(),
            secure_bucket: ProvisioningRequest::Reference(ReferenceRequest {
                github_repo: Some("skdba8/evinovadevops".to_string()),
                bucket_name: "evinovadevops-secure-bucket".to_string(),
                kms_key_arn: Some(
                    "arn:aws:kms:us-east-1:248896117205:key/0c7e8b39-f431-4aa9-a187-ac430fb8030a".to_string(),
                ),
            }),
        }
    }

    pub fn stack_context(&self) -> StackContext {
        StackContext {
            stack_name: self.stack.clone(),
            account: self.context.account.clone(),
            region: self.context.region.clone(),
            partition: self.context.partition.clone(),
        }
    }

    pub fn from_yaml(raw: &[u8]) -> Result<Self> {
        Ok(serde_yaml::from_slice(raw)?)
    }

    /// Loads `path`, decrypting it first when it ends in `.age`.
    pub fn load(path: &Path, age_ids: &[PathBuf]) -> Result<Self> {
        let cfg = if path.extension().and_then(|s| s.to_str()) == Some("age") {
            let mut ids = Vec::new();
            for p in age_ids { ids.extend(securebucket_crypto::load_identities(p)?); }
            let f = std::fs::File::open(path).with_context(|| format!("open {}", path.display()))?;
            let dec = securebucket_crypto::decrypt_age_bytes(std::io::BufReader::new(f), &ids)?;
            Self::from_yaml(dec.expose_secret())
        } else {
            Self::from_yaml(&std::fs::read(path).with_context(|| format!("read {}", path.display()))?)
        };
        cfg.with_context(|| format!("parse config {}", path.display()))
    }
}
