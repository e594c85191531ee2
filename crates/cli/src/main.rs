use anyhow::Result;
use clap::{Parser, Subcommand, ValueEnum};
use serde_json::json;
use std::path::PathBuf;
use tracing_subscriber::fmt::format::FmtSpan;
use tracing_subscriber::EnvFilter;

use securebucket_cfn as cfn;
use securebucket_core::ResourceGraph;
use securebucket_policy::Policy;
use securebucket_tfcompat as tfc;

mod config;
use config::Config;

#[derive(Parser, Debug)]
#[command(author, version, about="securebucket — S3 bucket + GitHub OIDC role provisioner (CloudFormation / Terraform)")]
struct Cli {
    /// Config file (YAML or .yml.age); the built-in request is used when omitted
    #[arg(short, long, global = true)]
    file: Option<PathBuf>,

    /// Output directory
    #[arg(short, long, default_value="out", global = true)]
    out: PathBuf,

    /// Runner
    #[arg(long, value_enum, default_value_t=Runner::Auto, global = true)]
    runner: Runner,

    /// Allow unencrypted buckets. Create mode leaves encryption off unless
    /// `enable_encryption` is set, and the policy check rejects such a bucket
    /// without this flag
    #[arg(long, default_value_t=false, global = true)]
    allow_unencrypted: bool,

    /// Fail instead of warn on broad grants (e.g. AmazonS3FullAccess)
    #[arg(long, default_value_t=false, global = true)]
    deny_broad_grants: bool,

    /// AGE identities (optional, for .age files)
    #[arg(long="age-identity", global = true)]
    age_ids: Vec<PathBuf>,

    #[command(subcommand)]
    cmd: Cmd,
}

#[derive(Copy, Clone, Eq, PartialEq, Debug, ValueEnum)]
enum Runner { Auto, Terraform, Tofu }

#[derive(Subcommand, Debug)] enum Cmd {
    /// Write template.json and main.tf.json, print the declared outputs
    Synth,
    Init,
    Plan,
    Apply,
    Destroy,
    CfnDeploy {
        #[arg(long)] stack: Option<String>,
    },
    CfnDelete {
        #[arg(long)] stack: Option<String>,
    },
}

fn main() -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .json()
        .with_env_filter(filter)
        .with_span_events(FmtSpan::CLOSE)
        .with_writer(std::io::stderr)
        .init();
    let cli = Cli::parse();
    let policy = Policy::new(cli.allow_unencrypted, cli.deny_broad_grants);

    let cfg = match &cli.file {
        Some(f) => Config::load(f, &cli.age_ids)?,
        None => {
            tracing::info!("no config file given, using the built-in request");
            Config::builtin()
        }
    };
    let ctx = cfg.stack_context();

    // Declare
    let mut provisioned = securebucket_provisioner::provision(&ctx, &cfg.scope, &cfg.secure_bucket)?;
    let mut stack = ResourceGraph::new();
    provisioned.register(&mut stack)?;

    // Render + policy, before anything is written
    let tpl = cfn::synth(&stack, &format!("{} (generated by securebucket)", ctx.stack_name))?;
    policy.check_template(&tpl)?;
    let tf = tfc::render(&stack, &ctx)?;

    let template_file = cfn::write_template(&tpl, &cli.out)?;
    tfc::write_tf_json(&tf, &cli.out)?;

    let r = match cli.runner {
        Runner::Terraform => Some(tfc::Runner::Terraform),
        Runner::Tofu      => Some(tfc::Runner::Tofu),
        Runner::Auto      => None
    };

    match cli.cmd {
      Cmd::Synth => {
          let summary = json!({
              "stack": ctx.stack_name,
              "bucket": provisioned.bucket,
              "identity": provisioned.identity,
              "outputs": provisioned.outputs,
              "files": [template_file.display().to_string(), cli.out.join("main.tf.json").display().to_string()],
          });
          println!("{}", serde_json::to_string_pretty(&summary)?);
      },
      Cmd::Init    => {
          let runner = tfc::pick_runner(r)?;
          tfc::run_init(runner, &cli.out)?;
      },
      Cmd::Plan    => {
          let runner = tfc::pick_runner(r)?;
          tfc::run_init(runner, &cli.out)?;
          tfc::run_plan(runner, &cli.out)?;
      },
      Cmd::Apply   => {
          let runner = tfc::pick_runner(r)?;
          tfc::run_init(runner, &cli.out)?;
          tfc::run_apply(runner, &cli.out)?;
      },
      Cmd::Destroy => {
          let runner = tfc::pick_runner(r)?;
          tfc::run_init(runner, &cli.out)?;
          tfc::run_destroy(runner, &cli.out)?;
      },
      Cmd::CfnDeploy { stack: stack_opt } => {
          let stack_name = stack_opt.unwrap_or_else(|| ctx.stack_name.clone());
          cfn::deploy_stack(&stack_name, &template_file, Some(ctx.region.as_str()))?;
          let outputs = cfn::stack_outputs(&stack_name, Some(ctx.region.as_str()))?;
          println!("{}", serde_json::to_string_pretty(&outputs)?);
      },
      Cmd::CfnDelete { stack: stack_opt } => {
          let stack_name = stack_opt.unwrap_or_else(|| ctx.stack_name.clone());
          cfn::delete_stack(&stack_name, Some(ctx.region.as_str()))?
      },
    }
    Ok(())
}
