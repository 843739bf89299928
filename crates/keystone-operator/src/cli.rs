//!
//! # CLI for the keystone operator
//!
//! Parameters are overwritten in the following sequence:
//!     1) default values
//!     2) configuration file, if provided
//!     3) cli parameters
//!
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context as _, Result, anyhow};
use clap::{Args, Parser, Subcommand};
use tracing::{debug, error, info};

use keystone_metadata::KeystoneServer;

use crate::config::{ApplyMode, OperatorConfig};
use crate::controllers::{DesiredStateBuilder, reconcile_all};
use crate::core::Context;
use crate::error::OperatorConfigError;
use crate::init::start_main_loop;
use crate::stores::LocalStore;

/// cli options
#[derive(Debug, Parser)]
#[command(name = "keystone-operator", about = "Keystone server operator")]
pub struct OperatorOpt {
    #[command(subcommand)]
    cmd: Option<OperatorCmd>,

    #[command(flatten)]
    run: RunOpt,
}

#[derive(Debug, Subcommand)]
pub enum OperatorCmd {
    /// Print keystone.conf generated for a KeystoneServer file
    Render(RenderOpt),
}

#[derive(Debug, Args)]
pub struct RunOpt {
    /// run against a local metadata directory
    #[arg(long, value_name = "metadata path")]
    local: Option<PathBuf>,

    /// operator configuration file (TOML)
    #[arg(long, value_name = "config path", env = "KEYSTONE_OPERATOR_CONFIG")]
    config: Option<PathBuf>,

    /// only watch this namespace
    #[arg(short = 'n', long = "namespace", value_name = "namespace")]
    namespace: Option<String>,

    /// writer identity used when applying objects
    #[arg(long)]
    field_owner: Option<String>,

    /// create missing objects only, never update existing ones
    #[arg(long)]
    create_only: bool,

    /// keystone.conf template replacing the built-in defaults
    #[arg(long, value_name = "template path")]
    template: Option<PathBuf>,

    /// reconcile every server once, then exit
    #[arg(long)]
    once: bool,
}

#[derive(Debug, Args)]
pub struct RenderOpt {
    /// KeystoneServer YAML file
    #[arg(value_name = "spec path")]
    spec: PathBuf,

    /// keystone.conf template replacing the built-in defaults
    #[arg(long, value_name = "template path")]
    template: Option<PathBuf>,
}

impl OperatorOpt {
    pub async fn process(self) -> Result<()> {
        match self.cmd {
            Some(OperatorCmd::Render(render)) => {
                print!("{}", render.render()?);
                Ok(())
            }
            None => self.run.process().await,
        }
    }
}

impl RunOpt {
    /// configuration with cli parameters applied
    pub fn as_config(&self) -> Result<OperatorConfig, OperatorConfigError> {
        let mut config = match &self.config {
            Some(path) => OperatorConfig::load(path)?,
            None => OperatorConfig::default(),
        };

        if let Some(namespace) = &self.namespace {
            config.namespace = Some(namespace.clone());
        }
        if let Some(field_owner) = &self.field_owner {
            config.field_owner = field_owner.clone();
        }
        if self.create_only {
            config.apply_mode = ApplyMode::Create;
        }
        if let Some(template) = &self.template {
            config.template = Some(template.clone());
        }

        config.validate()?;
        Ok(config)
    }

    async fn process(self) -> Result<()> {
        let metadata = self
            .local
            .as_ref()
            .ok_or_else(|| anyhow!("--local <metadata path> is required"))?;
        let config = self.as_config()?;
        debug!(?config, "operator config");

        let template = config.load_template()?;
        let store = LocalStore::open(metadata)
            .with_context(|| format!("unable to open {}", metadata.display()))?;
        let ctx = Context::shared(Arc::new(store), config, template);

        if self.once {
            let results = reconcile_all(ctx).await?;
            let mut failed = 0;
            for (key, result) in results {
                match result {
                    Ok(action) => info!(%key, applied = ?action.applied, "reconciled"),
                    Err(failure) => {
                        error!(%failure, "reconcile failed");
                        failed += 1;
                    }
                }
            }
            return if failed == 0 {
                Ok(())
            } else {
                Err(anyhow!("{failed} server(s) failed to reconcile"))
            };
        }

        // fired when the controller stops
        let shutdown = start_main_loop(ctx);
        shutdown.cancelled().await;
        info!("operator stopped");
        Ok(())
    }
}

impl RenderOpt {
    pub fn render(&self) -> Result<String> {
        let config = OperatorConfig {
            template: self.template.clone(),
            ..Default::default()
        };
        let template = config.load_template()?;

        let content = std::fs::read_to_string(&self.spec)
            .with_context(|| format!("unable to read {}", self.spec.display()))?;
        let server: KeystoneServer = serde_yaml::from_str(&content)
            .with_context(|| format!("invalid KeystoneServer {}", self.spec.display()))?;
        server.spec.config.validate()?;

        let builder = DesiredStateBuilder::new(Arc::new(template));
        Ok(builder.render_config(&server.spec.config))
    }
}
