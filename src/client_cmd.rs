use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Args;

use profmerge::protocol::ControlClient;

use crate::ConfigArgs;

#[derive(Args, Debug)]
pub struct StopArgs {
    #[command(flatten)]
    pub config: ConfigArgs,

    /// Control address (overrides `[control] address`)
    #[arg(long)]
    pub address: Option<String>,
}

#[derive(Args, Debug)]
pub struct IngestArgs {
    #[command(flatten)]
    pub config: ConfigArgs,

    /// Control address (overrides `[control] address`)
    #[arg(long)]
    pub address: Option<String>,

    /// Raw files to merge
    #[arg(required = true)]
    pub files: Vec<PathBuf>,
}

fn client(config: &ConfigArgs, address: Option<&str>) -> Result<ControlClient> {
    let mut protocol = config.load()?.control.protocol();
    if let Some(address) = address {
        protocol = protocol.with_address(address);
    }
    Ok(ControlClient::new(protocol))
}

pub fn stop(args: &StopArgs) -> Result<()> {
    let client = client(&args.config, args.address.as_deref())?;
    client.send_shutdown()?;
    println!("shutdown requested at {}", client.protocol().address);
    Ok(())
}

pub fn ingest(args: &IngestArgs) -> Result<()> {
    let client = client(&args.config, args.address.as_deref())?;
    for file in &args.files {
        let path = std::path::absolute(file)
            .with_context(|| format!("cannot resolve {}", file.display()))?;
        client
            .send_ingest(&path)
            .with_context(|| format!("failed to submit {}", path.display()))?;
    }
    Ok(())
}
