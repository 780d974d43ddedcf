use clap::Args;
use serde_json::json;

use crate::{AppContext, OutputFormat, Result};

#[derive(Args, Debug)]
pub struct SyncArgs {
    /// Sync a single appliance instead of all of them
    #[arg(long)]
    pub device: Option<String>,
}

pub async fn sync(context: AppContext, format: OutputFormat, args: &SyncArgs) -> Result<()> {
    let report = match &args.device {
        Some(device_id) => context.sync.sync_device(device_id).await?,
        None => context.sync.sync_all().await?,
    };
    match format {
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&report)?),
        OutputFormat::Text => println!(
            "synced {} devices, {} series, {} episodes",
            report.devices, report.series, report.episodes
        ),
    }
    Ok(())
}

pub async fn status(context: AppContext, format: OutputFormat) -> Result<()> {
    let devices = context.store.list_devices(false)?;
    let online = devices.iter().filter(|device| device.online).count();
    let series = context.store.list_series()?;
    let episodes = context.store.episode_count()?;
    let rules = context.store.list_rules()?;
    let restored = context.engine.recover_cache().await?;

    match format {
        OutputFormat::Json => {
            let summary = json!({
                "devices": devices.len(),
                "devices_online": online,
                "series": series.len(),
                "episodes": episodes,
                "recording_rules": rules.len(),
                "cached_transcodes": restored,
            });
            println!("{}", serde_json::to_string_pretty(&summary)?);
        }
        OutputFormat::Text => {
            println!("devices:           {} ({online} online)", devices.len());
            println!("series:            {}", series.len());
            println!("episodes:          {episodes}");
            println!("recording rules:   {}", rules.len());
            println!("cached transcodes: {restored}");
        }
    }
    Ok(())
}
