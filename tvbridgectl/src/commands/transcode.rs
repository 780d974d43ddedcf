use std::sync::Arc;

use tvbridge_core::{BackfillItem, BulkBackfill, TranscodeMetadata};

use crate::{AppContext, OutputFormat, Result};

pub async fn backfill(context: AppContext, format: OutputFormat) -> Result<()> {
    context.engine.recover_cache().await?;

    let mut items = Vec::new();
    for series in context.store.list_series()? {
        for episode in context.store.episodes_for_series(series.id)? {
            let Some(upstream) = episode.play_url.clone() else {
                continue;
            };
            items.push(BackfillItem {
                episode_id: episode.id,
                upstream_url: upstream,
                metadata: TranscodeMetadata {
                    show_name: Some(series.title.clone()),
                    episode_name: episode.episode_title.clone().or(episode.title.clone()),
                    air_date: episode.original_airdate.map(|ts| ts.to_string()),
                },
            });
        }
    }

    let report = BulkBackfill::new(Arc::clone(&context.engine)).run(items).await;
    match format {
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&report)?),
        OutputFormat::Text => println!(
            "backfill: {} total, {} completed, {} failed, {} skipped",
            report.total, report.completed, report.failed, report.skipped
        ),
    }
    Ok(())
}

pub async fn cleanup(context: AppContext, format: OutputFormat) -> Result<()> {
    let removed = context.engine.cleanup_sweep().await?;
    match format {
        OutputFormat::Json => println!("{{\"removed\": {removed}}}"),
        OutputFormat::Text => println!("removed {removed} expired transcode directories"),
    }
    Ok(())
}
