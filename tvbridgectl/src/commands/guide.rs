use chrono::{TimeZone, Utc};
use clap::{Args, Subcommand};

use crate::{AppContext, OutputFormat, Result};

#[derive(Subcommand, Debug)]
pub enum GuideCommands {
    /// Fetch a fresh guide window from the cloud
    Refresh(GuideRefreshArgs),
    /// What is on the air right now
    Now,
    /// Search the forward guide window
    Search(GuideSearchArgs),
}

#[derive(Args, Debug)]
pub struct GuideRefreshArgs {
    /// Window start as epoch seconds (default: now)
    #[arg(long)]
    pub start: Option<i64>,
    /// Window length in hours, capped at 24
    #[arg(long)]
    pub hours: Option<u64>,
}

#[derive(Args, Debug)]
pub struct GuideSearchArgs {
    /// Substring matched against title, episode title and synopsis
    pub query: String,
    /// Restrict to one guide channel
    #[arg(long)]
    pub channel: Option<String>,
    /// Maximum results
    #[arg(long, default_value_t = 25)]
    pub limit: usize,
}

#[derive(Subcommand, Debug)]
pub enum RuleCommands {
    /// List recording rules (refreshes from the cloud)
    List,
    /// Delete a recording rule
    Delete(RuleDeleteArgs),
}

#[derive(Args, Debug)]
pub struct RuleDeleteArgs {
    pub rule_id: String,
}

pub async fn guide(
    context: AppContext,
    format: OutputFormat,
    command: &GuideCommands,
) -> Result<()> {
    match command {
        GuideCommands::Refresh(args) => {
            let inserted = context.guide.fetch_guide(args.start, args.hours).await?;
            println!("cached {inserted} new guide programs");
        }
        GuideCommands::Now => {
            let current = context.guide.now_playing().await?;
            match format {
                OutputFormat::Json => {
                    let entries: Vec<_> = current
                        .iter()
                        .map(|(channel, program)| {
                            serde_json::json!({
                                "channel": channel.guide_number,
                                "title": program.title,
                                "episode_title": program.episode_title,
                                "start_time": program.start_time,
                                "end_time": program.end_time,
                            })
                        })
                        .collect();
                    println!("{}", serde_json::to_string_pretty(&entries)?);
                }
                OutputFormat::Text => {
                    for (channel, program) in &current {
                        println!(
                            "{:>6}  {}  ({} - {})",
                            channel.guide_number,
                            program.title.as_deref().unwrap_or("-"),
                            format_time(program.start_time),
                            format_time(program.end_time),
                        );
                    }
                }
            }
        }
        GuideCommands::Search(args) => {
            let matches = context
                .guide
                .search(&args.query, args.channel.as_deref(), args.limit)
                .await?;
            for (channel, program) in &matches {
                println!(
                    "{:>6}  {}  {}  {}",
                    channel.guide_number,
                    format_time(program.start_time),
                    program.title.as_deref().unwrap_or("-"),
                    program.episode_title.as_deref().unwrap_or(""),
                );
            }
            if matches.is_empty() {
                println!("no matches");
            }
        }
    }
    Ok(())
}

pub async fn rules(context: AppContext, format: OutputFormat, command: &RuleCommands) -> Result<()> {
    match command {
        RuleCommands::List => {
            let rules = context.guide.rules_list().await?;
            match format {
                OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&rules)?),
                OutputFormat::Text => {
                    for rule in &rules {
                        println!(
                            "{}  {}  series={}  priority={}",
                            rule.rule_id,
                            rule.title.as_deref().unwrap_or("-"),
                            rule.series_id.as_deref().unwrap_or("-"),
                            rule.priority
                                .map(|p| p.to_string())
                                .unwrap_or_else(|| "-".into()),
                        );
                    }
                    if rules.is_empty() {
                        println!("no recording rules");
                    }
                }
            }
        }
        RuleCommands::Delete(args) => {
            context.guide.rule_delete(&args.rule_id).await?;
            println!("deleted rule {}", args.rule_id);
        }
    }
    Ok(())
}

fn format_time(epoch: i64) -> String {
    Utc.timestamp_opt(epoch, 0)
        .single()
        .map(|dt| dt.format("%m-%d %H:%M").to_string())
        .unwrap_or_else(|| epoch.to_string())
}
