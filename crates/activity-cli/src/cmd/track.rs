use crate::output::{join_or_none, print_json, print_table};
use activity_core::{
    active_set,
    aggregate::{aggregate, ActivityReport},
    config::{Config, WarnLevel},
    discord::{DiscordClient, DiscordLogRetriever},
    normalize, paths,
    promotion::{self, LevelList, PromotionCandidates},
    raw_log::{self, RawLog},
    roster::Roster,
    types::Identity,
};
use anyhow::Context;
use clap::Args;
use std::path::{Path, PathBuf};

#[derive(Args)]
pub struct TrackArgs {
    /// Replay a saved log instead of fetching channel history
    #[arg(long, short = 'f', value_name = "PATH")]
    log_file: Option<PathBuf>,

    /// Max number of messages to fetch (default: retrieval.max_messages)
    #[arg(long, short = 'n')]
    max_messages: Option<u32>,

    /// Max age in days of messages to fetch (default: retrieval.max_days)
    #[arg(long, short = 'd')]
    max_days: Option<u32>,

    /// Where to write the active set (default: output/active_igns.txt)
    #[arg(long, short = 'o', value_name = "PATH")]
    output: Option<PathBuf>,

    /// Don't keep a copy of fetched history under logs/
    #[arg(long)]
    no_save_raw: bool,
}

pub fn run(root: &Path, args: TrackArgs, token: Option<&str>, json: bool) -> anyhow::Result<()> {
    let config = Config::load(root).context("failed to load config")?;
    let errors: Vec<String> = config
        .validate()
        .into_iter()
        .filter(|w| w.level == WarnLevel::Error)
        .map(|w| w.message)
        .collect();
    if !errors.is_empty() {
        anyhow::bail!("invalid config: {}", errors.join("; "));
    }
    let criteria = config.activity.criteria()?;

    let (log, source) = match &args.log_file {
        Some(path) => {
            let path = paths::resolve(root, path);
            let log = raw_log::read_replay(&path).context("failed to read log file")?;
            (log, path.display().to_string())
        }
        None => fetch_live(root, &config, &args, token)?,
    };

    let normalizer = normalize::for_config(&config);
    let mut events = normalize::events(&log, normalizer.as_ref());
    let mut report = aggregate(events.by_ref(), &criteria);
    let parsed = events.finish().context("log source has no usable records")?;

    let roster = match config.roster_path(root) {
        Some(path) => Some(Roster::load(&path).context("failed to load roster")?),
        None => None,
    };
    let members = roster.as_ref().map(Roster::members);
    if let Some(members) = &members {
        report.restrict_to(members);
    }

    let promotions = match &roster {
        Some(roster) => evaluate_promotions(root, &config, &report, roster, criteria.day_offset)?,
        None => Vec::new(),
    };

    let output = args
        .output
        .as_deref()
        .map(|p| paths::resolve(root, p))
        .unwrap_or_else(|| paths::active_set_path(root));
    active_set::write(&output, &report.active).context("failed to write active set")?;

    let inactive: Vec<&Identity> = members
        .as_ref()
        .map(|m| report.inactive(m))
        .unwrap_or_default();

    if json {
        print_json(&serde_json::json!({
            "source": source,
            "artifact": output.display().to_string(),
            "records": parsed,
            "aggregate": report.stats,
            "window_start": report.window_start,
            "window_end": report.window_end,
            "active": report.active,
            "grace": report.grace,
            "inactive": inactive,
            "promotions": promotions,
        }))?;
        return Ok(());
    }

    println!("Source: {source}");
    println!(
        "Records: {}  events: {}  ignored: {}  malformed: {}",
        parsed.records, parsed.events, parsed.ignored, parsed.malformed
    );
    println!(
        "Events counted: {}  excluded by channel: {}  outside window: {}",
        report.stats.events_counted, report.stats.excluded_by_channel, report.stats.outside_window
    );
    println!();

    print_group("Active", report.active.iter(), &report, roster.as_ref());
    print_group(
        "Grace period (joined recently, not yet active)",
        report.grace.iter(),
        &report,
        roster.as_ref(),
    );
    if roster.is_some() {
        print_group("Inactive", inactive.iter().copied(), &report, roster.as_ref());
        print_promotions(&promotions);
    }

    println!(
        "{} identities qualify; wrote {}",
        report.active.len(),
        output.display()
    );
    Ok(())
}

fn fetch_live(
    root: &Path,
    config: &Config,
    args: &TrackArgs,
    token: Option<&str>,
) -> anyhow::Result<(RawLog, String)> {
    let discord = config.discord()?;
    let token = discord.token(token)?;
    let client = DiscordClient::new(discord, token)?;
    let max_messages = args.max_messages.unwrap_or(config.retrieval.max_messages);
    let max_days = args.max_days.unwrap_or(config.retrieval.max_days);

    let log = DiscordLogRetriever::new(&client, &discord.channel_id, config.retry.clone())
        .fetch(max_messages, max_days)
        .context("failed to fetch channel history")?;

    if !args.no_save_raw {
        let path = paths::raw_log_path(
            root,
            chrono::Local::now(),
            &discord.guild_id,
            &discord.channel_id,
        );
        raw_log::save(&path, &log).context("failed to save fetched history")?;
        tracing::info!(path = %path.display(), "saved raw log");
        eprintln!("Saved fetched history to {}", path.display());
    }

    Ok((log, format!("channel {}", discord.channel_id)))
}

fn evaluate_promotions(
    root: &Path,
    config: &Config,
    report: &ActivityReport,
    roster: &Roster,
    day_offset: chrono::FixedOffset,
) -> anyhow::Result<Vec<PromotionCandidates>> {
    let levels = if config.promotion.needs_levels() {
        let path = config.promotion.levels_path(root);
        if config.promotion.levels.is_none() && !path.exists() {
            tracing::warn!(path = %path.display(), "no level list, level-gated promotions will be empty");
            LevelList::default()
        } else {
            LevelList::load(&path).context("failed to load level list")?
        }
    } else {
        LevelList::default()
    };

    let now = chrono::Utc::now();
    Ok(config
        .promotion
        .rules
        .iter()
        .map(|rule| promotion::candidates(rule, report, roster, &levels, day_offset, now))
        .collect())
}

fn print_promotions(promotions: &[PromotionCandidates]) {
    for p in promotions {
        println!("{} -> {} promotion list:", p.from, p.to);
        if !p.unverified_join.is_empty() {
            println!(
                "  warning: no guild join in the log for {}; check their join date before promoting",
                join_or_none(p.unverified_join.iter().map(Identity::as_str))
            );
        }
        println!("  {}", join_or_none(p.eligible.iter().map(Identity::as_str)));
        println!();
    }
}

fn print_group<'a>(
    title: &str,
    identities: impl Iterator<Item = &'a Identity> + Clone,
    report: &ActivityReport,
    roster: Option<&Roster>,
) {
    let count = identities.clone().count();
    println!("{title} ({count}):");
    if count == 0 {
        println!("  (none)");
        println!();
        return;
    }

    if let Some(roster) = roster {
        for (rank, members) in roster.group(identities.clone()) {
            println!("  {rank}: {}", join_or_none(members.into_iter().map(Identity::as_str)));
        }
        println!();
    }

    let rows = identities
        .map(|i| {
            let summary = report.identities.get(i);
            vec![
                i.to_string(),
                summary
                    .map(|s| s.days.len().to_string())
                    .unwrap_or_else(|| "0".to_string()),
                summary
                    .map(|s| s.last_seen.format("%b %d %H:%M").to_string())
                    .unwrap_or_else(|| "N/A".to_string()),
            ]
        })
        .collect();
    print_table(&["IGN", "Days", "Last seen"], rows);
    println!();
}
