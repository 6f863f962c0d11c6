use crate::output::{print_json, print_table};
use activity_core::{
    active_set,
    config::Config,
    discord::{DiscordClient, DiscordRoleSystem},
    paths,
    reconcile::{self, ReconcileReport, ReconciliationPlan, RoleOperation, RoleSystem, UnresolvedMember},
};
use anyhow::Context;
use clap::Args;
use std::path::{Path, PathBuf};

#[derive(Args)]
pub struct ReconcileArgs {
    /// Active-set artifact to read (default: output/active_igns.txt)
    #[arg(long, value_name = "PATH")]
    active: Option<PathBuf>,

    /// Show the plan without changing any roles
    #[arg(long)]
    dry_run: bool,
}

pub fn run(root: &Path, args: ReconcileArgs, token: Option<&str>, json: bool) -> anyhow::Result<()> {
    let config = Config::load(root).context("failed to load config")?;
    let discord = config.discord()?;

    let artifact = args
        .active
        .as_deref()
        .map(|p| paths::resolve(root, p))
        .unwrap_or_else(|| paths::active_set_path(root));
    let active = active_set::read(&artifact)
        .with_context(|| format!("run `guild-activity track` first to produce {}", artifact.display()))?;

    let token = discord.token(token)?;
    let client = DiscordClient::new(discord, token)?;
    let roles = DiscordRoleSystem::connect(
        client,
        &discord.guild_id,
        &discord.role_name,
        config.retry.clone(),
    )
    .context("failed to connect to the role system")?;

    let snapshot = reconcile::fetch_snapshot(&roles, active.as_set(), &config.retry)?;
    let plan = reconcile::plan(&active, &snapshot);
    tracing::info!(
        active = active.len(),
        members = snapshot.len(),
        operations = plan.len(),
        "computed reconciliation plan"
    );

    if args.dry_run {
        return print_plan(&discord.role_name, &plan, &roles.unresolved(), json);
    }

    let report = reconcile::execute(&plan, &roles, &config.retry);
    if report.is_clean() {
        tracing::info!("role is in sync with the active set");
    } else {
        tracing::warn!(
            skipped = report.skipped.len(),
            unresolved = report.unresolved.len(),
            "reconciliation left some members untouched"
        );
    }
    print_report(&discord.role_name, &plan, &report, json)
}

fn print_plan(
    role: &str,
    plan: &ReconciliationPlan,
    unresolved: &[UnresolvedMember],
    json: bool,
) -> anyhow::Result<()> {
    if json {
        print_json(&serde_json::json!({
            "role": role,
            "dry_run": true,
            "plan": plan,
            "unresolved": unresolved,
        }))?;
        return Ok(());
    }

    if plan.is_empty() {
        println!("Role '{role}' already matches the active set. Nothing to do.");
    } else {
        println!("Would change role '{role}' ({} operation(s)):", plan.len());
        for op in plan.operations() {
            let sign = match op {
                RoleOperation::Grant(_) => '+',
                RoleOperation::Revoke(_) => '-',
            };
            println!("  {sign} {}", op.identity());
        }
    }
    print_unresolved(unresolved);
    Ok(())
}

fn print_unresolved(unresolved: &[UnresolvedMember]) {
    if unresolved.is_empty() {
        return;
    }
    println!();
    println!("Unresolved (handle shared with another member, role left as is):");
    let rows = unresolved
        .iter()
        .map(|m| {
            vec![
                m.handle.to_string(),
                m.member_id.clone(),
                if m.has_role { "yes" } else { "no" }.to_string(),
            ]
        })
        .collect();
    print_table(&["Handle", "Member ID", "Has role"], rows);
}

fn print_report(
    role: &str,
    plan: &ReconciliationPlan,
    report: &ReconcileReport,
    json: bool,
) -> anyhow::Result<()> {
    if json {
        print_json(&serde_json::json!({
            "role": role,
            "planned": plan.len(),
            "granted": report.granted,
            "revoked": report.revoked,
            "skipped": report.skipped,
            "unresolved": report.unresolved,
        }))?;
        return Ok(());
    }

    for i in &report.granted {
        println!("Added role '{role}' to {i}");
    }
    for i in &report.revoked {
        println!("Removed role '{role}' from {i}");
    }

    if !report.skipped.is_empty() {
        println!();
        println!("Skipped:");
        let rows = report
            .skipped
            .iter()
            .map(|s| vec![s.operation.to_string(), s.reason.to_string()])
            .collect();
        print_table(&["Operation", "Reason"], rows);
    }
    print_unresolved(&report.unresolved);

    println!();
    println!(
        "Granted: {}  revoked: {}  skipped: {}  unresolved: {}",
        report.granted.len(),
        report.revoked.len(),
        report.skipped.len(),
        report.unresolved.len()
    );
    Ok(())
}
