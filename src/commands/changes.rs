//! Change log commands: stage, process, commit, revert, discard, history

use anyhow::{Result, bail};
use colored::Colorize;
use declarative::{FailedCommit, Session, changelog, events};

use super::{finish, session};
use crate::Context;
use crate::ui;

// ============================================================================
// Staging
// ============================================================================

pub fn stage(ctx: &Context) -> Result<()> {
    let mut session = session(ctx)?;
    stage_in(ctx, &mut session)?;
    finish(&mut session)
}

fn stage_in(ctx: &Context, session: &mut Session) -> Result<usize> {
    let items = changelog::stage(session)?;
    if items.is_empty() {
        ui::info("Nothing to stage");
        return Ok(0);
    }

    if !ctx.quiet {
        ui::header("Staged changes");
        for item in &items {
            ui::log_item(item);
            if ctx.verbose > 0 {
                ui::log_diff(item);
            }
        }
        println!();
    }
    ui::success(&format!("Staged {} changes", items.len()));
    Ok(items.len())
}

/// Print the execution graph of everything staged, in a valid run order
pub fn process(ctx: &Context) -> Result<()> {
    let mut session = session(ctx)?;
    let graph = events::plan(&mut session)?;
    if graph.nodes.is_empty() {
        ui::info("Nothing staged");
        return Ok(());
    }

    ui::header(&format!(
        "Execution graph ({} actions, {} edges)",
        graph.nodes.len(),
        graph.edges.len()
    ));
    for (i, node) in graph.topological_order()?.iter().enumerate() {
        println!("{} {}", format!("[{}]", i + 1).blue().bold(), node);
        for edge in graph.predecessors(node) {
            ui::dim(&format!("after {} ({})", edge.from, edge.state));
        }
    }
    finish(&mut session)
}

// ============================================================================
// Commit
// ============================================================================

pub fn commit(ctx: &Context) -> Result<()> {
    let mut session = session(ctx)?;
    let committed = commit_in(ctx, &mut session);
    finish(&mut session)?;
    committed.map(|_| ())
}

fn commit_in(ctx: &Context, session: &mut Session) -> Result<usize> {
    let uids: Vec<String> = changelog::staged(session)?
        .into_iter()
        .map(|item| item.uid)
        .collect();
    if uids.is_empty() {
        ui::info("Nothing staged");
        return Ok(0);
    }

    let report = changelog::commit_all(session, &uids)?;
    if !ctx.quiet {
        for item in &report.committed {
            ui::log_item(item);
        }
    }
    for failure in &report.failed {
        eprintln!("{}", failure_line(failure));
        if let Some(err) = &failure.record_error {
            ui::error(&format!("{} was not moved to history: {err}", failure.uid));
        }
    }
    if !report.is_success() {
        bail!(
            "{} of {} changes failed to commit",
            report.failed.len(),
            uids.len()
        );
    }
    ui::success(&format!("Committed {} changes", report.committed.len()));
    Ok(report.committed.len())
}

/// `ERROR: <resource>: <message>` for one failed item
fn failure_line(failure: &FailedCommit) -> String {
    format!("ERROR: {}: {}", failure.resource, failure.error)
}

// ============================================================================
// Revert and Discard
// ============================================================================

pub fn revert(ctx: &Context, uid: &str) -> Result<()> {
    let mut session = session(ctx)?;
    match changelog::revert(&mut session, uid)? {
        Some(item) => {
            ui::success(&format!("Reverted {uid}, staged the reversal:"));
            ui::log_item(&item);
            if ctx.verbose > 0 {
                ui::log_diff(&item);
            }
        }
        None => ui::info(&format!("Reverted {uid}, nothing left to stage")),
    }
    finish(&mut session)
}

pub fn discard(ctx: &Context, uid: Option<&str>, all: bool) -> Result<()> {
    let mut session = session(ctx)?;
    match (uid, all) {
        (_, true) => {
            let count = changelog::discard_all(&mut session)?;
            ui::success(&format!("Discarded {count} staged changes"));
        }
        (Some(uid), false) => {
            changelog::discard(&mut session, uid)?;
            ui::success(&format!("Discarded {uid}"));
        }
        (None, false) => bail!("Pass a uid or --all"),
    }
    finish(&mut session)
}

// ============================================================================
// Inspection
// ============================================================================

pub fn history(ctx: &Context, limit: Option<usize>) -> Result<()> {
    let mut session = session(ctx)?;
    let items = changelog::history(&mut session, limit)?;
    if items.is_empty() {
        ui::info("History is empty");
        return Ok(());
    }
    for item in &items {
        ui::log_item(item);
        if ctx.verbose > 0 {
            ui::log_diff(item);
        }
    }
    Ok(())
}

pub fn show(ctx: &Context, uid: &str) -> Result<()> {
    let mut session = session(ctx)?;
    let item = changelog::item(&mut session, uid)?;

    ui::header(&item.to_string());
    ui::kv("resource", &item.resource);
    ui::kv("action", item.action.as_str());
    ui::kv("state", &format!("{:?}", item.state).to_lowercase());
    ui::kv("log", &format!("{:?}", item.log).to_lowercase());
    if let Some(order) = item.history_order {
        ui::kv("order", &order.to_string());
    }
    ui::kv(
        "created",
        &item
            .created_at
            .with_timezone(&chrono::Local)
            .format("%Y-%m-%d %H:%M:%S")
            .to_string(),
    );
    if let Some(error) = &item.error {
        ui::kv("error", &error.red().to_string());
    }
    if item.is_empty() {
        ui::dim("no changes");
    } else {
        println!();
        ui::log_diff(&item);
    }
    Ok(())
}
