//! Command implementations: project plumbing, adapter wiring, rendering.

use std::sync::Arc;

use anyhow::{Context, Result};
use colored::Colorize;
use mob::apply::{self, DEFAULT_TRANSFER_CONCURRENCY};
use mob::cancel::CancelToken;
use mob::config::BundleConfig;
use mob::diff::FileState;
use mob::plan;
use mob::policy::StoragePolicy;
use mob::registry::{BundleRef, RegistryAdapter};
use mob::snapshot::{self, Snapshot};
use mob::status::{self, SyncStatus};
use mob::{Project, RelPath};
use mob_cas::LocalCas;
use mob_oci::{OciOptions, OciRegistry};
use oci_client::secrets::RegistryAuth;

use crate::OutputFormat;

fn open_project() -> Result<Project> {
    Ok(Project::discover(std::env::current_dir()?)?)
}

fn registry_for(config: &BundleConfig, insecure: bool) -> Result<Arc<dyn RegistryAdapter>> {
    // Credential loading from user config files lives outside this tool;
    // environment variables cover CI and local use.
    let auth = match (
        std::env::var("MOB_REGISTRY_USERNAME"),
        std::env::var("MOB_REGISTRY_PASSWORD"),
    ) {
        (Ok(username), Ok(password)) => RegistryAuth::Basic(username, password),
        _ => RegistryAuth::Anonymous,
    };
    let adapter = OciRegistry::connect(
        &config.registry_ref,
        OciOptions {
            insecure,
            auth,
            ..OciOptions::default()
        },
    )?;
    Ok(Arc::new(adapter))
}

fn cache_for(config: &BundleConfig) -> Result<LocalCas> {
    Ok(LocalCas::open(config.cache_root()).map_err(mob::Error::from)?)
}

async fn snapshot_project(project: &Project) -> Result<Snapshot> {
    let tracked = project.tracked()?;
    Ok(snapshot::snapshot(project.root(), &tracked, snapshot::default_concurrency()).await?)
}

fn rel_paths(project: &Project, raw: &[String]) -> Result<Vec<RelPath>> {
    raw.iter()
        .map(|r| project.rel_path(r).with_context(|| format!("path {r:?}")))
        .collect()
}

/// Wires Ctrl-C to a cancel token.
fn cancel_on_ctrl_c() -> CancelToken {
    let token = CancelToken::new();
    let signal_token = token.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            eprintln!("\nInterrupt received; finishing up...");
            signal_token.cancel();
        }
    });
    token
}

fn state_color(state: FileState) -> colored::ColoredString {
    let label = state.label();
    match state {
        FileState::AddedLocal | FileState::AddedRemote => label.green(),
        FileState::ModifiedLocal | FileState::ModifiedRemote => label.yellow(),
        FileState::DeletedLocal | FileState::DeletedRemote | FileState::Conflict => label.red(),
        FileState::Unchanged | FileState::Untracked => label.dimmed(),
    }
}

pub(crate) fn init(registry_ref: &str) -> Result<()> {
    let project = Project::init(std::env::current_dir()?, registry_ref)?;
    println!(
        "Initialized bundle project for {} in {}",
        registry_ref,
        project.meta_dir().display()
    );
    Ok(())
}

pub(crate) fn add(raw: &[String], force: bool) -> Result<()> {
    let project = open_project()?;
    let _lock = project.lock()?;
    let outcome = project.track(rel_paths(&project, raw)?, force)?;
    for path in &outcome.added {
        println!("added {path}");
    }
    for path in &outcome.already {
        println!("already tracked: {path}");
    }
    for path in &outcome.skipped {
        eprintln!(
            "{}: {} (ignored; use --force to track anyway)",
            "skipped".yellow(),
            path
        );
    }
    Ok(())
}

pub(crate) fn remove(raw: &[String]) -> Result<()> {
    let project = open_project()?;
    let _lock = project.lock()?;
    let outcome = project.untrack(rel_paths(&project, raw)?)?;
    for path in &outcome.added {
        println!("removed {path}");
    }
    for path in &outcome.skipped {
        eprintln!("{}: {} was not tracked", "skipped".yellow(), path);
    }
    Ok(())
}

pub(crate) async fn status(format: OutputFormat, tag: Option<&str>, insecure: bool) -> Result<()> {
    let project = open_project()?;
    let config = project.config()?;
    let tag = tag.unwrap_or(&config.default_tag);
    let registry = registry_for(&config, insecure)?;

    let snapshot = snapshot_project(&project).await?;
    let sync = project.sync_state()?;
    let report = status::compute_status(registry.as_ref(), &snapshot, &sync, tag).await?;

    let inventory = mob::scan::inventory(project.root(), &project.ignore_matcher()?)?;
    let untracked = status::untracked(&inventory, &project.tracked()?);

    if matches!(format, OutputFormat::Json) {
        let changes: Vec<serde_json::Value> = report
            .diff
            .iter()
            .filter(|(_, d)| d.state != FileState::Unchanged)
            .map(|(path, d)| {
                serde_json::json!({
                    "path": path.as_str(),
                    "state": d.state,
                    "local": d.local.as_ref().map(ToString::to_string),
                    "remote": d.remote.as_ref().map(ToString::to_string),
                })
            })
            .collect();
        let out = serde_json::json!({
            "status": report.status,
            "tag": tag,
            "remote_digest": report.remote_digest.as_ref().map(ToString::to_string),
            "changes": changes,
            "missing": report.missing.iter().map(RelPath::as_str).collect::<Vec<_>>(),
            "untracked": untracked.iter().map(RelPath::as_str).collect::<Vec<_>>(),
        });
        println!("{}", serde_json::to_string_pretty(&out)?);
        return Ok(());
    }

    let headline = match report.status {
        SyncStatus::Clean => report.status.label().green(),
        SyncStatus::Unknown => report.status.label().dimmed(),
        SyncStatus::Diverged => report.status.label().red(),
        _ => report.status.label().yellow(),
    };
    println!("On tag {tag}: {headline}");
    if let Some(digest) = &report.remote_digest {
        println!("Remote: {digest}");
    }

    let mut any = false;
    for (path, d) in &report.diff {
        if d.state == FileState::Unchanged {
            continue;
        }
        println!("  {:<20} {path}", state_color(d.state));
        any = true;
    }
    for path in &report.missing {
        println!("  {:<20} {path}", "missing on disk".red());
        any = true;
    }
    for path in &untracked {
        println!("  {:<20} {path}", state_color(FileState::Untracked));
        any = true;
    }
    if !any {
        println!("  nothing to report");
    }
    Ok(())
}

pub(crate) async fn diff(tag: Option<&str>, insecure: bool) -> Result<()> {
    let project = open_project()?;
    let config = project.config()?;
    let tag = tag.unwrap_or(&config.default_tag);
    let registry = registry_for(&config, insecure)?;

    let snapshot = snapshot_project(&project).await?;
    let sync = project.sync_state()?;
    let report = status::compute_status(registry.as_ref(), &snapshot, &sync, tag).await?;

    for (path, d) in &report.diff {
        if d.state == FileState::Unchanged {
            continue;
        }
        println!("{:<20} {path}", state_color(d.state));
    }
    Ok(())
}

pub(crate) async fn push(tag: Option<&str>, force: bool, insecure: bool) -> Result<()> {
    let project = open_project()?;
    let _lock = project.lock()?;
    let config = project.config()?;
    let tag = tag.unwrap_or(&config.default_tag).to_owned();

    let registry = registry_for(&config, insecure)?;
    let blob = mob_blob::from_config(&config.storage)?;
    let policy = StoragePolicy::from_config(&config.storage)?;
    let snapshot = snapshot_project(&project).await?;
    if !snapshot.missing.is_empty() {
        for path in &snapshot.missing {
            eprintln!("{}: tracked file {path} is missing on disk", "warning".yellow());
        }
    }
    let sync = project.sync_state()?;

    let plan = plan::build_push_plan(
        registry.as_ref(),
        blob.as_deref(),
        &policy,
        &snapshot,
        &sync,
        &tag,
        force,
    )
    .await?;

    println!(
        "Pushing {} file(s) to {}:{} ({} layer upload(s), {} blob upload(s))",
        plan.index.files.len(),
        config.registry_ref,
        tag,
        plan.uploads_oci.len(),
        plan.uploads_blob.len(),
    );

    let cancel = cancel_on_ctrl_c();
    let outcome = apply::apply_push(
        &plan,
        &project,
        Arc::clone(&registry),
        blob.clone(),
        &cancel,
        DEFAULT_TRANSFER_CONCURRENCY,
        &|msg| eprintln!("{msg}"),
    )
    .await?;

    println!("Pushed {}", outcome.manifest_digest.to_string().bold());
    Ok(())
}

pub(crate) async fn pull(
    reference: Option<&str>,
    overwrite: bool,
    mirror: bool,
    insecure: bool,
) -> Result<()> {
    let project = open_project()?;
    let _lock = project.lock()?;
    let config = project.config()?;

    let reference = match reference {
        Some(raw) => raw.parse::<BundleRef>()?,
        None => BundleRef::Tag(config.default_tag.clone()),
    };

    let registry = registry_for(&config, insecure)?;
    let blob = mob_blob::from_config(&config.storage)?;
    let cas = cache_for(&config)?;
    let snapshot = snapshot_project(&project).await?;
    let sync = project.sync_state()?;

    let plan = plan::build_pull_plan(
        registry.as_ref(),
        &snapshot,
        &sync,
        &reference,
        overwrite,
        mirror,
    )
    .await?;

    println!(
        "Pulling {} ({} fetch(es), {} deletion(s))",
        plan.remote_digest.short(),
        plan.fetches.len(),
        plan.deletions.len(),
    );

    let cancel = cancel_on_ctrl_c();
    let outcome = apply::apply_pull(
        &plan,
        &project,
        Arc::clone(&registry),
        blob.clone(),
        &cas,
        config.cache_link_mode,
        &cancel,
        DEFAULT_TRANSFER_CONCURRENCY,
        &|msg| eprintln!("{msg}"),
    )
    .await?;

    println!(
        "Working tree now mirrors {}",
        outcome.remote_digest.to_string().bold()
    );
    Ok(())
}

pub(crate) async fn tags(insecure: bool) -> Result<()> {
    let project = open_project()?;
    let config = project.config()?;
    let registry = registry_for(&config, insecure)?;
    let tags = registry.list_tags().await?;
    if tags.is_empty() {
        println!("No tags in {}.", config.registry_ref);
    } else {
        for tag in tags {
            println!("{tag}");
        }
    }
    Ok(())
}

pub(crate) fn cache_dir() -> Result<()> {
    let project = open_project()?;
    let config = project.config()?;
    println!("{}", config.cache_root().display());
    Ok(())
}

pub(crate) fn cache_sweep(older_than_hours: u64) -> Result<()> {
    let project = open_project()?;
    let config = project.config()?;
    let cas = cache_for(&config)?;
    let removed = cas
        .sweep_temp(std::time::Duration::from_secs(older_than_hours * 3600))
        .map_err(mob::Error::from)?;
    println!("Removed {removed} stale temp file(s).");
    Ok(())
}
