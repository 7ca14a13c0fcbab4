use anyhow::{Context, Result};
use clap::Parser;
use indicatif::{ProgressBar, ProgressStyle};
use inquire::{Confirm, Select};
use log::{info, warn};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tts_studio::core::clock::{Clock, SystemClock};
use tts_studio::core::config::Config;
use tts_studio::core::io::{NativeStorage, Storage};
use tts_studio::core::state::CharacterDirectory;
use tts_studio::services::cache::{AudioCache, FingerprintBase};
use tts_studio::services::export::{export_archive, selected_entries};
use tts_studio::services::history::HistoryStore;
use tts_studio::services::rate_limit::RateLimiter;
use tts_studio::services::script::{parse_script, Job};
use tts_studio::services::setup::run_setup;
use tts_studio::services::tts::create_synthesizer;
use tts_studio::services::workflow::{GenerationScheduler, JobState, RunEvent, RunState};
use tts_studio::utils::audio::wav_duration;

#[derive(Debug, Parser)]
#[command(name = "tts-studio")]
#[command(about = "Batch voice generation for scripted dialogue")]
struct Cli {
    #[arg(long, default_value = "config.yml")]
    config: PathBuf,
    /// Never prompt; overrides `unattended` in the config.
    #[arg(long)]
    unattended: bool,
    /// Truncate history, drop all cached takes and zero the quota counters.
    #[arg(long)]
    clear_history: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::init();
    let cli = Cli::parse();

    let mut config = match Config::load(&cli.config) {
        Ok(cfg) => cfg,
        Err(e) => {
            eprintln!("Error loading config: {:#}", e);
            eprintln!("Please ensure '{}' exists with valid provider settings.", cli.config.display());
            return Err(e);
        }
    };
    if cli.unattended {
        config.unattended = true;
    }
    config.ensure_directories()?;

    let storage: Arc<dyn Storage> = Arc::new(NativeStorage::new());
    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let history = Arc::new(HistoryStore::new(storage.clone(), config.state_folder()));
    // Unreadable quota state stops everything here rather than counting from zero.
    let limiter = Arc::new(
        RateLimiter::open(config.generation.limits, history.clone(), clock.clone())
            .await
            .context("Failed to load quota state")?,
    );
    let cache = Arc::new(AudioCache::new(storage.clone(), config.cache_folder(), clock.clone()));

    if cli.clear_history {
        let lines = cache.job_ids().await?.len();
        history.clear().await?;
        cache.clear().await?;
        limiter.reset().await?;
        println!("History, cached takes of {} line(s) and quota counters cleared.", lines);
        return Ok(());
    }

    // An unreadable history log is fatal too; attempts must not go unrecorded.
    let recorded = history
        .record_count()
        .await
        .context("Failed to load history")?;
    info!("{} history records on file", recorded);

    let synthesizer = create_synthesizer(&config.provider)?;

    let scripts: Vec<String> = storage
        .list(&config.input_folder)
        .await?
        .into_iter()
        .filter(|e| e.ends_with(".txt"))
        .collect();
    if scripts.is_empty() {
        println!("No scripts found in {}", config.input_folder);
        return Ok(());
    }

    for (i, path_str) in scripts.iter().enumerate() {
        let path = Path::new(path_str);
        let stem = path
            .file_stem()
            .map(|s| s.to_string_lossy().to_string())
            .unwrap_or_else(|| "script".to_string());
        println!("Processing script: {}", path.display());

        let raw = String::from_utf8(storage.read(path_str).await?)
            .with_context(|| format!("{} is not valid UTF-8", path_str))?;
        let parsed = parse_script(&raw);
        for err in &parsed.errors {
            if config.unattended {
                warn!("{}: {}", path_str, err);
            } else {
                eprintln!("  {}", err);
            }
        }
        if parsed.jobs.is_empty() {
            println!("No valid lines in {}, skipping.", path_str);
            continue;
        }
        if !parsed.is_clean() && !config.unattended {
            let go_on = Confirm::new(&format!(
                "{} line(s) have errors. Continue with the {} valid line(s)?",
                parsed.errors.len(),
                parsed.jobs.len()
            ))
            .with_default(true)
            .prompt()?;
            if !go_on {
                println!("Skipping {}", path_str);
                continue;
            }
        }

        run_setup(&mut config, &parsed.jobs, &cli.config)?;

        let budget = limiter.current_budget().await;
        let limits = limiter.limits();
        println!(
            "Quota remaining: {}/{} this minute, {}/{} today",
            budget.per_minute_remaining, limits.per_minute, budget.per_day_remaining, limits.per_day
        );

        let scheduler = Arc::new(GenerationScheduler::new(
            config.generation.clone(),
            Arc::new(config.characters.clone()),
            limiter.clone(),
            cache.clone(),
            history.clone(),
            synthesizer.clone(),
            clock.clone(),
        ));
        let (run, mut events) = scheduler.start(parsed.jobs.clone());

        let pb = ProgressBar::new(parsed.jobs.len() as u64);
        pb.set_style(
            ProgressStyle::default_bar()
                .template("{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len} {msg}")?
                .progress_chars("#>-"),
        );

        let mut cancelling = false;
        loop {
            tokio::select! {
                event = events.recv() => match event {
                    Some(RunEvent::Job(progress)) => {
                        match &progress.state {
                            JobState::InFlight { model_id, attempt } => {
                                pb.set_message(format!("{} via {} (attempt {})", progress.job_id, model_id, attempt));
                            }
                            JobState::Stored { version, reused, .. } => {
                                let how = if *reused { "reused" } else { "new" };
                                pb.println(format!("  {} -> take {} ({})", progress.job_id, version, how));
                            }
                            JobState::Failed(failure) => {
                                pb.println(format!("  {} failed: {}", progress.job_id, failure));
                            }
                            _ => {}
                        }
                        if progress.state.is_terminal() {
                            pb.inc(1);
                        }
                    }
                    Some(RunEvent::Started { total }) => pb.set_length(total as u64),
                    Some(RunEvent::Finished(_)) => {}
                    None => break,
                },
                _ = tokio::signal::ctrl_c(), if !cancelling => {
                    pb.println("Cancelling after the current line...");
                    run.cancel();
                    cancelling = true;
                }
            }
        }
        pb.finish_with_message("Synthesis complete");

        let summary = run.wait().await?;
        println!(
            "{}: {} stored ({} reused), {} failed, {} skipped",
            stem, summary.stored, summary.reused, summary.failed, summary.skipped
        );

        if !config.unattended {
            choose_takes(&cache, &config.characters, &parsed.jobs).await?;
        }

        let entries = selected_entries(&cache, &config.characters, &parsed.jobs).await?;
        if entries.is_empty() {
            println!("Nothing to export for {}", stem);
        } else {
            let out = Path::new(&config.output_folder).join(format!("{}.tar.gz", stem));
            let count = export_archive(&cache, storage.as_ref(), &entries, &out.to_string_lossy()).await?;
            println!("Exported {} file(s) to {}", count, out.display());
        }

        if summary.state == RunState::Cancelled {
            println!("Stopped as requested.");
            break;
        }

        if !config.unattended && i < scripts.len() - 1 {
            let ans = Confirm::new("Continue to next script?")
                .with_default(true)
                .prompt()?;
            if !ans {
                println!("Stopping as requested.");
                break;
            }
        }
    }

    Ok(())
}

/// Lets the user pick the take to export for every line that has more than
/// one take of its current input.
async fn choose_takes(cache: &AudioCache, characters: &dyn CharacterDirectory, jobs: &[Job]) -> Result<()> {
    for job in jobs {
        let Some(profile) = characters.lookup(&job.character) else {
            continue;
        };
        let base = FingerprintBase::new(&job.character, &profile, &job.text);
        let versions = cache.lookup_versions(&job.id, &base).await?;
        if versions.len() < 2 {
            continue;
        }
        let current = cache.selected_matching(&job.id, &base).await?.map(|v| v.index);

        let mut options = Vec::with_capacity(versions.len());
        for v in &versions {
            let mark = if Some(v.index) == current { " *" } else { "" };
            let length = match cache.read_audio(v).await.and_then(|audio| wav_duration(&audio)) {
                Ok(d) => format!("{:.1}s", d.as_secs_f64()),
                Err(_) => "?s".to_string(),
            };
            options.push(format!(
                "take {} ({}, {}, {}){}",
                v.index,
                v.model_id,
                length,
                v.created_at.format("%Y-%m-%d %H:%M:%S"),
                mark
            ));
        }
        let cursor = versions
            .iter()
            .position(|v| Some(v.index) == current)
            .unwrap_or(versions.len() - 1);

        let choice = Select::new(&format!("Take for {} (\"{}\"):", job.filename, job.text), options)
            .with_starting_cursor(cursor)
            .raw_prompt()?;
        let picked = versions[choice.index].index;
        if Some(picked) != current {
            cache.select_version(&job.id, picked).await?;
        }
    }
    Ok(())
}
