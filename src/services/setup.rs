use crate::core::config::Config;
use crate::core::state::{CharacterDirectory, GEMINI_VOICES};
use crate::services::script::Job;
use anyhow::Result;
use inquire::{Select, Text};
use log::info;
use std::collections::BTreeSet;
use std::path::Path;

/// Characters used by `jobs` that have no voice yet, in name order.
pub fn missing_characters(config: &Config, jobs: &[Job]) -> Vec<String> {
    jobs.iter()
        .map(|job| job.character.as_str())
        .filter(|name| config.characters.lookup(name).is_none())
        .collect::<BTreeSet<_>>()
        .into_iter()
        .map(str::to_string)
        .collect()
}

/// Asks for a voice (and optional style) for every character the script
/// uses but the config lacks, then saves the config. Characters left
/// unassigned fail at scheduling time with an unknown-character error.
pub fn run_setup(config: &mut Config, jobs: &[Job], config_path: &Path) -> Result<()> {
    let missing = missing_characters(config, jobs);
    if missing.is_empty() {
        return Ok(());
    }
    if config.unattended {
        info!("No voice configured for: {}", missing.join(", "));
        return Ok(());
    }

    let mut needs_save = false;
    for name in &missing {
        let mut options: Vec<&str> = vec![SKIP_OPTION];
        options.extend_from_slice(GEMINI_VOICES);

        let choice = Select::new(&format!("Select voice for {}:", name), options)
            .with_page_size(12)
            .prompt()?;
        if choice == SKIP_OPTION {
            continue;
        }

        let style = Text::new(&format!("Style instruction for {} (optional):", name)).prompt()?;
        let style = style.trim();
        config
            .characters
            .insert(name.as_str(), choice, (!style.is_empty()).then_some(style));
        needs_save = true;
    }

    if needs_save {
        config.save(config_path)?;
        println!("Character voices saved to {}", config_path.display());
    }
    Ok(())
}

const SKIP_OPTION: &str = "(skip)";
