use crate::core::io::Storage;
use crate::core::state::CharacterDirectory;
use crate::services::cache::{AudioCache, FingerprintBase};
use crate::services::script::Job;
use anyhow::{anyhow, Context, Result};
use flate2::write::GzEncoder;
use flate2::Compression;
use log::info;

/// One take to put into an archive.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExportEntry {
    pub job_id: String,
    pub version: u32,
    pub filename: String,
}

/// The selected take of every job, counting only takes made from the job's
/// current character, voice, text and style. Jobs with no such take, or
/// whose character has no voice, are left out.
pub async fn selected_entries(
    cache: &AudioCache,
    characters: &dyn CharacterDirectory,
    jobs: &[Job],
) -> Result<Vec<ExportEntry>> {
    let mut entries = Vec::new();
    for job in jobs {
        let Some(profile) = characters.lookup(&job.character) else {
            continue;
        };
        let base = FingerprintBase::new(&job.character, &profile, &job.text);
        if let Some(version) = cache.selected_matching(&job.id, &base).await? {
            entries.push(ExportEntry {
                job_id: job.id.clone(),
                version: version.index,
                filename: job.filename.clone(),
            });
        }
    }
    Ok(entries)
}

/// Writes a `.tar.gz` with one `<filename>.wav` per entry. Every entry is
/// resolved before anything is written, so a missing take leaves no archive.
pub async fn export_archive(
    cache: &AudioCache,
    storage: &dyn Storage,
    entries: &[ExportEntry],
    output_path: &str,
) -> Result<usize> {
    let mut files = Vec::with_capacity(entries.len());
    for entry in entries {
        let version = cache
            .versions(&entry.job_id)
            .await?
            .into_iter()
            .find(|v| v.index == entry.version)
            .ok_or_else(|| anyhow!("{} has no take {}", entry.job_id, entry.version))?;
        let audio = cache
            .read_audio(&version)
            .await
            .with_context(|| format!("Missing audio for {} take {}", entry.job_id, entry.version))?;
        files.push((format!("{}.wav", entry.filename), audio));
    }

    let mut builder = tar::Builder::new(GzEncoder::new(Vec::new(), Compression::default()));
    for (name, audio) in &files {
        let mut header = tar::Header::new_gnu();
        header.set_size(audio.len() as u64);
        header.set_mode(0o644);
        header.set_cksum();
        builder
            .append_data(&mut header, name, audio.as_slice())
            .with_context(|| format!("Failed to add {} to archive", name))?;
    }
    let archive = builder.into_inner()?.finish()?;

    storage.write(output_path, &archive).await?;
    info!("Exported {} files to {}", files.len(), output_path);
    Ok(files.len())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::clock::SystemClock;
    use crate::core::io::NativeStorage;
    use crate::core::state::{CharacterMap, CharacterProfile};
    use crate::services::script::parse_script;
    use flate2::read::GzDecoder;
    use std::collections::HashMap;
    use std::io::Read;
    use std::sync::Arc;

    #[tokio::test]
    async fn test_export_selected_takes() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let storage = Arc::new(NativeStorage::new());
        let cache = AudioCache::new(
            storage.clone(),
            dir.path().join("cache").to_string_lossy().to_string(),
            Arc::new(SystemClock),
        );
        let profile = CharacterProfile {
            voice: "Kore".to_string(),
            style: None,
        };
        let mut characters = CharacterMap::default();
        characters.insert("Alice", "Kore", None);
        let hi = FingerprintBase::new("Alice", &profile, "Hi");
        let bye = FingerprintBase::new("Alice", &profile, "Bye");

        cache.store("greet", &hi, "m1", b"take one").await?;
        cache.store("greet", &hi, "m1", b"take two").await?;
        cache.select_version("greet", 1).await?;
        cache.store("bye", &bye, "m1", b"farewell").await?;

        let jobs = parse_script("Alice | Hi | greet\nAlice | Bye | bye\nAlice | Later | later").jobs;
        let entries = selected_entries(&cache, &characters, &jobs).await?;
        assert_eq!(entries.len(), 2, "jobs without takes are skipped");

        let out = dir.path().join("output").join("script.tar.gz");
        let count = export_archive(&cache, storage.as_ref(), &entries, out.to_str().unwrap()).await?;
        assert_eq!(count, 2);

        let bytes = std::fs::read(&out)?;
        let mut archive = tar::Archive::new(GzDecoder::new(bytes.as_slice()));
        let mut contents = HashMap::new();
        for file in archive.entries()? {
            let mut file = file?;
            let name = file.path()?.to_string_lossy().to_string();
            let mut data = Vec::new();
            file.read_to_end(&mut data)?;
            contents.insert(name, data);
        }
        assert_eq!(contents.get("greet.wav").map(Vec::as_slice), Some(&b"take one"[..]));
        assert_eq!(contents.get("bye.wav").map(Vec::as_slice), Some(&b"farewell"[..]));
        Ok(())
    }

    #[tokio::test]
    async fn test_takes_of_other_input_are_not_exported() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let cache = AudioCache::new(
            Arc::new(NativeStorage::new()),
            dir.path().join("cache").to_string_lossy().to_string(),
            Arc::new(SystemClock),
        );
        let mut characters = CharacterMap::default();
        characters.insert("Alice", "Kore", None);
        characters.insert("Bob", "Puck", None);

        let first_script = parse_script("Alice | Hello from the first script | intro").jobs;
        let profile = characters.lookup("Alice").unwrap();
        let base = FingerprintBase::new("Alice", &profile, "Hello from the first script");
        cache.store("intro", &base, "m1", b"first script audio").await?;
        assert_eq!(selected_entries(&cache, &characters, &first_script).await?.len(), 1);

        // Same filename, different line, nothing generated for it yet.
        let second_script = parse_script("Bob | A different line | intro").jobs;
        assert!(selected_entries(&cache, &characters, &second_script).await?.is_empty());

        // A character without a voice has nothing to export either.
        let unknown = parse_script("Carol | Hello from the first script | intro").jobs;
        assert!(selected_entries(&cache, &characters, &unknown).await?.is_empty());
        Ok(())
    }

    #[tokio::test]
    async fn test_missing_take_writes_nothing() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let storage = Arc::new(NativeStorage::new());
        let cache = AudioCache::new(
            storage.clone(),
            dir.path().join("cache").to_string_lossy().to_string(),
            Arc::new(SystemClock),
        );

        let entries = vec![ExportEntry {
            job_id: "greet".to_string(),
            version: 3,
            filename: "greet".to_string(),
        }];
        let out = dir.path().join("out.tar.gz");
        assert!(export_archive(&cache, storage.as_ref(), &entries, out.to_str().unwrap())
            .await
            .is_err());
        assert!(!out.exists());
        Ok(())
    }
}
