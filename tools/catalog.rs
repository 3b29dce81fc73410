mod config;

use std::fs::{self, File};
use std::io::{BufWriter, Write};
use std::path::Path;

use library::{artist_album_date, Collection, Library, LibraryRead, LoadOptions};
use mirror::{sync_mirror, ExternalEncoder, MirrorOptions};
use tracing::info;
use tracing_subscriber::EnvFilter;

use crate::config::{config_path_from_env, load_or_create_config, resolve_optional};

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into());
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let config_path = config_path_from_env();
    let (config, created) = load_or_create_config(&config_path)?;
    if created {
        info!("Wrote default config to {:?}", config_path);
    }

    let music_root = resolve_optional(&config_path, &config.music_root)
        .ok_or("music root not configured")?;
    let mut options = LoadOptions::new(music_root.clone());
    options.workers = config.scan_workers;
    options.snapshot = resolve_optional(&config_path, &config.snapshot_path);
    options.rescan = config.rescan;
    options.strict_checksums = config.strict_checksums;

    let library = Library::load_or_scan(&options)
        .map_err(|err| format!("failed to load library from {:?}: {}", music_root, err))?;

    let collection = artist_album_date(&library);
    if let Some(path) = resolve_optional(&config_path, &config.collection_path) {
        write_collection(&path, &collection)?;
        info!("Wrote {} collection to {:?}", collection.name, path);
    }

    if config.sync_mobile {
        let mobile_root = resolve_optional(&config_path, &config.mobile_root)
            .ok_or("sync_mobile is set but mobile_root is not configured")?;
        let encoder = ExternalEncoder {
            program: config.encoder.program.clone(),
            bitrate_kbps: config.encoder.bitrate_kbps,
        };
        let report = sync_mirror(
            &music_root,
            &library,
            &mobile_root,
            &encoder,
            &MirrorOptions::default(),
        )
        .map_err(|err| format!("failed to sync {:?}: {}", mobile_root, err))?;
        info!(
            "Mirror sync: {} deleted, {} copied, {} transcoded, {} already present",
            report.deleted_files, report.copied, report.transcoded, report.skipped
        );
    }

    info!(
        "Catalog ready: {} songs, {} pics, {} artists",
        library.song_count(),
        library.art_count(),
        collection.children.len()
    );
    Ok(())
}

fn write_collection(path: &Path, collection: &Collection) -> Result<(), Box<dyn std::error::Error>> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent)?;
        }
    }
    let mut writer = BufWriter::new(File::create(path)?);
    serde_json::to_writer_pretty(&mut writer, collection)?;
    writer.flush()?;
    Ok(())
}
