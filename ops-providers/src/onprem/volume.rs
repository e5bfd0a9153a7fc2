//! Local volumes: raw nanos filesystems at `<volumes>/<label>:<uuid>.raw`.

use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use ops_common::{Config, NanosVolume, OpsError};
use tracing::info;
use uuid::Uuid;

use crate::builder::{quote, MkfsCommand, MkfsImageBuilder};

pub const VOLUME_DELIMITER: char = ':';
/// mkfs size when neither the request nor the config gives one (1 MB).
pub const MINIMUM_VOLUME_SIZE: &str = "1048576";

pub fn volume_file_name(label: &str, id: &str) -> String {
    format!("{label}{VOLUME_DELIMITER}{id}.raw")
}

/// `(label, id)` of a volume file name.
pub fn parse_volume_file(name: &str) -> Option<(&str, &str)> {
    let stem = name.strip_suffix(".raw").unwrap_or(name);
    let (label, id) = stem.split_once(VOLUME_DELIMITER)?;
    (!label.is_empty() && !id.is_empty()).then_some((label, id))
}

pub fn bytes_to_human(bytes: u64) -> String {
    const UNITS: [&str; 5] = ["B", "KB", "MB", "GB", "TB"];
    let mut value = bytes as f64;
    let mut unit = 0;
    while value >= 1024.0 && unit < UNITS.len() - 1 {
        value /= 1024.0;
        unit += 1;
    }
    if unit == 0 {
        format!("{bytes}B")
    } else {
        format!("{value:.1}{}", UNITS[unit])
    }
}

/// Manifest whose root mirrors the host directory `dir`.
pub fn render_tree_manifest(dir: &Path) -> Result<String> {
    fn children(dir: &Path) -> Result<String> {
        let mut entries: Vec<_> = std::fs::read_dir(dir)
            .with_context(|| format!("unable to read {}", dir.display()))?
            .collect::<std::io::Result<_>>()?;
        entries.sort_by_key(|e| e.file_name());

        let mut out = Vec::new();
        for entry in entries {
            let name = quote(&entry.file_name().to_string_lossy());
            let path = entry.path();
            if entry.file_type()?.is_dir() {
                out.push(format!("{name}:(children:({}))", children(&path)?));
            } else {
                out.push(format!(
                    "{name}:(contents:(host:{}))",
                    quote(&path.to_string_lossy())
                ));
            }
        }
        Ok(out.join(" "))
    }
    Ok(format!("(children:({}))", children(dir)?))
}

fn to_volume(dir: &Path, file_name: &str, meta: &std::fs::Metadata) -> Option<NanosVolume> {
    let (label, id) = parse_volume_file(file_name)?;
    Some(NanosVolume {
        id: id.to_string(),
        name: label.to_string(),
        label: label.to_string(),
        size: bytes_to_human(meta.len()),
        path: dir.join(file_name).to_string_lossy().into_owned(),
        created_at: meta.modified().ok().map(DateTime::<Utc>::from),
        attached_to: String::new(),
    })
}

pub fn list_volumes(dir: &Path) -> Result<Vec<NanosVolume>> {
    let entries = match std::fs::read_dir(dir) {
        Ok(e) => e,
        Err(e) if e.kind() == ErrorKind::NotFound => return Ok(vec![]),
        Err(e) => return Err(e).with_context(|| format!("unable to read {}", dir.display())),
    };
    let mut vols = Vec::new();
    for entry in entries {
        let entry = entry?;
        let meta = entry.metadata()?;
        if meta.is_dir() {
            continue;
        }
        if let Some(v) = to_volume(dir, &entry.file_name().to_string_lossy(), &meta) {
            vols.push(v);
        }
    }
    vols.sort_by(|a, b| a.label.cmp(&b.label));
    Ok(vols)
}

/// Volume whose label or id is `query`.
pub fn find_volume(dir: &Path, query: &str) -> Result<NanosVolume> {
    list_volumes(dir)?
        .into_iter()
        .find(|v| v.label == query || v.id == query)
        .ok_or_else(|| OpsError::VolumeNotFound(query.to_string()).into())
}

pub async fn create_volume(
    config: &Config,
    name: &str,
    data: Option<&Path>,
    size: Option<&str>,
) -> Result<NanosVolume> {
    let dir = config.volumes_dir();
    tokio::fs::create_dir_all(&dir).await?;

    let staging = dir.join(format!("{name}.staging"));
    let mut cmd = MkfsCommand::new(MkfsImageBuilder::mkfs_path(config)?, &staging);
    cmd.label = Some(name.to_string());
    cmd.size = Some(
        size.map(str::to_string)
            .or_else(|| (!config.base_volume_sz.is_empty()).then(|| config.base_volume_sz.clone()))
            .unwrap_or_else(|| MINIMUM_VOLUME_SIZE.to_string()),
    );
    let manifest = match data {
        Some(data) => render_tree_manifest(data)?,
        None => {
            cmd.empty = true;
            "(children:())".to_string()
        }
    };

    let reported = cmd
        .run(&manifest)
        .await
        .with_context(|| format!("unable to create volume {name}"))?;
    let id = reported.unwrap_or_else(|| Uuid::new_v4().to_string());

    let file_name = volume_file_name(name, &id);
    let path = dir.join(&file_name);
    tokio::fs::rename(&staging, &path).await?;
    info!("[onprem] created volume {} at {}", name, path.display());

    let meta = tokio::fs::metadata(&path).await?;
    to_volume(&dir, &file_name, &meta).ok_or_else(|| anyhow::anyhow!("invalid volume name {name}"))
}

pub async fn delete_volume(dir: &Path, query: &str) -> Result<()> {
    let vol = find_volume(dir, query)?;
    tokio::fs::remove_file(&vol.path)
        .await
        .with_context(|| format!("unable to delete volume {query}"))?;
    info!("[onprem] deleted volume {}", vol.label);
    Ok(())
}

/// Disk paths for `label:/mount/point` entries of the run configuration.
pub fn resolve_mounts(dir: &Path, mounts: &[String]) -> Result<Vec<PathBuf>> {
    mounts
        .iter()
        .map(|m| {
            let label = m.split_once(':').map(|(l, _)| l).unwrap_or(m);
            find_volume(dir, label).map(|v| PathBuf::from(v.path))
        })
        .collect()
}
