//! Remote model galleries.
//!
//! A gallery is a named remote JSON index of installable models. Each entry
//! carries a file manifest (download URI + SHA-256 per file) and an optional
//! backend-config overlay applied when the model is materialized locally.

mod installer;

pub use installer::{apply_model, GalleryInstaller, InstallJob, JobProgress};

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::config::BackendConfig;
use crate::error::{Error, Result};

/// Named remote index.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Gallery {
    pub name: String,
    pub url: String,
    /// Higher priority wins when a bare model name matches several galleries.
    #[serde(default)]
    pub priority: i32,
}

/// One installable model inside a gallery index.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GalleryModel {
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub license: String,
    #[serde(default)]
    pub files: Vec<ManifestFile>,
    /// Backend-config defaults written alongside the downloaded files.
    #[serde(default)]
    pub config: Option<BackendConfig>,
    #[serde(default)]
    pub tags: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ManifestFile {
    pub filename: String,
    pub uri: String,
    pub sha256: String,
}

/// A gallery entry decorated with its source and install state.
#[derive(Debug, Clone, Serialize)]
pub struct AvailableModel {
    pub gallery: String,
    pub name: String,
    pub description: String,
    pub installed: bool,
}

/// Fetch and parse one gallery index.
pub async fn fetch_index(client: &reqwest::Client, gallery: &Gallery) -> Result<Vec<GalleryModel>> {
    let response = client.get(&gallery.url).send().await?;
    if !response.status().is_success() {
        return Err(Error::Internal(format!(
            "gallery '{}' returned HTTP {}",
            gallery.name,
            response.status()
        )));
    }
    Ok(response.json().await?)
}

/// Resolve a model reference against the gallery list.
///
/// References are either `gallery@model` or a bare model name searched across
/// all galleries in descending priority order.
pub async fn resolve_model(
    client: &reqwest::Client,
    galleries: &[Gallery],
    reference: &str,
) -> Result<(Gallery, GalleryModel)> {
    let (gallery_name, model_name) = match reference.split_once('@') {
        Some((g, m)) => (Some(g), m),
        None => (None, reference),
    };

    let mut candidates: Vec<&Gallery> = galleries
        .iter()
        .filter(|g| gallery_name.map(|n| n == g.name).unwrap_or(true))
        .collect();
    candidates.sort_by_key(|g| std::cmp::Reverse(g.priority));

    for gallery in candidates {
        let index = fetch_index(client, gallery).await?;
        if let Some(model) = index.into_iter().find(|m| m.name == model_name) {
            return Ok((gallery.clone(), model));
        }
    }
    Err(Error::GalleryModelNotFound(reference.to_string()))
}

/// Every model across all galleries, marked installed when its config file
/// is already present in the models directory.
pub async fn list_available(
    client: &reqwest::Client,
    galleries: &[Gallery],
    models_path: &Path,
) -> Result<Vec<AvailableModel>> {
    let mut out = Vec::new();
    for gallery in galleries {
        for model in fetch_index(client, gallery).await? {
            let installed = models_path.join(format!("{}.yaml", model.name)).exists();
            out.push(AvailableModel {
                gallery: gallery.name.clone(),
                name: model.name,
                description: model.description,
                installed,
            });
        }
    }
    Ok(out)
}

#[cfg(test)]
pub(crate) mod testserver;
