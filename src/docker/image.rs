// Copyright (c) 2025 Erick Bourgeois, firestoned
// SPDX-License-Identifier: MIT

//! Image management: pull-if-outdated, tagging, pruning and tar loading.

use crate::config::Image;
use crate::labels::LABEL_DEPLOYMENT_ID;
use crate::logging::DeploymentLogger;
use anyhow::{bail, Context, Result};
use bollard::auth::DockerCredentials;
use bollard::image::{
    CreateImageOptions, ImportImageOptions, ListImagesOptions, RemoveImageOptions, TagImageOptions,
};
use bollard::Docker;
use futures::StreamExt;
use std::collections::{HashMap, HashSet};
use std::path::Path;

/// Registry credentials for an image, when configured.
fn registry_credentials(image: &Image) -> Option<DockerCredentials> {
    let auth = image.registry_auth.as_ref()?;
    Some(DockerCredentials {
        username: Some(auth.username.clone()),
        password: Some(auth.password.clone()),
        serveraddress: Some(image.registry_server()),
        ..Default::default()
    })
}

/// Make sure the image for a deployment is present and current.
///
/// Images uploaded to the host are never pulled; their local presence is
/// asserted instead. Otherwise the local repo digests are compared against
/// the registry's manifest digest and the image is pulled only on mismatch.
/// An unreachable registry falls back to the local image.
///
/// # Errors
///
/// Returns an error when an uploaded image is missing locally or a required
/// pull fails.
pub async fn ensure_image_up_to_date(
    docker: &Docker,
    logger: &DeploymentLogger,
    image: &Image,
) -> Result<()> {
    let image_ref = image.image_ref();

    let local = docker.inspect_image(&image_ref).await.ok();

    if image.uploaded_to_host() {
        if local.is_none() {
            bail!("uploaded image '{image_ref}' not found");
        }
        logger.debug(format!("Using local image {image_ref}"));
        return Ok(());
    }

    let credentials = registry_credentials(image);

    if let Some(local) = &local {
        match docker
            .inspect_registry_image(&image_ref, credentials.clone())
            .await
        {
            Ok(remote) => {
                let remote_digest = remote.descriptor.digest.unwrap_or_default();
                let up_to_date = !remote_digest.is_empty()
                    && local.repo_digests.as_ref().is_some_and(|digests| {
                        digests
                            .iter()
                            .any(|rd| rd.ends_with(&format!("@{remote_digest}")))
                    });
                if up_to_date {
                    logger.debug(format!("Registry image is up to date: {image_ref}"));
                    return Ok(());
                }
                logger.debug(format!("Local image outdated, pulling from registry: {image_ref}"));
            }
            Err(err) => {
                tracing::debug!(
                    image = %image_ref,
                    error = %err,
                    "Failed to check remote registry, using local image"
                );
                return Ok(());
            }
        }
    }

    logger.debug(format!("Pulling image {image_ref}..."));

    let options = CreateImageOptions {
        from_image: image_ref.clone(),
        ..Default::default()
    };
    let mut pull = docker.create_image(Some(options), None, credentials);
    while let Some(progress) = pull.next().await {
        progress.with_context(|| format!("failed to pull {image_ref}"))?;
    }

    logger.debug(format!("Successfully pulled image {image_ref}"));
    Ok(())
}

/// Tag `src_ref` as `<app>:<deploymentID>` and return the new reference.
/// A no-op when source and destination already match.
///
/// # Errors
///
/// Returns an error when the tag call fails.
pub async fn tag_image(
    docker: &Docker,
    src_ref: &str,
    app_name: &str,
    deployment_id: &str,
) -> Result<String> {
    let dst_ref = format!("{app_name}:{deployment_id}");

    if src_ref == dst_ref {
        return Ok(dst_ref);
    }

    docker
        .tag_image(
            src_ref,
            Some(TagImageOptions {
                repo: app_name.to_string(),
                tag: deployment_id.to_string(),
            }),
        )
        .await
        .with_context(|| format!("failed to tag image {src_ref} as {dst_ref}"))?;

    Ok(dst_ref)
}

/// Remove dangling images; returns the bytes reclaimed.
///
/// # Errors
///
/// Returns an error when the prune call fails.
pub async fn prune_images(docker: &Docker) -> Result<u64> {
    let report = docker
        .prune_images(None::<bollard::image::PruneImagesOptions<String>>)
        .await
        .context("failed to prune images")?;

    let deleted = report.images_deleted.as_ref().map_or(0, Vec::len);
    let reclaimed = u64::try_from(report.space_reclaimed.unwrap_or(0)).unwrap_or(0);
    if deleted > 0 {
        tracing::info!(count = deleted, bytes_reclaimed = reclaimed, "Pruned images");
    }
    Ok(reclaimed)
}

/// Remove surplus `<app>:<deploymentID>` image tags, keeping the newest
/// `keep_count` plus any tag whose image backs a running container.
///
/// Tags are ordered by deployment id descending; `latest` and the ignored
/// deployment's tag are never touched. For in-use images, surplus tags are
/// only removed while at least one tag of that image survives.
///
/// # Errors
///
/// Returns an error when listing images or containers fails. Individual
/// tag removals are best-effort and logged.
pub async fn remove_images(
    docker: &Docker,
    app_name: &str,
    ignore_deployment_id: &str,
    keep_count: usize,
) -> Result<()> {
    let images = docker
        .list_images(Some(ListImagesOptions {
            filters: HashMap::from([(
                "reference".to_string(),
                vec![format!("{app_name}:*")],
            )]),
            ..Default::default()
        }))
        .await
        .with_context(|| format!("failed to list images for {app_name}"))?;

    let containers = super::container::get_app_containers(docker, false, Some(app_name)).await?;
    let in_use_image_ids: HashSet<String> = containers
        .iter()
        .filter_map(|c| c.image_id.clone())
        .filter(|id| !id.is_empty())
        .collect();

    struct Candidate {
        tag: String,
        deployment_id: String,
        image_id: String,
    }

    let mut candidates: Vec<Candidate> = Vec::new();
    for image in &images {
        for tag in &image.repo_tags {
            if tag.ends_with(":latest")
                || tag.ends_with(&format!(":{ignore_deployment_id}"))
                || !tag.starts_with(&format!("{app_name}:"))
            {
                continue;
            }
            let Some((_, deployment_id)) = tag.split_once(':') else {
                continue;
            };
            candidates.push(Candidate {
                tag: tag.clone(),
                deployment_id: deployment_id.to_string(),
                image_id: image.id.clone(),
            });
        }
    }

    // Newest first; lexicographic order on deployment ids is chronological.
    candidates.sort_by(|a, b| b.deployment_id.cmp(&a.deployment_id));

    let mut keep_tags: HashSet<&str> = HashSet::new();
    let mut keep_image_ids: HashSet<&str> = HashSet::new();
    for candidate in candidates.iter().take(keep_count) {
        keep_tags.insert(&candidate.tag);
        keep_image_ids.insert(&candidate.image_id);
    }

    for candidate in &candidates {
        if keep_tags.contains(candidate.tag.as_str()) {
            continue;
        }
        let in_use = in_use_image_ids.contains(&candidate.image_id);
        let id_kept = keep_image_ids.contains(candidate.image_id.as_str());
        if in_use && !id_kept {
            // Leave the last tag pointing at an image a running container
            // still references.
            continue;
        }

        match docker
            .remove_image(
                &candidate.tag,
                Some(RemoveImageOptions {
                    force: true,
                    noprune: false,
                }),
                None,
            )
            .await
        {
            Ok(_) => tracing::debug!(tag = %candidate.tag, "Removed image tag"),
            Err(err) => {
                tracing::error!(tag = %candidate.tag, error = %err, "Failed to remove image tag");
            }
        }
    }

    Ok(())
}

/// Load an image from a tar archive into the runtime.
///
/// # Errors
///
/// Returns an error when the file cannot be read or the load stream reports
/// a failure.
pub async fn load_image_from_tar(docker: &Docker, tar_path: &Path) -> Result<()> {
    let data = tokio::fs::read(tar_path)
        .await
        .with_context(|| format!("failed to open tar file {}", tar_path.display()))?;

    let body = futures::stream::once(async move { bytes::Bytes::from(data) });
    let mut load = docker.import_image_stream(ImportImageOptions { quiet: false }, body, None);

    let mut loaded_any = false;
    while let Some(progress) = load.next().await {
        let info = progress.context("failed to load image")?;
        if let Some(stream) = info.stream {
            if stream.starts_with("Loaded image") {
                loaded_any = true;
            }
            tracing::debug!(message = %stream.trim_end(), "Image load progress");
        }
    }

    if !loaded_any {
        bail!("no images were loaded from tar file");
    }
    Ok(())
}

/// Verify the image architecture matches the host, normalizing the common
/// aliases (`x86_64`/`amd64`, `aarch64`/`arm64`, `armv7l`/`arm`).
///
/// # Errors
///
/// Returns an error when the platforms differ or either side cannot be
/// inspected.
pub(super) async fn check_image_platform(docker: &Docker, image_ref: &str) -> Result<()> {
    let image = docker
        .inspect_image(image_ref)
        .await
        .with_context(|| format!("failed to inspect image {image_ref}"))?;

    let info = docker.info().await.context("failed to get host info")?;

    let image_platform = normalize_platform(image.architecture.as_deref().unwrap_or_default());
    let host_platform = normalize_platform(info.architecture.as_deref().unwrap_or_default());

    if image_platform != host_platform {
        bail!(
            "image built for {image_platform} but host is {host_platform}. \
             Rebuild the image for the correct platform or use docker buildx with --platform flag"
        );
    }

    Ok(())
}

fn normalize_platform(platform: &str) -> String {
    match platform {
        "x86_64" => "amd64".to_string(),
        "aarch64" => "arm64".to_string(),
        "armv7l" => "arm".to_string(),
        other => other.to_string(),
    }
}

#[cfg(test)]
#[path = "image_tests.rs"]
mod image_tests;
