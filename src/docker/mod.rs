// Copyright (c) 2025 Erick Bourgeois, firestoned
// SPDX-License-Identifier: MIT

//! Typed facade over the Docker Engine API.
//!
//! Everything the daemon asks of the container runtime goes through this
//! module: container lifecycle, image management, command execution and the
//! lifecycle event stream. Upper layers never touch raw API options.

mod container;
mod events;
mod image;

pub use container::{
    container_network_ip, exec_in_container, get_app_containers, health_check_container,
    remove_containers, run_container, stop_containers, ContainerRunResult, ExecOutput,
};
pub use events::{listen_for_container_events, ContainerEvent};
pub use image::{
    ensure_image_up_to_date, load_image_from_tar, prune_images, remove_images, tag_image,
};

use anyhow::{Context, Result};
use bollard::Docker;

/// Connect to the local Docker daemon using the default socket.
///
/// # Errors
///
/// Returns an error when the daemon socket is unreachable.
pub fn new_client() -> Result<Docker> {
    Docker::connect_with_local_defaults().context("failed to connect to the Docker daemon")
}
