// Copyright (c) 2025 Erick Bourgeois, firestoned
// SPDX-License-Identifier: MIT

//! Shared constants: names, ports, environment variables, paths and modes.

/// Daemon version reported by the API.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// HAProxy release line the managed proxy container runs.
pub const HAPROXY_VERSION: &str = "3.2";

// ============================================================================
// Container and network names
// ============================================================================

/// Container name of the daemon itself (used as a backend target in the
/// generated proxy configuration).
pub const HALOYD_CONTAINER_NAME: &str = "haloyd";

/// Container name of the managed HAProxy instance.
pub const HAPROXY_CONTAINER_NAME: &str = "haloy-haproxy";

/// The shared Docker network all managed containers must join.
pub const DOCKER_NETWORK: &str = "haloy";

// ============================================================================
// Defaults
// ============================================================================

/// Deployment records kept per application when no history count is set.
pub const DEFAULT_DEPLOYMENTS_TO_KEEP: i64 = 6;

/// Default health check path probed when none is configured.
pub const DEFAULT_HEALTH_CHECK_PATH: &str = "/";

/// Default container port when none is configured.
pub const DEFAULT_CONTAINER_PORT: &str = "8080";

/// Default replica count.
pub const DEFAULT_REPLICAS: u32 = 1;

/// Port the ACME HTTP-01 challenge responder binds to. HAProxy routes
/// `/.well-known/acme-challenge/*` requests here.
pub const CERTIFICATES_HTTP_PROVIDER_PORT: u16 = 8080;

/// Port the API server listens on.
pub const API_SERVER_PORT: u16 = 9999;

// ============================================================================
// Environment variables
// ============================================================================

/// Bearer token the API requires. Must be set for the daemon to start.
pub const ENV_VAR_API_TOKEN: &str = "HALOY_API_TOKEN";

/// Replica index, set by the daemon on every container it launches.
pub const ENV_VAR_REPLICA_ID: &str = "HALOY_REPLICA_ID";

/// Overrides the default data directory.
pub const ENV_VAR_DATA_DIR: &str = "HALOY_DATA_DIR";

/// Overrides the default config directory.
pub const ENV_VAR_CONFIG_DIR: &str = "HALOY_CONFIG_DIR";

/// Enables debug mode: proxy config is never written and the ACME staging
/// directory is used.
pub const ENV_VAR_DEBUG: &str = "HALOY_DEBUG";

/// Set to "false" to use per-user directories instead of the system paths.
pub const ENV_VAR_SYSTEM_INSTALL: &str = "HALOY_SYSTEM_INSTALL";

// ============================================================================
// Directories
// ============================================================================

pub const SYSTEM_DATA_DIR: &str = "/var/lib/haloy";
pub const SYSTEM_CONFIG_DIR: &str = "/etc/haloy";
pub const USER_DATA_DIR_SUFFIX: &str = ".local/share/haloy";
pub const USER_CONFIG_DIR_SUFFIX: &str = ".config/haloy";

/// Subdirectory of the data dir holding the embedded database.
pub const DB_DIR: &str = "db";

/// Subdirectory of the data dir holding the generated proxy configuration.
pub const HAPROXY_CONFIG_DIR: &str = "haproxy-config";

/// Subdirectory of the data dir holding certificate PEM bundles.
pub const CERT_STORAGE_DIR: &str = "cert-storage";

// ============================================================================
// File names
// ============================================================================

pub const HALOYD_CONFIG_FILE_STEM: &str = "haloyd";
pub const HAPROXY_CONFIG_FILE_NAME: &str = "haproxy.cfg";
pub const DB_FILE_NAME: &str = "haloy.db";

// ============================================================================
// File and directory permissions
// ============================================================================

/// Secrets: keys, PEM bundles.
pub const MODE_FILE_SECRET: u32 = 0o600;

/// Non-secret configuration files.
pub const MODE_FILE_DEFAULT: u32 = 0o644;

/// Private directories (cert storage, accounts).
pub const MODE_DIR_PRIVATE: u32 = 0o700;
