// Copyright (c) 2025 Erick Bourgeois, firestoned
// SPDX-License-Identifier: MIT

//! Small shared helpers: identifier sanitization, log-safe container ids,
//! domain and email validation.

use anyhow::{bail, Result};

/// Sanitize a string for use as a safe identifier.
///
/// Suitable for HAProxy identifiers (backend and ACL names), Docker container
/// names, and filenames (extensions added separately). Allows alphanumerics,
/// hyphens and underscores; any run of other characters collapses into a
/// single underscore.
///
/// # Examples
///
/// ```
/// use haloyd::helpers::sanitize_string;
///
/// assert_eq!(sanitize_string("ops@example.com"), "ops_example_com");
/// assert_eq!(sanitize_string("blog.example"), "blog_example");
/// ```
#[must_use]
pub fn sanitize_string(input: &str) -> String {
    let mut result = String::with_capacity(input.len());
    let mut last_was_underscore = false;

    for c in input.chars() {
        if c.is_ascii_alphanumeric() || c == '-' || c == '_' {
            result.push(c);
            last_was_underscore = false;
        } else if !last_was_underscore {
            result.push('_');
            last_was_underscore = true;
        }
    }
    result
}

/// Truncate a container id to 12 characters for log output.
#[must_use]
pub fn safe_id_prefix(id: &str) -> &str {
    if id.len() > 12 {
        &id[..12]
    } else {
        id
    }
}

/// Check whether a string looks like a valid email address.
#[must_use]
pub fn is_valid_email(email: &str) -> bool {
    let Some((local, domain)) = email.split_once('@') else {
        return false;
    };
    if local.is_empty() || domain.is_empty() {
        return false;
    }
    if !local
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || "._%+-".contains(c))
    {
        return false;
    }
    // Domain part must contain a dot and a TLD of at least two letters.
    let Some((_, tld)) = domain.rsplit_once('.') else {
        return false;
    };
    if tld.len() < 2 || !tld.chars().all(|c| c.is_ascii_alphabetic()) {
        return false;
    }
    domain
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '.' || c == '-')
}

/// Validate a DNS domain name.
///
/// # Errors
///
/// Returns an error describing the first violated rule: overall length,
/// leading/trailing separators, label count, per-label syntax, or TLD syntax.
pub fn is_valid_domain(domain: &str) -> Result<()> {
    if domain.is_empty() || domain.len() > 253 {
        bail!("domain length must be between 1 and 253 characters");
    }

    if domain.starts_with('.') || domain.ends_with('.') {
        bail!("domain cannot start or end with a dot");
    }

    if domain.starts_with('-') || domain.ends_with('-') {
        bail!("domain cannot start or end with a hyphen");
    }

    let labels: Vec<&str> = domain.split('.').collect();
    if labels.len() < 2 {
        bail!("domain must have at least two labels (e.g., example.com)");
    }

    for (i, label) in labels.iter().enumerate() {
        if i == labels.len() - 1 {
            validate_tld(label)?;
        } else {
            validate_domain_label(label)?;
        }
    }

    Ok(())
}

fn validate_domain_label(label: &str) -> Result<()> {
    if label.is_empty() || label.len() > 63 {
        bail!("invalid label '{label}': length must be between 1 and 63 characters");
    }

    if label.starts_with('-') || label.ends_with('-') {
        bail!("invalid label '{label}': label cannot start or end with hyphen");
    }

    if let Some(c) = label
        .chars()
        .find(|c| !c.is_ascii_alphanumeric() && *c != '-')
    {
        bail!("invalid label '{label}': label contains invalid character: {c}");
    }

    Ok(())
}

fn validate_tld(tld: &str) -> Result<()> {
    // ICANN policy: at least two characters. Newer TLDs may contain digits.
    if tld.len() < 2 || tld.len() > 63 {
        bail!("invalid TLD '{tld}': length must be between 2 and 63 characters");
    }

    if tld.starts_with('-') || tld.ends_with('-') {
        bail!("invalid TLD '{tld}': TLD cannot start or end with hyphen");
    }

    if let Some(c) = tld.chars().find(|c| !c.is_ascii_alphanumeric()) {
        bail!("invalid TLD '{tld}': TLD contains invalid character: {c}");
    }

    Ok(())
}

/// Validate an application name: `[A-Za-z0-9][A-Za-z0-9_-]*`.
///
/// # Errors
///
/// Returns an error when the name is empty, starts with a separator, or
/// contains characters outside the allowed set.
pub fn is_valid_app_name(name: &str) -> Result<()> {
    let mut chars = name.chars();
    match chars.next() {
        None => bail!("app name cannot be empty"),
        Some(c) if !c.is_ascii_alphanumeric() => {
            bail!("app name must start with an alphanumeric character")
        }
        Some(_) => {}
    }
    if let Some(c) = chars.find(|c| !c.is_ascii_alphanumeric() && *c != '_' && *c != '-') {
        bail!("app name contains invalid character: {c}");
    }
    Ok(())
}

#[cfg(test)]
#[path = "helpers_tests.rs"]
mod helpers_tests;
