// Copyright (c) 2025 Erick Bourgeois, firestoned
// SPDX-License-Identifier: MIT

//! Unit tests for daemon config loading.

#[cfg(test)]
mod tests {
    use super::super::HaloydConfig;

    #[test]
    fn test_missing_file_yields_default() {
        let dir = tempfile::tempdir().unwrap();
        let config = HaloydConfig::load(dir.path()).unwrap();
        assert!(config.api.domain.is_empty());
        assert!(config.certificates.acme_email.is_empty());
    }

    #[test]
    fn test_load_yaml() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join("haloyd.yaml"),
            "api:\n  domain: haloy.example.com\ncertificates:\n  acmeEmail: ops@example.com\n",
        )
        .unwrap();
        let config = HaloydConfig::load(dir.path()).unwrap();
        assert_eq!(config.api.domain, "haloy.example.com");
        assert_eq!(config.certificates.acme_email, "ops@example.com");
    }

    #[test]
    fn test_load_json() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join("haloyd.json"),
            r#"{"api": {"domain": "haloy.example.com"}}"#,
        )
        .unwrap();
        let config = HaloydConfig::load(dir.path()).unwrap();
        assert_eq!(config.api.domain, "haloy.example.com");
    }

    #[test]
    fn test_load_toml() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join("haloyd.toml"),
            "[certificates]\nacmeEmail = \"ops@example.com\"\n",
        )
        .unwrap();
        let config = HaloydConfig::load(dir.path()).unwrap();
        assert_eq!(config.certificates.acme_email, "ops@example.com");
    }

    #[test]
    fn test_yaml_takes_precedence() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("haloyd.yaml"), "api:\n  domain: from-yaml\n").unwrap();
        std::fs::write(
            dir.path().join("haloyd.json"),
            r#"{"api": {"domain": "from-json"}}"#,
        )
        .unwrap();
        let config = HaloydConfig::load(dir.path()).unwrap();
        assert_eq!(config.api.domain, "from-yaml");
    }

    #[test]
    fn test_invalid_yaml_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("haloyd.yaml"), "api: [not: valid").unwrap();
        assert!(HaloydConfig::load(dir.path()).is_err());
    }
}
