// Copyright (c) 2025 Erick Bourgeois, firestoned
// SPDX-License-Identifier: MIT

//! Unit tests for HAProxy config generation.

#[cfg(test)]
mod tests {
    use super::super::{generate_acl_name, HAProxyManager};
    use crate::config::{ApiSection, CertificatesSection, Domain, HaloydConfig};
    use crate::labels::{ContainerLabels, APP_LABEL_ROLE};
    use crate::registry::{Deployment, DeploymentInstance};
    use std::collections::HashMap;

    fn manager(api_domain: &str) -> HAProxyManager {
        let config = HaloydConfig {
            api: ApiSection {
                domain: api_domain.to_string(),
            },
            certificates: CertificatesSection {
                acme_email: "ops@example.com".to_string(),
            },
        };
        // Client construction is lazy; no daemon is contacted in these tests.
        HAProxyManager::new(
            crate::docker::new_client().unwrap(),
            config,
            std::env::temp_dir(),
            true,
        )
    }

    fn deployment(app: &str, domains: Vec<Domain>, instances: &[(&str, &str)]) -> Deployment {
        Deployment {
            labels: ContainerLabels {
                app_name: app.to_string(),
                deployment_id: "01HZ0000000000000000000001".to_string(),
                health_check_path: "/".to_string(),
                acme_email: "ops@example.com".to_string(),
                port: "8080".to_string(),
                domains,
                role: APP_LABEL_ROLE.to_string(),
            },
            instances: instances
                .iter()
                .map(|(ip, port)| DeploymentInstance {
                    container_id: format!("{app}-{ip}"),
                    ip: (*ip).to_string(),
                    port: (*port).to_string(),
                })
                .collect(),
        }
    }

    fn snapshot(deployments: Vec<Deployment>) -> HashMap<String, Deployment> {
        deployments
            .into_iter()
            .map(|d| (d.labels.app_name.clone(), d))
            .collect()
    }

    #[test]
    fn test_acl_name_generation() {
        assert_eq!(
            generate_acl_name("blog", "blog.example", "canonical"),
            "blog_blog_example_canonical"
        );
        assert_eq!(
            generate_acl_name("api", "www-api.example", "alias"),
            "api_www-api_example_alias"
        );
    }

    #[test]
    fn test_backend_lists_all_instances() {
        let manager = manager("");
        let deployments = snapshot(vec![deployment(
            "blog",
            vec![Domain {
                canonical: "blog.example".to_string(),
                aliases: vec![],
            }],
            &[("172.18.0.5", "8080"), ("172.18.0.6", "8080")],
        )]);

        let config = manager.generate_config(&deployments).unwrap();
        assert!(config.contains("backend blog\n"));
        assert!(config.contains("    server app1 172.18.0.5:8080 check"));
        assert!(config.contains("    server app2 172.18.0.6:8080 check"));
    }

    #[test]
    fn test_canonical_domain_routing() {
        let manager = manager("");
        let deployments = snapshot(vec![deployment(
            "blog",
            vec![Domain {
                canonical: "blog.example".to_string(),
                aliases: vec![],
            }],
            &[("172.18.0.5", "8080")],
        )]);

        let config = manager.generate_config(&deployments).unwrap();

        // Exactly one ACL definition per frontend for the canonical host.
        let acl_line = "acl blog_blog_example_canonical hdr(host) -i blog.example";
        assert_eq!(config.matches(acl_line).count(), 2, "one per frontend");

        assert!(config.contains("    use_backend blog if blog_blog_example_canonical"));
        assert!(config.contains(
            "http-request redirect code 301 location https://blog.example%[path] if blog_blog_example_canonical !is_acme_challenge"
        ));
    }

    #[test]
    fn test_alias_redirects_never_reach_backend() {
        let manager = manager("");
        let deployments = snapshot(vec![deployment(
            "api",
            vec![Domain {
                canonical: "api.example".to_string(),
                aliases: vec!["www-api.example".to_string()],
            }],
            &[("172.18.0.7", "3000")],
        )]);

        let config = manager.generate_config(&deployments).unwrap();

        let alias_acl = "api_www-api_example_alias";
        // Alias ACL on both frontends, both redirecting to the canonical.
        assert_eq!(
            config
                .matches(&format!("acl {alias_acl} hdr(host) -i www-api.example"))
                .count(),
            2
        );
        assert_eq!(
            config
                .matches(&format!(
                    "http-request redirect code 301 location https://api.example%[path] if {alias_acl} !is_acme_challenge"
                ))
                .count(),
            2
        );

        assert!(
            !config.contains(&format!("use_backend api if {alias_acl}")),
            "alias ACLs must never route to the app backend"
        );
        assert!(config.contains("use_backend api if api_api_example_canonical"));
    }

    #[test]
    fn test_multiple_canonicals_joined_with_or() {
        let manager = manager("");
        let deployments = snapshot(vec![deployment(
            "shop",
            vec![
                Domain {
                    canonical: "shop.example".to_string(),
                    aliases: vec![],
                },
                Domain {
                    canonical: "store.example".to_string(),
                    aliases: vec![],
                },
            ],
            &[("172.18.0.8", "8080")],
        )]);

        let config = manager.generate_config(&deployments).unwrap();
        assert!(config.contains(
            "use_backend shop if shop_shop_example_canonical or shop_store_example_canonical"
        ));
    }

    #[test]
    fn test_api_backend_present_when_domain_configured() {
        let manager = manager("haloy.example.com");
        let config = manager.generate_config(&HashMap::new()).unwrap();

        assert!(config.contains("backend haloy_api"));
        assert!(config.contains("acl haloy_api_haloy_example_com_acl hdr(host) -i haloy.example.com"));
        assert!(config.contains("use_backend haloy_api if haloy_api_haloy_example_com_acl"));
        assert!(config.contains("server haloyd haloyd:9999 check"));
        assert!(config.contains("http-request set-header X-Forwarded-For %[src]"));
    }

    #[test]
    fn test_no_api_backend_without_domain() {
        let manager = manager("");
        let config = manager.generate_config(&HashMap::new()).unwrap();
        assert!(!config.contains("backend haloy_api"));
    }

    #[test]
    fn test_acme_challenge_routing_always_present() {
        let manager = manager("");
        let config = manager.generate_config(&HashMap::new()).unwrap();
        assert!(config.contains("acl is_acme_challenge path_beg /.well-known/acme-challenge/"));
        assert!(config.contains("use_backend acme_challenge if is_acme_challenge"));
        assert!(config.contains("server haloyd haloyd:8080"));
    }

    #[test]
    fn test_generation_is_deterministic() {
        let manager = manager("haloy.example.com");
        let deployments = snapshot(vec![
            deployment(
                "blog",
                vec![Domain {
                    canonical: "blog.example".to_string(),
                    aliases: vec!["www.blog.example".to_string()],
                }],
                &[("172.18.0.5", "8080")],
            ),
            deployment(
                "api",
                vec![Domain {
                    canonical: "api.example".to_string(),
                    aliases: vec![],
                }],
                &[("172.18.0.7", "3000")],
            ),
        ]);

        let first = manager.generate_config(&deployments).unwrap();
        let second = manager.generate_config(&deployments).unwrap();
        assert_eq!(
            first, second,
            "identical snapshots must render byte-identical configs"
        );

        // Sorted app order, independent of map iteration order.
        let api_pos = first.find("backend api").unwrap();
        let blog_pos = first.find("backend blog").unwrap();
        assert!(api_pos < blog_pos);
    }
}
