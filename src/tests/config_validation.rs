#[cfg(test)]
mod tests {
    use std::io::Write;

    use jsonwebtoken::Algorithm;
    use serial_test::serial;

    use crate::config::client::{KeyFormat, SecretValue};
    use crate::config::proc_loader::{expand_env_vars, file_to_config, parse_config};
    use crate::config::settings::LogFormat;
    use crate::tests::common::RSA_PRIVATE_PEM;

    fn backend_yaml(extra: &str) -> String {
        format!(
            r#"
settings:
  safety_margin_seconds: 30
  logging:
    level: debug
    format: json
client:
  client_id: backend-client
  issuer: https://ehr.test/auth
  fhir_base_url: https://ehr.test/fhir/r4
  scope: system/*.read
  backend:
    private_key:
      path: {}
{}
"#,
            RSA_PRIVATE_PEM, extra
        )
    }

    #[tokio::test]
    async fn backend_config_is_parsed_with_defaults() {
        let config = parse_config(backend_yaml("")).await.unwrap();

        assert_eq!(config.settings.safety_margin_seconds(), 30);
        assert_eq!(config.settings.http_timeout_ms(), 30_000);
        let logging = config.settings.logging.unwrap();
        assert_eq!(logging.level, "debug");
        assert_eq!(logging.format, LogFormat::Json);

        let backend = config.client.backend.unwrap();
        assert_eq!(backend.algorithm, Algorithm::RS384);
        assert_eq!(backend.jwt_lifetime_seconds, 300);
        assert_eq!(backend.key_format, KeyFormat::Pem);
        assert!(matches!(backend.private_key, SecretValue::FromFile { .. }));
    }

    #[tokio::test]
    #[should_panic(expected = "config is not valid")]
    async fn symmetric_algorithm_is_rejected() {
        let yaml = backend_yaml("    algorithm: HS256");
        parse_config(yaml).await.unwrap();
    }

    #[tokio::test]
    async fn every_problem_is_reported_at_once() {
        let yaml = backend_yaml(
            "    jwt_lifetime_seconds: 600\n    jwt_issuer: someone-else\n    jwks_url: ftp://keys.test/jwks\n    key_format: jwk",
        );
        let err = parse_config(yaml).await.unwrap_err().to_string();

        assert!(err.contains("total errors:4"), "got {}", err);
        assert!(err.contains("jwt_lifetime_seconds (600)"));
        assert!(err.contains("must equal client_id"));
        assert!(err.contains("unsupported scheme 'ftp'"));
        assert!(err.contains("declared jwk"));
    }

    #[tokio::test]
    async fn interactive_client_needs_no_backend() {
        let yaml = r#"
client:
  client_id: my-app
  issuer: https://ehr.test/auth
  fhir_base_url: https://ehr.test/fhir
  scope: launch openid fhirUser patient/*.read
  redirect_uri: http://localhost:8080/callback
"#;
        let config = parse_config(yaml.to_string()).await.unwrap();

        assert!(config.client.backend.is_none());
        assert_eq!(config.settings.logging.unwrap().level, "info");
    }

    #[tokio::test]
    #[serial]
    async fn env_placeholders_are_expanded_from_file() {
        std::env::set_var("SMART_TEST_CLIENT_ID", "from-env-client");
        std::env::remove_var("SMART_TEST_MISSING");

        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            r#"
client:
  client_id: ${{SMART_TEST_CLIENT_ID}}
  issuer: ${{SMART_TEST_MISSING:https://fallback.test/auth}}
  fhir_base_url: https://fallback.test/fhir
"#
        )
        .unwrap();

        let config = file_to_config(file.path()).await.unwrap();
        assert_eq!(config.client.client_id, "from-env-client");
        assert_eq!(config.client.issuer, "https://fallback.test/auth");

        std::env::remove_var("SMART_TEST_CLIENT_ID");
    }

    #[test]
    #[serial]
    fn secrets_resolve_from_env_and_file() {
        std::env::set_var("SMART_TEST_KEY", "literal-key");
        let from_env = SecretValue::FromEnv {
            from_env: "SMART_TEST_KEY".to_string(),
        };
        assert_eq!(from_env.resolve().unwrap(), "literal-key");
        std::env::remove_var("SMART_TEST_KEY");
        assert!(from_env.resolve().is_err());

        let from_file = SecretValue::FromFile {
            path: RSA_PRIVATE_PEM.to_string(),
        };
        assert!(from_file.resolve().unwrap().starts_with("-----BEGIN"));
    }

    #[test]
    fn unset_placeholder_without_default_becomes_empty() {
        assert_eq!(expand_env_vars("id: '${SMART_TEST_NEVER_SET}'").unwrap(), "id: ''");
    }
}
