//! Function environment resolution

use std::collections::BTreeMap;

use k8s_openapi::api::core::v1::{ConfigMap, Secret};
use tracing::warn;

use super::expand;
use crate::cluster::ClusterStore;
use crate::crd::Function;
use crate::error::{Error, Result};

/// Resolve the environment of a Function
///
/// `envFrom` sources are applied first and `env` entries override them.
/// Missing objects or keys fail the resolution unless marked optional.
pub async fn resolve_function_env(
    cluster: &dyn ClusterStore,
    namespace: &str,
    function: &Function,
) -> Result<BTreeMap<String, String>> {
    let mut vars = BTreeMap::new();

    for source in &function.spec.env_from {
        let prefix = source.prefix.clone().unwrap_or_default();

        if let Some(cm_ref) = &source.config_map_ref {
            match optional(
                cluster.get_config_map(namespace, &cm_ref.name).await,
                cm_ref.optional,
            )? {
                Some(cm) => {
                    for (key, value) in config_map_entries(&cm) {
                        vars.insert(format!("{}{}", prefix, key), value);
                    }
                }
                None => continue,
            }
        }

        if let Some(secret_ref) = &source.secret_ref {
            match optional(
                cluster.get_secret(namespace, &secret_ref.name).await,
                secret_ref.optional,
            )? {
                Some(secret) => {
                    for (key, value) in secret_entries(&secret)? {
                        vars.insert(format!("{}{}", prefix, key), value);
                    }
                }
                None => continue,
            }
        }
    }

    for var in &function.spec.env {
        if let Some(value) = &var.value {
            let value = expand(value, &vars);
            vars.insert(var.name.clone(), value);
            continue;
        }

        let Some(value_from) = &var.value_from else {
            vars.insert(var.name.clone(), String::new());
            continue;
        };

        if let Some(selector) = &value_from.config_map_key_ref {
            let Some(cm) = optional(
                cluster.get_config_map(namespace, &selector.name).await,
                selector.optional,
            )?
            else {
                continue;
            };
            match config_map_entries(&cm).remove(&selector.key) {
                Some(value) => {
                    vars.insert(var.name.clone(), value);
                }
                None if selector.optional.unwrap_or(false) => {}
                None => {
                    return Err(Error::not_found(
                        "ConfigMap key",
                        format!("{}/{}", selector.name, selector.key),
                    ))
                }
            }
        } else if let Some(selector) = &value_from.secret_key_ref {
            let Some(secret) = optional(
                cluster.get_secret(namespace, &selector.name).await,
                selector.optional,
            )?
            else {
                continue;
            };
            match secret_string(&secret, &selector.key) {
                Ok(value) => {
                    vars.insert(var.name.clone(), value);
                }
                Err(Error::SecretKeyNotFound { .. }) if selector.optional.unwrap_or(false) => {}
                Err(e) => return Err(e),
            }
        } else {
            warn!(variable = %var.name, "Unsupported env source, skipping");
        }
    }

    Ok(vars)
}

/// Turn a lookup failure into `None` when the reference is optional
fn optional<T>(result: Result<T>, optional: Option<bool>) -> Result<Option<T>> {
    match result {
        Ok(obj) => Ok(Some(obj)),
        Err(e) if e.is_lookup_failure() && optional.unwrap_or(false) => Ok(None),
        Err(e) => Err(e),
    }
}

fn config_map_entries(cm: &ConfigMap) -> BTreeMap<String, String> {
    cm.data.clone().unwrap_or_default()
}

fn secret_entries(secret: &Secret) -> Result<BTreeMap<String, String>> {
    let mut entries = BTreeMap::new();
    if let Some(data) = &secret.data {
        for key in data.keys() {
            entries.insert(key.clone(), secret_string(secret, key)?);
        }
    }
    if let Some(string_data) = &secret.string_data {
        entries.extend(string_data.clone());
    }
    Ok(entries)
}

/// Get a string value from a secret
pub(crate) fn secret_string(secret: &Secret, key: &str) -> Result<String> {
    let missing = || Error::SecretKeyNotFound {
        secret: secret.metadata.name.clone().unwrap_or_default(),
        key: key.to_string(),
    };

    if let Some(bytes) = secret.data.as_ref().and_then(|d| d.get(key)) {
        return String::from_utf8(bytes.0.clone())
            .map_err(|e| Error::config(format!("Invalid UTF-8 in secret key '{}': {}", key, e)));
    }
    secret
        .string_data
        .as_ref()
        .and_then(|d| d.get(key))
        .cloned()
        .ok_or_else(missing)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::MemoryCluster;
    use crate::crd::FunctionSpec;
    use k8s_openapi::api::core::v1::{
        ConfigMapEnvSource, ConfigMapKeySelector, EnvFromSource, EnvVar, EnvVarSource,
        SecretKeySelector,
    };
    use k8s_openapi::ByteString;
    use kube::api::ObjectMeta;

    fn meta(name: &str) -> ObjectMeta {
        ObjectMeta {
            name: Some(name.to_string()),
            namespace: Some("apps".to_string()),
            ..Default::default()
        }
    }

    fn cluster() -> MemoryCluster {
        let cluster = MemoryCluster::new();
        cluster.insert_config_map(ConfigMap {
            metadata: meta("db-settings"),
            data: Some(BTreeMap::from([
                ("HOST".to_string(), "db1".to_string()),
                ("PORT".to_string(), "5432".to_string()),
            ])),
            ..Default::default()
        });
        cluster.insert_secret(Secret {
            metadata: meta("db-credentials"),
            data: Some(BTreeMap::from([(
                "password".to_string(),
                ByteString(b"s3cret".to_vec()),
            )])),
            ..Default::default()
        });
        cluster
    }

    fn function(env: Vec<EnvVar>, env_from: Vec<EnvFromSource>) -> Function {
        let mut function = Function::new(
            "dump",
            FunctionSpec {
                command: vec!["pg_dump".to_string()],
                args: vec![],
                env,
                env_from,
            },
        );
        function.metadata.namespace = Some("apps".to_string());
        function
    }

    fn literal(name: &str, value: &str) -> EnvVar {
        EnvVar {
            name: name.to_string(),
            value: Some(value.to_string()),
            ..Default::default()
        }
    }

    fn from_config_map(name: &str) -> EnvFromSource {
        EnvFromSource {
            config_map_ref: Some(ConfigMapEnvSource {
                name: name.to_string(),
                optional: None,
            }),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn env_overrides_env_from() {
        let cluster = cluster();
        let function = function(
            vec![literal("HOST", "db2")],
            vec![from_config_map("db-settings")],
        );

        let vars = resolve_function_env(&cluster, "apps", &function).await.unwrap();
        assert_eq!(vars["HOST"], "db2");
        assert_eq!(vars["PORT"], "5432");
    }

    #[tokio::test]
    async fn key_references_are_resolved() {
        let cluster = cluster();
        let function = function(
            vec![
                EnvVar {
                    name: "PGPASSWORD".to_string(),
                    value_from: Some(EnvVarSource {
                        secret_key_ref: Some(SecretKeySelector {
                            name: "db-credentials".to_string(),
                            key: "password".to_string(),
                            optional: None,
                        }),
                        ..Default::default()
                    }),
                    ..Default::default()
                },
                EnvVar {
                    name: "PGHOST".to_string(),
                    value_from: Some(EnvVarSource {
                        config_map_key_ref: Some(ConfigMapKeySelector {
                            name: "db-settings".to_string(),
                            key: "HOST".to_string(),
                            optional: None,
                        }),
                        ..Default::default()
                    }),
                    ..Default::default()
                },
            ],
            vec![],
        );

        let vars = resolve_function_env(&cluster, "apps", &function).await.unwrap();
        assert_eq!(vars["PGPASSWORD"], "s3cret");
        assert_eq!(vars["PGHOST"], "db1");
    }

    #[tokio::test]
    async fn missing_secret_key_is_a_lookup_failure() {
        let cluster = cluster();
        let function = function(
            vec![EnvVar {
                name: "TOKEN".to_string(),
                value_from: Some(EnvVarSource {
                    secret_key_ref: Some(SecretKeySelector {
                        name: "db-credentials".to_string(),
                        key: "token".to_string(),
                        optional: None,
                    }),
                    ..Default::default()
                }),
                ..Default::default()
            }],
            vec![],
        );

        let err = resolve_function_env(&cluster, "apps", &function)
            .await
            .unwrap_err();
        assert!(err.is_lookup_failure());
    }

    #[tokio::test]
    async fn optional_sources_may_be_missing() {
        let cluster = cluster();
        let function = function(
            vec![],
            vec![EnvFromSource {
                config_map_ref: Some(ConfigMapEnvSource {
                    name: "absent".to_string(),
                    optional: Some(true),
                }),
                ..Default::default()
            }],
        );
        let vars = resolve_function_env(&cluster, "apps", &function).await.unwrap();
        assert!(vars.is_empty());

        let required = self::function(vec![], vec![from_config_map("absent")]);
        assert!(resolve_function_env(&cluster, "apps", &required)
            .await
            .unwrap_err()
            .is_lookup_failure());
    }

    #[tokio::test]
    async fn literal_values_expand_earlier_variables() {
        let cluster = cluster();
        let function = function(
            vec![literal("URL", "postgres://$(HOST):$(PORT)")],
            vec![from_config_map("db-settings")],
        );
        let vars = resolve_function_env(&cluster, "apps", &function).await.unwrap();
        assert_eq!(vars["URL"], "postgres://db1:5432");
    }
}
