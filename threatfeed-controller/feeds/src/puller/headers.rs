use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use threatfeed_controller_k8s_api::{
    threat_feed::{HttpHeader, KeyRef},
    ClientError, KeyValues,
};

#[derive(Debug, thiserror::Error)]
pub enum HeaderError {
    #[error("header {0} has a valueFrom with neither a configMapKeyRef nor a secretKeyRef")]
    MissingSource(String),

    #[error("{kind} {name} has no key {key}")]
    MissingKey {
        kind: &'static str,
        name: String,
        key: String,
    },

    #[error("failed to read {kind} {name}: {source}")]
    Lookup {
        kind: &'static str,
        name: String,
        #[source]
        source: ClientError,
    },

    #[error("invalid header name {0:?}")]
    InvalidName(String),

    #[error("invalid value for header {0}")]
    InvalidValue(String),
}

/// Builds the request headers for a pull, reading referenced values from
/// ConfigMaps and Secrets.
pub async fn resolve(
    headers: &[HttpHeader],
    config_maps: &dyn KeyValues,
    secrets: &dyn KeyValues,
) -> Result<HeaderMap, HeaderError> {
    let mut resolved = HeaderMap::new();
    for header in headers {
        let value = match (&header.value, &header.value_from) {
            (Some(value), _) if !value.is_empty() => Some(value.clone()),
            (_, Some(from)) => {
                if let Some(r) = &from.config_map_key_ref {
                    lookup(config_maps, "ConfigMap", r).await?
                } else if let Some(r) = &from.secret_key_ref {
                    lookup(secrets, "Secret", r).await?
                } else {
                    return Err(HeaderError::MissingSource(header.name.clone()));
                }
            }
            (value, None) => Some(value.clone().unwrap_or_default()),
        };

        let Some(value) = value else {
            tracing::debug!(header = %header.name, "Skipping optional header");
            continue;
        };
        let name = HeaderName::from_bytes(header.name.as_bytes())
            .map_err(|_| HeaderError::InvalidName(header.name.clone()))?;
        let value = HeaderValue::from_str(&value)
            .map_err(|_| HeaderError::InvalidValue(header.name.clone()))?;
        resolved.append(name, value);
    }
    Ok(resolved)
}

async fn lookup(
    client: &dyn KeyValues,
    kind: &'static str,
    r: &KeyRef,
) -> Result<Option<String>, HeaderError> {
    let optional = r.optional.unwrap_or(false);
    let data = match client.get(&r.name).await {
        Ok(data) => data,
        Err(error) if optional && error.is_not_found() => return Ok(None),
        Err(source) => {
            return Err(HeaderError::Lookup {
                kind,
                name: r.name.clone(),
                source,
            })
        }
    };
    match data.get(&r.key) {
        Some(value) => Ok(Some(value.clone())),
        None if optional => Ok(None),
        None => Err(HeaderError::MissingKey {
            kind,
            name: r.name.clone(),
            key: r.key.clone(),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use maplit::btreemap;
    use threatfeed_controller_core::fake::FakeKeyValues;
    use threatfeed_controller_k8s_api::threat_feed::HttpHeaderSource;

    fn literal(name: &str, value: &str) -> HttpHeader {
        HttpHeader {
            name: name.into(),
            value: Some(value.into()),
            value_from: None,
        }
    }

    fn config_map(name: &str, cm: &str, key: &str, optional: Option<bool>) -> HttpHeader {
        HttpHeader {
            name: name.into(),
            value: None,
            value_from: Some(HttpHeaderSource {
                config_map_key_ref: Some(KeyRef {
                    name: cm.into(),
                    key: key.into(),
                    optional,
                }),
                secret_key_ref: None,
            }),
        }
    }

    fn secret(name: &str, s: &str, key: &str, optional: Option<bool>) -> HttpHeader {
        HttpHeader {
            name: name.into(),
            value: None,
            value_from: Some(HttpHeaderSource {
                config_map_key_ref: None,
                secret_key_ref: Some(KeyRef {
                    name: s.into(),
                    key: key.into(),
                    optional,
                }),
            }),
        }
    }

    fn clients() -> (FakeKeyValues, FakeKeyValues) {
        let config_maps = FakeKeyValues::default();
        config_maps.insert("cm", btreemap! { "key".to_string() => "cm-value".to_string() });
        let secrets = FakeKeyValues::default();
        secrets.insert("s", btreemap! { "key".to_string() => "s-value".to_string() });
        (config_maps, secrets)
    }

    #[tokio::test]
    async fn literal_values_take_precedence() {
        let (config_maps, secrets) = clients();
        let mut both = config_map("Invalid", "cm", "key", None);
        both.value = Some("ghi".into());

        let headers = resolve(
            &[literal("Accept", "text/plain"), both],
            &config_maps,
            &secrets,
        )
        .await
        .unwrap();
        assert_eq!(headers["accept"], "text/plain");
        assert_eq!(headers["invalid"], "ghi");
    }

    #[tokio::test]
    async fn references_are_resolved() {
        let (config_maps, secrets) = clients();
        let headers = resolve(
            &[
                config_map("X-Config", "cm", "key", None),
                secret("X-Secret", "s", "key", Some(false)),
            ],
            &config_maps,
            &secrets,
        )
        .await
        .unwrap();
        assert_eq!(headers["x-config"], "cm-value");
        assert_eq!(headers["x-secret"], "s-value");
    }

    #[tokio::test]
    async fn optional_references_are_skipped() {
        let (config_maps, secrets) = clients();
        let headers = resolve(
            &[
                config_map("X-Missing-Key", "cm", "other", Some(true)),
                config_map("X-Missing-Map", "nope", "key", Some(true)),
                secret("X-Missing-Secret", "nope", "key", Some(true)),
            ],
            &config_maps,
            &secrets,
        )
        .await
        .unwrap();
        assert!(headers.is_empty());
    }

    #[tokio::test]
    async fn required_references_must_resolve() {
        let (config_maps, secrets) = clients();

        let missing_key = [config_map("X", "cm", "other", None)];
        assert!(matches!(
            resolve(&missing_key, &config_maps, &secrets).await,
            Err(HeaderError::MissingKey { kind: "ConfigMap", .. })
        ));

        let missing_secret = [secret("X", "nope", "key", Some(false))];
        assert!(matches!(
            resolve(&missing_secret, &config_maps, &secrets).await,
            Err(HeaderError::Lookup { kind: "Secret", .. })
        ));

        let no_source = [HttpHeader {
            name: "X".into(),
            value: None,
            value_from: Some(HttpHeaderSource::default()),
        }];
        assert!(matches!(
            resolve(&no_source, &config_maps, &secrets).await,
            Err(HeaderError::MissingSource(_))
        ));
    }
}
