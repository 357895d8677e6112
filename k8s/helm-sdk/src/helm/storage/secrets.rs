use super::{record_name, ReleaseStore};
use crate::{
    constants::{RELEASE_OWNER, RELEASE_SECRET_DATA_KEY, RELEASE_SECRET_TYPE},
    error::{
        Error, ListReleaseSecrets, ReleaseBase64, ReleaseCompression, ReleaseDecode,
        ReleaseEncode, ReleaseExists, ReleaseRecordEmpty, ReleaseRevisionNotFound, Result,
        WriteReleaseSecret,
    },
    helm::release::Release,
};
use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD, Engine as _};
use flate2::{read::GzDecoder, write::GzEncoder, Compression};
use k8s_openapi::{
    api::core::v1::Secret, apimachinery::pkg::apis::meta::v1::ObjectMeta, ByteString,
};
use kube::{
    api::{Api, DeleteParams, ListParams, PostParams},
    Client,
};
use snafu::{IntoError, OptionExt, ResultExt};
use std::{
    collections::BTreeMap,
    io::{Read, Write},
};
use tracing::debug;

const GZIP_MAGIC: [u8; 2] = [0x1f, 0x8b];

/// Stores each release revision in a Secret, the way Helm does: the release is serialized as
/// JSON, gzip-compressed and base64-encoded into the 'release' key of a Secret labelled with the
/// release's name, status and revision.
pub struct SecretsDriver {
    api: Api<Secret>,
    namespace: String,
}

impl SecretsDriver {
    pub fn new<T: ToString>(client: Client, namespace: T) -> Self {
        let namespace = namespace.to_string();
        Self {
            api: Api::namespaced(client, namespace.as_str()),
            namespace,
        }
    }

    async fn select(&self, label_selector: String) -> Result<Vec<Release>> {
        let secrets = self
            .api
            .list(&ListParams::default().labels(label_selector.as_str()))
            .await
            .context(ListReleaseSecrets {
                namespace: &self.namespace,
                label_selector: &label_selector,
            })?;
        secrets.items.iter().map(from_secret).collect()
    }

    fn write_error(&self, source: kube::Error, verb: &str, release: &Release) -> Error {
        let code = match &source {
            kube::Error::Api(response) => Some(response.code),
            _ => None,
        };
        match code {
            Some(409) => ReleaseExists {
                name: &release.name,
                namespace: &self.namespace,
                version: release.version,
            }
            .build(),
            Some(404) => ReleaseRevisionNotFound {
                name: &release.name,
                namespace: &self.namespace,
                version: release.version,
            }
            .build(),
            _ => WriteReleaseSecret {
                verb,
                record: record_name(&release.name, release.version),
                namespace: &self.namespace,
            }
            .into_error(source),
        }
    }
}

#[async_trait]
impl ReleaseStore for SecretsDriver {
    async fn history(&self, name: &str) -> Result<Vec<Release>> {
        self.select(format!("owner={RELEASE_OWNER},name={name}")).await
    }

    async fn list(&self) -> Result<Vec<Release>> {
        self.select(format!("owner={RELEASE_OWNER}")).await
    }

    async fn create(&self, release: &Release) -> Result<()> {
        let secret = to_secret(release)?;
        self.api
            .create(&PostParams::default(), &secret)
            .await
            .map_err(|source| self.write_error(source, "create", release))?;
        debug!(
            release = %release.name,
            namespace = %self.namespace,
            revision = release.version,
            "Created release Secret"
        );
        Ok(())
    }

    async fn update(&self, release: &Release) -> Result<()> {
        let secret = to_secret(release)?;
        let name = record_name(&release.name, release.version);
        self.api
            .replace(&name, &PostParams::default(), &secret)
            .await
            .map_err(|source| self.write_error(source, "replace", release))?;
        Ok(())
    }

    async fn delete(&self, name: &str, version: u32) -> Result<()> {
        let record = record_name(name, version);
        match self.api.delete(&record, &DeleteParams::default()).await {
            Ok(_) => Ok(()),
            Err(kube::Error::Api(response)) if response.code == 404 => {
                ReleaseRevisionNotFound {
                    name,
                    namespace: &self.namespace,
                    version,
                }
                .fail()
            }
            Err(source) => Err(WriteReleaseSecret {
                verb: "delete",
                record,
                namespace: &self.namespace,
            }
            .into_error(source)),
        }
    }
}

/// Serialize, compress and encode a release.
pub(crate) fn encode(release: &Release) -> Result<String> {
    let record = record_name(&release.name, release.version);
    let json = serde_json::to_vec(release).context(ReleaseEncode {
        name: &release.name,
    })?;

    let mut encoder = GzEncoder::new(Vec::new(), Compression::best());
    encoder
        .write_all(json.as_slice())
        .context(ReleaseCompression { record: &record })?;
    let compressed = encoder
        .finish()
        .context(ReleaseCompression { record: &record })?;

    Ok(STANDARD.encode(compressed))
}

/// Decode a release encoded by `encode`. Uncompressed payloads are accepted too.
pub(crate) fn decode(data: &[u8], record: &str) -> Result<Release> {
    let decoded = STANDARD.decode(data).context(ReleaseBase64 { record })?;

    let json = match decoded.starts_with(&GZIP_MAGIC) {
        true => {
            let mut json = Vec::new();
            GzDecoder::new(decoded.as_slice())
                .read_to_end(&mut json)
                .context(ReleaseCompression { record })?;
            json
        }
        false => decoded,
    };

    serde_json::from_slice(json.as_slice()).context(ReleaseDecode { record })
}

fn to_secret(release: &Release) -> Result<Secret> {
    let labels = BTreeMap::from([
        ("owner".to_string(), RELEASE_OWNER.to_string()),
        ("name".to_string(), release.name.clone()),
        ("status".to_string(), release.status().to_string()),
        ("version".to_string(), release.version.to_string()),
    ]);
    let data = BTreeMap::from([(
        RELEASE_SECRET_DATA_KEY.to_string(),
        ByteString(encode(release)?.into_bytes()),
    )]);

    Ok(Secret {
        metadata: ObjectMeta {
            name: Some(record_name(&release.name, release.version)),
            namespace: Some(release.namespace.clone()),
            labels: Some(labels),
            ..Default::default()
        },
        type_: Some(RELEASE_SECRET_TYPE.to_string()),
        data: Some(data),
        ..Default::default()
    })
}

fn from_secret(secret: &Secret) -> Result<Release> {
    let record = secret.metadata.name.clone().unwrap_or_default();
    let data = secret
        .data
        .as_ref()
        .and_then(|data| data.get(RELEASE_SECRET_DATA_KEY))
        .context(ReleaseRecordEmpty {
            record: &record,
            key: RELEASE_SECRET_DATA_KEY,
        })?;
    decode(data.0.as_slice(), &record)
}

#[cfg(test)]
mod tests {
    use super::{decode, encode, from_secret, to_secret};
    use crate::{
        error::ErrorKind,
        helm::{
            chart::{Chart, ChartMetadata, Manifest},
            release::{Info, Release, Status},
        },
    };
    use base64::{engine::general_purpose::STANDARD, Engine as _};
    use chrono::{TimeZone, Utc};
    use k8s_openapi::api::core::v1::Secret;
    use serde_json::json;

    fn release() -> Release {
        let deployed = Utc.with_ymd_and_hms(2023, 10, 1, 12, 0, 0).unwrap();
        Release {
            name: "demo".to_string(),
            namespace: "apps".to_string(),
            version: 2,
            info: Info {
                first_deployed: deployed,
                last_deployed: deployed,
                status: Status::Deployed,
                description: "Upgrade complete".to_string(),
            },
            chart: Chart {
                metadata: ChartMetadata {
                    name: "web".to_string(),
                    version: "1.2.3".to_string(),
                    ..Default::default()
                },
                values: json!({"replicas": 1}).as_object().cloned().unwrap(),
                ..Default::default()
            },
            config: json!({"image": {"tag": "v2"}}).as_object().cloned().unwrap(),
            manifests: vec![Manifest::new("web/templates/cm.yaml", "kind: ConfigMap")],
        }
    }

    #[test]
    fn test_secret_layout() {
        let secret = to_secret(&release()).unwrap();
        assert_eq!(
            secret.metadata.name.as_deref(),
            Some("sh.helm.release.v1.demo.v2")
        );
        assert_eq!(secret.type_.as_deref(), Some("helm.sh/release.v1"));

        let labels = secret.metadata.labels.as_ref().unwrap();
        assert_eq!(labels["owner"], "helm");
        assert_eq!(labels["name"], "demo");
        assert_eq!(labels["status"], "deployed");
        assert_eq!(labels["version"], "2");

        assert_eq!(from_secret(&secret).unwrap(), release());
    }

    #[test]
    fn test_payload_is_gzipped_json() {
        let encoded = encode(&release()).unwrap();
        let compressed = STANDARD.decode(encoded.as_bytes()).unwrap();
        assert_eq!(&compressed[..2], &[0x1f, 0x8b]);

        // Uncompressed payloads decode too.
        let plain = STANDARD.encode(serde_json::to_vec(&release()).unwrap());
        assert_eq!(decode(plain.as_bytes(), "record").unwrap(), release());
    }

    #[test]
    fn test_corrupt_records() {
        let error = decode(b"%%%", "record").unwrap_err();
        assert_eq!(error.kind(), ErrorKind::Storage);

        let error = decode(STANDARD.encode(b"{}").as_bytes(), "record").unwrap_err();
        assert_eq!(error.kind(), ErrorKind::Storage);

        let error = from_secret(&Secret::default()).unwrap_err();
        assert_eq!(error.kind(), ErrorKind::Storage);
    }
}
