use crate::{
    constants::{CRD_ESTABLISH_TIMEOUT, FIELD_MANAGER, READINESS_POLL_INTERVAL},
    error::{
        ApplyObject, CrdEstablishTimeout, DeleteObject, Error, ManifestField, ManifestObject,
        ManifestParse, ObjectMapping, ReadinessCheck, Result,
    },
    helm::chart::Manifest,
    kube::mapper::{RestMapper, RestMapping},
};
use async_trait::async_trait;
use kube::{
    api::{Api, DeleteParams, DynamicObject, Patch, PatchParams},
    core::GroupVersionKind,
    Client,
};
use serde::Deserialize;
use serde_json::Value;
use snafu::{OptionExt, ResultExt};
use std::sync::Arc;
use tracing::{debug, info};

/// Kinds in the order they are applied. Kinds not listed go last.
const INSTALL_ORDER: &[&str] = &[
    "Namespace",
    "NetworkPolicy",
    "ResourceQuota",
    "LimitRange",
    "PodDisruptionBudget",
    "ServiceAccount",
    "Secret",
    "ConfigMap",
    "StorageClass",
    "PersistentVolume",
    "PersistentVolumeClaim",
    "CustomResourceDefinition",
    "ClusterRole",
    "ClusterRoleBinding",
    "Role",
    "RoleBinding",
    "Service",
    "DaemonSet",
    "Pod",
    "ReplicationController",
    "ReplicaSet",
    "Deployment",
    "HorizontalPodAutoscaler",
    "StatefulSet",
    "Job",
    "CronJob",
    "IngressClass",
    "Ingress",
    "APIService",
];

/// An object written to the cluster.
#[derive(Clone, Debug, PartialEq)]
pub struct AppliedObject {
    pub gvk: GroupVersionKind,
    pub name: String,
    /// None for cluster-scoped objects.
    pub namespace: Option<String>,
}

impl AppliedObject {
    /// Whether both address the same cluster object. The API version may differ.
    pub fn is_same_object(&self, other: &AppliedObject) -> bool {
        self.gvk.group == other.gvk.group
            && self.gvk.kind == other.gvk.kind
            && self.name == other.name
            && self.namespace == other.namespace
    }
}

/// Writes rendered manifests to the cluster.
#[async_trait]
pub trait ResourceApplier: Send + Sync {
    /// Apply CustomResourceDefinitions and wait until they are established, so that the kinds they
    /// define can be applied right after.
    async fn install_crds(&self, crds: &[Manifest]) -> Result<()>;

    /// Apply every object of 'manifests'. Namespaced objects without a namespace land in
    /// 'namespace'.
    async fn apply(&self, namespace: &str, manifests: &[Manifest]) -> Result<Vec<AppliedObject>>;

    /// Return once every one of 'objects' is ready. This does not time out by itself.
    async fn wait_ready(&self, objects: &[AppliedObject]) -> Result<()>;

    /// The objects 'manifests' would apply, without writing anything. Objects of kinds the
    /// cluster no longer serves are left out.
    async fn identify(
        &self,
        namespace: &str,
        manifests: &[Manifest],
    ) -> Result<Vec<AppliedObject>>;

    /// Delete 'objects'. Objects which are already gone are not an error.
    async fn delete(&self, objects: &[AppliedObject]) -> Result<()>;
}

/// A ResourceApplier which server-side applies objects through a kube::Client.
pub struct KubeApplier {
    client: Client,
    mapper: Arc<dyn RestMapper>,
}

impl KubeApplier {
    pub fn new(client: Client, mapper: Arc<dyn RestMapper>) -> Self {
        Self { client, mapper }
    }

    fn api(&self, mapping: &RestMapping, namespace: Option<&str>) -> Api<DynamicObject> {
        match namespace {
            Some(namespace) => {
                Api::namespaced_with(self.client.clone(), namespace, &mapping.resource)
            }
            None => Api::all_with(self.client.clone(), &mapping.resource),
        }
    }

    /// Resolve where 'object' lives. Namespaced objects without a namespace land in
    /// 'default_namespace'.
    async fn locate(
        &self,
        object: &DynamicObject,
        default_namespace: &str,
        manifest: &str,
    ) -> Result<(RestMapping, AppliedObject)> {
        let gvk = gvk_of(object, manifest)?;
        let name = object
            .metadata
            .name
            .clone()
            .filter(|name| !name.is_empty())
            .context(ManifestField {
                manifest,
                field: "metadata.name",
            })?;

        let mapping = self
            .mapper
            .resource_for(&gvk)
            .await
            .context(ObjectMapping {
                kind: &gvk.kind,
                name: &name,
            })?;
        let namespace = match mapping.namespaced {
            true => Some(
                object
                    .metadata
                    .namespace
                    .clone()
                    .unwrap_or_else(|| default_namespace.to_string()),
            ),
            false => None,
        };

        Ok((
            mapping,
            AppliedObject {
                gvk,
                name,
                namespace,
            },
        ))
    }

    async fn apply_object(
        &self,
        mut object: DynamicObject,
        default_namespace: &str,
        manifest: &str,
    ) -> Result<AppliedObject> {
        let (mapping, located) = self.locate(&object, default_namespace, manifest).await?;
        let AppliedObject {
            gvk,
            name,
            namespace,
        } = located;
        object.metadata.namespace = namespace.clone();

        self.api(&mapping, namespace.as_deref())
            .patch(
                &name,
                &PatchParams::apply(FIELD_MANAGER).force(),
                &Patch::Apply(&object),
            )
            .await
            .context(ApplyObject {
                kind: &gvk.kind,
                name: &name,
                namespace: namespace.clone().unwrap_or_default(),
            })?;

        debug!(kind = %gvk.kind, %name, ?namespace, "Applied object");
        Ok(AppliedObject {
            gvk,
            name,
            namespace,
        })
    }

    async fn is_object_ready(&self, object: &AppliedObject) -> Result<bool> {
        let mapping = self
            .mapper
            .resource_for(&object.gvk)
            .await
            .context(ObjectMapping {
                kind: &object.gvk.kind,
                name: &object.name,
            })?;
        let current = self
            .api(&mapping, object.namespace.as_deref())
            .get_opt(&object.name)
            .await
            .context(ReadinessCheck {
                kind: &object.gvk.kind,
                name: &object.name,
            })?;
        Ok(current.as_ref().is_some_and(is_ready))
    }
}

#[async_trait]
impl ResourceApplier for KubeApplier {
    async fn install_crds(&self, crds: &[Manifest]) -> Result<()> {
        let mut applied = Vec::new();
        for manifest in crds {
            for object in parse_manifest(manifest)? {
                applied.push(self.apply_object(object, "", &manifest.name).await?);
            }
        }
        if applied.is_empty() {
            return Ok(());
        }

        // The new kinds aren't in the catalog the mapper has seen.
        self.mapper.reset();
        tokio::time::timeout(CRD_ESTABLISH_TIMEOUT, self.wait_ready(&applied))
            .await
            .map_err(|_| {
                CrdEstablishTimeout {
                    timeout: CRD_ESTABLISH_TIMEOUT,
                }
                .build()
            })??;

        info!(count = applied.len(), "Installed CustomResourceDefinitions");
        Ok(())
    }

    async fn apply(&self, namespace: &str, manifests: &[Manifest]) -> Result<Vec<AppliedObject>> {
        let mut objects = Vec::new();
        for manifest in manifests {
            for object in parse_manifest(manifest)? {
                objects.push((manifest.name.as_str(), object));
            }
        }
        objects.sort_by_key(|(_, object)| install_rank(object));

        let mut applied = Vec::with_capacity(objects.len());
        for (manifest, object) in objects {
            applied.push(self.apply_object(object, namespace, manifest).await?);
        }
        Ok(applied)
    }

    async fn wait_ready(&self, objects: &[AppliedObject]) -> Result<()> {
        loop {
            let mut waiting_on = None;
            for object in objects {
                if !self.is_object_ready(object).await? {
                    waiting_on = Some(object);
                    break;
                }
            }

            match waiting_on {
                None => return Ok(()),
                Some(object) => {
                    debug!(
                        kind = %object.gvk.kind,
                        name = %object.name,
                        "Waiting for object to become ready"
                    );
                    tokio::time::sleep(READINESS_POLL_INTERVAL).await;
                }
            }
        }
    }

    async fn identify(
        &self,
        namespace: &str,
        manifests: &[Manifest],
    ) -> Result<Vec<AppliedObject>> {
        let mut objects = Vec::new();
        for manifest in manifests {
            for object in parse_manifest(manifest)? {
                match self.locate(&object, namespace, &manifest.name).await {
                    Ok((_, located)) => objects.push(located),
                    Err(Error::ObjectMapping { source, .. })
                        if matches!(*source, Error::NoKindMatch { .. }) =>
                    {
                        debug!(
                            manifest = %manifest.name,
                            error = %source,
                            "Skipping object of a kind the cluster doesn't serve"
                        );
                    }
                    Err(error) => return Err(error),
                }
            }
        }
        Ok(objects)
    }

    async fn delete(&self, objects: &[AppliedObject]) -> Result<()> {
        for object in objects {
            let mapping = self
                .mapper
                .resource_for(&object.gvk)
                .await
                .context(ObjectMapping {
                    kind: &object.gvk.kind,
                    name: &object.name,
                })?;

            match self
                .api(&mapping, object.namespace.as_deref())
                .delete(&object.name, &DeleteParams::background())
                .await
            {
                Ok(_) => {
                    info!(
                        kind = %object.gvk.kind,
                        name = %object.name,
                        namespace = ?object.namespace,
                        "Deleted object"
                    );
                }
                Err(kube::Error::Api(response)) if response.code == 404 => {
                    debug!(kind = %object.gvk.kind, name = %object.name, "Object is already gone");
                }
                Err(error) => {
                    return Err(error).context(DeleteObject {
                        kind: &object.gvk.kind,
                        name: &object.name,
                        namespace: object.namespace.clone().unwrap_or_default(),
                    });
                }
            }
        }
        Ok(())
    }
}

/// Split a multi-document manifest into objects. Empty documents are skipped.
pub(crate) fn parse_manifest(manifest: &Manifest) -> Result<Vec<DynamicObject>> {
    let mut objects = Vec::new();
    for document in serde_yaml::Deserializer::from_str(&manifest.content) {
        let value = serde_yaml::Value::deserialize(document).context(ManifestParse {
            manifest: &manifest.name,
        })?;
        if value.is_null() {
            continue;
        }

        let object: DynamicObject = serde_json::to_value(value)
            .and_then(serde_json::from_value)
            .context(ManifestObject {
                manifest: &manifest.name,
            })?;
        gvk_of(&object, &manifest.name)?;
        objects.push(object);
    }
    Ok(objects)
}

fn gvk_of(object: &DynamicObject, manifest: &str) -> Result<GroupVersionKind> {
    let types = object
        .types
        .as_ref()
        .filter(|types| !types.api_version.is_empty() && !types.kind.is_empty())
        .context(ManifestField {
            manifest,
            field: "apiVersion or kind",
        })?;
    let (group, version) = types
        .api_version
        .split_once('/')
        .unwrap_or(("", types.api_version.as_str()));
    Ok(GroupVersionKind::gvk(group, version, &types.kind))
}

fn kind_of(object: &DynamicObject) -> &str {
    object
        .types
        .as_ref()
        .map(|types| types.kind.as_str())
        .unwrap_or_default()
}

fn install_rank(object: &DynamicObject) -> usize {
    let kind = kind_of(object);
    INSTALL_ORDER
        .iter()
        .position(|known| *known == kind)
        .unwrap_or(INSTALL_ORDER.len())
}

fn int(object: &DynamicObject, pointer: &str) -> Option<i64> {
    object.data.pointer(pointer).and_then(Value::as_i64)
}

fn text<'a>(object: &'a DynamicObject, pointer: &str) -> Option<&'a str> {
    object.data.pointer(pointer).and_then(Value::as_str)
}

fn has_condition(object: &DynamicObject, type_: &str) -> bool {
    object
        .data
        .pointer("/status/conditions")
        .and_then(Value::as_array)
        .is_some_and(|conditions| {
            conditions.iter().any(|condition| {
                condition.get("type").and_then(Value::as_str) == Some(type_)
                    && condition.get("status").and_then(Value::as_str) == Some("True")
            })
        })
}

/// Whether the controller has seen the latest spec.
fn observed(object: &DynamicObject) -> bool {
    match (object.metadata.generation, int(object, "/status/observedGeneration")) {
        (Some(generation), Some(observed)) => observed >= generation,
        (Some(_), None) => false,
        (None, _) => true,
    }
}

/// Whether an object is ready to serve. Kinds without a notion of readiness are ready once they
/// exist.
pub(crate) fn is_ready(object: &DynamicObject) -> bool {
    let desired = int(object, "/spec/replicas").unwrap_or(1);
    let status = |field: &str| int(object, &format!("/status/{field}")).unwrap_or(0);

    match kind_of(object) {
        "Deployment" => {
            observed(object)
                && status("updatedReplicas") >= desired
                && status("availableReplicas") >= desired
        }
        "StatefulSet" | "ReplicaSet" | "ReplicationController" => {
            observed(object) && status("readyReplicas") >= desired
        }
        "DaemonSet" => {
            let scheduled = status("desiredNumberScheduled");
            observed(object)
                && status("numberReady") >= scheduled
                && status("updatedNumberScheduled") >= scheduled
        }
        "Pod" => {
            text(object, "/status/phase") == Some("Succeeded") || has_condition(object, "Ready")
        }
        "Job" => {
            let completions = int(object, "/spec/completions").unwrap_or(1);
            has_condition(object, "Complete") || status("succeeded") >= completions
        }
        "PersistentVolumeClaim" => text(object, "/status/phase") == Some("Bound"),
        "Service" => {
            text(object, "/spec/type") != Some("LoadBalancer")
                || object
                    .data
                    .pointer("/status/loadBalancer/ingress")
                    .and_then(Value::as_array)
                    .is_some_and(|ingress| !ingress.is_empty())
        }
        "CustomResourceDefinition" => has_condition(object, "Established"),
        _ => true,
    }
}

#[cfg(test)]
mod tests {
    use super::{
        install_rank, is_ready, kind_of, parse_manifest, AppliedObject, KubeApplier,
        ResourceApplier,
    };
    use crate::{
        error::{Error, ErrorKind, NoKindMatch, Result},
        helm::chart::Manifest,
        kube::mapper::{RestMapper, RestMapping},
    };
    use async_trait::async_trait;
    use kube::{
        api::DynamicObject,
        core::{ApiResource, GroupVersionKind},
        Client, Config,
    };
    use serde_json::json;
    use std::sync::Arc;

    fn object(value: serde_json::Value) -> DynamicObject {
        serde_json::from_value(value).unwrap()
    }

    /// Only serves ConfigMaps.
    struct ConfigMapsOnly;

    #[async_trait]
    impl RestMapper for ConfigMapsOnly {
        async fn kind_for(&self, _resource: &str) -> Result<GroupVersionKind> {
            Ok(GroupVersionKind::gvk("", "v1", "ConfigMap"))
        }

        async fn resource_for(&self, gvk: &GroupVersionKind) -> Result<RestMapping> {
            if gvk.group.is_empty() && gvk.kind == "ConfigMap" {
                return Ok(RestMapping {
                    resource: ApiResource::from_gvk_with_plural(gvk, "configmaps"),
                    namespaced: true,
                });
            }
            NoKindMatch {
                kind: &gvk.kind,
                api_version: &gvk.version,
            }
            .fail()
        }

        fn reset(&self) {}
    }

    fn applier() -> KubeApplier {
        let config = Config::new("http://127.0.0.1:8080".parse().unwrap());
        KubeApplier::new(Client::try_from(config).unwrap(), Arc::new(ConfigMapsOnly))
    }

    fn mixed_manifest() -> Manifest {
        Manifest::new(
            "web/templates/all.yaml",
            "apiVersion: v1\nkind: ConfigMap\nmetadata:\n  name: web\n---\napiVersion: example.com/v1\nkind: Widget\nmetadata:\n  name: gadget\n",
        )
    }

    #[tokio::test]
    async fn test_unserved_kind_fails_the_apply() {
        let widget = Manifest::new(
            "web/templates/widget.yaml",
            "apiVersion: example.com/v1\nkind: Widget\nmetadata:\n  name: gadget\n",
        );
        let error = applier().apply("apps", &[widget]).await.unwrap_err();
        assert!(matches!(error, Error::ObjectMapping { .. }), "{error}");
        assert_eq!(error.kind(), ErrorKind::Apply);
        assert!(error.to_string().contains("Widget gadget"));
    }

    #[tokio::test]
    async fn test_identify_skips_unserved_kinds() {
        let objects = applier()
            .identify("apps", &[mixed_manifest()])
            .await
            .unwrap();
        assert_eq!(
            objects,
            vec![AppliedObject {
                gvk: GroupVersionKind::gvk("", "v1", "ConfigMap"),
                name: "web".to_string(),
                namespace: Some("apps".to_string()),
            }]
        );
    }

    #[test]
    fn test_same_object_across_versions() {
        let object = |version: &str, namespace: Option<&str>| AppliedObject {
            gvk: GroupVersionKind::gvk("autoscaling", version, "HorizontalPodAutoscaler"),
            name: "web".to_string(),
            namespace: namespace.map(str::to_string),
        };
        assert!(object("v1", Some("apps")).is_same_object(&object("v2", Some("apps"))));
        assert!(!object("v1", Some("apps")).is_same_object(&object("v1", Some("other"))));
        assert!(!object("v1", Some("apps")).is_same_object(&object("v1", None)));
    }

    #[test]
    fn test_parse_manifest() {
        let manifest = Manifest::new(
            "web/templates/all.yaml",
            "# Source: web/templates/cm.yaml\n---\napiVersion: v1\nkind: ConfigMap\nmetadata:\n  name: web\ndata:\n  a: b\n---\n---\napiVersion: apps/v1\nkind: Deployment\nmetadata:\n  name: web\n  namespace: other\n",
        );
        let objects = parse_manifest(&manifest).unwrap();
        assert_eq!(objects.len(), 2);
        assert_eq!(kind_of(&objects[0]), "ConfigMap");
        assert_eq!(objects[0].data["data"]["a"], "b");
        assert_eq!(objects[1].metadata.namespace.as_deref(), Some("other"));
    }

    #[test]
    fn test_parse_manifest_errors() {
        let error = parse_manifest(&Manifest::new("bad.yaml", "kind: [")).unwrap_err();
        assert_eq!(error.kind(), ErrorKind::Apply);

        let error =
            parse_manifest(&Manifest::new("kindless.yaml", "metadata:\n  name: x\n")).unwrap_err();
        assert_eq!(error.kind(), ErrorKind::Apply);
        assert!(error.to_string().contains("kindless.yaml"));
    }

    #[test]
    fn test_install_order() {
        let mut kinds = vec!["Deployment", "Widget", "Service", "ConfigMap", "Namespace"];
        kinds.sort_by_key(|kind| {
            install_rank(&object(json!({"apiVersion": "v1", "kind": kind, "metadata": {}})))
        });
        assert_eq!(
            kinds,
            vec!["Namespace", "ConfigMap", "Service", "Deployment", "Widget"]
        );
    }

    #[test]
    fn test_deployment_readiness() {
        let mut deployment = json!({
            "apiVersion": "apps/v1",
            "kind": "Deployment",
            "metadata": {"name": "web", "generation": 2},
            "spec": {"replicas": 3},
            "status": {"observedGeneration": 2, "updatedReplicas": 3, "availableReplicas": 2}
        });
        assert!(!is_ready(&object(deployment.clone())));

        deployment["status"]["availableReplicas"] = json!(3);
        assert!(is_ready(&object(deployment.clone())));

        deployment["metadata"]["generation"] = json!(3);
        assert!(!is_ready(&object(deployment)));
    }

    #[test]
    fn test_readiness_of_other_kinds() {
        assert!(is_ready(&object(json!({
            "apiVersion": "v1", "kind": "Pod", "metadata": {"name": "p"},
            "status": {"conditions": [{"type": "Ready", "status": "True"}]}
        }))));
        assert!(!is_ready(&object(json!({
            "apiVersion": "v1", "kind": "Pod", "metadata": {"name": "p"},
            "status": {"phase": "Pending"}
        }))));
        assert!(is_ready(&object(json!({
            "apiVersion": "batch/v1", "kind": "Job", "metadata": {"name": "j"},
            "status": {"succeeded": 1}
        }))));
        assert!(!is_ready(&object(json!({
            "apiVersion": "v1", "kind": "PersistentVolumeClaim", "metadata": {"name": "c"},
            "status": {"phase": "Pending"}
        }))));
        assert!(!is_ready(&object(json!({
            "apiVersion": "v1", "kind": "Service", "metadata": {"name": "s"},
            "spec": {"type": "LoadBalancer"}, "status": {"loadBalancer": {}}
        }))));
        assert!(is_ready(&object(json!({
            "apiVersion": "v1", "kind": "Service", "metadata": {"name": "s"},
            "spec": {"type": "ClusterIP"}
        }))));
        assert!(is_ready(&object(json!({
            "apiVersion": "apiextensions.k8s.io/v1", "kind": "CustomResourceDefinition",
            "metadata": {"name": "widgets.example.com"},
            "status": {"conditions": [{"type": "Established", "status": "True"}]}
        }))));
        assert!(is_ready(&object(json!({
            "apiVersion": "v1", "kind": "ConfigMap", "metadata": {"name": "c"}
        }))));
        assert!(!is_ready(&object(json!({
            "apiVersion": "apps/v1", "kind": "DaemonSet", "metadata": {"name": "d"},
            "status": {"desiredNumberScheduled": 3, "numberReady": 2, "updatedNumberScheduled": 3}
        }))));
    }
}
