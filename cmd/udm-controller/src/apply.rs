//! `udm-controller apply`: create-or-update of manifest objects.

use pkg_constants::controller::DEFAULT_NAMESPACE;
use pkg_state::Client;
use pkg_types::deployment::Deployment;
use pkg_types::event::Event;
use pkg_types::meta::Resource;
use pkg_types::pod::Pod;
use pkg_types::registry;
use pkg_types::revision::ControllerRevision;
use pkg_types::statefulset::StatefulSet;
use pkg_types::united::UnitedDeployment;
use serde::Deserialize;
use serde_json::Value;

/// Apply every document of a multi-document YAML manifest in order.
/// Returns one line per object, e.g. `uniteddeployments/default/web created`.
pub async fn apply_manifest(client: &Client, content: &str) -> anyhow::Result<Vec<String>> {
    let mut applied = Vec::new();
    for document in serde_yaml::Deserializer::from_str(content) {
        let value = Value::deserialize(document)?;
        if value.is_null() {
            continue;
        }
        applied.push(apply_value(client, value).await?);
    }
    Ok(applied)
}

async fn apply_value(client: &Client, value: Value) -> anyhow::Result<String> {
    let kind = value
        .get("kind")
        .and_then(Value::as_str)
        .ok_or_else(|| anyhow::anyhow!("manifest document has no kind"))?;
    let Some(info) = registry::by_kind(kind) else {
        anyhow::bail!("unknown kind {}", kind);
    };
    match info.kind {
        UnitedDeployment::KIND => apply_typed::<UnitedDeployment>(client, value).await,
        Deployment::KIND => apply_typed::<Deployment>(client, value).await,
        StatefulSet::KIND => apply_typed::<StatefulSet>(client, value).await,
        ControllerRevision::KIND => apply_typed::<ControllerRevision>(client, value).await,
        Pod::KIND => apply_typed::<Pod>(client, value).await,
        Event::KIND => apply_typed::<Event>(client, value).await,
        other => anyhow::bail!("kind {} cannot be applied", other),
    }
}

async fn apply_typed<R: Resource>(client: &Client, value: Value) -> anyhow::Result<String> {
    let mut object: R = serde_json::from_value(value)?;
    let meta = object.metadata_mut();
    if meta.namespace.is_empty() {
        meta.namespace = DEFAULT_NAMESPACE.to_string();
    }
    let key = format!("{}/{}", R::PLURAL, meta.key());

    match client.get::<R>(&meta.namespace, &meta.name).await {
        Ok(existing) => {
            object.metadata_mut().resource_version = existing.metadata().resource_version;
            // Manifests carry desired state only; keep what controllers observed.
            let mut merged = serde_json::to_value(&object)?;
            if let (Some(map), Some(status)) = (
                merged.as_object_mut(),
                serde_json::to_value(&existing)?.get("status"),
            ) {
                map.insert("status".to_string(), status.clone());
            }
            client.update(&serde_json::from_value::<R>(merged)?).await?;
            Ok(format!("{} configured", key))
        }
        Err(e) if e.is_not_found() => {
            client.create(&object).await?;
            Ok(format!("{} created", key))
        }
        Err(e) => Err(e.into()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pkg_state::StateStore;

    const MANIFEST: &str = r#"
apiVersion: apps.udm.dev/v1alpha1
kind: UnitedDeployment
metadata:
  name: web
spec:
  selector:
    matchLabels:
      app: web
  workloadTemplate:
    deploymentTemplate:
      metadata:
        labels:
          app: web
      spec:
        selector:
          matchLabels:
            app: web
        template:
          metadata:
            labels:
              app: web
          spec:
            containers:
              - name: nginx
                image: nginx:1.27
  topology:
    pools:
      - name: beijing
        replicas: 1
---
apiVersion: v1
kind: Pod
metadata:
  name: debug
  namespace: tools
spec:
  containers:
    - name: shell
      image: busybox
"#;

    #[tokio::test]
    async fn creates_then_updates() {
        let client = Client::for_store(StateStore::in_memory());

        let first = apply_manifest(&client, MANIFEST).await.unwrap();
        assert_eq!(
            first,
            vec![
                "uniteddeployments/default/web created",
                "pods/tools/debug created"
            ]
        );

        let second = apply_manifest(&client, MANIFEST).await.unwrap();
        assert_eq!(second[0], "uniteddeployments/default/web configured");
        let ud: UnitedDeployment = client.get("default", "web").await.unwrap();
        assert_eq!(ud.metadata.resource_version, 2);
        assert_eq!(ud.spec.topology.pools[0].replicas, Some(1));
    }

    #[tokio::test]
    async fn unknown_kind_is_rejected() {
        let client = Client::for_store(StateStore::in_memory());
        let err = apply_manifest(&client, "kind: Gadget\nmetadata:\n  name: x\n")
            .await
            .unwrap_err();
        assert!(err.to_string().contains("unknown kind Gadget"));
    }
}
