mod metadata;
mod object;

pub use metadata::ObjectMeta;
pub use object::DynamicObject;

use serde::Deserialize;

/// An entry of an `APIResourceList`, as returned by API discovery.
#[derive(Clone, Debug, Deserialize)]
pub struct ApiResourceInfo {
    /// The plural name, or `plural/subresource` for subresources.
    pub name: String,

    pub kind: String,

    #[serde(default)]
    pub namespaced: bool,

    #[serde(default)]
    pub verbs: Vec<String>,
}

/// The resources served by one group version.
///
/// See <https://kubernetes.io/docs/reference/using-api/api-concepts/#resource-types>
#[derive(Clone, Debug, Deserialize)]
pub struct ApiResourceList {
    #[serde(rename = "groupVersion")]
    pub group_version: String,

    #[serde(default)]
    pub resources: Vec<ApiResourceInfo>,
}

impl ApiResourceList {
    /// Find the top level resource serving `kind`, subresources are skipped.
    pub fn find(&self, kind: &str) -> Option<ApiResource> {
        self.resources
            .iter()
            .find(|info| info.kind == kind && !info.name.contains('/'))
            .map(|info| ApiResource {
                api_version: self.group_version.clone(),
                kind: info.kind.clone(),
                plural: info.name.clone(),
                namespaced: info.namespaced,
            })
    }
}

/// Everything needed to build request urls for one kind of resource.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ApiResource {
    /// `v1` for the core group, `group/version` otherwise.
    pub api_version: String,

    pub kind: String,

    /// The plural of this resource, which is used to construct URLS
    pub plural: String,

    pub namespaced: bool,
}

impl ApiResource {
    /// Creates a url path for http requests for this resource
    pub fn url_path(&self, namespace: Option<&str>) -> String {
        let prefix = if self.api_version.contains('/') {
            "apis"
        } else {
            "api"
        };
        let namespace = match namespace {
            Some(namespace) if self.namespaced => format!("namespaces/{namespace}/"),
            _ => String::new(),
        };

        format!("/{prefix}/{}/{namespace}{}", self.api_version, self.plural)
    }

    pub fn object_path(&self, namespace: Option<&str>, name: &str) -> String {
        format!("{}/{}", self.url_path(namespace), name)
    }
}

/// The url path of the discovery document for `api_version`.
pub fn discovery_path(api_version: &str) -> String {
    if api_version.contains('/') {
        format!("/apis/{api_version}")
    } else {
        format!("/api/{api_version}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const APPS: &str = r#"{
      "kind": "APIResourceList",
      "apiVersion": "v1",
      "groupVersion": "apps/v1",
      "resources": [
        {"name": "deployments", "singularName": "deployment", "namespaced": true, "kind": "Deployment", "verbs": ["get", "update"]},
        {"name": "deployments/status", "singularName": "", "namespaced": true, "kind": "Deployment", "verbs": ["get"]},
        {"name": "controllerrevisions", "singularName": "controllerrevision", "namespaced": true, "kind": "ControllerRevision", "verbs": ["get"]}
      ]
    }"#;

    #[test]
    fn find_skips_subresources() {
        let list = serde_json::from_str::<ApiResourceList>(APPS).unwrap();
        let resource = list.find("Deployment").unwrap();

        assert_eq!(
            resource,
            ApiResource {
                api_version: "apps/v1".into(),
                kind: "Deployment".into(),
                plural: "deployments".into(),
                namespaced: true,
            }
        );
        assert!(list.find("StatefulSet").is_none());
    }

    #[test]
    fn paths() {
        let deployments = ApiResource {
            api_version: "apps/v1".into(),
            kind: "Deployment".into(),
            plural: "deployments".into(),
            namespaced: true,
        };
        assert_eq!(
            deployments.object_path(Some("default"), "web"),
            "/apis/apps/v1/namespaces/default/deployments/web"
        );
        assert_eq!(deployments.url_path(None), "/apis/apps/v1/deployments");

        let nodes = ApiResource {
            api_version: "v1".into(),
            kind: "Node".into(),
            plural: "nodes".into(),
            namespaced: false,
        };
        // cluster scoped resources ignore the namespace
        assert_eq!(nodes.object_path(Some("default"), "n1"), "/api/v1/nodes/n1");

        assert_eq!(discovery_path("v1"), "/api/v1");
        assert_eq!(discovery_path("apps/v1"), "/apis/apps/v1");
    }
}
