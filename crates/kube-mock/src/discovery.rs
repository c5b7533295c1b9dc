//! Static discovery data served by the mock API server.

/// One served resource type.
#[derive(Debug, Clone)]
pub struct MockResource {
	/// Plural, lowercase resource name.
	pub name: &'static str,
	pub kind: &'static str,
	pub namespaced: bool,
	pub verbs: &'static [&'static str],
}

const ALL_VERBS: &[&str] = &["create", "delete", "get", "list", "patch", "update", "watch"];

fn resource(name: &'static str, kind: &'static str, namespaced: bool) -> MockResource {
	MockResource {
		name,
		kind,
		namespaced,
		verbs: ALL_VERBS,
	}
}

/// Discovery data mirroring a small but realistic cluster.
#[derive(Debug, Clone)]
pub struct MockDiscovery {
	pub core_resources: Vec<MockResource>,
	/// group/version → resources.
	pub group_resources: Vec<(&'static str, Vec<MockResource>)>,
}

impl Default for MockDiscovery {
	fn default() -> Self {
		Self {
			core_resources: vec![
				resource("pods", "Pod", true),
				resource("services", "Service", true),
				resource("serviceaccounts", "ServiceAccount", true),
				resource("secrets", "Secret", true),
				resource("configmaps", "ConfigMap", true),
				resource("namespaces", "Namespace", false),
			],
			group_resources: vec![
				(
					"apps/v1",
					vec![
						resource("deployments", "Deployment", true),
						resource("daemonsets", "DaemonSet", true),
						resource("statefulsets", "StatefulSet", true),
					],
				),
				(
					"rbac.authorization.k8s.io/v1",
					vec![
						resource("clusterroles", "ClusterRole", false),
						resource("clusterrolebindings", "ClusterRoleBinding", false),
						resource("roles", "Role", true),
						resource("rolebindings", "RoleBinding", true),
					],
				),
				("batch/v1", vec![resource("jobs", "Job", true)]),
			],
		}
	}
}
