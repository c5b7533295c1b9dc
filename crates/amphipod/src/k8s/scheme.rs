//! Scheme registry: the set of kinds the engine treats as typed.
//!
//! Documents whose declared GroupVersionKind is registered here decode into
//! typed objects (merge policy, redaction and the generator's typed path all
//! key off this set); everything else is handled as unstructured JSON.

use kube::core::GroupVersionKind;
use serde_json::Value as Json;
use thiserror::Error;

/// Errors produced while decoding a manifest document.
#[derive(Debug, Error)]
pub enum DecodeError {
	#[error("document is not valid YAML or JSON")]
	Syntax(#[source] serde_yaml::Error),

	#[error("document is not an object")]
	NotAnObject,

	#[error("document missing apiVersion or kind")]
	MissingTypeMeta,
}

/// Registered (group, version, kind) bindings, mirroring the built-in
/// Kubernetes scheme the engine understands natively.
const REGISTERED: &[(&str, &str, &str)] = &[
	("", "v1", "ConfigMap"),
	("", "v1", "Endpoints"),
	("", "v1", "Event"),
	("", "v1", "LimitRange"),
	("", "v1", "Namespace"),
	("", "v1", "Node"),
	("", "v1", "PersistentVolume"),
	("", "v1", "PersistentVolumeClaim"),
	("", "v1", "Pod"),
	("", "v1", "ReplicationController"),
	("", "v1", "ResourceQuota"),
	("", "v1", "Secret"),
	("", "v1", "Service"),
	("", "v1", "ServiceAccount"),
	("apps", "v1", "DaemonSet"),
	("apps", "v1", "Deployment"),
	("apps", "v1", "ReplicaSet"),
	("apps", "v1", "StatefulSet"),
	("batch", "v1", "CronJob"),
	("batch", "v1", "Job"),
	("networking.k8s.io", "v1", "Ingress"),
	("networking.k8s.io", "v1", "NetworkPolicy"),
	("policy", "v1", "PodDisruptionBudget"),
	("rbac.authorization.k8s.io", "v1", "ClusterRole"),
	("rbac.authorization.k8s.io", "v1", "ClusterRoleBinding"),
	("rbac.authorization.k8s.io", "v1", "Role"),
	("rbac.authorization.k8s.io", "v1", "RoleBinding"),
	("storage.k8s.io", "v1", "StorageClass"),
	("apiextensions.k8s.io", "v1", "CustomResourceDefinition"),
	("admissionregistration.k8s.io", "v1", "MutatingWebhookConfiguration"),
	("admissionregistration.k8s.io", "v1", "ValidatingWebhookConfiguration"),
];

/// True if the GroupVersionKind belongs to the built-in scheme.
pub fn is_registered(gvk: &GroupVersionKind) -> bool {
	REGISTERED
		.iter()
		.any(|(g, v, k)| gvk.group == *g && gvk.version == *v && gvk.kind == *k)
}

/// One manifest item as the engine carries it: the declared identity plus
/// the JSON body, with a flag for scheme membership.
#[derive(Debug, Clone)]
pub struct ObjectDocument {
	pub gvk: GroupVersionKind,
	pub json: Json,
	pub registered: bool,
}

impl ObjectDocument {
	/// Decode a YAML or JSON document. The declared apiVersion/kind is
	/// authoritative; unknown kinds come back with `registered == false`.
	pub fn decode(raw: &str) -> Result<Self, DecodeError> {
		let value: serde_yaml::Value = serde_yaml::from_str(raw).map_err(DecodeError::Syntax)?;
		let json = serde_json::to_value(value).map_err(|_| DecodeError::NotAnObject)?;
		Self::from_json(json)
	}

	/// Wrap an already-parsed JSON document.
	pub fn from_json(json: Json) -> Result<Self, DecodeError> {
		if !json.is_object() {
			return Err(DecodeError::NotAnObject);
		}
		let gvk = gvk_from_json(&json).ok_or(DecodeError::MissingTypeMeta)?;
		let registered = is_registered(&gvk);
		Ok(Self { gvk, json, registered })
	}

	/// Declared object name, if any.
	pub fn name(&self) -> Option<&str> {
		self.json.pointer("/metadata/name").and_then(Json::as_str)
	}

	/// Declared namespace, if any.
	pub fn namespace(&self) -> Option<&str> {
		self.json.pointer("/metadata/namespace").and_then(Json::as_str)
	}
}

/// Extract a GroupVersionKind from a manifest's declared apiVersion/kind.
pub fn gvk_from_json(json: &Json) -> Option<GroupVersionKind> {
	let api_version = json.get("apiVersion")?.as_str()?;
	let kind = json.get("kind")?.as_str()?;
	let (group, version) = match api_version.split_once('/') {
		Some((g, v)) => (g, v),
		None => ("", api_version),
	};
	Some(GroupVersionKind::gvk(group, version, kind))
}
