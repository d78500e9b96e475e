//! Plan manifests: the documents stored at resource handles.

use fleet_core::{FleetError, FleetResult, Gvk};
use kube::core::DynamicObject;
use serde_json::Value;

/// Identity of a plan resource, read from its manifest.
#[derive(Debug, Clone, PartialEq)]
pub struct PlanObject {
    pub name: String,
    pub gvk: Gvk,
    /// Manifest as JSON.
    pub raw: Value,
}

/// Parse a stored manifest: a YAML (or JSON) string, or an inline object.
pub fn parse_manifest(v: &Value) -> FleetResult<PlanObject> {
    let obj: DynamicObject = match v {
        Value::String(s) => serde_yaml::from_str(s).map_err(|e| FleetError::Unprocessable(format!("decode manifest: {}", e)))?,
        Value::Object(_) => serde_json::from_value(v.clone()).map_err(|e| FleetError::Unprocessable(format!("decode manifest: {}", e)))?,
        other => return Err(FleetError::Unprocessable(format!("manifest is not an object: {}", other))),
    };
    let types = obj.types.as_ref().ok_or_else(|| FleetError::Unprocessable("manifest has no apiVersion/kind".into()))?;
    let gvk = Gvk::from_api_version(&types.api_version, &types.kind);
    let name = obj.metadata.name.clone().unwrap_or_default();
    let raw = serde_json::to_value(&obj)?;
    Ok(PlanObject { name, gvk, raw })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn yaml_string() {
        let y = "apiVersion: apps/v1\nkind: Deployment\nmetadata:\n  name: web\nspec:\n  replicas: 2\n";
        let p = parse_manifest(&json!(y)).unwrap();
        assert_eq!(p.name, "web");
        assert_eq!(p.gvk, Gvk::new("apps", "v1", "Deployment"));
        assert_eq!(p.raw["spec"]["replicas"], 2);
    }

    #[test]
    fn inline_object_and_core_group() {
        let p = parse_manifest(&json!({"apiVersion": "v1", "kind": "Secret", "metadata": {"name": "root-ca"}})).unwrap();
        assert_eq!(p.gvk, Gvk::new("", "v1", "Secret"));
        assert_eq!(p.name, "root-ca");
    }

    #[test]
    fn garbage_is_unprocessable() {
        assert!(matches!(parse_manifest(&json!("- a\n- b")), Err(FleetError::Unprocessable(_))));
        assert!(matches!(parse_manifest(&json!(3)), Err(FleetError::Unprocessable(_))));
        assert!(matches!(parse_manifest(&json!({"metadata": {"name": "x"}})), Err(FleetError::Unprocessable(_))));
    }
}
