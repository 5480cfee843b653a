//! Vector Search endpoint permission grants for a service principal.
//!
//! Runs against the workspace API with the Azure workspace resource id (and,
//! when available, a management-plane token) in extra headers. Older
//! workspaces do not accept PATCH on the permissions endpoint, so a 404/405
//! response falls back to PUT.

use crate::api::{ControlPlane, Method};
use crate::resolve;
use anyhow::{anyhow, Result};
use serde_json::{json, Value};

#[derive(Debug)]
pub struct GrantRequest<'a> {
    pub endpoint_name: &'a str,
    pub service_principal_app_id: &'a str,
    pub permission_level: &'a str,
    pub skip_if_missing: bool,
}

#[derive(Debug, PartialEq, Eq)]
pub enum GrantOutcome {
    Granted,
    SkippedMissing,
}

/// Find the named endpoint in a listing; the envelope key varies by API
/// vintage.
fn resolve_endpoint(listing: &Value, name: &str) -> Option<Value> {
    let items = if let Some(items) = listing.as_array() {
        items.clone()
    } else {
        ["endpoints", "vector_search_endpoints", "items"]
            .iter()
            .find_map(|key| listing.get(*key).and_then(Value::as_array).cloned())
            .unwrap_or_default()
    };
    items
        .into_iter()
        .find(|item| item.get("name").and_then(Value::as_str) == Some(name))
}

fn endpoint_id(endpoint: &Value) -> Option<String> {
    endpoint
        .get("endpoint_id")
        .or_else(|| endpoint.get("id"))
        .or_else(|| endpoint.get("endpoint").and_then(|inner| inner.get("endpoint_id")))
        .and_then(Value::as_str)
        .map(str::to_string)
}

/// Grant the requested permission level on the endpoint to the service
/// principal. The principal must already exist in the workspace.
pub fn grant(api: &dyn ControlPlane, request: &GrantRequest<'_>) -> Result<GrantOutcome> {
    let listing = api.call(Method::Get, "/api/2.0/vector-search/endpoints", None)?;
    let Some(endpoint) = resolve_endpoint(&listing, request.endpoint_name) else {
        if request.skip_if_missing {
            println!("Endpoint '{}' not found; skipping.", request.endpoint_name);
            return Ok(GrantOutcome::SkippedMissing);
        }
        return Err(anyhow!("Endpoint '{}' not found.", request.endpoint_name));
    };
    let endpoint_id = endpoint_id(&endpoint).ok_or_else(|| {
        anyhow!(
            "Could not resolve endpoint_id for '{}': {endpoint}",
            request.endpoint_name
        )
    })?;
    if resolve::service_principal_id(api, request.service_principal_app_id)?.is_none() {
        return Err(anyhow!(
            "Service principal {} not found in this workspace.",
            request.service_principal_app_id
        ));
    }
    let path = format!("/api/2.0/permissions/vector-search-endpoints/{endpoint_id}");
    let payload = json!({
        "access_control_list": [{
            "service_principal_name": request.service_principal_app_id,
            "permission_level": request.permission_level,
        }]
    });
    match api.call(Method::Patch, &path, Some(&payload)) {
        Ok(_) => {}
        Err(err) if matches!(err.status(), Some(404 | 405)) => {
            api.call(Method::Put, &path, Some(&payload))?;
        }
        Err(err) => return Err(err.into()),
    }
    println!(
        "Granted {} on '{}' to {}.",
        request.permission_level, request.endpoint_name, request.service_principal_app_id
    );
    Ok(GrantOutcome::Granted)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::ApiError;
    use std::cell::RefCell;

    struct FakeApi {
        patch_status: Option<u16>,
        calls: RefCell<Vec<(Method, String)>>,
    }

    impl FakeApi {
        fn new(patch_status: Option<u16>) -> Self {
            FakeApi {
                patch_status,
                calls: RefCell::new(Vec::new()),
            }
        }
    }

    impl ControlPlane for FakeApi {
        fn call(
            &self,
            method: Method,
            path: &str,
            _body: Option<&Value>,
        ) -> Result<Value, ApiError> {
            self.calls.borrow_mut().push((method, path.to_string()));
            if path == "/api/2.0/vector-search/endpoints" {
                return Ok(json!({ "vector_search_endpoints": [
                    { "name": "other", "endpoint_id": "e0" },
                    { "name": "rag-vs", "endpoint": { "endpoint_id": "e1" } },
                ]}));
            }
            if path.starts_with("/api/2.0/preview/scim/v2/ServicePrincipals") {
                return Ok(json!({ "Resources": [{ "applicationId": "app-1", "id": "9" }] }));
            }
            if method == Method::Patch {
                if let Some(status) = self.patch_status {
                    return Err(ApiError::Status {
                        status,
                        code: None,
                        body: "method not allowed".to_string(),
                    });
                }
            }
            Ok(Value::Null)
        }
    }

    fn request(skip_if_missing: bool) -> GrantRequest<'static> {
        GrantRequest {
            endpoint_name: "rag-vs",
            service_principal_app_id: "app-1",
            permission_level: "CAN_MANAGE",
            skip_if_missing,
        }
    }

    #[test]
    fn nested_endpoint_id_and_patch_path() {
        let api = FakeApi::new(None);
        assert_eq!(grant(&api, &request(false)).unwrap(), GrantOutcome::Granted);
        let calls = api.calls.borrow();
        let patch = calls.iter().find(|(m, _)| *m == Method::Patch).unwrap();
        assert_eq!(patch.1, "/api/2.0/permissions/vector-search-endpoints/e1");
        assert!(!calls.iter().any(|(m, _)| *m == Method::Put));
    }

    #[test]
    fn method_not_allowed_falls_back_to_put() {
        let api = FakeApi::new(Some(405));
        assert_eq!(grant(&api, &request(false)).unwrap(), GrantOutcome::Granted);
        let calls = api.calls.borrow();
        assert!(calls.iter().any(|(m, _)| *m == Method::Put));
    }

    #[test]
    fn missing_endpoint_skips_or_fails() {
        let api = FakeApi::new(None);
        let mut req = request(true);
        req.endpoint_name = "absent";
        assert_eq!(grant(&api, &req).unwrap(), GrantOutcome::SkippedMissing);
        req.skip_if_missing = false;
        let err = grant(&api, &req).unwrap_err();
        assert!(err.to_string().contains("'absent' not found"));
    }

    #[test]
    fn unknown_service_principal_is_fatal() {
        let api = FakeApi::new(None);
        let mut req = request(false);
        req.service_principal_app_id = "app-unknown";
        let err = grant(&api, &req).unwrap_err();
        assert!(err.to_string().contains("app-unknown"));
    }
}
