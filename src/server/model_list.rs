use axum::http::Method;
use serde_json::Value;

use crate::groups::Group;

/// Model-list responses get a chance to be filtered per group policy.
pub fn should_intercept_model_list(path: &str, method: &Method) -> bool {
    method == Method::GET && path.trim_end_matches('/').ends_with("/models")
}

/// Keeps only the model ids named by the group's filter. An empty filter, a
/// non-OpenAI response shape, or unparsable JSON all mean "pass through".
pub fn filter_model_list(body: &[u8], group: &Group) -> Option<Vec<u8>> {
    if group.config.model_filter.is_empty() {
        return None;
    }

    let mut value: Value = serde_json::from_slice(body).ok()?;
    let data = value.get_mut("data")?.as_array_mut()?;

    data.retain(|model| {
        model
            .get("id")
            .and_then(Value::as_str)
            .is_some_and(|id| group.config.model_filter.iter().any(|kept| kept == id))
    });

    serde_json::to_vec(&value).ok()
}
