use log::{debug, error};
use serde_json::Value;

use crate::config::Config;

/// Maps a project's library-construction-method string to a realm module id
/// through the `module_registry.json` registry: exact match first, then the
/// first prefix-flagged entry whose key prefixes the method. Registry
/// iteration order decides ties between prefix entries; callers must not
/// rely on a particular tie-break.
pub struct ModuleResolver {
    registry: Config,
}

impl ModuleResolver {
    pub fn new(registry: Config) -> Self {
        Self { registry }
    }

    pub fn resolve(&self, document: &Value) -> Option<String> {
        let Some(method) = document
            .get("details")
            .and_then(|details| details.get("library_construction_method"))
            .and_then(Value::as_str)
        else {
            error!("Document is missing 'details.library_construction_method'.");
            return None;
        };

        let Some(registry) = self.registry.root().as_object() else {
            error!("Module registry is not a JSON object.");
            return None;
        };

        if let Some(entry) = registry.get(method) {
            return module_of(entry, method);
        }

        for (key, entry) in registry {
            let is_prefix = entry
                .get("prefix")
                .and_then(Value::as_bool)
                .unwrap_or(false);
            if is_prefix && method.starts_with(key.as_str()) {
                return module_of(entry, method);
            }
        }

        // The vast majority of feed documents have no module configured;
        // anything louder than debug here would flood the log.
        debug!("No module configured for method '{method}'.");
        None
    }
}

fn module_of(entry: &Value, method: &str) -> Option<String> {
    match entry.get("module").and_then(Value::as_str) {
        Some(module) => Some(module.to_string()),
        None => {
            error!("Registry entry for '{method}' has no 'module' key.");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn resolver() -> ModuleResolver {
        ModuleResolver::new(Config::from_value(json!({
            "SmartSeq 3": {"module": "smartseq3"},
            "10X Chromium": {"module": "tenx", "prefix": true},
        })))
    }

    #[test]
    fn exact_match_wins() {
        let doc = json!({"details": {"library_construction_method": "SmartSeq 3"}});
        assert_eq!(resolver().resolve(&doc).as_deref(), Some("smartseq3"));
    }

    #[test]
    fn prefix_match_is_a_fallback() {
        let doc = json!({
            "details": {"library_construction_method": "10X Chromium GEX v3"}
        });
        assert_eq!(resolver().resolve(&doc).as_deref(), Some("tenx"));
    }

    #[test]
    fn non_prefix_entries_do_not_prefix_match() {
        let doc = json!({
            "details": {"library_construction_method": "SmartSeq 3 custom variant"}
        });
        assert_eq!(resolver().resolve(&doc), None);
    }

    #[test]
    fn unknown_method_resolves_to_none() {
        let doc = json!({"details": {"library_construction_method": "Unheard Of Kit"}});
        assert_eq!(resolver().resolve(&doc), None);
    }

    #[test]
    fn missing_method_key_resolves_to_none() {
        assert_eq!(resolver().resolve(&json!({"details": {}})), None);
        assert_eq!(resolver().resolve(&json!({})), None);
    }
}
