//! Model configuration and server catalog resolution.
//!
//! A configured `provider<sep>model` string is resolved against the running
//! server's provider catalog. Resolution never fails hard: anything that
//! cannot be matched degrades to the server default with a warning.

use std::{
    collections::HashMap,
    path::PathBuf,
};

use serde::{Deserialize, Serialize};
use serde_json::Value;
use utils::msg;

use crate::client::{AgentClient, ClientError};

/// Wire-format model selector sent to the agent server.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModelRef {
    #[serde(rename = "providerID")]
    pub provider_id: String,
    #[serde(rename = "modelID")]
    pub model_id: String,
}

/// Parse a `provider:model` / `provider/model` spec.
///
/// Splits on whichever separator appears first, so the model id can itself
/// contain the other separator:
/// `openrouter:anthropic/claude-sonnet-4` and
/// `openrouter/deepseek/deepseek-r1:free` both resolve correctly.
pub fn parse_model_spec(spec: &str) -> Option<ModelRef> {
    let spec = spec.trim();
    if spec.is_empty() {
        return None;
    }
    let colon = spec.find(':');
    let slash = spec.find('/');
    let sep = match (colon, slash) {
        (None, None) => return None,
        (Some(c), None) => c,
        (None, Some(s)) => s,
        (Some(c), Some(s)) => c.min(s),
    };
    let provider_id = spec[..sep].trim();
    let model_id = spec[sep + 1..].trim();
    if provider_id.is_empty() || model_id.is_empty() {
        return None;
    }
    Some(ModelRef {
        provider_id: provider_id.to_string(),
        model_id: model_id.to_string(),
    })
}

#[derive(Debug, Clone, Default)]
pub struct ProviderEntry {
    pub name: String,
    /// canonical model id → display name
    pub models: HashMap<String, String>,
    /// alias (key, id, or display name) → canonical id
    pub aliases: HashMap<String, String>,
}

pub type Catalog = HashMap<String, ProviderEntry>;

fn add_provider(catalog: &mut Catalog, provider_id: Option<&Value>, provider_data: &Value) {
    let Some(provider_id) = provider_id.and_then(value_as_id) else {
        return;
    };
    let Some(provider_obj) = provider_data.as_object() else {
        return;
    };
    let entry = catalog.entry(provider_id.clone()).or_insert_with(|| ProviderEntry {
        name: provider_obj
            .get("name")
            .and_then(Value::as_str)
            .map(|s| s.to_string())
            .unwrap_or_else(|| provider_id.clone()),
        ..Default::default()
    });

    match provider_obj.get("models") {
        Some(Value::Object(models)) => {
            for (model_key, model_data) in models {
                let mut canonical_id = model_key.clone();
                let mut model_name = canonical_id.clone();
                let mut aliases = vec![canonical_id.clone()];
                if let Some(model_obj) = model_data.as_object() {
                    if let Some(explicit) = model_obj.get("id").and_then(value_as_id) {
                        canonical_id = explicit;
                    }
                    model_name = model_obj
                        .get("name")
                        .and_then(Value::as_str)
                        .map(|s| s.to_string())
                        .unwrap_or_else(|| canonical_id.clone());
                    aliases.push(model_key.clone());
                    aliases.push(canonical_id.clone());
                    aliases.push(model_name.clone());
                }
                entry.models.insert(canonical_id.clone(), model_name);
                for alias in aliases {
                    entry.aliases.insert(alias, canonical_id.clone());
                }
            }
        }
        Some(Value::Array(models)) => {
            for model_data in models {
                let Some(model_obj) = model_data.as_object() else {
                    continue;
                };
                let Some(canonical_id) = model_obj
                    .get("id")
                    .or_else(|| model_obj.get("modelID"))
                    .and_then(value_as_id)
                else {
                    continue;
                };
                let model_name = model_obj
                    .get("name")
                    .and_then(Value::as_str)
                    .map(|s| s.to_string())
                    .unwrap_or_else(|| canonical_id.clone());
                entry.models.insert(canonical_id.clone(), model_name.clone());
                entry.aliases.insert(canonical_id.clone(), canonical_id.clone());
                entry.aliases.insert(model_name, canonical_id);
            }
        }
        _ => {}
    }
}

fn value_as_id(value: &Value) -> Option<String> {
    match value {
        Value::String(s) if !s.is_empty() => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

/// Parse the `/config/providers` payload into a catalog plus server default.
///
/// Accepts the three shapes seen in the wild:
/// `{providers: [...], default: {provider: model}}`,
/// `{providerID: {name, models, ...}, ...}`, and
/// `[{id/providerID, name, models}, ...]`.
pub fn parse_catalog(raw: &Value) -> (Catalog, Option<ModelRef>) {
    let mut catalog = Catalog::new();
    let mut default_model = None;

    if let Some(obj) = raw.as_object() {
        if let Some(Value::Array(providers)) = obj.get("providers") {
            for provider in providers {
                let id = provider.get("id").or_else(|| provider.get("providerID"));
                add_provider(&mut catalog, id, provider);
            }
            if let Some(Value::Object(default)) = obj.get("default") {
                for (provider_id, model_id) in default {
                    if let (false, Some(model_id)) = (provider_id.is_empty(), value_as_id(model_id))
                    {
                        default_model = Some(ModelRef {
                            provider_id: provider_id.clone(),
                            model_id,
                        });
                        break;
                    }
                }
            }
            return (catalog, default_model);
        }

        for (provider_id, provider_data) in obj {
            let Some(pd) = provider_data.as_object() else {
                continue;
            };
            if !pd.contains_key("models") && !pd.contains_key("name") {
                continue;
            }
            add_provider(
                &mut catalog,
                Some(&Value::String(provider_id.clone())),
                provider_data,
            );
        }
        return (catalog, default_model);
    }

    if let Some(providers) = raw.as_array() {
        for provider in providers {
            let id = provider.get("id").or_else(|| provider.get("providerID"));
            add_provider(&mut catalog, id, provider);
        }
    }
    (catalog, default_model)
}

/// Resolve a model against the catalog by canonical id, alias, or preferred
/// display name. Returns `(resolved, provider_label, model_label)`.
fn resolve_in_catalog(
    catalog: &Catalog,
    model_spec: &ModelRef,
    preferred: Option<&str>,
) -> Option<(ModelRef, String, String)> {
    let entry = catalog.get(&model_spec.provider_id)?;
    let canonical_id = if entry.models.contains_key(&model_spec.model_id) {
        Some(model_spec.model_id.clone())
    } else if let Some(id) = entry.aliases.get(&model_spec.model_id) {
        Some(id.clone())
    } else {
        preferred.and_then(|p| entry.aliases.get(p)).cloned()
    }?;
    let label = entry
        .models
        .get(&canonical_id)
        .cloned()
        .unwrap_or_else(|| canonical_id.clone());
    Some((
        ModelRef {
            provider_id: model_spec.provider_id.clone(),
            model_id: canonical_id,
        },
        entry.name.clone(),
        label,
    ))
}

/// Outcome of model selection against the running server.
#[derive(Debug, Clone, Default)]
pub struct ChosenModel {
    /// Payload to send, or `None` to let the server pick its default.
    pub model: Option<ModelRef>,
    pub provider_label: Option<String>,
    pub model_label: Option<String>,
    pub warning: Option<String>,
}

/// Choose the model to request, degrading to the server default when the
/// configured one is unavailable. Never errors: catalog fetch failures keep
/// the requested model as-is.
pub async fn choose_server_model(
    client: &AgentClient,
    requested: Option<ModelRef>,
    preferred_name: Option<&str>,
    directory: Option<&str>,
) -> ChosenModel {
    let raw = match client.get_providers(directory).await {
        Ok(Some(raw)) => raw,
        _ => {
            return ChosenModel {
                model: requested,
                model_label: preferred_name.map(|s| s.to_string()),
                ..Default::default()
            };
        }
    };
    let (catalog, default_model) = parse_catalog(&raw);

    if let Some(requested) = requested {
        if let Some((resolved, provider_label, model_label)) =
            resolve_in_catalog(&catalog, &requested, preferred_name)
        {
            return ChosenModel {
                model: Some(resolved),
                provider_label: Some(provider_label),
                model_label: Some(model_label),
                warning: None,
            };
        }
        let warning = format!(
            "Configured model {}:{} is not available on this running server; \
using server default model instead.",
            requested.provider_id, requested.model_id
        );
        if let Some(default) = default_model
            && let Some((_, provider_label, model_label)) =
                resolve_in_catalog(&catalog, &default, None)
        {
            // None payload explicitly lets the server choose its default.
            return ChosenModel {
                model: None,
                provider_label: Some(provider_label),
                model_label: Some(model_label),
                warning: Some(warning),
            };
        }
        return ChosenModel {
            warning: Some(warning),
            ..Default::default()
        };
    }

    if let Some(default) = default_model
        && let Some((_, provider_label, model_label)) = resolve_in_catalog(&catalog, &default, None)
    {
        return ChosenModel {
            model: None,
            provider_label: Some(provider_label),
            model_label: Some(model_label),
            warning: None,
        };
    }
    ChosenModel::default()
}

fn config_path() -> PathBuf {
    if let Ok(path) = std::env::var("OPENCODE_CONFIG_PATH") {
        return PathBuf::from(shellexpand::tilde(&path).into_owned());
    }
    dirs::home_dir()
        .unwrap_or_default()
        .join(".config/opencode/config.json")
}

/// Resolve the configured model: `OPENCODE_MODEL` first, then the opencode
/// config file's agent/mode/global model strings, then the first custom
/// provider/model. A malformed env spec warns and falls through.
///
/// Returns `(model, preferred_display_name)`.
pub fn resolve_model(agent: &str) -> (Option<ModelRef>, Option<String>) {
    if let Ok(env_model) = std::env::var("OPENCODE_MODEL")
        && !env_model.is_empty()
    {
        if let Some(parsed) = parse_model_spec(&env_model) {
            return (Some(parsed), None);
        }
        msg::warn(format!(
            "Ignoring invalid OPENCODE_MODEL={env_model:?} (expected provider/model or provider:model)."
        ));
    }

    let path = config_path();
    if !path.exists() {
        return (None, None);
    }
    let cfg: Value = match std::fs::read_to_string(&path)
        .map_err(|e| e.to_string())
        .and_then(|text| serde_json::from_str(&text).map_err(|e| e.to_string()))
    {
        Ok(cfg) => cfg,
        Err(err) => {
            msg::warn(format!("Could not read {}: {err}", path.display()));
            return (None, None);
        }
    };

    let candidates = [
        cfg.pointer(&format!("/agent/{agent}/model")),
        // deprecated config field
        cfg.pointer(&format!("/mode/{agent}/model")),
        cfg.get("model"),
    ];
    for candidate in candidates.into_iter().flatten() {
        if let Some(spec) = candidate.as_str()
            && let Some(parsed) = parse_model_spec(spec)
        {
            return (Some(parsed), None);
        }
    }

    // No default model string configured: fall back to the first custom
    // provider/model entry.
    if let Some(Value::Object(providers)) = cfg.get("provider") {
        for (provider_id, provider_data) in providers {
            let Some(Value::Object(models)) = provider_data.get("models") else {
                continue;
            };
            for (model_key, model_data) in models {
                if provider_id.is_empty() || model_key.is_empty() {
                    continue;
                }
                let (model_id, name) = match model_data.as_object() {
                    Some(obj) => (
                        obj.get("id")
                            .and_then(Value::as_str)
                            .unwrap_or(model_key)
                            .to_string(),
                        obj.get("name").and_then(Value::as_str).map(|s| s.to_string()),
                    ),
                    None => (model_key.clone(), None),
                };
                return (
                    Some(ModelRef {
                        provider_id: provider_id.clone(),
                        model_id,
                    }),
                    name,
                );
            }
        }
    }
    (None, None)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn spec_splits_on_first_separator() {
        assert_eq!(
            parse_model_spec("openrouter:anthropic/claude-sonnet-4"),
            Some(ModelRef {
                provider_id: "openrouter".to_string(),
                model_id: "anthropic/claude-sonnet-4".to_string(),
            })
        );
        assert_eq!(
            parse_model_spec("openrouter/deepseek/deepseek-r1:free"),
            Some(ModelRef {
                provider_id: "openrouter".to_string(),
                model_id: "deepseek/deepseek-r1:free".to_string(),
            })
        );
    }

    #[test]
    fn spec_rejects_malformed_input() {
        assert_eq!(parse_model_spec(""), None);
        assert_eq!(parse_model_spec("nomodel"), None);
        assert_eq!(parse_model_spec(":model"), None);
        assert_eq!(parse_model_spec("provider:"), None);
    }

    #[test]
    fn catalog_shape_providers_list_with_default() {
        let raw = json!({
            "providers": [
                {"id": "anthropic", "name": "Anthropic", "models": {
                    "claude-sonnet-4": {"name": "Claude Sonnet 4"},
                }},
            ],
            "default": {"anthropic": "claude-sonnet-4"},
        });
        let (catalog, default) = parse_catalog(&raw);
        assert!(catalog["anthropic"].models.contains_key("claude-sonnet-4"));
        assert_eq!(
            default,
            Some(ModelRef {
                provider_id: "anthropic".to_string(),
                model_id: "claude-sonnet-4".to_string(),
            })
        );
    }

    #[test]
    fn catalog_shape_keyed_object() {
        let raw = json!({
            "openai": {"name": "OpenAI", "models": {"gpt-5.2": {"name": "GPT-5.2"}}},
            "junk": "not a provider",
        });
        let (catalog, default) = parse_catalog(&raw);
        assert_eq!(catalog.len(), 1);
        assert_eq!(catalog["openai"].models["gpt-5.2"], "GPT-5.2");
        assert!(default.is_none());
    }

    #[test]
    fn catalog_shape_bare_list_with_model_list() {
        let raw = json!([
            {"providerID": "zai", "name": "ZAI", "models": [
                {"id": "glm-5", "name": "GLM 5"},
                "garbage",
            ]},
        ]);
        let (catalog, _) = parse_catalog(&raw);
        assert_eq!(catalog["zai"].models["glm-5"], "GLM 5");
        assert_eq!(catalog["zai"].aliases["GLM 5"], "glm-5");
    }

    #[test]
    fn resolve_by_alias_and_display_name() {
        let raw = json!({
            "openrouter": {"name": "OpenRouter", "models": {
                "anthropic/claude-sonnet-4": {"id": "anthropic/claude-sonnet-4", "name": "Claude Sonnet 4"},
            }},
        });
        let (catalog, _) = parse_catalog(&raw);

        let direct = resolve_in_catalog(
            &catalog,
            &ModelRef {
                provider_id: "openrouter".to_string(),
                model_id: "anthropic/claude-sonnet-4".to_string(),
            },
            None,
        );
        assert!(direct.is_some());

        let by_name = resolve_in_catalog(
            &catalog,
            &ModelRef {
                provider_id: "openrouter".to_string(),
                model_id: "Claude Sonnet 4".to_string(),
            },
            None,
        );
        assert_eq!(by_name.unwrap().0.model_id, "anthropic/claude-sonnet-4");

        let by_preferred = resolve_in_catalog(
            &catalog,
            &ModelRef {
                provider_id: "openrouter".to_string(),
                model_id: "unknown-id".to_string(),
            },
            Some("Claude Sonnet 4"),
        );
        assert_eq!(by_preferred.unwrap().0.model_id, "anthropic/claude-sonnet-4");

        let missing_provider = resolve_in_catalog(
            &catalog,
            &ModelRef {
                provider_id: "nope".to_string(),
                model_id: "x".to_string(),
            },
            None,
        );
        assert!(missing_provider.is_none());
    }

    #[test]
    fn model_ref_serializes_to_wire_names() {
        let value = serde_json::to_value(ModelRef {
            provider_id: "openai".to_string(),
            model_id: "gpt-5.2".to_string(),
        })
        .unwrap();
        assert_eq!(value, json!({"providerID": "openai", "modelID": "gpt-5.2"}));
    }
}
