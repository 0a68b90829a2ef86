//! Message template processing.
//!
//! Substitutes `{{variable}}` placeholders against lead data and workflow
//! variables. English names are the standard set; Portuguese aliases are
//! kept for templates authored before the rename.

use std::collections::HashMap;

use crate::types::LeadProfile;

/// Substitute `{{key}}` placeholders (case-insensitive on the key).
/// Unknown placeholders collapse to an empty string; runs of whitespace
/// left behind by empty values are normalized.
pub fn process(template: &str, vars: &HashMap<String, String>) -> String {
    let lowered: HashMap<String, &String> =
        vars.iter().map(|(k, v)| (k.to_lowercase(), v)).collect();

    let mut out = String::with_capacity(template.len());
    let mut rest = template;

    while let Some(start) = rest.find("{{") {
        out.push_str(&rest[..start]);
        let after = &rest[start + 2..];
        match after.find("}}") {
            Some(end) => {
                let key = after[..end].trim().to_lowercase();
                if let Some(value) = lowered.get(&key) {
                    out.push_str(value);
                }
                rest = &after[end + 2..];
            }
            None => {
                // Unterminated placeholder: keep literal text.
                out.push_str(&rest[start..]);
                rest = "";
            }
        }
    }
    out.push_str(rest);

    normalize_whitespace(&out)
}

/// List the `{{variable}}` names used by a template.
pub fn used_variables(template: &str) -> Vec<String> {
    let mut found = Vec::new();
    let mut rest = template;
    while let Some(start) = rest.find("{{") {
        let after = &rest[start + 2..];
        match after.find("}}") {
            Some(end) => {
                found.push(after[..end].trim().to_string());
                rest = &after[end + 2..];
            }
            None => break,
        }
    }
    found
}

/// Build the standard substitution map from a lead profile.
/// English variables are canonical; Portuguese aliases map to the same data.
pub fn lead_vars(lead: &LeadProfile) -> HashMap<String, String> {
    let full_name = lead.name.clone().unwrap_or_default();
    let first_name = lead
        .first_name
        .clone()
        .unwrap_or_else(|| full_name.split_whitespace().next().unwrap_or("").to_string());
    let company = lead.company.clone().unwrap_or_default();
    let title = lead.title.clone().unwrap_or_default();
    let location = lead.location.clone().unwrap_or_default();
    let industry = lead.industry.clone().unwrap_or_default();

    let mut vars = HashMap::new();
    vars.insert("first_name".into(), first_name.clone());
    vars.insert("name".into(), full_name.clone());
    vars.insert("company".into(), company.clone());
    vars.insert("title".into(), title.clone());
    vars.insert("location".into(), location.clone());
    vars.insert("industry".into(), industry.clone());
    vars.insert("email".into(), lead.email.clone().unwrap_or_default());

    // Legacy Portuguese aliases.
    vars.insert("primeiro_nome".into(), first_name);
    vars.insert("nome".into(), full_name);
    vars.insert("empresa".into(), company);
    vars.insert("cargo".into(), title);
    vars.insert("localizacao".into(), location);
    vars.insert("industria".into(), industry);

    vars
}

/// Walk a dot path (`a.b.c`) into a JSON value. Array indices are accepted
/// as numeric segments.
pub fn extract_json_path<'a>(
    value: &'a serde_json::Value,
    path: &str,
) -> Option<&'a serde_json::Value> {
    let mut current = value;
    for segment in path.split('.') {
        if segment.is_empty() {
            return None;
        }
        current = match current {
            serde_json::Value::Object(map) => map.get(segment)?,
            serde_json::Value::Array(items) => {
                let idx: usize = segment.parse().ok()?;
                items.get(idx)?
            }
            _ => return None,
        };
    }
    Some(current)
}

fn normalize_whitespace(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    let mut last_was_space = false;
    for ch in s.chars() {
        if ch == ' ' {
            if !last_was_space {
                out.push(ch);
            }
            last_was_space = true;
        } else {
            out.push(ch);
            last_was_space = false;
        }
    }
    out.trim().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn lead() -> LeadProfile {
        LeadProfile {
            id: "lead-1".into(),
            name: Some("Maria Souza".into()),
            company: Some("Acme Corp".into()),
            title: Some("Head of Sales".into()),
            ..LeadProfile::default()
        }
    }

    #[test]
    fn test_substitution() {
        let vars = lead_vars(&lead());
        let rendered = process("Oi {{first_name}}, vi que você trabalha na {{company}}!", &vars);
        assert_eq!(rendered, "Oi Maria, vi que você trabalha na Acme Corp!");
    }

    #[test]
    fn test_portuguese_aliases() {
        let vars = lead_vars(&lead());
        let rendered = process("{{primeiro_nome}} / {{empresa}} / {{cargo}}", &vars);
        assert_eq!(rendered, "Maria / Acme Corp / Head of Sales");
    }

    #[test]
    fn test_unknown_variable_collapses() {
        let vars = lead_vars(&lead());
        let rendered = process("Hello {{nonexistent}} world", &vars);
        assert_eq!(rendered, "Hello world");
    }

    #[test]
    fn test_used_variables() {
        let used = used_variables("{{name}} at {{company}}");
        assert_eq!(used, vec!["name", "company"]);
    }

    #[test]
    fn test_extract_json_path() {
        let value = serde_json::json!({
            "status": "ok",
            "data": { "items": [{"id": 42}] }
        });
        assert_eq!(
            extract_json_path(&value, "status").unwrap(),
            &serde_json::json!("ok")
        );
        assert_eq!(
            extract_json_path(&value, "data.items.0.id").unwrap(),
            &serde_json::json!(42)
        );
        assert!(extract_json_path(&value, "data.missing").is_none());
    }
}
