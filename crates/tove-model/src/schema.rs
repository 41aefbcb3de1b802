// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! Tool-parameter schema sanitizer.
//!
//! The Gemini function-declaration dialect accepts only a small subset of
//! JSON Schema: no `$ref`, no `additionalProperties`, no constraint keywords,
//! no nullable union variants, no `type` sibling next to `anyOf`/`oneOf`.
//! [`sanitize`] rewrites an arbitrary schema into that dialect.
//!
//! The function is pure and idempotent: `sanitize(sanitize(s)) == sanitize(s)`
//! structurally, and it never fails — unknown input passes through minus the
//! forbidden keys.

use serde_json::{json, Map, Value};

/// Keywords the provider rejects.  Dropped wherever they appear.
const FORBIDDEN_KEYS: &[&str] = &[
    "additionalProperties",
    "$schema",
    "$id",
    "$defs",
    "definitions",
    "examples",
    "default",
    "title",
    "id",
    "minLength",
    "maxLength",
    "minimum",
    "maximum",
    "multipleOf",
    "pattern",
    "format",
    "minItems",
    "maxItems",
    "uniqueItems",
    "minProperties",
    "maxProperties",
    "if",
    "then",
    "else",
    "not",
    "dependentRequired",
    "dependentSchemas",
    "patternProperties",
];

/// Normalize a tool-parameter schema to the provider dialect.
pub fn sanitize(schema: &Value) -> Value {
    let defs = collect_defs(schema);
    let cleaned = clean(schema, &defs, &mut Vec::new());
    coerce_top_level(cleaned)
}

/// Local definitions reachable by `#/$defs/*` and `#/definitions/*` refs.
fn collect_defs(schema: &Value) -> Map<String, Value> {
    let mut defs = Map::new();
    if let Some(obj) = schema.as_object() {
        for container in ["$defs", "definitions"] {
            if let Some(map) = obj.get(container).and_then(Value::as_object) {
                for (name, sub) in map {
                    defs.insert(format!("#/{container}/{name}"), sub.clone());
                }
            }
        }
    }
    defs
}

/// Recursive rewrite.  `stack` tracks in-flight `$ref` targets for cycle
/// detection.
fn clean(value: &Value, defs: &Map<String, Value>, stack: &mut Vec<String>) -> Value {
    let obj = match value.as_object() {
        Some(o) => o,
        None => return value.clone(),
    };

    // $ref resolution happens before anything else; the resolved target is
    // cleaned in place of the reference.
    if let Some(target) = obj.get("$ref").and_then(Value::as_str) {
        let site_description = obj.get("description").cloned();
        let resolved = match defs.get(target) {
            Some(t) if !stack.contains(&target.to_string()) => {
                stack.push(target.to_string());
                let out = clean(t, defs, stack);
                stack.pop();
                out
            }
            // Cycle or unresolvable: an empty object schema, keeping only the
            // description so the model still sees the intent.
            _ => Value::Object(Map::new()),
        };
        let mut out = resolved.as_object().cloned().unwrap_or_default();
        if let Some(d) = site_description {
            out.insert("description".into(), d);
        }
        return Value::Object(out);
    }

    let mut out = Map::new();
    for (k, v) in obj {
        if FORBIDDEN_KEYS.contains(&k.as_str()) || k == "const" {
            continue;
        }
        match k.as_str() {
            "properties" => {
                let props = v
                    .as_object()
                    .map(|m| {
                        m.iter()
                            .map(|(name, sub)| (name.clone(), clean(sub, defs, stack)))
                            .collect::<Map<_, _>>()
                    })
                    .unwrap_or_default();
                out.insert(k.clone(), Value::Object(props));
            }
            "items" => {
                let items = match v {
                    Value::Array(list) => {
                        Value::Array(list.iter().map(|s| clean(s, defs, stack)).collect())
                    }
                    other => clean(other, defs, stack),
                };
                out.insert(k.clone(), items);
            }
            "anyOf" | "oneOf" => {
                // handled below so both keys share the union logic
                out.insert(k.clone(), v.clone());
            }
            _ => {
                out.insert(k.clone(), v.clone());
            }
        }
    }

    // const → enum
    if let Some(c) = obj.get("const") {
        if !out.contains_key("enum") {
            out.insert("enum".into(), json!([c]));
        }
    }

    normalize_type(&mut out);

    for key in ["anyOf", "oneOf"] {
        if let Some(raw) = out.remove(key) {
            let variants: Vec<Value> = raw
                .as_array()
                .map(|l| l.iter().map(|v| clean(v, defs, stack)).collect())
                .unwrap_or_default();
            rewrite_union(&mut out, key, variants);
        }
    }

    Value::Object(out)
}

/// `["X","null"]` → `"X"`; single-element arrays → scalar.
fn normalize_type(out: &mut Map<String, Value>) {
    let Some(Value::Array(types)) = out.get("type") else {
        return;
    };
    let non_null: Vec<Value> = types
        .iter()
        .filter(|t| t.as_str() != Some("null"))
        .cloned()
        .collect();
    match non_null.len() {
        0 => {
            out.remove("type");
        }
        1 => {
            out.insert("type".into(), non_null[0].clone());
        }
        _ => {
            out.insert("type".into(), Value::Array(non_null));
        }
    }
}

/// Apply the nullable-stripping, unwrap and literal-flattening rules to a
/// cleaned `anyOf`/`oneOf` variant list, writing the result into `out`.
fn rewrite_union(out: &mut Map<String, Value>, key: &str, variants: Vec<Value>) {
    let non_null: Vec<Value> = variants
        .into_iter()
        .filter(|v| !is_null_variant(v))
        .collect();

    match non_null.len() {
        0 => {}
        1 => {
            // Unwrap the lone survivor into the parent, parent description wins.
            if let Some(fields) = non_null[0].as_object() {
                for (k, v) in fields {
                    if k == "description" && out.contains_key("description") {
                        continue;
                    }
                    out.insert(k.clone(), v.clone());
                }
            }
        }
        _ => {
            if let Some((ty, values)) = literal_union(&non_null) {
                out.insert("type".into(), ty);
                out.insert("enum".into(), Value::Array(values));
            } else {
                out.insert(key.into(), Value::Array(non_null));
                // No sibling type next to a union.
                out.remove("type");
            }
        }
    }
}

fn is_null_variant(v: &Value) -> bool {
    let Some(obj) = v.as_object() else {
        return false;
    };
    if obj.get("type").and_then(Value::as_str) == Some("null") {
        return true;
    }
    // `{const: null}` has already been rewritten to `{enum: [null]}`.
    matches!(obj.get("enum").and_then(Value::as_array), Some(e) if e.len() == 1 && e[0].is_null())
}

/// When every variant is an enum of literals over one common scalar type,
/// return `(type, concatenated values)`.
fn literal_union(variants: &[Value]) -> Option<(Value, Vec<Value>)> {
    let mut ty: Option<&Value> = None;
    let mut values: Vec<Value> = Vec::new();
    for v in variants {
        let obj = v.as_object()?;
        let vty = obj.get("type")?;
        if vty.is_array() || matches!(vty.as_str(), Some("object") | Some("array")) {
            return None;
        }
        match ty {
            None => ty = Some(vty),
            Some(t) if t == vty => {}
            Some(_) => return None,
        }
        let lits = obj.get("enum")?.as_array()?;
        for lit in lits {
            if !values.contains(lit) {
                values.push(lit.clone());
            }
        }
    }
    ty.map(|t| (t.clone(), values))
}

/// Tool parameters must end up as `{type:"object", properties, required?}`.
/// A surviving top-level union of object variants is merged into one object.
fn coerce_top_level(value: Value) -> Value {
    let Some(mut obj) = value.as_object().cloned() else {
        return value;
    };

    for key in ["anyOf", "oneOf"] {
        let Some(variants) = obj.get(key).and_then(Value::as_array).cloned() else {
            continue;
        };
        if !variants.iter().all(is_object_schema) {
            continue;
        }
        let merged = merge_object_variants(&variants);
        obj.remove(key);
        for (k, v) in merged {
            // Parent description survives the merge.
            if k == "description" && obj.contains_key("description") {
                continue;
            }
            obj.insert(k, v);
        }
    }

    let is_object = obj.get("type").and_then(Value::as_str) == Some("object");
    if is_object || obj.contains_key("properties") {
        obj.insert("type".into(), json!("object"));
        obj.entry("properties").or_insert_with(|| json!({}));
    }
    Value::Object(obj)
}

fn is_object_schema(v: &Value) -> bool {
    v.as_object()
        .map(|o| {
            o.get("type").and_then(Value::as_str) == Some("object")
                || o.contains_key("properties")
        })
        .unwrap_or(false)
}

/// Union of keys; `required` is the intersection across variants; properties
/// present in several variants merge enum values and reconcile scalar types.
fn merge_object_variants(variants: &[Value]) -> Map<String, Value> {
    let mut properties: Map<String, Value> = Map::new();
    let mut required: Option<Vec<Value>> = None;

    for v in variants {
        let Some(obj) = v.as_object() else { continue };
        if let Some(props) = obj.get("properties").and_then(Value::as_object) {
            for (name, sub) in props {
                match properties.get(name) {
                    None => {
                        properties.insert(name.clone(), sub.clone());
                    }
                    Some(existing) => {
                        let merged = merge_property(existing, sub);
                        properties.insert(name.clone(), merged);
                    }
                }
            }
        }
        let this_required: Vec<Value> = obj
            .get("required")
            .and_then(Value::as_array)
            .cloned()
            .unwrap_or_default();
        required = Some(match required {
            None => this_required,
            Some(acc) => acc
                .into_iter()
                .filter(|r| this_required.contains(r))
                .collect(),
        });
    }

    let mut out = Map::new();
    out.insert("type".into(), json!("object"));
    out.insert("properties".into(), Value::Object(properties));
    if let Some(req) = required {
        if !req.is_empty() {
            out.insert("required".into(), Value::Array(req));
        }
    }
    out
}

fn merge_property(a: &Value, b: &Value) -> Value {
    if a == b {
        return a.clone();
    }
    let (Some(ao), Some(bo)) = (a.as_object(), b.as_object()) else {
        return a.clone();
    };
    let same_type = ao.get("type").is_some() && ao.get("type") == bo.get("type");
    if same_type {
        if let (Some(ae), Some(be)) = (
            ao.get("enum").and_then(Value::as_array),
            bo.get("enum").and_then(Value::as_array),
        ) {
            let mut merged = ae.clone();
            for v in be {
                if !merged.contains(v) {
                    merged.push(v.clone());
                }
            }
            let mut out = ao.clone();
            out.insert("enum".into(), Value::Array(merged));
            return Value::Object(out);
        }
        return a.clone();
    }
    a.clone()
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
