// Conversion of JS values into plain JSON before they leave the boundary

use rquickjs::{convert::Coerced, Ctx, Value};
use serde_json::{Map, Number, Value as Json};

/// Placeholder substituted for function values
pub const FUNCTION_PLACEHOLDER: &str = "[Function]";

/// Placeholder for values JSON cannot represent (cycles past the depth bound)
pub const UNSERIALIZABLE_PLACEHOLDER: &str = "[Unserializable]";

/// Convert a JS value to JSON, replacing functions with a placeholder
///
/// Containers are walked structurally for `depth` levels. Below that, and for
/// objects that define `toJSON` (e.g. `Date`), the engine's `JSON.stringify`
/// takes over. Object properties holding `undefined` are omitted.
pub fn to_json<'js>(ctx: &Ctx<'js>, value: &Value<'js>, depth: usize) -> rquickjs::Result<Json> {
    if value.is_undefined() || value.is_null() {
        return Ok(Json::Null);
    }
    if let Some(b) = value.as_bool() {
        return Ok(Json::Bool(b));
    }
    if let Some(i) = value.as_int() {
        return Ok(Json::Number(i.into()));
    }
    if let Some(f) = value.as_float() {
        return Ok(Number::from_f64(f).map(Json::Number).unwrap_or(Json::Null));
    }
    if let Some(s) = value.as_string() {
        return Ok(Json::String(s.to_string()?));
    }
    if value.is_function() {
        return Ok(Json::String(FUNCTION_PLACEHOLDER.to_string()));
    }

    if let Some(array) = value.as_array() {
        if depth == 0 {
            return stringify(ctx, value);
        }
        let mut items = Vec::with_capacity(array.len());
        for item in array.iter::<Value>() {
            items.push(to_json(ctx, &item?, depth - 1)?);
        }
        return Ok(Json::Array(items));
    }

    if let Some(object) = value.as_object() {
        let to_json_hook: Value = object.get("toJSON")?;
        if depth == 0 || to_json_hook.is_function() {
            return stringify(ctx, value);
        }
        let mut map = Map::new();
        for prop in object.props::<String, Value>() {
            let (key, item) = prop?;
            if item.is_undefined() {
                continue;
            }
            map.insert(key, to_json(ctx, &item, depth - 1)?);
        }
        return Ok(Json::Object(map));
    }

    // Symbols and other exotic primitives
    Ok(Json::Null)
}

/// Convert a JSON value into a fresh JS value
pub fn from_json<'js>(ctx: &Ctx<'js>, value: &Json) -> rquickjs::Result<Value<'js>> {
    ctx.json_parse(value.to_string())
}

/// `String(value)`, for diagnostics
pub fn display<'js>(value: &Value<'js>) -> String {
    value
        .get::<Coerced<String>>()
        .map(|s| s.0)
        .unwrap_or_else(|_| "[object]".to_string())
}

fn stringify<'js>(ctx: &Ctx<'js>, value: &Value<'js>) -> rquickjs::Result<Json> {
    let text = match ctx.json_stringify(value.clone()) {
        Ok(Some(text)) => text.to_string()?,
        Ok(None) => return Ok(Json::Null),
        Err(_) => {
            // The thrown TypeError is left pending on the context
            let _ = ctx.catch();
            return Ok(Json::String(UNSERIALIZABLE_PLACEHOLDER.to_string()));
        }
    };
    Ok(serde_json::from_str(&text).unwrap_or(Json::Null))
}

#[cfg(test)]
mod tests {
    use super::*;
    use rquickjs::{Context, Runtime};
    use serde_json::json;

    fn eval_json(code: &str, depth: usize) -> Json {
        let rt = Runtime::new().unwrap();
        let ctx = Context::full(&rt).unwrap();
        ctx.with(|ctx| {
            let value: Value = ctx.eval(code).unwrap();
            to_json(&ctx, &value, depth).unwrap()
        })
    }

    #[test]
    fn plain_data_passes_through() {
        let out = eval_json(r#"({ success: true, data: { id: "x", n: 1.5, list: [1, null] } })"#, 5);
        assert_eq!(out, json!({"success": true, "data": {"id": "x", "n": 1.5, "list": [1, null]}}));
    }

    #[test]
    fn functions_become_placeholders() {
        let out = eval_json("({ run: function () {}, nested: [() => 1] })", 5);
        assert_eq!(out, json!({"run": "[Function]", "nested": ["[Function]"]}));
    }

    #[test]
    fn undefined_properties_are_omitted() {
        let out = eval_json("({ a: undefined, b: 1 })", 5);
        assert_eq!(out, json!({"b": 1}));
    }

    #[test]
    fn deep_values_fall_back_to_json_stringify() {
        let out = eval_json("({ a: { b: { c: { f: function () {}, d: 1 } } } })", 2);
        // Past the bound functions are dropped the way JSON.stringify drops them
        assert_eq!(out, json!({"a": {"b": {"c": {"d": 1}}}}));
    }

    #[test]
    fn dates_use_to_json() {
        let out = eval_json("({ at: new Date(0) })", 5);
        assert_eq!(out, json!({"at": "1970-01-01T00:00:00.000Z"}));
    }

    #[test]
    fn cycles_past_the_bound_are_placeholders() {
        let out = eval_json("(function () { var a = {}; a.self = a; return a; })()", 1);
        assert_eq!(out, json!({"self": "[Unserializable]"}));
    }

    #[test]
    fn non_finite_numbers_become_null() {
        assert_eq!(eval_json("NaN", 5), Json::Null);
        assert_eq!(eval_json("42", 5), json!(42));
    }
}
