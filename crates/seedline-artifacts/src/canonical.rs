use seedline_db::Record;
use serde_json::Value;

/// Compact JSON with object keys sorted at every depth.
///
/// Byte-stable for equal values regardless of how the map was built.
pub fn canonical_json(v: &Value) -> String {
    let mut out = String::new();
    write_canonical(v, &mut out);
    out
}

pub fn canonical_record(record: &Record) -> String {
    let mut out = String::from("{");
    for (i, (k, v)) in record.iter().enumerate() {
        if i > 0 {
            out.push(',');
        }
        out.push_str(&Value::from(k.as_str()).to_string());
        out.push(':');
        write_canonical(v, &mut out);
    }
    out.push('}');
    out
}

fn write_canonical(v: &Value, out: &mut String) {
    match v {
        Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            out.push('{');
            for (i, k) in keys.into_iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                out.push_str(&Value::from(k.as_str()).to_string());
                out.push(':');
                write_canonical(&map[k], out);
            }
            out.push('}');
        }
        Value::Array(items) => {
            out.push('[');
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                write_canonical(item, out);
            }
            out.push(']');
        }
        scalar => out.push_str(&scalar.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn nested_keys_are_sorted_without_whitespace() {
        let v = json!({"b": {"z": 1, "a": [true, null]}, "a": "x y"});
        assert_eq!(canonical_json(&v), r#"{"a":"x y","b":{"a":[true,null],"z":1}}"#);
    }

    #[test]
    fn strings_are_escaped() {
        let v = json!({"q": "say \"hi\"\n"});
        assert_eq!(canonical_json(&v), r#"{"q":"say \"hi\"\n"}"#);
    }
}
