use std::collections::BTreeMap;

/// Label name carrying the unique series name.
pub const UNIQUE_NAME_LABEL: &str = "uniquename";
/// Prometheus metric-name label.
pub const METRIC_NAME_LABEL: &str = "__name__";

/// Label name to value; iteration order is the canonical (sorted) order.
pub type LabelSet = BTreeMap<String, String>;

/// `{k1="v1", k2="v2"}` in canonical order. Used as Loki stream selector and
/// as Prometheus series selector.
pub fn selector(labels: &LabelSet) -> String {
    let pairs: Vec<String> = labels
        .iter()
        .map(|(k, v)| format!("{k}=\"{}\"", escape_value(v)))
        .collect();
    format!("{{{}}}", pairs.join(", "))
}

fn escape_value(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    for c in value.chars() {
        match c {
            '\\' => out.push_str("\\\\"),
            '"' => out.push_str("\\\""),
            '\n' => out.push_str("\\n"),
            c => out.push(c),
        }
    }
    out
}

/// Prometheus metric names cannot contain dashes.
pub fn metric_name_for(series_name: &str) -> String {
    series_name.replace('-', "_")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn selector_is_canonical() {
        let mut a = LabelSet::new();
        a.insert("zone".into(), "b".into());
        a.insert("app".into(), "x".into());
        let mut b = LabelSet::new();
        b.insert("app".into(), "x".into());
        b.insert("zone".into(), "b".into());
        assert_eq!(selector(&a), selector(&b));
        assert_eq!(selector(&a), r#"{app="x", zone="b"}"#);
    }

    #[test]
    fn selector_escapes_quotes() {
        let labels = LabelSet::from([("k".to_string(), r#"a"b"#.to_string())]);
        assert_eq!(selector(&labels), r#"{k="a\"b"}"#);
    }

    #[test]
    fn metric_name_replaces_dashes() {
        assert_eq!(metric_name_for("run-abc-0001"), "run_abc_0001");
    }
}
