//! The merge works on raw [`toml::Value`] trees so that a key missing from
//! an upper layer never resets the value below it.

use std::collections::HashSet;

/// Dotted paths of leaf fields set by a config file.
pub type FileSetFields = HashSet<String>;

/// Deep-merge `overlay` into `base`. Tables merge per key; scalars and
/// arrays from the overlay replace the base value.
pub fn deep_merge(base: &mut toml::Value, overlay: &toml::Value) {
    match (base, overlay) {
        (toml::Value::Table(base_table), toml::Value::Table(overlay_table)) => {
            for (key, overlay_val) in overlay_table {
                match base_table.get_mut(key) {
                    Some(base_val) => deep_merge(base_val, overlay_val),
                    None => {
                        base_table.insert(key.clone(), overlay_val.clone());
                    },
                }
            }
        },
        (base, overlay) => *base = overlay.clone(),
    }
}

/// Record the dotted path of every leaf in `val` under `prefix`.
pub fn collect_leaf_paths(val: &toml::Value, prefix: &str, out: &mut FileSetFields) {
    match val {
        toml::Value::Table(table) => {
            for (key, child) in table {
                let path = if prefix.is_empty() {
                    key.clone()
                } else {
                    format!("{prefix}.{key}")
                };
                collect_leaf_paths(child, &path, out);
            }
        },
        _ => {
            out.insert(prefix.to_owned());
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(s: &str) -> toml::Value {
        toml::from_str(s).unwrap()
    }

    #[test]
    fn test_overlay_keeps_unset_siblings() {
        let mut base = parse("[engine]\nunit_timeout_ms = 10\nhealth_timeout_ms = 20\n");
        deep_merge(&mut base, &parse("[engine]\nunit_timeout_ms = 99\n"));

        assert_eq!(base["engine"]["unit_timeout_ms"].as_integer(), Some(99));
        assert_eq!(base["engine"]["health_timeout_ms"].as_integer(), Some(20));
    }

    #[test]
    fn test_arrays_replace() {
        let mut base = parse("[logging]\ndirectives = [\"a\", \"b\"]\n");
        deep_merge(&mut base, &parse("[logging]\ndirectives = [\"c\"]\n"));

        let dirs = base["logging"]["directives"].as_array().unwrap();
        assert_eq!(dirs.len(), 1);
    }

    #[test]
    fn test_collect_leaf_paths() {
        let mut out = FileSetFields::new();
        collect_leaf_paths(
            &parse("[retry]\nmax_attempts = 1\n[logging]\nlevel = \"debug\"\n"),
            "",
            &mut out,
        );

        assert!(out.contains("retry.max_attempts"));
        assert!(out.contains("logging.level"));
        assert_eq!(out.len(), 2);
    }
}
