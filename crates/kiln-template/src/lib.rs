//! kiln-template — template slot handling for Kiln.
//!
//! Templates are worker skeletons whose files contain `{{name}}` slots,
//! where `name` matches `[A-Za-z_][A-Za-z0-9_]*`. No nesting, no
//! conditionals; interpolation is purely textual and never parses source.
//!
//! Three operations: slot extraction across a file set, validation of the
//! slot-closure invariant at template write time, and interpolation of
//! caller values (falling back to declared defaults) into a concrete
//! source tree. Preview is interpolation without side effects.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::OnceLock;

use regex::Regex;

use kiln_core::{Error, FileMap, Result, SlotSpec, TemplateRecord};

fn slot_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"\{\{([A-Za-z_][A-Za-z0-9_]*)\}\}").expect("slot pattern compiles")
    })
}

/// Union of all slot names appearing in any file.
pub fn extract_slot_names(files: &FileMap) -> BTreeSet<String> {
    let mut names = BTreeSet::new();
    for content in files.values() {
        for captures in slot_regex().captures_iter(content) {
            names.insert(captures[1].to_string());
        }
    }
    names
}

/// Enforce slot closure: every `{{name}}` in the files must be declared.
///
/// Fails with `Error::Validation` naming the first offending slot (files
/// in path order, occurrences in file order).
pub fn validate_template(template: &TemplateRecord) -> Result<()> {
    let declared: BTreeSet<&str> = template.slots.iter().map(|s| s.name.as_str()).collect();
    for (path, content) in &template.files {
        for captures in slot_regex().captures_iter(content) {
            let name = &captures[1];
            if !declared.contains(name) {
                return Err(Error::Validation(format!(
                    "undeclared slot {{{{{name}}}}} in {path}"
                )));
            }
        }
    }
    Ok(())
}

/// Substitute slot values into the file set.
///
/// Each occurrence of `{{name}}` is replaced by the caller's value for
/// `name`, falling back to the slot's declared default. A slot that
/// appears in the files with neither a value nor a default is an
/// `Error::Validation`.
pub fn interpolate(
    files: &FileMap,
    slots: &[SlotSpec],
    values: &BTreeMap<String, String>,
) -> Result<FileMap> {
    let needed = extract_slot_names(files);
    let declared: BTreeMap<&str, &SlotSpec> =
        slots.iter().map(|s| (s.name.as_str(), s)).collect();

    let mut resolved: BTreeMap<String, String> = BTreeMap::new();
    for name in &needed {
        let spec = declared.get(name.as_str()).ok_or_else(|| {
            Error::Validation(format!("undeclared slot {{{{{name}}}}}"))
        })?;
        let value = values
            .get(name)
            .cloned()
            .or_else(|| spec.default.clone())
            .ok_or_else(|| {
                Error::Validation(format!("no value or default for slot {{{{{name}}}}}"))
            })?;
        resolved.insert(name.clone(), value);
    }

    let mut out = FileMap::new();
    for (path, content) in files {
        let replaced = slot_regex().replace_all(content, |captures: &regex::Captures<'_>| {
            resolved
                .get(&captures[1])
                .cloned()
                .unwrap_or_else(|| captures[0].to_string())
        });
        out.insert(path.clone(), replaced.into_owned());
    }
    Ok(out)
}

/// Interpolate a template's files without touching any store.
pub fn preview(template: &TemplateRecord, values: &BTreeMap<String, String>) -> Result<FileMap> {
    interpolate(&template.files, &template.slots, values)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn files(pairs: &[(&str, &str)]) -> FileMap {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    fn slot(name: &str, default: Option<&str>) -> SlotSpec {
        SlotSpec {
            name: name.to_string(),
            description: String::new(),
            default: default.map(str::to_string),
            example: None,
        }
    }

    fn template(files: FileMap, slots: Vec<SlotSpec>) -> TemplateRecord {
        TemplateRecord {
            id: "t".to_string(),
            name: "t".to_string(),
            description: String::new(),
            files,
            slots,
            defaults: None,
        }
    }

    #[test]
    fn extraction_unions_across_files() {
        let tree = files(&[
            ("a.ts", "const x = {{v}}; const y = {{name_2}};"),
            ("b.ts", "{{v}} again"),
        ]);
        let names = extract_slot_names(&tree);
        assert_eq!(
            names.into_iter().collect::<Vec<_>>(),
            vec!["name_2", "v"]
        );
    }

    #[test]
    fn extraction_ignores_malformed_slots() {
        let tree = files(&[("a.ts", "{{9bad}} {{ spaced }} {{good_1}} {single}")]);
        let names = extract_slot_names(&tree);
        assert_eq!(names.into_iter().collect::<Vec<_>>(), vec!["good_1"]);
    }

    #[test]
    fn validation_accepts_closed_templates() {
        let t = template(
            files(&[("a.ts", "{{v}}")]),
            vec![slot("v", Some("1")), slot("unused", None)],
        );
        assert!(validate_template(&t).is_ok());
    }

    #[test]
    fn validation_names_the_first_offending_slot() {
        let t = template(
            files(&[("a.ts", "{{v}}"), ("b.ts", "{{missing}} {{also_missing}}")]),
            vec![slot("v", Some("1"))],
        );
        let err = validate_template(&t).unwrap_err();
        assert!(err.to_string().contains("{{missing}}"), "{err}");
        assert!(err.to_string().contains("b.ts"));
    }

    #[test]
    fn interpolation_uses_caller_values() {
        let tree = files(&[("src/index.ts", "const x={{v}};")]);
        let out = interpolate(
            &tree,
            &[slot("v", Some("1"))],
            &BTreeMap::from([("v".to_string(), "42".to_string())]),
        )
        .unwrap();
        assert_eq!(out["src/index.ts"], "const x=42;");
    }

    #[test]
    fn interpolation_falls_back_to_defaults() {
        let tree = files(&[("src/index.ts", "const x={{v}};")]);
        let out = interpolate(&tree, &[slot("v", Some("1"))], &BTreeMap::new()).unwrap();
        assert_eq!(out["src/index.ts"], "const x=1;");
    }

    #[test]
    fn interpolation_replaces_every_occurrence() {
        let tree = files(&[("a.ts", "{{v}}+{{v}}+{{v}}")]);
        let out = interpolate(
            &tree,
            &[slot("v", None)],
            &BTreeMap::from([("v".to_string(), "3".to_string())]),
        )
        .unwrap();
        assert_eq!(out["a.ts"], "3+3+3");
    }

    #[test]
    fn missing_value_and_default_is_a_validation_error() {
        let tree = files(&[("a.ts", "{{v}}")]);
        let err = interpolate(&tree, &[slot("v", None)], &BTreeMap::new()).unwrap_err();
        assert_eq!(err.kind(), kiln_core::ErrorKind::Validation);
    }

    #[test]
    fn unused_slot_without_default_does_not_block() {
        let tree = files(&[("a.ts", "static")]);
        let out = interpolate(&tree, &[slot("unused", None)], &BTreeMap::new()).unwrap();
        assert_eq!(out["a.ts"], "static");
    }

    #[test]
    fn default_valued_interpolation_is_plain_replacement() {
        // With every value equal to its default, interpolation is exactly
        // textual replacement of {{name}} with the default.
        let tree = files(&[("a.ts", "hello {{who}} and {{who}}")]);
        let slots = [slot("who", Some("world"))];

        let with_defaults = interpolate(&tree, &slots, &BTreeMap::new()).unwrap();
        let with_values = interpolate(
            &tree,
            &slots,
            &BTreeMap::from([("who".to_string(), "world".to_string())]),
        )
        .unwrap();
        assert_eq!(with_defaults, with_values);
        assert_eq!(with_defaults["a.ts"], "hello world and world");
    }

    #[test]
    fn preview_matches_interpolation() {
        let t = template(
            files(&[("src/index.ts", "const x={{v}};")]),
            vec![slot("v", Some("1"))],
        );
        let out = preview(&t, &BTreeMap::new()).unwrap();
        assert_eq!(out["src/index.ts"], "const x=1;");
    }
}
