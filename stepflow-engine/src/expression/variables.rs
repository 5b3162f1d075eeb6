// Global Override Resolution
// Collects `! name` / `pipeline.replace.name` overrides and expands `{{ name }}` markers

use crate::parser::parset::Parset;

use indexmap::IndexMap;
use once_cell::sync::Lazy;
use regex::{Captures, Regex};
use tracing::debug;

/// Prefix of the namespaced override syntax
pub const REPLACE_PREFIX: &str = "pipeline.replace.";

static MARKER_REGEX: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\{\{ ([^\s{}]+) \}\}").expect("Invalid marker pattern"));

/// Ordered table of override names to their bound values
#[derive(Debug, Clone, Default, PartialEq)]
pub struct OverrideTable {
    values: IndexMap<String, String>,
}

impl OverrideTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Collect overrides in declaration order; the last binding of a name wins
    pub fn collect(parset: &Parset) -> Self {
        let mut table = Self::new();
        for (key, value) in parset.iter() {
            if let Some(name) = override_name(key) {
                table.bind(name, value.clone());
            }
        }
        table
    }

    /// Bind a name, replacing any earlier binding
    pub fn bind(&mut self, name: impl Into<String>, value: impl Into<String>) {
        let name = name.into();
        // Re-binding moves the name to the end so iteration order reflects precedence
        self.values.shift_remove(&name);
        self.values.insert(name, value.into());
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        self.values.get(name).map(String::as_str)
    }

    pub fn names(&self) -> impl Iterator<Item = &String> {
        self.values.keys()
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// Replace every `{{ name }}` marker bound in this table. The value is
    /// scanned once; substituted text is not scanned again.
    pub fn substitute(&self, value: &str) -> String {
        if !value.contains("{{") {
            return value.to_string();
        }

        MARKER_REGEX
            .replace_all(value, |caps: &Captures| match self.get(&caps[1]) {
                Some(bound) => bound.to_string(),
                None => caps[0].to_string(),
            })
            .into_owned()
    }
}

/// Name bound by an override key, or `None` for ordinary keys
pub fn override_name(key: &str) -> Option<&str> {
    if let Some(rest) = key.strip_prefix('!') {
        let name = rest.trim();
        return (!name.is_empty()).then_some(name);
    }
    key.strip_prefix(REPLACE_PREFIX)
        .filter(|name| !name.is_empty())
}

pub fn is_override_key(key: &str) -> bool {
    override_name(key).is_some()
}

/// Rewrite the markers of the given names through `rename`, leaving all
/// other text untouched
pub fn rename_markers(value: &str, rename: impl Fn(&str) -> Option<String>) -> String {
    if !value.contains("{{") {
        return value.to_string();
    }

    MARKER_REGEX
        .replace_all(value, |caps: &Captures| match rename(&caps[1]) {
            Some(new_name) => format!("{{{{ {} }}}}", new_name),
            None => caps[0].to_string(),
        })
        .into_owned()
}

/// Expand override markers across the whole parset in place and return the
/// override table that was applied.
pub fn resolve_variables(parset: &mut Parset) -> OverrideTable {
    let table = OverrideTable::collect(parset);
    if table.is_empty() {
        return table;
    }

    let mut replaced = 0usize;
    for (key, value) in parset.iter_mut() {
        if is_override_key(key) {
            continue;
        }
        let substituted = table.substitute(value);
        if substituted != *value {
            replaced += 1;
            *value = substituted;
        }
    }

    debug!(
        overrides = table.len(),
        values = replaced,
        "applied global overrides"
    );
    table
}

/// Expand override markers in the listed keys only
pub fn resolve_variables_for<'a>(
    parset: &mut Parset,
    keys: impl IntoIterator<Item = &'a String>,
) -> OverrideTable {
    let table = OverrideTable::collect(parset);
    for key in keys {
        if is_override_key(key) {
            continue;
        }
        if let Some(value) = parset.get(key) {
            let substituted = table.substitute(value);
            parset.insert(key.clone(), substituted);
        }
    }
    table
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parset(text: &str) -> Parset {
        Parset::from_parset_str(text).unwrap()
    }

    #[test]
    fn test_override_name() {
        assert_eq!(override_name("! workdir"), Some("workdir"));
        assert_eq!(override_name("!workdir"), Some("workdir"));
        assert_eq!(override_name("pipeline.replace.obsid"), Some("obsid"));
        assert_eq!(override_name("pipeline.steps"), None);
        assert_eq!(override_name("!"), None);
    }

    #[test]
    fn test_both_syntaxes_collapse_and_last_wins() {
        let p = parset(
            "! workdir = /a\npipeline.replace.obsid = L1\npipeline.replace.workdir = /b\n",
        );
        let table = OverrideTable::collect(&p);
        assert_eq!(table.len(), 2);
        assert_eq!(table.get("workdir"), Some("/b"));
        assert_eq!(table.get("obsid"), Some("L1"));
    }

    #[test]
    fn test_resolve_variables_substitutes_values() {
        let mut p = parset(
            "! workdir = /data\nprep.argument.out = {{ workdir }}/prep.map\nprep.argument.tag = {{ unknown }}\n",
        );
        resolve_variables(&mut p);
        assert_eq!(p.get("prep.argument.out"), Some("/data/prep.map"));
        assert_eq!(p.get("prep.argument.tag"), Some("{{ unknown }}"));
        assert_eq!(p.get("! workdir"), Some("/data"));
    }

    #[test]
    fn test_substitution_is_single_pass() {
        let mut p = parset("! a = {{ b }}\n! b = final\nstep.argument.x = {{ a }}\n");
        resolve_variables(&mut p);
        // The value bound to `a` is inserted verbatim, not expanded again
        assert_eq!(p.get("step.argument.x"), Some("{{ b }}"));
    }

    #[test]
    fn test_marker_requires_exact_spacing() {
        let table = {
            let mut t = OverrideTable::new();
            t.bind("x", "1");
            t
        };
        assert_eq!(table.substitute("{{x}} {{ x }}"), "{{x}} 1");
    }

    #[test]
    fn test_rename_markers() {
        let renamed = rename_markers("{{ a }}/{{ b }}", |name| {
            (name == "a").then(|| format!("sub-{}", name))
        });
        assert_eq!(renamed, "{{ sub-a }}/{{ b }}");
    }

    #[test]
    fn test_resolve_variables_for_only_touches_listed_keys() {
        let mut p = parset("! v = 1\nold = {{ v }}\nnew = {{ v }}\n");
        let keys = vec!["new".to_string()];
        resolve_variables_for(&mut p, &keys);
        assert_eq!(p.get("old"), Some("{{ v }}"));
        assert_eq!(p.get("new"), Some("1"));
    }
}
