// Expression Module
// Global `{{ name }}` overrides and `<step>.output.<key>` references

pub mod reference;
pub mod variables;

pub use reference::{
    rename_references, resolve_arguments, resolve_cmdline, ImplicitInput, ResolveError,
    ResolvedArguments, Segment, Template,
};
pub use variables::{
    is_override_key, override_name, rename_markers, resolve_variables,
    resolve_variables_for, OverrideTable, REPLACE_PREFIX,
};
