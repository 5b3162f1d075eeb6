// Parser module for step configuration
// Provides the ordered parset store, step models and configuration errors

pub mod error;
pub mod models;
pub mod parset;

pub use error::{ParseError, ParseErrorKind, ParseResult};
pub use models::*;
pub use parset::{format_list, parse_environment, parse_list, write_argument_file, Parset};
