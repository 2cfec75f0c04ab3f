mod compile;
mod error;
pub mod filter;
pub mod macros;
mod sort;
pub mod timeshift;
mod xql;

pub use compile::{
    Compiler, NonceGen, ParserHook, extract_collections, has_modifier_operations, slugify_path,
};
pub use error::QueryError;
pub use filter::{Condition, FilterClause, FilterOp, FilterSet, LogicOp, parse_filters};
pub use macros::{MacroFn, MacroRegistry};
pub use sort::{Sort, SortDirection, parse_sorts};
pub use xql::{DEFAULT_ALIAS, DEFAULT_LIMIT, Paging, Xql, resolve_paging};
