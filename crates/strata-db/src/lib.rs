pub mod dict_query;
pub mod document;
mod error;
pub mod mutator;
pub mod path;
pub mod store;
pub mod template;


pub use dict_query::Cursor;
pub use document::{
    Committer, Deleter, DocumentOps, DocumentShell, SUBCOLLECTIONS_KEY, SubCollection, SubDocShell,
};
pub use error::DbError;
pub use mutator::{CustomOpFn, CustomOps, MutOp, Oplog, mutate};
pub use store::{
    CursorStats, Graph, ItemPath, QueryCursor, QueryExecutor, Store, StoreError, commit_document,
    edge_collection_name, graph_name, parse_item_path,
};
