mod error;
mod eval;
mod modifier;
mod path;
mod projection;
mod selector;
mod sort;
mod value;

pub use error::QueryError;
pub use modifier::{FieldMod, ModOp, Modifier, PopFrom, PullSpec};
pub use path::{PathLookup, get_first, lookup, rename_path, set_path, unset_path};
pub use projection::Projection;
pub use selector::{
    ElemPredicate, ExprNode, ExprOp, ExprOperand, FieldOp, FieldPredicate, Selector, TextSearch,
    TypeSpec,
};
pub use sort::{SortDirection, SortSpec, compare_documents};
pub use value::{canonical_string, value_cmp, value_eq};
