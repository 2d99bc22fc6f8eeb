//! Resource model: identities, attribute values and declared expressions.

pub mod expr;
pub mod key;
pub mod types;
pub mod value;

pub use expr::{AttrRef, Expr, ExprError, ReferenceResolver, ResolveError, Resolved, Segment};
pub use key::{KeyError, ResourceKey};
pub use types::{Lifecycle, ResourceDeclaration};
pub use value::{Attributes, Value};
