//! Plan construction.
//!
//! A plan is the ordered list of provider calls that moves the stored state
//! to the declared state. Each [`ResourceChange`](crate::diff::ResourceChange)
//! expands to steps:
//!
//! | Change    | Steps                                             |
//! |-----------|---------------------------------------------------|
//! | `Create`  | create                                            |
//! | `Update`  | update                                            |
//! | `Replace` | destroy + create, or create + destroy (deposed)   |
//! | `Destroy` | destroy                                           |
//! | `NoOp`    | none                                              |

mod order;
mod types;

pub use order::{OrderContext, order_changes};
pub use types::{Plan, PlanError, PlanStep, PlanSummary, StepAction};
