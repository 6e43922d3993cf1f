//! Manufacturing orders: the fixed step template, a typed view of the stored document, the
//! progress state machine and the workflows built on them.

pub mod model;
pub mod progress;
pub mod repair;
mod service;
pub mod template;

pub use model::{Order, Stage, Step};
pub use progress::{Progress, Rejection, complete_current};
pub use repair::{RepairReport, Repaired, load_repaired, repair_document, repair_order, repair_write};
pub use service::{OrderRegistration, OrderService, bid_candidate};

/// Terminal `overall_status`.
pub const ORDER_DONE: &str = "done";

/// Indexes the orders collection relies on: `(field, unique)`.
pub const ORDER_INDEXES: [(&str, bool); 4] =
    [("order_id", true), ("designer_id", false), ("overall_status", false), ("factory_id", false)];
