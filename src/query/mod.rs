// Submodules for separation of concerns
mod cursor;
mod eval;
mod parse;
mod translate;
mod types;
mod update;

pub use cursor::Cursor;
pub use eval::{compare_bson, elem_matches, eval_filter, get_path, project_fields, values_equal};
pub use parse::{
    json_to_document, parse_array_filter, parse_array_filters, parse_array_filters_json, parse_elem_condition,
    parse_filter, parse_filter_json, parse_update, parse_update_json,
};
pub use translate::{Cond, FilterExpression, to_filter_expression};
pub use types::{
    ArrayFilter, ElemCondition, Filter, FindOptions, Order, SortSpec, UpdateDoc, UpdateOp, UpdateReport,
};
pub use update::{apply_update, validate_update};
