pub mod plan;
pub mod state;

pub use plan::{changes_of, parse_plan, PlanDocument};
pub use state::{
    outputs_of, parse_sensitive_attrs, parse_state, resources_of, SensitiveAttrMap,
    StateDocument,
};
