mod apply;
mod diff;
mod error;
mod eval;
mod fs_util;
mod graph;
mod pipeline;
mod providers;
mod resource;
mod root;
mod scope;
mod state;
mod workflow;

pub use apply::{ApplyContext, ApplyOptions, ApproveAll, Approver, apply_plan};
pub use diff::{RefreshFailures, changed_fields, classify, diff, refresh};
pub use error::{ApplyError, EvalError, GraphError, PipelineError, StateError};
pub use eval::{
    CONFIGURED_FIELDS, DEPENDS_ON, Defer, DeferReason, Evaluator, StuckStatement,
    reevaluate_resource,
};
pub use graph::{build_execution_order, find_cycles};
pub use pipeline::{Session, UpOptions, load_sources, plan_up};
pub use providers::{LocalFile, LocalProvider, LocalSymlink, Provider, TypeRegistry};
pub use resource::{
    Creatable, DEFAULT_CREDENTIALS, Deletable, Diffable, FieldSpec, Fields, Identifiable,
    ProviderContext, Refreshable, Resource, ResourceSchema, ResourceType, Updatable,
};
pub use root::{FileScope, RootScope, VirtualDefinition};
pub use scope::Scope;
pub use state::{LocalStateBackend, StateBackend, render_state, state_path};
pub use workflow::{Stage, StageAction, Workflow};
