//! Check definitions: suite files, parameter sweeps and the registry.

pub mod definition;
pub mod parameters;
pub mod registry;
pub mod spec;

pub use definition::{
    BuildRecipe, BuildSystem, FlagSet, RunRecipe, Sweep, TestDefinition, TestShape, TimeLimitStep,
};
pub use parameters::{
    Combination, ParameterMode, ParameterSpec, ParameterValue, cartesian_product,
    expand_parameters, parse_parameter_value, substitute_parameters, zip_parameters,
};
pub use registry::{CheckFilter, CheckRegistry, discover_suite_files};
pub use spec::{BuildSpec, CheckKind, CheckSpec, LoadedSuite, RunSpec, SuiteSpec};
