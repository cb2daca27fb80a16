use taskmesh_errors::TaskMeshResult;

/// Implemented by every configuration section. `validate` runs after the
/// sources are merged and before any component is constructed.
pub trait ConfigValidator {
    fn validate(&self) -> TaskMeshResult<()>;
}
