use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("SerializationError: {0}")]
    SerializationError(#[from] serde_json::Error),

    #[error("K8s error: {0}")]
    KubeError(#[from] kube::Error),

    #[error("Registering template failed with error: {0}")]
    HbsTemplateError(#[from] Box<handlebars::TemplateError>),
    #[error("Renderer error: {0}")]
    HbsRenderError(#[from] Box<handlebars::RenderError>),

    #[error("Database error: {0}")]
    DatabaseError(#[from] sqlx::Error),

    #[error("Missing data source configuration: {0}")]
    MissingSourceConfig(String),

    #[error("{0}")]
    Conflict(#[from] apply::ConflictError),

    #[error("Duplicate resource id {0}")]
    DuplicateId(String),

    #[error("Resource {0} depends on unknown resource {1}")]
    MissingDependency(String, String),

    #[error("Dependency cycle between {}", .0.join(", "))]
    Cycle(Vec<String>),

    #[error("Invalid field path {0}: {1}")]
    InvalidPath(String, String),

    #[error("Invalid resource key {0} (expected Kind/Namespace/Name@id)")]
    InvalidResourceKey(String),

    #[error("Object is missing {0}")]
    MissingObjectKey(&'static str),

    #[error("Unknown kind {0}")]
    UnknownKind(String),

    #[error("Error: {0}")]
    Other(String),
}
impl Error {
    pub fn metric_label(&self) -> String {
        format!("{self:?}").to_lowercase()
    }

    /// API answered 404
    pub fn is_not_found(&self) -> bool {
        matches!(self, Error::KubeError(kube::Error::Api(e)) if e.code == 404)
    }

    /// API answered 409, either a resourceVersion race or an AlreadyExists on create
    pub fn is_api_conflict(&self) -> bool {
        matches!(self, Error::KubeError(kube::Error::Api(e)) if e.code == 409)
    }
}

impl From<handlebars::RenderError> for Error {
    fn from(e: handlebars::RenderError) -> Self {
        Error::HbsRenderError(Box::new(e))
    }
}

impl From<handlebars::TemplateError> for Error {
    fn from(e: handlebars::TemplateError) -> Self {
        Error::HbsTemplateError(Box::new(e))
    }
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

pub mod apply;
pub mod conditions;
pub mod context;
pub mod datasource;
pub mod fieldpath;
pub mod form;
pub mod graph;
pub mod hub;
pub mod k8sgeneric;
pub mod k8smock;
pub mod labels;
pub mod merge;
pub mod mysql;
pub mod node;
pub mod readiness;
pub mod resources;
pub mod status;
pub mod template;

pub use context::{get_client_name, get_short_name};
pub use form::{LynqForm, LynqFormSpec, LynqFormStatus};
pub use hub::{LynqHub, LynqHubSpec, LynqHubStatus};
pub use node::{LynqNode, LynqNodeSpec, LynqNodeStatus};
