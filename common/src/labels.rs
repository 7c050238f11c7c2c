//! Label, annotation and finalizer keys persisted on cluster objects.

pub const API_GROUP: &str = "operator.lynq.sh";
pub const API_VERSION: &str = "operator.lynq.sh/v1";

pub const LABEL_HUB: &str = "lynq.sh/hub";
pub const LABEL_UID: &str = "lynq.sh/uid";
pub const LABEL_NODE: &str = "lynq.sh/node";
pub const LABEL_NODE_NAMESPACE: &str = "lynq.sh/node-namespace";
pub const LABEL_ORPHANED: &str = "lynq.sh/orphaned";

pub const ANNOTATION_HOST_OR_URL: &str = "lynq.sh/hostOrUrl";
pub const ANNOTATION_ACTIVATE: &str = "lynq.sh/activate";
pub const ANNOTATION_EXTRA: &str = "lynq.sh/extra";
pub const ANNOTATION_TEMPLATE_GENERATION: &str = "lynq.sh/template-generation";
pub const ANNOTATION_CREATED_ONCE: &str = "lynq.sh/created-once";
pub const ANNOTATION_DELETION_POLICY: &str = "lynq.sh/deletion-policy";
pub const ANNOTATION_ORPHANED_AT: &str = "lynq.sh/orphaned-at";
pub const ANNOTATION_ORPHANED_REASON: &str = "lynq.sh/orphaned-reason";
pub const ANNOTATION_LAST_APPLIED: &str = "lynq.sh/last-applied-configuration";

pub const HUB_FINALIZER: &str = "lynq.sh/hub";
pub const NODE_FINALIZER: &str = "lynqnode/finalizer";

pub const TRUE_VALUE: &str = "true";

/// Orphan reason stamped when a resource leaves the rendered template
pub const REASON_REMOVED_FROM_TEMPLATE: &str = "RemovedFromTemplate";
/// Orphan reason stamped when the owning LynqNode goes away
pub const REASON_NODE_DELETED: &str = "LynqNodeDeleted";
