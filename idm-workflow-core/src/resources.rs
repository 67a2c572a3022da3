//! Process definitions shipped with the crate.

pub const USER_WORKFLOW_KEY: &str = "userWorkflow";
pub const USER_WORKFLOW_APPROVAL_KEY: &str = "userWorkflowApproval";

/// Lifecycle without human approval steps.
pub const USER_WORKFLOW: &str = include_str!("../resources/userWorkflow.bpmn20.xml");

/// Lifecycle with create, security and delete approval forms.
pub const USER_WORKFLOW_APPROVAL: &str =
    include_str!("../resources/userWorkflowApproval.bpmn20.xml");

/// Every bundled definition as `(key, xml)`.
pub fn bundled() -> [(&'static str, &'static str); 2] {
    [
        (USER_WORKFLOW_KEY, USER_WORKFLOW),
        (USER_WORKFLOW_APPROVAL_KEY, USER_WORKFLOW_APPROVAL),
    ]
}
