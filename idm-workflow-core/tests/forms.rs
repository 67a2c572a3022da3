//! Approval forms of the bundled `userWorkflowApproval` process.

mod helpers;

use std::collections::BTreeSet;

use helpers::Harness;
use idm_workflow_core::vars;
use idm_workflow_core::{
    DeletionOutcome, Identity, IdentityDraft, IdentityKey, IdentityPatch, IdentityStore,
    OrderByClause, PasswordPatch, ProcessEngine, PropagationByResource, ResourceOperation,
    WorkflowError, WorkflowForm,
};

const UPDATE_APPROVAL: &str = include_str!("fixtures/userWorkflowUpdateApproval.bpmn20.xml");

fn set(items: &[&str]) -> BTreeSet<String> {
    items.iter().map(|s| s.to_string()).collect()
}

async fn pending_form(h: &Harness, key: IdentityKey) -> WorkflowForm {
    let identity = h.identity(key).await;
    h.adapter("admin")
        .forms()
        .get_form(identity.workflow_id.as_deref().unwrap())
        .await
        .unwrap()
        .expect("pending form")
}

/// Claim the pending form as `actor`, fill `values` and submit it.
async fn decide(h: &Harness, key: IdentityKey, actor: &str, values: &[(&str, &str)]) -> WorkflowForm {
    let form = pending_form(h, key).await;
    let forms = h.adapter(actor).forms();
    let mut claimed = forms.claim_form(&form.task_id).await.unwrap();
    for (id, value) in values {
        assert!(claimed.set_value(id, *value), "no property {id}");
    }
    claimed
}

async fn add_member(h: &Harness, username: &str, group: &str) {
    let mut identity = Identity::new(username);
    identity.groups = set(&[group]);
    h.store.save(&identity).await.unwrap();
}

#[tokio::test]
async fn create_waits_for_approval_without_leaking_password() {
    let h = Harness::approval().await;
    let created = h
        .adapter("admin")
        .create(
            IdentityDraft::new("alice")
                .with_password("password123")
                .with_resources(["ldap", "db"]),
            false,
            None,
            true,
        )
        .await
        .unwrap();
    let key = created.value.0;
    assert!(created.propagation.unwrap().is_empty());

    let identity = h.identity(key).await;
    assert_eq!(identity.status.as_deref(), Some("createApproval"));
    let vars = h.variables_json(&identity).await;
    assert!(!vars.contains("password123"));
    assert!(vars.contains("encryptedPwd"));

    let form = pending_form(&h, key).await;
    assert_eq!(form.task_key, "createApproval");
    assert_eq!(form.username.as_deref(), Some("alice"));
    assert_eq!(form.property("username").unwrap().value.as_deref(), Some("alice"));
    assert!(!form.property("username").unwrap().writable);
    let draft = form.identity_draft.unwrap();
    assert!(draft.password.is_none());
    assert!(draft.encrypted_password.is_none());
    assert_eq!(draft.key, Some(key));

    let page = h.adapter("admin").forms().get_forms(1, 10, &[]).await.unwrap();
    assert_eq!(page.total, 1);
    assert_eq!(page.forms[0].task_id, form.task_id);
}

#[tokio::test]
async fn approval_releases_deferred_propagation() {
    let h = Harness::approval().await;
    add_member(&h, "md", "managingDirector").await;
    let adapter = h.adapter("admin");
    let key = adapter
        .create(
            IdentityDraft::new("alice")
                .with_password("password123")
                .with_resources(["ldap", "db"]),
            false,
            None,
            true,
        )
        .await
        .unwrap()
        .value
        .0;

    // visible to the managing director through group membership only
    let md = h.adapter("md").forms();
    let visible = md.get_forms(1, 10, &[OrderByClause::desc("createTime")]).await.unwrap();
    assert_eq!(visible.total, 1);
    assert_eq!(h.adapter("eve").forms().get_forms(1, 10, &[]).await.unwrap().total, 0);

    let form = pending_form(&h, key).await;
    assert!(matches!(
        h.adapter("eve").forms().claim_form(&form.task_id).await,
        Err(WorkflowError::Validation(_))
    ));

    let mut claimed = md.claim_form(&form.task_id).await.unwrap();
    assert_eq!(claimed.owner.as_deref(), Some("md"));

    // required property missing
    assert!(matches!(
        md.submit_form(&claimed).await,
        Err(WorkflowError::Validation(_))
    ));
    claimed.set_value("approveCreate", "true");
    // only the owner may submit
    assert!(matches!(
        h.adapter("admin").forms().submit_form(&claimed).await,
        Err(WorkflowError::Validation(_))
    ));

    let submitted = md.submit_form(&claimed).await.unwrap();
    for activity in ["createApproval", "createApprovalGW", "generateToken", "created"] {
        assert!(submitted.performed_tasks.contains(activity), "missing {activity}");
    }
    let patch = submitted.value;
    let password = patch.password.unwrap();
    assert_eq!(password.value.as_deref(), Some("password123"));
    assert_eq!(password.resources, set(&["db", "ldap"]));
    assert_eq!(
        submitted.propagation.unwrap().get(ResourceOperation::Create),
        &set(&["db", "ldap"])
    );

    let identity = h.identity(key).await;
    assert_eq!(identity.status.as_deref(), Some("created"));
    assert!(identity.token.is_some());
    let vars = h.variables_json(&identity).await;
    assert!(!vars.contains("password123"));
    assert!(!vars.contains("encryptedPwd"));
    assert!(adapter.forms().get_form(identity.workflow_id().unwrap()).await.unwrap().is_none());
}

#[tokio::test]
async fn sensitive_identities_need_security_approval() {
    let h = Harness::approval().await;
    let key = h
        .adapter("admin")
        .create(
            IdentityDraft::new("carol")
                .with_password("password123")
                .with_resources(["vault"])
                .with_groups(["sensitive"]),
            false,
            None,
            true,
        )
        .await
        .unwrap()
        .value
        .0;

    let first = decide(&h, key, "admin", &[("approveCreate", "true")]).await;
    let submitted = h.adapter("admin").forms().submit_form(&first).await.unwrap();
    assert!(submitted.propagation.unwrap().is_empty());
    assert_eq!(h.identity(key).await.status.as_deref(), Some("securityApproval"));

    let secops = h.adapter("secops").forms();
    let page = secops.get_forms(1, 10, &[]).await.unwrap();
    assert_eq!(page.total, 1);
    assert_eq!(page.forms[0].task_key, "securityApproval");

    let mut second = decide(&h, key, "secops", &[("approveSecurity", "true")]).await;
    second.set_value("clearance", "top");
    assert!(matches!(
        secops.submit_form(&second).await,
        Err(WorkflowError::ParsingInvalid(_))
    ));
    second.set_value("clearance", "elevated");
    let released = secops.submit_form(&second).await.unwrap();
    assert_eq!(
        released.value.password.unwrap().value.as_deref(),
        Some("password123")
    );
    assert_eq!(
        released.propagation.unwrap().get(ResourceOperation::Create),
        &set(&["vault"])
    );
    assert_eq!(h.identity(key).await.status.as_deref(), Some("created"));
}

#[tokio::test]
async fn rejected_creation_can_be_deleted() {
    let h = Harness::approval().await;
    let adapter = h.adapter("admin");
    let key = adapter
        .create(
            IdentityDraft::new("bob")
                .with_password("password123")
                .with_resources(["ldap"]),
            false,
            None,
            true,
        )
        .await
        .unwrap()
        .value
        .0;

    let form = decide(
        &h,
        key,
        "admin",
        &[("approveCreate", "false"), ("rejectReason", "duplicate")],
    )
    .await;
    let rejected = adapter.forms().submit_form(&form).await.unwrap();
    assert!(rejected.performed_tasks.contains("reject"));
    assert!(rejected.propagation.unwrap().is_empty());
    assert!(rejected.value.password.unwrap().value.is_none());

    let identity = h.identity(key).await;
    assert_eq!(identity.status.as_deref(), Some("rejected"));
    assert!(!h.variables_json(&identity).await.contains("encryptedPwd"));

    let deleted = adapter.delete(key).await.unwrap();
    assert_eq!(deleted.value, DeletionOutcome::Deleted);
    assert!(h.store.is_empty().unwrap());
}

#[tokio::test]
async fn deletion_is_gated_by_approval() {
    let h = Harness::approval().await;
    let adapter = h.adapter("admin");
    let key = adapter
        .create(
            IdentityDraft::new("dave")
                .with_password("password123")
                .with_resources(["ldap"]),
            false,
            Some(true),
            true,
        )
        .await
        .unwrap()
        .value
        .0;
    let approve = decide(&h, key, "admin", &[("approveCreate", "true")]).await;
    adapter.forms().submit_form(&approve).await.unwrap();
    assert_eq!(h.identity(key).await.status.as_deref(), Some("active"));

    // first request is turned down
    let pending = adapter.delete(key).await.unwrap();
    assert_eq!(pending.value, DeletionOutcome::PendingApproval);
    assert!(pending.propagation.unwrap().is_empty());
    assert_eq!(h.identity(key).await.status.as_deref(), Some("deleteApproval"));

    let deny = decide(&h, key, "admin", &[("approveDelete", "false")]).await;
    let denied = adapter.forms().submit_form(&deny).await.unwrap();
    assert!(denied.propagation.unwrap().is_empty());
    assert_eq!(h.identity(key).await.status.as_deref(), Some("active"));

    // second request is approved and removes the identity
    adapter.delete(key).await.unwrap();
    let allow = decide(&h, key, "admin", &[("approveDelete", "true")]).await;
    let workflow_id = allow.workflow_id.clone();
    let done = adapter.forms().submit_form(&allow).await.unwrap();
    assert!(done.performed_tasks.contains("delete"));
    assert_eq!(
        done.propagation.unwrap().get(ResourceOperation::Delete),
        &set(&["ldap"])
    );
    assert!(h.store.is_empty().unwrap());
    assert!(h.store.find_by_workflow_id(&workflow_id).await.unwrap().is_none());
}

async fn active_alice(h: &Harness) -> IdentityKey {
    h.adapter("admin")
        .create(
            IdentityDraft::new("alice")
                .with_password("password123")
                .with_resources(["ldap"]),
            false,
            Some(true),
            true,
        )
        .await
        .unwrap()
        .value
        .0
}

fn new_password(key: IdentityKey, value: &str) -> IdentityPatch {
    let mut patch = IdentityPatch::new(key);
    patch.password = Some(PasswordPatch {
        value: Some(value.into()),
        on_identity: true,
        resources: BTreeSet::new(),
    });
    patch
}

#[tokio::test]
async fn approved_update_releases_new_password() {
    let h = Harness::deploying("userWorkflowUpdateApproval", UPDATE_APPROVAL).await;
    let adapter = h.adapter("admin");
    let key = active_alice(&h).await;
    assert_eq!(h.identity(key).await.status.as_deref(), Some("active"));

    let updated = adapter.update(new_password(key, "newpassword1")).await.unwrap();
    assert!(updated.propagation.unwrap().is_empty());

    let identity = h.identity(key).await;
    assert_eq!(identity.status.as_deref(), Some("updateApproval"));
    let vars_json = h.variables_json(&identity).await;
    assert!(!vars_json.contains("newpassword1"));
    assert!(vars_json.contains("encryptedPwd"));
    let parked: PropagationByResource = serde_json::from_value(
        h.engine
            .variable(identity.workflow_id().unwrap(), vars::PROP_BY_RESOURCE)
            .await
            .unwrap()
            .unwrap(),
    )
    .unwrap();
    assert_eq!(parked.get(ResourceOperation::Update), &set(&["ldap"]));

    let form = decide(&h, key, "admin", &[("approveUpdate", "true")]).await;
    let released = adapter.forms().submit_form(&form).await.unwrap();
    let password = released.value.password.unwrap();
    assert_eq!(password.value.as_deref(), Some("newpassword1"));
    assert_eq!(password.resources, set(&["ldap"]));
    assert_eq!(
        released.propagation.unwrap().get(ResourceOperation::Update),
        &set(&["ldap"])
    );

    let identity = h.identity(key).await;
    assert_eq!(identity.status.as_deref(), Some("active"));
    let vars_json = h.variables_json(&identity).await;
    assert!(!vars_json.contains("newpassword1"));
    assert!(!vars_json.contains("encryptedPwd"));
}

#[tokio::test]
async fn denied_update_drops_new_password() {
    let h = Harness::deploying("userWorkflowUpdateApproval", UPDATE_APPROVAL).await;
    let adapter = h.adapter("admin");
    let key = active_alice(&h).await;
    adapter.update(new_password(key, "newpassword1")).await.unwrap();

    let form = decide(&h, key, "admin", &[("approveUpdate", "false")]).await;
    let denied = adapter.forms().submit_form(&form).await.unwrap();
    assert!(denied.performed_tasks.contains("rejectUpdate"));
    assert!(denied.value.password.unwrap().value.is_none());
    assert!(denied.propagation.unwrap().is_empty());
    assert_eq!(h.identity(key).await.status.as_deref(), Some("active"));
}

#[tokio::test]
async fn rejected_submission_records_no_submitter() {
    let h = Harness::approval().await;
    let key = h
        .adapter("admin")
        .create(IdentityDraft::new("erin").with_password("password123"), false, None, true)
        .await
        .unwrap()
        .value
        .0;

    let claimed = decide(&h, key, "admin", &[]).await;
    assert!(matches!(
        h.adapter("admin").forms().submit_form(&claimed).await,
        Err(WorkflowError::Validation(_))
    ));
    let workflow_id = claimed.workflow_id.clone();
    assert_eq!(
        h.engine.variable(&workflow_id, vars::FORM_SUBMITTER).await.unwrap(),
        None
    );
}

#[tokio::test]
async fn form_page_out_of_range_is_refused() {
    let h = Harness::approval().await;
    let forms = h.adapter("admin").forms();
    assert!(matches!(
        forms.get_forms(usize::MAX, usize::MAX, &[]).await,
        Err(WorkflowError::Validation(_))
    ));
    assert_eq!(forms.get_forms(usize::MAX, 1, &[]).await.unwrap().forms.len(), 0);
}
