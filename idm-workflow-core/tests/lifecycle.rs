//! Lifecycle transitions against the bundled `userWorkflow` process.

mod helpers;

use std::collections::BTreeSet;

use helpers::Harness;
use idm_workflow_core::crypto::digest_password;
use idm_workflow_core::engine::TaskQuery;
use idm_workflow_core::{
    DefinitionFormat, DeletionOutcome, IdentityDraft, IdentityPatch, MemoryIdentityStore,
    PasswordPatch, ProcessEngine, ResourceOperation, TaskCardinalityPolicy, WorkflowConfig,
    WorkflowError,
};

fn set(items: &[&str]) -> BTreeSet<String> {
    items.iter().map(|s| s.to_string()).collect()
}

fn alice() -> IdentityDraft {
    IdentityDraft::new("alice")
        .with_password("password123")
        .with_resources(["ldap", "db"])
}

const QUICK_WORKFLOW: &str = r#"<?xml version="1.0" encoding="UTF-8"?>
<definitions xmlns="http://www.omg.org/spec/BPMN/20100524/MODEL"
             xmlns:activiti="http://activiti.org/bpmn">
  <process id="quickWorkflow" name="Create and end">
    <startEvent id="theStart"/>
    <serviceTask id="create" activiti:delegateExpression="${create}"/>
    <endEvent id="theEnd"/>
    <sequenceFlow id="f1" sourceRef="theStart" targetRef="create"/>
    <sequenceFlow id="f2" sourceRef="create" targetRef="theEnd"/>
  </process>
</definitions>"#;

#[tokio::test]
async fn alice_end_to_end() {
    let h = Harness::lifecycle().await;
    let adapter = h.adapter("admin");

    // create: no enable hint, so an activation token is generated
    let created = adapter.create(alice(), false, None, true).await.unwrap();
    let (key, propagate_enable) = created.value;
    assert_eq!(propagate_enable, None);
    let prop = created.propagation.unwrap();
    assert_eq!(prop.get(ResourceOperation::Create), &set(&["db", "ldap"]));
    for activity in ["theStart", "create", "enableGW", "generateToken", "created"] {
        assert!(created.performed_tasks.contains(activity), "missing {activity}");
    }

    let identity = h.identity(key).await;
    assert_eq!(identity.status.as_deref(), Some("created"));
    assert_eq!(identity.password.as_deref(), Some(digest_password("password123").as_str()));
    assert!(identity.clear_password.is_none());
    assert!(identity.token.is_some());
    assert!(!h.variables_json(&identity).await.contains("password123"));

    // activate with the generated token
    let token = h.token(key).await;
    let activated = adapter.activate(key, Some(token)).await.unwrap();
    assert!(activated.performed_tasks.contains("activate"));
    assert!(activated.performed_tasks.contains("active"));
    assert!(!activated.performed_tasks.contains("create"));
    let identity = h.identity(key).await;
    assert_eq!(identity.status.as_deref(), Some("active"));
    assert_eq!(identity.suspended, Some(false));
    assert!(identity.token.is_none());

    // update: rename, swap a resource and change the password
    let mut patch = IdentityPatch::new(key);
    patch.username = Some("alice2".into());
    patch.resources_to_add = set(&["ad"]);
    patch.resources_to_remove = set(&["db"]);
    patch.password = Some(PasswordPatch {
        value: Some("newpassword1".into()),
        on_identity: true,
        resources: BTreeSet::new(),
    });
    let updated = adapter.update(patch).await.unwrap();
    let (applied, propagate_enable) = updated.value;
    assert_eq!(propagate_enable, None);
    assert_eq!(applied.password.unwrap().resources, set(&["ad", "ldap"]));
    let prop = updated.propagation.unwrap();
    assert_eq!(prop.get(ResourceOperation::Create), &set(&["ad"]));
    assert_eq!(prop.get(ResourceOperation::Delete), &set(&["db"]));
    assert_eq!(prop.get(ResourceOperation::Update), &set(&["ldap"]));

    let identity = h.identity(key).await;
    assert_eq!(identity.username, "alice2");
    assert_eq!(identity.resources, set(&["ad", "ldap"]));
    assert_eq!(identity.password.as_deref(), Some(digest_password("newpassword1").as_str()));
    assert_eq!(identity.status.as_deref(), Some("active"));
    assert!(!h.variables_json(&identity).await.contains("newpassword1"));

    // suspend and reactivate
    adapter.suspend(key).await.unwrap();
    let identity = h.identity(key).await;
    assert_eq!(identity.status.as_deref(), Some("suspended"));
    assert_eq!(identity.suspended, Some(true));
    adapter.reactivate(key).await.unwrap();
    let identity = h.identity(key).await;
    assert_eq!(identity.status.as_deref(), Some("active"));
    assert_eq!(identity.suspended, Some(false));

    // delete ends the process and removes the identity
    let deleted = adapter.delete(key).await.unwrap();
    assert_eq!(deleted.value, DeletionOutcome::Deleted);
    assert!(deleted.performed_tasks.contains("delete"));
    assert_eq!(
        deleted.propagation.unwrap().get(ResourceOperation::Delete),
        &set(&["ad", "ldap"])
    );
    assert!(h.store.is_empty().unwrap());
    assert!(matches!(
        adapter.suspend(key).await,
        Err(WorkflowError::NotFound(_))
    ));
}

#[tokio::test]
async fn enable_hint_routes_creation() {
    let h = Harness::lifecycle().await;
    let adapter = h.adapter("admin");

    let enabled = adapter.create(alice(), false, Some(true), true).await.unwrap();
    let (key, propagate_enable) = enabled.value;
    assert_eq!(propagate_enable, Some(true));
    let identity = h.identity(key).await;
    assert_eq!(identity.status.as_deref(), Some("active"));
    assert!(identity.token.is_none());

    let disabled = adapter
        .create(IdentityDraft::new("bob").with_password("password123"), false, Some(false), true)
        .await
        .unwrap();
    let (key, propagate_enable) = disabled.value;
    assert_eq!(propagate_enable, Some(false));
    let identity = h.identity(key).await;
    assert_eq!(identity.status.as_deref(), Some("suspended"));
    assert_eq!(identity.suspended, Some(true));
}

#[tokio::test]
async fn password_is_not_stored_on_request() {
    let h = Harness::lifecycle().await;
    let created = h
        .adapter("admin")
        .create(alice(), false, None, false)
        .await
        .unwrap();
    let identity = h.identity(created.value.0).await;
    assert!(identity.password.is_none());
    assert!(identity.clear_password.is_none());
}

#[tokio::test]
async fn wrong_or_missing_token_keeps_identity_created() {
    let h = Harness::lifecycle().await;
    let adapter = h.adapter("admin");
    let key = adapter.create(alice(), false, None, true).await.unwrap().value.0;

    let err = adapter.activate(key, Some("nope".into())).await.unwrap_err();
    assert!(matches!(err, WorkflowError::Validation(_)), "{err:?}");
    assert!(matches!(
        adapter.activate(key, None).await,
        Err(WorkflowError::Validation(_))
    ));

    let identity = h.identity(key).await;
    assert_eq!(identity.status.as_deref(), Some("created"));
    assert!(identity.token.is_some());
    assert_eq!(adapter.available_tasks(key).await.unwrap(), set(&["activate", "delete"]));
}

#[tokio::test]
async fn password_reset_round_trip() {
    let h = Harness::lifecycle().await;
    let adapter = h.adapter("admin");
    let key = adapter.create(alice(), false, Some(true), true).await.unwrap().value.0;

    // confirming without a pending request is refused
    assert!(matches!(
        adapter.confirm_password_reset(key, "any", "password456").await,
        Err(WorkflowError::Validation(_))
    ));

    let requested = adapter.request_password_reset(key).await.unwrap();
    assert!(requested.performed_tasks.contains("requestPasswordReset"));
    let token = h.token(key).await;

    assert!(matches!(
        adapter.confirm_password_reset(key, "wrong", "password456").await,
        Err(WorkflowError::Validation(_))
    ));

    let confirmed = adapter
        .confirm_password_reset(key, &token, "password456")
        .await
        .unwrap();
    let (patch, _) = confirmed.value;
    let password = patch.unwrap().password.unwrap();
    assert_eq!(password.value.as_deref(), Some("password456"));
    assert_eq!(password.resources, set(&["db", "ldap"]));
    assert_eq!(
        confirmed.propagation.unwrap().get(ResourceOperation::Update),
        &set(&["db", "ldap"])
    );

    let identity = h.identity(key).await;
    assert_eq!(identity.status.as_deref(), Some("active"));
    assert!(identity.token.is_none());
    assert_eq!(identity.password.as_deref(), Some(digest_password("password456").as_str()));
    let vars = h.variables_json(&identity).await;
    assert!(!vars.contains("password456"));
    assert!(!vars.contains("propByResource"));
}

#[tokio::test]
async fn invalid_entities_are_reported_as_such() {
    let h = Harness::with_store(
        WorkflowConfig::default(),
        MemoryIdentityStore::new().with_password_min_length(8),
    )
    .await;
    let adapter = h.adapter("admin");

    let short = IdentityDraft::new("carol").with_password("short");
    assert!(matches!(
        adapter.create(short.clone(), false, None, true).await,
        Err(WorkflowError::InvalidEntity(_))
    ));
    // skipping the password check lets the same draft through
    adapter.create(short, true, None, true).await.unwrap();

    assert!(matches!(
        adapter.create(IdentityDraft::new("   "), false, None, true).await,
        Err(WorkflowError::InvalidEntity(_))
    ));
}

#[tokio::test]
async fn refused_creation_leaves_no_instance_behind() {
    let h = Harness::with_store(
        WorkflowConfig::default(),
        MemoryIdentityStore::new().with_password_min_length(8),
    )
    .await;
    let adapter = h.adapter("admin");

    let refused = adapter
        .create(IdentityDraft::new("carol").with_password("short"), false, None, true)
        .await;
    assert!(matches!(refused, Err(WorkflowError::InvalidEntity(_))));
    assert!(h.store.is_empty().unwrap());
    let leftover = h.engine.query_tasks(&TaskQuery::default()).await.unwrap();
    assert_eq!(leftover.total, 0);

    // the username is free again
    let created = adapter
        .create(IdentityDraft::new("carol").with_password("long enough"), false, None, true)
        .await
        .unwrap();
    assert_eq!(h.identity(created.value.0).await.username, "carol");
}

#[tokio::test]
async fn refused_update_keeps_new_password_out_of_the_process() {
    let h = Harness::lifecycle().await;
    let adapter = h.adapter("admin");
    let key = adapter.create(alice(), false, Some(true), true).await.unwrap().value.0;
    adapter
        .create(IdentityDraft::new("bob").with_password("password123"), false, Some(true), true)
        .await
        .unwrap();

    let mut patch = IdentityPatch::new(key);
    patch.username = Some("bob".into());
    patch.password = Some(PasswordPatch {
        value: Some("S3cretNew!".into()),
        on_identity: true,
        resources: BTreeSet::new(),
    });
    assert!(matches!(
        adapter.update(patch).await,
        Err(WorkflowError::InvalidEntity(_))
    ));

    let identity = h.identity(key).await;
    assert_eq!(identity.username, "alice");
    assert_eq!(identity.password, Some(digest_password("password123")));
    assert!(!h.variables_json(&identity).await.contains("S3cretNew!"));
}

#[tokio::test]
async fn blank_username_patch_is_rejected() {
    let h = Harness::lifecycle().await;
    let adapter = h.adapter("admin");
    let key = adapter.create(alice(), false, Some(true), true).await.unwrap().value.0;

    let mut patch = IdentityPatch::new(key);
    patch.username = Some(" ".into());
    assert!(matches!(
        adapter.update(patch).await,
        Err(WorkflowError::InvalidEntity(_))
    ));
    assert_eq!(h.identity(key).await.username, "alice");
}

#[tokio::test]
async fn execute_requires_a_key() {
    let h = Harness::lifecycle().await;
    let adapter = h.adapter("admin");
    assert!(matches!(
        adapter.execute(IdentityDraft::new("alice"), "suspend").await,
        Err(WorkflowError::Validation(_))
    ));

    let key = adapter.create(alice(), false, Some(true), true).await.unwrap().value.0;
    let mut draft = IdentityDraft::from(&h.identity(key).await);
    draft.password = Some("password123".into());
    let executed = adapter.execute(draft, "suspend").await.unwrap();
    assert!(executed.performed_tasks.contains("suspend"));
    assert_eq!(h.identity(key).await.status.as_deref(), Some("suspended"));

    let snapshot = adapter.activity_snapshot(key).await.unwrap();
    assert!(snapshot.contains("suspended"));
    assert!(!snapshot.contains("reactivate"));
}

#[tokio::test]
async fn cardinality_policy_on_ended_process() {
    for policy in [TaskCardinalityPolicy::Warn, TaskCardinalityPolicy::Fail] {
        let config = WorkflowConfig::default()
            .with_process_key("quickWorkflow")
            .with_task_cardinality(policy);
        let h = Harness::new(config).await;
        let adapter = h.adapter("admin");
        adapter
            .definitions()
            .import_definition("quickWorkflow", DefinitionFormat::Xml, QUICK_WORKFLOW.as_bytes())
            .await
            .unwrap();

        let result = adapter.create(alice(), false, None, true).await;
        match policy {
            TaskCardinalityPolicy::Warn => {
                let key = result.unwrap().value.0;
                assert_eq!(h.identity(key).await.status, None);
            }
            TaskCardinalityPolicy::Fail => {
                assert!(matches!(result, Err(WorkflowError::Workflow { .. })));
                assert!(h.store.is_empty().unwrap());
                assert_eq!(h.engine.query_tasks(&TaskQuery::default()).await.unwrap().total, 0);
            }
        }
    }
}
