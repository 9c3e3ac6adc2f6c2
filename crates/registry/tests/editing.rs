use proptest::prelude::*;
use serde_json::json;
use toolflow_registry::{ConfirmationPolicy, EDIT_TOOL, EditSession, Resolution, apply_patches};
use toolflow_types::{ConfirmationStatus, ExecutionMode, StepConfig, Tool, ToolDiff};

fn load_fixture() -> Tool {
    serde_json::from_value(json!({
        "id": "crm-contacts",
        "steps": [{
            "id": "contacts",
            "config": {
                "type": "request",
                "systemId": "crm",
                "url": "https://crm.example.com/contacts",
                "headers": {"Accept": "application/json"}
            }
        }]
    }))
    .expect("fixture tool")
}

#[test]
fn replace_of_unset_output_transform_leaves_document_unchanged() {
    let tool = load_fixture();
    let error = apply_patches(&tool, &[ToolDiff::replace("/outputTransform", json!("(ctx) => ctx.contacts.data"))])
        .expect_err("outputTransform is unset");
    assert_eq!(error.error_code(), "PATH_UNRESOLVABLE");
    assert_eq!(tool, load_fixture());
}

#[test]
fn partial_approval_applies_exactly_the_approved_diffs() {
    let policy = ConfirmationPolicy::auto().with_mode(EDIT_TOOL, ExecutionMode::ConfirmBeforeExecution);
    let mut session = EditSession::new(policy);
    let draft_id = session.create_draft(load_fixture());
    let patches = vec![
        ToolDiff::add("/instruction", json!("List CRM contacts")),
        ToolDiff::replace("/steps/0/config/url", json!("https://crm.example.com/v2/contacts")),
        ToolDiff::add("/outputTransform", json!("(ctx) => ctx.contacts.data")),
    ];

    let record = session.propose_edit("call-1", &draft_id, patches.clone()).expect("propose");
    assert_eq!(record.status, ConfirmationStatus::AwaitingConfirmation);
    assert!(record.proposed_document().is_none());
    assert_eq!(session.drafts().get(&draft_id), Some(&load_fixture()));

    let record = session
        .resolve("call-1", Resolution::Partial { approved: vec![2, 0] })
        .expect("partial approval");
    assert_eq!(record.status, ConfirmationStatus::Completed);
    assert_eq!(record.applied_diffs, vec![patches[0].clone(), patches[2].clone()]);
    assert_eq!(record.rejected_diffs, vec![patches[1].clone()]);

    let draft = session.drafts().get(&draft_id).expect("draft");
    assert_eq!(draft.instruction.as_deref(), Some("List CRM contacts"));
    assert_eq!(draft.output_transform.as_deref(), Some("(ctx) => ctx.contacts.data"));
    let StepConfig::Request(request) = &draft.steps[0].config else {
        panic!("request step expected");
    };
    assert_eq!(request.url, "https://crm.example.com/contacts");
}

#[test]
fn misspelled_fields_fail_the_edit_instead_of_vanishing() {
    let mut session = EditSession::new(ConfirmationPolicy::auto());
    let draft_id = session.create_draft(load_fixture());

    let error = session
        .propose_edit("call-typo", &draft_id, vec![ToolDiff::add("/steps/0/dataSelectr", json!("<<contacts>>"))])
        .expect_err("unknown member");
    assert_eq!(error.error_code(), "UNKNOWN_FIELDS");

    let record = session.confirmations().get("call-typo").expect("record kept");
    assert_eq!(record.status, ConfirmationStatus::Error);
    assert!(record.applied_diffs.is_empty());
    assert_eq!(session.drafts().get(&draft_id), Some(&load_fixture()));
}

fn independent_patch() -> impl Strategy<Value = ToolDiff> {
    prop_oneof![
        ("[A-Z][a-z]{1,6}", "[a-z0-9]{0,8}").prop_map(|(name, value)| ToolDiff::add(format!("/steps/0/config/headers/{name}"), json!(value))),
        "[a-z ]{1,12}".prop_map(|instruction| ToolDiff::add("/instruction", json!(instruction))),
        "[a-z]{1,8}".prop_map(|path| ToolDiff::replace("/steps/0/config/url", json!(format!("https://crm.example.com/{path}")))),
        Just(ToolDiff::test("/id", json!("crm-contacts"))),
    ]
}

proptest! {
    #[test]
    fn empty_batch_is_identity(_seed in 0u8..4) {
        let tool = load_fixture();
        let outcome = apply_patches(&tool, &[]).expect("empty batch");
        prop_assert_eq!(outcome.document, tool);
        prop_assert!(outcome.diffs.is_empty());
    }

    #[test]
    fn reapplying_diffs_reproduces_the_document(patches in prop::collection::vec(independent_patch(), 0..8)) {
        let tool = load_fixture();
        let outcome = apply_patches(&tool, &patches).expect("independent patches apply");
        let replayed = apply_patches(&tool, &outcome.diffs).expect("diffs replay");
        prop_assert_eq!(replayed.document, outcome.document);
    }

    #[test]
    fn partial_approval_matches_filtered_diffs(
        patches in prop::collection::vec(independent_patch(), 1..8),
        mask in prop::collection::vec(any::<bool>(), 8),
    ) {
        let tool = load_fixture();
        let full = apply_patches(&tool, &patches).expect("full batch");
        let approved: Vec<usize> = (0..patches.len()).filter(|index| mask[*index]).collect();
        let filtered: Vec<ToolDiff> = approved.iter().map(|index| full.diffs[*index].clone()).collect();
        let expected = apply_patches(&tool, &filtered).expect("filtered diffs");

        let mut session = EditSession::default();
        let draft_id = session.create_draft(tool);
        session.propose_edit("call", &draft_id, patches.clone()).expect("propose");
        let record = session.resolve("call", Resolution::Partial { approved: approved.clone() }).expect("partial");

        prop_assert_eq!(record.status, ConfirmationStatus::Completed);
        prop_assert_eq!(record.applied_diffs.len() + record.rejected_diffs.len(), patches.len());
        prop_assert_eq!(session.drafts().get(&draft_id), Some(&expected.document));
    }
}
