use jobstep_core::model::{BuildPlan, CommandSpec};
use jobstep_core::validation::{parse_document, validate_plan, PlanError};

fn command(id: &str, script: &str) -> CommandSpec {
    CommandSpec {
        id: id.into(),
        script: script.into(),
        ..Default::default()
    }
}

fn plan(commands: Vec<CommandSpec>) -> BuildPlan {
    BuildPlan {
        jobstep_id: "job_1".into(),
        workspace: "/tmp".into(),
        repository: Default::default(),
        source: Default::default(),
        commands,
    }
}

#[test]
fn allows_empty_command_list() {
    assert!(validate_plan(&plan(vec![])).is_ok());
}

#[test]
fn allows_well_formed_plan() {
    let p = plan(vec![command("cmd_1", "echo hi"), command("cmd_2", "exit 1")]);
    assert!(validate_plan(&p).is_ok());
}

#[test]
fn blocks_empty_jobstep_id() {
    let mut p = plan(vec![]);
    p.jobstep_id = " ".into();
    assert!(matches!(validate_plan(&p), Err(PlanError::EmptyJobStepId)));
}

#[test]
fn blocks_empty_workspace() {
    let mut p = plan(vec![]);
    p.workspace = "".into();
    assert!(matches!(validate_plan(&p), Err(PlanError::EmptyWorkspace)));
}

#[test]
fn blocks_duplicate_command_ids() {
    let p = plan(vec![command("cmd_1", "true"), command("cmd_1", "true")]);
    match validate_plan(&p) {
        Err(PlanError::DuplicateCommandId { index, id }) => {
            assert_eq!(index, 1);
            assert_eq!(id, "cmd_1");
        }
        other => panic!("unexpected: {other:?}"),
    }
}

#[test]
fn blocks_ids_that_escape_the_path() {
    for id in ["../x", "a/b", "a b", "..", "a?b"] {
        let p = plan(vec![command(id, "true")]);
        assert!(
            matches!(validate_plan(&p), Err(PlanError::UnsafeId { .. })),
            "id '{id}' should be rejected"
        );
    }
}

#[test]
fn allows_empty_script() {
    let p = plan(vec![command("cmd_1", ""), command("cmd_2", "   ")]);
    assert!(validate_plan(&p).is_ok());
}

#[test]
fn rejects_malformed_document() {
    assert!(matches!(
        parse_document(b"{\"commands\": 3}"),
        Err(PlanError::Document(_))
    ));
}
