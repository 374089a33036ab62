//! Workflow loading, validation and execution end to end.

use async_trait::async_trait;
use llm_router::config::RouterSettings;
use llm_router::providers::{Script, ScriptedProvider};
use llm_router::workflow::{
    problems, PromptCall, PromptRunner, RunStatus, StepStatus, TemplateStore, Variables,
    WorkflowLoader,
};
use llm_router::{BackendKind, ErrorKind, ModelDescriptor, Router, Workflow, WorkflowEngine};
use serde_json::json;
use std::sync::{Arc, Mutex};
use tokio_util::sync::CancellationToken;

const LOOP_AND_CONDITION: &str = r#"
id: numbers
description: Ask about each number, then summarize when there are enough.
inputs: [items]
default_model: m-chat-a
steps:
  - name: each
    type: loop
    over: items
    output_var: results
    steps:
      - name: ask
        type: prompt
        prompt: "n={{ item }}"
        output_var: line
  - name: enough
    type: conditional
    expression: "{{ results | length > 2 }}"
    then:
      - name: summary
        type: prompt
        prompt: "summarize {{ results | json }}"
        output_var: summary
    else: []
"#;

/// Answers every prompt with its own text.
#[derive(Default)]
struct Echo {
    prompts: Mutex<Vec<String>>,
}

#[async_trait]
impl PromptRunner for Echo {
    async fn run_prompt(&self, call: PromptCall) -> llm_router::Result<String> {
        self.prompts.lock().unwrap().push(call.prompt.clone());
        Ok(call.prompt)
    }
}

fn vars(v: serde_json::Value) -> Variables {
    v.as_object().cloned().unwrap()
}

#[tokio::test]
async fn test_loop_then_condition_runs_summary() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(dir.path().join("numbers.yaml"), LOOP_AND_CONDITION).unwrap();
    let loader = Arc::new(WorkflowLoader::open(dir.path()).await.unwrap());

    let workflow = loader.load("numbers").await.unwrap();
    assert!(problems(&workflow, loader.templates()).is_empty());

    let echo = Arc::new(Echo::default());
    let engine = WorkflowEngine::new(echo.clone()).with_loader(loader);
    let run = engine
        .execute("numbers", vars(json!({"items": [1, 2, 3]})))
        .await
        .unwrap();

    assert_eq!(run.status, RunStatus::Completed, "{:?}", run.error);
    assert_eq!(run.output("results"), Some(&json!(["n=1", "n=2", "n=3"])));
    assert_eq!(
        run.output("summary"),
        Some(&json!(r#"summarize ["n=1","n=2","n=3"]"#))
    );
    assert_eq!(run.record("enough/summary").unwrap().status, StepStatus::Succeeded);
    assert_eq!(run.record("each[2]/ask").unwrap().output, Some(json!("n=3")));
    assert_eq!(echo.prompts.lock().unwrap().len(), 4);
}

#[tokio::test]
async fn test_short_list_skips_summary() {
    let workflow: Workflow = serde_yaml::from_str(LOOP_AND_CONDITION).unwrap();
    let engine = WorkflowEngine::new(Arc::new(Echo::default()));
    let run = engine
        .execute_workflow(&workflow, vars(json!({"items": [7]})), CancellationToken::new())
        .await
        .unwrap();
    assert!(run.is_success());
    assert_eq!(run.output("results"), Some(&json!(["n=7"])));
    assert_eq!(run.output("enough"), None);
    assert!(run.output("summary").is_none());
}

#[test]
fn test_static_validation_reports_every_problem() {
    let yaml = r#"
id: broken
steps:
  - {name: a, type: prompt, prompt: "{{ missing }}", output_var: x}
  - {name: c, type: template, template: nowhere}
  - {name: d, type: extract, from: x, output_var: "not valid"}
"#;
    let workflow: Workflow = serde_yaml::from_str(yaml).unwrap();
    let found: Vec<String> = problems(&workflow, &TemplateStore::new())
        .iter()
        .map(ToString::to_string)
        .collect();
    assert!(found.len() >= 3, "{:?}", found);
    let text = found.join("\n");
    assert!(text.contains("missing"), "{}", text);
    assert!(text.contains("nowhere"), "{}", text);
    assert!(text.contains("not valid"), "{}", text);
}

#[test]
fn test_dependency_cycle_rejected() {
    let yaml = r#"
id: cyclic
steps:
  - {name: d, type: sleep, duration_ms: 1, depends_on: [e]}
  - {name: e, type: sleep, duration_ms: 1, depends_on: [d]}
"#;
    let workflow: Workflow = serde_yaml::from_str(yaml).unwrap();
    let err = llm_router::workflow::validate(&workflow, &TemplateStore::new()).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidRequest);
    assert!(err.to_string().contains("cycle"), "{}", err);
}

#[tokio::test]
async fn test_router_runs_prompt_steps() {
    let provider = Arc::new(
        ScriptedProvider::new("p1", BackendKind::RemoteChatHttp)
            .then(Script::reply("rust"))
            .always(Script::reply("done")),
    );
    let router = Router::builder()
        .with_model(ModelDescriptor::new("m-chat-a", BackendKind::RemoteChatHttp, "gpt-x"))
        .with_provider(provider.clone())
        .with_settings(RouterSettings::default())
        .build()
        .unwrap();

    let workflow: Workflow = serde_yaml::from_str(
        r#"
id: two-step
inputs: [question]
default_model: m-chat-a
steps:
  - name: classify
    type: prompt
    prompt: "{{ question }}"
    system: "answer with one word"
    params: {temperature: 0.1}
    output_var: topic
  - name: answer
    type: prompt
    prompt: "tell me about {{ topic }}"
    output_var: answer
"#,
    )
    .unwrap();

    let engine = router.workflow_engine().await.unwrap();
    let run = engine
        .execute_workflow(&workflow, vars(json!({"question": "which language?"})), CancellationToken::new())
        .await
        .unwrap();
    assert!(run.is_success(), "{:?}", run.error);
    assert_eq!(run.output("answer"), Some(&json!("done")));

    let calls = provider.recorded();
    assert_eq!(calls.len(), 2);
    assert_eq!(calls[0].messages.len(), 2);
    assert_eq!(calls[0].params["temperature"], 0.1);
    assert_eq!(calls[1].messages[0].content, "tell me about rust");
    assert!(calls.iter().all(|c| c.trace_id == run.trace_id));
}

#[tokio::test]
async fn test_provider_failure_surfaces_as_failed_run() {
    let router = Router::builder()
        .with_model(ModelDescriptor::new("m-chat-a", BackendKind::RemoteChatHttp, "gpt-x"))
        .with_provider(Arc::new(
            ScriptedProvider::new("p1", BackendKind::RemoteChatHttp)
                .always(Script::fail(ErrorKind::Auth, "bad key")),
        ))
        .build()
        .unwrap();
    let workflow: Workflow = serde_yaml::from_str(
        "id: one\nsteps:\n  - {name: ask, type: prompt, prompt: hi, model: m-chat-a}\n",
    )
    .unwrap();
    let run = router
        .workflow_engine()
        .await
        .unwrap()
        .execute_workflow(&workflow, Variables::new(), CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(run.status, RunStatus::Failed);
    assert_eq!(run.error_kind, Some(ErrorKind::Auth));
    assert_eq!(run.record("ask").unwrap().status, StepStatus::Failed);
}

#[tokio::test]
async fn test_engine_without_loader_rejects_ids() {
    let engine = WorkflowEngine::new(Arc::new(Echo::default()));
    let err = engine.execute("numbers", Variables::new()).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidRequest);
}
