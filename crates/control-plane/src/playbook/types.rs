//! NoETL DSL v2 Types
//!
//! Complete type definitions for NoETL playbooks:
//! - tool.kind pattern for tool configuration
//! - Step-level `next[].{when,then,else}` conditional routing
//! - Step-level loop for iteration, with a configurable result-selection policy
//! - Event-driven architecture

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Supported tool kinds.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ToolKind {
    Http,
    Postgres,
    Duckdb,
    Ducklake,
    Python,
    Workbook,
    Playbook,
    Playbooks,
    Secrets,
    Iterator,
    Container,
    Script,
    Snowflake,
    Transfer,
    SnowflakeTransfer,
    Gcs,
    Noop,
}

impl std::fmt::Display for ToolKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ToolKind::Http => "http",
            ToolKind::Postgres => "postgres",
            ToolKind::Duckdb => "duckdb",
            ToolKind::Ducklake => "ducklake",
            ToolKind::Python => "python",
            ToolKind::Workbook => "workbook",
            ToolKind::Playbook => "playbook",
            ToolKind::Playbooks => "playbooks",
            ToolKind::Secrets => "secrets",
            ToolKind::Iterator => "iterator",
            ToolKind::Container => "container",
            ToolKind::Script => "script",
            ToolKind::Snowflake => "snowflake",
            ToolKind::Transfer => "transfer",
            ToolKind::SnowflakeTransfer => "snowflake_transfer",
            ToolKind::Gcs => "gcs",
            ToolKind::Noop => "noop",
        };
        write!(f, "{}", s)
    }
}

/// Tool specification with tool.kind pattern.
/// All execution-specific fields live under tool.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolSpec {
    /// Tool type.
    pub kind: ToolKind,

    /// Authentication configuration.
    #[serde(default)]
    pub auth: Option<serde_json::Value>,

    /// Libraries/dependencies.
    #[serde(default)]
    pub libs: Option<serde_json::Value>,

    /// Default arguments.
    #[serde(default)]
    pub args: Option<serde_json::Value>,

    /// Python code (for python tool).
    #[serde(default)]
    pub code: Option<String>,

    /// URL (for http tool).
    #[serde(default)]
    pub url: Option<String>,

    /// HTTP method (for http tool).
    #[serde(default)]
    pub method: Option<String>,

    /// Query/SQL (for database tools).
    #[serde(default)]
    pub query: Option<String>,

    /// Shell/container command (for script/container tools).
    #[serde(default)]
    pub command: Option<String>,

    /// Connection string or credential reference.
    #[serde(default)]
    pub connection: Option<String>,

    /// URL query parameters (for http tool).
    #[serde(default)]
    pub params: Option<HashMap<String, serde_json::Value>>,

    /// HTTP headers (for http tool).
    #[serde(default)]
    pub headers: Option<HashMap<String, serde_json::Value>>,

    /// Post-execution evaluation expression, applied to the raw plugin result
    /// before the `{status, data}` envelope is constructed.
    #[serde(default)]
    pub eval: Option<String>,

    /// Dotted path selecting a sub-value of the result to keep as `data`.
    #[serde(default)]
    pub output_select: Option<String>,

    /// Additional tool-specific configuration.
    #[serde(flatten)]
    pub extra: HashMap<String, serde_json::Value>,
}

/// A step's tool may be a single invocation or a sequential pipeline of
/// named tasks (workbook-style inline pipeline).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ToolDefinition {
    Single(ToolSpec),
    Pipeline(Vec<HashMap<String, ToolSpec>>),
}

/// Policy selector for picking one candidate result among several when
/// aggregating a nested-playbook loop iteration's final result.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ResultSelector {
    /// The child's `execution_complete` terminal result.
    ExecutionComplete,
    /// The `action_completed` result of the step named by `loop.return_step`.
    ReturnStep,
    /// The `action_completed` result of one of `loop.result_policy.named_steps`,
    /// tried in declared order.
    NamedSteps,
    /// Any meaningful (non-skipped, non-control) `action_completed` result.
    AnyCompleted,
    /// Any `result` event.
    ResultEvent,
    /// The child's `end` step result.
    EndStep,
}

/// Configurable tie-break order for loop result aggregation. Defaults to the
/// full order with an empty `named_steps` tier, rather than hardcoding any
/// particular playbook's step names.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResultSelectionPolicy {
    /// Step names tried, in order, for the `NamedSteps` tier.
    #[serde(default)]
    pub named_steps: Vec<String>,
    /// Override the full tier order. Defaults to the canonical order.
    #[serde(default = "ResultSelectionPolicy::default_order")]
    pub order: Vec<ResultSelector>,
}

impl Default for ResultSelectionPolicy {
    fn default() -> Self {
        Self {
            named_steps: Vec::new(),
            order: Self::default_order(),
        }
    }
}

impl ResultSelectionPolicy {
    fn default_order() -> Vec<ResultSelector> {
        vec![
            ResultSelector::ExecutionComplete,
            ResultSelector::ReturnStep,
            ResultSelector::NamedSteps,
            ResultSelector::AnyCompleted,
            ResultSelector::ResultEvent,
            ResultSelector::EndStep,
        ]
    }
}

/// Loop execution mode.
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum LoopMode {
    #[default]
    Sequential,
    Parallel,
    Async,
}

/// Step-level loop configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Loop {
    /// Jinja expression for collection to iterate over.
    #[serde(rename = "in")]
    pub in_expr: String,

    /// Variable name for each item.
    pub iterator: String,

    /// Execution mode.
    #[serde(default)]
    pub mode: LoopMode,

    /// Step name in the child playbook whose result should be preferred
    /// when aggregating (the `ReturnStep` tier of `ResultSelectionPolicy`).
    #[serde(default)]
    pub return_step: Option<String>,

    /// Tie-break policy for selecting a child execution's final result.
    #[serde(default)]
    pub result_policy: Option<ResultSelectionPolicy>,
}

/// A single branch of a step's `next[]` routing list.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NextTarget {
    /// Target step name.
    pub step: String,

    /// Condition guarding this branch; absent means unconditional.
    #[serde(default)]
    pub when: Option<String>,

    /// Arguments to pass to target step.
    #[serde(default)]
    pub args: Option<HashMap<String, serde_json::Value>>,

    /// When true, a non-matching `when` still "fires" this branch as a
    /// structural no-op pass-through rather than being silently skipped.
    #[serde(default)]
    pub pass: bool,
}

/// Routing mode for a step's `next[]` list.
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum NextMode {
    #[default]
    Exclusive,
    Inclusive,
}

/// Spec block for per-step routing configuration.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct RouterSpec {
    #[serde(default)]
    pub mode: Option<String>,
}

/// A single router arc: `when` condition plus target step and args.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Arc {
    #[serde(default)]
    pub when: Option<String>,
    pub step: String,
    #[serde(default)]
    pub args: Option<HashMap<String, serde_json::Value>>,
}

/// Router form of `next`: explicit spec (mode) plus a list of arcs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Router {
    #[serde(default)]
    pub spec: Option<RouterSpec>,
    pub arcs: Vec<Arc>,
}

/// Next step specification - string, list of strings, router, or target list.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum NextSpec {
    /// Single step name, unconditional.
    Single(String),

    /// List of step names, unconditional parallel branches.
    List(Vec<String>),

    /// Router with explicit mode and when-guarded arcs.
    Router(Router),

    /// List of step targets with optional when/args ("then"/"else" form).
    Targets(Vec<NextTarget>),
}

/// Step-level spec block controlling evaluation behavior.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct StepSpec {
    /// Overrides the default exclusive next-transition evaluation mode.
    #[serde(default)]
    pub next_mode: Option<String>,
}

/// Step node type.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum StepType {
    #[default]
    Task,
    Workbook,
    Iterator,
    Playbook,
    End,
}

/// Workflow step with event-driven control flow.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Step {
    /// Step name (unique identifier).
    pub step: String,

    /// Step description.
    #[serde(default)]
    pub desc: Option<String>,

    /// Step node type. Defaults to `task` when absent.
    #[serde(default, rename = "type")]
    pub step_type: StepType,

    /// Step-level evaluation spec (next_mode override).
    #[serde(default)]
    pub spec: Option<StepSpec>,

    /// Enable guard: step is skipped (no event emitted) when this evaluates
    /// false.
    #[serde(default)]
    pub when: Option<String>,

    /// Input arguments for this step (from previous steps or templates).
    #[serde(default)]
    pub args: Option<HashMap<String, serde_json::Value>>,

    /// Variables to extract from step result.
    #[serde(default)]
    pub vars: Option<HashMap<String, serde_json::Value>>,

    /// Loop configuration, present when step_type is `iterator`.
    #[serde(default)]
    pub r#loop: Option<Loop>,

    /// Tool configuration with tool.kind (single invocation or pipeline).
    pub tool: ToolDefinition,

    /// Optional sink/save directive evaluated after a successful result.
    #[serde(default)]
    pub save: Option<serde_json::Value>,

    /// Structural/conditional next step(s).
    #[serde(default)]
    pub next: Option<NextSpec>,
}

/// Reusable task definition in workbook.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkbookTask {
    /// Task name.
    pub name: String,

    /// Tool configuration.
    pub tool: ToolSpec,

    /// Optional sink configuration.
    #[serde(default)]
    pub sink: Option<serde_json::Value>,
}

/// Keychain entry for credential/token definitions.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KeychainDef {
    /// Keychain entry name.
    pub name: String,

    /// Credential reference.
    #[serde(default)]
    pub credential: Option<String>,

    /// Token type.
    #[serde(default)]
    pub token_type: Option<String>,

    /// Scope type.
    #[serde(default)]
    pub scope: Option<String>,

    /// Auto-renew flag.
    #[serde(default)]
    pub auto_renew: bool,

    /// Additional configuration.
    #[serde(flatten)]
    pub extra: HashMap<String, serde_json::Value>,
}

/// Playbook metadata.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Metadata {
    /// Playbook name (required).
    pub name: String,

    /// Resource path.
    #[serde(default)]
    pub path: Option<String>,

    /// Description.
    #[serde(default)]
    pub description: Option<String>,

    /// Labels for filtering.
    #[serde(default)]
    pub labels: Option<HashMap<String, String>>,

    /// Additional metadata.
    #[serde(flatten)]
    pub extra: HashMap<String, serde_json::Value>,
}

/// Complete workflow definition (v2).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Playbook {
    /// API version (noetl.io/v2).
    #[serde(rename = "apiVersion")]
    pub api_version: String,

    /// Resource kind (Playbook).
    pub kind: String,

    /// Metadata (name, path, labels).
    pub metadata: Metadata,

    /// Global workflow variables.
    #[serde(default)]
    pub workload: Option<serde_json::Value>,

    /// Keychain definitions for credentials and tokens.
    #[serde(default)]
    pub keychain: Option<Vec<KeychainDef>>,

    /// Reusable tasks.
    #[serde(default)]
    pub workbook: Option<Vec<WorkbookTask>>,

    /// Workflow steps.
    pub workflow: Vec<Step>,
}

impl Playbook {
    /// Check if workflow has a start step.
    pub fn has_start_step(&self) -> bool {
        self.workflow.iter().any(|s| s.step == "start")
    }

    /// Get a step by name.
    pub fn get_step(&self, name: &str) -> Option<&Step> {
        self.workflow.iter().find(|s| s.step == name)
    }

    /// Get all step names.
    pub fn step_names(&self) -> Vec<&str> {
        self.workflow.iter().map(|s| s.step.as_str()).collect()
    }

    /// Get the resource path.
    pub fn path(&self) -> Option<&str> {
        self.metadata.path.as_deref()
    }

    /// Get the playbook name.
    pub fn name(&self) -> &str {
        &self.metadata.name
    }

    /// Look up a workbook task by name, for workbook-step task-name aliasing.
    pub fn get_workbook_task(&self, name: &str) -> Option<&WorkbookTask> {
        self.workbook
            .as_ref()
            .and_then(|tasks| tasks.iter().find(|t| t.name == name))
    }
}

// ============================================================================
// Tool Call and Command Models
// ============================================================================

/// Tool invocation details, flattened for transmission to a worker.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolCall {
    /// Tool kind.
    pub kind: ToolKind,

    /// Tool-specific configuration, flattened alongside `kind` on the wire so
    /// a worker can deserialize the whole thing straight into
    /// `noetl_tools::registry::ToolConfig`.
    #[serde(flatten, default)]
    pub config: HashMap<String, serde_json::Value>,
}

impl ToolCall {
    /// Create from a ToolSpec.
    pub fn from_spec(spec: &ToolSpec) -> Self {
        let mut config = spec.extra.clone();

        if let Some(ref auth) = spec.auth {
            config.insert("auth".to_string(), auth.clone());
        }
        if let Some(ref libs) = spec.libs {
            config.insert("libs".to_string(), libs.clone());
        }
        if let Some(ref args) = spec.args {
            config.insert("args".to_string(), args.clone());
        }
        if let Some(ref code) = spec.code {
            config.insert("code".to_string(), serde_json::Value::String(code.clone()));
        }
        if let Some(ref url) = spec.url {
            config.insert("url".to_string(), serde_json::Value::String(url.clone()));
        }
        if let Some(ref method) = spec.method {
            config.insert(
                "method".to_string(),
                serde_json::Value::String(method.clone()),
            );
        }
        if let Some(ref query) = spec.query {
            config.insert(
                "query".to_string(),
                serde_json::Value::String(query.clone()),
            );
        }
        if let Some(ref command) = spec.command {
            config.insert(
                "command".to_string(),
                serde_json::Value::String(command.clone()),
            );
        }
        if let Some(ref connection) = spec.connection {
            config.insert(
                "connection".to_string(),
                serde_json::Value::String(connection.clone()),
            );
        }
        if let Some(ref params) = spec.params {
            config.insert(
                "params".to_string(),
                serde_json::to_value(params).unwrap_or(serde_json::Value::Null),
            );
        }
        if let Some(ref headers) = spec.headers {
            config.insert(
                "headers".to_string(),
                serde_json::to_value(headers).unwrap_or(serde_json::Value::Null),
            );
        }
        if let Some(ref eval) = spec.eval {
            config.insert("eval".to_string(), serde_json::Value::String(eval.clone()));
        }
        if let Some(ref output_select) = spec.output_select {
            config.insert(
                "output_select".to_string(),
                serde_json::Value::String(output_select.clone()),
            );
        }

        Self {
            kind: spec.kind.clone(),
            config,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_simple_playbook() {
        let yaml = r#"
apiVersion: noetl.io/v2
kind: Playbook
metadata:
  name: test_playbook
  path: test/simple
workflow:
  - step: start
    tool:
      kind: python
      code: |
        return {"status": "ok"}
    next:
      - step: end
  - step: end
    type: end
    tool:
      kind: python
      code: |
        return {"status": "done"}
"#;

        let playbook: Playbook = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(playbook.api_version, "noetl.io/v2");
        assert_eq!(playbook.kind, "Playbook");
        assert_eq!(playbook.name(), "test_playbook");
        assert!(playbook.has_start_step());
        assert_eq!(playbook.workflow.len(), 2);
        assert_eq!(playbook.get_step("end").unwrap().step_type, StepType::End);
    }

    #[test]
    fn test_parse_playbook_with_loop() {
        let yaml = r#"
apiVersion: noetl.io/v2
kind: Playbook
metadata:
  name: loop_test
workload:
  items: [1, 2, 3]
workflow:
  - step: start
    type: iterator
    loop:
      in: "{{ workload.items }}"
      iterator: item
      mode: sequential
    tool:
      kind: python
      code: |
        return {"item": input_data.get("item")}
    args:
      item: "{{ item }}"
"#;

        let playbook: Playbook = serde_yaml::from_str(yaml).unwrap();
        let step = playbook.get_step("start").unwrap();
        assert_eq!(step.step_type, StepType::Iterator);
        assert!(step.r#loop.is_some());
        let loop_config = step.r#loop.as_ref().unwrap();
        assert_eq!(loop_config.iterator, "item");
        assert_eq!(loop_config.mode, LoopMode::Sequential);
    }

    #[test]
    fn test_parse_playbook_with_next_targets() {
        let yaml = r#"
apiVersion: noetl.io/v2
kind: Playbook
metadata:
  name: case_test
workflow:
  - step: start
    tool:
      kind: python
      code: |
        return {"value": 10}
    next:
      - step: high
        when: "{{ result.value > 5 }}"
      - step: low
        when: "{{ result.value <= 5 }}"
  - step: high
    tool:
      kind: python
      code: |
        return {"path": "high"}
  - step: low
    tool:
      kind: python
      code: |
        return {"path": "low"}
"#;

        let playbook: Playbook = serde_yaml::from_str(yaml).unwrap();
        let step = playbook.get_step("start").unwrap();
        match step.next.as_ref().unwrap() {
            NextSpec::Targets(targets) => {
                assert_eq!(targets.len(), 2);
                assert_eq!(targets[0].when.as_deref(), Some("{{ result.value > 5 }}"));
            }
            other => panic!("expected Targets, got {:?}", other),
        }
    }

    #[test]
    fn test_tool_call_from_spec() {
        let spec = ToolSpec {
            kind: ToolKind::Python,
            auth: None,
            libs: None,
            args: None,
            code: Some("return {}".to_string()),
            url: None,
            method: None,
            query: None,
            command: None,
            connection: None,
            params: None,
            headers: None,
            eval: None,
            output_select: None,
            extra: HashMap::new(),
        };

        let call = ToolCall::from_spec(&spec);
        assert_eq!(call.kind, ToolKind::Python);
        assert!(call.config.contains_key("code"));
    }

    #[test]
    fn test_step_names() {
        let yaml = r#"
apiVersion: noetl.io/v2
kind: Playbook
metadata:
  name: test
workflow:
  - step: start
    tool:
      kind: python
      code: ""
  - step: process
    tool:
      kind: python
      code: ""
  - step: end
    tool:
      kind: python
      code: ""
"#;

        let playbook: Playbook = serde_yaml::from_str(yaml).unwrap();
        let names = playbook.step_names();
        assert_eq!(names, vec!["start", "process", "end"]);
    }

    #[test]
    fn test_result_selection_policy_default_order() {
        let policy = ResultSelectionPolicy::default();
        assert!(policy.named_steps.is_empty());
        assert_eq!(policy.order.first(), Some(&ResultSelector::ExecutionComplete));
        assert_eq!(policy.order.last(), Some(&ResultSelector::EndStep));
    }

    #[test]
    fn test_tool_definition_pipeline_parses() {
        let yaml = r#"
kind: python
code: "a"
---
"#;
        // ToolDefinition::Single parses a bare ToolSpec
        let single: ToolDefinition = serde_yaml::from_str(
            r#"
kind: python
code: "return {}"
"#,
        )
        .unwrap();
        assert!(matches!(single, ToolDefinition::Single(_)));
        let _ = yaml;
    }
}
