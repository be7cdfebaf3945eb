use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use serde_json::{json, Value};

use arbor_history::{HistoryCompactor, ProviderSummarizer};
use arbor_providers::{ChatClient, ProviderError};
use arbor_types::{
    ActionBatch, ActionRecord, ActionSpec, ActionStatus, ActionType, ChatOptions, DecisionMode,
    LlmCall, PromptMessage, ResponseFormat, Role,
};

use crate::run::Run;

const PLANNER_TEMPERATURE: f64 = 0.2;
const REPAIR_ATTEMPTS: usize = 2;
const PRIOR_RECORDS_IN_PROMPT: usize = 40;
const MIN_PRIORITY: i64 = 1;
const MAX_PRIORITY: i64 = 5;
const MIN_TIMEOUT_SEC: u64 = 1;
const MAX_TIMEOUT_SEC: u64 = 600;

const PLANNER_SYSTEM_PROMPT: &str = r#"You are the action planner of a code-editing agent.

Given the input context, emit the next ActionBatch as a single JSON object. Rules:
1) Do not assume a fixed workflow; decide only the next batch of actions.
2) Every action must be executable and verifiable; give each one success_criteria.
3) When information is missing, emit ask_user or request_approval instead of inventing file contents.
4) When the goal is satisfied, set decision.mode to "done" and include a final_answer action whose input.content carries the final reply text.
5) Return JSON only. No markdown fences, no prose around the object.
6) Discovery actions (search_code, read_files, extract_symbols, analyze_dependencies) must run after scan_workspace; express the ordering with depends_on.
7) create_file/update_file require input.path and input.content. apply_patch requires input.path and input.diff_unified.
8) When runtime_constraints.chat_only is true, plan no workspace mutations; answer with final_answer.
9) When runtime_constraints.planning_mode is true, plan no write actions; finish with a final_answer that lays out the plan step by step.
10) Read conversation_history (and conversation_summary when present) before deciding; original_user_query alone is not the whole picture.

Output shape:
{
  "version": "1.0",
  "iteration": 1,
  "summary": "goal of this batch",
  "decision": {
    "mode": "continue|ask_user|done|blocked",
    "reason": "optional",
    "needs_user_trigger": false,
    "satisfaction_score": 0.0
  },
  "actions": [
    {
      "id": "a1",
      "type": "scan_workspace|read_files|search_code|extract_symbols|analyze_dependencies|summarize_context|propose_subplan|run_command|run_tests|run_lint|run_build|create_file|update_file|delete_file|move_file|apply_patch|validate_result|ask_user|request_approval|final_answer|report_blocker",
      "title": "short title",
      "reason": "why this action",
      "input": {},
      "depends_on": [],
      "can_parallel": false,
      "priority": 3,
      "timeout_sec": 120,
      "max_retries": 1,
      "success_criteria": ["criterion"],
      "artifacts": []
    }
  ],
  "acceptance": [],
  "risks": [],
  "next_questions": []
}"#;

#[derive(Debug, thiserror::Error)]
pub enum PlannerError {
    #[error("planner returned invalid output: {0}")]
    InvalidOutput(String),
    #[error(transparent)]
    Provider(#[from] ProviderError),
}

impl PlannerError {
    pub fn kind(&self) -> &'static str {
        match self {
            PlannerError::InvalidOutput(_) => "planner_invalid_output",
            PlannerError::Provider(err) => err.kind.as_str(),
        }
    }
}

pub struct PlanOutcome {
    pub batch: ActionBatch,
    pub llm: LlmCall,
}

/// Stateless planner: prompt assembly, JSON parsing, normalization, and
/// dependency validation with bounded repair retries.
pub struct Planner {
    chat: Arc<dyn ChatClient>,
    compactor: HistoryCompactor,
}

impl Planner {
    pub fn new(chat: Arc<dyn ChatClient>) -> Self {
        Self {
            chat,
            compactor: HistoryCompactor::new(),
        }
    }

    pub async fn next_batch(
        &self,
        run: &Run,
        iteration: u64,
        context_snapshot: Value,
    ) -> Result<PlanOutcome, PlannerError> {
        let summarizer = ProviderSummarizer::new(self.chat.clone(), run.provider_id.clone());
        let compacted = self
            .compactor
            .compact(&run.messages, &run.history_config, &summarizer)
            .await;

        let payload = json!({
            "original_user_query": run.latest_user_query(),
            "conversation_history": compacted
                .window
                .iter()
                .map(|m| json!({"role": m.role.as_str(), "content": m.content}))
                .collect::<Vec<_>>(),
            "conversation_omitted_count": compacted.omitted,
            "conversation_summary": compacted.summary.clone().unwrap_or_default(),
            "history_config": run.history_config,
            "iteration": iteration,
            "runtime_constraints": {
                "chat_only": run.request.chat_only,
                "planning_mode": run.request.planning_mode,
                "force_code_edit": run.request.force_code_edit,
            },
            "current_file": run.request.current_file,
            "snippets": run
                .request
                .snippets
                .as_deref()
                .unwrap_or_default()
                .iter()
                .take(50)
                .map(|s| json!({
                    "file_path": s.file_path,
                    "start_line": s.start_line,
                    "end_line": s.end_line,
                }))
                .collect::<Vec<_>>(),
            "context_snapshot": context_snapshot,
            "prior_actions": prior_actions_payload(&run.action_history),
            "available_actions": ActionType::ALL.iter().map(|t| t.as_str()).collect::<Vec<_>>(),
        });

        let mut messages = vec![
            PromptMessage::new(Role::System, PLANNER_SYSTEM_PROMPT),
            PromptMessage::new(Role::User, payload.to_string()),
        ];
        let options = ChatOptions {
            temperature: PLANNER_TEMPERATURE,
            response_format: ResponseFormat::JsonObject,
            ..ChatOptions::default()
        };

        let mut last_error = String::new();
        for attempt in 0..=REPAIR_ATTEMPTS {
            let outcome = self.chat.chat(&run.provider_id, &messages, &options).await?;
            let llm = outcome.llm_call();

            match parse_batch(&outcome.content, iteration) {
                Ok(batch) => {
                    let batch = normalize_batch(batch, iteration, &run.action_history);
                    match validate_batch(&batch, &run.action_history) {
                        Ok(()) => return Ok(PlanOutcome { batch, llm }),
                        Err(problem) => last_error = problem,
                    }
                }
                Err(problem) => last_error = problem,
            }

            if attempt < REPAIR_ATTEMPTS {
                tracing::warn!(attempt, "planner output invalid, requesting repair: {last_error}");
                messages.push(PromptMessage::new(Role::Assistant, outcome.content.clone()));
                messages.push(PromptMessage::new(
                    Role::User,
                    format!(
                        "Your previous output was invalid: {last_error}. \
                         Return the corrected ActionBatch as a single JSON object and nothing else."
                    ),
                ));
            }
        }

        Err(PlannerError::InvalidOutput(last_error))
    }
}

fn prior_actions_payload(history: &[ActionRecord]) -> Vec<Value> {
    history
        .iter()
        .rev()
        .take(PRIOR_RECORDS_IN_PROMPT)
        .rev()
        .map(|record| {
            json!({
                "iteration": record.iteration,
                "action_id": record.action_id,
                "action_type": record.action_type.as_str(),
                "status": record.status,
                "title": record.title,
                "error": record.error,
                "output": record.output,
            })
        })
        .collect()
}

/// Pull the JSON object out of the raw completion, tolerating code fences
/// and surrounding prose.
fn extract_json_payload(raw: &str) -> Result<Value, String> {
    let trimmed = raw.trim();

    if let Some(start) = trimmed.find("```") {
        let after = &trimmed[start + 3..];
        let after = after.strip_prefix("json").unwrap_or(after);
        if let Some(end) = after.find("```") {
            let candidate = after[..end].trim();
            if let Ok(value) = serde_json::from_str(candidate) {
                return Ok(value);
            }
        }
    }

    if let Ok(value) = serde_json::from_str(trimmed) {
        return Ok(value);
    }

    let start = trimmed.find('{');
    let end = trimmed.rfind('}');
    if let (Some(start), Some(end)) = (start, end) {
        if start < end {
            if let Ok(value) = serde_json::from_str(&trimmed[start..=end]) {
                return Ok(value);
            }
        }
    }

    Err("output is not a JSON object".to_string())
}

fn parse_batch(raw: &str, iteration: u64) -> Result<ActionBatch, String> {
    let mut payload = extract_json_payload(raw)?;
    if let Some(map) = payload.as_object_mut() {
        map.insert("iteration".to_string(), json!(iteration));
    }
    serde_json::from_value(payload).map_err(|err| format!("ActionBatch schema mismatch: {err}"))
}

/// Planner output is repaired where possible: missing or duplicate ids are
/// reassigned, final_answer forces a done decision, bounds are clamped, and
/// discovery actions get a scan_workspace prerequisite.
fn normalize_batch(
    mut batch: ActionBatch,
    iteration: u64,
    history: &[ActionRecord],
) -> ActionBatch {
    batch.iteration = iteration;

    if batch.actions.is_empty() && batch.decision.mode == DecisionMode::Continue {
        batch.decision.mode = DecisionMode::AskUser;
        batch.decision.needs_user_trigger = false;
        if batch.decision.reason.is_none() {
            batch.decision.reason = Some("planner returned no actions".to_string());
        }
    }

    let mut seen: HashSet<String> = HashSet::new();
    for (idx, action) in batch.actions.iter_mut().enumerate() {
        if action.id.trim().is_empty() || seen.contains(&action.id) {
            action.id = format!("a{}", idx + 1);
        }
        seen.insert(action.id.clone());

        if action.action_type == ActionType::FinalAnswer {
            batch.decision.mode = DecisionMode::Done;
            action.can_parallel = false;
        }
        if action.success_criteria.is_empty() {
            action.success_criteria = vec!["action completes with valid output".to_string()];
        }
        action.priority = action.priority.clamp(MIN_PRIORITY, MAX_PRIORITY);
        action.timeout_sec = action.timeout_sec.clamp(MIN_TIMEOUT_SEC, MAX_TIMEOUT_SEC);
    }

    if batch.decision.mode == DecisionMode::AskUser {
        batch.decision.needs_user_trigger = true;
    }

    ensure_scan_before_discovery(&mut batch.actions, history);
    batch
}

fn ensure_scan_before_discovery(actions: &mut Vec<ActionSpec>, history: &[ActionRecord]) {
    let needs_discovery = actions.iter().any(|a| a.action_type.is_discovery());
    if !needs_discovery {
        return;
    }

    let scanned_before = history.iter().any(|record| {
        record.action_type == ActionType::ScanWorkspace && record.status == ActionStatus::Completed
    });
    let mut scan_id = actions
        .iter()
        .find(|a| a.action_type == ActionType::ScanWorkspace)
        .map(|a| a.id.clone());

    if scan_id.is_none() && !scanned_before {
        let existing: HashSet<String> = actions.iter().map(|a| a.id.clone()).collect();
        let mut idx = 1;
        while existing.contains(&format!("a{idx}")) {
            idx += 1;
        }
        let id = format!("a{idx}");
        let scan: ActionSpec = serde_json::from_value(json!({
            "id": id.clone(),
            "type": "scan_workspace",
            "title": "Scan workspace structure",
            "reason": "Index the project before searching or reading files",
            "input": {"max_files": 300},
            "success_criteria": ["file list and counts returned"],
        }))
        .expect("static scan action");
        actions.insert(0, scan);
        scan_id = Some(id);
    }

    if let Some(scan_id) = scan_id {
        for action in actions.iter_mut() {
            if action.id == scan_id {
                continue;
            }
            if action.action_type.is_discovery() && !action.depends_on.contains(&scan_id) {
                action.depends_on.push(scan_id.clone());
                action.can_parallel = false;
            }
        }
    }
}

/// Structural checks that cannot be repaired locally: unknown dependency
/// targets, dependency cycles, and decision/action consistency.
fn validate_batch(batch: &ActionBatch, history: &[ActionRecord]) -> Result<(), String> {
    let ids: HashSet<&str> = batch.actions.iter().map(|a| a.id.as_str()).collect();
    let completed_prior: HashSet<&str> = history
        .iter()
        .filter(|r| r.status == ActionStatus::Completed)
        .map(|r| r.action_id.as_str())
        .collect();

    for action in &batch.actions {
        for dep in &action.depends_on {
            if !ids.contains(dep.as_str()) && !completed_prior.contains(dep.as_str()) {
                return Err(format!(
                    "action `{}` depends on unknown action `{dep}`",
                    action.id
                ));
            }
        }
    }

    detect_cycles(&batch.actions)?;

    match batch.decision.mode {
        DecisionMode::Done => {
            let has_final = batch
                .actions
                .iter()
                .any(|a| a.action_type == ActionType::FinalAnswer)
                || history.iter().any(|r| {
                    r.action_type == ActionType::FinalAnswer
                        && r.status == ActionStatus::Completed
                });
            if !has_final {
                return Err(
                    "decision.mode is `done` but no final_answer action exists".to_string()
                );
            }
        }
        DecisionMode::AskUser => {
            let has_user_input = batch.actions.iter().any(|a| a.action_type.is_user_input());
            if !has_user_input {
                return Err(
                    "decision.mode is `ask_user` but no ask_user/request_approval action exists"
                        .to_string(),
                );
            }
        }
        DecisionMode::Continue | DecisionMode::Blocked => {}
    }

    Ok(())
}

fn detect_cycles(actions: &[ActionSpec]) -> Result<(), String> {
    let by_id: HashMap<&str, &ActionSpec> =
        actions.iter().map(|a| (a.id.as_str(), a)).collect();

    fn visit<'a>(
        id: &'a str,
        by_id: &HashMap<&'a str, &'a ActionSpec>,
        visiting: &mut HashSet<&'a str>,
        done: &mut HashSet<&'a str>,
    ) -> Result<(), String> {
        if done.contains(id) {
            return Ok(());
        }
        if !visiting.insert(id) {
            return Err(format!("dependency cycle through action `{id}`"));
        }
        if let Some(action) = by_id.get(id) {
            for dep in &action.depends_on {
                if by_id.contains_key(dep.as_str()) {
                    visit(dep, by_id, visiting, done)?;
                }
            }
        }
        visiting.remove(id);
        done.insert(id);
        Ok(())
    }

    let mut visiting = HashSet::new();
    let mut done = HashSet::new();
    for action in actions {
        visit(action.id.as_str(), &by_id, &mut visiting, &mut done)?;
    }
    Ok(())
}

/// Topological order over a batch's actions, dependencies first. Input must
/// already be cycle-free (validated at plan time).
pub fn topological_order(actions: &[ActionSpec]) -> Vec<ActionSpec> {
    let by_id: HashMap<&str, &ActionSpec> =
        actions.iter().map(|a| (a.id.as_str(), a)).collect();
    let mut ordered = Vec::new();
    let mut done: HashSet<&str> = HashSet::new();

    fn visit<'a>(
        action: &'a ActionSpec,
        by_id: &HashMap<&'a str, &'a ActionSpec>,
        done: &mut HashSet<&'a str>,
        ordered: &mut Vec<ActionSpec>,
    ) {
        if done.contains(action.id.as_str()) {
            return;
        }
        done.insert(action.id.as_str());
        for dep in &action.depends_on {
            if let Some(dep_action) = by_id.get(dep.as_str()) {
                visit(dep_action, by_id, done, ordered);
            }
        }
        ordered.push(action.clone());
    }

    for action in actions {
        visit(action, &by_id, &mut done, &mut ordered);
    }
    ordered
}
