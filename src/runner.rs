use crate::analyzer::{AnalysisError, CaseAnalyzer};
use crate::gateway::{CompletionRequest, LlmGateway, ModelParams};
use crate::models::{AnalysisResult, TestSet};
use crate::pool::{CancelFlag, TaskOutcome, TaskPool};
use anyhow::{Result, bail};
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;
use tracing::{info, warn};

/// Notifications emitted while an evaluation run progresses.
#[derive(Debug)]
pub enum EvalEvent {
    /// A case has settled (successfully or not).
    Progress { completed: usize, total: usize },
    /// A case finished with a full analysis result.
    Row(AnalysisResult),
    /// A case failed; the queue continues with the next one.
    CaseFailed { title: String, message: String },
    /// The whole queue was processed.
    Finished,
    /// The run stopped early at a cancellation checkpoint.
    Cancelled,
}

/// Cloneable handle that cancels a running evaluation from outside.
///
/// Raising it marks the run itself plus whichever generation call or case
/// analysis is currently in flight. Idempotent.
#[derive(Clone)]
pub struct CancelHandle {
    flag: CancelFlag,
    generation: Arc<Mutex<Option<CancelFlag>>>,
    analyzer: Arc<Mutex<Option<Arc<CaseAnalyzer>>>>,
}

impl CancelHandle {
    fn new() -> Self {
        Self {
            flag: CancelFlag::new(),
            generation: Arc::new(Mutex::new(None)),
            analyzer: Arc::new(Mutex::new(None)),
        }
    }

    pub fn cancel(&self) {
        self.flag.cancel();
        if let Ok(slot) = self.generation.lock() {
            if let Some(flag) = slot.as_ref() {
                flag.cancel();
            }
        }
        if let Ok(slot) = self.analyzer.lock() {
            if let Some(analyzer) = slot.as_ref() {
                analyzer.cancel();
            }
        }
    }

    fn is_cancelled(&self) -> bool {
        self.flag.is_cancelled()
    }

    fn set_generation(&self, flag: Option<CancelFlag>) {
        if let Ok(mut slot) = self.generation.lock() {
            *slot = flag;
        }
    }

    fn set_analyzer(&self, analyzer: Option<Arc<CaseAnalyzer>>) {
        if let Ok(mut slot) = self.analyzer.lock() {
            *slot = analyzer;
        }
    }
}

/// Drives a test set through the evaluation pipeline case by case.
///
/// Cases run strictly in order; within a case, only the two embedding
/// calls overlap. Results accumulate in queue order and a failed case
/// never leaves a partial row behind.
pub struct EvaluationRunner {
    gateway: Arc<dyn LlmGateway>,
    pool: Arc<TaskPool>,
    embed_model: String,
    grading_model: String,
    params: ModelParams,
    results: Vec<AnalysisResult>,
    handle: CancelHandle,
}

impl EvaluationRunner {
    pub fn new(
        gateway: Arc<dyn LlmGateway>,
        pool: Arc<TaskPool>,
        embed_model: impl Into<String>,
        grading_model: impl Into<String>,
        params: ModelParams,
    ) -> Self {
        Self {
            gateway,
            pool,
            embed_model: embed_model.into(),
            grading_model: grading_model.into(),
            params,
            results: Vec::new(),
            handle: CancelHandle::new(),
        }
    }

    pub fn cancel_handle(&self) -> CancelHandle {
        self.handle.clone()
    }

    pub fn results(&self) -> &[AnalysisResult] {
        &self.results
    }

    pub fn clear_history(&mut self) {
        self.results.clear();
    }

    /// Run every case in the test set against the candidate configuration,
    /// emitting events as the queue advances.
    pub async fn run_evaluation(
        &mut self,
        test_set: &TestSet,
        system_prompt: &str,
        model_id: &str,
        events: &mpsc::UnboundedSender<EvalEvent>,
    ) -> Result<()> {
        if test_set.cases.is_empty() {
            bail!("test set '{}' has no cases", test_set.name);
        }

        self.handle.flag.reset();
        self.handle.set_generation(None);
        self.handle.set_analyzer(None);
        self.results.clear();

        let total = test_set.cases.len();
        info!(
            test_set = test_set.name.as_str(),
            total,
            model = model_id,
            "starting evaluation run"
        );

        let mut cancelled = false;
        for (index, case) in test_set.cases.iter().enumerate() {
            if self.handle.is_cancelled() {
                cancelled = true;
                break;
            }

            let title = if case.id.is_empty() {
                format!("Case {}", index + 1)
            } else {
                case.id.clone()
            };

            let Some(baseline_output) = case.baseline_output.as_deref() else {
                warn!(case = title.as_str(), "skipping case without a baseline output");
                let _ = events.send(EvalEvent::CaseFailed {
                    title,
                    message: "case has no baseline output".to_string(),
                });
                let _ = events.send(EvalEvent::Progress {
                    completed: index + 1,
                    total,
                });
                continue;
            };

            // Stage 1: candidate output from the configuration under test.
            let generation = {
                let gateway = Arc::clone(&self.gateway);
                let model = model_id.to_string();
                let prompt = case.input_text.clone();
                let system = system_prompt.to_string();
                let params = self.params.clone();
                self.pool.submit(async move {
                    let req = CompletionRequest {
                        model: &model,
                        user_prompt: &prompt,
                        system_prompt: (!system.is_empty()).then_some(system.as_str()),
                        params: Some(&params),
                    };
                    gateway.complete(req).await
                })
            };
            self.handle.set_generation(Some(generation.cancel_flag()));
            let outcome = generation.join().await;
            self.handle.set_generation(None);

            let current_output = match outcome {
                TaskOutcome::Completed(text) => text,
                TaskOutcome::Failed(e) => {
                    warn!(case = title.as_str(), "generation failed: {e}");
                    let _ = events.send(EvalEvent::CaseFailed {
                        title,
                        message: e.to_string(),
                    });
                    let _ = events.send(EvalEvent::Progress {
                        completed: index + 1,
                        total,
                    });
                    continue;
                }
                TaskOutcome::Cancelled => {
                    cancelled = true;
                    break;
                }
            };

            // Stage 2: embeddings, similarity and grade.
            let analyzer = Arc::new(CaseAnalyzer::new(
                Arc::clone(&self.gateway),
                Arc::clone(&self.pool),
            ));
            self.handle.set_analyzer(Some(Arc::clone(&analyzer)));
            let analysis = analyzer
                .analyze(
                    &case.input_text,
                    baseline_output,
                    &current_output,
                    &self.embed_model,
                    &self.grading_model,
                )
                .await;
            self.handle.set_analyzer(None);

            match analysis {
                Ok(result) => {
                    self.results.push(result.clone());
                    let _ = events.send(EvalEvent::Row(result));
                }
                Err(AnalysisError::Cancelled) => {
                    cancelled = true;
                    break;
                }
                Err(e) => {
                    warn!(case = title.as_str(), "analysis failed: {e}");
                    let _ = events.send(EvalEvent::CaseFailed {
                        title,
                        message: e.to_string(),
                    });
                }
            }
            let _ = events.send(EvalEvent::Progress {
                completed: index + 1,
                total,
            });
        }

        if cancelled {
            info!("evaluation run cancelled");
            let _ = events.send(EvalEvent::Cancelled);
        } else {
            info!(results = self.results.len(), "evaluation run finished");
            let _ = events.send(EvalEvent::Finished);
        }
        Ok(())
    }

    /// Human-readable analysis summary for a stored result.
    pub fn analysis_text(&self, index: usize) -> String {
        let Some(result) = self.results.get(index) else {
            return "No analysis available".to_string();
        };
        let key_changes = result
            .key_changes
            .iter()
            .map(|change| format!("- {change}"))
            .collect::<Vec<_>>()
            .join("\n");
        format!(
            "Similarity Score: {:.2}\nLLM Grade: {}\n\nLLM Feedback:\n{}\n\nKey Changes:\n{}",
            result.similarity_score, result.llm_grade, result.llm_feedback, key_changes
        )
    }

    /// Grade-and-feedback block for a stored result.
    pub fn feedback_text(&self, index: usize) -> String {
        let Some(result) = self.results.get(index) else {
            return "No feedback available".to_string();
        };
        format!("Grade: {}\n---\n{}", result.llm_grade, result.llm_feedback)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gateway::GatewayError;
    use crate::models::{Grade, TestCase};
    use async_trait::async_trait;
    use std::collections::{HashMap, VecDeque};
    use tokio::sync::Semaphore;

    /// Scripted gateway: completions pop in submission order (None plays a
    /// failure), embeddings look up by text, every call is logged.
    struct MockGateway {
        completions: Mutex<VecDeque<Option<String>>>,
        embeddings: HashMap<String, Vec<f32>>,
        calls: Mutex<Vec<String>>,
        gate: Option<Arc<Semaphore>>,
    }

    impl MockGateway {
        fn new(completions: Vec<Option<&str>>) -> Self {
            Self {
                completions: Mutex::new(
                    completions
                        .into_iter()
                        .map(|c| c.map(str::to_string))
                        .collect(),
                ),
                embeddings: HashMap::new(),
                calls: Mutex::new(Vec::new()),
                gate: None,
            }
        }

        fn with_embedding(mut self, text: &str, vector: Vec<f32>) -> Self {
            self.embeddings.insert(text.to_string(), vector);
            self
        }

        fn with_gate(mut self, gate: Arc<Semaphore>) -> Self {
            self.gate = Some(gate);
            self
        }

        fn calls(&self) -> Vec<String> {
            self.calls.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl LlmGateway for MockGateway {
        async fn complete(&self, _req: CompletionRequest<'_>) -> Result<String, GatewayError> {
            if let Some(gate) = &self.gate {
                let _permit = gate.acquire().await;
            }
            self.calls.lock().unwrap().push("complete".to_string());
            let next = self.completions.lock().unwrap().pop_front();
            match next {
                Some(Some(text)) => Ok(text),
                Some(None) => Err(GatewayError::Other("scripted failure".to_string())),
                None => Err(GatewayError::Other("no scripted completion".to_string())),
            }
        }

        async fn embed(&self, _model: &str, text: &str) -> Result<Vec<f32>, GatewayError> {
            self.calls.lock().unwrap().push(format!("embed:{text}"));
            self.embeddings
                .get(text)
                .cloned()
                .ok_or(GatewayError::ConnectionFailure)
        }

        async fn list_models(&self) -> Vec<String> {
            Vec::new()
        }
    }

    fn test_set(cases: Vec<TestCase>) -> TestSet {
        TestSet {
            name: "unit".to_string(),
            system_prompt: "Answer briefly.".to_string(),
            baseline_model: Some("gpt-4o".to_string()),
            cases,
        }
    }

    fn case(id: &str, input: &str, baseline: Option<&str>) -> TestCase {
        TestCase {
            id: id.to_string(),
            input_text: input.to_string(),
            baseline_output: baseline.map(str::to_string),
            current_output: None,
        }
    }

    fn runner(gateway: MockGateway) -> EvaluationRunner {
        EvaluationRunner::new(
            Arc::new(gateway),
            Arc::new(TaskPool::new(3)),
            "3-large",
            "gpt-4o",
            ModelParams::default(),
        )
    }

    fn drain(rx: &mut mpsc::UnboundedReceiver<EvalEvent>) -> Vec<EvalEvent> {
        let mut events = Vec::new();
        while let Ok(event) = rx.try_recv() {
            events.push(event);
        }
        events
    }

    #[tokio::test]
    async fn test_run_evaluation_orders_results() {
        let gateway = MockGateway::new(vec![
            Some("c1"),
            Some("Grade: 0\nSame."),
            Some("c2"),
            Some("Grade: -2\nMuch worse."),
        ])
        .with_embedding("b1", vec![1.0, 0.0])
        .with_embedding("c1", vec![0.99, 0.141_067_36])
        .with_embedding("b2", vec![1.0, 0.0])
        .with_embedding("c2", vec![0.40, 0.916_515_1]);

        let mut runner = runner(gateway);
        let set = test_set(vec![
            case("first", "q1", Some("b1")),
            case("second", "q2", Some("b2")),
        ]);
        let (tx, mut rx) = mpsc::unbounded_channel();

        runner
            .run_evaluation(&set, "sys", "gpt-4o-mini", &tx)
            .await
            .unwrap();

        let results = runner.results();
        assert_eq!(results.len(), 2);
        assert_eq!(results[0].input_text, "q1");
        assert_eq!(results[0].llm_grade, Grade::Same);
        assert!((results[0].similarity_score - 0.99).abs() < 1e-6);
        assert_eq!(results[1].input_text, "q2");
        assert_eq!(results[1].llm_grade, Grade::MuchWorse);
        assert!((results[1].similarity_score - 0.40).abs() < 1e-6);

        let aggregate: i64 = results.iter().filter_map(|r| r.llm_grade.numeric()).sum();
        assert_eq!(aggregate, -2);

        let events = drain(&mut rx);
        assert_eq!(events.len(), 5);
        assert!(matches!(events[0], EvalEvent::Row(_)));
        assert!(matches!(events[1], EvalEvent::Progress { completed: 1, total: 2 }));
        assert!(matches!(events[2], EvalEvent::Row(_)));
        assert!(matches!(events[3], EvalEvent::Progress { completed: 2, total: 2 }));
        assert!(matches!(events[4], EvalEvent::Finished));
    }

    #[tokio::test]
    async fn test_cases_run_sequentially() {
        let gateway = MockGateway::new(vec![
            Some("c1"),
            Some("Grade: 0\nok"),
            Some("c2"),
            Some("Grade: 0\nok"),
        ])
        .with_embedding("b1", vec![1.0])
        .with_embedding("c1", vec![1.0])
        .with_embedding("b2", vec![1.0])
        .with_embedding("c2", vec![1.0]);
        let gateway = Arc::new(gateway);

        let mut runner = EvaluationRunner::new(
            Arc::clone(&gateway) as Arc<dyn LlmGateway>,
            Arc::new(TaskPool::new(3)),
            "3-large",
            "gpt-4o",
            ModelParams::default(),
        );
        let set = test_set(vec![
            case("a", "q1", Some("b1")),
            case("b", "q2", Some("b2")),
        ]);
        let (tx, _rx) = mpsc::unbounded_channel();
        runner.run_evaluation(&set, "", "m", &tx).await.unwrap();

        let calls = gateway.calls();
        assert_eq!(calls.len(), 8);
        // Case layout: generation, embedding pair (either order), grading.
        assert_eq!(calls[0], "complete");
        assert_eq!(calls[3], "complete");
        assert_eq!(calls[4], "complete");
        assert_eq!(calls[7], "complete");
        let mut pair1 = vec![calls[1].clone(), calls[2].clone()];
        pair1.sort();
        assert_eq!(pair1, vec!["embed:b1", "embed:c1"]);
        let mut pair2 = vec![calls[5].clone(), calls[6].clone()];
        pair2.sort();
        assert_eq!(pair2, vec!["embed:b2", "embed:c2"]);
    }

    #[tokio::test]
    async fn test_failed_case_leaves_no_partial_result() {
        // Grading for the only case fails after both embeddings succeed.
        let gateway = MockGateway::new(vec![Some("c1"), None])
            .with_embedding("b1", vec![1.0])
            .with_embedding("c1", vec![1.0]);

        let mut runner = runner(gateway);
        let set = test_set(vec![case("only", "q1", Some("b1"))]);
        let (tx, mut rx) = mpsc::unbounded_channel();

        runner.run_evaluation(&set, "", "m", &tx).await.unwrap();

        assert!(runner.results().is_empty());
        let events = drain(&mut rx);
        assert!(events.iter().any(|e| matches!(
            e,
            EvalEvent::CaseFailed { title, .. } if title == "only"
        )));
        assert!(matches!(events.last(), Some(EvalEvent::Finished)));
    }

    #[tokio::test]
    async fn test_case_without_baseline_is_reported() {
        let gateway = MockGateway::new(vec![]);
        let mut runner = runner(gateway);
        let set = test_set(vec![case("", "q1", None)]);
        let (tx, mut rx) = mpsc::unbounded_channel();

        runner.run_evaluation(&set, "", "m", &tx).await.unwrap();

        let events = drain(&mut rx);
        assert!(events.iter().any(|e| matches!(
            e,
            EvalEvent::CaseFailed { title, .. } if title == "Case 1"
        )));
    }

    #[tokio::test]
    async fn test_empty_test_set_fails_fast() {
        let gateway = MockGateway::new(vec![]);
        let mut runner = runner(gateway);
        let set = test_set(vec![]);
        let (tx, mut rx) = mpsc::unbounded_channel();

        let result = runner.run_evaluation(&set, "", "m", &tx).await;
        assert!(result.is_err());
        assert!(drain(&mut rx).is_empty());
    }

    #[tokio::test]
    async fn test_rerun_replaces_history() {
        let gateway = MockGateway::new(vec![
            Some("c1"),
            Some("Grade: 0\nfirst run"),
            Some("c1"),
            Some("Grade: +1\nsecond run"),
        ])
        .with_embedding("b1", vec![1.0])
        .with_embedding("c1", vec![1.0]);

        let mut runner = runner(gateway);
        let set = test_set(vec![case("a", "q1", Some("b1"))]);
        let (tx, _rx) = mpsc::unbounded_channel();

        runner.run_evaluation(&set, "", "m", &tx).await.unwrap();
        runner.run_evaluation(&set, "", "m", &tx).await.unwrap();

        assert_eq!(runner.results().len(), 1);
        assert_eq!(runner.results()[0].llm_grade, Grade::Better);
    }

    #[tokio::test]
    async fn test_cancel_stops_run_without_results() {
        let gate = Arc::new(Semaphore::new(0));
        let gateway = MockGateway::new(vec![Some("c1"), Some("Grade: 0\nok")])
            .with_embedding("b1", vec![1.0])
            .with_embedding("c1", vec![1.0])
            .with_gate(Arc::clone(&gate));

        let mut runner = runner(gateway);
        let handle = runner.cancel_handle();
        let set = test_set(vec![case("a", "q1", Some("b1"))]);
        let (tx, mut rx) = mpsc::unbounded_channel();

        let run = tokio::spawn(async move {
            runner.run_evaluation(&set, "", "m", &tx).await.unwrap();
            runner
        });

        // Let the generation call block on the gate, then cancel twice.
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        handle.cancel();
        handle.cancel();
        gate.add_permits(4);

        let runner = run.await.unwrap();
        assert!(runner.results().is_empty());
        let events = drain(&mut rx);
        assert!(matches!(events.last(), Some(EvalEvent::Cancelled)));
    }

    #[tokio::test]
    async fn test_text_accessors() {
        let gateway = MockGateway::new(vec![Some("c1"), Some("Grade: +2\nGreat improvement.")])
            .with_embedding("b1", vec![1.0])
            .with_embedding("c1", vec![1.0]);

        let mut runner = runner(gateway);
        let set = test_set(vec![case("a", "q1", Some("b1"))]);
        let (tx, _rx) = mpsc::unbounded_channel();
        runner.run_evaluation(&set, "", "m", &tx).await.unwrap();

        let analysis = runner.analysis_text(0);
        assert!(analysis.starts_with("Similarity Score: 1.00"));
        assert!(analysis.contains("LLM Grade: much better"));
        assert!(analysis.contains("LLM Feedback:\nGreat improvement."));
        assert!(analysis.contains("Key Changes:\n- "));

        let feedback = runner.feedback_text(0);
        assert_eq!(feedback, "Grade: much better\n---\nGreat improvement.");

        assert_eq!(runner.analysis_text(5), "No analysis available");
        assert_eq!(runner.feedback_text(5), "No feedback available");

        runner.clear_history();
        assert!(runner.results().is_empty());
        assert_eq!(runner.analysis_text(0), "No analysis available");
    }
}
