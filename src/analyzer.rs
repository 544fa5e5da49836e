use crate::gateway::{CompletionRequest, GatewayError, LlmGateway};
use crate::models::{AnalysisResult, Grade};
use crate::pool::{CancelFlag, TaskOutcome, TaskPool};
use crate::prompts;
use std::sync::{Arc, Mutex};
use tracing::debug;

/// Failure modes of a single case analysis.
#[derive(Debug, thiserror::Error)]
pub enum AnalysisError {
    #[error(transparent)]
    Gateway(#[from] GatewayError),
    #[error("Similarity computation failed: {0}")]
    Similarity(String),
    #[error("Could not parse grading response: {0}")]
    GradeParse(String),
    #[error("analysis cancelled")]
    Cancelled,
}

/// Cosine similarity between two embedding vectors, accumulated in f64.
/// A zero-magnitude vector yields 0.0 rather than NaN. The raw value is
/// reported unclamped.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f64 {
    let mut dot = 0.0f64;
    let mut norm_a = 0.0f64;
    let mut norm_b = 0.0f64;
    for (x, y) in a.iter().zip(b.iter()) {
        dot += f64::from(*x) * f64::from(*y);
        norm_a += f64::from(*x) * f64::from(*x);
        norm_b += f64::from(*y) * f64::from(*y);
    }
    if norm_a == 0.0 || norm_b == 0.0 {
        return 0.0;
    }
    dot / (norm_a.sqrt() * norm_b.sqrt())
}

/// Split a grading response into (grade text, feedback).
///
/// Structured form first: a JSON object with a `grade` key, string or
/// number. Otherwise line form: the first line carries the grade behind
/// an optional `Grade:` prefix and the remainder is feedback.
fn parse_grading_response(raw: &str) -> Result<(String, String), AnalysisError> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return Err(AnalysisError::GradeParse(
            "empty grading response".to_string(),
        ));
    }

    if let Ok(serde_json::Value::Object(obj)) = serde_json::from_str(trimmed) {
        let grade = match obj.get("grade") {
            Some(serde_json::Value::String(s)) => Some(s.clone()),
            Some(serde_json::Value::Number(n)) => Some(n.to_string()),
            _ => None,
        };
        if let Some(grade) = grade {
            let feedback = obj
                .get("feedback")
                .and_then(|v| v.as_str())
                .unwrap_or("No feedback provided")
                .to_string();
            return Ok((grade, feedback));
        }
    }

    let mut lines = trimmed.lines();
    let first = lines.next().unwrap_or_default();
    let grade = first
        .strip_prefix("Grade:")
        .unwrap_or(first)
        .trim()
        .to_string();
    if grade.is_empty() {
        return Err(AnalysisError::GradeParse(format!(
            "no grade on first line: {first:?}"
        )));
    }
    let feedback = lines.collect::<Vec<_>>().join("\n").trim().to_string();
    Ok((grade, feedback))
}

fn key_changes() -> Vec<String> {
    vec![
        "Using overall semantic similarity for comparison".to_string(),
        "Similarity score represents whole text comparison".to_string(),
        "Grade scale: much worse (-2), worse (-1), same (0), better (+1), much better (+2)"
            .to_string(),
    ]
}

/// Analysis chain for one test case: two embedding calls in parallel,
/// cosine similarity, then a comparative grading call. A result exists
/// only once every stage has succeeded.
pub struct CaseAnalyzer {
    gateway: Arc<dyn LlmGateway>,
    pool: Arc<TaskPool>,
    cancel: CancelFlag,
    children: Mutex<Vec<CancelFlag>>,
}

impl CaseAnalyzer {
    pub fn new(gateway: Arc<dyn LlmGateway>, pool: Arc<TaskPool>) -> Self {
        Self {
            gateway,
            pool,
            cancel: CancelFlag::new(),
            children: Mutex::new(Vec::new()),
        }
    }

    /// Raise the cancel flags for this analysis and every call it has
    /// submitted so far. Idempotent.
    pub fn cancel(&self) {
        self.cancel.cancel();
        if let Ok(children) = self.children.lock() {
            for child in children.iter() {
                child.cancel();
            }
        }
    }

    fn track(&self, flag: CancelFlag) {
        if let Ok(mut children) = self.children.lock() {
            children.push(flag);
        }
    }

    pub async fn analyze(
        &self,
        input_text: &str,
        baseline_output: &str,
        current_output: &str,
        embed_model: &str,
        grading_model: &str,
    ) -> Result<AnalysisResult, AnalysisError> {
        if self.cancel.is_cancelled() {
            return Err(AnalysisError::Cancelled);
        }

        debug!(embed_model, "submitting embedding pair");
        let baseline_handle = {
            let gateway = Arc::clone(&self.gateway);
            let model = embed_model.to_string();
            let text = baseline_output.to_string();
            self.pool
                .submit(async move { gateway.embed(&model, &text).await })
        };
        let current_handle = {
            let gateway = Arc::clone(&self.gateway);
            let model = embed_model.to_string();
            let text = current_output.to_string();
            self.pool
                .submit(async move { gateway.embed(&model, &text).await })
        };

        let baseline_flag = baseline_handle.cancel_flag();
        let current_flag = current_handle.cancel_flag();
        self.track(baseline_flag.clone());
        self.track(current_flag.clone());

        // The two embedding calls settle in either order. The first failure
        // cancels the sibling so it cannot waste a worker slot.
        let mut baseline_vec: Option<Vec<f32>> = None;
        let mut current_vec: Option<Vec<f32>> = None;
        let mut first_error: Option<AnalysisError> = None;
        {
            let mut baseline_join = std::pin::pin!(baseline_handle.join());
            let mut current_join = std::pin::pin!(current_handle.join());
            while first_error.is_none() && (baseline_vec.is_none() || current_vec.is_none()) {
                tokio::select! {
                    outcome = &mut baseline_join, if baseline_vec.is_none() => {
                        match Self::settle_embedding(outcome) {
                            Ok(vec) => baseline_vec = Some(vec),
                            Err(e) => first_error = Some(e),
                        }
                    }
                    outcome = &mut current_join, if current_vec.is_none() => {
                        match Self::settle_embedding(outcome) {
                            Ok(vec) => current_vec = Some(vec),
                            Err(e) => first_error = Some(e),
                        }
                    }
                }
            }
        }
        if let Some(e) = first_error {
            baseline_flag.cancel();
            current_flag.cancel();
            return Err(e);
        }
        let (baseline_vec, current_vec) = match (baseline_vec, current_vec) {
            (Some(a), Some(b)) => (a, b),
            _ => return Err(AnalysisError::Cancelled),
        };

        if baseline_vec.len() != current_vec.len() {
            return Err(AnalysisError::Similarity(format!(
                "embedding length mismatch: {} vs {}",
                baseline_vec.len(),
                current_vec.len()
            )));
        }
        let similarity_score = cosine_similarity(&baseline_vec, &current_vec);

        if self.cancel.is_cancelled() {
            return Err(AnalysisError::Cancelled);
        }

        debug!(grading_model, "submitting grading call");
        let grading_handle = {
            let gateway = Arc::clone(&self.gateway);
            let model = grading_model.to_string();
            let instructions =
                prompts::grader_instructions(input_text, baseline_output, current_output);
            self.pool.submit(async move {
                let req = CompletionRequest {
                    model: &model,
                    user_prompt: &instructions,
                    system_prompt: Some(prompts::grader_system_prompt()),
                    params: None,
                };
                gateway.complete(req).await
            })
        };
        self.track(grading_handle.cancel_flag());

        let raw = match grading_handle.join().await {
            TaskOutcome::Completed(text) => text,
            TaskOutcome::Failed(e) => return Err(e.into()),
            TaskOutcome::Cancelled => return Err(AnalysisError::Cancelled),
        };

        let (grade_text, feedback) = parse_grading_response(&raw)?;
        let llm_grade = Grade::parse(&grade_text);

        Ok(AnalysisResult {
            input_text: input_text.to_string(),
            baseline_output: baseline_output.to_string(),
            current_output: current_output.to_string(),
            similarity_score,
            llm_grade,
            llm_feedback: feedback,
            key_changes: key_changes(),
        })
    }

    fn settle_embedding(outcome: TaskOutcome<Vec<f32>>) -> Result<Vec<f32>, AnalysisError> {
        match outcome {
            TaskOutcome::Completed(vec) if vec.is_empty() => Err(AnalysisError::Similarity(
                "embedding vector was empty".to_string(),
            )),
            TaskOutcome::Completed(vec) => Ok(vec),
            TaskOutcome::Failed(GatewayError::MalformedResponse(message)) => {
                Err(AnalysisError::Similarity(message))
            }
            TaskOutcome::Failed(e) => Err(e.into()),
            TaskOutcome::Cancelled => Err(AnalysisError::Cancelled),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::collections::HashMap;

    struct StubGateway {
        embeddings: HashMap<String, Vec<f32>>,
        grading_response: Option<String>,
    }

    impl StubGateway {
        fn new(grading_response: &str) -> Self {
            Self {
                embeddings: HashMap::new(),
                grading_response: Some(grading_response.to_string()),
            }
        }

        fn with_embedding(mut self, text: &str, vector: Vec<f32>) -> Self {
            self.embeddings.insert(text.to_string(), vector);
            self
        }
    }

    #[async_trait]
    impl LlmGateway for StubGateway {
        async fn complete(&self, _req: CompletionRequest<'_>) -> Result<String, GatewayError> {
            self.grading_response
                .clone()
                .ok_or_else(|| GatewayError::Other("grading unavailable".to_string()))
        }

        async fn embed(&self, _model: &str, text: &str) -> Result<Vec<f32>, GatewayError> {
            self.embeddings
                .get(text)
                .cloned()
                .ok_or(GatewayError::ConnectionFailure)
        }

        async fn list_models(&self) -> Vec<String> {
            Vec::new()
        }
    }

    fn analyzer(gateway: StubGateway) -> CaseAnalyzer {
        CaseAnalyzer::new(Arc::new(gateway), Arc::new(TaskPool::new(3)))
    }

    #[test]
    fn test_cosine_similarity_identical() {
        let v = vec![0.5, 0.5, 0.5];
        assert!((cosine_similarity(&v, &v) - 1.0).abs() < 1e-9);
    }

    #[test]
    fn test_cosine_similarity_orthogonal() {
        assert_eq!(cosine_similarity(&[1.0, 0.0], &[0.0, 1.0]), 0.0);
    }

    #[test]
    fn test_cosine_similarity_opposite() {
        let score = cosine_similarity(&[1.0, 0.0], &[-1.0, 0.0]);
        assert!((score + 1.0).abs() < 1e-9);
    }

    #[test]
    fn test_cosine_similarity_zero_vector() {
        assert_eq!(cosine_similarity(&[0.0, 0.0], &[1.0, 1.0]), 0.0);
    }

    #[test]
    fn test_cosine_similarity_scale_invariant() {
        let a = vec![1.0, 2.0, 3.0];
        let b: Vec<f32> = a.iter().map(|x| x * 10.0).collect();
        assert!((cosine_similarity(&a, &b) - 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_parse_grading_structured() {
        let raw = r#"{"grade": "+1", "feedback": "Slightly clearer."}"#;
        let (grade, feedback) = parse_grading_response(raw).unwrap();
        assert_eq!(grade, "+1");
        assert_eq!(feedback, "Slightly clearer.");
    }

    #[test]
    fn test_parse_grading_structured_numeric_grade() {
        let raw = r#"{"grade": -2}"#;
        let (grade, feedback) = parse_grading_response(raw).unwrap();
        assert_eq!(grade, "-2");
        assert_eq!(feedback, "No feedback provided");
    }

    #[test]
    fn test_parse_grading_line_format() {
        let raw = "Grade: 0\nBoth answers say the same thing.\nNo factual drift.";
        let (grade, feedback) = parse_grading_response(raw).unwrap();
        assert_eq!(grade, "0");
        assert_eq!(
            feedback,
            "Both answers say the same thing.\nNo factual drift."
        );
    }

    #[test]
    fn test_parse_grading_line_without_prefix() {
        let (grade, feedback) = parse_grading_response("+2\nMuch better phrasing.").unwrap();
        assert_eq!(grade, "+2");
        assert_eq!(feedback, "Much better phrasing.");
    }

    #[test]
    fn test_parse_grading_empty_fails() {
        assert!(matches!(
            parse_grading_response("   \n  "),
            Err(AnalysisError::GradeParse(_))
        ));
    }

    #[test]
    fn test_parse_grading_json_without_grade_key_uses_line_form() {
        let raw = r#"{"feedback": "missing grade"}"#;
        let (grade, _) = parse_grading_response(raw).unwrap();
        assert_eq!(grade, r#"{"feedback": "missing grade"}"#);
    }

    #[tokio::test]
    async fn test_analyze_success() {
        let gateway = StubGateway::new("Grade: 0\nEquivalent answers.")
            .with_embedding("four", vec![1.0, 0.0])
            .with_embedding("4", vec![1.0, 0.0]);
        let analyzer = analyzer(gateway);

        let result = analyzer
            .analyze("What is 2+2?", "four", "4", "3-large", "gpt-4o")
            .await
            .unwrap();

        assert!((result.similarity_score - 1.0).abs() < 1e-9);
        assert_eq!(result.llm_grade, Grade::Same);
        assert_eq!(result.llm_feedback, "Equivalent answers.");
        assert_eq!(result.input_text, "What is 2+2?");
        assert_eq!(result.key_changes.len(), 3);
    }

    #[tokio::test]
    async fn test_analyze_embedding_failure() {
        // Only the baseline text has an embedding; the candidate call fails.
        let gateway =
            StubGateway::new("Grade: 0\nok").with_embedding("four", vec![1.0, 0.0]);
        let analyzer = analyzer(gateway);

        let err = analyzer
            .analyze("q", "four", "4", "3-large", "gpt-4o")
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            AnalysisError::Gateway(GatewayError::ConnectionFailure)
        ));
    }

    #[tokio::test]
    async fn test_analyze_length_mismatch() {
        let gateway = StubGateway::new("Grade: 0\nok")
            .with_embedding("a", vec![1.0, 0.0, 0.0])
            .with_embedding("b", vec![1.0, 0.0]);
        let analyzer = analyzer(gateway);

        let err = analyzer
            .analyze("q", "a", "b", "3-large", "gpt-4o")
            .await
            .unwrap_err();
        assert!(matches!(err, AnalysisError::Similarity(_)));
    }

    #[tokio::test]
    async fn test_analyze_grading_failure_yields_no_result() {
        let mut gateway = StubGateway::new("unused")
            .with_embedding("a", vec![1.0, 0.0])
            .with_embedding("b", vec![0.0, 1.0]);
        gateway.grading_response = None;
        let analyzer = analyzer(gateway);

        let err = analyzer
            .analyze("q", "a", "b", "3-large", "gpt-4o")
            .await
            .unwrap_err();
        assert!(matches!(err, AnalysisError::Gateway(GatewayError::Other(_))));
    }

    #[tokio::test]
    async fn test_analyze_after_cancel() {
        let gateway = StubGateway::new("Grade: 0\nok")
            .with_embedding("a", vec![1.0])
            .with_embedding("b", vec![1.0]);
        let analyzer = analyzer(gateway);

        analyzer.cancel();
        analyzer.cancel();

        let err = analyzer
            .analyze("q", "a", "b", "3-large", "gpt-4o")
            .await
            .unwrap_err();
        assert!(matches!(err, AnalysisError::Cancelled));
    }
}
