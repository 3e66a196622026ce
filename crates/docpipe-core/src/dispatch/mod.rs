//! Multi-provider dispatch: fan-out, timeouts, and selection.
//!
//! Drives provider calls for each pipeline stage. A stage either runs
//! on a single provider or fans out across all eligible providers in
//! parallel, with a per-call deadline and a selection strategy over
//! the results:
//!
//! - classification picks the highest-confidence success;
//! - extraction races to the first sane result;
//! - validation runs weighted voting across verdicts;
//! - correction always runs on one provider.
//!
//! PDFs route only to PDF-capable providers; when that leaves a single
//! provider, fan-out silently degrades to a single call.

pub mod strategy;

use std::sync::Arc;
use std::time::Duration;

use serde_json::{Map, Value};
use tokio::task::JoinSet;

use crate::config::Config;
use crate::document::DocumentType;
use crate::error::LlmError;
use crate::llm::factory::ProviderRegistry;
use crate::llm::{CallMeta, Classification, Correction, DocumentPayload, Extraction, LlmValidation, TokenUsage, VisionProvider};
use crate::rules::ValidationIssue;
use self::strategy::{pick_highest_confidence, weighted_voting, WeightedVote};

/// Files larger than this are worth a second opinion.
const LARGE_FILE_THRESHOLD: u64 = 2 * 1024 * 1024;

/// Ceiling for the confidence of an extraction with zero fields.
const EMPTY_EXTRACTION_CONFIDENCE: f64 = 0.05;

/// Dispatch policy knobs.
#[derive(Debug, Clone)]
pub struct DispatchPolicy {
    /// Per-provider call deadline.
    pub call_timeout: Duration,
    /// Fail the stage when any provider errors, instead of settling
    /// for at least one success.
    pub require_all: bool,
    /// Master switch for multi-provider fan-out.
    pub multi_provider: bool,
    /// Weighted-voting weight of the primary provider.
    pub primary_weight: f64,
    /// Weighted-voting weight of every other provider.
    pub secondary_weight: f64,
}

impl Default for DispatchPolicy {
    fn default() -> Self {
        Self {
            call_timeout: Duration::from_secs(30),
            require_all: false,
            multi_provider: true,
            primary_weight: 0.55,
            secondary_weight: 0.45,
        }
    }
}

impl DispatchPolicy {
    /// Build the policy from configuration.
    pub fn from_config(config: &Config) -> Self {
        Self {
            call_timeout: Duration::from_secs(config.llm.call_timeout_secs),
            require_all: false,
            multi_provider: config.llm.multi_provider,
            primary_weight: config.llm.primary_weight,
            secondary_weight: config.llm.secondary_weight,
        }
    }
}

/// Validation outcome after consensus, ready for the pipeline.
#[derive(Debug, Clone)]
pub struct ConsensusValidation {
    pub is_valid: bool,
    pub confidence: f64,
    pub issues: Vec<ValidationIssue>,
    /// 1.0 when providers agreed perfectly, 0.0 when they diverged.
    pub agreement: f64,
    /// Corrections volunteered by the validators, when any.
    pub corrected_data: Option<Map<String, Value>>,
    /// How many providers contributed a verdict.
    pub provider_count: usize,
    /// Merged call bookkeeping for the audit trail.
    pub meta: CallMeta,
}

/// Drives provider calls for the pipeline stages.
pub struct Dispatcher {
    registry: Arc<ProviderRegistry>,
    policy: DispatchPolicy,
}

impl Dispatcher {
    /// Create a dispatcher over a provider registry.
    pub fn new(registry: Arc<ProviderRegistry>, policy: DispatchPolicy) -> Self {
        Self { registry, policy }
    }

    /// The providers able to take this payload, primary first.
    ///
    /// PDFs route only to PDF-capable providers; an empty result is an
    /// error because the pipeline cannot proceed without one.
    fn eligible(&self, file: &DocumentPayload) -> Result<Vec<Arc<dyn VisionProvider>>, LlmError> {
        let providers = if file.is_pdf() {
            self.registry.pdf_capable()
        } else {
            self.registry.all()
        };
        if providers.is_empty() {
            return Err(LlmError::UnsupportedMedia {
                provider: self.registry.primary().name().to_string(),
                mime_type: file.mime_type().to_string(),
            });
        }
        Ok(providers)
    }

    /// Whether fan-out pays for itself on this document.
    ///
    /// Fan-out doubles token spend, so it is reserved for high-stakes
    /// document types and large files.
    pub fn should_fan_out(&self, doc_type: Option<DocumentType>, file: &DocumentPayload) -> bool {
        self.policy.multi_provider
            && self.registry.len() >= 2
            && (doc_type.is_some_and(|t| t.is_high_stakes())
                || file.len() as u64 > LARGE_FILE_THRESHOLD)
    }

    async fn with_deadline<T>(
        &self,
        fut: impl std::future::Future<Output = Result<T, LlmError>>,
    ) -> Result<T, LlmError> {
        match tokio::time::timeout(self.policy.call_timeout, fut).await {
            Ok(result) => result,
            Err(_) => Err(LlmError::Timeout {
                seconds: self.policy.call_timeout.as_secs(),
            }),
        }
    }

    /// Classify with highest-confidence selection across providers.
    pub async fn classify(&self, file: &DocumentPayload) -> Result<Classification, LlmError> {
        let providers = self.eligible(file)?;
        if providers.len() < 2 || !self.should_fan_out(None, file) {
            return self.with_deadline(providers[0].classify(file)).await;
        }

        let mut set = JoinSet::new();
        for provider in providers {
            let file = file.clone();
            let timeout = self.policy.call_timeout;
            set.spawn(async move {
                let name = provider.name().to_string();
                let result = match tokio::time::timeout(timeout, provider.classify(&file)).await {
                    Ok(result) => result,
                    Err(_) => Err(LlmError::Timeout {
                        seconds: timeout.as_secs(),
                    }),
                };
                (name, result)
            });
        }

        let mut successes = Vec::new();
        let mut last_error = None;
        while let Some(joined) = set.join_next().await {
            match joined {
                Ok((_, Ok(classification))) => successes.push(classification),
                Ok((name, Err(err))) => {
                    tracing::warn!(provider = %name, error = %err, "classification fan-out call failed");
                    if self.policy.require_all {
                        return Err(err);
                    }
                    last_error = Some(err);
                }
                Err(join_err) => {
                    tracing::error!(error = %join_err, "classification task panicked");
                }
            }
        }

        let candidates: Vec<(Classification, f64, u64)> = successes
            .into_iter()
            .map(|c| {
                let confidence = c.confidence;
                let elapsed = c.meta.elapsed_ms;
                (c, confidence, elapsed)
            })
            .collect();
        pick_highest_confidence(candidates)
            .ok_or_else(|| last_error.unwrap_or(LlmError::NotConfigured))
    }

    /// Extract with first-success racing and a zero-field sanity check.
    pub async fn extract(
        &self,
        file: &DocumentPayload,
        doc_type: DocumentType,
    ) -> Result<Extraction, LlmError> {
        let providers = self.eligible(file)?;
        if providers.len() < 2 || !self.should_fan_out(Some(doc_type), file) {
            let extraction = self.with_deadline(providers[0].extract(file, doc_type)).await?;
            return Ok(apply_extraction_sanity(extraction));
        }

        let mut set = JoinSet::new();
        for provider in providers {
            let file = file.clone();
            let timeout = self.policy.call_timeout;
            set.spawn(async move {
                let name = provider.name().to_string();
                let result =
                    match tokio::time::timeout(timeout, provider.extract(&file, doc_type)).await {
                        Ok(result) => result,
                        Err(_) => Err(LlmError::Timeout {
                            seconds: timeout.as_secs(),
                        }),
                    };
                (name, result)
            });
        }

        // Race to the first result that actually extracted something;
        // keep collecting otherwise so a degenerate winner can fall
        // back to a slower-but-useful competitor.
        let mut fallbacks = Vec::new();
        let mut last_error = None;
        while let Some(joined) = set.join_next().await {
            match joined {
                Ok((_, Ok(extraction))) => {
                    if !extraction.fields.is_empty() {
                        set.abort_all();
                        return Ok(extraction);
                    }
                    fallbacks.push(extraction);
                }
                Ok((name, Err(err))) => {
                    tracing::warn!(provider = %name, error = %err, "extraction fan-out call failed");
                    if self.policy.require_all {
                        return Err(err);
                    }
                    last_error = Some(err);
                }
                Err(join_err) => {
                    tracing::error!(error = %join_err, "extraction task panicked");
                }
            }
        }

        fallbacks
            .into_iter()
            .next()
            .map(apply_extraction_sanity)
            .ok_or_else(|| last_error.unwrap_or(LlmError::NotConfigured))
    }

    /// Validate with weighted voting across providers.
    pub async fn validate(
        &self,
        data: &Map<String, Value>,
        doc_type: DocumentType,
        file: Option<&DocumentPayload>,
        rules_summary: &str,
    ) -> Result<ConsensusValidation, LlmError> {
        let providers = match file {
            Some(f) => self.eligible(f)?,
            None => self.registry.all(),
        };
        let fan_out = providers.len() >= 2
            && file.map_or(self.policy.multi_provider && self.registry.len() >= 2, |f| {
                self.should_fan_out(Some(doc_type), f)
            });

        if !fan_out {
            let validation = self
                .with_deadline(providers[0].validate(data, doc_type, file, rules_summary))
                .await?;
            return Ok(single_consensus(validation));
        }

        let mut set = JoinSet::new();
        for provider in providers {
            let data = data.clone();
            let file = file.cloned();
            let rules_summary = rules_summary.to_string();
            let timeout = self.policy.call_timeout;
            set.spawn(async move {
                let name = provider.name().to_string();
                let result = match tokio::time::timeout(
                    timeout,
                    provider.validate(&data, doc_type, file.as_ref(), &rules_summary),
                )
                .await
                {
                    Ok(result) => result,
                    Err(_) => Err(LlmError::Timeout {
                        seconds: timeout.as_secs(),
                    }),
                };
                (name, result)
            });
        }

        let mut validations = Vec::new();
        let mut last_error = None;
        while let Some(joined) = set.join_next().await {
            match joined {
                Ok((_, Ok(validation))) => validations.push(validation),
                Ok((name, Err(err))) => {
                    tracing::warn!(provider = %name, error = %err, "validation fan-out call failed");
                    if self.policy.require_all {
                        return Err(err);
                    }
                    last_error = Some(err);
                }
                Err(join_err) => {
                    tracing::error!(error = %join_err, "validation task panicked");
                }
            }
        }

        if validations.is_empty() {
            return Err(last_error.unwrap_or(LlmError::NotConfigured));
        }

        let primary = self.registry.primary().name().to_string();
        let votes: Vec<WeightedVote> = validations
            .iter()
            .map(|v| WeightedVote {
                provider: v.meta.provider.clone(),
                is_valid: v.is_valid,
                confidence: v.confidence,
            })
            .collect();
        let outcome = weighted_voting(
            &votes,
            &primary,
            self.policy.primary_weight,
            self.policy.secondary_weight,
        )
        .expect("non-empty votes");

        tracing::debug!(
            providers = validations.len(),
            is_valid = outcome.is_valid,
            confidence = outcome.confidence,
            agreement = outcome.agreement,
            "weighted validation consensus",
        );

        // Prefer the primary's volunteered corrections; any provider's
        // beats none.
        let corrected_data = validations
            .iter()
            .find(|v| v.meta.provider == primary)
            .and_then(|v| v.corrected_data.clone())
            .or_else(|| validations.iter().find_map(|v| v.corrected_data.clone()));

        let issues =
            strategy::consensus_issues(validations.iter().map(|v| v.issues.clone()).collect());
        let provider_count = validations.len();
        let meta = merge_metas(validations.into_iter().map(|v| v.meta).collect());

        Ok(ConsensusValidation {
            is_valid: outcome.is_valid,
            confidence: outcome.confidence,
            issues,
            agreement: outcome.agreement,
            corrected_data,
            provider_count,
            meta,
        })
    }

    /// Single-provider validation, used for re-validation after a
    /// correction.
    pub async fn validate_single(
        &self,
        data: &Map<String, Value>,
        doc_type: DocumentType,
        file: Option<&DocumentPayload>,
        rules_summary: &str,
    ) -> Result<LlmValidation, LlmError> {
        let provider = match file {
            Some(f) => self.eligible(f)?[0].clone(),
            None => self.registry.primary(),
        };
        self.with_deadline(provider.validate(data, doc_type, file, rules_summary))
            .await
    }

    /// Correction always runs on a single provider.
    pub async fn correct(
        &self,
        data: &Map<String, Value>,
        issues: &[ValidationIssue],
        doc_type: DocumentType,
        file: Option<&DocumentPayload>,
    ) -> Result<Correction, LlmError> {
        let provider = match file {
            Some(f) => self.eligible(f)?[0].clone(),
            None => self.registry.primary(),
        };
        self.with_deadline(provider.correct(data, issues, doc_type, file))
            .await
    }
}

/// Clamp the confidence of an extraction that produced nothing.
fn apply_extraction_sanity(mut extraction: Extraction) -> Extraction {
    if extraction.fields.is_empty() && extraction.confidence > EMPTY_EXTRACTION_CONFIDENCE {
        tracing::warn!(
            provider = %extraction.meta.provider,
            reported = extraction.confidence,
            "extraction produced zero fields, clamping confidence",
        );
        extraction.confidence = EMPTY_EXTRACTION_CONFIDENCE;
    }
    extraction
}

/// Wrap a lone validation into the consensus shape.
fn single_consensus(validation: LlmValidation) -> ConsensusValidation {
    ConsensusValidation {
        is_valid: validation.is_valid,
        confidence: validation.confidence,
        issues: validation.issues,
        agreement: 1.0,
        corrected_data: validation.corrected_data,
        provider_count: 1,
        meta: validation.meta,
    }
}

/// Merge per-provider call bookkeeping into one audit row's worth.
///
/// Keeps the first (primary) provider's prompt and response, joins the
/// provider names, sums token usage, and reports the slowest wall time
/// since the calls ran in parallel.
fn merge_metas(metas: Vec<CallMeta>) -> CallMeta {
    let mut iter = metas.into_iter();
    let mut merged = iter.next().expect("at least one meta");
    let mut providers = vec![merged.provider.clone()];
    let mut usage = TokenUsage::default();
    usage.accumulate(&merged.usage);
    for meta in iter {
        providers.push(meta.provider.clone());
        usage.accumulate(&meta.usage);
        merged.elapsed_ms = merged.elapsed_ms.max(meta.elapsed_ms);
        merged.cost_estimate += meta.cost_estimate;
    }
    merged.provider = providers.join("+");
    merged.usage = usage;
    merged
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::{RawCompletion, VisionRequest};
    use crate::rules::Severity;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Mutex;

    /// Scripted provider for dispatch tests. Overrides the stage
    /// operations directly so tests control results and latency.
    /// Results are one-shot (taken on first call) since every dispatch
    /// path calls each provider at most once.
    struct StubProvider {
        name: &'static str,
        pdf: bool,
        delay: Duration,
        calls: AtomicU32,
        classification: Mutex<Option<Result<Classification, LlmError>>>,
        extraction: Mutex<Option<Result<Extraction, LlmError>>>,
        validation: Mutex<Option<Result<LlmValidation, LlmError>>>,
    }

    impl StubProvider {
        fn new(name: &'static str, pdf: bool) -> Self {
            Self {
                name,
                pdf,
                delay: Duration::ZERO,
                calls: AtomicU32::new(0),
                classification: Mutex::new(None),
                extraction: Mutex::new(None),
                validation: Mutex::new(None),
            }
        }

        fn with_delay(mut self, delay: Duration) -> Self {
            self.delay = delay;
            self
        }

        fn meta(&self, elapsed_ms: u64) -> CallMeta {
            CallMeta {
                provider: self.name.to_string(),
                model: "stub-model".to_string(),
                prompt_id: "classify.v1".to_string(),
                prompt_text: "prompt".to_string(),
                raw_response: "{}".to_string(),
                usage: TokenUsage {
                    input_tokens: 100,
                    output_tokens: 10,
                },
                elapsed_ms,
                cost_estimate: 0.001,
            }
        }

        fn classifies(self, doc_type: DocumentType, confidence: f64) -> Self {
            let meta = self.meta(5);
            *self.classification.lock().unwrap() = Some(Ok(Classification {
                document_type: doc_type,
                confidence,
                reasoning: String::new(),
                meta,
            }));
            self
        }

        fn extracts(self, fields: Vec<(&str, Value)>, confidence: f64) -> Self {
            let meta = self.meta(5);
            let fields: Vec<crate::llm::ExtractedField> = fields
                .into_iter()
                .map(|(name, value)| crate::llm::ExtractedField {
                    name: name.to_string(),
                    value,
                    confidence: None,
                })
                .collect();
            let mut data = Map::new();
            for f in &fields {
                data.insert(f.name.clone(), f.value.clone());
            }
            *self.extraction.lock().unwrap() = Some(Ok(Extraction {
                fields,
                data,
                confidence,
                meta,
            }));
            self
        }

        fn validates(self, is_valid: bool, confidence: f64) -> Self {
            let meta = self.meta(5);
            *self.validation.lock().unwrap() = Some(Ok(LlmValidation {
                is_valid,
                issues: vec![],
                confidence,
                corrected_data: None,
                meta,
            }));
            self
        }

        fn fails_validation(self, err: LlmError) -> Self {
            *self.validation.lock().unwrap() = Some(Err(err));
            self
        }
    }

    #[async_trait::async_trait]
    impl VisionProvider for StubProvider {
        fn name(&self) -> &str {
            self.name
        }

        fn model(&self) -> &str {
            "stub-model"
        }

        fn supports_pdf(&self) -> bool {
            self.pdf
        }

        async fn complete(&self, _request: VisionRequest) -> Result<RawCompletion, LlmError> {
            unimplemented!("stub overrides the stage operations")
        }

        async fn classify(&self, _file: &DocumentPayload) -> Result<Classification, LlmError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(self.delay).await;
            self.classification
                .lock()
                .unwrap()
                .take()
                .unwrap_or_else(|| panic!("stub {} has no classification", self.name))
        }

        async fn extract(
            &self,
            _file: &DocumentPayload,
            _doc_type: DocumentType,
        ) -> Result<Extraction, LlmError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(self.delay).await;
            self.extraction
                .lock()
                .unwrap()
                .take()
                .unwrap_or_else(|| panic!("stub {} has no extraction", self.name))
        }

        async fn validate(
            &self,
            _data: &Map<String, Value>,
            _doc_type: DocumentType,
            _file: Option<&DocumentPayload>,
            _rules_summary: &str,
        ) -> Result<LlmValidation, LlmError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(self.delay).await;
            self.validation
                .lock()
                .unwrap()
                .take()
                .unwrap_or_else(|| panic!("stub {} has no validation", self.name))
        }
    }

    fn dispatcher(stubs: Vec<StubProvider>) -> (Dispatcher, Vec<Arc<StubProvider>>) {
        dispatcher_with_policy(stubs, DispatchPolicy::default())
    }

    fn dispatcher_with_policy(
        stubs: Vec<StubProvider>,
        policy: DispatchPolicy,
    ) -> (Dispatcher, Vec<Arc<StubProvider>>) {
        let arcs: Vec<Arc<StubProvider>> = stubs.into_iter().map(Arc::new).collect();
        let providers: Vec<Arc<dyn VisionProvider>> = arcs
            .iter()
            .map(|a| Arc::clone(a) as Arc<dyn VisionProvider>)
            .collect();
        let registry = Arc::new(ProviderRegistry::from_providers(providers).expect("registry"));
        (Dispatcher::new(registry, policy), arcs)
    }

    fn big_image() -> DocumentPayload {
        DocumentPayload::new(vec![0u8; 3 * 1024 * 1024], "image/png")
    }

    fn small_image() -> DocumentPayload {
        DocumentPayload::new(vec![0u8; 1024], "image/png")
    }

    fn pdf() -> DocumentPayload {
        DocumentPayload::new(b"%PDF-1.4".to_vec(), "application/pdf")
    }

    #[tokio::test]
    async fn pdf_routes_to_capable_provider_only() {
        let (dispatcher, stubs) = dispatcher(vec![
            StubProvider::new("anthropic", true).classifies(DocumentType::Invoice, 0.9),
            StubProvider::new("openai", false).classifies(DocumentType::Receipt, 0.99),
        ]);

        let result = dispatcher.classify(&pdf()).await.expect("classify");
        assert_eq!(result.document_type, DocumentType::Invoice);
        assert_eq!(stubs[0].calls.load(Ordering::SeqCst), 1);
        assert_eq!(stubs[1].calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn pdf_with_no_capable_provider_is_unsupported() {
        let (dispatcher, _) = dispatcher(vec![
            StubProvider::new("openai", false).classifies(DocumentType::Invoice, 0.9)
        ]);
        let err = dispatcher.classify(&pdf()).await.unwrap_err();
        assert!(matches!(err, LlmError::UnsupportedMedia { .. }));
    }

    #[tokio::test]
    async fn small_files_skip_fan_out() {
        let (dispatcher, stubs) = dispatcher(vec![
            StubProvider::new("anthropic", true).classifies(DocumentType::Invoice, 0.7),
            StubProvider::new("openai", false).classifies(DocumentType::Invoice, 0.99),
        ]);

        let result = dispatcher.classify(&small_image()).await.expect("classify");
        // Single-provider path used the primary even though the
        // secondary reports higher confidence.
        assert!((result.confidence - 0.7).abs() < 1e-9);
        assert_eq!(stubs[1].calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn classification_fan_out_picks_highest_confidence() {
        let (dispatcher, stubs) = dispatcher(vec![
            StubProvider::new("anthropic", true).classifies(DocumentType::Invoice, 0.80),
            StubProvider::new("openai", false).classifies(DocumentType::Receipt, 0.95),
        ]);

        let result = dispatcher.classify(&big_image()).await.expect("classify");
        assert_eq!(result.document_type, DocumentType::Receipt);
        assert_eq!(stubs[0].calls.load(Ordering::SeqCst), 1);
        assert_eq!(stubs[1].calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn extraction_fastest_wins_when_sane() {
        let (dispatcher, _) = dispatcher(vec![
            StubProvider::new("anthropic", true)
                .extracts(vec![("total", serde_json::json!(12))], 0.9)
                .with_delay(Duration::from_millis(50)),
            StubProvider::new("openai", false)
                .extracts(vec![("total", serde_json::json!(99))], 0.9)
                .with_delay(Duration::from_millis(5)),
        ]);

        let result = dispatcher
            .extract(&big_image(), DocumentType::Invoice)
            .await
            .expect("extract");
        assert_eq!(result.data["total"], serde_json::json!(99));
    }

    #[tokio::test]
    async fn extraction_zero_field_winner_falls_back() {
        let (dispatcher, _) = dispatcher(vec![
            StubProvider::new("anthropic", true)
                .extracts(vec![], 0.9)
                .with_delay(Duration::from_millis(5)),
            StubProvider::new("openai", false)
                .extracts(vec![("total", serde_json::json!(42))], 0.8)
                .with_delay(Duration::from_millis(50)),
        ]);

        let result = dispatcher
            .extract(&big_image(), DocumentType::Invoice)
            .await
            .expect("extract");
        assert_eq!(result.data["total"], serde_json::json!(42));
    }

    #[tokio::test]
    async fn empty_extraction_confidence_is_clamped() {
        let (dispatcher, _) =
            dispatcher(vec![StubProvider::new("anthropic", true).extracts(vec![], 0.9)]);

        let result = dispatcher
            .extract(&small_image(), DocumentType::Invoice)
            .await
            .expect("extract");
        assert!(result.fields.is_empty());
        assert!(result.confidence <= EMPTY_EXTRACTION_CONFIDENCE);
    }

    #[tokio::test]
    async fn weighted_validation_both_agree() {
        let (dispatcher, _) = dispatcher(vec![
            StubProvider::new("anthropic", true).validates(true, 0.90),
            StubProvider::new("openai", false).validates(true, 0.85),
        ]);

        let consensus = dispatcher
            .validate(&Map::new(), DocumentType::Invoice, Some(&big_image()), "rules")
            .await
            .expect("validate");
        assert!(consensus.is_valid);
        assert!((consensus.confidence - 0.8775).abs() < 1e-3);
        assert_eq!(consensus.provider_count, 2);
        assert_eq!(consensus.meta.provider, "anthropic+openai");
        // Parallel usage sums across providers.
        assert_eq!(consensus.meta.usage.input_tokens, 200);
    }

    #[tokio::test]
    async fn weighted_validation_primary_dissent() {
        let (dispatcher, _) = dispatcher(vec![
            StubProvider::new("anthropic", true).validates(false, 0.85),
            StubProvider::new("openai", false).validates(true, 0.90),
        ]);

        let consensus = dispatcher
            .validate(&Map::new(), DocumentType::Invoice, Some(&big_image()), "rules")
            .await
            .expect("validate");
        assert!(!consensus.is_valid);
    }

    #[tokio::test]
    async fn one_provider_failing_degrades_to_survivor() {
        let (dispatcher, _) = dispatcher(vec![
            StubProvider::new("anthropic", true).fails_validation(LlmError::Timeout { seconds: 30 }),
            StubProvider::new("openai", false).validates(true, 0.9),
        ]);

        let consensus = dispatcher
            .validate(&Map::new(), DocumentType::Invoice, Some(&big_image()), "rules")
            .await
            .expect("validate");
        assert!(consensus.is_valid);
        assert_eq!(consensus.provider_count, 1);
        // Renormalized to the lone responder.
        assert!((consensus.confidence - 0.9).abs() < 1e-9);
    }

    #[tokio::test]
    async fn require_all_propagates_any_failure() {
        let policy = DispatchPolicy {
            require_all: true,
            ..DispatchPolicy::default()
        };
        let (dispatcher, _) = dispatcher_with_policy(
            vec![
                StubProvider::new("anthropic", true)
                    .fails_validation(LlmError::Timeout { seconds: 30 }),
                StubProvider::new("openai", false).validates(true, 0.9),
            ],
            policy,
        );

        let err = dispatcher
            .validate(&Map::new(), DocumentType::Invoice, Some(&big_image()), "rules")
            .await
            .unwrap_err();
        assert!(matches!(err, LlmError::Timeout { .. }));
    }

    #[tokio::test(start_paused = true)]
    async fn slow_provider_times_out() {
        let policy = DispatchPolicy {
            call_timeout: Duration::from_secs(30),
            ..DispatchPolicy::default()
        };
        let (dispatcher, _) = dispatcher_with_policy(
            vec![StubProvider::new("anthropic", true)
                .classifies(DocumentType::Invoice, 0.9)
                .with_delay(Duration::from_secs(120))],
            policy,
        );

        let err = dispatcher.classify(&small_image()).await.unwrap_err();
        match err {
            LlmError::Timeout { seconds } => assert_eq!(seconds, 30),
            other => panic!("expected Timeout, got: {other}"),
        }
    }

    #[tokio::test]
    async fn single_provider_issue_list_survives_consensus_shape() {
        let meta = StubProvider::new("anthropic", true).meta(5);
        let validation = LlmValidation {
            is_valid: false,
            issues: vec![ValidationIssue::new("total", "mismatch", Severity::Error)],
            confidence: 0.6,
            corrected_data: None,
            meta,
        };
        let consensus = single_consensus(validation);
        assert!(!consensus.is_valid);
        assert_eq!(consensus.issues.len(), 1);
        assert!((consensus.agreement - 1.0).abs() < 1e-9);
    }
}
