//! Registration strategy selection with a quality-gated fallback chain.

use super::backends::{RegistrationBackend, RegistrationRequest};
use super::method::{AppliedMethod, RegistrationMethod, RequestedMethod};
use super::quality::{QualityAssessor, QualityClass, QualityMetrics, QualityThresholds};
use crate::config::RegistrationConfig;
use crate::errors::{DtiflowError, Result};
use crate::events::{EventSink, ProgressEvent};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// File name of the persisted registration record.
pub const RECORD_FILE_NAME: &str = "registration.json";

/// Ordered methods to try for a request, given what is available.
///
/// Auto walks the preference order. An explicit request tries that method,
/// then the classical method as its fallback; an unavailable explicit
/// method degrades to the classical method alone.
pub fn fallback_chain<F>(requested: RequestedMethod, available: F) -> Vec<RegistrationMethod>
where
    F: Fn(RegistrationMethod) -> bool,
{
    let classical = RegistrationMethod::EnhancedClassical;
    let mut chain = match requested {
        RequestedMethod::Auto => RegistrationMethod::AUTO_ORDER.to_vec(),
        RequestedMethod::Explicit(method) if available(method) => vec![method, classical],
        RequestedMethod::Explicit(method) => {
            warn!(method = %method, "Requested registration method unavailable; using {classical}");
            vec![classical]
        }
    };
    chain.dedup();
    chain.retain(|m| available(*m));
    chain
}

/// Tries each method in order until one yields an accepted result.
///
/// `step` returns the attempt record and, when accepted, the value. Errors
/// from `step` abort the chain.
pub async fn run_fallback_chain<T, F, Fut>(
    chain: &[RegistrationMethod],
    mut step: F,
) -> Result<(Option<(RegistrationMethod, T)>, Vec<RegistrationAttempt>)>
where
    F: FnMut(RegistrationMethod) -> Fut,
    Fut: Future<Output = Result<(RegistrationAttempt, Option<T>)>>,
{
    let mut attempts = Vec::with_capacity(chain.len());
    for &method in chain {
        let (attempt, accepted) = step(method).await?;
        attempts.push(attempt);
        if let Some(value) = accepted {
            return Ok((Some((method, value)), attempts));
        }
    }
    Ok((None, attempts))
}

/// One try of one method.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RegistrationAttempt {
    /// Method tried.
    pub method: RegistrationMethod,
    /// Similarity metrics, when measured.
    pub metrics: Option<QualityMetrics>,
    /// Gate classification.
    pub quality: QualityClass,
    /// Whether this attempt was accepted.
    pub success: bool,
    /// Why it was not accepted.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl RegistrationAttempt {
    fn failed(method: RegistrationMethod, error: impl Into<String>) -> Self {
        Self {
            method,
            metrics: None,
            quality: QualityClass::Unchecked,
            success: false,
            error: Some(error.into()),
        }
    }
}

/// Terminal result of a registration point.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RegistrationOutcome {
    /// What produced the output.
    pub applied: AppliedMethod,
    /// False only for passthrough.
    pub success: bool,
    /// Quality of the accepted result.
    pub quality: QualityClass,
    /// Metrics of the accepted result.
    pub metrics: Option<QualityMetrics>,
    /// The registered (or passed-through) image.
    pub output: PathBuf,
    /// Every attempt, in order.
    pub attempts: Vec<RegistrationAttempt>,
}

impl RegistrationOutcome {
    /// Outcome of the rigid FSL route.
    #[must_use]
    pub fn traditional(output: PathBuf) -> Self {
        Self {
            applied: AppliedMethod::Traditional,
            success: true,
            quality: QualityClass::Unchecked,
            metrics: None,
            output,
            attempts: Vec::new(),
        }
    }
}

/// Persisted registration decision read by downstream stages.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RegistrationRecord {
    /// Subject ID.
    pub subject: String,
    /// What the operator asked for; `None` when ML registration was off.
    pub requested: Option<RequestedMethod>,
    /// What was applied.
    pub applied: AppliedMethod,
    /// Whether a real registration was applied.
    pub success: bool,
    /// Quality of the applied result.
    pub quality: QualityClass,
    /// Its metrics.
    pub metrics: Option<QualityMetrics>,
    /// Registered image.
    pub output: PathBuf,
    /// Every attempt.
    pub attempts: Vec<RegistrationAttempt>,
    /// When the record was written.
    pub recorded_at: DateTime<Utc>,
}

impl RegistrationRecord {
    /// Builds a record from an outcome.
    #[must_use]
    pub fn new(subject: &str, requested: Option<RequestedMethod>, outcome: &RegistrationOutcome) -> Self {
        Self {
            subject: subject.to_string(),
            requested,
            applied: outcome.applied,
            success: outcome.success,
            quality: outcome.quality,
            metrics: outcome.metrics,
            output: outcome.output.clone(),
            attempts: outcome.attempts.clone(),
            recorded_at: Utc::now(),
        }
    }

    /// Writes the record as pretty JSON.
    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let json = serde_json::to_string_pretty(self)?;
        std::fs::write(path, json)?;
        debug!(path = %path.display(), applied = %self.applied, "Registration record written");
        Ok(())
    }

    /// Reads a record.
    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        Ok(serde_json::from_str(&text)?)
    }

    /// Returns true when downstream may use the registered image.
    #[must_use]
    pub fn is_usable(&self) -> bool {
        self.success && self.output.exists()
    }
}

/// Picks and applies a registration method for one registration point.
pub struct RegistrationSelector {
    backends: Vec<Arc<dyn RegistrationBackend>>,
    assessor: Arc<dyn QualityAssessor>,
    thresholds: QualityThresholds,
    skip_quality_check: bool,
    events: Arc<dyn EventSink>,
}

impl std::fmt::Debug for RegistrationSelector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RegistrationSelector")
            .field("backends", &self.backends.iter().map(|b| b.method()).collect::<Vec<_>>())
            .field("thresholds", &self.thresholds)
            .field("skip_quality_check", &self.skip_quality_check)
            .finish_non_exhaustive()
    }
}

impl RegistrationSelector {
    /// Creates a selector over the given backends.
    #[must_use]
    pub fn new(
        backends: Vec<Arc<dyn RegistrationBackend>>,
        assessor: Arc<dyn QualityAssessor>,
        config: &RegistrationConfig,
        events: Arc<dyn EventSink>,
    ) -> Self {
        Self {
            backends,
            assessor,
            thresholds: config.thresholds,
            skip_quality_check: config.skip_quality_check,
            events,
        }
    }

    fn backend(&self, method: RegistrationMethod) -> Option<&Arc<dyn RegistrationBackend>> {
        self.backends.iter().find(|b| b.method() == method)
    }

    fn is_available(&self, method: RegistrationMethod) -> bool {
        self.backend(method).is_some_and(|b| b.is_available())
    }

    /// Registers `request.moving` onto `request.fixed`.
    ///
    /// Never fails because of poor quality: the worst case is a passthrough
    /// copy of the moving image with `success = false`. Cancellation and
    /// I/O errors writing the final output are returned.
    pub async fn select_and_apply(
        &self,
        request: &RegistrationRequest,
        requested: RequestedMethod,
    ) -> Result<RegistrationOutcome> {
        let chain = fallback_chain(requested, |m| self.is_available(m));
        info!(
            subject = %request.subject,
            requested = %requested,
            chain = ?chain,
            "Selecting registration method"
        );

        let (accepted, attempts) =
            run_fallback_chain(&chain, |method| self.try_method(request, requested, method)).await?;

        let outcome = match accepted {
            Some((method, (path, metrics, quality))) => {
                if path != request.output {
                    std::fs::copy(&path, &request.output)?;
                }
                info!(subject = %request.subject, method = %method, quality = %quality, "Registration accepted");
                RegistrationOutcome {
                    applied: AppliedMethod::Method(method),
                    success: true,
                    quality,
                    metrics,
                    output: request.output.clone(),
                    attempts,
                }
            }
            None => self.passthrough(request, attempts)?,
        };
        Ok(outcome)
    }

    async fn try_method(
        &self,
        request: &RegistrationRequest,
        requested: RequestedMethod,
        method: RegistrationMethod,
    ) -> Result<(RegistrationAttempt, Option<(PathBuf, Option<QualityMetrics>, QualityClass)>)> {
        let Some(backend) = self.backend(method) else {
            return Ok((RegistrationAttempt::failed(method, "no backend configured"), None));
        };

        let registered = match backend.attempt(request).await {
            Ok(path) => path,
            Err(e) if e.is_cancelled() => return Err(e),
            Err(e) => {
                warn!(subject = %request.subject, method = %method, error = %e, "Registration attempt failed");
                return Ok((RegistrationAttempt::failed(method, e.to_string()), None));
            }
        };

        if let Err(e) = self.assessor.check_shape(&request.fixed, &registered) {
            warn!(subject = %request.subject, method = %method, error = %e, "Registered output rejected");
            return Ok((RegistrationAttempt::failed(method, e.to_string()), None));
        }

        if self.skip_quality_check {
            return Ok((Self::unchecked(method), Some((registered, None, QualityClass::Unchecked))));
        }

        let metrics = match self.assessor.assess(&request.fixed, &registered) {
            Ok(metrics) => metrics,
            Err(e) if !method.is_ml() => {
                // The classical method is the last resort; an unmeasurable result still beats passthrough.
                let msg = format!("Quality of {method} registration could not be measured ({e}); keeping it");
                warn!(subject = %request.subject, method = %method, error = %e, "{msg}");
                self.events.try_emit(&ProgressEvent::warn(Some(&request.subject), msg));
                return Ok((Self::unchecked(method), Some((registered, None, QualityClass::Unchecked))));
            }
            Err(e) => {
                warn!(subject = %request.subject, method = %method, error = %e, "Registered output rejected");
                return Ok((RegistrationAttempt::failed(method, e.to_string()), None));
            }
        };
        let quality = self.thresholds.classify(&metrics);
        let explicit = requested == RequestedMethod::Explicit(method);
        let accepted = quality.passes() || explicit || !method.is_ml();

        debug!(
            subject = %request.subject,
            method = %method,
            correlation = metrics.correlation,
            mutual_information = metrics.mutual_information,
            quality = %quality,
            "Registration quality measured"
        );
        self.report_quality(&request.subject, method, quality, accepted, explicit);

        let attempt = RegistrationAttempt {
            method,
            metrics: Some(metrics),
            quality,
            success: accepted,
            error: (!accepted).then(|| format!("quality {quality} below acceptable cutoffs")),
        };
        Ok((attempt, accepted.then_some((registered, Some(metrics), quality))))
    }

    fn unchecked(method: RegistrationMethod) -> RegistrationAttempt {
        RegistrationAttempt {
            method,
            metrics: None,
            quality: QualityClass::Unchecked,
            success: true,
            error: None,
        }
    }

    fn report_quality(
        &self,
        subject: &str,
        method: RegistrationMethod,
        quality: QualityClass,
        accepted: bool,
        explicit: bool,
    ) {
        let msg = match (quality, accepted) {
            (QualityClass::Acceptable, _) => format!("Registration via {method} has acceptable quality"),
            (QualityClass::Poor, false) => format!("Registration via {method} rejected: poor quality"),
            (QualityClass::Poor, true) if explicit => {
                format!("Registration via {method} has poor quality; kept as explicitly requested")
            }
            (QualityClass::Poor, true) => format!("Registration via {method} has poor quality; kept as final method"),
            _ => return,
        };
        warn!(subject, method = %method, quality = %quality, "{msg}");
        self.events.try_emit(&ProgressEvent::warn(Some(subject), msg));
    }

    fn passthrough(
        &self,
        request: &RegistrationRequest,
        attempts: Vec<RegistrationAttempt>,
    ) -> Result<RegistrationOutcome> {
        std::fs::copy(&request.moving, &request.output).map_err(|e| {
            DtiflowError::Registration(format!(
                "passthrough copy of {} failed: {e}",
                request.moving.display()
            ))
        })?;
        let msg = "All registration methods failed; continuing with unregistered image";
        warn!(subject = %request.subject, attempts = attempts.len(), "{msg}");
        self.events.try_emit(&ProgressEvent::warn(Some(&request.subject), msg));
        Ok(RegistrationOutcome {
            applied: AppliedMethod::Passthrough,
            success: false,
            quality: QualityClass::Unchecked,
            metrics: None,
            output: request.output.clone(),
            attempts,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::ToolError;
    use crate::events::CollectingEventSink;
    use crate::registration::quality::MockQualityAssessor;
    use async_trait::async_trait;
    use pretty_assertions::assert_eq;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct StubBackend {
        method: RegistrationMethod,
        available: bool,
        fails: bool,
        calls: AtomicUsize,
    }

    impl StubBackend {
        fn ok(method: RegistrationMethod) -> Arc<Self> {
            Arc::new(Self {
                method,
                available: true,
                fails: false,
                calls: AtomicUsize::new(0),
            })
        }

        fn failing(method: RegistrationMethod) -> Arc<Self> {
            Arc::new(Self {
                method,
                available: true,
                fails: true,
                calls: AtomicUsize::new(0),
            })
        }

        fn unavailable(method: RegistrationMethod) -> Arc<Self> {
            Arc::new(Self {
                method,
                available: false,
                fails: false,
                calls: AtomicUsize::new(0),
            })
        }
    }

    #[async_trait]
    impl RegistrationBackend for StubBackend {
        fn method(&self) -> RegistrationMethod {
            self.method
        }

        fn is_available(&self) -> bool {
            self.available
        }

        async fn attempt(&self, request: &RegistrationRequest) -> Result<PathBuf> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.fails {
                return Err(ToolError::failed(self.method.tool().name(), Some(1), "boom").into());
            }
            let out = request.output_for(self.method);
            std::fs::create_dir_all(out.parent().unwrap()).unwrap();
            std::fs::write(&out, self.method.name()).unwrap();
            Ok(out)
        }
    }

    fn metrics(correlation: f64, mutual_information: f64) -> QualityMetrics {
        QualityMetrics {
            correlation,
            mutual_information,
            voxels: 1000,
        }
    }

    /// Assessor returning fixed metrics per method, keyed on the output directory name.
    fn assessor(per_method: Vec<(RegistrationMethod, QualityMetrics)>) -> Arc<MockQualityAssessor> {
        let mut mock = MockQualityAssessor::new();
        mock.expect_check_shape().returning(|_, _| Ok(()));
        for (method, m) in per_method {
            mock.expect_assess()
                .withf(move |_, registered| registered.to_string_lossy().contains(method.name()))
                .returning(move |_, _| Ok(m));
        }
        Arc::new(mock)
    }

    fn request(dir: &Path) -> RegistrationRequest {
        let moving = dir.join("b0.nii.gz");
        std::fs::write(&moving, b"moving").unwrap();
        let out_dir = dir.join("refinement");
        std::fs::create_dir_all(&out_dir).unwrap();
        RegistrationRequest {
            subject: "sub-001".into(),
            fixed: dir.join("t1.nii.gz"),
            moving,
            output: out_dir.join("b0_to_t1.nii.gz"),
            quick: false,
            threads: 2,
        }
    }

    fn selector(
        stubs: Vec<Arc<StubBackend>>,
        assessor: Arc<dyn QualityAssessor>,
        skip_quality_check: bool,
    ) -> (RegistrationSelector, Arc<CollectingEventSink>) {
        let backends: Vec<Arc<dyn RegistrationBackend>> = stubs
            .into_iter()
            .map(|s| s as Arc<dyn RegistrationBackend>)
            .collect();
        let events = Arc::new(CollectingEventSink::new());
        let config = RegistrationConfig {
            ml_enabled: true,
            skip_quality_check,
            ..RegistrationConfig::default()
        };
        (RegistrationSelector::new(backends, assessor, &config, events.clone()), events)
    }

    #[test]
    fn test_fallback_chain_auto_order() {
        use RegistrationMethod::*;
        assert_eq!(
            fallback_chain(RequestedMethod::Auto, |_| true),
            vec![SynthMorph, DeformableNet, EnhancedClassical]
        );
        assert_eq!(
            fallback_chain(RequestedMethod::Auto, |m| m != SynthMorph),
            vec![DeformableNet, EnhancedClassical]
        );
        assert!(fallback_chain(RequestedMethod::Auto, |_| false).is_empty());
    }

    #[test]
    fn test_fallback_chain_explicit() {
        use RegistrationMethod::*;
        assert_eq!(
            fallback_chain(RequestedMethod::Explicit(DeformableNet), |_| true),
            vec![DeformableNet, EnhancedClassical]
        );
        assert_eq!(
            fallback_chain(RequestedMethod::Explicit(EnhancedClassical), |_| true),
            vec![EnhancedClassical]
        );
        assert_eq!(
            fallback_chain(RequestedMethod::Explicit(SynthMorph), |m| m != SynthMorph),
            vec![EnhancedClassical]
        );
    }

    #[tokio::test]
    async fn test_auto_accepts_first_good_method() {
        let dir = tempfile::tempdir().unwrap();
        let synth = StubBackend::ok(RegistrationMethod::SynthMorph);
        let net = StubBackend::ok(RegistrationMethod::DeformableNet);
        let (sel, _) = selector(
            vec![synth.clone(), net.clone()],
            assessor(vec![(RegistrationMethod::SynthMorph, metrics(0.80, 0.50))]),
            false,
        );

        let outcome = sel
            .select_and_apply(&request(dir.path()), RequestedMethod::Auto)
            .await
            .unwrap();

        assert_eq!(outcome.applied, AppliedMethod::Method(RegistrationMethod::SynthMorph));
        assert_eq!(outcome.quality, QualityClass::Good);
        assert!(outcome.success);
        assert_eq!(std::fs::read_to_string(&outcome.output).unwrap(), "synthmorph");
        assert_eq!(net.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_poor_ml_falls_back_in_order() {
        let dir = tempfile::tempdir().unwrap();
        let (sel, events) = selector(
            vec![
                StubBackend::ok(RegistrationMethod::SynthMorph),
                StubBackend::ok(RegistrationMethod::DeformableNet),
                StubBackend::ok(RegistrationMethod::EnhancedClassical),
            ],
            assessor(vec![
                (RegistrationMethod::SynthMorph, metrics(0.59, 0.90)),
                (RegistrationMethod::DeformableNet, metrics(0.70, 0.40)),
            ]),
            false,
        );

        let outcome = sel
            .select_and_apply(&request(dir.path()), RequestedMethod::Auto)
            .await
            .unwrap();

        assert_eq!(outcome.applied, AppliedMethod::Method(RegistrationMethod::DeformableNet));
        assert_eq!(outcome.quality, QualityClass::Acceptable);
        let tried: Vec<_> = outcome.attempts.iter().map(|a| (a.method, a.success)).collect();
        assert_eq!(
            tried,
            vec![
                (RegistrationMethod::SynthMorph, false),
                (RegistrationMethod::DeformableNet, true)
            ]
        );
        assert_eq!(events.matching("rejected").len(), 1);
        assert_eq!(events.matching("acceptable quality").len(), 1);
    }

    #[tokio::test]
    async fn test_classical_is_kept_even_when_poor() {
        let dir = tempfile::tempdir().unwrap();
        let (sel, _) = selector(
            vec![
                StubBackend::unavailable(RegistrationMethod::SynthMorph),
                StubBackend::failing(RegistrationMethod::DeformableNet),
                StubBackend::ok(RegistrationMethod::EnhancedClassical),
            ],
            assessor(vec![(RegistrationMethod::EnhancedClassical, metrics(0.1, 0.05))]),
            false,
        );

        let outcome = sel
            .select_and_apply(&request(dir.path()), RequestedMethod::Auto)
            .await
            .unwrap();

        assert_eq!(outcome.applied, AppliedMethod::Method(RegistrationMethod::EnhancedClassical));
        assert_eq!(outcome.quality, QualityClass::Poor);
        assert_eq!(outcome.attempts.len(), 2);
        assert!(outcome.attempts[0].error.as_deref().unwrap().contains("boom"));
    }

    #[tokio::test]
    async fn test_everything_fails_passthrough() {
        let dir = tempfile::tempdir().unwrap();
        let req = request(dir.path());
        let (sel, events) = selector(
            vec![
                StubBackend::failing(RegistrationMethod::SynthMorph),
                StubBackend::failing(RegistrationMethod::EnhancedClassical),
            ],
            Arc::new(MockQualityAssessor::new()),
            false,
        );

        let outcome = sel.select_and_apply(&req, RequestedMethod::Auto).await.unwrap();

        assert_eq!(outcome.applied, AppliedMethod::Passthrough);
        assert!(!outcome.success);
        assert_eq!(outcome.quality, QualityClass::Unchecked);
        assert_eq!(std::fs::read(&req.output).unwrap(), b"moving");
        assert_eq!(events.matching("unregistered").len(), 1);
    }

    #[tokio::test]
    async fn test_explicit_request_honored_when_poor() {
        let dir = tempfile::tempdir().unwrap();
        let classical = StubBackend::ok(RegistrationMethod::EnhancedClassical);
        let (sel, events) = selector(
            vec![StubBackend::ok(RegistrationMethod::DeformableNet), classical.clone()],
            assessor(vec![(RegistrationMethod::DeformableNet, metrics(0.2, 0.1))]),
            false,
        );

        let outcome = sel
            .select_and_apply(
                &request(dir.path()),
                RequestedMethod::Explicit(RegistrationMethod::DeformableNet),
            )
            .await
            .unwrap();

        assert_eq!(outcome.applied, AppliedMethod::Method(RegistrationMethod::DeformableNet));
        assert_eq!(outcome.quality, QualityClass::Poor);
        assert!(outcome.success);
        assert_eq!(classical.calls.load(Ordering::SeqCst), 0);
        assert_eq!(events.matching("explicitly requested").len(), 1);
    }

    fn shape_mismatch_for(mock: &mut MockQualityAssessor, method: RegistrationMethod) {
        mock.expect_check_shape()
            .withf(move |_, registered| registered.to_string_lossy().contains(method.name()))
            .returning(|_, registered| Err(DtiflowError::volume(registered, "shape mismatch")));
        mock.expect_check_shape().returning(|_, _| Ok(()));
    }

    #[tokio::test]
    async fn test_shape_mismatch_fails_attempt() {
        let dir = tempfile::tempdir().unwrap();
        let mut mock = MockQualityAssessor::new();
        shape_mismatch_for(&mut mock, RegistrationMethod::SynthMorph);
        mock.expect_assess()
            .withf(|_, registered| registered.to_string_lossy().contains("enhanced-classical"))
            .returning(|_, _| Ok(metrics(0.9, 0.9)));
        let (sel, _) = selector(
            vec![
                StubBackend::ok(RegistrationMethod::SynthMorph),
                StubBackend::ok(RegistrationMethod::EnhancedClassical),
            ],
            Arc::new(mock),
            false,
        );

        let outcome = sel
            .select_and_apply(
                &request(dir.path()),
                RequestedMethod::Explicit(RegistrationMethod::SynthMorph),
            )
            .await
            .unwrap();

        assert_eq!(outcome.applied, AppliedMethod::Method(RegistrationMethod::EnhancedClassical));
        assert!(outcome.attempts[0].error.as_deref().unwrap().contains("shape mismatch"));
    }

    #[tokio::test]
    async fn test_skip_quality_check_accepts_unmeasured() {
        let dir = tempfile::tempdir().unwrap();
        let mut mock = MockQualityAssessor::new();
        mock.expect_check_shape().times(1).returning(|_, _| Ok(()));
        mock.expect_assess().never();
        let (sel, _) = selector(
            vec![StubBackend::ok(RegistrationMethod::SynthMorph)],
            Arc::new(mock),
            true,
        );

        let outcome = sel
            .select_and_apply(&request(dir.path()), RequestedMethod::Auto)
            .await
            .unwrap();

        assert_eq!(outcome.quality, QualityClass::Unchecked);
        assert!(outcome.metrics.is_none());
        assert!(outcome.success);
    }

    #[tokio::test]
    async fn test_skip_quality_check_still_rejects_wrong_grid() {
        let dir = tempfile::tempdir().unwrap();
        let mut mock = MockQualityAssessor::new();
        shape_mismatch_for(&mut mock, RegistrationMethod::SynthMorph);
        mock.expect_assess().never();
        let (sel, _) = selector(
            vec![
                StubBackend::ok(RegistrationMethod::SynthMorph),
                StubBackend::ok(RegistrationMethod::EnhancedClassical),
            ],
            Arc::new(mock),
            true,
        );

        let outcome = sel
            .select_and_apply(&request(dir.path()), RequestedMethod::Auto)
            .await
            .unwrap();

        assert_eq!(outcome.applied, AppliedMethod::Method(RegistrationMethod::EnhancedClassical));
        assert!(!outcome.attempts[0].success);
        assert!(outcome.attempts[0].error.as_deref().unwrap().contains("shape mismatch"));
        assert_eq!(outcome.quality, QualityClass::Unchecked);
    }

    #[tokio::test]
    async fn test_classical_kept_when_quality_unmeasurable() {
        let dir = tempfile::tempdir().unwrap();
        let req = request(dir.path());
        let mut mock = MockQualityAssessor::new();
        mock.expect_check_shape().returning(|_, _| Ok(()));
        mock.expect_assess()
            .returning(|_, registered| Err(DtiflowError::volume(registered, "no overlapping voxels")));
        let (sel, events) = selector(
            vec![
                StubBackend::ok(RegistrationMethod::SynthMorph),
                StubBackend::ok(RegistrationMethod::EnhancedClassical),
            ],
            Arc::new(mock),
            false,
        );

        let outcome = sel.select_and_apply(&req, RequestedMethod::Auto).await.unwrap();

        assert_eq!(outcome.applied, AppliedMethod::Method(RegistrationMethod::EnhancedClassical));
        assert!(outcome.success);
        assert_eq!(outcome.quality, QualityClass::Unchecked);
        assert!(outcome.metrics.is_none());
        assert!(!outcome.attempts[0].success);
        assert_eq!(std::fs::read_to_string(&req.output).unwrap(), "enhanced-classical");
        assert_eq!(events.matching("could not be measured").len(), 1);
    }

    #[test]
    fn test_record_round_trip_on_disk() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("sub-001").join(RECORD_FILE_NAME);
        let outcome = RegistrationOutcome::traditional(dir.path().join("reg.nii.gz"));
        let record = RegistrationRecord::new("sub-001", None, &outcome);

        record.save(&path).unwrap();
        let loaded = RegistrationRecord::load(&path).unwrap();
        assert_eq!(loaded, record);
        assert_eq!(loaded.applied, AppliedMethod::Traditional);
        assert!(!loaded.is_usable());
    }
}
