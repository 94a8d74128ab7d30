//! Curation pipeline: candidate images flow from the external source into
//! PENDING items, get classified, and are admitted to (or rejected from) the
//! approved pool that batch generation draws from.

use metrics::counter;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{error, info, warn};

use crate::db::store::CurationStore;
use crate::db::StoreError;
use crate::models::curation::{
    CuratedImageItem, CurationDecision, CurationStatus, CurationSummary, ImageAssessment,
    ItemFailure, SourceFilter, SourceImage,
};
use crate::services::providers::{ImageClassifier, ImageSource, ProviderError};
use crate::services::taxonomy::{normalize_gender, normalize_species};

/// Admission rules applied to a classifier assessment.
#[derive(Debug, Clone, PartialEq)]
pub struct CurationPolicy {
    /// Minimum quality on the classifier's 0-10 scale.
    pub min_quality: f64,
    /// Stop approving once this many items were approved in one run.
    pub max_approvals: Option<usize>,
}

impl Default for CurationPolicy {
    fn default() -> Self {
        Self {
            min_quality: 6.0,
            max_approvals: None,
        }
    }
}

impl CurationPolicy {
    pub fn decide(&self, assessment: &ImageAssessment) -> CurationDecision {
        let rejection_reason = if assessment.nsfw {
            Some("nsfw content".to_string())
        } else if !assessment.single_character {
            Some("not a single character".to_string())
        } else if assessment.quality_score < self.min_quality {
            Some(format!(
                "quality {:.1} below minimum {:.1}",
                assessment.quality_score, self.min_quality
            ))
        } else {
            None
        };

        CurationDecision {
            status: if rejection_reason.is_some() {
                CurationStatus::Rejected
            } else {
                CurationStatus::Approved
            },
            quality_score: assessment.quality_score,
            gender: assessment.gender.as_deref().map(normalize_gender),
            species: assessment.species.as_deref().map(normalize_species),
            rejection_reason,
        }
    }
}

/// Result of the daily curation job.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct CurationRunReport {
    pub fetched: usize,
    pub inserted: usize,
    pub source_error: Option<String>,
    pub summary: CurationSummary,
}

pub struct CurationPipeline {
    store: Arc<dyn CurationStore>,
    classifier: Arc<dyn ImageClassifier>,
    source: Arc<dyn ImageSource>,
    policy: CurationPolicy,
}

impl CurationPipeline {
    pub fn new(
        store: Arc<dyn CurationStore>,
        classifier: Arc<dyn ImageClassifier>,
        source: Arc<dyn ImageSource>,
        policy: CurationPolicy,
    ) -> Self {
        Self {
            store,
            classifier,
            source,
            policy,
        }
    }

    /// Insert new candidates as PENDING. Known URLs are skipped; only newly
    /// inserted items are returned.
    pub async fn add_batch(&self, candidates: &[SourceImage]) -> Result<Vec<CuratedImageItem>, CurationError> {
        let inserted = self.store.insert_candidates(candidates).await?;
        info!(
            candidates = candidates.len(),
            inserted = inserted.len(),
            "Curation candidates added"
        );
        Ok(inserted)
    }

    pub async fn ingest_from_source(&self, filter: &SourceFilter) -> Result<(usize, Vec<CuratedImageItem>), CurationError> {
        let images = self.source.fetch_trending_images(filter).await?;
        let fetched = images.len();
        let inserted = self.add_batch(&images).await?;
        Ok((fetched, inserted))
    }

    /// Classify up to `limit` pending items, oldest first. A failing item is
    /// recorded in the summary and stays PENDING for the next run.
    pub async fn process_pending_items(&self, limit: Option<usize>) -> Result<CurationSummary, CurationError> {
        let pending = self.store.pending_items(limit).await?;
        let mut summary = CurationSummary::default();

        for item in pending {
            if self
                .policy
                .max_approvals
                .is_some_and(|max| summary.approved >= max)
            {
                info!(max_approvals = ?self.policy.max_approvals, "Approval cap reached, leaving remaining items pending");
                break;
            }

            summary.processed += 1;
            match self.process_item(&item).await {
                Ok(decision) => {
                    match decision.status {
                        CurationStatus::Approved => summary.approved += 1,
                        _ => summary.rejected += 1,
                    }
                    counter!("curation_items_total", "outcome" => decision.status.to_string().to_lowercase())
                        .increment(1);
                    info!(
                        item_id = %item.id,
                        status = %decision.status,
                        quality = decision.quality_score,
                        reason = decision.rejection_reason.as_deref().unwrap_or(""),
                        "Curation decision recorded"
                    );
                }
                Err(e) => {
                    counter!("curation_items_total", "outcome" => "error").increment(1);
                    warn!(item_id = %item.id, error = %e, "Failed to curate item, leaving it pending");
                    summary.errors += 1;
                    summary.failures.push(ItemFailure {
                        item_id: item.id,
                        error: e.to_string(),
                    });
                }
            }
        }

        info!(
            processed = summary.processed,
            approved = summary.approved,
            rejected = summary.rejected,
            errors = summary.errors,
            "Curation pass finished"
        );
        Ok(summary)
    }

    async fn process_item(&self, item: &CuratedImageItem) -> Result<CurationDecision, CurationError> {
        let assessment = self.classifier.classify(&item.source_url).await?;
        let decision = self.policy.decide(&assessment);
        self.store.record_decision(item.id, &decision).await?;
        Ok(decision)
    }

    /// Fetch new candidates, then classify pending items. A source failure is
    /// logged and does not stop classification of items already queued.
    pub async fn run(&self, fetch_limit: usize, process_limit: Option<usize>) -> Result<CurationRunReport, CurationError> {
        let filter = SourceFilter {
            limit: fetch_limit,
            ..SourceFilter::default()
        };

        let mut report = CurationRunReport::default();
        match self.ingest_from_source(&filter).await {
            Ok((fetched, inserted)) => {
                report.fetched = fetched;
                report.inserted = inserted.len();
            }
            Err(e) => {
                error!(error = %e, "Failed to ingest candidates from image source");
                report.source_error = Some(e.to_string());
            }
        }

        report.summary = self.process_pending_items(process_limit).await?;
        Ok(report)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum CurationError {
    #[error("Curation store error: {0}")]
    Store(#[from] StoreError),

    #[error("Provider error: {0}")]
    Provider(#[from] ProviderError),
}
