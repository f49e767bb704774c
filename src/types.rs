//! Core request and identifier types shared across the pipeline.

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::time::{SystemTime, UNIX_EPOCH};

use crate::error::ApiError;

/// Identifier of one content-producing pipeline stage.
///
/// Declaration order is the canonical stage order used for scheduling ties and reporting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StageId {
    Description,
    UspExtraction,
    Chapters,
    Faq,
    StepByStep,
    CaseStudies,
    Keywords,
    GroundingAggregation,
}

impl StageId {
    pub const ALL: [StageId; 8] = [
        StageId::Description,
        StageId::UspExtraction,
        StageId::Chapters,
        StageId::Faq,
        StageId::StepByStep,
        StageId::CaseStudies,
        StageId::Keywords,
        StageId::GroundingAggregation,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            StageId::Description => "description",
            StageId::UspExtraction => "usp_extraction",
            StageId::Chapters => "chapters",
            StageId::Faq => "faq",
            StageId::StepByStep => "step_by_step",
            StageId::CaseStudies => "case_studies",
            StageId::Keywords => "keywords",
            StageId::GroundingAggregation => "grounding_aggregation",
        }
    }
}

impl fmt::Display for StageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for StageId {
    type Err = ApiError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        StageId::ALL
            .iter()
            .copied()
            .find(|stage| stage.as_str() == s)
            .ok_or_else(|| ApiError::Validation(format!("Unknown stage: {}", s)))
    }
}

/// Pipeline profile selected by the caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PipelineProfile {
    #[default]
    Full,
    Quick,
    Grounded,
}

impl PipelineProfile {
    pub fn as_str(self) -> &'static str {
        match self {
            PipelineProfile::Full => "full",
            PipelineProfile::Quick => "quick",
            PipelineProfile::Grounded => "grounded",
        }
    }

    /// Stages this profile leaves out of the run entirely.
    pub fn excluded_stages(self) -> &'static [StageId] {
        match self {
            PipelineProfile::Quick => &[StageId::StepByStep],
            PipelineProfile::Full | PipelineProfile::Grounded => &[],
        }
    }

    /// Whether stages that require external grounding get a web-grounded call.
    pub fn grounding_enabled(self) -> bool {
        match self {
            PipelineProfile::Quick => false,
            PipelineProfile::Full | PipelineProfile::Grounded => true,
        }
    }

    /// Whether the launch-date filter is forwarded to grounded stages.
    pub fn forwards_launch_date(self) -> bool {
        matches!(self, PipelineProfile::Grounded)
    }
}

impl fmt::Display for PipelineProfile {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for PipelineProfile {
    type Err = ApiError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "full" => Ok(PipelineProfile::Full),
            "quick" => Ok(PipelineProfile::Quick),
            "grounded" => Ok(PipelineProfile::Grounded),
            other => Err(ApiError::Validation(format!(
                "Unknown pipeline profile: {} (expected full, quick or grounded)",
                other
            ))),
        }
    }
}

/// An accepted generation request. Fields are read-only once built.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct GenerationRequest {
    product_name: String,
    content: String,
    keywords: Vec<String>,
    language: String,
    profile: PipelineProfile,
    #[serde(skip_serializing_if = "Option::is_none")]
    launch_date: Option<NaiveDate>,
}

impl GenerationRequest {
    pub fn builder(
        product_name: impl Into<String>,
        content: impl Into<String>,
    ) -> GenerationRequestBuilder {
        GenerationRequestBuilder {
            product_name: product_name.into(),
            content: content.into(),
            keywords: Vec::new(),
            language: "en".to_string(),
            profile: PipelineProfile::default(),
            launch_date: None,
        }
    }

    pub fn product_name(&self) -> &str {
        &self.product_name
    }

    pub fn content(&self) -> &str {
        &self.content
    }

    pub fn keywords(&self) -> &[String] {
        &self.keywords
    }

    pub fn language(&self) -> &str {
        &self.language
    }

    pub fn profile(&self) -> PipelineProfile {
        self.profile
    }

    pub fn launch_date(&self) -> Option<NaiveDate> {
        self.launch_date
    }
}

#[derive(Debug, Clone)]
pub struct GenerationRequestBuilder {
    product_name: String,
    content: String,
    keywords: Vec<String>,
    language: String,
    profile: PipelineProfile,
    launch_date: Option<NaiveDate>,
}

impl GenerationRequestBuilder {
    pub fn keyword(mut self, keyword: impl Into<String>) -> Self {
        self.keywords.push(keyword.into());
        self
    }

    pub fn keywords<I, S>(mut self, keywords: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.keywords.extend(keywords.into_iter().map(Into::into));
        self
    }

    pub fn language(mut self, language: impl Into<String>) -> Self {
        self.language = language.into();
        self
    }

    pub fn profile(mut self, profile: PipelineProfile) -> Self {
        self.profile = profile;
        self
    }

    pub fn launch_date(mut self, launch_date: Option<NaiveDate>) -> Self {
        self.launch_date = launch_date;
        self
    }

    pub fn build(self) -> Result<GenerationRequest, ApiError> {
        if self.product_name.trim().is_empty() {
            return Err(ApiError::Validation(
                "Product name cannot be empty".to_string(),
            ));
        }
        if self.content.trim().is_empty() {
            return Err(ApiError::Validation(
                "Source content cannot be empty".to_string(),
            ));
        }
        let language = self.language.trim().to_string();
        if language.is_empty() {
            return Err(ApiError::Validation("Language cannot be empty".to_string()));
        }
        let keywords = self
            .keywords
            .into_iter()
            .map(|k| k.trim().to_string())
            .filter(|k| !k.is_empty())
            .collect();

        Ok(GenerationRequest {
            product_name: self.product_name,
            content: self.content,
            keywords,
            language,
            profile: self.profile,
            launch_date: self.launch_date,
        })
    }
}

/// Current time as milliseconds since Unix epoch.
pub fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}
