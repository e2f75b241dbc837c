//! Metadata bundle
//!
//! Running record of a task's provenance. Created at the first stage and
//! only ever extended: merging a stage output appends new entries and updates
//! scalar fields, it never removes anything. Serialized with stable JSON field
//! names.

use crate::executor::StageOutput;
use chrono::{DateTime, Utc};
use pgov_policy::{Role, TaskId};
use serde::{Deserialize, Serialize};

/// Provenance of a piece of source material
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Attribution {
    /// Stable source identifier
    pub source_id: String,
    /// Where it came from (data source name or domain)
    pub origin: String,
    /// Quoted or paraphrased excerpt
    pub excerpt: String,
    /// Retrieval time
    pub retrieved_at: DateTime<Utc>,
}

/// Tone and safety annotations
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ToneFlags {
    /// Similarity to the author's voice, 0.0..=1.0
    pub voice_match_score: Option<f64>,
    /// Search keywords
    pub seo_keywords: Vec<String>,
    /// Safety findings
    pub safety_flags: Vec<String>,
}

/// One applied edit
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangeLogEntry {
    /// Edit identifier
    pub change_id: String,
    /// Text before
    pub original_text: String,
    /// Text after
    pub revised_text: String,
    /// Why it was made
    pub reason: String,
    /// Role that applied it
    pub applied_by: Role,
}

/// Token accounting
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TokenStats {
    /// Prompt tokens
    pub input_tokens: u64,
    /// Completion tokens
    pub output_tokens: u64,
}

impl TokenStats {
    /// Sum of both counters
    #[inline]
    #[must_use]
    pub fn total(&self) -> u64 {
        self.input_tokens + self.output_tokens
    }
}

impl std::ops::AddAssign for TokenStats {
    fn add_assign(&mut self, rhs: Self) {
        self.input_tokens += rhs.input_tokens;
        self.output_tokens += rhs.output_tokens;
    }
}

/// Accumulated provenance of a task
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetadataBundle {
    /// Owning task
    pub task_id: TaskId,
    /// Last role that merged into the bundle
    pub role: Role,
    /// Sources consulted, in first-use order
    pub input_sources: Vec<String>,
    /// Attribution entries, in first-seen order
    pub attribution: Vec<Attribution>,
    /// Tone and safety annotations
    pub tone_flags: ToneFlags,
    /// Applied edits
    pub change_log: Vec<ChangeLogEntry>,
    /// Keyword suggestions
    pub long_tail_keywords: Vec<String>,
    /// Token accounting across stages
    pub token_stats: TokenStats,
    /// Sections removed while compressing
    pub trimmed_sections: Vec<String>,
    /// Summarizer output
    pub final_output: Option<String>,
}

impl MetadataBundle {
    /// Empty bundle for a task
    #[must_use]
    pub fn new(task_id: TaskId) -> Self {
        Self {
            task_id,
            role: Role::Ideator,
            input_sources: Vec::new(),
            attribution: Vec::new(),
            tone_flags: ToneFlags::default(),
            change_log: Vec::new(),
            long_tail_keywords: Vec::new(),
            token_stats: TokenStats::default(),
            trimmed_sections: Vec::new(),
            final_output: None,
        }
    }

    /// Attribution entry by source id
    #[must_use]
    pub fn attribution_for(&self, source_id: &str) -> Option<&Attribution> {
        self.attribution.iter().find(|a| a.source_id == source_id)
    }

    /// Merge a validated stage output
    ///
    /// Entries already present are kept as they are; the output's copies are
    /// not consulted. Post-stage checks reject outputs that drop or alter them
    /// before this point.
    pub fn merge(&mut self, role: Role, output: &StageOutput) {
        self.role = role;

        append_unique(&mut self.input_sources, &output.input_sources);
        for entry in &output.attribution {
            if self.attribution_for(&entry.source_id).is_none() {
                self.attribution.push(entry.clone());
            }
        }

        if output.tone_flags.voice_match_score.is_some() {
            self.tone_flags.voice_match_score = output.tone_flags.voice_match_score;
        }
        append_unique(
            &mut self.tone_flags.seo_keywords,
            &output.tone_flags.seo_keywords,
        );
        append_unique(
            &mut self.tone_flags.safety_flags,
            &output.tone_flags.safety_flags,
        );

        for change in &output.change_log {
            if !self.change_log.iter().any(|c| c.change_id == change.change_id) {
                self.change_log.push(change.clone());
            }
        }
        append_unique(&mut self.long_tail_keywords, &output.long_tail_keywords);
        self.token_stats += output.token_stats;
        append_unique(&mut self.trimmed_sections, &output.trimmed_sections);

        if role == Role::Summarizer {
            self.final_output = Some(output.content.clone());
        }
    }
}

fn append_unique(target: &mut Vec<String>, items: &[String]) {
    for item in items {
        if !target.contains(item) {
            target.push(item.clone());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn attribution(id: &str) -> Attribution {
        Attribution {
            source_id: id.to_string(),
            origin: "published_articles".to_string(),
            excerpt: format!("excerpt of {id}"),
            retrieved_at: Utc::now(),
        }
    }

    #[test]
    fn merge_only_appends() {
        let mut bundle = MetadataBundle::new(TaskId::new());
        let first = StageOutput {
            input_sources: vec!["personal_notes".into()],
            attribution: vec![attribution("a1")],
            long_tail_keywords: vec!["tidal energy".into()],
            token_stats: TokenStats {
                input_tokens: 100,
                output_tokens: 40,
            },
            ..StageOutput::new("ideas")
        };
        bundle.merge(Role::Ideator, &first);

        let second = StageOutput {
            input_sources: vec!["personal_notes".into(), "social_posts".into()],
            attribution: vec![attribution("a1"), attribution("a2")],
            token_stats: TokenStats {
                input_tokens: 10,
                output_tokens: 5,
            },
            ..StageOutput::new("draft")
        };
        bundle.merge(Role::Drafter, &second);

        assert_eq!(bundle.role, Role::Drafter);
        assert_eq!(bundle.input_sources, vec!["personal_notes", "social_posts"]);
        assert_eq!(bundle.attribution.len(), 2);
        assert_eq!(bundle.long_tail_keywords, vec!["tidal energy"]);
        assert_eq!(bundle.token_stats.total(), 155);
        assert_eq!(bundle.final_output, None);
    }

    #[test]
    fn summarizer_sets_final_output() {
        let mut bundle = MetadataBundle::new(TaskId::new());
        bundle.merge(Role::Summarizer, &StageOutput::new("final text"));
        assert_eq!(bundle.final_output.as_deref(), Some("final text"));
    }

    #[test]
    fn json_field_names_are_stable() {
        let bundle = MetadataBundle::new(TaskId::new());
        let json = serde_json::to_value(&bundle).unwrap();
        for field in [
            "task_id",
            "role",
            "input_sources",
            "attribution",
            "tone_flags",
            "change_log",
            "long_tail_keywords",
            "token_stats",
            "trimmed_sections",
            "final_output",
        ] {
            assert!(json.get(field).is_some(), "missing {field}");
        }
        assert!(json["tone_flags"].get("voice_match_score").is_some());
        assert!(json["token_stats"].get("input_tokens").is_some());
    }
}
