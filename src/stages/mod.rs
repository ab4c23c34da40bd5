//! Stage identity and personas.
//!
//! Each pipeline stage is served by a persona: a role, a goal and a
//! prompt template with `{placeholder}` slots. Personas are embedded at
//! compile time and loaded once into an immutable table, so prompt
//! content can change without touching orchestration code.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

const PERSONAS_YAML: &str = include_str!("personas.yaml");

/// The five pipeline stages, in execution order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StageName {
    Research,
    Write,
    FactCheck,
    Polish,
    Rubric,
}

impl StageName {
    pub fn as_str(self) -> &'static str {
        match self {
            StageName::Research => "research",
            StageName::Write => "write",
            StageName::FactCheck => "fact_check",
            StageName::Polish => "polish",
            StageName::Rubric => "rubric",
        }
    }

    /// Stages a feedback submission may target. The rubric stage only
    /// ever runs as part of the quality gate, never as an entry point.
    pub fn accepts_feedback(self) -> bool {
        !matches!(self, StageName::Rubric)
    }
}

impl fmt::Display for StageName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Error, PartialEq)]
#[error("Unknown stage '{0}' (expected research, write, fact_check or polish)")]
pub struct UnknownStage(pub String);

impl FromStr for StageName {
    type Err = UnknownStage;

    /// Accepts both stage names and the persona-style aliases callers
    /// of the HTTP era used ("researcher", "writer", ...).
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "research" | "researcher" => Ok(StageName::Research),
            "write" | "writer" => Ok(StageName::Write),
            "fact_check" | "fact-check" | "fact_checker" => Ok(StageName::FactCheck),
            "polish" | "style_editor" | "editor" => Ok(StageName::Polish),
            "rubric" | "grader" => Ok(StageName::Rubric),
            other => Err(UnknownStage(other.to_string())),
        }
    }
}

/// One stage's persona definition.
#[derive(Debug, Clone, Deserialize)]
pub struct StagePersona {
    pub role: String,
    pub goal: String,
    pub temperature: f64,
    pub prompt_template: String,
}

impl StagePersona {
    /// System message: who the model is and what it optimizes for.
    pub fn system_prompt(&self) -> String {
        format!("You are a {}. Your goal: {}", self.role, self.goal)
    }

    /// Fill the prompt template. Each `(key, value)` pair replaces every
    /// `{key}` occurrence; unknown placeholders are left as-is so a
    /// template typo surfaces in the prompt instead of panicking.
    pub fn render(&self, vars: &[(&str, &str)]) -> String {
        let mut prompt = self.prompt_template.clone();
        for (key, value) in vars {
            prompt = prompt.replace(&format!("{{{key}}}"), value);
        }
        prompt
    }
}

#[derive(Debug, Error)]
pub enum PersonaError {
    #[error("Failed to parse embedded persona definitions: {0}")]
    InvalidYaml(#[from] serde_yaml::Error),

    #[error("No persona defined for stage '{0}'")]
    MissingStage(StageName),
}

/// Immutable lookup of persona per stage, loaded once at startup.
#[derive(Debug, Clone)]
pub struct PersonaBook {
    personas: HashMap<StageName, StagePersona>,
}

impl PersonaBook {
    /// Load the embedded persona definitions, verifying every stage is
    /// covered.
    pub fn embedded() -> Result<Self, PersonaError> {
        Self::from_yaml(PERSONAS_YAML)
    }

    pub fn from_yaml(yaml: &str) -> Result<Self, PersonaError> {
        let personas: HashMap<StageName, StagePersona> = serde_yaml::from_str(yaml)?;
        for stage in [
            StageName::Research,
            StageName::Write,
            StageName::FactCheck,
            StageName::Polish,
            StageName::Rubric,
        ] {
            if !personas.contains_key(&stage) {
                return Err(PersonaError::MissingStage(stage));
            }
        }
        Ok(Self { personas })
    }

    pub fn get(&self, stage: StageName) -> &StagePersona {
        // Coverage is checked at load time, so every stage resolves.
        &self.personas[&stage]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn embedded_personas_load_and_cover_all_stages() {
        let book = PersonaBook::embedded().expect("embedded personas");
        for stage in [
            StageName::Research,
            StageName::Write,
            StageName::FactCheck,
            StageName::Polish,
            StageName::Rubric,
        ] {
            let persona = book.get(stage);
            assert!(!persona.role.is_empty());
            assert!(!persona.prompt_template.is_empty());
        }
    }

    #[test]
    fn stage_aliases_parse() {
        assert_eq!("researcher".parse::<StageName>(), Ok(StageName::Research));
        assert_eq!("writer".parse::<StageName>(), Ok(StageName::Write));
        assert_eq!(
            "fact_checker".parse::<StageName>(),
            Ok(StageName::FactCheck)
        );
        assert_eq!("style_editor".parse::<StageName>(), Ok(StageName::Polish));
        assert!("publisher".parse::<StageName>().is_err());
    }

    #[test]
    fn rubric_rejects_feedback() {
        assert!(StageName::Polish.accepts_feedback());
        assert!(!StageName::Rubric.accepts_feedback());
    }

    #[test]
    fn render_replaces_known_placeholders_only() {
        let persona = StagePersona {
            role: "Writer".to_string(),
            goal: "write".to_string(),
            temperature: 0.5,
            prompt_template: "Title: {title}. Tone: {tone}. Keep {unknown}.".to_string(),
        };
        let prompt = persona.render(&[("title", "Launch"), ("tone", "crisp")]);
        assert_eq!(prompt, "Title: Launch. Tone: crisp. Keep {unknown}.");
    }

    #[test]
    fn missing_stage_is_an_error() {
        let yaml = "research:\n  role: r\n  goal: g\n  temperature: 0.1\n  prompt_template: p\n";
        assert!(matches!(
            PersonaBook::from_yaml(yaml),
            Err(PersonaError::MissingStage(_))
        ));
    }
}
