use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{FieldError, ValidationError};

/// Declares a string-backed enum whose wire form is shared by serde, the CLI
/// parser and `Display`.
macro_rules! wire_enum {
    (
        $(#[$meta:meta])*
        pub enum $name:ident {
            $($variant:ident => $wire:literal, $label:literal;)+
        }
    ) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        pub enum $name {
            $(
                #[serde(rename = $wire)]
                $variant,
            )+
        }

        impl $name {
            pub const ALL: &'static [$name] = &[$($name::$variant),+];

            pub fn as_str(&self) -> &'static str {
                match self {
                    $($name::$variant => $wire,)+
                }
            }

            pub fn label(&self) -> &'static str {
                match self {
                    $($name::$variant => $label,)+
                }
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(self.as_str())
            }
        }

        impl FromStr for $name {
            type Err = String;

            fn from_str(value: &str) -> Result<Self, Self::Err> {
                let value = value.trim();
                $name::ALL
                    .iter()
                    .copied()
                    .find(|candidate| candidate.as_str().eq_ignore_ascii_case(value))
                    .ok_or_else(|| {
                        let expected: Vec<&str> = $name::ALL.iter().map(|v| v.as_str()).collect();
                        format!("unknown value '{}', expected one of {}", value, expected.join(", "))
                    })
            }
        }
    };
}

wire_enum! {
    pub enum Gender {
        Male => "male", "Male";
        Female => "female", "Female";
    }
}

wire_enum! {
    pub enum Education {
        Secondary => "secondary", "Secondary";
        Bachelors => "bachelors", "Bachelor's";
        Masters => "masters", "Master's";
        Doctorate => "doctorate", "Doctorate";
    }
}

wire_enum! {
    pub enum StudyTime {
        LessThan2 => "less_than_2", "< 2 hours";
        TwoToFive => "2_to_5", "2-5 hours";
        FiveToTen => "5_to_10", "5-10 hours";
        MoreThan10 => "more_than_10", "> 10 hours";
    }
}

wire_enum! {
    pub enum Absences {
        None => "none", "None";
        OneToFive => "1_to_5", "1-5 days";
        SixToTen => "6_to_10", "6-10 days";
        MoreThan10 => "more_than_10", "> 10 days";
    }
}

wire_enum! {
    pub enum TestPrep {
        Prepared => "prepared", "Prepared";
        NotPrepared => "not_prepared", "Not Prepared";
    }
}

wire_enum! {
    /// Ordinal outcome class: `AtRisk < Satisfactory < HighAchiever`.
    pub enum RiskLevel {
        AtRisk => "at_risk", "At Risk";
        Satisfactory => "satisfactory", "Satisfactory";
        HighAchiever => "high_achiever", "High Achiever";
    }
}

impl Default for TestPrep {
    fn default() -> Self {
        TestPrep::NotPrepared
    }
}

/// Which computation produced a prediction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PredictionMethod {
    #[serde(rename = "real_ml_model")]
    RemoteModel,
    #[serde(rename = "fallback_algorithm")]
    FallbackAlgorithm,
    #[default]
    #[serde(other)]
    Unknown,
}

impl PredictionMethod {
    pub fn label(&self) -> &'static str {
        match self {
            PredictionMethod::RemoteModel => "remote model",
            PredictionMethod::FallbackAlgorithm => "local fallback",
            PredictionMethod::Unknown => "unknown",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct StudentRecord {
    pub id: String,
    pub name: String,
    pub age: u8,
    pub gender: Gender,
    pub student_education: Education,
    pub study_time_per_week: StudyTime,
    pub absences: Absences,
    #[serde(default)]
    pub test_prep: TestPrep,
    pub writing_score: f64,
    pub reading_score: f64,
    pub speaking_score: f64,
    pub english_avg: f64,
    #[serde(default)]
    pub extra_curricular: bool,
    #[serde(default)]
    pub internet_access: bool,
    #[serde(default)]
    pub tutoring: bool,
    pub created_at: DateTime<Utc>,
}

impl StudentRecord {
    pub fn from_draft(draft: NewStudent, now: DateTime<Utc>) -> Result<Self, ValidationError> {
        draft.validate()?;

        let english_avg = crate::risk::english_average(
            draft.writing_score,
            draft.reading_score,
            draft.speaking_score,
        );

        Ok(Self {
            id: Uuid::now_v7().to_string(),
            name: draft.name.trim().to_string(),
            age: draft.age as u8,
            gender: draft.gender,
            student_education: draft.student_education,
            study_time_per_week: draft.study_time_per_week,
            absences: draft.absences,
            test_prep: draft.test_prep,
            writing_score: draft.writing_score,
            reading_score: draft.reading_score,
            speaking_score: draft.speaking_score,
            english_avg: (english_avg * 100.0).round() / 100.0,
            extra_curricular: draft.extra_curricular,
            internet_access: draft.internet_access,
            tutoring: draft.tutoring,
            created_at: now,
        })
    }

    /// Mean of the three sub-scores, ignoring the persisted `english_avg`.
    pub fn recomputed_avg(&self) -> f64 {
        crate::risk::english_average(self.writing_score, self.reading_score, self.speaking_score)
    }
}

/// Form input for a student before an identifier is assigned.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewStudent {
    pub name: String,
    pub age: i64,
    pub gender: Gender,
    pub student_education: Education,
    pub study_time_per_week: StudyTime,
    pub absences: Absences,
    #[serde(default)]
    pub test_prep: TestPrep,
    pub writing_score: f64,
    pub reading_score: f64,
    pub speaking_score: f64,
    #[serde(default)]
    pub extra_curricular: bool,
    #[serde(default)]
    pub internet_access: bool,
    #[serde(default)]
    pub tutoring: bool,
}

impl NewStudent {
    pub fn validate(&self) -> Result<(), ValidationError> {
        let mut errors = Vec::new();

        if self.name.trim().is_empty() {
            errors.push(FieldError::new("name", "name is required"));
        }
        if !(5..=100).contains(&self.age) {
            errors.push(FieldError::new("age", "age must be between 5 and 100"));
        }

        let scores = [
            ("writingScore", self.writing_score),
            ("readingScore", self.reading_score),
            ("speakingScore", self.speaking_score),
        ];
        for (field, score) in scores {
            if !score.is_finite() || !(0.0..=100.0).contains(&score) {
                errors.push(FieldError::new(field, "score must be between 0 and 100"));
            }
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(ValidationError { errors })
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Probabilities {
    pub at_risk: f64,
    pub satisfactory: f64,
    pub high_achiever: f64,
}

impl Probabilities {
    #[cfg(test)]
    pub fn sum(&self) -> f64 {
        self.at_risk + self.satisfactory + self.high_achiever
    }

    pub fn get(&self, level: RiskLevel) -> f64 {
        match level {
            RiskLevel::AtRisk => self.at_risk,
            RiskLevel::Satisfactory => self.satisfactory,
            RiskLevel::HighAchiever => self.high_achiever,
        }
    }
}

/// One contributing factor shown next to a prediction.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Factor {
    pub name: String,
    pub value: String,
    pub impact: f64,
    #[serde(default)]
    pub explanation: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub percentage: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub details: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PredictionRecord {
    pub student_id: String,
    pub risk_level: RiskLevel,
    pub probabilities: Probabilities,
    pub confidence: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub factors: Option<Vec<Factor>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub recommendations: Option<Vec<String>>,
    #[serde(default)]
    pub prediction_method: PredictionMethod,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub english_average: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model_version: Option<String>,
    #[serde(default)]
    pub corrected: bool,
    pub created_at: DateTime<Utc>,
}

impl PredictionRecord {
    pub fn factors_or_default(&self, student: &StudentRecord) -> Vec<Factor> {
        match &self.factors {
            Some(factors) if !factors.is_empty() => factors.clone(),
            _ => crate::risk::default_factors(student),
        }
    }

    pub fn recommendations_or_default(&self, student: &StudentRecord) -> Vec<String> {
        match &self.recommendations {
            Some(items) if !items.is_empty() => items.clone(),
            _ => crate::risk::default_recommendations(student),
        }
    }
}
