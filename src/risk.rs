use chrono::{DateTime, Utc};
use tracing::debug;

use crate::models::{
    Factor, PredictionMethod, PredictionRecord, Probabilities, RiskLevel, StudentRecord, TestPrep,
};

pub const HIGH_ACHIEVER_THRESHOLD: f64 = 80.0;
pub const SATISFACTORY_THRESHOLD: f64 = 60.0;
pub const FALLBACK_MODEL_VERSION: &str = "1.0";

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Classification {
    pub risk_level: RiskLevel,
    pub probabilities: Probabilities,
    pub confidence: f64,
}

pub fn english_average(writing: f64, reading: f64, speaking: f64) -> f64 {
    (writing + reading + speaking) / 3.0
}

/// Maps an English average to a risk level, a fixed probability triple and a
/// banded confidence. Out-of-range input is not rejected.
pub fn classify(avg: f64) -> Classification {
    let risk_level = risk_level_for(avg);

    Classification {
        risk_level,
        probabilities: probabilities_for(avg),
        confidence: confidence_for(risk_level, avg),
    }
}

pub fn risk_level_for(avg: f64) -> RiskLevel {
    if avg >= HIGH_ACHIEVER_THRESHOLD {
        RiskLevel::HighAchiever
    } else if avg >= SATISFACTORY_THRESHOLD {
        RiskLevel::Satisfactory
    } else {
        RiskLevel::AtRisk
    }
}

pub fn probabilities_for(avg: f64) -> Probabilities {
    let (at_risk, satisfactory, high_achiever) = if avg >= HIGH_ACHIEVER_THRESHOLD {
        (0.05, 0.25, 0.70)
    } else if avg >= 70.0 {
        (0.15, 0.70, 0.15)
    } else if avg >= SATISFACTORY_THRESHOLD {
        (0.30, 0.60, 0.10)
    } else {
        (0.70, 0.25, 0.05)
    };

    Probabilities {
        at_risk,
        satisfactory,
        high_achiever,
    }
}

/// Confidence grows with distance from the nearest threshold, bounded per band.
pub fn confidence_for(risk_level: RiskLevel, avg: f64) -> f64 {
    match risk_level {
        RiskLevel::HighAchiever => {
            (0.85 + (avg - HIGH_ACHIEVER_THRESHOLD) / 20.0 * 0.10).clamp(0.85, 0.95)
        }
        RiskLevel::Satisfactory => {
            let distance = (avg - SATISFACTORY_THRESHOLD)
                .min(HIGH_ACHIEVER_THRESHOLD - avg)
                .max(0.0);
            (0.70 + distance / 10.0 * 0.15).clamp(0.70, 0.85)
        }
        RiskLevel::AtRisk => {
            (0.65 + (SATISFACTORY_THRESHOLD - avg) / 60.0 * 0.30).clamp(0.65, 0.95)
        }
    }
}

/// Local prediction used whenever the remote service is unavailable.
pub fn fallback_prediction(student: &StudentRecord, now: DateTime<Utc>) -> PredictionRecord {
    let avg = student.recomputed_avg();
    let classification = classify(avg);

    PredictionRecord {
        student_id: student.id.clone(),
        risk_level: classification.risk_level,
        probabilities: classification.probabilities,
        confidence: classification.confidence,
        factors: None,
        recommendations: None,
        prediction_method: PredictionMethod::FallbackAlgorithm,
        english_average: Some(avg),
        model_version: Some(FALLBACK_MODEL_VERSION.to_string()),
        corrected: false,
        created_at: now,
    }
}

/// Upgrades a stored `at_risk` prediction whose student's scores now reach the
/// satisfactory threshold. Never downgrades.
pub fn correct_prediction_if_wrong(
    mut prediction: PredictionRecord,
    student: &StudentRecord,
) -> PredictionRecord {
    if prediction.risk_level != RiskLevel::AtRisk {
        return prediction;
    }

    let avg = student.recomputed_avg();
    if avg < SATISFACTORY_THRESHOLD {
        return prediction;
    }

    let classification = classify(avg);
    debug!(
        student = %student.name,
        student_id = %student.id,
        avg,
        stored = %prediction.risk_level,
        corrected = %classification.risk_level,
        "correcting stale prediction"
    );

    prediction.risk_level = classification.risk_level;
    prediction.confidence = classification.confidence;
    prediction.corrected = true;
    prediction
}

/// The risk level every view should display for a student.
pub fn risk_for_student(student: &StudentRecord, prediction: Option<&PredictionRecord>) -> RiskLevel {
    match prediction {
        Some(prediction) => correct_prediction_if_wrong(prediction.clone(), student).risk_level,
        None => risk_level_for(student.recomputed_avg()),
    }
}

pub fn default_factors(student: &StudentRecord) -> Vec<Factor> {
    let avg = student.recomputed_avg();
    let prepared = student.test_prep == TestPrep::Prepared;

    vec![
        Factor {
            name: "English Average Score".to_string(),
            value: format!("{:.1}/100", avg),
            impact: (avg - 70.0) / 100.0,
            explanation: if avg >= 70.0 {
                "Good overall performance indicates satisfactory progress".to_string()
            } else {
                "Average score suggests need for additional support".to_string()
            },
            percentage: Some("Primary Factor".to_string()),
            details: None,
        },
        Factor {
            name: "Test Preparation".to_string(),
            value: student.test_prep.label().to_string(),
            impact: if prepared { 0.15 } else { -0.15 },
            explanation: if prepared {
                "Preparation contributes positively to performance".to_string()
            } else {
                "Lack of preparation may affect test results".to_string()
            },
            percentage: Some("Important Factor".to_string()),
            details: None,
        },
    ]
}

pub fn default_recommendations(student: &StudentRecord) -> Vec<String> {
    let avg = student.recomputed_avg();

    vec![
        if avg < 70.0 {
            "Consider additional English tutoring sessions".to_string()
        } else {
            "Continue current study patterns".to_string()
        },
        if student.reading_score < 70.0 {
            "Focus on reading comprehension exercises".to_string()
        } else {
            "Maintain reading practice".to_string()
        },
        "Regular practice tests to track progress".to_string(),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::fixtures::{prediction, student};

    #[test]
    fn thresholds_follow_expected_bands() {
        for avg in [80.0, 85.5, 100.0] {
            assert_eq!(classify(avg).risk_level, RiskLevel::HighAchiever, "avg {avg}");
        }
        for avg in [60.0, 70.0, 79.99] {
            assert_eq!(classify(avg).risk_level, RiskLevel::Satisfactory, "avg {avg}");
        }
        for avg in [0.0, 35.0, 59.99] {
            assert_eq!(classify(avg).risk_level, RiskLevel::AtRisk, "avg {avg}");
        }
    }

    #[test]
    fn probabilities_sum_to_one_in_every_band() {
        for avg in [95.0, 75.0, 65.0, 20.0] {
            let sum = classify(avg).probabilities.sum();
            assert!((sum - 1.0).abs() < 1e-9, "avg {avg} sums to {sum}");
        }
    }

    #[test]
    fn high_scores_match_known_example() {
        let record = student("s-1", 90.0, 85.0, 95.0);
        assert_eq!(record.recomputed_avg(), 90.0);

        let result = classify(record.recomputed_avg());
        assert_eq!(result.risk_level, RiskLevel::HighAchiever);
        assert_eq!(
            result.probabilities,
            Probabilities {
                at_risk: 0.05,
                satisfactory: 0.25,
                high_achiever: 0.70
            }
        );
    }

    #[test]
    fn confidence_stays_within_band_bounds() {
        for step in 0..=1000 {
            let avg = step as f64 / 10.0;
            let result = classify(avg);
            let (low, high) = match result.risk_level {
                RiskLevel::HighAchiever => (0.85, 0.95),
                RiskLevel::Satisfactory => (0.70, 0.85),
                RiskLevel::AtRisk => (0.65, 0.95),
            };
            assert!(
                result.confidence >= low && result.confidence <= high,
                "avg {avg} confidence {}",
                result.confidence
            );
        }
        assert!(classify(70.0).confidence > classify(61.0).confidence);
        assert!(classify(70.0).confidence > classify(79.0).confidence);
    }

    #[test]
    fn stale_at_risk_prediction_is_upgraded() {
        let record = student("s-2", 82.0, 82.0, 82.0);
        let stored = prediction("s-2", RiskLevel::AtRisk, 0.7);

        let repaired = correct_prediction_if_wrong(stored, &record);
        assert_eq!(repaired.risk_level, RiskLevel::HighAchiever);
        assert!(repaired.corrected);
        assert_eq!(repaired.confidence, classify(82.0).confidence);
    }

    #[test]
    fn satisfactory_band_upgrade_uses_satisfactory() {
        let record = student("s-3", 65.0, 62.0, 68.0);
        let repaired =
            correct_prediction_if_wrong(prediction("s-3", RiskLevel::AtRisk, 0.7), &record);
        assert_eq!(repaired.risk_level, RiskLevel::Satisfactory);
        assert!(repaired.corrected);
    }

    #[test]
    fn repair_is_idempotent() {
        let record = student("s-4", 75.0, 80.0, 70.0);
        let once = correct_prediction_if_wrong(prediction("s-4", RiskLevel::AtRisk, 0.7), &record);
        let twice = correct_prediction_if_wrong(once.clone(), &record);
        assert_eq!(once, twice);
    }

    #[test]
    fn repair_never_downgrades() {
        let weak = student("s-5", 20.0, 30.0, 25.0);
        for level in [RiskLevel::Satisfactory, RiskLevel::HighAchiever] {
            let stored = prediction("s-5", level, 0.9);
            let repaired = correct_prediction_if_wrong(stored.clone(), &weak);
            assert_eq!(repaired, stored);
        }

        let still_weak =
            correct_prediction_if_wrong(prediction("s-5", RiskLevel::AtRisk, 0.7), &weak);
        assert_eq!(still_weak.risk_level, RiskLevel::AtRisk);
        assert!(!still_weak.corrected);
    }

    #[test]
    fn repair_recomputes_average_from_scores() {
        let mut record = student("s-6", 85.0, 85.0, 85.0);
        record.english_avg = 40.0;
        let repaired =
            correct_prediction_if_wrong(prediction("s-6", RiskLevel::AtRisk, 0.7), &record);
        assert_eq!(repaired.risk_level, RiskLevel::HighAchiever);
    }

    #[test]
    fn fallback_prediction_is_tagged_local() {
        let record = student("s-7", 55.0, 50.0, 45.0);
        let result = fallback_prediction(&record, record.created_at);
        assert_eq!(result.student_id, "s-7");
        assert_eq!(result.risk_level, RiskLevel::AtRisk);
        assert_eq!(result.prediction_method, PredictionMethod::FallbackAlgorithm);
        assert_eq!(result.english_average, Some(50.0));
    }

    #[test]
    fn missing_prediction_uses_classifier() {
        let record = student("s-8", 72.0, 74.0, 70.0);
        assert_eq!(risk_for_student(&record, None), RiskLevel::Satisfactory);
    }

    #[test]
    fn default_explanations_reflect_scores() {
        let record = student("s-9", 65.0, 60.0, 62.0);
        let factors = default_factors(&record);
        assert_eq!(factors.len(), 2);
        assert_eq!(factors[0].value, "62.3/100");
        assert!(factors[0].impact < 0.0);
        assert_eq!(factors[1].impact, 0.15);

        let recommendations = default_recommendations(&record);
        assert_eq!(recommendations[0], "Consider additional English tutoring sessions");
        assert_eq!(recommendations[1], "Focus on reading comprehension exercises");
    }
}
