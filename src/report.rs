use std::fmt::Write;

use crate::client::ConnectionStatus;
use crate::db::KeyValueStore;
use crate::models::{PredictionMethod, RiskLevel, StudentRecord, StudyTime, TestPrep};
use crate::risk;
use crate::store::PredictionStore;

#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct ScoreAverages {
    pub writing: f64,
    pub reading: f64,
    pub speaking: f64,
    pub english_avg: f64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Analytics {
    pub total_students: usize,
    pub risk_distribution: Vec<(RiskLevel, usize)>,
    pub averages: ScoreAverages,
    pub preparation_rate: f64,
    pub study_time_distribution: Vec<(StudyTime, usize)>,
    pub corrected_predictions: usize,
    pub method_counts: Vec<(PredictionMethod, usize)>,
}

impl Analytics {
    pub fn risk_count(&self, level: RiskLevel) -> usize {
        self.risk_distribution
            .iter()
            .find(|(candidate, _)| *candidate == level)
            .map(|(_, count)| *count)
            .unwrap_or(0)
    }
}

pub fn summarize<S: KeyValueStore>(store: &PredictionStore<S>) -> Analytics {
    let students = store.students();
    let total_students = students.len();

    let mut risk_distribution: Vec<(RiskLevel, usize)> =
        RiskLevel::ALL.iter().map(|level| (*level, 0)).collect();
    let mut study_time_distribution: Vec<(StudyTime, usize)> =
        StudyTime::ALL.iter().map(|bucket| (*bucket, 0)).collect();
    let mut totals = ScoreAverages::default();
    let mut prepared = 0usize;

    for student in students {
        let level = risk::risk_for_student(student, store.prediction(&student.id));
        bump(&mut risk_distribution, level);
        bump(&mut study_time_distribution, student.study_time_per_week);

        totals.writing += student.writing_score;
        totals.reading += student.reading_score;
        totals.speaking += student.speaking_score;
        totals.english_avg += student.recomputed_avg();

        if student.test_prep == TestPrep::Prepared {
            prepared += 1;
        }
    }

    let averages = if total_students == 0 {
        ScoreAverages::default()
    } else {
        let n = total_students as f64;
        ScoreAverages {
            writing: totals.writing / n,
            reading: totals.reading / n,
            speaking: totals.speaking / n,
            english_avg: totals.english_avg / n,
        }
    };

    let mut method_counts = vec![
        (PredictionMethod::RemoteModel, 0),
        (PredictionMethod::FallbackAlgorithm, 0),
        (PredictionMethod::Unknown, 0),
    ];
    let mut corrected_predictions = 0usize;
    for student in students {
        if let Some(prediction) = store.corrected_prediction(&student.id) {
            bump(&mut method_counts, prediction.prediction_method);
            if prediction.corrected {
                corrected_predictions += 1;
            }
        }
    }

    Analytics {
        total_students,
        risk_distribution,
        averages,
        preparation_rate: if total_students == 0 {
            0.0
        } else {
            prepared as f64 / total_students as f64
        },
        study_time_distribution,
        corrected_predictions,
        method_counts,
    }
}

fn bump<K: PartialEq>(counts: &mut [(K, usize)], key: K) {
    if let Some(entry) = counts.iter_mut().find(|(candidate, _)| *candidate == key) {
        entry.1 += 1;
    }
}

fn percentage(count: usize, total: usize) -> f64 {
    if total == 0 {
        0.0
    } else {
        count as f64 / total as f64 * 100.0
    }
}

pub fn build_report<S: KeyValueStore>(
    store: &PredictionStore<S>,
    connection: Option<&ConnectionStatus>,
) -> String {
    let analytics = summarize(store);
    let total = analytics.total_students;
    let mut output = String::new();

    let _ = writeln!(output, "# Student Risk Analytics Report");
    let _ = writeln!(output, "{} students evaluated", total);
    let _ = writeln!(output);

    let _ = writeln!(output, "## Risk Distribution");
    if total == 0 {
        let _ = writeln!(output, "No students recorded yet.");
    } else {
        for (level, count) in &analytics.risk_distribution {
            let _ = writeln!(
                output,
                "- {}: {} ({:.1}%)",
                level.label(),
                count,
                percentage(*count, total)
            );
        }
        if analytics.corrected_predictions > 0 {
            let _ = writeln!(
                output,
                "- {} stored predictions corrected against current thresholds",
                analytics.corrected_predictions
            );
        }
    }

    let _ = writeln!(output);
    let _ = writeln!(output, "## Score Averages");
    let _ = writeln!(output, "- Writing: {:.1}", analytics.averages.writing);
    let _ = writeln!(output, "- Reading: {:.1}", analytics.averages.reading);
    let _ = writeln!(output, "- Speaking: {:.1}", analytics.averages.speaking);
    let _ = writeln!(output, "- English average: {:.1}", analytics.averages.english_avg);

    let _ = writeln!(output);
    let _ = writeln!(output, "## Study Habits");
    let _ = writeln!(
        output,
        "- Test preparation rate: {:.1}%",
        analytics.preparation_rate * 100.0
    );
    for (bucket, count) in &analytics.study_time_distribution {
        let _ = writeln!(
            output,
            "- {}: {} students ({:.1}%)",
            bucket.label(),
            count,
            percentage(*count, total)
        );
    }

    let _ = writeln!(output);
    let _ = writeln!(output, "## Prediction Sources");
    for (method, count) in &analytics.method_counts {
        let _ = writeln!(output, "- {}: {}", method.label(), count);
    }

    let _ = writeln!(output);
    let _ = writeln!(output, "## Key Insights");
    let _ = writeln!(
        output,
        "- {} students are at risk and may need additional support",
        analytics.risk_count(RiskLevel::AtRisk)
    );
    let _ = writeln!(
        output,
        "- Average English score is {:.1}/100, indicating {} overall performance",
        analytics.averages.english_avg,
        if analytics.averages.english_avg >= 70.0 {
            "good"
        } else {
            "room for improvement in"
        }
    );
    let remote_mode = connection.is_some_and(|status| status.connected);
    let _ = writeln!(
        output,
        "- Running in {}",
        if remote_mode {
            "remote model mode: predictions come from the trained service"
        } else {
            "local mode: predictions come from the fallback classifier"
        }
    );

    let _ = writeln!(output);
    let _ = writeln!(output, "## Most Recent Evaluations");
    let recent = history_lines(store, 5);
    if recent.is_empty() {
        let _ = writeln!(output, "No students recorded yet.");
    } else {
        for line in recent {
            let _ = writeln!(output, "{}", line);
        }
    }

    if let Some(status) = connection {
        let _ = writeln!(output);
        let _ = writeln!(output, "## Backend Status");
        if status.connected {
            let _ = writeln!(output, "Connected to {}", status.url);
        } else {
            let _ = writeln!(
                output,
                "Offline ({}): {}; predictions use the local fallback",
                status.url,
                status.error.as_deref().unwrap_or("unknown error")
            );
        }
    }

    output
}

/// History rows, newest first.
pub fn history_lines<S: KeyValueStore>(store: &PredictionStore<S>, limit: usize) -> Vec<String> {
    store
        .students_by_recency()
        .into_iter()
        .take(limit)
        .map(|student| {
            let (level, confidence) = match store.corrected_prediction(&student.id) {
                Some(prediction) => (prediction.risk_level, Some(prediction.confidence)),
                None => (risk::risk_level_for(student.recomputed_avg()), None),
            };
            let confidence = confidence
                .map(|value| format!("{:.0}%", value * 100.0))
                .unwrap_or_else(|| "no prediction".to_string());

            format!(
                "- {} ({}) on {}: avg {:.1}, {} ({})",
                student.name,
                student.id,
                student.created_at.format("%Y-%m-%d"),
                student.recomputed_avg(),
                level.label(),
                confidence
            )
        })
        .collect()
}

/// Detailed result for one student, or `None` when the student is unknown.
pub fn result_view<S: KeyValueStore>(store: &PredictionStore<S>, student_id: &str) -> Option<String> {
    let student = store.student(student_id)?;
    let mut output = String::new();

    let _ = writeln!(output, "# {}", student.name);
    write_scores(&mut output, student);
    let _ = writeln!(output);

    let Some(prediction) = store.corrected_prediction(student_id) else {
        let _ = writeln!(output, "No prediction stored for this student.");
        return Some(output);
    };

    let _ = writeln!(
        output,
        "Risk level: {}{}",
        prediction.risk_level.label(),
        if prediction.corrected { " (corrected)" } else { "" }
    );
    let _ = writeln!(output, "Confidence: {:.0}%", prediction.confidence * 100.0);
    let _ = writeln!(output, "Source: {}", prediction.prediction_method.label());
    let _ = writeln!(output);
    let _ = writeln!(output, "## Probabilities");
    for level in RiskLevel::ALL {
        let _ = writeln!(
            output,
            "- {}: {:.1}%",
            level.label(),
            prediction.probabilities.get(*level) * 100.0
        );
    }

    let _ = writeln!(output);
    let _ = writeln!(output, "## Key Factors");
    for factor in prediction.factors_or_default(student).iter().take(5) {
        let _ = writeln!(
            output,
            "- {} = {} (impact {:+.2}): {}",
            factor.name, factor.value, factor.impact, factor.explanation
        );
    }

    let _ = writeln!(output);
    let _ = writeln!(output, "## Recommendations");
    for (index, item) in prediction
        .recommendations_or_default(student)
        .iter()
        .enumerate()
    {
        let _ = writeln!(output, "{}. {}", index + 1, item);
    }

    Some(output)
}

fn write_scores(output: &mut String, student: &StudentRecord) {
    let _ = writeln!(
        output,
        "Age {}, {}, {}; studies {} per week; absences: {}; {}",
        student.age,
        student.gender.label(),
        student.student_education.label(),
        student.study_time_per_week.label(),
        student.absences.label(),
        student.test_prep.label()
    );
    let _ = writeln!(
        output,
        "Writing {:.0} | Reading {:.0} | Speaking {:.0} | Average {:.1}/100",
        student.writing_score,
        student.reading_score,
        student.speaking_score,
        student.recomputed_avg()
    );
}
