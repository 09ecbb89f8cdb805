use std::collections::BTreeMap;

use chrono::Utc;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::client::Predictor;
use crate::db::{KeyValueStore, PREDICTIONS_KEY, STUDENTS_KEY};
use crate::error::{StorageError, SubmitError};
use crate::models::{NewStudent, PredictionRecord, StudentRecord};
use crate::risk::correct_prediction_if_wrong;

/// Outcome of a bulk repair pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RepairSummary {
    pub examined: usize,
    pub corrected: usize,
    pub pruned: usize,
}

/// Students and their latest predictions, mirrored to a key-value store.
///
/// Every mutation builds the new collection, persists it, and only then
/// replaces the in-memory copy, so a failed write leaves the store as it was.
/// Deleting a student touches both collections and rolls back the first write
/// if the second one fails.
pub struct PredictionStore<S> {
    storage: S,
    students: Vec<StudentRecord>,
    predictions: BTreeMap<String, PredictionRecord>,
}

impl<S: KeyValueStore> PredictionStore<S> {
    /// Reads both collections, repairing stale predictions. Unreadable entries
    /// are logged and treated as empty.
    pub async fn load(storage: S) -> Self {
        let students: Vec<StudentRecord> = read_collection(&storage, STUDENTS_KEY).await;
        let stored: BTreeMap<String, PredictionRecord> =
            read_collection(&storage, PREDICTIONS_KEY).await;

        let mut corrected = 0usize;
        let predictions: BTreeMap<String, PredictionRecord> = stored
            .into_iter()
            .map(|(student_id, prediction)| {
                let prediction = match students.iter().find(|s| s.id == student_id) {
                    Some(student) => {
                        let repaired = correct_prediction_if_wrong(prediction.clone(), student);
                        if repaired != prediction {
                            corrected += 1;
                        }
                        repaired
                    }
                    None => prediction,
                };
                (student_id, prediction)
            })
            .collect();

        let store = Self {
            storage,
            students,
            predictions,
        };

        if corrected > 0 {
            info!(corrected, "repaired stale predictions on load");
            // Corrections stay in memory even if the write-back fails.
            let _ = store.write_predictions(&store.predictions).await;
        }

        debug!(
            students = store.students.len(),
            predictions = store.predictions.len(),
            "prediction store loaded"
        );
        store
    }

    pub fn students(&self) -> &[StudentRecord] {
        &self.students
    }

    /// History order: newest first.
    pub fn students_by_recency(&self) -> Vec<&StudentRecord> {
        let mut students: Vec<&StudentRecord> = self.students.iter().collect();
        students.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        students
    }

    #[cfg(test)]
    pub fn predictions(&self) -> &BTreeMap<String, PredictionRecord> {
        &self.predictions
    }

    pub fn student(&self, id: &str) -> Option<&StudentRecord> {
        self.students.iter().find(|student| student.id == id)
    }

    /// The stored prediction, possibly stale.
    pub fn prediction(&self, student_id: &str) -> Option<&PredictionRecord> {
        self.predictions.get(student_id)
    }

    pub fn corrected_prediction(&self, student_id: &str) -> Option<PredictionRecord> {
        let prediction = self.predictions.get(student_id)?;
        match self.student(student_id) {
            Some(student) => Some(correct_prediction_if_wrong(prediction.clone(), student)),
            None => Some(prediction.clone()),
        }
    }

    pub async fn add_student(&mut self, student: StudentRecord) -> Result<(), StorageError> {
        let mut students = self.students.clone();
        match students.iter_mut().find(|existing| existing.id == student.id) {
            Some(existing) => *existing = student,
            None => students.push(student),
        }

        self.write_students(&students).await?;
        self.students = students;
        Ok(())
    }

    /// Stores `prediction` as the latest for its student, repaired against the
    /// student's scores when the student is known.
    pub async fn add_prediction(
        &mut self,
        prediction: PredictionRecord,
    ) -> Result<PredictionRecord, StorageError> {
        let original_risk = prediction.risk_level;
        let stored = match self.student(&prediction.student_id) {
            Some(student) => correct_prediction_if_wrong(prediction, student),
            None => prediction,
        };

        let mut predictions = self.predictions.clone();
        predictions.insert(stored.student_id.clone(), stored.clone());
        self.write_predictions(&predictions).await?;
        self.predictions = predictions;

        info!(
            student_id = %stored.student_id,
            risk = %stored.risk_level,
            original_risk = %original_risk,
            confidence = stored.confidence,
            corrected = stored.corrected,
            "prediction saved"
        );
        Ok(stored)
    }

    pub async fn add_student_with_prediction(
        &mut self,
        student: StudentRecord,
        prediction: PredictionRecord,
    ) -> Result<PredictionRecord, StorageError> {
        self.add_student(student).await?;
        self.add_prediction(prediction).await
    }

    /// Validates the draft, stores the student, predicts, and stores the
    /// prediction.
    pub async fn submit(
        &mut self,
        draft: NewStudent,
        predictor: &Predictor,
    ) -> Result<(StudentRecord, PredictionRecord), SubmitError> {
        let student = StudentRecord::from_draft(draft, Utc::now())?;
        self.add_student(student.clone()).await?;

        let prediction = predictor.predict(&student).await;
        let stored = self.add_prediction(prediction).await?;
        Ok((student, stored))
    }

    /// Removes the student and its prediction. Returns whether anything was
    /// removed. On failure both collections are left as they were.
    pub async fn delete_student(&mut self, id: &str) -> Result<bool, StorageError> {
        let students: Vec<StudentRecord> = self
            .students
            .iter()
            .filter(|student| student.id != id)
            .cloned()
            .collect();
        let mut predictions = self.predictions.clone();
        let removed_prediction = predictions.remove(id).is_some();
        let removed_student = students.len() != self.students.len();

        if !removed_student && !removed_prediction {
            return Ok(false);
        }

        self.write_students(&students).await?;
        if let Err(err) = self.write_predictions(&predictions).await {
            if let Err(restore) = self.write_students(&self.students).await {
                warn!(student_id = id, error = %restore, "failed to restore students after aborted delete");
            }
            return Err(err);
        }

        self.students = students;
        self.predictions = predictions;
        info!(student_id = id, "student deleted");
        Ok(true)
    }

    /// Repairs every prediction of a known student and drops predictions
    /// whose student no longer exists.
    pub async fn fix_all_predictions(&mut self) -> Result<RepairSummary, StorageError> {
        let mut summary = RepairSummary::default();
        let mut predictions = BTreeMap::new();

        for student in &self.students {
            let Some(prediction) = self.predictions.get(&student.id) else {
                continue;
            };
            summary.examined += 1;

            let repaired = correct_prediction_if_wrong(prediction.clone(), student);
            if repaired != *prediction {
                summary.corrected += 1;
                info!(
                    student = %student.name,
                    from = %prediction.risk_level,
                    to = %repaired.risk_level,
                    "fixed prediction"
                );
            }
            predictions.insert(student.id.clone(), repaired);
        }
        summary.pruned = self.predictions.len().saturating_sub(predictions.len());

        self.write_predictions(&predictions).await?;
        self.predictions = predictions;
        Ok(summary)
    }

    /// Deletes both collections from storage.
    pub async fn clear(&mut self) -> Result<(), StorageError> {
        self.storage.delete(STUDENTS_KEY).await?;
        self.students.clear();
        self.storage.delete(PREDICTIONS_KEY).await?;
        self.predictions.clear();
        Ok(())
    }

    #[cfg(test)]
    pub fn into_storage(self) -> S {
        self.storage
    }

    async fn write_students(&self, students: &[StudentRecord]) -> Result<(), StorageError> {
        write_collection(&self.storage, STUDENTS_KEY, students).await
    }

    async fn write_predictions(
        &self,
        predictions: &BTreeMap<String, PredictionRecord>,
    ) -> Result<(), StorageError> {
        write_collection(&self.storage, PREDICTIONS_KEY, predictions).await
    }
}

async fn read_collection<S, T>(storage: &S, key: &'static str) -> T
where
    S: KeyValueStore,
    T: DeserializeOwned + Default,
{
    let json = match storage.get(key).await {
        Ok(Some(json)) => json,
        Ok(None) => return T::default(),
        Err(err) => {
            warn!(key, error = %err, "failed to read collection");
            return T::default();
        }
    };

    match serde_json::from_str(&json) {
        Ok(value) => value,
        Err(source) => {
            let err = StorageError::Serialization { key, source };
            warn!(key, error = %err, "discarding unreadable collection");
            T::default()
        }
    }
}

async fn write_collection<S, T>(storage: &S, key: &'static str, value: &T) -> Result<(), StorageError>
where
    S: KeyValueStore,
    T: Serialize + ?Sized,
{
    let json = serde_json::to_string(value).map_err(|source| {
        let err = StorageError::Serialization { key, source };
        warn!(key, error = %err, "failed to encode collection");
        err
    })?;

    storage.set(key, &json).await.map_err(|err| {
        warn!(key, error = %err, "failed to save collection");
        err
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::{MemoryStorage, SqliteStorage};
    use crate::models::fixtures::{draft, prediction, student};
    use crate::models::{PredictionMethod, RiskLevel};

    async fn seeded_storage(
        students: &[StudentRecord],
        predictions: &[PredictionRecord],
    ) -> MemoryStorage {
        let storage = MemoryStorage::new();
        let by_id: BTreeMap<&str, &PredictionRecord> = predictions
            .iter()
            .map(|p| (p.student_id.as_str(), p))
            .collect();
        storage
            .set(STUDENTS_KEY, &serde_json::to_string(students).unwrap())
            .await
            .unwrap();
        storage
            .set(PREDICTIONS_KEY, &serde_json::to_string(&by_id).unwrap())
            .await
            .unwrap();
        storage
    }

    #[tokio::test]
    async fn load_repairs_and_writes_back_stale_predictions() {
        let strong = student("s-1", 82.0, 82.0, 82.0);
        let weak = student("s-2", 40.0, 45.0, 50.0);
        let storage = seeded_storage(
            &[strong.clone(), weak.clone()],
            &[
                prediction("s-1", RiskLevel::AtRisk, 0.7),
                prediction("s-2", RiskLevel::AtRisk, 0.7),
            ],
        )
        .await;

        let store = PredictionStore::load(storage).await;
        let repaired = store.prediction("s-1").unwrap();
        assert_eq!(repaired.risk_level, RiskLevel::HighAchiever);
        assert!(repaired.corrected);
        assert_eq!(store.prediction("s-2").unwrap().risk_level, RiskLevel::AtRisk);

        let reloaded = PredictionStore::load(store.into_storage()).await;
        assert!(reloaded.prediction("s-1").unwrap().corrected);
    }

    #[tokio::test]
    async fn unreadable_collections_load_as_empty() {
        let storage = MemoryStorage::new();
        storage.set(STUDENTS_KEY, "not json").await.unwrap();
        storage.set(PREDICTIONS_KEY, "[1, 2").await.unwrap();

        let store = PredictionStore::load(storage).await;
        assert!(store.students().is_empty());
        assert!(store.predictions().is_empty());
    }

    #[tokio::test]
    async fn add_prediction_is_last_write_wins_and_repaired() {
        let mut store = PredictionStore::load(MemoryStorage::new()).await;
        store.add_student(student("s-3", 70.0, 70.0, 70.0)).await.unwrap();

        store
            .add_prediction(prediction("s-3", RiskLevel::HighAchiever, 0.9))
            .await
            .unwrap();
        let stored = store
            .add_prediction(prediction("s-3", RiskLevel::AtRisk, 0.7))
            .await
            .unwrap();

        assert_eq!(stored.risk_level, RiskLevel::Satisfactory);
        assert!(stored.corrected);
        assert_eq!(store.predictions().len(), 1);
        assert_eq!(store.prediction("s-3"), Some(&stored));
    }

    #[tokio::test]
    async fn corrected_prediction_does_not_mutate_raw_record() {
        let mut store = PredictionStore::load(MemoryStorage::new()).await;
        // The student is unknown at write time, so the stale label is kept.
        store
            .add_prediction(prediction("s-4", RiskLevel::AtRisk, 0.7))
            .await
            .unwrap();
        store.add_student(student("s-4", 90.0, 90.0, 90.0)).await.unwrap();

        assert_eq!(store.prediction("s-4").unwrap().risk_level, RiskLevel::AtRisk);
        let corrected = store.corrected_prediction("s-4").unwrap();
        assert_eq!(corrected.risk_level, RiskLevel::HighAchiever);
        assert!(corrected.corrected);
        assert_eq!(store.prediction("s-4").unwrap().risk_level, RiskLevel::AtRisk);

        let summary = store.fix_all_predictions().await.unwrap();
        assert_eq!(
            summary,
            RepairSummary {
                examined: 1,
                corrected: 1,
                pruned: 0
            }
        );
        assert_eq!(store.prediction("s-4").unwrap().risk_level, RiskLevel::HighAchiever);
    }

    #[tokio::test]
    async fn fix_all_prunes_orphaned_predictions() {
        let storage = seeded_storage(
            &[student("s-5", 50.0, 50.0, 50.0)],
            &[
                prediction("s-5", RiskLevel::AtRisk, 0.7),
                prediction("ghost", RiskLevel::AtRisk, 0.7),
            ],
        )
        .await;
        let mut store = PredictionStore::load(storage).await;
        assert_eq!(store.predictions().len(), 2);

        let summary = store.fix_all_predictions().await.unwrap();
        assert_eq!(summary.examined, 1);
        assert_eq!(summary.corrected, 0);
        assert_eq!(summary.pruned, 1);
        assert!(store.prediction("ghost").is_none());
    }

    #[tokio::test]
    async fn delete_cascades_to_prediction() {
        let mut store = PredictionStore::load(MemoryStorage::new()).await;
        let record = student("s-6", 75.0, 75.0, 75.0);
        store
            .add_student_with_prediction(record, prediction("s-6", RiskLevel::Satisfactory, 0.8))
            .await
            .unwrap();

        assert!(store.delete_student("s-6").await.unwrap());
        assert!(store.student("s-6").is_none());
        assert!(store.prediction("s-6").is_none());
        assert!(store.corrected_prediction("s-6").is_none());
        assert!(!store.delete_student("s-6").await.unwrap());

        let reloaded = PredictionStore::load(store.into_storage()).await;
        assert!(reloaded.student("s-6").is_none());
        assert!(reloaded.prediction("s-6").is_none());
    }

    #[tokio::test]
    async fn failed_write_leaves_state_unchanged() {
        let mut store = PredictionStore::load(MemoryStorage::new()).await;
        store.add_student(student("s-7", 60.0, 60.0, 60.0)).await.unwrap();

        store.storage.set_failing(true);
        let err = store.add_student(student("s-8", 60.0, 60.0, 60.0)).await;
        assert!(matches!(err, Err(StorageError::Unavailable(_))));
        assert!(store.delete_student("s-7").await.is_err());
        assert_eq!(store.students().len(), 1);
        assert!(store.student("s-7").is_some());
    }

    /// Memory storage whose writes to one key always fail.
    struct FailingKey {
        inner: MemoryStorage,
        key: &'static str,
    }

    impl KeyValueStore for FailingKey {
        async fn get(&self, key: &str) -> Result<Option<String>, StorageError> {
            self.inner.get(key).await
        }

        async fn set(&self, key: &str, value: &str) -> Result<(), StorageError> {
            if key == self.key {
                return Err(StorageError::Unavailable(format!("{key} is read-only")));
            }
            self.inner.set(key, value).await
        }

        async fn delete(&self, key: &str) -> Result<(), StorageError> {
            self.inner.delete(key).await
        }
    }

    async fn store_failing_on(key: &'static str) -> PredictionStore<FailingKey> {
        let inner = seeded_storage(
            &[student("s-13", 55.0, 55.0, 55.0)],
            &[prediction("s-13", RiskLevel::AtRisk, 0.7)],
        )
        .await;
        PredictionStore::load(FailingKey { inner, key }).await
    }

    #[tokio::test]
    async fn delete_keeps_prediction_when_students_write_fails() {
        let mut store = store_failing_on(STUDENTS_KEY).await;

        assert!(store.delete_student("s-13").await.is_err());
        assert!(store.student("s-13").is_some());
        assert!(store.prediction("s-13").is_some());

        let reloaded = PredictionStore::load(store.into_storage()).await;
        assert!(reloaded.student("s-13").is_some());
        assert!(reloaded.prediction("s-13").is_some());
    }

    #[tokio::test]
    async fn delete_restores_students_when_predictions_write_fails() {
        let mut store = store_failing_on(PREDICTIONS_KEY).await;

        assert!(store.delete_student("s-13").await.is_err());
        assert!(store.student("s-13").is_some());
        assert!(store.prediction("s-13").is_some());

        let reloaded = PredictionStore::load(store.into_storage()).await;
        assert!(reloaded.student("s-13").is_some());
        assert!(reloaded.prediction("s-13").is_some());
    }

    #[tokio::test]
    async fn submit_uses_local_fallback_when_offline() {
        let mut store = PredictionStore::load(MemoryStorage::new()).await;
        let (record, stored) = store
            .submit(draft("Kiara Patel", 90.0, 85.0, 95.0), &Predictor::local())
            .await
            .unwrap();

        assert_eq!(record.english_avg, 90.0);
        assert_eq!(stored.student_id, record.id);
        assert_eq!(stored.risk_level, RiskLevel::HighAchiever);
        assert_eq!(stored.prediction_method, PredictionMethod::FallbackAlgorithm);
        assert_eq!(stored.probabilities.high_achiever, 0.70);
    }

    #[tokio::test]
    async fn submit_rejects_invalid_input_without_writing() {
        let mut store = PredictionStore::load(MemoryStorage::new()).await;
        let result = store.submit(draft("", 90.0, 85.0, 95.0), &Predictor::local()).await;

        assert!(matches!(result, Err(SubmitError::Validation(_))));
        assert!(store.students().is_empty());
    }

    #[tokio::test]
    async fn history_is_newest_first() {
        let mut store = PredictionStore::load(MemoryStorage::new()).await;
        let mut older = student("s-9", 70.0, 70.0, 70.0);
        older.created_at -= chrono::Duration::days(2);
        let newer = student("s-10", 70.0, 70.0, 70.0);
        store.add_student(older).await.unwrap();
        store.add_student(newer).await.unwrap();

        let ids: Vec<&str> = store
            .students_by_recency()
            .into_iter()
            .map(|s| s.id.as_str())
            .collect();
        assert_eq!(ids, vec!["s-10", "s-9"]);
    }

    #[tokio::test]
    async fn sqlite_round_trip_reproduces_collections() {
        let storage = SqliteStorage::connect("sqlite::memory:").await.unwrap();
        let mut store = PredictionStore::load(storage).await;
        let record = student("s-11", 64.0, 66.0, 65.0);
        store.add_student(record.clone()).await.unwrap();
        store
            .add_prediction(prediction("s-11", RiskLevel::Satisfactory, 0.8))
            .await
            .unwrap();

        let reloaded = PredictionStore::load(store.into_storage()).await;
        assert_eq!(reloaded.students(), &[record]);
        assert_eq!(
            reloaded.prediction("s-11").unwrap().risk_level,
            RiskLevel::Satisfactory
        );
        for stored in reloaded.predictions().values() {
            let owner = reloaded.student(&stored.student_id).unwrap();
            if stored.risk_level == RiskLevel::AtRisk {
                assert!(owner.recomputed_avg() < 60.0);
            }
        }
    }

    #[tokio::test]
    async fn clear_removes_everything() {
        let mut store = PredictionStore::load(MemoryStorage::new()).await;
        store.add_student(student("s-12", 70.0, 70.0, 70.0)).await.unwrap();
        store.clear().await.unwrap();

        let reloaded = PredictionStore::load(store.into_storage()).await;
        assert!(reloaded.students().is_empty());
    }
}
