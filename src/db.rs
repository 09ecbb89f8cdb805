use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

use chrono::Utc;
use sqlx::sqlite::{SqlitePool, SqlitePoolOptions};
use sqlx::Row;
use tracing::warn;

use crate::client::Predictor;
use crate::error::{StorageError, SubmitError};
use crate::models::{Absences, Education, Gender, NewStudent, StudentRecord, StudyTime, TestPrep};
use crate::risk;
use crate::store::PredictionStore;

pub const STUDENTS_KEY: &str = "@students";
pub const PREDICTIONS_KEY: &str = "@predictions";

/// String key-value persistence behind the prediction store.
#[allow(async_fn_in_trait)]
pub trait KeyValueStore {
    async fn get(&self, key: &str) -> Result<Option<String>, StorageError>;
    async fn set(&self, key: &str, value: &str) -> Result<(), StorageError>;
    async fn delete(&self, key: &str) -> Result<(), StorageError>;
}

pub async fn init_db(pool: &SqlitePool) -> Result<(), StorageError> {
    sqlx::migrate!("./migrations").run(pool).await?;
    Ok(())
}

pub struct SqliteStorage {
    pool: SqlitePool,
}

impl SqliteStorage {
    pub async fn connect(database_url: &str) -> Result<Self, StorageError> {
        // One connection: `sqlite::memory:` databases are per-connection.
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect(database_url)
            .await?;
        init_db(&pool).await?;
        Ok(Self { pool })
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }
}

impl KeyValueStore for SqliteStorage {
    async fn get(&self, key: &str) -> Result<Option<String>, StorageError> {
        let row = sqlx::query("SELECT value FROM kv_store WHERE key = ?")
            .bind(key)
            .fetch_optional(&self.pool)
            .await?;

        Ok(row.map(|row| row.get::<String, _>("value")))
    }

    async fn set(&self, key: &str, value: &str) -> Result<(), StorageError> {
        sqlx::query(
            r#"
            INSERT INTO kv_store (key, value, updated_at)
            VALUES (?, ?, ?)
            ON CONFLICT (key) DO UPDATE
            SET value = EXCLUDED.value, updated_at = EXCLUDED.updated_at
            "#,
        )
        .bind(key)
        .bind(value)
        .bind(Utc::now())
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<(), StorageError> {
        sqlx::query("DELETE FROM kv_store WHERE key = ?")
            .bind(key)
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}

/// Process-local storage for `--ephemeral` runs and tests. Writes can be made
/// to fail on demand.
#[derive(Default)]
pub struct MemoryStorage {
    entries: Mutex<HashMap<String, String>>,
    failing: AtomicBool,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    #[cfg(test)]
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    fn check_available(&self) -> Result<(), StorageError> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(StorageError::Unavailable("memory storage is offline".to_string()));
        }
        Ok(())
    }

    fn entries(&self) -> Result<std::sync::MutexGuard<'_, HashMap<String, String>>, StorageError> {
        self.entries
            .lock()
            .map_err(|_| StorageError::Unavailable("memory storage lock poisoned".to_string()))
    }
}

impl KeyValueStore for MemoryStorage {
    async fn get(&self, key: &str) -> Result<Option<String>, StorageError> {
        self.check_available()?;
        Ok(self.entries()?.get(key).cloned())
    }

    async fn set(&self, key: &str, value: &str) -> Result<(), StorageError> {
        self.check_available()?;
        self.entries()?.insert(key.to_string(), value.to_string());
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<(), StorageError> {
        self.check_available()?;
        self.entries()?.remove(key);
        Ok(())
    }
}

/// Inserts three demo students with local predictions. Students whose name is
/// already present are skipped.
pub async fn seed<S: KeyValueStore>(store: &mut PredictionStore<S>) -> Result<usize, StorageError> {
    let students = vec![
        NewStudent {
            name: "Avery Lee".to_string(),
            age: 17,
            gender: Gender::Female,
            student_education: Education::Secondary,
            study_time_per_week: StudyTime::FiveToTen,
            absences: Absences::None,
            test_prep: TestPrep::Prepared,
            writing_score: 88.0,
            reading_score: 91.0,
            speaking_score: 84.0,
            extra_curricular: true,
            internet_access: true,
            tutoring: false,
        },
        NewStudent {
            name: "Jules Moreno".to_string(),
            age: 21,
            gender: Gender::Male,
            student_education: Education::Bachelors,
            study_time_per_week: StudyTime::TwoToFive,
            absences: Absences::OneToFive,
            test_prep: TestPrep::NotPrepared,
            writing_score: 68.0,
            reading_score: 72.0,
            speaking_score: 65.0,
            extra_curricular: false,
            internet_access: true,
            tutoring: true,
        },
        NewStudent {
            name: "Kiara Patel".to_string(),
            age: 19,
            gender: Gender::Female,
            student_education: Education::Secondary,
            study_time_per_week: StudyTime::LessThan2,
            absences: Absences::MoreThan10,
            test_prep: TestPrep::NotPrepared,
            writing_score: 48.0,
            reading_score: 55.0,
            speaking_score: 52.0,
            extra_curricular: false,
            internet_access: false,
            tutoring: false,
        },
    ];

    let mut inserted = 0usize;
    for draft in students {
        let exists = store
            .students()
            .iter()
            .any(|student| student.name.eq_ignore_ascii_case(draft.name.trim()));
        if exists {
            continue;
        }

        let now = Utc::now();
        let student = match StudentRecord::from_draft(draft, now) {
            Ok(student) => student,
            Err(err) => {
                warn!(error = %err, "skipping invalid seed student");
                continue;
            }
        };
        let prediction = risk::fallback_prediction(&student, now);
        store.add_student_with_prediction(student, prediction).await?;
        inserted += 1;
    }

    Ok(inserted)
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ImportSummary {
    pub inserted: usize,
    pub rejected: usize,
}

/// Submits every row of a CSV file (camelCase headers matching the student
/// form). Rows that cannot be decoded or fail validation are skipped and
/// counted; a storage failure stops the import.
pub async fn import_csv<S: KeyValueStore>(
    store: &mut PredictionStore<S>,
    predictor: &Predictor,
    csv_path: &std::path::Path,
) -> anyhow::Result<ImportSummary> {
    let mut reader = csv::Reader::from_path(csv_path)?;
    let mut summary = ImportSummary::default();

    for (index, result) in reader.deserialize::<NewStudent>().enumerate() {
        let draft = match result {
            Ok(draft) => draft,
            Err(err) => {
                warn!(row = index + 1, error = %err, "skipping unreadable row");
                summary.rejected += 1;
                continue;
            }
        };
        match store.submit(draft, predictor).await {
            Ok(_) => summary.inserted += 1,
            Err(SubmitError::Validation(err)) => {
                warn!(row = index + 1, error = %err, "skipping invalid row");
                summary.rejected += 1;
            }
            Err(SubmitError::Storage(err)) => return Err(err.into()),
        }
    }

    Ok(summary)
}
