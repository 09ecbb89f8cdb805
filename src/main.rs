use std::path::PathBuf;

use anyhow::Context;
use clap::{Args, Parser, Subcommand};
use tracing::debug;

mod client;
mod config;
mod db;
mod error;
mod models;
mod report;
mod risk;
mod store;
mod telemetry;

use client::{PredictionClient, Predictor};
use config::AppConfig;
use db::{KeyValueStore, MemoryStorage, SqliteStorage};
use error::SubmitError;
use models::{Absences, Education, Gender, NewStudent, StudyTime, TestPrep};
use store::PredictionStore;

#[derive(Parser)]
#[command(name = "student-risk")]
#[command(about = "Record student profiles and track risk-level predictions", long_about = None)]
struct Cli {
    /// Skip the remote prediction service and classify locally
    #[arg(long, global = true)]
    offline: bool,
    /// Keep data in memory for this run only
    #[arg(long, global = true)]
    ephemeral: bool,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Create or upgrade the storage schema
    InitDb,
    /// Load demo students
    Seed,
    /// Record a student and predict their risk level
    Add(AddArgs),
    /// Record every student in a CSV file
    Import {
        #[arg(long)]
        csv: PathBuf,
    },
    /// Show one student's prediction
    Show { id: String },
    /// List evaluated students, newest first
    History {
        #[arg(long, default_value_t = 20)]
        limit: usize,
    },
    /// Delete a student and their prediction
    Delete { id: String },
    /// Re-check every stored prediction against the current thresholds
    Repair,
    /// Print aggregate analytics
    Analytics,
    /// Write the analytics report as markdown
    Report {
        #[arg(long, default_value = "report.md")]
        out: PathBuf,
    },
    /// Check connectivity to the prediction service
    Health,
    /// Remove all stored students and predictions
    Reset,
}

#[derive(Args)]
struct AddArgs {
    #[arg(long)]
    name: String,
    #[arg(long)]
    age: i64,
    #[arg(long)]
    gender: Gender,
    #[arg(long)]
    education: Education,
    #[arg(long)]
    study_time: StudyTime,
    #[arg(long)]
    absences: Absences,
    #[arg(long, default_value = "not_prepared")]
    test_prep: TestPrep,
    #[arg(long)]
    writing: f64,
    #[arg(long)]
    reading: f64,
    #[arg(long)]
    speaking: f64,
    #[arg(long)]
    extracurricular: bool,
    #[arg(long)]
    internet_access: bool,
    #[arg(long)]
    tutoring: bool,
}

impl From<AddArgs> for NewStudent {
    fn from(args: AddArgs) -> Self {
        NewStudent {
            name: args.name,
            age: args.age,
            gender: args.gender,
            student_education: args.education,
            study_time_per_week: args.study_time,
            absences: args.absences,
            test_prep: args.test_prep,
            writing_score: args.writing,
            reading_score: args.reading,
            speaking_score: args.speaking,
            extra_curricular: args.extracurricular,
            internet_access: args.internet_access,
            tutoring: args.tutoring,
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let config = AppConfig::load().context("invalid configuration")?;
    telemetry::init(&config.telemetry).context("failed to initialise logging")?;
    debug!(
        environment = ?config.environment,
        platform = ?config.platform,
        api_url = %config.api_url,
        "configuration loaded"
    );

    let predictor = if cli.offline {
        Predictor::local()
    } else {
        Predictor::remote(PredictionClient::new(config.api_url.clone()))
    };

    if cli.ephemeral {
        return run(cli.command, MemoryStorage::new(), &predictor).await;
    }

    let storage = SqliteStorage::connect(&config.database_url)
        .await
        .with_context(|| format!("failed to open storage at {}", config.database_url))?;

    if let Commands::InitDb = cli.command {
        db::init_db(storage.pool()).await?;
        println!("Schema ready.");
        return Ok(());
    }

    run(cli.command, storage, &predictor).await
}

async fn run<S: KeyValueStore>(
    command: Commands,
    storage: S,
    predictor: &Predictor,
) -> anyhow::Result<()> {
    let mut store = PredictionStore::load(storage).await;

    match command {
        Commands::InitDb => {
            println!("Nothing to initialise for in-memory storage.");
        }
        Commands::Seed => {
            let inserted = db::seed(&mut store).await?;
            println!("Inserted {inserted} demo students.");
        }
        Commands::Add(args) => match store.submit(args.into(), predictor).await {
            Ok((student, _)) => {
                if let Some(view) = report::result_view(&store, &student.id) {
                    print!("{view}");
                }
                println!();
                println!("Student id: {}", student.id);
            }
            Err(SubmitError::Validation(err)) => {
                for field in &err.errors {
                    eprintln!("{}: {}", field.field, field.message);
                }
                anyhow::bail!("student was not recorded");
            }
            Err(SubmitError::Storage(err)) => {
                return Err(err).context("student could not be saved");
            }
        },
        Commands::Import { csv } => {
            let summary = db::import_csv(&mut store, predictor, &csv)
                .await
                .with_context(|| format!("failed to import {}", csv.display()))?;
            println!(
                "Inserted {} students from {} ({} rows rejected).",
                summary.inserted,
                csv.display(),
                summary.rejected
            );
        }
        Commands::Show { id } => match report::result_view(&store, &id) {
            Some(view) => print!("{view}"),
            None => println!("No student found with id {id}."),
        },
        Commands::History { limit } => {
            let lines = report::history_lines(&store, limit);
            if lines.is_empty() {
                println!("No students evaluated yet.");
                return Ok(());
            }

            let total = store.students().len();
            println!("{} student{} evaluated", total, if total == 1 { "" } else { "s" });
            for line in lines {
                println!("{line}");
            }
        }
        Commands::Delete { id } => {
            if store.delete_student(&id).await? {
                println!("Deleted {id}.");
            } else {
                println!("No student found with id {id}.");
            }
        }
        Commands::Repair => {
            let summary = store.fix_all_predictions().await?;
            println!(
                "Checked {} predictions: {} corrected, {} orphaned removed.",
                summary.examined, summary.corrected, summary.pruned
            );
        }
        Commands::Analytics => {
            let status = match predictor.client() {
                Some(client) => Some(client.health().await),
                None => None,
            };
            print!("{}", report::build_report(&store, status.as_ref()));
        }
        Commands::Report { out } => {
            let status = match predictor.client() {
                Some(client) => Some(client.health().await),
                None => None,
            };
            let report = report::build_report(&store, status.as_ref());
            std::fs::write(&out, report)?;
            println!("Report written to {}.", out.display());
        }
        Commands::Health => match predictor.client() {
            Some(client) => {
                println!("Checking {} ...", client.base_url());
                let status = client.health().await;
                println!("{}", serde_json::to_string_pretty(&status)?);
            }
            None => println!("Offline mode: predictions use the local fallback."),
        },
        Commands::Reset => {
            store.clear().await?;
            println!("All students and predictions removed.");
        }
    }

    Ok(())
}
