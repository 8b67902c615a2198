use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use embedrec::{
    Interaction, ItemRecord, ItemSchema, ModelStore, OfflineEvaluator, Pipeline, PipelineConfig,
    RecommendationEngine, Recommender, UserHistory,
};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::{Path, PathBuf};
use tracing_subscriber::{fmt, EnvFilter};

#[derive(Parser, Debug)]
#[command(
    name = "embedrec",
    version,
    about = "Build, query and evaluate item-embedding recommendation indexes"
)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Fit the pipeline on an item corpus and persist the model and index.
    Build {
        /// Item records, one JSON object per line.
        #[arg(long, env = "EMBEDREC_ITEMS")]
        items: PathBuf,
        /// Item schema (JSON) declaring text and numeric fields.
        #[arg(long, env = "EMBEDREC_SCHEMA")]
        schema: PathBuf,
        #[arg(long, env = "EMBEDREC_STORE", default_value = "./embedrec.redb")]
        store: PathBuf,
    },
    /// Items most similar to a given item.
    Similar {
        #[arg(long, env = "EMBEDREC_STORE", default_value = "./embedrec.redb")]
        store: PathBuf,
        #[arg(long)]
        item: String,
        /// Result count (defaults to EMBEDREC_TOP_K).
        #[arg(short, long)]
        k: Option<usize>,
    },
    /// Recommendations for a user from their most recent interactions.
    Recommend {
        #[arg(long, env = "EMBEDREC_STORE", default_value = "./embedrec.redb")]
        store: PathBuf,
        /// Interaction log, one JSON object per line.
        #[arg(long, env = "EMBEDREC_EVENTS")]
        events: PathBuf,
        #[arg(long)]
        user: String,
        #[arg(short, long)]
        k: Option<usize>,
    },
    /// Offline Precision@K / Recall@K on a temporal split of the log.
    Evaluate {
        #[arg(long, env = "EMBEDREC_STORE", default_value = "./embedrec.redb")]
        store: PathBuf,
        #[arg(long, env = "EMBEDREC_EVENTS")]
        events: PathBuf,
        /// Cutoff K (defaults to EMBEDREC_EVAL_K).
        #[arg(short, long)]
        k: Option<usize>,
        /// Training fraction (defaults to EMBEDREC_TRAIN_SPLIT_RATIO).
        #[arg(long)]
        split_ratio: Option<f64>,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let config = PipelineConfig::from_env().context("invalid EMBEDREC_* configuration")?;

    match cli.command {
        Command::Build {
            items,
            schema,
            store,
        } => build(&config, &items, &schema, &store),
        Command::Similar { store, item, k } => {
            let recommender = open_recommender(&config, &store)?;
            let similar = recommender
                .similar_items(&item, k.unwrap_or(config.top_k))
                .with_context(|| format!("similar items for {item:?}"))?;
            print_json(&similar)
        }
        Command::Recommend {
            store,
            events,
            user,
            k,
        } => {
            let recommender = open_recommender(&config, &store)?;
            let log: Vec<Interaction> = read_jsonl(&events)?;
            let history = UserHistory::from_interactions(&user, &log);
            let recs = recommender
                .recommend_for_history(&history, k.unwrap_or(config.top_k))
                .with_context(|| format!("recommendations for user {user:?}"))?;
            print_json(&recs)
        }
        Command::Evaluate {
            store,
            events,
            k,
            split_ratio,
        } => {
            let index = open_store(&store)?.load_index()?;
            let engine = RecommendationEngine::new(index);
            let log: Vec<Interaction> = read_jsonl(&events)?;
            let report = OfflineEvaluator::new(&engine).run(
                &log,
                split_ratio.unwrap_or(config.split_ratio),
                k.unwrap_or(config.eval_k),
            )?;
            print_json(&report)
        }
    }
}

fn build(config: &PipelineConfig, items: &Path, schema: &Path, store: &Path) -> Result<()> {
    let schema: ItemSchema = {
        let file = File::open(schema).with_context(|| format!("failed to open {schema:?}"))?;
        serde_json::from_reader(BufReader::new(file))
            .with_context(|| format!("invalid schema in {schema:?}"))?
    };
    let corpus: Vec<ItemRecord> = read_jsonl(items)?;

    let mut pipeline = Pipeline::new(config.clone(), schema);
    let model = pipeline.fit(&corpus)?.clone();
    let index = pipeline.build_index(&corpus)?;

    let store = open_store(store)?;
    store.save_model(&model)?;
    store.save_index(&index)?;

    print_json(&serde_json::json!({
        "items": index.len(),
        "features": model.encoder.width(),
        "dim": index.dim(),
    }))
}

fn open_store(path: &Path) -> Result<ModelStore> {
    ModelStore::open(path).with_context(|| format!("failed to open store {path:?}"))
}

fn open_recommender(config: &PipelineConfig, path: &Path) -> Result<Recommender> {
    let index = open_store(path)?.load_index()?;
    let recommender = Recommender::new().with_history_limit(config.history_limit);
    recommender.install(index)?;
    Ok(recommender)
}

fn read_jsonl<T: DeserializeOwned>(path: &Path) -> Result<Vec<T>> {
    let file = File::open(path).with_context(|| format!("failed to open {path:?}"))?;
    let mut rows = Vec::new();
    for (idx, line) in BufReader::new(file).lines().enumerate() {
        let line = line.with_context(|| format!("failed to read {path:?} line {}", idx + 1))?;
        if line.trim().is_empty() {
            continue;
        }
        let row = serde_json::from_str(&line)
            .with_context(|| format!("invalid record in {path:?} at line {}", idx + 1))?;
        rows.push(row);
    }
    tracing::debug!(path = %path.display(), rows = rows.len(), "read json lines");
    Ok(rows)
}

fn print_json<T: Serialize + ?Sized>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string(value)?);
    Ok(())
}
