//! kbqa CLI - query a directory of text files through the hybrid retrieval engine.

mod corpus;

use std::path::{Path, PathBuf};
use std::sync::Arc;

use clap::{Parser, Subcommand};
use tracing::{debug, info};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

use kbqa_core::{DocumentChangeListener, DocumentId, EngineConfig, EngineError, FailureClass};
use kbqa_embed::HashEmbedder;
use kbqa_query::{
    AnswerResponse, OrchestratorBuilder, QueryRequest, QueryResponse, RetrievalOrchestrator,
};
use kbqa_store::{InMemoryDocumentStore, InMemoryVectorStore, SqliteCacheBackend};

use crate::corpus::{load_corpus, ExtractiveGenerator};

/// kbqa - hybrid keyword + vector retrieval with a version-validated cache
#[derive(Parser)]
#[command(name = "kbqa")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Configuration file (default: ~/.config/kbqa/config.toml or ./kbqa.toml)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Directory of .txt / .md documents (default: current directory)
    #[arg(long, global = true)]
    corpus: Option<PathBuf>,

    /// SQLite file persisting the result cache between runs
    #[arg(long, global = true)]
    cache_db: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Retrieve ranked passages
    Query {
        /// Query text
        query: String,

        #[command(flatten)]
        options: QueryOptions,
    },

    /// Retrieve, then answer from the top passages
    Answer {
        /// Question text
        query: String,

        #[command(flatten)]
        options: QueryOptions,
    },

    /// Show index and cache statistics
    Stats,

    /// Drop cached results that depend on a document
    Invalidate {
        /// Document id (path relative to the corpus directory)
        document_id: String,
    },
}

#[derive(clap::Args)]
struct QueryOptions {
    /// Maximum number of passages
    #[arg(short = 'k', long)]
    top_k: Option<usize>,

    /// Restrict retrieval to these documents (repeatable)
    #[arg(short, long = "doc")]
    documents: Vec<String>,

    /// Skip the cache
    #[arg(long)]
    no_cache: bool,

    /// Print the full response as JSON
    #[arg(long)]
    json: bool,
}

impl QueryOptions {
    fn request(&self, query: String) -> QueryRequest {
        let mut request = QueryRequest::new(query);
        if let Some(top_k) = self.top_k {
            request = request.with_top_k(top_k);
        }
        if !self.documents.is_empty() {
            request = request.with_documents(self.documents.iter().map(String::as_str));
        }
        if self.no_cache {
            request = request.without_cache();
        }
        request
    }
}

fn setup_logging(verbose: bool) {
    let default = if verbose { "debug" } else { "warn" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    let subscriber = FmtSubscriber::builder()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .finish();
    tracing::subscriber::set_global_default(subscriber).ok();
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    setup_logging(cli.verbose);

    let mut config = match &cli.config {
        Some(path) => EngineConfig::load(path)?,
        None => EngineConfig::load_default()?,
    };
    if let Some(path) = cli.cache_db {
        config.cache.path = Some(path);
    }
    let corpus = match cli.corpus {
        Some(path) => path,
        None => std::env::current_dir()?,
    };

    let (store, engine) = match open_engine(config, &corpus).await {
        Ok(opened) => opened,
        Err(err) => fail(&err),
    };

    let outcome = match cli.command {
        Commands::Query { query, options } => {
            let request = options.request(query);
            engine
                .query(request)
                .await
                .map(|response| print_query(&response, options.json))
        }
        Commands::Answer { query, options } => {
            let request = options.request(query);
            engine
                .answer(request)
                .await
                .map(|response| print_answer(&response, options.json))
        }
        Commands::Stats => stats(&engine, &store),
        Commands::Invalidate { document_id } => engine
            .invalidate(&DocumentId::from(document_id.as_str()))
            .await
            .map(|removed| println!("Invalidated {} cached results for {}", removed, document_id)),
    };

    if let Err(err) = outcome {
        fail(&err);
    }

    // Flush expired entries before exiting so the cache file stays small
    if let Err(err) = engine.run_maintenance().await {
        debug!("Final maintenance pass failed: {}", err);
    }

    Ok(())
}

async fn open_engine(
    config: EngineConfig,
    corpus: &Path,
) -> Result<(Arc<InMemoryDocumentStore>, Arc<RetrievalOrchestrator>), EngineError> {
    let store = Arc::new(InMemoryDocumentStore::new());
    let documents = load_corpus(&store, corpus).await?;
    info!("Loaded {} documents from {}", documents, corpus.display());

    let cache_path = config.cache.path.clone();
    let mut builder = OrchestratorBuilder::new(config)
        .documents(store.clone())
        .embedder(Arc::new(HashEmbedder::default()))
        .vector_backend(Arc::new(InMemoryVectorStore::default()))
        .generator(Arc::new(ExtractiveGenerator::default()));
    if let Some(path) = cache_path {
        builder = builder.cache_backend(Arc::new(SqliteCacheBackend::open(path)?));
    }

    let engine = Arc::new(builder.build()?);
    let listener: Arc<dyn DocumentChangeListener> = engine.clone();
    store.subscribe(Arc::downgrade(&listener))?;

    engine.rebuild_indexes().await?;
    engine.warm_cache().await?;

    Ok((store, engine))
}

fn print_query(response: &QueryResponse, json: bool) {
    if json {
        match serde_json::to_string_pretty(response) {
            Ok(text) => println!("{}", text),
            Err(e) => eprintln!("Error: {}", e),
        }
        return;
    }

    if response.answer_set.is_empty() {
        println!("No matching content.");
    }
    for (i, passage) in response.answer_set.passages.iter().enumerate() {
        println!(
            "{}. [{}#{}] score {:.4}",
            i + 1,
            passage.chunk.document_id,
            passage.chunk.ordinal,
            passage.result.final_score()
        );
        println!("   {}", passage.chunk.text);
    }
    println!(
        "\n{:?} in {}ms (cache {:?}{})",
        response.status,
        response.latency_ms,
        response.cache,
        degraded_suffix(&response.degraded)
    );
}

fn print_answer(response: &AnswerResponse, json: bool) {
    if json {
        match serde_json::to_string_pretty(response) {
            Ok(text) => println!("{}", text),
            Err(e) => eprintln!("Error: {}", e),
        }
        return;
    }

    match &response.answer {
        Some(answer) => {
            println!("{}", answer.text);
            println!("\nSources:");
            for id in &answer.citations {
                if let Some(passage) = answer.retrieval.passages.iter().find(|p| &p.chunk.id == id) {
                    println!("  {}#{}", passage.chunk.document_id, passage.chunk.ordinal);
                }
            }
        }
        None => println!("No matching content."),
    }
    println!(
        "\n{:?} in {}ms (cache {:?}{})",
        response.status,
        response.latency_ms,
        response.cache,
        degraded_suffix(&response.degraded)
    );
}

fn degraded_suffix(reasons: &[kbqa_query::DegradedReason]) -> String {
    if reasons.is_empty() {
        String::new()
    } else {
        format!(", degraded: {:?}", reasons)
    }
}

fn stats(engine: &RetrievalOrchestrator, store: &InMemoryDocumentStore) -> Result<(), EngineError> {
    let index = engine.keyword_index().stats()?;
    let cache = engine.cache_stats()?;

    println!("Documents:       {}", store.len()?);
    println!("Chunks:          {}", index.chunks);
    println!("Distinct terms:  {}", index.terms);
    println!("Avg chunk terms: {:.1}", index.average_length);
    println!();
    println!("Cache entries:   {} / {}", cache.size, cache.capacity);
    println!("Hits / misses:   {} / {}", cache.hit_count, cache.miss_count);
    println!("Hit rate:        {:.1}%", cache.hit_rate * 100.0);
    println!("Evictions:       {}", cache.eviction_count);
    Ok(())
}

/// Print the error and exit with a code per failure class.
fn fail(err: &EngineError) -> ! {
    eprintln!("Error: {}", err);
    let code = match err.class() {
        FailureClass::BadRequest => 2,
        FailureClass::TemporarilyDegraded => 3,
        FailureClass::Internal => 1,
    };
    std::process::exit(code);
}
