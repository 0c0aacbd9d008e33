//! `sf` binary entry point

use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use eyre::{Context, Result, eyre};
use tracing::info;
use tracing_subscriber::EnvFilter;

use shelf::cli::{Cli, Command};
use shelf::job::{BookJob, BookJobConfig, DirImageSource};
use shelf::pipeline::TocPipeline;
use shelf::providers::ProviderRegistry;
use shelf::scheduler::{JobHandler, Scheduler};
use shelf::sink::{WriteOp, WriteSink};
use shelf::{CancelToken, Config, TracingMetrics};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cli = Cli::parse();
    let config = Config::load(cli.config.as_ref())?;

    match cli.command {
        Command::Providers => providers(&config),
        Command::Health => health(&config).await,
        Command::Run {
            title,
            pages,
            scans_dir,
            ocr,
            llm,
        } => run(&config, title, pages, scans_dir, ocr, llm).await,
    }
}

fn providers(config: &Config) -> Result<()> {
    let registry = ProviderRegistry::from_config(&config.providers)?;
    for name in registry.list_llm() {
        println!("llm  {name}");
    }
    for name in registry.list_ocr() {
        println!("ocr  {name}");
    }
    for name in registry.list_tts() {
        println!("tts  {name}");
    }
    Ok(())
}

async fn health(config: &Config) -> Result<()> {
    let store = docstore::GraphQlClient::new(&config.store.base_url, Duration::from_millis(config.store.timeout_ms))?;
    match store.health_check().await {
        Ok(()) => println!("store  ok  {}", config.store.base_url),
        Err(e) => println!("store  FAIL  {e}"),
    }

    let registry = ProviderRegistry::from_config(&config.providers)?;
    for name in registry.list_llm() {
        let provider = registry.get_llm(&name)?;
        match provider.health_check().await {
            Ok(()) => println!("llm  ok  {name}"),
            Err(e) => println!("llm  FAIL  {name}: {e}"),
        }
    }
    for name in registry.list_ocr() {
        let provider = registry.get_ocr(&name)?;
        match provider.health_check().await {
            Ok(()) => println!("ocr  ok  {name}"),
            Err(e) => println!("ocr  FAIL  {name}: {e}"),
        }
    }
    for name in registry.list_tts() {
        let provider = registry.get_tts(&name)?;
        match provider.health_check().await {
            Ok(()) => println!("tts  ok  {name}"),
            Err(e) => println!("tts  FAIL  {name}: {e}"),
        }
    }
    Ok(())
}

async fn run(
    config: &Config,
    title: String,
    pages: u64,
    scans_dir: Option<std::path::PathBuf>,
    ocr: Option<String>,
    llm: Option<String>,
) -> Result<()> {
    let store = Arc::new(docstore::GraphQlClient::new(
        &config.store.base_url,
        Duration::from_millis(config.store.timeout_ms),
    )?);
    store
        .health_check()
        .await
        .context("document store is not reachable; is it running?")?;

    let registry = Arc::new(ProviderRegistry::from_config(&config.providers)?);
    let sink = Arc::new(WriteSink::start(store.clone(), config.sink.clone()));
    let scheduler = Scheduler::new(registry, Arc::new(TracingMetrics), config.scheduler.clone());
    let cancel = CancelToken::new();

    // Create the book row; its docID anchors phase markers and completion
    let book = docstore::Book {
        doc_id: None,
        title: title.clone(),
        total_pages: pages,
        phase: None,
        complete: Some(false),
        created_at: Some(chrono::Utc::now()),
    };
    let op = WriteOp::create_for(&book)?;
    let created = sink
        .send_sync(op, &cancel)
        .await
        .map_err(|e| eyre!("creating book row: {e}"))?;
    let book_doc_id = created
        .doc_id
        .ok_or_else(|| eyre!("store returned no docID for the book row: {:?}", created.error))?;

    info!(title = %title, book_doc_id = %book_doc_id, pages, "Book registered");

    let mut job_config = BookJobConfig::new(book_doc_id.clone(), book_doc_id.clone(), pages);
    job_config.ocr_provider = ocr.unwrap_or_else(|| config.pipeline.ocr_provider.clone());
    job_config.llm_provider = llm.unwrap_or_else(|| config.pipeline.llm_provider.clone());
    job_config.max_unit_retries = config.pipeline.max_unit_retries;

    let images = Arc::new(DirImageSource::new(
        scans_dir.unwrap_or_else(|| config.pipeline.scans_dir.clone()),
    ));
    let job = Arc::new(BookJob::new(
        job_config,
        Arc::new(TocPipeline),
        images,
        sink.clone(),
        store,
    ));
    let job_id = scheduler.run_job(job.clone()).await?;

    scheduler.wait_for_job(&job_id).await;
    println!("{}", serde_json::to_string_pretty(&job.status())?);

    scheduler.stop().await;
    sink.stop().await;
    Ok(())
}
