use std::path::{Path, PathBuf};

use anyhow::Context;
use clap::Parser;

mod cli;
mod config;
mod encoder;
mod ingest;
mod retrieval;
#[cfg(test)]
mod tests;
mod web;

use cli::{Command, DatabaseArgs, SearchMode};
use config::Config;
use encoder::ClipEncoder;
use retrieval::{EngineOptions, KnowledgeEngine};

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    let args = cli::Args::parse();
    let config = Config::load_with(Path::new(&args.config));

    match args.command {
        Command::Build { data_dir, database } => {
            let data_dir = PathBuf::from(data_dir);
            let content_file = data_dir.join("content.json");
            let image_file = data_dir.join("image.json");
            let image_dir = data_dir.join("images");

            anyhow::ensure!(
                content_file.exists(),
                "content file not found: {}",
                content_file.display()
            );
            anyhow::ensure!(
                image_file.exists(),
                "image metadata file not found: {}",
                image_file.display()
            );

            let encoder = load_encoder(&config, &database)?;
            let mut builder = ingest::DatabaseBuilder::new(&encoder, &config.retrieval.model);

            builder.ingest_text(&content_file)?;
            builder.ingest_images(&image_file, &image_dir)?;
            builder.save(Path::new(&database.database_dir))?;

            println!(
                "database built: {} text passages, {} images",
                builder.text_count(),
                builder.image_count()
            );
            Ok(())
        }

        Command::Search {
            query,
            mode,
            top_k,
            min_score,
            output,
            database,
        } => {
            let engine = load_engine(&config, &database)?;

            let results = match mode {
                SearchMode::Text => {
                    serde_json::to_value(engine.search_text(&query, top_k, min_score)?)?
                }
                SearchMode::Image => {
                    serde_json::to_value(engine.search_images(&query, top_k, min_score)?)?
                }
                SearchMode::Multimodal => {
                    serde_json::to_value(engine.multimodal_search(&query, top_k, None, None)?)?
                }
                SearchMode::Rag => {
                    serde_json::to_value(engine.generate_rag_context(&query, None)?)?
                }
            };

            let rendered = serde_json::to_string_pretty(&results)?;
            match output {
                Some(path) => {
                    std::fs::write(&path, rendered)
                        .with_context(|| format!("failed to write {path}"))?;
                    println!("results saved to {path}");
                }
                None => println!("{rendered}"),
            }
            Ok(())
        }

        Command::SearchImage {
            image,
            top_k,
            min_score,
            database,
        } => {
            let bytes = std::fs::read(&image)
                .with_context(|| format!("failed to read query image {image}"))?;

            let engine = load_engine(&config, &database)?;
            let (similar_images, related_texts) =
                engine.search_by_image(&bytes, top_k, min_score)?;

            let rendered = serde_json::to_string_pretty(&serde_json::json!({
                "query_image": image,
                "similar_images": similar_images,
                "related_texts": related_texts,
            }))?;
            println!("{rendered}");
            Ok(())
        }

        Command::Serve {
            listen,
            image_dir,
            database,
        } => {
            let engine = load_engine(&config, &database)?;

            web::start_daemon(
                engine,
                web::ServeOpts {
                    listen: listen.unwrap_or(config.listen),
                    image_dir: image_dir.map(PathBuf::from),
                },
            );
            Ok(())
        }
    }
}

fn load_encoder(config: &Config, database: &DatabaseArgs) -> anyhow::Result<ClipEncoder> {
    ClipEncoder::new(&config.retrieval.model, PathBuf::from(&database.model_dir))
        .context("failed to initialize encoder")
}

fn load_engine(config: &Config, database: &DatabaseArgs) -> anyhow::Result<KnowledgeEngine> {
    let encoder = load_encoder(config, database)?;
    let options = EngineOptions::from(&config.retrieval);

    KnowledgeEngine::load(
        Path::new(&database.database_dir),
        Box::new(encoder),
        options,
    )
    .context("failed to load the vector database")
}
